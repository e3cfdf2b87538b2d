// *** DO NOT MODIFY ***
// This file and the included *.pb.rs files are auto-generated from the
// sources in proto/ with tonic-build. Regenerate and copy the output here
// instead of editing by hand.

/// Kubelet device plugin API (`v1beta1`).
pub mod api {
    include!("v1beta1.pb.rs");
}

/// Kubelet plugin watcher registration API (`pluginregistration.v1`).
pub mod pluginregistration {
    include!("pluginregistration.pb.rs");
}
