//! Container Device Interface (CDI) spec document and storage.
//!
//! The pool publishes one CDI spec describing every device it currently
//! holds; container runtimes resolve the qualified device names injected
//! via pod annotations against this document.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

/// CDI spec format version written by this plugin.
pub const CDI_VERSION: &str = "0.6.0";

/// Annotation key prefix understood by CDI-aware runtimes.
pub const ANNOTATION_PREFIX: &str = "cdi.k8s.io/";

/// Length of the content digest embedded in a spec file name.
const SPEC_NAME_DIGEST_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to serialize CDI spec: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write CDI spec {name}: {source}")]
    Write { name: String, source: io::Error },
    #[error("failed to remove CDI spec {name}: {source}")]
    Remove { name: String, source: io::Error },
}

/// A CDI spec document covering one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub cdi_version: String,
    /// Qualified kind, `<vendor>/<class>`.
    pub kind: String,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    pub device_nodes: Vec<DeviceNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    pub host_path: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub permissions: String,
}

/// Annotation key for a resource kind, e.g. `cdi.k8s.io/vduse.io_vduse`.
pub fn annotation_key(prefix: &str, kind: &str) -> String {
    format!("{ANNOTATION_PREFIX}{prefix}_{kind}")
}

/// Annotation value listing qualified device names.
pub fn annotation_value(devices: &[String]) -> String {
    devices.join(",")
}

/// Fully qualified CDI device name, `<vendor>/<class>=<name>`.
pub fn qualified_name(vendor: &str, class: &str, name: &str) -> String {
    format!("{vendor}/{class}={name}")
}

/// Deterministic file name for a spec: the qualified kind, a digest of the
/// document content and the pool name. Identical content yields an
/// identical name; any content change yields a new one.
pub fn spec_file_name(spec: &Spec, pool_name: &str) -> Result<String, SpecError> {
    let content = serde_json::to_vec(spec)?;
    let digest = Sha256::digest(&content);
    let mut hex = String::with_capacity(SPEC_NAME_DIGEST_LEN);
    for byte in digest.iter().take(SPEC_NAME_DIGEST_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(format!(
        "{}-{}-{}.json",
        spec.kind.replace('/', "-"),
        hex,
        pool_name
    ))
}

/// Storage backend for published CDI specs.
///
/// Injected into the pool so tests can observe publishes without touching
/// the filesystem.
pub trait SpecStore: Send + Sync {
    fn write_spec(&self, spec: &Spec, name: &str) -> Result<(), SpecError>;
    fn remove_spec(&self, name: &str) -> Result<(), SpecError>;
}

/// Spec store writing JSON documents into a directory, `/var/run/cdi` in
/// a default deployment.
pub struct FsSpecStore {
    dir: PathBuf,
}

impl FsSpecStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SpecStore for FsSpecStore {
    fn write_spec(&self, spec: &Spec, name: &str) -> Result<(), SpecError> {
        let doc = serde_json::to_vec_pretty(spec)?;
        fs::create_dir_all(&self.dir).map_err(|source| SpecError::Write {
            name: name.to_string(),
            source,
        })?;
        let path = self.dir.join(name);
        fs::write(&path, doc).map_err(|source| SpecError::Write {
            name: name.to_string(),
            source,
        })?;
        info!(path = %path.display(), "written CDI spec");
        Ok(())
    }

    fn remove_spec(&self, name: &str) -> Result<(), SpecError> {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            // Already gone, nothing to retract.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SpecError::Remove {
                name: name.to_string(),
                source,
            }),
        }
    }
}
