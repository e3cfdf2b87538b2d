//! End-to-end tests driving the plugin's gRPC surface over a real unix
//! socket with the generated kubelet clients.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use device_plugin_pb::api;
use device_plugin_pb::api::device_plugin_client::DevicePluginClient;
use device_plugin_pb::pluginregistration as registration;
use device_plugin_pb::pluginregistration::registration_client::RegistrationClient;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Request};
use tower::service_fn;

use vduse_plugin::deviceinfo::DeviceInfoStore;
use vduse_plugin::mock::{MemSpecStore, MockProvisioner};
use vduse_plugin::plugin::VdusePlugin;
use vduse_plugin::pool::Pool;

struct Harness {
    plugin: Arc<VdusePlugin>,
    pool: Arc<Pool>,
    channel: Channel,
    dir: tempfile::TempDir,
}

async fn uds_channel(socket_path: PathBuf) -> Channel {
    // The URL is a placeholder, the unix socket connector does the work.
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
        .expect("should connect to plugin socket")
}

async fn start_plugin(num_devices: usize, cdi: bool) -> Harness {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let pool = Arc::new(Pool::new(
        "default",
        "vduse.io",
        "vduse",
        num_devices,
        Arc::new(MockProvisioner::new()),
        Arc::new(MemSpecStore::new()),
        DeviceInfoStore::new(dir.path().join("devinfo")),
    ));
    pool.start().await;

    let plugin = VdusePlugin::new(pool.clone(), cdi, dir.path(), Duration::from_millis(100));
    plugin.start().await.expect("should start plugin server");

    let channel = uds_channel(plugin.socket_path().to_path_buf()).await;
    Harness {
        plugin,
        pool,
        channel,
        dir,
    }
}

fn allocate_request(ids: &[&str]) -> api::AllocateRequest {
    api::AllocateRequest {
        container_requests: vec![api::ContainerAllocateRequest {
            devices_ids: ids.iter().map(|s| s.to_string()).collect(),
        }],
    }
}

#[tokio::test]
async fn registration_handshake_reports_identity() {
    let harness = start_plugin(2, false).await;
    let mut client = RegistrationClient::new(harness.channel.clone());

    let info = client
        .get_info(Request::new(registration::InfoRequest {}))
        .await
        .expect("GetInfo should succeed")
        .into_inner();

    assert_eq!(info.r#type, "DevicePlugin");
    assert_eq!(info.name, "vduse.io/vduse");
    assert_eq!(info.supported_versions, vec!["v1alpha1", "v1beta1"]);
    assert_eq!(
        info.endpoint,
        harness.plugin.socket_path().display().to_string()
    );

    client
        .notify_registration_status(Request::new(registration::RegistrationStatus {
            plugin_registered: true,
            error: String::new(),
        }))
        .await
        .expect("status notification should succeed");
    assert!(!harness.plugin.registration_failed());
}

#[tokio::test]
async fn options_are_static() {
    let harness = start_plugin(1, false).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let options = client
        .get_device_plugin_options(Request::new(api::Empty {}))
        .await
        .expect("GetDevicePluginOptions should succeed")
        .into_inner();

    assert!(!options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);
}

#[tokio::test]
async fn watch_streams_initial_snapshot() {
    let harness = start_plugin(3, false).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let mut stream = client
        .list_and_watch(Request::new(api::Empty {}))
        .await
        .expect("ListAndWatch should open")
        .into_inner();

    let initial = stream
        .message()
        .await
        .expect("initial snapshot should arrive")
        .expect("stream should not be closed");
    let ids: Vec<&str> = initial.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["vduse0", "vduse1", "vduse2"]);
    assert!(initial.devices.iter().all(|d| d.health == "Healthy"));
}

#[tokio::test]
async fn watch_observes_inventory_changes() {
    let harness = start_plugin(2, false).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let mut stream = client
        .list_and_watch(Request::new(api::Empty {}))
        .await
        .expect("ListAndWatch should open")
        .into_inner();
    let initial = stream
        .message()
        .await
        .expect("initial snapshot should arrive")
        .expect("stream should not be closed");
    assert_eq!(initial.devices.len(), 2);

    // drain the inventory; the monitor should push an empty snapshot
    harness.pool.stop().await;
    let empty = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = stream
                .message()
                .await
                .expect("stream should stay open")
                .expect("snapshot should arrive");
            if snapshot.devices.is_empty() {
                return snapshot;
            }
        }
    })
    .await
    .expect("monitor should push the drained inventory");
    assert!(empty.devices.is_empty());
}

#[tokio::test]
async fn watch_terminates_after_stop() {
    let harness = start_plugin(1, false).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let mut stream = client
        .list_and_watch(Request::new(api::Empty {}))
        .await
        .expect("ListAndWatch should open")
        .into_inner();
    stream
        .message()
        .await
        .expect("initial snapshot should arrive")
        .expect("stream should not be closed");

    harness.plugin.stop();

    // no further snapshots: the stream ends cleanly or with a transport
    // error once the server is gone
    let end = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("stream should terminate");
    assert!(matches!(end, Ok(None) | Err(_)));
}

#[tokio::test]
async fn allocate_grants_devices_and_envs() {
    let harness = start_plugin(2, false).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let response = client
        .allocate(Request::new(allocate_request(&["vduse0", "vduse1"])))
        .await
        .expect("Allocate should succeed")
        .into_inner();

    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    assert_eq!(container.devices.len(), 2);
    assert_eq!(container.devices[0].permissions, "rw");
    assert!(container.mounts.is_empty());
    assert_eq!(
        container
            .envs
            .get("VDUSEDEVICE_VDUSE_IO_DEFAULT")
            .map(String::as_str),
        Some("vduse0,vduse1")
    );

    // the side-channel descriptor was recorded for both devices
    for id in ["vduse0", "vduse1"] {
        let path = harness
            .dir
            .path()
            .join("devinfo")
            .join(format!("vduse.io-default-{id}-device.json"));
        assert!(path.exists(), "device-info for {id} should exist");
    }
}

#[tokio::test]
async fn allocate_in_cdi_mode_grants_annotations() {
    let harness = start_plugin(1, true).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let response = client
        .allocate(Request::new(allocate_request(&["vduse0"])))
        .await
        .expect("Allocate should succeed")
        .into_inner();

    let container = &response.container_responses[0];
    assert!(container.devices.is_empty());
    assert_eq!(
        container
            .annotations
            .get("cdi.k8s.io/vduse.io_vduse")
            .map(String::as_str),
        Some("vduse.io/vduse=vduse0")
    );
}

#[tokio::test]
async fn allocate_unknown_device_fails_whole_call() {
    let harness = start_plugin(1, false).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let status = client
        .allocate(Request::new(allocate_request(&["vduse0", "vduse9"])))
        .await
        .expect_err("unknown device should fail the call");
    assert_eq!(status.code(), Code::NotFound);
    assert!(status.message().contains("vduse9"));
}

#[tokio::test]
async fn noop_surface_returns_empty_results() {
    let harness = start_plugin(1, false).await;
    let mut client = DevicePluginClient::new(harness.channel.clone());

    let preferred = client
        .get_preferred_allocation(Request::new(api::PreferredAllocationRequest {
            container_requests: vec![],
        }))
        .await
        .expect("GetPreferredAllocation should succeed")
        .into_inner();
    assert!(preferred.container_responses.is_empty());

    client
        .pre_start_container(Request::new(api::PreStartContainerRequest {
            devices_ids: vec!["vduse0".to_string()],
        }))
        .await
        .expect("PreStartContainer should succeed");
}
