//! Kubelet-facing gRPC server: the plugin registration handshake and the
//! device-plugin broker surface, served together on one unix socket.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use device_plugin_pb::api;
use device_plugin_pb::api::device_plugin_server::{DevicePlugin, DevicePluginServer};
use device_plugin_pb::pluginregistration as registration;
use device_plugin_pb::pluginregistration::registration_server::{
    Registration, RegistrationServer,
};
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Result as TonicResult, Status};
use tracing::{debug, error, info, warn};

use crate::pool::{Pool, PoolError};

/// Default kubelet plugin registry directory.
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/plugins_registry";

/// Plugin type reported to the kubelet plugin watcher.
const PLUGIN_TYPE_DEVICE_PLUGIN: &str = "DevicePlugin";

/// Device plugin API versions this server speaks.
const SUPPORTED_VERSIONS: [&str; 2] = ["v1alpha1", "v1beta1"];

/// Device plugin server for one pool.
///
/// Owns the listening socket, the registration handshake state and the
/// background monitor that pushes inventory changes to the active
/// ListAndWatch stream.
pub struct VdusePlugin {
    pool: Arc<Pool>,
    cdi: bool,
    endpoint: String,
    socket_path: PathBuf,
    update_interval: Duration,
    cancellation_token: CancellationToken,
    update_tx: watch::Sender<()>,
    update_rx: watch::Receiver<()>,
    registration_failed: AtomicBool,
}

impl VdusePlugin {
    pub fn new(
        pool: Arc<Pool>,
        cdi: bool,
        plugin_dir: impl AsRef<Path>,
        update_interval: Duration,
    ) -> Arc<Self> {
        let endpoint = format!("{}_{}", pool.resource_prefix(), pool.resource_name());
        let socket_path = plugin_dir.as_ref().join(&endpoint);
        let (update_tx, update_rx) = watch::channel(());

        Arc::new(Self {
            pool,
            cdi,
            endpoint,
            socket_path,
            update_interval,
            cancellation_token: CancellationToken::new(),
            update_tx,
            update_rx,
            registration_failed: AtomicBool::new(false),
        })
    }

    /// Bind the plugin socket and start serving the registration and
    /// device-plugin services, plus the inventory monitor.
    ///
    /// A bind failure is fatal to the caller.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!(
            socket = %self.socket_path.display(),
            resource = %self.resource_name(),
            "starting device plugin server"
        );

        // clean up a socket left behind by an unclean shutdown
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        let service = Arc::new(DevicePluginService {
            plugin: self.clone(),
        });
        let registration_service = RegistrationServer::from_arc(service.clone());
        let device_plugin_service = DevicePluginServer::from_arc(service);

        let shutdown = self.cancellation_token.clone();
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(registration_service)
                .add_service(device_plugin_service)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        shutdown.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await;
            if let Err(e) = result {
                error!("serving incoming requests failed: {e}");
            }
        });

        tokio::spawn(self.clone().run_monitor());

        Ok(())
    }

    /// Poll the pool on a fixed interval and bump the update mailbox when
    /// the inventory changed. Poll errors are logged and treated as no
    /// change.
    async fn run_monitor(self: Arc<Self>) {
        info!(endpoint = %self.endpoint, "starting inventory monitor");
        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("inventory monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.pool.poll_update().await {
                        Ok(true) => {
                            debug!("inventory changed, signalling watchers");
                            let _ = self.update_tx.send(());
                        }
                        Ok(false) => {}
                        Err(e) => warn!("pool update failed: {e}"),
                    }
                }
            }
        }
    }

    /// Stop serving: unblocks any watch stream, shuts the transport down
    /// and removes the socket file.
    pub fn stop(&self) {
        info!(endpoint = %self.endpoint, "stopping device plugin server");
        self.cancellation_token.cancel();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove plugin socket: {e}");
            }
        }
    }

    /// True once the kubelet has rejected our registration.
    pub fn registration_failed(&self) -> bool {
        self.registration_failed.load(Ordering::SeqCst)
    }

    /// Resolves when the server has been cancelled, either by [`stop`] or
    /// by a failed registration.
    ///
    /// [`stop`]: VdusePlugin::stop
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await;
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Extended resource name advertised to the kubelet.
    fn resource_name(&self) -> String {
        format!(
            "{}/{}",
            self.pool.resource_prefix(),
            self.pool.resource_kind()
        )
    }
}

fn status_from_pool_error(e: PoolError) -> Status {
    match e {
        PoolError::DeviceNotFound { .. } => Status::not_found(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

/// gRPC service implementation shared by both protocol surfaces.
pub struct DevicePluginService {
    plugin: Arc<VdusePlugin>,
}

#[tonic::async_trait]
impl Registration for DevicePluginService {
    async fn get_info(
        &self,
        _request: Request<registration::InfoRequest>,
    ) -> TonicResult<Response<registration::PluginInfo>> {
        debug!("RegistrationAPI::GetInfo");
        Ok(Response::new(registration::PluginInfo {
            r#type: PLUGIN_TYPE_DEVICE_PLUGIN.to_string(),
            name: self.plugin.resource_name(),
            endpoint: self.plugin.socket_path.display().to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }))
    }

    async fn notify_registration_status(
        &self,
        request: Request<registration::RegistrationStatus>,
    ) -> TonicResult<Response<registration::RegistrationStatusResponse>> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!(
                endpoint = %self.plugin.endpoint,
                "plugin registered successfully at kubelet"
            );
        } else {
            error!(
                endpoint = %self.plugin.endpoint,
                "plugin failed to register at kubelet: {}", status.error
            );
            // registration rejection is fatal: stop accepting broker RPCs
            self.plugin
                .registration_failed
                .store(true, Ordering::SeqCst);
            self.plugin.cancellation_token.cancel();
        }
        Ok(Response::new(registration::RegistrationStatusResponse {}))
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<api::DevicePluginOptions>> {
        Ok(Response::new(api::DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<api::ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(endpoint = %self.plugin.endpoint, "ListAndWatch called");

        let (tx, rx) = mpsc::unbounded_channel();
        let plugin = self.plugin.clone();
        let mut updates = plugin.update_rx.clone();

        tokio::spawn(async move {
            // a bump that happened before this session opened is covered
            // by the initial snapshot
            updates.borrow_and_update();

            let devices = plugin.pool.api_devices().await;
            debug!(devices = devices.len(), "sending initial device list");
            if tx.send(Ok(api::ListAndWatchResponse { devices })).is_err() {
                return;
            }

            loop {
                tokio::select! {
                    // termination wins over a pending update
                    biased;
                    _ = plugin.cancellation_token.cancelled() => {
                        info!("terminate signal received, closing device stream");
                        return;
                    }
                    changed = updates.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let devices = plugin.pool.api_devices().await;
                        debug!(devices = devices.len(), "sending updated device list");
                        if tx.send(Ok(api::ListAndWatchResponse { devices })).is_err() {
                            error!("cannot update device states, stream closed");
                            return;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<api::PreferredAllocationRequest>,
    ) -> TonicResult<Response<api::PreferredAllocationResponse>> {
        Ok(Response::new(api::PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<api::AllocateRequest>,
    ) -> TonicResult<Response<api::AllocateResponse>> {
        let request = request.into_inner();
        info!(endpoint = %self.plugin.endpoint, "Allocate called with {request:?}");
        let pool = &self.plugin.pool;

        let mut container_responses = Vec::new();
        for container in &request.container_requests {
            let ids = &container.devices_ids;
            let mut response = api::ContainerAllocateResponse::default();

            if self.plugin.cdi {
                response.annotations = pool
                    .annotations(ids)
                    .await
                    .map_err(status_from_pool_error)?;
            } else {
                response.devices = pool
                    .device_specs(ids)
                    .await
                    .map_err(status_from_pool_error)?;
                response.mounts = pool.mounts(ids);
            }

            pool.store_device_info(ids)
                .await
                .map_err(status_from_pool_error)?;
            response.envs = pool.envs(ids);
            container_responses.push(response);
        }

        let response = api::AllocateResponse {
            container_responses,
        };
        debug!("Allocate response: {response:?}");
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<api::PreStartContainerRequest>,
    ) -> TonicResult<Response<api::PreStartContainerResponse>> {
        Ok(Response::new(api::PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use test_log::test;
    use tonic::Code;

    use super::*;
    use crate::deviceinfo::DeviceInfoStore;
    use crate::mock::{MemSpecStore, MockProvisioner};

    struct Fixture {
        service: DevicePluginService,
        plugin: Arc<VdusePlugin>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(num_devices: usize, cdi: bool) -> Fixture {
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
        let plugin = VdusePlugin::new(pool, cdi, dir.path(), Duration::from_secs(10));
        Fixture {
            service: DevicePluginService {
                plugin: plugin.clone(),
            },
            plugin,
            _dir: dir,
        }
    }

    fn allocate_request(ids: &[&str]) -> Request<api::AllocateRequest> {
        Request::new(api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: ids.iter().map(|s| s.to_string()).collect(),
            }],
        })
    }

    #[test(tokio::test)]
    async fn options_are_static() {
        let f = fixture(1, false).await;
        let options = f
            .service
            .get_device_plugin_options(Request::new(api::Empty {}))
            .await
            .expect("should return options")
            .into_inner();
        assert!(!options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);
    }

    #[test(tokio::test)]
    async fn get_info_reports_plugin_identity() {
        let f = fixture(1, false).await;
        let info = f
            .service
            .get_info(Request::new(registration::InfoRequest {}))
            .await
            .expect("should return info")
            .into_inner();
        assert_eq!(info.r#type, PLUGIN_TYPE_DEVICE_PLUGIN);
        assert_eq!(info.name, "vduse.io/vduse");
        assert_eq!(info.supported_versions, vec!["v1alpha1", "v1beta1"]);
        assert!(info.endpoint.ends_with("vduse.io_default"));
    }

    #[test(tokio::test)]
    async fn registration_rejection_cancels_server() {
        let f = fixture(1, false).await;
        f.service
            .notify_registration_status(Request::new(registration::RegistrationStatus {
                plugin_registered: false,
                error: "version unsupported".to_string(),
            }))
            .await
            .expect("notification itself should succeed");
        assert!(f.plugin.registration_failed());
        f.plugin.cancelled().await;
    }

    #[test(tokio::test)]
    async fn allocate_grants_device_nodes() {
        let f = fixture(2, false).await;
        let response = f
            .service
            .allocate(allocate_request(&["vduse0", "vduse1"]))
            .await
            .expect("should allocate")
            .into_inner();

        assert_eq!(response.container_responses.len(), 1);
        let container = &response.container_responses[0];
        assert_eq!(container.devices.len(), 2);
        assert!(container.annotations.is_empty());
        assert_eq!(
            container.envs.get("VDUSEDEVICE_VDUSE_IO_DEFAULT").map(String::as_str),
            Some("vduse0,vduse1")
        );
    }

    #[test(tokio::test)]
    async fn allocate_in_cdi_mode_grants_annotations() {
        let f = fixture(1, true).await;
        let response = f
            .service
            .allocate(allocate_request(&["vduse0"]))
            .await
            .expect("should allocate")
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

    #[test(tokio::test)]
    async fn allocate_unknown_device_fails_whole_call() {
        let f = fixture(1, false).await;
        let status = f
            .service
            .allocate(allocate_request(&["vduse0", "vduse9"]))
            .await
            .expect_err("unknown device should fail");
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("vduse9"));
    }

    #[test(tokio::test)]
    async fn watch_sends_initial_snapshot_then_updates() {
        let f = fixture(2, false).await;
        let mut stream = f
            .service
            .list_and_watch(Request::new(api::Empty {}))
            .await
            .expect("should open stream")
            .into_inner();

        let initial = stream
            .next()
            .await
            .expect("initial snapshot expected")
            .expect("snapshot should be ok");
        assert_eq!(initial.devices.len(), 2);

        // an inventory change signalled by the monitor produces one more
        // snapshot
        f.plugin.update_tx.send(()).expect("watcher is subscribed");
        let update = stream
            .next()
            .await
            .expect("update expected")
            .expect("update should be ok");
        assert_eq!(update.devices.len(), 2);
    }

    #[test(tokio::test)]
    async fn watch_terminates_on_stop() {
        let f = fixture(1, false).await;
        let mut stream = f
            .service
            .list_and_watch(Request::new(api::Empty {}))
            .await
            .expect("should open stream")
            .into_inner();

        let _ = stream.next().await.expect("initial snapshot expected");

        f.plugin.stop();
        assert!(stream.next().await.is_none());
    }
}
