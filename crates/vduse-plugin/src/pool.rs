//! Device inventory and lifecycle management for one resource pool.

use std::collections::HashMap;
use std::sync::Arc;

use device_plugin_pb::api;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cdi::{self, Spec, SpecStore, CDI_VERSION};
use crate::device::VduseDevice;
use crate::deviceinfo::{DeviceInfo, DeviceInfoError, DeviceInfoStore};
use crate::vduse::{DeviceProvisioner, ProvisionError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no such device: {id}")]
    DeviceNotFound { id: String },
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Spec(#[from] cdi::SpecError),
    #[error(transparent)]
    DeviceInfo(#[from] DeviceInfoError),
}

/// Inventory of provisioned devices for one resource pool.
///
/// One lock guards the device map together with the name of the currently
/// published CDI spec, so a publish never races a concurrent teardown.
/// Provisioner calls during start/stop run under the lock; they dominate
/// the latency of those two operations anyway.
pub struct Pool {
    name: String,
    resource_prefix: String,
    resource_kind: String,
    num_devices: usize,
    provisioner: Arc<dyn DeviceProvisioner>,
    spec_store: Arc<dyn SpecStore>,
    device_info_store: DeviceInfoStore,
    state: RwLock<PoolState>,
}

#[derive(Default)]
struct PoolState {
    devices: HashMap<String, VduseDevice>,
    cdi_name: Option<String>,
    last_fingerprint: Option<String>,
}

impl PoolState {
    /// Canonical rendering of the inventory, used for change detection.
    fn fingerprint(&self) -> String {
        let mut entries: Vec<String> = self
            .devices
            .values()
            .map(|d| format!("{}={}", d.name(), d.vhost_vdpa_path()))
            .collect();
        entries.sort();
        entries.join(",")
    }
}

impl Pool {
    pub fn new(
        name: impl Into<String>,
        resource_prefix: impl Into<String>,
        resource_kind: impl Into<String>,
        num_devices: usize,
        provisioner: Arc<dyn DeviceProvisioner>,
        spec_store: Arc<dyn SpecStore>,
        device_info_store: DeviceInfoStore,
    ) -> Self {
        Self {
            name: name.into(),
            resource_prefix: resource_prefix.into(),
            resource_kind: resource_kind.into(),
            num_devices,
            provisioner,
            spec_store,
            device_info_store,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.name
    }

    pub fn resource_prefix(&self) -> &str {
        &self.resource_prefix
    }

    pub fn resource_kind(&self) -> &str {
        &self.resource_kind
    }

    /// Qualified resource, `<prefix>/<pool>`.
    pub fn qualified_resource(&self) -> String {
        format!("{}/{}", self.resource_prefix, self.name)
    }

    /// Provision the full device set, `<kind>0 .. <kind>{n-1}`.
    ///
    /// Individual failures are collected and returned; every other index
    /// is still attempted. A failed index stays absent from the inventory
    /// and is not retried.
    pub async fn start(&self) -> Vec<PoolError> {
        let mut state = self.state.write().await;
        let mut errs = Vec::new();

        for i in 0..self.num_devices {
            let name = format!("{}{}", self.resource_kind, i);
            debug!(vduse_device = %name, "creating device");
            match self.provisioner.create(&name).await {
                Ok(dev) => {
                    state.devices.insert(name, dev);
                }
                Err(e) => {
                    error!(vduse_device = %name, "error creating vduse device: {e}");
                    errs.push(e.into());
                }
            }
        }

        info!(devices = state.devices.len(), "pool started");
        errs
    }

    /// Tear down every held device, drop its device-info files and retract
    /// the published CDI spec.
    ///
    /// Best-effort: every device is attempted exactly once regardless of
    /// earlier failures, and the inventory ends empty either way.
    pub async fn stop(&self) -> Vec<PoolError> {
        let mut state = self.state.write().await;
        let mut errs = Vec::new();
        let resource = self.qualified_resource();

        let mut names: Vec<String> = state.devices.drain().map(|(name, _)| name).collect();
        names.sort();
        for name in names {
            if let Err(e) = self.device_info_store.clean(&resource, &name) {
                warn!(vduse_device = %name, "failed to clean device-info file: {e}");
                errs.push(e.into());
            }
            if let Err(e) = self.provisioner.destroy(&name).await {
                error!(vduse_device = %name, "error deleting vduse device: {e}");
                errs.push(e.into());
            }
        }

        if let Some(cdi_name) = state.cdi_name.take() {
            if let Err(e) = self.spec_store.remove_spec(&cdi_name) {
                warn!("cannot delete CDI spec {cdi_name}: {e}");
                errs.push(e.into());
            }
        }

        errs
    }

    /// Publish (or re-publish) the CDI spec covering the whole inventory.
    ///
    /// The published name is recomputed from the current content, so a
    /// repeated publish over an unchanged inventory is observably stable.
    pub async fn write_cdi_spec(&self) -> Result<(), PoolError> {
        let mut state = self.state.write().await;
        let spec = self.build_spec(&state.devices);
        let name = cdi::spec_file_name(&spec, &self.name)?;
        self.spec_store.write_spec(&spec, &name)?;

        let previous = state.cdi_name.replace(name.clone());
        if let Some(old) = previous {
            if old != name {
                if let Err(e) = self.spec_store.remove_spec(&old) {
                    warn!("failed to remove stale CDI spec {old}: {e}");
                }
            }
        }
        info!(cdi_spec = %name, "published CDI spec");
        Ok(())
    }

    /// Retract the published CDI spec. A no-op when nothing is published.
    pub async fn remove_cdi_spec(&self) -> Result<(), PoolError> {
        let mut state = self.state.write().await;
        let Some(name) = state.cdi_name.take() else {
            return Ok(());
        };
        self.spec_store.remove_spec(&name)?;
        info!(cdi_spec = %name, "retracted CDI spec");
        Ok(())
    }

    fn build_spec(&self, devices: &HashMap<String, VduseDevice>) -> Spec {
        let mut devs: Vec<&VduseDevice> = devices.values().collect();
        devs.sort_by(|a, b| a.name().cmp(b.name()));
        Spec {
            cdi_version: CDI_VERSION.to_string(),
            kind: format!("{}/{}", self.resource_prefix, self.resource_kind),
            devices: devs.into_iter().map(VduseDevice::cdi_device).collect(),
        }
    }

    /// Device-node grants for one allocation request. Every id must be in
    /// the inventory or the whole call fails.
    pub async fn device_specs(&self, ids: &[String]) -> Result<Vec<api::DeviceSpec>, PoolError> {
        let state = self.state.read().await;
        let mut specs = Vec::with_capacity(ids.len());
        for id in ids {
            let dev = state
                .devices
                .get(id)
                .ok_or_else(|| PoolError::DeviceNotFound { id: id.clone() })?;
            specs.push(dev.device_spec());
        }
        Ok(specs)
    }

    /// Mounts for one allocation request. vhost-vdpa needs none.
    pub fn mounts(&self, _ids: &[String]) -> Vec<api::Mount> {
        Vec::new()
    }

    /// CDI annotation for one allocation request. Every id must be in the
    /// inventory or the whole call fails.
    pub async fn annotations(&self, ids: &[String]) -> Result<HashMap<String, String>, PoolError> {
        let state = self.state.read().await;
        let mut qualified = Vec::with_capacity(ids.len());
        for id in ids {
            if !state.devices.contains_key(id) {
                return Err(PoolError::DeviceNotFound { id: id.clone() });
            }
            qualified.push(cdi::qualified_name(
                &self.resource_prefix,
                &self.resource_kind,
                id,
            ));
        }

        let key = cdi::annotation_key(&self.resource_prefix, &self.resource_kind);
        Ok(HashMap::from([(key, cdi::annotation_value(&qualified))]))
    }

    /// Environment variables identifying the allocated devices.
    pub fn envs(&self, ids: &[String]) -> HashMap<String, String> {
        let key = format!("VDUSEDEVICE_{}_{}", self.resource_prefix, self.name)
            .replace('.', "_")
            .to_uppercase();
        HashMap::from([(key, ids.join(","))])
    }

    /// Point-in-time inventory snapshot for the watch protocol, ordered by
    /// device id.
    pub async fn api_devices(&self) -> Vec<api::Device> {
        let state = self.state.read().await;
        let mut devices: Vec<api::Device> =
            state.devices.values().map(VduseDevice::api_device).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Report whether the inventory changed since the last poll. The first
    /// poll after construction always reports a change.
    pub async fn poll_update(&self) -> Result<bool, PoolError> {
        let mut state = self.state.write().await;
        let fingerprint = state.fingerprint();
        let changed = state.last_fingerprint.as_deref() != Some(fingerprint.as_str());
        state.last_fingerprint = Some(fingerprint);
        Ok(changed)
    }

    /// Write the device-info file for every allocated device. Every id
    /// must be in the inventory or the whole call fails.
    pub async fn store_device_info(&self, ids: &[String]) -> Result<(), PoolError> {
        let state = self.state.read().await;
        let resource = self.qualified_resource();
        for id in ids {
            let dev = state
                .devices
                .get(id)
                .ok_or_else(|| PoolError::DeviceNotFound { id: id.clone() })?;
            let info = DeviceInfo::vdpa(dev.vdpa_info());
            self.device_info_store.save(&resource, id, &info)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::mock::{MemSpecStore, MockProvisioner};

    struct Fixture {
        pool: Pool,
        provisioner: Arc<MockProvisioner>,
        spec_store: Arc<MemSpecStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(num_devices: usize) -> Fixture {
        let provisioner = Arc::new(MockProvisioner::new());
        let spec_store = Arc::new(MemSpecStore::new());
        let dir = tempfile::tempdir().expect("should create tempdir");
        let pool = Pool::new(
            "default",
            "vduse.io",
            "vduse",
            num_devices,
            provisioner.clone(),
            spec_store.clone(),
            DeviceInfoStore::new(dir.path()),
        );
        Fixture {
            pool,
            provisioner,
            spec_store,
            _dir: dir,
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test(tokio::test)]
    async fn start_provisions_contiguous_names() {
        let f = fixture(3);
        let errs = f.pool.start().await;
        assert!(errs.is_empty());

        let devices = f.pool.api_devices().await;
        let names: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(names, vec!["vduse0", "vduse1", "vduse2"]);
        assert_eq!(f.provisioner.created(), ids(&["vduse0", "vduse1", "vduse2"]));
    }

    #[test(tokio::test)]
    async fn start_with_zero_devices() {
        let f = fixture(0);
        assert!(f.pool.start().await.is_empty());
        assert!(f.pool.api_devices().await.is_empty());
    }

    #[test(tokio::test)]
    async fn start_continues_past_failures() {
        let f = fixture(3);
        f.provisioner.fail_create_for("vduse1");

        let errs = f.pool.start().await;
        assert_eq!(errs.len(), 1);

        let devices = f.pool.api_devices().await;
        let names: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(names, vec!["vduse0", "vduse2"]);

        // the failed index is absent, the whole allocation fails on it
        let err = f
            .pool
            .device_specs(&ids(&["vduse1"]))
            .await
            .expect_err("missing device should fail");
        assert!(matches!(err, PoolError::DeviceNotFound { ref id } if id == "vduse1"));

        let specs = f
            .pool
            .device_specs(&ids(&["vduse0", "vduse2"]))
            .await
            .expect("present devices should resolve");
        assert_eq!(specs.len(), 2);
    }

    #[test(tokio::test)]
    async fn stop_attempts_every_device() {
        let f = fixture(3);
        f.pool.start().await;
        f.provisioner.fail_destroy_for("vduse1");

        let errs = f.pool.stop().await;
        assert_eq!(errs.len(), 1);
        // vduse1 failed but vduse0 and vduse2 were still destroyed
        assert_eq!(f.provisioner.destroyed(), ids(&["vduse0", "vduse2"]));
        // inventory is drained regardless
        assert!(f.pool.api_devices().await.is_empty());
    }

    #[test(tokio::test)]
    async fn allocation_is_all_or_nothing() {
        let f = fixture(2);
        f.pool.start().await;

        let err = f
            .pool
            .annotations(&ids(&["vduse0", "vduse7"]))
            .await
            .expect_err("unknown id should fail the whole call");
        assert!(matches!(err, PoolError::DeviceNotFound { ref id } if id == "vduse7"));

        let annotations = f
            .pool
            .annotations(&ids(&["vduse0", "vduse1"]))
            .await
            .expect("all ids present");
        assert_eq!(
            annotations.get("cdi.k8s.io/vduse.io_vduse").map(String::as_str),
            Some("vduse.io/vduse=vduse0,vduse.io/vduse=vduse1")
        );
    }

    #[test(tokio::test)]
    async fn envs_identify_the_lease() {
        let f = fixture(2);
        f.pool.start().await;

        let envs = f.pool.envs(&ids(&["vduse0", "vduse1"]));
        assert_eq!(
            envs.get("VDUSEDEVICE_VDUSE_IO_DEFAULT").map(String::as_str),
            Some("vduse0,vduse1")
        );
    }

    #[test(tokio::test)]
    async fn publish_identity_is_stable_until_content_changes() {
        let f = fixture(2);
        f.provisioner.fail_create_for("vduse1");
        f.pool.start().await;

        f.pool.write_cdi_spec().await.expect("should publish");
        let first = f.spec_store.spec_names();
        assert_eq!(first.len(), 1);

        // unchanged inventory republishes under the same identity
        f.pool.write_cdi_spec().await.expect("should republish");
        assert_eq!(f.spec_store.spec_names(), first);

        // changed inventory gets a new identity, the old one is dropped
        f.provisioner.clear_failures();
        f.pool.start().await;
        f.pool.write_cdi_spec().await.expect("should republish");
        let second = f.spec_store.spec_names();
        assert_eq!(second.len(), 1);
        assert_ne!(second, first);
    }

    #[test(tokio::test)]
    async fn published_spec_projects_the_inventory() {
        let f = fixture(2);
        f.pool.start().await;
        f.pool.write_cdi_spec().await.expect("should publish");

        let names = f.spec_store.spec_names();
        let spec = f.spec_store.get(&names[0]).expect("spec stored");
        assert_eq!(spec.kind, "vduse.io/vduse");
        let device_names: Vec<&str> = spec.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(device_names, vec!["vduse0", "vduse1"]);
    }

    #[test(tokio::test)]
    async fn retract_without_publish_is_noop() {
        let f = fixture(1);
        f.pool.start().await;
        f.pool.remove_cdi_spec().await.expect("retract is a no-op");

        f.pool.write_cdi_spec().await.expect("should publish");
        f.pool.remove_cdi_spec().await.expect("should retract");
        assert!(f.spec_store.spec_names().is_empty());
        f.pool
            .remove_cdi_spec()
            .await
            .expect("second retract is a no-op");
    }

    #[test(tokio::test)]
    async fn stop_retracts_published_spec() {
        let f = fixture(1);
        f.pool.start().await;
        f.pool.write_cdi_spec().await.expect("should publish");

        let errs = f.pool.stop().await;
        assert!(errs.is_empty());
        assert!(f.spec_store.spec_names().is_empty());
    }

    #[test(tokio::test)]
    async fn poll_update_tracks_inventory_changes() {
        let f = fixture(1);

        // first poll always reports a change
        assert!(f.pool.poll_update().await.expect("should poll"));
        assert!(!f.pool.poll_update().await.expect("should poll"));

        f.pool.start().await;
        assert!(f.pool.poll_update().await.expect("should poll"));
        assert!(!f.pool.poll_update().await.expect("should poll"));

        f.pool.stop().await;
        assert!(f.pool.poll_update().await.expect("should poll"));
    }

    #[test(tokio::test)]
    async fn store_device_info_requires_known_ids() {
        let f = fixture(1);
        f.pool.start().await;

        f.pool
            .store_device_info(&ids(&["vduse0"]))
            .await
            .expect("known id should store");
        let path = f
            ._dir
            .path()
            .join("vduse.io-default-vduse0-device.json");
        assert!(path.exists());

        let err = f
            .pool
            .store_device_info(&ids(&["vduse9"]))
            .await
            .expect_err("unknown id should fail");
        assert!(matches!(err, PoolError::DeviceNotFound { ref id } if id == "vduse9"));
    }

    #[test(tokio::test)]
    async fn stop_cleans_device_info_files() {
        let f = fixture(1);
        f.pool.start().await;
        f.pool
            .store_device_info(&ids(&["vduse0"]))
            .await
            .expect("should store");
        let path = f
            ._dir
            .path()
            .join("vduse.io-default-vduse0-device.json");
        assert!(path.exists());

        f.pool.stop().await;
        assert!(!path.exists());
    }
}
