//! Device-info files recording which device was handed to which consumer.
//!
//! One JSON file is written per (resource, device id) pair on every
//! successful allocation, in the `k8s.cni.cncf.io` DeviceInfo format, so
//! an out-of-band pass can reconcile orphaned device bindings.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// DeviceInfo `type` for vdpa-backed devices.
pub const DEVICE_INFO_TYPE_VDPA: &str = "vdpa";

/// DeviceInfo schema version.
pub const DEVICE_INFO_VERSION: &str = "1.1.0";

#[derive(Debug, Error)]
pub enum DeviceInfoError {
    #[error("failed to serialize device-info for {1}: {0}")]
    Serialize(#[source] serde_json::Error, String),
    #[error("failed to write device-info for {id}: {source}")]
    Write { id: String, source: io::Error },
    #[error("failed to clean device-info for {id}: {source}")]
    Clean { id: String, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vdpa: Option<VdpaDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VdpaDevice {
    pub parent_device: String,
    pub driver: String,
    pub path: String,
}

impl DeviceInfo {
    /// DeviceInfo wrapper for a vdpa device fragment.
    pub fn vdpa(device: VdpaDevice) -> Self {
        Self {
            device_type: DEVICE_INFO_TYPE_VDPA.to_string(),
            version: DEVICE_INFO_VERSION.to_string(),
            vdpa: Some(device),
        }
    }
}

/// Writes and removes per-allocation device-info files under one
/// directory, `/var/run/k8s.cni.cncf.io/devinfo/dp` in a default
/// deployment.
pub struct DeviceInfoStore {
    dir: PathBuf,
}

impl DeviceInfoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_path(&self, resource: &str, device_id: &str) -> PathBuf {
        let escaped = resource.replace('/', "-");
        self.dir.join(format!("{escaped}-{device_id}-device.json"))
    }

    /// Persist the device-info for one (resource, device) pair, replacing
    /// any previous file for the pair.
    pub fn save(
        &self,
        resource: &str,
        device_id: &str,
        info: &DeviceInfo,
    ) -> Result<(), DeviceInfoError> {
        self.clean(resource, device_id)?;
        let doc = serde_json::to_vec_pretty(info)
            .map_err(|e| DeviceInfoError::Serialize(e, device_id.to_string()))?;
        fs::create_dir_all(&self.dir).map_err(|source| DeviceInfoError::Write {
            id: device_id.to_string(),
            source,
        })?;
        let path = self.file_path(resource, device_id);
        fs::write(&path, doc).map_err(|source| DeviceInfoError::Write {
            id: device_id.to_string(),
            source,
        })?;
        debug!(path = %path.display(), "written device-info file");
        Ok(())
    }

    /// Remove the device-info for one pair; missing files are fine.
    pub fn clean(&self, resource: &str, device_id: &str) -> Result<(), DeviceInfoError> {
        match fs::remove_file(self.file_path(resource, device_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DeviceInfoError::Clean {
                id: device_id.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::device::VduseDevice;

    #[test]
    fn save_writes_device_info_json() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let store = DeviceInfoStore::new(dir.path());
        let info = DeviceInfo::vdpa(VduseDevice::new("vduse0", "/dev/vhost-vdpa-0").vdpa_info());

        store
            .save("vduse.io/default", "vduse0", &info)
            .expect("should save device-info");

        let path = dir.path().join("vduse.io-default-vduse0-device.json");
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("file exists"))
                .expect("should parse");
        assert_eq!(json["type"], DEVICE_INFO_TYPE_VDPA);
        assert_eq!(json["version"], DEVICE_INFO_VERSION);
        assert_eq!(json["vdpa"]["parent-device"], "vduse0");
        assert_eq!(json["vdpa"]["driver"], "vhost_vdpa");
        assert_eq!(json["vdpa"]["path"], "/dev/vhost-vdpa-0");
    }

    #[test]
    fn save_replaces_previous_file() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let store = DeviceInfoStore::new(dir.path());
        let first = DeviceInfo::vdpa(VduseDevice::new("vduse0", "/dev/vhost-vdpa-0").vdpa_info());
        let second = DeviceInfo::vdpa(VduseDevice::new("vduse0", "/dev/vhost-vdpa-7").vdpa_info());

        store
            .save("vduse.io/default", "vduse0", &first)
            .expect("should save");
        store
            .save("vduse.io/default", "vduse0", &second)
            .expect("should replace");

        let path = dir.path().join("vduse.io-default-vduse0-device.json");
        let parsed: DeviceInfo =
            serde_json::from_slice(&std::fs::read(path).expect("file exists"))
                .expect("should parse");
        assert_eq!(parsed, second);
    }

    #[test]
    fn clean_missing_file_is_noop() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let store = DeviceInfoStore::new(dir.path());
        store
            .clean("vduse.io/default", "vduse9")
            .expect("cleaning a missing file should be ok");
    }
}
