use device_plugin_pb::api;

use crate::cdi;
use crate::deviceinfo;

/// Health value advertised for devices that are present and bound.
pub const HEALTHY: &str = "Healthy";

/// Driver that vhost-vdpa device nodes are bound to.
pub const VHOST_VDPA_DRIVER: &str = "vhost_vdpa";

/// A provisioned VDUSE device and the vhost-vdpa node backing it.
///
/// The record is immutable once constructed; everything the external
/// protocols need is derived from the two fields below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VduseDevice {
    name: String,
    vhost_vdpa_path: String,
}

impl VduseDevice {
    pub fn new(name: impl Into<String>, vhost_vdpa_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vhost_vdpa_path: vhost_vdpa_path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vhost_vdpa_path(&self) -> &str {
        &self.vhost_vdpa_path
    }

    /// Device entry advertised to the kubelet over ListAndWatch.
    pub fn api_device(&self) -> api::Device {
        api::Device {
            id: self.name.clone(),
            health: HEALTHY.to_string(),
            topology: None,
        }
    }

    /// Device node grant injected into a container on Allocate.
    ///
    /// The container path is the same as the host path.
    pub fn device_spec(&self) -> api::DeviceSpec {
        api::DeviceSpec {
            container_path: self.vhost_vdpa_path.clone(),
            host_path: self.vhost_vdpa_path.clone(),
            permissions: "rw".to_string(),
        }
    }

    /// CDI spec fragment for the device.
    pub fn cdi_device(&self) -> cdi::Device {
        cdi::Device {
            name: self.name.clone(),
            container_edits: cdi::ContainerEdits {
                device_nodes: vec![cdi::DeviceNode {
                    path: self.vhost_vdpa_path.clone(),
                    host_path: self.vhost_vdpa_path.clone(),
                    node_type: "c".to_string(),
                    permissions: "rw".to_string(),
                }],
            },
        }
    }

    /// vdpa fragment of the device-info file written for consumers.
    pub fn vdpa_info(&self) -> deviceinfo::VdpaDevice {
        deviceinfo::VdpaDevice {
            parent_device: self.name.clone(),
            driver: VHOST_VDPA_DRIVER.to_string(),
            path: self.vhost_vdpa_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn device() -> VduseDevice {
        VduseDevice::new("vduse3", "/dev/vhost-vdpa-3")
    }

    #[test]
    fn api_device_is_healthy() {
        let dev = device().api_device();
        assert_eq!(dev.id, "vduse3");
        assert_eq!(dev.health, HEALTHY);
        assert!(dev.topology.is_none());
    }

    #[test]
    fn device_spec_mirrors_host_path() {
        let spec = device().device_spec();
        assert_eq!(spec.container_path, spec.host_path);
        assert_eq!(spec.host_path, "/dev/vhost-vdpa-3");
        assert_eq!(spec.permissions, "rw");
    }

    #[test]
    fn cdi_device_exposes_char_node() {
        let dev = device().cdi_device();
        assert_eq!(dev.name, "vduse3");
        assert_eq!(dev.container_edits.device_nodes.len(), 1);
        let node = &dev.container_edits.device_nodes[0];
        assert_eq!(node.node_type, "c");
        assert_eq!(node.path, node.host_path);
    }

    #[test]
    fn vdpa_info_names_parent_device() {
        let info = device().vdpa_info();
        assert_eq!(info.parent_device, "vduse3");
        assert_eq!(info.driver, VHOST_VDPA_DRIVER);
        assert_eq!(info.path, "/dev/vhost-vdpa-3");
    }
}
