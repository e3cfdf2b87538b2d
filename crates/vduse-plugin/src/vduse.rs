//! VDUSE device provisioning through the kernel vdpa bus.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::device::{VduseDevice, VHOST_VDPA_DRIVER};

const VDPA_BUS_DIR: &str = "/sys/bus/vdpa";
const VDUSE_MGMTDEV: &str = "vduse";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{name}: error creating vduse device: {reason}")]
    Create { name: String, reason: String },
    #[error("{name}: error deleting vduse device: {reason}")]
    Destroy { name: String, reason: String },
}

/// Creates and destroys the devices a pool hands out.
#[async_trait]
pub trait DeviceProvisioner: Send + Sync {
    /// Provision one device and return its record.
    async fn create(&self, name: &str) -> Result<VduseDevice, ProvisionError>;

    /// Tear one device down. Destroying a name that was never created
    /// returns an error; callers treat that as non-fatal.
    async fn destroy(&self, name: &str) -> Result<(), ProvisionError>;
}

/// Provisioner backed by the iproute2 `vdpa` tool and the vdpa sysfs bus.
pub struct VduseManager {
    bus_dir: PathBuf,
}

impl VduseManager {
    pub fn new() -> Self {
        Self {
            bus_dir: PathBuf::from(VDPA_BUS_DIR),
        }
    }

    /// Disable vdpa driver autoprobe so devices only bind to the driver we
    /// pick for them.
    pub async fn start(&self) -> std::io::Result<()> {
        debug!("disabling vdpa driver autoprobe");
        tokio::fs::write(self.bus_dir.join("drivers_autoprobe"), "0\n").await
    }

    async fn vdpa(&self, args: &[&str]) -> Result<(), String> {
        let output = Command::new("vdpa")
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run vdpa: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "vdpa {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            ))
        }
    }

    async fn bind_vhost_vdpa(&self, name: &str) -> Result<(), String> {
        let bind = self
            .bus_dir
            .join("drivers")
            .join(VHOST_VDPA_DRIVER)
            .join("bind");
        tokio::fs::write(&bind, name)
            .await
            .map_err(|e| format!("binding {VHOST_VDPA_DRIVER}: {e}"))
    }

    /// Resolve the /dev node of the vhost-vdpa instance bound to `name`.
    async fn vhost_vdpa_path(&self, name: &str) -> Result<String, String> {
        let dev_dir = self.bus_dir.join("devices").join(name);
        let mut entries = tokio::fs::read_dir(&dev_dir)
            .await
            .map_err(|e| format!("reading {}: {e}", dev_dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("reading {}: {e}", dev_dir.display()))?
        {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with("vhost-vdpa-") {
                return Ok(format!("/dev/{file_name}"));
            }
        }
        Err(format!("no vhost-vdpa node under {}", dev_dir.display()))
    }
}

impl Default for VduseManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceProvisioner for VduseManager {
    async fn create(&self, name: &str) -> Result<VduseDevice, ProvisionError> {
        debug!(vduse_device = name, "adding vdpa device");
        self.vdpa(&["dev", "add", "mgmtdev", VDUSE_MGMTDEV, "name", name])
            .await
            .map_err(|reason| ProvisionError::Create {
                name: name.to_string(),
                reason,
            })?;

        debug!(vduse_device = name, "binding vdpa device");
        self.bind_vhost_vdpa(name)
            .await
            .map_err(|reason| ProvisionError::Create {
                name: name.to_string(),
                reason,
            })?;

        debug!(vduse_device = name, "resolving vhost-vdpa node");
        let path = self
            .vhost_vdpa_path(name)
            .await
            .map_err(|reason| ProvisionError::Create {
                name: name.to_string(),
                reason,
            })?;

        Ok(VduseDevice::new(name, path))
    }

    async fn destroy(&self, name: &str) -> Result<(), ProvisionError> {
        debug!(vduse_device = name, "deleting vdpa device");
        self.vdpa(&["dev", "del", name])
            .await
            .map_err(|reason| ProvisionError::Destroy {
                name: name.to_string(),
                reason,
            })
    }
}
