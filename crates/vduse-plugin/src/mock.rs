//! Test adapters for the provisioning and spec-store boundaries.
//!
//! Used by the unit tests and the gRPC integration tests to exercise the
//! pool and the plugin server without a kernel vdpa bus or a writable
//! `/var/run`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cdi::{Spec, SpecError, SpecStore};
use crate::device::VduseDevice;
use crate::vduse::{DeviceProvisioner, ProvisionError};

/// In-memory provisioner with scriptable per-device failures.
#[derive(Default)]
pub struct MockProvisioner {
    fail_create: Mutex<HashSet<String>>,
    fail_destroy: Mutex<HashSet<String>>,
    created: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail for the given device name.
    pub fn fail_create_for(&self, name: &str) {
        self.fail_create.lock().unwrap().insert(name.to_string());
    }

    /// Make `destroy` fail for the given device name.
    pub fn fail_destroy_for(&self, name: &str) {
        self.fail_destroy.lock().unwrap().insert(name.to_string());
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.fail_create.lock().unwrap().clear();
        self.fail_destroy.lock().unwrap().clear();
    }

    /// Names successfully created so far, in call order.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Names successfully destroyed so far, in call order.
    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    /// Host path handed out for a device name.
    pub fn host_path(name: &str) -> String {
        format!("/dev/vhost-vdpa-{name}")
    }
}

#[async_trait]
impl DeviceProvisioner for MockProvisioner {
    async fn create(&self, name: &str) -> Result<VduseDevice, ProvisionError> {
        if self.fail_create.lock().unwrap().contains(name) {
            return Err(ProvisionError::Create {
                name: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.created.lock().unwrap().push(name.to_string());
        Ok(VduseDevice::new(name, Self::host_path(name)))
    }

    async fn destroy(&self, name: &str) -> Result<(), ProvisionError> {
        if self.fail_destroy.lock().unwrap().contains(name) {
            return Err(ProvisionError::Destroy {
                name: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.destroyed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// In-memory spec store recording published documents by name.
#[derive(Default)]
pub struct MemSpecStore {
    specs: Mutex<HashMap<String, Spec>>,
}

impl MemSpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the currently stored specs.
    pub fn spec_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stored document for a name, if present.
    pub fn get(&self, name: &str) -> Option<Spec> {
        self.specs.lock().unwrap().get(name).cloned()
    }
}

impl SpecStore for MemSpecStore {
    fn write_spec(&self, spec: &Spec, name: &str) -> Result<(), SpecError> {
        self.specs
            .lock()
            .unwrap()
            .insert(name.to_string(), spec.clone());
        Ok(())
    }

    fn remove_spec(&self, name: &str) -> Result<(), SpecError> {
        self.specs.lock().unwrap().remove(name);
        Ok(())
    }
}
