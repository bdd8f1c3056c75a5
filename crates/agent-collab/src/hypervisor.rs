use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::container::NetworkId;
use crate::error::Result;
use crate::machine::Machine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    /// Image name, resolved by the driver to `${ovaDir}/<image>.ova`.
    pub image: String,
    pub memory_mb: u32,
    pub cpu: f64,
}

#[derive(Debug, Clone)]
pub struct SharedFolder {
    pub host_path: String,
    pub guest_mount: String,
}

/// The hypervisor driver: an abstract interface over the VM backend, the
/// hypervisor command-line out-of-scope collaborator.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Create a VM in the `Created` state (not started) and connect it to
    /// `network` at `host_octet`. Returns the handle and its assigned IP.
    async fn create_vm(
        &self,
        spec: &VmSpec,
        network: NetworkId,
        host_octet: u8,
    ) -> Result<(Machine, String)>;

    /// Re-establish (or establish for the first time) the shared-folder
    /// link from the per-team host directory into the VM.
    async fn link_shared_folder(&self, vm_id: &str, folder: &SharedFolder) -> Result<()>;

    /// Reconnect a handle to a VM assumed to still be running under `id` —
    /// used by the state-persistence resume path (§4.8).
    async fn attach_vm(&self, id: &str) -> Result<Machine>;
}
