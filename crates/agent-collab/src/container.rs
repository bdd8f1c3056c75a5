use async_trait::async_trait;

use crate::error::Result;
use crate::machine::Machine;

#[derive(Debug, Clone)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// Bridge vs VPN topology for a lab's virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTopology {
    Bridge,
    Vpn,
}

#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet_cidr: String,
    pub topology: NetworkTopology,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u64);

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    pub dns_aliases: Vec<String>,
    /// Run as this `uid:gid` (guacd needs to match the shared-folder owner).
    pub run_as: Option<(u32, u32)>,
}

/// The container-engine driver: an abstract interface over "docker", the
/// container engine out-of-scope collaborator, plus the per-lab virtual
/// network primitives.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Register credentials for every configured registry once at startup;
    /// failures are non-fatal per-entry.
    async fn login(&self, registries: &[RegistryCredential]) -> Result<()>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkId>;
    async fn remove_network(&self, network: NetworkId) -> Result<()>;

    /// Create (but do not start) a container and connect it to `network` at
    /// `host_octet` within the network's subnet. Returns the assigned IPv4
    /// address alongside the machine handle.
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        network: NetworkId,
        host_octet: u8,
    ) -> Result<(Machine, String)>;

    /// Reconnect a handle to a container assumed to still be running under
    /// `id` — used by the state-persistence resume path (§4.8), which treats
    /// every id in `state.json` as ground truth rather than re-deriving it.
    async fn attach_container(&self, id: &str) -> Result<Machine>;
}
