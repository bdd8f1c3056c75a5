//! In-memory fakes for every collaborator trait, used by `agent-core`'s own
//! tests and by the binary's integration tests. None of these talk to a
//! real hypervisor, container engine, or WireGuard service — they just
//! track enough state to let the orchestration logic run end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::container::{ContainerDriver, ContainerSpec, NetworkId, NetworkSpec, RegistryCredential};
use crate::error::Result;
use crate::exercise_meta::ExerciseMetadataClient;
use crate::hypervisor::{HypervisorDriver, SharedFolder, VmSpec};
use crate::machine::{Machine, MachineHandle, MachineInfo, MachineKind, MachineState};
use crate::metrics::{HostMetrics, MetricsSource};
use crate::wireguard::{InterfaceAction, WireGuardClient};

struct FakeHandle {
    id: String,
    kind: MachineKind,
    ip: String,
    state: MachineState,
}

#[async_trait]
impl MachineHandle for FakeHandle {
    fn info(&self) -> MachineInfo {
        MachineInfo {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            ip: Some(self.ip.clone()),
        }
    }

    async fn start(&mut self) -> Result<()> {
        self.state = MachineState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.state = MachineState::Stopped;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state = MachineState::Stopped;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeContainerDriver {
    next_network: AtomicU64,
    networks: Mutex<HashMap<NetworkId, NetworkSpec>>,
}

impl FakeContainerDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ContainerDriver for FakeContainerDriver {
    async fn login(&self, _registries: &[RegistryCredential]) -> Result<()> {
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkId> {
        let id = NetworkId(self.next_network.fetch_add(1, Ordering::SeqCst));
        self.networks.lock().await.insert(id, spec.clone());
        Ok(id)
    }

    async fn remove_network(&self, network: NetworkId) -> Result<()> {
        self.networks.lock().await.remove(&network);
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        _network: NetworkId,
        host_octet: u8,
    ) -> Result<(Machine, String)> {
        let ip = format!("10.0.0.{host_octet}");
        let handle = FakeHandle {
            id: format!("container-{}", spec.name),
            kind: MachineKind::Container,
            ip: ip.clone(),
            state: MachineState::Created,
        };
        Ok((Machine::new(Box::new(handle)), ip))
    }

    async fn attach_container(&self, id: &str) -> Result<Machine> {
        let handle = FakeHandle {
            id: id.to_string(),
            kind: MachineKind::Container,
            ip: "0.0.0.0".into(),
            state: MachineState::Running,
        };
        Ok(Machine::new(Box::new(handle)))
    }
}

#[derive(Default)]
pub struct FakeHypervisorDriver {
    links: Mutex<HashMap<String, SharedFolder>>,
}

impl FakeHypervisorDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl HypervisorDriver for FakeHypervisorDriver {
    async fn create_vm(
        &self,
        spec: &VmSpec,
        _network: NetworkId,
        host_octet: u8,
    ) -> Result<(Machine, String)> {
        let ip = format!("10.0.0.{host_octet}");
        let handle = FakeHandle {
            id: format!("vm-{}-{}", spec.image, host_octet),
            kind: MachineKind::Vm,
            ip: ip.clone(),
            state: MachineState::Created,
        };
        Ok((Machine::new(Box::new(handle)), ip))
    }

    async fn link_shared_folder(&self, vm_id: &str, folder: &SharedFolder) -> Result<()> {
        self.links
            .lock()
            .await
            .insert(vm_id.to_string(), folder.clone());
        Ok(())
    }

    async fn attach_vm(&self, id: &str) -> Result<Machine> {
        let handle = FakeHandle {
            id: id.to_string(),
            kind: MachineKind::Vm,
            ip: "0.0.0.0".into(),
            state: MachineState::Running,
        };
        Ok(Machine::new(Box::new(handle)))
    }
}

#[derive(Default)]
pub struct FakeWireGuardClient {
    peers: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl FakeWireGuardClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl WireGuardClient for FakeWireGuardClient {
    async fn initialize_interface(
        &self,
        _address: &str,
        _listen_port: u16,
        _interface_name: &str,
        _eth: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn manage_interface(&self, _interface_name: &str, _action: InterfaceAction) -> Result<()> {
        Ok(())
    }

    async fn gen_private_key(&self) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn gen_public_key(&self, private_key: &str) -> Result<String> {
        Ok(format!("pub-{private_key}"))
    }

    async fn get_public_key(&self, _interface_name: &str, key_alias: &str) -> Result<String> {
        Ok(format!("pub-{key_alias}"))
    }

    async fn get_private_key(&self, _interface_name: &str, key_alias: &str) -> Result<String> {
        Ok(format!("priv-{key_alias}"))
    }

    async fn add_peer(
        &self,
        interface_name: &str,
        allowed_ips: &[String],
        public_key: &str,
        _key_alias: &str,
    ) -> Result<()> {
        self.peers.lock().await.insert(
            (interface_name.to_string(), public_key.to_string()),
            allowed_ips.to_vec(),
        );
        Ok(())
    }

    async fn del_peer(
        &self,
        interface_name: &str,
        public_key: &str,
        _key_alias: &str,
    ) -> Result<()> {
        self.peers
            .lock()
            .await
            .remove(&(interface_name.to_string(), public_key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeExerciseMetadataClient;

impl FakeExerciseMetadataClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ExerciseMetadataClient for FakeExerciseMetadataClient {
    async fn connect(&self, _url: &str, _tls: bool) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMetricsSource;

impl FakeMetricsSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl MetricsSource for FakeMetricsSource {
    async fn sample(&self) -> Result<HostMetrics> {
        Ok(HostMetrics {
            cpu_percent: 0.0,
            memory_used_mb: 0,
            memory_total_mb: 0,
        })
    }
}
