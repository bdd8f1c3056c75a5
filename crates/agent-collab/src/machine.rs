use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle state shared by containers and VMs, generalised from the VM
/// state machine — a container has the same observable states even though
/// it never goes through `Suspended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Created,
    Running,
    Stopped,
    Suspended,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineKind {
    Container,
    Vm,
}

#[derive(Debug, Clone)]
pub struct MachineInfo {
    pub id: String,
    pub kind: MachineKind,
    pub state: MachineState,
    pub ip: Option<String>,
}

/// Common capability set for anything the orchestrator manages as a
/// "machine" — container or VM — as a sum type with `{Info, Start, Stop,
/// Close, Create}` rather than two parallel code paths. `Create` lives on
/// the driver traits below, since it produces a handle rather than acting
/// on one.
#[async_trait]
pub trait MachineHandle: Send + Sync {
    fn info(&self) -> MachineInfo;
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// A heterogeneous machine: wraps either a container or a VM handle behind
/// one interface so `Exercise`/`Lab` code never branches on which it is.
pub struct Machine {
    handle: Box<dyn MachineHandle>,
}

impl Machine {
    pub fn new(handle: Box<dyn MachineHandle>) -> Self {
        Self { handle }
    }

    pub fn info(&self) -> MachineInfo {
        self.handle.info()
    }

    pub fn id(&self) -> String {
        self.handle.info().id
    }

    pub fn state(&self) -> MachineState {
        self.handle.info().state
    }

    pub async fn start(&mut self) -> Result<()> {
        self.handle.start().await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.handle.stop().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.handle.close().await
    }
}
