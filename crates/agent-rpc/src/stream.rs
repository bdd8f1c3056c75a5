//! The two streaming RPC contracts (§4.10): `LabStream` (server push, every
//! newly-running lab) and `MonitorStream` (bidirectional ping/metrics).
//!
//! `LabStream` rides a `tokio::sync::broadcast` channel: exactly the
//! "buffered 1000, drop-oldest-on-full, never block the worker" semantics
//! §5 asks for (the Open Question on buffer size is resolved to 1000, see
//! DESIGN.md), without hand-rolling a ring buffer — `broadcast` already lags
//! a slow receiver forward past dropped messages rather than blocking the
//! sender.

use agent_core::LabType;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Buffer size for the `newLabs` broadcast channel. §9's Open Questions
/// resolves the 100-vs-1000 ambiguity in the source to 1000.
pub const LAB_EVENT_BUFFER: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabEvent {
    pub env_tag: String,
    pub lab_tag: String,
    pub lab_type: LabType,
    pub rdp_ports: Vec<u16>,
}

/// Process-wide hub for `LabStream`: every `CreateEnvironment`/
/// `CreateLabForEnv` worker task that finishes a lab publishes one event
/// here; `LabStream` subscribers each get their own lagging receiver.
#[derive(Clone)]
pub struct LabEventBus {
    tx: broadcast::Sender<LabEvent>,
}

impl Default for LabEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LabEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(LAB_EVENT_BUFFER);
        Self { tx }
    }

    /// Publish a newly-running lab. Errors only when there are currently no
    /// subscribers — not a failure, just nothing to deliver to.
    pub fn publish(&self, event: LabEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LabEvent> {
        self.tx.subscribe()
    }
}

/// A `LabStream` subscription: terminates only when the client disconnects
/// (drops the receiver), per §4.10.
pub type LabStream = broadcast::Receiver<LabEvent>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonitorPing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorUpdate {
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub queued_tasks: usize,
    pub lab_count: usize,
    pub container_count: usize,
    pub vm_count: usize,
    /// Drained non-blockingly from the lab-event bus on every ping, per
    /// §4.10's "drains the `newLabs` channel non-blockingly" wording.
    pub new_labs: Vec<LabEvent>,
}

/// A live `MonitorStream` session: the caller sends a [`MonitorPing`] on
/// `pings` and reads the next [`MonitorUpdate`] off `updates`. Dropping
/// either end terminates the session, matching §4.10's "terminates on EOF
/// or context cancellation".
pub struct MonitorStream {
    pub pings: mpsc::Sender<MonitorPing>,
    pub updates: mpsc::Receiver<MonitorUpdate>,
}
