//! §4.10's RPC surface as a transport-agnostic trait: one method per row of
//! the table, each a plain request in, plain response (or error) out.
//! Streaming endpoints return the contracts from [`crate::stream`] instead.

use async_trait::async_trait;

use crate::contracts::*;
use crate::error::OrchResult;
use crate::stream::{LabStream, MonitorStream};

#[async_trait]
pub trait OrchestratorService: Send + Sync {
    async fn init(&self, req: InitRequest) -> OrchResult<()>;
    async fn ping(&self, req: PingRequest) -> OrchResult<PingResponse>;

    async fn create_environment(
        &self,
        req: CreateEnvironmentRequest,
    ) -> OrchResult<CreateEnvironmentResponse>;
    async fn close_environment(&self, req: CloseEnvironmentRequest) -> OrchResult<()>;
    async fn add_exercises_to_env(&self, req: AddExercisesToEnvRequest) -> OrchResult<()>;

    async fn create_lab_for_env(
        &self,
        req: CreateLabForEnvRequest,
    ) -> OrchResult<CreateLabForEnvResponse>;
    async fn get_lab(&self, req: GetLabRequest) -> OrchResult<GetLabResponse>;
    async fn create_vpn_conf_for_lab(
        &self,
        req: CreateVpnConfForLabRequest,
    ) -> OrchResult<CreateVpnConfForLabResponse>;
    async fn get_hosts_in_lab(&self, req: GetHostsInLabRequest) -> OrchResult<GetHostsInLabResponse>;
    async fn reset_lab(&self, req: ResetLabRequest) -> OrchResult<()>;
    async fn reset_vm_in_lab(&self, req: ResetVmInLabRequest) -> OrchResult<()>;
    async fn close_lab(&self, req: CloseLabRequest) -> OrchResult<()>;
    async fn add_exercises_to_lab(&self, req: AddExercisesToLabRequest) -> OrchResult<()>;
    async fn exercise_in_lab(&self, req: ExerciseInLabRequest) -> OrchResult<()>;

    async fn list_environments(&self) -> OrchResult<ListEnvironmentsResponse>;

    /// Server-streaming: subscribe to every newly-running lab, agent-wide.
    fn lab_stream(&self) -> LabStream;

    /// Bidirectional: caller pings, server answers with metrics + drained
    /// lab events, until either side drops its half.
    fn monitor_stream(&self) -> MonitorStream;
}
