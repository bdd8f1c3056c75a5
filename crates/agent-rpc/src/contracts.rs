//! §4.10 request/response contracts: plain serializable structs, no
//! framework-specific types. Whatever transport mounts
//! [`crate::OrchestratorService`] is responsible for marshaling these onto
//! the wire.

use agent_collab::VmSpec;
use agent_core::{ExerciseConfig, LabType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub exercise_service_url: String,
    pub sign_key: String,
    pub auth_key: String,
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvType {
    Beginner,
    Advanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnRequestConfig {
    pub interface_name: String,
    pub eth: String,
    pub server_public_key: String,
    pub server_endpoint_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub tag: String,
    pub env_type: EnvType,
    pub team_size: u32,
    /// Beginner envs only: how many labs to create immediately.
    pub initial_labs: u32,
    pub frontend_vms: Vec<VmSpec>,
    /// Beginner envs only: exercises pre-added to every initial lab.
    pub exercises: Vec<ExerciseConfig>,
    pub vpn: Option<VpnRequestConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEnvironmentResponse {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseEnvironmentRequest {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddExercisesToEnvRequest {
    pub env_tag: String,
    pub exercises: Vec<ExerciseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLabForEnvRequest {
    pub env_tag: String,
    pub is_vpn: bool,
}

/// The lab itself is not returned here — §9's design notes call this a
/// deliberate asynchrony: the caller gets "accepted", the actual lab
/// surfaces later over [`crate::stream::LabEvent`] on [`crate::LabStream`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLabForEnvResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLabRequest {
    pub lab_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLabResponse {
    pub tag: String,
    pub env_tag: String,
    pub lab_type: LabType,
    pub is_vpn: bool,
    pub rdp_ports: Vec<u16>,
    pub exercise_tags: Vec<String>,
    pub disabled_exercises: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVpnConfForLabRequest {
    pub lab_tag: String,
    pub team_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVpnConfForLabResponse {
    pub configs: Vec<String>,
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHostsInLabRequest {
    pub lab_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHostsInLabResponse {
    /// `ip \t name` lines, per §4.10.
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetLabRequest {
    pub lab_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetVmInLabRequest {
    pub lab_tag: String,
    pub rdp_port: u16,
    /// The guacamole connection identifier the caller is acting through —
    /// used for the team-size > 1 scope check (§4.10: "connection-identifier
    /// → RDP port lookup"). `None` when team size is 1 (no scope check
    /// needed, the lab has exactly one team).
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseLabRequest {
    pub lab_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddExercisesToLabRequest {
    pub lab_tag: String,
    pub exercises: Vec<ExerciseConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExerciseAction {
    Start,
    Stop,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseInLabRequest {
    pub lab_tag: String,
    pub exercise_tag: String,
    pub action: ExerciseAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEnvironmentsResponse {
    pub running: Vec<String>,
    pub starting: Vec<String>,
    pub closing: Vec<String>,
}
