//! The concrete [`OrchestratorService`]: wires the RPC surface onto
//! `agent-core`'s lifecycle primitives and the `agent-collab` driver traits.
//!
//! Every mutating handler follows the same shape: look the entity up, run
//! the mutation, persist the pool snapshot regardless of outcome (§4.8: "a
//! snapshot is written after every state-mutating RPC, successful or
//! failed"), then return the result. `Arc<Orchestrator>` itself implements
//! the trait (rather than `Orchestrator`) so handlers that must outlive the
//! RPC call — the `CreateEnvironment`/`CreateLabForEnv` background lab
//! builds, `CloseLab`'s deferred machine teardown — can clone an owned
//! handle without a self-referential `Weak`.

use std::path::PathBuf;
use std::sync::Arc;

use agent_collab::{
    ContainerDriver, ExerciseMetadataClient, HypervisorDriver, MetricsSource, SharedFolder,
    WireGuardClient,
};
use agent_core::alloc::{HostPrefix, HostPrefixPool, LabSubnetPool};
use agent_core::environment::EnvVpnConfig;
use agent_core::guac::{ColorDepth, GuacamoleInstance, RdpConnectionRequest};
use agent_core::net::iptables::{self, IptablesExecutor};
use agent_core::{
    EnvPool, EnvState, Environment, ExerciseOp, Lab, LabType, OrchError, OrchResult, WorkerPool,
};
use agent_rpc::{
    AddExercisesToEnvRequest, AddExercisesToLabRequest, CloseEnvironmentRequest, CloseLabRequest,
    CreateEnvironmentRequest, CreateEnvironmentResponse, CreateLabForEnvRequest,
    CreateLabForEnvResponse, CreateVpnConfForLabRequest, CreateVpnConfForLabResponse, EnvType,
    ExerciseInLabRequest, GetHostsInLabRequest, GetHostsInLabResponse, GetLabRequest,
    GetLabResponse, InitRequest, LabEvent, LabEventBus, LabStream, ListEnvironmentsResponse,
    MonitorPing, MonitorStream, MonitorUpdate, OrchestratorService, PingRequest, PingResponse,
    ResetLabRequest, ResetVmInLabRequest,
};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

/// Second-octet range the VPN host-prefix pool draws from. Kept distinct
/// from `LAB_SUBNET_BASE` so a lab's own `/24`s never collide with an
/// environment's `/22` VPN base.
const HOST_PREFIX_X: u8 = 10;
const HOST_PREFIX_Y_START: u8 = 0;
const HOST_PREFIX_Y_END: u8 = 40;

/// Fixed `(a, b)` pair every lab subnet is carved out of: `10.50.<third>.0/24`.
const LAB_SUBNET_BASE: (u8, u8) = (10, 50);

const GUAC_RESOLUTION: (u32, u32) = (1024, 768);
const GUAC_SHARE_MOUNT: &str = "/mnt/share";

pub struct Orchestrator {
    pool: EnvPool,
    workers: WorkerPool,
    lab_events: LabEventBus,
    containers: Arc<dyn ContainerDriver>,
    hypervisors: Arc<dyn HypervisorDriver>,
    wireguard: Arc<dyn WireGuardClient>,
    exercise_meta: Arc<dyn ExerciseMetadataClient>,
    metrics: Arc<dyn MetricsSource>,
    iptables: Arc<dyn IptablesExecutor>,
    host_prefixes: Mutex<HostPrefixPool>,
    lab_subnets: Mutex<LabSubnetPool>,
    file_transfer_root: String,
    state_dir: PathBuf,
    vpn_conf_dir: Option<PathBuf>,
    initialized: RwLock<bool>,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        containers: Arc<dyn ContainerDriver>,
        hypervisors: Arc<dyn HypervisorDriver>,
        wireguard: Arc<dyn WireGuardClient>,
        exercise_meta: Arc<dyn ExerciseMetadataClient>,
        metrics: Arc<dyn MetricsSource>,
        iptables: Arc<dyn IptablesExecutor>,
        max_workers: usize,
        file_transfer_root: String,
        state_dir: PathBuf,
        vpn_conf_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let workers = WorkerPool::new(max_workers);
        Arc::new(Self {
            pool: EnvPool::new(),
            workers,
            lab_events: LabEventBus::new(),
            containers,
            hypervisors,
            wireguard,
            exercise_meta,
            metrics,
            iptables,
            host_prefixes: Mutex::new(HostPrefixPool::new(
                HOST_PREFIX_X,
                HOST_PREFIX_Y_START,
                HOST_PREFIX_Y_END,
            )),
            lab_subnets: Mutex::new(LabSubnetPool::new(LAB_SUBNET_BASE)),
            file_transfer_root,
            state_dir,
            vpn_conf_dir,
            initialized: RwLock::new(false),
        })
    }

    /// Rebuild the pool from `${state_dir}/state.json`, if present, and
    /// reserve every resumed environment's/lab's allocated resources so the
    /// fresh pools never hand them out a second time (§4.8's resume path).
    pub async fn resume(&self) -> OrchResult<()> {
        let Some(snapshot) = agent_core::load_snapshot(&self.state_dir).await? else {
            return Ok(());
        };

        for env_snapshot in snapshot.envs {
            self.host_prefixes.lock().await.reserve(HostPrefix {
                x: env_snapshot.host_prefix.0,
                y: env_snapshot.host_prefix.1,
            });
            for lab_snapshot in &env_snapshot.labs {
                if let Some(subnet) =
                    agent_core::alloc::LabSubnet::parse(&lab_snapshot.subnet_cidr)
                {
                    self.lab_subnets.lock().await.reserve(subnet.third());
                }
            }

            let env = Environment::from_snapshot(
                env_snapshot,
                self.containers.as_ref(),
                self.hypervisors.as_ref(),
            )
            .await?;
            self.pool.add(Arc::new(env)).await?;
        }

        tracing::info!(env_count = self.pool.list_envs().await.len(), "resumed state");
        Ok(())
    }

    pub fn queued_task_count(&self) -> usize {
        self.workers.queued_task_count()
    }

    /// Spawn the worker pool's long-lived drain tasks. Must be called
    /// exactly once, before any RPC that enqueues work is served.
    pub async fn start_workers(&self) {
        self.workers.run().await;
    }

    async fn persist(&self) {
        if let Err(e) = agent_core::save_snapshot(&self.pool, &self.state_dir).await {
            tracing::warn!(error = %e, "failed to persist state snapshot");
        }
    }

    async fn get_env(&self, tag: &str) -> OrchResult<Arc<Environment>> {
        self.pool
            .get(tag)
            .await
            .ok_or_else(|| OrchError::NotFound(format!("environment not found: {tag}")))
    }

    async fn find_lab(&self, lab_tag: &str) -> OrchResult<(Arc<Environment>, Arc<Lab>)> {
        self.pool
            .get_lab_by_tag(lab_tag)
            .await
            .ok_or_else(|| OrchError::NotFound(format!("lab not found: {lab_tag}")))
    }

    fn team_dir(&self, env_tag: &str, guac_user: &str) -> String {
        format!("{}/{env_tag}/{guac_user}", self.file_transfer_root)
    }

    /// Tear down a VPN-enabled lab's iptables rules and WireGuard peers, and
    /// sweep its `wg-conf-dir` files. A no-op for non-VPN labs.
    async fn teardown_vpn_for_lab(&self, env: &Environment, lab: &Lab) -> OrchResult<()> {
        if !lab.is_vpn {
            return Ok(());
        }
        let peer_ips = lab.vpn_peer_ips_without_subnet().await;
        if !peer_ips.is_empty() {
            iptables::remove_lab_rules(self.iptables.as_ref(), &lab.subnet.cidr(), &peer_ips)
                .await?;
        }
        env.remove_vpn_lab_peers(lab, self.wireguard.as_ref()).await?;
        self.remove_vpn_conf_files(&format!("{}_{}", env.tag, lab.tag)).await;
        Ok(())
    }

    async fn remove_vpn_conf_files(&self, prefix: &str) {
        let Some(dir) = &self.vpn_conf_dir else {
            return;
        };
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    /// §4.7's per-lab guacamole provisioning: one user, one RDP connection
    /// (+ grant) per frontend, a per-team host directory, and a shared-folder
    /// link into every frontend VM.
    async fn provision_guac_for_lab(&self, env: &Environment, lab: &Lab) -> OrchResult<()> {
        let username = Uuid::new_v4().to_string();
        let password = Uuid::new_v4().to_string();
        env.guac.create_user(&username, &password).await?;

        let team_dir = self.team_dir(&env.tag, &username);
        tokio::fs::create_dir_all(&team_dir)
            .await
            .map_err(OrchError::Io)?;

        for (port, machine_id, octet) in lab.frontend_machines().await {
            let conn_id = env
                .guac
                .create_rdp_connection(RdpConnectionRequest {
                    host: lab.subnet.host(octet),
                    port,
                    name: format!("{}-{port}", lab.tag),
                    username: None,
                    password: None,
                    resolution: GUAC_RESOLUTION,
                    color_depth: ColorDepth::TwentyFour,
                    max_connections: 1,
                    enable_drive: true,
                    drive_path: Some(team_dir.clone()),
                })
                .await?;
            env.guac.grant_connection(&conn_id, &username).await?;

            let shared_folder = SharedFolder {
                host_path: team_dir.clone(),
                guest_mount: GUAC_SHARE_MOUNT.into(),
            };
            self.hypervisors
                .link_shared_folder(&machine_id, &shared_folder)
                .await
                .map_err(OrchError::from)?;
        }

        lab.set_guac_user(username).await;
        Ok(())
    }

    async fn build_and_start_lab(&self, env: &Environment, is_vpn: bool) -> OrchResult<Lab> {
        let subnet = self.lab_subnets.lock().await.allocate()?;
        let exercises = env.exercise_template().await;
        let lab = match Lab::create(
            &env.tag,
            env.env_type,
            is_vpn,
            subnet,
            env.frontend_template.clone(),
            exercises,
            self.containers.as_ref(),
            self.hypervisors.as_ref(),
        )
        .await
        {
            Ok(lab) => lab,
            Err(e) => {
                self.lab_subnets.lock().await.release(subnet);
                return Err(e);
            }
        };

        if let Err(e) = lab
            .start(
                self.containers.as_ref(),
                self.hypervisors.as_ref(),
                &self.file_transfer_root,
            )
            .await
        {
            let _ = lab.close(self.containers.as_ref()).await;
            self.lab_subnets.lock().await.release(subnet);
            return Err(e);
        }

        if let Err(e) = self.provision_guac_for_lab(env, &lab).await {
            let _ = lab.close(self.containers.as_ref()).await;
            self.lab_subnets.lock().await.release(subnet);
            return Err(e);
        }

        Ok(lab)
    }

    /// Background lab-creation task (§4.6 step "enqueue lab-creation tasks"
    /// for a beginner environment's initial labs, and `CreateLabForEnv`'s
    /// single-lab case). Self-cancels if the environment started closing
    /// while the task was queued or mid-build.
    async fn run_lab_creation_task(&self, env: Arc<Environment>, is_vpn: bool) {
        if matches!(env.state().await, EnvState::Closing | EnvState::Closed) {
            tracing::warn!(env_tag = %env.tag, "environment closing, dropping queued lab creation");
            return;
        }

        let lab = match self.build_and_start_lab(&env, is_vpn).await {
            Ok(lab) => lab,
            Err(e) => {
                tracing::warn!(env_tag = %env.tag, error = %e, "lab creation failed");
                return;
            }
        };

        if matches!(env.state().await, EnvState::Closing | EnvState::Closed) {
            tracing::warn!(env_tag = %env.tag, lab_tag = %lab.tag, "environment closed mid-build, closing orphaned lab");
            let _ = self.teardown_vpn_for_lab(&env, &lab).await;
            let _ = lab.close(self.containers.as_ref()).await;
            self.lab_subnets.lock().await.release(lab.subnet);
            return;
        }

        let rdp_ports = lab.rdp_conn_ports().await;
        let lab_tag = lab.tag.clone();
        let lab_type = lab.lab_type;
        env.add_lab(lab).await;
        self.lab_events.publish(LabEvent {
            env_tag: env.tag.clone(),
            lab_tag,
            lab_type,
            rdp_ports,
        });
        self.persist().await;
    }

    fn enqueue_lab_creation(self: &Arc<Self>, env: Arc<Environment>, is_vpn: bool) {
        let this = Arc::clone(self);
        self.workers.add_task(Box::new(move || {
            Box::pin(async move {
                this.run_lab_creation_task(env, is_vpn).await;
            })
        }));
    }

    async fn create_environment_inner(
        self: &Arc<Self>,
        req: CreateEnvironmentRequest,
    ) -> OrchResult<CreateEnvironmentResponse> {
        if req.team_size == 0 {
            return Err(OrchError::InvalidArgument(
                "team size must be greater than zero".into(),
            ));
        }
        if self.pool.exists(&req.tag).await {
            return Err(OrchError::AlreadyExists(format!(
                "environment already exists: {}",
                req.tag
            )));
        }

        let lab_type = match req.env_type {
            EnvType::Beginner => LabType::Beginner,
            EnvType::Advanced => LabType::Advanced,
        };

        let host_prefix = self.host_prefixes.lock().await.allocate()?;

        let guac = match GuacamoleInstance::create(
            &req.tag,
            &self.file_transfer_root,
            self.containers.as_ref(),
        )
        .await
        {
            Ok(guac) => guac,
            Err(e) => {
                self.host_prefixes.lock().await.release(host_prefix);
                return Err(e);
            }
        };

        let vpn_cfg = req.vpn.map(|v| EnvVpnConfig {
            interface_name: v.interface_name,
            eth: v.eth,
            server_public_key: v.server_public_key,
            server_endpoint_host: v.server_endpoint_host,
        });

        let env = Arc::new(Environment::new(
            req.tag.clone(),
            lab_type,
            req.team_size,
            (host_prefix.x, host_prefix.y),
            vpn_cfg,
            Arc::new(guac),
            req.frontend_vms,
            req.exercises,
        ));

        if lab_type == LabType::Beginner {
            for _ in 0..req.initial_labs {
                self.enqueue_lab_creation(Arc::clone(&env), false);
            }
        }

        if let Err(e) = env.start(self.wireguard.as_ref()).await {
            self.host_prefixes.lock().await.release(host_prefix);
            return Err(e);
        }

        self.pool.add(Arc::clone(&env)).await?;
        Ok(CreateEnvironmentResponse { tag: req.tag })
    }

    async fn close_environment_inner(&self, tag: &str) -> OrchResult<()> {
        let env = self.get_env(tag).await?;

        self.host_prefixes.lock().await.release(HostPrefix {
            x: env.host_prefix.0,
            y: env.host_prefix.1,
        });

        let team_root = format!("{}/{tag}", self.file_transfer_root);
        let _ = tokio::fs::remove_dir_all(&team_root).await;

        for lab_tag in env.lab_tags().await {
            if let Some(lab) = env.get_lab(&lab_tag).await {
                if let Err(e) = self.teardown_vpn_for_lab(&env, &lab).await {
                    tracing::warn!(lab_tag = %lab_tag, error = %e, "vpn teardown failed during env close");
                }
                self.lab_subnets.lock().await.release(lab.subnet);
            }
        }

        env.close(self.containers.as_ref(), Some(self.wireguard.as_ref()))
            .await?;
        self.remove_vpn_conf_files(tag).await;
        self.pool.remove(tag).await;
        Ok(())
    }
}

#[async_trait]
impl OrchestratorService for Arc<Orchestrator> {
    async fn init(&self, req: InitRequest) -> OrchResult<()> {
        self.exercise_meta
            .connect(&req.exercise_service_url, req.tls)
            .await
            .map_err(|e| OrchError::Unavailable(format!("exercise metadata service: {e}")))?;
        *self.initialized.write().await = true;
        Ok(())
    }

    async fn ping(&self, req: PingRequest) -> OrchResult<PingResponse> {
        Ok(PingResponse {
            message: format!("pong: {}", req.message),
        })
    }

    async fn create_environment(
        &self,
        req: CreateEnvironmentRequest,
    ) -> OrchResult<CreateEnvironmentResponse> {
        self.pool.mark_starting(&req.tag).await?;
        let result = self.create_environment_inner(req.clone()).await;
        self.pool.unmark_starting(&req.tag).await;
        self.persist().await;
        result
    }

    async fn close_environment(&self, req: CloseEnvironmentRequest) -> OrchResult<()> {
        self.pool.mark_closing(&req.tag).await?;
        let result = self.close_environment_inner(&req.tag).await;
        self.pool.unmark_closing(&req.tag).await;
        self.persist().await;
        result
    }

    async fn add_exercises_to_env(&self, req: AddExercisesToEnvRequest) -> OrchResult<()> {
        let env = self.get_env(&req.env_tag).await?;
        if env.env_type != LabType::Beginner {
            return Err(OrchError::FailedPrecondition(
                "exercises can only be added to beginner environments".into(),
            ));
        }
        env.extend_exercise_template(req.exercises.clone()).await;

        let labs = env.labs().await;
        let results = futures_util::future::join_all(labs.iter().map(|lab| {
            lab.add_and_start_exercises(
                req.exercises.clone(),
                self.containers.as_ref(),
                self.hypervisors.as_ref(),
                &self.file_transfer_root,
            )
        }))
        .await;
        let errors: Vec<(String, OrchError)> = labs
            .iter()
            .zip(results)
            .filter_map(|(lab, r)| r.err().map(|e| (lab.tag.clone(), e)))
            .collect();

        self.persist().await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(agent_core::combine_errors("add exercises to environment", errors))
        }
    }

    async fn create_lab_for_env(
        &self,
        req: CreateLabForEnvRequest,
    ) -> OrchResult<CreateLabForEnvResponse> {
        let env = self.get_env(&req.env_tag).await?;
        if env.env_type == LabType::Beginner && req.is_vpn {
            return Err(OrchError::FailedPrecondition(
                "beginner environments do not support VPN labs".into(),
            ));
        }
        self.enqueue_lab_creation(env, req.is_vpn);
        Ok(CreateLabForEnvResponse { accepted: true })
    }

    async fn get_lab(&self, req: GetLabRequest) -> OrchResult<GetLabResponse> {
        let (_, lab) = self.find_lab(&req.lab_tag).await?;
        Ok(GetLabResponse {
            tag: lab.tag.clone(),
            env_tag: lab.env_tag.clone(),
            lab_type: lab.lab_type,
            is_vpn: lab.is_vpn,
            rdp_ports: lab.rdp_conn_ports().await,
            exercise_tags: lab.exercise_tags().await,
            disabled_exercises: lab.disabled_exercises().await,
        })
    }

    async fn create_vpn_conf_for_lab(
        &self,
        req: CreateVpnConfForLabRequest,
    ) -> OrchResult<CreateVpnConfForLabResponse> {
        let (env, lab) = self.find_lab(&req.lab_tag).await?;
        let (configs, allowed_ips) = env
            .create_vpn_configs_for_lab(&lab, self.wireguard.as_ref(), req.team_size)
            .await?;

        let peer_ips = lab.vpn_peer_ips_without_subnet().await;
        if let Err(e) =
            iptables::apply_lab_rules(self.iptables.as_ref(), &lab.subnet.cidr(), &peer_ips).await
        {
            let _ = env.remove_vpn_lab_peers(&lab, self.wireguard.as_ref()).await;
            self.persist().await;
            return Err(e);
        }

        self.persist().await;
        Ok(CreateVpnConfForLabResponse { configs, allowed_ips })
    }

    async fn get_hosts_in_lab(&self, req: GetHostsInLabRequest) -> OrchResult<GetHostsInLabResponse> {
        let (_, lab) = self.find_lab(&req.lab_tag).await?;
        let hosts = lab
            .dns_records()
            .await
            .into_iter()
            .map(|(name, ip)| format!("{ip}\t{name}"))
            .collect();
        Ok(GetHostsInLabResponse { hosts })
    }

    async fn reset_lab(&self, req: ResetLabRequest) -> OrchResult<()> {
        let (_, lab) = self.find_lab(&req.lab_tag).await?;
        let result = lab
            .reset(
                self.containers.as_ref(),
                self.hypervisors.as_ref(),
                &self.file_transfer_root,
            )
            .await;
        self.persist().await;
        result
    }

    async fn reset_vm_in_lab(&self, req: ResetVmInLabRequest) -> OrchResult<()> {
        let (env, lab) = self.find_lab(&req.lab_tag).await?;

        if env.team_size > 1 {
            if let Some(conn_id) = &req.connection_id {
                let configured_port = env.guac.get_port_from_connection_identifier(conn_id).await?;
                if configured_port != req.rdp_port {
                    return Err(OrchError::PermissionDenied(format!(
                        "connection {conn_id} is not bound to port {}",
                        req.rdp_port
                    )));
                }
            }
        }

        let guac_user = lab.guac_user().await.unwrap_or_default();
        let shared_folder = SharedFolder {
            host_path: self.team_dir(&env.tag, &guac_user),
            guest_mount: GUAC_SHARE_MOUNT.into(),
        };
        let result = lab
            .reset_vm(req.rdp_port, self.hypervisors.as_ref(), &shared_folder)
            .await;
        self.persist().await;
        result
    }

    async fn close_lab(&self, req: CloseLabRequest) -> OrchResult<()> {
        let (env, lab) = self.find_lab(&req.lab_tag).await?;
        env.remove_lab(&lab.tag).await;

        if let Err(e) = self.teardown_vpn_for_lab(&env, &lab).await {
            tracing::warn!(lab_tag = %lab.tag, error = %e, "vpn teardown failed during lab close");
        }
        self.lab_subnets.lock().await.release(lab.subnet);

        let this = Arc::clone(self);
        self.workers.add_task(Box::new(move || {
            Box::pin(async move {
                if let Err(e) = lab.close(this.containers.as_ref()).await {
                    tracing::warn!(lab_tag = %lab.tag, error = %e, "close lab task failed");
                }
                this.persist().await;
            })
        }));
        Ok(())
    }

    async fn add_exercises_to_lab(&self, req: AddExercisesToLabRequest) -> OrchResult<()> {
        let (_, lab) = self.find_lab(&req.lab_tag).await?;
        if lab.lab_type == LabType::Beginner {
            return Err(OrchError::FailedPrecondition(
                "exercises can only be added directly to advanced labs".into(),
            ));
        }
        let result = lab
            .add_and_start_exercises(
                req.exercises,
                self.containers.as_ref(),
                self.hypervisors.as_ref(),
                &self.file_transfer_root,
            )
            .await;
        self.persist().await;
        result
    }

    async fn exercise_in_lab(&self, req: ExerciseInLabRequest) -> OrchResult<()> {
        let (_, lab) = self.find_lab(&req.lab_tag).await?;
        let op = match req.action {
            agent_rpc::ExerciseAction::Start => ExerciseOp::Start,
            agent_rpc::ExerciseAction::Stop => ExerciseOp::Stop,
            agent_rpc::ExerciseAction::Reset => ExerciseOp::Reset,
        };
        let result = lab
            .exercise_action(
                &req.exercise_tag,
                op,
                self.containers.as_ref(),
                self.hypervisors.as_ref(),
                &self.file_transfer_root,
            )
            .await;
        self.persist().await;
        result
    }

    async fn list_environments(&self) -> OrchResult<ListEnvironmentsResponse> {
        Ok(ListEnvironmentsResponse {
            running: self.pool.list_envs().await,
            starting: self.pool.list_starting().await,
            closing: self.pool.list_closing().await,
        })
    }

    fn lab_stream(&self) -> LabStream {
        self.lab_events.subscribe()
    }

    fn monitor_stream(&self) -> MonitorStream {
        let (ping_tx, mut ping_rx) = mpsc::channel::<MonitorPing>(8);
        let (update_tx, update_rx) = mpsc::channel::<MonitorUpdate>(8);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut lab_rx = this.lab_events.subscribe();
            while ping_rx.recv().await.is_some() {
                let mut new_labs = Vec::new();
                while let Ok(event) = lab_rx.try_recv() {
                    new_labs.push(event);
                }

                let metrics = this.metrics.sample().await.unwrap_or_default();
                let lab_count = this.pool.full_lab_count().await;
                let (container_count, vm_count) = this.total_machine_counts().await;

                let update = MonitorUpdate {
                    cpu_percent: metrics.cpu_percent,
                    memory_used_mb: metrics.memory_used_mb,
                    memory_total_mb: metrics.memory_total_mb,
                    queued_tasks: this.queued_task_count(),
                    lab_count,
                    container_count,
                    vm_count,
                    new_labs,
                };

                if update_tx.send(update).await.is_err() {
                    break;
                }
            }
        });

        MonitorStream { pings: ping_tx, updates: update_rx }
    }
}

impl Orchestrator {
    async fn total_machine_counts(&self) -> (usize, usize) {
        let mut containers = 0;
        let mut vms = 0;
        for tag in self.pool.list_envs().await {
            if let Some(env) = self.pool.get(&tag).await {
                let (c, v) = env.machine_counts().await;
                containers += c;
                vms += v;
            }
        }
        (containers, vms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_collab::{
        FakeContainerDriver, FakeExerciseMetadataClient, FakeHypervisorDriver, FakeMetricsSource,
        FakeWireGuardClient,
    };
    use agent_core::net::iptables::NoopIptablesExecutor;
    use agent_rpc::{CreateEnvironmentRequest, CreateLabForEnvRequest, EnvType, PingRequest};

    async fn test_orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        tokio::fs::create_dir_all(dir.join("ftroot")).await.unwrap();
        Orchestrator::new(
            FakeContainerDriver::new(),
            FakeHypervisorDriver::new(),
            FakeWireGuardClient::new(),
            FakeExerciseMetadataClient::new(),
            FakeMetricsSource::new(),
            Arc::new(NoopIptablesExecutor),
            2,
            dir.join("ftroot").to_string_lossy().into_owned(),
            dir.join("state"),
            None,
        )
    }

    fn advanced_env(tag: &str) -> CreateEnvironmentRequest {
        CreateEnvironmentRequest {
            tag: tag.into(),
            env_type: EnvType::Advanced,
            team_size: 1,
            initial_labs: 0,
            frontend_vms: Vec::new(),
            exercises: Vec::new(),
            vpn: None,
        }
    }

    #[tokio::test]
    async fn ping_echoes_message() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path()).await;
        orch.start_workers().await;

        let resp = orch
            .ping(PingRequest { message: "hi".into() })
            .await
            .unwrap();
        assert_eq!(resp.message, "pong: hi");
    }

    #[tokio::test]
    async fn create_and_close_environment_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path()).await;
        orch.start_workers().await;

        let resp = orch.create_environment(advanced_env("env1")).await.unwrap();
        assert_eq!(resp.tag, "env1");

        let listed = orch.list_environments().await.unwrap();
        assert!(listed.running.contains(&"env1".to_string()));

        orch.close_environment(CloseEnvironmentRequest { tag: "env1".into() })
            .await
            .unwrap();

        let listed = orch.list_environments().await.unwrap();
        assert!(!listed.running.contains(&"env1".to_string()));
    }

    #[tokio::test]
    async fn closing_unknown_environment_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path()).await;
        orch.start_workers().await;

        let err = orch
            .close_environment(CloseEnvironmentRequest { tag: "nope".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_lab_for_env_publishes_lab_event() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path()).await;
        orch.start_workers().await;

        orch.create_environment(advanced_env("env2")).await.unwrap();

        let mut labs = orch.lab_stream();
        orch.create_lab_for_env(CreateLabForEnvRequest {
            env_tag: "env2".into(),
            is_vpn: false,
        })
        .await
        .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), labs.recv())
            .await
            .expect("lab event within timeout")
            .unwrap();
        assert_eq!(event.env_tag, "env2");
    }

    #[tokio::test]
    async fn beginner_env_rejects_vpn_lab() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_orchestrator(dir.path()).await;
        orch.start_workers().await;

        let mut req = advanced_env("env3");
        req.env_type = EnvType::Beginner;
        req.initial_labs = 0;
        orch.create_environment(req).await.unwrap();

        let err = orch
            .create_lab_for_env(CreateLabForEnvRequest {
                env_tag: "env3".into(),
                is_vpn: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::FailedPrecondition(_)));
    }
}
