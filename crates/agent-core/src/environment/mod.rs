//! Environment: the top-level container for a running event — its VPN
//! interface, its labs, and the pools they draw from.

pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use agent_collab::{ContainerDriver, VmSpec, WireGuardClient};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::alloc::{VpnIpPool, allocate_vpn_port};
use crate::error::{OrchError, OrchResult, combine_errors};
use crate::exercise::ExerciseConfig;
use crate::guac::{GuacSnapshot, GuacamoleInstance};
use crate::lab::{Lab, LabType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvState {
    Initialised,
    Running,
    Closing,
    Closed,
}

/// Configuration carried in from the `Init`/`NewEnv` request: VPN wiring
/// and the interface this environment's peers dial into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVpnConfig {
    pub interface_name: String,
    pub eth: String,
    pub server_public_key: String,
    pub server_endpoint_host: String,
}

pub struct Environment {
    pub tag: String,
    pub env_type: LabType,
    pub team_size: u32,
    pub host_prefix: (u8, u8),
    pub is_vpn: bool,
    pub vpn: Option<EnvVpnConfig>,
    pub guac: Arc<GuacamoleInstance>,
    /// Frontend VM specs every lab created for this environment (initial or
    /// later, via `CreateLabForEnv`) is built from.
    pub frontend_template: Vec<VmSpec>,
    /// Exercises every beginner lab is pre-loaded with — grows as
    /// `AddExercisesToEnv` runs, so a lab created afterwards starts with the
    /// same exercise set as its siblings.
    exercise_template: RwLock<Vec<ExerciseConfig>>,
    state: RwLock<EnvState>,
    labs: RwLock<HashMap<String, Arc<Lab>>>,
    vpn_ips: RwLock<VpnIpPool>,
    vpn_port: RwLock<Option<u16>>,
}

impl Environment {
    /// `NewEnv`: an environment with no labs yet, `Initialised`. The
    /// guacamole instance is created and configured by the caller first
    /// (§4.6 step 1) since that step is fallible and async; a partially
    /// built guacamole never becomes a partially built `Environment`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tag: String,
        env_type: LabType,
        team_size: u32,
        host_prefix: (u8, u8),
        vpn: Option<EnvVpnConfig>,
        guac: Arc<GuacamoleInstance>,
        frontend_template: Vec<VmSpec>,
        exercise_template: Vec<ExerciseConfig>,
    ) -> Self {
        let is_vpn = vpn.is_some();
        Self {
            tag,
            env_type,
            team_size,
            host_prefix,
            is_vpn,
            vpn,
            guac,
            frontend_template,
            exercise_template: RwLock::new(exercise_template),
            state: RwLock::new(EnvState::Initialised),
            labs: RwLock::new(HashMap::new()),
            vpn_ips: RwLock::new(VpnIpPool::new_full()),
            vpn_port: RwLock::new(None),
        }
    }

    /// The exercise set every new lab should start with — the beginner
    /// template as it currently stands, including anything appended by
    /// `AddExercisesToEnv` since this environment was created.
    pub async fn exercise_template(&self) -> Vec<ExerciseConfig> {
        self.exercise_template.read().await.clone()
    }

    pub async fn extend_exercise_template(&self, exercises: Vec<ExerciseConfig>) {
        self.exercise_template.write().await.extend(exercises);
    }

    pub async fn state(&self) -> EnvState {
        *self.state.read().await
    }

    async fn set_state(&self, new: EnvState) {
        *self.state.write().await = new;
    }

    /// Allocate the VPN UDP port and bring the WireGuard interface up.
    /// No-op for non-VPN environments.
    pub async fn start(&self, wg: &dyn WireGuardClient) -> OrchResult<()> {
        if let Some(vpn) = &self.vpn {
            let port = allocate_vpn_port().await?;
            wg.initialize_interface(
                &format!("{}.{}.0.1/22", self.host_prefix.0, self.host_prefix.1),
                port,
                &vpn.interface_name,
                &vpn.eth,
            )
            .await
            .map_err(OrchError::from)?;
            *self.vpn_port.write().await = Some(port);
        }
        self.set_state(EnvState::Running).await;
        Ok(())
    }

    pub async fn vpn_port(&self) -> Option<u16> {
        *self.vpn_port.read().await
    }

    pub async fn add_lab(&self, lab: Lab) -> Arc<Lab> {
        let lab = Arc::new(lab);
        self.labs.write().await.insert(lab.tag.clone(), lab.clone());
        lab
    }

    pub async fn get_lab(&self, tag: &str) -> Option<Arc<Lab>> {
        self.labs.read().await.get(tag).cloned()
    }

    pub async fn remove_lab(&self, tag: &str) -> Option<Arc<Lab>> {
        self.labs.write().await.remove(tag)
    }

    pub async fn lab_count(&self) -> usize {
        self.labs.read().await.len()
    }

    pub async fn lab_tags(&self) -> Vec<String> {
        self.labs.read().await.keys().cloned().collect()
    }

    /// Every lab currently owned by this environment, for handlers that
    /// broadcast a mutation to all of them (`AddExercisesToEnv`).
    pub async fn labs(&self) -> Vec<Arc<Lab>> {
        self.labs.read().await.values().cloned().collect()
    }

    /// Hand out VPN client configs for a newly created lab's teams.
    pub async fn create_vpn_configs_for_lab(
        &self,
        lab: &Lab,
        wg: &dyn WireGuardClient,
        team_size: u32,
    ) -> OrchResult<(Vec<String>, Vec<String>)> {
        let vpn = self
            .vpn
            .as_ref()
            .ok_or_else(|| OrchError::FailedPrecondition("environment has no VPN config".into()))?;
        let port = self
            .vpn_port()
            .await
            .ok_or_else(|| OrchError::FailedPrecondition("environment VPN not started".into()))?;
        let endpoint = format!("{}:{port}", vpn.server_endpoint_host);
        let mut pool = self.vpn_ips.write().await;
        lab.create_vpn_configs(
            wg,
            &vpn.interface_name,
            self.host_prefix,
            team_size,
            &vpn.server_public_key,
            &endpoint,
            &mut pool,
        )
        .await
    }

    /// `RemoveVpnLabPeers`: tear down a lab's peers and release its octets
    /// back to this environment's pool.
    pub async fn remove_vpn_lab_peers(&self, lab: &Lab, wg: &dyn WireGuardClient) -> OrchResult<()> {
        let vpn = self
            .vpn
            .as_ref()
            .ok_or_else(|| OrchError::FailedPrecondition("environment has no VPN config".into()))?;
        let octets = lab.remove_vpn_peers(wg, &vpn.interface_name).await?;
        let mut pool = self.vpn_ips.write().await;
        for (bucket, octet) in octets {
            pool.release(crate::alloc::vpn_ip::VpnHost { bucket, octet });
        }
        Ok(())
    }

    /// `(container count, VM count)` across every lab plus this
    /// environment's own three guacamole sidecars, for `MonitorStream`.
    pub async fn machine_counts(&self) -> (usize, usize) {
        let labs = self.labs.read().await;
        let mut containers = 3;
        let mut vms = 0;
        for lab in labs.values() {
            let (c, v) = lab.machine_counts().await;
            containers += c;
            vms += v;
        }
        (containers, vms)
    }

    /// Close every lab concurrently, then tear down the VPN interface.
    pub async fn close(
        &self,
        containers: &dyn ContainerDriver,
        wg: Option<&dyn WireGuardClient>,
    ) -> OrchResult<()> {
        self.set_state(EnvState::Closing).await;

        let labs: Vec<Arc<Lab>> = self.labs.write().await.drain().map(|(_, lab)| lab).collect();
        let closes = labs.iter().map(|lab| lab.close(containers));
        let results = futures_util::future::join_all(closes).await;
        let errors: Vec<(String, OrchError)> = labs
            .iter()
            .zip(results)
            .filter_map(|(lab, result)| result.err().map(|e| (lab.tag.clone(), e)))
            .collect();

        if let (Some(vpn), Some(wg)) = (&self.vpn, wg) {
            wg.manage_interface(&vpn.interface_name, agent_collab::InterfaceAction::Down)
                .await
                .map_err(OrchError::from)?;
        }

        if let Err(e) = self.guac.close(containers).await {
            return Err(if errors.is_empty() {
                e
            } else {
                combine_errors("close environment", {
                    let mut errors = errors;
                    errors.push(("guacamole".into(), e));
                    errors
                })
            });
        }

        self.set_state(EnvState::Closed).await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(combine_errors("close environment", errors))
        }
    }

    /// On-disk snapshot: host prefix, VPN bucket contents, guacamole
    /// metadata, and every lab's own snapshot. Read locks are taken
    /// env-then-labs and released before the caller marshals, so a save
    /// never blocks a concurrent RPC for longer than the copy itself takes.
    pub async fn snapshot(&self) -> EnvSnapshot {
        let labs = self.labs.read().await;
        let mut lab_snapshots = Vec::with_capacity(labs.len());
        for lab in labs.values() {
            lab_snapshots.push(lab.snapshot().await);
        }
        EnvSnapshot {
            tag: self.tag.clone(),
            env_type: self.env_type,
            team_size: self.team_size,
            host_prefix: self.host_prefix,
            is_vpn: self.is_vpn,
            vpn: self.vpn.clone(),
            frontend_template: self.frontend_template.clone(),
            exercise_template: self.exercise_template().await,
            state: self.state().await,
            vpn_port: self.vpn_port().await,
            vpn_buckets: self.vpn_ips.read().await.bucket_snapshot(),
            guac: self.guac.snapshot().await,
            labs: lab_snapshots,
        }
    }

    /// Rebuild a running environment from a persisted snapshot: re-attach
    /// the guacamole containers, restore the VPN-IP bucket contents, and
    /// rebuild every lab. The environment is placed directly in `Running`
    /// (or whatever state was persisted) rather than replayed through
    /// `start()` — the WireGuard interface and every container/VM are
    /// assumed still alive under their recorded ids.
    pub async fn from_snapshot(
        snapshot: EnvSnapshot,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn agent_collab::HypervisorDriver,
    ) -> OrchResult<Self> {
        let guac = GuacamoleInstance::from_snapshot(&snapshot.guac, containers).await?;
        let mut buckets: [std::collections::VecDeque<u8>; 4] = Default::default();
        for (i, bucket) in snapshot.vpn_buckets.into_iter().enumerate() {
            if let Some(slot) = buckets.get_mut(i) {
                *slot = bucket.into_iter().collect();
            }
        }

        let env = Self {
            tag: snapshot.tag,
            env_type: snapshot.env_type,
            team_size: snapshot.team_size,
            host_prefix: snapshot.host_prefix,
            is_vpn: snapshot.is_vpn,
            vpn: snapshot.vpn,
            guac: Arc::new(guac),
            frontend_template: snapshot.frontend_template,
            exercise_template: RwLock::new(snapshot.exercise_template),
            state: RwLock::new(snapshot.state),
            labs: RwLock::new(HashMap::new()),
            vpn_ips: RwLock::new(VpnIpPool::from_buckets(buckets)),
            vpn_port: RwLock::new(snapshot.vpn_port),
        };

        for lab_snapshot in snapshot.labs {
            let lab = Lab::from_snapshot(lab_snapshot, containers, hypervisors).await?;
            env.labs.write().await.insert(lab.tag.clone(), Arc::new(lab));
        }

        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::LabSubnetPool;
    use crate::guac::GuacamoleInstance;

    fn non_vpn_env(tag: &str) -> Environment {
        Environment::new(
            tag.into(),
            LabType::Beginner,
            1,
            (10, 0),
            None,
            Arc::new(GuacamoleInstance::test_stub()),
            Vec::new(),
            Vec::new(),
        )
    }

    fn vpn_env(tag: &str) -> Environment {
        Environment::new(
            tag.into(),
            LabType::Advanced,
            2,
            (10, 0),
            Some(EnvVpnConfig {
                interface_name: tag.into(),
                eth: "eth0".into(),
                server_public_key: "server-pub".into(),
                server_endpoint_host: "vpn.example.com".into(),
            }),
            Arc::new(GuacamoleInstance::test_stub()),
            Vec::new(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn new_environment_starts_initialised() {
        let env = non_vpn_env("e1");
        assert_eq!(env.state().await, EnvState::Initialised);
        assert_eq!(env.lab_count().await, 0);
    }

    #[tokio::test]
    async fn start_without_vpn_is_a_noop_that_still_marks_running() {
        let env = non_vpn_env("e1");
        let wg = agent_collab::FakeWireGuardClient::new();
        env.start(wg.as_ref()).await.unwrap();
        assert_eq!(env.state().await, EnvState::Running);
        assert!(env.vpn_port().await.is_none());
    }

    #[tokio::test]
    async fn start_with_vpn_allocates_a_port_and_brings_up_the_interface() {
        let env = vpn_env("e1");
        let wg = agent_collab::FakeWireGuardClient::new();
        env.start(wg.as_ref()).await.unwrap();
        assert_eq!(env.state().await, EnvState::Running);
        let port = env.vpn_port().await.unwrap();
        assert!((5000..6000).contains(&port));
    }

    #[tokio::test]
    async fn add_get_remove_lab_round_trips() {
        let env = non_vpn_env("e1");
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        let mut subnets = LabSubnetPool::new((10, 50));
        let subnet = subnets.allocate().unwrap();
        let lab = crate::lab::Lab::create(
            "e1",
            LabType::Beginner,
            false,
            subnet,
            Vec::new(),
            Vec::new(),
            containers.as_ref(),
            hypervisors.as_ref(),
        )
        .await
        .unwrap();
        let tag = lab.tag.clone();
        env.add_lab(lab).await;

        assert_eq!(env.lab_count().await, 1);
        assert!(env.get_lab(&tag).await.is_some());
        assert!(env.remove_lab(&tag).await.is_some());
        assert_eq!(env.lab_count().await, 0);
    }

    #[tokio::test]
    async fn close_drains_every_lab_and_marks_closed() {
        let env = non_vpn_env("e1");
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        let mut subnets = LabSubnetPool::new((10, 50));
        for _ in 0..3 {
            let subnet = subnets.allocate().unwrap();
            let lab = crate::lab::Lab::create(
                "e1",
                LabType::Beginner,
                false,
                subnet,
                Vec::new(),
                Vec::new(),
                containers.as_ref(),
                hypervisors.as_ref(),
            )
            .await
            .unwrap();
            env.add_lab(lab).await;
        }
        assert_eq!(env.lab_count().await, 3);

        env.close(containers.as_ref(), None).await.unwrap();
        assert_eq!(env.state().await, EnvState::Closed);
        assert_eq!(env.lab_count().await, 0);
    }

    #[tokio::test]
    async fn vpn_lab_lifecycle_returns_octets_on_removal() {
        let env = vpn_env("e1");
        let wg = agent_collab::FakeWireGuardClient::new();
        env.start(wg.as_ref()).await.unwrap();

        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        let mut subnets = LabSubnetPool::new((10, 50));
        let subnet = subnets.allocate().unwrap();
        let lab = crate::lab::Lab::create(
            "e1",
            LabType::Advanced,
            true,
            subnet,
            Vec::new(),
            Vec::new(),
            containers.as_ref(),
            hypervisors.as_ref(),
        )
        .await
        .unwrap();
        let lab = env.add_lab(lab).await;

        let (configs, allowed_ips) = env
            .create_vpn_configs_for_lab(&lab, wg.as_ref(), env.team_size)
            .await
            .unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(allowed_ips.len(), 3);

        env.remove_vpn_lab_peers(&lab, wg.as_ref()).await.unwrap();
        assert!(lab.vpn_allowed_ips().await.is_none());

        // Octets came back: a fresh lab can draw the same number again.
        let lab2 = crate::lab::Lab::create(
            "e1",
            LabType::Advanced,
            true,
            subnets.allocate().unwrap(),
            Vec::new(),
            Vec::new(),
            containers.as_ref(),
            hypervisors.as_ref(),
        )
        .await
        .unwrap();
        let lab2 = env.add_lab(lab2).await;
        let (configs2, _) = env
            .create_vpn_configs_for_lab(&lab2, wg.as_ref(), env.team_size)
            .await
            .unwrap();
        assert_eq!(configs2.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_round_trips_tags_and_state() {
        let env = non_vpn_env("e1");
        let wg = agent_collab::FakeWireGuardClient::new();
        env.start(wg.as_ref()).await.unwrap();

        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        let mut subnets = LabSubnetPool::new((10, 50));
        let subnet = subnets.allocate().unwrap();
        let lab = crate::lab::Lab::create(
            "e1",
            LabType::Beginner,
            false,
            subnet,
            Vec::new(),
            Vec::new(),
            containers.as_ref(),
            hypervisors.as_ref(),
        )
        .await
        .unwrap();
        let lab_tag = lab.tag.clone();
        env.add_lab(lab).await;

        let snapshot = env.snapshot().await;
        assert_eq!(snapshot.tag, "e1");
        assert_eq!(snapshot.state, EnvState::Running);
        assert_eq!(snapshot.labs.len(), 1);
        assert_eq!(snapshot.labs[0].tag, lab_tag);
        assert!(snapshot.vpn_port.is_none());
        assert_eq!(snapshot.vpn_buckets.len(), 4);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub tag: String,
    pub env_type: LabType,
    pub team_size: u32,
    pub host_prefix: (u8, u8),
    pub is_vpn: bool,
    pub vpn: Option<EnvVpnConfig>,
    pub frontend_template: Vec<VmSpec>,
    pub exercise_template: Vec<ExerciseConfig>,
    pub state: EnvState,
    pub vpn_port: Option<u16>,
    pub vpn_buckets: [Vec<u8>; 4],
    pub guac: GuacSnapshot,
    pub labs: Vec<crate::lab::LabSnapshot>,
}
