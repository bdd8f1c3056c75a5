//! Lab: composition of a virtual network + DNS + DHCP + exercises +
//! frontend VMs.

use std::collections::HashMap;

use agent_collab::{
    ContainerDriver, HypervisorDriver, Machine, MachineState, NetworkId, NetworkSpec,
    NetworkTopology, SharedFolder, VmSpec, WireGuardClient,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::alloc::{LabOctetPool, LabSubnet, VpnIpPool};
use crate::error::{OrchError, OrchResult, combine_errors};
use crate::exercise::{Exercise, ExerciseConfig, ExerciseSnapshot};
use crate::net::{dhcp, dns};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabType {
    Beginner,
    Advanced,
}

/// Per-exercise control verbs for [`Lab::exercise_action`], matching
/// `agent_rpc::ExerciseAction` one-to-one — kept as a separate type so this
/// crate never depends on `agent-rpc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExerciseOp {
    Start,
    Stop,
    Reset,
}

pub struct Frontend {
    pub config: VmSpec,
    pub machine: Machine,
    pub octet: u8,
}

/// iptables rule state for a VPN-enabled lab: which peer allowed-IPs are
/// currently authorised into this lab's subnet, and which (octet, public
/// key) pairs back them, so [`Lab::remove_vpn_peers`] can tear each one
/// down individually.
pub struct VpnLabRules {
    /// `(bucket, host octet, public key)` per peer — the bucket is needed
    /// so [`Lab::remove_vpn_peers`] can hand each octet back to the right
    /// bucket in the environment's `VpnIpPool`.
    pub peer_keys: Vec<(u8, u8, String)>,
    /// Peer `/32`s followed by the lab subnet itself, matching
    /// `CreateVPNConfigs`'s documented return shape.
    pub allowed_ips: Vec<String>,
}

struct LabState {
    frontends: HashMap<u16, Frontend>,
    exercises: HashMap<String, Exercise>,
    disabled_exercises: Vec<String>,
    octets: LabOctetPool,
    dns: Option<Machine>,
    dhcp: Option<Machine>,
    vpn_rules: Option<VpnLabRules>,
    /// The guacamole username created for this lab's RDP connections
    /// (§4.7's "per-lab user"), recorded so later per-VM resets re-link the
    /// same shared folder rather than guessing a path from caller input.
    guac_user: Option<String>,
}

pub struct Lab {
    pub tag: String,
    pub env_tag: String,
    pub lab_type: LabType,
    pub is_vpn: bool,
    pub network: NetworkId,
    pub subnet: LabSubnet,
    state: RwLock<LabState>,
}

impl Lab {
    /// Construction: generate the lab tag, create the virtual network,
    /// allocate an RDP port + paused VM per frontend, and — for beginner
    /// labs — pre-add (but not start) every exercise.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        env_tag: &str,
        lab_type: LabType,
        is_vpn: bool,
        subnet: LabSubnet,
        frontend_specs: Vec<VmSpec>,
        beginner_exercises: Vec<ExerciseConfig>,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
    ) -> OrchResult<Self> {
        let tag = format!("{env_tag}-{}", Uuid::new_v4());

        let topology = if is_vpn {
            NetworkTopology::Vpn
        } else {
            NetworkTopology::Bridge
        };
        let network = containers
            .create_network(&NetworkSpec {
                name: tag.clone(),
                subnet_cidr: subnet.cidr(),
                topology,
            })
            .await
            .map_err(OrchError::from)?;

        let mut octets = LabOctetPool::new_full_reserving(&[2, 3]);
        let mut frontends = HashMap::new();
        for spec in frontend_specs {
            let port = crate::alloc::allocate_rdp_port().await?;
            let octet = octets.allocate()?;
            let (machine, _ip) = hypervisors
                .create_vm(&spec, network, octet)
                .await
                .map_err(OrchError::from)?;
            frontends.insert(port, Frontend { config: spec, machine, octet });
        }

        let mut exercises = HashMap::new();
        for config in beginner_exercises {
            let tag = config.tag.clone();
            exercises.insert(tag, Exercise::new(config));
        }

        Ok(Self {
            tag,
            env_tag: env_tag.to_string(),
            lab_type,
            is_vpn,
            network,
            subnet,
            state: RwLock::new(LabState {
                frontends,
                exercises,
                disabled_exercises: Vec::new(),
                octets,
                dns: None,
                dhcp: None,
                vpn_rules: None,
                guac_user: None,
            }),
        })
    }

    /// (1) refresh DNS, (2) refresh DHCP, (3) start exercises in parallel,
    /// (4) start frontend VMs sequentially.
    pub async fn start(
        &self,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
        file_transfer_root: &str,
    ) -> OrchResult<()> {
        self.refresh_dns(containers).await?;
        self.refresh_dhcp(containers).await?;

        self.start_exercises_locked(containers, hypervisors, file_transfer_root)
            .await?;

        let mut state = self.state.write().await;
        for frontend in state.frontends.values_mut() {
            frontend.machine.start().await.map_err(OrchError::from)?;
        }
        Ok(())
    }

    /// Shared exercise-creation + start path used by both `start()` (all
    /// exercises) and `add_and_start_exercises()` (just the new ones).
    async fn start_exercises_locked(
        &self,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
        file_transfer_root: &str,
    ) -> OrchResult<()> {
        let mut state = self.state.write().await;
        let LabState {
            exercises, octets, ..
        } = &mut *state;

        // Octet allocation is sequential (the pool is a single shared
        // resource); the actual machine boot is the slow part, so once
        // every exercise has its octets it starts concurrently below.
        let mut errors = Vec::new();
        let mut created = Vec::new();
        for (tag, exercise) in exercises.iter_mut() {
            match exercise
                .create(
                    self.network,
                    octets,
                    containers,
                    hypervisors,
                    file_transfer_root,
                    &self.env_tag,
                )
                .await
            {
                Ok(()) => created.push((tag.clone(), exercise)),
                Err(e) => errors.push((tag.clone(), e)),
            }
        }

        let starts = created
            .into_iter()
            .map(|(tag, exercise)| async move { (tag, exercise.start().await) });
        for (tag, result) in futures_util::future::join_all(starts).await {
            if let Err(e) = result {
                errors.push((tag, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(combine_errors("start exercises", errors))
        }
    }

    /// Close old DNS (if any), rebuild the zone from every exercise's DNS
    /// records, start a new DNS container, connect it on octet 3.
    pub async fn refresh_dns(&self, containers: &dyn ContainerDriver) -> OrchResult<()> {
        let mut state = self.state.write().await;
        if let Some(mut old) = state.dns.take() {
            old.close().await.map_err(OrchError::from)?;
        }

        let records: Vec<(String, String)> = state
            .exercises
            .values()
            .flat_map(|e| e.dns_records.iter().cloned())
            .collect();

        let spec = dns::dns_container_spec(&self.tag, &records);
        let (mut machine, _ip) = containers
            .create_container(&spec, self.network, 3)
            .await
            .map_err(OrchError::from)?;
        machine.start().await.map_err(OrchError::from)?;
        state.dns = Some(machine);
        Ok(())
    }

    /// Close old DHCP (if any), rebuild from the lab subnet, start, connect
    /// on octet 2.
    pub async fn refresh_dhcp(&self, containers: &dyn ContainerDriver) -> OrchResult<()> {
        let mut state = self.state.write().await;
        if let Some(mut old) = state.dhcp.take() {
            old.close().await.map_err(OrchError::from)?;
        }

        let spec = dhcp::dhcp_container_spec(&self.tag, &self.subnet);
        let (mut machine, _ip) = containers
            .create_container(&spec, self.network, 2)
            .await
            .map_err(OrchError::from)?;
        machine.start().await.map_err(OrchError::from)?;
        state.dhcp = Some(machine);
        Ok(())
    }

    /// Add exercises to the map, refresh DNS, start just the new ones.
    pub async fn add_and_start_exercises(
        &self,
        configs: Vec<ExerciseConfig>,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
        file_transfer_root: &str,
    ) -> OrchResult<()> {
        {
            let mut state = self.state.write().await;
            let existing: Vec<&str> = state.exercises.keys().map(String::as_str).collect();
            for config in &configs {
                Exercise::check_tag_unique(&config.tag, &existing)?;
            }
            for config in configs {
                let tag = config.tag.clone();
                state.exercises.insert(tag, Exercise::new(config));
            }
        }

        self.refresh_dns(containers).await?;
        self.start_exercises_locked(containers, hypervisors, file_transfer_root)
            .await
    }

    /// Remove one exercise; returns its DNS records so the caller can
    /// trigger a DNS refresh and observe them gone.
    pub async fn remove_exercise(&self, tag: &str) -> OrchResult<()> {
        let mut state = self.state.write().await;
        let mut exercise = state
            .exercises
            .remove(tag)
            .ok_or_else(|| OrchError::NotFound(format!("exercise not found: {tag}")))?;
        for octet in exercise.assigned_octets.drain(..) {
            state.octets.release(octet);
        }
        exercise.close().await
    }

    /// Close the frontend VM bound to `port`, create a fresh one from the
    /// same instance config, start it, and re-link the shared folder.
    pub async fn reset_vm(
        &self,
        port: u16,
        hypervisors: &dyn HypervisorDriver,
        shared_folder: &SharedFolder,
    ) -> OrchResult<()> {
        let mut state = self.state.write().await;
        let (config, octet) = {
            let frontend = state
                .frontends
                .get_mut(&port)
                .ok_or_else(|| OrchError::NotFound(format!("no frontend bound to port {port}")))?;
            frontend.machine.close().await.map_err(OrchError::from)?;
            (frontend.config.clone(), frontend.octet)
        };

        let (mut machine, _ip) = hypervisors
            .create_vm(&config, self.network, octet)
            .await
            .map_err(OrchError::from)?;
        machine.start().await.map_err(OrchError::from)?;
        hypervisors
            .link_shared_folder(&machine.id(), shared_folder)
            .await
            .map_err(OrchError::from)?;

        if let Some(frontend) = state.frontends.get_mut(&port) {
            frontend.machine = machine;
        }
        Ok(())
    }

    /// `ResetLab`: refresh DHCP, refresh DNS, reset every exercise, then
    /// restart every frontend VM per its current state (§4.10/§4.11's
    /// state-aware transition table).
    pub async fn reset(
        &self,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
        file_transfer_root: &str,
    ) -> OrchResult<()> {
        self.refresh_dhcp(containers).await?;
        self.refresh_dns(containers).await?;

        let mut state = self.state.write().await;
        let mut errors = Vec::new();
        {
            let LabState {
                exercises, octets, ..
            } = &mut *state;
            for (tag, exercise) in exercises.iter_mut() {
                if let Err(e) = exercise
                    .reset(
                        self.network,
                        octets,
                        containers,
                        hypervisors,
                        file_transfer_root,
                        &self.env_tag,
                    )
                    .await
                {
                    errors.push((tag.clone(), e));
                }
            }
        }

        for (port, frontend) in state.frontends.iter_mut() {
            if let Err(e) = reset_frontend(frontend, self.network, hypervisors).await {
                errors.push((format!("frontend:{port}"), e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(combine_errors("reset lab", errors))
        }
    }

    /// Per-exercise `Start`/`Stop`/`Reset` (§4.10's "per-exercise controls").
    pub async fn exercise_action(
        &self,
        tag: &str,
        action: ExerciseOp,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
        file_transfer_root: &str,
    ) -> OrchResult<()> {
        let mut state = self.state.write().await;
        let LabState {
            exercises, octets, ..
        } = &mut *state;
        let exercise = exercises
            .get_mut(tag)
            .ok_or_else(|| OrchError::NotFound(format!("exercise not found: {tag}")))?;
        match action {
            ExerciseOp::Start => exercise.start().await,
            ExerciseOp::Stop => exercise.stop().await,
            ExerciseOp::Reset => {
                exercise
                    .reset(
                        self.network,
                        octets,
                        containers,
                        hypervisors,
                        file_transfer_root,
                        &self.env_tag,
                    )
                    .await
            }
        }
    }

    /// Concurrently close all frontend VMs, DHCP, DNS, and every exercise's
    /// machines, then close the virtual network.
    pub async fn close(
        &self,
        containers: &dyn ContainerDriver,
    ) -> OrchResult<()> {
        let mut state = self.state.write().await;

        let mut errors = Vec::new();
        for (port, frontend) in state.frontends.iter_mut() {
            if let Err(e) = frontend.machine.close().await {
                errors.push((format!("frontend:{port}"), OrchError::from(e)));
            }
        }
        if let Some(mut dhcp) = state.dhcp.take()
            && let Err(e) = dhcp.close().await
        {
            errors.push(("dhcp".into(), OrchError::from(e)));
        }
        if let Some(mut dns) = state.dns.take()
            && let Err(e) = dns.close().await
        {
            errors.push(("dns".into(), OrchError::from(e)));
        }
        for (tag, exercise) in state.exercises.iter_mut() {
            if let Err(e) = exercise.close().await {
                errors.push((format!("exercise:{tag}"), e));
            }
        }

        containers
            .remove_network(self.network)
            .await
            .map_err(OrchError::from)?;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(combine_errors("close lab", errors))
        }
    }

    /// For each team slot, pop an octet from the environment's VPN pool,
    /// generate a keypair, register the peer, and render a client config.
    /// Returns `(configs, allowed_ips)` where `allowed_ips` ends with the
    /// lab subnet itself.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_vpn_configs(
        &self,
        wg: &dyn WireGuardClient,
        env_tag: &str,
        host_prefix: (u8, u8),
        team_size: u32,
        server_public_key: &str,
        server_endpoint: &str,
        vpn_pool: &mut VpnIpPool,
    ) -> OrchResult<(Vec<String>, Vec<String>)> {
        if !self.is_vpn {
            return Err(OrchError::FailedPrecondition(
                "lab is not VPN-enabled".into(),
            ));
        }

        let mut state = self.state.write().await;
        if state.vpn_rules.is_some() {
            return Err(OrchError::AlreadyExists(
                "VPN rules already present for this lab".into(),
            ));
        }

        let mut configs = Vec::with_capacity(team_size as usize);
        let mut allowed_ips = Vec::with_capacity(team_size as usize + 1);
        let mut peer_keys = Vec::with_capacity(team_size as usize);

        for _ in 0..team_size {
            let host = vpn_pool.allocate()?;
            let alias = format!("{env_tag}_{}_{}", self.tag, host.octet);
            let private_key = wg.gen_private_key().await.map_err(OrchError::from)?;
            let public_key = wg
                .gen_public_key(&private_key)
                .await
                .map_err(OrchError::from)?;
            let peer_ip = format!(
                "{}.{}.{}.{}/32",
                host_prefix.0,
                host_prefix.1,
                host.third_octet(),
                host.octet
            );
            wg.add_peer(env_tag, &[peer_ip.clone()], &public_key, &alias)
                .await
                .map_err(OrchError::from)?;

            configs.push(render_client_config(
                server_public_key,
                &self.subnet.cidr(),
                server_endpoint,
                &private_key,
            ));
            allowed_ips.push(peer_ip);
            peer_keys.push((host.bucket, host.octet, public_key));
        }
        allowed_ips.push(self.subnet.cidr());

        state.vpn_rules = Some(VpnLabRules {
            peer_keys,
            allowed_ips: allowed_ips.clone(),
        });

        Ok((configs, allowed_ips))
    }

    /// Tear down every VPN peer bound to this lab; returns `(bucket, octet)`
    /// pairs so the caller can hand each one back to the right bucket in
    /// the environment's `VpnIpPool`.
    pub async fn remove_vpn_peers(
        &self,
        wg: &dyn WireGuardClient,
        env_tag: &str,
    ) -> OrchResult<Vec<(u8, u8)>> {
        let mut state = self.state.write().await;
        let Some(rules) = state.vpn_rules.take() else {
            return Ok(Vec::new());
        };

        let mut octets = Vec::with_capacity(rules.peer_keys.len());
        for (bucket, octet, public_key) in rules.peer_keys {
            let alias = format!("{env_tag}_{}_{}", self.tag, octet);
            wg.del_peer(env_tag, &public_key, &alias)
                .await
                .map_err(OrchError::from)?;
            octets.push((bucket, octet));
        }
        Ok(octets)
    }

    pub async fn vpn_allowed_ips(&self) -> Option<Vec<String>> {
        self.state
            .read()
            .await
            .vpn_rules
            .as_ref()
            .map(|r| r.allowed_ips.clone())
    }

    /// RDP connection port list: the frontends map's keys.
    pub async fn rdp_conn_ports(&self) -> Vec<u16> {
        self.state.read().await.frontends.keys().copied().collect()
    }

    /// `(rdp_port, machine_id, subnet host octet)` for every frontend, for
    /// building guacamole RDP connections and shared-folder links.
    pub async fn frontend_machines(&self) -> Vec<(u16, String, u8)> {
        self.state
            .read()
            .await
            .frontends
            .iter()
            .map(|(port, f)| (*port, f.machine.id(), f.octet))
            .collect()
    }

    pub async fn exercise_tags(&self) -> Vec<String> {
        self.state.read().await.exercises.keys().cloned().collect()
    }

    /// Every exercise's `(dns name, ip)` pairs, for `GetHostsInLab` and for
    /// building the zone a fresh `RefreshDNS` would produce.
    pub async fn dns_records(&self) -> Vec<(String, String)> {
        self.state
            .read()
            .await
            .exercises
            .values()
            .flat_map(|e| e.dns_records.iter().cloned())
            .collect()
    }

    pub async fn disabled_exercises(&self) -> Vec<String> {
        self.state.read().await.disabled_exercises.clone()
    }

    pub async fn apply_disabled_exercises(&self, disabled: Vec<String>) {
        self.state.write().await.disabled_exercises = disabled;
    }

    /// Record the guacamole username created for this lab (§4.7); called
    /// once, right after the lab's RDP connections are provisioned.
    pub async fn set_guac_user(&self, username: String) {
        self.state.write().await.guac_user = Some(username);
    }

    pub async fn guac_user(&self) -> Option<String> {
        self.state.read().await.guac_user.clone()
    }

    /// `(container count, VM count)` for `MonitorStream`'s per-host totals.
    pub async fn machine_counts(&self) -> (usize, usize) {
        lab_machine_counts(&self.state.read().await).await
    }

    /// Resolve the iptables-facing peer IPs for `net::iptables::apply_lab_rules`.
    pub async fn vpn_peer_ips_without_subnet(&self) -> Vec<String> {
        let state = self.state.read().await;
        match &state.vpn_rules {
            Some(rules) => rules
                .allowed_ips
                .iter()
                .take(rules.allowed_ips.len().saturating_sub(1))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// On-disk snapshot: enough to resume after a restart — machine ids
    /// (the real container/VM is assumed still alive under that id),
    /// exercise configs, and pool state. Nothing here is re-derived from
    /// the collaborator drivers; resume treats ids as ground truth.
    pub async fn snapshot(&self) -> LabSnapshot {
        let state = self.state.read().await;
        LabSnapshot {
            tag: self.tag.clone(),
            env_tag: self.env_tag.clone(),
            lab_type: self.lab_type,
            is_vpn: self.is_vpn,
            subnet_cidr: self.subnet.cidr(),
            frontends: state
                .frontends
                .iter()
                .map(|(port, f)| FrontendSnapshot {
                    rdp_port: *port,
                    machine_id: f.machine.id(),
                    octet: f.octet,
                    config: f.config.clone(),
                })
                .collect(),
            exercises: state
                .exercises
                .values()
                .map(|e| ExerciseSnapshot {
                    config: e.config.clone(),
                    machine_ids: e.machines.iter().map(Machine::id).collect(),
                    assigned_octets: e.assigned_octets.clone(),
                    dns_records: e.dns_records.clone(),
                    flag_values: e.flag_values.clone(),
                })
                .collect(),
            disabled_exercises: state.disabled_exercises.clone(),
            dns_machine_id: state.dns.as_ref().map(Machine::id),
            dhcp_machine_id: state.dhcp.as_ref().map(Machine::id),
            network_id: self.network.0,
            guac_user: state.guac_user.clone(),
        }
    }

    /// Rebuild a lab from a persisted snapshot: re-attach every frontend,
    /// DNS, and DHCP machine by id, rebuild every exercise the same way,
    /// and reconstruct the octet pool by reserving whatever octets the
    /// snapshot shows in use (frontends reserve `2`/`3` implicitly via
    /// `new_full_reserving`, so only exercise octets need reclaiming).
    pub async fn from_snapshot(
        snapshot: LabSnapshot,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
    ) -> OrchResult<Self> {
        let subnet = LabSubnet::parse(&snapshot.subnet_cidr)
            .ok_or_else(|| OrchError::Internal(format!("bad subnet cidr: {}", snapshot.subnet_cidr)))?;
        let network = NetworkId(snapshot.network_id);

        let mut octets = LabOctetPool::new_full_reserving(&[2, 3]);

        let mut frontends = HashMap::new();
        for fe in snapshot.frontends {
            let machine = hypervisors.attach_vm(&fe.machine_id).await.map_err(OrchError::from)?;
            octets.reserve(fe.octet);
            frontends.insert(
                fe.rdp_port,
                Frontend {
                    config: fe.config,
                    machine,
                    octet: fe.octet,
                },
            );
        }

        let mut exercises = HashMap::new();
        for ex_snapshot in snapshot.exercises {
            for octet in &ex_snapshot.assigned_octets {
                octets.reserve(*octet);
            }
            let tag = ex_snapshot.config.tag.clone();
            let exercise = Exercise::from_snapshot(ex_snapshot, containers, hypervisors).await?;
            exercises.insert(tag, exercise);
        }

        let dns = match snapshot.dns_machine_id {
            Some(id) => Some(containers.attach_container(&id).await.map_err(OrchError::from)?),
            None => None,
        };
        let dhcp = match snapshot.dhcp_machine_id {
            Some(id) => Some(containers.attach_container(&id).await.map_err(OrchError::from)?),
            None => None,
        };

        Ok(Self {
            tag: snapshot.tag,
            env_tag: snapshot.env_tag,
            lab_type: snapshot.lab_type,
            is_vpn: snapshot.is_vpn,
            network,
            subnet,
            state: RwLock::new(LabState {
                frontends,
                exercises,
                disabled_exercises: snapshot.disabled_exercises,
                octets,
                dns,
                dhcp,
                vpn_rules: None,
                guac_user: snapshot.guac_user,
            }),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendSnapshot {
    pub rdp_port: u16,
    pub machine_id: String,
    pub octet: u8,
    pub config: VmSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSnapshot {
    pub tag: String,
    pub env_tag: String,
    pub lab_type: LabType,
    pub is_vpn: bool,
    pub subnet_cidr: String,
    pub frontends: Vec<FrontendSnapshot>,
    pub exercises: Vec<ExerciseSnapshot>,
    pub disabled_exercises: Vec<String>,
    pub dns_machine_id: Option<String>,
    pub dhcp_machine_id: Option<String>,
    pub network_id: u64,
    pub guac_user: Option<String>,
}

/// State-aware frontend reset: whatever state the VM is currently in, it
/// always ends up `Running` (the normalised answer to the suspend-vs-stop
/// ambiguity in the source — see DESIGN.md).
async fn reset_frontend(
    frontend: &mut Frontend,
    network: NetworkId,
    hypervisors: &dyn HypervisorDriver,
) -> OrchResult<()> {
    match frontend.machine.state() {
        MachineState::Running => {
            frontend.machine.stop().await.map_err(OrchError::from)?;
            frontend.machine.start().await.map_err(OrchError::from)?;
        }
        MachineState::Stopped => {
            frontend.machine.start().await.map_err(OrchError::from)?;
        }
        MachineState::Suspended => {
            frontend.machine.start().await.map_err(OrchError::from)?;
            frontend.machine.stop().await.map_err(OrchError::from)?;
            frontend.machine.start().await.map_err(OrchError::from)?;
        }
        MachineState::Created | MachineState::Error => {
            let (machine, _ip) = hypervisors
                .create_vm(&frontend.config, network, frontend.octet)
                .await
                .map_err(OrchError::from)?;
            frontend.machine = machine;
            frontend.machine.start().await.map_err(OrchError::from)?;
        }
    }
    Ok(())
}

/// `(container count, VM count)` across this lab's own DNS/DHCP sidecars,
/// frontend VMs, and exercise machines — for `MonitorStream`'s per-host
/// totals.
pub(crate) async fn lab_machine_counts(state: &LabState) -> (usize, usize) {
    let mut containers = usize::from(state.dns.is_some()) + usize::from(state.dhcp.is_some());
    let mut vms = state.frontends.len();
    for exercise in state.exercises.values() {
        for machine in &exercise.machines {
            match machine.info().kind {
                agent_collab::MachineKind::Container => containers += 1,
                agent_collab::MachineKind::Vm => vms += 1,
            }
        }
    }
    (containers, vms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::LabSubnetPool;
    use crate::exercise::{ExerciseConfig, ExerciseKind};

    fn web_exercise(tag: &str) -> ExerciseConfig {
        ExerciseConfig {
            tag: tag.into(),
            name: tag.into(),
            category: None,
            secret: false,
            org_description: String::new(),
            kind: ExerciseKind::Static {
                flag: "FLAG{x}".into(),
            },
        }
    }

    fn vm_spec() -> VmSpec {
        VmSpec {
            image: "kali".into(),
            memory_mb: 1024,
            cpu: 1.0,
        }
    }

    async fn new_lab(frontends: usize, beginner_exercises: Vec<ExerciseConfig>) -> Lab {
        let mut subnets = LabSubnetPool::new((10, 50));
        let subnet = subnets.allocate().unwrap();
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        Lab::create(
            "e1",
            LabType::Beginner,
            false,
            subnet,
            std::iter::repeat_with(vm_spec).take(frontends).collect(),
            beginner_exercises,
            containers.as_ref(),
            hypervisors.as_ref(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_assigns_one_rdp_port_per_frontend() {
        let lab = new_lab(2, Vec::new()).await;
        assert_eq!(lab.rdp_conn_ports().await.len(), 2);
        assert!(lab.tag.starts_with("e1-"));
    }

    #[tokio::test]
    async fn beginner_exercises_are_preloaded_but_not_started() {
        let lab = new_lab(1, vec![web_exercise("web")]).await;
        assert_eq!(lab.exercise_tags().await, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn start_then_close_leaves_no_machines() {
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        let mut subnets = LabSubnetPool::new((10, 50));
        let subnet = subnets.allocate().unwrap();
        let lab = Lab::create(
            "e1",
            LabType::Beginner,
            false,
            subnet,
            vec![vm_spec()],
            vec![web_exercise("web")],
            containers.as_ref(),
            hypervisors.as_ref(),
        )
        .await
        .unwrap();

        lab.start(containers.as_ref(), hypervisors.as_ref(), "/tmp")
            .await
            .unwrap();
        assert_eq!(lab.rdp_conn_ports().await.len(), 1);

        lab.close(containers.as_ref()).await.unwrap();
        // Frontend ports stay recorded (the lab object itself is discarded
        // by the caller after close); what matters is close didn't error.
        assert_eq!(lab.exercise_tags().await, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn reset_preserves_exercise_tags_and_frontend_ports() {
        let lab = new_lab(2, vec![web_exercise("web"), web_exercise("db")]).await;
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        lab.start(containers.as_ref(), hypervisors.as_ref(), "/tmp")
            .await
            .unwrap();

        let ports_before = {
            let mut p = lab.rdp_conn_ports().await;
            p.sort_unstable();
            p
        };
        let tags_before = {
            let mut t = lab.exercise_tags().await;
            t.sort();
            t
        };

        lab.reset(containers.as_ref(), hypervisors.as_ref(), "/tmp")
            .await
            .unwrap();

        let ports_after = {
            let mut p = lab.rdp_conn_ports().await;
            p.sort_unstable();
            p
        };
        let tags_after = {
            let mut t = lab.exercise_tags().await;
            t.sort();
            t
        };
        assert_eq!(ports_before, ports_after);
        assert_eq!(tags_before, tags_after);
    }

    #[tokio::test]
    async fn add_and_start_exercises_rejects_duplicate_tag() {
        let lab = new_lab(0, vec![web_exercise("web")]).await;
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        let err = lab
            .add_and_start_exercises(
                vec![web_exercise("web")],
                containers.as_ref(),
                hypervisors.as_ref(),
                "/tmp",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn remove_exercise_releases_its_octets_and_drops_dns_records() {
        let lab = new_lab(0, Vec::new()).await;
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        lab.add_and_start_exercises(
            vec![ExerciseConfig {
                tag: "dyn".into(),
                name: "dyn".into(),
                category: None,
                secret: false,
                org_description: String::new(),
                kind: ExerciseKind::Dynamic {
                    instances: vec![crate::exercise::ExerciseInstanceConfig {
                        kind: crate::exercise::InstanceKind::Container,
                        image: "nginx".into(),
                        memory_mb: 64,
                        cpu: 0.25,
                        envs: Vec::new(),
                        children: Vec::new(),
                        records: vec![crate::exercise::DnsRecordConfig {
                            record_type: "A".into(),
                            name: "dyn.local".into(),
                            rdata: None,
                        }],
                    }],
                },
            }],
            containers.as_ref(),
            hypervisors.as_ref(),
            "/tmp",
        )
        .await
        .unwrap();

        assert_eq!(lab.dns_records().await.len(), 1);
        lab.remove_exercise("dyn").await.unwrap();
        assert!(lab.dns_records().await.is_empty());
        assert!(lab.exercise_tags().await.is_empty());
    }

    #[tokio::test]
    async fn vpn_configs_round_trip_through_peer_removal() {
        let lab = new_lab(0, Vec::new()).await;
        assert!(!lab.is_vpn);
        let err = lab
            .create_vpn_configs(
                agent_collab::FakeWireGuardClient::new().as_ref(),
                "e1",
                (10, 0),
                1,
                "server-pub",
                "1.2.3.4:51820",
                &mut crate::alloc::VpnIpPool::new_full(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn vpn_lab_configs_consume_one_octet_per_team_and_append_subnet_last() {
        let mut subnets = LabSubnetPool::new((10, 50));
        let subnet = subnets.allocate().unwrap();
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        let lab = Lab::create(
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

        let wg = agent_collab::FakeWireGuardClient::new();
        let mut pool = crate::alloc::VpnIpPool::new_full();
        let (configs, allowed_ips) = lab
            .create_vpn_configs(wg.as_ref(), "e1", (10, 0), 3, "server-pub", "1.2.3.4:51820", &mut pool)
            .await
            .unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(allowed_ips.len(), 4);
        assert_eq!(allowed_ips.last().unwrap(), &lab.subnet.cidr());

        // A second call without removing peers first is rejected.
        let again = lab
            .create_vpn_configs(wg.as_ref(), "e1", (10, 0), 1, "server-pub", "1.2.3.4:51820", &mut pool)
            .await;
        assert!(matches!(again, Err(OrchError::AlreadyExists(_))));

        let released = lab.remove_vpn_peers(wg.as_ref(), "e1").await.unwrap();
        assert_eq!(released.len(), 3);
        for (bucket, octet) in released {
            pool.release(crate::alloc::vpn_ip::VpnHost { bucket, octet });
        }
        assert!(lab.vpn_allowed_ips().await.is_none());
    }
}

fn render_client_config(
    server_public_key: &str,
    lab_subnet: &str,
    server_endpoint: &str,
    private_key: &str,
) -> String {
    format!(
        "[Interface]\nPrivateKey = {private_key}\n\n[Peer]\nPublicKey = {server_public_key}\nAllowedIPs = {lab_subnet}\nEndpoint = {server_endpoint}\n"
    )
}
