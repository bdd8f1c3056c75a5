//! Exercise: a named bundle of containers and/or VMs with DNS records and
//! flag environment variables.

use agent_collab::{
    ContainerDriver, ContainerSpec, HypervisorDriver, Machine, MachineState, MountSpec, NetworkId,
    VmSpec,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alloc::LabOctetPool;
use crate::error::{OrchError, OrchResult, combine_errors};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Category {
    pub tag: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceKind {
    Container,
    Vm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecordConfig {
    pub record_type: String,
    pub name: String,
    /// `None` for an A record whose value is the instance's assigned IP —
    /// filled in once the machine is created.
    pub rdata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlagSource {
    Static(String),
    Generated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildChallenge {
    pub tag: String,
    pub name: String,
    pub env_var: String,
    pub flag: FlagSource,
    pub points: u32,
    pub category: String,
    pub team_description: String,
    pub prerequisites: Vec<String>,
    pub outcomes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseInstanceConfig {
    pub kind: InstanceKind,
    pub image: String,
    pub memory_mb: u32,
    pub cpu: f64,
    pub envs: Vec<(String, String)>,
    pub children: Vec<ChildChallenge>,
    pub records: Vec<DnsRecordConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExerciseKind {
    /// No running machine — just a tag and a flag.
    Static { flag: String },
    Dynamic { instances: Vec<ExerciseInstanceConfig> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseConfig {
    pub tag: String,
    pub name: String,
    pub category: Option<Category>,
    pub secret: bool,
    pub org_description: String,
    pub kind: ExerciseKind,
}

/// Live exercise state: the config plus whatever machines/octets/flags were
/// materialised from it.
pub struct Exercise {
    pub config: ExerciseConfig,
    pub machines: Vec<Machine>,
    /// Host octets drawn from the lab subnet, one per dynamic instance, in
    /// the same order as `config`'s instance list. Reused verbatim on
    /// reset; drawn fresh on first creation.
    pub assigned_octets: Vec<u8>,
    /// `(dns name, ip)` pairs contributed to the lab's zone file.
    pub dns_records: Vec<(String, String)>,
    /// `(child tag, flag value)` — generated once, stable across resets.
    pub flag_values: Vec<(String, String)>,
}

impl Exercise {
    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    /// Construct with no machines yet; `create()` materialises them.
    pub fn new(config: ExerciseConfig) -> Self {
        let flag_values = generate_flags(&config);
        Self {
            config,
            machines: Vec::new(),
            assigned_octets: Vec::new(),
            dns_records: Vec::new(),
            flag_values,
        }
    }

    /// Validate tag uniqueness across a set of already-present tags.
    pub fn check_tag_unique(tag: &str, existing: &[&str]) -> OrchResult<()> {
        if existing.contains(&tag) {
            return Err(OrchError::AlreadyExists(format!(
                "exercise tag already present in lab: {tag}"
            )));
        }
        Ok(())
    }

    /// Build container/VM specs and create the machines, assigning lab
    /// subnet host octets — reusing `assigned_octets` if already populated
    /// (a reset), otherwise drawing fresh ones from `octets`.
    pub async fn create(
        &mut self,
        network: NetworkId,
        octets: &mut LabOctetPool,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
        file_transfer_root: &str,
        env_tag: &str,
    ) -> OrchResult<()> {
        self.machines.clear();
        self.dns_records.clear();

        let ExerciseKind::Dynamic { instances } = &self.config.kind else {
            // Static challenge: tag + flag only, nothing to materialise.
            return Ok(());
        };

        let reuse = !self.assigned_octets.is_empty();
        let mut octets_out = Vec::with_capacity(instances.len());

        for (idx, instance) in instances.iter().enumerate() {
            let octet = if reuse {
                *self
                    .assigned_octets
                    .get(idx)
                    .ok_or_else(|| OrchError::Internal("octet/instance count mismatch".into()))?
            } else {
                octets.allocate()?
            };
            octets_out.push(octet);

            let mut envs = instance.envs.clone();
            for child in &instance.children {
                let value = self
                    .flag_values
                    .iter()
                    .find(|(tag, _)| tag == &child.tag)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                envs.push((child.env_var.clone(), value));
            }

            let (machine, ip) = match instance.kind {
                InstanceKind::Container => {
                    let spec = ContainerSpec {
                        image: instance.image.clone(),
                        name: format!("{}-{}-{idx}", env_tag, self.config.tag),
                        env: envs,
                        labels: vec![("exercise".into(), self.config.tag.clone())],
                        mounts: Vec::<MountSpec>::new(),
                        dns_aliases: instance
                            .records
                            .iter()
                            .map(|r| r.name.clone())
                            .collect(),
                        run_as: None,
                    };
                    containers
                        .create_container(&spec, network, octet)
                        .await
                        .map_err(OrchError::from)?
                }
                InstanceKind::Vm => {
                    let spec = VmSpec {
                        image: instance.image.clone(),
                        memory_mb: instance.memory_mb,
                        cpu: instance.cpu,
                    };
                    hypervisors
                        .create_vm(&spec, network, octet)
                        .await
                        .map_err(OrchError::from)?
                }
            };

            for record in &instance.records {
                let rdata = record.rdata.clone().unwrap_or_else(|| ip.clone());
                self.dns_records.push((record.name.clone(), rdata));
            }

            self.machines.push(machine);
            let _ = file_transfer_root; // reserved for future per-exercise shared folders
        }

        self.assigned_octets = octets_out;
        Ok(())
    }

    /// Start every non-running machine concurrently; combine failures into
    /// one error without rolling back machines that did start.
    pub async fn start(&mut self) -> OrchResult<()> {
        let mut futures = Vec::new();
        for (idx, machine) in self.machines.iter_mut().enumerate() {
            if machine.state() != MachineState::Running {
                futures.push(async move {
                    let result = machine.start().await;
                    (idx, result)
                });
            }
        }
        let results = futures_util::future::join_all(futures).await;
        let errors: Vec<(String, OrchError)> = results
            .into_iter()
            .filter_map(|(idx, result)| result.err().map(|e| (format!("machine[{idx}]"), e.into())))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(combine_errors("start exercise", errors))
        }
    }

    /// Stop every machine sequentially.
    pub async fn stop(&mut self) -> OrchResult<()> {
        for machine in &mut self.machines {
            machine.stop().await.map_err(OrchError::from)?;
        }
        Ok(())
    }

    /// Close every machine concurrently, then clear the machines list.
    pub async fn close(&mut self) -> OrchResult<()> {
        let mut futures = Vec::new();
        for machine in self.machines.drain(..) {
            futures.push(async move {
                let mut machine = machine;
                machine.close().await
            });
        }
        let results = futures_util::future::join_all(futures).await;
        let errors: Vec<(String, OrchError)> = results
            .into_iter()
            .enumerate()
            .filter_map(|(idx, result)| result.err().map(|e| (format!("machine[{idx}]"), e.into())))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(combine_errors("close exercise", errors))
        }
    }

    /// Rebuild live state from a persisted snapshot: re-attach every
    /// machine by id (container or VM, per the matching instance's
    /// `kind`), restoring DNS records and flag values verbatim rather than
    /// regenerating them — flag values in particular must stay stable
    /// across a restart.
    pub async fn from_snapshot(
        snapshot: ExerciseSnapshot,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
    ) -> OrchResult<Self> {
        let mut machines = Vec::with_capacity(snapshot.machine_ids.len());
        let instances: &[ExerciseInstanceConfig] = match &snapshot.config.kind {
            ExerciseKind::Dynamic { instances } => instances,
            ExerciseKind::Static { .. } => &[],
        };
        for (id, instance) in snapshot.machine_ids.iter().zip(instances.iter()) {
            let machine = match instance.kind {
                InstanceKind::Container => containers.attach_container(id).await,
                InstanceKind::Vm => hypervisors.attach_vm(id).await,
            }
            .map_err(OrchError::from)?;
            machines.push(machine);
        }

        Ok(Self {
            config: snapshot.config,
            machines,
            assigned_octets: snapshot.assigned_octets,
            dns_records: snapshot.dns_records,
            flag_values: snapshot.flag_values,
        })
    }

    /// `Reset` = `Close` then `Create` then `Start`.
    pub async fn reset(
        &mut self,
        network: NetworkId,
        octets: &mut LabOctetPool,
        containers: &dyn ContainerDriver,
        hypervisors: &dyn HypervisorDriver,
        file_transfer_root: &str,
        env_tag: &str,
    ) -> OrchResult<()> {
        self.close().await?;
        self.create(
            network,
            octets,
            containers,
            hypervisors,
            file_transfer_root,
            env_tag,
        )
        .await?;
        self.start().await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseSnapshot {
    pub config: ExerciseConfig,
    pub machine_ids: Vec<String>,
    pub assigned_octets: Vec<u8>,
    pub dns_records: Vec<(String, String)>,
    pub flag_values: Vec<(String, String)>,
}

/// Each child challenge either carries a static flag or gets a fresh
/// unguessable value (a UUIDv4, unguessable enough for a training flag).
fn generate_flags(config: &ExerciseConfig) -> Vec<(String, String)> {
    let ExerciseKind::Dynamic { instances } = &config.kind else {
        return Vec::new();
    };
    instances
        .iter()
        .flat_map(|i| i.children.iter())
        .map(|child| {
            let value = match &child.flag {
                FlagSource::Static(value) => value.clone(),
                FlagSource::Generated => Uuid::new_v4().to_string(),
            };
            (child.tag.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_exercise(tag: &str) -> Exercise {
        Exercise::new(ExerciseConfig {
            tag: tag.into(),
            name: tag.into(),
            category: None,
            secret: false,
            org_description: String::new(),
            kind: ExerciseKind::Static {
                flag: "FLAG{static}".into(),
            },
        })
    }

    #[test]
    fn tag_uniqueness_rejects_duplicate() {
        let existing = vec!["web", "db"];
        assert!(Exercise::check_tag_unique("web", &existing).is_err());
        assert!(Exercise::check_tag_unique("ftp", &existing).is_ok());
    }

    #[tokio::test]
    async fn static_exercise_create_is_noop() {
        let mut ex = static_exercise("static1");
        let mut octets = LabOctetPool::new_full();
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        ex.create(
            NetworkId(0),
            &mut octets,
            containers.as_ref(),
            hypervisors.as_ref(),
            "/tmp",
            "env1",
        )
        .await
        .unwrap();
        assert!(ex.machines.is_empty());
    }

    #[tokio::test]
    async fn dynamic_exercise_creates_one_machine_per_instance() {
        let mut ex = Exercise::new(ExerciseConfig {
            tag: "web".into(),
            name: "web".into(),
            category: None,
            secret: false,
            org_description: String::new(),
            kind: ExerciseKind::Dynamic {
                instances: vec![ExerciseInstanceConfig {
                    kind: InstanceKind::Container,
                    image: "nginx".into(),
                    memory_mb: 128,
                    cpu: 0.5,
                    envs: Vec::new(),
                    children: vec![ChildChallenge {
                        tag: "web-1".into(),
                        name: "flag one".into(),
                        env_var: "FLAG".into(),
                        flag: FlagSource::Generated,
                        points: 10,
                        category: "web".into(),
                        team_description: String::new(),
                        prerequisites: Vec::new(),
                        outcomes: Vec::new(),
                    }],
                    records: vec![DnsRecordConfig {
                        record_type: "A".into(),
                        name: "web.local".into(),
                        rdata: None,
                    }],
                }],
            },
        });

        let mut octets = LabOctetPool::new_full();
        let containers = agent_collab::FakeContainerDriver::new();
        let hypervisors = agent_collab::FakeHypervisorDriver::new();
        ex.create(
            NetworkId(0),
            &mut octets,
            containers.as_ref(),
            hypervisors.as_ref(),
            "/tmp",
            "env1",
        )
        .await
        .unwrap();

        assert_eq!(ex.machines.len(), 1);
        assert_eq!(ex.dns_records.len(), 1);
        assert_eq!(ex.dns_records[0].0, "web.local");
        assert_eq!(ex.assigned_octets.len(), 1);
        assert_eq!(ex.flag_values.len(), 1);

        ex.start().await.unwrap();
        assert_eq!(ex.machines[0].state(), MachineState::Running);

        let prior_octet = ex.assigned_octets[0];
        ex.close().await.unwrap();
        assert!(ex.machines.is_empty());

        // Recreate without clearing assigned_octets: must reuse, not draw fresh.
        ex.create(
            NetworkId(0),
            &mut octets,
            containers.as_ref(),
            hypervisors.as_ref(),
            "/tmp",
            "env1",
        )
        .await
        .unwrap();
        assert_eq!(ex.assigned_octets[0], prior_octet);
    }
}
