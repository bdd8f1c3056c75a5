//! Trait interfaces for the external collaborators: hypervisor driver,
//! container engine driver, WireGuard control-plane
//! client, and exercise-metadata service client — plus the `Machine` sum
//! type and in-memory fakes used by tests.

mod container;
mod error;
mod exercise_meta;
mod fakes;
mod hypervisor;
mod machine;
mod metrics;
mod wireguard;

pub use container::{
    ContainerDriver, ContainerSpec, MountSpec, NetworkId, NetworkSpec, NetworkTopology,
    RegistryCredential,
};
pub use error::{CollabError, Result};
pub use exercise_meta::ExerciseMetadataClient;
pub use fakes::{
    FakeContainerDriver, FakeExerciseMetadataClient, FakeHypervisorDriver, FakeMetricsSource,
    FakeWireGuardClient,
};
pub use hypervisor::{HypervisorDriver, SharedFolder, VmSpec};
pub use machine::{Machine, MachineHandle, MachineInfo, MachineKind, MachineState};
pub use metrics::{HostMetrics, MetricsSource};
pub use wireguard::{InterfaceAction, WireGuardClient};
