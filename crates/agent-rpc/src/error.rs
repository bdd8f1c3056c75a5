//! RPC-facing error surface: re-exports the core error type and adds the
//! status-code mapping the transport layer needs, without pulling in any
//! particular RPC framework's status type.

pub use agent_core::{OrchError, OrchResult};

/// The RPC status families named in §4.10/§7, independent of transport.
/// Whatever framework mounts [`crate::OrchestratorService`] maps this onto
/// its own status type (gRPC `tonic::Code`, an HTTP status, whatever).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
    PermissionDenied,
    Unauthenticated,
    Unavailable,
    Internal,
}

/// Map an [`OrchError`] onto its RPC status family. `Collab`/`Io` both
/// surface as `Internal` — the collaborator and persistence layers already
/// carry their own descriptive message, nothing here needs to distinguish
/// them further at the status-code level.
pub fn status_of(err: &OrchError) -> Status {
    match err {
        OrchError::NotFound(_) => Status::NotFound,
        OrchError::AlreadyExists(_) => Status::AlreadyExists,
        OrchError::InvalidArgument(_) => Status::InvalidArgument,
        OrchError::FailedPrecondition(_) => Status::FailedPrecondition,
        OrchError::ResourceExhausted(_) => Status::ResourceExhausted,
        OrchError::PermissionDenied(_) => Status::PermissionDenied,
        OrchError::Unavailable(_) => Status::Unavailable,
        OrchError::Collab(_) | OrchError::Io(_) | OrchError::Internal(_) => Status::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found_status() {
        let err = OrchError::NotFound("env".into());
        assert_eq!(status_of(&err), Status::NotFound);
    }

    #[test]
    fn collab_failure_maps_to_internal() {
        let err = OrchError::Collab(agent_collab::CollabError::Hypervisor("boom".into()));
        assert_eq!(status_of(&err), Status::Internal);
    }
}
