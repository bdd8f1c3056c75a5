/// Error taxonomy for the orchestration core.
///
/// Variants line up with the RPC status families the surface maps onto:
/// each is "not recovered locally" except through the caller re-issuing a
/// different request. Transient failures (guacamole retry, hypervisor
/// timeout) are swallowed by the collaborator layer and never reach here.
#[derive(Debug, thiserror::Error)]
pub enum OrchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator failure: {0}")]
    Collab(#[from] agent_collab::CollabError),

    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type OrchResult<T> = std::result::Result<T, OrchError>;

/// Combine multiple failures from a parallel step into one error, per
/// the "partial failures... combined into a single error listing each
/// failure" requirement. `context` names the step (e.g. "start exercises").
pub fn combine_errors(context: &str, errors: Vec<(String, OrchError)>) -> OrchError {
    let detail = errors
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ");
    OrchError::Internal(format!("{context} failed for: {detail}"))
}
