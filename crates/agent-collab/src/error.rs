#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("hypervisor: {0}")]
    Hypervisor(String),

    #[error("container engine: {0}")]
    Container(String),

    #[error("wireguard service: {0}")]
    WireGuard(String),

    #[error("exercise metadata service: {0}")]
    ExerciseMetadata(String),

    #[error("guacamole: {0}")]
    Guacamole(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CollabError>;
