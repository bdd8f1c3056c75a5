//! Startup-time error surface: config loading and the bootstrap path, kept
//! separate from [`agent_rpc::OrchError`] since `clap`/io/yaml failures here
//! never reach an RPC caller — they abort the process before it ever binds
//! a transport.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("config: {0}")]
    Config(String),

    #[error("collaborators: {0}")]
    Collaborators(String),

    #[error(transparent)]
    Orch(#[from] agent_rpc::OrchError),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
