//! Crash-safe pool persistence: serialise every environment to
//! `${state_path}/state.json` after each state-mutating RPC, and rebuild the
//! pool from that file on startup.
//!
//! The write side follows one fixed lock sequence — pool read lock, then
//! each environment's own read locks, down through its labs — marshal, then
//! release every lock before touching the filesystem. A reader of the file
//! therefore only ever observes state some caller already committed and
//! released; nothing is captured mid-mutation.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::environment::EnvSnapshot;
use crate::environment::pool::EnvPool;
use crate::error::{OrchError, OrchResult};

const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolSnapshot {
    pub envs: Vec<EnvSnapshot>,
}

/// Marshal every environment currently in `pool` and write it to
/// `${state_dir}/state.json`, atomically. Locks are all released (the
/// snapshots are plain owned data) before the write begins.
pub async fn save_snapshot(pool: &EnvPool, state_dir: &Path) -> OrchResult<()> {
    let mut envs = Vec::new();
    for tag in pool.list_envs().await {
        if let Some(env) = pool.get(&tag).await {
            envs.push(env.snapshot().await);
        }
    }
    let snapshot = PoolSnapshot { envs };
    write_atomic(state_dir, &snapshot).await
}

/// Read and deserialise `${state_dir}/state.json`, if present. A missing
/// file is not an error — a fresh agent with no prior state starts empty.
pub async fn load_snapshot(state_dir: &Path) -> OrchResult<Option<PoolSnapshot>> {
    let path = state_dir.join(STATE_FILE);
    match fs::read(&path).await {
        Ok(bytes) => {
            let snapshot: PoolSnapshot = serde_json::from_slice(&bytes)
                .map_err(|e| OrchError::Internal(format!("corrupt state file {path:?}: {e}")))?;
            Ok(Some(snapshot))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OrchError::Io(e)),
    }
}

/// Write-temp-then-rename: a crash mid-write leaves the previous
/// `state.json` intact, never a half-written one.
async fn write_atomic(state_dir: &Path, snapshot: &PoolSnapshot) -> OrchResult<()> {
    fs::create_dir_all(state_dir).await.map_err(OrchError::Io)?;
    let final_path = state_dir.join(STATE_FILE);
    let tmp_path = state_dir.join(format!("{STATE_FILE}.tmp-{}", uuid::Uuid::new_v4()));

    let body = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| OrchError::Internal(format!("marshal state snapshot: {e}")))?;
    fs::write(&tmp_path, &body).await.map_err(OrchError::Io)?;
    fs::rename(&tmp_path, &final_path).await.map_err(OrchError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::guac::GuacamoleInstance;
    use std::sync::Arc;

    #[tokio::test]
    async fn round_trips_an_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = EnvPool::new();
        save_snapshot(&pool, dir.path()).await.unwrap();

        let loaded = load_snapshot(dir.path()).await.unwrap().unwrap();
        assert!(loaded.envs.is_empty());
    }

    #[tokio::test]
    async fn missing_state_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_snapshot(dir.path()).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn persists_an_environment_with_no_labs() {
        let dir = tempfile::tempdir().unwrap();
        let pool = EnvPool::new();
        let env = Arc::new(Environment::new(
            "evt-1".into(),
            crate::lab::LabType::Beginner,
            1,
            (10, 8),
            None,
            Arc::new(GuacamoleInstance::test_stub()),
            Vec::new(),
            Vec::new(),
        ));
        pool.add(env).await.unwrap();

        save_snapshot(&pool, dir.path()).await.unwrap();
        let loaded = load_snapshot(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.envs.len(), 1);
        assert_eq!(loaded.envs[0].tag, "evt-1");
    }
}
