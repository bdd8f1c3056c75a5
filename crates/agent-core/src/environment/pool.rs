//! Process-wide registry of live environments, plus the starting/closing
//! side-sets the RPC handlers use to reject a second `Init`/`Close` for an
//! environment that's already mid-transition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::environment::Environment;
use crate::error::{OrchError, OrchResult};
use crate::lab::Lab;

#[derive(Default)]
pub struct EnvPool {
    envs: RwLock<HashMap<String, Arc<Environment>>>,
    starting: RwLock<HashSet<String>>,
    closing: RwLock<HashSet<String>>,
}

impl EnvPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, env: Arc<Environment>) -> OrchResult<()> {
        let mut envs = self.envs.write().await;
        if envs.contains_key(&env.tag) {
            return Err(OrchError::AlreadyExists(format!(
                "environment already exists: {}",
                env.tag
            )));
        }
        envs.insert(env.tag.clone(), env);
        Ok(())
    }

    pub async fn get(&self, tag: &str) -> Option<Arc<Environment>> {
        self.envs.read().await.get(tag).cloned()
    }

    pub async fn exists(&self, tag: &str) -> bool {
        self.envs.read().await.contains_key(tag)
    }

    pub async fn remove(&self, tag: &str) -> Option<Arc<Environment>> {
        self.envs.write().await.remove(tag)
    }

    pub async fn list_envs(&self) -> Vec<String> {
        self.envs.read().await.keys().cloned().collect()
    }

    /// Scan every environment for a lab with this tag. Takes the pool's
    /// write lock for the duration of the scan: environments are not added
    /// or removed while a lab lookup is in flight, which matters because a
    /// `Close` racing an `AddLab` must never observe a half-registered lab.
    pub async fn get_lab_by_tag(&self, lab_tag: &str) -> Option<(Arc<Environment>, Arc<Lab>)> {
        let envs = self.envs.write().await;
        for env in envs.values() {
            if let Some(lab) = env.get_lab(lab_tag).await {
                return Some((env.clone(), lab));
            }
        }
        None
    }

    pub async fn full_lab_count(&self) -> usize {
        let envs = self.envs.read().await;
        let mut total = 0;
        for env in envs.values() {
            total += env.lab_count().await;
        }
        total
    }

    pub async fn mark_starting(&self, tag: &str) -> OrchResult<()> {
        let mut starting = self.starting.write().await;
        if !starting.insert(tag.to_string()) {
            return Err(OrchError::FailedPrecondition(format!(
                "environment already starting: {tag}"
            )));
        }
        Ok(())
    }

    pub async fn unmark_starting(&self, tag: &str) {
        self.starting.write().await.remove(tag);
    }

    pub async fn is_starting(&self, tag: &str) -> bool {
        self.starting.read().await.contains(tag)
    }

    /// Event tags currently inside `CreateEnvironment`'s critical section,
    /// for `ListEnvironments`'s transient-state display.
    pub async fn list_starting(&self) -> Vec<String> {
        self.starting.read().await.iter().cloned().collect()
    }

    /// Event tags currently inside `CloseEnvironment`'s critical section.
    pub async fn list_closing(&self) -> Vec<String> {
        self.closing.read().await.iter().cloned().collect()
    }

    pub async fn mark_closing(&self, tag: &str) -> OrchResult<()> {
        let mut closing = self.closing.write().await;
        if !closing.insert(tag.to_string()) {
            return Err(OrchError::FailedPrecondition(format!(
                "environment already closing: {tag}"
            )));
        }
        Ok(())
    }

    pub async fn unmark_closing(&self, tag: &str) {
        self.closing.write().await.remove(tag);
    }

    pub async fn is_closing(&self, tag: &str) -> bool {
        self.closing.read().await.contains(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(tag: &str) -> Arc<Environment> {
        Arc::new(Environment::new(
            tag.to_string(),
            crate::lab::LabType::Beginner,
            1,
            (10, 8),
            None,
            Arc::new(crate::guac::GuacamoleInstance::test_stub()),
            Vec::new(),
            Vec::new(),
        ))
    }

    #[tokio::test]
    async fn add_rejects_duplicate_tag() {
        let pool = EnvPool::new();
        pool.add(make_env("evt-1")).await.unwrap();
        let err = pool.add(make_env("evt-1")).await.unwrap_err();
        assert!(matches!(err, OrchError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn mark_starting_is_exclusive() {
        let pool = EnvPool::new();
        pool.mark_starting("evt-1").await.unwrap();
        assert!(pool.mark_starting("evt-1").await.is_err());
        pool.unmark_starting("evt-1").await;
        assert!(pool.mark_starting("evt-1").await.is_ok());
    }

    #[tokio::test]
    async fn remove_drops_env_from_pool() {
        let pool = EnvPool::new();
        pool.add(make_env("evt-1")).await.unwrap();
        assert!(pool.exists("evt-1").await);
        pool.remove("evt-1").await;
        assert!(!pool.exists("evt-1").await);
    }
}
