//! YAML configuration (§6): one file, loaded once at startup, with relative
//! paths resolved against the file's own directory before anything is
//! validated.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

pub(crate) const DEFAULT_GRPC_PORT: u16 = 50095;
pub(crate) const DEFAULT_MAX_WORKERS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnServiceConfig {
    pub endpoint: String,
    pub port: u16,
    #[serde(rename = "auth-key")]
    pub auth_key: String,
    #[serde(rename = "sign-key")]
    pub sign_key: String,
    #[serde(rename = "wg-conf-dir")]
    pub wg_conf_dir: PathBuf,
    #[serde(rename = "tls-enabled")]
    pub tls_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerRepository {
    pub registry: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub host: String,
    #[serde(rename = "grpcPort", default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(rename = "proxyPort")]
    pub proxy_port: u16,
    #[serde(rename = "listeningIp")]
    pub listening_ip: Option<String>,
    #[serde(rename = "auth-key")]
    pub auth_key: String,
    #[serde(rename = "sign-key")]
    pub sign_key: String,
    #[serde(rename = "max-workers", default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(rename = "file-transfer-root")]
    pub file_transfer_root: PathBuf,
    #[serde(rename = "ova-dir")]
    pub ova_dir: PathBuf,
    /// Required: an agent started without one refuses to come up rather than
    /// silently running state-less.
    #[serde(rename = "state-path")]
    pub state_path: PathBuf,
    #[serde(rename = "vpn-service")]
    pub vpn_service: Option<VpnServiceConfig>,
    #[serde(rename = "docker-repositories", default)]
    pub docker_repositories: Vec<DockerRepository>,
}

fn default_grpc_port() -> u16 {
    DEFAULT_GRPC_PORT
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

/// Load and validate a config from a YAML file, resolving relative paths
/// against the file's own parent directory first.
pub async fn load(path: &Path) -> AgentResult<AgentConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: AgentConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate_paths(&config).await?;
    Ok(config)
}

async fn check_path_exists(path: &Path, label: &str) -> AgentResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| AgentError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(AgentError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

/// `file-transfer-root` and `ova-dir` must already exist; `state-path` is
/// created on demand by the persistence layer instead — an agent's very
/// first boot has nothing to resume from yet.
async fn validate_paths(config: &AgentConfig) -> AgentResult<()> {
    check_path_exists(&config.file_transfer_root, "file-transfer-root").await?;
    check_path_exists(&config.ova_dir, "ova-dir").await?;
    if let Some(vpn) = &config.vpn_service {
        check_path_exists(&vpn.wg_conf_dir, "vpn-service.wg-conf-dir").await?;
    }
    Ok(())
}

impl AgentConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.file_transfer_root);
        resolve(&mut self.ova_dir);
        resolve(&mut self.state_path);
        if let Some(vpn) = &mut self.vpn_service {
            resolve(&mut vpn.wg_conf_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn touch_dirs(dir: &Path, names: &[&str]) {
        for name in names {
            tokio::fs::create_dir_all(dir.join(name)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        touch_dirs(dir.path(), &["ftroot", "ova", "wgconf"]).await;

        let yaml = format!(
            r#"
host: 0.0.0.0
grpcPort: 50095
proxyPort: 8080
listeningIp: 127.0.0.1
auth-key: auth-secret
sign-key: sign-secret
max-workers: 10
file-transfer-root: ftroot
ova-dir: ova
state-path: state
vpn-service:
  endpoint: vpn.internal
  port: 51820
  auth-key: vpn-auth
  sign-key: vpn-sign
  wg-conf-dir: wgconf
  tls-enabled: true
docker-repositories:
  - registry: registry.example.com
    username: bot
    password: hunter2
"#
        );
        let config_path = dir.path().join("config.yml");
        tokio::fs::write(&config_path, &yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.grpc_port, 50095);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.file_transfer_root, dir.path().join("ftroot"));
        assert_eq!(config.state_path, dir.path().join("state"));
        assert_eq!(config.docker_repositories.len(), 1);
        let vpn = config.vpn_service.unwrap();
        assert_eq!(vpn.wg_conf_dir, dir.path().join("wgconf"));
        assert!(vpn.tls_enabled);
    }

    #[tokio::test]
    async fn load_defaults_grpc_port_and_max_workers() {
        let dir = tempfile::tempdir().unwrap();
        touch_dirs(dir.path(), &["ftroot", "ova"]).await;

        let yaml = r#"
host: 0.0.0.0
proxyPort: 8080
auth-key: auth-secret
sign-key: sign-secret
file-transfer-root: ftroot
ova-dir: ova
state-path: state
"#;
        let config_path = dir.path().join("config.yml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.grpc_port, DEFAULT_GRPC_PORT);
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
        assert!(config.vpn_service.is_none());
        assert!(config.docker_repositories.is_empty());
    }

    #[tokio::test]
    async fn load_fails_on_missing_state_path_key() {
        let dir = tempfile::tempdir().unwrap();
        touch_dirs(dir.path(), &["ftroot", "ova"]).await;

        let yaml = r#"
host: 0.0.0.0
proxyPort: 8080
auth-key: auth-secret
sign-key: sign-secret
file-transfer-root: ftroot
ova-dir: ova
"#;
        let config_path = dir.path().join("config.yml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        assert!(load(&config_path).await.is_err());
    }

    #[tokio::test]
    async fn load_fails_on_missing_ova_dir() {
        let dir = tempfile::tempdir().unwrap();
        touch_dirs(dir.path(), &["ftroot"]).await;

        let yaml = r#"
host: 0.0.0.0
proxyPort: 8080
auth-key: auth-secret
sign-key: sign-secret
file-transfer-root: ftroot
ova-dir: ova
state-path: state
"#;
        let config_path = dir.path().join("config.yml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
    }

    #[tokio::test]
    async fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("artifacts");
        tokio::fs::create_dir_all(&sub).await.unwrap();

        let yaml = r#"
host: 0.0.0.0
proxyPort: 8080
auth-key: auth-secret
sign-key: sign-secret
file-transfer-root: artifacts
ova-dir: artifacts
state-path: artifacts/state
"#;
        let config_path = dir.path().join("config.yml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert!(config.file_transfer_root.is_absolute());
        assert_eq!(config.file_transfer_root, sub);
        assert_eq!(config.state_path, sub.join("state"));
    }
}
