//! Guacamole instance: three sidecar containers (`guacd`, `db`, `web`)
//! fronting RDP connections through a web UI, plus the thin HTTP client that
//! drives the embedded `web` container's REST API.
//!
//! Internal to the agent — not part of its external contract (§6) — but
//! fully in-scope functionality (§4.7), so it gets the same error handling
//! and retry discipline as everything else here.

use std::time::Duration;

use agent_collab::{ContainerDriver, ContainerSpec, Machine, NetworkId, NetworkSpec, NetworkTopology};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::{OrchError, OrchResult};

const GUACD_IMAGE: &str = "guacamole/guacd:1.2.0";
const DB_IMAGE: &str = "aaunetworksecurity/guacamole-mysql";
const WEB_IMAGE: &str = "registry.gitlab.com/haaukins/core-utils/guacamole";
const DEFAULT_ADMIN_USER: &str = "guacadmin";
const DEFAULT_ADMIN_PASS: &str = "guacadmin";
const LOGIN_POLL_TOTAL: Duration = Duration::from_secs(120);
const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_AUTH_RETRIES: u32 = 3;

/// RDP connection resolution/color-depth, constrained to the values the
/// guacamole RDP parameter actually accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorDepth {
    Eight,
    Sixteen,
    TwentyFour,
    ThirtyTwo,
}

impl ColorDepth {
    fn as_param(self) -> &'static str {
        match self {
            ColorDepth::Eight => "8",
            ColorDepth::Sixteen => "16",
            ColorDepth::TwentyFour => "24",
            ColorDepth::ThirtyTwo => "32",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RdpConnectionRequest {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub resolution: (u32, u32),
    pub color_depth: ColorDepth,
    pub max_connections: u32,
    pub enable_drive: bool,
    pub drive_path: Option<String>,
}

/// On-disk metadata for one environment's guacamole instance: enough to
/// re-attach the three containers and re-authenticate on resume (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuacSnapshot {
    pub web_port: u16,
    pub admin_pass: String,
    pub mysql_pass: String,
    pub guacd_id: String,
    pub db_id: String,
    pub web_id: String,
    pub network_id: u64,
}

/// The three sidecar containers plus the web UI's admin session, held for
/// the lifetime of one environment.
pub struct GuacamoleInstance {
    pub web_port: u16,
    admin_pass: String,
    mysql_pass: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    guacd: RwLock<Option<Machine>>,
    db: RwLock<Option<Machine>>,
    web: RwLock<Option<Machine>>,
    network: NetworkId,
}

impl GuacamoleInstance {
    /// `NewGuac`: create the three containers, connect their network
    /// aliases, then poll login for up to 120s and rotate the admin
    /// password to a value known only in memory.
    pub async fn create(
        env_tag: &str,
        file_transfer_root: &str,
        containers: &dyn ContainerDriver,
    ) -> OrchResult<Self> {
        let admin_pass = Uuid::new_v4().to_string();
        let mysql_pass = Uuid::new_v4().to_string();
        let guacd_alias = Uuid::new_v4().to_string();
        let db_alias = Uuid::new_v4().to_string();

        let network = containers
            .create_network(&NetworkSpec {
                name: format!("{env_tag}-guac"),
                subnet_cidr: "172.30.0.0/24".into(),
                topology: NetworkTopology::Bridge,
            })
            .await
            .map_err(OrchError::from)?;

        let run_as = Some((users_uid(), users_gid()));
        let guacd_spec = ContainerSpec {
            image: GUACD_IMAGE.into(),
            name: format!("{env_tag}-guacd"),
            env: Vec::new(),
            labels: vec![("hkn".into(), "guacamole_guacd".into())],
            mounts: vec![agent_collab::MountSpec {
                host_path: format!("{file_transfer_root}/{env_tag}/"),
                container_path: "/home/".into(),
                read_only: false,
            }],
            dns_aliases: vec![guacd_alias.clone()],
            run_as,
        };
        let (mut guacd, _) = containers
            .create_container(&guacd_spec, network, 10)
            .await
            .map_err(OrchError::from)?;
        guacd.start().await.map_err(OrchError::from)?;

        let db_spec = ContainerSpec {
            image: DB_IMAGE.into(),
            name: format!("{env_tag}-guac-db"),
            env: vec![
                ("MYSQL_ROOT_PASSWORD".into(), Uuid::new_v4().to_string()),
                ("MYSQL_DATABASE".into(), "guacamole_db".into()),
                ("MYSQL_USER".into(), "guacamole_user".into()),
                ("MYSQL_PASSWORD".into(), mysql_pass.clone()),
            ],
            labels: vec![("hkn".into(), "guacamole_db".into())],
            mounts: Vec::new(),
            dns_aliases: vec![db_alias.clone()],
            run_as: None,
        };
        let (mut db, _) = containers
            .create_container(&db_spec, network, 11)
            .await
            .map_err(OrchError::from)?;
        db.start().await.map_err(OrchError::from)?;

        let web_port = crate::alloc::allocate_rdp_port().await?;
        let web_spec = ContainerSpec {
            image: WEB_IMAGE.into(),
            name: format!("{env_tag}-guac-web"),
            env: vec![
                ("MYSQL_DATABASE".into(), "guacamole_db".into()),
                ("MYSQL_USER".into(), "guacamole_user".into()),
                ("MYSQL_PASSWORD".into(), mysql_pass.clone()),
                ("GUACD_HOSTNAME".into(), guacd_alias),
                ("MYSQL_HOSTNAME".into(), db_alias),
            ],
            labels: vec![("hkn".into(), "guacamole_web".into())],
            mounts: Vec::new(),
            dns_aliases: Vec::new(),
            run_as: None,
        };
        let (mut web, _) = containers
            .create_container(&web_spec, network, 12)
            .await
            .map_err(OrchError::from)?;
        web.start().await.map_err(OrchError::from)?;

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OrchError::Internal(format!("guacamole http client: {e}")))?;

        let instance = Self {
            web_port,
            admin_pass,
            mysql_pass,
            http,
            token: RwLock::new(None),
            guacd: RwLock::new(Some(guacd)),
            db: RwLock::new(Some(db)),
            web: RwLock::new(Some(web)),
            network,
        };

        instance.configure_instance().await?;
        Ok(instance)
    }

    /// Rebuild a guacamole handle from a persisted snapshot: re-attach the
    /// three containers by id (assumed still alive on the host) and
    /// re-authenticate with the persisted admin password rather than the
    /// default — the admin password was already rotated the first time this
    /// instance was created.
    pub async fn from_snapshot(
        snapshot: &GuacSnapshot,
        containers: &dyn ContainerDriver,
    ) -> OrchResult<Self> {
        let guacd = containers
            .attach_container(&snapshot.guacd_id)
            .await
            .map_err(OrchError::from)?;
        let db = containers
            .attach_container(&snapshot.db_id)
            .await
            .map_err(OrchError::from)?;
        let web = containers
            .attach_container(&snapshot.web_id)
            .await
            .map_err(OrchError::from)?;

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OrchError::Internal(format!("guacamole http client: {e}")))?;

        let instance = Self {
            web_port: snapshot.web_port,
            admin_pass: snapshot.admin_pass.clone(),
            mysql_pass: snapshot.mysql_pass.clone(),
            http,
            token: RwLock::new(None),
            guacd: RwLock::new(Some(guacd)),
            db: RwLock::new(Some(db)),
            web: RwLock::new(Some(web)),
            network: NetworkId(snapshot.network_id),
        };

        let token = instance
            .login(DEFAULT_ADMIN_USER, &instance.admin_pass.clone())
            .await?;
        *instance.token.write().await = Some(token);
        Ok(instance)
    }

    pub async fn snapshot(&self) -> GuacSnapshot {
        GuacSnapshot {
            web_port: self.web_port,
            admin_pass: self.admin_pass.clone(),
            mysql_pass: self.mysql_pass.clone(),
            guacd_id: self
                .guacd
                .read()
                .await
                .as_ref()
                .map(Machine::id)
                .unwrap_or_default(),
            db_id: self.db.read().await.as_ref().map(Machine::id).unwrap_or_default(),
            web_id: self.web.read().await.as_ref().map(Machine::id).unwrap_or_default(),
            network_id: self.network.0,
        }
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.web_port)
    }

    /// Poll login at `guacadmin/guacadmin` for up to 120s, then rotate the
    /// admin password to `self.admin_pass`.
    async fn configure_instance(&self) -> OrchResult<()> {
        let deadline = tokio::time::Instant::now() + LOGIN_POLL_TOTAL;
        let mut last_err = None;
        loop {
            match self.login(DEFAULT_ADMIN_USER, DEFAULT_ADMIN_PASS).await {
                Ok(token) => {
                    *self.token.write().await = Some(token);
                    last_err = None;
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    sleep(LOGIN_POLL_INTERVAL).await;
                }
            }
        }
        if let Some(e) = last_err {
            return Err(OrchError::Internal(format!(
                "guacamole never accepted default credentials within 120s: {e}"
            )));
        }

        self.change_admin_password(&self.admin_pass.clone()).await
    }

    async fn login(&self, username: &str, password: &str) -> OrchResult<String> {
        let endpoint = format!("{}/guacamole/api/tokens", self.base_url());
        let resp = self
            .http
            .post(endpoint)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(|e| OrchError::Internal(format!("guacamole login: {e}")))?;

        if !is_expected_status(resp.status()) {
            return Err(OrchError::Internal(format!(
                "guacamole login: unexpected status {}",
                resp.status()
            )));
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            message: Option<String>,
            #[serde(rename = "authToken")]
            auth_token: Option<String>,
        }
        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|e| OrchError::Internal(format!("guacamole login decode: {e}")))?;
        if let Some(message) = body.message {
            return Err(OrchError::Internal(format!("guacamole login: {message}")));
        }
        body.auth_token
            .ok_or_else(|| OrchError::Internal("guacamole login: malformed response".into()))
    }

    async fn change_admin_password(&self, new_pass: &str) -> OrchResult<()> {
        let old_pass = DEFAULT_ADMIN_PASS.to_string();
        let new_pass = new_pass.to_string();
        self.auth_action("change admin password", move |token, http, base| {
            let old_pass = old_pass.clone();
            let new_pass = new_pass.clone();
            Box::pin(async move {
                let endpoint = format!(
                    "{base}/guacamole/api/session/data/mysql/users/guacadmin/password?token={token}"
                );
                http.put(endpoint)
                    .json(&serde_json::json!({
                        "newPassword": new_pass,
                        "oldPassword": old_pass,
                    }))
                    .send()
                    .await
                    .map_err(|e| OrchError::Internal(format!("guacamole change password: {e}")))
            })
        })
        .await?;
        Ok(())
    }

    /// `CreateUser`: a per-lab user. Matches §4.7's "create per-lab user
    /// (uuid/uuid)" — password generation is the caller's responsibility so
    /// it can be recorded in the lab snapshot.
    pub async fn create_user(&self, name: &str, password: &str) -> OrchResult<()> {
        let name = name.to_string();
        let password = password.to_string();
        self.auth_action("create user", move |token, http, base| {
            let name = name.clone();
            let password = password.clone();
            Box::pin(async move {
                let endpoint = format!("{base}/guacamole/api/session/data/mysql/users?token={token}");
                http.post(endpoint)
                    .json(&serde_json::json!({
                        "username": name,
                        "password": password,
                        "attributes": {},
                    }))
                    .send()
                    .await
                    .map_err(|e| OrchError::Internal(format!("guacamole create user: {e}")))
            })
        })
        .await?;
        Ok(())
    }

    /// `CreateRDPConnection`: returns the connection id.
    pub async fn create_rdp_connection(&self, req: RdpConnectionRequest) -> OrchResult<String> {
        let req = req.clone();
        let body = self
            .auth_action("create rdp connection", move |token, http, base| {
                let req = req.clone();
                Box::pin(async move {
                    let endpoint =
                        format!("{base}/guacamole/api/session/data/mysql/connections?token={token}");
                    let mut parameters = serde_json::json!({
                        "hostname": req.host,
                        "port": req.port.to_string(),
                        "width": req.resolution.0.to_string(),
                        "height": req.resolution.1.to_string(),
                        "color-depth": req.color_depth.as_param(),
                    });
                    if let Some(username) = &req.username {
                        parameters["username"] = serde_json::Value::String(username.clone());
                    }
                    if let Some(password) = &req.password {
                        parameters["password"] = serde_json::Value::String(password.clone());
                    }
                    if req.enable_drive {
                        parameters["enable-drive"] = serde_json::Value::String("true".into());
                        if let Some(path) = &req.drive_path {
                            parameters["drive-path"] = serde_json::Value::String(path.clone());
                        }
                    }
                    http.post(endpoint)
                        .json(&serde_json::json!({
                            "parentIdentifier": "ROOT",
                            "name": req.name,
                            "protocol": "rdp",
                            "parameters": parameters,
                            "attributes": {
                                "max-connections": req.max_connections.to_string(),
                            },
                        }))
                        .send()
                        .await
                        .map_err(|e| OrchError::Internal(format!("guacamole create rdp conn: {e}")))
                })
            })
            .await?;

        #[derive(Deserialize)]
        struct ConnResponse {
            identifier: String,
        }
        let parsed: ConnResponse = serde_json::from_slice(&body)
            .map_err(|e| OrchError::Internal(format!("guacamole create rdp conn decode: {e}")))?;
        Ok(parsed.identifier)
    }

    /// `GrantConnection`: grant an existing connection to a user.
    pub async fn grant_connection(&self, connection_id: &str, username: &str) -> OrchResult<()> {
        let connection_id = connection_id.to_string();
        let username = username.to_string();
        self.auth_action("grant connection", move |token, http, base| {
            let connection_id = connection_id.clone();
            let username = username.clone();
            Box::pin(async move {
                let endpoint = format!(
                    "{base}/guacamole/api/session/data/mysql/users/{username}/permissions?token={token}"
                );
                http.patch(endpoint)
                    .json(&serde_json::json!([{
                        "op": "add",
                        "path": format!("/connectionPermissions/{connection_id}"),
                        "value": "READ",
                    }]))
                    .send()
                    .await
                    .map_err(|e| OrchError::Internal(format!("guacamole grant connection: {e}")))
            })
        })
        .await?;
        Ok(())
    }

    /// `GetPortFromConnectionIdentifier`: used by `ResetVmInLab`'s scope
    /// check to translate a guacamole connection id into the RDP port it
    /// was configured with.
    pub async fn get_port_from_connection_identifier(&self, connection_id: &str) -> OrchResult<u16> {
        let connection_id = connection_id.to_string();
        let body = self
            .auth_action("get connection parameters", move |token, http, base| {
                let connection_id = connection_id.clone();
                Box::pin(async move {
                    let endpoint = format!(
                        "{base}/guacamole/api/session/data/mysql/connections/{connection_id}/parameters?token={token}"
                    );
                    http.get(endpoint)
                        .send()
                        .await
                        .map_err(|e| OrchError::Internal(format!("guacamole get connection params: {e}")))
                })
            })
            .await?;

        #[derive(Deserialize)]
        struct Params {
            port: String,
        }
        let parsed: Params = serde_json::from_slice(&body)
            .map_err(|e| OrchError::Internal(format!("guacamole get connection params decode: {e}")))?;
        parsed
            .port
            .parse()
            .map_err(|e| OrchError::Internal(format!("guacamole connection port not numeric: {e}")))
    }

    /// Retry wrapper: re-authenticate and retry up to 3 times on `403
    /// Forbidden` or an in-body "Permission Denied" message, matching the
    /// original's `authAction` retry loop.
    async fn auth_action<F>(&self, action: &str, build: F) -> OrchResult<Vec<u8>>
    where
        F: Fn(
            String,
            reqwest::Client,
            String,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = OrchResult<reqwest::Response>> + Send>,
        >,
    {
        let base = self.base_url();
        let mut attempt = 0;
        loop {
            let token = self
                .token
                .read()
                .await
                .clone()
                .ok_or_else(|| OrchError::Internal("guacamole: no session token".into()))?;
            let resp = build(token, self.http.clone(), base.clone()).await?;
            let status = resp.status();
            let body = resp
                .bytes()
                .await
                .map_err(|e| OrchError::Internal(format!("guacamole {action}: read body: {e}")))?
                .to_vec();

            let permission_denied = status == reqwest::StatusCode::FORBIDDEN
                || body_says_permission_denied(&body);

            if !permission_denied && is_expected_status(status) {
                return Ok(body);
            }

            attempt += 1;
            if attempt > MAX_AUTH_RETRIES {
                return Err(OrchError::Internal(format!(
                    "guacamole {action}: failed after {MAX_AUTH_RETRIES} retries (status {status})"
                )));
            }
            if permission_denied {
                let token = self.login(DEFAULT_ADMIN_USER, &self.admin_pass).await?;
                *self.token.write().await = Some(token);
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Close the three sidecar containers and remove the bridge network.
    pub async fn close(&self, containers: &dyn ContainerDriver) -> OrchResult<()> {
        for slot in [&self.guacd, &self.db, &self.web] {
            if let Some(mut machine) = slot.write().await.take() {
                machine.close().await.map_err(OrchError::from)?;
            }
        }
        containers
            .remove_network(self.network)
            .await
            .map_err(OrchError::from)?;
        Ok(())
    }
}

fn is_expected_status(status: reqwest::StatusCode) -> bool {
    (status.as_u16() >= 200 && status.as_u16() <= 302) || status == reqwest::StatusCode::FORBIDDEN
}

fn body_says_permission_denied(body: &[u8]) -> bool {
    #[derive(Deserialize)]
    struct Msg {
        message: Option<String>,
    }
    serde_json::from_slice::<Msg>(body)
        .ok()
        .and_then(|m| m.message)
        .is_some_and(|m| m == "Permission Denied.")
}

#[cfg(unix)]
fn users_uid() -> u32 {
    // SAFETY: getuid takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}
#[cfg(unix)]
fn users_gid() -> u32 {
    // SAFETY: getgid takes no arguments and cannot fail.
    unsafe { libc::getgid() }
}
#[cfg(not(unix))]
fn users_uid() -> u32 {
    0
}
#[cfg(not(unix))]
fn users_gid() -> u32 {
    0
}

impl GuacamoleInstance {
    /// A guacamole handle with no backing containers, for tests that
    /// exercise environment/lab bookkeeping and never touch the guacamole
    /// HTTP surface itself.
    #[doc(hidden)]
    pub fn test_stub() -> Self {
        Self {
            web_port: 0,
            admin_pass: String::new(),
            mysql_pass: String::new(),
            http: reqwest::Client::new(),
            token: RwLock::new(None),
            guacd: RwLock::new(None),
            db: RwLock::new(None),
            web: RwLock::new(None),
            network: NetworkId(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_depth_renders_guacamole_param() {
        assert_eq!(ColorDepth::TwentyFour.as_param(), "24");
        assert_eq!(ColorDepth::ThirtyTwo.as_param(), "32");
    }

    #[test]
    fn expected_status_accepts_2xx_3xx_and_403() {
        assert!(is_expected_status(reqwest::StatusCode::OK));
        assert!(is_expected_status(reqwest::StatusCode::FOUND));
        assert!(is_expected_status(reqwest::StatusCode::FORBIDDEN));
        assert!(!is_expected_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn permission_denied_message_detected() {
        let body = br#"{"message":"Permission Denied."}"#;
        assert!(body_says_permission_denied(body));
        assert!(!body_says_permission_denied(br#"{"message":"ok"}"#));
    }
}
