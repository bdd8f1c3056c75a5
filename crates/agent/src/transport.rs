//! A newline-delimited-JSON transport over TCP: §4.10 abstracts the wire
//! codec away, so this binary picks one rather than depending on any
//! particular RPC framework. One [`RpcEnvelope`] per line in, one
//! [`RpcReply`] per line out, everything else (method dispatch, auth,
//! streaming) built on top of that.
//!
//! Every unary method is authenticated the same way: the presented
//! `auth_key` plus an HMAC token computed by the caller over
//! `"{method}:{body}"` as the canonical request (§4.11). `LabStream` and
//! `MonitorStream` authenticate once, at subscribe time, then run for the
//! life of the connection.

use std::sync::Arc;

use agent_rpc::{AuthInterceptor, MonitorPing, OrchError, OrchResult, OrchestratorService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    method: String,
    auth_key: String,
    token: String,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize)]
struct RpcReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RpcReply {
    fn ok(body: Value) -> Self {
        Self {
            ok: true,
            body: Some(body),
            error: None,
        }
    }

    fn err(e: &OrchError) -> Self {
        Self {
            ok: false,
            body: None,
            error: Some(e.to_string()),
        }
    }
}

/// Bind `addr` and serve [`OrchestratorService`] over it until the process
/// is asked to shut down. Each accepted connection is handled on its own
/// task; a connection that errors mid-stream is dropped, never the listener.
pub async fn serve(
    addr: &str,
    orchestrator: Arc<Orchestrator>,
    auth: Arc<AuthInterceptor>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "rpc transport listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let orchestrator = Arc::clone(&orchestrator);
        let auth = Arc::clone(&auth);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, orchestrator, auth).await {
                tracing::warn!(%peer, error = %e, "rpc connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    orchestrator: Arc<Orchestrator>,
    auth: Arc<AuthInterceptor>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let envelope: RpcEnvelope = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                let reply = RpcReply::err(&OrchError::InvalidArgument(format!(
                    "malformed request: {e}"
                )));
                write_reply(&mut write_half, &reply).await?;
                continue;
            }
        };

        if envelope.method == "LabStream" {
            if let Err(e) = authenticate(&auth, &envelope) {
                write_reply(&mut write_half, &RpcReply::err(&e)).await?;
                continue;
            }
            return stream_labs(&orchestrator, write_half).await;
        }

        if envelope.method == "MonitorStream" {
            if let Err(e) = authenticate(&auth, &envelope) {
                write_reply(&mut write_half, &RpcReply::err(&e)).await?;
                continue;
            }
            return stream_monitor(&orchestrator, lines, write_half).await;
        }

        let reply = match authenticate(&auth, &envelope) {
            Ok(()) => dispatch(&orchestrator, &envelope.method, envelope.body).await,
            Err(e) => RpcReply::err(&e),
        };
        write_reply(&mut write_half, &reply).await?;
    }

    Ok(())
}

fn authenticate(auth: &AuthInterceptor, envelope: &RpcEnvelope) -> OrchResult<()> {
    let canonical = format!("{}:{}", envelope.method, envelope.body);
    auth.authenticate(&envelope.auth_key, canonical.as_bytes(), &envelope.token)
}

async fn write_reply(
    write_half: &mut (impl AsyncWriteExt + Unpin),
    reply: &RpcReply,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(reply).unwrap_or_else(|_| {
        r#"{"ok":false,"error":"failed to serialize reply"}"#.to_string()
    });
    line.push('\n');
    write_half.write_all(line.as_bytes()).await
}

/// Dispatch one request body by method name. `body` deserialization errors
/// surface as `InvalidArgument` rather than dropping the connection — a
/// malformed request is the caller's problem, not a transport failure.
async fn dispatch(orchestrator: &Arc<Orchestrator>, method: &str, body: Value) -> RpcReply {
    macro_rules! call {
        ($req_ty:ty, $handler:ident) => {{
            match serde_json::from_value::<$req_ty>(body) {
                Ok(req) => match orchestrator.$handler(req).await {
                    Ok(resp) => RpcReply::ok(serde_json::to_value(resp).unwrap_or(Value::Null)),
                    Err(e) => RpcReply::err(&e),
                },
                Err(e) => RpcReply::err(&OrchError::InvalidArgument(format!(
                    "{method} body: {e}"
                ))),
            }
        }};
    }

    macro_rules! call_unit {
        ($req_ty:ty, $handler:ident) => {{
            match serde_json::from_value::<$req_ty>(body) {
                Ok(req) => match orchestrator.$handler(req).await {
                    Ok(()) => RpcReply::ok(Value::Null),
                    Err(e) => RpcReply::err(&e),
                },
                Err(e) => RpcReply::err(&OrchError::InvalidArgument(format!(
                    "{method} body: {e}"
                ))),
            }
        }};
    }

    match method {
        "Init" => call_unit!(agent_rpc::InitRequest, init),
        "Ping" => call!(agent_rpc::PingRequest, ping),
        "CreateEnvironment" => call!(agent_rpc::CreateEnvironmentRequest, create_environment),
        "CloseEnvironment" => call_unit!(agent_rpc::CloseEnvironmentRequest, close_environment),
        "AddExercisesToEnv" => call_unit!(agent_rpc::AddExercisesToEnvRequest, add_exercises_to_env),
        "CreateLabForEnv" => call!(agent_rpc::CreateLabForEnvRequest, create_lab_for_env),
        "GetLab" => call!(agent_rpc::GetLabRequest, get_lab),
        "CreateVpnConfForLab" => call!(agent_rpc::CreateVpnConfForLabRequest, create_vpn_conf_for_lab),
        "GetHostsInLab" => call!(agent_rpc::GetHostsInLabRequest, get_hosts_in_lab),
        "ResetLab" => call_unit!(agent_rpc::ResetLabRequest, reset_lab),
        "ResetVmInLab" => call_unit!(agent_rpc::ResetVmInLabRequest, reset_vm_in_lab),
        "CloseLab" => call_unit!(agent_rpc::CloseLabRequest, close_lab),
        "AddExercisesToLab" => call_unit!(agent_rpc::AddExercisesToLabRequest, add_exercises_to_lab),
        "ExerciseInLab" => call_unit!(agent_rpc::ExerciseInLabRequest, exercise_in_lab),
        "ListEnvironments" => match orchestrator.list_environments().await {
            Ok(resp) => RpcReply::ok(serde_json::to_value(resp).unwrap_or(Value::Null)),
            Err(e) => RpcReply::err(&e),
        },
        other => RpcReply::err(&OrchError::InvalidArgument(format!(
            "unknown method: {other}"
        ))),
    }
}

/// Push every newly-running lab to this connection until it disconnects.
async fn stream_labs(
    orchestrator: &Arc<Orchestrator>,
    mut write_half: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    let mut rx = orchestrator.lab_stream();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let reply = RpcReply::ok(serde_json::to_value(event).unwrap_or(Value::Null));
                write_reply(&mut write_half, &reply).await?;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Bidirectional: every non-empty line received from the client is treated
/// as a ping trigger; every resulting update is pushed back as a reply line.
async fn stream_monitor<R>(
    orchestrator: &Arc<Orchestrator>,
    mut lines: tokio::io::Lines<BufReader<R>>,
    mut write_half: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut monitor = orchestrator.monitor_stream();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(_) => {
                        if monitor.pings.send(MonitorPing).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
            update = monitor.updates.recv() => {
                match update {
                    Some(update) => {
                        let reply = RpcReply::ok(serde_json::to_value(update).unwrap_or(Value::Null));
                        write_reply(&mut write_half, &reply).await?;
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_collab::{
        FakeContainerDriver, FakeExerciseMetadataClient, FakeHypervisorDriver, FakeMetricsSource,
        FakeWireGuardClient,
    };
    use agent_core::net::iptables::NoopIptablesExecutor;
    use tokio::io::AsyncReadExt;

    async fn test_orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        tokio::fs::create_dir_all(dir.join("ftroot")).await.unwrap();
        let orch = Orchestrator::new(
            FakeContainerDriver::new(),
            FakeHypervisorDriver::new(),
            FakeWireGuardClient::new(),
            FakeExerciseMetadataClient::new(),
            FakeMetricsSource::new(),
            Arc::new(NoopIptablesExecutor),
            2,
            dir.join("ftroot").to_string_lossy().into_owned(),
            dir.join("state"),
            None,
        );
        orch.start_workers().await;
        orch
    }

    fn envelope(auth: &AuthInterceptor, method: &str, body: Value) -> String {
        let canonical = format!("{method}:{body}");
        let token = auth.sign(canonical.as_bytes()).unwrap();
        serde_json::to_string(&serde_json::json!({
            "method": method,
            "auth_key": "test-auth-key",
            "token": token,
            "body": body,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn ping_round_trips_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let auth = Arc::new(AuthInterceptor::new(b"sign-key".to_vec(), "test-auth-key"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = handle_connection(socket, orchestrator, auth).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = envelope(
            &AuthInterceptor::new(b"sign-key".to_vec(), "test-auth-key"),
            "Ping",
            serde_json::json!({ "message": "hi" }),
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(reply["ok"], serde_json::json!(true));
        assert_eq!(reply["body"]["message"], serde_json::json!("pong: hi"));
    }

    #[tokio::test]
    async fn wrong_auth_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let auth = Arc::new(AuthInterceptor::new(b"sign-key".to_vec(), "test-auth-key"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = handle_connection(socket, orchestrator, auth).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let wrong_auth = AuthInterceptor::new(b"sign-key".to_vec(), "someone-else");
        let request = envelope(&wrong_auth, "Ping", serde_json::json!({ "message": "hi" }));
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(reply["ok"], serde_json::json!(false));
        assert!(reply["error"].as_str().unwrap().contains("permission denied"));
    }

    #[tokio::test]
    async fn malformed_json_gets_an_error_reply_not_a_dropped_connection() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path()).await;
        let auth = Arc::new(AuthInterceptor::new(b"sign-key".to_vec(), "test-auth-key"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = handle_connection(socket, orchestrator, auth).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"not json at all\n").await.unwrap();

        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(reply["ok"], serde_json::json!(false));
        assert!(reply["error"].as_str().unwrap().contains("malformed request"));
    }
}
