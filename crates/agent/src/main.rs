//! Binary entry point: parse the CLI, load config, wire the collaborator
//! drivers, bring up the orchestrator (resuming persisted state if any),
//! then serve the RPC transport until asked to shut down.

mod config;
mod error;
mod orchestrator;
mod transport;

use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use agent_collab::{
    ContainerDriver, FakeContainerDriver, FakeExerciseMetadataClient, FakeHypervisorDriver,
    FakeMetricsSource, FakeWireGuardClient, RegistryCredential,
};
use agent_core::net::iptables::{NoopIptablesExecutor, ShellIptablesExecutor};
use agent_rpc::AuthInterceptor;
use clap::Parser;
use tracing_subscriber::fmt::time::FormatTime;

use crate::error::{AgentError, AgentResult};
use crate::orchestrator::Orchestrator;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "agent", version)]
struct Cli {
    /// Path to the agent's YAML config file.
    #[arg(long, default_value = "config/config.yml")]
    config: std::path::PathBuf,

    /// Use a real `iptables` binary instead of the no-op executor. Off by
    /// default so the binary is safe to run without root on a dev box.
    #[arg(long, default_value_t = false)]
    real_iptables: bool,

    /// Wire the in-memory `agent_collab::Fake*` collaborators (container
    /// engine, hypervisor, WireGuard, exercise metadata, metrics) instead of
    /// real ones. This crate ships no real driver — §6's hypervisor/
    /// container/WireGuard/exercise-metadata/metrics collaborators are
    /// out-of-scope externals a production deployment must link in. Off by
    /// default so the binary refuses to silently run as a no-op; pass this
    /// explicitly for local development and integration testing.
    #[arg(long, default_value_t = false)]
    dev_fakes: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> AgentResult<()> {
    let config = config::load(&cli.config).await?;

    if !cli.dev_fakes {
        return Err(AgentError::Collaborators(
            "no real ContainerDriver/HypervisorDriver/WireGuardClient/\
             ExerciseMetadataClient/MetricsSource is linked into this binary; \
             pass --dev-fakes to run against the in-memory fakes for local \
             development, or build against real collaborator implementations \
             for production use"
                .into(),
        ));
    }

    let containers = FakeContainerDriver::new();
    let hypervisors = FakeHypervisorDriver::new();
    let wireguard = FakeWireGuardClient::new();
    let exercise_meta = FakeExerciseMetadataClient::new();
    let metrics = FakeMetricsSource::new();

    let credentials: Vec<RegistryCredential> = config
        .docker_repositories
        .iter()
        .map(|repo| RegistryCredential {
            registry: repo.registry.clone(),
            username: repo.username.clone(),
            password: repo.password.clone(),
        })
        .collect();
    if let Err(e) = containers.login(&credentials).await {
        tracing::warn!(error = %e, "one or more docker registry logins failed");
    }

    let iptables: Arc<dyn agent_core::net::iptables::IptablesExecutor> = if cli.real_iptables {
        Arc::new(ShellIptablesExecutor::default())
    } else {
        Arc::new(NoopIptablesExecutor)
    };

    let vpn_conf_dir = config.vpn_service.as_ref().map(|v| v.wg_conf_dir.clone());

    let orchestrator = Orchestrator::new(
        containers,
        hypervisors,
        wireguard,
        exercise_meta,
        metrics,
        iptables,
        config.max_workers,
        config.file_transfer_root.to_string_lossy().into_owned(),
        config.state_path.clone(),
        vpn_conf_dir,
    );

    orchestrator.resume().await?;
    orchestrator.start_workers().await;

    let auth = Arc::new(AuthInterceptor::new(
        config.sign_key.clone().into_bytes(),
        config.auth_key.clone(),
    ));

    let bind_addr = format!(
        "{}:{}",
        config.listening_ip.clone().unwrap_or_else(|| config.host.clone()),
        config.grpc_port
    );

    let orchestrator_for_transport = Arc::clone(&orchestrator);
    let serve_task = tokio::spawn(async move {
        transport::serve(&bind_addr, orchestrator_for_transport, auth).await
    });

    tokio::select! {
        result = serve_task => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AgentError::Config(format!("transport: {e}"))),
                Err(e) => Err(AgentError::Config(format!("transport task panicked: {e}"))),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    }
}
