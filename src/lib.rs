//! Local edge runner: a persistent authenticated link to a Control Plane,
//! a supervisor over local tool providers, and hybrid local/remote tool
//! invocation.

pub mod bootstrap;
pub mod codec;
pub mod config_intake;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod provider;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod workflow;

use std::sync::Arc;

use anyhow::Result;

pub use bootstrap::BootstrapConfig;
use config_intake::ConfigIntake;
use engine::ConnectionEngine;
use invoker::HybridInvoker;
use supervisor::ToolProviderSupervisor;
use types::{method, ConnectionState};
use workflow::SequentialEngine;

/// Wires C1-C6 (plus the built-in sequential workflow engine, C8) into a
/// single running process. Construction order matters: the engine and the
/// supervisor are leaves, the invoker is built against both, and the
/// remaining handler seams are installed onto the engine only once the
/// invoker exists — see `engine::ConnectionEngine`'s own notes on why a
/// one-shot constructor can't express this without a cycle.
pub struct Runner {
    engine: Arc<ConnectionEngine>,
    supervisor: Arc<ToolProviderSupervisor>,
    config_intake: Arc<ConfigIntake>,
    invoker: Arc<HybridInvoker>,
    sequential_engine: Arc<dyn workflow::WorkflowEngine>,
}

impl Runner {
    pub fn new(bootstrap: &BootstrapConfig) -> Arc<Self> {
        let engine = ConnectionEngine::new(bootstrap.runner_config.clone());

        let supervisor = Arc::new(
            ToolProviderSupervisor::new(bootstrap.runner_config.health_check_interval)
                .with_availability_callback({
                    let engine = engine.clone();
                    move |view| {
                        let engine = engine.clone();
                        async move { report_availability(&engine, view).await }
                    }
                }),
        );

        let config_intake = Arc::new(ConfigIntake::new(supervisor.clone()));

        let invoker = HybridInvoker::new(
            engine.clone() as Arc<dyn engine::OutboundLink>,
            supervisor.clone(),
            bootstrap.proxy_timeout(),
        );

        let sequential_engine: Arc<dyn workflow::WorkflowEngine> =
            Arc::new(SequentialEngine::new(invoker.clone() as Arc<dyn workflow::ToolInvoker>));

        Arc::new(Self {
            engine,
            supervisor,
            config_intake,
            invoker,
            sequential_engine,
        })
    }

    /// Installs the handler seams onto the engine and the workflow engine
    /// onto the invoker, starts the engine, then blocks until a shutdown
    /// signal arrives before stopping everything. Mirrors `engine.start()`'s
    /// error contract: an `AuthFailed` or initial transport error propagates
    /// straight to the caller (§7).
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.invoker
            .install_workflow_engine(self.sequential_engine.clone())
            .await;
        self.engine
            .set_config_sink(self.config_intake.clone() as Arc<dyn engine::ConfigSink>)
            .await;
        self.engine
            .set_tool_executor(self.invoker.clone() as Arc<dyn engine::ToolExecutor>)
            .await;
        self.engine
            .set_workflow_executor(self.invoker.clone() as Arc<dyn engine::WorkflowExecutor>)
            .await;

        self.engine.start().await?;

        let supervisor = self.supervisor.clone();
        let health_check_handle = tokio::spawn(async move {
            supervisor.run_health_check_loop().await;
        });

        wait_for_shutdown_signal().await;

        tracing::info!("shutdown signal received");
        health_check_handle.abort();
        self.supervisor.shutdown().await;
        self.engine.stop().await;

        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.engine.state().await
    }
}

/// Sends `runner/availability` only while connected; a disconnected runner
/// has nothing to report to and the send would just fail and log noise.
async fn report_availability(engine: &Arc<ConnectionEngine>, view: types::ToolAvailability) {
    if engine.state().await != ConnectionState::Connected {
        return;
    }
    let params = serde_json::json!({
        "available": view.available,
        "unavailable": view.unavailable,
    });
    if let Err(e) = engine.send_notification(method::RUNNER_AVAILABILITY, params).await {
        tracing::warn!(error = %e, "failed to report tool availability");
    }
}

pub fn install_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
