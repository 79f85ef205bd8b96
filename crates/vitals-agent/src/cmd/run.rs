use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vitals_agent::constants::SHUTDOWN_GRACE_SECS;
use vitals_agent::lock::StateLock;
use vitals_agent::{Agent, AgentConfig, AgentResult};

use super::ConfigArgs;

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Run the agent until SIGINT or SIGTERM.
pub async fn run_agent(config: AgentConfig) -> AgentResult<()> {
    let paths = config.paths();
    let _lock = StateLock::acquire(paths.lock()).await?;

    let agent = Arc::new(Agent::open(config)?);
    let shutdown = CancellationToken::new();
    let loops = tokio::spawn(agent.clone().run(shutdown.clone()));

    wait_for_signal().await?;
    info!("shutdown requested, finishing in-flight work");
    shutdown.cancel();

    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), loops).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "agent task failed"),
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE_SECS,
            "loops did not stop in time, exiting anyway"
        ),
    }
    for stats in agent.buffer_stats() {
        if stats.pending > 0 {
            info!(
                category = %stats.category,
                pending = stats.pending,
                "events kept for next start"
            );
        }
    }
    Ok(())
}

async fn wait_for_signal() -> AgentResult<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
