use std::sync::Arc;
use std::time::Duration;

use agentrix_server::{AppState, Args, RuntimeConfig, router};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::info;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentrix=info,libagentrix=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = RuntimeConfig::load(&args)?;
    if config.session_tokens.is_empty() {
        let token = uuid::Uuid::new_v4().simple().to_string();
        info!(%token, "no session token configured, generated one for this run");
        config.session_tokens.push(token);
    }
    if config.api_key.is_none() {
        info!("automation API key not set, /api/automation/launch is disabled");
    }

    let state = Arc::new(AppState::from_config(&config)?);
    let app = router(Arc::clone(&state), &config.allow_origins)?;

    let maintenance = Arc::clone(&state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            maintenance.run_maintenance().await;
        }
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        workdir = %config.workdir.display(),
        "agentrix listening on http://{}",
        config.listen
    );

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("http server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
    }

    // tmux-backed sessions outlive the server; direct ptys do not.
    state.registry.shutdown().await;
    info!("agentrix shut down");
    Ok(())
}
