//! # IP Limiter Runtime
//!
//! Reads proxy log lines and enforces per-credential connection limits.
//!
//! ## Signals
//!
//! - `SIGINT` / Ctrl-C: graceful shutdown
//! - `SIGHUP` (unix): reload the proxy configuration into the registry

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use ip_limiter::RedisConnector;
use limiter_runtime::{LimiterRuntime, RuntimeConfig};
use limiter_telemetry::{init_logging, TelemetryConfig};

#[cfg(unix)]
fn spawn_reload_on_hangup(runtime: Arc<LimiterRuntime>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received; reloading proxy configuration");
            runtime.reload_proxy_config();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_runtime: Arc<LimiterRuntime>) -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(&TelemetryConfig::from_env()).context("Failed to initialize logging")?;

    let config = RuntimeConfig::from_env();
    let runtime = Arc::new(LimiterRuntime::new(config, Arc::new(RedisConnector)));
    runtime.start().await;
    spawn_reload_on_hangup(runtime.clone())?;

    let source = runtime.open_log_source().await?;
    let mut feed = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run(source).await })
    };

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C");
            None
        }
        joined = &mut feed => Some(joined),
    };

    runtime.shutdown();
    let joined = match finished {
        Some(joined) => joined,
        None => feed.await,
    };
    let lines = joined.context("Log feed task panicked")??;
    info!(lines = lines, "Log feed finished");

    Ok(())
}
