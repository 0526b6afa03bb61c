//! # Limiter Runtime
//!
//! Wires the limiter components into one process.
//!
//! ## Startup Sequence
//!
//! 1. Load limiter settings (`LIMITER_SETTINGS`; missing means disabled)
//! 2. Build the credential registry from the proxy configuration
//! 3. Initialize the admission controller (failure leaves it fail-open)
//! 4. Optionally flush all tracked state (`LIMITER_CLEAR_ON_START`)
//! 5. Spawn the correlator sweep task
//! 6. Feed log lines from stdin or a file until EOF or shutdown
//!
//! A file source is read to its end; to follow a live log, pipe it in
//! (`tail -F access.log | limiter-runtime`). Stdin is read on its own OS
//! thread: a blocking read cannot be cancelled, so shutdown abandons that
//! thread instead of waiting for the next line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use ip_limiter::{
    load_limiter_config, AdmissionController, AdmissionMode, CorrelatorConfig,
    CredentialRegistry, EventCorrelator, JsonSettings, LimiterConfig, LogOnlyEnforcer,
    MetricsSnapshot, SettingsSource, SharedConfig, StoreConnector,
};

/// How often the correlator tables are swept
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Lines buffered between the stdin reader thread and the feed
pub const LINE_BUFFER: usize = 1024;

/// Where log lines come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogSource {
    Stdin,
    File(PathBuf),
}

/// An opened log source
pub enum LogFeed {
    /// Async reader; cancelled with the feed
    Reader(Box<dyn AsyncBufRead + Unpin + Send>),
    /// Lines produced by a blocking reader thread
    Lines(mpsc::Receiver<Vec<u8>>),
}

/// Read lines from `reader` on a dedicated OS thread.
///
/// The thread is detached. It exits on EOF, on a read error, or once the
/// receiving side is dropped; a read that never returns keeps only that
/// thread alive, never the runtime.
pub fn spawn_line_reader<R>(reader: R, capacity: usize) -> Result<mpsc::Receiver<Vec<u8>>>
where
    R: std::io::Read + Send + 'static,
{
    use std::io::BufRead;

    let (tx, rx) = mpsc::channel(capacity.max(1));
    std::thread::Builder::new()
        .name("log-line-reader".into())
        .spawn(move || {
            let mut reader = std::io::BufReader::new(reader);
            loop {
                let mut line = Vec::with_capacity(256);
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read log line");
                        break;
                    }
                }
            }
        })
        .context("Failed to spawn log reader thread")?;
    Ok(rx)
}

/// Process configuration read from the environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Flat JSON settings document
    pub settings_path: Option<PathBuf>,
    /// Proxy configuration holding the inbound client lists
    pub proxy_config_path: Option<PathBuf>,
    pub log_source: LogSource,
    /// Overrides the admission mode of the settings
    pub admission_mode: Option<AdmissionMode>,
    /// Delete every tracked connection once the store is ready
    pub clear_on_start: bool,
    /// Skip identifiers absent from the proxy configuration
    pub ignore_unregistered: bool,
    pub sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            settings_path: None,
            proxy_config_path: None,
            log_source: LogSource::Stdin,
            admission_mode: None,
            clear_on_start: false,
            ignore_unregistered: false,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

fn is_true(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// - `LIMITER_SETTINGS`: settings JSON path
    /// - `LIMITER_PROXY_CONFIG`: proxy configuration path
    /// - `LIMITER_LOG_SOURCE`: log file path, `-` or unset for stdin
    /// - `LIMITER_ADMISSION_MODE`: `check-then-record` or `atomic`
    /// - `LIMITER_CLEAR_ON_START`: `true` flushes tracked state at startup
    /// - `LIMITER_IGNORE_UNREGISTERED`: `true` skips unknown identifiers
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let log_source = match lookup("LIMITER_LOG_SOURCE") {
            Some(v) if !v.is_empty() && v != "-" => LogSource::File(PathBuf::from(v)),
            _ => LogSource::Stdin,
        };

        let admission_mode = lookup("LIMITER_ADMISSION_MODE").and_then(|v| match v.parse() {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!(error = %e, "Ignoring LIMITER_ADMISSION_MODE");
                None
            }
        });

        Self {
            settings_path: path("LIMITER_SETTINGS"),
            proxy_config_path: path("LIMITER_PROXY_CONFIG"),
            log_source,
            admission_mode,
            clear_on_start: lookup("LIMITER_CLEAR_ON_START").is_some_and(|v| is_true(&v)),
            ignore_unregistered: lookup("LIMITER_IGNORE_UNREGISTERED")
                .is_some_and(|v| is_true(&v)),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Read the settings file; an unreadable file disables the limiter
pub fn load_settings(path: Option<&Path>) -> LimiterConfig {
    let Some(path) = path else {
        return load_limiter_config(None);
    };

    match JsonSettings::from_path(path) {
        Ok(settings) => load_limiter_config(Some(&settings as &dyn SettingsSource)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Settings unreadable");
            load_limiter_config(None)
        }
    }
}

/// The running limiter
pub struct LimiterRuntime {
    config: RuntimeConfig,
    controller: Arc<AdmissionController>,
    registry: Arc<CredentialRegistry>,
    correlator: Arc<EventCorrelator>,
    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl LimiterRuntime {
    /// Build every component; nothing touches the store yet
    pub fn new(config: RuntimeConfig, connector: Arc<dyn StoreConnector>) -> Self {
        let mut limiter = load_settings(config.settings_path.as_deref());
        if let Some(mode) = config.admission_mode {
            limiter.admission_mode = mode;
        }

        let controller = Arc::new(AdmissionController::new(
            SharedConfig::new(limiter.clone()),
            connector,
        ));

        let registry = Arc::new(CredentialRegistry::new());
        if let Some(path) = &config.proxy_config_path {
            registry.rebuild_from_path(path);
        }

        let correlator_config = CorrelatorConfig::from_limiter(&limiter)
            .with_ignore_unregistered(config.ignore_unregistered);
        let correlator = Arc::new(
            EventCorrelator::new(
                controller.clone(),
                Arc::new(LogOnlyEnforcer),
                correlator_config,
            )
            .with_registry(registry.clone()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            controller,
            registry,
            correlator,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    pub fn registry(&self) -> &Arc<CredentialRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<EventCorrelator> {
        &self.correlator
    }

    /// Connect the store and start background tasks.
    ///
    /// A store that cannot be reached is logged, not returned: the proxy
    /// keeps serving and the limiter stays fail-open.
    pub async fn start(&self) {
        let limiter = self.controller.config();
        info!(
            enabled = limiter.enabled,
            store = %limiter.store_endpoint(),
            max_addresses = limiter.max_addresses_per_credential,
            max_connections = limiter.max_connections_per_address,
            mode = ?limiter.admission_mode,
            credentials = self.registry.len(),
            "Starting IP limiter"
        );

        if let Err(e) = self.controller.initialize().await {
            error!(error = %e, "Limiter initialization failed; connections are not limited");
        }

        if self.config.clear_on_start && self.controller.is_active() {
            self.controller.clear_all_connections().await;
        }

        let correlator = self.correlator.clone();
        let interval = self.config.sweep_interval;
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ip_limiter::cleanup_task(correlator, interval) => {}
                _ = shutdown.changed() => {
                    info!("Sweep task stopped");
                }
            }
        });
    }

    /// Rebuild the registry from the configured proxy configuration
    pub fn reload_proxy_config(&self) {
        match &self.config.proxy_config_path {
            Some(path) => {
                self.registry.rebuild_from_path(path);
            }
            None => warn!("No proxy configuration path; registry reload skipped"),
        }
    }

    /// Open the configured log source
    pub async fn open_log_source(&self) -> Result<LogFeed> {
        match &self.config.log_source {
            LogSource::Stdin => Ok(LogFeed::Lines(spawn_line_reader(
                std::io::stdin(),
                LINE_BUFFER,
            )?)),
            LogSource::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open log source {}", path.display()))?;
                Ok(LogFeed::Reader(Box::new(BufReader::new(file))))
            }
        }
    }

    /// Feed an opened source until it ends or shutdown is signalled
    pub async fn run(&self, feed: LogFeed) -> Result<u64> {
        match feed {
            LogFeed::Reader(reader) => self.run_lines(reader).await,
            LogFeed::Lines(lines) => Ok(self.run_channel(lines).await),
        }
    }

    /// Feed lines received from a reader thread; returns the number processed
    pub async fn run_channel(&self, mut lines: mpsc::Receiver<Vec<u8>>) -> u64 {
        let mut shutdown = self.shutdown_rx.clone();
        let mut processed = 0u64;

        while !*shutdown.borrow() {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else {
                        info!(lines = processed, "Log source exhausted");
                        break;
                    };
                    self.feed_line(&line).await;
                    processed += 1;
                }
                _ = shutdown.changed() => {
                    info!(lines = processed, "Shutdown signal received; log feed stopped");
                    break;
                }
            }
        }

        processed
    }

    async fn feed_line(&self, bytes: &[u8]) {
        let line = String::from_utf8_lossy(bytes);
        self.correlator.process_line(line.trim_end()).await;
    }

    /// Feed lines to the correlator until EOF or shutdown.
    ///
    /// Returns the number of lines processed. Invalid UTF-8 is replaced
    /// rather than rejected.
    pub async fn run_lines<R>(&self, mut reader: R) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut shutdown = self.shutdown_rx.clone();
        let mut buf = Vec::with_capacity(512);
        let mut processed = 0u64;

        while !*shutdown.borrow() {
            buf.clear();
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => {
                    if read.context("Failed to read log line")? == 0 {
                        info!(lines = processed, "Log source exhausted");
                        break;
                    }
                    self.feed_line(&buf).await;
                    processed += 1;
                }
                _ = shutdown.changed() => {
                    info!(lines = processed, "Shutdown signal received; log feed stopped");
                    break;
                }
            }
        }

        Ok(processed)
    }

    /// Stop the background tasks and the log feed
    pub fn shutdown(&self) -> MetricsSnapshot {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }

        let metrics = self.controller.metrics();
        info!(
            lines = metrics.lines_processed,
            correlations = metrics.correlations,
            allowed = metrics.allowed,
            rejected = metrics.rejected(),
            fail_open = metrics.fail_open,
            store_errors = metrics.store_errors,
            "Limiter stopped"
        );
        metrics
    }
}
