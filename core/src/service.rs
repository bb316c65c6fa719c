use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use models::{Config, UploadJob, WatchMode};
use shadow::Archiver;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uploader::{Dispatcher, Uploader, QUEUE_CAPACITY};
use utilities::{FileSystem, RealFileSystem};
use watcher::{DirectoryWatcher, InFlightSet};

/// The assembled daemon: one ingress server plus, per configured directory,
/// a watcher, an upload worker pool and a shadow archiver, all sharing one
/// cancellation scope.
pub struct Service {
    cfg: Config,
    server: Arc<ingress::Server>,
    watchers: Vec<Arc<DirectoryWatcher>>,
    dispatchers: Vec<Arc<Dispatcher>>,
    archivers: Vec<Arc<Archiver>>,
    queues: Vec<mpsc::Receiver<UploadJob>>,
}

impl Service {
    pub fn new(cfg: Config) -> Result<Self> {
        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new());
        Self::with_fs(cfg, fs)
    }

    pub fn with_fs(cfg: Config, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let server = Arc::new(ingress::Server::new(cfg.server.clone(), &cfg.directories)?);

        let mut watchers = Vec::with_capacity(cfg.directories.len());
        let mut dispatchers = Vec::with_capacity(cfg.directories.len());
        let mut archivers = Vec::with_capacity(cfg.directories.len());
        let mut queues = Vec::with_capacity(cfg.directories.len());

        for dir in &cfg.directories {
            let archiver = Arc::new(
                Archiver::new(dir.shadow.clone(), Arc::clone(&fs))
                    .with_context(|| format!("failed to create shadow archiver for {}", dir.name))?,
            );
            let uploader = Uploader::new(dir.outbound.clone())
                .map_err(|e| anyhow!("failed to build upload client for {}: {e}", dir.name))?;
            let dispatcher = Arc::new(Dispatcher::new(
                dir.name.clone(),
                uploader,
                Arc::clone(&archiver),
                Arc::clone(&fs),
            ));

            let (jobs_tx, jobs_rx) = mpsc::channel(QUEUE_CAPACITY);
            let watcher = Arc::new(DirectoryWatcher::new(dir.clone(), Arc::clone(&fs), jobs_tx));

            archivers.push(archiver);
            dispatchers.push(dispatcher);
            watchers.push(watcher);
            queues.push(jobs_rx);
        }

        // All watchers exist before any pool learns the success callback, so
        // the callback can iterate a read-only slice of in-flight handles
        // instead of holding back-pointers.
        let inflight: Vec<Arc<InFlightSet>> = watchers.iter().map(|w| w.inflight()).collect();
        for dispatcher in &dispatchers {
            let inflight = inflight.clone();
            dispatcher.set_on_success(Arc::new(move |path: &Path| {
                for set in &inflight {
                    set.clear_enqueued(path);
                }
            }));
        }

        Ok(Self {
            cfg,
            server,
            watchers,
            dispatchers,
            archivers,
            queues,
        })
    }

    /// Run until interrupted or terminated by the OS.
    pub async fn run(self) -> Result<()> {
        let token = CancellationToken::new();
        self.run_with_token(token).await
    }

    pub async fn run_with_token(mut self, token: CancellationToken) -> Result<()> {
        log_startup(&self.cfg);

        for (dispatcher, rx) in self.dispatchers.iter().zip(self.queues.drain(..)) {
            dispatcher.start(rx, &token);
        }

        let mut watcher_tasks = Vec::with_capacity(self.watchers.len());
        for watcher in &self.watchers {
            let watcher = Arc::clone(watcher);
            let name = watcher.name().to_string();
            let token = token.clone();
            watcher_tasks.push(tokio::spawn(async move {
                if let Err(e) = watcher.run(token).await {
                    error!("[{name}] watcher error: {e:#}");
                }
            }));
        }

        for archiver in &self.archivers {
            tokio::spawn(Arc::clone(archiver).run_sweeper(token.clone()));
        }

        let server_task = {
            let server = Arc::clone(&self.server);
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(token).await {
                    error!("ingress server error: {e:#}");
                }
            })
        };

        info!("xferd service started");

        tokio::select! {
            _ = token.cancelled() => info!("cancellation requested, shutting down"),
            _ = shutdown_signal() => info!("termination signal received, shutting down"),
        }
        token.cancel();

        for dispatcher in &self.dispatchers {
            dispatcher.stop().await;
        }
        for task in watcher_tasks {
            let _ = task.await;
        }
        let _ = server_task.await;

        info!("xferd service stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Condensed startup summary of the effective configuration.
fn log_startup(cfg: &Config) {
    let scheme = if cfg.server.tls.enabled { "https" } else { "http" };
    info!(
        "server: {}://{}:{} (temp dir: {}, basic auth: {})",
        scheme,
        cfg.server.address,
        cfg.server.port,
        cfg.server.temp_dir.display(),
        if cfg.server.basic_auth.enabled { "enabled" } else { "disabled" },
    );

    info!("directories: {} configured", cfg.directories.len());
    for dir in &cfg.directories {
        info!(
            "[{}] watching {} ({}recursive)",
            dir.name,
            dir.watch_path.display(),
            if dir.recursive { "" } else { "non-" },
        );
        match dir.watch.mode {
            WatchMode::HybridUltraLowLatency => info!(
                "[{}] hybrid detection: renames instant, writes confirmed stable after {} checks every {}ms (up to {}ms)",
                dir.name,
                dir.stability.required_stable_checks,
                dir.stability.confirmation_interval_ms,
                dir.stability.max_wait_ms,
            ),
            WatchMode::EventOnly => info!(
                "[{}] event-only detection: no stability checks, incomplete files possible",
                dir.name
            ),
            WatchMode::PollingOnly => info!(
                "[{}] polling-only detection: scan every {}s",
                dir.name, dir.watch.reconcile_scan.interval_seconds
            ),
        }
        if dir.watch.reconcile_scan.enabled {
            info!(
                "[{}] reconciliation scan every {}s",
                dir.name, dir.watch.reconcile_scan.interval_seconds
            );
        }
        if dir.shadow.enabled {
            info!(
                "[{}] shadow copies in {} kept for {}h",
                dir.name,
                dir.shadow.path.display(),
                dir.shadow.retention_hours
            );
        } else {
            info!("[{}] shadow disabled, sources deleted after upload", dir.name);
        }
        info!("[{}] outbound uploads to {}", dir.name, dir.outbound.url);
        info!(
            "[{}] ingest endpoint: {}://{}:{}/upload/{}",
            dir.name, scheme, cfg.server.address, cfg.server.port, dir.name
        );
    }
}
