use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use models::{DirectoryConfig, FileEvent, UploadJob, WatchMode};
use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utilities::{should_ignore, FileSystem};

use crate::inflight::InFlightSet;
use crate::stability;

/// Watches one configured directory and feeds confirmed files into the
/// binding's upload queue.
///
/// OS notifications and reconciliation scans overlap on purpose; the shared
/// [`InFlightSet`] keeps each path enqueued at most once per stability
/// episode.
pub struct DirectoryWatcher {
    cfg: DirectoryConfig,
    fs: Arc<dyn FileSystem>,
    inflight: Arc<InFlightSet>,
    jobs: mpsc::Sender<UploadJob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    /// Atomic move into the watched directory; the file is already complete.
    Rename,
    Create,
    Write,
}

impl DirectoryWatcher {
    pub fn new(cfg: DirectoryConfig, fs: Arc<dyn FileSystem>, jobs: mpsc::Sender<UploadJob>) -> Self {
        Self {
            cfg,
            fs,
            inflight: Arc::new(InFlightSet::new()),
            jobs,
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// Shared in-flight tracker, handed to the upload pool's success callback.
    pub fn inflight(&self) -> Arc<InFlightSet> {
        Arc::clone(&self.inflight)
    }

    pub fn clear_enqueued(&self, path: &Path) {
        self.inflight.clear_enqueued(path);
    }

    /// Run until the token is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let use_events = self.cfg.watch.mode != WatchMode::PollingOnly;

        let mut event_rx = None;
        let mut _fs_watcher = None;
        if use_events {
            let (tx, rx) = mpsc::channel::<notify::Result<Event>>(1024);
            let mut w: RecommendedWatcher = notify::recommended_watcher(move |res| {
                let _ = tx.blocking_send(res);
            })
            .context("failed to create filesystem watcher")?;

            // notify resubscribes newly created subdirectories on its own in
            // recursive mode, on every platform backend.
            let mode = if self.cfg.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            w.watch(&self.cfg.watch_path, mode)
                .with_context(|| format!("failed to watch {}", self.cfg.watch_path.display()))?;
            event_rx = Some(rx);
            _fs_watcher = Some(w);
        }

        info!(
            "[{}] watcher started for {} (mode: {:?}, recursive: {})",
            self.cfg.name,
            self.cfg.watch_path.display(),
            self.cfg.watch.mode,
            self.cfg.recursive
        );

        if self.cfg.watch.startup_scan_enabled() {
            info!("[{}] startup reconciliation scan", self.cfg.name);
            self.scan_once(&token).await;
        }

        let mut scan_tick = if self.cfg.watch.reconcile_scan.enabled {
            let mut t = tokio::time::interval(self.cfg.watch.reconcile_scan.interval());
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t.reset();
            Some(t)
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = async { event_rx.as_mut().unwrap().recv().await }, if event_rx.is_some() => {
                    match maybe {
                        Some(Ok(event)) => self.handle_event(event, &token),
                        Some(Err(e)) => error!("[{}] watch error: {e}", self.cfg.name),
                        None => {
                            warn!("[{}] notification channel closed", self.cfg.name);
                            event_rx = None;
                        }
                    }
                }
                _ = async { scan_tick.as_mut().unwrap().tick().await }, if scan_tick.is_some() => {
                    self.scan_once(&token).await;
                }
            }
        }

        info!("[{}] watcher stopped", self.cfg.name);
        Ok(())
    }

    fn handle_event(self: &Arc<Self>, event: Event, token: &CancellationToken) {
        let Some(class) = classify(&event.kind) else {
            return;
        };

        // A Both-rename carries [from, to]; only the destination matters.
        let targets: Vec<PathBuf> =
            if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both))) {
                event.paths.last().cloned().into_iter().collect()
            } else {
                event.paths
            };

        for path in targets {
            match self.cfg.watch.mode {
                WatchMode::HybridUltraLowLatency => self.handle_hybrid(&path, class, token),
                WatchMode::EventOnly => self.handle_event_only(&path, class),
                WatchMode::PollingOnly => {}
            }
        }
    }

    fn handle_hybrid(self: &Arc<Self>, path: &Path, class: EventClass, token: &CancellationToken) {
        if should_ignore(path, &self.cfg.ignore) {
            return;
        }
        match self.fs.metadata(path) {
            Ok(md) if md.is_file => {}
            _ => return,
        }

        match class {
            EventClass::Rename => {
                // Atomic move: the bytes are complete, skip probing.
                if self.inflight.mark_enqueued(path) {
                    self.dispatch(path, true, false);
                }
            }
            EventClass::Create | EventClass::Write => {
                if self.inflight.is_tracked(path) {
                    return;
                }
                if !self.inflight.begin_processing(path) {
                    return;
                }
                self.spawn_probe(path.to_path_buf(), token.clone());
            }
        }
    }

    /// Raw mode: dispatch on the event itself, no stability confirmation and
    /// no in-flight tracking.
    fn handle_event_only(&self, path: &Path, class: EventClass) {
        if should_ignore(path, &self.cfg.ignore) {
            return;
        }
        self.dispatch(path, class == EventClass::Rename, false);
    }

    fn spawn_probe(self: &Arc<Self>, path: PathBuf, token: CancellationToken) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            let probe = tokio::select! {
                _ = token.cancelled() => {
                    watcher.inflight.end_processing(&path);
                    return;
                }
                p = stability::probe(watcher.fs.as_ref(), &path, &watcher.cfg.stability) => p,
            };
            if probe.stable {
                if watcher.inflight.mark_enqueued(&path) {
                    watcher.dispatch(&path, false, probe.timed_out);
                }
            } else {
                debug!(
                    "[{}] file vanished during stability check: {}",
                    watcher.cfg.name,
                    path.display()
                );
            }
            watcher.inflight.end_processing(&path);
        });
    }

    /// One full reconciliation pass over the tree. The safety net for missed
    /// or dropped events; also runs once at startup.
    pub async fn scan_once(&self, token: &CancellationToken) {
        debug!(
            "[{}] reconciliation scan of {}",
            self.cfg.name,
            self.cfg.watch_path.display()
        );

        let mut stack = vec![self.cfg.watch_path.clone()];
        while let Some(dir) = stack.pop() {
            if token.is_cancelled() {
                return;
            }
            let entries = match self.fs.read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("[{}] scan skipping {}: {e}", self.cfg.name, dir.display());
                    continue;
                }
            };
            for entry in entries {
                if token.is_cancelled() {
                    return;
                }
                if entry.metadata.is_dir {
                    stack.push(entry.path);
                    continue;
                }
                if !entry.metadata.is_file {
                    continue;
                }
                let path = entry.path;
                if should_ignore(&path, &self.cfg.ignore) {
                    continue;
                }
                if self.inflight.is_enqueued(&path) {
                    continue;
                }
                if !self.inflight.begin_processing(&path) {
                    continue;
                }

                let probe = stability::probe(self.fs.as_ref(), &path, &self.cfg.stability).await;
                if probe.stable && self.inflight.mark_enqueued(&path) {
                    self.dispatch(&path, false, probe.timed_out);
                }
                self.inflight.end_processing(&path);
            }
        }
    }

    /// Hand a confirmed file to the upload queue. Dropping on a full queue is
    /// deliberate: the enqueued mark is released so a later reconciliation
    /// scan rediscovers the file.
    fn dispatch(&self, path: &Path, is_rename: bool, timed_out: bool) -> bool {
        let event = FileEvent::new(path.to_path_buf(), is_rename, timed_out);
        info!(
            "[{}] file detected: {} (rename: {}, timeout: {})",
            self.cfg.name,
            path.display(),
            is_rename,
            timed_out
        );
        match self.jobs.try_send(event.into_job()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "[{}] upload queue full, dropping: {}",
                    self.cfg.name,
                    path.display()
                );
                self.inflight.clear_enqueued(path);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    "[{}] upload queue closed, dropping: {}",
                    self.cfg.name,
                    path.display()
                );
                self.inflight.clear_enqueued(path);
                false
            }
        }
    }
}

fn classify(kind: &EventKind) -> Option<EventClass> {
    match kind {
        EventKind::Create(_) => Some(EventClass::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both)) => {
            Some(EventClass::Rename)
        }
        // A bare rename notice without a usable destination, or the source
        // half of a move: nothing to pick up here.
        EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::Other)) => None,
        // Platforms that cannot tell a move from a write report an
        // unspecified rename; treat it as potentially-atomic and let the
        // stability probe decide.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => Some(EventClass::Create),
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => Some(EventClass::Write),
        _ => None,
    }
}
