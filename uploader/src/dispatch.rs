use std::path::Path;
use std::sync::{Arc, Mutex};

use models::UploadJob;
use shadow::Archiver;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utilities::FileSystem;

use crate::client::{Uploader, STREAMING_THRESHOLD};

/// Bounded FIFO depth per binding; the watcher drops (and logs) on overflow.
pub const QUEUE_CAPACITY: usize = 100;
pub const WORKERS_PER_BINDING: usize = 4;

/// Invoked with the source path after each successful upload, before the
/// post-upload lifecycle runs.
pub type SuccessCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Fixed-size worker pool draining one binding's upload queue.
pub struct Dispatcher {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    token: Mutex<Option<CancellationToken>>,
}

struct Inner {
    name: String,
    uploader: Uploader,
    archiver: Arc<Archiver>,
    fs: Arc<dyn FileSystem>,
    on_success: Mutex<Option<SuccessCallback>>,
}

impl Dispatcher {
    pub fn new(
        name: String,
        uploader: Uploader,
        archiver: Arc<Archiver>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                uploader,
                archiver,
                fs,
                on_success: Mutex::new(None),
            }),
            workers: Mutex::new(Vec::new()),
            token: Mutex::new(None),
        }
    }

    /// Must be set before `start`; the watcher side clears its enqueued set
    /// through this.
    pub fn set_on_success(&self, callback: SuccessCallback) {
        *self.inner.on_success.lock().unwrap() = Some(callback);
    }

    /// Spawn the worker set against the binding's queue receiver.
    pub fn start(&self, rx: mpsc::Receiver<UploadJob>, parent: &CancellationToken) {
        let token = parent.child_token();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = self.workers.lock().unwrap();
        for id in 0..WORKERS_PER_BINDING {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            let token = token.clone();
            workers.push(tokio::spawn(worker(inner, id, rx, token)));
        }
        *self.token.lock().unwrap() = Some(token);
        info!(
            "[{}] upload dispatcher started with {} workers",
            self.inner.name, WORKERS_PER_BINDING
        );
    }

    /// Idempotent: cancels the workers and waits for each to finish its
    /// current job.
    pub async fn stop(&self) {
        if let Some(token) = self.token.lock().unwrap().take() {
            token.cancel();
        }
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("[{}] all upload workers stopped", self.inner.name);
    }
}

async fn worker(
    inner: Arc<Inner>,
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<UploadJob>>>,
    token: CancellationToken,
) {
    info!("[{}] upload worker {} started", inner.name, id);
    loop {
        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = async { rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };
        inner.process(id, job, &token).await;
    }
    info!("[{}] upload worker {} stopped", inner.name, id);
}

impl Inner {
    async fn process(&self, id: usize, job: UploadJob, token: &CancellationToken) {
        let path = &job.path;

        let md = match self.fs.metadata(path) {
            Ok(md) => md,
            Err(e) => {
                warn!(
                    "[{}] worker {}: failed to stat {}: {e}",
                    self.name,
                    id,
                    path.display()
                );
                return;
            }
        };

        let streaming = md.len > STREAMING_THRESHOLD;
        if let Err(e) = self.uploader.upload(path, streaming, token).await {
            error!(
                "[{}] worker {}: upload failed for {}: {e}",
                self.name,
                id,
                path.display()
            );
            return;
        }

        // Release the path for future stability episodes before touching the
        // source again.
        let callback = self.on_success.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(path);
        }

        if job.processed_due_to_timeout {
            info!(
                "[{}] worker {}: keeping source {} (processed due to stability timeout)",
                self.name,
                id,
                path.display()
            );
            return;
        }

        let before = match self.fs.metadata(path) {
            Ok(md) => (md.len, md.modified),
            Err(e) => {
                warn!(
                    "[{}] worker {}: keeping source {} after stat failure: {e}",
                    self.name,
                    id,
                    path.display()
                );
                return;
            }
        };

        if let Err(e) = self.archiver.store(path) {
            error!(
                "[{}] worker {}: keeping source {} after shadow copy failure: {e:#}",
                self.name,
                id,
                path.display()
            );
            return;
        }

        match self.fs.metadata(path) {
            Err(_) => {
                warn!(
                    "[{}] worker {}: file disappeared before deletion check: {}",
                    self.name,
                    id,
                    path.display()
                );
                return;
            }
            Ok(md) if (md.len, md.modified) != before => {
                warn!(
                    "[{}] worker {}: file changed during processing, keeping source: {}",
                    self.name,
                    id,
                    path.display()
                );
                return;
            }
            Ok(_) => {}
        }

        match self.fs.remove_file(path) {
            Ok(()) => info!(
                "[{}] worker {}: deleted source file {}",
                self.name,
                id,
                path.display()
            ),
            Err(e) => warn!(
                "[{}] worker {}: failed to delete source {}: {e}",
                self.name,
                id,
                path.display()
            ),
        }
    }
}
