//! Bounded worker pool that runs share refreshes.
//!
//! Jobs are queued without bound and executed by a fixed number of workers,
//! so hellos never wait on file list downloads.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::filesystem::Filesystem;
use crate::peer::PeerTransport;
use crate::share::{RefreshOutcome, Share};

/// One scheduled share refresh.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    /// Share to refresh.
    pub share: Arc<Share>,
    /// Revision the share was bumped to when the job was scheduled.
    pub revision: u64,
    /// Revision to restore if the refresh fails transiently.
    pub previous: Option<u64>,
}

/// Counters for completed refresh jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Jobs accepted by [`RefreshPipeline::submit`].
    pub submitted: u64,
    /// Jobs that imported a file list.
    pub imported: u64,
    /// Jobs that found their share or client gone.
    pub skipped: u64,
    /// Jobs that failed.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    imported: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// The refresh worker pool.
pub struct RefreshPipeline {
    sender: Mutex<Option<mpsc::UnboundedSender<RefreshJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: AtomicUsize,
    idle: Notify,
    counters: Counters,
}

impl RefreshPipeline {
    /// Starts `workers` worker tasks (at least one).
    pub fn start(
        workers: usize,
        fs: Arc<Filesystem>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<RefreshJob>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let pipeline = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            counters: Counters::default(),
        });

        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = rx.clone();
            let fs = fs.clone();
            let transport = transport.clone();
            let pipeline = Arc::downgrade(&pipeline);
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let outcome = job
                        .share
                        .refresh(&fs, transport.as_ref(), job.revision, job.previous)
                        .await;
                    debug!(worker, share = %job.share.name(), ?outcome, "refresh job done");
                    match pipeline.upgrade() {
                        Some(pipeline) => pipeline.finish(&outcome),
                        None => break,
                    }
                }
            }));
        }
        *pipeline.workers.lock() = handles;
        info!(workers, "refresh pipeline started");
        pipeline
    }

    /// Queues a job. Returns false once the pipeline has been closed.
    pub fn submit(&self, job: RefreshJob) -> bool {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn finish(&self, outcome: &RefreshOutcome) {
        let counter = match outcome {
            RefreshOutcome::Imported { .. } => &self.counters.imported,
            RefreshOutcome::Skipped => &self.counters.skipped,
            RefreshOutcome::Failed { .. } => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits until no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting jobs. Workers drain the queue and exit.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Closes the pipeline and waits for the workers to exit.
    pub async fn join(&self) {
        self.close();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Returns a snapshot of the job counters.
    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            imported: self.counters.imported.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RefreshPipeline {
    fn drop(&mut self) {
        for handle in self.workers.get_mut().drain(..) {
            handle.abort();
        }
    }
}
