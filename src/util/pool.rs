//! Bounded pool that writes directory stubs in the background.
//!
//! A directory listing hands its entries to [`StubWriter::submit`] and
//! returns immediately. A fixed set of worker threads drains a bounded
//! queue; when the queue is full the submitting thread writes the stubs
//! itself. Passes over the same directory are tracked together so the
//! cached marker is written once, by the last pass to finish, and only when
//! none of the passes failed.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, warn};

use crate::{model::fs::FileInfo, stub};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 256,
        }
    }
}

struct Job {
    base: PathBuf,
    entries: Vec<FileInfo>,
}

#[derive(Default)]
struct DirPasses {
    running: usize,
    errors: usize,
}

#[derive(Default)]
struct Shared {
    passes: Mutex<HashMap<PathBuf, DirPasses>>,
    pending: AtomicUsize,
}

impl Shared {
    fn begin(&self, base: &Path) {
        let mut passes = self.passes.lock().unwrap_or_else(PoisonError::into_inner);
        passes.entry(base.to_path_buf()).or_default().running += 1;
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn run(&self, job: Job) {
        let errors = stub::sync_dir(&job.base, &job.entries);

        let mut passes = self.passes.lock().unwrap_or_else(PoisonError::into_inner);
        let done = match passes.get_mut(&job.base) {
            None => None,
            Some(dir) => {
                dir.running -= 1;
                dir.errors += errors;
                if dir.running == 0 {
                    passes.remove(&job.base)
                } else {
                    None
                }
            }
        };

        if let Some(dir) = done {
            if dir.errors == 0 {
                match stub::touch_cached(&job.base) {
                    Err(err) => {
                        warn!(error_message=%err, error_group="touch_cached", base=%job.base.display())
                    }
                    Ok(()) => debug!(base=%job.base.display(), items=job.entries.len(), "dir cached"),
                }
            } else {
                warn!(errors = dir.errors, base=%job.base.display(), "write stub failed");
            }
        }
        drop(passes);

        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct StubWriter {
    tx: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl StubWriter {
    pub fn new(config: &PoolConfig) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Job>(config.queue_size);
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared::default());

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let rx = rx.clone();
            let shared = shared.clone();
            let worker = thread::Builder::new()
                .name(format!("kodofs-stub-{}", i))
                .spawn(move || worker_loop(rx, shared))?;
            workers.push(worker);
        }

        Ok(Self {
            tx: Some(tx),
            workers,
            shared,
        })
    }

    /// Queues a stub pass for `base`. Never blocks on a full queue: the
    /// caller runs the pass inline instead.
    pub fn submit(&self, base: PathBuf, entries: Vec<FileInfo>) {
        self.shared.begin(&base);
        let job = Job { base, entries };

        let job = match &self.tx {
            None => job,
            Some(tx) => match tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) => {
                    debug!(base=%job.base.display(), "stub queue full, writing inline");
                    job
                }
                Err(TrySendError::Disconnected(job)) => job,
            },
        };

        self.shared.run(job);
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Waits until every submitted pass has finished, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

impl Drop for StubWriter {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(error_group = "stub_worker", "stub worker panicked");
            }
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>, shared: Arc<Shared>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match job {
            Err(_) => return,
            Ok(job) => shared.run(job),
        }
    }
}
