//! Ordered execution of local database work.

use crossbeam::channel::{self, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CloneError, Result};

/// A unit of local database work.
pub type DbWork = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Identifies one scheduled unit of work, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// submission sequence number, starting from 0.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

/// Runs database work asynchronously, in submission order.
pub trait WorkScheduler: Send + Sync {
    /// Schedule `task`, it runs after every previously scheduled task.
    fn schedule(&self, task: DbWork) -> Result<TaskHandle>;

    /// Block until every previously scheduled task completed.
    ///
    /// Returns the first task failure since the last drain.
    fn drain_all(&self) -> Result<()>;
}

enum TaskStatus {
    Done,
    Skipped,
    Failed(CloneError),
}

/// [WorkScheduler] backed by a single thread rayon pool.
///
/// Once a task fails, the tasks queued behind it are skipped: the recipient keeps holding a
/// prefix of what was scheduled.
pub struct OrderedScheduler {
    pool: ThreadPool,
    sender: Sender<TaskStatus>,
    receiver: Receiver<TaskStatus>,
    pending: AtomicUsize,
    next_seq: AtomicU64,
    failed: Arc<AtomicBool>,
}

impl OrderedScheduler {
    /// create a scheduler with its own worker thread.
    pub fn new() -> Result<OrderedScheduler> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|_| "cloner db worker".to_string())
            .build()
            .map_err(|_| CloneError::SchedulerShutdown)?;
        let (sender, receiver) = channel::unbounded();
        Ok(OrderedScheduler {
            pool,
            sender,
            receiver,
            pending: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            failed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl WorkScheduler for OrderedScheduler {
    fn schedule(&self, task: DbWork) -> Result<TaskHandle> {
        let handle = TaskHandle(self.next_seq.fetch_add(1, Ordering::SeqCst));
        let sender = self.sender.clone();
        let failed = self.failed.clone();
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pool.spawn_fifo(move || {
            let status = if failed.load(Ordering::SeqCst) {
                TaskStatus::Skipped
            } else {
                match task() {
                    Ok(()) => TaskStatus::Done,
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        TaskStatus::Failed(e)
                    }
                }
            };
            let _ = sender.send(status);
        });
        debug!(seq = handle.seq(), "Scheduled database work.");
        Ok(handle)
    }

    fn drain_all(&self) -> Result<()> {
        let mut first_error = None;
        while self.pending.load(Ordering::SeqCst) > 0 {
            match self.receiver.recv() {
                Ok(TaskStatus::Done) => {}
                Ok(TaskStatus::Skipped) => {
                    warn!("Database work skipped because an earlier task failed.");
                }
                Ok(TaskStatus::Failed(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(_) => return Err(CloneError::SchedulerShutdown),
            }
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        self.failed.store(false, Ordering::SeqCst);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
