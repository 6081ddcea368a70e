//! State shared by every cloner of one migration.

use bson::Timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

/// Migration wide context, passed to every cloner as `Arc<MigrationSharedData>`.
///
/// Immutable facts (migration id, resuming) are plain fields.  Mutable ones live behind one
/// lock, held for a whole read-then-write and never across a network or storage call.
#[derive(Debug)]
pub struct MigrationSharedData {
    migration_id: Uuid,
    resuming: bool,
    cancelled: AtomicBool,
    inner: Mutex<SharedInner>,
}

#[derive(Debug, Default)]
struct SharedInner {
    last_visible_op_time: Option<Timestamp>,
    sync_failure: Option<String>,
}

impl MigrationSharedData {
    /// shared data for a new migration with a random id.
    pub fn new(resuming: bool) -> Self {
        Self::with_migration_id(Uuid::new_v4(), resuming)
    }

    /// shared data for migration `migration_id`.
    pub fn with_migration_id(migration_id: Uuid, resuming: bool) -> Self {
        MigrationSharedData {
            migration_id,
            resuming,
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(SharedInner::default()),
        }
    }

    /// migration id.
    pub fn migration_id(&self) -> Uuid {
        self.migration_id
    }

    /// Is this migration a retry of a previous attempt?  Only then may collections
    /// already exist on the recipient.
    pub fn is_resuming(&self) -> bool {
        self.resuming
    }

    /// Ask every cloner of this migration to stop at its next check point.
    pub fn cancel(&self) {
        info!(migration_id = %self.migration_id, "Migration cancelled, cloners will exit.");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Record the first failure of an asynchronous task; later ones are only logged.
    pub fn set_sync_failed(&self, reason: String) {
        let mut inner = self.lock();
        match &inner.sync_failure {
            None => inner.sync_failure = Some(reason),
            Some(first) => warn!(%first, %reason, "Migration already failed, ignore later failure."),
        }
    }

    /// first recorded asynchronous failure.
    pub fn sync_failure(&self) -> Option<String> {
        self.lock().sync_failure.clone()
    }

    /// Should cloners stop?  True after cancellation or a recorded failure.
    pub fn must_exit(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.lock().sync_failure.is_some()
    }

    /// Advance the last op time the donor made visible to us.  Never moves backwards.
    pub fn advance_last_visible_op_time(&self, ts: Timestamp) {
        let mut inner = self.lock();
        if inner.last_visible_op_time.map_or(true, |current| current < ts) {
            inner.last_visible_op_time = Some(ts);
        }
    }

    /// last op time the donor made visible to us.
    pub fn last_visible_op_time(&self) -> Option<Timestamp> {
        self.lock().last_visible_op_time
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
