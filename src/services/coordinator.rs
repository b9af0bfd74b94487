//! Transfer session coordination.
//!
//! - Per-upload mutual exclusion around the append critical section
//!   (validate offset, write bytes, advance offset). Waiters queue; different
//!   ids never share a lock.
//! - Completion event delivery through a `CompletionSink`.
//! - The reaper task: expiry of inactive uploads and redelivery of pending
//!   completion events.

use crate::{
    models::upload::Upload,
    services::{
        metadata_store::MetadataStore,
        notify::{CompletionEvent, CompletionSink},
        upload_service::UploadService,
    },
};
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

pub struct TransferCoordinator {
    locks: Arc<LockTable>,
    sink: Arc<dyn CompletionSink>,
}

/// Exclusive hold on one upload id. Released on drop.
pub struct UploadLock {
    // Field order matters: the guard's reference must be gone before the
    // entry checks whether anyone still uses the mutex.
    _guard: OwnedMutexGuard<()>,
    _entry: LockEntry,
}

/// Interest in one lock-table entry, held by both waiters and holders.
struct LockEntry {
    id: String,
    table: Arc<LockTable>,
}

impl Drop for LockEntry {
    fn drop(&mut self) {
        // Only the table's own reference left: nobody holds or awaits it.
        self.table
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl TransferCoordinator {
    pub fn new(sink: Arc<dyn CompletionSink>) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            sink,
        }
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: &str) -> UploadLock {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // Declared before the wait so a cancelled waiter still cleans up.
        let entry = LockEntry {
            id: id.to_string(),
            table: self.locks.clone(),
        };
        let guard = mutex.lock_owned().await;
        UploadLock {
            _guard: guard,
            _entry: entry,
        }
    }

    /// Number of ids currently locked or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Deliver the completion event for `upload` and record the
    /// acknowledgement. Returns whether the sink accepted it.
    pub async fn notify_completed(&self, store: &dyn MetadataStore, upload: &Upload) -> bool {
        let event = CompletionEvent::from_upload(upload);
        match self.sink.deliver(&event).await {
            Ok(()) => {
                if let Err(err) = store.mark_notified(&upload.id).await {
                    // The event will be replayed; sinks dedupe by id.
                    warn!(upload_id = %upload.id, "could not record completion delivery: {}", err);
                }
                true
            }
            Err(err) => {
                warn!(upload_id = %upload.id, "completion delivery failed, will retry: {}", err);
                false
            }
        }
    }

    /// Retry every completed upload whose event was never acknowledged.
    pub async fn redeliver_pending(&self, store: &dyn MetadataStore) -> usize {
        let pending = match store.list_pending_notifications().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!("listing pending completions failed: {}", err);
                return 0;
            }
        };
        let mut delivered = 0;
        for upload in &pending {
            if self.notify_completed(store, upload).await {
                delivered += 1;
            }
        }
        if delivered > 0 {
            info!("redelivered {} completion events", delivered);
        }
        delivered
    }
}

/// Reaper settings.
#[derive(Clone, Copy, Debug)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub retention: Duration,
    /// Also remove completed uploads once their event was delivered.
    pub reap_completed: bool,
}

/// Run the reaper until the runtime shuts down or the handle is aborted.
pub fn spawn_reaper(service: UploadService, config: ReaperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service
                .reap_expired(config.retention, config.reap_completed)
                .await
            {
                Ok(0) => debug!("reaper pass: nothing expired"),
                Ok(removed) => info!("reaper removed {} expired uploads", removed),
                Err(err) => warn!("reaper pass failed: {}", err),
            }
            service.redeliver_pending().await;
        }
    })
}
