// ========== Replica maintenance ==========

use async_trait::async_trait;
use dfs_lib::DfsPath;
use log::{info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaintenanceKind {
    /// Copy a hot file onto one more storage node.
    Replicate,
    /// Prune stale replicas after an exclusive access.
    Invalidate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaintenanceTask {
    pub kind: MaintenanceKind,
    pub path: DfsPath,
    /// Shared-lock count observed when the task was triggered. Only
    /// meaningful for `Replicate`.
    pub trigger_count: u64,
}

#[async_trait]
pub trait MaintenanceExecutor: Send + Sync {
    async fn execute(&self, task: MaintenanceTask) -> Result<(), String>;
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<MaintenanceTask>,
    dedup: HashSet<(MaintenanceKind, DfsPath)>,
}

/// FIFO of pending maintenance work with per-(kind, path) dedup: a path
/// triggered again while already queued is merged into the queued entry
/// rather than enqueued twice. Tasks run on one shared worker, not one
/// spawned thread per trigger.
#[derive(Default)]
pub struct MaintenanceQueue {
    inner: Mutex<QueueInner>,
}

impl MaintenanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: MaintenanceTask) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (task.kind, task.path.clone());
        if inner.dedup.contains(&key) {
            // Merge: keep the queue position, refresh the trigger count.
            if let Some(existing) = inner
                .items
                .iter_mut()
                .find(|t| t.kind == task.kind && t.path == task.path)
            {
                existing.trigger_count = existing.trigger_count.max(task.trigger_count);
            }
            return;
        }
        inner.dedup.insert(key);
        inner.items.push_back(task);
    }

    pub fn pop(&self) -> Option<MaintenanceTask> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let task = inner.items.pop_front()?;
        inner.dedup.remove(&(task.kind, task.path.clone()));
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs queued tasks until the token is cancelled. Each sweep drains the
/// queue; failures are logged and dropped, they never surface to clients.
pub fn spawn_maintenance_worker(
    queue: Arc<MaintenanceQueue>,
    executor: Arc<dyn MaintenanceExecutor>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            while let Some(task) = queue.pop() {
                let started = Instant::now();
                info!(
                    "maintenance task start: kind={:?}, path={}",
                    task.kind, task.path
                );
                match executor.execute(task.clone()).await {
                    Ok(()) => info!(
                        "maintenance task done: kind={:?}, path={}, elapsed={:?}",
                        task.kind,
                        task.path,
                        started.elapsed()
                    ),
                    Err(e) => warn!(
                        "maintenance task failed: kind={:?}, path={}, elapsed={:?}, err={}",
                        task.kind,
                        task.path,
                        started.elapsed(),
                        e
                    ),
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
        }
    })
}
