use dfs_lib::{DfsError, DfsPath, DfsResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writers: u32,
    write_requests: u32,
}

/// A read/write lock for one path, with write preference: a queued writer
/// blocks new readers, so a pending invalidation cannot starve behind an
/// unbounded stream of shared acquisitions.
///
/// Waits are cancellable; a cancelled wait leaves the counters exactly as
/// they were before the call.
#[derive(Debug, Default)]
pub struct PathLock {
    state: Mutex<LockState>,
    notify: Notify,
}

fn guard(state: &Mutex<LockState>) -> MutexGuard<'_, LockState> {
    // The critical sections below cannot panic, so poisoning is not a
    // meaningful signal here.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl PathLock {
    pub async fn lock_read(&self, cancel: &CancellationToken) -> DfsResult<()> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = guard(&self.state);
                if state.writers == 0 && state.write_requests == 0 {
                    state.readers += 1;
                    return Ok(());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {
                    return Err(DfsError::Cancelled("read lock wait interrupted".to_string()));
                }
            }
        }
    }

    pub fn unlock_read(&self) {
        {
            let mut state = guard(&self.state);
            state.readers = state.readers.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    pub async fn lock_write(&self, cancel: &CancellationToken) -> DfsResult<()> {
        guard(&self.state).write_requests += 1;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = guard(&self.state);
                if state.readers == 0 && state.writers == 0 {
                    state.write_requests -= 1;
                    state.writers += 1;
                    return Ok(());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {
                    guard(&self.state).write_requests -= 1;
                    // Readers may have been waiting on our queued request.
                    self.notify.notify_waiters();
                    return Err(DfsError::Cancelled("write lock wait interrupted".to_string()));
                }
            }
        }
    }

    pub fn unlock_write(&self) {
        {
            let mut state = guard(&self.state);
            state.writers = state.writers.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }
}

/// Lazily-populated map from path to lock record. Records are created on
/// first use and live for the lifetime of the table; the set of paths a
/// process ever locks is bounded by the namespace it serves.
#[derive(Debug, Default)]
pub struct PathLockTable {
    records: Mutex<HashMap<DfsPath, Arc<PathLock>>>,
}

impl PathLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock record for `path`, created if absent. Creation is
    /// idempotent under concurrent callers.
    pub fn record(&self, path: &DfsPath) -> Arc<PathLock> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .entry(path.clone())
            .or_insert_with(|| Arc::new(PathLock::default()))
            .clone()
    }

    /// Acquires the full lock chain for `target`: every path from the root
    /// down, in the global path order, shared on ancestors and in the
    /// requested mode on the target itself. On cancellation every lock
    /// acquired so far is released and no chain is held.
    pub async fn lock_chain(
        &self,
        target: &DfsPath,
        exclusive: bool,
        cancel: &CancellationToken,
    ) -> DfsResult<()> {
        let mut chain = target.ancestry();
        chain.sort();

        let mut held: Vec<(DfsPath, bool)> = Vec::with_capacity(chain.len());
        for path in chain {
            let is_target = path == *target;
            let take_exclusive = exclusive && is_target;
            let record = self.record(&path);
            let acquired = if take_exclusive {
                record.lock_write(cancel).await
            } else {
                record.lock_read(cancel).await
            };
            if let Err(err) = acquired {
                for (held_path, was_exclusive) in held.into_iter().rev() {
                    let record = self.record(&held_path);
                    if was_exclusive {
                        record.unlock_write();
                    } else {
                        record.unlock_read();
                    }
                }
                return Err(err);
            }
            held.push((path, take_exclusive));
        }
        Ok(())
    }

    /// Releases a chain acquired by `lock_chain`, deepest path first.
    pub fn unlock_chain(&self, target: &DfsPath, exclusive: bool) {
        let mut chain = target.ancestry();
        chain.sort();
        chain.reverse();

        for path in chain {
            let is_target = path == *target;
            let record = self.record(&path);
            if exclusive && is_target {
                record.unlock_write();
            } else {
                record.unlock_read();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn p(s: &str) -> DfsPath {
        DfsPath::parse(s).unwrap()
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    // ==================== Lock record ====================

    #[tokio::test]
    async fn test_readers_coexist() {
        let lock = PathLock::default();
        let cancel = token();
        lock.lock_read(&cancel).await.unwrap();
        timeout(Duration::from_millis(100), lock.lock_read(&cancel))
            .await
            .expect("second reader must not block")
            .unwrap();
        lock.unlock_read();
        lock.unlock_read();
    }

    #[tokio::test]
    async fn test_writer_excludes_everyone() {
        let lock = Arc::new(PathLock::default());
        let cancel = token();
        lock.lock_write(&cancel).await.unwrap();

        {
            let lock = lock.clone();
            let cancel = cancel.clone();
            assert!(
                timeout(Duration::from_millis(50), async move {
                    lock.lock_read(&cancel).await
                })
                .await
                .is_err(),
                "reader must wait behind a writer"
            );
        }
        {
            let lock = lock.clone();
            let cancel = cancel.clone();
            assert!(timeout(Duration::from_millis(50), async move {
                lock.lock_write(&cancel).await
            })
            .await
            .is_err());
        }

        lock.unlock_write();
        lock.lock_read(&cancel).await.unwrap();
        lock.unlock_read();
    }

    #[tokio::test]
    async fn test_write_preference_blocks_new_readers() {
        let lock = Arc::new(PathLock::default());
        let cancel = token();
        lock.lock_read(&cancel).await.unwrap();

        let writer_done = Arc::new(AtomicBool::new(false));
        let writer = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            let done = writer_done.clone();
            tokio::spawn(async move {
                lock.lock_write(&cancel).await.unwrap();
                done.store(true, Ordering::SeqCst);
                lock.unlock_write();
            })
        };
        sleep(Duration::from_millis(30)).await;
        assert!(!writer_done.load(Ordering::SeqCst));

        // A new reader must queue behind the pending writer.
        {
            let lock = lock.clone();
            let cancel = cancel.clone();
            assert!(timeout(Duration::from_millis(50), async move {
                lock.lock_read(&cancel).await
            })
            .await
            .is_err());
        }

        lock.unlock_read();
        writer.await.unwrap();
        assert!(writer_done.load(Ordering::SeqCst));

        // With the writer gone readers flow again.
        lock.lock_read(&cancel).await.unwrap();
        lock.unlock_read();
    }

    #[tokio::test]
    async fn test_cancelled_write_wait_unblocks_readers() {
        let lock = Arc::new(PathLock::default());
        let cancel = token();
        lock.lock_read(&cancel).await.unwrap();

        let writer_cancel = token();
        let writer = {
            let lock = lock.clone();
            let writer_cancel = writer_cancel.clone();
            tokio::spawn(async move { lock.lock_write(&writer_cancel).await })
        };
        sleep(Duration::from_millis(30)).await;

        writer_cancel.cancel();
        let err = writer.await.unwrap().unwrap_err();
        assert!(matches!(err, DfsError::Cancelled(_)));

        // The queued request was taken back; a fresh reader proceeds even
        // though the original reader still holds the lock.
        timeout(Duration::from_millis(100), lock.lock_read(&cancel))
            .await
            .expect("cancelled writer must not keep blocking readers")
            .unwrap();
        lock.unlock_read();
        lock.unlock_read();
    }

    // ==================== Chains ====================

    #[tokio::test]
    async fn test_sibling_exclusive_chains_are_concurrent() {
        let table = Arc::new(PathLockTable::new());
        let cancel = token();

        table.lock_chain(&p("/a/b"), true, &cancel).await.unwrap();
        // A sibling's chain shares /a and / in shared mode only.
        timeout(
            Duration::from_millis(100),
            table.lock_chain(&p("/a/c"), true, &cancel),
        )
        .await
        .expect("sibling exclusive locks must not conflict")
        .unwrap();

        table.unlock_chain(&p("/a/b"), true);
        table.unlock_chain(&p("/a/c"), true);
    }

    #[tokio::test]
    async fn test_parent_exclusive_waits_for_children() {
        let table = Arc::new(PathLockTable::new());
        let cancel = token();

        table.lock_chain(&p("/a/b"), true, &cancel).await.unwrap();
        table.lock_chain(&p("/a/c"), true, &cancel).await.unwrap();

        let parent_locked = Arc::new(AtomicBool::new(false));
        let parent = {
            let table = table.clone();
            let cancel = cancel.clone();
            let flag = parent_locked.clone();
            tokio::spawn(async move {
                table.lock_chain(&p("/a"), true, &cancel).await.unwrap();
                flag.store(true, Ordering::SeqCst);
                table.unlock_chain(&p("/a"), true);
            })
        };

        sleep(Duration::from_millis(30)).await;
        assert!(!parent_locked.load(Ordering::SeqCst));

        table.unlock_chain(&p("/a/b"), true);
        sleep(Duration::from_millis(30)).await;
        assert!(!parent_locked.load(Ordering::SeqCst));

        table.unlock_chain(&p("/a/c"), true);
        timeout(Duration::from_secs(1), parent)
            .await
            .expect("parent lock must proceed once children release")
            .unwrap();
        assert!(parent_locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_chain_acquisition_unwinds() {
        let table = Arc::new(PathLockTable::new());
        let cancel = token();

        // Hold /a/b exclusively so a second exclusive chain stalls there.
        table.lock_chain(&p("/a/b"), true, &cancel).await.unwrap();

        let waiter_cancel = token();
        let waiter = {
            let table = table.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { table.lock_chain(&p("/a/b"), true, &waiter_cancel).await })
        };
        sleep(Duration::from_millis(30)).await;
        waiter_cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DfsError::Cancelled(_))
        ));

        // The cancelled chain released its shared holds on / and /a: an
        // exclusive lock of /a goes through once /a/b's own chain is gone.
        table.unlock_chain(&p("/a/b"), true);
        timeout(Duration::from_millis(200), table.lock_chain(&p("/a"), true, &cancel))
            .await
            .expect("no residue may remain from the cancelled chain")
            .unwrap();
        table.unlock_chain(&p("/a"), true);
    }

    #[tokio::test]
    async fn test_no_deadlock_under_cross_locking() {
        let table = Arc::new(PathLockTable::new());
        let cancel = token();
        let mut tasks = Vec::new();

        // Many tasks locking interleaved targets in both modes; the shared
        // acquisition order makes a cycle impossible, so all terminate.
        for i in 0..8u32 {
            let table = table.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..20u32 {
                    let target = match (i + round) % 3 {
                        0 => p("/a/b"),
                        1 => p("/a/c"),
                        _ => p("/a"),
                    };
                    let exclusive = (i + round) % 2 == 0;
                    table.lock_chain(&target, exclusive, &cancel).await.unwrap();
                    tokio::task::yield_now().await;
                    table.unlock_chain(&target, exclusive);
                }
            }));
        }

        for task in tasks {
            timeout(Duration::from_secs(10), task)
                .await
                .expect("cross-locking tasks must all terminate")
                .unwrap();
        }
    }
}
