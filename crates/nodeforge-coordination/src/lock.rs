//! Named resource locks.
//!
//! Each key maps to a single-permit semaphore. Tokio's semaphore hands out
//! permits in request order, which makes every lock FIFO-fair. Reentrancy is
//! tracked per [`HolderId`] rather than per thread, since one logical
//! operation may hop threads between suspension points.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::CoordinationError;

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

impl HolderId {
    /// Allocate a fresh, process-unique holder id.
    pub fn next() -> Self {
        Self(NEXT_HOLDER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "holder-{}", self.0)
    }
}

struct Held {
    holder: HolderId,
    depth: usize,
    _permit: OwnedSemaphorePermit,
}

struct LockEntry {
    semaphore: Arc<Semaphore>,
    held: Option<Held>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            held: None,
        }
    }
}

/// Registry of named, reentrant, fair locks.
#[derive(Default)]
pub struct LockCoordinator {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire `key` for `holder`, waiting at most `timeout`.
    ///
    /// A holder that already owns the key re-enters immediately; each
    /// successful acquire must be paired with one [`release`](Self::release).
    pub async fn acquire(
        &self,
        key: &str,
        holder: HolderId,
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        let semaphore = {
            let mut entries = self.entries();
            let entry = entries.entry(key.to_string()).or_insert_with(LockEntry::new);
            if let Some(held) = entry.held.as_mut().filter(|h| h.holder == holder) {
                held.depth += 1;
                debug!(key, %holder, depth = held.depth, "lock re-entered");
                return Ok(());
            }
            Arc::clone(&entry.semaphore)
        };

        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // The semaphore is owned by the registry and never closed.
            Ok(Err(_)) => {
                return Err(CoordinationError::Abandoned {
                    key: key.to_string(),
                });
            }
            Err(_) => {
                warn!(key, %holder, ?timeout, "lock acquisition timed out");
                return Err(CoordinationError::LockTimeout {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
        };

        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_insert_with(LockEntry::new);
        entry.held = Some(Held {
            holder,
            depth: 1,
            _permit: permit,
        });
        debug!(key, %holder, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
        Ok(())
    }

    /// Release one level of `holder`'s hold on `key`.
    ///
    /// Returns `false` without side effects when `holder` does not hold the
    /// key.
    pub fn release(&self, key: &str, holder: HolderId) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let Some(held) = entry.held.as_mut().filter(|h| h.holder == holder) else {
            return false;
        };

        held.depth -= 1;
        if held.depth > 0 {
            debug!(key, %holder, depth = held.depth, "lock depth decreased");
            return true;
        }

        entry.held = None;
        debug!(key, %holder, "lock released");
        // Waiters keep their own handle on the semaphore, so an entry nobody
        // else references can go.
        if Arc::strong_count(&entry.semaphore) == 1 {
            entries.remove(key);
        }
        true
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_held(&self, key: &str) -> bool {
        self.entries().get(key).is_some_and(|e| e.held.is_some())
    }

    /// Run `operation` while holding `key`.
    ///
    /// On timeout the operation is never started and the timeout error is
    /// returned through `E`. The lock is released when the operation
    /// finishes, fails, or is dropped mid-flight.
    pub async fn with_lock<F, T, E>(
        &self,
        key: &str,
        holder: HolderId,
        timeout: Duration,
        operation: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<CoordinationError>,
    {
        self.acquire(key, holder, timeout).await?;
        let _guard = ReleaseOnDrop {
            coordinator: self,
            key,
            holder,
        };
        operation.await
    }
}

struct ReleaseOnDrop<'a> {
    coordinator: &'a LockCoordinator,
    key: &'a str,
    holder: HolderId,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.key, self.holder);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    const KEY: &str = "remote-target-attachment";

    #[tokio::test]
    async fn acquire_and_release() {
        let locks = LockCoordinator::new();
        let holder = HolderId::next();

        locks.acquire(KEY, holder, Duration::from_millis(100)).await.unwrap();
        assert!(locks.is_held(KEY));
        assert!(locks.release(KEY, holder));
        assert!(!locks.is_held(KEY));
    }

    #[tokio::test]
    async fn second_holder_times_out() {
        let locks = LockCoordinator::new();
        let (a, b) = (HolderId::next(), HolderId::next());

        locks.acquire(KEY, a, Duration::from_millis(100)).await.unwrap();
        let err = locks.acquire(KEY, b, Duration::from_millis(20)).await.unwrap_err();

        assert_eq!(
            err,
            CoordinationError::LockTimeout {
                key: KEY.to_string(),
                waited: Duration::from_millis(20)
            }
        );
        // The timed-out waiter never took the lock.
        assert!(!locks.release(KEY, b));
        assert!(locks.release(KEY, a));
    }

    #[tokio::test]
    async fn timed_out_operation_is_never_entered() {
        let locks = LockCoordinator::new();
        let (a, b) = (HolderId::next(), HolderId::next());
        let entered = AtomicBool::new(false);

        locks.acquire(KEY, a, Duration::from_millis(100)).await.unwrap();
        let result: Result<(), CoordinationError> = locks
            .with_lock(KEY, b, Duration::from_millis(20), async {
                entered.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CoordinationError::LockTimeout { .. })));
        assert!(!entered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn holder_reenters_and_must_release_each_level() {
        let locks = LockCoordinator::new();
        let (a, b) = (HolderId::next(), HolderId::next());
        let wait = Duration::from_millis(20);

        locks.acquire(KEY, a, wait).await.unwrap();
        locks.acquire(KEY, a, wait).await.unwrap();

        assert!(locks.release(KEY, a));
        assert!(locks.is_held(KEY));
        assert!(locks.acquire(KEY, b, wait).await.is_err());

        assert!(locks.release(KEY, a));
        locks.acquire(KEY, b, wait).await.unwrap();
        assert!(locks.release(KEY, b));
    }

    #[tokio::test]
    async fn nested_with_lock_reenters() {
        let locks = LockCoordinator::new();
        let holder = HolderId::next();
        let wait = Duration::from_millis(20);

        let value: Result<u32, CoordinationError> = locks
            .with_lock(KEY, holder, wait, async {
                locks.with_lock(KEY, holder, wait, async { Ok(7) }).await
            })
            .await;

        assert_eq!(value.unwrap(), 7);
        assert!(!locks.is_held(KEY));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_noop() {
        let locks = LockCoordinator::new();
        let (a, b) = (HolderId::next(), HolderId::next());

        assert!(!locks.release(KEY, a));
        locks.acquire(KEY, a, Duration::from_millis(20)).await.unwrap();
        assert!(!locks.release(KEY, b));
        assert!(locks.is_held(KEY));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = LockCoordinator::new();
        let (a, b) = (HolderId::next(), HolderId::next());
        let wait = Duration::from_millis(20);

        locks.acquire("power", a, wait).await.unwrap();
        locks.acquire("boot", b, wait).await.unwrap();
        assert!(locks.is_held("power"));
        assert!(locks.is_held("boot"));
    }

    #[tokio::test]
    async fn guarded_blocks_never_overlap() {
        let locks = Arc::new(LockCoordinator::new());
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (locks, inside, overlaps) =
                (Arc::clone(&locks), Arc::clone(&inside), Arc::clone(&overlaps));
            handles.push(tokio::spawn(async move {
                let holder = HolderId::next();
                locks
                    .with_lock(KEY, holder, Duration::from_secs(5), async {
                        if inside.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.store(false, Ordering::SeqCst);
                        Ok::<_, CoordinationError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!locks.is_held(KEY));
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let locks = Arc::new(LockCoordinator::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = HolderId::next();
        locks.acquire(KEY, first, Duration::from_millis(100)).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..3 {
            let (locks, order) = (Arc::clone(&locks), Arc::clone(&order));
            handles.push(tokio::spawn(async move {
                let holder = HolderId::next();
                locks.acquire(KEY, holder, Duration::from_secs(5)).await.unwrap();
                order.lock().unwrap().push(n);
                locks.release(KEY, holder);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        locks.release(KEY, first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
    }

    #[tokio::test]
    async fn dropped_operation_releases_lock() {
        let locks = Arc::new(LockCoordinator::new());
        let holder = HolderId::next();

        let task = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .with_lock(KEY, holder, Duration::from_millis(100), async {
                        std::future::pending::<Result<(), CoordinationError>>().await
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(locks.is_held(KEY));

        task.abort();
        let _ = task.await;
        assert!(!locks.is_held(KEY));
    }
}
