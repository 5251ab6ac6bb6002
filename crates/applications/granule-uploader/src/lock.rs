//! Advisory lock over the shared parameter store
//!
//! The lock is a single parameter holding `"True"` while some run is updating
//! the license pool and `"False"` otherwise. Older runs that only know the
//! polling contract keep working against the same flag:
//!
//! ```text
//! poll flag ──"True"──► sleep(poll_interval) ──► poll flag
//!     │
//!     └─"False"/absent──► conditional write "True" ──lost race──► poll flag
//!                                  │
//!                                  └─written──► LockGuard
//! ```
//!
//! The write is conditional on the version that was read as `"False"` (or on
//! the flag not existing yet). On a store that can only detect a lost race
//! after writing (SSM), the losing `"True"` has already landed. What it
//! replaced decides ownership: over a `"False"` the rival had already
//! released, so the flag is ours and is kept; over a rival's `"True"` the
//! rival still holds it and will release it.
//!
//! Release writes `"False"`. [`DistributedLock::with_lock`] awaits release on
//! every exit path of the critical section; a guard dropped unreleased
//! (panic, cancelled future) schedules a best-effort release on the runtime.

use crate::error::{Result, UploaderError};
use crate::store::{ParameterStore, WriteOutcome, WritePrecondition};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Flag value while the lock is held
pub const HELD: &str = "True";

/// Flag value while the lock is free
pub const FREE: &str = "False";

/// Default interval between polls of a held flag
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Options for lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Sleep between polls while the flag is held
    pub poll_interval: Duration,
    /// Give up after this long; `None` waits forever
    pub max_wait: Option<Duration>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

impl AcquireOptions {
    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set maximum wait
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

/// Advisory lock on a named flag in the parameter store
pub struct DistributedLock {
    store: Arc<dyn ParameterStore>,
    name: String,
    options: AcquireOptions,
}

impl DistributedLock {
    /// Create a lock on the flag `name`
    pub fn new(store: Arc<dyn ParameterStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            options: AcquireOptions::default(),
        }
    }

    /// Set acquisition options
    pub fn with_options(mut self, options: AcquireOptions) -> Self {
        self.options = options;
        self
    }

    /// Flag name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll until the flag is free, then take it
    ///
    /// Store failures abort immediately. With `max_wait` set, returns
    /// [`UploaderError::LockTimeout`] once the wait is exceeded.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let start = Instant::now();

        loop {
            let precondition = match self.store.get(&self.name).await? {
                Some(flag) if flag.value == HELD => {
                    info!(lock = %self.name, "Waiting for license retrieval...");
                    self.wait(start).await?;
                    continue;
                }
                Some(flag) => WritePrecondition::MatchesVersion(flag.version),
                None => WritePrecondition::DoesNotExist,
            };

            match self.store.put(&self.name, HELD, precondition).await? {
                WriteOutcome::Written { version } => {
                    debug!(lock = %self.name, version, "Lock acquired");
                    return Ok(self.guard());
                }
                // Our "True" replaced a free flag, so nobody else holds it
                WriteOutcome::Raced {
                    version,
                    replaced: Some(previous),
                } if previous == FREE => {
                    warn!(lock = %self.name, version, "Took lock released during a race");
                    return Ok(self.guard());
                }
                // Replaced a rival's "True" (theirs to release) or an unknown value
                WriteOutcome::Raced { version, replaced } => {
                    if replaced.is_none() {
                        error!(
                            lock = %self.name,
                            version,
                            "Lost race for lock and cannot tell who holds it"
                        );
                    }
                    debug!(lock = %self.name, "Lost race for lock, polling again");
                    self.check_deadline(start)?;
                }
                WriteOutcome::PreconditionFailed => {
                    debug!(lock = %self.name, "Lost race for lock, polling again");
                    self.check_deadline(start)?;
                }
            }
        }
    }

    /// Run `critical` while holding the lock
    ///
    /// The lock is released after `critical` finishes, whether it succeeded
    /// or failed. An error from `critical` takes precedence over a release
    /// error.
    pub async fn with_lock<F, Fut, T>(&self, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire().await?;
        let outcome = critical().await;
        let released = guard.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                error!(lock = %self.name, error = %release_err, "Could not remove hold after failure");
                Err(err)
            }
        }
    }

    fn guard(&self) -> LockGuard {
        LockGuard {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            released: false,
        }
    }

    async fn wait(&self, start: Instant) -> Result<()> {
        self.check_deadline(start)?;
        tokio::time::sleep(self.options.poll_interval).await;
        Ok(())
    }

    fn check_deadline(&self, start: Instant) -> Result<()> {
        match self.options.max_wait {
            Some(max_wait) if start.elapsed() >= max_wait => Err(UploaderError::LockTimeout {
                name: self.name.clone(),
                waited: start.elapsed(),
            }),
            _ => Ok(()),
        }
    }
}

/// Holds the lock until released
#[must_use = "dropping the guard releases the lock in the background"]
pub struct LockGuard {
    store: Arc<dyn ParameterStore>,
    name: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Flag name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match self.store.put(&self.name, FREE, WritePrecondition::None).await {
            Ok(_) => {
                debug!(lock = %self.name, "Lock released");
                Ok(())
            }
            Err(e) => {
                error!(lock = %self.name, error = %e, "Could not remove a hold on licenses...");
                Err(e)
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(lock = %self.name, "Lock guard dropped while held, releasing in background");

        // Outside a runtime there is nothing to drive the release
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(lock = %self.name, "No runtime to release lock, flag left held");
            return;
        };

        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            if let Err(e) = store.put(&name, FREE, WritePrecondition::None).await {
                error!(lock = %name, error = %e, "Background lock release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::CheckThenWriteStore;
    use crate::store::MemoryParameterStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const FLAG: &str = "test-idl-retrieving-license";

    fn fast() -> AcquireOptions {
        AcquireOptions::default().with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_acquire_absent_flag() {
        let store = MemoryParameterStore::new();
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG).with_options(fast());

        let guard = assert_ok!(lock.acquire().await);
        assert_eq!(store.value(FLAG).as_deref(), Some(HELD));

        assert_ok!(guard.release().await);
        assert_eq!(store.value(FLAG).as_deref(), Some(FREE));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let store = MemoryParameterStore::new();
        store.insert(FLAG, HELD);
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG).with_options(fast());

        let releaser = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.insert(FLAG, FREE);
            })
        };

        let guard = assert_ok!(lock.acquire().await);
        assert_eq!(store.value(FLAG).as_deref(), Some(HELD));
        assert_ok!(guard.release().await);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let store = MemoryParameterStore::new();
        store.insert(FLAG, HELD);
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG)
            .with_options(fast().with_max_wait(Duration::from_millis(20)));

        let err = assert_err!(lock.acquire().await);
        assert!(matches!(err, UploaderError::LockTimeout { .. }));
        assert_eq!(store.value(FLAG).as_deref(), Some(HELD));
    }

    #[tokio::test]
    async fn test_raced_take_after_rival_released_keeps_flag() {
        let store = CheckThenWriteStore::new(MemoryParameterStore::new());
        store.inner.insert(FLAG, FREE);
        // Another run takes and releases the flag between our check and write
        store.interleave(FLAG, &[HELD, FREE]);
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG)
            .with_options(fast().with_max_wait(Duration::from_millis(200)));

        let guard = assert_ok!(lock.acquire().await);
        assert_eq!(store.inner.value(FLAG).as_deref(), Some(HELD));

        assert_ok!(guard.release().await);
        assert_eq!(store.inner.value(FLAG).as_deref(), Some(FREE));
    }

    #[tokio::test]
    async fn test_raced_take_over_rival_hold_waits_for_rival() {
        let store = CheckThenWriteStore::new(MemoryParameterStore::new());
        store.inner.insert(FLAG, FREE);
        store.interleave(FLAG, &[HELD]);
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG)
            .with_options(fast().with_max_wait(Duration::from_millis(20)));

        // The rival still holds the flag, so the raced write does not take it
        let err = assert_err!(lock.acquire().await);
        assert!(matches!(err, UploaderError::LockTimeout { .. }));

        // Once the rival releases, the flag is free for us
        store.inner.insert(FLAG, FREE);
        let guard = assert_ok!(lock.acquire().await);
        assert_ok!(guard.release().await);
        assert_eq!(store.inner.value(FLAG).as_deref(), Some(FREE));
    }

    #[tokio::test]
    async fn test_lost_create_race_polls_until_released() {
        let store = CheckThenWriteStore::new(MemoryParameterStore::new());
        // Flag absent; another run creates it held before our create lands
        store.interleave(FLAG, &[HELD]);
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG).with_options(fast());

        let releaser = {
            let inner = store.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                inner.insert(FLAG, FREE);
            })
        };

        let guard = assert_ok!(lock.acquire().await);
        assert_eq!(store.inner.value(FLAG).as_deref(), Some(HELD));
        assert_ok!(guard.release().await);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store = MemoryParameterStore::new();
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG).with_options(fast());

        let result: Result<()> = lock
            .with_lock(|| async { Err(UploaderError::config("boom")) })
            .await;

        assert!(matches!(result, Err(UploaderError::Config(_))));
        assert_eq!(store.value(FLAG).as_deref(), Some(FREE));
    }

    #[tokio::test]
    async fn test_with_lock_serializes_contenders() {
        let store = MemoryParameterStore::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = DistributedLock::new(Arc::new(store.clone()), FLAG).with_options(fast());
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                lock.with_lock(|| async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for task in tasks {
            assert_ok!(task.await.unwrap());
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(store.value(FLAG).as_deref(), Some(FREE));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let store = MemoryParameterStore::new();
        let lock = DistributedLock::new(Arc::new(store.clone()), FLAG).with_options(fast());

        let guard = lock.acquire().await.unwrap();
        drop(guard);

        for _ in 0..50 {
            if store.value(FLAG).as_deref() == Some(FREE) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("lock was not released after guard drop");
    }
}
