//! In-flight build sharing and small bounded caches.
//!
//! Both hand out [`Shared`] futures so every caller asking for the same key
//! awaits one computation. Results are `Result<T, ErrorKind>` because a
//! shared output must be `Clone`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::ErrorKind;

pub type Outcome<T> = std::result::Result<T, ErrorKind>;
pub type SharedOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Nothing panics while holding these locks; recover rather than poison
    // every later request.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// At most one running build per key.
///
/// A build is spawned onto the runtime, so it completes (and its result is
/// persisted by whoever wrote the future) even if every caller goes away.
/// The key is released when the build finishes, successfully or not.
pub struct BuildLocks<T> {
    inflight: Arc<Mutex<HashMap<String, SharedOutcome<T>>>>,
}
impl<T> Default for BuildLocks<T> {
    fn default() -> Self {
        Self { inflight: Arc::default() }
    }
}

/// Removes a finished build's key, including when the build panics.
struct Release<T> {
    inflight: Arc<Mutex<HashMap<String, SharedOutcome<T>>>>,
    key: String,
}
impl<T> Drop for Release<T> {
    fn drop(&mut self) {
        lock(&self.inflight).remove(&self.key);
    }
}

impl<T: Clone + Send + Sync + 'static> BuildLocks<T> {
    /// Join the build running under `key`, or start `build` as the new one.
    pub fn run<F>(&self, key: String, build: F) -> SharedOutcome<T>
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let mut inflight = lock(&self.inflight);
        if let Some(running) = inflight.get(&key) {
            tracing::trace!(key, "Joining in-flight build");
            return running.clone();
        }
        let release = Release { inflight: Arc::clone(&self.inflight), key: key.clone() };
        let shared = async move {
            let _release = release;
            build.await
        }
        .boxed()
        .shared();
        inflight.insert(key, shared.clone());
        // The spawned task can't release the key before this guard drops.
        tokio::spawn(shared.clone());
        shared
    }

    /// Number of builds currently running.
    pub fn len(&self) -> usize {
        lock(&self.inflight).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A small cache of shared loads, evicting the oldest insertion first.
///
/// Failed loads are dropped so the next caller retries.
pub struct BoundedCache<T> {
    capacity: usize,
    entries: Mutex<VecDeque<(String, SharedOutcome<T>)>>,
}
impl<T: Clone + Send + Sync + 'static> BoundedCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: Mutex::new(VecDeque::new()) }
    }

    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let pending = {
            let mut entries = lock(&self.entries);
            match entries.iter().find(|(cached, _)| cached == key) {
                Some((_, pending)) => pending.clone(),
                None => {
                    let pending = load().boxed().shared();
                    entries.push_back((key.to_string(), pending.clone()));
                    while entries.len() > self.capacity {
                        if let Some((evicted, _)) = entries.pop_front() {
                            tracing::debug!(evicted, "Evicted cache entry");
                        }
                    }
                    pending
                },
            }
        };
        let outcome = pending.clone().await;
        if outcome.is_err() {
            lock(&self.entries).retain(|(cached, entry)| !(cached == key && entry.ptr_eq(&pending)));
        }
        outcome
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).iter().any(|(cached, _)| cached == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_build() {
        let locks = BuildLocks::<u32>::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();
        let first = {
            let runs = Arc::clone(&runs);
            locks.run("etag:balanced:cn".to_string(), async move {
                runs.fetch_add(1, Ordering::SeqCst);
                gate.await.ok();
                Ok(7)
            })
        };
        let second = locks.run("etag:balanced:cn".to_string(), async { Ok(99) });
        assert_eq!(locks.len(), 1);
        release.send(()).unwrap();
        assert_eq!(futures::join!(first, second), (Ok(7), Ok(7)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // The spawned task may still be dropping its guard.
        tokio::task::yield_now().await;
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_build_releases_key() {
        let locks = BuildLocks::<u32>::default();
        let failed = locks.run("k".to_string(), async { Err(ErrorKind::Build("boom".to_string())) }).await;
        assert_eq!(failed, Err(ErrorKind::Build("boom".to_string())));
        tokio::task::yield_now().await;
        assert!(locks.is_empty());
        assert_eq!(locks.run("k".to_string(), async { Ok(1) }).await, Ok(1));
    }

    #[tokio::test]
    async fn test_build_finishes_without_callers() {
        let locks = BuildLocks::<u32>::default();
        let (done, finished) = oneshot::channel();
        drop(locks.run("k".to_string(), async move {
            done.send(()).ok();
            Ok(1)
        }));
        finished.await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_evicts_oldest_first() {
        let cache = BoundedCache::<u32>::new(2);
        assert_eq!(cache.get_or_load("a", || async { Ok(1) }).await, Ok(1));
        assert_eq!(cache.get_or_load("b", || async { Ok(2) }).await, Ok(2));
        // Cached: the loader is not called again
        assert_eq!(cache.get_or_load("a", || async { Ok(100) }).await, Ok(1));
        assert_eq!(cache.get_or_load("c", || async { Ok(3) }).await, Ok(3));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b") && cache.contains("c"));
        assert_eq!(cache.get_or_load("a", || async { Ok(10) }).await, Ok(10));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_forgets_failures() {
        let cache = BoundedCache::<u32>::new(2);
        let failed = cache.get_or_load("a", || async { Err(ErrorKind::InvalidData("corrupt".to_string())) }).await;
        assert!(failed.is_err());
        assert!(!cache.contains("a"));
        assert_eq!(cache.get_or_load("a", || async { Ok(1) }).await, Ok(1));
    }
}
