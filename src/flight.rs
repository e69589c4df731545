//! Single-flight request deduplication
//!
//! At most one operation runs per key. Callers that arrive while it is in
//! flight wait for and receive its outcome instead of starting their own.
//! Nothing is cached: the key is forgotten as soon as the operation ends.
//!
//! The operation runs on its own task. A waiter that goes away does not
//! stop it while other waiters remain; when the last waiter goes away the
//! operation is aborted.

use crate::error::{VstoreError, VstoreResult};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::AbortHandle;

/// Kind of deduplicated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightKind {
    /// Tiered lookup by weak fingerprint
    WeakLookup,
    /// Tiered lookup by strong fingerprint
    StrongLookup,
    /// Content copy from remote into local
    Backfill,
    /// Content copy from local into remote
    ContentMirror,
    /// Entry publication to remote
    EntryMirror,
    /// Verified content read from remote
    ContentFetch,
}

/// Deduplication key: operation kind plus the fingerprint or hash it acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FlightKey {
    pub kind: FlightKind,
    pub key: String,
}

impl FlightKey {
    pub fn new(kind: FlightKind, key: impl fmt::Display) -> Self {
        Self {
            kind,
            key: key.to_string(),
        }
    }
}

type FlightResult<T> = Result<T, Arc<VstoreError>>;
type SharedFlight<T> = Shared<BoxFuture<'static, FlightResult<T>>>;

struct Call<T> {
    id: u64,
    waiters: usize,
    shared: SharedFlight<T>,
    abort: AbortHandle,
}

struct Registry<T> {
    next_id: u64,
    calls: HashMap<FlightKey, Call<T>>,
}

/// Outcome of `SingleFlight::run`
#[derive(Debug)]
pub struct Joined<T> {
    pub result: VstoreResult<T>,
    /// True when this caller joined an operation another caller started
    pub deduplicated: bool,
}

/// Per-key in-flight operation table
pub struct SingleFlight<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                calls: HashMap::new(),
            })),
        }
    }
}

/// Drops one waiter; aborts the operation when it was the last one
struct WaiterGuard<T> {
    registry: Arc<Mutex<Registry<T>>>,
    key: FlightKey,
    id: u64,
}

impl<T> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(call) = registry.calls.get_mut(&self.key) else {
            return;
        };
        if call.id != self.id {
            return;
        }
        call.waiters -= 1;
        if call.waiters == 0 {
            call.abort.abort();
            registry.calls.remove(&self.key);
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` unless an operation for `key` is already in flight, in
    /// which case wait for that one instead. Errors reach every waiter as
    /// `VstoreError::Shared`.
    pub async fn run<F>(&self, key: FlightKey, work: F) -> Joined<T>
    where
        F: Future<Output = VstoreResult<T>> + Send + 'static,
    {
        let (shared, guard, deduplicated) = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);

            if let Some(call) = registry.calls.get_mut(&key) {
                call.waiters += 1;
                let guard = WaiterGuard {
                    registry: Arc::clone(&self.registry),
                    key,
                    id: call.id,
                };
                (call.shared.clone(), guard, true)
            } else {
                let id = registry.next_id;
                registry.next_id += 1;

                let cleanup = Arc::clone(&self.registry);
                let cleanup_key = key.clone();
                let task = tokio::spawn(async move {
                    let result = work.await.map_err(Arc::new);
                    let mut registry = cleanup.lock().unwrap_or_else(PoisonError::into_inner);
                    if registry.calls.get(&cleanup_key).is_some_and(|c| c.id == id) {
                        registry.calls.remove(&cleanup_key);
                    }
                    result
                });
                let abort = task.abort_handle();

                let shared = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => Err(Arc::new(VstoreError::Cancelled)),
                        Err(e) => Err(Arc::new(VstoreError::Internal(format!(
                            "single-flight task failed: {e}"
                        )))),
                    }
                }
                .boxed()
                .shared();

                registry.calls.insert(
                    key.clone(),
                    Call {
                        id,
                        waiters: 1,
                        shared: shared.clone(),
                        abort,
                    },
                );
                let guard = WaiterGuard {
                    registry: Arc::clone(&self.registry),
                    key,
                    id,
                };
                (shared, guard, false)
            }
        };

        let result = shared.await.map_err(VstoreError::Shared);
        drop(guard);

        Joined {
            result,
            deduplicated,
        }
    }

    /// Stop handing the in-flight operation for `key` to new callers.
    ///
    /// The operation keeps running for the callers already waiting on it.
    pub fn forget(&self, key: &FlightKey) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.calls.remove(key);
    }

    /// Number of operations currently in flight
    pub fn in_flight(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .len()
    }
}
