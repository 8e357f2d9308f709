//! Callback container with weakly-bound receivers.
//!
//! A handle wraps either a plain function or a (weak receiver, method) pair.
//! Handles whose receiver has been dropped are pruned after the iteration
//! that discovers them. Removals requested while any iteration is in
//! progress are deferred until the last iteration finishes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

/// Error type returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
/// Return type of user callbacks.
pub type CallbackResult = Result<(), BoxError>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Function<T> = dyn Fn(&T) -> CallbackResult + Send + Sync;
/// Returns `None` once the receiver is gone.
type Bound<T> = dyn Fn(&T) -> Option<CallbackResult> + Send + Sync;

enum Target<T> {
    Function(Box<Function<T>>),
    Bound(Box<Bound<T>>),
}

/// A registered callback. Clones share identity, so the handle passed to
/// `add` can later be passed to `remove`.
pub struct CallbackHandle<T> {
    id: u64,
    target: Arc<Target<T>>,
}

impl<T> Clone for CallbackHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            target: Arc::clone(&self.target),
        }
    }
}

impl<T> std::fmt::Debug for CallbackHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match *self.target {
            Target::Function(_) => "function",
            Target::Bound(_) => "bound",
        };
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

impl<T: 'static> CallbackHandle<T> {
    /// Callback holding a strong reference to its closure.
    pub fn function<F>(callback: F) -> Self
    where
        F: Fn(&T) -> CallbackResult + Send + Sync + 'static,
    {
        Self::from_target(Target::Function(Box::new(callback)))
    }

    /// Callback bound to `receiver` without keeping it alive.
    pub fn bound<R>(receiver: &Arc<R>, method: fn(&R, &T) -> CallbackResult) -> Self
    where
        R: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(receiver);
        Self::from_target(Target::Bound(Box::new(move |arg| {
            weak.upgrade().map(|receiver| method(&receiver, arg))
        })))
    }

    fn from_target(target: Target<T>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            target: Arc::new(target),
        }
    }
}

impl<T> CallbackHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn invoke(&self, arg: &T) -> Option<CallbackResult> {
        match &*self.target {
            Target::Function(f) => Some(f(arg)),
            Target::Bound(f) => f(arg),
        }
    }
}

struct Inner<T> {
    handles: Vec<CallbackHandle<T>>,
    iterating: usize,
    deferred: Vec<u64>,
}

/// Ordered set of callbacks safe to mutate from inside a callback.
pub struct CallbackSet<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for CallbackSet<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                handles: Vec::new(),
                iterating: 0,
                deferred: Vec::new(),
            }),
        }
    }
}

impl<T> CallbackSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`; `preferred` puts it first. Adding a handle that
    /// is already present is a no-op.
    pub fn add(&self, handle: CallbackHandle<T>, preferred: bool) {
        let mut inner = self.inner.lock();
        inner.deferred.retain(|id| *id != handle.id);
        if inner.handles.iter().any(|h| h.id == handle.id) {
            return;
        }
        if preferred {
            inner.handles.insert(0, handle);
        } else {
            inner.handles.push(handle);
        }
    }

    pub fn remove(&self, handle: &CallbackHandle<T>) {
        let mut inner = self.inner.lock();
        if inner.iterating > 0 {
            inner.deferred.push(handle.id);
        } else {
            inner.handles.retain(|h| h.id != handle.id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every live callback in order with `arg`, returning how many
    /// ran successfully. Failures and panics are logged, never propagated.
    pub fn invoke_all(&self, arg: &T) -> usize {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.iterating += 1;
            inner.handles.clone()
        };

        let mut succeeded = 0;
        let mut dead = Vec::new();
        for handle in &snapshot {
            if self.inner.lock().deferred.contains(&handle.id) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| handle.invoke(arg))) {
                Ok(Some(Ok(()))) => succeeded += 1,
                Ok(Some(Err(e))) => {
                    warn!(callback = handle.id, error = %e, "Callback failed");
                }
                Ok(None) => dead.push(handle.id),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(callback = handle.id, panic = %message, "Callback panicked");
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.iterating -= 1;
        inner.deferred.extend(dead);
        if inner.iterating == 0 && !inner.deferred.is_empty() {
            let deferred = std::mem::take(&mut inner.deferred);
            inner.handles.retain(|h| !deferred.contains(&h.id));
        }
        succeeded
    }
}
