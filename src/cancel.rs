//! Cooperative cancellation. The token is a polled flag plus a small
//! callback vector; estimators are contractually required to poll at their
//! documented suspension points (sample batches, circuits, anchors).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type CancelCallback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    flag: AtomicBool,
    callbacks: Mutex<Vec<CancelCallback>>,
}

/// Cheaply clonable handle shared between the caller and the running engine.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fires cancellation: sets the flag and runs registered callbacks once.
    /// Subsequent calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = self.inner.callbacks.lock().expect("cancel callback lock");
        for cb in callbacks.iter() {
            cb();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Registers a callback invoked when `cancel` first fires. If the token
    /// is already cancelled the callback runs immediately.
    pub fn on_cancel(&self, callback: impl Fn() + Send + Sync + 'static) {
        if self.is_cancelled() {
            callback();
            return;
        }
        self.inner
            .callbacks
            .lock()
            .expect("cancel callback lock")
            .push(Box::new(callback));
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Per-run execution context: the cancellation token plus the soft
/// deadline. `poll` is called at every suspension point; once the deadline
/// passes it fires the token, so timeout and explicit cancellation travel
/// the same cooperative path.
#[derive(Clone, Debug)]
pub struct RunContext {
    token: CancelToken,
    deadline: Option<std::time::Instant>,
}

impl RunContext {
    pub fn new(token: CancelToken, timeout: Option<std::time::Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|t| std::time::Instant::now() + t),
        }
    }

    /// A context with no deadline and a fresh token.
    pub fn unbounded() -> Self {
        Self::new(CancelToken::new(), None)
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Returns true when the run should stop. Fires the token when the
    /// deadline has passed.
    pub fn poll(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        if let Some(deadline) = self.deadline {
            if std::time::Instant::now() >= deadline {
                self.token.cancel();
                return true;
            }
        }
        false
    }
}
