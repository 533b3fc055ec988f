use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type WakeHook = Arc<dyn Fn() + Send + Sync>;

/// Out-of-band signal that unblocks waiting receivers without delivering data.
///
/// Clones share the same state. Cancelling wakes every call currently
/// blocked on the token, not just one.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_hook_id: AtomicU64,
    hooks: Mutex<Vec<(u64, WakeHook)>>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token and wake every registered waiter.
    ///
    /// Idempotent: later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Hooks lock queue state, so run them without holding our own lock.
        let hooks: Vec<WakeHook> = self
            .hooks()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a wake hook for the duration of one blocking call.
    ///
    /// The flag is set before hooks run, so a waiter must re-check
    /// [`is_cancelled`](Self::is_cancelled) after registering.
    pub(crate) fn on_cancel(&self, hook: impl Fn() + Send + Sync + 'static) -> HookGuard<'_> {
        let id = self.inner.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.hooks().push((id, Arc::new(hook)));
        HookGuard { token: self, id }
    }

    fn hooks(&self) -> MutexGuard<'_, Vec<(u64, WakeHook)>> {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Removes a wake hook when the blocking call that registered it returns.
pub(crate) struct HookGuard<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.token.hooks().retain(|(id, _)| *id != self.id);
    }
}
