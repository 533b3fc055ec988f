use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use gpudrv_frame::MAX_PAYLOAD;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::{QueueError, Result};

/// An ordered, mutex-protected FIFO of byte payloads.
///
/// Entries are copied in on [`push`](Self::push) and moved out on pop; each
/// entry is delivered to exactly one popper. All operations on one queue
/// share a single critical section, held only for the list update.
#[derive(Debug)]
pub struct BoundedQueue {
    name: &'static str,
    max_entry: usize,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<Bytes>,
    closed: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Critical sections never leave the deque half-updated, so a poisoned
        // lock still guards consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BoundedQueue {
    /// Create an empty queue with the default 16 MiB per-entry cap.
    pub fn new(name: &'static str) -> Self {
        Self::with_max_entry(name, MAX_PAYLOAD)
    }

    /// Create an empty queue with an explicit per-entry cap.
    pub fn with_max_entry(name: &'static str, max_entry: usize) -> Self {
        Self {
            name,
            max_entry,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Queue name used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Copy `payload` into a new entry at the tail and wake one waiter.
    ///
    /// Either the entry is fully queued or the queue is left untouched.
    pub fn push(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_entry {
            return Err(QueueError::CapacityExceeded {
                size: payload.len(),
                max: self.max_entry,
            });
        }

        let mut owned = Vec::new();
        owned
            .try_reserve_exact(payload.len())
            .map_err(|_| QueueError::AllocationFailed {
                size: payload.len(),
            })?;
        owned.extend_from_slice(payload);
        let entry = Bytes::from(owned);

        let depth = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.entries.push_back(entry);
            state.entries.len()
        };
        self.shared.ready.notify_one();

        trace!(queue = self.name, size = payload.len(), depth, "entry queued");
        Ok(())
    }

    /// Remove and return the head entry without blocking.
    ///
    /// A closed queue hands out nothing; its entries are released by
    /// [`drain`](Self::drain).
    pub fn try_pop(&self) -> Option<Bytes> {
        let entry = {
            let mut state = self.shared.lock();
            if state.closed {
                return None;
            }
            state.entries.pop_front()
        };
        if let Some(entry) = &entry {
            trace!(queue = self.name, size = entry.len(), "entry taken");
        }
        entry
    }

    /// Remove the head entry only if it is at most `limit` bytes.
    ///
    /// A head that is too large stays queued and `EntryTooLarge` is returned.
    pub fn try_pop_fitting(&self, limit: usize) -> Result<Option<Bytes>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Ok(None);
        }
        let head_len = match state.entries.front() {
            None => return Ok(None),
            Some(head) => head.len(),
        };
        if head_len > limit {
            return Err(QueueError::EntryTooLarge {
                len: head_len,
                limit,
            });
        }
        let entry = state.entries.pop_front();
        drop(state);

        trace!(queue = self.name, size = head_len, "entry taken");
        Ok(entry)
    }

    /// Block until an entry is available or `cancel` fires.
    ///
    /// Never busy-polls: the caller sleeps on a condition variable. Closing
    /// the queue also ends the wait with `Cancelled`.
    pub fn blocking_pop(&self, cancel: &CancelToken) -> Result<Bytes> {
        self.blocking_pop_fitting(cancel, None, usize::MAX)
    }

    /// Blocking pop with an optional timeout and a size limit on the head.
    ///
    /// `timeout: None` waits indefinitely. A head larger than `limit` is left
    /// queued and `EntryTooLarge` is returned.
    pub fn blocking_pop_fitting(
        &self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
        limit: usize,
    ) -> Result<Bytes> {
        let shared = Arc::clone(&self.shared);
        let _hook = cancel.on_cancel(move || {
            // Taking the lock orders this wake after the waiter's flag check.
            let _state = shared.lock();
            shared.ready.notify_all();
        });

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();

        let outcome = loop {
            if cancel.is_cancelled() || state.closed {
                break Err(QueueError::Cancelled);
            }

            if let Some(head_len) = state.entries.front().map(Bytes::len) {
                if head_len > limit {
                    break Err(QueueError::EntryTooLarge {
                        len: head_len,
                        limit,
                    });
                }
                if let Some(entry) = state.entries.pop_front() {
                    break Ok(entry);
                }
            }

            state = match deadline {
                None => self
                    .shared
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(QueueError::TimedOut(timeout.unwrap_or_default()));
                    }
                    self.shared
                        .ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        };

        // A wake-up this waiter did not use goes to the next one in line.
        let hand_off = outcome.is_err() && !state.entries.is_empty();
        drop(state);
        if hand_off {
            self.shared.ready.notify_one();
        }

        match &outcome {
            Ok(entry) => trace!(queue = self.name, size = entry.len(), "entry taken after wait"),
            Err(err) => trace!(queue = self.name, error = %err, "wait ended without entry"),
        }
        outcome
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> Vec<Bytes> {
        let drained: Vec<Bytes> = self.shared.lock().entries.drain(..).collect();
        trace!(queue = self.name, count = drained.len(), "queue drained");
        drained
    }

    /// Stop accepting entries and wake every waiter with `Cancelled`.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Whether the queue has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
