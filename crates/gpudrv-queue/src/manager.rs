use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gpudrv_frame::{validate, Frame};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{QueueError, Result};
use crate::queue::BoundedQueue;

/// Lifecycle of a [`QueueManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Queues allocated, not yet serving.
    Idle,
    /// Accepting submit, publish_result and receive concurrently.
    Running,
    /// Waiters are being woken and queues drained.
    ShuttingDown,
    /// All entries released. Terminal.
    Stopped,
}

/// Configuration for the queue manager.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// How long `receive` may block on the submissions queue.
    /// Default: `None` (block until an entry arrives or the wait is cancelled).
    pub receive_timeout: Option<Duration>,
}

/// Queue depths at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub submissions: usize,
    pub results: usize,
}

/// Entries released by [`QueueManager::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub submissions_dropped: usize,
    pub results_dropped: usize,
}

/// Owns the *submissions* and *results* queues and the read-side priority policy.
#[derive(Debug)]
pub struct QueueManager {
    submissions: BoundedQueue,
    results: BoundedQueue,
    state: Mutex<ManagerState>,
    config: ManagerConfig,
}

impl QueueManager {
    /// Create a running manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a running manager with explicit configuration.
    pub fn with_config(config: ManagerConfig) -> Self {
        let manager = Self {
            submissions: BoundedQueue::new("submissions"),
            results: BoundedQueue::new("results"),
            state: Mutex::new(ManagerState::Idle),
            config,
        };
        *manager.lock_state() = ManagerState::Running;
        info!(receive_timeout = ?manager.config.receive_timeout, "queue manager running");
        manager
    }

    /// Queue a producer's job.
    ///
    /// Fails with `InvalidLength` for empty or oversized payloads, leaving
    /// the queue unchanged.
    pub fn submit(&self, payload: &[u8]) -> Result<()> {
        validate(payload.len() as u64)?;
        self.submissions.push(payload)?;
        debug!(size = payload.len(), "submission queued");
        Ok(())
    }

    /// Queue a consumer's result. Same length rules as [`submit`](Self::submit).
    pub fn publish_result(&self, payload: &[u8]) -> Result<()> {
        validate(payload.len() as u64)?;
        self.results.push(payload)?;
        debug!(size = payload.len(), "result queued");
        Ok(())
    }

    /// Deliver the next frame to whoever asks.
    ///
    /// 1. A pending result is returned immediately, without blocking.
    /// 2. Otherwise the call blocks for the next submission.
    ///
    /// There is no correlation between a submission and its result: with more
    /// than one producer in flight, a caller may receive a result computed for
    /// someone else's job, or a pending submission instead of a result. The
    /// broker assumes producers take turns, each blocking on its own result.
    pub fn receive(&self, cancel: &CancelToken) -> Result<Frame> {
        self.receive_fitting(cancel, usize::MAX)
    }

    /// Like [`receive`](Self::receive), but only dequeues an entry of at most
    /// `limit` bytes.
    ///
    /// A larger head stays where it is and `EntryTooLarge` is returned; a
    /// too-large pending result does not fall through to submissions.
    pub fn receive_fitting(&self, cancel: &CancelToken, limit: usize) -> Result<Frame> {
        self.ensure_running()?;

        if let Some(payload) = self.results.try_pop_fitting(limit)? {
            debug!(size = payload.len(), source = "results", "frame delivered");
            return Ok(Frame::new(payload));
        }

        let payload =
            self.submissions
                .blocking_pop_fitting(cancel, self.config.receive_timeout, limit)?;
        debug!(size = payload.len(), source = "submissions", "frame delivered");
        Ok(Frame::new(payload))
    }

    /// Block for the next submission only, ignoring pending results.
    ///
    /// For a consumer that must never be handed a result as if it were work.
    pub fn next_submission(&self, cancel: &CancelToken, limit: usize) -> Result<Frame> {
        self.ensure_running()?;
        let payload =
            self.submissions
                .blocking_pop_fitting(cancel, self.config.receive_timeout, limit)?;
        debug!(size = payload.len(), source = "submissions", "job delivered");
        Ok(Frame::new(payload))
    }

    /// Block for the next result only, ignoring pending submissions.
    ///
    /// `timeout` replaces the configured receive timeout for this call.
    /// Results are still uncorrelated: the caller gets whichever result is
    /// at the head.
    pub fn next_result(
        &self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
        limit: usize,
    ) -> Result<Frame> {
        self.ensure_running()?;
        let payload = self.results.blocking_pop_fitting(cancel, timeout, limit)?;
        debug!(size = payload.len(), source = "results", "result delivered");
        Ok(Frame::new(payload))
    }

    /// Wake every blocked receiver with `Cancelled`, then release all entries.
    ///
    /// Idempotent: only the first call drains anything.
    pub fn shutdown(&self) -> ShutdownReport {
        {
            let mut state = self.lock_state();
            match *state {
                ManagerState::ShuttingDown | ManagerState::Stopped => {
                    return ShutdownReport::default()
                }
                ManagerState::Idle | ManagerState::Running => *state = ManagerState::ShuttingDown,
            }
        }
        info!("queue manager shutting down");

        self.submissions.close();
        self.results.close();

        let report = ShutdownReport {
            submissions_dropped: self.submissions.drain().len(),
            results_dropped: self.results.drain().len(),
        };

        *self.lock_state() = ManagerState::Stopped;
        info!(
            submissions_dropped = report.submissions_dropped,
            results_dropped = report.results_dropped,
            "queue manager stopped"
        );
        report
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.lock_state()
    }

    /// Current queue depths.
    pub fn pending(&self) -> PendingCounts {
        PendingCounts {
            submissions: self.submissions.len(),
            results: self.results.len(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ManagerState::Running => Ok(()),
            _ => Err(QueueError::Cancelled),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use gpudrv_frame::{FrameError, MAX_PAYLOAD};

    use super::*;

    #[test]
    fn starts_running() {
        let manager = QueueManager::new();
        assert_eq!(manager.state(), ManagerState::Running);
        assert_eq!(manager.pending(), PendingCounts::default());
    }

    #[test]
    fn sequential_receives_follow_submit_order() {
        let manager = QueueManager::new();
        manager.submit(b"A").unwrap();
        manager.submit(b"BB").unwrap();

        let cancel = CancelToken::new();
        let first = manager.receive(&cancel).unwrap();
        let second = manager.receive(&cancel).unwrap();

        assert_eq!((first.payload.as_ref(), first.len()), (b"A".as_ref(), 1));
        assert_eq!((second.payload.as_ref(), second.len()), (b"BB".as_ref(), 2));
    }

    #[test]
    fn results_take_priority_over_submissions() {
        let manager = QueueManager::new();
        manager.submit(b"job-1").unwrap();
        manager.submit(b"job-2").unwrap();
        manager.publish_result(b"result-1").unwrap();

        let cancel = CancelToken::new();
        assert_eq!(manager.receive(&cancel).unwrap().payload.as_ref(), b"result-1");
        assert_eq!(manager.receive(&cancel).unwrap().payload.as_ref(), b"job-1");
        assert_eq!(manager.receive(&cancel).unwrap().payload.as_ref(), b"job-2");
    }

    #[test]
    fn invalid_lengths_rejected_without_mutation() {
        let manager = QueueManager::new();
        let oversized = vec![0u8; MAX_PAYLOAD + 1];

        for result in [
            manager.submit(b""),
            manager.submit(&oversized),
            manager.publish_result(b""),
            manager.publish_result(&oversized),
        ] {
            assert!(matches!(
                result,
                Err(QueueError::Frame(FrameError::InvalidLength { .. }))
            ));
        }
        assert_eq!(manager.pending(), PendingCounts::default());
    }

    #[test]
    fn max_payload_accepted() {
        let manager = QueueManager::new();
        manager.submit(&vec![7u8; MAX_PAYLOAD]).unwrap();
        assert_eq!(manager.pending().submissions, 1);
    }

    #[test]
    fn receive_blocks_until_submit() {
        let manager = Arc::new(QueueManager::new());
        let consumer = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.receive(&CancelToken::new()))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!consumer.is_finished());

        let submitted_at = Instant::now();
        manager.submit(b"work").unwrap();
        let frame = consumer.join().unwrap().unwrap();

        assert_eq!(frame.payload.as_ref(), b"work");
        assert!(submitted_at.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn blocked_receive_ignores_later_results() {
        // Results are only checked on entry; a blocked receiver waits for work.
        let manager = Arc::new(QueueManager::new());
        let consumer = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.receive(&CancelToken::new()))
        };

        thread::sleep(Duration::from_millis(20));
        manager.publish_result(b"result").unwrap();
        manager.submit(b"job").unwrap();

        assert_eq!(consumer.join().unwrap().unwrap().payload.as_ref(), b"job");
        assert_eq!(manager.pending().results, 1);
    }

    #[test]
    fn receive_fitting_keeps_large_result_queued() {
        let manager = QueueManager::new();
        manager.publish_result(b"0123456789").unwrap();
        manager.submit(b"s").unwrap();

        let err = manager
            .receive_fitting(&CancelToken::new(), 4)
            .unwrap_err();
        assert!(matches!(err, QueueError::EntryTooLarge { len: 10, limit: 4 }));
        assert_eq!(
            manager.pending(),
            PendingCounts {
                submissions: 1,
                results: 1
            }
        );
    }

    #[test]
    fn receive_timeout_applies_to_submissions_wait() {
        let manager = QueueManager::with_config(ManagerConfig {
            receive_timeout: Some(Duration::from_millis(20)),
        });

        let err = manager.receive(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, QueueError::TimedOut(_)));
    }

    #[test]
    fn shutdown_cancels_blocked_receivers_and_drains() {
        let manager = Arc::new(QueueManager::new());
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.receive(&CancelToken::new()))
            })
            .collect();
        thread::sleep(Duration::from_millis(30));

        // Results accumulate while every receiver is parked on submissions.
        manager.publish_result(b"orphan").unwrap();

        let started = Instant::now();
        let report = manager.shutdown();

        for receiver in receivers {
            assert!(matches!(
                receiver.join().unwrap(),
                Err(QueueError::Cancelled)
            ));
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(
            report,
            ShutdownReport {
                submissions_dropped: 0,
                results_dropped: 1
            }
        );
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(manager.pending(), PendingCounts::default());
    }

    #[test]
    fn stopped_manager_rejects_everything() {
        let manager = QueueManager::new();
        manager.submit(b"pending").unwrap();
        assert_eq!(manager.shutdown().submissions_dropped, 1);
        assert_eq!(manager.shutdown(), ShutdownReport::default());

        assert!(matches!(manager.submit(b"late"), Err(QueueError::Closed)));
        assert!(matches!(
            manager.publish_result(b"late"),
            Err(QueueError::Closed)
        ));
        assert!(matches!(
            manager.receive(&CancelToken::new()),
            Err(QueueError::Cancelled)
        ));
    }

    #[test]
    fn cancelled_receive_returns_no_payload() {
        let manager = Arc::new(QueueManager::new());
        let cancel = CancelToken::new();
        let consumer = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            thread::spawn(move || manager.receive(&cancel))
        };

        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(matches!(
            consumer.join().unwrap(),
            Err(QueueError::Cancelled)
        ));

        // The job submitted afterwards is still there for the next reader.
        manager.submit(b"after").unwrap();
        assert_eq!(
            manager.receive(&CancelToken::new()).unwrap().payload.as_ref(),
            b"after"
        );
    }

    #[test]
    fn next_submission_skips_pending_results() {
        let manager = QueueManager::new();
        manager.publish_result(b"result").unwrap();
        manager.submit(b"job").unwrap();

        let job = manager
            .next_submission(&CancelToken::new(), usize::MAX)
            .unwrap();
        assert_eq!(job.payload.as_ref(), b"job");
        assert_eq!(manager.pending().results, 1);
    }

    #[test]
    fn next_result_wakes_on_publish_and_ignores_submissions() {
        let manager = Arc::new(QueueManager::new());
        manager.submit(b"job").unwrap();
        let producer = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.next_result(&CancelToken::new(), None, usize::MAX))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());
        manager.publish_result(b"done").unwrap();

        assert_eq!(producer.join().unwrap().unwrap().payload.as_ref(), b"done");
        assert_eq!(manager.pending().submissions, 1);
    }

    #[test]
    fn next_result_honours_its_own_timeout() {
        let manager = QueueManager::new();
        let err = manager
            .next_result(&CancelToken::new(), Some(Duration::from_millis(20)), 64)
            .unwrap_err();
        assert!(matches!(err, QueueError::TimedOut(_)));
    }
}
