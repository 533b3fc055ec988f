use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use gpudrv_frame::{decode_header, validate, Frame, FrameError, HEADER_SIZE};
use gpudrv_queue::{CancelToken, QueueError, QueueManager, ShutdownReport};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeviceError, Result};

/// What a read does when the caller's buffer is smaller than the next frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortReadPolicy {
    /// Fail with `OutputTooSmall` and leave the entry queued for a retry
    /// with a larger buffer.
    #[default]
    Retain,
    /// Dequeue the entry, drop it and fail with `OutputTooSmall`.
    /// Matches the character-device prototype; the payload is lost.
    Discard,
}

impl fmt::Display for ShortReadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShortReadPolicy::Retain => write!(f, "retain"),
            ShortReadPolicy::Discard => write!(f, "discard"),
        }
    }
}

impl FromStr for ShortReadPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" => Ok(ShortReadPolicy::Retain),
            "discard" => Ok(ShortReadPolicy::Discard),
            other => Err(format!(
                "unknown short-read policy '{other}' (expected retain or discard)"
            )),
        }
    }
}

/// Configuration for a channel endpoint.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Behavior of reads into a buffer that is too small.
    pub short_read: ShortReadPolicy,
}

/// The shared broker channel.
///
/// Every handle opened from one channel talks to the same queue manager.
#[derive(Debug, Clone)]
pub struct Channel {
    manager: Arc<QueueManager>,
    config: ChannelConfig,
}

impl Channel {
    /// Bind a channel to an existing queue manager with default configuration.
    pub fn new(manager: Arc<QueueManager>) -> Self {
        Self::with_config(manager, ChannelConfig::default())
    }

    /// Bind a channel to an existing queue manager.
    pub fn with_config(manager: Arc<QueueManager>, config: ChannelConfig) -> Self {
        Self { manager, config }
    }

    /// Open a new handle. Handles carry no identity.
    pub fn open(&self) -> ChannelHandle {
        ChannelHandle {
            manager: Arc::clone(&self.manager),
            short_read: self.config.short_read,
        }
    }

    /// The queue manager behind this channel.
    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Active configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Shut the underlying queue manager down.
    pub fn shutdown(&self) -> ShutdownReport {
        self.manager.shutdown()
    }
}

/// One logical connection to a [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    manager: Arc<QueueManager>,
    short_read: ShortReadPolicy,
}

impl ChannelHandle {
    /// Submit the frame in `buf` as a job.
    ///
    /// Any write is a submission, whoever makes it. Returns the frame size
    /// (`8 + length`); bytes past the frame are ignored.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let payload = frame_payload(buf)?;
        self.manager.submit(payload)?;
        Ok(HEADER_SIZE + payload.len())
    }

    /// Publish the frame in `buf` as a result.
    pub fn publish(&self, buf: &[u8]) -> Result<usize> {
        let payload = frame_payload(buf)?;
        self.manager.publish_result(payload)?;
        Ok(HEADER_SIZE + payload.len())
    }

    /// Receive the next frame into `buf` as header + payload.
    ///
    /// Returns the number of bytes written. See [`ShortReadPolicy`] for what
    /// happens when `buf` is too small.
    pub fn read(&self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize> {
        let frame = self.recv_frame(buf.len(), cancel)?;
        let total = frame.wire_size();
        buf[..HEADER_SIZE].copy_from_slice(&frame.len().to_le_bytes());
        buf[HEADER_SIZE..total].copy_from_slice(&frame.payload);
        Ok(total)
    }

    /// Receive the next frame whose wire size fits in `capacity` bytes.
    pub fn recv_frame(&self, capacity: usize, cancel: &CancelToken) -> Result<Frame> {
        self.deliver(capacity, |limit| self.manager.receive_fitting(cancel, limit))
    }

    /// Receive the next submission only. Pending results stay queued.
    pub fn take_job(&self, capacity: usize, cancel: &CancelToken) -> Result<Frame> {
        self.deliver(capacity, |limit| self.manager.next_submission(cancel, limit))
    }

    /// Receive the next result only, waiting at most `timeout` when given.
    pub fn take_result(
        &self,
        capacity: usize,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Frame> {
        self.deliver(capacity, |limit| {
            self.manager.next_result(cancel, timeout, limit)
        })
    }

    fn deliver(
        &self,
        capacity: usize,
        pop: impl FnOnce(usize) -> gpudrv_queue::Result<Frame>,
    ) -> Result<Frame> {
        match self.short_read {
            ShortReadPolicy::Retain => {
                pop(capacity.saturating_sub(HEADER_SIZE)).map_err(|err| match err {
                    QueueError::EntryTooLarge { len, .. } => DeviceError::OutputTooSmall {
                        required: HEADER_SIZE + len,
                        capacity,
                    },
                    other => other.into(),
                })
            }
            ShortReadPolicy::Discard => {
                let frame = pop(usize::MAX)?;
                if frame.wire_size() > capacity {
                    warn!(
                        required = frame.wire_size(),
                        capacity, "read buffer too small, dropping dequeued frame"
                    );
                    return Err(DeviceError::OutputTooSmall {
                        required: frame.wire_size(),
                        capacity,
                    });
                }
                Ok(frame)
            }
        }
    }

    /// Policy applied to short reads on this handle.
    pub fn short_read_policy(&self) -> ShortReadPolicy {
        self.short_read
    }
}

/// Split a device frame into its payload after checking header and length.
pub(crate) fn frame_payload(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::Truncated {
            expected: HEADER_SIZE,
            actual: buf.len(),
        }
        .into());
    }
    let length = validate(decode_header(buf)?)?;
    let total = HEADER_SIZE + length;
    if buf.len() < total {
        return Err(FrameError::Truncated {
            expected: total,
            actual: buf.len(),
        }
        .into());
    }
    debug!(length, "frame accepted");
    Ok(&buf[HEADER_SIZE..total])
}

#[cfg(test)]
mod tests {
    use std::thread;

    use gpudrv_frame::{encode_to_vec, MAX_PAYLOAD};

    use super::*;

    fn channel(short_read: ShortReadPolicy) -> Channel {
        Channel::with_config(Arc::new(QueueManager::new()), ChannelConfig { short_read })
    }

    #[test]
    fn write_returns_frame_size() {
        let handle = channel(ShortReadPolicy::Retain).open();
        let mut wire = encode_to_vec(b"payload");
        wire.extend_from_slice(b"trailing garbage");

        assert_eq!(handle.write(&wire).unwrap(), HEADER_SIZE + 7);
    }

    #[test]
    fn write_rejects_short_header() {
        let ch = channel(ShortReadPolicy::Retain);
        let err = ch.open().write(&[5, 0, 0]).unwrap_err();

        assert!(matches!(
            err,
            DeviceError::Frame(FrameError::Truncated {
                expected: HEADER_SIZE,
                actual: 3
            })
        ));
        assert_eq!(ch.manager().pending().submissions, 0);
    }

    #[test]
    fn write_rejects_truncated_payload() {
        let ch = channel(ShortReadPolicy::Retain);
        let wire = encode_to_vec(b"hello");

        let err = ch.open().write(&wire[..wire.len() - 1]).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Frame(FrameError::Truncated {
                expected: 13,
                actual: 12
            })
        ));
        assert_eq!(ch.manager().pending().submissions, 0);
    }

    #[test]
    fn write_rejects_invalid_lengths() {
        let ch = channel(ShortReadPolicy::Retain);
        let handle = ch.open();

        let zero = 0u64.to_le_bytes();
        let huge = (MAX_PAYLOAD as u64 + 1).to_le_bytes();
        for header in [zero, huge] {
            let err = handle.write(&header).unwrap_err();
            assert!(matches!(
                err,
                DeviceError::Frame(FrameError::InvalidLength { .. })
            ));
        }
        assert_eq!(ch.manager().pending().submissions, 0);
    }

    #[test]
    fn read_writes_header_and_payload() {
        let handle = channel(ShortReadPolicy::Retain).open();
        handle.write(&encode_to_vec(b"BB")).unwrap();

        let mut buf = [0u8; 32];
        let n = handle.read(&mut buf, &CancelToken::new()).unwrap();

        assert_eq!(n, HEADER_SIZE + 2);
        assert_eq!(&buf[..n], encode_to_vec(b"BB").as_slice());
    }

    #[test]
    fn producer_and_consumer_share_one_channel() {
        let ch = channel(ShortReadPolicy::Retain);
        let producer = ch.open();
        let consumer = ch.open();
        let cancel = CancelToken::new();

        producer.write(&encode_to_vec(b"job")).unwrap();
        let job = consumer.recv_frame(64, &cancel).unwrap();
        assert_eq!(job.payload.as_ref(), b"job");

        consumer.publish(&encode_to_vec(b"done")).unwrap();
        let result = producer.recv_frame(64, &cancel).unwrap();
        assert_eq!(result.payload.as_ref(), b"done");
    }

    #[test]
    fn retain_policy_keeps_entry_for_larger_buffer() {
        let ch = channel(ShortReadPolicy::Retain);
        let handle = ch.open();
        handle.write(&encode_to_vec(b"0123456789")).unwrap();
        let cancel = CancelToken::new();

        let mut small = [0u8; 12];
        let err = handle.read(&mut small, &cancel).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutputTooSmall {
                required: 18,
                capacity: 12
            }
        ));
        assert_eq!(ch.manager().pending().submissions, 1);

        let mut big = [0u8; 18];
        assert_eq!(handle.read(&mut big, &cancel).unwrap(), 18);
        assert_eq!(&big[HEADER_SIZE..], b"0123456789");
    }

    #[test]
    fn retain_policy_applies_to_results_too() {
        let ch = channel(ShortReadPolicy::Retain);
        let handle = ch.open();
        handle.publish(&encode_to_vec(b"long result")).unwrap();
        handle.write(&encode_to_vec(b"j")).unwrap();

        let err = handle.recv_frame(10, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DeviceError::OutputTooSmall { .. }));
        assert_eq!(ch.manager().pending().results, 1);
        assert_eq!(ch.manager().pending().submissions, 1);
    }

    #[test]
    fn discard_policy_loses_the_entry() {
        let ch = channel(ShortReadPolicy::Discard);
        let handle = ch.open();
        handle.write(&encode_to_vec(b"0123456789")).unwrap();
        handle.write(&encode_to_vec(b"next")).unwrap();
        let cancel = CancelToken::new();

        let mut small = [0u8; 12];
        let err = handle.read(&mut small, &cancel).unwrap_err();
        assert!(matches!(err, DeviceError::OutputTooSmall { required: 18, .. }));

        // The oversized frame is gone; the next read sees the following one.
        assert_eq!(ch.manager().pending().submissions, 1);
        let n = handle.read(&mut small, &cancel).unwrap();
        assert_eq!(&small[HEADER_SIZE..n], b"next");
    }

    #[test]
    fn role_reads_leave_the_other_queue_alone() {
        let ch = channel(ShortReadPolicy::Retain);
        let handle = ch.open();
        handle.write(&encode_to_vec(b"job")).unwrap();
        handle.publish(&encode_to_vec(b"result")).unwrap();
        let cancel = CancelToken::new();

        assert_eq!(handle.take_job(64, &cancel).unwrap().payload.as_ref(), b"job");
        let result = handle.take_result(64, None, &cancel).unwrap();
        assert_eq!(result.payload.as_ref(), b"result");

        let err = handle
            .take_result(64, Some(Duration::from_millis(10)), &cancel)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Queue(QueueError::TimedOut(_))));
    }

    #[test]
    fn take_job_applies_short_read_policy() {
        let ch = channel(ShortReadPolicy::Retain);
        let handle = ch.open();
        handle.write(&encode_to_vec(b"0123456789")).unwrap();

        let err = handle.take_job(9, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DeviceError::OutputTooSmall { required: 18, capacity: 9 }));
        assert_eq!(ch.manager().pending().submissions, 1);
    }

    #[test]
    fn shutdown_cancels_blocked_read() {
        let ch = channel(ShortReadPolicy::Retain);
        let reader = {
            let handle = ch.open();
            thread::spawn(move || {
                let mut buf = vec![0u8; 64];
                handle.read(&mut buf, &CancelToken::new())
            })
        };

        thread::sleep(Duration::from_millis(20));
        ch.shutdown();

        let err = reader.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn short_read_policy_parses() {
        assert_eq!("retain".parse::<ShortReadPolicy>(), Ok(ShortReadPolicy::Retain));
        assert_eq!(" Discard ".parse::<ShortReadPolicy>(), Ok(ShortReadPolicy::Discard));
        assert!("drop".parse::<ShortReadPolicy>().is_err());
        assert_eq!(ShortReadPolicy::default().to_string(), "retain");
        assert_eq!(
            serde_json::to_string(&ShortReadPolicy::Discard).unwrap(),
            "\"discard\""
        );
    }
}
