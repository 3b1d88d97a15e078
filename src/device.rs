use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

pub type ChannelId = u32;

/// Channel descriptor as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub vdim: usize,
    pub mlen: usize,
    pub numerical: bool,
    pub name: String,
}

impl Channel {
    pub fn new(id: ChannelId, vdim: usize, name: &str) -> Self {
        Self {
            id,
            vdim,
            mlen: 0,
            numerical: true,
            name: name.to_string(),
        }
    }

    pub fn with_metadata(mut self, mlen: usize) -> Self {
        self.mlen = mlen;
        self
    }

    pub fn non_numerical(mut self) -> Self {
        self.numerical = false;
        self
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan{} '{}' (vdim={}, mlen={})", self.id, self.name, self.vdim, self.mlen)
    }
}

/// One data point emitted by a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub data: Vec<f64>,
    pub meta: Vec<u8>,
}

impl Sample {
    pub fn new(data: Vec<f64>, meta: Vec<u8>) -> Self {
        Self { data, meta }
    }

    /// Single-component sample without metadata.
    pub fn scalar(value: f64) -> Self {
        Self {
            data: vec![value],
            meta: Vec::new(),
        }
    }

    pub fn value(&self, vector_index: usize) -> Option<f64> {
        self.data.get(vector_index).copied()
    }
}

pub type SampleBatch = Vec<Sample>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device is not connected")]
    NotConnected,

    #[error("Channel {0} does not exist on this device")]
    UnknownChannel(ChannelId),

    #[error("Divider list covers {got} channels but {expected} are configured")]
    DividerMismatch { expected: usize, got: usize },

    #[error("Operation not allowed while the stream is running")]
    StreamActive,

    #[error("Subscription {0} is not known to the device")]
    UnknownSubscription(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiving end of one channel subscription.
///
/// Cloning shares the same underlying queue; the device side sees a single
/// subscriber regardless of how many clones exist.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    channel: ChannelId,
    subscription: u64,
    receiver: Receiver<SampleBatch>,
}

impl QueueHandle {
    pub fn new(channel: ChannelId, subscription: u64, receiver: Receiver<SampleBatch>) -> Self {
        Self {
            channel,
            subscription,
            receiver,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn subscription(&self) -> u64 {
        self.subscription
    }

    /// Block for at most `timeout` waiting for the next batch.
    ///
    /// Returns `None` on timeout or once the device dropped the subscription.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SampleBatch> {
        match self.receiver.recv_timeout(timeout) {
            Ok(batch) => Some(batch),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // nothing will ever arrive, keep the caller's pacing
                std::thread::sleep(timeout);
                None
            }
        }
    }
}

/// The device/transport collaborator consumed by the orchestrator.
pub trait Device: Send + Sync {
    fn connect(&self) -> Result<(), DeviceError>;

    fn disconnect(&self) -> Result<(), DeviceError>;

    fn channel_list(&self) -> Result<Vec<Channel>, DeviceError>;

    /// Enable exactly `ids` with the matching `dividers` (same length).
    fn configure_channels(&self, ids: &[ChannelId], dividers: &[u32]) -> Result<(), DeviceError>;

    fn subscribe(&self, channel: ChannelId) -> Result<QueueHandle, DeviceError>;

    fn unsubscribe(&self, handle: &QueueHandle) -> Result<(), DeviceError>;

    fn stream_start(&self) -> Result<(), DeviceError>;

    fn stream_stop(&self) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_value() {
        let sample = Sample::new(vec![1.0, 2.0], vec![7]);
        assert_eq!(sample.value(1), Some(2.0));
        assert_eq!(sample.value(2), None);
        assert_eq!(Sample::scalar(3.5).data, vec![3.5]);
    }

    #[test]
    fn test_queue_handle_timeout() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = QueueHandle::new(3, 1, rx);
        assert!(handle.recv_timeout(Duration::from_millis(1)).is_none());

        tx.send(vec![Sample::scalar(1.0)]).unwrap();
        let batch = handle.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(handle.channel(), 3);
    }

    #[test]
    fn test_channel_display() {
        let chan = Channel::new(2, 3, "sine3").with_metadata(1);
        assert_eq!(chan.to_string(), "chan2 'sine3' (vdim=3, mlen=1)");
        assert!(!Channel::new(5, 0, "text").non_numerical().numerical);
    }
}
