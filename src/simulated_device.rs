//! In-process device producing deterministic waveforms.
//!
//! | id | name     | vdim | mlen | data                                  |
//! |----|----------|------|------|---------------------------------------|
//! | 0  | saw      | 1    | 0    | 0, 1, .. 99, 0, 1, ..                 |
//! | 1  | triangle | 1    | 0    | 0 .. 50 .. 0                          |
//! | 2  | sine3    | 3    | 0    | three-phase sine, period 100 samples  |
//! | 3  | static   | 3    | 0    | `[1.0, 0.0, -1.0]`                    |
//! | 4  | static_m | 3    | 1    | `[1.0, 0.0, -1.0]`, meta = counter    |
//! | 5  | text     | 0    | 5    | meta = `hello`                        |

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

use crate::device::{Channel, ChannelId, Device, DeviceError, QueueHandle, Sample, SampleBatch};

const PERIOD: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDeviceConfig {
    /// Pause between two produced batches.
    pub stream_interval: Duration,
    /// Device ticks per batch, before dividers.
    pub samples_per_batch: usize,
    /// Batches a subscriber may lag behind before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            stream_interval: Duration::from_millis(1),
            samples_per_batch: 100,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    channel: ChannelId,
    sender: Sender<SampleBatch>,
}

#[derive(Debug, Clone, Copy)]
struct Enabled {
    channel: ChannelId,
    divider: u32,
    emitted: u64,
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    enabled: Vec<Enabled>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    tick: u64,
}

impl SimState {
    /// Advance the device clock by one batch and fan the samples out.
    fn produce(&mut self, ticks: usize) {
        let start = self.tick;
        self.tick += ticks as u64;
        let end = self.tick;

        for enabled in &mut self.enabled {
            let divider = u64::from(enabled.divider.max(1));
            let mut batch = SampleBatch::new();
            for tick in start..end {
                if tick % divider == 0 {
                    batch.push(generate(enabled.channel, enabled.emitted));
                    enabled.emitted += 1;
                }
            }
            if batch.is_empty() {
                continue;
            }
            for subscriber in self.subscribers.iter().filter(|s| s.channel == enabled.channel) {
                match subscriber.sender.try_send(batch.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => log::trace!(
                        "Subscriber {} of channel {} is full, batch dropped",
                        subscriber.id,
                        subscriber.channel
                    ),
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }
    }
}

fn generate(channel: ChannelId, n: u64) -> Sample {
    let phase = (n % PERIOD) as f64;
    match channel {
        0 => Sample::scalar(phase),
        1 => {
            let half = (PERIOD / 2) as f64;
            Sample::scalar(if phase <= half { phase } else { PERIOD as f64 - phase })
        }
        2 => {
            let angle = 2.0 * PI * phase / PERIOD as f64;
            Sample::new(
                vec![
                    angle.sin(),
                    (angle + 2.0 * PI / 3.0).sin(),
                    (angle + 4.0 * PI / 3.0).sin(),
                ],
                Vec::new(),
            )
        }
        3 => Sample::new(vec![1.0, 0.0, -1.0], Vec::new()),
        4 => Sample::new(vec![1.0, 0.0, -1.0], vec![(n % 256) as u8]),
        _ => Sample::new(Vec::new(), b"hello".to_vec()),
    }
}

/// Simulated device with a background producer thread.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimulatedDeviceConfig,
    channels: Vec<Channel>,
    state: Arc<Mutex<SimState>>,
    streaming: Arc<AtomicBool>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::with_config(SimulatedDeviceConfig::default())
    }

    pub fn with_config(config: SimulatedDeviceConfig) -> Self {
        let channels = vec![
            Channel::new(0, 1, "saw"),
            Channel::new(1, 1, "triangle"),
            Channel::new(2, 3, "sine3"),
            Channel::new(3, 3, "static"),
            Channel::new(4, 3, "static_m").with_metadata(1),
            Channel::new(5, 0, "text").with_metadata(5).non_numerical(),
        ];
        Self {
            config,
            channels,
            state: Arc::new(Mutex::new(SimState::default())),
            streaming: Arc::new(AtomicBool::new(false)),
            producer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SimulatedDeviceConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Currently enabled channels with their dividers.
    pub fn enabled_channels(&self) -> Vec<(ChannelId, u32)> {
        self.state
            .lock()
            .enabled
            .iter()
            .map(|e| (e.channel, e.divider))
            .collect()
    }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn join_producer(&self) {
        self.streaming.store(false, Ordering::Relaxed);
        if let Some(handle) = self.producer.lock().take() {
            if handle.join().is_err() {
                log::error!("Simulated device producer panicked");
            }
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SimulatedDevice {
    fn connect(&self) -> Result<(), DeviceError> {
        self.state.lock().connected = true;
        log::info!("Simulated device connected, {} channels", self.channels.len());
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DeviceError> {
        self.join_producer();
        let mut state = self.state.lock();
        state.connected = false;
        state.subscribers.clear();
        state.enabled.clear();
        log::info!("Simulated device disconnected");
        Ok(())
    }

    fn channel_list(&self) -> Result<Vec<Channel>, DeviceError> {
        self.ensure_connected()?;
        Ok(self.channels.clone())
    }

    fn configure_channels(&self, ids: &[ChannelId], dividers: &[u32]) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        if self.is_streaming() {
            return Err(DeviceError::StreamActive);
        }
        if ids.len() != dividers.len() {
            return Err(DeviceError::DividerMismatch {
                expected: ids.len(),
                got: dividers.len(),
            });
        }
        if let Some(id) = ids.iter().find(|id| !self.channels.iter().any(|c| c.id == **id)) {
            return Err(DeviceError::UnknownChannel(*id));
        }
        self.state.lock().enabled = ids
            .iter()
            .zip(dividers)
            .map(|(channel, divider)| Enabled {
                channel: *channel,
                divider: *divider,
                emitted: 0,
            })
            .collect();
        log::debug!("Enabled channels {:?} with dividers {:?}", ids, dividers);
        Ok(())
    }

    fn subscribe(&self, channel: ChannelId) -> Result<QueueHandle, DeviceError> {
        self.ensure_connected()?;
        if !self.channels.iter().any(|c| c.id == channel) {
            return Err(DeviceError::UnknownChannel(channel));
        }
        let (sender, receiver) = crossbeam_channel::bounded(self.config.queue_capacity);
        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscribers.push(Subscriber { id, channel, sender });
        Ok(QueueHandle::new(channel, id, receiver))
    }

    fn unsubscribe(&self, handle: &QueueHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != handle.subscription());
        if state.subscribers.len() == before {
            return Err(DeviceError::UnknownSubscription(handle.subscription()));
        }
        Ok(())
    }

    fn stream_start(&self) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        if self.streaming.swap(true, Ordering::Relaxed) {
            return Err(DeviceError::StreamActive);
        }

        let state = Arc::clone(&self.state);
        let streaming = Arc::clone(&self.streaming);
        let interval = self.config.stream_interval;
        let ticks = self.config.samples_per_batch;
        let handle = thread::Builder::new()
            .name("simulated-device".to_string())
            .spawn(move || {
                while streaming.load(Ordering::Relaxed) {
                    state.lock().produce(ticks);
                    thread::sleep(interval);
                }
            });
        match handle {
            Ok(handle) => {
                *self.producer.lock() = Some(handle);
                log::info!("Simulated stream started");
                Ok(())
            }
            Err(e) => {
                self.streaming.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    fn stream_stop(&self) -> Result<(), DeviceError> {
        self.join_producer();
        log::info!("Simulated stream stopped");
        Ok(())
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.join_producer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_connection() {
        let device = SimulatedDevice::new();
        assert!(matches!(device.channel_list(), Err(DeviceError::NotConnected)));
        assert!(matches!(device.subscribe(0), Err(DeviceError::NotConnected)));
        device.connect().unwrap();
        assert_eq!(device.channel_list().unwrap().len(), 6);
    }

    #[test]
    fn test_waveforms() {
        assert_eq!(generate(0, 101).data, vec![1.0]);
        assert_eq!(generate(1, 75).data, vec![25.0]);
        assert!((generate(2, 25).data[0] - 1.0).abs() < 1e-9);
        assert_eq!(generate(4, 258).meta, vec![2]);
        assert!(generate(5, 0).data.is_empty());
    }

    #[test]
    fn test_divider_and_fanout() {
        let device = SimulatedDevice::new();
        device.connect().unwrap();
        device.configure_channels(&[0, 1], &[1, 4]).unwrap();
        let saw = device.subscribe(0).unwrap();
        let triangle = device.subscribe(1).unwrap();
        let unused = device.subscribe(2).unwrap();

        device.state.lock().produce(8);
        let batch = saw.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(batch.len(), 8);
        assert_eq!(batch[7].data, vec![7.0]);
        let batch = triangle.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].data, vec![1.0]);
        assert!(unused.recv_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_configure_errors() {
        let device = SimulatedDevice::new();
        device.connect().unwrap();
        assert!(matches!(
            device.configure_channels(&[0, 1], &[1]),
            Err(DeviceError::DividerMismatch { expected: 2, got: 1 })
        ));
        assert!(matches!(
            device.configure_channels(&[9], &[1]),
            Err(DeviceError::UnknownChannel(9))
        ));
    }

    #[test]
    fn test_full_queue_drops_batches() {
        let device = SimulatedDevice::with_config(SimulatedDeviceConfig {
            queue_capacity: 2,
            ..SimulatedDeviceConfig::default()
        });
        device.connect().unwrap();
        device.configure_channels(&[3], &[1]).unwrap();
        let handle = device.subscribe(3).unwrap();
        for _ in 0..5 {
            device.state.lock().produce(1);
        }
        assert!(handle.recv_timeout(Duration::from_millis(1)).is_some());
        assert!(handle.recv_timeout(Duration::from_millis(1)).is_some());
        assert!(handle.recv_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_stream_lifecycle() {
        let device = SimulatedDevice::new();
        device.connect().unwrap();
        device.configure_channels(&[0], &[1]).unwrap();
        let handle = device.subscribe(0).unwrap();
        device.stream_start().unwrap();
        assert!(matches!(device.stream_start(), Err(DeviceError::StreamActive)));
        assert!(handle.recv_timeout(Duration::from_secs(1)).is_some());
        device.stream_stop().unwrap();
        assert!(!device.is_streaming());

        device.unsubscribe(&handle).unwrap();
        assert!(matches!(
            device.unsubscribe(&handle),
            Err(DeviceError::UnknownSubscription(_))
        ));
        device.disconnect().unwrap();
        assert!(!device.is_connected());
    }
}
