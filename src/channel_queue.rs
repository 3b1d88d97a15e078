//! Per-(job, channel) delivery: a device subscription coupled to its trigger.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::{Channel, ChannelId, Device, DeviceError, QueueHandle, Sample, SampleBatch};
use crate::trigger::{TriggerError, TriggerSession, TriggerState};
use crate::trigger_config::TriggerSpec;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Trigger setup failed: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Subscription failed: {0}")]
    Device(#[from] DeviceError),
}

/// One channel of one job: the raw sample queue and the gate in front of it.
#[derive(Debug)]
pub struct ChannelQueue {
    channel: Channel,
    handle: QueueHandle,
    trigger: TriggerState,
}

impl ChannelQueue {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn handle(&self) -> &QueueHandle {
        &self.handle
    }

    pub fn trigger(&self) -> &TriggerState {
        &self.trigger
    }

    /// Next raw batch, or `None` if nothing arrived within `timeout`.
    pub fn read(&self, timeout: Duration) -> Option<SampleBatch> {
        self.handle.recv_timeout(timeout)
    }

    /// Pass a raw batch through the channel's trigger.
    pub fn gate(&mut self, batch: SampleBatch) -> Result<Vec<Sample>, TriggerError> {
        self.trigger.evaluate(batch)
    }
}

/// The queues of one job, in resolved channel order.
#[derive(Debug, Default)]
pub struct JobQueues {
    queues: Vec<ChannelQueue>,
}

impl JobQueues {
    /// Register the triggers of every channel, then subscribe each channel.
    ///
    /// All triggers of the job exist before the first subscription so
    /// cross-channel references inside the job wire up in one go. On failure
    /// the subscriptions made so far are released again.
    pub fn subscribe<F>(
        device: &dyn Device,
        ledger: &SubscriptionLedger,
        session: &Arc<TriggerSession>,
        channels: &[Channel],
        mut resolve: F,
    ) -> Result<Self, QueueError>
    where
        F: FnMut(ChannelId) -> TriggerSpec,
    {
        let triggers = channels
            .iter()
            .map(|chan| session.register(chan.id, resolve(chan.id)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut queues = Self::default();
        for (channel, trigger) in channels.iter().zip(triggers) {
            let handle = match device.subscribe(channel.id) {
                Ok(handle) => handle,
                Err(e) => {
                    queues.release(device, ledger);
                    return Err(e.into());
                }
            };
            log::debug!(
                "Subscribed {} with trigger '{}' (subscription {})",
                channel,
                trigger.spec(),
                handle.subscription()
            );
            ledger.record(handle.clone());
            queues.queues.push(ChannelQueue {
                channel: channel.clone(),
                handle,
                trigger,
            });
        }
        Ok(queues)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.queues.iter().map(ChannelQueue::channel)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChannelQueue> {
        self.queues.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ChannelQueue> {
        self.queues.iter_mut()
    }

    /// Unsubscribe every queue now instead of waiting for session cleanup.
    pub fn release(&mut self, device: &dyn Device, ledger: &SubscriptionLedger) {
        for queue in self.queues.drain(..) {
            ledger.forget(&queue.handle);
            if let Err(e) = device.unsubscribe(&queue.handle) {
                log::warn!("Failed to unsubscribe {}: {}", queue.channel, e);
            }
        }
    }
}

/// Every subscription handed out during one orchestrator session.
///
/// Cloning shares the ledger.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionLedger {
    handles: Arc<Mutex<Vec<QueueHandle>>>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, handle: QueueHandle) {
        self.handles.lock().push(handle);
    }

    pub fn forget(&self, handle: &QueueHandle) {
        self.handles
            .lock()
            .retain(|h| h.subscription() != handle.subscription());
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Best-effort unsubscribe of everything still recorded.
    ///
    /// Failures are logged; the ledger is empty afterwards.
    pub fn release_all(&self, device: &dyn Device) -> usize {
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut released = 0;
        for handle in &handles {
            match device.unsubscribe(handle) {
                Ok(()) => released += 1,
                Err(e) => log::warn!(
                    "Failed to unsubscribe channel {} (subscription {}): {}",
                    handle.channel(),
                    handle.subscription(),
                    e
                ),
            }
        }
        log::debug!("Released {} of {} subscriptions", released, handles.len());
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated_device::SimulatedDevice;
    use crate::trigger_config::TriggerMap;

    fn device() -> SimulatedDevice {
        let device = SimulatedDevice::new();
        device.connect().unwrap();
        device
    }

    #[test]
    fn test_subscribe_couples_triggers() {
        let device = device();
        let ledger = SubscriptionLedger::new();
        let session = TriggerSession::new();
        let channels = device.channel_list().unwrap()[..2].to_vec();
        let map: TriggerMap = "1:er#0,0,10".parse().unwrap();

        let queues = JobQueues::subscribe(&device, &ledger, &session, &channels, |chan| {
            map.lookup(chan).copied().unwrap_or_default()
        })
        .unwrap();

        assert_eq!(queues.len(), 2);
        assert_eq!(ledger.len(), 2);
        assert_eq!(session.len(), 2);
        // cross source lives in the same job, so it is wired immediately
        assert!(session.unresolved().is_empty());
        let ids: Vec<ChannelId> = queues.channels().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_subscribe_failure_rolls_back() {
        let device = device();
        let ledger = SubscriptionLedger::new();
        let session = TriggerSession::new();
        let mut channels = device.channel_list().unwrap()[..1].to_vec();
        channels.push(Channel::new(42, 1, "ghost"));

        let err = JobQueues::subscribe(&device, &ledger, &session, &channels, |_| {
            TriggerSpec::default()
        })
        .unwrap_err();
        assert!(matches!(err, QueueError::Device(DeviceError::UnknownChannel(42))));
        assert!(ledger.is_empty());
        assert!(session.is_empty());
    }

    #[test]
    fn test_release_all() {
        let device = device();
        let ledger = SubscriptionLedger::new();
        let session = TriggerSession::new();
        let channels = device.channel_list().unwrap();
        let _queues = JobQueues::subscribe(&device, &ledger, &session, &channels, |_| {
            TriggerSpec::default()
        })
        .unwrap();

        assert_eq!(ledger.release_all(&device), channels.len());
        assert!(ledger.is_empty());
        // already gone on the device side
        assert_eq!(ledger.release_all(&device), 0);
    }
}
