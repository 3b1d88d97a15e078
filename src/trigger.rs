//! Stateful trigger evaluation with cross-channel wiring.
//!
//! Every `(job, channel)` pair owns one [`TriggerState`]. States are
//! registered in a [`TriggerSession`], an arena addressed by
//! generation-checked [`TriggerHandle`]s, so that an edge seen on one
//! channel can gate the capture of another:
//!
//! ```text
//!   chan A worker                     chan B worker
//!   evaluate(batch A) ──propagate──▶  B.cross (Mutex) ──read──▶ evaluate(batch B)
//! ```
//!
//! A state whose source does not exist yet is parked in the session's
//! pending set and wired as soon as a state for the source channel is
//! registered, so construction order does not matter.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::device::{ChannelId, Sample};
use crate::trigger_config::{TriggerKind, TriggerSpec};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Trigger on channel {channel} waits for source channel {source_channel} which is not registered")]
    UnresolvedSource {
        channel: ChannelId,
        source_channel: ChannelId,
    },

    #[error("Trigger on channel {channel} sourced from channel {source_channel} would close a cross-channel cycle")]
    CrossCycle {
        channel: ChannelId,
        source_channel: ChannelId,
    },

    #[error("Trigger handle {0:?} no longer refers to a live trigger")]
    StaleHandle(TriggerHandle),
}

/// Generation-checked reference into a [`TriggerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandle {
    index: u32,
    generation: u32,
}

/// Result of a cross-channel edge detected on the source's stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossTrigger {
    pub fired: bool,
    /// Pair index within the source buffer where the edge was found.
    pub index: usize,
}

/// The part of a trigger visible to other workers.
#[derive(Debug)]
struct TriggerNode {
    handle: TriggerHandle,
    channel: ChannelId,
    spec: TriggerSpec,
    subscribers: Mutex<Vec<TriggerHandle>>,
    cross: Option<Mutex<CrossTrigger>>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Weak<TriggerNode>>,
}

#[derive(Debug, Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Subscribers whose source channel has no registered trigger yet.
    pending: Vec<TriggerHandle>,
    /// Resolved cross links, subscriber to source.
    links: Vec<(TriggerHandle, TriggerHandle)>,
}

impl Registry {
    fn node(&self, handle: TriggerHandle) -> Option<Arc<TriggerNode>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref().and_then(Weak::upgrade)
    }

    fn allocate(&mut self) -> TriggerHandle {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            TriggerHandle { index, generation }
        } else {
            self.slots.push(Slot::default());
            TriggerHandle {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn release(&mut self, handle: TriggerHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation {
            return false;
        }
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        true
    }

    /// First live trigger registered for `channel`, skipping `exclude`.
    fn first_on_channel(
        &self,
        channel: ChannelId,
        exclude: TriggerHandle,
    ) -> Option<Arc<TriggerNode>> {
        let mut found = self
            .slots
            .iter()
            .filter_map(|slot| slot.node.as_ref().and_then(Weak::upgrade))
            .filter(|node| node.channel == channel && node.handle != exclude);
        let first = found.next();
        if first.is_some() && found.next().is_some() {
            log::debug!(
                "Several triggers registered for channel {}, using the first one as cross source",
                channel
            );
        }
        first
    }

    fn source_of(&self, subscriber: TriggerHandle) -> Option<TriggerHandle> {
        self.links
            .iter()
            .find(|(sub, _)| *sub == subscriber)
            .map(|(_, src)| *src)
    }

    fn link(&mut self, subscriber: &TriggerNode, source: &TriggerNode) {
        source.subscribers.lock().push(subscriber.handle);
        self.links.push((subscriber.handle, source.handle));
        log::debug!(
            "Wired cross trigger: channel {} follows edges of channel {}",
            subscriber.channel,
            source.channel
        );
    }
}

/// Arena of live triggers shared by every job of one orchestrator.
///
/// Slots hold weak references: registration never keeps a trigger alive.
/// Triggers deregister themselves when dropped, and [`TriggerSession::clear`]
/// invalidates every outstanding handle at once.
#[derive(Debug, Default)]
pub struct TriggerSession {
    registry: RwLock<Registry>,
}

impl TriggerSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register the trigger for one `(job, channel)` pair.
    ///
    /// A cross-channel trigger is wired to the first registered trigger of
    /// its source channel, or parked until one appears. Triggers already
    /// parked on `channel` are wired to the new one. Wiring that would close
    /// a cycle is rejected and nothing is registered.
    pub fn register(
        self: &Arc<Self>,
        channel: ChannelId,
        mut spec: TriggerSpec,
    ) -> Result<TriggerState, TriggerError> {
        if spec.source_channel == Some(channel) {
            spec.source_channel = None;
        }
        let mut registry = self.registry.write();
        let handle = registry.allocate();

        let source = spec
            .cross_source()
            .and_then(|src| registry.first_on_channel(src, handle));

        let adopted: Vec<Arc<TriggerNode>> = registry
            .pending
            .iter()
            .filter_map(|h| registry.node(*h))
            .filter(|node| node.spec.cross_source() == Some(channel))
            .collect();

        // New edges: handle -> source, adopted -> handle. Any path from the
        // source back to the new trigger or one of the adopted ones is a cycle.
        if let Some(src) = &source {
            let mut cursor = Some(src.handle);
            while let Some(current) = cursor {
                if current == handle || adopted.iter().any(|a| a.handle == current) {
                    registry.release(handle);
                    return Err(TriggerError::CrossCycle {
                        channel,
                        source_channel: src.channel,
                    });
                }
                cursor = registry.source_of(current);
            }
        }

        let node = Arc::new(TriggerNode {
            handle,
            channel,
            spec,
            subscribers: Mutex::new(Vec::new()),
            cross: spec
                .cross_source()
                .map(|_| Mutex::new(CrossTrigger::default())),
        });
        registry.slots[handle.index as usize].node = Some(Arc::downgrade(&node));

        match (&source, spec.cross_source()) {
            (Some(src), _) => registry.link(&node, src),
            (None, Some(src)) => {
                log::debug!(
                    "Trigger on channel {} waits for source channel {}",
                    channel,
                    src
                );
                registry.pending.push(handle);
            }
            (None, None) => {}
        }

        for subscriber in &adopted {
            registry.pending.retain(|h| *h != subscriber.handle);
            registry.link(subscriber, &node);
        }

        Ok(TriggerState {
            session: Arc::clone(self),
            node,
            cache: Vec::new(),
            triggered: false,
            offset_applied: false,
        })
    }

    /// Channels of cross triggers still waiting for their source.
    pub fn unresolved(&self) -> Vec<(ChannelId, ChannelId)> {
        let registry = self.registry.read();
        registry
            .pending
            .iter()
            .filter_map(|h| registry.node(*h))
            .filter_map(|node| node.spec.cross_source().map(|src| (node.channel, src)))
            .collect()
    }

    pub fn is_resolved(&self, handle: TriggerHandle) -> bool {
        self.registry.read().source_of(handle).is_some()
    }

    /// Handles of the triggers wired to follow `handle`.
    pub fn subscribers(&self, handle: TriggerHandle) -> Result<Vec<TriggerHandle>, TriggerError> {
        let node = self
            .registry
            .read()
            .node(handle)
            .ok_or(TriggerError::StaleHandle(handle))?;
        let subscribers = node.subscribers.lock().clone();
        Ok(subscribers)
    }

    pub fn len(&self) -> usize {
        let registry = self.registry.read();
        registry
            .slots
            .iter()
            .filter(|slot| slot.node.as_ref().is_some_and(|n| n.strong_count() > 0))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration, invalidating all handles.
    pub fn clear(&self) {
        let mut registry = self.registry.write();
        for slot in &mut registry.slots {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        registry.free = (0..registry.slots.len() as u32).rev().collect();
        registry.pending.clear();
        registry.links.clear();
    }

    fn resolve(&self, handles: &[TriggerHandle]) -> Vec<Arc<TriggerNode>> {
        let registry = self.registry.read();
        handles.iter().filter_map(|h| registry.node(*h)).collect()
    }

    fn deregister(&self, node: &TriggerNode) {
        let mut registry = self.registry.write();
        if !registry.release(node.handle) {
            return;
        }
        registry.pending.retain(|h| *h != node.handle);

        if let Some(source) = registry.source_of(node.handle).and_then(|h| registry.node(h)) {
            source.subscribers.lock().retain(|h| *h != node.handle);
        }
        // followers of this trigger go back to waiting for a source
        let orphans: Vec<TriggerHandle> = registry
            .links
            .iter()
            .filter(|(_, src)| *src == node.handle)
            .map(|(sub, _)| *sub)
            .collect();
        registry
            .links
            .retain(|(sub, src)| *sub != node.handle && *src != node.handle);
        for orphan in orphans {
            if registry.node(orphan).is_some() {
                registry.pending.push(orphan);
            }
        }
    }
}

/// Streaming evaluator bound to one `(job, channel)` pair.
///
/// Owned by the job's worker; only the cross-trigger result is shared.
#[derive(Debug)]
pub struct TriggerState {
    session: Arc<TriggerSession>,
    node: Arc<TriggerNode>,
    cache: Vec<Sample>,
    triggered: bool,
    offset_applied: bool,
}

impl TriggerState {
    pub fn handle(&self) -> TriggerHandle {
        self.node.handle
    }

    pub fn channel(&self) -> ChannelId {
        self.node.channel
    }

    pub fn spec(&self) -> &TriggerSpec {
        &self.node.spec
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Snapshot of the cross-trigger result, `None` for non-cross triggers.
    pub fn cross_result(&self) -> Option<CrossTrigger> {
        self.node.cross.as_ref().map(|cross| *cross.lock())
    }

    /// Feed newly arrived samples and get back the ones released downstream.
    pub fn evaluate(&mut self, batch: Vec<Sample>) -> Result<Vec<Sample>, TriggerError> {
        let mut combined = std::mem::take(&mut self.cache);
        combined.extend(batch);

        self.propagate(&combined);

        if self.triggered {
            return Ok(self.release(combined, 0));
        }

        if let Some(source) = self.node.spec.cross_source() {
            return self.evaluate_cross(combined, source);
        }

        match self.node.spec.kind {
            TriggerKind::Off => Ok(Vec::new()),
            TriggerKind::On => {
                self.latch();
                Ok(self.release(combined, 0))
            }
            TriggerKind::EdgeRising { .. } | TriggerKind::EdgeFalling { .. } => {
                match self.node.spec.find_crossing(&combined) {
                    Some(idx) => {
                        self.latch();
                        Ok(self.release(combined, idx))
                    }
                    None => {
                        self.keep_history(combined);
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn evaluate_cross(
        &mut self,
        combined: Vec<Sample>,
        source: ChannelId,
    ) -> Result<Vec<Sample>, TriggerError> {
        if !self.session.is_resolved(self.node.handle) {
            self.cache = combined;
            return Err(TriggerError::UnresolvedSource {
                channel: self.node.channel,
                source_channel: source,
            });
        }

        let fired = self
            .node
            .cross
            .as_ref()
            .is_some_and(|cross| cross.lock().fired);
        if fired {
            self.latch();
            Ok(self.release(combined, 0))
        } else {
            // grows until the source fires, the job's sample target bounds it
            self.cache = combined;
            Ok(Vec::new())
        }
    }

    /// Test every not-yet-fired follower's edge condition on this channel's data.
    fn propagate(&self, combined: &[Sample]) {
        let handles = self.node.subscribers.lock().clone();
        if handles.is_empty() {
            return;
        }
        for subscriber in self.session.resolve(&handles) {
            let Some(cross) = subscriber.cross.as_ref() else {
                continue;
            };
            let mut cross = cross.lock();
            if cross.fired {
                continue;
            }
            if let Some(index) = subscriber.spec.find_crossing(combined) {
                *cross = CrossTrigger { fired: true, index };
                log::debug!(
                    "Edge on channel {} fired cross trigger of channel {}",
                    self.node.channel,
                    subscriber.channel
                );
            }
        }
    }

    fn latch(&mut self) {
        if !self.triggered {
            log::debug!(
                "Trigger '{}' on channel {} latched",
                self.node.spec,
                self.node.channel
            );
        }
        self.triggered = true;
    }

    /// Emit `combined[idx - hoffset..]`, the offset counted only once per lifetime.
    fn release(&mut self, mut combined: Vec<Sample>, idx: usize) -> Vec<Sample> {
        let start = if self.offset_applied {
            idx
        } else {
            self.offset_applied = true;
            idx.saturating_sub(self.node.spec.horizontal_offset)
        };
        self.cache.clear();
        combined.split_off(start.min(combined.len()))
    }

    /// Retain the last `hoffset` samples as context for the next call.
    fn keep_history(&mut self, mut combined: Vec<Sample>) {
        let keep = self.node.spec.horizontal_offset;
        let drop = combined.len().saturating_sub(keep);
        combined.drain(..drop);
        self.cache = combined;
    }
}

impl Drop for TriggerState {
    fn drop(&mut self) {
        self.session.deregister(&self.node);
    }
}
