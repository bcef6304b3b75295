//! In-process loopback transport.
//!
//! Every channel opened for a topic joins the same in-memory hub; broadcasts
//! and presence traffic fan out to all of them (including the sender, which
//! mirrors how the real server echoes broadcasts back). Used by tests across
//! the workspace and usable as an offline transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{
    ChannelEvent, ChannelStatus, ConnectionStatus, PresenceEntry, PresenceEvent, TopicChannel,
    Transport,
};

const EVENT_CAPACITY: usize = 64;

/// One payload advertised under a presence key by one channel.
struct Meta {
    channel_id: u64,
    payload: Value,
}

struct Slot {
    channel_id: u64,
    tx: broadcast::Sender<ChannelEvent>,
}

#[derive(Default)]
struct TopicHub {
    slots: Vec<Slot>,
    presence: HashMap<String, Vec<Meta>>,
    opened: u64,
    closed: u64,
}

impl TopicHub {
    fn fan_out(&self, event: ChannelEvent) {
        for slot in &self.slots {
            let _ = slot.tx.send(event.clone());
        }
    }

    fn snapshot(&self) -> Vec<PresenceEntry> {
        self.presence
            .iter()
            .map(|(key, metas)| PresenceEntry {
                key: key.clone(),
                payloads: metas.iter().map(|m| m.payload.clone()).collect(),
            })
            .collect()
    }

    /// Remove every payload tracked by `channel_id`; returns leave entries
    /// for keys that no longer have any tracker.
    fn untrack_channel(&mut self, channel_id: u64) -> Vec<PresenceEntry> {
        let mut leaves = Vec::new();
        self.presence.retain(|key, metas| {
            let removed: Vec<Value> = metas
                .iter()
                .filter(|m| m.channel_id == channel_id)
                .map(|m| m.payload.clone())
                .collect();
            metas.retain(|m| m.channel_id != channel_id);
            if metas.is_empty() && !removed.is_empty() {
                leaves.push(PresenceEntry {
                    key: key.clone(),
                    payloads: removed,
                });
            }
            !metas.is_empty()
        });
        leaves
    }
}

struct Hub {
    topics: Mutex<HashMap<String, TopicHub>>,
    status_tx: watch::Sender<ConnectionStatus>,
    next_channel_id: AtomicU64,
    fail_presence: AtomicBool,
}

/// In-memory loopback [`Transport`]. Cheap to clone; clones share the hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            hub: Arc::new(Hub {
                topics: Mutex::new(HashMap::new()),
                status_tx,
                next_channel_id: AtomicU64::new(1),
                fail_presence: AtomicBool::new(false),
            }),
        }
    }

    /// How many channels have ever been opened for `topic`.
    pub fn opened_count(&self, topic: &str) -> u64 {
        self.hub
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .map_or(0, |t| t.opened)
    }

    /// How many channels have been closed for `topic`.
    pub fn closed_count(&self, topic: &str) -> u64 {
        self.hub
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .map_or(0, |t| t.closed)
    }

    /// Channels currently open for `topic`.
    pub fn open_channels(&self, topic: &str) -> usize {
        self.hub
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .map_or(0, |t| t.slots.len())
    }

    /// Push a status event to every channel on `topic` (simulates a
    /// server-side channel error or recovery).
    pub fn emit_status(&self, topic: &str, status: ChannelStatus) {
        if let Some(hub) = self.hub.topics.lock().unwrap().get(topic) {
            hub.fan_out(ChannelEvent::Status(status));
        }
    }

    /// Make subsequent `track_presence` calls fail (simulates a rejected
    /// presence advertisement).
    pub fn fail_presence_tracks(&self, enabled: bool) {
        self.hub.fail_presence.store(enabled, Ordering::Relaxed);
    }
}

impl Transport for MemoryTransport {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<(), TransportError> {
        self.hub.status_tx.send_replace(ConnectionStatus::Open);
        Ok(())
    }

    async fn open_channel(&self, topic: &str) -> Result<MemoryChannel, TransportError> {
        let channel_id = self.hub.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);

        let mut topics = self.hub.topics.lock().unwrap();
        let hub = topics.entry(topic.to_string()).or_default();
        hub.opened += 1;
        hub.slots.push(Slot {
            channel_id,
            tx: tx.clone(),
        });

        // Joining channels get the subscribed ack and a targeted presence
        // snapshot before any fan-out traffic.
        let _ = tx.send(ChannelEvent::Status(ChannelStatus::Subscribed));
        let _ = tx.send(ChannelEvent::Presence(PresenceEvent::Sync {
            state: hub.snapshot(),
        }));

        debug!(topic, channel_id, "opened loopback channel");

        Ok(MemoryChannel {
            topic: topic.to_string(),
            channel_id,
            hub: self.hub.clone(),
            tx,
            initial_rx: Mutex::new(Some(rx)),
        })
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.hub.status_tx.subscribe()
    }
}

/// A logical channel on the loopback hub.
pub struct MemoryChannel {
    topic: String,
    channel_id: u64,
    hub: Arc<Hub>,
    tx: broadcast::Sender<ChannelEvent>,
    /// Receiver created alongside the sender so events emitted during
    /// `open_channel` (subscribed ack, presence snapshot) are not lost
    /// before the first `subscribe_events` call.
    initial_rx: Mutex<Option<broadcast::Receiver<ChannelEvent>>>,
}

impl TopicChannel for MemoryChannel {
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        match self.initial_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => self.tx.subscribe(),
        }
    }

    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let topics = self.hub.topics.lock().unwrap();
        let hub = topics
            .get(&self.topic)
            .filter(|h| h.slots.iter().any(|s| s.channel_id == self.channel_id))
            .ok_or(TransportError::ChannelClosed)?;
        hub.fan_out(ChannelEvent::Broadcast {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    async fn track_presence(&self, key: &str, payload: Value) -> Result<(), TransportError> {
        if self.hub.fail_presence.load(Ordering::Relaxed) {
            return Err(TransportError::TrackFailed(
                "presence tracking rejected".to_string(),
            ));
        }
        let mut topics = self.hub.topics.lock().unwrap();
        let hub = topics
            .get_mut(&self.topic)
            .filter(|h| h.slots.iter().any(|s| s.channel_id == self.channel_id))
            .ok_or(TransportError::ChannelClosed)?;

        let metas = hub.presence.entry(key.to_string()).or_default();
        match metas.iter_mut().find(|m| m.channel_id == self.channel_id) {
            Some(meta) => meta.payload = payload.clone(),
            None => metas.push(Meta {
                channel_id: self.channel_id,
                payload: payload.clone(),
            }),
        }

        hub.fan_out(ChannelEvent::Presence(PresenceEvent::Join {
            entries: vec![PresenceEntry {
                key: key.to_string(),
                payloads: vec![payload],
            }],
        }));
        Ok(())
    }

    async fn untrack_presence(&self) -> Result<(), TransportError> {
        let mut topics = self.hub.topics.lock().unwrap();
        let hub = topics
            .get_mut(&self.topic)
            .ok_or(TransportError::ChannelClosed)?;
        let leaves = hub.untrack_channel(self.channel_id);
        if !leaves.is_empty() {
            hub.fan_out(ChannelEvent::Presence(PresenceEvent::Leave {
                entries: leaves,
            }));
        }
        Ok(())
    }

    async fn close(&self) {
        let mut topics = self.hub.topics.lock().unwrap();
        let Some(hub) = topics.get_mut(&self.topic) else {
            return;
        };
        let before = hub.slots.len();
        hub.slots.retain(|s| s.channel_id != self.channel_id);
        if hub.slots.len() < before {
            hub.closed += 1;
            debug!(topic = %self.topic, channel_id = self.channel_id, "closed loopback channel");
        }
        // A vanished connection takes its presence with it.
        let leaves = hub.untrack_channel(self.channel_id);
        if !leaves.is_empty() {
            hub.fan_out(ChannelEvent::Presence(PresenceEvent::Leave {
                entries: leaves,
            }));
        }
    }
}
