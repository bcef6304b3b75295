//! Optimistic outbound-message placeholders.
//!
//! When the UI submits a message, a placeholder keyed by a client-generated
//! id is held here so the view can render it immediately. The placeholder
//! is removed once the server-confirmed message arrives, or when the send
//! definitively fails (in which case the message is handed back to the
//! caller for error surfacing or retry).

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::EntityRef;

/// An unconfirmed outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub client_id: Uuid,
    pub target: EntityRef,
    pub queued_at: DateTime<Utc>,
    /// Entity metadata the view needs to render the placeholder.
    pub body: Value,
}

/// Change feed for UI observers.
#[derive(Debug, Clone)]
pub enum OutboxEvent {
    Queued(PendingMessage),
    Confirmed { client_id: Uuid },
    Failed { client_id: Uuid },
}

pub struct PendingOutbox {
    pending: RwLock<HashMap<Uuid, PendingMessage>>,
    events_tx: broadcast::Sender<OutboxEvent>,
}

impl Default for PendingOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingOutbox {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            events_tx: broadcast::channel(64).0,
        }
    }

    /// Queue a placeholder for an outbound message; returns it with a fresh
    /// client-generated id.
    pub fn enqueue(&self, target: EntityRef, body: Value) -> PendingMessage {
        let message = PendingMessage {
            client_id: Uuid::new_v4(),
            target,
            queued_at: Utc::now(),
            body,
        };
        self.pending
            .write()
            .unwrap()
            .insert(message.client_id, message.clone());
        debug!(client_id = %message.client_id, "queued outbound message");
        self.emit(OutboxEvent::Queued(message.clone()));
        message
    }

    /// The server-confirmed message arrived; drop the placeholder.
    pub fn confirm(&self, client_id: Uuid) -> bool {
        let removed = self.pending.write().unwrap().remove(&client_id).is_some();
        if removed {
            self.emit(OutboxEvent::Confirmed { client_id });
        }
        removed
    }

    /// The send definitively failed; the placeholder is handed back so the
    /// caller can surface the error or retry.
    pub fn fail(&self, client_id: Uuid) -> Option<PendingMessage> {
        let message = self.pending.write().unwrap().remove(&client_id);
        if message.is_some() {
            self.emit(OutboxEvent::Failed { client_id });
        }
        message
    }

    /// Placeholders targeting `entity`, oldest first.
    pub fn pending_for(&self, entity: &EntityRef) -> Vec<PendingMessage> {
        let mut messages: Vec<PendingMessage> = self
            .pending
            .read()
            .unwrap()
            .values()
            .filter(|m| &m.target == entity)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.queued_at);
        messages
    }

    pub fn len(&self) -> usize {
        self.pending.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().unwrap().is_empty()
    }

    /// Change feed for UI observers.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<OutboxEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: OutboxEvent) {
        let _ = self.events_tx.send(event);
    }
}
