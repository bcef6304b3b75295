//! Ephemeral typing signals.
//!
//! One broadcaster per (conversation-or-channel, local member). Outbound
//! signals are coalesced: the first `start_typing` emits a "typing" signal,
//! subsequent calls while already typing only re-arm the quiet-period
//! countdown. The stop signal is emitted once, either explicitly or when
//! the countdown expires. Inbound signals feed a short-lived map of who is
//! typing right now; the local member's own echo is filtered out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use topic_mux::{EventHandler, Subscription, TopicMultiplexer, Transport};

use crate::config::TypingConfig;
use crate::error::RealtimeError;
use crate::models::EntityRef;

/// Event name used for typing traffic on a conversation topic.
pub const TYPING_EVENT: &str = "typing";

/// Typing topic for an entity.
pub fn typing_topic(entity: &EntityRef) -> String {
    format!("typing:{}", entity.topic_segment())
}

/// Wire payload for a typing signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingSignal {
    pub member_id: String,
    pub typing: bool,
}

/// Change feed for UI observers.
#[derive(Debug, Clone)]
pub enum TypingChange {
    Started { member_id: String },
    Stopped { member_id: String },
}

struct TypingShared {
    member_id: String,
    remote: RwLock<HashMap<String, DateTime<Utc>>>,
    changes_tx: broadcast::Sender<TypingChange>,
}

impl TypingShared {
    fn apply(&self, signal: TypingSignal) {
        if signal.member_id == self.member_id {
            // Our own broadcast echoed back.
            return;
        }
        if signal.typing {
            let fresh = self
                .remote
                .write()
                .unwrap()
                .insert(signal.member_id.clone(), Utc::now())
                .is_none();
            if fresh {
                let _ = self.changes_tx.send(TypingChange::Started {
                    member_id: signal.member_id,
                });
            }
        } else {
            let removed = self
                .remote
                .write()
                .unwrap()
                .remove(&signal.member_id)
                .is_some();
            if removed {
                let _ = self.changes_tx.send(TypingChange::Stopped {
                    member_id: signal.member_id,
                });
            }
        }
    }
}

struct LocalTyping {
    active: bool,
    countdown: Option<CancellationToken>,
}

/// Sends and receives typing signals for one entity.
pub struct TypingBroadcaster<T: Transport> {
    mux: TopicMultiplexer<T>,
    topic: String,
    member_id: String,
    countdown: Duration,
    shared: Arc<TypingShared>,
    local: Arc<tokio::sync::Mutex<LocalTyping>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<T: Transport> TypingBroadcaster<T> {
    /// Share the entity's typing topic and start listening for signals.
    pub async fn attach(
        mux: &TopicMultiplexer<T>,
        entity: &EntityRef,
        member_id: &str,
        config: TypingConfig,
    ) -> Result<Self, RealtimeError> {
        let topic = typing_topic(entity);
        let shared = Arc::new(TypingShared {
            member_id: member_id.to_string(),
            remote: RwLock::new(HashMap::new()),
            changes_tx: broadcast::channel(64).0,
        });

        let handler: EventHandler = {
            let shared = shared.clone();
            Arc::new(move |payload| {
                let signal: TypingSignal = serde_json::from_value(payload)?;
                shared.apply(signal);
                Ok(())
            })
        };
        let subscription = mux.subscribe(&topic, TYPING_EVENT, handler).await?;
        debug!(topic = %topic, member = member_id, "typing broadcaster attached");

        Ok(Self {
            mux: mux.clone(),
            topic,
            member_id: member_id.to_string(),
            countdown: config.countdown,
            shared,
            local: Arc::new(tokio::sync::Mutex::new(LocalTyping {
                active: false,
                countdown: None,
            })),
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Signal that the local member is typing. The first call emits the
    /// started signal; every call re-arms the quiet-period countdown, so a
    /// burst of keystrokes produces exactly one broadcast.
    pub async fn start_typing(&self) -> Result<(), RealtimeError> {
        let mut local = self.local.lock().await;
        if !local.active {
            self.mux
                .publish(&self.topic, TYPING_EVENT, self.signal(true))
                .await?;
            local.active = true;
        }

        if let Some(previous) = local.countdown.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        local.countdown = Some(token.clone());

        let mux = self.mux.clone();
        let topic = self.topic.clone();
        let member_id = self.member_id.clone();
        let shared_local = self.local.clone();
        let countdown = self.countdown;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(countdown) => {
                    let mut local = shared_local.lock().await;
                    // Cancellation happens under this lock; a cancelled token
                    // here means a newer keystroke superseded this timer.
                    if token.is_cancelled() || !local.active {
                        return;
                    }
                    let payload = json!({ "member_id": member_id, "typing": false });
                    if let Err(e) = mux.publish(&topic, TYPING_EVENT, payload).await {
                        warn!(topic = %topic, "failed to emit typing stop: {e}");
                    }
                    local.active = false;
                    local.countdown = None;
                }
            }
        });
        Ok(())
    }

    /// Emit the stopped signal if currently typing; a no-op otherwise.
    pub async fn stop_typing(&self) -> Result<(), RealtimeError> {
        let mut local = self.local.lock().await;
        if !local.active {
            return Ok(());
        }
        if let Some(previous) = local.countdown.take() {
            previous.cancel();
        }
        self.mux
            .publish(&self.topic, TYPING_EVENT, self.signal(false))
            .await?;
        local.active = false;
        Ok(())
    }

    /// Members currently typing (local member excluded), sorted for stable
    /// display.
    pub fn typing_members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.shared.remote.read().unwrap().keys().cloned().collect();
        members.sort();
        members
    }

    pub fn is_typing(&self, member_id: &str) -> bool {
        self.shared.remote.read().unwrap().contains_key(member_id)
    }

    /// Change feed for UI observers.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<TypingChange> {
        self.shared.changes_tx.subscribe()
    }

    /// Stop typing if needed and release the topic reference.
    pub async fn detach(&self) {
        if let Err(e) = self.stop_typing().await {
            warn!(topic = %self.topic, "failed to stop typing on detach: {e}");
        }
        let subscription = self.subscription.lock().unwrap().take();
        if let Some(subscription) = subscription {
            self.mux.unsubscribe(subscription).await;
        }
        debug!(topic = %self.topic, member = %self.member_id, "typing broadcaster detached");
    }

    fn signal(&self, typing: bool) -> serde_json::Value {
        json!({ "member_id": self.member_id, "typing": typing })
    }
}
