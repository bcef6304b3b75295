//! Topic channel multiplexer.
//!
//! Shares one logical channel per topic across any number of subscribers.
//! Channels are reference-counted; when the last subscriber goes away the
//! channel is kept open for a short grace period so that rapid
//! unsubscribe/resubscribe cycles (a view unmounting and remounting during
//! navigation) reuse the same channel instead of flapping the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::MuxError;
use crate::transport::{
    ChannelEvent, ChannelStatus, ConnectionStatus, PresenceEvent, TopicChannel, Transport,
};

/// Handler for broadcast payloads on one (topic, event) pair. Errors are
/// caught and logged at dispatch; they never abort delivery to other
/// handlers.
pub type EventHandler = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

/// Handler for presence traffic on one topic.
pub type PresenceHandler = Arc<dyn Fn(PresenceEvent) -> anyhow::Result<()> + Send + Sync>;

/// Multiplexer tunables.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Grace period between the last unsubscribe and actual channel teardown.
    pub teardown_delay: Duration,
    /// Topic of the always-open channel that pins the physical connection.
    pub keepalive_topic: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            teardown_delay: Duration::from_millis(1000),
            keepalive_topic: "mux:keepalive".to_string(),
        }
    }
}

/// Proof of one registration on a topic. Returned by the subscribe calls
/// and consumed by [`TopicMultiplexer::unsubscribe`], which removes exactly
/// this registration and drops one reference on the topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Per-topic channel state. Owned exclusively by the multiplexer; the
/// channel handle itself never escapes.
struct ChannelRecord<C> {
    channel: C,
    refcount: usize,
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
    presence_handlers: Vec<(u64, PresenceHandler)>,
    status_tx: watch::Sender<ChannelStatus>,
    /// Set while a delayed teardown is pending; cancelled by a resubscribe.
    pending_teardown: Option<CancellationToken>,
    reader_cancel: CancellationToken,
}

struct MuxInner<T: Transport> {
    transport: T,
    channels: RwLock<HashMap<String, ChannelRecord<T::Channel>>>,
    keepalive: RwLock<Option<T::Channel>>,
    config: MuxConfig,
    next_id: AtomicU64,
}

/// Shares per-topic channels across subscribers with delayed teardown.
///
/// Constructed explicitly and passed down by the application's startup
/// sequence; cheap to clone (clones share state).
pub struct TopicMultiplexer<T: Transport> {
    inner: Arc<MuxInner<T>>,
}

impl<T: Transport> Clone for TopicMultiplexer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> TopicMultiplexer<T> {
    /// Connect the transport and open the keep-alive channel.
    ///
    /// The keep-alive channel holds the physical connection open while the
    /// last real topic refcount is momentarily zero during a view switch;
    /// it is torn down only by [`cleanup`](Self::cleanup).
    pub async fn connect(transport: T, config: MuxConfig) -> Result<Self, MuxError> {
        transport.connect().await?;
        let inner = Arc::new(MuxInner {
            transport,
            channels: RwLock::new(HashMap::new()),
            keepalive: RwLock::new(None),
            config,
            next_id: AtomicU64::new(1),
        });
        let keepalive = inner
            .transport
            .open_channel(&inner.config.keepalive_topic)
            .await?;
        *inner.keepalive.write().await = Some(keepalive);
        info!(topic = %inner.config.keepalive_topic, "multiplexer connected");
        Ok(Self { inner })
    }

    /// Register `handler` for `event` broadcasts on `topic`, opening the
    /// topic channel if this is the first registration.
    pub async fn subscribe(
        &self,
        topic: &str,
        event: &str,
        handler: EventHandler,
    ) -> Result<Subscription, MuxError> {
        let event = event.to_string();
        self.register(topic, move |record, id| {
            record.handlers.entry(event).or_default().push((id, handler));
        })
        .await
    }

    /// Register `handler` for presence traffic on `topic`.
    pub async fn subscribe_presence(
        &self,
        topic: &str,
        handler: PresenceHandler,
    ) -> Result<Subscription, MuxError> {
        self.register(topic, move |record, id| {
            record.presence_handlers.push((id, handler));
        })
        .await
    }

    async fn register(
        &self,
        topic: &str,
        add: impl FnOnce(&mut ChannelRecord<T::Channel>, u64),
    ) -> Result<Subscription, MuxError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut channels = self.inner.channels.write().await;
            if let Some(record) = channels.get_mut(topic) {
                if let Some(pending) = record.pending_teardown.take() {
                    debug!(topic, "resubscribed before teardown fired; reusing channel");
                    pending.cancel();
                }
                record.refcount += 1;
                add(record, id);
                return Ok(Subscription {
                    topic: topic.to_string(),
                    id,
                });
            }
        }

        // Open without holding the lock so event dispatch on other topics is
        // not stalled by a slow join.
        let channel = self.inner.transport.open_channel(topic).await?;

        let mut channels = self.inner.channels.write().await;
        if let Some(record) = channels.get_mut(topic) {
            // Lost the race against a concurrent first subscribe.
            channel.close().await;
            if let Some(pending) = record.pending_teardown.take() {
                pending.cancel();
            }
            record.refcount += 1;
            add(record, id);
            return Ok(Subscription {
                topic: topic.to_string(),
                id,
            });
        }

        let events = channel.subscribe_events();
        let (status_tx, _) = watch::channel(ChannelStatus::Connecting);
        let reader_cancel = CancellationToken::new();
        spawn_reader(
            self.inner.clone(),
            topic.to_string(),
            events,
            reader_cancel.clone(),
        );

        let mut record = ChannelRecord {
            channel,
            refcount: 1,
            handlers: HashMap::new(),
            presence_handlers: Vec::new(),
            status_tx,
            pending_teardown: None,
            reader_cancel,
        };
        add(&mut record, id);
        channels.insert(topic.to_string(), record);
        debug!(topic, "opened topic channel");
        Ok(Subscription {
            topic: topic.to_string(),
            id,
        })
    }

    /// Remove a registration and drop one reference on its topic. When the
    /// last reference goes, teardown is scheduled after the grace period.
    pub async fn unsubscribe(&self, sub: Subscription) {
        let mut channels = self.inner.channels.write().await;
        let Some(record) = channels.get_mut(&sub.topic) else {
            debug!(topic = %sub.topic, "unsubscribe for unknown topic");
            return;
        };
        for list in record.handlers.values_mut() {
            list.retain(|(id, _)| *id != sub.id);
        }
        record.handlers.retain(|_, list| !list.is_empty());
        record.presence_handlers.retain(|(id, _)| *id != sub.id);
        record.refcount = record.refcount.saturating_sub(1);

        if record.refcount == 0 && record.pending_teardown.is_none() {
            let token = CancellationToken::new();
            record.pending_teardown = Some(token.clone());
            let inner = self.inner.clone();
            let topic = sub.topic.clone();
            let delay = self.inner.config.teardown_delay;
            debug!(topic = %sub.topic, ?delay, "last subscriber gone; teardown scheduled");
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => finish_teardown(&inner, &topic, &token).await,
                }
            });
        }
    }

    /// Broadcast a named event on an open topic channel.
    pub async fn publish(&self, topic: &str, event: &str, payload: Value) -> Result<(), MuxError> {
        let channels = self.inner.channels.read().await;
        let record = channels
            .get(topic)
            .ok_or_else(|| MuxError::ChannelNotFound(topic.to_string()))?;
        record.channel.broadcast(event, payload).await?;
        Ok(())
    }

    /// Advertise a presence payload on an open topic channel.
    pub async fn track_presence(
        &self,
        topic: &str,
        key: &str,
        payload: Value,
    ) -> Result<(), MuxError> {
        let channels = self.inner.channels.read().await;
        let record = channels
            .get(topic)
            .ok_or_else(|| MuxError::ChannelNotFound(topic.to_string()))?;
        record.channel.track_presence(key, payload).await?;
        Ok(())
    }

    /// Withdraw every presence payload advertised on `topic`.
    pub async fn untrack_presence(&self, topic: &str) -> Result<(), MuxError> {
        let channels = self.inner.channels.read().await;
        let record = channels
            .get(topic)
            .ok_or_else(|| MuxError::ChannelNotFound(topic.to_string()))?;
        record.channel.untrack_presence().await?;
        Ok(())
    }

    /// Watch a topic channel's status. A fresh receiver observes the current
    /// status immediately and every change after; dropping it unregisters
    /// the listener.
    pub async fn status_watch(
        &self,
        topic: &str,
    ) -> Result<watch::Receiver<ChannelStatus>, MuxError> {
        let channels = self.inner.channels.read().await;
        let record = channels
            .get(topic)
            .ok_or_else(|| MuxError::ChannelNotFound(topic.to_string()))?;
        Ok(record.status_tx.subscribe())
    }

    /// Watch the physical connection status.
    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.transport.connection_status()
    }

    /// Number of live registrations on `topic`, if a channel is open.
    pub async fn subscriber_count(&self, topic: &str) -> Option<usize> {
        self.inner
            .channels
            .read()
            .await
            .get(topic)
            .map(|r| r.refcount)
    }

    /// Topics with an open channel (pending-teardown channels included).
    pub async fn topics(&self) -> Vec<String> {
        self.inner.channels.read().await.keys().cloned().collect()
    }

    /// Tear down every channel unconditionally and cancel all pending
    /// timers. Used on logout/app teardown.
    pub async fn cleanup(&self) {
        let records: Vec<(String, ChannelRecord<T::Channel>)> = {
            let mut channels = self.inner.channels.write().await;
            channels.drain().collect()
        };
        for (topic, mut record) in records {
            if let Some(pending) = record.pending_teardown.take() {
                pending.cancel();
            }
            record.reader_cancel.cancel();
            record.status_tx.send_replace(ChannelStatus::Closed);
            record.channel.close().await;
            debug!(topic = %topic, "closed topic channel");
        }
        if let Some(keepalive) = self.inner.keepalive.write().await.take() {
            keepalive.close().await;
        }
        info!("multiplexer cleaned up");
    }
}

fn spawn_reader<T: Transport>(
    inner: Arc<MuxInner<T>>,
    topic: String,
    mut events: broadcast::Receiver<ChannelEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = events.recv() => match result {
                    Ok(ChannelEvent::Broadcast { event, payload }) => {
                        dispatch_broadcast(&inner, &topic, &event, payload).await;
                    }
                    Ok(ChannelEvent::Presence(presence)) => {
                        dispatch_presence(&inner, &topic, presence).await;
                    }
                    Ok(ChannelEvent::Status(status)) => {
                        // Registrations survive an error status; a transport
                        // reconnect re-arms this same record.
                        let channels = inner.channels.read().await;
                        if let Some(record) = channels.get(&topic) {
                            record.status_tx.send_replace(status);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %topic, "channel events lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic = %topic, "channel event stream ended");
                        break;
                    }
                }
            }
        }
    });
}

async fn dispatch_broadcast<T: Transport>(
    inner: &Arc<MuxInner<T>>,
    topic: &str,
    event: &str,
    payload: Value,
) {
    let handlers: Vec<EventHandler> = {
        let channels = inner.channels.read().await;
        match channels.get(topic).and_then(|r| r.handlers.get(event)) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        }
    };
    for handler in &handlers {
        // A failing handler must not stop delivery to the others.
        if let Err(e) = handler(payload.clone()) {
            error!(topic, event, "broadcast handler failed: {e:#}");
        }
    }
}

async fn dispatch_presence<T: Transport>(
    inner: &Arc<MuxInner<T>>,
    topic: &str,
    presence: PresenceEvent,
) {
    let handlers: Vec<PresenceHandler> = {
        let channels = inner.channels.read().await;
        match channels.get(topic) {
            Some(record) => record
                .presence_handlers
                .iter()
                .map(|(_, h)| h.clone())
                .collect(),
            None => return,
        }
    };
    for handler in &handlers {
        if let Err(e) = handler(presence.clone()) {
            error!(topic, "presence handler failed: {e:#}");
        }
    }
}

async fn finish_teardown<T: Transport>(
    inner: &Arc<MuxInner<T>>,
    topic: &str,
    token: &CancellationToken,
) {
    let record = {
        let mut channels = inner.channels.write().await;
        // Cancellation happens under this same lock, so an uncancelled
        // token here means no subscribe raced the timer.
        let expired = channels
            .get(topic)
            .is_some_and(|r| r.refcount == 0 && !token.is_cancelled());
        if expired { channels.remove(topic) } else { None }
    };
    if let Some(record) = record {
        record.reader_cancel.cancel();
        record.status_tx.send_replace(ChannelStatus::Closed);
        record.channel.close().await;
        debug!(topic, "topic channel torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::{Duration, sleep, timeout};

    const TOPIC: &str = "room:1";

    async fn new_mux() -> (TopicMultiplexer<MemoryTransport>, MemoryTransport) {
        let transport = MemoryTransport::new();
        let mux = TopicMultiplexer::connect(transport.clone(), MuxConfig::default())
            .await
            .unwrap();
        (mux, transport)
    }

    fn counting_handler() -> (EventHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = count.clone();
        let handler: EventHandler = Arc::new(move |_| {
            count_in.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        (handler, count)
    }

    fn forwarding_handler() -> (EventHandler, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |payload| {
            let _ = tx.send(payload);
            Ok(())
        });
        (handler, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_resubscribe_reuses_channel() {
        let (mux, transport) = new_mux().await;
        let (handler, _count) = counting_handler();

        let sub = mux.subscribe(TOPIC, "message", handler.clone()).await.unwrap();
        assert_eq!(transport.opened_count(TOPIC), 1);

        mux.unsubscribe(sub).await;
        sleep(Duration::from_millis(300)).await; // inside the grace period

        let sub2 = mux.subscribe(TOPIC, "message", handler).await.unwrap();
        sleep(Duration::from_secs(5)).await;

        // Same channel the whole way: no reopen, no close.
        assert_eq!(transport.opened_count(TOPIC), 1);
        assert_eq!(transport.closed_count(TOPIC), 0);

        mux.unsubscribe(sub2).await;
        sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.closed_count(TOPIC), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_fires_exactly_once_after_delay() {
        let (mux, transport) = new_mux().await;
        let (handler, _count) = counting_handler();

        let sub = mux.subscribe(TOPIC, "message", handler).await.unwrap();
        mux.unsubscribe(sub).await;

        sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.closed_count(TOPIC), 1);
        assert!(mux.subscriber_count(TOPIC).await.is_none());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.closed_count(TOPIC), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn churn_leaves_no_duplicate_registrations() {
        let (mux, _transport) = new_mux().await;
        let (old_handler, old_count) = counting_handler();
        let (new_handler, mut new_rx) = forwarding_handler();

        let sub = mux.subscribe(TOPIC, "message", old_handler).await.unwrap();
        mux.unsubscribe(sub).await;
        let _sub2 = mux.subscribe(TOPIC, "message", new_handler).await.unwrap();

        mux.publish(TOPIC, "message", json!({"n": 1})).await.unwrap();

        let payload = timeout(Duration::from_secs(1), new_rx.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(payload["n"], 1);
        // No second delivery queued, and the removed handler saw nothing.
        assert!(new_rx.try_recv().is_err());
        assert_eq!(old_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_starve_others() {
        let (mux, _transport) = new_mux().await;
        let failing: EventHandler = Arc::new(|_| anyhow::bail!("boom"));
        let (ok_handler, mut rx) = forwarding_handler();

        let _a = mux.subscribe(TOPIC, "message", failing).await.unwrap();
        let _b = mux.subscribe(TOPIC, "message", ok_handler).await.unwrap();

        mux.publish(TOPIC, "message", json!({"n": 7})).await.unwrap();

        let payload = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(payload["n"], 7);
    }

    #[tokio::test]
    async fn handlers_are_demultiplexed_by_event_name() {
        let (mux, _transport) = new_mux().await;
        let (message_handler, mut message_rx) = forwarding_handler();
        let (reaction_handler, mut reaction_rx) = forwarding_handler();

        let _a = mux.subscribe(TOPIC, "message", message_handler).await.unwrap();
        let _b = mux
            .subscribe(TOPIC, "reaction", reaction_handler)
            .await
            .unwrap();

        mux.publish(TOPIC, "reaction", json!({"emoji": "🦀"}))
            .await
            .unwrap();

        let payload = timeout(Duration::from_secs(1), reaction_rx.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(payload["emoji"], "🦀");
        assert!(message_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn status_watch_sees_current_then_changes() {
        let (mux, transport) = new_mux().await;
        let (handler, mut rx) = forwarding_handler();
        let _sub = mux.subscribe(TOPIC, "message", handler).await.unwrap();

        let mut status = mux.status_watch(TOPIC).await.unwrap();
        status
            .wait_for(|s| *s == ChannelStatus::Subscribed)
            .await
            .unwrap();

        transport.emit_status(TOPIC, ChannelStatus::Error);
        status
            .wait_for(|s| *s == ChannelStatus::Error)
            .await
            .unwrap();

        // Registrations survive the error: delivery still works.
        mux.publish(TOPIC, "message", json!({"n": 2})).await.unwrap();
        let payload = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(payload["n"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_channel_outlives_topic_churn() {
        let (mux, transport) = new_mux().await;
        let keepalive = MuxConfig::default().keepalive_topic;
        assert_eq!(transport.open_channels(&keepalive), 1);

        let (handler, _count) = counting_handler();
        let sub = mux.subscribe(TOPIC, "message", handler).await.unwrap();
        mux.unsubscribe(sub).await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.open_channels(TOPIC), 0);
        assert_eq!(transport.open_channels(&keepalive), 1);

        mux.cleanup().await;
        assert_eq!(transport.open_channels(&keepalive), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_pending_teardown_timers() {
        let (mux, transport) = new_mux().await;
        let (handler, _count) = counting_handler();
        let sub = mux.subscribe(TOPIC, "message", handler).await.unwrap();
        mux.unsubscribe(sub).await;

        mux.cleanup().await;
        assert_eq!(transport.closed_count(TOPIC), 1);

        // The scheduled timer must not double-close after the delay.
        sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.closed_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn publish_without_channel_is_an_error() {
        let (mux, _transport) = new_mux().await;
        let err = mux
            .publish("room:unknown", "message", json!({}))
            .await
            .expect_err("publish should fail");
        assert!(matches!(err, MuxError::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn presence_traffic_reaches_presence_handlers() {
        let (mux, transport) = new_mux().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: PresenceHandler = Arc::new(move |event| {
            let _ = tx.send(event);
            Ok(())
        });
        let _sub = mux.subscribe_presence(TOPIC, handler).await.unwrap();

        // A second connection announces itself on the same topic.
        let remote = transport.open_channel(TOPIC).await.unwrap();
        remote
            .track_presence("bob", json!({"status": "online"}))
            .await
            .unwrap();

        loop {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("presence event timed out")
                .unwrap();
            match event {
                PresenceEvent::Join { entries } => {
                    assert_eq!(entries[0].key, "bob");
                    break;
                }
                PresenceEvent::Sync { .. } => continue,
                other => panic!("unexpected presence event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn subscriber_count_tracks_references() {
        let (mux, _transport) = new_mux().await;
        let (h1, _c1) = counting_handler();
        let (h2, _c2) = counting_handler();

        let a = mux.subscribe(TOPIC, "message", h1).await.unwrap();
        let b = mux.subscribe(TOPIC, "reaction", h2).await.unwrap();
        assert_eq!(mux.subscriber_count(TOPIC).await, Some(2));

        mux.unsubscribe(a).await;
        assert_eq!(mux.subscriber_count(TOPIC).await, Some(1));
        mux.unsubscribe(b).await;
        assert_eq!(mux.subscriber_count(TOPIC).await, Some(0));
    }
}
