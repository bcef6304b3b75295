//! Workspace presence aggregation.
//!
//! One aggregator per (workspace, local member). It shares the workspace's
//! presence topic through the multiplexer, folds sync/join/leave traffic
//! into a per-member map, owns the local member's advertised record, and
//! demotes the local status to `away` when the page stays hidden past the
//! idle threshold.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use topic_mux::{
    PresenceEntry, PresenceEvent, PresenceHandler, Subscription, TopicMultiplexer, Transport,
};

use crate::config::PresenceConfig;
use crate::error::RealtimeError;
use crate::window::{Visibility, WindowSignals};

/// Presence topic for a workspace.
pub fn presence_topic(workspace_id: &str) -> String {
    format!("presence:{workspace_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Last known presence of one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub member_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Partial update to the local member's advertised presence.
/// `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    pub status: Option<PresenceStatus>,
    pub channel_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Change feed for UI observers.
#[derive(Debug, Clone)]
pub enum PresenceChange {
    /// The whole map was rebuilt from a snapshot.
    Synced,
    Joined(PresenceRecord),
    Left { member_id: String },
}

struct PresenceShared {
    members: RwLock<HashMap<String, PresenceRecord>>,
    my: RwLock<Option<PresenceRecord>>,
    changes_tx: broadcast::Sender<PresenceChange>,
}

impl PresenceShared {
    fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(64);
        Self {
            members: RwLock::new(HashMap::new()),
            my: RwLock::new(None),
            changes_tx,
        }
    }

    fn parse(value: &Value) -> Option<PresenceRecord> {
        match serde_json::from_value(value.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("ignoring invalid presence payload: {e}");
                None
            }
        }
    }

    /// The freshest parseable payload under a key.
    fn freshest(entry: &PresenceEntry) -> Option<PresenceRecord> {
        entry
            .payloads
            .iter()
            .filter_map(Self::parse)
            .max_by_key(|r| r.last_seen)
    }

    fn apply(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::Sync { state } => {
                let mut map = HashMap::with_capacity(state.len());
                for entry in &state {
                    if let Some(record) = Self::freshest(entry) {
                        map.insert(entry.key.clone(), record);
                    }
                }
                *self.members.write().unwrap() = map;
                let _ = self.changes_tx.send(PresenceChange::Synced);
            }
            PresenceEvent::Join { entries } => {
                for entry in &entries {
                    let Some(record) = Self::freshest(entry) else {
                        continue;
                    };
                    let mut members = self.members.write().unwrap();
                    // Latest timestamp wins per member key.
                    let stale = members
                        .get(&entry.key)
                        .is_some_and(|existing| existing.last_seen > record.last_seen);
                    if stale {
                        continue;
                    }
                    members.insert(entry.key.clone(), record.clone());
                    drop(members);
                    let _ = self.changes_tx.send(PresenceChange::Joined(record));
                }
            }
            PresenceEvent::Leave { entries } => {
                for entry in &entries {
                    let mut members = self.members.write().unwrap();
                    let known = match members.get_mut(&entry.key) {
                        Some(existing) => {
                            // A departed member keeps their last known
                            // location and last-seen time.
                            existing.status = PresenceStatus::Offline;
                            true
                        }
                        None => false,
                    };
                    drop(members);
                    if known {
                        let _ = self.changes_tx.send(PresenceChange::Left {
                            member_id: entry.key.clone(),
                        });
                    } else {
                        warn!(member = %entry.key, "leave for unknown member ignored");
                    }
                }
            }
        }
    }
}

/// Aggregates presence for one workspace and manages the local member's
/// advertised record.
pub struct PresenceAggregator<T: Transport> {
    mux: TopicMultiplexer<T>,
    topic: String,
    member_id: String,
    shared: Arc<PresenceShared>,
    subscription: Mutex<Option<Subscription>>,
    idle_cancel: CancellationToken,
}

impl<T: Transport> PresenceAggregator<T> {
    /// Join the workspace's presence topic and advertise the local member.
    ///
    /// The advertisement must be acknowledged by the transport before any
    /// local state is committed; on failure the registration is rolled back
    /// and nothing is written.
    pub async fn track(
        mux: &TopicMultiplexer<T>,
        workspace_id: &str,
        member_id: &str,
        initial_status: PresenceStatus,
        signals: WindowSignals,
        config: PresenceConfig,
    ) -> Result<Self, RealtimeError> {
        let topic = presence_topic(workspace_id);
        let shared = Arc::new(PresenceShared::new());

        let handler: PresenceHandler = {
            let shared = shared.clone();
            Arc::new(move |event| {
                shared.apply(event);
                Ok(())
            })
        };
        let subscription = mux.subscribe_presence(&topic, handler).await?;

        let record = PresenceRecord {
            member_id: member_id.to_string(),
            status: initial_status,
            last_seen: Utc::now(),
            channel_id: None,
            conversation_id: None,
        };
        let payload = serde_json::to_value(&record)?;
        if let Err(e) = mux.track_presence(&topic, member_id, payload).await {
            mux.unsubscribe(subscription).await;
            return Err(e.into());
        }
        *shared.my.write().unwrap() = Some(record);
        debug!(topic = %topic, member = member_id, "tracking presence");

        let idle_cancel = CancellationToken::new();
        spawn_idle_watcher(
            mux.clone(),
            topic.clone(),
            member_id.to_string(),
            shared.clone(),
            signals,
            config.idle_after,
            idle_cancel.clone(),
        );

        Ok(Self {
            mux: mux.clone(),
            topic,
            member_id: member_id.to_string(),
            shared,
            subscription: Mutex::new(Some(subscription)),
            idle_cancel,
        })
    }

    /// Merge `update` into the advertised record and re-announce it.
    /// Local state is committed only on transport acknowledgement.
    pub async fn update_presence(&self, update: PresenceUpdate) -> Result<(), RealtimeError> {
        advertise(
            &self.mux,
            &self.topic,
            &self.member_id,
            &self.shared,
            update,
        )
        .await
    }

    /// Clear the advertised location (leaving a channel/conversation view).
    pub async fn clear_location(&self) -> Result<(), RealtimeError> {
        let merged = {
            let my = self.shared.my.read().unwrap();
            let Some(current) = my.as_ref() else {
                return Err(RealtimeError::NotTracking);
            };
            PresenceRecord {
                member_id: current.member_id.clone(),
                status: current.status,
                last_seen: Utc::now(),
                channel_id: None,
                conversation_id: None,
            }
        };
        advertise_record(&self.mux, &self.topic, &self.member_id, &self.shared, merged).await
    }

    /// Last known record for a member. O(1) against the in-memory map.
    pub fn presence_by_member(&self, member_id: &str) -> Option<PresenceRecord> {
        self.shared.members.read().unwrap().get(member_id).cloned()
    }

    /// Snapshot of every known member record.
    pub fn members(&self) -> Vec<PresenceRecord> {
        self.shared.members.read().unwrap().values().cloned().collect()
    }

    /// The local member's committed record.
    pub fn my_presence(&self) -> Option<PresenceRecord> {
        self.shared.my.read().unwrap().clone()
    }

    /// Change feed for UI observers.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.shared.changes_tx.subscribe()
    }

    /// Announce departure, then release the topic reference. Other members'
    /// cached presence is left intact; other mounted observers may still
    /// depend on it.
    pub async fn untrack(&self) {
        self.idle_cancel.cancel();
        if let Err(e) = self.mux.untrack_presence(&self.topic).await {
            warn!(topic = %self.topic, "failed to untrack presence: {e}");
        }
        let subscription = self.subscription.lock().unwrap().take();
        if let Some(subscription) = subscription {
            self.mux.unsubscribe(subscription).await;
        }
        *self.shared.my.write().unwrap() = None;
        debug!(topic = %self.topic, member = %self.member_id, "presence untracked");
    }
}

/// Merge-and-advertise shared by the public API and the idle watcher.
async fn advertise<T: Transport>(
    mux: &TopicMultiplexer<T>,
    topic: &str,
    member_id: &str,
    shared: &PresenceShared,
    update: PresenceUpdate,
) -> Result<(), RealtimeError> {
    let merged = {
        let my = shared.my.read().unwrap();
        let Some(current) = my.as_ref() else {
            return Err(RealtimeError::NotTracking);
        };
        PresenceRecord {
            member_id: current.member_id.clone(),
            status: update.status.unwrap_or(current.status),
            last_seen: Utc::now(),
            channel_id: update.channel_id.or_else(|| current.channel_id.clone()),
            conversation_id: update
                .conversation_id
                .or_else(|| current.conversation_id.clone()),
        }
    };
    advertise_record(mux, topic, member_id, shared, merged).await
}

async fn advertise_record<T: Transport>(
    mux: &TopicMultiplexer<T>,
    topic: &str,
    member_id: &str,
    shared: &PresenceShared,
    record: PresenceRecord,
) -> Result<(), RealtimeError> {
    let payload = serde_json::to_value(&record)?;
    mux.track_presence(topic, member_id, payload).await?;
    *shared.my.write().unwrap() = Some(record);
    Ok(())
}

/// Demote to `away` after the page stays hidden past the threshold;
/// promote back to `online` as soon as it becomes visible again.
fn spawn_idle_watcher<T: Transport>(
    mux: TopicMultiplexer<T>,
    topic: String,
    member_id: String,
    shared: Arc<PresenceShared>,
    signals: WindowSignals,
    idle_after: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut visibility = signals.visibility_watch();
    tokio::spawn(async move {
        // Tracks whether the current `away` was set by us; a manual away is
        // never auto-promoted.
        let mut demoted = false;
        loop {
            let hidden = *visibility.borrow_and_update() == Visibility::Hidden;
            if hidden && !demoted {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(idle_after) => {
                        let update = PresenceUpdate {
                            status: Some(PresenceStatus::Away),
                            ..Default::default()
                        };
                        match advertise(&mux, &topic, &member_id, &shared, update).await {
                            Ok(()) => {
                                debug!(topic = %topic, "idle threshold passed; demoted to away");
                                demoted = true;
                            }
                            Err(e) => warn!(topic = %topic, "idle demotion failed: {e}"),
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if demoted && *visibility.borrow() == Visibility::Visible {
                            let update = PresenceUpdate {
                                status: Some(PresenceStatus::Online),
                                ..Default::default()
                            };
                            match advertise(&mux, &topic, &member_id, &shared, update).await {
                                Ok(()) => {
                                    debug!(topic = %topic, "visible again; promoted to online");
                                    demoted = false;
                                }
                                Err(e) => warn!(topic = %topic, "idle promotion failed: {e}"),
                            }
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowDriver;
    use serde_json::json;
    use topic_mux::{MemoryTransport, MuxConfig, TopicChannel};

    const WORKSPACE: &str = "ws1";

    async fn new_mux() -> (TopicMultiplexer<MemoryTransport>, MemoryTransport) {
        let transport = MemoryTransport::new();
        let mux = TopicMultiplexer::connect(transport.clone(), MuxConfig::default())
            .await
            .unwrap();
        (mux, transport)
    }

    /// Run queued tasks until `condition` holds (bounded, to fail fast).
    async fn settle_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    fn remote_payload(member_id: &str, status: &str, last_seen: &str) -> Value {
        json!({
            "member_id": member_id,
            "status": status,
            "last_seen": last_seen,
        })
    }

    #[tokio::test]
    async fn track_commits_my_presence_after_ack() {
        let (mux, _transport) = new_mux().await;
        let (_driver, signals) = WindowDriver::new();

        let agg = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            PresenceConfig::default(),
        )
        .await
        .unwrap();

        let my = agg.my_presence().expect("my presence committed");
        assert_eq!(my.status, PresenceStatus::Online);
        assert_eq!(my.member_id, "alice");

        // Our own join echoes back into the member map.
        settle_until(|| agg.presence_by_member("alice").is_some()).await;
    }

    #[tokio::test]
    async fn failed_track_leaves_no_partial_state() {
        let (mux, transport) = new_mux().await;
        let (_driver, signals) = WindowDriver::new();
        transport.fail_presence_tracks(true);

        let err = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            PresenceConfig::default(),
        )
        .await
        .expect_err("track should fail");
        assert!(matches!(err, RealtimeError::Mux(_)));

        // The registration was rolled back.
        assert_eq!(mux.subscriber_count(&presence_topic(WORKSPACE)).await, Some(0));
    }

    #[tokio::test]
    async fn sync_snapshot_picks_freshest_record_per_member() {
        let (mux, transport) = new_mux().await;
        let (_driver, signals) = WindowDriver::new();
        let topic = presence_topic(WORKSPACE);

        // Two connections advertise bob; the later one is fresher.
        let old = transport.open_channel(&topic).await.unwrap();
        let new = transport.open_channel(&topic).await.unwrap();
        old.track_presence("bob", remote_payload("bob", "away", "2026-08-01T10:00:00Z"))
            .await
            .unwrap();
        new.track_presence("bob", remote_payload("bob", "online", "2026-08-01T10:05:00Z"))
            .await
            .unwrap();

        let agg = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            PresenceConfig::default(),
        )
        .await
        .unwrap();

        settle_until(|| agg.presence_by_member("bob").is_some()).await;
        let bob = agg.presence_by_member("bob").unwrap();
        assert_eq!(bob.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn leave_demotes_to_offline_and_keeps_location() {
        let (mux, transport) = new_mux().await;
        let (_driver, signals) = WindowDriver::new();
        let topic = presence_topic(WORKSPACE);

        let agg = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            PresenceConfig::default(),
        )
        .await
        .unwrap();

        let remote = transport.open_channel(&topic).await.unwrap();
        remote
            .track_presence(
                "bob",
                json!({
                    "member_id": "bob",
                    "status": "online",
                    "last_seen": "2026-08-01T10:00:00Z",
                    "channel_id": "c7",
                }),
            )
            .await
            .unwrap();
        settle_until(|| agg.presence_by_member("bob").is_some()).await;

        remote.close().await;
        settle_until(|| {
            agg.presence_by_member("bob")
                .is_some_and(|r| r.status == PresenceStatus::Offline)
        })
        .await;

        let bob = agg.presence_by_member("bob").unwrap();
        assert_eq!(bob.status, PresenceStatus::Offline);
        assert_eq!(bob.channel_id.as_deref(), Some("c7"));
    }

    #[tokio::test]
    async fn update_presence_merges_partial_fields() {
        let (mux, _transport) = new_mux().await;
        let (_driver, signals) = WindowDriver::new();

        let agg = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            PresenceConfig::default(),
        )
        .await
        .unwrap();

        agg.update_presence(PresenceUpdate {
            channel_id: Some("c1".into()),
            conversation_id: None,
            status: None,
        })
        .await
        .unwrap();
        agg.update_presence(PresenceUpdate {
            status: Some(PresenceStatus::Away),
            ..Default::default()
        })
        .await
        .unwrap();

        let my = agg.my_presence().unwrap();
        assert_eq!(my.status, PresenceStatus::Away);
        // Location survived the status-only update.
        assert_eq!(my.channel_id.as_deref(), Some("c1"));

        agg.clear_location().await.unwrap();
        assert!(agg.my_presence().unwrap().channel_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_page_demotes_to_away_then_promotes_on_visible() {
        let (mux, _transport) = new_mux().await;
        let (driver, signals) = WindowDriver::new();
        let config = PresenceConfig::default();
        let idle_after = config.idle_after;

        let agg = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            config,
        )
        .await
        .unwrap();

        driver.set_visibility(Visibility::Hidden);
        tokio::time::sleep(idle_after + std::time::Duration::from_secs(1)).await;
        settle_until(|| {
            agg.my_presence()
                .is_some_and(|r| r.status == PresenceStatus::Away)
        })
        .await;

        driver.set_visibility(Visibility::Visible);
        settle_until(|| {
            agg.my_presence()
                .is_some_and(|r| r.status == PresenceStatus::Online)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn brief_hide_does_not_demote() {
        let (mux, _transport) = new_mux().await;
        let (driver, signals) = WindowDriver::new();

        let agg = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            PresenceConfig::default(),
        )
        .await
        .unwrap();

        driver.set_visibility(Visibility::Hidden);
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        driver.set_visibility(Visibility::Visible);
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;

        assert_eq!(agg.my_presence().unwrap().status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn untrack_announces_departure_and_keeps_other_members() {
        let (mux, transport) = new_mux().await;
        let (_driver, signals) = WindowDriver::new();
        let topic = presence_topic(WORKSPACE);

        let agg = PresenceAggregator::track(
            &mux,
            WORKSPACE,
            "alice",
            PresenceStatus::Online,
            signals,
            PresenceConfig::default(),
        )
        .await
        .unwrap();

        let remote = transport.open_channel(&topic).await.unwrap();
        remote
            .track_presence("bob", remote_payload("bob", "online", "2026-08-01T10:00:00Z"))
            .await
            .unwrap();
        settle_until(|| agg.presence_by_member("bob").is_some()).await;

        // A second observer sees alice's departure.
        let mut remote_rx = remote.subscribe_events();
        agg.untrack().await;

        let mut saw_leave = false;
        for _ in 0..50 {
            match remote_rx.try_recv() {
                Ok(topic_mux::ChannelEvent::Presence(PresenceEvent::Leave { entries }))
                    if entries.iter().any(|e| e.key == "alice") =>
                {
                    saw_leave = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => tokio::task::yield_now().await,
            }
        }
        assert!(saw_leave, "departure was not announced");

        assert!(agg.my_presence().is_none());
        // Other members' cached presence survives our teardown.
        assert!(agg.presence_by_member("bob").is_some());
    }
}
