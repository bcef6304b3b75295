//! Focus-aware read-state coordination.
//!
//! Watches browser focus and the currently viewed entity, decides which
//! notifications deserve a toast versus being marked read on arrival, and
//! reconciles unread state with the server: optimistic cache mutation
//! first, then the network call, with an exact-snapshot rollback if it
//! fails.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RealtimeError;
use crate::models::{EntityRef, Notification};
use crate::notifications::NotificationCache;
use crate::window::{Visibility, WindowSignals};

/// The mark-read network collaborator.
pub trait ReadReceipts: Send + Sync + 'static {
    fn mark_read(
        &self,
        workspace_id: &str,
        ids: &[String],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn mark_all_read(&self, workspace_id: &str)
    -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// What the user is currently looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveView {
    pub workspace_id: String,
    pub entity: EntityRef,
}

/// Coordinates unread state against focus, the active view, and the
/// notification cache.
pub struct ReadCoordinator<R: ReadReceipts> {
    receipts: Arc<R>,
    cache: Arc<NotificationCache>,
    signals: WindowSignals,
    view: RwLock<Option<ActiveView>>,
    watcher_cancel: CancellationToken,
}

impl<R: ReadReceipts> ReadCoordinator<R> {
    /// Build the coordinator and start its focus watcher. The watcher marks
    /// the active entity's notifications read whenever focus is regained;
    /// it stops when [`shutdown`](Self::shutdown) is called or the
    /// coordinator is dropped.
    pub fn new(
        receipts: Arc<R>,
        cache: Arc<NotificationCache>,
        signals: WindowSignals,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            receipts,
            cache,
            signals,
            view: RwLock::new(None),
            watcher_cancel: CancellationToken::new(),
        });
        spawn_focus_watcher(&coordinator);
        coordinator
    }

    /// Record what the user is looking at (`None` when no entity view is
    /// mounted).
    pub fn set_active_view(&self, view: Option<ActiveView>) {
        *self.view.write().unwrap() = view;
    }

    pub fn active_view(&self) -> Option<ActiveView> {
        self.view.read().unwrap().clone()
    }

    /// A toast is suppressed only when the window is focused and the
    /// notification targets the entity currently in view.
    pub fn should_show_toast(&self, notification: &Notification) -> bool {
        if !self.signals.focused() {
            return true;
        }
        let view = self.view.read().unwrap();
        match (view.as_ref(), notification.entity()) {
            (Some(view), Some(entity)) => view.entity != entity,
            _ => true,
        }
    }

    /// A notification for the entity in view, arriving while focused, is
    /// never created as unread in the first place.
    pub fn should_mark_read_on_arrival(&self, notification: &Notification) -> bool {
        !self.should_show_toast(notification)
    }

    /// Browser-level notifications are for when the page itself cannot be
    /// seen; in-app toasts cover the visible cases.
    pub fn should_show_browser_notification(&self) -> bool {
        self.signals.visibility() == Visibility::Hidden
    }

    /// Mark every cached unread notification for `entity` as read:
    /// optimistic flip of the list, unread-list, and counter caches, then
    /// the network call, then invalidation so the app refetches server
    /// truth. On failure all three caches are restored to their exact
    /// pre-call state and the error is returned.
    ///
    /// Idempotent under focus flapping: once flipped optimistically, a
    /// repeat call matches nothing and issues no network request.
    pub async fn mark_entity_notifications_read(
        &self,
        workspace_id: &str,
        entity: &EntityRef,
    ) -> Result<usize, RealtimeError> {
        let matched = self.unread_ids_for_entity(workspace_id, entity);
        if matched.is_empty() {
            return Ok(0);
        }

        let snapshot = self.cache.snapshot(workspace_id);
        self.cache.mark_read(workspace_id, &matched, Utc::now());

        match self.receipts.mark_read(workspace_id, &matched).await {
            Ok(()) => {
                self.cache.invalidate(workspace_id);
                debug!(
                    workspace = workspace_id,
                    count = matched.len(),
                    "marked entity notifications read"
                );
                Ok(matched.len())
            }
            Err(e) => {
                // No partial rollback: every touched cache returns to its
                // exact pre-call value.
                self.cache.restore(snapshot);
                Err(RealtimeError::MarkRead(e))
            }
        }
    }

    /// Mark everything in the workspace read, with the same
    /// optimistic/rollback shape. The network call is issued even when the
    /// local caches hold nothing unread, since the server may know more.
    pub async fn mark_all_read(&self, workspace_id: &str) -> Result<usize, RealtimeError> {
        let snapshot = self.cache.snapshot(workspace_id);
        let flipped = self.cache.mark_all_read(workspace_id, Utc::now());

        match self.receipts.mark_all_read(workspace_id).await {
            Ok(()) => {
                self.cache.invalidate(workspace_id);
                debug!(workspace = workspace_id, flipped, "marked all notifications read");
                Ok(flipped)
            }
            Err(e) => {
                self.cache.restore(snapshot);
                Err(RealtimeError::MarkRead(e))
            }
        }
    }

    /// Stop the focus watcher.
    pub fn shutdown(&self) {
        self.watcher_cancel.cancel();
    }

    /// Ids of cached unread notifications related to `entity`, deduplicated
    /// across the full list and the unread list.
    fn unread_ids_for_entity(&self, workspace_id: &str, entity: &EntityRef) -> Vec<String> {
        let list = self.cache.notifications(workspace_id).unwrap_or_default();
        let unread = self.cache.unread(workspace_id).unwrap_or_default();
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for n in list.iter().chain(unread.iter()) {
            if !n.is_read
                && n.entity().as_ref() == Some(entity)
                && seen.insert(n.id.clone())
            {
                ids.push(n.id.clone());
            }
        }
        ids
    }
}

/// Mark the active entity's notifications read on every unfocused → focused
/// transition.
fn spawn_focus_watcher<R: ReadReceipts>(coordinator: &Arc<ReadCoordinator<R>>) {
    let weak = Arc::downgrade(coordinator);
    let cancel = coordinator.watcher_cancel.clone();
    let mut focus = coordinator.signals.focus_watch();
    tokio::spawn(async move {
        let mut was_focused = *focus.borrow_and_update();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = focus.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let focused = *focus.borrow_and_update();
                    if focused && !was_focused {
                        let Some(coordinator) = weak.upgrade() else { break };
                        let view = coordinator.active_view();
                        if let Some(view) = view {
                            if let Err(e) = coordinator
                                .mark_entity_notifications_read(&view.workspace_id, &view.entity)
                                .await
                            {
                                warn!(
                                    workspace = %view.workspace_id,
                                    "mark-read on focus regain failed: {e}"
                                );
                            }
                        }
                    }
                    was_focused = focused;
                }
            }
        }
    });
}
