//! Client-side notification cache.
//!
//! Holds, per workspace, the cached notification list, the dedicated
//! unread list, and the unread counter: the three query results the read
//! coordinator mutates optimistically. All mutation goes through the
//! methods here; snapshots capture the exact state of one workspace so a
//! failed network call can restore it wholesale.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::models::Notification;

/// Change feed for UI observers and refetch triggers.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// Cached data changed (optimistic mutation, hydration, or restore).
    Updated { workspace_id: String },
    /// Cached data should be refetched from the server; the data itself is
    /// retained until the refetch lands.
    Invalidated { workspace_id: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
struct WorkspaceCache {
    notifications: Option<Vec<Notification>>,
    unread: Option<Vec<Notification>>,
    unread_count: Option<u64>,
    stale: bool,
}

/// Exact state of one workspace's caches at capture time.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    workspace_id: String,
    state: WorkspaceCache,
}

pub struct NotificationCache {
    workspaces: RwLock<HashMap<String, WorkspaceCache>>,
    events_tx: broadcast::Sender<CacheEvent>,
}

impl Default for NotificationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationCache {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            workspaces: RwLock::new(HashMap::new()),
            events_tx,
        }
    }

    /// Hydrate the full notification list for a workspace.
    pub fn set_notifications(&self, workspace_id: &str, notifications: Vec<Notification>) {
        let mut workspaces = self.workspaces.write().unwrap();
        let ws = workspaces.entry(workspace_id.to_string()).or_default();
        ws.notifications = Some(notifications);
        ws.stale = false;
        drop(workspaces);
        self.emit_updated(workspace_id);
    }

    /// Hydrate the dedicated unread list for a workspace.
    pub fn set_unread(&self, workspace_id: &str, unread: Vec<Notification>) {
        let mut workspaces = self.workspaces.write().unwrap();
        let ws = workspaces.entry(workspace_id.to_string()).or_default();
        ws.unread = Some(unread);
        ws.stale = false;
        drop(workspaces);
        self.emit_updated(workspace_id);
    }

    /// Hydrate the unread counter for a workspace.
    pub fn set_unread_count(&self, workspace_id: &str, count: u64) {
        let mut workspaces = self.workspaces.write().unwrap();
        let ws = workspaces.entry(workspace_id.to_string()).or_default();
        ws.unread_count = Some(count);
        ws.stale = false;
        drop(workspaces);
        self.emit_updated(workspace_id);
    }

    pub fn notifications(&self, workspace_id: &str) -> Option<Vec<Notification>> {
        self.workspaces
            .read()
            .unwrap()
            .get(workspace_id)
            .and_then(|ws| ws.notifications.clone())
    }

    pub fn unread(&self, workspace_id: &str) -> Option<Vec<Notification>> {
        self.workspaces
            .read()
            .unwrap()
            .get(workspace_id)
            .and_then(|ws| ws.unread.clone())
    }

    pub fn unread_count(&self, workspace_id: &str) -> Option<u64> {
        self.workspaces
            .read()
            .unwrap()
            .get(workspace_id)
            .and_then(|ws| ws.unread_count)
    }

    /// Whether the workspace's cached data is awaiting a refetch.
    pub fn is_stale(&self, workspace_id: &str) -> bool {
        self.workspaces
            .read()
            .unwrap()
            .get(workspace_id)
            .is_some_and(|ws| ws.stale)
    }

    /// Capture the exact state of one workspace's caches.
    pub fn snapshot(&self, workspace_id: &str) -> CacheSnapshot {
        CacheSnapshot {
            workspace_id: workspace_id.to_string(),
            state: self
                .workspaces
                .read()
                .unwrap()
                .get(workspace_id)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Restore a workspace to a previously captured snapshot.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        let workspace_id = snapshot.workspace_id.clone();
        self.workspaces
            .write()
            .unwrap()
            .insert(snapshot.workspace_id, snapshot.state);
        self.emit_updated(&workspace_id);
    }

    /// Mark the workspace's cached data as needing a refetch. The data is
    /// retained so views keep rendering until fresh results land.
    pub fn invalidate(&self, workspace_id: &str) {
        let mut workspaces = self.workspaces.write().unwrap();
        let ws = workspaces.entry(workspace_id.to_string()).or_default();
        ws.stale = true;
        drop(workspaces);
        let _ = self.events_tx.send(CacheEvent::Invalidated {
            workspace_id: workspace_id.to_string(),
        });
    }

    /// Flip `is_read`/`read_at` on the given ids in both list caches and
    /// decrement the unread counter by the matched count.
    pub fn mark_read(&self, workspace_id: &str, ids: &[String], read_at: DateTime<Utc>) {
        let mut workspaces = self.workspaces.write().unwrap();
        let ws = workspaces.entry(workspace_id.to_string()).or_default();
        for list in [&mut ws.notifications, &mut ws.unread] {
            if let Some(list) = list {
                for n in list.iter_mut() {
                    if !n.is_read && ids.contains(&n.id) {
                        n.is_read = true;
                        n.read_at = Some(read_at);
                    }
                }
            }
        }
        ws.unread_count = ws
            .unread_count
            .map(|count| count.saturating_sub(ids.len() as u64));
        drop(workspaces);
        self.emit_updated(workspace_id);
    }

    /// Flip every unread notification and zero the counter. Returns how
    /// many cached items were flipped.
    pub fn mark_all_read(&self, workspace_id: &str, read_at: DateTime<Utc>) -> usize {
        let mut workspaces = self.workspaces.write().unwrap();
        let ws = workspaces.entry(workspace_id.to_string()).or_default();
        let mut flipped = 0;
        for list in [&mut ws.notifications, &mut ws.unread] {
            if let Some(list) = list {
                for n in list.iter_mut() {
                    if !n.is_read {
                        n.is_read = true;
                        n.read_at = Some(read_at);
                        flipped += 1;
                    }
                }
            }
        }
        ws.unread_count = ws.unread_count.map(|_| 0);
        drop(workspaces);
        self.emit_updated(workspace_id);
        flipped
    }

    /// Change feed for UI observers.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }

    fn emit_updated(&self, workspace_id: &str) {
        let _ = self.events_tx.send(CacheEvent::Updated {
            workspace_id: workspace_id.to_string(),
        });
    }
}
