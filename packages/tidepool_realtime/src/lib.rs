//! Client-side realtime coordination core for tidepool workspaces.
//!
//! Keeps many independently-mounted views subscribed to server-pushed
//! topics over a small number of long-lived connections:
//!
//! - `presence` — per-workspace presence aggregation with idle demotion
//! - `typing` — coalesced ephemeral typing signals
//! - `read_state` — focus-aware unread reconciliation with optimistic
//!   cache mutation and snapshot rollback
//! - `notifications` — the shared notification cache those mutations target
//! - `outbox` — optimistic outbound-message placeholders
//! - `window` — injected focus/visibility capability
//! - `config` — figment-layered tunables
//!
//! Topic channel sharing itself lives in the `topic_mux` crate; everything
//! here goes through one [`topic_mux::TopicMultiplexer`], constructed by
//! the application's startup sequence and passed down explicitly.

pub mod config;
pub mod error;
pub mod models;
pub mod notifications;
pub mod outbox;
pub mod presence;
pub mod read_state;
pub mod typing;
pub mod window;


pub use config::{RealtimeConfig, RealtimeFileConfig, load_config};
pub use error::RealtimeError;
pub use models::{EntityRef, Notification};
pub use notifications::{CacheEvent, CacheSnapshot, NotificationCache};
pub use outbox::{OutboxEvent, PendingMessage, PendingOutbox};
pub use presence::{
    PresenceAggregator, PresenceChange, PresenceRecord, PresenceStatus, PresenceUpdate,
};
pub use read_state::{ActiveView, ReadCoordinator, ReadReceipts};
pub use typing::{TypingBroadcaster, TypingChange, TypingSignal};
pub use window::{Visibility, WindowDriver, WindowSignals};
