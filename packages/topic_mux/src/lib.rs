//! Topic Mux - Pure topic-channel multiplexing library
//!
//! This crate shares per-topic logical channels on one physical realtime
//! connection across many independent subscribers. It has no domain
//! knowledge (no notion of chat messages, presence records, or
//! notifications); payloads are opaque JSON.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use topic_mux::{EventHandler, MemoryTransport, MuxConfig, TopicMultiplexer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MemoryTransport::new();
//!     let mux = TopicMultiplexer::connect(transport, MuxConfig::default())
//!         .await
//!         .unwrap();
//!
//!     let handler: EventHandler = Arc::new(|payload| {
//!         println!("message: {payload}");
//!         Ok(())
//!     });
//!     let sub = mux.subscribe("room:42", "message", handler).await.unwrap();
//!
//!     // ... later, when the view unmounts:
//!     mux.unsubscribe(sub).await;
//! }
//! ```

mod error;
mod memory;
mod mux;
pub mod transport;

pub use error::{MuxError, TransportError};
pub use memory::{MemoryChannel, MemoryTransport};
pub use mux::{EventHandler, MuxConfig, PresenceHandler, Subscription, TopicMultiplexer};
pub use transport::{
    ChannelEvent, ChannelStatus, ConnectionStatus, PresenceEntry, PresenceEvent, TopicChannel,
    Transport,
};
