//! The transport seam: traits and event types for the shared duplex connection.
//!
//! A [`Transport`] owns one physical connection to the realtime server and
//! hands out logical [`TopicChannel`]s. Each channel delivers its inbound
//! traffic over a `broadcast::Receiver<ChannelEvent>`; the multiplexer runs
//! one reader task per channel and demultiplexes from there. Reconnects,
//! backoff, and the wire protocol are the transport's responsibility; the
//! multiplexer only reacts to the status events a transport emits.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::error::TransportError;

/// Status of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
    Errored,
}

/// Status of a logical topic channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    Error,
    Closed,
}

/// One presence key with the payloads currently advertised under it.
///
/// A key can report several payloads when the same member is tracked from
/// multiple connections; consumers pick the freshest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub key: String,
    pub payloads: Vec<Value>,
}

/// Presence traffic on a topic channel.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Full snapshot of everything tracked on the topic.
    Sync { state: Vec<PresenceEntry> },
    /// Keys that started (or re-announced) tracking.
    Join { entries: Vec<PresenceEntry> },
    /// Keys whose last tracking connection went away.
    Leave { entries: Vec<PresenceEntry> },
}

/// Inbound event on a topic channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Broadcast message, demultiplexed by event name downstream.
    Broadcast { event: String, payload: Value },
    Presence(PresenceEvent),
    Status(ChannelStatus),
}

/// A logical channel bound to one topic on the shared connection.
pub trait TopicChannel: Send + Sync + 'static {
    /// Subscribe to this channel's inbound event stream.
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Broadcast a named event to every subscriber of the topic.
    fn broadcast(
        &self,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Advertise a presence payload under `key`. Re-tracking the same key
    /// replaces the previous payload.
    fn track_presence(
        &self,
        key: &str,
        payload: Value,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Withdraw every presence payload this channel has tracked.
    fn untrack_presence(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Leave the topic and release the channel on the transport.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// The shared physical connection.
pub trait Transport: Send + Sync + 'static {
    type Channel: TopicChannel;

    /// Establish the physical connection. Idempotent.
    fn connect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Open a logical channel for `topic`.
    fn open_channel(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;

    /// Watch the physical connection status. A fresh receiver observes the
    /// current value immediately.
    fn connection_status(&self) -> watch::Receiver<ConnectionStatus>;
}
