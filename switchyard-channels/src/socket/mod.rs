//! Connection multiplexer.
//!
//! A [`Socket`] shares one transport connection between many [`Channel`]s.
//! It reconnects with backoff when the connection drops, keeps it alive with
//! heartbeats, routes inbound envelopes by topic, and rejoins every channel
//! the caller still wants after a reconnect.
//!
//! # Architecture
//!
//! ```text
//!  Socket / Channel handles
//!          │ Command
//!          ▼
//!  ┌───────────────────────────────┐   Event    ┌──────────────┐
//!  │          SocketActor          │◀───────────│  I/O task    │◀── Link
//!  │  channels  tracker  timers    │──frames───▶│ (per epoch)  │──▶
//!  └───────────────────────────────┘            └──────────────┘
//!          │ ChannelMessage
//!          ▼
//!  per-channel dispatcher ──▶ handlers
//! ```
//!
//! # Module Organization
//!
//! - `actor`: the event loop owning all mutable state
//! - `statistics`: atomic counters and their snapshot
//! - `test_helpers`: in-memory connector and scripted server

mod actor;
mod statistics;
#[cfg(test)]
mod test_helpers;

pub(crate) use actor::Command;
pub use statistics::StatisticsSnapshot;

use crate::channel::Channel;
use crate::config::SocketConfig;
use crate::error::{ChannelError, Result};
use crate::transport::{ConnectionState, Connector};
use crate::websocket::WebSocketConnector;
use actor::SocketActor;
use serde_json::Value;
use statistics::SocketStatistics;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, info_span};

/// Handle to a multiplexed connection.
///
/// Cheap to clone. The socket's background task stops, disconnecting first,
/// once every `Socket` and [`Channel`] handle is dropped.
#[derive(Clone)]
pub struct Socket {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<SocketStatistics>,
}

impl Socket {
    /// Create a socket that connects over WebSocket.
    ///
    /// Must be called within a Tokio runtime. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(config: SocketConfig) -> Result<Self> {
        Self::with_connector(config, WebSocketConnector::new())
    }

    /// Create a socket that opens links through `connector`.
    pub fn with_connector<C: Connector>(config: SocketConfig, connector: C) -> Result<Self> {
        config.validate()?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Closed);
        let stats = Arc::new(SocketStatistics::default());

        let span = info_span!("socket", url = %config.url);
        let actor = SocketActor::new(
            config,
            Arc::new(connector),
            commands_rx,
            state_tx,
            Arc::clone(&stats),
        );
        tokio::spawn(actor.run().instrument(span));

        Ok(Self {
            commands,
            state,
            stats,
        })
    }

    /// Open the connection.
    ///
    /// Returns once the transport is open. A failed attempt is reported as
    /// [`ChannelError::Connect`] and retried in the background with backoff
    /// until [`disconnect`](Self::disconnect). Calling this while connecting
    /// or connected waits for, or returns, the current connection.
    pub async fn connect(&self) -> Result<()> {
        let (respond, receiver) = oneshot::channel();
        self.send(Command::Connect { respond })?;
        receiver.await.map_err(|_| ChannelError::Shutdown)?
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Every pending request fails with [`ChannelError::Cancelled`] and every
    /// channel becomes closed without sending a leave.
    pub async fn disconnect(&self) -> Result<()> {
        let (respond, receiver) = oneshot::channel();
        self.send(Command::Disconnect { respond })?;
        receiver.await.map_err(|_| ChannelError::Shutdown)
    }

    /// The channel for `topic`, created on first use.
    ///
    /// Repeated calls return the same channel (and ignore `params`) until it
    /// is closed by a leave or by the server.
    pub async fn channel(&self, topic: impl Into<String>, params: Value) -> Result<Channel> {
        let (respond, receiver) = oneshot::channel();
        self.send(Command::Channel {
            topic: topic.into(),
            params,
            respond,
        })?;
        let shared = receiver.await.map_err(|_| ChannelError::Shutdown)?;
        Ok(Channel::new(shared, self.commands.clone()))
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the transport is open
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Subscribe to connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Number of requests awaiting a reply
    pub async fn pending_requests(&self) -> Result<usize> {
        let (respond, receiver) = oneshot::channel();
        self.send(Command::PendingRequests { respond })?;
        receiver.await.map_err(|_| ChannelError::Shutdown)
    }

    /// Snapshot of the socket counters
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ChannelError::Shutdown)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}
