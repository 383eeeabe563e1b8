//! # Switchyard Channels
//!
//! A pub/sub channel-multiplexing client: one WebSocket connection shared by
//! many topic subscriptions, each with its own join/leave lifecycle, message
//! routing and failure recovery. Speaks the Phoenix Channels wire protocol
//! (JSON envelopes, `vsn=2.0.0` array form by default).
//!
//! ## Features
//!
//! - **Multiplexing**: any number of [`Channel`]s over one [`Socket`]
//! - **Automatic recovery**: reconnect with jittered, capped backoff and
//!   rejoin of every wanted channel with a fresh `join_ref`
//! - **Request/reply**: `join`, `leave` and `push` return futures that
//!   resolve with the matching reply, a timeout, or a connection failure
//! - **Liveness**: heartbeats detect half-open connections
//! - **Pluggable transport**: the [`Connector`]/[`Link`] traits; WebSocket
//!   via `tokio-tungstenite` out of the box
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use serde_json::json;
//! use switchyard_channels::{Socket, SocketConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SocketConfig::new("ws://localhost:4000/socket").with_param("token", "secret");
//!     let socket = Socket::new(config)?;
//!     socket.connect().await?;
//!
//!     let channel = socket.channel("agents:lobby", json!({})).await?;
//!     channel.on("new_msg", |message| {
//!         tracing::info!(payload = %message.payload, "New message");
//!     });
//!
//!     let response = channel.join().await?;
//!     tracing::info!(%response, "Joined successfully");
//!
//!     let reply = channel.push("new_msg", json!({"body": "hello"}), None).await?;
//!     tracing::info!(status = %reply.status, "Push acknowledged");
//!
//!     socket.disconnect().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod backoff;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod socket;
mod timer;
mod tracker;
pub mod transport;
pub mod websocket;

// Re-export main types for convenience
pub use backoff::Backoff;
pub use channel::{Channel, ChannelStatus, HandlerRef, ReplyFuture};
pub use codec::{Codec, WireFormat};
pub use config::{BackoffConfig, Config, ConfigError, ConfigLoader, LoggingConfig, SocketConfig};
pub use error::{ChannelError, Result};
pub use message::{ChannelMessage, Envelope, Reply, events};
pub use socket::{Socket, StatisticsSnapshot};
pub use transport::{ConnectionState, Connector, Endpoint, Frame, Link, LinkEvent};
pub use websocket::{WebSocketConnector, WsLink};
