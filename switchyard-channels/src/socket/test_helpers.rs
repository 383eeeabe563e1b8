//! Test fixtures: an in-memory connector and a scripted server side.

#![allow(clippy::expect_used)]

use super::Socket;
use crate::channel::Channel;
use crate::codec::Codec;
use crate::config::{BackoffConfig, SocketConfig};
use crate::error::{ChannelError, Result};
use crate::message::{Envelope, HEARTBEAT_TOPIC, events};
use crate::transport::{CLOSE_ABNORMAL, Connector, Endpoint, Frame, Link, LinkEvent};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Timings short enough for paused-clock tests; heartbeats effectively off.
pub(super) fn test_config() -> SocketConfig {
    let mut config = SocketConfig::new("ws://switchyard.test/socket");
    config.heartbeat_interval_ms = 3_600_000;
    config.join_timeout_ms = 1_000;
    config.push_timeout_ms = 1_000;
    config.connect_timeout_ms = 1_000;
    config.reconnect_backoff = BackoffConfig {
        base_ms: 100,
        max_ms: 1_000,
        jitter_ratio: 0.0,
    };
    config
}

/// Connector whose links end up at a [`FakeServer`].
pub(super) struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerConn>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

/// Server side of a [`MemoryConnector`].
pub(super) struct FakeServer {
    incoming: mpsc::UnboundedReceiver<ServerConn>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

pub(super) fn memory_pair() -> (MemoryConnector, FakeServer) {
    let (accepted, incoming) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        MemoryConnector {
            accepted,
            refuse: Arc::clone(&refuse),
            attempts: Arc::clone(&attempts),
        },
        FakeServer {
            incoming,
            refuse,
            attempts,
        },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChannelError::connect("connection refused"));
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let conn = ServerConn {
            inbound: from_client,
            outbound: to_client,
            url: endpoint.url(),
            codec: Codec::default(),
        };
        self.accepted
            .send(conn)
            .map_err(|_| ChannelError::connect("server is gone"))?;

        Ok(Box::new(MemoryLink {
            inbound: from_server,
            outbound: Some(to_server),
        }))
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.outbound
            .as_ref()
            .ok_or_else(|| ChannelError::send("link closed"))?
            .send(frame)
            .map_err(|_| ChannelError::send("server hung up"))
    }

    async fn recv(&mut self) -> LinkEvent {
        self.inbound.recv().await.unwrap_or(LinkEvent::Closed {
            code: CLOSE_ABNORMAL,
            reason: "server hung up".to_owned(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.outbound = None;
        Ok(())
    }
}

impl FakeServer {
    /// Wait for the next client connection.
    pub(super) async fn accept(&mut self) -> ServerConn {
        self.incoming.recv().await.expect("connector dropped")
    }

    pub(super) fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, refused ones included.
    pub(super) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// One accepted connection, driven by the test.
pub(super) struct ServerConn {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<LinkEvent>,
    url: String,
    codec: Codec,
}

impl ServerConn {
    pub(super) fn url(&self) -> &str {
        &self.url
    }

    /// Next envelope from the client, heartbeats included. `None` once the
    /// client closed the link.
    pub(super) async fn recv_any(&mut self) -> Option<Envelope> {
        let frame = self.inbound.recv().await?;
        Some(self.codec.decode(&frame).expect("client sent a valid frame"))
    }

    /// Next non-heartbeat envelope from the client.
    pub(super) async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.recv_any().await?;
            if envelope.topic != HEARTBEAT_TOPIC {
                return Some(envelope);
            }
        }
    }

    /// Next non-heartbeat envelope, which must carry `event`.
    pub(super) async fn expect_event(&mut self, event: &str) -> Envelope {
        let envelope = self.recv_envelope().await.expect("client closed the link");
        assert_eq!(envelope.event, event, "unexpected envelope: {envelope:?}");
        envelope
    }

    pub(super) fn send(&self, envelope: &Envelope) {
        let _ = self
            .outbound
            .send(LinkEvent::Frame(self.codec.encode(envelope)));
    }

    pub(super) fn send_raw(&self, text: &str) {
        let _ = self
            .outbound
            .send(LinkEvent::Frame(Frame::Text(text.to_owned())));
    }

    pub(super) fn reply_ok(&self, request: &Envelope, response: Value) {
        self.send(&Envelope::reply(request, "ok", response));
    }

    pub(super) fn reply_error(&self, request: &Envelope, response: Value) {
        self.send(&Envelope::reply(request, "error", response));
    }

    /// Drop the connection from the server side.
    pub(super) fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(LinkEvent::Closed {
            code,
            reason: reason.to_owned(),
        });
    }
}

/// A socket over a [`MemoryConnector`], connected, with the server side of
/// its connection.
pub(super) async fn connected_socket(config: SocketConfig) -> (Socket, FakeServer, ServerConn) {
    let (connector, mut server) = memory_pair();
    let socket = Socket::with_connector(config, connector).expect("valid config");
    socket.connect().await.expect("connect");
    let conn = server.accept().await;
    (socket, server, conn)
}

/// Create and join `topic`, answering the join with `ok`.
pub(super) async fn joined_channel(socket: &Socket, conn: &mut ServerConn, topic: &str) -> Channel {
    let channel = socket.channel(topic, json!({})).await.expect("channel");
    let join = channel.join();
    let request = conn.expect_event(events::JOIN).await;
    conn.reply_ok(&request, json!({}));
    join.await.expect("join accepted");
    channel
}
