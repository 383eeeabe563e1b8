//! Transport adapter: one framed duplex connection to the channel server.
//!
//! A [`Connector`] opens [`Link`]s. The socket hands each open link to an I/O
//! task ([`TransportHandle`]) that pumps outbound frames into the link and
//! posts inbound frames, tagged with the connection epoch, back to the socket.
//! Exactly one close notification is posted per link. No retry logic lives
//! here; reconnecting is the socket's job.

use crate::codec::WireFormat;
use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Close code reported for a normal, locally initiated close
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the peer vanished without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// One message-framed unit on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
}

/// Something that happened on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A frame arrived
    Frame(Frame),
    /// The link is gone; no further events follow
    Closed {
        /// WebSocket close code (1006 when the connection dropped)
        code: u16,
        /// Close reason, possibly empty
        reason: String,
    },
}

/// An open, message-framed duplex connection.
#[async_trait]
pub trait Link: Send {
    /// Write one frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Wait for the next frame or for the link to close.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a frame.
    async fn recv(&mut self) -> LinkEvent;

    /// Start a graceful close.
    async fn close(&mut self) -> Result<()>;
}

/// Opens links to an [`Endpoint`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link, failing with [`ChannelError::Connect`] on network or
    /// handshake errors.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>>;
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
    params: BTreeMap<String, String>,
    format: WireFormat,
}

impl Endpoint {
    /// Create an endpoint for a socket URL such as `ws://host/socket`
    pub fn new(base: impl Into<String>, params: BTreeMap<String, String>, format: WireFormat) -> Self {
        Self {
            base: base.into(),
            params,
            format,
        }
    }

    /// Socket URL as configured
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Connect parameters
    pub const fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// The full connect URL: `<base>/websocket?<params>&vsn=<vsn>`.
    ///
    /// Parameters are sorted by key and percent-encoded. A base that already
    /// ends in `/websocket` is used as is.
    pub fn url(&self) -> String {
        let (path, existing_query) = match self.base.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.base.as_str(), None),
        };
        let path = path.trim_end_matches('/');

        let mut url = if path.ends_with("/websocket") {
            path.to_owned()
        } else {
            format!("{path}/websocket")
        };

        let mut query: Vec<String> = existing_query
            .filter(|q| !q.is_empty())
            .map(|q| vec![q.to_owned()])
            .unwrap_or_default();
        query.extend(
            self.params
                .iter()
                .filter(|(key, _)| key.as_str() != "vsn")
                .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value))),
        );
        query.push(format!("vsn={}", self.format.vsn()));

        url.push('?');
        url.push_str(&query.join("&"));
        url
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn encode_component(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0f)]));
        }
    }
    out
}

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport, and none being opened
    #[default]
    Closed,
    /// A connect attempt is in progress
    Connecting,
    /// The transport is open
    Open,
    /// A caller-initiated close is flushing
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Posted by the I/O task to the socket
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Frame {
        epoch: u64,
        frame: Frame,
    },
    Closed {
        epoch: u64,
        code: u16,
        reason: String,
    },
}

enum Outbound {
    Frame(Frame),
    Close,
}

/// Owner side of one open link and its I/O task.
pub(crate) struct TransportHandle {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Move `link` into a new I/O task posting to `events`.
    pub(crate) fn spawn<E>(epoch: u64, link: Box<dyn Link>, events: &mpsc::UnboundedSender<E>) -> Self
    where
        E: From<TransportEvent> + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(epoch, link, outbound_rx, events.clone()));
        Self {
            epoch,
            outbound,
            task,
        }
    }

    pub(crate) const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queue a frame. Fails once the I/O task has stopped.
    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ChannelError::send("transport is no longer open"))
    }

    /// Close after the frames already queued; returns the I/O task so the
    /// caller can wait for the flush.
    pub(crate) fn close(self) -> JoinHandle<()> {
        let _ = self.outbound.send(Outbound::Close);
        self.task
    }
}

async fn run_link<E>(
    epoch: u64,
    mut link: Box<dyn Link>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<TransportEvent> + Send + 'static,
{
    debug!(epoch, "Transport I/O task started");

    let (code, reason) = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = link.send(frame).await {
                        debug!(epoch, error = %e, "Transport write failed");
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = link.close().await {
                        debug!(epoch, error = %e, "Transport close failed");
                    }
                    break (CLOSE_NORMAL, "closed by client".to_owned());
                }
            },
            event = link.recv() => match event {
                LinkEvent::Frame(frame) => {
                    trace!(epoch, "Frame received");
                    if events.send(TransportEvent::Frame { epoch, frame }.into()).is_err() {
                        let _ = link.close().await;
                        break (CLOSE_NORMAL, "socket dropped".to_owned());
                    }
                }
                LinkEvent::Closed { code, reason } => break (code, reason),
            },
        }
    };

    debug!(epoch, code, reason = %reason, "Transport I/O task finished");
    let _ = events.send(TransportEvent::Closed { epoch, code, reason }.into());
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_appends_websocket_and_vsn() {
        let endpoint = Endpoint::new("ws://localhost:4000/socket", BTreeMap::new(), WireFormat::V2);
        assert_eq!(endpoint.url(), "ws://localhost:4000/socket/websocket?vsn=2.0.0");
    }

    #[test]
    fn test_endpoint_url_encodes_sorted_params() {
        let params = BTreeMap::from([
            ("token".to_owned(), "a b&c".to_owned()),
            ("client".to_owned(), "cli".to_owned()),
        ]);
        let endpoint = Endpoint::new("wss://example.com/socket/", params, WireFormat::V1);
        assert_eq!(
            endpoint.url(),
            "wss://example.com/socket/websocket?client=cli&token=a%20b%26c&vsn=1.0.0"
        );
    }

    #[test]
    fn test_endpoint_url_keeps_existing_suffix_and_query() {
        let params = BTreeMap::from([("vsn".to_owned(), "9".to_owned())]);
        let endpoint = Endpoint::new("ws://h/socket/websocket?x=1", params, WireFormat::V2);
        assert_eq!(endpoint.url(), "ws://h/socket/websocket?x=1&vsn=2.0.0");
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
    }

    struct ScriptedLink {
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
        sent: mpsc::UnboundedSender<Frame>,
    }

    #[async_trait]
    impl Link for ScriptedLink {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            self.sent
                .send(frame)
                .map_err(|_| ChannelError::send("peer gone"))
        }

        async fn recv(&mut self) -> LinkEvent {
            self.inbound.recv().await.unwrap_or(LinkEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "eof".to_owned(),
            })
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn scripted() -> (
        Box<dyn Link>,
        mpsc::UnboundedSender<LinkEvent>,
        mpsc::UnboundedReceiver<Frame>,
    ) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (sent, sent_rx) = mpsc::unbounded_channel();
        (Box::new(ScriptedLink { inbound, sent }), inbound_tx, sent_rx)
    }

    #[tokio::test]
    async fn test_io_task_pumps_frames_both_ways() {
        let (link, peer, mut sent) = scripted();
        let (events_tx, mut events) = mpsc::unbounded_channel::<TransportEvent>();
        let handle = TransportHandle::spawn(3, link, &events_tx);
        assert_eq!(handle.epoch(), 3);

        handle.send(Frame::Text("out".to_owned())).expect("queued");
        assert_eq!(sent.recv().await, Some(Frame::Text("out".to_owned())));

        peer.send(LinkEvent::Frame(Frame::Text("in".to_owned())))
            .expect("peer send");
        match events.recv().await {
            Some(TransportEvent::Frame { epoch, frame }) => {
                assert_eq!(epoch, 3);
                assert_eq!(frame, Frame::Text("in".to_owned()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_io_task_posts_exactly_one_close() {
        let (link, peer, _sent) = scripted();
        let (events_tx, mut events) = mpsc::unbounded_channel::<TransportEvent>();
        let handle = TransportHandle::spawn(1, link, &events_tx);

        peer.send(LinkEvent::Closed {
            code: 4000,
            reason: "bye".to_owned(),
        })
        .expect("peer send");

        match events.recv().await {
            Some(TransportEvent::Closed { code, reason, .. }) => {
                assert_eq!(code, 4000);
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle.close().await.expect("task joins");
        drop(events_tx);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_fails_after_link_stops() {
        let (link, peer, _sent) = scripted();
        let (events_tx, mut events) = mpsc::unbounded_channel::<TransportEvent>();
        let handle = TransportHandle::spawn(1, link, &events_tx);

        drop(peer);
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Closed { code: CLOSE_ABNORMAL, .. })
        ));
        let result = handle.send(Frame::Text("late".to_owned()));
        assert!(matches!(result, Err(ChannelError::Send(_))));
    }

    #[tokio::test]
    async fn test_close_reports_normal_code() {
        let (link, _peer, _sent) = scripted();
        let (events_tx, mut events) = mpsc::unbounded_channel::<TransportEvent>();
        let handle = TransportHandle::spawn(2, link, &events_tx);

        handle.close().await.expect("task joins");
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Closed { epoch: 2, code: CLOSE_NORMAL, .. })
        ));
    }
}
