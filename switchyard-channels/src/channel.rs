//! Channels: one topic subscription multiplexed over a socket.
//!
//! A [`Channel`] is a cheap handle. Its state machine lives in the socket
//! actor ([`ChannelCore`]); the handle only sends commands and observes the
//! published [`ChannelStatus`].
//!
//! ```text
//!            join()               reply ok
//!   Closed ──────────▶ Joining ──────────────▶ Joined
//!     ▲                  │  ▲                    │
//!     │   reply error /  │  │ rejoin timer       │ leave()
//!     │   timeout        ▼  │                    ▼
//!     │               Errored               Leaving ──▶ Closed (removed)
//!     │
//!     └── transport loss (from Joining/Joined; rejoined on reconnect)
//! ```

use crate::backoff::Backoff;
use crate::config::BackoffConfig;
use crate::error::{ChannelError, Result};
use crate::message::{ChannelMessage, Reply};
use crate::socket::Command;
use crate::timer::Timer;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, info_span, warn};

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    /// Not joined and not trying to be
    #[default]
    Closed,
    /// A join request is outstanding
    Joining,
    /// The server accepted the join
    Joined,
    /// A leave request is outstanding
    Leaving,
    /// The last join failed or the server reported an error; a rejoin is
    /// scheduled
    Errored,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Identifies one registered handler, for [`Channel::off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef(u64);

type Handler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_event: HashMap<String, Vec<(HandlerRef, Handler)>>,
}

/// State shared between channel handles, the socket actor and the dispatcher
pub(crate) struct ChannelShared {
    pub(crate) id: u64,
    topic: String,
    params: Value,
    status: watch::Sender<ChannelStatus>,
    /// 0 until the first join
    join_ref: AtomicU64,
    handlers: Mutex<Handlers>,
}

impl ChannelShared {
    pub(crate) fn new(id: u64, topic: impl Into<String>, params: Value) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Closed);
        Self {
            id,
            topic: topic.into(),
            params,
            status,
            join_ref: AtomicU64::new(0),
            handlers: Mutex::new(Handlers::default()),
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) const fn params(&self) -> &Value {
        &self.params
    }

    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        // A panicking handler never holds this lock, so the data is intact.
        self.handlers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Handlers for `event`, in registration order
    fn handlers_for(&self, event: &str) -> Vec<Handler> {
        self.handlers()
            .by_event
            .get(event)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for ChannelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelShared")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// Handle to a topic subscription.
///
/// Obtained from [`Socket::channel`](crate::Socket::channel). Clones refer to
/// the same channel and compare equal.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub(crate) const fn new(shared: Arc<ChannelShared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, commands }
    }

    /// Topic of this channel
    pub fn topic(&self) -> &str {
        self.shared.topic()
    }

    /// Parameters sent with every join
    pub fn params(&self) -> &Value {
        self.shared.params()
    }

    /// Current state
    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.borrow()
    }

    /// Subscribe to state changes
    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status.subscribe()
    }

    /// `join_ref` of the most recent join attempt
    pub fn join_ref(&self) -> Option<u64> {
        match self.shared.join_ref.load(Ordering::Acquire) {
            0 => None,
            join_ref => Some(join_ref),
        }
    }

    /// Join the topic.
    ///
    /// Resolves with the server's `response` once the join is accepted. Fails
    /// with [`ChannelError::Join`] when the server refuses (a rejoin is then
    /// scheduled), [`ChannelError::Timeout`] when no reply arrives in time,
    /// and [`ChannelError::InvalidState`] when the channel is already joining
    /// or joined. When the socket is not connected yet the join is sent as
    /// soon as it is.
    pub fn join(&self) -> ReplyFuture<Value> {
        self.request(
            |respond, channel_id, topic| Command::Join {
                channel_id,
                topic,
                respond,
            },
            |reply| reply.response,
        )
    }

    /// Leave the topic. The channel is closed and removed from its socket
    /// once the server replies, the deadline passes, or immediately when the
    /// socket is not connected.
    pub fn leave(&self) -> ReplyFuture<Reply> {
        self.request(
            |respond, channel_id, topic| Command::Leave {
                channel_id,
                topic,
                respond,
            },
            |reply| reply,
        )
    }

    /// Send an event and wait for the server's reply.
    ///
    /// `timeout` overrides the configured push deadline. Pushes made while
    /// the channel is (re)joining are buffered and sent after the join
    /// succeeds. A reply with a non-`ok` status still resolves successfully;
    /// inspect [`Reply::status`].
    pub fn push(
        &self,
        event: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> ReplyFuture<Reply> {
        let event = event.into();
        self.request(
            move |respond, channel_id, topic| Command::Push {
                channel_id,
                topic,
                event,
                payload,
                timeout,
                respond,
            },
            |reply| reply,
        )
    }

    /// Register a handler for inbound `event`s. Handlers for one event run in
    /// registration order on the channel's dispatcher task.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> HandlerRef
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        let mut handlers = self.shared.handlers();
        handlers.next_id += 1;
        let handler_ref = HandlerRef(handlers.next_id);
        handlers
            .by_event
            .entry(event.into())
            .or_default()
            .push((handler_ref, Arc::new(handler)));
        handler_ref
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&self, event: &str, handler_ref: HandlerRef) -> bool {
        let mut handlers = self.shared.handlers();
        let Some(list) = handlers.by_event.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != handler_ref);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.by_event.remove(event);
        }
        removed
    }

    fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<Reply>>, u64, String) -> Command,
        map: fn(Reply) -> T,
    ) -> ReplyFuture<T> {
        let (respond, receiver) = oneshot::channel();
        let command = command(respond, self.shared.id, self.shared.topic.clone());
        match self.commands.send(command) {
            Ok(()) => ReplyFuture::waiting(receiver, map),
            Err(_) => ReplyFuture::failed(ChannelError::Shutdown, map),
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.shared.topic)
            .field("status", &self.status())
            .finish()
    }
}

enum ReplyState {
    Waiting(oneshot::Receiver<Result<Reply>>),
    Failed(Option<ChannelError>),
}

/// Outcome of a join, leave or push.
///
/// The request is already queued when this is returned; dropping the future
/// discards the outcome but does not cancel the request.
#[must_use = "the outcome of the request is only observable by awaiting it"]
pub struct ReplyFuture<T> {
    state: ReplyState,
    map: fn(Reply) -> T,
}

impl<T> ReplyFuture<T> {
    const fn waiting(receiver: oneshot::Receiver<Result<Reply>>, map: fn(Reply) -> T) -> Self {
        Self {
            state: ReplyState::Waiting(receiver),
            map,
        }
    }

    const fn failed(error: ChannelError, map: fn(Reply) -> T) -> Self {
        Self {
            state: ReplyState::Failed(Some(error)),
            map,
        }
    }
}

impl<T> Future for ReplyFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ReplyState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(Ok(reply))) => Poll::Ready(Ok((this.map)(reply))),
                Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ChannelError::Shutdown)),
                Poll::Pending => Poll::Pending,
            },
            ReplyState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(ChannelError::Shutdown)))
            }
        }
    }
}

impl<T> fmt::Debug for ReplyFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ReplyState::Waiting(_) => "waiting",
            ReplyState::Failed(_) => "failed",
        };
        f.debug_struct("ReplyFuture").field("state", &state).finish()
    }
}

/// Socket-side state of one channel, owned by the socket actor.
pub(crate) struct ChannelCore {
    pub(crate) shared: Arc<ChannelShared>,
    /// The caller wants this channel joined; drives rejoin after errors and
    /// reconnects.
    pub(crate) desired: bool,
    /// Current join epoch
    pub(crate) join_ref: Option<u64>,
    /// `ref` of the outstanding join request
    pub(crate) pending_join: Option<u64>,
    pub(crate) rejoin_timer: Timer,
    rejoin_backoff: Backoff,
    dispatch: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelCore {
    /// Create the core and start its dispatcher task.
    pub(crate) fn spawn(shared: Arc<ChannelShared>, backoff: &BackoffConfig) -> Self {
        let (dispatch, queue) = mpsc::unbounded_channel();
        let span = info_span!("channel", topic = %shared.topic());
        tokio::spawn(run_dispatcher(Arc::clone(&shared), queue).instrument(span));
        Self {
            shared,
            desired: false,
            join_ref: None,
            pending_join: None,
            rejoin_timer: Timer::default(),
            rejoin_backoff: Backoff::new(backoff),
            dispatch,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn topic(&self) -> &str {
        self.shared.topic()
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        *self.shared.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ChannelStatus) {
        let previous = self.shared.status.send_replace(status);
        if previous != status {
            debug!(topic = %self.topic(), from = %previous, to = %status, "Channel state changed");
        }
    }

    pub(crate) fn begin_join(&mut self, join_ref: u64) {
        self.join_ref = Some(join_ref);
        self.pending_join = Some(join_ref);
        self.shared.join_ref.store(join_ref, Ordering::Release);
        self.set_status(ChannelStatus::Joining);
    }

    /// Whether an inbound `join_ref` belongs to the current join epoch.
    /// Envelopes without one are not tied to an epoch.
    pub(crate) fn accepts(&self, join_ref: Option<&str>) -> bool {
        match join_ref {
            None => true,
            Some(raw) => raw.parse::<u64>().ok() == self.join_ref && self.join_ref.is_some(),
        }
    }

    pub(crate) fn next_rejoin_delay(&mut self) -> Duration {
        self.rejoin_backoff.next_delay()
    }

    pub(crate) const fn reset_rejoin_backoff(&mut self) {
        self.rejoin_backoff.reset();
    }

    /// Queue a message for the channel's handlers.
    pub(crate) fn dispatch(&self, message: ChannelMessage) {
        if self.dispatch.send(message).is_err() {
            debug!(topic = %self.topic(), "Dispatcher stopped; dropping message");
        }
    }
}

/// Run handlers in order. A panicking handler is logged and skipped so later
/// handlers and messages are still delivered.
async fn run_dispatcher(shared: Arc<ChannelShared>, mut queue: mpsc::UnboundedReceiver<ChannelMessage>) {
    while let Some(message) = queue.recv().await {
        for handler in shared.handlers_for(&message.event) {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                warn!(
                    topic = %shared.topic(),
                    event = %message.event,
                    "Channel handler panicked; continuing with the next handler"
                );
            }
        }
    }
    debug!(topic = %shared.topic(), "Channel dispatcher stopped");
}
