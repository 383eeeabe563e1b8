//! The socket event loop.
//!
//! One task owns the transport, the channel registry, the ref counter, the
//! reply tracker and every timer. Handles talk to it through [`Command`]s;
//! the transport I/O task and timers talk to it through [`Event`]s.

use super::statistics::SocketStatistics;
use crate::backoff::Backoff;
use crate::channel::{ChannelCore, ChannelShared, ChannelStatus};
use crate::codec::Codec;
use crate::config::SocketConfig;
use crate::error::{ChannelError, Result};
use crate::message::{ChannelMessage, Envelope, HEARTBEAT_TOPIC, Reply, events};
use crate::timer::Timer;
use crate::tracker::{PendingRequest, ReplyTracker, RequestKind, Responder};
use crate::transport::{ConnectionState, Connector, Endpoint, Link, TransportEvent, TransportHandle};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// How long a caller-initiated close may take to flush queued frames
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests from [`Socket`](super::Socket) and [`Channel`](crate::Channel) handles
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        respond: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        respond: oneshot::Sender<()>,
    },
    Channel {
        topic: String,
        params: Value,
        respond: oneshot::Sender<Arc<ChannelShared>>,
    },
    Join {
        channel_id: u64,
        topic: String,
        respond: Responder,
    },
    Leave {
        channel_id: u64,
        topic: String,
        respond: Responder,
    },
    Push {
        channel_id: u64,
        topic: String,
        event: String,
        payload: Value,
        timeout: Option<Duration>,
        respond: Responder,
    },
    PendingRequests {
        respond: oneshot::Sender<usize>,
    },
}

/// Internal notifications: transport traffic and timer firings
pub(crate) enum Event {
    Transport(TransportEvent),
    ConnectResult {
        attempt: u64,
        result: Result<Box<dyn Link>>,
    },
    ReconnectDue {
        attempt: u64,
    },
    HeartbeatDue {
        epoch: u64,
    },
    RequestTimeout {
        reference: u64,
    },
    RejoinDue {
        channel_id: u64,
    },
}

impl From<TransportEvent> for Event {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

fn channel_removed(topic: &str) -> ChannelError {
    ChannelError::invalid_state(format!("channel {topic} has been removed"))
}

fn join_outcome(reply: Reply) -> Result<Reply> {
    if reply.is_ok() {
        Ok(reply)
    } else {
        Err(ChannelError::join(reply.reason()))
    }
}

pub(crate) struct SocketActor {
    config: SocketConfig,
    connector: Arc<dyn Connector>,
    codec: Codec,
    endpoint: Endpoint,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<SocketStatistics>,

    transport: Option<TransportHandle>,
    /// Incremented on every successful open
    epoch: u64,
    /// Token of the latest connect attempt; results of older ones are stale
    connect_attempt: u64,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Set by `connect()`, cleared by `disconnect()`
    reconnect: bool,
    reconnect_backoff: Backoff,
    reconnect_timer: Timer,

    heartbeat_timer: Timer,
    pending_heartbeat: Option<u64>,
    last_inbound: Instant,

    next_ref: u64,
    next_channel_id: u64,
    channels: HashMap<String, ChannelCore>,
    /// Topics closed on this connection whose final `phx_close` may still arrive
    departed: HashSet<String>,
    tracker: ReplyTracker,
}

impl SocketActor {
    pub(crate) fn new(
        config: SocketConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
        stats: Arc<SocketStatistics>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let endpoint = Endpoint::new(config.url.clone(), config.params.clone(), config.wire_format);
        Self {
            codec: Codec::new(config.wire_format),
            reconnect_backoff: Backoff::new(&config.reconnect_backoff),
            endpoint,
            config,
            connector,
            commands,
            events_tx,
            events,
            state,
            stats,
            transport: None,
            epoch: 0,
            connect_attempt: 0,
            connect_waiters: Vec::new(),
            reconnect: false,
            reconnect_timer: Timer::default(),
            heartbeat_timer: Timer::default(),
            pending_heartbeat: None,
            last_inbound: Instant::now(),
            next_ref: 0,
            next_channel_id: 0,
            channels: HashMap::new(),
            departed: HashSet::new(),
            tracker: ReplyTracker::default(),
        }
    }

    /// Process commands and events until every handle is dropped.
    pub(crate) async fn run(mut self) {
        debug!("Socket actor started");

        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        self.disconnect().await;
        self.channels.clear();
        debug!("Socket actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { respond } => self.connect(respond),
            Command::Disconnect { respond } => {
                self.disconnect().await;
                let _ = respond.send(());
            }
            Command::Channel {
                topic,
                params,
                respond,
            } => {
                let _ = respond.send(self.channel(topic, params));
            }
            Command::Join {
                channel_id,
                topic,
                respond,
            } => self.join(channel_id, &topic, respond),
            Command::Leave {
                channel_id,
                topic,
                respond,
            } => self.leave(channel_id, &topic, respond),
            Command::Push {
                channel_id,
                topic,
                event,
                payload,
                timeout,
                respond,
            } => self.push(channel_id, &topic, event, payload, timeout, respond),
            Command::PendingRequests { respond } => {
                let _ = respond.send(self.tracker.len());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Transport(TransportEvent::Frame { epoch, frame }) => {
                if self.current_epoch() != Some(epoch) {
                    trace!(epoch, "Ignoring frame from a previous connection");
                    return;
                }
                self.last_inbound = Instant::now();
                SocketStatistics::record(&self.stats.frames_received);
                match self.codec.decode(&frame) {
                    Ok(envelope) => self.route(envelope),
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable frame");
                        SocketStatistics::record(&self.stats.decode_failures);
                    }
                }
            }
            Event::Transport(TransportEvent::Closed {
                epoch,
                code,
                reason,
            }) => {
                if self.current_epoch() != Some(epoch) {
                    debug!(epoch, "Ignoring close of a previous connection");
                    return;
                }
                info!(code, reason = %reason, "Connection closed");
                self.transport = None;
                self.connection_lost();
            }
            Event::ConnectResult { attempt, result } => self.on_connect_result(attempt, result),
            Event::ReconnectDue { attempt } => {
                if !self.reconnect
                    || attempt != self.connect_attempt
                    || self.connection_state() != ConnectionState::Closed
                {
                    return;
                }
                SocketStatistics::record(&self.stats.reconnect_attempts);
                self.start_connect();
            }
            Event::HeartbeatDue { epoch } => self.on_heartbeat_due(epoch),
            Event::RequestTimeout { reference } => self.on_request_timeout(reference),
            Event::RejoinDue { channel_id } => self.on_rejoin_due(channel_id),
        }
    }

    // ----- connection lifecycle -----

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn current_epoch(&self) -> Option<u64> {
        self.transport.as_ref().map(TransportHandle::epoch)
    }

    const fn make_ref(&mut self) -> u64 {
        self.next_ref += 1;
        self.next_ref
    }

    fn connect(&mut self, respond: oneshot::Sender<Result<()>>) {
        self.reconnect = true;
        match self.connection_state() {
            ConnectionState::Open => {
                let _ = respond.send(Ok(()));
            }
            ConnectionState::Connecting => self.connect_waiters.push(respond),
            ConnectionState::Closed | ConnectionState::Closing => {
                self.connect_waiters.push(respond);
                self.reconnect_timer.cancel();
                self.start_connect();
            }
        }
    }

    fn start_connect(&mut self) {
        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        self.set_state(ConnectionState::Connecting);
        info!(attempt, "Connecting");

        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        let deadline = self.config.connect_timeout();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(deadline, connector.connect(&endpoint))
                .await
                .unwrap_or_else(|_| {
                    Err(ChannelError::connect(format!(
                        "no connection within {}ms",
                        deadline.as_millis()
                    )))
                });
            let _ = events.send(Event::ConnectResult { attempt, result });
        });
    }

    fn on_connect_result(&mut self, attempt: u64, result: Result<Box<dyn Link>>) {
        if attempt != self.connect_attempt || self.connection_state() != ConnectionState::Connecting {
            if let Ok(mut link) = result {
                debug!(attempt, "Closing link from an abandoned connect attempt");
                tokio::spawn(async move {
                    let _ = link.close().await;
                });
            }
            return;
        }

        match result {
            Ok(link) => self.on_open(link),
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                self.set_state(ConnectionState::Closed);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
                self.schedule_reconnect();
            }
        }
    }

    fn on_open(&mut self, link: Box<dyn Link>) {
        self.epoch += 1;
        self.transport = Some(TransportHandle::spawn(self.epoch, link, &self.events_tx));
        self.set_state(ConnectionState::Open);
        SocketStatistics::record(&self.stats.connections_established);
        self.reconnect_backoff.reset();
        self.last_inbound = Instant::now();
        self.pending_heartbeat = None;
        self.departed.clear();
        self.schedule_heartbeat();
        info!(epoch = self.epoch, "Socket connected");

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.rejoin_channels();
    }

    /// The transport is gone without the caller asking for it.
    fn connection_lost(&mut self) {
        self.heartbeat_timer.cancel();
        self.pending_heartbeat = None;
        self.set_state(ConnectionState::Closed);

        for request in self.tracker.drain_in_flight() {
            request.resolve(Err(ChannelError::ConnectionLost));
        }

        let mut leaving = Vec::new();
        for core in self.channels.values_mut() {
            if let Some(reference) = core.pending_join
                && !self.tracker.contains(reference)
            {
                core.pending_join = None;
            }
            match core.status() {
                ChannelStatus::Joined => {
                    core.dispatch(ChannelMessage {
                        topic: core.topic().to_owned(),
                        event: events::ERROR.to_owned(),
                        payload: json!({}),
                        reference: None,
                    });
                    core.set_status(ChannelStatus::Closed);
                }
                ChannelStatus::Joining => core.set_status(ChannelStatus::Closed),
                ChannelStatus::Leaving => leaving.push(core.topic().to_owned()),
                ChannelStatus::Errored => core.rejoin_timer.cancel(),
                ChannelStatus::Closed => {}
            }
        }
        for topic in leaving {
            self.close_channel(&topic);
        }

        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.reconnect {
            return;
        }
        let delay = self.reconnect_backoff.next_delay();
        info!(
            attempt = self.reconnect_backoff.attempts(),
            delay = ?delay,
            "Scheduling reconnect"
        );
        self.reconnect_timer.schedule(
            delay,
            &self.events_tx,
            Event::ReconnectDue {
                attempt: self.connect_attempt,
            },
        );
    }

    async fn disconnect(&mut self) {
        self.reconnect = false;
        self.connect_attempt += 1;
        self.reconnect_timer.cancel();
        self.heartbeat_timer.cancel();
        self.pending_heartbeat = None;

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ChannelError::Cancelled));
        }
        for request in self.tracker.drain_all() {
            request.resolve(Err(ChannelError::Cancelled));
        }
        for core in self.channels.values_mut() {
            core.rejoin_timer.cancel();
            core.desired = false;
            core.pending_join = None;
            core.set_status(ChannelStatus::Closed);
        }
        self.departed.clear();

        if let Some(transport) = self.transport.take() {
            self.set_state(ConnectionState::Closing);
            let task = transport.close();
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, task).await.is_err() {
                warn!("Transport did not close in time; aborting");
                abort.abort();
            }
            info!("Socket disconnected");
        }
        self.set_state(ConnectionState::Closed);
    }

    // ----- heartbeat -----

    fn schedule_heartbeat(&mut self) {
        self.heartbeat_timer.schedule(
            self.config.heartbeat_interval(),
            &self.events_tx,
            Event::HeartbeatDue { epoch: self.epoch },
        );
    }

    fn on_heartbeat_due(&mut self, epoch: u64) {
        if self.current_epoch() != Some(epoch) {
            return;
        }

        let limit = self
            .config
            .heartbeat_interval()
            .saturating_mul(self.config.heartbeat_max_missed);
        let silent = self.last_inbound.elapsed();
        if silent >= limit {
            warn!(silent = ?silent, "No traffic from server; reconnecting");
            SocketStatistics::record(&self.stats.heartbeat_timeouts);
            if let Some(transport) = self.transport.take() {
                drop(transport.close());
            }
            self.connection_lost();
            return;
        }

        if let Some(reference) = self.pending_heartbeat {
            debug!(reference, "Previous heartbeat still unanswered");
        }
        let reference = self.make_ref();
        match self.send(&Envelope::heartbeat(reference)) {
            Ok(()) => {
                self.pending_heartbeat = Some(reference);
                SocketStatistics::record(&self.stats.heartbeats_sent);
            }
            Err(e) => debug!(error = %e, "Heartbeat not sent"),
        }
        self.schedule_heartbeat();
    }

    // ----- outbound -----

    fn send(&self, envelope: &Envelope) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| ChannelError::send("socket is not connected"))?;
        transport.send(self.codec.encode(envelope))?;
        SocketStatistics::record(&self.stats.frames_sent);
        debug!(
            topic = %envelope.topic,
            event = %envelope.event,
            reference = ?envelope.reference,
            "Sent envelope"
        );
        Ok(())
    }

    /// Send, leaving failures to the close notification that must follow.
    fn send_tracked(&self, envelope: &Envelope) {
        if let Err(e) = self.send(envelope) {
            debug!(topic = %envelope.topic, error = %e, "Send failed; awaiting connection close");
        }
    }

    // ----- channels -----

    fn channel(&mut self, topic: String, params: Value) -> Arc<ChannelShared> {
        if let Some(core) = self.channels.get(&topic) {
            return Arc::clone(&core.shared);
        }
        self.next_channel_id += 1;
        self.departed.remove(&topic);
        let shared = Arc::new(ChannelShared::new(self.next_channel_id, topic.clone(), params));
        debug!(topic = %topic, "Channel created");
        self.channels.insert(
            topic,
            ChannelCore::spawn(Arc::clone(&shared), &self.config.reconnect_backoff),
        );
        shared
    }

    fn channel_core(&mut self, channel_id: u64, topic: &str) -> Option<&mut ChannelCore> {
        self.channels
            .get_mut(topic)
            .filter(|core| core.id() == channel_id)
    }

    fn join(&mut self, channel_id: u64, topic: &str, respond: Responder) {
        let Some(core) = self.channel_core(channel_id, topic) else {
            let _ = respond.send(Err(channel_removed(topic)));
            return;
        };

        match core.status() {
            status @ (ChannelStatus::Joining | ChannelStatus::Joined | ChannelStatus::Leaving) => {
                let _ = respond.send(Err(ChannelError::invalid_state(format!(
                    "channel {topic} is {status}; join can only be called on a closed channel"
                ))));
            }
            ChannelStatus::Closed | ChannelStatus::Errored => {
                core.desired = true;
                core.rejoin_timer.cancel();
                self.start_join(topic, Some(respond));
            }
        }
    }

    /// Send (or buffer) a join with a fresh `join_ref`.
    fn start_join(&mut self, topic: &str, responder: Option<Responder>) {
        let reference = self.make_ref();
        let connected = self.transport.is_some();
        let Some(core) = self.channels.get_mut(topic) else {
            if let Some(responder) = responder {
                let _ = responder.send(Err(channel_removed(topic)));
            }
            return;
        };

        core.begin_join(reference);
        let envelope = Envelope::join(topic, core.shared.params().clone(), reference);
        let request = PendingRequest::new(&envelope, reference, core.id(), RequestKind::Join, responder);
        debug!(topic, join_ref = reference, connected, "Joining channel");

        let request = if connected {
            self.send_tracked(&envelope);
            request
        } else {
            request.buffered(envelope)
        };
        self.tracker.insert(
            request,
            self.config.join_timeout(),
            &self.events_tx,
            Event::RequestTimeout { reference },
        );
    }

    /// After an open, give every wanted channel exactly one join.
    fn rejoin_channels(&mut self) {
        let mut wanted: Vec<(u64, String)> = self
            .channels
            .values()
            .filter(|core| core.desired)
            .map(|core| (core.id(), core.topic().to_owned()))
            .collect();
        wanted.sort_unstable();

        for (_, topic) in wanted {
            let Some(core) = self.channels.get_mut(&topic) else {
                continue;
            };
            let buffered_join = core
                .pending_join
                .filter(|reference| self.tracker.is_buffered(*reference));

            if let Some(reference) = buffered_join {
                if let Some(envelope) = self.tracker.mark_in_flight(reference) {
                    self.send_tracked(&envelope);
                }
            } else if matches!(core.status(), ChannelStatus::Closed | ChannelStatus::Errored) {
                core.rejoin_timer.cancel();
                self.start_join(&topic, None);
            }
        }
    }

    fn schedule_rejoin(&mut self, topic: &str) {
        let Some(core) = self.channels.get_mut(topic) else {
            return;
        };
        if !core.desired {
            return;
        }
        let delay = core.next_rejoin_delay();
        debug!(topic, delay = ?delay, "Scheduling rejoin");
        core.rejoin_timer.schedule(
            delay,
            &self.events_tx,
            Event::RejoinDue {
                channel_id: core.id(),
            },
        );
    }

    fn on_rejoin_due(&mut self, channel_id: u64) {
        let connected = self.transport.is_some();
        let Some(core) = self.channels.values().find(|core| core.id() == channel_id) else {
            return;
        };
        if !connected || !core.desired || core.status() != ChannelStatus::Errored {
            return;
        }
        let topic = core.topic().to_owned();
        info!(topic = %topic, "Rejoining channel");
        self.start_join(&topic, None);
    }

    fn leave(&mut self, channel_id: u64, topic: &str, respond: Responder) {
        let connected = self.transport.is_some();
        let Some(core) = self.channel_core(channel_id, topic) else {
            let _ = respond.send(Err(channel_removed(topic)));
            return;
        };

        let status = core.status();
        if status == ChannelStatus::Leaving {
            let _ = respond.send(Err(ChannelError::invalid_state(format!(
                "channel {topic} is already leaving"
            ))));
            return;
        }
        core.desired = false;
        core.rejoin_timer.cancel();

        if !connected || !matches!(status, ChannelStatus::Joined | ChannelStatus::Joining) {
            self.close_channel(topic);
            let _ = respond.send(Ok(Reply::ok(json!({}))));
            return;
        }

        let join_ref = core.join_ref;
        let channel_id = core.id();
        core.set_status(ChannelStatus::Leaving);

        let reference = self.make_ref();
        let envelope = Envelope::leave(topic, reference, join_ref);
        self.send_tracked(&envelope);
        let request = PendingRequest::new(&envelope, reference, channel_id, RequestKind::Leave, Some(respond));
        self.tracker.insert(
            request,
            self.config.push_timeout(),
            &self.events_tx,
            Event::RequestTimeout { reference },
        );
    }

    fn push(
        &mut self,
        channel_id: u64,
        topic: &str,
        event: String,
        payload: Value,
        timeout: Option<Duration>,
        respond: Responder,
    ) {
        let connected = self.transport.is_some();
        let Some(core) = self.channel_core(channel_id, topic) else {
            let _ = respond.send(Err(channel_removed(topic)));
            return;
        };

        let buffer = match core.status() {
            ChannelStatus::Joined if connected => false,
            ChannelStatus::Joining => true,
            ChannelStatus::Closed | ChannelStatus::Errored | ChannelStatus::Joined if core.desired => true,
            ChannelStatus::Leaving => {
                let _ = respond.send(Err(ChannelError::invalid_state(format!(
                    "cannot push '{event}' to {topic} while leaving"
                ))));
                return;
            }
            _ => {
                let _ = respond.send(Err(ChannelError::invalid_state(format!(
                    "cannot push '{event}' to {topic} before joining"
                ))));
                return;
            }
        };
        let join_ref = core.join_ref;

        let reference = self.make_ref();
        let envelope = Envelope::new(topic, event, payload, Some(reference), join_ref);
        let request = PendingRequest::new(&envelope, reference, channel_id, RequestKind::Push, Some(respond));
        let request = if buffer {
            debug!(topic, reference, "Buffering push until the channel joins");
            request.buffered(envelope)
        } else {
            self.send_tracked(&envelope);
            request
        };
        self.tracker.insert(
            request,
            timeout.unwrap_or_else(|| self.config.push_timeout()),
            &self.events_tx,
            Event::RequestTimeout { reference },
        );
    }

    /// Send the pushes a channel buffered while joining, in `ref` order.
    fn flush_buffered(&mut self, channel_id: u64, join_ref: Option<u64>) {
        for reference in self.tracker.buffered_pushes(channel_id) {
            if let Some(mut envelope) = self.tracker.mark_in_flight(reference) {
                envelope.join_ref = join_ref.map(|r| r.to_string());
                self.send_tracked(&envelope);
            }
        }
    }

    /// Remove a channel, failing whatever it still had pending.
    fn close_channel(&mut self, topic: &str) {
        let Some(mut core) = self.channels.remove(topic) else {
            return;
        };
        core.rejoin_timer.cancel();
        core.desired = false;
        core.set_status(ChannelStatus::Closed);
        if self.transport.is_some() {
            self.departed.insert(topic.to_owned());
        }

        for request in self.tracker.drain_channel(core.id()) {
            request.resolve(Err(ChannelError::invalid_state(format!(
                "channel {topic} closed"
            ))));
        }
        core.dispatch(ChannelMessage {
            topic: topic.to_owned(),
            event: events::CLOSE.to_owned(),
            payload: json!({}),
            reference: None,
        });
        info!(topic, "Channel closed");
    }

    // ----- inbound -----

    fn route(&mut self, envelope: Envelope) {
        if envelope.topic == HEARTBEAT_TOPIC {
            if envelope.is_reply()
                && envelope.reference_id().is_some()
                && envelope.reference_id() == self.pending_heartbeat
            {
                self.pending_heartbeat = None;
                trace!("Heartbeat acknowledged");
            }
            return;
        }

        let Some(core) = self.channels.get(&envelope.topic) else {
            if self.departed.contains(&envelope.topic) {
                debug!(
                    topic = %envelope.topic,
                    event = %envelope.event,
                    "Dropping late message for a closed channel"
                );
                if envelope.event == events::CLOSE {
                    self.departed.remove(&envelope.topic);
                }
            } else {
                warn!(
                    topic = %envelope.topic,
                    event = %envelope.event,
                    "Dropping message for unknown topic"
                );
                SocketStatistics::record(&self.stats.unroutable);
            }
            return;
        };

        if !core.accepts(envelope.join_ref.as_deref()) {
            debug!(
                topic = %envelope.topic,
                event = %envelope.event,
                join_ref = ?envelope.join_ref,
                "Discarding message from an outdated join"
            );
            SocketStatistics::record(&self.stats.stale_discarded);
            return;
        }

        match envelope.event.as_str() {
            events::REPLY if envelope.reference.is_some() => self.on_reply(&envelope),
            events::ERROR => self.on_server_error(envelope),
            events::CLOSE => {
                info!(topic = %envelope.topic, "Channel closed by server");
                self.close_channel(&envelope.topic);
            }
            _ => core.dispatch(envelope.into()),
        }
    }

    fn on_reply(&mut self, envelope: &Envelope) {
        let Some(request) = envelope.reference_id().and_then(|r| self.tracker.take(r)) else {
            debug!(
                topic = %envelope.topic,
                reference = ?envelope.reference,
                "Reply for an unknown or expired request"
            );
            return;
        };

        let reply = Reply::from_payload(&envelope.payload);
        match request.kind {
            RequestKind::Join => self.on_join_reply(request, reply),
            RequestKind::Leave => {
                let topic = request.topic.clone();
                let channel_id = request.channel_id;
                request.resolve(Ok(reply));
                if self.channel_core(channel_id, &topic).is_some() {
                    self.close_channel(&topic);
                }
            }
            RequestKind::Push => request.resolve(Ok(reply)),
        }
    }

    fn on_join_reply(&mut self, request: PendingRequest, reply: Reply) {
        let Some(core) = self.channel_core(request.channel_id, &request.topic) else {
            let error = channel_removed(&request.topic);
            request.resolve(Err(error));
            return;
        };

        if core.pending_join != Some(request.reference) || core.status() != ChannelStatus::Joining {
            request.resolve(join_outcome(reply));
            return;
        }
        core.pending_join = None;

        if reply.is_ok() {
            core.set_status(ChannelStatus::Joined);
            core.reset_rejoin_backoff();
            core.rejoin_timer.cancel();
            info!(topic = %request.topic, join_ref = request.reference, "Joined channel");

            let channel_id = core.id();
            let join_ref = core.join_ref;
            request.resolve(Ok(reply));
            self.flush_buffered(channel_id, join_ref);
        } else {
            let reason = reply.reason();
            warn!(topic = %request.topic, reason = %reason, "Join rejected");
            core.set_status(ChannelStatus::Errored);

            let topic = request.topic.clone();
            request.resolve(Err(ChannelError::join(reason)));
            self.schedule_rejoin(&topic);
        }
    }

    fn on_server_error(&mut self, envelope: Envelope) {
        let topic = envelope.topic.clone();
        let Some(core) = self.channels.get_mut(&topic) else {
            return;
        };
        let status = core.status();
        core.dispatch(envelope.into());
        if !matches!(status, ChannelStatus::Joined | ChannelStatus::Joining) {
            return;
        }

        warn!(topic = %topic, "Channel error reported by server");
        core.set_status(ChannelStatus::Errored);
        if let Some(reference) = core.pending_join.take()
            && let Some(request) = self.tracker.take(reference)
        {
            request.resolve(Err(ChannelError::join("channel crashed on the server")));
        }
        self.schedule_rejoin(&topic);
    }

    fn on_request_timeout(&mut self, reference: u64) {
        let Some(request) = self.tracker.take(reference) else {
            return;
        };

        match request.kind {
            RequestKind::Push => {
                let error = ChannelError::timeout(format!(
                    "no reply to '{}' on {} (ref {reference})",
                    request.event, request.topic
                ));
                debug!(topic = %request.topic, reference, "Push timed out");
                request.resolve(Err(error));
            }
            RequestKind::Leave => {
                let topic = request.topic.clone();
                let channel_id = request.channel_id;
                warn!(topic = %topic, "Leave timed out; closing locally");
                request.resolve(Err(ChannelError::timeout(format!("leave of {topic}"))));
                if self.channel_core(channel_id, &topic).is_some() {
                    self.close_channel(&topic);
                }
            }
            RequestKind::Join => self.on_join_timeout(request),
        }
    }

    fn on_join_timeout(&mut self, request: PendingRequest) {
        let connected = self.transport.is_some();
        let topic = request.topic.clone();
        let join_ref = request.reference;
        let error = ChannelError::timeout(format!("join of {topic} (join_ref {join_ref})"));

        let Some(core) = self.channel_core(request.channel_id, &topic) else {
            request.resolve(Err(error));
            return;
        };
        if core.pending_join == Some(join_ref) {
            core.pending_join = None;
        }
        if core.status() != ChannelStatus::Joining || core.join_ref != Some(join_ref) {
            request.resolve(Err(error));
            return;
        }

        warn!(topic = %topic, join_ref, "Join timed out");
        core.set_status(ChannelStatus::Errored);
        request.resolve(Err(error));

        if connected {
            let reference = self.make_ref();
            self.send_tracked(&Envelope::leave(&topic, reference, Some(join_ref)));
        }
        self.schedule_rejoin(&topic);
    }
}
