//! Request/reply correlation.
//!
//! Every join, leave and push gets a `ref` from the socket's counter and a
//! [`PendingRequest`] here until its reply arrives, its deadline passes, or
//! the connection goes away.

use crate::error::{ChannelError, Result};
use crate::message::{Envelope, Reply};
use crate::timer::Timer;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// What a pending request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Join,
    Leave,
    Push,
}

/// Where a pending request is
#[derive(Debug)]
pub(crate) enum Stage {
    /// Waiting for its channel to join; the envelope is sent later.
    Buffered(Envelope),
    /// Written to the current connection.
    InFlight,
}

pub(crate) type Responder = oneshot::Sender<Result<Reply>>;

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) reference: u64,
    pub(crate) channel_id: u64,
    pub(crate) topic: String,
    pub(crate) event: String,
    pub(crate) kind: RequestKind,
    pub(crate) stage: Stage,
    responder: Option<Responder>,
    timer: Timer,
}

impl PendingRequest {
    pub(crate) fn new(
        envelope: &Envelope,
        reference: u64,
        channel_id: u64,
        kind: RequestKind,
        responder: Option<Responder>,
    ) -> Self {
        Self {
            reference,
            channel_id,
            topic: envelope.topic.clone(),
            event: envelope.event.clone(),
            kind,
            stage: Stage::InFlight,
            responder,
            timer: Timer::default(),
        }
    }

    #[must_use]
    pub(crate) fn buffered(mut self, envelope: Envelope) -> Self {
        self.stage = Stage::Buffered(envelope);
        self
    }

    pub(crate) const fn is_buffered(&self) -> bool {
        matches!(self.stage, Stage::Buffered(_))
    }

    /// Complete the request. The caller may have stopped waiting.
    pub(crate) fn resolve(mut self, result: Result<Reply>) {
        self.timer.cancel();
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(result);
        }
    }
}

/// Pending requests keyed by `ref`
#[derive(Debug, Default)]
pub(crate) struct ReplyTracker {
    pending: BTreeMap<u64, PendingRequest>,
}

impl ReplyTracker {
    /// Register a request and arm its deadline. When the deadline passes,
    /// `on_timeout` is posted to `events`.
    pub(crate) fn insert<E>(
        &mut self,
        mut request: PendingRequest,
        deadline: Duration,
        events: &mpsc::UnboundedSender<E>,
        on_timeout: E,
    ) where
        E: Send + 'static,
    {
        request.timer.schedule(deadline, events, on_timeout);
        if let Some(previous) = self.pending.insert(request.reference, request) {
            previous.resolve(Err(ChannelError::invalid_state("request ref reused")));
        }
    }

    pub(crate) fn take(&mut self, reference: u64) -> Option<PendingRequest> {
        self.pending.remove(&reference)
    }

    pub(crate) fn contains(&self, reference: u64) -> bool {
        self.pending.contains_key(&reference)
    }

    pub(crate) fn is_buffered(&self, reference: u64) -> bool {
        self.pending
            .get(&reference)
            .is_some_and(PendingRequest::is_buffered)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Buffered requests of a channel in `ref` order, excluding joins.
    pub(crate) fn buffered_pushes(&self, channel_id: u64) -> Vec<u64> {
        self.pending
            .values()
            .filter(|r| r.channel_id == channel_id && r.kind != RequestKind::Join && r.is_buffered())
            .map(|r| r.reference)
            .collect()
    }

    /// Move a buffered request to in flight and hand back its envelope.
    pub(crate) fn mark_in_flight(&mut self, reference: u64) -> Option<Envelope> {
        let request = self.pending.get_mut(&reference)?;
        match std::mem::replace(&mut request.stage, Stage::InFlight) {
            Stage::Buffered(envelope) => Some(envelope),
            Stage::InFlight => None,
        }
    }

    /// Remove every request written to the connection that just closed.
    pub(crate) fn drain_in_flight(&mut self) -> Vec<PendingRequest> {
        let refs: Vec<u64> = self
            .pending
            .values()
            .filter(|r| !r.is_buffered())
            .map(|r| r.reference)
            .collect();
        refs.into_iter()
            .filter_map(|reference| self.pending.remove(&reference))
            .collect()
    }

    /// Remove every request of one channel.
    pub(crate) fn drain_channel(&mut self, channel_id: u64) -> Vec<PendingRequest> {
        let refs: Vec<u64> = self
            .pending
            .values()
            .filter(|r| r.channel_id == channel_id)
            .map(|r| r.reference)
            .collect();
        refs.into_iter()
            .filter_map(|reference| self.pending.remove(&reference))
            .collect()
    }

    /// Remove everything.
    pub(crate) fn drain_all(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}
