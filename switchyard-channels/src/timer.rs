//! Cancelable one-shot timers that post an event into a queue.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A single pending firing. Rescheduling replaces the previous one.
///
/// Cancellation aborts the sleeping task, but an event that already fired may
/// still be queued; receivers guard against that with tokens or refs.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub(crate) fn schedule<E>(&mut self, after: Duration, events: &mpsc::UnboundedSender<E>, event: E)
    where
        E: Send + 'static,
    {
        self.cancel();
        let events = events.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        }));
    }

    /// Idempotent
    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_scheduled(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
