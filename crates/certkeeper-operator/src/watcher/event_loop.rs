//! CA file event loop
//!
//! Single consumer of the file-watch event queue and its error queue. The
//! loop ends when the event queue closes, which happens once the watch handle
//! is dropped.
//!
//! A removed file cannot be watched until it is recreated, so re-watching
//! retries with capped exponential backoff until it succeeds or shutdown is
//! requested.

use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::sync::CaSync;
use super::PathWatch;

/// First delay before retrying a failed re-watch
const REWATCH_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Cap on the delay between re-watch attempts
const REWATCH_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// What an event asks the loop to do, ordered by how much work it implies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum EventAction {
    /// Does not affect file content
    Ignore,
    /// Content may have changed
    Sync,
    /// File was removed; the watch must be re-established first
    RewatchAndSync,
}

/// Classify a file-system event
pub(crate) fn classify(kind: &EventKind) -> EventAction {
    match kind {
        EventKind::Remove(_) => EventAction::RewatchAndSync,
        EventKind::Create(_) => EventAction::Sync,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            EventAction::Sync
        }
        _ => EventAction::Ignore,
    }
}

/// Result of handling one batch of events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cycle {
    /// Nothing actionable
    Ignored,
    /// Webhooks are in sync with the file
    Synced,
    /// Sync failed, or shutdown interrupted the re-watch; logged
    Failed,
}

pub(crate) struct EventLoop {
    events: mpsc::Receiver<Event>,
    errors: mpsc::Receiver<notify::Error>,
    watch: Arc<dyn PathWatch>,
    sync: CaSync,
    shutdown: CancellationToken,
}

impl EventLoop {
    pub(crate) fn new(
        events: mpsc::Receiver<Event>,
        errors: mpsc::Receiver<notify::Error>,
        watch: Arc<dyn PathWatch>,
        sync: CaSync,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            events,
            errors,
            watch,
            sync,
            shutdown,
        }
    }

    /// Run until the event queue closes
    pub(crate) async fn run(mut self) {
        let mut errors_open = true;
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.handle(event).await;
                    }
                    None => break,
                },
                err = self.errors.recv(), if errors_open => match err {
                    Some(err) => error!(error = %err, "webhook ca certificate watch error"),
                    None => errors_open = false,
                },
            }
        }
        debug!("webhook ca certificate watch loop stopped");
    }

    /// Handle `first` together with every event already queued behind it
    pub(crate) async fn handle(&mut self, first: Event) -> Cycle {
        trace!(event = ?first, "webhook ca certificate event");
        let mut action = classify(&first.kind);
        let mut coalesced = 0usize;
        while let Ok(next) = self.events.try_recv() {
            trace!(event = ?next, "webhook ca certificate event");
            action = action.max(classify(&next.kind));
            coalesced += 1;
        }

        if action == EventAction::Ignore {
            return Cycle::Ignored;
        }
        debug!(?action, coalesced, "webhook ca certificate changed");

        if action == EventAction::RewatchAndSync && !self.rewatch().await {
            return Cycle::Failed;
        }

        match self.sync.sync().await {
            Ok(()) => Cycle::Synced,
            Err(e) => {
                error!(error = %e, "error patching webhook ca cert");
                Cycle::Failed
            }
        }
    }

    /// Re-establish the watch, retrying until the file is back
    ///
    /// Returns false if shutdown was requested first.
    async fn rewatch(&self) -> bool {
        let mut delay = REWATCH_INITIAL_BACKOFF;
        loop {
            match self.watch.rewatch() {
                Ok(()) => return true,
                Err(e) => warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "error re-watching file"
                ),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(REWATCH_MAX_BACKOFF);
        }
    }
}
