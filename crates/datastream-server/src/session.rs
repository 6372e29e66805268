//! Client sessions
//!
//! A session is created by a `Start` command and streams entries from its
//! cursor until stopped. It replays stored entries first, subscribes to the
//! broadcaster once it reaches the live edge, then replays again to cover
//! commits that landed before the subscription existed. From then on every
//! notification is served from the store, skipping ranges the cursor has
//! already passed, so the switch to live neither drops nor repeats entries.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use datastream_core::{CommandResult, Packet, ResultCode};
use datastream_storage::{EntryStore, StorageError};

use crate::broadcaster::{Broadcaster, SubscriptionError};
use crate::server::Shared;

/// Delivery phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Replaying stored entries
    CatchingUp,
    /// Waiting on commit notifications
    Live,
}

/// Snapshot of a streaming session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub from_entry: u64,
    /// Next entry number to deliver
    pub cursor: u64,
    pub mode: SessionMode,
}

/// How a session ended
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Stop command, disconnect or server shutdown
    Cancelled,
    /// Outgoing queue closed under us
    ConnectionClosed,
    /// Dropped for falling behind the broadcaster
    Lagged(u64),
    /// Broadcaster went away
    BroadcasterClosed,
    /// Store read failed
    Storage(StorageError),
}

impl From<StorageError> for SessionEnd {
    fn from(err: StorageError) -> Self {
        SessionEnd::Storage(err)
    }
}

/// Session task state
pub(crate) struct Session {
    id: u64,
    cursor: u64,
    store: Arc<EntryStore>,
    broadcaster: Broadcaster,
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    batch_size: u64,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<Shared>,
        info: &SessionInfo,
        outgoing: mpsc::Sender<Packet>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: info.id,
            cursor: info.from_entry,
            store: shared.store.clone(),
            broadcaster: shared.broadcaster.clone(),
            batch_size: shared.config.catch_up_batch_size.max(1) as u64,
            shared,
            outgoing,
            cancel,
        }
    }

    /// Stream until cancelled, then unregister the session
    pub(crate) async fn run(mut self) -> SessionEnd {
        info!(session_id = self.id, from_entry = self.cursor, "Session started");

        let end = match self.stream().await {
            Ok(()) => SessionEnd::Cancelled,
            Err(end) => end,
        };

        // Unregister first so a Start answering the notice finds no session
        self.shared.sessions.remove(&self.id);

        let notice = match &end {
            SessionEnd::Lagged(missed) => {
                warn!(session_id = self.id, missed, cursor = self.cursor, "Session dropped for lagging");
                Some(CommandResult::error(
                    ResultCode::SubscriberLagged,
                    format!("subscriber lagged; restart from entry {}", self.cursor),
                ))
            }
            SessionEnd::Storage(e) => {
                error!(session_id = self.id, error = %e, cursor = self.cursor, "Session read failed");
                Some(CommandResult::error(ResultCode::Internal, e.to_string()))
            }
            _ => None,
        };
        if let Some(notice) = notice {
            // The connection may already be gone
            let _ = self.send(Packet::Result(notice)).await;
        }

        info!(session_id = self.id, cursor = self.cursor, end = ?end, "Session ended");
        end
    }

    async fn stream(&mut self) -> Result<(), SessionEnd> {
        self.catch_up().await?;

        let mut subscription = self.broadcaster.subscribe();
        self.catch_up().await?;
        self.set_mode(SessionMode::Live);
        debug!(session_id = self.id, cursor = self.cursor, "Session live");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                next = subscription.next() => next,
            };

            match next {
                Ok(range) if range.last < self.cursor => continue,
                Ok(_) => self.catch_up().await?,
                Err(SubscriptionError::Lagged(missed)) => return Err(SessionEnd::Lagged(missed)),
                Err(SubscriptionError::Closed) => return Err(SessionEnd::BroadcasterClosed),
            }
        }
    }

    /// Send stored entries from the cursor up to the current count
    ///
    /// The count is re-read after each batch so replay does not stall just
    /// below an advancing live edge.
    async fn catch_up(&mut self) -> Result<(), SessionEnd> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SessionEnd::Cancelled);
            }

            let total = self.store.count();
            if self.cursor >= total {
                return Ok(());
            }

            let to = total.min(self.cursor + self.batch_size);
            let entries = self.store.read_range(self.cursor, to).await?;
            if entries.is_empty() {
                return Ok(());
            }

            for entry in entries {
                self.send(Packet::Entry(entry)).await?;
                self.cursor += 1;
            }
            self.record_cursor();
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), SessionEnd> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionEnd::Cancelled),
            sent = self.outgoing.send(packet) => sent.map_err(|_| SessionEnd::ConnectionClosed),
        }
    }

    fn record_cursor(&self) {
        if let Some(mut info) = self.shared.sessions.get_mut(&self.id) {
            info.cursor = self.cursor;
        }
    }

    fn set_mode(&self, mode: SessionMode) {
        if let Some(mut info) = self.shared.sessions.get_mut(&self.id) {
            info.cursor = self.cursor;
            info.mode = mode;
        }
    }
}
