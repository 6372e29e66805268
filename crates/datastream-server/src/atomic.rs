//! Atomic commit manager
//!
//! Groups entries from the single writer into units. A unit's entries are
//! held in memory until commit, then appended to the store and published
//! with one count update, so readers see the whole unit or none of it.
//!
//! ```text
//! Idle --start--> Open --commit--> Committing --> Idle
//!                   |
//!                   +--rollback--> RollingBack --> Idle
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{Instrument, Span, debug, error, info, instrument, warn};

use datastream_core::{EntryType, EntryTypeRegistry, StreamHeader, ValidationError};
use datastream_storage::{EntryStore, StorageError};

use crate::broadcaster::{Broadcaster, CommittedRange};
use crate::error::{ServerError, ServerResult};

/// State of the writer's atomic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOpStatus {
    /// No unit open
    Idle,
    /// A unit is accepting entries
    Open,
    /// A unit is being written to the store
    Committing,
    /// A unit is being discarded
    RollingBack,
}

/// Handle for an entry added to the open unit
///
/// `entry_number` is the number the entry will carry if the unit commits;
/// it is not durable and is reused if the unit rolls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionalEntry {
    /// Position within the unit
    pub position: usize,
    /// Number assigned on commit
    pub entry_number: u64,
}

#[derive(Debug)]
struct PendingEntry {
    entry_type: EntryType,
    payload: Bytes,
}

#[derive(Debug)]
struct WriterState {
    status: AtomicOpStatus,
    pending: Vec<PendingEntry>,
}

/// Single-writer gate in front of the entry store
pub struct AtomicCommitManager {
    store: Arc<EntryStore>,
    broadcaster: Broadcaster,
    registry: Arc<EntryTypeRegistry>,
    state: Arc<Mutex<WriterState>>,
}

impl AtomicCommitManager {
    /// Create a manager over a store, notifying `broadcaster` on commit
    pub fn new(
        store: Arc<EntryStore>,
        broadcaster: Broadcaster,
        registry: Arc<EntryTypeRegistry>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            registry,
            state: Arc::new(Mutex::new(WriterState {
                status: AtomicOpStatus::Idle,
                pending: Vec::new(),
            })),
        }
    }

    /// Current status
    pub async fn status(&self) -> AtomicOpStatus {
        self.state.lock().await.status
    }

    /// Number of entries in the open unit
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Open a new unit
    pub async fn start_atomic_op(&self) -> ServerResult<()> {
        let mut state = self.state.lock().await;
        if state.status != AtomicOpStatus::Idle {
            return Err(ServerError::AlreadyOpen);
        }
        state.status = AtomicOpStatus::Open;
        state.pending.clear();
        debug!(next_entry = self.store.count(), "Atomic operation started");
        Ok(())
    }

    /// Add an entry to the open unit
    ///
    /// Nothing reaches the store until commit. Rejected entries leave the
    /// unit unchanged.
    pub async fn add_stream_entry(
        &self,
        entry_type: EntryType,
        payload: impl Into<Bytes>,
    ) -> ServerResult<ProvisionalEntry> {
        let payload = payload.into();
        let mut state = self.state.lock().await;
        if state.status != AtomicOpStatus::Open {
            return Err(ServerError::NoOpenUnit);
        }

        let stream_type = self.store.config().stream_type;
        let definition = self.registry.validate(entry_type)?;
        if definition.stream_type != stream_type {
            return Err(ValidationError::StreamTypeMismatch {
                expected: stream_type,
                actual: definition.stream_type,
            }
            .into());
        }

        let max = self.store.config().max_payload_size;
        if payload.len() > max {
            return Err(ValidationError::PayloadTooLarge {
                len: payload.len(),
                max,
            }
            .into());
        }

        let position = state.pending.len();
        state.pending.push(PendingEntry {
            entry_type,
            payload,
        });

        Ok(ProvisionalEntry {
            position,
            entry_number: self.store.count() + position as u64,
        })
    }

    /// Commit the open unit
    ///
    /// Appends every pending entry in insertion order, publishes the new
    /// count, then notifies the broadcaster. If the store fails, the
    /// appended entries are discarded and the unit is gone. Committing an
    /// empty unit closes it without touching the store.
    ///
    /// The write runs on its own task holding the writer state, so dropping
    /// the returned future does not interrupt it: the unit still commits (or
    /// is discarded) and the manager returns to idle.
    #[instrument(skip_all)]
    pub async fn commit_atomic_op(&self) -> ServerResult<StreamHeader> {
        let mut state = self.state.clone().lock_owned().await;
        if state.status != AtomicOpStatus::Open {
            return Err(ServerError::NoOpenUnit);
        }
        if state.pending.is_empty() {
            state.status = AtomicOpStatus::Idle;
            return Ok(self.store.header());
        }
        state.status = AtomicOpStatus::Committing;

        let task = tokio::spawn(
            commit_unit(state, self.store.clone(), self.broadcaster.clone())
                .instrument(Span::current()),
        );
        match task.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(error = %join_err, "Commit task failed");
                // The task dropped the writer state mid-commit
                let mut state = self.state.lock().await;
                state.status = AtomicOpStatus::Idle;
                state.pending.clear();
                if let Err(discard_err) = self.store.discard_appended().await {
                    warn!(error = %discard_err, "Failed to discard tentative entries");
                }
                Err(ServerError::CommitFailed(StorageError::Io(join_err.to_string())))
            }
        }
    }

    /// Discard the open unit
    pub async fn rollback_atomic_op(&self) -> ServerResult<usize> {
        let mut state = self.state.lock().await;
        if state.status != AtomicOpStatus::Open {
            return Err(ServerError::NoOpenUnit);
        }
        state.status = AtomicOpStatus::RollingBack;
        let discarded = state.pending.len();
        state.pending.clear();
        state.status = AtomicOpStatus::Idle;
        info!(discarded, "Atomic operation rolled back");
        Ok(discarded)
    }
}

/// Write a unit under the writer state and return the manager to idle
async fn commit_unit(
    mut state: OwnedMutexGuard<WriterState>,
    store: Arc<EntryStore>,
    broadcaster: Broadcaster,
) -> ServerResult<StreamHeader> {
    let pending = std::mem::take(&mut state.pending);
    let result = write_unit(&store, &pending).await;

    let outcome = match result {
        Ok(range) => {
            info!(
                first = range.first,
                last = range.last,
                entries = range.entry_count(),
                "Atomic operation committed"
            );
            broadcaster.notify(range.first, range.last);
            Ok(store.header())
        }
        Err(e) => {
            error!(error = %e, entries = pending.len(), "Commit failed, discarding unit");
            if let Err(discard_err) = store.discard_appended().await {
                warn!(error = %discard_err, "Failed to discard tentative entries");
            }
            Err(ServerError::CommitFailed(e))
        }
    };
    state.status = AtomicOpStatus::Idle;
    outcome
}

async fn write_unit(
    store: &EntryStore,
    pending: &[PendingEntry],
) -> Result<CommittedRange, StorageError> {
    let first = store.count();
    for entry in pending {
        store.append(entry.entry_type, &entry.payload).await?;
    }
    let header = store.commit_appended().await?;
    Ok(CommittedRange {
        first,
        last: header.total_entries - 1,
    })
}

impl std::fmt::Debug for AtomicCommitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicCommitManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use datastream_core::{EntryDefinition, StreamType};
    use datastream_storage::{FILE_HEADER_SIZE, StoreConfig};
    use futures::FutureExt;
    use tempfile::TempDir;

    const STREAM: StreamType = StreamType(1);

    fn test_registry() -> Arc<EntryTypeRegistry> {
        Arc::new(
            EntryTypeRegistry::new()
                .with_entry(EntryType(1), EntryDefinition::new("Start", STREAM))
                .with_entry(EntryType(2), EntryDefinition::new("Body", STREAM))
                .with_entry(EntryType(3), EntryDefinition::new("End", STREAM))
                .with_entry(EntryType(9), EntryDefinition::new("Foreign", StreamType(2))),
        )
    }

    async fn create_test_manager() -> (AtomicCommitManager, Arc<EntryStore>, Broadcaster, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::new(temp_dir.path().join("stream.bin"), STREAM)
            .with_max_payload_size(16)
            .with_sync_on_write(false);
        let store = Arc::new(EntryStore::open(config).await.unwrap());
        let broadcaster = Broadcaster::new(16);
        let manager =
            AtomicCommitManager::new(store.clone(), broadcaster.clone(), test_registry());
        (manager, store, broadcaster, temp_dir)
    }

    #[tokio::test]
    async fn test_commit_publishes_unit() {
        let (manager, store, broadcaster, _temp) = create_test_manager().await;
        let mut sub = broadcaster.subscribe();

        manager.start_atomic_op().await.unwrap();
        for (ty, payload) in [(1u16, "A"), (2, "B"), (3, "C")] {
            manager
                .add_stream_entry(EntryType(ty), payload.as_bytes().to_vec())
                .await
                .unwrap();
        }
        assert_eq!(store.count(), 0);

        let header = manager.commit_atomic_op().await.unwrap();
        assert_eq!(header.total_entries, 3);
        assert_eq!(manager.status().await, AtomicOpStatus::Idle);
        assert_eq!(sub.next().await.unwrap(), CommittedRange { first: 0, last: 2 });

        let entries = store.read_range(0, 3).await.unwrap();
        let seen: Vec<(u64, u16, &[u8])> = entries
            .iter()
            .map(|e| (e.number, e.entry_type.value(), &e.payload[..]))
            .collect();
        assert_eq!(seen, vec![(0, 1, &b"A"[..]), (1, 2, &b"B"[..]), (2, 3, &b"C"[..])]);
    }

    #[tokio::test]
    async fn test_rollback_consumes_no_numbers() {
        let (manager, store, broadcaster, _temp) = create_test_manager().await;
        let mut sub = broadcaster.subscribe();

        manager.start_atomic_op().await.unwrap();
        manager.add_stream_entry(EntryType(1), &b"x"[..]).await.unwrap();
        manager.add_stream_entry(EntryType(2), &b"y"[..]).await.unwrap();
        assert_eq!(manager.rollback_atomic_op().await.unwrap(), 2);
        assert_eq!(store.count(), 0);

        manager.start_atomic_op().await.unwrap();
        let provisional = manager.add_stream_entry(EntryType(3), &b"z"[..]).await.unwrap();
        assert_eq!(provisional.entry_number, 0);
        manager.commit_atomic_op().await.unwrap();

        assert_eq!(store.read(0).await.unwrap().payload, Bytes::from_static(b"z"));
        // Rollback sent nothing
        assert_eq!(sub.next().await.unwrap(), CommittedRange { first: 0, last: 0 });
    }

    #[tokio::test]
    async fn test_state_errors() {
        let (manager, store, _b, _temp) = create_test_manager().await;

        let result = manager.add_stream_entry(EntryType(1), &b"x"[..]).await;
        assert!(matches!(result, Err(ServerError::NoOpenUnit)));
        assert!(matches!(manager.commit_atomic_op().await, Err(ServerError::NoOpenUnit)));
        assert!(matches!(manager.rollback_atomic_op().await, Err(ServerError::NoOpenUnit)));

        manager.start_atomic_op().await.unwrap();
        assert!(matches!(manager.start_atomic_op().await, Err(ServerError::AlreadyOpen)));
        assert_eq!(manager.status().await, AtomicOpStatus::Open);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_validation_leaves_unit_unchanged() {
        let (manager, _store, _b, _temp) = create_test_manager().await;
        manager.start_atomic_op().await.unwrap();
        manager.add_stream_entry(EntryType(1), &b"ok"[..]).await.unwrap();

        let too_large = manager.add_stream_entry(EntryType(2), vec![0u8; 17]).await;
        assert!(matches!(
            too_large,
            Err(ServerError::Validation(ValidationError::PayloadTooLarge { len: 17, max: 16 }))
        ));

        let unknown = manager.add_stream_entry(EntryType(42), &b"?"[..]).await;
        assert!(matches!(
            unknown,
            Err(ServerError::Validation(ValidationError::UnregisteredEntryType(EntryType(42))))
        ));

        let foreign = manager.add_stream_entry(EntryType(9), &b"?"[..]).await;
        assert!(matches!(
            foreign,
            Err(ServerError::Validation(ValidationError::StreamTypeMismatch { .. }))
        ));

        assert_eq!(manager.pending_len().await, 1);
        assert_eq!(manager.commit_atomic_op().await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_empty_commit_is_noop() {
        let (manager, store, broadcaster, _temp) = create_test_manager().await;
        let _sub = broadcaster.subscribe();

        manager.start_atomic_op().await.unwrap();
        let header = manager.commit_atomic_op().await.unwrap();
        assert_eq!(header.total_entries, 0);
        assert_eq!(store.count(), 0);
        assert_eq!(manager.status().await, AtomicOpStatus::Idle);
    }

    #[tokio::test]
    async fn test_provisional_numbers_follow_committed_count() {
        let (manager, _store, _b, _temp) = create_test_manager().await;

        for unit in 0..3u64 {
            manager.start_atomic_op().await.unwrap();
            for position in 0..2usize {
                let handle = manager
                    .add_stream_entry(EntryType(2), vec![unit as u8])
                    .await
                    .unwrap();
                assert_eq!(handle.position, position);
                assert_eq!(handle.entry_number, unit * 2 + position as u64);
            }
            manager.commit_atomic_op().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dropped_commit_still_completes() {
        let (manager, store, broadcaster, _temp) = create_test_manager().await;
        let mut sub = broadcaster.subscribe();

        manager.start_atomic_op().await.unwrap();
        manager.add_stream_entry(EntryType(1), &b"A"[..]).await.unwrap();
        // Poll once, then drop the future mid-commit
        let _ = manager.commit_atomic_op().now_or_never();

        assert_eq!(manager.status().await, AtomicOpStatus::Idle);
        assert_eq!(store.count(), 1);
        assert_eq!(store.pending_count().await, 0);
        assert_eq!(sub.next().await.unwrap(), CommittedRange { first: 0, last: 0 });

        manager.start_atomic_op().await.unwrap();
        manager.add_stream_entry(EntryType(2), &b"B"[..]).await.unwrap();
        assert_eq!(manager.commit_atomic_op().await.unwrap().total_entries, 2);
    }

    #[tokio::test]
    async fn test_commit_under_expired_timeout_leaves_writer_usable() {
        let (manager, store, _b, _temp) = create_test_manager().await;

        manager.start_atomic_op().await.unwrap();
        manager.add_stream_entry(EntryType(1), &b"A"[..]).await.unwrap();
        manager.add_stream_entry(EntryType(3), &b"C"[..]).await.unwrap();
        let _ = tokio::time::timeout(Duration::ZERO, manager.commit_atomic_op()).await;

        manager.start_atomic_op().await.unwrap();
        assert_eq!(manager.status().await, AtomicOpStatus::Open);
        assert_eq!(store.count(), 2);
        assert_eq!(manager.rollback_atomic_op().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_discards_unit() {
        let (manager, store, broadcaster, _temp) = create_test_manager().await;
        let mut sub = broadcaster.subscribe();

        manager.start_atomic_op().await.unwrap();
        for payload in [&b"lost-1"[..], &b"lost-2"[..], &b"lost-3"[..]] {
            manager.add_stream_entry(EntryType(2), payload).await.unwrap();
        }
        store.fail_next_commit();

        let result = manager.commit_atomic_op().await;
        assert!(matches!(result, Err(ServerError::CommitFailed(StorageError::Io(_)))));
        assert_eq!(manager.status().await, AtomicOpStatus::Idle);
        assert_eq!(store.count(), 0);
        assert_eq!(store.header().total_entries, 0);
        assert_eq!(store.pending_count().await, 0);
        let len = tokio::fs::metadata(store.path()).await.unwrap().len();
        assert_eq!(len, FILE_HEADER_SIZE);

        // The next unit takes the numbers the failed one would have used
        manager.start_atomic_op().await.unwrap();
        manager.add_stream_entry(EntryType(1), &b"kept-1"[..]).await.unwrap();
        manager.add_stream_entry(EntryType(3), &b"kept-2"[..]).await.unwrap();
        assert_eq!(manager.commit_atomic_op().await.unwrap().total_entries, 2);

        // Nothing was announced for the failed unit
        assert_eq!(sub.next().await.unwrap(), CommittedRange { first: 0, last: 1 });
        let numbers: Vec<u64> = store
            .read_range(0, 2)
            .await
            .unwrap()
            .iter()
            .map(|e| e.number)
            .collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(store.read(0).await.unwrap().payload, Bytes::from_static(b"kept-1"));
    }
}
