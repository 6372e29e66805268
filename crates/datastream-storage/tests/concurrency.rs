//! Concurrency tests for datastream-storage
//!
//! Readers run alongside a committing writer and must only ever observe
//! whole units of entries.

use std::sync::Arc;
use std::time::Duration;

use datastream_core::{EntryType, StreamType};
use datastream_storage::{EntryStore, StoreConfig};
use tempfile::TempDir;
use tokio_test::assert_ok;

const UNIT_SIZE: u64 = 3;
const UNITS: u64 = 200;

async fn create_store(temp_dir: &TempDir) -> Arc<EntryStore> {
    let config = StoreConfig::new(temp_dir.path().join("stream.bin"), StreamType(1))
        .with_sync_on_write(false);
    Arc::new(EntryStore::open(config).await.unwrap())
}

/// Readers never see a count that splits a unit
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_observe_whole_units() {
    let temp_dir = TempDir::new().unwrap();
    let store = create_store(&temp_dir).await;

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for unit in 0..UNITS {
                for position in 0..UNIT_SIZE {
                    let payload = [unit.to_be_bytes(), position.to_be_bytes()].concat();
                    store
                        .append(EntryType(position as u16 + 1), &payload)
                        .await
                        .unwrap();
                }
                store.commit_appended().await.unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        readers.push(tokio::spawn(async move {
            let mut cursor = 0u64;
            while cursor < UNITS * UNIT_SIZE {
                let total = store.count();
                assert_eq!(total % UNIT_SIZE, 0, "count split a unit");

                let entries = store.read_range(cursor, total).await.unwrap();
                for entry in entries {
                    assert_eq!(entry.number, cursor);
                    assert_eq!(entry.entry_type, EntryType((cursor % UNIT_SIZE) as u16 + 1));
                    cursor += 1;
                }
                tokio::task::yield_now().await;
            }
            cursor
        }));
    }

    assert_ok!(writer.await);
    for reader in readers {
        let cursor = tokio::time::timeout(Duration::from_secs(30), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor, UNITS * UNIT_SIZE);
    }
}

/// Discarded units leave no trace for concurrent readers
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discard_interleaved_with_reads() {
    let temp_dir = TempDir::new().unwrap();
    let store = create_store(&temp_dir).await;

    for unit in 0..50u64 {
        for _ in 0..UNIT_SIZE {
            store.append(EntryType(1), &unit.to_be_bytes()).await.unwrap();
        }
        if unit % 2 == 0 {
            assert_ok!(store.commit_appended().await);
        } else {
            assert_eq!(store.discard_appended().await.unwrap(), UNIT_SIZE as usize);
        }
    }

    assert_eq!(store.count(), 25 * UNIT_SIZE);
    let entries = store.read_range(0, store.count()).await.unwrap();
    for (i, entry) in entries.iter().enumerate() {
        let unit = u64::from_be_bytes(entry.payload[..].try_into().unwrap());
        assert_eq!(entry.number, i as u64);
        assert_eq!(unit % 2, 0);
        assert_eq!(unit, (i as u64 / UNIT_SIZE) * 2);
    }
}
