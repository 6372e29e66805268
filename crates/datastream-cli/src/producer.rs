//! Demo sequencer producer
//!
//! Commits one block per unit: block start, a random number of
//! transactions, block end. Rolling back is an explicit choice made through
//! [`ProducerConfig::rollback_every`]; a rolled back block is produced again
//! under the same block number.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use datastream_core::EntryType;
use datastream_server::{ServerResult, StreamServer};

use crate::sequencer::{
    L2_BLOCK_END, L2_BLOCK_START, L2_TRANSACTION, L2BlockEnd, L2BlockStart, L2Transaction,
};

const BLOCKS_PER_BATCH: u64 = 10;
const FORK_ID: u16 = 5;
const COINBASE: [u8; 20] = [
    20, 21, 22, 23, 24, 20, 21, 22, 23, 24, 20, 21, 22, 23, 24, 20, 21, 22, 23, 24,
];

/// Producer settings
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Pause between blocks
    pub interval: Duration,
    /// Roll back every Nth attempted block; `None` commits everything
    pub rollback_every: Option<u64>,
    /// Upper bound of transactions per block (at least one is produced)
    pub max_transactions: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            rollback_every: None,
            max_transactions: 20,
        }
    }
}

/// Result of one produced block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Committed {
        block_number: u64,
        first_entry: u64,
        total_entries: u64,
    },
    RolledBack {
        block_number: u64,
        discarded: usize,
    },
}

/// Counters reported when the producer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub committed_blocks: u64,
    pub rolled_back_blocks: u64,
}

pub struct Producer {
    server: Arc<StreamServer>,
    config: ProducerConfig,
    next_block: u64,
    attempts: u64,
}

impl Producer {
    /// Create a producer continuing after the last committed block
    pub async fn resume(server: Arc<StreamServer>, config: ProducerConfig) -> ServerResult<Self> {
        let next_block = match last_block_number(&server).await? {
            Some(block) => block + 1,
            None => 0,
        };
        Ok(Self {
            server,
            config,
            next_block,
            attempts: 0,
        })
    }

    /// Block number the next produced block will carry
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Produce blocks until cancelled
    #[instrument(skip_all, fields(first_block = self.next_block))]
    pub async fn run(mut self, cancel: CancellationToken) -> ServerResult<ProducerStats> {
        let mut stats = ProducerStats::default();

        while !cancel.is_cancelled() {
            match self.produce_block().await? {
                BlockOutcome::Committed {
                    block_number,
                    first_entry,
                    total_entries,
                } => {
                    stats.committed_blocks += 1;
                    info!(
                        block = block_number,
                        first_entry,
                        total_entries,
                        "Committed block"
                    );
                }
                BlockOutcome::RolledBack {
                    block_number,
                    discarded,
                } => {
                    stats.rolled_back_blocks += 1;
                    info!(block = block_number, discarded, "Rolled back block");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!(
            committed = stats.committed_blocks,
            rolled_back = stats.rolled_back_blocks,
            "Producer stopped"
        );
        Ok(stats)
    }

    /// Produce one block as a single atomic unit
    pub async fn produce_block(&mut self) -> ServerResult<BlockOutcome> {
        let attempt = self.attempts;
        self.attempts += 1;
        let block_number = self.next_block;
        let payloads = build_block(block_number, self.config.max_transactions);

        self.server.start_atomic_op().await?;
        let first_entry = match self.add_entries(payloads).await {
            Ok(first_entry) => first_entry,
            Err(e) => {
                if let Err(rollback_err) = self.server.rollback_atomic_op().await {
                    warn!(error = %rollback_err, "Rollback after failed add also failed");
                }
                return Err(e);
            }
        };

        if self.should_roll_back(attempt) {
            let discarded = self.server.rollback_atomic_op().await?;
            return Ok(BlockOutcome::RolledBack {
                block_number,
                discarded,
            });
        }

        let header = self.server.commit_atomic_op().await?;
        self.next_block += 1;
        Ok(BlockOutcome::Committed {
            block_number,
            first_entry,
            total_entries: header.total_entries,
        })
    }

    async fn add_entries(&self, payloads: Vec<(EntryType, Bytes)>) -> ServerResult<u64> {
        let mut first_entry = None;
        for (entry_type, payload) in payloads {
            let provisional = self.server.add_stream_entry(entry_type, payload).await?;
            first_entry.get_or_insert(provisional.entry_number);
        }
        // build_block always yields at least three entries
        Ok(first_entry.unwrap_or_default())
    }

    fn should_roll_back(&self, attempt: u64) -> bool {
        match self.config.rollback_every {
            Some(every) if every > 0 => (attempt + 1) % every == 0,
            _ => false,
        }
    }
}

/// Payloads of one block, generated before any await
fn build_block(block_number: u64, max_transactions: usize) -> Vec<(EntryType, Bytes)> {
    let mut rng = rand::rng();
    let tx_count = rng.random_range(1..=max_transactions.max(1));

    let start = L2BlockStart {
        batch_number: block_number / BLOCKS_PER_BATCH,
        block_number,
        timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        global_exit_root: rng.random(),
        coinbase: COINBASE,
        fork_id: FORK_ID,
    };

    let mut payloads = Vec::with_capacity(tx_count + 2);
    payloads.push((L2_BLOCK_START, start.encode()));
    for _ in 0..tx_count {
        let mut encoded = vec![0u8; rng.random_range(16..=128)];
        rng.fill(&mut encoded[..]);
        let tx = L2Transaction {
            effective_gas_price_percentage: 255,
            is_valid: true,
            encoded: Bytes::from(encoded),
        };
        payloads.push((L2_TRANSACTION, tx.encode()));
    }
    let end = L2BlockEnd {
        block_hash: rng.random(),
        state_root: rng.random(),
    };
    payloads.push((L2_BLOCK_END, end.encode()));

    debug!(block = block_number, tx_count, "Built block");
    payloads
}

/// Block number of the last committed block start, scanning back from the tail
async fn last_block_number(server: &StreamServer) -> ServerResult<Option<u64>> {
    let mut entry_number = server.header().total_entries;
    while entry_number > 0 {
        entry_number -= 1;
        let entry = server.get_entry(entry_number).await?;
        if entry.entry_type == L2_BLOCK_START {
            return match L2BlockStart::decode(&entry.payload) {
                Ok(start) => Ok(Some(start.block_number)),
                Err(e) => {
                    warn!(entry_number, error = %e, "Undecodable block start, restarting at 0");
                    Ok(None)
                }
            };
        }
    }
    Ok(None)
}
