use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;

use super::block::{block_timestamp, Block, Payload, VoteRecord, GENESIS_PREVIOUS_HASH};
use super::miner::{Miner, MiningError};
use super::storage::{BlockchainStorage, CommitOutcome, StorageError};

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Voter {voter_id} has already voted in election {election_id}")]
    AlreadyVoted { voter_id: String, election_id: String },

    #[error("Chain tip moved: expected {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Mining error: {0}")]
    Mining(#[from] MiningError),

    #[error("System error: {0}")]
    System(String),
}

/// Append-only, hash-linked block store
///
/// Cloning is cheap; clones share the same database and append lock.
#[derive(Debug, Clone)]
pub struct Ledger {
    /// Durable block storage
    storage: Arc<BlockchainStorage>,

    /// Seals new blocks
    miner: Miner,

    /// Serializes the compare-and-append step of every write
    append_lock: Arc<Mutex<()>>,
}

impl Ledger {
    /// Creates a ledger over the given storage
    ///
    /// # Arguments
    ///
    /// * `storage` - The block storage
    /// * `difficulty` - Number of leading zero hex digits required in block hashes
    pub fn new(storage: BlockchainStorage, difficulty: usize) -> Self {
        Ledger {
            storage: Arc::new(storage),
            miner: Miner::new(difficulty),
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Opens a ledger persisted under `path`
    pub fn with_storage<P: AsRef<Path>>(path: P, difficulty: usize) -> Result<Self, LedgerError> {
        let storage = BlockchainStorage::new(path)?;
        Ok(Self::new(storage, difficulty))
    }

    /// Opens a ledger backed by a temporary database
    pub fn in_memory(difficulty: usize) -> Result<Self, LedgerError> {
        let storage = BlockchainStorage::temporary()?;
        Ok(Self::new(storage, difficulty))
    }

    pub fn difficulty(&self) -> usize {
        self.miner.difficulty()
    }

    /// Flag that abandons in-flight mining when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.miner.shutdown_handle()
    }

    /// Creates the genesis block if the ledger is empty
    ///
    /// # Returns
    ///
    /// The genesis block if one was created by this call
    pub fn bootstrap(&self) -> Result<Option<Block>, LedgerError> {
        if !self.storage.is_empty() {
            debug!("Ledger already has {} blocks, skipping genesis", self.storage.block_count());
            return Ok(None);
        }

        match self.append(GENESIS_PREVIOUS_HASH, Utc::now(), Payload::Genesis) {
            Ok(block) => {
                info!("Genesis block created with hash {}", block.hash);
                Ok(Some(block))
            }
            // Someone else created the genesis block first
            Err(LedgerError::Conflict { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Gets the block with the highest index
    pub fn tip(&self) -> Result<Option<Block>, LedgerError> {
        Ok(self.storage.last_block()?)
    }

    /// Gets a block by index
    pub fn get_block(&self, index: u64) -> Result<Option<Block>, LedgerError> {
        Ok(self.storage.get_block(index)?)
    }

    /// Lazily iterates over blocks in ascending index order
    pub fn scan(&self) -> impl Iterator<Item = Result<Block, StorageError>> {
        self.storage.iter_blocks()
    }

    /// Collects the whole chain
    pub fn get_chain(&self) -> Result<Vec<Block>, LedgerError> {
        let chain = self.scan().collect::<Result<Vec<_>, _>>()?;
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.storage.block_count()
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &BlockchainStorage {
        &self.storage
    }

    /// Checks whether a vote marker exists for the pair
    pub fn has_vote(&self, voter_id: &str, election_id: &str) -> Result<bool, LedgerError> {
        Ok(self.storage.has_vote(election_id, voter_id)?)
    }

    /// Mines and persists a block on top of `previous_hash_expected`
    ///
    /// # Arguments
    ///
    /// * `previous_hash_expected` - The tip hash the caller read; "0" for an empty ledger
    /// * `timestamp` - The block timestamp
    /// * `payload` - The block content
    ///
    /// # Returns
    ///
    /// The new block, or `LedgerError::Conflict` if the tip is no longer
    /// `previous_hash_expected`
    pub fn append(
        &self,
        previous_hash_expected: &str,
        timestamp: DateTime<Utc>,
        payload: Payload,
    ) -> Result<Block, LedgerError> {
        let index = match self.tip()? {
            Some(tip) if tip.hash == previous_hash_expected => tip.index + 1,
            None if previous_hash_expected == GENESIS_PREVIOUS_HASH => 0,
            tip => {
                return Err(LedgerError::Conflict {
                    expected: previous_hash_expected.to_string(),
                    actual: tip.map(|b| b.hash).unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string()),
                })
            }
        };

        let block = self.seal(index, timestamp, payload, previous_hash_expected)?;
        self.commit(block, None)
    }

    /// Mines a block extending the current tip
    pub(crate) fn seal_next(&self, payload: Payload) -> Result<Block, LedgerError> {
        let (index, previous_hash) = match self.tip()? {
            Some(tip) => (tip.index + 1, tip.hash),
            None => (0, GENESIS_PREVIOUS_HASH.to_string()),
        };

        self.seal(index, Utc::now(), payload, &previous_hash)
    }

    fn seal(
        &self,
        index: u64,
        timestamp: DateTime<Utc>,
        payload: Payload,
        previous_hash: &str,
    ) -> Result<Block, LedgerError> {
        let timestamp = block_timestamp(timestamp);
        let seal = self.miner.seal(&timestamp, &payload, previous_hash)?;

        Ok(Block {
            index,
            timestamp,
            payload,
            previous_hash: previous_hash.to_string(),
            nonce: seal.nonce,
            hash: seal.hash,
        })
    }

    /// Persists a sealed block under the append lock
    ///
    /// When `vote` is given its marker is written in the same transaction.
    pub(crate) fn commit(&self, block: Block, vote: Option<&VoteRecord>) -> Result<Block, LedgerError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| LedgerError::System("append lock poisoned".to_string()))?;

        match self.storage.commit_block(&block, vote)? {
            CommitOutcome::Committed => {}
            CommitOutcome::AlreadyVoted => {
                let vote = vote.ok_or_else(|| LedgerError::System("vote rejection without a vote".to_string()))?;
                return Err(LedgerError::AlreadyVoted {
                    voter_id: vote.voter_id.clone(),
                    election_id: vote.election_id.clone(),
                });
            }
            CommitOutcome::StaleTip { actual } => {
                warn!("Block {} was mined against a stale tip {}", block.index, block.previous_hash);
                return Err(LedgerError::Conflict {
                    expected: block.previous_hash.clone(),
                    actual,
                });
            }
        }

        let block = settle_flush(block, self.storage.flush());
        info!("Appended block {} (nonce {}, hash {})", block.index, block.nonce, block.hash);

        Ok(block)
    }
}

// The transaction is already committed once flush runs, so a failed flush
// must not turn the append into an error: a retry would see the vote marker.
fn settle_flush(block: Block, flushed: Result<(), StorageError>) -> Block {
    if let Err(err) = flushed {
        error!("Block {} is committed but could not be flushed to disk: {}", block.index, err);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::meets_difficulty;

    fn ledger() -> Ledger {
        let ledger = Ledger::in_memory(2).unwrap();
        ledger.bootstrap().unwrap();
        ledger
    }

    #[test]
    fn test_bootstrap_creates_genesis() {
        let ledger = Ledger::in_memory(2).unwrap();
        let genesis = ledger.bootstrap().unwrap().unwrap();

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, "0");
        assert_eq!(genesis.payload, Payload::Genesis);
        assert!(meets_difficulty(&genesis.hash, 2));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let ledger = ledger();

        assert!(ledger.bootstrap().unwrap().is_none());
        assert!(ledger.bootstrap().unwrap().is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_append_links_to_tip() {
        let ledger = ledger();
        let genesis = ledger.tip().unwrap().unwrap();

        let payload = Payload::VoteCast(VoteRecord::new("u1", "e1", "c1"));
        let block = ledger.append(&genesis.hash, Utc::now(), payload).unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, genesis.hash);
        assert_eq!(block.hash, block.calculate_hash());
        assert!(block.hash.starts_with("00"));
        assert_eq!(ledger.tip().unwrap(), Some(block));
    }

    #[test]
    fn test_failed_flush_still_returns_committed_block() {
        let ledger = ledger();
        let block = ledger.seal_next(Payload::VoteCast(VoteRecord::new("u1", "e1", "c1"))).unwrap();

        let settled = settle_flush(block.clone(), Err(StorageError::Corrupt("disk full".to_string())));
        assert_eq!(settled, block);
    }

    #[test]
    fn test_append_with_stale_tip_conflicts() {
        let ledger = ledger();
        let genesis = ledger.tip().unwrap().unwrap();

        ledger.append(&genesis.hash, Utc::now(), Payload::Genesis).unwrap();
        let result = ledger.append(&genesis.hash, Utc::now(), Payload::Genesis);

        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_commit_of_block_mined_on_old_tip_conflicts() {
        let ledger = ledger();

        // Mined against genesis, then overtaken by another append
        let late = ledger.seal_next(Payload::Genesis).unwrap();
        let genesis = ledger.tip().unwrap().unwrap();
        ledger.append(&genesis.hash, Utc::now(), Payload::Genesis).unwrap();

        let result = ledger.commit(late, None);

        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_scan_is_ordered_and_gap_free() {
        let ledger = ledger();
        for i in 0..5 {
            let tip = ledger.tip().unwrap().unwrap();
            let payload = Payload::VoteCast(VoteRecord::new(&format!("u{}", i), "e1", "c1"));
            ledger.append(&tip.hash, Utc::now(), payload).unwrap();
        }

        let chain = ledger.get_chain().unwrap();
        assert_eq!(chain.len(), 6);
        for (position, block) in chain.iter().enumerate() {
            assert_eq!(block.index, position as u64);
            if position > 0 {
                assert_eq!(block.previous_hash, chain[position - 1].hash);
            }
        }
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let first_hash = {
            let ledger = Ledger::with_storage(dir.path(), 1).unwrap();
            ledger.bootstrap().unwrap().unwrap().hash
        };

        let reopened = Ledger::with_storage(dir.path(), 1).unwrap();
        assert!(reopened.bootstrap().unwrap().is_none());
        assert_eq!(reopened.tip().unwrap().unwrap().hash, first_hash);
    }
}
