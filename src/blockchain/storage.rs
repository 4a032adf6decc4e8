use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::block::{Block, Payload, VoteRecord, GENESIS_PREVIOUS_HASH};

const TIP_HASH_KEY: &str = "tip_hash";
const TIP_INDEX_KEY: &str = "tip_index";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Row layout of a block in the `blocks` tree
///
/// The payload is kept as its canonical JSON text, exactly the bytes that
/// were hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
}

impl From<&Block> for BlockRecord {
    fn from(block: &Block) -> Self {
        BlockRecord {
            index: block.index,
            timestamp: block.timestamp,
            payload: block.payload.encode(),
            previous_hash: block.previous_hash.clone(),
            hash: block.hash.clone(),
            nonce: block.nonce,
        }
    }
}

impl From<BlockRecord> for Block {
    fn from(record: BlockRecord) -> Self {
        Block {
            index: record.index,
            timestamp: record.timestamp,
            payload: Payload::decode(&record.payload),
            previous_hash: record.previous_hash,
            nonce: record.nonce,
            hash: record.hash,
        }
    }
}

/// Outcome of an attempt to commit a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The block (and vote marker, if any) was written
    Committed,

    /// The voter already has a recorded vote in this election
    AlreadyVoted,

    /// The chain tip moved since the block was mined
    StaleTip { actual: String },
}

// Reasons a commit transaction aborts without writing
#[derive(Debug)]
enum Rejection {
    AlreadyVoted,
    StaleTip(String),
}

/// Durable storage for the ledger
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian index
    blocks: Tree,

    /// Vote markers keyed by "{election_id}/{voter_id}"
    votes: Tree,

    /// Chain tip metadata
    metadata: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

fn block_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn vote_key(election_id: &str, voter_id: &str) -> String {
    format!("{}/{}", election_id, voter_id)
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<Block, StorageError> {
    let key_index = <[u8; 8]>::try_from(key).map(u64::from_be_bytes).ok();
    let record: BlockRecord = bincode::deserialize(value).map_err(|e| {
        let row = match key_index {
            Some(index) => index.to_string(),
            None => format!("{:?}", key),
        };
        StorageError::Corrupt(format!("block row {} cannot be decoded: {}", row, e))
    })?;

    if key_index != Some(record.index) {
        return Err(StorageError::Corrupt(format!(
            "block row keyed {:?} claims index {}",
            key_index, record.index
        )));
    }

    Ok(record.into())
}

impl BlockchainStorage {
    /// Opens (or creates) the ledger database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a database that is removed when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let votes = db.open_tree("votes")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            votes,
            metadata,
        })
    }

    /// Gets a block by its index
    pub fn get_block(&self, index: u64) -> Result<Option<Block>, StorageError> {
        let key = block_key(index);
        match self.blocks.get(key)? {
            Some(value) => decode_record(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Gets the block with the highest index
    pub fn last_block(&self) -> Result<Option<Block>, StorageError> {
        match self.blocks.last()? {
            Some((key, value)) => decode_record(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Iterates over all blocks in ascending index order
    ///
    /// The iterator is lazy; every row is visible either completely or not
    /// at all since rows are only written inside transactions.
    pub fn iter_blocks(&self) -> impl Iterator<Item = Result<Block, StorageError>> {
        self.blocks.iter().map(|entry| {
            let (key, value) = entry?;
            decode_record(&key, &value)
        })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Checks whether a vote marker exists for the pair
    pub fn has_vote(&self, election_id: &str, voter_id: &str) -> Result<bool, StorageError> {
        Ok(self.votes.contains_key(vote_key(election_id, voter_id))?)
    }

    /// Writes a block in a single transaction
    ///
    /// The transaction checks that the stored tip hash still equals
    /// `block.previous_hash` and, when `vote` is given, that no marker exists
    /// for its (voter, election) pair. The marker, the block row and the tip
    /// metadata are then written together or not at all.
    ///
    /// # Arguments
    ///
    /// * `block` - The sealed block to persist
    /// * `vote` - The vote whose marker is recorded with the block
    pub fn commit_block(&self, block: &Block, vote: Option<&VoteRecord>) -> Result<CommitOutcome, StorageError> {
        let row = bincode::serialize(&BlockRecord::from(block))
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let key = block_key(block.index);
        let marker = vote.map(|v| vote_key(&v.election_id, &v.voter_id));

        let result = (&self.blocks, &self.votes, &self.metadata).transaction(
            |(blocks, votes, metadata)| -> ConflictableTransactionResult<(), Rejection> {
                if let Some(marker) = &marker {
                    if votes.get(marker.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(Rejection::AlreadyVoted));
                    }
                }

                let tip_hash = match metadata.get(TIP_HASH_KEY)? {
                    Some(hash) => String::from_utf8_lossy(&hash).to_string(),
                    None => GENESIS_PREVIOUS_HASH.to_string(),
                };
                let next_index = match metadata.get(TIP_INDEX_KEY)? {
                    Some(bytes) => <[u8; 8]>::try_from(bytes.as_ref())
                        .map(|b| u64::from_be_bytes(b).saturating_add(1))
                        .unwrap_or(u64::MAX),
                    None => 0,
                };

                if tip_hash != block.previous_hash || next_index != block.index {
                    return Err(ConflictableTransactionError::Abort(Rejection::StaleTip(tip_hash)));
                }

                // Marker value is the index of the block holding the vote
                if let Some(marker) = &marker {
                    votes.insert(marker.as_bytes(), &key[..])?;
                }
                blocks.insert(&key[..], row.as_slice())?;
                metadata.insert(TIP_HASH_KEY, block.hash.as_bytes())?;
                metadata.insert(TIP_INDEX_KEY, &key[..])?;

                Ok(())
            },
        );

        match result {
            Ok(()) => Ok(CommitOutcome::Committed),
            Err(TransactionError::Abort(Rejection::AlreadyVoted)) => Ok(CommitOutcome::AlreadyVoted),
            Err(TransactionError::Abort(Rejection::StaleTip(actual))) => Ok(CommitOutcome::StaleTip { actual }),
            Err(TransactionError::Storage(e)) => Err(StorageError::DatabaseError(e)),
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// Overwrites a stored row directly, bypassing every ledger check.
    /// Only tests use this, to simulate tampering with the database.
    #[cfg(test)]
    pub fn overwrite_block(&self, block: &Block) -> Result<(), StorageError> {
        let row = bincode::serialize(&BlockRecord::from(block))
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.blocks.insert(block_key(block.index), row)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn overwrite_raw(&self, index: u64, bytes: &[u8]) -> Result<(), StorageError> {
        self.blocks.insert(block_key(index), bytes)?;
        Ok(())
    }
}
