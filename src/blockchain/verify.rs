use std::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::block::{meets_difficulty, Block, GENESIS_PREVIOUS_HASH};
use super::chain::Ledger;
use super::storage::StorageError;

/// Why a block failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TamperReason {
    /// Stored hash differs from the recomputed digest
    HashMismatch,

    /// `previous_hash` differs from the predecessor's hash (or "0" for the first block)
    ChainBreak,

    /// Index is not the predecessor's index + 1 (or 0 for the first block)
    IndexGap,

    /// Hash does not satisfy the difficulty predicate
    InsufficientWork,

    /// Row cannot be decoded
    Unreadable,
}

impl fmt::Display for TamperReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TamperReason::HashMismatch => "stored hash does not match block contents",
            TamperReason::ChainBreak => "previous hash does not match preceding block",
            TamperReason::IndexGap => "block index is out of sequence",
            TamperReason::InsufficientWork => "hash does not satisfy the difficulty",
            TamperReason::Unreadable => "block cannot be decoded",
        };
        write!(f, "{}", text)
    }
}

/// Result of an integrity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    Valid,
    Tampered { at_index: u64, reason: TamperReason },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }
}

/// Checks a single block against its predecessor
fn check_block(block: &Block, previous: Option<&Block>, difficulty: usize) -> Option<TamperReason> {
    let expected_index = previous.map(|p| p.index + 1).unwrap_or(0);
    if block.index != expected_index {
        return Some(TamperReason::IndexGap);
    }

    if block.calculate_hash() != block.hash {
        return Some(TamperReason::HashMismatch);
    }

    let expected_previous = previous.map(|p| p.hash.as_str()).unwrap_or(GENESIS_PREVIOUS_HASH);
    if block.previous_hash != expected_previous {
        return Some(TamperReason::ChainBreak);
    }

    if !meets_difficulty(&block.hash, difficulty) {
        return Some(TamperReason::InsufficientWork);
    }

    None
}

/// Verifies a sequence of blocks, stopping at the first failure
///
/// # Arguments
///
/// * `blocks` - Blocks in storage order
/// * `difficulty` - Required leading zero hex digits
pub fn verify_chain<I>(blocks: I, difficulty: usize) -> Verification
where
    I: IntoIterator<Item = Result<Block, StorageError>>,
{
    let mut previous: Option<Block> = None;

    for entry in blocks {
        let expected_index = previous.as_ref().map(|p| p.index + 1).unwrap_or(0);

        let block = match entry {
            Ok(block) => block,
            Err(err) => {
                warn!("Block at position {} is unreadable: {}", expected_index, err);
                return Verification::Tampered {
                    at_index: expected_index,
                    reason: TamperReason::Unreadable,
                };
            }
        };

        if let Some(reason) = check_block(&block, previous.as_ref(), difficulty) {
            // A gap is reported where the missing block should be
            let at_index = match reason {
                TamperReason::IndexGap => expected_index,
                _ => block.index,
            };
            return Verification::Tampered { at_index, reason };
        }

        previous = Some(block);
    }

    Verification::Valid
}

impl Ledger {
    /// Recomputes the hash chain end to end
    pub fn verify(&self) -> Verification {
        let outcome = verify_chain(self.scan(), self.difficulty());

        match &outcome {
            Verification::Valid => info!("Ledger verified: {} blocks intact", self.len()),
            Verification::Tampered { at_index, reason } => {
                warn!("Ledger tampering detected at block {}: {}", at_index, reason)
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::{Payload, VoteRecord};
    use crate::blockchain::recorder::VoteRecorder;
    use chrono::Duration;

    fn populated() -> Ledger {
        let ledger = Ledger::in_memory(2).unwrap();
        ledger.bootstrap().unwrap();
        let recorder = VoteRecorder::new(ledger.clone());
        recorder.cast_vote("u1", "e1", "c1").unwrap();
        recorder.cast_vote("u2", "e1", "c2").unwrap();
        recorder.cast_vote("u3", "e1", "c1").unwrap();
        ledger
    }

    fn tamper(ledger: &Ledger, index: u64, edit: impl FnOnce(&mut Block)) {
        let mut block = ledger.get_block(index).unwrap().unwrap();
        edit(&mut block);
        ledger.storage().overwrite_block(&block).unwrap();
    }

    #[test]
    fn test_untouched_ledger_is_valid() {
        assert_eq!(populated().verify(), Verification::Valid);
    }

    #[test]
    fn test_empty_ledger_is_valid() {
        let ledger = Ledger::in_memory(2).unwrap();
        assert!(ledger.verify().is_valid());
    }

    #[test]
    fn test_edited_hash_is_detected() {
        let ledger = populated();
        tamper(&ledger, 2, |b| b.hash = "00".repeat(32));

        assert_eq!(
            ledger.verify(),
            Verification::Tampered { at_index: 2, reason: TamperReason::HashMismatch }
        );
    }

    #[test]
    fn test_edited_fields_are_detected_at_or_after_block() {
        let edits: Vec<Box<dyn Fn(&mut Block)>> = vec![
            Box::new(|b| b.nonce += 1),
            Box::new(|b| b.previous_hash = "ff".repeat(32)),
            Box::new(|b| b.timestamp = b.timestamp + Duration::seconds(1)),
            Box::new(|b| b.payload = Payload::VoteCast(VoteRecord::new("u2", "e1", "c1"))),
        ];

        for edit in edits {
            let ledger = populated();
            tamper(&ledger, 2, |b| edit(b));

            match ledger.verify() {
                Verification::Tampered { at_index, .. } => assert!(at_index >= 2),
                Verification::Valid => panic!("tampering went unnoticed"),
            }
        }
    }

    #[test]
    fn test_resealed_edit_breaks_successor_link() {
        let ledger = populated();
        let miner = crate::blockchain::miner::Miner::new(2);

        // Self-consistent edit that was not produced by append
        tamper(&ledger, 1, |b| {
            b.payload = Payload::VoteCast(VoteRecord::new("u1", "e1", "c2"));
            let seal = miner.seal(&b.timestamp, &b.payload, &b.previous_hash).unwrap();
            b.nonce = seal.nonce;
            b.hash = seal.hash;
        });

        assert_eq!(
            ledger.verify(),
            Verification::Tampered { at_index: 2, reason: TamperReason::ChainBreak }
        );
    }

    #[test]
    fn test_edited_genesis_link_is_detected() {
        let ledger = populated();
        tamper(&ledger, 0, |b| b.previous_hash = "1".to_string());

        assert_eq!(
            ledger.verify(),
            Verification::Tampered { at_index: 0, reason: TamperReason::HashMismatch }
        );
    }

    #[test]
    fn test_genesis_must_point_to_zero() {
        let ledger = populated();
        let miner = crate::blockchain::miner::Miner::new(2);

        // Valid work over a genesis that links to something other than "0"
        tamper(&ledger, 0, |b| {
            b.previous_hash = "1".to_string();
            let seal = miner.seal(&b.timestamp, &b.payload, &b.previous_hash).unwrap();
            b.nonce = seal.nonce;
            b.hash = seal.hash;
        });

        assert_eq!(
            ledger.verify(),
            Verification::Tampered { at_index: 0, reason: TamperReason::ChainBreak }
        );
    }

    #[test]
    fn test_unreadable_row_is_reported() {
        let ledger = populated();
        ledger.storage().overwrite_raw(2, b"not a block").unwrap();

        assert_eq!(
            ledger.verify(),
            Verification::Tampered { at_index: 2, reason: TamperReason::Unreadable }
        );
    }

    #[test]
    fn test_verify_chain_reports_gaps_and_weak_hashes() {
        let chain = populated().get_chain().unwrap();

        let without_second: Vec<_> = chain.iter().cloned().filter(|b| b.index != 1).map(Ok).collect();
        assert_eq!(
            verify_chain(without_second, 2),
            Verification::Tampered { at_index: 1, reason: TamperReason::IndexGap }
        );

        let stricter = verify_chain(chain.iter().cloned().map(Ok), 64);
        assert_eq!(
            stricter,
            Verification::Tampered { at_index: 0, reason: TamperReason::InsufficientWork }
        );
    }
}
