// Blockchain module
//
// This module contains the vote ledger implementation including:
// - Block structure and hashing
// - Proof of work miner
// - Durable block storage
// - Ledger (append / tip / scan)
// - Vote recording
// - Tallying and integrity verification

pub mod block;
pub mod chain;
pub mod miner;
pub mod recorder;
pub mod storage;
pub mod tally;
pub mod verify;

// Re-export main components for easier access
pub use block::{Block, VoteRecord};
pub use chain::{Ledger, LedgerError};
pub use recorder::VoteRecorder;
pub use tally::ElectionResult;
pub use verify::{TamperReason, Verification};
