use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use thiserror::Error;

use super::block::{digest, meets_difficulty, Payload};

/// Errors that can occur while mining
#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Mining interrupted by shutdown after {attempts} attempts")]
    Interrupted { attempts: u64 },
}

/// Result of a successful nonce search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seal {
    pub nonce: u64,
    pub hash: String,
}

/// Proof of work miner
///
/// The search is pure apart from reading the shutdown flag, so it can run
/// outside any lock.
#[derive(Debug, Clone)]
pub struct Miner {
    /// Number of leading zero hex digits required in a block hash
    difficulty: usize,

    /// Set at process shutdown to abandon an in-flight search
    shutdown: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(difficulty: usize) -> Self {
        Miner {
            difficulty,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Returns the flag that interrupts mining when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Searches for the first nonce whose digest satisfies the difficulty
    ///
    /// # Arguments
    ///
    /// * `timestamp` - The block timestamp
    /// * `payload` - The block payload
    /// * `previous_hash` - The hash of the block being extended
    ///
    /// # Returns
    ///
    /// The nonce and the matching hash
    pub fn seal(
        &self,
        timestamp: &DateTime<Utc>,
        payload: &Payload,
        previous_hash: &str,
    ) -> Result<Seal, MiningError> {
        let mut nonce = 0;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                warn!("Nonce search abandoned at shutdown after {} attempts", nonce);
                return Err(MiningError::Interrupted { attempts: nonce });
            }

            let hash = digest(timestamp, payload, previous_hash, nonce);
            if meets_difficulty(&hash, self.difficulty) {
                return Ok(Seal { nonce, hash });
            }

            nonce += 1;
        }
    }
}
