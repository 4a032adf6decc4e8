use log::{info, warn};

use super::block::{Block, Payload, VoteRecord};
use super::chain::{Ledger, LedgerError};

/// Longest accepted identifier
pub const MAX_ID_LEN: usize = 64;

/// Default number of re-mining attempts after the tip moves
pub const DEFAULT_APPEND_RETRIES: usize = 5;

/// Checks that an identifier is non-empty, bounded and made of
/// `[A-Za-z0-9_-]` only.
pub fn validate_id(kind: &str, id: &str) -> Result<(), LedgerError> {
    if id.is_empty() {
        return Err(LedgerError::Validation(format!("{} must not be empty", kind)));
    }

    if id.len() > MAX_ID_LEN {
        return Err(LedgerError::Validation(format!(
            "{} is longer than {} characters",
            kind, MAX_ID_LEN
        )));
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(LedgerError::Validation(format!("{} contains invalid characters: {:?}", kind, id)));
    }

    Ok(())
}

/// Records votes, at most one per (voter, election)
#[derive(Debug, Clone)]
pub struct VoteRecorder {
    ledger: Ledger,
    max_attempts: usize,
}

impl VoteRecorder {
    pub fn new(ledger: Ledger) -> Self {
        Self::with_retries(ledger, DEFAULT_APPEND_RETRIES)
    }

    /// # Arguments
    ///
    /// * `ledger` - The ledger votes are appended to
    /// * `max_attempts` - How many times a vote is mined before a tip conflict is surfaced
    pub fn with_retries(ledger: Ledger, max_attempts: usize) -> Self {
        VoteRecorder {
            ledger,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Checks whether the voter already voted in the election
    pub fn has_voted(&self, voter_id: &str, election_id: &str) -> Result<bool, LedgerError> {
        self.ledger.has_vote(voter_id, election_id)
    }

    /// Casts a vote
    ///
    /// The block is mined outside the append lock. The duplicate check, the
    /// vote marker and the block row are then committed as one transaction,
    /// so two concurrent casts for the same pair yield exactly one block.
    ///
    /// # Returns
    ///
    /// The appended vote block
    pub fn cast_vote(&self, voter_id: &str, election_id: &str, candidate_id: &str) -> Result<Block, LedgerError> {
        validate_id("voter_id", voter_id)?;
        validate_id("election_id", election_id)?;
        validate_id("candidate_id", candidate_id)?;

        let vote = VoteRecord::new(voter_id, election_id, candidate_id);
        let mut attempt = 0;

        loop {
            attempt += 1;

            // Cheap early rejection; the commit transaction re-checks
            if self.ledger.has_vote(voter_id, election_id)? {
                return Err(already_voted(&vote));
            }

            let block = self.ledger.seal_next(Payload::VoteCast(vote.clone()))?;

            match self.ledger.commit(block, Some(&vote)) {
                Ok(block) => {
                    info!(
                        "Recorded vote of {} in election {} as block {}",
                        voter_id, election_id, block.index
                    );
                    return Ok(block);
                }
                Err(LedgerError::AlreadyVoted { .. }) => {
                    warn!("Rejected duplicate vote of {} in election {}", voter_id, election_id);
                    return Err(already_voted(&vote));
                }
                Err(LedgerError::Conflict { .. }) if attempt < self.max_attempts => {
                    warn!(
                        "Tip moved while sealing vote of {} (attempt {}/{}), retrying",
                        voter_id, attempt, self.max_attempts
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn already_voted(vote: &VoteRecord) -> LedgerError {
    LedgerError::AlreadyVoted {
        voter_id: vote.voter_id.clone(),
        election_id: vote.election_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn recorder() -> VoteRecorder {
        let ledger = Ledger::in_memory(2).unwrap();
        ledger.bootstrap().unwrap();
        VoteRecorder::with_retries(ledger, 50)
    }

    #[test]
    fn test_cast_vote_appends_block() {
        let recorder = recorder();

        let block = recorder.cast_vote("u1", "e1", "c1").unwrap();

        assert_eq!(block.index, 1);
        assert_eq!(block.payload, Payload::VoteCast(VoteRecord::new("u1", "e1", "c1")));
        assert!(recorder.has_voted("u1", "e1").unwrap());
        assert!(!recorder.has_voted("u1", "e2").unwrap());
    }

    #[test]
    fn test_second_vote_in_same_election_is_rejected() {
        let recorder = recorder();
        recorder.cast_vote("u1", "e1", "c1").unwrap();

        let result = recorder.cast_vote("u1", "e1", "c2");

        assert!(matches!(result, Err(LedgerError::AlreadyVoted { .. })));
        assert_eq!(recorder.ledger().len(), 2);
    }

    #[test]
    fn test_same_voter_may_vote_in_other_elections() {
        let recorder = recorder();

        recorder.cast_vote("u1", "e1", "c1").unwrap();
        recorder.cast_vote("u1", "e2", "c7").unwrap();

        assert_eq!(recorder.ledger().len(), 3);
    }

    #[test]
    fn test_malformed_identifiers_are_rejected() {
        let recorder = recorder();

        for (voter, election, candidate) in [
            ("u1", "", "c1"),
            ("u1", "e1", ""),
            ("u1", "e/1", "c1"),
            ("", "e1", "c1"),
            ("u1", "e1", "c 1"),
        ] {
            let result = recorder.cast_vote(voter, election, candidate);
            assert!(matches!(result, Err(LedgerError::Validation(_))), "{:?}", (voter, election, candidate));
        }

        let too_long = "x".repeat(MAX_ID_LEN + 1);
        assert!(recorder.cast_vote("u1", &too_long, "c1").is_err());
        assert_eq!(recorder.ledger().len(), 1);
    }

    #[test]
    fn test_concurrent_duplicate_votes_yield_one_block() {
        let recorder = recorder();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["c1", "c2"]
            .into_iter()
            .map(|candidate| {
                let recorder = recorder.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    recorder.cast_vote("u1", "e1", candidate)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(LedgerError::AlreadyVoted { .. })))
                .count(),
            1
        );
        assert_eq!(recorder.ledger().len(), 2);
    }

    #[test]
    fn test_concurrent_distinct_voters_all_succeed() {
        let recorder = recorder();
        let voters = 8;
        let barrier = Arc::new(Barrier::new(voters));

        let handles: Vec<_> = (0..voters)
            .map(|i| {
                let recorder = recorder.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    recorder.cast_vote(&format!("u{}", i), "e1", "c1")
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let chain = recorder.ledger().get_chain().unwrap();
        assert_eq!(chain.len(), voters + 1);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].hash);
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
    }
}
