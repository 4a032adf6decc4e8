use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::block::Block;
use super::chain::{Ledger, LedgerError};
use crate::registry::Registry;

/// Vote counts of one election
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionTally {
    pub total_votes: u64,

    /// Votes per candidate id; only candidates with at least one vote
    pub candidates: BTreeMap<String, u64>,
}

/// Vote counts of every election, keyed by election id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub elections: BTreeMap<String, ElectionTally>,
}

/// A candidate's result with its display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CandidateResult {
    pub id: String,
    pub name: String,
    pub votes: u64,
}

/// An election's result with display names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ElectionResult {
    pub id: String,
    pub name: String,
    pub total_votes: u64,

    /// Sorted by votes descending, ties by id
    pub candidates: Vec<CandidateResult>,
}

impl Tally {
    /// Counts votes from blocks in index order
    ///
    /// Blocks whose payload is not a vote (genesis, unrecognized content)
    /// are skipped.
    pub fn from_blocks<I: IntoIterator<Item = Block>>(blocks: I) -> Self {
        let mut tally = Tally::default();

        for block in blocks {
            if let Some(vote) = block.payload.as_vote() {
                let election = tally.elections.entry(vote.election_id.clone()).or_default();
                election.total_votes += 1;
                *election.candidates.entry(vote.candidate_id.clone()).or_insert(0) += 1;
            }
        }

        tally
    }

    pub fn election(&self, election_id: &str) -> Option<&ElectionTally> {
        self.elections.get(election_id)
    }

    pub fn total_votes(&self) -> u64 {
        self.elections.values().map(|e| e.total_votes).sum()
    }

    /// Joins the counts with names from the registry
    pub fn results(&self, registry: &Registry) -> Vec<ElectionResult> {
        self.elections
            .iter()
            .map(|(id, counts)| election_result(id, counts, registry))
            .collect()
    }

    /// Named result of a single election, if it received any vote
    pub fn election_result(&self, election_id: &str, registry: &Registry) -> Option<ElectionResult> {
        self.elections
            .get(election_id)
            .map(|counts| election_result(election_id, counts, registry))
    }
}

fn election_result(id: &str, counts: &ElectionTally, registry: &Registry) -> ElectionResult {
    let mut candidates: Vec<CandidateResult> = counts
        .candidates
        .iter()
        .map(|(candidate_id, votes)| CandidateResult {
            id: candidate_id.clone(),
            name: registry.candidate_name(candidate_id),
            votes: *votes,
        })
        .collect();
    candidates.sort_by(|a, b| b.votes.cmp(&a.votes).then_with(|| a.id.cmp(&b.id)));

    ElectionResult {
        id: id.to_string(),
        name: registry.election_name(id),
        total_votes: counts.total_votes,
        candidates,
    }
}

impl Ledger {
    /// Replays the whole ledger and counts votes
    ///
    /// Rows that cannot be decoded are skipped with a warning; the
    /// integrity verifier is the place where they are reported.
    pub fn tally(&self) -> Result<Tally, LedgerError> {
        let blocks = self.scan().filter_map(|entry| match entry {
            Ok(block) => Some(block),
            Err(err) => {
                warn!("Skipping unreadable block while tallying: {}", err);
                None
            }
        });

        Ok(Tally::from_blocks(blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::{Payload, VoteRecord};
    use crate::blockchain::recorder::VoteRecorder;
    use crate::registry::{Candidate, Election};
    use chrono::Utc;

    fn vote_block(index: u64, voter: &str, election: &str, candidate: &str) -> Block {
        Block {
            index,
            timestamp: Utc::now(),
            payload: Payload::VoteCast(VoteRecord::new(voter, election, candidate)),
            previous_hash: String::new(),
            nonce: 0,
            hash: String::new(),
        }
    }

    #[test]
    fn test_tally_counts_votes_per_candidate() {
        let recorder = VoteRecorder::new(Ledger::in_memory(1).unwrap());
        recorder.ledger().bootstrap().unwrap();

        recorder.cast_vote("u1", "e1", "c1").unwrap();
        recorder.cast_vote("u2", "e1", "c1").unwrap();
        recorder.cast_vote("u3", "e1", "c2").unwrap();

        let tally = recorder.ledger().tally().unwrap();
        let e1 = tally.election("e1").unwrap();

        assert_eq!(e1.total_votes, 3);
        assert_eq!(e1.candidates.get("c1"), Some(&2));
        assert_eq!(e1.candidates.get("c2"), Some(&1));
        assert_eq!(tally.elections.len(), 1);
    }

    #[test]
    fn test_tally_skips_non_vote_payloads() {
        let mut genesis = vote_block(0, "x", "x", "x");
        genesis.payload = Payload::Genesis;
        let mut junk = vote_block(2, "x", "x", "x");
        junk.payload = Payload::Unrecognized("{\"election_id\":5}".to_string());

        let tally = Tally::from_blocks(vec![genesis, vote_block(1, "u1", "e1", "c1"), junk]);

        assert_eq!(tally.total_votes(), 1);
        assert!(tally.election("x").is_none());
    }

    #[test]
    fn test_empty_ledger_tallies_nothing() {
        let ledger = Ledger::in_memory(1).unwrap();
        assert_eq!(ledger.tally().unwrap(), Tally::default());
    }

    #[test]
    fn test_results_use_registry_names_and_fallbacks() {
        let registry = Registry::new();
        registry.add_election(Election {
            id: "e1".to_string(),
            name: "Board".to_string(),
        });
        registry.add_candidate(Candidate {
            id: "c1".to_string(),
            election_id: "e1".to_string(),
            name: "Ada".to_string(),
        });

        let tally = Tally::from_blocks(vec![
            vote_block(1, "u1", "e1", "c9"),
            vote_block(2, "u2", "e1", "c1"),
            vote_block(3, "u3", "e1", "c1"),
            vote_block(4, "u4", "e2", "c3"),
        ]);

        let results = tally.results(&registry);
        assert_eq!(results.len(), 2);

        let board = &results[0];
        assert_eq!(board.name, "Board");
        assert_eq!(board.total_votes, 3);
        assert_eq!(board.candidates[0].name, "Ada");
        assert_eq!(board.candidates[0].votes, 2);
        assert_eq!(board.candidates[1].name, "Candidate c9");

        let other = tally.election_result("e2", &registry).unwrap();
        assert_eq!(other.name, "Election e2");
        assert!(tally.election_result("e3", &registry).is_none());
    }
}
