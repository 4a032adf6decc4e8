use std::fs;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Errors that can occur while loading the registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse registry file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Candidate {candidate_id} refers to unknown election {election_id}")]
    UnknownElection { candidate_id: String, election_id: String },
}

/// An election as known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Election {
    pub id: String,
    pub name: String,
}

/// A candidate standing in exactly one election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Candidate {
    pub id: String,
    pub election_id: String,
    pub name: String,
}

/// File layout used to seed the registry
#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    elections: Vec<Election>,

    #[serde(default)]
    candidates: Vec<Candidate>,
}

/// Election and candidate names, consulted for display only
///
/// The ledger never depends on this for correctness.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    elections: Arc<DashMap<String, Election>>,
    candidates: Arc<DashMap<String, Candidate>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads elections and candidates from a JSON file
    ///
    /// ```json
    /// { "elections": [{ "id": "e1", "name": "Board" }],
    ///   "candidates": [{ "id": "c1", "election_id": "e1", "name": "Ada" }] }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_json::from_str(text)?;
        let registry = Registry::new();

        for election in file.elections {
            registry.add_election(election);
        }

        for candidate in file.candidates {
            if !registry.elections.contains_key(&candidate.election_id) {
                return Err(RegistryError::UnknownElection {
                    candidate_id: candidate.id,
                    election_id: candidate.election_id,
                });
            }
            registry.add_candidate(candidate);
        }

        Ok(registry)
    }

    pub fn add_election(&self, election: Election) {
        self.elections.insert(election.id.clone(), election);
    }

    pub fn add_candidate(&self, candidate: Candidate) {
        self.candidates.insert(candidate.id.clone(), candidate);
    }

    pub fn election(&self, id: &str) -> Option<Election> {
        self.elections.get(id).map(|entry| entry.value().clone())
    }

    pub fn candidate(&self, id: &str) -> Option<Candidate> {
        self.candidates.get(id).map(|entry| entry.value().clone())
    }

    /// Display name of an election, `Election {id}` if unknown
    pub fn election_name(&self, id: &str) -> String {
        self.election(id)
            .map(|e| e.name)
            .unwrap_or_else(|| format!("Election {}", id))
    }

    /// Display name of a candidate, `Candidate {id}` if unknown
    pub fn candidate_name(&self, id: &str) -> String {
        self.candidate(id)
            .map(|c| c.name)
            .unwrap_or_else(|| format!("Candidate {}", id))
    }

    /// Returns false only when the registry knows the candidate and it
    /// belongs to another election
    pub fn candidate_may_stand_in(&self, candidate_id: &str, election_id: &str) -> bool {
        match self.candidate(candidate_id) {
            Some(candidate) => candidate.election_id == election_id,
            None => true,
        }
    }

    pub fn elections(&self) -> Vec<Election> {
        let mut elections: Vec<Election> = self.elections.iter().map(|e| e.value().clone()).collect();
        elections.sort_by(|a, b| a.id.cmp(&b.id));
        elections
    }
}
