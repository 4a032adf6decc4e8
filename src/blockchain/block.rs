use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

/// Sentinel stored as `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// A single vote as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VoteRecord {
    /// Authenticated voter casting the vote
    pub voter_id: String,

    /// Election the vote belongs to
    pub election_id: String,

    /// Candidate chosen by the voter
    pub candidate_id: String,
}

impl VoteRecord {
    pub fn new(voter_id: &str, election_id: &str, candidate_id: &str) -> Self {
        VoteRecord {
            voter_id: voter_id.to_string(),
            election_id: election_id.to_string(),
            candidate_id: candidate_id.to_string(),
        }
    }
}

const GENESIS_PAYLOAD: &str = r#"{"genesis":true}"#;

// Field order here is the key order of the encoded vote
#[derive(Serialize)]
struct CanonicalVote<'a> {
    candidate_id: &'a str,
    election_id: &'a str,
    voter_id: &'a str,
}

/// Content carried by a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Marker of the first block in the ledger
    Genesis,

    /// A cast vote
    VoteCast(VoteRecord),

    /// Stored content that is not a known variant in canonical form.
    /// Kept verbatim so the block hash can still be recomputed.
    Unrecognized(String),
}

impl Payload {
    /// Encodes the payload into its canonical JSON text.
    ///
    /// Object keys are emitted in sorted order so the same logical content
    /// always yields the same bytes.
    pub fn encode(&self) -> String {
        match self {
            Payload::Genesis => GENESIS_PAYLOAD.to_string(),
            Payload::VoteCast(vote) => {
                let canonical = CanonicalVote {
                    candidate_id: &vote.candidate_id,
                    election_id: &vote.election_id,
                    voter_id: &vote.voter_id,
                };
                serde_json::to_string(&canonical).expect("string-only struct always serializes")
            }
            Payload::Unrecognized(raw) => raw.clone(),
        }
    }

    /// Decodes stored payload text.
    ///
    /// Anything that does not re-encode to exactly the same text is kept as
    /// `Unrecognized`, which guarantees `decode(raw).encode() == raw`.
    pub fn decode(raw: &str) -> Self {
        let parsed = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(_) => None,
        };

        match parsed {
            Some(payload) if payload.encode() == raw => payload,
            _ => Payload::Unrecognized(raw.to_string()),
        }
    }

    fn from_value(value: serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;

        if object.len() == 1 && object.get("genesis") == Some(&serde_json::Value::Bool(true)) {
            return Some(Payload::Genesis);
        }

        if object.len() == 3 {
            let field = |name: &str| object.get(name).and_then(|v| v.as_str());
            if let (Some(voter), Some(election), Some(candidate)) =
                (field("voter_id"), field("election_id"), field("candidate_id"))
            {
                return Some(Payload::VoteCast(VoteRecord::new(voter, election, candidate)));
            }
        }

        None
    }

    /// Returns the vote record if this payload is a vote
    pub fn as_vote(&self) -> Option<&VoteRecord> {
        match self {
            Payload::VoteCast(vote) => Some(vote),
            _ => None,
        }
    }
}

/// Represents a sealed block in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain (genesis = 0)
    pub index: u64,

    /// Timestamp recorded when mining started
    #[schema(value_type = String, example = "2023-01-01T12:00:00.000Z")]
    pub timestamp: DateTime<Utc>,

    /// Genesis marker or vote record
    #[schema(value_type = Object)]
    pub payload: Payload,

    /// Hash of the previous block, "0" for genesis
    pub previous_hash: String,

    /// Proof of work found by the miner
    pub nonce: u64,

    /// Digest of (timestamp, payload, previous_hash, nonce)
    pub hash: String,
}

impl Block {
    /// Recomputes the digest of this block from its own fields
    pub fn calculate_hash(&self) -> String {
        digest(&self.timestamp, &self.payload, &self.previous_hash, self.nonce)
    }
}

/// Truncates a timestamp to the precision that takes part in the digest
pub fn block_timestamp(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(3)
}

/// Computes the SHA-256 digest of a block's hashed fields
///
/// # Returns
///
/// The digest as a 64 character lowercase hexadecimal string
pub fn digest(timestamp: &DateTime<Utc>, payload: &Payload, previous_hash: &str, nonce: u64) -> String {
    let input = format!(
        "{}|{}|{}|{}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        payload.encode(),
        previous_hash,
        nonce
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checks the difficulty predicate: `difficulty` leading zero hex digits
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
