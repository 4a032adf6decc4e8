use actix_web::{web, HttpResponse, Responder};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::identity::Identity;
use crate::blockchain::recorder::validate_id;
use crate::blockchain::tally::ElectionResult;
use crate::blockchain::{Block, LedgerError, Verification, VoteRecorder};
use crate::registry::Registry;

/// Shared state of the HTTP handlers
pub struct AppState {
    /// Vote recorder and, through it, the ledger
    pub recorder: VoteRecorder,

    /// Election and candidate names
    pub registry: Registry,
}

pub type AppData = web::Data<AppState>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The number of readable blocks
    pub length: usize,

    /// The blocks in index order
    pub chain: Vec<Block>,

    /// Outcome of the integrity check
    #[schema(value_type = Object)]
    pub verification: Verification,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub valid: bool,

    #[schema(value_type = Object)]
    pub verification: Verification,
}

/// Request for the vote endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct VoteRequest {
    pub election_id: String,
    pub candidate_id: String,
}

/// Response for the vote endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct VoteResponse {
    pub message: String,

    /// The block recording the vote
    pub block: Block,
}

/// Response for the vote status endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct VoteStatusResponse {
    pub election_id: String,
    pub has_voted: bool,
}

/// Response for the results endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ResultsResponse {
    pub total_votes: u64,
    pub elections: Vec<ElectionResult>,
}

/// Request for the block hash edit endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct EditHashRequest {
    pub hash: String,
}

/// Response for the block hash edit endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct EditHashResponse {
    pub message: String,
    pub index: u64,
    pub stored_hash: String,
    pub submitted_hash: String,
}

fn error_body(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "error": message.into() })
}

/// Maps a ledger error onto an HTTP response
fn ledger_error_response(err: &LedgerError) -> HttpResponse {
    match err {
        LedgerError::Validation(_) => HttpResponse::BadRequest().json(error_body(err.to_string())),
        LedgerError::AlreadyVoted { .. } => HttpResponse::Conflict().json(error_body(err.to_string())),
        LedgerError::Conflict { .. } => {
            HttpResponse::ServiceUnavailable().json(error_body("The ledger is busy, please retry"))
        }
        LedgerError::Storage(_) | LedgerError::Mining(_) | LedgerError::System(_) => {
            error!("Ledger failure: {}", err);
            HttpResponse::InternalServerError().json(error_body("Server error while processing request"))
        }
    }
}

fn forbidden() -> HttpResponse {
    HttpResponse::Forbidden().json(error_body("Forbidden: admin only"))
}

/// Get the full chain
///
/// Returns every readable block and the verification outcome
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(state: AppData) -> impl Responder {
    let ledger = state.recorder.ledger().clone();

    // Unreadable rows are left out here and reported by the verification
    let result = web::block(move || {
        let chain: Vec<Block> = ledger.scan().filter_map(Result::ok).collect();
        (chain, ledger.verify())
    })
    .await;

    match result {
        Ok((chain, verification)) => HttpResponse::Ok().json(ChainResponse {
            length: chain.len(),
            chain,
            verification,
        }),
        Err(err) => {
            error!("Chain task failed: {}", err);
            HttpResponse::InternalServerError().json(error_body("Server error while reading the chain"))
        }
    }
}

/// Get a block by index
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{index}",
    params(("index" = u64, Path, description = "Block index")),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "Block not found")
    )
)]
pub async fn get_block(state: AppData, index: web::Path<u64>) -> impl Responder {
    let index = index.into_inner();

    match state.recorder.ledger().get_block(index) {
        Ok(Some(block)) => HttpResponse::Ok().json(block),
        Ok(None) => HttpResponse::NotFound().json(error_body(format!("Block {} not found", index))),
        Err(err) => ledger_error_response(&err),
    }
}

/// Attempt to edit a block hash
///
/// Blocks are immutable; any hash different from the stored one is rejected
#[utoipa::path(
    post,
    path = "/api/v1/blocks/{index}/hash",
    params(("index" = u64, Path, description = "Block index")),
    request_body = EditHashRequest,
    responses(
        (status = 200, description = "Submitted hash equals the stored hash", body = EditHashResponse),
        (status = 404, description = "Block not found"),
        (status = 409, description = "Tampering rejected", body = EditHashResponse)
    )
)]
pub async fn edit_block_hash(
    state: AppData,
    identity: Identity,
    index: web::Path<u64>,
    edit_req: web::Json<EditHashRequest>,
) -> impl Responder {
    let index = index.into_inner();
    let submitted_hash = edit_req.into_inner().hash.trim().to_string();

    let block = match state.recorder.ledger().get_block(index) {
        Ok(Some(block)) => block,
        Ok(None) => return HttpResponse::NotFound().json(error_body(format!("Block {} not found", index))),
        Err(err) => return ledger_error_response(&err),
    };

    if submitted_hash == block.hash {
        return HttpResponse::Ok().json(EditHashResponse {
            message: "Submitted hash equals the stored hash, block unchanged".to_string(),
            index,
            stored_hash: block.hash,
            submitted_hash,
        });
    }

    warn!("Rejected hash edit of block {} by {}", index, identity.voter_id);

    HttpResponse::Conflict().json(EditHashResponse {
        message: "Tampering rejected: the hash is derived from the block contents and referenced by the next block"
            .to_string(),
        index,
        stored_hash: block.hash,
        submitted_hash,
    })
}

/// Check the integrity of the ledger
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Ledger verification outcome", body = ValidationResponse)
    )
)]
pub async fn validate_chain(state: AppData) -> impl Responder {
    // Re-hashing every block is CPU bound
    let ledger = state.recorder.ledger().clone();

    match web::block(move || ledger.verify()).await {
        Ok(verification) => HttpResponse::Ok().json(ValidationResponse {
            valid: verification.is_valid(),
            verification,
        }),
        Err(err) => {
            error!("Verification task failed: {}", err);
            HttpResponse::InternalServerError().json(error_body("Server error while verifying the chain"))
        }
    }
}

/// Cast a vote
///
/// Records one vote of the calling voter in an election
#[utoipa::path(
    post,
    path = "/api/v1/votes",
    request_body = VoteRequest,
    responses(
        (status = 201, description = "Vote recorded", body = VoteResponse),
        (status = 400, description = "Invalid vote request"),
        (status = 401, description = "Missing voter identity"),
        (status = 409, description = "Voter already voted in this election"),
        (status = 503, description = "Ledger busy, retry"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn cast_vote(state: AppData, identity: Identity, vote_req: web::Json<VoteRequest>) -> impl Responder {
    let VoteRequest {
        election_id,
        candidate_id,
    } = vote_req.into_inner();

    if !state.registry.candidate_may_stand_in(&candidate_id, &election_id) {
        return HttpResponse::BadRequest().json(error_body(format!(
            "Candidate {} does not stand in election {}",
            candidate_id, election_id
        )));
    }

    // Mining is CPU bound, keep it off the async workers
    let recorder = state.recorder.clone();
    let voter_id = identity.voter_id;
    let result = web::block(move || recorder.cast_vote(&voter_id, &election_id, &candidate_id)).await;

    match result {
        Ok(Ok(block)) => HttpResponse::Created().json(VoteResponse {
            message: "Your vote has been successfully cast".to_string(),
            block,
        }),
        Ok(Err(err)) => ledger_error_response(&err),
        Err(err) => {
            error!("Vote task failed: {}", err);
            HttpResponse::InternalServerError().json(error_body("Server error while processing vote"))
        }
    }
}

/// Check whether the caller voted in an election
#[utoipa::path(
    get,
    path = "/api/v1/elections/{election_id}/vote-status",
    params(("election_id" = String, Path, description = "Election id")),
    responses(
        (status = 200, description = "Vote status", body = VoteStatusResponse),
        (status = 400, description = "Malformed election id"),
        (status = 401, description = "Missing voter identity")
    )
)]
pub async fn vote_status(state: AppData, identity: Identity, election_id: web::Path<String>) -> impl Responder {
    let election_id = election_id.into_inner();

    if let Err(err) = validate_id("election_id", &election_id) {
        return ledger_error_response(&err);
    }

    match state.recorder.has_voted(&identity.voter_id, &election_id) {
        Ok(has_voted) => HttpResponse::Ok().json(VoteStatusResponse { election_id, has_voted }),
        Err(err) => ledger_error_response(&err),
    }
}

/// Get results of all elections
///
/// Admin only. Counts are replayed from the ledger on every request
#[utoipa::path(
    get,
    path = "/api/v1/results",
    responses(
        (status = 200, description = "Results of every election with votes", body = ResultsResponse),
        (status = 403, description = "Caller is not an admin")
    )
)]
pub async fn get_results(state: AppData, identity: Identity) -> impl Responder {
    if !identity.is_admin {
        return forbidden();
    }

    match state.recorder.ledger().tally() {
        Ok(tally) => HttpResponse::Ok().json(ResultsResponse {
            total_votes: tally.total_votes(),
            elections: tally.results(&state.registry),
        }),
        Err(err) => ledger_error_response(&err),
    }
}

/// Get results of one election
#[utoipa::path(
    get,
    path = "/api/v1/results/{election_id}",
    params(("election_id" = String, Path, description = "Election id")),
    responses(
        (status = 200, description = "Election results", body = ElectionResult),
        (status = 403, description = "Caller is not an admin"),
        (status = 404, description = "Unknown election without votes")
    )
)]
pub async fn get_election_results(
    state: AppData,
    identity: Identity,
    election_id: web::Path<String>,
) -> impl Responder {
    if !identity.is_admin {
        return forbidden();
    }

    let election_id = election_id.into_inner();
    let tally = match state.recorder.ledger().tally() {
        Ok(tally) => tally,
        Err(err) => return ledger_error_response(&err),
    };

    match tally.election_result(&election_id, &state.registry) {
        Some(result) => HttpResponse::Ok().json(result),
        // Registered election that nobody voted in yet
        None if state.registry.election(&election_id).is_some() => HttpResponse::Ok().json(ElectionResult {
            name: state.registry.election_name(&election_id),
            id: election_id,
            total_votes: 0,
            candidates: Vec::new(),
        }),
        None => HttpResponse::NotFound().json(error_body(format!("Election {} not found", election_id))),
    }
}
