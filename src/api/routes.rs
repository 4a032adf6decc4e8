use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/blocks/{index}", web::get().to(handlers::get_block))
            .route("/blocks/{index}/hash", web::post().to(handlers::edit_block_hash))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/votes", web::post().to(handlers::cast_vote))
            .route("/elections/{election_id}/vote-status", web::get().to(handlers::vote_status))
            .route("/results", web::get().to(handlers::get_results))
            .route("/results/{election_id}", web::get().to(handlers::get_election_results))
    );
}
