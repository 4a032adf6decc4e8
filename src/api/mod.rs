// API module
//
// This module contains the HTTP interface of the vote ledger

pub mod handlers;
pub mod identity;
pub mod routes;

// Re-export main components for easier access
pub use handlers::AppState;
pub use routes::configure_routes;
