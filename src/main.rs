use std::sync::atomic::Ordering;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;
mod registry;

use blockchain::{Ledger, VoteRecorder};
use config::Config;
use registry::Registry;

// Open the ledger and make sure it has a genesis block
fn initialize_ledger(config: &Config) -> anyhow::Result<Ledger> {
    // Create data directory if it doesn't exist
    std::fs::create_dir_all(&config.data_dir).unwrap_or_else(|e| {
        warn!("Failed to create data directory {}: {}", config.data_dir.display(), e);
    });

    let ledger = match Ledger::with_storage(&config.data_dir, config.difficulty) {
        Ok(ledger) => {
            info!(
                "Opened ledger at {} with {} blocks",
                config.data_dir.display(),
                ledger.len()
            );
            ledger
        }
        Err(err) => {
            warn!("Failed to open ledger storage: {}", err);
            warn!("Votes will NOT survive a restart, using a temporary ledger instead");
            Ledger::in_memory(config.difficulty).context("failed to open a temporary ledger")?
        }
    };

    ledger.bootstrap().context("failed to create the genesis block")?;
    ledger.verify();

    Ok(ledger)
}

fn load_registry(config: &Config) -> anyhow::Result<Registry> {
    match &config.registry_file {
        Some(path) => {
            let registry = Registry::from_file(path)
                .with_context(|| format!("failed to load registry from {}", path.display()))?;
            info!("Loaded {} elections from {}", registry.elections().len(), path.display());
            Ok(registry)
        }
        None => {
            info!("No registry file configured, results will show election and candidate ids");
            Ok(Registry::new())
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_block,
        api::handlers::edit_block_hash,
        api::handlers::validate_chain,
        api::handlers::cast_vote,
        api::handlers::vote_status,
        api::handlers::get_results,
        api::handlers::get_election_results
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::VoteRecord,
            blockchain::TamperReason,
            blockchain::ElectionResult,
            blockchain::tally::CandidateResult,
            api::handlers::ChainResponse,
            api::handlers::ValidationResponse,
            api::handlers::VoteRequest,
            api::handlers::VoteResponse,
            api::handlers::VoteStatusResponse,
            api::handlers::ResultsResponse,
            api::handlers::EditHashRequest,
            api::handlers::EditHashResponse
        )
    ),
    tags(
        (name = "ballot_chain", description = "Vote ledger API endpoints")
    ),
    info(
        title = "Ballot Chain API",
        version = "0.1.0",
        description = "Vote casting backed by a hash-linked, proof-of-work sealed ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().context("invalid configuration")?;
    info!("Mining difficulty: {} leading zero hex digits", config.difficulty);

    let ledger = initialize_ledger(&config)?;
    let registry = load_registry(&config)?;

    // Abandon in-flight nonce searches once shutdown starts
    let shutdown = ledger.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, interrupting mining");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let state = web::Data::new(api::AppState {
        recorder: VoteRecorder::with_retries(ledger, config.append_retries),
        registry,
    });

    info!("Starting HTTP server at http://{}", config.bind_addr);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()))
    })
    .bind(config.bind_addr)
    .with_context(|| format!("failed to bind {}", config.bind_addr))?
    .run()
    .await?;

    Ok(())
}
