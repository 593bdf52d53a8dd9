use axum::routing::{delete, get, post};
use axum::Router;
use tracing_subscriber::EnvFilter;

use patmos_retrieval::api;
use patmos_retrieval::config::Config;
use patmos_retrieval::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    tracing::info!(
        "Hybrid weights: semantic {} / keyword {}, top {}",
        config.retrieval.semantic_weight,
        config.retrieval.keyword_weight,
        config.retrieval.top_k
    );

    let state = AppState::new(config.clone()).await?;

    let app = Router::new()
        .route("/api/health", get(api::health::health))
        .route("/api/search", post(api::search::search))
        .route("/api/chat", post(api::chat::chat))
        .route("/api/chunks", post(api::documents::index_chunks))
        .route("/api/documents/{id}", delete(api::documents::delete_document))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
