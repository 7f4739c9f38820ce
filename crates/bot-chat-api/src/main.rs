use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use bot_chat_api::config::Settings;
use bot_chat_api::database::{DbPool, Repository};
use bot_chat_api::handlers;
use bot_chat_api::orchestrator::{BackendRetrieverFactory, ChatDeps};
use bot_chat_api::services::{EmbeddingFactory, LlmFactory};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,bot_chat_api=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting bot chat API server...");

    let settings = Settings::load()?;
    info!("Configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    info!("Database connection established");

    let repository = Arc::new(Repository::new(db_pool));

    let embeddings = Arc::new(EmbeddingFactory::new(settings.embedding.clone()));
    let chat_models = Arc::new(LlmFactory::new(settings.llm.clone()));
    let retrievers = Arc::new(BackendRetrieverFactory::new(
        repository.clone(),
        embeddings,
        settings.retrieval.top_k,
    ));

    let deps = ChatDeps {
        registry: repository.clone(),
        catalog: repository.clone(),
        retrievers,
        chat_models,
        history: repository,
    };

    let app = build_router(deps);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(deps: ChatDeps) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route(
            "/api/bots/{public_id}/chat",
            post(handlers::chat::chat_handler),
        )
        .layer(Extension(deps))
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CatchPanicLayer::new())
}
