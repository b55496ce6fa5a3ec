use std::net::SocketAddr;
use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Json};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use platter::app::Platform;
use platter::auth::JwtVerifier;
use platter::config;

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config()?;
    config::init_tracing(&config.log_level, config.log_json);

    info!(environment = %config.environment, "platter starting");

    let verifier = Arc::new(JwtVerifier::from_config(&config.jwt)?);
    let platform = Platform::build(&config).await?;
    platform.spawn_publishers();

    let middleware = ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let app = platform
        .router(verifier)
        .route("/health", get(health))
        .layer(middleware);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
