use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::Router;
use model::ModelController;
use pipeline::engine::OfflineEngine;
use tokio::net::TcpListener;
use tools::log::{log_info, LogServiceType};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use self::error::{Error, Result};

mod clustering;
mod domain;
mod error;
mod model;
mod pipeline;
mod ranking;
mod routes;
mod server;
mod tools;

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    log_info(LogServiceType::Register, "Starting facegroup server".to_string());

    let config = server::initialize_config().await?;
    let mc = ModelController::new(config.clone(), Arc::new(OfflineEngine::new()));
    let app = app(mc);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    log_info(
        LogServiceType::Register,
        format!("->> LISTENING on {:?}\n", listener.local_addr()),
    );
    axum::serve(listener, app).await?;
    Ok(())
}

fn app(mc: ModelController) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let api = routes::jobs::routes(mc.clone()).merge(routes::curation::routes(mc.clone()));

    Router::new()
        .nest("/ping", routes::ping::routes())
        .nest("/api", api)
        .nest("/out", routes::files::routes(mc))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
