//! HTTP chat server.
//!
//! Provides [`app`], which assembles the router behind the validated
//! [`GatePipeline`], and [`serve`], which binds it and runs until ctrl-c.

pub mod backend;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};

use crate::config::SluiceConfig;
use crate::gate::forgery::CsrfSigner;
use crate::gate::pipeline::{gate_middleware, GatePipeline};
use crate::gate::rate::RateLimiter;
use crate::protocol::{CSRF_TOKEN_PATH, HEALTH_PATH};
use backend::CompletionBackend;

/// Shared state handed to every handler.
pub struct AppState {
    pub backend: Arc<dyn CompletionBackend>,
    pub signer: Arc<CsrfSigner>,
}

/// Everything a running server needs besides the listener.
pub struct App {
    pub router: Router,
    pub pipeline: Arc<GatePipeline>,
    pub limiter: Arc<RateLimiter>,
}

/// Build the router. Fails if the gate chain is misordered.
pub fn app(config: &SluiceConfig, backend: Arc<dyn CompletionBackend>) -> Result<App> {
    let signer = Arc::new(CsrfSigner::from_config(&config.security)?);
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let pipeline = Arc::new(GatePipeline::standard(
        config,
        Arc::clone(&signer),
        Arc::clone(&limiter),
    ));

    if let Err(violation) = pipeline.validate_order() {
        tracing::error!(error = %violation, gates = ?pipeline.kinds(), "refusing to start with misordered gates");
        anyhow::bail!("security gate order invalid: {violation}");
    }
    tracing::debug!(gates = ?pipeline.kinds(), "security gates validated");

    let state = Arc::new(AppState { backend, signer });
    let body_limit = usize::try_from(config.security.max_body_bytes).unwrap_or(usize::MAX);

    let router = Router::new()
        .route(HEALTH_PATH, get(handlers::health))
        .route(CSRF_TOKEN_PATH, get(handlers::issue_token))
        .route(
            "/api/conversations/{id}/stream",
            post(handlers::stream_chat),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&pipeline),
            gate_middleware,
        ));

    Ok(App {
        router,
        pipeline,
        limiter,
    })
}

/// Start the chat server on the configured address.
pub async fn serve(config: SluiceConfig) -> Result<()> {
    let backend: Arc<dyn CompletionBackend> = Arc::from(backend::create_backend(&config.backend)?);
    tracing::info!(model = backend.model(), "completion backend ready");

    let App { router, limiter, .. } = app(&config, backend)?;
    let _cleanup = limiter.spawn_cleanup(Duration::from_secs(
        config.rate_limit.cleanup_interval_secs.max(1),
    ));

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "sluice listening at http://{bind_addr}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutting down chat server");
    })
    .await?;

    Ok(())
}
