//! API module
//!
//! HTTP endpoints and middleware.

pub mod middleware;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::domain::OperationContext;
use crate::handlers::TransferHandler;
use crate::store::UnitOfWork;

pub use routes::create_router;

/// Shared state for every route
pub struct AppState<S> {
    pub handler: Arc<TransferHandler<S>>,
    /// Deadline applied to each request's store work
    pub request_timeout: Duration,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            request_timeout: self.request_timeout,
        }
    }
}

impl<S: UnitOfWork> AppState<S> {
    pub fn new(handler: TransferHandler<S>, request_timeout: Duration) -> Self {
        Self {
            handler: Arc::new(handler),
            request_timeout,
        }
    }

    /// Bound a request context by the configured deadline
    pub fn operation_context(&self, context: OperationContext) -> OperationContext {
        context.with_timeout(self.request_timeout)
    }
}

/// Build the application router
pub fn build_router<S: UnitOfWork + 'static>(state: AppState<S>) -> Router {
    // Layers run last-added first: request context -> logging -> handler
    let api_routes = create_router::<S>()
        .layer(axum::middleware::from_fn(middleware::logging_middleware))
        .layer(axum::middleware::from_fn(
            middleware::request_context_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
