//! Health / readiness / metrics HTTP endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

use postern_common::Signal;
use postern_crypto::constant_time_eq;

use crate::health::HealthState;
use crate::registry::Metrics;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("cannot bind admin endpoint {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("admin server failed: {0}")]
    Server(String),
}

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthState>,
    /// When set, `/metrics` requires this token via `X-Admin-Token` or
    /// `Authorization: Bearer`.
    pub admin_token: Option<String>,
}

impl AdminState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.admin_token else {
            return true;
        };

        let presented = headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
            });

        presented.is_some_and(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()))
    }
}

async fn health_handler(State(state): State<Arc<AdminState>>) -> Response {
    (StatusCode::OK, state.health.describe()).into_response()
}

async fn ready_handler(State(state): State<Arc<AdminState>>) -> Response {
    if state.health.accepts_traffic() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, state.health.describe()).into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<AdminState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
    }
    (StatusCode::OK, state.metrics.render_prometheus()).into_response()
}

pub struct AdminServer {
    listener: TcpListener,
    router: Router,
}

impl AdminServer {
    /// # Errors
    ///
    /// Fails when the address cannot be bound.
    pub async fn bind(addr: &str, state: AdminState) -> Result<Self, AdminError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AdminError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        tracing::info!(addr, "admin endpoint bound");

        let router = Router::new()
            .route("/healthz", get(health_handler))
            .route("/readyz", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::new(state))
            .layer(TimeoutLayer::new(Duration::from_secs(2)));

        Ok(Self { listener, router })
    }

    /// Serves until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Propagates axum runtime failures.
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), AdminError> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(|e| AdminError::Server(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::health::Readiness;

    fn state(token: Option<&str>) -> AdminState {
        AdminState {
            metrics: Arc::new(Metrics::new()),
            health: Arc::new(HealthState::new()),
            admin_token: token.map(str::to_string),
        }
    }

    #[test]
    fn token_checks() {
        let state = state(Some("secret"));

        let mut headers = HeaderMap::new();
        assert!(!state.authorized(&headers));

        headers.insert("x-admin-token", "wrong".parse().unwrap());
        assert!(!state.authorized(&headers));

        headers.insert("x-admin-token", "secret".parse().unwrap());
        assert!(state.authorized(&headers));

        let mut bearer = HeaderMap::new();
        bearer.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(state.authorized(&bearer));
    }

    #[test]
    fn no_token_configured_allows_all() {
        assert!(state(None).authorized(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn ready_gates_on_health_state() {
        let state = state(None);
        state.health.set(Readiness::Starting, "");
        let shared = Arc::new(state);

        let response = ready_handler(State(shared.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        shared.health.set(Readiness::Ready, "");
        let response = ready_handler(State(shared.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        shared.health.set(Readiness::Degraded, "scanner down");
        let response = ready_handler(State(shared)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_render_through_handler() {
        let state = state(None);
        state.metrics.inc_connections();
        let response = metrics_handler(State(Arc::new(state)), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
