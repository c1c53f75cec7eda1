//! HTTP transport: settings, probes and the shared middleware stack.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use keel_core::{Config, ConfigError};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::shutdown::{HealthState, ShutdownController};
use crate::module::ModuleRegistry;

/// Settings read from the `http` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub addr: String,
    pub disable: bool,
    pub request_timeout: Duration,
    /// Upper bound on waiting for in-flight requests at shutdown.
    pub drain_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: ":8080".to_string(),
            disable: false,
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed durations.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            addr: config.string("http.addr").unwrap_or(defaults.addr),
            disable: config.bool("http.disable"),
            request_timeout: config.duration_or("http.requestTimeout", defaults.request_timeout)?,
            drain_timeout: config.duration_or("http.drainTimeout", defaults.drain_timeout)?,
        })
    }
}

#[derive(Clone)]
struct ProbeState {
    shutdown: Arc<ShutdownController>,
    started: Instant,
}

async fn health(State(state): State<ProbeState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<ProbeState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn track_in_flight(State(shutdown): State<Arc<ShutdownController>>, request: Request, next: Next) -> Response {
    let _guard = shutdown.in_flight_guard();
    next.run(request).await
}

/// Builds the process router: health probes, then every module's routes,
/// wrapped in request-id, tracing, timeout and in-flight tracking layers.
pub fn build_router(modules: &ModuleRegistry, shutdown: &Arc<ShutdownController>, config: &HttpConfig) -> Router {
    let probes = Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .with_state(ProbeState {
            shutdown: Arc::clone(shutdown),
            started: Instant::now(),
        });

    let mut router = probes;
    for provider in modules.http_providers() {
        router = provider.provide_http(router);
    }

    let x_request_id = HeaderName::from_static("x-request-id");
    router
        .layer(middleware::from_fn_with_state(Arc::clone(shutdown), track_in_flight))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::module::{Capability, HttpProvider, Module};

    struct Hello;

    impl HttpProvider for Hello {
        fn provide_http(&self, router: Router) -> Router {
            router.route("/hello", get(|| async { "hi" }))
        }
    }

    impl Module for Hello {
        fn name(&self) -> &str {
            "hello"
        }

        fn capabilities(self: Arc<Self>) -> Vec<Capability> {
            vec![Capability::Http(self)]
        }
    }

    async fn get_status(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn readiness_follows_the_controller() {
        let modules = ModuleRegistry::new();
        let shutdown = Arc::new(ShutdownController::new());
        let router = build_router(&modules, &shutdown, &HttpConfig::default());

        assert_eq!(get_status(router.clone(), "/health/live").await.0, StatusCode::OK);
        assert_eq!(get_status(router.clone(), "/health/ready").await.0, StatusCode::SERVICE_UNAVAILABLE);
        shutdown.set_ready();
        assert_eq!(get_status(router.clone(), "/health/ready").await.0, StatusCode::OK);
        shutdown.begin_drain();
        assert_eq!(get_status(router, "/health/ready").await.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn module_routes_are_mounted() {
        let modules = ModuleRegistry::new();
        modules.register(Arc::new(Hello));
        let shutdown = Arc::new(ShutdownController::new());
        let router = build_router(&modules, &shutdown, &HttpConfig::default());
        let (status, body) = get_status(router, "/hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"hi");
        assert_eq!(shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn health_reports_state_json() {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let router = build_router(&ModuleRegistry::new(), &shutdown, &HttpConfig::default());
        let (_, body) = get_status(router, "/health").await;
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["state"], "ready");
    }

    #[test]
    fn config_overrides_defaults() {
        let config = Config::from_value(json!({"http": {"addr": "127.0.0.1:0", "disable": true, "requestTimeout": "5s"}}));
        let http = HttpConfig::from_config(&config).unwrap();
        assert_eq!(http.addr, "127.0.0.1:0");
        assert!(http.disable);
        assert_eq!(http.request_timeout, Duration::from_secs(5));
        assert_eq!(http.drain_timeout, Duration::from_secs(30));
    }
}
