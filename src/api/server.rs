//! HTTP server assembly.

use super::middleware::{auth_middleware, AuthSettings};
use super::routes::{self, AppState};
use crate::config::ServerConfig;
use crate::pipeline::Orchestrator;
use crate::types::OrchestratorError;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct ApiServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = orchestrator.config().server.clone();
        Self {
            config,
            state: Arc::new(AppState {
                orchestrator,
                started_at: Instant::now(),
            }),
        }
    }

    /// Assemble the router. `/health` stays open for probes; the query,
    /// stats, and metrics routes sit behind the (optional) bearer auth.
    pub fn router(&self) -> Router {
        let auth = Arc::new(AuthSettings {
            enabled: self.config.auth.enabled,
            token: self.config.auth.bearer_token.clone(),
        });
        if self.config.auth.enabled && auth.token.is_none() {
            tracing::error!(
                "auth is enabled with no bearer token configured; authenticated routes will reject"
            );
        }

        let protected = Router::new()
            .route("/v1/query", post(routes::query))
            .route("/stats", get(routes::stats))
            .route("/metrics", get(routes::metrics))
            .layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
            .with_state(self.state.clone());

        let open = Router::new()
            .route("/health", get(routes::health))
            .with_state(self.state.clone());

        let mut router = Router::new().merge(protected).merge(open);

        if self.config.enable_cors {
            let cors = if self.config.cors_origins.is_empty() {
                CorsLayer::permissive()
            } else {
                let origins: Vec<_> = self
                    .config
                    .cors_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect();
                CorsLayer::new()
                    .allow_origin(origins)
                    .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                    .allow_headers([
                        axum::http::header::AUTHORIZATION,
                        axum::http::header::CONTENT_TYPE,
                    ])
            };
            router = router.layer(cors);
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until ctrl-c, then drain the orchestrator.
    pub async fn serve(self) -> Result<(), OrchestratorError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            OrchestratorError::Internal(format!("failed to bind {}: {}", addr, e))
        })?;
        tracing::info!(%addr, "HTTP server listening");

        // Periodic action-history retention sweep.
        let history = self.state.orchestrator.history().clone();
        let cleanup = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
            tick.tick().await;
            loop {
                tick.tick().await;
                history.cleanup();
            }
        });

        let orchestrator = self.state.orchestrator.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await
            .map_err(|e| OrchestratorError::Internal(format!("server error: {}", e)));

        cleanup.abort();
        orchestrator.shutdown().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBundle;
    use crate::registry::test_support::{descriptor, static_agent};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn orchestrator() -> Arc<Orchestrator> {
        let bundle = ConfigBundle {
            orchestrator: Default::default(),
            agents: vec![],
            rules: vec![crate::routing::rules::Rule {
                name: "math".into(),
                priority: 10,
                confidence: 0.95,
                conditions: vec![crate::routing::rules::RuleCondition::Keyword {
                    field: "query".into(),
                    keywords: vec!["calculate".into()],
                }],
                target_agents: vec!["calculator".into()],
            }],
            evaluators: vec![],
            schema_files: HashMap::new(),
        };
        let mut bundle = bundle;
        bundle.orchestrator.audit.enabled = false;
        Arc::new(
            Orchestrator::builder(bundle)
                .without_reasoning()
                .with_agent(
                    descriptor("calculator", &["math"]),
                    static_agent("calculator", serde_json::json!({"result": 42})),
                )
                .build()
                .unwrap(),
        )
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_query_endpoint_json_mode() {
        let server = ApiServer::new(orchestrator());
        let response = server
            .router()
            .oneshot(json_request(
                "/v1/query",
                serde_json::json!({"query": "calculate 15 + 27"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["calculator"]["result"], 42);
        assert_eq!(body["metadata"]["agent_trail"][0], "calculator");
        // Confidence never reaches the client.
        assert!(body["metadata"]["reasoning"].get("confidence").is_none());
    }

    #[tokio::test]
    async fn test_query_endpoint_no_agent_is_http_200() {
        let server = ApiServer::new(orchestrator());
        let response = server
            .router()
            .oneshot(json_request(
                "/v1/query",
                serde_json::json!({"query": "write me a poem"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "no_agent");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let server = ApiServer::new(orchestrator());
        let response = server
            .router()
            .oneshot(json_request(
                "/v1/query",
                serde_json::json!({"stream": "not-a-bool"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_open_without_auth() {
        let orchestrator = orchestrator();
        let server = ApiServer::new(orchestrator);
        let mut with_auth = server;
        with_auth.config.auth.enabled = true;
        with_auth.config.auth.bearer_token = Some("key".into());

        let response = with_auth
            .router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["agents"]["calculator"].is_object());
    }

    #[tokio::test]
    async fn test_query_requires_auth_when_enabled() {
        let mut server = ApiServer::new(orchestrator());
        server.config.auth.enabled = true;
        server.config.auth.bearer_token = Some("key".into());

        let response = server
            .router()
            .oneshot(json_request(
                "/v1/query",
                serde_json::json!({"query": "calculate 1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut authed = json_request(
            "/v1/query",
            serde_json::json!({"query": "calculate 1 + 1"}),
        );
        authed
            .headers_mut()
            .insert("authorization", "Bearer key".parse().unwrap());
        let response = server.router().oneshot(authed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_text_format() {
        let server = ApiServer::new(orchestrator());
        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/plain"));

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("conductor_requests_total"));
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let server = ApiServer::new(orchestrator());
        let router = server.router();

        // Drive one request so the counters move.
        let _ = router
            .clone()
            .oneshot(json_request(
                "/v1/query",
                serde_json::json!({"query": "calculate 15 + 27"}),
            ))
            .await
            .unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total_requests"], 1);
        assert_eq!(body["outcomes"]["success"], 1);
        assert!(body["agents"]["calculator"].is_object());
    }
}
