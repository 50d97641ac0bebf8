use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use strider_core::LocationService;
use strider_engine::{Notifier, Reconciler, RouteExecutor, WalkingSet};
use strider_store::UserStore;
use strider_telemetry::Counters;

use crate::config::ServiceConfig;
use crate::handlers;
use crate::orchestrator::RouteOrchestrator;
use crate::registry::{self, SessionRegistry};
use crate::token::TokenDecoder;
use crate::ws::ws_handler;

/// How long shutdown waits for the HTTP server once connections are closed.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub orchestrator: Arc<RouteOrchestrator>,
    pub upstream: Arc<dyn LocationService>,
    pub tokens: Arc<dyn TokenDecoder>,
    pub counters: Counters,
}

/// External collaborators the server is wired against.
pub struct Services {
    pub upstream: Arc<dyn LocationService>,
    pub store: Arc<dyn UserStore>,
    pub tokens: Arc<dyn TokenDecoder>,
    pub counters: Counters,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/ws", get(ws_handler))
        .route("/api/execRoutes", post(handlers::exec_routes))
        .route("/api/stop", post(handlers::stop))
        .route("/api/me", get(handlers::me))
        .route("/api/locations", get(handlers::locations))
        .route("/api/login", post(handlers::login))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Wire the engine, start the background loops, and bind the listener.
pub async fn start(config: &ServiceConfig, services: Services) -> Result<ServerHandle, std::io::Error> {
    config
        .validate()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let cancel = CancellationToken::new();
    let registry = Arc::new(SessionRegistry::new(config.max_send_queue));
    let walking = Arc::new(WalkingSet::new());

    let executor = Arc::new(RouteExecutor::new(
        Arc::clone(&services.upstream),
        Arc::clone(&services.store),
        Arc::clone(&registry) as Arc<dyn Notifier>,
        Arc::clone(&walking),
        services.counters.clone(),
        config.executor(),
    ));
    let orchestrator = Arc::new(RouteOrchestrator::new(
        executor,
        Arc::clone(&registry),
        config.stop_echo_delay(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&services.upstream),
        Arc::clone(&services.store),
        walking,
        services.counters.clone(),
    ));
    let reconcile_task = reconciler.spawn(config.reconcile_interval(), cancel.child_token());
    let heartbeat_task = registry::start_heartbeat(
        Arc::clone(&registry),
        config.ping_interval(),
        config.liveness_interval(),
        cancel.child_token(),
    );

    let state = AppState {
        registry: Arc::clone(&registry),
        orchestrator: Arc::clone(&orchestrator),
        upstream: services.upstream,
        tokens: services.tokens,
        counters: services.counters,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            cancel.cancel();
            return Err(e);
        }
    };
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "strider server started");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "http server exited");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        server,
        background: vec![reconcile_task, heartbeat_task],
        orchestrator,
        registry,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    orchestrator: Arc<RouteOrchestrator>,
    registry: Arc<SessionRegistry>,
}

impl ServerHandle {
    /// Stop accepting work, let running routes finalize, then close viewers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let stopped = self.orchestrator.shutdown().await;
        self.registry.close_all();
        for task in self.background {
            let _ = task.await;
        }
        if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, self.server).await.is_err() {
            tracing::warn!("http server did not drain in time");
        }
        tracing::info!(stopped_runs = stopped, "strider server stopped");
    }
}

#[cfg(test)]
mod tests {
    use strider_store::{Database, UserRepo};
    use strider_upstream::MockLocationService;

    use super::*;
    use crate::token::PlainTokenDecoder;

    fn config() -> ServiceConfig {
        ServiceConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    fn services() -> Services {
        Services {
            upstream: Arc::new(MockLocationService::new()),
            store: Arc::new(UserRepo::new(Database::in_memory().unwrap())),
            tokens: Arc::new(PlainTokenDecoder),
            counters: Counters::new(),
        }
    }

    #[tokio::test]
    async fn serves_health_without_token() {
        let handle = start(&config(), services()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["viewers"], 0);
        assert_eq!(body["counters"]["runsStarted"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn root_requires_token() {
        let handle = start(&config(), services()).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);

        let resp = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.text().await.unwrap(), "No token");

        let resp = reqwest::get(format!("{base}/?token=abcdefghij")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let text = resp.text().await.unwrap();
        assert!(text.starts_with("token is abcdef"));
        assert!(!text.contains("abcdefghij"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn exec_routes_without_viewer_conflicts() {
        let handle = start(&config(), services()).await.unwrap();
        let url = format!("http://127.0.0.1:{}/api/execRoutes?token=walker", handle.port);

        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({
                "routes": [{"lat": 35.0, "lng": 139.0}],
                "interval": 1,
                "speed": 4,
                "batteryLevel": 80
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_exec_body_is_bad_request() {
        let handle = start(&config(), services()).await.unwrap();
        let url = format!("http://127.0.0.1:{}/api/execRoutes?token=walker", handle.port);

        let resp = reqwest::Client::new()
            .post(&url)
            .header("content-type", "application/json")
            .body("{\"routes\": 5}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn me_passes_upstream_rejection_through() {
        let handle = start(&config(), services()).await.unwrap();
        let url = format!("http://127.0.0.1:{}/api/me?token=walker", handle.port);

        // the mock has no profile configured and answers unauthorized
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 502);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn zero_tick_period_is_refused_before_spawning() {
        let bad = ServiceConfig {
            ping_interval_ms: 0,
            ..config()
        };
        let err = start(&bad, services()).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("pingIntervalMs"));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = start(&config(), services()).await.unwrap();
        let taken = ServiceConfig {
            port: first.port,
            ..config()
        };
        assert!(start(&taken, services()).await.is_err());
        first.shutdown().await;
    }
}
