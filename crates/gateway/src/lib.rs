//! HTTP and WebSocket gateway for agentrelay.
//!
//! Exposes the orchestrator entry points (blocking and streaming
//! execution, cancellation, status), the plain chat queue, and a WebSocket
//! endpoint speaking the relay's subscribe protocol.
//!
//! Built on Axum for high performance async HTTP.

pub mod api_v1;
pub mod ws;

#[cfg(test)]
mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use agentrelay_agent::{
    ChatWorker, InMemoryExecutionStore, JobQueue, Orchestrator, OrchestratorSettings,
    StaticAgentDirectory, WorkerSettings,
};
use agentrelay_config::{AppConfig, RelayBackend};
use agentrelay_core::LlmProvider;
use agentrelay_stream::{
    Broker, BrokerSink, EventRelay, EventSink, RedisBroker, RetentionPolicy, StreamRegistry, spawn_forwarder,
};

pub use api_v1::{ApiState, SharedApiState};

/// Pause before resubscribing to the broker after a failure.
const BROKER_RETRY: Duration = Duration::from_secs(2);

/// Wire every subsystem once and share it between the HTTP routes, the
/// WebSocket handler and the chat queue.
///
/// Must be called from inside a Tokio runtime: the chat queue dispatcher is
/// spawned here.
pub fn build_state(config: &AppConfig, provider: Arc<dyn LlmProvider>) -> SharedApiState {
    let relay = EventRelay::new().with_grace(Duration::from_millis(config.relay.complete_grace_ms));
    let registry = Arc::new(
        StreamRegistry::new(registry_sink(config, &relay)).with_retention(RetentionPolicy {
            completed: Duration::from_millis(config.streaming.complete_retention_ms),
            failed: Duration::from_millis(config.streaming.error_retention_ms),
        }),
    );

    let mut tools = agentrelay_tools::default_registry();
    if let Some(timeout) = config.orchestrator.tool_timeout() {
        tools = tools.with_timeout(timeout);
    }

    let orchestrator = Orchestrator::new(
        provider,
        Arc::new(StaticAgentDirectory::from_config(config)),
        Arc::new(tools),
        Arc::new(InMemoryExecutionStore::new()),
        agentrelay_memory::from_backend_name(&config.memory.backend),
        registry,
    )
    .with_settings(OrchestratorSettings::from_config(config));

    let worker = Arc::new(ChatWorker::new(orchestrator.clone(), WorkerSettings::from_config(config)));
    let (queue, _dispatcher) = JobQueue::start(worker, config.worker.queue_capacity);

    Arc::new(ApiState {
        orchestrator,
        relay,
        queue,
        start_time: chrono::Utc::now(),
    })
}

/// Where the registry sends its events. With the Redis backend they take a
/// round trip through the broker, so every gateway process subscribed to
/// it relays them, this one included.
fn registry_sink(config: &AppConfig, relay: &EventRelay) -> Arc<dyn EventSink> {
    match config.relay.backend {
        RelayBackend::InProcess => Arc::new(relay.clone()),
        RelayBackend::Redis => match RedisBroker::open(&config.relay.redis_url) {
            Ok(broker) => {
                let broker: Arc<dyn Broker> = Arc::new(broker);
                spawn_forwarder(broker.clone(), relay.clone(), BROKER_RETRY);
                let (sink, _publisher) = BrokerSink::start(broker);
                info!(url = %config.relay.redis_url, "Relaying stream events through Redis");
                Arc::new(sink)
            }
            Err(e) => {
                warn!("Redis relay unavailable ({e}), relaying in-process");
                Arc::new(relay.clone())
            }
        },
    }
}

/// Build the full router: `/health` plus the v1 API nested under `/v1`.
pub fn build_router(state: SharedApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .nest("/v1", api_v1::v1_router(state))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let provider = agentrelay_providers::router::build_from_config(&config)?;
    let state = build_state(&config, provider);
    let orchestrator = state.orchestrator.clone();
    let app = build_router(state);

    info!(addr = %addr, agents = config.agents.len(), "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested, cancelling active streams");
            orchestrator.cancel_all();
        })
        .await?;

    Ok(())
}

// --- Health ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    active_streams: usize,
    connections: usize,
}

async fn health_handler(State(state): State<SharedApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (chrono::Utc::now() - state.start_time).num_seconds(),
        active_streams: state.orchestrator.registry().list_active().len(),
        connections: state.relay.connection_count(),
    })
}
