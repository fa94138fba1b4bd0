//! Synapse Server
//!
//! Axum server exposing the orchestration core over HTTP: session control,
//! status polling, the archive, and a live SSE feed bridged from the bus.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::broadcast};
use utoipa::{OpenApi, ToSchema};

use synapse_core::bus::Event;
use synapse_core::config::{default_stages, OrchestratorConfig};
use synapse_core::endpoint::spawn_agent;
use synapse_core::memory::SqliteSnapshots;
use synapse_core::orchestrator::{Orchestrator, SessionStatus};
use synapse_core::state::{EventLog, SessionArchive, SynapseDb};
use synapse_core::{AgentBackend, AgentDescriptor, CoreError, EventBus, MemoryEngine, MoeRouter};

mod worker;

use worker::LocalBackend;

#[derive(Parser)]
#[command(name = "synapse", about = "Agent-pool orchestration server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long, default_value_t = 3200)]
        port: u16,
    },
    /// Run a single goal through the pipeline and print the result
    Run {
        goal: String,
        #[arg(long, default_value = "free")]
        tier: String,
    },
}

/// Application state
struct AppState {
    orchestrator: Arc<Orchestrator>,
    db: Arc<SynapseDb>,
    event_tx: broadcast::Sender<Event>,
}

type SharedState = Arc<AppState>;

// === API Types ===

#[derive(Deserialize, ToSchema)]
struct StartSessionRequest {
    goal: String,
    #[serde(default = "default_tier")]
    tier: String,
}

fn default_tier() -> String {
    "free".to_string()
}

#[derive(Serialize, ToSchema)]
struct StartSessionResponse {
    session_id: String,
}

#[derive(Serialize, ToSchema)]
struct ApiResponse {
    success: bool,
    message: String,
}

#[derive(Serialize, ToSchema)]
struct StatusResponse {
    session_id: String,
    state: String,
    current_stage: Option<String>,
    node_status: Option<String>,
    attempt_count: u32,
    last_error: Option<String>,
}

impl From<SessionStatus> for StatusResponse {
    fn from(status: SessionStatus) -> Self {
        Self {
            session_id: status.session_id,
            state: status.state.as_str().to_string(),
            current_stage: status.current_stage,
            node_status: status.node_status.map(|s| format!("{s:?}").to_lowercase()),
            attempt_count: status.attempt_count,
            last_error: status.last_error,
        }
    }
}

#[derive(Serialize, ToSchema)]
struct SessionSummary {
    session_id: String,
    goal: String,
    tier: String,
    state: String,
    closed_at: String,
}

// === Handlers ===

/// Start a new session
#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    tag = "sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 200, body = StartSessionResponse),
        (status = 400, body = ApiResponse)
    )
)]
async fn start_session(
    State(state): State<SharedState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    match state.orchestrator.start_session(&req.goal, &req.tier) {
        Ok(session_id) => {
            (StatusCode::OK, Json(StartSessionResponse { session_id })).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse {
                success: false,
                message: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// Stop a session
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/stop",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    responses((status = 200, body = ApiResponse), (status = 404, body = ApiResponse))
)]
async fn stop_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    control_response(state.orchestrator.stop_session(&id).await, "stop requested")
}

/// Pause a session
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/pause",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    responses((status = 200, body = ApiResponse), (status = 404, body = ApiResponse))
)]
async fn pause_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    control_response(
        state.orchestrator.pause_session(&id).await,
        "pause requested",
    )
}

/// Resume a paused session
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/resume",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    responses((status = 200, body = ApiResponse), (status = 404, body = ApiResponse))
)]
async fn resume_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    control_response(
        state.orchestrator.resume_session(&id).await,
        "resume requested",
    )
}

fn control_response(result: Result<(), CoreError>, message: &str) -> axum::response::Response {
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                message: message.to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                success: false,
                message: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// Current status of a live session
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}/status",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    responses((status = 200, body = StatusResponse), (status = 404, body = ApiResponse))
)]
async fn session_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.get_status(&id) {
        Ok(status) => (StatusCode::OK, Json(StatusResponse::from(status))).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                success: false,
                message: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// Archived sessions, most recently closed first
#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "sessions",
    responses((status = 200, body = [SessionSummary]))
)]
async fn list_sessions(State(state): State<SharedState>) -> impl IntoResponse {
    let archive = SessionArchive::new(&state.db);
    let records = archive.list(100).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to list session archive");
        Vec::new()
    });
    let summaries: Vec<SessionSummary> = records
        .into_iter()
        .map(|r| SessionSummary {
            session_id: r.session_id,
            goal: r.goal,
            tier: r.tier,
            state: r.state.as_str().to_string(),
            closed_at: r.closed_at.to_rfc3339(),
        })
        .collect();
    Json(summaries)
}

/// SSE feed of lifecycle events with heartbeat
async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.event_tx.subscribe();

    // Timeout-based stream with a heartbeat comment every 15 seconds
    let stream = stream::unfold(rx, |mut rx| async move {
        let timeout = tokio::time::timeout(Duration::from_secs(15), rx.recv()).await;

        match timeout {
            Ok(Ok(event)) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                Some((Ok(SseEvent::default().data(json)), rx))
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "sse subscriber lagged");
                Some((Ok(SseEvent::default().comment("lagged")), rx))
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => None,
            Err(_) => Some((Ok(SseEvent::default().comment("heartbeat")), rx)),
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Synapse API",
        version = "1.0.0",
        description = "Agent-pool orchestration: sessions, status, archive, events"
    ),
    paths(
        start_session,
        stop_session,
        pause_session,
        resume_session,
        session_status,
        list_sessions
    ),
    components(schemas(
        StartSessionRequest,
        StartSessionResponse,
        ApiResponse,
        StatusResponse,
        SessionSummary
    ))
)]
struct ApiDoc;

async fn serve_openapi() -> impl IntoResponse {
    let spec = ApiDoc::openapi().to_json().unwrap_or_default();
    ([("content-type", "application/json")], spec)
}

// === Runtime assembly ===

/// Everything a running orchestrator needs, wired together
fn build_runtime(db: Arc<SynapseDb>) -> Arc<Orchestrator> {
    let bus = Arc::new(EventBus::new());
    let router = Arc::new(MoeRouter::new());
    let memory: Arc<dyn MemoryEngine> = Arc::new(SqliteSnapshots::new(&db));

    // A small local pool covering the whole default pipeline. In a
    // deployment these would be remote agents registering themselves.
    let pool: &[(&str, &[&str])] = &[
        ("worker-alpha", &["validate", "test"]),
        ("worker-beta", &["review", "deploy"]),
        ("worker-gamma", &["validate", "test", "review", "deploy", "integrate"]),
    ];
    for (agent_id, caps) in pool {
        let descriptor = AgentDescriptor::new(*agent_id).with_capabilities(caps.iter().copied());
        router.register(descriptor.clone());
        let backend: Arc<dyn AgentBackend> = Arc::new(LocalBackend::default());
        spawn_agent(descriptor, backend, bus.clone(), memory.clone());
    }

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        default_stages(),
        bus,
        router,
        memory,
    )
    .with_db(db);
    Arc::new(orchestrator)
}

/// Forward lifecycle events from the bus into the SSE broadcast channel
/// and the durable event log.
fn spawn_event_bridge(
    orchestrator: &Arc<Orchestrator>,
    db: Arc<SynapseDb>,
    event_tx: broadcast::Sender<Event>,
) {
    for pattern in ["session.*", "node.*", "gate.*", "handoff.*"] {
        let mut sub = orchestrator.bus().subscribe(pattern);
        let db = db.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                if let Err(e) = EventLog::new(&db).record(&event) {
                    tracing::warn!(error = %e, topic = %event.topic, "failed to log event");
                }
                let _ = event_tx.send(event);
            }
        });
    }
}

async fn run_server(port: u16) -> anyhow::Result<()> {
    let db = Arc::new(SynapseDb::open()?);
    let orchestrator = build_runtime(db.clone());

    let (event_tx, _) = broadcast::channel(256);
    spawn_event_bridge(&orchestrator, db.clone(), event_tx.clone());

    let state: SharedState = Arc::new(AppState {
        orchestrator,
        db,
        event_tx,
    });

    let app = Router::new()
        .route("/api/v1/sessions", post(start_session).get(list_sessions))
        .route("/api/v1/sessions/:id/stop", post(stop_session))
        .route("/api/v1/sessions/:id/pause", post(pause_session))
        .route("/api/v1/sessions/:id/resume", post(resume_session))
        .route("/api/v1/sessions/:id/status", get(session_status))
        .route("/api/v1/events", get(events))
        .route("/api/openapi.json", get(serve_openapi))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "synapse server listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// One-shot mode: run a goal through the pipeline and print the outcome
async fn run_once(goal: &str, tier: &str) -> anyhow::Result<()> {
    let db = Arc::new(SynapseDb::open()?);
    let orchestrator = build_runtime(db);

    let session_id = orchestrator.start_session(goal, tier)?;
    println!("session {session_id} started");

    let mut last_line = String::new();
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = orchestrator.get_status(&session_id)?;
        if let Some(stage) = &status.current_stage {
            let line = format!(
                "  [{}] stage {stage} ({:?})",
                status.state.as_str(),
                status.node_status
            );
            if line != last_line {
                println!("{line}");
                last_line = line;
            }
        }
        if status.state.is_terminal() {
            println!("session ended: {}", status.state.as_str());
            if let Some(err) = status.last_error {
                println!("  last error: {err}");
            }
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => run_server(port).await,
        Commands::Run { goal, tier } => run_once(&goal, &tier).await,
    }
}
