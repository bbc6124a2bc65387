use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use std::convert::Infallible;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use task_warden::core::types::{ErrorResponse, MessageResponse, StatusResponse, TaskListResponse};
use task_warden::dispatch::{StartOutcome, StopOutcome};
use task_warden::{load_warden_config, AppState, SourceKind};

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

fn port_from_env() -> Option<u16> {
    for k in ["WARDEN_PORT", "PORT"] {
        if let Ok(v) = std::env::var(k) {
            if let Ok(p) = v.trim().parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Resolve config before tracing init so the optional log-file layer knows
    // its destination.
    let settings = load_warden_config().resolve()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());
    match &settings.storage.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        None => registry.init(),
    }

    info!("Starting task-warden");

    let state = AppState::new(settings)?;

    // Build router
    let app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/start", get(start_handler))
        .route("/shutdown", get(shutdown_handler))
        .route("/api/status", get(status_handler))
        .route("/api/task/list", get(task_list_handler))
        .route("/api/task/reset", get(task_reset_handler))
        .route("/api/metrics", get(metrics_feed_handler))
        .route("/api/source/{name}/enable", post(source_enable_handler))
        .route("/api/source/{name}/disable", post(source_disable_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start server
    let port: u16 = parse_port_from_args().or_else(port_from_env).unwrap_or(5000);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT/WARDEN_PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("Control API listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
            _ = async {
                if let Some(ref mut s) = sigint {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    // Cooperative: the run loop observes the cleared flag within ~1 s.
    state.dispatcher.stop();
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "task-warden",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn start_handler(State(state): State<AppState>) -> Json<MessageResponse> {
    match state.dispatcher.start() {
        StartOutcome::Started => Json(MessageResponse::new("starting task-warden run...")),
        StartOutcome::AlreadyActive => Json(MessageResponse::new("run already initiated")),
    }
}

async fn shutdown_handler(State(state): State<AppState>) -> Json<MessageResponse> {
    match state.dispatcher.stop() {
        StopOutcome::Signalled => Json(MessageResponse::new("sending shut down signal")),
        StopOutcome::AlreadyIdle => Json(MessageResponse::new("dispatcher is idle")),
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.dispatcher.status())
}

async fn task_list_handler(State(state): State<AppState>) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        message: state.dispatcher.tracker().snapshot(),
    })
}

async fn task_reset_handler(State(state): State<AppState>) -> Json<MessageResponse> {
    state.dispatcher.tracker().reset();
    Json(MessageResponse::new("task queue successfully cleared"))
}

/// Interval-push metrics feed (Server-Sent Events).
async fn metrics_feed_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let period = state.dispatcher.settings().dispatch.metrics_interval;
    let stream = futures::stream::unfold(
        (state, tokio::time::interval(period)),
        |(state, mut interval)| async move {
            interval.tick().await;
            let snapshot = state.metrics_snapshot();
            let event = Event::default()
                .json_data(&snapshot)
                .unwrap_or_else(|_| Event::default().data("{}"));
            Some((Ok::<_, Infallible>(event), (state, interval)))
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn source_enable_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<ErrorResponse>)> {
    set_source_enabled(&state, &name, true)
}

async fn source_disable_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<ErrorResponse>)> {
    set_source_enabled(&state, &name, false)
}

fn set_source_enabled(
    state: &AppState,
    name: &str,
    enabled: bool,
) -> Result<Json<MessageResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Some(kind) = SourceKind::parse(name) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown source '{}'", name),
            }),
        ));
    };
    state.dispatcher.set_source_enabled(kind, enabled);
    Ok(Json(MessageResponse::new(format!(
        "source '{}' {}",
        kind,
        if enabled { "enabled" } else { "disabled" }
    ))))
}
