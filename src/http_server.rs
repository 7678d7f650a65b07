//! HTTP and WebSocket server using Axum.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, Method},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, RelayError};
use crate::gateway::{ExecutionRequest, SubmitRequest};
use crate::protocol::{ClientEvent, EventSender, Member, ServerEvent};
use crate::relay::SessionInfo;
use crate::security::{rate_limit, with_security_headers};
use crate::staging;
use crate::state::AppState;

/// How often per-client rate limit state is swept for idle clients.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompileResponse {
    status: &'static str,
    connection_id: String,
    run_id: String,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let mut app = Router::new()
        // Execution
        .route("/compile", post(compile))
        // Collaboration
        .route("/ws", get(ws_handler))
        .route("/sessions", get(list_sessions))
        .route("/rooms/:id", get(get_room))
        // Health check
        .route("/health", get(health));
    if let Some(limiter) = state.limiter.clone() {
        app = app.layer(middleware::from_fn_with_state(limiter, rate_limit));
    }

    with_security_headers(
        app.layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(state),
    )
}

/// Clear leftovers from a previous process, bind, and serve until ctrl-c.
pub async fn run_server(config: Config) -> io::Result<()> {
    match staging::purge(&config.staging_root).await {
        Ok(0) => {}
        Ok(n) => info!("Removed {} stale staging entries", n),
        Err(e) => warn!("Unable to clean staging root {}: {}", config.staging_root.display(), e),
    }

    let state = AppState::new(&config);
    if let Some(limiter) = state.limiter.clone() {
        let limit = limiter.limit();
        info!(requests = limit.requests, window_secs = limit.window.as_secs(), "Rate limiting enabled");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                limiter.forget_idle();
                debug!(clients = limiter.tracked_clients(), "Swept rate limit state");
            }
        });
    }

    let listener = TcpListener::bind(config.addr()).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    info!(
        staging = %config.staging_root.display(),
        runtime = %config.runtime.program,
        time_limit_secs = config.time_limit.as_secs_f64(),
        "Sandbox configuration"
    );

    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn compile(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<CompileResponse>, ApiError> {
    let Json(req) = body?;
    info!(
        "POST /compile - language: {:?}, connection: {:?}",
        req.language, req.connection_id
    );
    let request = ExecutionRequest::try_from(req)?;
    let handle = state.gateway.submit(request).await?;

    Ok(Json(CompileResponse {
        status: "started",
        connection_id: handle.session_id().to_string(),
        run_id: handle.id().to_string(),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.relay.sessions().await)
}

async fn get_room(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<Member>> {
    Json(state.relay.roster(&id).await)
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per connection: inbound frames are handled in order, outbound events are written by
/// a companion task draining the connection's queue.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let conn_id = state.relay.connect(tx.clone()).await;

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error on {}: {}", conn_id, e);
                break;
            }
        };

        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => {
                if let Err(e) = handle_event(&state, &conn_id, event).await {
                    send_error(&tx, e.to_string());
                }
            }
            Err(e) => {
                warn!("Invalid message from {}: {}", conn_id, e);
                send_error(&tx, format!("Invalid message: {}", e));
            }
        }
    }

    state.relay.disconnect(&conn_id).await;
    send_task.abort();
}

async fn handle_event(state: &AppState, conn_id: &str, event: ClientEvent) -> Result<(), RelayError> {
    match event {
        ClientEvent::Join { room_id, display_name } => {
            state.relay.join(conn_id, &room_id, &display_name).await?;
        }
        ClientEvent::CodeChange { code } => {
            state.relay.code_change(conn_id, &code).await?;
        }
        ClientEvent::ProgramInput(text) => {
            state.gateway.send_input(conn_id, &text).await;
        }
        ClientEvent::Leave => {
            state.relay.leave(conn_id).await?;
        }
    }
    Ok(())
}

fn send_error(tx: &EventSender, message: String) {
    let _ = tx.send(ServerEvent::Error { message });
}
