//! Assessment Collab Server - real-time presence and edit relay
//!
//! A collaboration layer for shared assessments using:
//! - Axum with WebSocket for live connections
//! - JSON protocol for presence, cursor, edit and comment events
//! - Per-room locking in an in-memory room registry
//! - JWT or remote identity verification before any socket is opened

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

mod auth;
mod clock;
mod config;
mod room;
mod sync;

use auth::{extract_credential, AuthError, Authenticator, Identity};
use config::ServerConfig;
use room::RoomSummary;
use sync::{
    presence::Participant,
    protocol::{decode_client, encode_server, undecodable_edit_section, ErrorCode, ServerMessage},
    CollabError, CollabServer, RoomId,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Room presence and relays
    server: Arc<CollabServer>,
    /// Credential verification
    authenticator: Authenticator,
}

impl AppState {
    pub fn new(server: Arc<CollabServer>, authenticator: Authenticator) -> Self {
        Self {
            server,
            authenticator,
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_rooms: usize,
    active_participants: usize,
    connections: usize,
}

#[derive(Debug, Serialize)]
struct RoomListResponse {
    rooms: Vec<RoomSummary>,
    total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomDetailResponse {
    room_id: RoomId,
    participants: Vec<Participant>,
}

/// `?token=` fallback for clients that cannot set headers
#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Errors returned by HTTP handlers
#[derive(Debug)]
enum ApiError {
    Auth(AuthError),
    Collab(CollabError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Auth(AuthError::ProviderUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Collab(CollabError::RoomNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Collab(_) => StatusCode::BAD_REQUEST,
        };
        let message = match self {
            ApiError::Auth(e) => e.to_string(),
            ApiError::Collab(e) => e.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: stats.uptime_seconds,
        active_rooms: stats.active_rooms,
        active_participants: stats.active_participants,
        connections: stats.connections,
    })
}

/// List live rooms
async fn list_rooms(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<RoomListResponse>, ApiError> {
    authenticate(&state, &headers, &query).await?;

    let rooms = state.server.registry().summaries();
    Ok(Json(RoomListResponse {
        total: rooms.len(),
        rooms,
    }))
}

/// Roster of one room
async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<RoomDetailResponse>, ApiError> {
    authenticate(&state, &headers, &query).await?;

    let participants = state
        .server
        .registry()
        .snapshot(&room_id)
        .ok_or_else(|| ApiError::Collab(CollabError::RoomNotFound(room_id.clone())))?;

    Ok(Json(RoomDetailResponse {
        room_id,
        participants,
    }))
}

async fn authenticate(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<Identity, ApiError> {
    let credential = extract_credential(headers, query.token.as_deref());
    state
        .authenticator
        .authenticate(credential.as_deref())
        .await
        .map_err(|e| {
            warn!("Rejected credential: {}", e);
            ApiError::Auth(e)
        })
}

/// WebSocket upgrade handler. The credential is verified before upgrading.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let identity = authenticate(&state, &headers, &query).await?;

    info!("WebSocket upgrade request from {}", identity.user_id);
    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, identity, state)))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, identity: Identity, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let server = state.server.clone();
    let (connection_id, mut rx) = server.connect(identity);

    // Task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match encode_server(&msg) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for connection {}", connection_id);
    });

    // Task to handle incoming WebSocket messages
    let recv_server = server.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match decode_client(&text) {
                    Ok(client_msg) => recv_server.handle_message(connection_id, client_msg),
                    Err(e) => {
                        debug!("Undecodable frame from {}: {}", connection_id, e);
                        if let Some(section) = undecodable_edit_section(&text) {
                            recv_server.reject_edit(connection_id, e.to_string(), section);
                        } else {
                            let reply = ServerMessage::Error {
                                code: ErrorCode::from(&e),
                                message: e.to_string(),
                            };
                            let _ = recv_server.send_to(connection_id, reply);
                        }
                    }
                },
                Message::Binary(_) => {
                    debug!("Ignoring binary frame from {}", connection_id);
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", connection_id);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for connection {}", connection_id);
    });

    // Whichever side finishes first takes the other down with it
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    server.disconnect(connection_id);
}

// ============================================================================
// ROUTER
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Room inspection
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/:room_id", get(get_room))
        // WebSocket endpoints
        .route("/ws", get(ws_handler))
        .route("/api/socket", get(ws_handler))
        .with_state(state)
}

fn cors_layer(origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let allow_origin = match origin {
        Some(origin) => AllowOrigin::exact(
            HeaderValue::from_str(origin).with_context(|| format!("Invalid CORS_ORIGIN {:?}", origin))?,
        ),
        None => AllowOrigin::from(Any),
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "assessment_collab_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    let authenticator =
        Authenticator::from_config(&config.auth).context("Failed to set up identity provider")?;

    let server = Arc::new(CollabServer::new(config.collab.clone()));
    let background_handles = server.clone().start_background_tasks();

    let state = Arc::new(AppState::new(server.clone(), authenticator));
    let app = build_router(state)
        .layer(cors_layer(config.cors_origin.as_deref())?)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Assessment collab server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    server.shutdown();
    background_handles.wait().await;
    info!("Server stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support;
    use crate::sync::protocol::decode_server;
    use crate::sync::CollabConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_state() -> Arc<AppState> {
        let server = Arc::new(CollabServer::new(CollabConfig::default()));
        Arc::new(AppState::new(server, test_support::authenticator()))
    }

    async fn spawn_app() -> (SocketAddr, Arc<AppState>) {
        let state = test_state();
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr, user: &str) -> Client {
        let url = format!("ws://{}/ws?token={}:{}@example.com", addr, user, user);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn send_json(ws: &mut Client, value: serde_json::Value) {
        ws.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    async fn next_message(ws: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return decode_server(&text);
            }
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = build_router(test_state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["activeRooms"], 0);
    }

    #[tokio::test]
    async fn test_rooms_require_credential() {
        let response = build_router(test_state())
            .oneshot(Request::builder().uri("/api/rooms").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_room_detail_not_found() {
        let response = build_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/api/rooms/missing")
                    .header("Authorization", "Bearer u-1:a@example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_socket_rejected_without_credential() {
        let (addr, state) = spawn_app().await;

        let result = connect_async(format!("ws://{}/ws", addr)).await;
        match result {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16());
            }
            other => panic!("Expected HTTP 401, got {:?}", other.map(|_| ())),
        }
        assert_eq!(state.server.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_join_and_leave_over_socket() {
        let (addr, state) = spawn_app().await;
        let mut a = connect(addr, "a").await;
        let mut b = connect(addr, "b").await;

        send_json(&mut a, serde_json::json!({"type": "join-room", "roomId": "r1"})).await;
        match next_message(&mut a).await {
            ServerMessage::ActiveUsers { users } => assert_eq!(users.len(), 1),
            other => panic!("Unexpected message: {:?}", other),
        }

        send_json(&mut b, serde_json::json!({"type": "join-assessment", "assessmentId": "r1"})).await;
        match next_message(&mut b).await {
            ServerMessage::ActiveUsers { users } => {
                let ids: Vec<_> = users.iter().map(|u| u.user_id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(matches!(
            next_message(&mut a).await,
            ServerMessage::UserJoined { user_id, .. } if user_id == "b"
        ));

        a.close(None).await.unwrap();
        assert_eq!(
            next_message(&mut b).await,
            ServerMessage::UserLeft {
                user_id: "a".to_string()
            }
        );
        assert_eq!(state.server.registry().snapshot("r1").map(|r| r.len()), Some(1));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let (addr, _) = spawn_app().await;
        let mut a = connect(addr, "a").await;

        a.send(WsMessage::Text("{not json".to_string())).await.unwrap();

        assert!(matches!(
            next_message(&mut a).await,
            ServerMessage::Error {
                code: ErrorCode::InvalidMessage,
                ..
            }
        ));

        // The connection stays usable
        send_json(&mut a, serde_json::json!({"type": "ping", "timestamp": 7})).await;
        assert!(matches!(next_message(&mut a).await, ServerMessage::Pong { timestamp: 7, .. }));
    }

    #[tokio::test]
    async fn test_malformed_edit_gets_edit_error() {
        let (addr, _) = spawn_app().await;
        let mut a = connect(addr, "a").await;
        send_json(&mut a, serde_json::json!({"type": "join-room", "roomId": "r1"})).await;
        assert!(matches!(next_message(&mut a).await, ServerMessage::ActiveUsers { .. }));

        // No data
        send_json(
            &mut a,
            serde_json::json!({"type": "assessment-edit", "roomId": "r1", "section": "scores"}),
        )
        .await;
        assert!(matches!(
            next_message(&mut a).await,
            ServerMessage::EditError { section, .. } if section == "scores"
        ));

        // Section of the wrong type fails to decode at all
        send_json(
            &mut a,
            serde_json::json!({"type": "assessment-edit", "roomId": "r1", "section": 7, "data": {}, "version": 1}),
        )
        .await;
        assert!(matches!(
            next_message(&mut a).await,
            ServerMessage::EditError { section, .. } if section.is_empty()
        ));
    }
}
