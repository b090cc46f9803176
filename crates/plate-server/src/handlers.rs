//! HTTP and WebSocket surface.
//!
//! REST routes cover vehicles, messages and chat states. `/ws` lets local
//! clients subscribe to `messages/<plate>` and `chat-state/<plate>` topics
//! and submit chat states without a round trip per keystroke.

use crate::config::Config;
use crate::error::{attach_path, ApiError};
use crate::metrics::{self, ClientMetricsGuard};
use anyhow::Result;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use plate_core::{
    ChatStateRecord, ChatStateRequest, Gateway, MessageRequest, MessageResponse, Publication,
    SecretCipher, Stores, VehicleRecord,
};
use plate_transport::{Connector, TcpConnector};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Accepted plate numbers, e.g. `34ABC123`.
pub const PLATE_PATTERN: &str = r"^\d{2}[A-Z]{1,3}\d{2,4}$";

/// Shared server state.
pub struct AppState {
    pub gateway: Gateway,
    plate_pattern: Regex,
    next_client: AtomicU64,
}

impl AppState {
    /// # Errors
    ///
    /// Returns an error if the plate pattern fails to compile.
    pub fn new(config: &Config, connector: Arc<dyn Connector>, stores: Stores) -> Result<Self> {
        if config.encryption.secret == "change-me" {
            warn!("Using the default encryption secret; set PLATEGATE_SECRET");
        }
        let cipher = Arc::new(SecretCipher::from_secret(&config.encryption.secret));
        Ok(Self {
            gateway: Gateway::new(config.gateway(), connector, stores, cipher),
            plate_pattern: Regex::new(PLATE_PATTERN)?,
            next_client: AtomicU64::new(1),
        })
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(config.tcp()));
    let state = Arc::new(AppState::new(&config, connector, Stores::in_memory())?);

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(Arc::clone(&state));
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("plategate listening on {}", addr);
    info!(
        "Remote server {}:{} (domain {})",
        config.xmpp.host, config.xmpp.port, config.xmpp.domain
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// All routes over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/vehicles", post(register_vehicle).get(list_vehicles))
        .route(
            "/api/vehicles/:plate",
            get(get_vehicle).delete(delete_vehicle),
        )
        .route("/api/messages/send", post(send_message))
        .route(
            "/api/messages/conversation/:plate/:peer",
            get(conversation),
        )
        .route("/api/messages/:plate", get(history))
        // The segment is a message id; it shares its name with the plate routes.
        .route("/api/messages/:plate/read", put(mark_as_read))
        .route("/api/messages/:plate/unread-count", get(unread_count))
        .route("/api/chat-state", post(submit_chat_state))
        .route("/api/chat-state/:plate/:peer", get(current_chat_state))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route_layer(middleware::from_fn(track_latency))
        .layer(middleware::from_fn(attach_path))
        .with_state(state)
}

async fn track_latency(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::record_latency(&route, start.elapsed().as_secs_f64());
    response
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Field-level validation failures, reported together.
#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn required(&mut self, field: &str, value: &str, message: &str) {
        if value.trim().is_empty() {
            self.0.push(format!("{field}: {message}"));
        }
    }

    fn plate(&mut self, pattern: &Regex, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.0.push(format!("{field}: Plate number is required"));
        } else if !pattern.is_match(value) {
            self.0.push(format!(
                "{field}: Invalid plate format. Expected format: 34ABC123"
            ));
        }
    }

    fn finish(self) -> Result<(), ApiError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(self.0.join(", ")))
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::Validation(e.body_text()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VehicleRequest {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    plate_number: String,
}

async fn register_vehicle(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VehicleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<VehicleRecord>), ApiError> {
    let request = body(payload)?;
    let mut violations = Violations::default();
    violations.required("userId", &request.user_id, "User ID is required");
    violations.plate(&state.plate_pattern, "plateNumber", &request.plate_number);
    violations.finish()?;

    info!(plate = %request.plate_number, "Register vehicle");
    let record = state
        .gateway
        .registry()
        .register(&request.user_id, &request.plate_number)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_vehicles(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<VehicleRecord>>, ApiError> {
    Ok(Json(state.gateway.registry().list().await?))
}

async fn get_vehicle(
    State(state): State<Arc<AppState>>,
    Path(plate): Path<String>,
) -> Result<Json<VehicleRecord>, ApiError> {
    Ok(Json(state.gateway.registry().get(&plate).await?))
}

async fn delete_vehicle(
    State(state): State<Arc<AppState>>,
    Path(plate): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!(plate = %plate, "Delete vehicle");
    state.gateway.registry().delete(&plate).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let request = body(payload)?;
    let mut violations = Violations::default();
    violations.required(
        "fromPlateNumber",
        &request.from_plate_number,
        "From plate number is required",
    );
    violations.required(
        "toPlateNumber",
        &request.to_plate_number,
        "To plate number is required",
    );
    violations.required(
        "messageContent",
        &request.message_content,
        "Message content is required",
    );
    violations.finish()?;

    match state.gateway.dispatcher().send(request).await {
        Ok(response) => Ok((StatusCode::CREATED, Json(response))),
        Err(e) => {
            metrics::record_send_failure();
            Err(e.into())
        }
    }
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path(plate): Path<String>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    Ok(Json(state.gateway.dispatcher().history(&plate).await?))
}

async fn conversation(
    State(state): State<Arc<AppState>>,
    Path((plate, peer)): Path<(String, String)>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    Ok(Json(
        state
            .gateway
            .dispatcher()
            .conversation(&plate, &peer)
            .await?,
    ))
}

async fn mark_as_read(
    State(state): State<Arc<AppState>>,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Path(id) = id.map_err(|e| ApiError::Validation(e.body_text()))?;
    Ok(Json(state.gateway.dispatcher().mark_as_read(id).await?))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    Path(plate): Path<String>,
) -> Result<Json<u64>, ApiError> {
    Ok(Json(state.gateway.dispatcher().unread_count(&plate).await?))
}

fn validate_chat_state(request: &ChatStateRequest) -> Result<(), ApiError> {
    let mut violations = Violations::default();
    violations.required("plateNumber", &request.plate_number, "Plate number is required");
    violations.required(
        "chatWithPlate",
        &request.chat_with_plate,
        "Chat partner is required",
    );
    violations.required("state", &request.state, "State is required");
    violations.finish()
}

async fn submit_chat_state(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatStateRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let request = body(payload)?;
    validate_chat_state(&request)?;
    metrics::record_chat_state("http");
    state.gateway.chat_states().submit_detached(request);
    Ok(StatusCode::ACCEPTED)
}

async fn current_chat_state(
    State(state): State<Arc<AppState>>,
    Path((plate, peer)): Path<(String, String)>,
) -> Result<Json<ChatStateRecord>, ApiError> {
    state
        .gateway
        .chat_states()
        .current_state(&plate, &peer)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No chat state for {plate} -> {peer}")))
}

/// Frames sent by local WebSocket clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    ChatState(ChatStateRequest),
}

/// Frames pushed to local WebSocket clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerFrame {
    Publication {
        topic: String,
        payload: serde_json::Value,
    },
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Error {
        message: String,
    },
}

type WsSink = SplitSink<WebSocket, Message>;

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ClientMetricsGuard::new();
    let client_id = format!(
        "client_{}",
        state.next_client.fetch_add(1, Ordering::Relaxed)
    );
    debug!(client = %client_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    let (pub_tx, mut pub_rx) = mpsc::unbounded_channel::<Arc<Publication>>();

    loop {
        tokio::select! {
            biased;

            Some(publication) = pub_rx.recv() => {
                let payload = match serde_json::from_slice(&publication.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %publication.topic, error = %e, "Dropping non-JSON publication");
                        continue;
                    }
                };
                let frame = ServerFrame::Publication {
                    topic: publication.topic.clone(),
                    payload,
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => handle_frame(frame, &client_id, &state, &mut forwarders, &pub_tx),
                        Err(e) => Some(ServerFrame::Error {
                            message: format!("Invalid frame: {e}"),
                        }),
                    },
                    Some(Ok(Message::Binary(_))) => Some(ServerFrame::Error {
                        message: "Binary frames are not supported".to_string(),
                    }),
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        None
                    }
                    Some(Ok(Message::Pong(_))) => None,
                    Some(Ok(Message::Close(_))) => {
                        debug!(client = %client_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %client_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => break,
                };
                if let Some(reply) = reply {
                    if send_frame(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    for (_, handle) in forwarders {
        handle.abort();
    }
    let fanout = state.gateway.fanout();
    fanout.unsubscribe_all(&client_id);
    metrics::set_active_topics(fanout.stats().topic_count);

    debug!(client = %client_id, "WebSocket disconnected");
}

fn handle_frame(
    frame: ClientFrame,
    client_id: &str,
    state: &AppState,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    pub_tx: &mpsc::UnboundedSender<Arc<Publication>>,
) -> Option<ServerFrame> {
    let fanout = state.gateway.fanout();
    match frame {
        ClientFrame::Subscribe { topic } => {
            debug!(client = %client_id, topic = %topic, "Subscribe");
            match fanout.subscribe(client_id, &topic) {
                Ok(mut rx) => {
                    let tx = pub_tx.clone();
                    let handle = tokio::spawn(async move {
                        loop {
                            match rx.recv().await {
                                Ok(publication) => {
                                    if tx.send(publication).is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            }
                        }
                    });
                    forwarders.insert(topic.clone(), handle);
                    metrics::record_subscription();
                    metrics::set_active_topics(fanout.stats().topic_count);
                    Some(ServerFrame::Subscribed { topic })
                }
                Err(e) => Some(ServerFrame::Error {
                    message: ApiError::from(e).to_string(),
                }),
            }
        }

        ClientFrame::Unsubscribe { topic } => {
            if let Some(handle) = forwarders.remove(&topic) {
                handle.abort();
            }
            match fanout.unsubscribe(client_id, &topic) {
                Ok(()) => {
                    metrics::set_active_topics(fanout.stats().topic_count);
                    Some(ServerFrame::Unsubscribed { topic })
                }
                Err(e) => Some(ServerFrame::Error {
                    message: e.to_string(),
                }),
            }
        }

        ClientFrame::ChatState(request) => {
            if let Err(e) = validate_chat_state(&request) {
                return Some(ServerFrame::Error {
                    message: e.to_string(),
                });
            }
            metrics::record_chat_state("websocket");
            state.gateway.chat_states().submit_detached(request);
            None
        }
    }
}

async fn send_frame(sender: &mut WsSink, frame: &ServerFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}
