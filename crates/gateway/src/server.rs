//! The WebSocket gateway server.
//!
//! Per accepted socket: send a `connect.challenge` event carrying a random
//! nonce, gate everything except `ping`/`health` behind a successful
//! `connect`, then dispatch requests through the method registry. A
//! wildcard bus subscription fans every event out to all authenticated
//! connections; a connection that cannot keep up is disconnected rather
//! than allowed to backpressure producers.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use valet_events::{Event, EventKind};

use crate::auth::{authorize_connect, AuthMethod, DeviceIdentity};
use crate::frames::{event_frame, ErrorCode, ErrorShape, RequestFrame};
use crate::methods::{authorize, default_operator_scopes, validate_params};
use crate::state::AppState;

/// Outbound frames buffered per connection before it is dropped as slow.
const OUTBOUND_BUFFER: usize = 256;

/// Protocol window supported by this server.
const PROTOCOL_MIN: u64 = 1;
const PROTOCOL_MAX: u64 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection bookkeeping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ConnectionHandle {
    tx: mpsc::Sender<String>,
    authenticated: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Per-connection handshake and authorization state.
pub(crate) struct ConnState {
    pub authenticated: bool,
    shared_auth: Arc<AtomicBool>,
    pub role: String,
    pub scopes: HashSet<String>,
    pub protocol: u64,
    pub nonce: String,
    pub challenge_at: DateTime<Utc>,
    pub client_ip: Option<IpAddr>,
    pub client_info: Value,
}

impl ConnState {
    fn new(nonce: String, client_ip: Option<IpAddr>, shared_auth: Arc<AtomicBool>) -> Self {
        Self {
            authenticated: false,
            shared_auth,
            role: "operator".into(),
            scopes: HashSet::new(),
            protocol: PROTOCOL_MIN,
            nonce,
            challenge_at: Utc::now(),
            client_ip,
            client_info: Value::Null,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GatewayServer {
    state: AppState,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_conn_id: AtomicU64,
    seq: AtomicU64,
}

impl GatewayServer {
    pub fn new(state: AppState) -> Arc<Self> {
        let server = Arc::new(Self {
            state,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            seq: AtomicU64::new(1),
        });
        server.subscribe_broadcast();
        server
    }

    /// Fan every bus event out to all authenticated connections.
    fn subscribe_broadcast(self: &Arc<Self>) {
        let server = Arc::downgrade(self);
        self.state.bus.subscribe(None, move |event: Event| {
            let server = server.clone();
            async move {
                if let Some(server) = server.upgrade() {
                    server.broadcast(&event);
                }
                Ok(())
            }
        });
    }

    fn broadcast(&self, event: &Event) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = event_frame(event.kind.as_str(), event.to_value(), Some(seq));

        let mut dead: Vec<u64> = Vec::new();
        {
            let connections = self.connections.lock();
            for (&conn_id, handle) in connections.iter() {
                if !handle.authenticated.load(Ordering::Acquire) {
                    continue;
                }
                // A full buffer means a slow client: disconnect it rather
                // than block the bus.
                if handle.tx.try_send(frame.clone()).is_err() {
                    handle.cancel.cancel();
                    dead.push(conn_id);
                }
            }
        }
        if !dead.is_empty() {
            let mut connections = self.connections.lock();
            for conn_id in dead {
                connections.remove(&conn_id);
                tracing::info!(conn_id, "dropped slow or closed connection");
            }
        }
    }

    /// Bind and serve the WebSocket endpoint until the process exits.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let gateway = &self.state.config.gateway;
        let host = match gateway.bind.as_str() {
            "loopback" => "127.0.0.1",
            _ => "0.0.0.0",
        };
        let addr: SocketAddr = format!("{host}:{}", gateway.port).parse()?;

        let app = axum::Router::new()
            .route("/", get(ws_upgrade))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "gateway listening on ws://{addr}/");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    // ── Socket lifecycle ───────────────────────────────────────────

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, addr: SocketAddr) {
        let (mut ws_sink, mut ws_stream) = socket.split();

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();
        let authenticated = Arc::new(AtomicBool::new(false));

        self.connections.lock().insert(
            conn_id,
            ConnectionHandle {
                tx: tx.clone(),
                authenticated: authenticated.clone(),
                cancel: cancel.clone(),
            },
        );

        // Writer task: forwards the outbound buffer to the socket.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(frame) => {
                            if ws_sink.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_cancel.cancelled() => {
                        let _ = ws_sink.close().await;
                        break;
                    }
                }
            }
        });

        // Challenge goes out before anything else.
        let nonce = challenge_nonce();
        let mut conn = ConnState::new(nonce.clone(), Some(addr.ip()), authenticated);
        let challenge = event_frame(
            "connect.challenge",
            json!({
                "nonce": nonce,
                "timestamp": Utc::now().timestamp_millis(),
            }),
            None,
        );
        if tx.send(challenge).await.is_err() {
            self.connections.lock().remove(&conn_id);
            return;
        }
        tracing::info!(conn_id, client = %addr, "connection opened");

        // Reader loop.
        loop {
            tokio::select! {
                maybe = ws_stream.next() => match maybe {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_text(&mut conn, &text).await {
                            if tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // axum answers ping/pong frames itself
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, error = %e, "socket read error");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }

        self.connections.lock().remove(&conn_id);
        cancel.cancel();
        let _ = writer.await;
        tracing::info!(conn_id, "connection closed");
    }

    // ── Frame dispatch ─────────────────────────────────────────────

    /// Handle one text frame, returning the response frame if any.
    pub(crate) async fn handle_text(&self, conn: &mut ConnState, text: &str) -> Option<String> {
        let frame = match RequestFrame::parse(text) {
            Ok(frame) => frame,
            Err(error) => {
                // Malformed frames are rejected, not disconnected.
                return Some(
                    json!({
                        "type": "res",
                        "id": Value::Null,
                        "ok": false,
                        "error": serde_json::to_value(&error).ok()?,
                    })
                    .to_string(),
                );
            }
        };

        if frame.method == "connect" {
            return Some(self.handle_connect(conn, &frame).await);
        }

        if !conn.authenticated && !matches!(frame.method.as_str(), "ping" | "health") {
            return Some(frame.error_response(&ErrorShape::new(
                ErrorCode::AuthRequired,
                "authentication required; send a connect request first",
            )));
        }

        let Some(method) = self.state.methods.get(&frame.method) else {
            return Some(frame.error_response(&ErrorShape::new(
                ErrorCode::MethodNotFound,
                format!("method '{}' not found", frame.method),
            )));
        };

        if let Err(error) = validate_params(&method.schema, &frame.params) {
            return Some(frame.error_response(&error));
        }

        if !authorize(&method, &conn.scopes) {
            tracing::warn!(
                method = %frame.method,
                role = %conn.role,
                "permission denied"
            );
            return Some(frame.error_response(&ErrorShape::new(
                ErrorCode::PermissionDenied,
                format!("insufficient permissions for method '{}'", frame.method),
            )));
        }

        match (method.handler)(self.state.clone(), frame.params.clone()).await {
            Ok(payload) => Some(frame.response(payload)),
            Err(error) => Some(frame.error_response(&error)),
        }
    }

    // ── Handshake ──────────────────────────────────────────────────

    async fn handle_connect(&self, conn: &mut ConnState, frame: &RequestFrame) -> String {
        let params = &frame.params;

        let client_min = params
            .get("minProtocol")
            .and_then(|v| v.as_u64())
            .unwrap_or(PROTOCOL_MIN);
        let client_max = params
            .get("maxProtocol")
            .and_then(|v| v.as_u64())
            .unwrap_or(PROTOCOL_MAX);
        let negotiated = client_max.min(PROTOCOL_MAX);
        if negotiated < client_min.max(PROTOCOL_MIN) {
            return frame.error_response(&ErrorShape::new(
                ErrorCode::HandshakeFailed,
                format!(
                    "no protocol overlap: client [{client_min},{client_max}], \
                     server [{PROTOCOL_MIN},{PROTOCOL_MAX}]"
                ),
            ));
        }

        let auth_params = params.get("auth").cloned().unwrap_or(json!({}));
        let request_token = auth_params.get("token").and_then(|v| v.as_str());
        let request_password = auth_params.get("password").and_then(|v| v.as_str());
        let device = params
            .get("deviceIdentity")
            .and_then(DeviceIdentity::from_params);

        let outcome = authorize_connect(
            &self.state.config.gateway.auth,
            conn.client_ip,
            request_token,
            request_password,
            device.as_ref(),
            &conn.nonce,
            conn.challenge_at,
        );

        if !outcome.ok {
            tracing::warn!(
                client = ?conn.client_ip,
                reason = outcome.reason.as_deref().unwrap_or("unknown"),
                "authentication failed"
            );
            return frame.error_response(&ErrorShape::new(
                ErrorCode::AuthFailed,
                outcome.reason.unwrap_or_else(|| "authentication failed".into()),
            ));
        }

        conn.authenticated = true;
        conn.shared_auth.store(true, Ordering::Release);
        conn.protocol = negotiated;
        conn.client_info = params.get("client").cloned().unwrap_or(Value::Null);
        conn.role = params
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("operator")
            .to_owned();
        conn.scopes = params
            .get("scopes")
            .and_then(|v| v.as_array())
            .map(|scopes| {
                scopes
                    .iter()
                    .filter_map(|s| s.as_str())
                    .map(str::to_owned)
                    .collect::<HashSet<String>>()
            })
            .filter(|scopes| !scopes.is_empty())
            .unwrap_or_else(|| {
                if conn.role == "operator" {
                    default_operator_scopes()
                } else {
                    HashSet::new()
                }
            });

        let auth_method = match outcome.method {
            Some(AuthMethod::LocalDirect) => "local_direct",
            Some(AuthMethod::Token) => "token",
            Some(AuthMethod::Password) => "password",
            Some(AuthMethod::DeviceIdentity) => "device",
            None => "unknown",
        };
        tracing::info!(
            client = ?conn.client_ip,
            protocol = negotiated,
            auth_method,
            role = %conn.role,
            "client connected"
        );

        self.state
            .bus
            .publish(
                Event::new(EventKind::GatewayClientConnected, "gateway").with_data(json!({
                    "client": conn.client_info,
                    "authMethod": auth_method,
                    "role": conn.role,
                })),
            )
            .await;

        let hello = json!({
            "protocol": negotiated,
            "server": {
                "name": "valet-gateway",
                "version": env!("CARGO_PKG_VERSION"),
                "platform": "rust",
            },
            "features": {
                "agent": true,
                "chat": true,
                "sessions": true,
                "channels": true,
                "tools": true,
                "cron": false,
                "nodes": false,
                "devices": true,
            },
            "snapshot": {
                "sessions": self.state.sessions.list(),
                "channels": self.state.channels.list_channels(),
                "agents": ["default"],
            },
        });
        frame.response(hello)
    }
}

/// URL-safe random nonce for the connect challenge.
fn challenge_nonce() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

async fn ws_upgrade(
    State(server): State<Arc<GatewayServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| server.handle_socket(socket, addr))
}
