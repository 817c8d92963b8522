use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use bevy::prelude::*;
use crossbeam_channel::Sender;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::protocol::{ClientMessage, ServerMessage};
use super::session::{ConnectionId, NetEvent};
use crate::config::UserConfig;

const MAX_TRACKED_BUCKETS: usize = 4096;

/// Token lookup plus a per-user upgrade rate limit.
#[derive(Clone)]
pub struct ServerSecurity {
    tokens: Arc<HashMap<String, String>>,
    rate_limit_per_sec: u32,
    buckets: Arc<Mutex<HashMap<String, RateBucket>>>,
}

#[derive(Clone)]
struct RateBucket {
    window_start: Instant,
    count: u32,
}

/// Set on the request by [`session_guard`] once the token resolved.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser(pub String);

impl ServerSecurity {
    pub fn new(tokens: HashMap<String, String>, rate_limit_per_sec: u32) -> Self {
        Self {
            tokens: Arc::new(tokens),
            rate_limit_per_sec: rate_limit_per_sec.max(1),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_users(users: &[UserConfig], rate_limit_per_sec: u32) -> Self {
        let tokens = users
            .iter()
            .filter(|u| !u.token.trim().is_empty())
            .map(|u| (u.token.trim().to_string(), u.name.clone()))
            .collect();
        Self::new(tokens, rate_limit_per_sec)
    }

    fn user_for(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(String::as_str)
    }

    fn allow(&self, user: &str) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let entry = buckets.entry(user.to_string()).or_insert(RateBucket {
            window_start: now,
            count: 0,
        });
        if now.duration_since(entry.window_start).as_secs_f32() >= 1.0 {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        let allowed = entry.count <= self.rate_limit_per_sec;

        if buckets.len() > MAX_TRACKED_BUCKETS {
            buckets.retain(|_, v| now.duration_since(v.window_start).as_secs_f32() < 10.0);
        }
        allowed
    }
}

pub async fn session_guard(
    State(security): State<ServerSecurity>,
    mut req: Request,
    next: Next,
) -> Response {
    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    let api_key_header = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    let bearer = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or(auth_header);

    let user = security
        .user_for(bearer)
        .or_else(|| security.user_for(api_key_header))
        .map(str::to_string);
    let Some(user) = user else {
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized: send Authorization: Bearer <token>",
        )
            .into_response();
    };
    if !security.allow(&user) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    req.extensions_mut().insert(AuthenticatedUser(user));
    next.run(req).await
}

#[derive(Clone)]
struct ServerState {
    events: Sender<NetEvent>,
    next_conn: Arc<AtomicU64>,
}

pub fn build_router(events: Sender<NetEvent>, security: ServerSecurity) -> Router {
    let state = ServerState {
        events,
        next_conn: Arc::new(AtomicU64::new(1)),
    };
    Router::new()
        .route("/lua", get(lua_socket))
        .layer(middleware::from_fn_with_state(security, session_guard))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn lua_socket(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state, user.0))
}

async fn run_connection(socket: WebSocket, state: ServerState, user: String) {
    let conn: ConnectionId = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (outbox, mut outbound) = mpsc::unbounded_channel::<ServerMessage>();
    if state
        .events
        .send(NetEvent::Connected {
            conn,
            user,
            outbox,
        })
        .is_err()
    {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink
                .send(Message::Binary(message.encode().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(bytes)) => match ClientMessage::decode(&bytes) {
                Ok(message) => {
                    if state.events.send(NetEvent::Message { conn, message }).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("[LuaHost net] Dropping malformed frame from #{conn}: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let _ = state.events.send(NetEvent::Disconnected { conn });
    writer.abort();
}

/// Serves `/lua` on its own thread and tokio runtime. Bind failures are logged
/// and end the thread; the simulation keeps running without a listener.
pub fn spawn_server(
    bind: String,
    security: ServerSecurity,
    events: Sender<NetEvent>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("luahost-net".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("[LuaHost net] Failed to start runtime: {e}");
                    return;
                }
            };
            rt.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(&bind).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("[LuaHost net] Failed to bind {bind}: {e}");
                        return;
                    }
                };
                info!("[LuaHost net] Listening on ws://{bind}/lua");
                if let Err(e) = axum::serve(listener, build_router(events, security)).await {
                    error!("[LuaHost net] Server stopped: {e}");
                }
            });
        })
}
