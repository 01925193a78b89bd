//! WebSocket sessions for players and spectators.
//!
//! ## Architecture
//!
//! - **`PlaySession`** — an actor per agent connection. It authenticates
//!   the agent (from a connection parameter or a first `auth` message
//!   within a 10 second window), then forwards `seek`, `cancel_seek`,
//!   and `move` actions to the [`PlayCoordinator`](crate::coordinator::PlayCoordinator)
//!   under the coarse state lock. Events pushed by the coordinator arrive
//!   through the actor mailbox, which preserves send order per session.
//!
//! - **`SpectatorSession`** — an actor per spectator connection, bound to
//!   a single game. It receives the augmented initial `state` on join and
//!   every subsequent `state`/`game_end` broadcast.
//!
//! ## Client → Server actions
//!
//! | Action        | Extra fields        |
//! |---------------|---------------------|
//! | `auth`        | `api_key`           |
//! | `seek`        | `category`          |
//! | `cancel_seek` | `category`          |
//! | `move`        | `move` (UCI)        |
//! | `ping`        | —                   |
//!
//! Server events share the `{ "event": ..., ... }` envelope. Close codes:
//! 4000 superseded connection, 4001 authentication failed.

use actix::prelude::*;
use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::api::AppState;
use crate::coordinator::CLOSE_AUTH_FAILED;
use crate::storage::{self, AgentRow};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How often the server pings to keep the connection alive.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum silence before a connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Window for the client to authenticate before the session is closed.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Shared message types
// ---------------------------------------------------------------------------

/// A pre-serialized event pushed to a session by the coordinator.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub String);

/// Instruction to close a session with a specific close code.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseWs {
    pub code: u16,
    pub reason: &'static str,
}

/// A single JSON message received from a client.
///
/// Optional fields default to `None` so clients only supply what their
/// action needs.
#[derive(Debug, Deserialize)]
struct WsClientMessage {
    action: String,

    /// Session credential (for `auth`).
    #[serde(default)]
    api_key: Option<String>,

    /// Time-control category (for `seek` / `cancel_seek`).
    #[serde(default)]
    category: Option<String>,

    /// UCI move (for `move`).
    #[serde(default, rename = "move")]
    mv: Option<String>,
}

/// Builds the standard `error` event.
pub fn error_event(message: &str) -> serde_json::Value {
    json!({ "event": "error", "message": message })
}

// ---------------------------------------------------------------------------
// PlaySession — per-agent actor
// ---------------------------------------------------------------------------

/// Actor for one agent connection.
pub struct PlaySession {
    /// Unique identifier for this session (distinguishes superseded
    /// connections of the same agent).
    id: Uuid,

    /// Timestamp of the last received pong (or connect time).
    last_heartbeat: Instant,

    /// Shared application state.
    state: web::Data<AppState>,

    /// Credential supplied on the connection URL, consumed at startup.
    pending_key: Option<String>,

    /// The authenticated agent, once auth has completed.
    agent: Option<AgentRow>,
}

impl PlaySession {
    pub fn new(state: web::Data<AppState>, api_key: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_heartbeat: Instant::now(),
            state,
            pending_key: api_key,
            agent: None,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                log::warn!("WS session {} heartbeat timeout, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Resolves the credential against storage, then binds the session.
    fn begin_auth(&mut self, api_key: String, ctx: &mut ws::WebsocketContext<Self>) {
        let db = self.state.db.clone();
        let lookup = async move { storage::agent_by_api_key(&db, &api_key).await }
            .into_actor(self)
            .map(|result, act, ctx| match result {
                Ok(Some(agent)) => {
                    let connected = {
                        let mut coordinator = act.state.coordinator.lock().unwrap();
                        coordinator.bind_agent(&agent, act.id, ctx.address())
                    };
                    log::info!("Agent {} ({}) authenticated", agent.id, agent.name);
                    act.agent = Some(agent);
                    ctx.text(connected.to_string());
                }
                Ok(None) => {
                    log::warn!("WS session {}: invalid api key", act.id);
                    close_with(ctx, CLOSE_AUTH_FAILED, "authentication failed");
                }
                Err(e) => {
                    log::error!("WS session {}: auth lookup failed: {}", act.id, e);
                    close_with(ctx, CLOSE_AUTH_FAILED, "authentication failed");
                }
            });
        ctx.spawn(lookup);
    }

    /// Parses one client message and routes it.
    fn handle_message(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let msg: WsClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                ctx.text(error_event(&format!("Invalid JSON: {}", e)).to_string());
                return;
            }
        };

        match msg.action.as_str() {
            "auth" => {
                if self.agent.is_some() {
                    ctx.text(error_event("Already authenticated").to_string());
                } else if let Some(api_key) = msg.api_key {
                    self.begin_auth(api_key, ctx);
                } else {
                    ctx.text(error_event("Missing field: api_key").to_string());
                }
            }

            "ping" => ctx.text(json!({ "event": "pong" }).to_string()),

            "seek" => {
                let Some(agent_id) = self.authenticated_id(ctx) else {
                    return;
                };
                let Some(category) = msg.category else {
                    ctx.text(error_event("Missing field: category").to_string());
                    return;
                };
                let reply = {
                    let mut coordinator = self.state.coordinator.lock().unwrap();
                    coordinator.handle_seek(&agent_id, &category)
                };
                ctx.text(reply.to_string());
            }

            "cancel_seek" => {
                let Some(agent_id) = self.authenticated_id(ctx) else {
                    return;
                };
                let Some(category) = msg.category else {
                    ctx.text(error_event("Missing field: category").to_string());
                    return;
                };
                let reply = {
                    let mut coordinator = self.state.coordinator.lock().unwrap();
                    coordinator.handle_cancel_seek(&agent_id, &category)
                };
                ctx.text(reply.to_string());
            }

            "move" => {
                let Some(agent_id) = self.authenticated_id(ctx) else {
                    return;
                };
                let Some(mv) = msg.mv else {
                    ctx.text(error_event("Missing field: move").to_string());
                    return;
                };
                let (reply, batch) = {
                    let mut coordinator = self.state.coordinator.lock().unwrap();
                    coordinator.handle_move(&agent_id, &mv)
                };
                if let Some(reply) = reply {
                    ctx.text(reply.to_string());
                }
                if let Some(batch) = batch {
                    actix_web::rt::spawn(storage::persist_game_end_with_retry(
                        self.state.db.clone(),
                        batch,
                    ));
                }
            }

            other => {
                ctx.text(error_event(&format!("Unknown action: '{}'", other)).to_string());
            }
        }
    }

    /// The authenticated agent id, or an error reply to the client.
    fn authenticated_id(&self, ctx: &mut ws::WebsocketContext<Self>) -> Option<String> {
        match &self.agent {
            Some(agent) => Some(agent.id.clone()),
            None => {
                ctx.text(error_event("Not authenticated").to_string());
                None
            }
        }
    }
}

impl Actor for PlaySession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::debug!("WS play session {} started", self.id);
        self.start_heartbeat(ctx);

        if let Some(api_key) = self.pending_key.take() {
            self.begin_auth(api_key, ctx);
        }

        // Unauthenticated sessions are dropped after the auth window.
        ctx.run_later(AUTH_TIMEOUT, |act, ctx| {
            if act.agent.is_none() {
                log::info!("WS session {} did not authenticate in time", act.id);
                close_with(ctx, CLOSE_AUTH_FAILED, "authentication timeout");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::debug!("WS play session {} stopped", self.id);
        if let Some(agent) = &self.agent {
            let mut coordinator = self.state.coordinator.lock().unwrap();
            coordinator.handle_disconnect(&agent.id, self.id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PlaySession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_message(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                ctx.text(error_event("Binary messages are not supported").to_string());
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                log::warn!("WS session {} protocol error: {}", self.id, e);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for PlaySession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseWs> for PlaySession {
    type Result = ();

    fn handle(&mut self, msg: CloseWs, ctx: &mut Self::Context) {
        close_with(ctx, msg.code, msg.reason);
    }
}

// ---------------------------------------------------------------------------
// SpectatorSession — per-spectator actor
// ---------------------------------------------------------------------------

/// Actor for one spectator connection, bound to a single game.
pub struct SpectatorSession {
    id: Uuid,
    game_id: String,
    last_heartbeat: Instant,
    state: web::Data<AppState>,
    joined: bool,
}

impl SpectatorSession {
    pub fn new(state: web::Data<AppState>, game_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_id,
            last_heartbeat: Instant::now(),
            state,
            joined: false,
        }
    }
}

impl Actor for SpectatorSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });

        let joined = {
            let mut coordinator = self.state.coordinator.lock().unwrap();
            coordinator.add_spectator(&self.game_id, self.id, ctx.address())
        };
        match joined {
            Ok(initial_state) => {
                log::info!("Spectator joined game {}", self.game_id);
                self.joined = true;
                ctx.text(initial_state.to_string());
            }
            Err(message) => {
                ctx.text(error_event(&message).to_string());
                ctx.close(None);
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if self.joined {
            let mut coordinator = self.state.coordinator.lock().unwrap();
            coordinator.remove_spectator(&self.game_id, self.id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SpectatorSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                // Spectators only ever ping; everything else is ignored.
                if let Ok(msg) = serde_json::from_str::<WsClientMessage>(&text)
                    && msg.action == "ping"
                {
                    ctx.text(json!({ "event": "pong" }).to_string());
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(_) => ctx.stop(),
        }
    }
}

impl Handler<Outbound> for SpectatorSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

// ---------------------------------------------------------------------------
// HTTP → WebSocket upgrade handlers
// ---------------------------------------------------------------------------

fn close_with<A>(ctx: &mut ws::WebsocketContext<A>, code: u16, reason: &str)
where
    A: Actor<Context = ws::WebsocketContext<A>>,
{
    ctx.close(Some(ws::CloseReason {
        code: ws::CloseCode::Other(code),
        description: Some(reason.to_string()),
    }));
    ctx.stop();
}

#[derive(Debug, Deserialize)]
pub struct PlayQuery {
    /// Session credential supplied on the connection URL.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Upgrades a player connection at `GET /ws/play`.
pub async fn play_connect(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<PlayQuery>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = PlaySession::new(state, query.into_inner().api_key);
    ws::start(session, &req, stream)
}

/// Upgrades a spectator connection at `GET /ws/spectate/{game_id}`.
pub async fn spectate_connect(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = SpectatorSession::new(state, path.into_inner());
    ws::start(session, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: WsClientMessage =
            serde_json::from_str(r#"{"action":"move","move":"e2e4"}"#).unwrap();
        assert_eq!(msg.action, "move");
        assert_eq!(msg.mv.as_deref(), Some("e2e4"));
        assert!(msg.category.is_none());

        let msg: WsClientMessage =
            serde_json::from_str(r#"{"action":"seek","category":"blitz"}"#).unwrap();
        assert_eq!(msg.category.as_deref(), Some("blitz"));

        let msg: WsClientMessage =
            serde_json::from_str(r#"{"action":"auth","api_key":"moltchess_x"}"#).unwrap();
        assert_eq!(msg.api_key.as_deref(), Some("moltchess_x"));

        assert!(serde_json::from_str::<WsClientMessage>("not json").is_err());
    }

    #[test]
    fn test_error_event_envelope() {
        let event = error_event("Not your turn");
        assert_eq!(event["event"], "error");
        assert_eq!(event["message"], "Not your turn");
    }
}
