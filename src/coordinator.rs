//! Match orchestration: sessions, games, and the glue between them.
//!
//! The [`PlayCoordinator`] owns every piece of mutable arena state — the
//! matchmaking queue, the active-games map, the session registry, and the
//! rate limiter — and every mutation goes through it while the caller
//! holds the coarse `Mutex` in [`AppState`](crate::api::AppState). Chess
//! and Elo math are pure and run inside the lock; storage I/O never does.
//! Messages to sessions are fire-and-forget actor sends, so fan-out is
//! safe under the lock and per-session ordering follows call order.
//!
//! Two background loops drive time-based behavior: the matchmaking tick
//! (every 500ms) widens search windows and pairs seekers, and the forfeit
//! tick (every second) ends games whose players stayed disconnected too
//! long or whose clocks ran out.

use crate::api::AppState;
use crate::auth;
use crate::elo;
use crate::game::{ChessGame, color_str};
use crate::matchmaking::{MatchPair, MatchQueue, Seeker};
use crate::rate_limiter::RateLimiter;
use crate::storage::{self, AgentRow, GameEndBatch, PlayerOutcome};
use crate::types::{Category, GameResult, GameStatus, Termination};
use crate::ws::{CloseWs, Outbound, PlaySession, SpectatorSession, error_event};
use actix::Addr;
use actix_web::web;
use chrono::Utc;
use serde_json::{Value, json};
use shakmaty::Color;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Matchmaking pass cadence.
pub const MATCHMAKING_TICK: Duration = Duration::from_millis(500);

/// Disconnect/timeout watchdog cadence.
pub const FORFEIT_TICK: Duration = Duration::from_secs(1);

/// Seconds a side may stay disconnected before forfeiting.
pub const DISCONNECT_FORFEIT_SECS: f64 = 120.0;

/// Close code for a connection replaced by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Close code for failed or missing authentication.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

// ---------------------------------------------------------------------------
// SessionRegistry — agent channels and spectator sets
// ---------------------------------------------------------------------------

/// A bound agent connection.
pub struct AgentSession {
    pub session_id: Uuid,
    pub addr: Addr<PlaySession>,
    /// Agent profile snapshot from auth; Elos are refreshed in-memory
    /// when a game ends so follow-up seeks use the new rating.
    pub agent: AgentRow,
}

/// Maps agents to their single live channel and games to their spectator
/// channels. At most one channel per agent id: a new bind supersedes and
/// closes the previous one.
#[derive(Default)]
pub struct SessionRegistry {
    agents: HashMap<String, AgentSession>,
    spectators: HashMap<String, HashMap<Uuid, Addr<SpectatorSession>>>,
}

impl SessionRegistry {
    /// Binds a channel for an agent, returning the session it replaced.
    fn bind(&mut self, session: AgentSession) -> Option<AgentSession> {
        self.agents.insert(session.agent.id.clone(), session)
    }

    /// Unbinds an agent only if the given session still owns the binding.
    /// Superseded sessions calling in during teardown are ignored.
    fn unbind_if(&mut self, agent_id: &str, session_id: Uuid) -> bool {
        match self.agents.get(agent_id) {
            Some(entry) if entry.session_id == session_id => {
                self.agents.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    pub fn session(&self, agent_id: &str) -> Option<&AgentSession> {
        self.agents.get(agent_id)
    }

    fn session_mut(&mut self, agent_id: &str) -> Option<&mut AgentSession> {
        self.agents.get_mut(agent_id)
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Best-effort send to one agent. A missing or dead channel is simply
    /// skipped; the disconnect monitor reconciles.
    pub fn send_to_agent(&self, agent_id: &str, msg: &Value) {
        if let Some(entry) = self.agents.get(agent_id) {
            entry.addr.do_send(Outbound(msg.to_string()));
        }
    }

    /// Sends to both players and every spectator of a game.
    pub fn broadcast_to_game(&self, game: &ChessGame, msg: &Value) {
        self.send_to_agent(&game.white_agent_id, msg);
        self.send_to_agent(&game.black_agent_id, msg);
        self.broadcast_to_spectators(&game.id, msg);
    }

    pub fn broadcast_to_spectators(&self, game_id: &str, msg: &Value) {
        if let Some(watchers) = self.spectators.get(game_id) {
            let text = msg.to_string();
            for addr in watchers.values() {
                addr.do_send(Outbound(text.clone()));
            }
        }
    }

    fn add_spectator(
        &mut self,
        game_id: &str,
        session_id: Uuid,
        addr: Addr<SpectatorSession>,
    ) -> usize {
        let watchers = self.spectators.entry(game_id.to_string()).or_default();
        watchers.insert(session_id, addr);
        watchers.len()
    }

    fn remove_spectator(&mut self, game_id: &str, session_id: Uuid) -> usize {
        let Some(watchers) = self.spectators.get_mut(game_id) else {
            return 0;
        };
        watchers.remove(&session_id);
        let remaining = watchers.len();
        if remaining == 0 {
            self.spectators.remove(game_id);
        }
        remaining
    }
}

// ---------------------------------------------------------------------------
// PlayCoordinator
// ---------------------------------------------------------------------------

/// The single owner of all mutable arena state.
#[derive(Default)]
pub struct PlayCoordinator {
    pub(crate) registry: SessionRegistry,
    pub(crate) queue: MatchQueue,
    pub(crate) limiter: RateLimiter,
    pub(crate) games: HashMap<String, ChessGame>,
    /// agent id -> active game id. Survives reconnects; cleared at game end.
    pub(crate) agent_games: HashMap<String, String>,
    /// Agents whose match is mid-finalization (storage reads in flight).
    pub(crate) reserved: HashSet<String>,
}

impl PlayCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Binds an authenticated agent to its session channel.
    ///
    /// Any prior channel for the same agent is closed with the superseded
    /// code. If the agent is mid-game this doubles as a reconnect: the
    /// disconnect timer is cleared, the current state is replayed with a
    /// `reconnected` flag, and the opponent is notified. Returns the
    /// `connected` event for the session to deliver first.
    pub fn bind_agent(
        &mut self,
        agent: &AgentRow,
        session_id: Uuid,
        addr: Addr<PlaySession>,
    ) -> Value {
        let replaced = self.registry.bind(AgentSession {
            session_id,
            addr,
            agent: agent.clone(),
        });
        if let Some(old) = replaced
            && old.session_id != session_id
        {
            old.addr.do_send(CloseWs {
                code: CLOSE_SUPERSEDED,
                reason: "superseded connection",
            });
        }

        if let Some(game_id) = self.agent_games.get(&agent.id).cloned()
            && let Some(game) = self.games.get_mut(&game_id)
            && game.status == GameStatus::Active
            && let Some(color) = game.agent_color(&agent.id)
        {
            let conn = game.side_conn_mut(color);
            conn.connected = true;
            conn.disconnect_start = None;

            let mut state = game.state_json();
            state["reconnected"] = json!(true);
            let opponent = game.opponent_of(&agent.id).map(str::to_string);

            self.registry.send_to_agent(&agent.id, &state);
            if let Some(opponent_id) = opponent {
                self.registry
                    .send_to_agent(&opponent_id, &json!({ "event": "opponent_reconnected" }));
            }
            log::info!("Agent {} reconnected to game {}", agent.id, game_id);
        }

        json!({
            "event": "connected",
            "agent_id": agent.id,
            "agent_name": agent.name,
            "elo_bullet": agent.elo_bullet,
            "elo_blitz": agent.elo_blitz,
            "elo_rapid": agent.elo_rapid,
        })
    }

    /// Tears down a session: marks the agent's game side as disconnected,
    /// notifies the opponent, and cancels all outstanding seeks.
    pub fn handle_disconnect(&mut self, agent_id: &str, session_id: Uuid) {
        if !self.registry.unbind_if(agent_id, session_id) {
            return;
        }

        if let Some(game_id) = self.agent_games.get(agent_id).cloned()
            && let Some(game) = self.games.get_mut(&game_id)
            && game.status == GameStatus::Active
            && let Some(color) = game.agent_color(agent_id)
        {
            let conn = game.side_conn_mut(color);
            conn.connected = false;
            conn.disconnect_start = Some(Instant::now());
            let opponent = game.opponent_of(agent_id).map(str::to_string);

            log::info!(
                "Agent {} ({}) disconnected from game {}",
                agent_id,
                color_str(color),
                game_id
            );
            if let Some(opponent_id) = opponent {
                self.registry
                    .send_to_agent(&opponent_id, &json!({ "event": "opponent_disconnected" }));
            }
        }

        self.queue.remove_all_seeks(agent_id);
    }

    // -----------------------------------------------------------------------
    // Client actions
    // -----------------------------------------------------------------------

    /// Handles a seek request, returning the reply event.
    pub fn handle_seek(&mut self, agent_id: &str, category_str: &str) -> Value {
        let category = match category_str.parse::<Category>() {
            Ok(c) => c,
            Err(e) => return error_event(&e),
        };
        if self.agent_games.contains_key(agent_id) || self.reserved.contains(agent_id) {
            return error_event("You are already in a game");
        }
        if self.queue.is_seeking(agent_id, category) {
            return error_event(&format!("Already seeking {}", category));
        }
        if let Some((reason, retry_after)) = self.limiter.can_seek(agent_id, category) {
            return json!({
                "event": "rate_limited",
                "reason": reason,
                "retry_after": retry_after,
            });
        }

        let Some(session) = self.registry.session(agent_id) else {
            return error_event("Not connected");
        };
        let elo = session.agent.elo(category);
        let name = session.agent.name.clone();
        let (position, (lo, hi)) = self.queue.add_seeker(agent_id, &name, elo, category);

        log::info!(
            "Agent {} seeking {} at {} (position {})",
            agent_id,
            category,
            elo,
            position
        );
        json!({
            "event": "queued",
            "category": category.as_str(),
            "position": position,
            "elo_range": [lo, hi],
        })
    }

    /// Handles a cancel-seek request, returning the reply event.
    pub fn handle_cancel_seek(&mut self, agent_id: &str, category_str: &str) -> Value {
        let category = match category_str.parse::<Category>() {
            Ok(c) => c,
            Err(e) => return error_event(&e),
        };
        if self.queue.remove_seeker(agent_id, category) {
            json!({ "event": "seek_cancelled", "category": category.as_str() })
        } else {
            error_event(&format!("Not seeking {}", category))
        }
    }

    /// Handles a move request.
    ///
    /// Returns an optional error reply for the caller plus, when the move
    /// (or its rejection-by-flag) ended the game, the persistence batch
    /// produced by the end-of-game path.
    pub fn handle_move(
        &mut self,
        agent_id: &str,
        uci: &str,
    ) -> (Option<Value>, Option<GameEndBatch>) {
        let Some(game_id) = self.agent_games.get(agent_id).cloned() else {
            return (Some(error_event("You are not in a game")), None);
        };
        let Some(game) = self.games.get_mut(&game_id) else {
            return (Some(error_event("You are not in a game")), None);
        };
        if !game.is_agent_turn(agent_id) {
            return (Some(error_event("Not your turn")), None);
        }

        match game.make_move(uci) {
            Ok(()) => {
                let state = game.state_json();
                let ended = game.status == GameStatus::Ended;
                self.registry.broadcast_to_game(game, &state);
                let batch = if ended { self.end_of_game(&game_id) } else { None };
                (None, batch)
            }
            Err(message) => {
                // A flag fall rejects the move *and* terminates the game.
                let ended = game.status == GameStatus::Ended;
                let batch = if ended { self.end_of_game(&game_id) } else { None };
                (Some(error_event(&message)), batch)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Spectators
    // -----------------------------------------------------------------------

    /// Attaches a spectator to an active game and returns the initial
    /// augmented state event.
    pub fn add_spectator(
        &mut self,
        game_id: &str,
        session_id: Uuid,
        addr: Addr<SpectatorSession>,
    ) -> Result<Value, String> {
        let Some(game) = self.games.get_mut(game_id) else {
            return Err("Game not found or has ended".to_string());
        };
        if game.status != GameStatus::Active {
            return Err("Game not found or has ended".to_string());
        }

        let count = self.registry.add_spectator(game_id, session_id, addr);
        game.spectator_count = count;

        let mut state = game.state_json();
        state["game_id"] = json!(game.id);
        state["white_agent_id"] = json!(game.white_agent_id);
        state["black_agent_id"] = json!(game.black_agent_id);
        state["category"] = json!(game.category.as_str());
        state["spectator_count"] = json!(game.spectator_count);
        Ok(state)
    }

    pub fn remove_spectator(&mut self, game_id: &str, session_id: Uuid) {
        let count = self.registry.remove_spectator(game_id, session_id);
        if let Some(game) = self.games.get_mut(game_id) {
            game.spectator_count = count;
        }
    }

    // -----------------------------------------------------------------------
    // Background ticks
    // -----------------------------------------------------------------------

    /// One matchmaking pass: deliver widening notices and hand back the
    /// accepted pairs for asynchronous finalization. Matched agents are
    /// reserved and their other-category seeks cancelled so no second
    /// match can claim them.
    pub fn matchmaking_tick(&mut self) -> Vec<MatchPair> {
        let (notices, pairs) = self.queue.tick();
        for notice in &notices {
            self.registry.send_to_agent(
                &notice.agent_id,
                &json!({
                    "event": "search_widened",
                    "category": notice.category.as_str(),
                    "elo_range": [notice.elo_range.0, notice.elo_range.1],
                }),
            );
        }

        let mut accepted = Vec::new();
        for pair in pairs {
            let busy = |id: &str| self.agent_games.contains_key(id) || self.reserved.contains(id);
            if busy(&pair.seeker1.agent_id) || busy(&pair.seeker2.agent_id) {
                log::warn!(
                    "Dropping {} match for busy pair {} / {}",
                    pair.category,
                    pair.seeker1.agent_id,
                    pair.seeker2.agent_id
                );
                continue;
            }
            self.reserved.insert(pair.seeker1.agent_id.clone());
            self.reserved.insert(pair.seeker2.agent_id.clone());
            self.queue.remove_all_seeks(&pair.seeker1.agent_id);
            self.queue.remove_all_seeks(&pair.seeker2.agent_id);
            accepted.push(pair);
        }
        accepted
    }

    /// One watchdog pass over active games: disconnect forfeits first,
    /// then clock timeouts. At most one terminal fires per game per tick.
    pub fn forfeit_tick(&mut self) -> Vec<GameEndBatch> {
        let mut ended = Vec::new();
        for (game_id, game) in self.games.iter_mut() {
            if game.status != GameStatus::Active {
                continue;
            }

            if !game.white_conn.connected
                && let Some(since) = game.white_conn.disconnect_start
                && since.elapsed().as_secs_f64() >= DISCONNECT_FORFEIT_SECS
            {
                game.end_by_disconnect(Color::White);
                ended.push(game_id.clone());
                continue;
            }
            if !game.black_conn.connected
                && let Some(since) = game.black_conn.disconnect_start
                && since.elapsed().as_secs_f64() >= DISCONNECT_FORFEIT_SECS
            {
                game.end_by_disconnect(Color::Black);
                ended.push(game_id.clone());
                continue;
            }
            if let Some(flagged) = game.clock.timeout() {
                game.end_by_timeout(flagged);
                ended.push(game_id.clone());
            }
        }

        ended
            .iter()
            .filter_map(|game_id| self.end_of_game(game_id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Game creation
    // -----------------------------------------------------------------------

    /// Installs a fully prepared game: records bindings, starts the clock,
    /// and sends the personalized `game_start` events.
    pub fn install_game(
        &mut self,
        game_id: String,
        white: &Seeker,
        black: &Seeker,
        category: Category,
        elo_white_before: i64,
        elo_black_before: i64,
    ) {
        let mut game = ChessGame::new(
            game_id.clone(),
            white.agent_id.clone(),
            white.agent_name.clone(),
            black.agent_id.clone(),
            black.agent_name.clone(),
            category,
            elo_white_before,
            elo_black_before,
        );

        for (agent_id, color) in [(&white.agent_id, Color::White), (&black.agent_id, Color::Black)]
        {
            let connected = self.registry.is_connected(agent_id);
            let conn = game.side_conn_mut(color);
            conn.connected = connected;
            if !connected {
                // The player vanished between match and game start; the
                // forfeit window opens immediately.
                conn.disconnect_start = Some(Instant::now());
            }
        }

        game.start();
        let fen = game.fen();
        let tc = category.time_control();

        self.reserved.remove(&white.agent_id);
        self.reserved.remove(&black.agent_id);
        self.agent_games
            .insert(white.agent_id.clone(), game_id.clone());
        self.agent_games
            .insert(black.agent_id.clone(), game_id.clone());

        self.registry.send_to_agent(
            &white.agent_id,
            &json!({
                "event": "game_start",
                "game_id": game_id,
                "color": "white",
                "opponent": { "id": black.agent_id, "name": black.agent_name, "elo": elo_black_before },
                "fen": fen,
                "time_control": { "base": tc.base, "increment": tc.increment },
            }),
        );
        self.registry.send_to_agent(
            &black.agent_id,
            &json!({
                "event": "game_start",
                "game_id": game_id,
                "color": "black",
                "opponent": { "id": white.agent_id, "name": white.agent_name, "elo": elo_white_before },
                "fen": fen,
                "time_control": { "base": tc.base, "increment": tc.increment },
            }),
        );

        log::info!(
            "Game {} started: {} vs {} ({})",
            game_id,
            white.agent_name,
            black.agent_name,
            category
        );
        self.games.insert(game_id, game);
    }

    /// Aborts a match whose finalization failed: both players get an
    /// error and are released, and neither is re-enqueued.
    pub fn abort_match(&mut self, pair: &MatchPair) {
        for seeker in [&pair.seeker1, &pair.seeker2] {
            self.reserved.remove(&seeker.agent_id);
            self.registry
                .send_to_agent(&seeker.agent_id, &error_event("Failed to start game"));
        }
    }

    // -----------------------------------------------------------------------
    // End of game
    // -----------------------------------------------------------------------

    /// Runs the end-of-game path for a game that has reached `ended`:
    /// rating deltas, cooldowns, notifications, and cleanup. Evicting the
    /// game from the map makes the path run exactly once; the returned
    /// batch carries everything storage needs.
    pub fn end_of_game(&mut self, game_id: &str) -> Option<GameEndBatch> {
        if self.games.get(game_id)?.status != GameStatus::Ended {
            return None;
        }
        let game = self.games.remove(game_id)?;

        let result = game.result.unwrap_or_else(|| {
            log::error!("Game {} ended without a result; recording a draw", game.id);
            GameResult::Draw
        });
        let termination = game.termination.unwrap_or(Termination::Disconnect);
        let is_draw = result == GameResult::Draw;

        let (white_change, black_change) = match result {
            GameResult::Draw => elo::elo_change(game.elo_white_before, game.elo_black_before, true),
            GameResult::WhiteWin => {
                elo::elo_change(game.elo_white_before, game.elo_black_before, false)
            }
            GameResult::BlackWin => {
                let (winner, loser) =
                    elo::elo_change(game.elo_black_before, game.elo_white_before, false);
                (loser, winner)
            }
        };
        let new_white_elo = elo::apply_floor(game.elo_white_before + white_change);
        let new_black_elo = elo::apply_floor(game.elo_black_before + black_change);

        let white_is_winner = result == GameResult::WhiteWin;
        let black_is_winner = result == GameResult::BlackWin;

        let white_cooldown = self.limiter.on_game_result(
            &game.white_agent_id,
            game.category,
            white_is_winner,
            is_draw,
        );
        let black_cooldown = self.limiter.on_game_result(
            &game.black_agent_id,
            game.category,
            black_is_winner,
            is_draw,
        );
        let white_streak = self.limiter.loss_streak(&game.white_agent_id, game.category);
        let black_streak = self.limiter.loss_streak(&game.black_agent_id, game.category);

        // Personalized player events, then the spectator summary.
        for (agent_id, change, new_elo, cooldown) in [
            (&game.white_agent_id, white_change, new_white_elo, white_cooldown),
            (&game.black_agent_id, black_change, new_black_elo, black_cooldown),
        ] {
            self.registry.send_to_agent(
                agent_id,
                &json!({
                    "event": "game_end",
                    "result": result.as_str(),
                    "termination": termination.as_str(),
                    "elo_change": change,
                    "new_elo": new_elo,
                    "cooldown_seconds": cooldown,
                }),
            );
        }
        self.registry.broadcast_to_spectators(
            &game.id,
            &json!({
                "event": "game_end",
                "result": result.as_str(),
                "termination": termination.as_str(),
                "white_elo_change": white_change,
                "black_elo_change": black_change,
            }),
        );

        // Keep session Elo caches current for follow-up seeks.
        if let Some(session) = self.registry.session_mut(&game.white_agent_id) {
            session.agent.set_elo(game.category, new_white_elo);
        }
        if let Some(session) = self.registry.session_mut(&game.black_agent_id) {
            session.agent.set_elo(game.category, new_black_elo);
        }

        self.agent_games.remove(&game.white_agent_id);
        self.agent_games.remove(&game.black_agent_id);

        let (time_white_remaining, time_black_remaining) = game.remaining_times();
        log::info!(
            "Game {} ({} vs {}) ended: {} by {}",
            game.id,
            game.white_name,
            game.black_name,
            result.as_str(),
            termination
        );

        Some(GameEndBatch {
            game_id: game.id.clone(),
            category: game.category,
            result,
            termination,
            is_draw,
            pgn: game.pgn(),
            white: PlayerOutcome {
                agent_id: game.white_agent_id.clone(),
                new_elo: new_white_elo,
                elo_change: white_change,
                is_winner: white_is_winner,
                loss_streak: white_streak,
                cooldown_seconds: white_cooldown,
            },
            black: PlayerOutcome {
                agent_id: game.black_agent_id.clone(),
                new_elo: new_black_elo,
                elo_change: black_change,
                is_winner: black_is_winner,
                loss_streak: black_streak,
                cooldown_seconds: black_cooldown,
            },
            time_white_remaining,
            time_black_remaining,
            ended_at: game.ended_at.unwrap_or_else(Utc::now),
        })
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Spawns the matchmaking and forfeit loops. Called once at startup,
/// before the HTTP server begins accepting connections.
pub fn spawn_background_tasks(state: web::Data<AppState>) {
    let matchmaking_state = state.clone();
    actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(MATCHMAKING_TICK);
        loop {
            interval.tick().await;
            let pairs = {
                let mut coordinator = matchmaking_state.coordinator.lock().unwrap();
                coordinator.matchmaking_tick()
            };
            for pair in pairs {
                actix_web::rt::spawn(finalize_match(matchmaking_state.clone(), pair));
            }
        }
    });

    let forfeit_state = state;
    actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(FORFEIT_TICK);
        loop {
            interval.tick().await;
            let batches = {
                let mut coordinator = forfeit_state.coordinator.lock().unwrap();
                coordinator.forfeit_tick()
            };
            for batch in batches {
                actix_web::rt::spawn(storage::persist_game_end_with_retry(
                    forfeit_state.db.clone(),
                    batch,
                ));
            }
        }
    });

    log::info!("Matchmaking and forfeit watchdog tasks started");
}

/// Turns an accepted pair into a running game: coin-flip colors, snapshot
/// both ratings from storage, persist the active game row, then install
/// the game under the coordinator lock.
///
/// A storage failure here is fatal to the match: both players get an
/// error and nobody is re-enqueued.
async fn finalize_match(state: web::Data<AppState>, pair: MatchPair) {
    use rand::Rng;

    let category = pair.category;
    let heads = rand::thread_rng().gen_bool(0.5);
    let (white, black) = if heads {
        (&pair.seeker1, &pair.seeker2)
    } else {
        (&pair.seeker2, &pair.seeker1)
    };

    let white_elo = storage::category_elo(&state.db, &white.agent_id, category).await;
    let black_elo = storage::category_elo(&state.db, &black.agent_id, category).await;
    let (elo_white_before, elo_black_before) = match (white_elo, black_elo) {
        (Ok(w), Ok(b)) => (w, b),
        (w, b) => {
            log::error!(
                "Rating snapshot failed for {} match {} vs {}: {:?} {:?}",
                category,
                white.agent_id,
                black.agent_id,
                w.err(),
                b.err()
            );
            state.coordinator.lock().unwrap().abort_match(&pair);
            return;
        }
    };

    let game_id = auth::generate_game_id();
    if let Err(e) = storage::insert_game_start(
        &state.db,
        &game_id,
        &white.agent_id,
        &black.agent_id,
        category,
        elo_white_before,
        elo_black_before,
        Utc::now(),
    )
    .await
    {
        log::error!("Persisting game {} at start failed: {}", game_id, e);
        state.coordinator.lock().unwrap().abort_match(&pair);
        return;
    }

    state.coordinator.lock().unwrap().install_game(
        game_id,
        white,
        black,
        category,
        elo_white_before,
        elo_black_before,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_game(moves: &[&str]) -> ChessGame {
        let mut game = ChessGame::new(
            "g1".to_string(),
            "white-agent".to_string(),
            "White".to_string(),
            "black-agent".to_string(),
            "Black".to_string(),
            Category::Bullet,
            1200,
            1210,
        );
        game.start();
        for mv in moves {
            game.make_move(mv).unwrap();
        }
        game
    }

    fn install(coordinator: &mut PlayCoordinator, game: ChessGame) {
        coordinator
            .agent_games
            .insert(game.white_agent_id.clone(), game.id.clone());
        coordinator
            .agent_games
            .insert(game.black_agent_id.clone(), game.id.clone());
        coordinator.games.insert(game.id.clone(), game);
    }

    #[test]
    fn test_end_of_game_runs_once() {
        let mut coordinator = PlayCoordinator::new();
        install(&mut coordinator, started_game(&["f2f3", "e7e5", "g2g4", "d8h4"]));

        let batch = coordinator.end_of_game("g1").unwrap();
        assert_eq!(batch.result, GameResult::BlackWin);
        assert_eq!(batch.termination, Termination::Checkmate);
        assert_eq!(batch.white.elo_change, -batch.black.elo_change);
        assert_eq!(batch.black.elo_change, 16);
        assert_eq!(batch.white.new_elo, 1184);
        assert_eq!(batch.black.new_elo, 1226);
        assert!(batch.black.is_winner);
        assert_eq!(batch.white.loss_streak, 1);
        assert_eq!(batch.black.loss_streak, 0);
        assert_eq!(batch.white.cooldown_seconds, 30);

        // Bindings are cleared and the path cannot run twice.
        assert!(coordinator.agent_games.is_empty());
        assert!(coordinator.end_of_game("g1").is_none());
    }

    #[test]
    fn test_end_of_game_ignores_running_games() {
        let mut coordinator = PlayCoordinator::new();
        install(&mut coordinator, started_game(&["e2e4"]));
        assert!(coordinator.end_of_game("g1").is_none());
        assert!(coordinator.games.contains_key("g1"));
    }

    #[test]
    fn test_forfeit_tick_ends_disconnected_game() {
        let mut coordinator = PlayCoordinator::new();
        let mut game = started_game(&["e2e4"]);
        game.white_conn.connected = false;
        game.white_conn.disconnect_start =
            Some(Instant::now() - Duration::from_secs_f64(DISCONNECT_FORFEIT_SECS + 1.0));
        install(&mut coordinator, game);

        let batches = coordinator.forfeit_tick();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].termination, Termination::Disconnect);
        assert_eq!(batches[0].result, GameResult::BlackWin);
        assert!(coordinator.games.is_empty());
    }

    #[test]
    fn test_forfeit_tick_respects_grace_window() {
        let mut coordinator = PlayCoordinator::new();
        let mut game = started_game(&["e2e4"]);
        game.black_conn.disconnect_start =
            Some(Instant::now() - Duration::from_secs_f64(DISCONNECT_FORFEIT_SECS - 1.0));
        install(&mut coordinator, game);

        assert!(coordinator.forfeit_tick().is_empty());
        assert!(coordinator.games.contains_key("g1"));
    }

    #[test]
    fn test_forfeit_tick_catches_flag_fall() {
        let mut coordinator = PlayCoordinator::new();
        let mut game = started_game(&["e2e4"]);
        game.clock.set_remaining(120.0, 0.0);
        install(&mut coordinator, game);

        let batches = coordinator.forfeit_tick();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].termination, Termination::Timeout);
        assert_eq!(batches[0].result, GameResult::WhiteWin);
    }

    #[test]
    fn test_draw_keeps_deltas_small_and_streaks_untouched() {
        let mut coordinator = PlayCoordinator::new();
        let mut game = started_game(&[]);
        // Knight shuffle to a threefold repetition.
        for _ in 0..2 {
            for mv in ["g1f3", "g8f6", "f3g1", "f6g8"] {
                game.make_move(mv).unwrap();
            }
        }
        assert_eq!(game.status, GameStatus::Ended);
        install(&mut coordinator, game);

        let batch = coordinator.end_of_game("g1").unwrap();
        assert_eq!(batch.result, GameResult::Draw);
        assert!(batch.is_draw);
        assert!(batch.white.elo_change.abs() <= 1);
        assert!(batch.black.elo_change.abs() <= 1);
        assert_eq!(batch.white.loss_streak, 0);
        assert_eq!(batch.black.loss_streak, 0);
    }

    #[test]
    fn test_move_without_game_is_an_error() {
        let mut coordinator = PlayCoordinator::new();
        let (reply, batch) = coordinator.handle_move("nobody", "e2e4");
        assert_eq!(reply.unwrap()["message"], "You are not in a game");
        assert!(batch.is_none());
    }

    #[test]
    fn test_turn_enforcement_and_terminal_move() {
        let mut coordinator = PlayCoordinator::new();
        install(&mut coordinator, started_game(&[]));

        let (reply, _) = coordinator.handle_move("black-agent", "e7e5");
        assert_eq!(reply.unwrap()["message"], "Not your turn");

        for (agent, mv) in [
            ("white-agent", "f2f3"),
            ("black-agent", "e7e5"),
            ("white-agent", "g2g4"),
        ] {
            let (reply, batch) = coordinator.handle_move(agent, mv);
            assert!(reply.is_none());
            assert!(batch.is_none());
        }
        let (reply, batch) = coordinator.handle_move("black-agent", "d8h4");
        assert!(reply.is_none());
        let batch = batch.unwrap();
        assert_eq!(batch.termination, Termination::Checkmate);
        assert!(coordinator.games.is_empty());
    }

    #[test]
    fn test_flagged_move_is_rejected_and_ends_game() {
        let mut coordinator = PlayCoordinator::new();
        let mut game = started_game(&[]);
        game.clock.set_remaining(0.0, 120.0);
        install(&mut coordinator, game);

        let (reply, batch) = coordinator.handle_move("white-agent", "e2e4");
        assert_eq!(reply.unwrap()["message"], "Time out");
        let batch = batch.unwrap();
        assert_eq!(batch.termination, Termination::Timeout);
        assert_eq!(batch.result, GameResult::BlackWin);
    }

    #[test]
    fn test_seek_preconditions_without_session() {
        let mut coordinator = PlayCoordinator::new();
        let reply = coordinator.handle_seek("a1", "classical");
        assert_eq!(reply["event"], "error");

        // A valid category but no bound session.
        let reply = coordinator.handle_seek("a1", "bullet");
        assert_eq!(reply["message"], "Not connected");

        // An agent already bound to a game cannot seek.
        install(&mut coordinator, started_game(&["e2e4"]));
        let reply = coordinator.handle_seek("white-agent", "bullet");
        assert_eq!(reply["message"], "You are already in a game");
    }

    #[test]
    fn test_cancel_seek_requires_active_seek() {
        let mut coordinator = PlayCoordinator::new();
        let reply = coordinator.handle_cancel_seek("a1", "blitz");
        assert_eq!(reply["message"], "Not seeking blitz");
    }
}
