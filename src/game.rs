//! Per-game state machine.
//!
//! A [`ChessGame`] owns the authoritative state of one match: the board
//! position, the move history, the chess clock, connection bookkeeping for
//! both sides, and the terminal result once the game ends. Games move
//! through `pending -> active -> ended` and never leave `ended`.
//!
//! Board legality, FEN, SAN, and repetition hashing come from `shakmaty`;
//! this module layers the arena semantics on top: timeout-before-move
//! checks, the fixed ordering of terminal conditions, and PGN export.

use crate::clock::Clock;
use crate::types::{Category, GameResult, GameStatus, Termination};
use chrono::{DateTime, Utc};
use shakmaty::zobrist::Zobrist64;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position, fen::Fen, san::San, uci::UciMove};
use std::collections::HashMap;
use std::time::Instant;

/// Protocol string for a color.
pub fn color_str(color: Color) -> &'static str {
    match color {
        Color::White => "white",
        Color::Black => "black",
    }
}

/// Connection bookkeeping for one side of a game.
#[derive(Debug, Clone, Default)]
pub struct SideConnection {
    /// Whether the side currently has a bound session.
    pub connected: bool,
    /// When the side dropped, if it is currently disconnected.
    pub disconnect_start: Option<Instant>,
}

/// An arena chess game.
#[derive(Debug, Clone)]
pub struct ChessGame {
    pub id: String,
    pub white_agent_id: String,
    pub white_name: String,
    pub black_agent_id: String,
    pub black_name: String,
    pub category: Category,

    pos: Chess,
    /// Move history in canonical UCI.
    pub moves: Vec<String>,
    /// Occurrence counts of every position reached, for threefold detection.
    repetition: HashMap<Zobrist64, u32>,

    pub clock: Clock,
    pub status: GameStatus,
    pub result: Option<GameResult>,
    pub termination: Option<Termination>,

    /// Category Elo of each player, snapshotted from storage at game start.
    pub elo_white_before: i64,
    pub elo_black_before: i64,

    pub white_conn: SideConnection,
    pub black_conn: SideConnection,
    pub spectator_count: usize,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChessGame {
    /// Creates a pending game between two agents with colors already
    /// assigned and Elo snapshots taken.
    pub fn new(
        id: String,
        white_agent_id: String,
        white_name: String,
        black_agent_id: String,
        black_name: String,
        category: Category,
        elo_white_before: i64,
        elo_black_before: i64,
    ) -> Self {
        Self {
            id,
            white_agent_id,
            white_name,
            black_agent_id,
            black_name,
            category,
            pos: Chess::default(),
            moves: Vec::new(),
            repetition: HashMap::new(),
            clock: Clock::new(category.time_control()),
            status: GameStatus::Pending,
            result: None,
            termination: None,
            elo_white_before,
            elo_black_before,
            white_conn: SideConnection::default(),
            black_conn: SideConnection::default(),
            spectator_count: 0,
            started_at: None,
            ended_at: None,
        }
    }

    /// Activates the game and starts White's clock.
    pub fn start(&mut self) {
        self.status = GameStatus::Active;
        self.started_at = Some(Utc::now());
        self.clock.start();
        self.record_position();
    }

    /// Records the current position for repetition counting.
    fn record_position(&mut self) {
        let hash: Zobrist64 = self.pos.zobrist_hash(EnPassantMode::Legal);
        *self.repetition.entry(hash).or_insert(0) += 1;
    }

    /// How often the current position has occurred.
    fn repetition_count(&self) -> u32 {
        let hash: Zobrist64 = self.pos.zobrist_hash(EnPassantMode::Legal);
        self.repetition.get(&hash).copied().unwrap_or(0)
    }

    /// Attempts a move for the side to move.
    ///
    /// The clock flag is checked before anything else: a move arriving
    /// after the active side's time ran out is rejected and the game ends
    /// by timeout. On success the clock is switched and all terminal
    /// conditions are evaluated in their fixed order.
    pub fn make_move(&mut self, uci: &str) -> Result<(), String> {
        if self.status != GameStatus::Active {
            return Err("Game is not active".to_string());
        }

        if let Some(flagged) = self.clock.timeout() {
            self.end_by_timeout(flagged);
            return Err("Time out".to_string());
        }

        let parsed: UciMove = uci
            .parse()
            .map_err(|_| "Invalid move format".to_string())?;
        let mv = parsed
            .to_move(&self.pos)
            .map_err(|_| "Illegal move".to_string())?;

        self.pos = self
            .pos
            .clone()
            .play(mv)
            .map_err(|_| "Illegal move".to_string())?;
        self.moves.push(mv.to_uci(CastlingMode::Standard).to_string());

        self.clock.switch();
        debug_assert_eq!(self.clock.active_color(), self.pos.turn());
        self.record_position();
        self.check_game_end();

        Ok(())
    }

    /// Evaluates terminal conditions after a completed move.
    ///
    /// The order is load-bearing: mate outranks stalemate outranks material
    /// outranks repetition outranks the fifty-move rule. Repetition and
    /// fifty-move draws are claimed automatically.
    fn check_game_end(&mut self) {
        if self.pos.is_checkmate() {
            // The side to move is mated; the side that just moved wins.
            self.result = Some(match self.pos.turn() {
                Color::White => GameResult::BlackWin,
                Color::Black => GameResult::WhiteWin,
            });
            self.termination = Some(Termination::Checkmate);
            self.end_game();
        } else if self.pos.is_stalemate() {
            self.result = Some(GameResult::Draw);
            self.termination = Some(Termination::Stalemate);
            self.end_game();
        } else if self.pos.is_insufficient_material() {
            self.result = Some(GameResult::Draw);
            self.termination = Some(Termination::Insufficient);
            self.end_game();
        } else if self.repetition_count() >= 3 {
            self.result = Some(GameResult::Draw);
            self.termination = Some(Termination::Repetition);
            self.end_game();
        } else if self.pos.halfmoves() >= 100 {
            self.result = Some(GameResult::Draw);
            self.termination = Some(Termination::FiftyMove);
            self.end_game();
        }
    }

    /// Ends the game because a side's clock ran out.
    pub fn end_by_timeout(&mut self, flagged: Color) {
        if self.status == GameStatus::Ended {
            return;
        }
        self.result = Some(match flagged {
            Color::White => GameResult::BlackWin,
            Color::Black => GameResult::WhiteWin,
        });
        self.termination = Some(Termination::Timeout);
        self.end_game();
    }

    /// Ends the game because a side stayed disconnected past the forfeit
    /// window.
    pub fn end_by_disconnect(&mut self, disconnected: Color) {
        if self.status == GameStatus::Ended {
            return;
        }
        self.result = Some(match disconnected {
            Color::White => GameResult::BlackWin,
            Color::Black => GameResult::WhiteWin,
        });
        self.termination = Some(Termination::Disconnect);
        self.end_game();
    }

    fn end_game(&mut self) {
        self.status = GameStatus::Ended;
        self.ended_at = Some(Utc::now());
    }

    /// Current position in FEN.
    pub fn fen(&self) -> String {
        Fen::from_position(&self.pos, EnPassantMode::Legal).to_string()
    }

    /// Protocol string of the side to move.
    pub fn to_move(&self) -> &'static str {
        color_str(self.pos.turn())
    }

    /// The color an agent plays in this game, if they are a player.
    pub fn agent_color(&self, agent_id: &str) -> Option<Color> {
        if agent_id == self.white_agent_id {
            Some(Color::White)
        } else if agent_id == self.black_agent_id {
            Some(Color::Black)
        } else {
            None
        }
    }

    /// The opponent of an agent, if they are a player.
    pub fn opponent_of(&self, agent_id: &str) -> Option<&str> {
        match self.agent_color(agent_id)? {
            Color::White => Some(&self.black_agent_id),
            Color::Black => Some(&self.white_agent_id),
        }
    }

    /// Whether it is this agent's turn to move.
    pub fn is_agent_turn(&self, agent_id: &str) -> bool {
        self.agent_color(agent_id) == Some(self.pos.turn())
    }

    /// Connection bookkeeping for a side.
    pub fn side_conn_mut(&mut self, color: Color) -> &mut SideConnection {
        match color {
            Color::White => &mut self.white_conn,
            Color::Black => &mut self.black_conn,
        }
    }

    /// The `state` event payload: position, clocks (0.1s precision), side
    /// to move and move number.
    pub fn state_json(&self) -> serde_json::Value {
        let (white, black) = self.clock.current_times();
        serde_json::json!({
            "event": "state",
            "fen": self.fen(),
            "last_move": self.moves.last(),
            "clock_white": (white * 10.0).round() / 10.0,
            "clock_black": (black * 10.0).round() / 10.0,
            "to_move": self.to_move(),
            "move_number": self.pos.fullmoves().get(),
        })
    }

    /// Exports the game as PGN with the arena's standard headers and a
    /// SAN movetext rebuilt by replaying the move history.
    pub fn pgn(&self) -> String {
        let mut out = String::new();

        out.push_str("[Event \"MoltChess Arena\"]\n");
        out.push_str("[Site \"moltchess.io\"]\n");

        match self.started_at {
            Some(started) => {
                out.push_str(&format!("[Date \"{}\"]\n", started.format("%Y.%m.%d")));
            }
            None => out.push_str("[Date \"????.??.??\"]\n"),
        }

        out.push_str(&format!("[White \"{}\"]\n", self.white_agent_id));
        out.push_str(&format!("[Black \"{}\"]\n", self.black_agent_id));
        out.push_str(&format!("[TimeControl \"{}\"]\n", self.category.time_control()));

        let result_str = self.result.map(|r| r.pgn_str()).unwrap_or("*");
        out.push_str(&format!("[Result \"{}\"]\n", result_str));
        if let Some(termination) = self.termination {
            out.push_str(&format!("[Termination \"{}\"]\n", termination));
        }
        out.push('\n');

        // Rebuild SAN by replaying the UCI history from the start.
        let mut board = Chess::default();
        let mut move_text = String::new();
        for (i, uci) in self.moves.iter().enumerate() {
            let Ok(parsed) = uci.parse::<UciMove>() else {
                break;
            };
            let Ok(mv) = parsed.to_move(&board) else {
                break;
            };
            let san = San::from_move(&board, mv).to_string();
            let Ok(next) = board.play(mv) else {
                break;
            };
            board = next;

            if i % 2 == 0 {
                if !move_text.is_empty() {
                    move_text.push(' ');
                }
                move_text.push_str(&format!("{}.", i / 2 + 1));
            }
            move_text.push(' ');
            move_text.push_str(&san);
        }

        if !move_text.is_empty() {
            move_text.push(' ');
        }
        move_text.push_str(result_str);

        out.push_str(&wrap_text(&move_text, 80));
        out.push('\n');
        out
    }

    /// Final clock snapshot for persistence.
    pub fn remaining_times(&self) -> (f64, f64) {
        self.clock.current_times()
    }
}

/// Wraps movetext at word boundaries to the given column width.
fn wrap_text(text: &str, max_width: usize) -> String {
    let mut out = String::new();
    let mut line_len = 0;
    for word in text.split_whitespace() {
        if line_len > 0 && line_len + 1 + word.len() > max_width {
            out.push('\n');
            line_len = 0;
        } else if line_len > 0 {
            out.push(' ');
            line_len += 1;
        }
        out.push_str(word);
        line_len += word.len();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_game(category: Category) -> ChessGame {
        let mut game = ChessGame::new(
            "g1".to_string(),
            "agent-white".to_string(),
            "White Agent".to_string(),
            "agent-black".to_string(),
            "Black Agent".to_string(),
            category,
            1200,
            1200,
        );
        game.start();
        game
    }

    fn set_position(game: &mut ChessGame, fen: &str) {
        game.pos = fen
            .parse::<Fen>()
            .unwrap()
            .into_position(CastlingMode::Standard)
            .unwrap();
    }

    #[test]
    fn test_fools_mate() {
        let mut game = test_game(Category::Bullet);
        for mv in ["f2f3", "e7e5", "g2g4", "d8h4"] {
            game.make_move(mv).unwrap();
        }
        assert_eq!(game.status, GameStatus::Ended);
        assert_eq!(game.result, Some(GameResult::BlackWin));
        assert_eq!(game.termination, Some(Termination::Checkmate));
        assert!(game.ended_at.is_some());
    }

    #[test]
    fn test_illegal_and_malformed_moves() {
        let mut game = test_game(Category::Blitz);
        assert_eq!(game.make_move("e2e5").unwrap_err(), "Illegal move");
        assert_eq!(game.make_move("banana").unwrap_err(), "Invalid move format");
        // Rejections leave the game running and the history untouched.
        assert_eq!(game.status, GameStatus::Active);
        assert!(game.moves.is_empty());
        game.make_move("e2e4").unwrap();
        assert_eq!(game.moves, vec!["e2e4"]);
        assert_eq!(game.to_move(), "black");
    }

    #[test]
    fn test_moves_rejected_after_end() {
        let mut game = test_game(Category::Bullet);
        for mv in ["f2f3", "e7e5", "g2g4", "d8h4"] {
            game.make_move(mv).unwrap();
        }
        assert_eq!(game.make_move("e2e4").unwrap_err(), "Game is not active");
    }

    #[test]
    fn test_timeout_rejects_move_and_ends_game() {
        let mut game = test_game(Category::Bullet);
        game.clock.set_remaining(0.0, 120.0);
        assert_eq!(game.make_move("e2e4").unwrap_err(), "Time out");
        assert_eq!(game.status, GameStatus::Ended);
        assert_eq!(game.result, Some(GameResult::BlackWin));
        assert_eq!(game.termination, Some(Termination::Timeout));
    }

    #[test]
    fn test_stalemate() {
        // Sam Loyd's ten-move stalemate.
        let mut game = test_game(Category::Rapid);
        let moves = [
            "e2e3", "a7a5", "d1h5", "a8a6", "h5a5", "h7h5", "a5c7", "a6h6",
            "h2h4", "f7f6", "c7d7", "e8f7", "d7b7", "d8d3", "b7b8", "d3h7",
            "b8c8", "f7g6", "c8e6",
        ];
        for mv in moves {
            game.make_move(mv).unwrap();
        }
        assert_eq!(game.result, Some(GameResult::Draw));
        assert_eq!(game.termination, Some(Termination::Stalemate));
    }

    #[test]
    fn test_threefold_repetition_auto_claimed() {
        let mut game = test_game(Category::Blitz);
        let shuffle = ["g1f3", "g8f6", "f3g1", "f6g8"];
        for mv in shuffle {
            game.make_move(mv).unwrap();
        }
        assert_eq!(game.status, GameStatus::Active);
        for mv in shuffle {
            game.make_move(mv).unwrap();
        }
        // The starting position has now occurred for the third time.
        assert_eq!(game.status, GameStatus::Ended);
        assert_eq!(game.result, Some(GameResult::Draw));
        assert_eq!(game.termination, Some(Termination::Repetition));
    }

    #[test]
    fn test_fifty_move_rule_auto_claimed() {
        let mut game = test_game(Category::Rapid);
        set_position(&mut game, "7k/8/8/8/8/8/8/R6K w - - 99 80");
        game.make_move("a1a2").unwrap();
        assert_eq!(game.result, Some(GameResult::Draw));
        assert_eq!(game.termination, Some(Termination::FiftyMove));
    }

    #[test]
    fn test_insufficient_material() {
        let mut game = test_game(Category::Blitz);
        set_position(&mut game, "k7/8/8/8/8/8/1p6/K7 w - - 0 1");
        game.make_move("a1b2").unwrap();
        assert_eq!(game.result, Some(GameResult::Draw));
        assert_eq!(game.termination, Some(Termination::Insufficient));
    }

    #[test]
    fn test_disconnect_forfeit_from_any_live_state() {
        let mut game = test_game(Category::Rapid);
        game.make_move("e2e4").unwrap();
        game.end_by_disconnect(Color::Black);
        assert_eq!(game.result, Some(GameResult::WhiteWin));
        assert_eq!(game.termination, Some(Termination::Disconnect));
        // A second terminal cannot overwrite the first.
        game.end_by_timeout(Color::White);
        assert_eq!(game.termination, Some(Termination::Disconnect));
    }

    #[test]
    fn test_turn_tracking() {
        let mut game = test_game(Category::Bullet);
        assert!(game.is_agent_turn("agent-white"));
        assert!(!game.is_agent_turn("agent-black"));
        assert!(!game.is_agent_turn("somebody-else"));
        game.make_move("e2e4").unwrap();
        assert!(game.is_agent_turn("agent-black"));
        assert_eq!(game.opponent_of("agent-white"), Some("agent-black"));
        assert_eq!(game.opponent_of("stranger"), None);
    }

    #[test]
    fn test_state_json_shape() {
        let mut game = test_game(Category::Bullet);
        let state = game.state_json();
        assert_eq!(state["event"], "state");
        assert_eq!(state["last_move"], serde_json::Value::Null);
        assert_eq!(state["to_move"], "white");
        assert_eq!(state["move_number"], 1);

        game.make_move("e2e4").unwrap();
        let state = game.state_json();
        assert_eq!(state["last_move"], "e2e4");
        assert_eq!(state["to_move"], "black");
        // Clocks are reported to a tenth of a second.
        let clock_white = state["clock_white"].as_f64().unwrap();
        assert!((clock_white * 10.0).fract().abs() < 1e-9);
    }

    #[test]
    fn test_pgn_export() {
        let mut game = test_game(Category::Bullet);
        for mv in ["f2f3", "e7e5", "g2g4", "d8h4"] {
            game.make_move(mv).unwrap();
        }
        let pgn = game.pgn();
        assert!(pgn.contains("[Event \"MoltChess Arena\"]"));
        assert!(pgn.contains("[White \"agent-white\"]"));
        assert!(pgn.contains("[Black \"agent-black\"]"));
        assert!(pgn.contains("[TimeControl \"120+1\"]"));
        assert!(pgn.contains("[Result \"0-1\"]"));
        assert!(pgn.contains("[Termination \"checkmate\"]"));
        assert!(pgn.contains("1. f3 e5 2. g4 Qh4"));
        assert!(pgn.trim_end().ends_with("0-1"));
    }

    #[test]
    fn test_fen_round_trip() {
        let mut game = test_game(Category::Blitz);
        for mv in ["e2e4", "c7c5", "g1f3"] {
            game.make_move(mv).unwrap();
        }
        let fen = game.fen();
        let reparsed: Chess = fen
            .parse::<Fen>()
            .unwrap()
            .into_position(CastlingMode::Standard)
            .unwrap();
        assert_eq!(Fen::from_position(&reparsed, EnPassantMode::Legal).to_string(), fen);
    }

    #[test]
    fn test_pgn_replay_reproduces_final_fen() {
        let mut game = test_game(Category::Blitz);
        for mv in ["e2e4", "e7e5", "g1f3", "b8c6", "f1b5", "a7a6", "b5c6", "d7c6", "e1g1"] {
            game.make_move(mv).unwrap();
        }
        // Replaying the recorded UCI history reproduces the position.
        let mut board = Chess::default();
        for uci in &game.moves {
            let mv = uci.parse::<UciMove>().unwrap().to_move(&board).unwrap();
            board = board.play(mv).unwrap();
        }
        assert_eq!(
            Fen::from_position(&board, EnPassantMode::Legal).to_string(),
            game.fen()
        );
    }
}
