//! Core types for the MoltChess arena.
//!
//! This module defines the domain vocabulary shared by every other module:
//! time-control categories, game status and result codes, termination
//! reasons, and the Elo bands used for matchmaking display. All wire-facing
//! enums serialize to the lowercase / snake_case strings of the session
//! protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Category & TimeControl
// ---------------------------------------------------------------------------

/// A time-control category. Each category has its own Elo rating,
/// matchmaking queue, cooldown, and loss streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// 2 minutes + 1 second increment.
    Bullet,
    /// 3 minutes + 2 seconds increment.
    Blitz,
    /// 10 minutes + 5 seconds increment.
    Rapid,
}

impl Category {
    /// All categories, in protocol order.
    pub const ALL: [Category; 3] = [Category::Bullet, Category::Blitz, Category::Rapid];

    /// The protocol string for this category.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Bullet => "bullet",
            Category::Blitz => "blitz",
            Category::Rapid => "rapid",
        }
    }

    /// The fixed time control for this category.
    pub fn time_control(self) -> TimeControl {
        match self {
            Category::Bullet => TimeControl { base: 120, increment: 1 },
            Category::Blitz => TimeControl { base: 180, increment: 2 },
            Category::Rapid => TimeControl { base: 600, increment: 5 },
        }
    }

    /// Post-game cooldown in seconds before the next seek is allowed.
    pub fn cooldown_seconds(self) -> u64 {
        match self {
            Category::Bullet => 30,
            Category::Blitz => 60,
            Category::Rapid => 120,
        }
    }

    /// The `agents` table column holding this category's Elo.
    pub fn elo_column(self) -> &'static str {
        match self {
            Category::Bullet => "elo_bullet",
            Category::Blitz => "elo_blitz",
            Category::Rapid => "elo_rapid",
        }
    }

    /// The `agents` table column holding this category's loss streak.
    pub fn loss_streak_column(self) -> &'static str {
        match self {
            Category::Bullet => "loss_streak_bullet",
            Category::Blitz => "loss_streak_blitz",
            Category::Rapid => "loss_streak_rapid",
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bullet" => Ok(Category::Bullet),
            "blitz" => Ok(Category::Blitz),
            "rapid" => Ok(Category::Rapid),
            _ => Err(format!("Invalid category: {}", s)),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chess-clock time control: base time plus Fischer increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeControl {
    /// Base time per side in seconds.
    pub base: u32,
    /// Seconds credited to a side after each completed move.
    pub increment: u32,
}

impl fmt::Display for TimeControl {
    /// Renders the PGN `TimeControl` tag form, e.g. `120+1`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.base, self.increment)
    }
}

// ---------------------------------------------------------------------------
// Game status / result / termination
// ---------------------------------------------------------------------------

/// Lifecycle state of a game. A game never leaves `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Pending,
    Active,
    Ended,
}

/// Outcome of a completed game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    WhiteWin,
    BlackWin,
    Draw,
}

impl GameResult {
    pub fn as_str(self) -> &'static str {
        match self {
            GameResult::WhiteWin => "white_win",
            GameResult::BlackWin => "black_win",
            GameResult::Draw => "draw",
        }
    }

    /// The PGN `Result` tag value.
    pub fn pgn_str(self) -> &'static str {
        match self {
            GameResult::WhiteWin => "1-0",
            GameResult::BlackWin => "0-1",
            GameResult::Draw => "1/2-1/2",
        }
    }
}

/// Why a game ended.
///
/// `Resignation` is reserved in the schema for forward compatibility; no
/// client action triggers it in this version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Checkmate,
    Timeout,
    Stalemate,
    Insufficient,
    Repetition,
    FiftyMove,
    Disconnect,
    Resignation,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Checkmate => "checkmate",
            Termination::Timeout => "timeout",
            Termination::Stalemate => "stalemate",
            Termination::Insufficient => "insufficient",
            Termination::Repetition => "repetition",
            Termination::FiftyMove => "fifty_move",
            Termination::Disconnect => "disconnect",
            Termination::Resignation => "resignation",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Elo band
// ---------------------------------------------------------------------------

/// Coarse skill bucket, used for display and queue statistics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EloBand {
    /// Below 1000.
    Bronze,
    /// 1000 through 1400.
    Silver,
    /// Above 1400.
    Gold,
}

impl EloBand {
    pub fn as_str(self) -> &'static str {
        match self {
            EloBand::Bronze => "bronze",
            EloBand::Silver => "silver",
            EloBand::Gold => "gold",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip() {
        for cat in Category::ALL {
            assert_eq!(cat.as_str().parse::<Category>().unwrap(), cat);
        }
        assert!("classical".parse::<Category>().is_err());
    }

    #[test]
    fn test_time_controls() {
        assert_eq!(Category::Bullet.time_control(), TimeControl { base: 120, increment: 1 });
        assert_eq!(Category::Blitz.time_control(), TimeControl { base: 180, increment: 2 });
        assert_eq!(Category::Rapid.time_control(), TimeControl { base: 600, increment: 5 });
        assert_eq!(Category::Bullet.time_control().to_string(), "120+1");
    }

    #[test]
    fn test_wire_serialization() {
        assert_eq!(serde_json::to_string(&Category::Bullet).unwrap(), "\"bullet\"");
        assert_eq!(serde_json::to_string(&GameResult::WhiteWin).unwrap(), "\"white_win\"");
        assert_eq!(serde_json::to_string(&Termination::FiftyMove).unwrap(), "\"fifty_move\"");
        assert_eq!(serde_json::to_string(&GameStatus::Active).unwrap(), "\"active\"");
    }

    #[test]
    fn test_pgn_result_strings() {
        assert_eq!(GameResult::WhiteWin.pgn_str(), "1-0");
        assert_eq!(GameResult::BlackWin.pgn_str(), "0-1");
        assert_eq!(GameResult::Draw.pgn_str(), "1/2-1/2");
    }
}
