//! Post-game cooldowns and loss-streak backoff.
//!
//! Every completed game puts the player on a per-category cooldown before
//! they may seek again. Losing streaks of three or more add an extra
//! penalty on top of the base cooldown. Categories are fully independent:
//! a bullet cooldown never blocks a rapid seek.

use crate::types::Category;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Consecutive decisive losses required before the extra penalty applies.
pub const LOSS_STREAK_THRESHOLD: u32 = 3;

/// Extra cooldown seconds added once the streak threshold is reached.
pub const LOSS_STREAK_EXTRA_COOLDOWN: u64 = 120;

/// Rate-limit state for one (agent, category) pair.
#[derive(Debug, Clone, Default)]
struct RateState {
    /// When the current cooldown expires. May be in the past.
    cooldown_until: Option<Instant>,
    /// Consecutive decisive losses. Reset by a win, untouched by a draw.
    loss_streak: u32,
}

/// Tracks cooldowns and loss streaks for all agents.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: HashMap<(String, Category), RateState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether an agent may seek in a category.
    ///
    /// Returns `None` when the seek is allowed, otherwise the refusal
    /// reason and the whole-second retry delay (rounded up).
    pub fn can_seek(&self, agent_id: &str, category: Category) -> Option<(&'static str, u64)> {
        let state = self.states.get(&(agent_id.to_string(), category))?;
        let until = state.cooldown_until?;
        let now = Instant::now();
        if now < until {
            let remaining = until.duration_since(now).as_secs_f64();
            return Some(("cooldown", remaining.ceil() as u64));
        }
        None
    }

    /// Applies a game result: updates the loss streak and starts the
    /// post-game cooldown. Returns the total cooldown seconds applied.
    pub fn on_game_result(
        &mut self,
        agent_id: &str,
        category: Category,
        is_winner: bool,
        is_draw: bool,
    ) -> u64 {
        let state = self
            .states
            .entry((agent_id.to_string(), category))
            .or_default();

        let mut total = category.cooldown_seconds();

        if is_draw {
            // Draws leave the streak alone.
        } else if is_winner {
            state.loss_streak = 0;
        } else {
            state.loss_streak += 1;
            if state.loss_streak >= LOSS_STREAK_THRESHOLD {
                total += LOSS_STREAK_EXTRA_COOLDOWN;
            }
        }

        state.cooldown_until = Some(Instant::now() + Duration::from_secs(total));
        total
    }

    /// Current loss streak for an agent in a category.
    pub fn loss_streak(&self, agent_id: &str, category: Category) -> u32 {
        self.states
            .get(&(agent_id.to_string(), category))
            .map(|s| s.loss_streak)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_agent_can_seek() {
        let limiter = RateLimiter::new();
        assert!(limiter.can_seek("a1", Category::Bullet).is_none());
    }

    #[test]
    fn test_cooldown_after_game() {
        let mut limiter = RateLimiter::new();
        let total = limiter.on_game_result("a1", Category::Bullet, true, false);
        assert_eq!(total, 30);

        let (reason, retry_after) = limiter.can_seek("a1", Category::Bullet).unwrap();
        assert_eq!(reason, "cooldown");
        assert!(retry_after >= 29 && retry_after <= 30);
    }

    #[test]
    fn test_cooldowns_are_per_category() {
        let mut limiter = RateLimiter::new();
        limiter.on_game_result("a1", Category::Bullet, false, false);
        assert!(limiter.can_seek("a1", Category::Bullet).is_some());
        assert!(limiter.can_seek("a1", Category::Rapid).is_none());
        assert!(limiter.can_seek("a2", Category::Bullet).is_none());
    }

    #[test]
    fn test_loss_streak_builds_to_penalty() {
        let mut limiter = RateLimiter::new();
        assert_eq!(limiter.on_game_result("a1", Category::Bullet, false, false), 30);
        assert_eq!(limiter.on_game_result("a1", Category::Bullet, false, false), 30);
        // Third straight loss crosses the threshold: 30 + 120.
        assert_eq!(limiter.on_game_result("a1", Category::Bullet, false, false), 150);
        assert_eq!(limiter.loss_streak("a1", Category::Bullet), 3);
        // And it stays penalized until a win or draw-free recovery.
        assert_eq!(limiter.on_game_result("a1", Category::Bullet, false, false), 150);
    }

    #[test]
    fn test_win_resets_streak() {
        let mut limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.on_game_result("a1", Category::Blitz, false, false);
        }
        assert_eq!(limiter.loss_streak("a1", Category::Blitz), 3);

        assert_eq!(limiter.on_game_result("a1", Category::Blitz, true, false), 60);
        assert_eq!(limiter.loss_streak("a1", Category::Blitz), 0);

        // A second win is a no-op on the streak.
        limiter.on_game_result("a1", Category::Blitz, true, false);
        assert_eq!(limiter.loss_streak("a1", Category::Blitz), 0);
    }

    #[test]
    fn test_draw_leaves_streak_untouched() {
        let mut limiter = RateLimiter::new();
        limiter.on_game_result("a1", Category::Rapid, false, false);
        limiter.on_game_result("a1", Category::Rapid, false, false);
        let total = limiter.on_game_result("a1", Category::Rapid, false, true);
        assert_eq!(total, 120);
        assert_eq!(limiter.loss_streak("a1", Category::Rapid), 2);
    }
}
