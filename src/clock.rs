//! Chess clock arithmetic.
//!
//! The clock stores each side's remaining seconds plus the instant of the
//! last completed move. Only the stored values change on `switch()`; the
//! effective remaining time for the active side is always derived as
//! `stored - (now - last_move_at)`, so no background task has to tick the
//! clock down.
//!
//! The Fischer increment is credited *after* the elapsed time is deducted.
//! Callers must check `timeout()` before `switch()` — a move arriving after
//! the flag fell is rejected rather than credited.

use crate::types::TimeControl;
use shakmaty::Color;
use std::time::Instant;

/// A two-sided chess clock with Fischer increment.
#[derive(Debug, Clone)]
pub struct Clock {
    white_remaining: f64,
    black_remaining: f64,
    increment: f64,
    active_color: Color,
    last_move_at: Option<Instant>,
}

impl Clock {
    /// Creates a stopped clock with both sides at the base time.
    pub fn new(tc: TimeControl) -> Self {
        Self {
            white_remaining: tc.base as f64,
            black_remaining: tc.base as f64,
            increment: tc.increment as f64,
            active_color: Color::White,
            last_move_at: None,
        }
    }

    /// Starts the clock with White to move.
    pub fn start(&mut self) {
        self.active_color = Color::White;
        self.last_move_at = Some(Instant::now());
    }

    /// The side whose clock is currently running.
    pub fn active_color(&self) -> Color {
        self.active_color
    }

    /// Completes a move: deducts elapsed time from the active side, credits
    /// the increment, toggles the active color, and returns the new
    /// remaining time of the side that just moved.
    pub fn switch(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = self
            .last_move_at
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);

        let remaining = match self.active_color {
            Color::White => {
                self.white_remaining -= elapsed;
                self.white_remaining += self.increment;
                self.white_remaining
            }
            Color::Black => {
                self.black_remaining -= elapsed;
                self.black_remaining += self.increment;
                self.black_remaining
            }
        };

        self.active_color = !self.active_color;
        self.last_move_at = Some(now);

        remaining
    }

    /// Snapshot of both clocks, with elapsed time applied to the active
    /// side and clamped at zero.
    pub fn current_times(&self) -> (f64, f64) {
        let Some(last) = self.last_move_at else {
            return (self.white_remaining, self.black_remaining);
        };

        let elapsed = last.elapsed().as_secs_f64();
        match self.active_color {
            Color::White => ((self.white_remaining - elapsed).max(0.0), self.black_remaining),
            Color::Black => (self.white_remaining, (self.black_remaining - elapsed).max(0.0)),
        }
    }

    /// Returns the side whose effective remaining time has reached zero,
    /// checking White first as a deterministic tie-break.
    pub fn timeout(&self) -> Option<Color> {
        let (white, black) = self.current_times();
        if white <= 0.0 {
            return Some(Color::White);
        }
        if black <= 0.0 {
            return Some(Color::Black);
        }
        None
    }
}

#[cfg(test)]
impl Clock {
    /// Overwrites the stored remaining times, bypassing wall-clock waits.
    pub(crate) fn set_remaining(&mut self, white: f64, black: f64) {
        self.white_remaining = white;
        self.black_remaining = black;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bullet_clock() -> Clock {
        Clock::new(TimeControl { base: 120, increment: 1 })
    }

    #[test]
    fn test_new_clock_is_stopped() {
        let clock = bullet_clock();
        assert_eq!(clock.current_times(), (120.0, 120.0));
        assert!(clock.timeout().is_none());
    }

    #[test]
    fn test_switch_credits_increment_and_toggles() {
        let mut clock = bullet_clock();
        clock.start();
        let remaining = clock.switch();
        // Essentially no time elapsed, so White gains the full increment.
        assert!(remaining > 120.9 && remaining <= 121.0);
        assert_eq!(clock.active_color(), Color::Black);
        let (white, black) = clock.current_times();
        assert!(white > 120.9);
        assert!((black - 120.0).abs() < 0.1);
    }

    #[test]
    fn test_elapsed_counts_against_active_side_only() {
        let mut clock = bullet_clock();
        clock.start();
        clock.last_move_at = Some(Instant::now() - Duration::from_secs(5));
        let (white, black) = clock.current_times();
        assert!((white - 115.0).abs() < 0.2);
        assert!((black - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_increment_credited_after_decrement() {
        let mut clock = bullet_clock();
        clock.start();
        clock.white_remaining = 0.4;
        // Not yet flagged, so the move is accepted and the increment lands
        // on top of what was left.
        assert!(clock.timeout().is_none());
        let remaining = clock.switch();
        assert!(remaining > 1.3 && remaining <= 1.4);
    }

    #[test]
    fn test_timeout_detection() {
        let mut clock = bullet_clock();
        clock.start();
        clock.white_remaining = 2.0;
        clock.last_move_at = Some(Instant::now() - Duration::from_secs(3));
        let (white, _) = clock.current_times();
        assert_eq!(white, 0.0);
        assert_eq!(clock.timeout(), Some(Color::White));
    }

    #[test]
    fn test_timeout_white_checked_first() {
        let mut clock = bullet_clock();
        clock.white_remaining = 0.0;
        clock.black_remaining = 0.0;
        clock.start();
        assert_eq!(clock.timeout(), Some(Color::White));
    }

    #[test]
    fn test_inactive_side_not_flagged() {
        let mut clock = bullet_clock();
        clock.start();
        clock.switch();
        // Black is now active; White's stored time is untouched by waiting.
        clock.last_move_at = Some(Instant::now() - Duration::from_secs(2));
        let (white, black) = clock.current_times();
        assert!(white > 120.0);
        assert!((black - 118.0).abs() < 0.2);
        assert!(clock.timeout().is_none());
    }
}
