//! Elo rating calculation.
//!
//! Standard K-factor Elo with an absolute floor. Deltas are rounded
//! half-away-from-zero (`f64::round`), and the decisive-result deltas are
//! symmetric by construction, so `winner + loser == 0` whenever neither
//! player sits at the floor.

use crate::types::EloBand;

/// K-factor applied to every rated game.
pub const K_FACTOR: f64 = 32.0;

/// No rating ever drops below this value.
pub const ELO_FLOOR: i64 = 100;

/// Rating every agent starts with in each category.
pub const ELO_STARTING: i64 = 1200;

/// Expected score of the first player against the second.
fn expected_score(elo_a: i64, elo_b: i64) -> f64 {
    1.0 / (1.0 + 10f64.powf((elo_b - elo_a) as f64 / 400.0))
}

/// Computes the rating deltas after a game.
///
/// For a decisive result, call with `(winner_elo, loser_elo, false)`; the
/// returned pair is `(winner_delta, loser_delta)` with `winner_delta >= 0`
/// and `loser_delta <= 0` guaranteed even after rounding.
///
/// For a draw, call with `(white_elo, black_elo, true)`; both players move
/// toward an expected score of 0.5, so the favorite sheds a point or two
/// and the underdog gains them.
pub fn elo_change(first_elo: i64, second_elo: i64, is_draw: bool) -> (i64, i64) {
    let expected_first = expected_score(first_elo, second_elo);
    let expected_second = 1.0 - expected_first;

    if is_draw {
        let first_change = (K_FACTOR * (0.5 - expected_first)).round() as i64;
        let second_change = (K_FACTOR * (0.5 - expected_second)).round() as i64;
        (first_change, second_change)
    } else {
        let winner_change = ((K_FACTOR * (1.0 - expected_first)).round() as i64).max(0);
        (winner_change, -winner_change)
    }
}

/// Clamps a rating at the absolute floor.
pub fn apply_floor(elo: i64) -> i64 {
    elo.max(ELO_FLOOR)
}

/// The display band for a rating: bronze below 1000, silver through 1400,
/// gold above.
pub fn elo_band(elo: i64) -> EloBand {
    if elo < 1000 {
        EloBand::Bronze
    } else if elo <= 1400 {
        EloBand::Silver
    } else {
        EloBand::Gold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_ratings_split_k() {
        let (winner, loser) = elo_change(1200, 1200, false);
        assert_eq!(winner, 16);
        assert_eq!(loser, -16);
    }

    #[test]
    fn test_decisive_deltas_are_zero_sum() {
        for (a, b) in [(1200, 1210), (900, 1500), (2000, 1000), (100, 2400)] {
            let (winner, loser) = elo_change(a, b, false);
            assert_eq!(winner + loser, 0, "deltas for {} vs {}", a, b);
            assert!(winner >= 0);
            assert!(loser <= 0);
        }
    }

    #[test]
    fn test_upset_win_pays_more() {
        let (underdog, _) = elo_change(1000, 1400, false);
        let (favorite, _) = elo_change(1400, 1000, false);
        assert!(underdog > favorite);
        assert!(underdog > 16);
        assert!(favorite < 16);
    }

    #[test]
    fn test_heavy_favorite_never_gains_negative() {
        // Expected score so close to 1 that the raw delta rounds to 0.
        let (winner, loser) = elo_change(3000, 100, false);
        assert!(winner >= 0);
        assert_eq!(loser, -winner);
    }

    #[test]
    fn test_draw_between_equals_changes_nothing() {
        let (white, black) = elo_change(1200, 1200, true);
        assert_eq!(white, 0);
        assert_eq!(black, 0);
    }

    #[test]
    fn test_draw_moves_players_toward_each_other() {
        let (favorite, underdog) = elo_change(1400, 1000, true);
        assert!(favorite < 0);
        assert!(underdog > 0);
        // Both deltas come from the same expected-score gap.
        assert!((favorite + underdog).abs() <= 1);
    }

    #[test]
    fn test_floor() {
        assert_eq!(apply_floor(99), 100);
        assert_eq!(apply_floor(100), 100);
        assert_eq!(apply_floor(1200), 1200);
        assert_eq!(apply_floor(-50), 100);
    }

    #[test]
    fn test_bands() {
        assert_eq!(elo_band(999), EloBand::Bronze);
        assert_eq!(elo_band(1000), EloBand::Silver);
        assert_eq!(elo_band(1400), EloBand::Silver);
        assert_eq!(elo_band(1401), EloBand::Gold);
    }
}
