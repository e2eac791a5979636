//! Glicko-2 update for a single 2-vs-2 match (per Mark Glickman's paper).
//!
//! Each player is rated against the two opposing players as one rating
//! period, score 1.0 for the winning team and 0.0 for the losing one. Padel
//! matches have no draws. The function is pure and deterministic so results
//! can be persisted once and replayed.

use crate::models::{RatingState, Team};

/// Glicko-2 internal scale factor.
const SCALE: f64 = 173.7178;
/// Convergence bound for the volatility iteration.
const CONVERGENCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
pub struct Glicko2Params {
    /// Volatility constraint (0.3–1.2 in the literature; smaller damps
    /// rating swings from upsets).
    pub tau: f64,
}

impl Default for Glicko2Params {
    fn default() -> Self {
        Self { tau: 0.5 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RatingCalculator {
    params: Glicko2Params,
}

impl RatingCalculator {
    pub fn new(params: Glicko2Params) -> Self {
        Self { params }
    }

    /// Rate one finished match. `players` is in fixed slot order (0-1 team A,
    /// 2-3 team B); the result preserves that order.
    pub fn rate_match(&self, players: &[RatingState; 4], winner: Team) -> [RatingState; 4] {
        let mut updated = *players;
        for (slot, out) in updated.iter_mut().enumerate() {
            let team = if slot < 2 { Team::A } else { Team::B };
            let score = if team == winner { 1.0 } else { 0.0 };
            let opponents = if slot < 2 {
                [players[2], players[3]]
            } else {
                [players[0], players[1]]
            };
            *out = self.update_player(players[slot], &opponents, score);
        }
        updated
    }

    fn update_player(
        &self,
        current: RatingState,
        opponents: &[RatingState; 2],
        score: f64,
    ) -> RatingState {
        let mu = (current.rating - 1500.0) / SCALE;
        let phi = current.rating_deviation / SCALE;
        let sigma = current.volatility;

        // Estimated variance v and improvement delta over both opponents.
        let mut v_inv = 0.0;
        let mut delta_sum = 0.0;
        for opp in opponents {
            let mu_j = (opp.rating - 1500.0) / SCALE;
            let phi_j = opp.rating_deviation / SCALE;
            let g_j = g(phi_j);
            let e_j = expected(mu, mu_j, phi_j);
            v_inv += g_j * g_j * e_j * (1.0 - e_j);
            delta_sum += g_j * (score - e_j);
        }
        let v = 1.0 / v_inv;
        let delta = v * delta_sum;

        let sigma_prime = self.next_volatility(phi, v, delta, sigma);

        let phi_star = (phi * phi + sigma_prime * sigma_prime).sqrt();
        let phi_prime = 1.0 / (1.0 / (phi_star * phi_star) + 1.0 / v).sqrt();
        let mu_prime = mu + phi_prime * phi_prime * delta_sum;

        RatingState {
            rating: mu_prime * SCALE + 1500.0,
            rating_deviation: phi_prime * SCALE,
            volatility: sigma_prime,
        }
    }

    /// Volatility iteration, solved by bisection on the log-variance scale.
    fn next_volatility(&self, phi: f64, v: f64, delta: f64, sigma: f64) -> f64 {
        let a = (sigma * sigma).ln();
        let tau = self.params.tau;
        let f = |x: f64| {
            let ex = x.exp();
            let phi_sq = phi * phi;
            let num = ex * (delta * delta - phi_sq - v - ex);
            let den = 2.0 * (phi_sq + v + ex) * (phi_sq + v + ex);
            num / den - (x - a) / (tau * tau)
        };

        let mut lo = a - 10.0;
        let mut hi = a + 10.0;
        for _ in 0..50 {
            let mid = (lo + hi) / 2.0;
            if f(lo) * f(mid) < 0.0 {
                hi = mid;
            } else {
                lo = mid;
            }
            if (hi - lo).abs() < CONVERGENCE {
                break;
            }
        }
        (((lo + hi) / 2.0) / 2.0).exp()
    }
}

fn g(phi: f64) -> f64 {
    1.0 / (1.0 + 3.0 * phi * phi / (std::f64::consts::PI * std::f64::consts::PI)).sqrt()
}

fn expected(mu: f64, mu_j: f64, phi_j: f64) -> f64 {
    1.0 / (1.0 + (-g(phi_j) * (mu - mu_j)).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> [RatingState; 4] {
        [RatingState::default(); 4]
    }

    #[test]
    fn winners_gain_losers_lose() {
        let calc = RatingCalculator::default();
        let after = calc.rate_match(&defaults(), Team::A);

        assert!(after[0].rating > 1500.0);
        assert!(after[1].rating > 1500.0);
        assert!(after[2].rating < 1500.0);
        assert!(after[3].rating < 1500.0);
    }

    #[test]
    fn update_is_deterministic() {
        let calc = RatingCalculator::default();
        let players = [
            RatingState { rating: 1550.0, rating_deviation: 120.0, volatility: 0.06 },
            RatingState { rating: 1430.0, rating_deviation: 250.0, volatility: 0.06 },
            RatingState { rating: 1500.0, rating_deviation: 300.0, volatility: 0.06 },
            RatingState { rating: 1610.0, rating_deviation: 90.0, volatility: 0.06 },
        ];
        let first = calc.rate_match(&players, Team::B);
        let second = calc.rate_match(&players, Team::B);
        assert_eq!(first, second);
    }

    #[test]
    fn symmetric_match_moves_everyone_equally() {
        let calc = RatingCalculator::default();
        let after = calc.rate_match(&defaults(), Team::B);

        // All four started identical, so the two winners move by the same
        // amount and mirror the two losers.
        assert!((after[2].rating - after[3].rating).abs() < 1e-9);
        assert!((after[0].rating - after[1].rating).abs() < 1e-9);
        let gain = after[2].rating - 1500.0;
        let loss = 1500.0 - after[0].rating;
        assert!((gain - loss).abs() < 1e-9);
        assert!(gain > 0.0);
    }

    #[test]
    fn playing_shrinks_rating_deviation() {
        let calc = RatingCalculator::default();
        let after = calc.rate_match(&defaults(), Team::A);
        for state in after {
            assert!(state.rating_deviation < 350.0);
        }
    }

    #[test]
    fn expected_outcome_moves_ratings_less_than_upset() {
        let calc = RatingCalculator::default();
        let players = [
            RatingState { rating: 1800.0, rating_deviation: 100.0, volatility: 0.06 },
            RatingState { rating: 1800.0, rating_deviation: 100.0, volatility: 0.06 },
            RatingState { rating: 1400.0, rating_deviation: 100.0, volatility: 0.06 },
            RatingState { rating: 1400.0, rating_deviation: 100.0, volatility: 0.06 },
        ];
        let expected_win = calc.rate_match(&players, Team::A);
        let upset = calc.rate_match(&players, Team::B);

        let small_gain = expected_win[0].rating - 1800.0;
        let big_loss = 1800.0 - upset[0].rating;
        assert!(small_gain > 0.0);
        assert!(big_loss > small_gain);
    }

    #[test]
    fn volatility_stays_in_a_sane_band() {
        let calc = RatingCalculator::default();
        let after = calc.rate_match(&defaults(), Team::A);
        for state in after {
            assert!(state.volatility > 0.0 && state.volatility < 0.1);
        }
    }
}
