use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use skillratings::{
    elo::{elo, EloConfig, EloRating},
    Outcomes,
};

use super::{check_lengths, RankSystem};
use crate::error::TournamentError;

/// An ELO rating, kept as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EloState {
    /// Current rating.
    pub score: i64,
}

/// Pairwise ELO. Matches with more than two agents are scored as every pair playing each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EloSystem {
    /// Rating of a new player.
    pub starting_score: i64,
    /// Maximum rating change per pairing.
    pub k_factor: f64,
}

impl Default for EloSystem {
    fn default() -> Self {
        Self {
            starting_score: 1000,
            k_factor: 32.0,
        }
    }
}

impl EloSystem {
    /// Custom starting score and K-factor.
    pub fn new(starting_score: i64, k_factor: f64) -> Self {
        Self {
            starting_score,
            k_factor,
        }
    }
}

impl RankSystem for EloSystem {
    type State = EloState;

    const NAME: &'static str = "elo";

    fn initialize_rank_state(&self) -> EloState {
        EloState {
            score: self.starting_score,
        }
    }

    fn update_ranks(
        &self,
        states: &[EloState],
        relative_ranks: &[u32],
    ) -> Result<Vec<EloState>, TournamentError> {
        check_lengths(states.len(), relative_ranks.len())?;
        let config = EloConfig { k: self.k_factor };
        let ratings: Vec<EloRating> = states
            .iter()
            .map(|s| EloRating {
                rating: s.score as f64,
            })
            .collect();

        // deltas are computed from prior ratings only, so seat order does not matter
        let mut deltas = vec![0.0; states.len()];
        for i in 0..ratings.len() {
            for j in (i + 1)..ratings.len() {
                let outcome = match relative_ranks[i].cmp(&relative_ranks[j]) {
                    Ordering::Less => Outcomes::WIN,
                    Ordering::Equal => Outcomes::DRAW,
                    Ordering::Greater => Outcomes::LOSS,
                };
                let (a, b) = elo(&ratings[i], &ratings[j], &outcome, &config);
                deltas[i] += a.rating - ratings[i].rating;
                deltas[j] += b.rating - ratings[j].rating;
            }
        }

        Ok(states
            .iter()
            .zip(deltas)
            .map(|(s, delta)| EloState {
                score: (s.score as f64 + delta).round() as i64,
            })
            .collect())
    }

    fn rank_comparator(&self, a: &EloState, b: &EloState) -> Ordering {
        b.score.cmp(&a.score)
    }

    fn score(&self, state: &EloState) -> f64 {
        state.score as f64
    }
}
