use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use skillratings::{
    trueskill::{trueskill_multi_team, TrueSkillConfig, TrueSkillRating},
    MultiTeamOutcome,
};

use super::{check_lengths, RankSystem};
use crate::error::TournamentError;

/// Gaussian skill belief.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrueSkillState {
    /// Mean skill.
    pub mu: f64,
    /// Uncertainty.
    pub sigma: f64,
}

impl TrueSkillState {
    /// Conservative skill estimate, `mu - 3 * sigma`.
    pub fn score(&self) -> f64 {
        self.mu - 3.0 * self.sigma
    }
}

/// TrueSkill over the finish order of every participant; supports any number of agents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrueSkillSystem {
    /// Mean of a new player.
    pub initial_mu: f64,
    /// Uncertainty of a new player.
    pub initial_sigma: f64,
    /// Skill difference giving an 80% chance to win.
    pub beta: f64,
    /// Probability of a draw between equal players.
    pub draw_probability: f64,
    /// Uncertainty added before every update.
    pub dynamics: f64,
}

impl Default for TrueSkillSystem {
    fn default() -> Self {
        Self::new(25.0, 25.0 / 3.0)
    }
}

impl TrueSkillSystem {
    /// Custom prior; the other parameters scale with it the usual way.
    pub fn new(initial_mu: f64, initial_sigma: f64) -> Self {
        Self {
            initial_mu,
            initial_sigma,
            beta: initial_sigma / 2.0,
            draw_probability: 0.1,
            dynamics: initial_sigma / 100.0,
        }
    }

    fn config(&self) -> TrueSkillConfig {
        TrueSkillConfig {
            draw_probability: self.draw_probability,
            beta: self.beta,
            default_dynamics: self.dynamics,
        }
    }
}

impl RankSystem for TrueSkillSystem {
    type State = TrueSkillState;

    const NAME: &'static str = "trueskill";

    fn initialize_rank_state(&self) -> TrueSkillState {
        TrueSkillState {
            mu: self.initial_mu,
            sigma: self.initial_sigma,
        }
    }

    fn update_ranks(
        &self,
        states: &[TrueSkillState],
        relative_ranks: &[u32],
    ) -> Result<Vec<TrueSkillState>, TournamentError> {
        check_lengths(states.len(), relative_ranks.len())?;
        if states.len() < 2 {
            return Ok(states.to_vec());
        }

        let teams: Vec<[TrueSkillRating; 1]> = states
            .iter()
            .map(|s| {
                [TrueSkillRating {
                    rating: s.mu,
                    uncertainty: s.sigma,
                }]
            })
            .collect();
        let teams_and_ranks: Vec<(&[TrueSkillRating], MultiTeamOutcome)> = teams
            .iter()
            .zip(relative_ranks)
            .map(|(team, rank)| (&team[..], MultiTeamOutcome::new(*rank as usize)))
            .collect();

        let updated = trueskill_multi_team(&teams_and_ranks, &self.config());
        if updated.len() != states.len() {
            return Err(TournamentError::Rank(format!(
                "trueskill returned {} teams for {} players",
                updated.len(),
                states.len()
            )));
        }
        updated
            .into_iter()
            .map(|team| {
                team.first()
                    .map(|r| TrueSkillState {
                        mu: r.rating,
                        sigma: r.uncertainty,
                    })
                    .ok_or_else(|| TournamentError::Rank("trueskill returned an empty team".into()))
            })
            .collect()
    }

    fn rank_comparator(&self, a: &TrueSkillState, b: &TrueSkillState) -> Ordering {
        b.score().total_cmp(&a.score())
    }

    fn score(&self, state: &TrueSkillState) -> f64 {
        state.score()
    }

    /// Keeps the learned mean but restores the initial uncertainty.
    fn on_player_update(&self, state: &TrueSkillState) -> TrueSkillState {
        TrueSkillState {
            mu: state.mu,
            sigma: self.initial_sigma,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winner_moves_up_and_uncertainty_shrinks() {
        let ts = TrueSkillSystem::default();
        let start = [ts.initialize_rank_state(); 2];
        let next = ts.update_ranks(&start, &[1, 2]).unwrap();
        assert!(next[0].mu > 25.0);
        assert!(next[1].mu < 25.0);
        assert!(next[0].sigma < 25.0 / 3.0);
        assert_eq!(ts.rank_comparator(&next[0], &next[1]), Ordering::Less);
    }

    #[test]
    fn supports_more_than_two_agents() {
        let ts = TrueSkillSystem::default();
        let start = [ts.initialize_rank_state(); 4];
        let next = ts.update_ranks(&start, &[1, 2, 3, 4]).unwrap();
        assert_eq!(next.len(), 4);
        for pair in next.windows(2) {
            assert!(pair[0].score() > pair[1].score());
        }
    }

    #[test]
    fn update_resets_sigma_only() {
        let ts = TrueSkillSystem::default();
        let learned = TrueSkillState { mu: 31.0, sigma: 2.0 };
        let reset = ts.on_player_update(&learned);
        assert_eq!(reset.mu, 31.0);
        assert_eq!(reset.sigma, 25.0 / 3.0);
    }

    #[test]
    fn initial_score_is_zero() {
        let ts = TrueSkillSystem::default();
        assert!(ts.score(&ts.initialize_rank_state()).abs() < 1e-9);
    }
}
