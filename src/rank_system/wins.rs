use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{check_lengths, RankSystem};
use crate::error::TournamentError;

/// Win, tie and loss counters and the points they are worth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WinsState {
    /// Matches won.
    pub wins: u32,
    /// Matches tied.
    pub ties: u32,
    /// Matches lost.
    pub losses: u32,
    /// `wins * win_value + ties * tie_value + losses * loss_value`.
    pub points: f64,
}

/// Counts wins, ties and losses of two-player matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WinsSystem {
    /// Points for a win.
    pub win_value: f64,
    /// Points for a tie.
    pub tie_value: f64,
    /// Points for a loss.
    pub loss_value: f64,
    /// More points rank higher when true.
    pub descending: bool,
}

impl Default for WinsSystem {
    fn default() -> Self {
        Self {
            win_value: 3.0,
            tie_value: 1.0,
            loss_value: 0.0,
            descending: true,
        }
    }
}

impl WinsSystem {
    /// Custom point values, more points rank higher.
    pub fn new(win_value: f64, tie_value: f64, loss_value: f64) -> Self {
        Self {
            win_value,
            tie_value,
            loss_value,
            descending: true,
        }
    }

    fn with_points(&self, mut state: WinsState) -> WinsState {
        state.points = f64::from(state.wins) * self.win_value
            + f64::from(state.ties) * self.tie_value
            + f64::from(state.losses) * self.loss_value;
        state
    }
}

impl RankSystem for WinsSystem {
    type State = WinsState;

    const NAME: &'static str = "wins";

    fn initialize_rank_state(&self) -> WinsState {
        WinsState::default()
    }

    fn update_ranks(
        &self,
        states: &[WinsState],
        relative_ranks: &[u32],
    ) -> Result<Vec<WinsState>, TournamentError> {
        check_lengths(states.len(), relative_ranks.len())?;
        if states.len() != 2 {
            return Err(TournamentError::Rank(format!(
                "the wins rank system only ranks 2 agent matches, got {}",
                states.len()
            )));
        }

        let mut next = states.to_vec();
        let (a, b) = (relative_ranks[0], relative_ranks[1]);
        match a.cmp(&b) {
            Ordering::Equal => {
                next[0].ties += 1;
                next[1].ties += 1;
            }
            Ordering::Less => {
                next[0].wins += 1;
                next[1].losses += 1;
            }
            Ordering::Greater => {
                next[0].losses += 1;
                next[1].wins += 1;
            }
        }
        Ok(next.into_iter().map(|s| self.with_points(s)).collect())
    }

    fn rank_comparator(&self, a: &WinsState, b: &WinsState) -> Ordering {
        let by_points = a.points.total_cmp(&b.points);
        let by_points = if self.descending {
            by_points.reverse()
        } else {
            by_points
        };
        by_points
            .then_with(|| b.wins.cmp(&a.wins))
            .then_with(|| a.losses.cmp(&b.losses))
    }

    fn score(&self, state: &WinsState) -> f64 {
        state.points
    }

    fn max_agents_per_match(&self) -> Option<usize> {
        Some(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_counts_for_both() {
        let wins = WinsSystem::default();
        let start = [wins.initialize_rank_state(); 2];
        let next = wins.update_ranks(&start, &[1, 1]).unwrap();
        for state in &next {
            assert_eq!(state.ties, 1);
            assert_eq!(state.wins, 0);
            assert_eq!(state.losses, 0);
            assert_eq!(state.points, 1.0);
        }
    }

    #[test]
    fn better_rank_wins() {
        let wins = WinsSystem::default();
        let start = [wins.initialize_rank_state(); 2];
        let next = wins.update_ranks(&start, &[2, 1]).unwrap();
        assert_eq!((next[0].wins, next[0].losses), (0, 1));
        assert_eq!((next[1].wins, next[1].losses), (1, 0));
        assert_eq!(next[1].points, 3.0);
        assert_eq!(wins.rank_comparator(&next[1], &next[0]), Ordering::Less);
    }

    #[test]
    fn only_two_agents() {
        let wins = WinsSystem::default();
        let start = [wins.initialize_rank_state(); 3];
        assert!(matches!(
            wins.update_ranks(&start, &[1, 2, 3]),
            Err(TournamentError::Rank(_))
        ));
        assert!(wins.update_ranks(&start[..2], &[1]).is_err());
    }

    #[test]
    fn ascending_order_prefers_fewer_points() {
        let wins = WinsSystem {
            descending: false,
            ..WinsSystem::default()
        };
        let low = WinsState {
            points: 1.0,
            ..Default::default()
        };
        let high = WinsState {
            points: 4.0,
            ..Default::default()
        };
        assert_eq!(wins.rank_comparator(&low, &high), Ordering::Less);
    }
}
