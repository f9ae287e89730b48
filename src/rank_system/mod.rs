//! Rank systems: pure functions from match outcomes to per-player rank states.
//!
//! A rank system never performs I/O; the tournament stores rank states and hands them back in
//! on the next update.
//!
//! Outcomes are given as *relative ranks*, one per participant in seat order: `1` is the best
//! finish, equal values are ties.

use std::{cmp::Ordering, fmt::Debug};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::TournamentError;

pub mod elo;
pub mod trueskill;
pub mod wins;

pub use elo::{EloState, EloSystem};
pub use trueskill::{TrueSkillState, TrueSkillSystem};
pub use wins::{WinsState, WinsSystem};

/// Common contract of Wins, ELO and TrueSkill.
pub trait RankSystem: Send + Sync + 'static {
    /// Per-player belief or score.
    type State: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Short name used in errors and logs.
    const NAME: &'static str;

    /// State of a player that never played.
    fn initialize_rank_state(&self) -> Self::State;

    /// New states for the participants of one match.
    ///
    /// `states` and `relative_ranks` are in seat order and have the same length.
    fn update_ranks(
        &self,
        states: &[Self::State],
        relative_ranks: &[u32],
    ) -> Result<Vec<Self::State>, TournamentError>;

    /// `Less` when `a` ranks above `b`.
    fn rank_comparator(&self, a: &Self::State, b: &Self::State) -> Ordering;

    /// Displayed score.
    fn score(&self, state: &Self::State) -> f64;

    /// State after the player's agent was replaced. Defaults to a fresh state.
    fn on_player_update(&self, _state: &Self::State) -> Self::State {
        self.initialize_rank_state()
    }

    /// Largest match this system can rank, if bounded.
    fn max_agents_per_match(&self) -> Option<usize> {
        None
    }
}

pub(crate) fn check_lengths(states: usize, ranks: usize) -> Result<(), TournamentError> {
    if states != ranks {
        return Err(TournamentError::Rank(format!(
            "{states} rank states but {ranks} relative ranks"
        )));
    }
    Ok(())
}
