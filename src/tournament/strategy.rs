use std::collections::HashMap;

use rand::rngs::StdRng;

use super::{MatchRecord, PlayerKey, QueuedMatch};

/// What a strategy sees when asked for more matches.
pub struct RoundContext<'a> {
    /// Records completed since the previous call.
    pub results: Vec<MatchRecord>,
    /// Every registered player, in registration order, disabled ones included.
    pub registered: &'a [PlayerKey],
    /// Enabled players, in registration order.
    pub players: Vec<PlayerKey>,
    /// Enabled players, best first.
    pub ranked: Vec<PlayerKey>,
    /// Allowed match sizes.
    pub agents_per_match: &'a [usize],
    /// How many matches a continuous strategy should produce.
    pub wanted: usize,
    /// The tournament's random generator.
    pub rng: &'a mut StdRng,
}

impl RoundContext<'_> {
    /// True when `key` is registered and enabled.
    pub fn is_enabled(&self, key: &PlayerKey) -> bool {
        self.players.contains(key)
    }
}

/// Decides which matches a tournament plays.
///
/// A round based strategy is asked for the next round once the queue is empty and every match
/// of the current round completed; an empty round finishes the tournament. A continuous strategy
/// is asked whenever the queue runs low and never finishes the tournament by itself.
pub trait TournamentStrategy: Send {
    /// Matches to queue next.
    fn advance_round(&mut self, ctx: RoundContext<'_>) -> Vec<QueuedMatch>;

    /// Continuous strategies refill the queue instead of playing rounds.
    fn is_continuous(&self) -> bool {
        false
    }

    /// Whether players may be added or removed once the tournament exists.
    fn allows_player_changes(&self) -> bool {
        true
    }

    /// Final placement of players, for formats where it is not derived from rank states.
    fn placements(&self) -> Option<HashMap<PlayerKey, u32>> {
        None
    }

    /// Width of the matchmaking window, if the strategy has one.
    fn matchmaking_range(&self) -> Option<usize> {
        None
    }

    /// Changes the matchmaking window. Ignored by strategies without one.
    fn set_matchmaking_range(&mut self, _range: usize) {}
}
