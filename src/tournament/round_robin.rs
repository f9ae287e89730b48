use std::ops::Deref;

use tracing::info;

use super::{
    PlayerEntry, QueuedMatch, Ranking, RoundContext, Tournament, TournamentConfig,
    TournamentStrategy,
};
use crate::error::TournamentError;
use crate::game_interface::GameFactory;
use crate::rank_system::{RankSystem, WinsState, WinsSystem};

/// Every pair of players plays `times` matches, all queued at once.
///
/// Seats alternate between repetitions so both players get each side of an asymmetric game.
pub struct RoundRobin {
    tournament: Tournament<WinsSystem>,
}

impl RoundRobin {
    /// Usual number of matches per pair.
    pub const DEFAULT_TIMES: usize = 2;

    /// Default configuration: wins counted 3/1/0, two agents per match.
    pub fn config(id: impl Into<String>) -> TournamentConfig<WinsSystem> {
        TournamentConfig::new(id, WinsSystem::default())
    }

    /// Registers `players` and prepares the schedule.
    pub fn new(
        config: TournamentConfig<WinsSystem>,
        game: impl GameFactory + 'static,
        players: Vec<PlayerEntry>,
        times: usize,
    ) -> Result<Self, TournamentError> {
        if config.agents_per_match != [2] {
            return Err(TournamentError::UnsupportedRankSystem {
                rank_system: WinsSystem::NAME,
                format: format!(
                    "round robin with {:?} agents per match",
                    config.agents_per_match
                ),
            });
        }
        if times == 0 {
            return Err(TournamentError::InvalidConfig(
                "round robin needs at least one match per pair".into(),
            ));
        }
        let tournament = Tournament::new(config, game, Box::new(RoundRobinSchedule::new(times)))?;
        for entry in players {
            tournament.register(entry)?;
        }
        Ok(Self { tournament })
    }

    /// Starts the tournament, blocks until every match ran and returns the rankings.
    pub fn run(&self) -> Result<Vec<Ranking<WinsState>>, TournamentError> {
        self.tournament.start()?;
        self.tournament.wait();
        Ok(self.tournament.rankings())
    }
}

impl Deref for RoundRobin {
    type Target = Tournament<WinsSystem>;

    fn deref(&self) -> &Self::Target {
        &self.tournament
    }
}

pub(crate) struct RoundRobinSchedule {
    times: usize,
    generated: bool,
}

impl RoundRobinSchedule {
    pub(crate) fn new(times: usize) -> Self {
        Self {
            times,
            generated: false,
        }
    }
}

impl TournamentStrategy for RoundRobinSchedule {
    fn advance_round(&mut self, ctx: RoundContext<'_>) -> Vec<QueuedMatch> {
        if self.generated {
            return vec![];
        }
        self.generated = true;

        let players = &ctx.players;
        let mut pending = vec![];
        for repetition in 0..self.times {
            for i in 0..players.len() {
                for j in (i + 1)..players.len() {
                    let (a, b) = if repetition % 2 == 0 { (i, j) } else { (j, i) };
                    pending.push(QueuedMatch::new(vec![players[a].clone(), players[b].clone()]));
                }
            }
        }
        info!(
            players = players.len(),
            matches = pending.len(),
            "round robin scheduled"
        );
        pending
    }
}
