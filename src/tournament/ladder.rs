use std::{
    ops::Deref,
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    matchmaking::{Matchmaker, RankRangeMatchmaker},
    PlayerEntry, PlayerIdentity, QueuedMatch, RoundContext, Tournament, TournamentConfig,
    TournamentStatus, TournamentStrategy,
};
use crate::error::TournamentError;
use crate::game_interface::GameFactory;
use crate::persistence::{Persistence, RankRecord, StoredConfigs, StoredStat};
use crate::rank_system::{RankSystem, WinsSystem};

/// Matchmaking and synchronization of a [`Ladder`].
pub struct LadderOptions {
    /// Picks opponents.
    pub matchmaker: Box<dyn Matchmaker>,
    /// How often limits and player flags are synchronized with the persistence backend.
    /// No synchronization when `None`.
    pub sync_interval: Option<Duration>,
}

impl Default for LadderOptions {
    fn default() -> Self {
        Self {
            matchmaker: Box::new(RankRangeMatchmaker::default()),
            sync_interval: None,
        }
    }
}

impl LadderOptions {
    /// Opponent policy.
    #[must_use]
    pub fn with_matchmaker(mut self, matchmaker: impl Matchmaker + 'static) -> Self {
        self.matchmaker = Box::new(matchmaker);
        self
    }

    /// Synchronizes with the persistence backend every `interval`.
    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

/// The part of a ladder's configuration shared through the persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderSyncedConfig {
    /// Maximum number of matches running at once.
    pub max_concurrent_matches: usize,
    /// Total match limit.
    pub max_total_matches: Option<u64>,
    /// End date, in milliseconds since the Unix epoch.
    pub end_date_unix_ms: Option<u64>,
    /// Matchmaking window.
    pub matchmaking_range: Option<usize>,
}

impl LadderSyncedConfig {
    /// Current values of `tournament`.
    pub fn capture<R: RankSystem>(tournament: &Tournament<R>) -> Self {
        Self {
            max_concurrent_matches: tournament.max_concurrent_matches(),
            max_total_matches: tournament.max_total_matches(),
            end_date_unix_ms: tournament.end_date().map(|date| {
                date.duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            }),
            matchmaking_range: tournament.with_strategy(|s| s.matchmaking_range()),
        }
    }

    /// Applies these values to `tournament`.
    pub fn apply<R: RankSystem>(&self, tournament: &Tournament<R>) -> Result<(), TournamentError> {
        tournament.set_max_concurrent_matches(self.max_concurrent_matches)?;
        tournament.set_max_total_matches(self.max_total_matches);
        tournament.set_end_date(
            self.end_date_unix_ms
                .map(|ms| UNIX_EPOCH + Duration::from_millis(ms)),
        );
        if let Some(range) = self.matchmaking_range {
            tournament.with_strategy(|s| s.set_matchmaking_range(range));
        }
        Ok(())
    }
}

/// Open ended ranked play.
///
/// Matches are made continuously among enabled players until a limit is reached or the
/// ladder is destroyed. Players may join, update and leave at any time.
pub struct Ladder<R: RankSystem> {
    tournament: Tournament<R>,
    sync_stop: Option<Sender<()>>,
}

impl<R: RankSystem> Ladder<R> {
    /// Registers `players` and, with a sync interval, starts synchronizing with the
    /// persistence backend.
    pub fn new(
        config: TournamentConfig<R>,
        game: impl GameFactory + 'static,
        players: Vec<PlayerEntry>,
        options: LadderOptions,
    ) -> Result<Self, TournamentError> {
        if R::NAME == WinsSystem::NAME && config.agents_per_match != [2] {
            return Err(TournamentError::UnsupportedRankSystem {
                rank_system: R::NAME,
                format: format!("ladder with {:?} agents per match", config.agents_per_match),
            });
        }
        if options.sync_interval.is_some() && config.persistence.is_none() {
            return Err(TournamentError::InvalidConfig(
                "ladder synchronization needs a persistence backend".into(),
            ));
        }

        let strategy = LadderStrategy {
            matchmaker: options.matchmaker,
        };
        let tournament = Tournament::new(config, game, Box::new(strategy))?;
        for entry in players {
            tournament.register(entry)?;
        }

        let mut ladder = Self {
            tournament,
            sync_stop: None,
        };
        if let Some(interval) = options.sync_interval {
            ladder.start_sync(interval)?;
        }
        Ok(ladder)
    }

    fn start_sync(&mut self, interval: Duration) -> Result<(), TournamentError> {
        let Some(persistence) = self.tournament.config().persistence.clone() else {
            return Ok(());
        };
        let mut last_sync = UNIX_EPOCH;
        if let Err(e) = sync_once(&self.tournament, persistence.as_ref(), &mut last_sync) {
            warn!(tournament = %self.tournament.id(), "initial ladder sync failed: {e:#}");
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let tournament = self.tournament.clone();
        thread::Builder::new()
            .name(format!("{}-sync", self.tournament.id()))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if matches!(
                    tournament.status(),
                    TournamentStatus::Finished | TournamentStatus::Crashed
                ) {
                    debug!(tournament = %tournament.id(), "ladder settled, sync ends");
                    break;
                }
                if let Err(e) = sync_once(&tournament, persistence.as_ref(), &mut last_sync) {
                    warn!(tournament = %tournament.id(), "ladder sync failed: {e:#}");
                }
            })
            .context("could not spawn the ladder sync thread")
            .map_err(TournamentError::Persistence)?;
        self.sync_stop = Some(stop);
        Ok(())
    }

    /// Leaderboard page from the persistence backend, or from memory when there is none.
    pub fn stored_rankings(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RankRecord>, TournamentError> {
        if let Some(persistence) = &self.tournament.config().persistence {
            return persistence
                .get_ranks(self.tournament.id(), offset, limit)
                .map_err(TournamentError::Persistence);
        }
        Ok(self
            .tournament
            .rankings()
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|ranking| RankRecord {
                player_id: ranking.stat.player.key.to_string(),
                stat: StoredStat {
                    name: ranking.stat.player.name.clone(),
                    score: ranking.score,
                    matches_played: ranking.stat.matches_played,
                    wins: ranking.stat.wins,
                    ties: ranking.stat.ties,
                    losses: ranking.stat.losses,
                    rank_state: serde_json::to_value(&ranking.stat.rank_state).unwrap_or(Value::Null),
                },
            })
            .collect())
    }

    /// Current matchmaking window, if the matchmaker has one.
    pub fn matchmaking_range(&self) -> Option<usize> {
        self.tournament.with_strategy(|s| s.matchmaking_range())
    }

    /// Changes the matchmaking window.
    pub fn set_matchmaking_range(&self, range: usize) {
        self.tournament
            .with_strategy(|s| s.set_matchmaking_range(range));
    }
}

impl<R: RankSystem> Drop for Ladder<R> {
    fn drop(&mut self) {
        if let Some(stop) = self.sync_stop.take() {
            // the thread may already be gone
            let _ = stop.send(());
        }
    }
}

impl<R: RankSystem> Deref for Ladder<R> {
    type Target = Tournament<R>;

    fn deref(&self) -> &Self::Target {
        &self.tournament
    }
}

/// Adopts a newer stored configuration, or publishes ours, then mirrors the disabled flag
/// of identified players.
fn sync_once<R: RankSystem>(
    tournament: &Tournament<R>,
    persistence: &dyn Persistence,
    last_sync: &mut SystemTime,
) -> anyhow::Result<()> {
    let id = tournament.id();
    match persistence.get_tournament_configs(id)? {
        Some(stored) if stored.updated_at > *last_sync => {
            let synced: LadderSyncedConfig = serde_json::from_value(stored.configs)
                .context("stored ladder configuration is malformed")?;
            synced.apply(tournament)?;
            *last_sync = stored.updated_at;
            info!(tournament = %id, ?synced, "ladder configuration updated");
        }
        _ => {
            let now = SystemTime::now();
            let configs = serde_json::to_value(LadderSyncedConfig::capture(tournament))?;
            persistence.store_tournament_configs(
                id,
                StoredConfigs {
                    configs,
                    status: tournament.status(),
                    updated_at: now,
                },
            )?;
            *last_sync = now;
        }
    }

    for player in tournament.players() {
        let PlayerIdentity::Identified { id: user_id } = &player.identity else {
            continue;
        };
        if let Some(user) = persistence.get_user(user_id)? {
            if user.disabled != player.disabled {
                info!(player = %player.key, disabled = user.disabled, "player flag synchronized");
                tournament.set_player_disabled(&player.key, user.disabled)?;
            }
        }
    }
    Ok(())
}

struct LadderStrategy {
    matchmaker: Box<dyn Matchmaker>,
}

impl TournamentStrategy for LadderStrategy {
    fn advance_round(&mut self, ctx: RoundContext<'_>) -> Vec<QueuedMatch> {
        self.matchmaker
            .make_matches(&ctx.ranked, ctx.agents_per_match, ctx.wanted, ctx.rng)
    }

    fn is_continuous(&self) -> bool {
        true
    }

    fn matchmaking_range(&self) -> Option<usize> {
        self.matchmaker.range()
    }

    fn set_matchmaking_range(&mut self, range: usize) {
        self.matchmaker.set_range(range);
    }
}
