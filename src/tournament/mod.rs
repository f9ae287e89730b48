//! Tournaments: players, a match queue, a bounded runner and a rank system.
//!
//! [`Tournament`] is the shared core. Formats plug into it through [`TournamentStrategy`]:
//!
//! - [`RoundRobin`]: every pair plays `times` matches, then the tournament finishes.
//! - [`Elimination`]: single bracket knockout.
//! - [`Ladder`]: continuous matchmaking around each player's rank, never finishes by itself.
//!
//! Every completed match flows through the configured [`ResultHandler`] into a [`MatchOutcome`],
//! which the [`RankSystem`](crate::rank_system::RankSystem) folds into the players' rank states.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::agent::AgentId;
use crate::configuration::Configuration;
use crate::engine::EngineOptions;
use crate::error::TournamentError;
use crate::observer::Observers;
use crate::persistence::Persistence;
use crate::rank_system::RankSystem;
use crate::resolver::{CommandResolver, ExtensionResolver};
use crate::storage::ObjectStorage;

mod runner;
pub mod elimination;
pub mod ladder;
pub mod matchmaking;
pub mod round_robin;
mod strategy;

pub use runner::Tournament;
pub use elimination::{Elimination, EliminationOptions, TieBreak};
pub use ladder::{Ladder, LadderOptions, LadderSyncedConfig};
pub use matchmaking::{Matchmaker, RandomMatchmaker, RankRangeMatchmaker};
pub use round_robin::RoundRobin;
pub use strategy::{RoundContext, TournamentStrategy};

/// Uniform key of a player inside one tournament.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerKey(String);

impl PlayerKey {
    /// Wraps a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PlayerKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Who a player is outside the tournament.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerIdentity {
    /// Backed by an external user id; statistics are persisted when a backend is attached.
    Identified {
        /// External id.
        id: String,
    },
    /// Only known to this tournament.
    Anonymous {
        /// Id local to the tournament.
        local_id: u64,
    },
}

impl PlayerIdentity {
    /// The tournament key derived from the identity.
    pub fn key(&self) -> PlayerKey {
        match self {
            PlayerIdentity::Identified { id } => PlayerKey::new(id.clone()),
            PlayerIdentity::Anonymous { local_id } => PlayerKey::new(format!("anonymous-{local_id}")),
        }
    }

    /// External id, if any.
    pub fn external_id(&self) -> Option<&str> {
        match self {
            PlayerIdentity::Identified { id } => Some(id),
            PlayerIdentity::Anonymous { .. } => None,
        }
    }
}

/// Where a player's agent comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentSource {
    /// A file on this machine.
    Local(PathBuf),
    /// An object in the attached [`ObjectStorage`], fetched when the player registers.
    Stored {
        /// Storage key.
        key: String,
    },
}

/// A player to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    /// External id; anonymous when `None`.
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Agent source.
    pub source: AgentSource,
}

impl PlayerEntry {
    /// Anonymous player with a local agent, named after the file stem.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            id: None,
            name,
            source: AgentSource::Local(path),
        }
    }

    /// Anonymous player with an agent kept in object storage.
    pub fn stored(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            source: AgentSource::Stored { key: key.into() },
        }
    }

    /// Gives the player an external identity.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Overrides the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A registered competitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Tournament key.
    pub key: PlayerKey,
    /// External or local identity.
    pub identity: PlayerIdentity,
    /// Display name.
    pub name: String,
    /// Where the agent came from.
    pub source: AgentSource,
    /// The file matches are started from.
    pub local_path: PathBuf,
    /// Incremented each time the agent is replaced.
    pub version: u32,
    /// Disabled players are never scheduled.
    pub disabled: bool,
}

/// Aggregate results of one player in one tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStat<S> {
    /// The player.
    pub player: Player,
    /// Completed matches.
    pub matches_played: u64,
    /// Matches won.
    pub wins: u64,
    /// Matches tied.
    pub ties: u64,
    /// Matches lost.
    pub losses: u64,
    /// Rank system state.
    pub rank_state: S,
}

impl<S> PlayerStat<S> {
    pub(crate) fn new(player: Player, rank_state: S) -> Self {
        Self {
            player,
            matches_played: 0,
            wins: 0,
            ties: 0,
            losses: 0,
            rank_state,
        }
    }

    /// Tournament key of the player.
    pub fn key(&self) -> &PlayerKey {
        &self.player.key
    }
}

/// A match waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuedMatch {
    /// Participants in seat order.
    pub players: Vec<PlayerKey>,
    /// Strategy specific tag, e.g. the bracket slots of an elimination pairing.
    pub label: Option<String>,
}

impl QueuedMatch {
    /// Unlabelled match.
    pub fn new(players: Vec<PlayerKey>) -> Self {
        Self {
            players,
            label: None,
        }
    }

    /// Tags the match.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// True when `key` plays in this match.
    pub fn involves(&self, key: &PlayerKey) -> bool {
        self.players.contains(key)
    }
}

impl fmt::Display for QueuedMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let players = self
            .players
            .iter()
            .map(PlayerKey::as_str)
            .collect::<Vec<_>>()
            .join(" vs ");
        match &self.label {
            Some(label) => write!(f, "[{label}] {players}"),
            None => f.write_str(&players),
        }
    }
}

/// Relative ranks of the agents of one match. `1` is the best finish, equal ranks tie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// `(agent id, relative rank)` pairs.
    pub ranks: Vec<(AgentId, u32)>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOutcome {
    Ranks {
        ranks: Vec<u32>,
    },
    Wins {
        #[serde(default)]
        winners: Vec<AgentId>,
        #[serde(default)]
        ties: Vec<AgentId>,
        #[serde(default)]
        losers: Vec<AgentId>,
    },
}

impl MatchOutcome {
    /// Ranks given in seat order.
    pub fn from_ranks(ranks: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ranks: ranks.into_iter().enumerate().collect(),
        }
    }

    /// Winners rank first, tied agents next, losers last.
    pub fn from_wins(winners: &[AgentId], ties: &[AgentId], losers: &[AgentId]) -> Self {
        let tie_rank = if winners.is_empty() { 1 } else { 2 };
        let loser_rank = tie_rank + u32::from(!ties.is_empty());
        let ranks = winners
            .iter()
            .map(|&id| (id, 1))
            .chain(ties.iter().map(|&id| (id, tie_rank)))
            .chain(losers.iter().map(|&id| (id, loser_rank)))
            .collect();
        Self { ranks }
    }

    /// Reads `{"ranks": [..]}` (seat order) or `{"winners": [..], "ties": [..], "losers": [..]}`
    /// (agent ids). This is the default result handler.
    pub fn from_value(results: &Value) -> anyhow::Result<Self> {
        let raw: RawOutcome = serde_json::from_value(results.clone())
            .context("results hold neither 'ranks' nor 'winners'/'ties'/'losers'")?;
        Ok(match raw {
            RawOutcome::Ranks { ranks } => Self::from_ranks(ranks),
            RawOutcome::Wins {
                winners,
                ties,
                losers,
            } => Self::from_wins(&winners, &ties, &losers),
        })
    }

    /// Ranks in seat order for a match of `agents` agents. Every agent must be ranked once.
    pub fn seat_ranks(&self, agents: usize) -> anyhow::Result<Vec<u32>> {
        let mut ranks = vec![None; agents];
        for &(agent, rank) in &self.ranks {
            let Some(slot) = ranks.get_mut(agent) else {
                bail!("outcome ranks unknown agent {agent}");
            };
            if slot.replace(rank).is_some() {
                bail!("outcome ranks agent {agent} twice");
            }
        }
        ranks
            .into_iter()
            .enumerate()
            .map(|(agent, rank)| rank.with_context(|| format!("outcome does not rank agent {agent}")))
            .collect()
    }
}

/// Maps raw game results to a [`MatchOutcome`].
pub type ResultHandler = Arc<dyn Fn(&Value) -> anyhow::Result<MatchOutcome> + Send + Sync>;

/// A completed and ranked tournament match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Match id.
    pub match_id: u64,
    /// Label of the queued match.
    pub label: Option<String>,
    /// Participants in seat order.
    pub players: Vec<PlayerKey>,
    /// Relative ranks in seat order.
    pub ranks: Vec<u32>,
    /// Raw game results.
    pub results: Value,
}

impl MatchRecord {
    /// Relative rank of `key` in this match.
    pub fn rank_of(&self, key: &PlayerKey) -> Option<u32> {
        self.players
            .iter()
            .position(|p| p == key)
            .and_then(|seat| self.ranks.get(seat).copied())
    }
}

/// Lifecycle of a tournament.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TournamentStatus {
    /// Built, not started.
    Initialized,
    /// Scheduling matches.
    Running,
    /// No new matches are started; live ones continue.
    Stopped,
    /// Every match ran, a limit was reached, or the tournament was destroyed.
    Finished,
    /// The runner could not go on.
    Crashed,
}

/// One line of the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking<S> {
    /// 1 for the best player. Elimination rankings share positions between players knocked
    /// out in the same round.
    pub position: u32,
    /// Displayed score.
    pub score: f64,
    /// Statistics of the player.
    pub stat: PlayerStat<S>,
}

/// Configuration of a tournament.
pub struct TournamentConfig<R: RankSystem> {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) rank_system: R,
    pub(crate) agents_per_match: Vec<usize>,
    pub(crate) max_concurrent: usize,
    pub(crate) max_total: Option<u64>,
    pub(crate) end_date: Option<SystemTime>,
    pub(crate) result_handler: ResultHandler,
    pub(crate) engine_options: EngineOptions,
    pub(crate) configuration: Configuration,
    pub(crate) resolver: Arc<dyn CommandResolver>,
    pub(crate) persistence: Option<Arc<dyn Persistence>>,
    pub(crate) storage: Option<Arc<dyn ObjectStorage>>,
    pub(crate) observers: Observers,
    pub(crate) past_results: Option<usize>,
    pub(crate) seed: Option<u64>,
    pub(crate) governor_id: String,
}

impl<R: RankSystem> TournamentConfig<R> {
    /// Two agents per match, one match at a time, results read with
    /// [`MatchOutcome::from_value`].
    pub fn new(id: impl Into<String>, rank_system: R) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            governor_id: format!("{id}-{}", std::process::id()),
            id,
            rank_system,
            agents_per_match: vec![2],
            max_concurrent: 1,
            max_total: None,
            end_date: None,
            result_handler: Arc::new(MatchOutcome::from_value),
            engine_options: EngineOptions::default(),
            configuration: Configuration::default(),
            resolver: Arc::new(ExtensionResolver),
            persistence: None,
            storage: None,
            observers: Observers::default(),
            past_results: None,
            seed: None,
        }
    }

    /// Display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Allowed match sizes. Matchmaking picks one at random per match.
    #[must_use]
    pub fn with_agents_per_match(mut self, sizes: Vec<usize>) -> Self {
        self.agents_per_match = sizes;
        self
    }

    /// Maximum number of matches running at once.
    #[must_use]
    pub fn with_max_concurrent_matches(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// One match per physical core, minus one left for the runner.
    #[must_use]
    pub fn with_auto_concurrency(mut self) -> Self {
        self.max_concurrent = num_cpus::get_physical().saturating_sub(1).max(1);
        self
    }

    /// Stops scheduling once this many matches completed.
    #[must_use]
    pub fn with_max_total_matches(mut self, max: u64) -> Self {
        self.max_total = Some(max);
        self
    }

    /// Stops scheduling after this date.
    #[must_use]
    pub fn with_end_date(mut self, end: SystemTime) -> Self {
        self.end_date = Some(end);
        self
    }

    /// Maps game results to an outcome.
    #[must_use]
    pub fn with_result_handler(mut self, handler: ResultHandler) -> Self {
        self.result_handler = handler;
        self
    }

    /// Engine options for every match.
    #[must_use]
    pub fn with_engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    /// Crate-wide configuration, passed on to every match.
    #[must_use]
    pub fn with_configuration(mut self, config: Configuration) -> Self {
        self.configuration = config;
        self
    }

    /// Source to command resolution for every match.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn CommandResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Persists users, matches and ranks.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Fetches [`AgentSource::Stored`] agents.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Lifecycle observers, also attached to every match.
    #[must_use]
    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Keeps the last `count` match records.
    #[must_use]
    pub fn with_past_results(mut self, count: usize) -> Self {
        self.past_results = Some(count);
        self
    }

    /// Seeds every random choice of the tournament.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Id matches are stored under when several instances share a backend.
    #[must_use]
    pub fn with_governor_id(mut self, id: impl Into<String>) -> Self {
        self.governor_id = id.into();
        self
    }

    /// Tournament id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The rank system.
    pub fn rank_system(&self) -> &R {
        &self.rank_system
    }

    /// Allowed match sizes.
    pub fn agents_per_match(&self) -> &[usize] {
        &self.agents_per_match
    }

    pub(crate) fn validate(&self) -> Result<(), TournamentError> {
        if self.agents_per_match.is_empty() || self.agents_per_match.contains(&0) {
            return Err(TournamentError::InvalidConfig(format!(
                "agents per match must be non-empty and positive, got {:?}",
                self.agents_per_match
            )));
        }
        if self.max_concurrent == 0 {
            return Err(TournamentError::InvalidConfig(
                "at least one concurrent match is required".into(),
            ));
        }
        if let Some(max) = self.rank_system.max_agents_per_match() {
            if self.agents_per_match.iter().any(|&n| n > max) {
                return Err(TournamentError::UnsupportedRankSystem {
                    rank_system: R::NAME,
                    format: format!("{:?} agents per match", self.agents_per_match),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn cache_dir(&self) -> PathBuf {
        std::env::temp_dir().join(format!("agent-arena-{}", sanitize(&self.id)))
    }
}

impl<R: RankSystem + fmt::Debug> fmt::Debug for TournamentConfig<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TournamentConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rank_system", &self.rank_system)
            .field("agents_per_match", &self.agents_per_match)
            .field("max_concurrent", &self.max_concurrent)
            .field("max_total", &self.max_total)
            .field("end_date", &self.end_date)
            .field("engine_options", &self.engine_options)
            .field("persistence", &self.persistence.is_some())
            .field("storage", &self.storage.is_some())
            .field("observers", &self.observers)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Flat file name for a storage key, keeping its extension.
///
/// Prefixed with a digest of the raw key: `a/b.py` and `a_b.py` sanitize alike.
pub(crate) fn cached_path(dir: &Path, key: &str) -> PathBuf {
    let digest = hex::encode(&Sha256::digest(key.as_bytes())[..6]);
    let name = sanitize(key);
    let name = name.trim_start_matches('.');
    let name = if name.is_empty() { "agent" } else { name };
    dir.join(format!("{digest}_{name}"))
}
