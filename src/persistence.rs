//! Persistence collaborator used by tournaments when a backend is attached.
//!
//! Tournaments call it opportunistically: a failing backend is logged, never fatal, and without
//! a backend everything stays in memory. Writes are last-write-wins.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tournament::{PlayerKey, TournamentStatus};

/// A stored competitor identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// External id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Disabled users are removed from scheduling.
    pub disabled: bool,
    /// Per-tournament statistics, keyed by tournament id.
    pub statistics: HashMap<String, Value>,
}

/// Partial update of a [`UserRecord`]. Missing users are created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPatch {
    /// New display name.
    pub name: Option<String>,
    /// New disabled flag.
    pub disabled: Option<bool>,
    /// Statistics entries to replace, keyed by tournament id.
    pub statistics: HashMap<String, Value>,
}

/// Statistics of one player in one tournament, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStat {
    /// Display name.
    pub name: String,
    /// Displayed score.
    pub score: f64,
    /// Completed matches.
    pub matches_played: u64,
    /// Wins.
    pub wins: u64,
    /// Ties.
    pub ties: u64,
    /// Losses.
    pub losses: u64,
    /// Serialized rank state.
    pub rank_state: Value,
}

/// One row of a stored leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankRecord {
    /// External player id.
    pub player_id: String,
    /// The stored statistics.
    pub stat: StoredStat,
}

/// A completed tournament match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatch {
    /// Match id.
    pub match_id: u64,
    /// Tournament the match belongs to.
    pub tournament_id: String,
    /// Participants in seat order.
    pub players: Vec<PlayerKey>,
    /// Relative ranks, in seat order.
    pub ranks: Vec<u32>,
    /// Raw game results.
    pub results: Value,
}

/// Stored tournament configuration, used to keep several instances in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfigs {
    /// Serialized configuration.
    pub configs: Value,
    /// Status of the instance that stored it.
    pub status: TournamentStatus,
    /// When it was stored.
    pub updated_at: SystemTime,
}

/// External store for users, matches, ranks and tournament configurations.
pub trait Persistence: Send + Sync {
    /// Looks a user up.
    fn get_user(&self, id: &str) -> anyhow::Result<Option<UserRecord>>;

    /// Applies a patch, creating the user if needed.
    fn update_user(&self, id: &str, patch: UserPatch) -> anyhow::Result<()>;

    /// Leaderboard of a tournament, best first.
    fn get_ranks(&self, tournament_id: &str, offset: usize, limit: usize) -> anyhow::Result<Vec<RankRecord>>;

    /// Records a completed match on behalf of `governor_id`.
    fn store_match(&self, record: &StoredMatch, governor_id: &str) -> anyhow::Result<()>;

    /// Last stored configuration of a tournament.
    fn get_tournament_configs(&self, tournament_id: &str) -> anyhow::Result<Option<StoredConfigs>>;

    /// Replaces the stored configuration of a tournament.
    fn store_tournament_configs(&self, tournament_id: &str, configs: StoredConfigs) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    matches: Vec<(String, StoredMatch)>,
    configs: HashMap<String, StoredConfigs>,
}

/// A [`Persistence`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    tables: Mutex<Tables>,
}

impl InMemoryPersistence {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every stored match with its governor id.
    pub fn matches(&self) -> Vec<(String, StoredMatch)> {
        self.lock().matches.clone()
    }
}

impl Persistence for InMemoryPersistence {
    fn get_user(&self, id: &str) -> anyhow::Result<Option<UserRecord>> {
        Ok(self.lock().users.get(id).cloned())
    }

    fn update_user(&self, id: &str, patch: UserPatch) -> anyhow::Result<()> {
        let mut tables = self.lock();
        let user = tables
            .users
            .entry(id.to_owned())
            .or_insert_with(|| UserRecord {
                id: id.to_owned(),
                name: id.to_owned(),
                disabled: false,
                statistics: HashMap::new(),
            });
        if let Some(name) = patch.name {
            user.name = name;
        }
        if let Some(disabled) = patch.disabled {
            user.disabled = disabled;
        }
        user.statistics.extend(patch.statistics);
        Ok(())
    }

    fn get_ranks(&self, tournament_id: &str, offset: usize, limit: usize) -> anyhow::Result<Vec<RankRecord>> {
        let tables = self.lock();
        let mut ranks = vec![];
        for user in tables.users.values() {
            let Some(stat) = user.statistics.get(tournament_id) else {
                continue;
            };
            let stat: StoredStat = serde_json::from_value(stat.clone())?;
            ranks.push(RankRecord {
                player_id: user.id.clone(),
                stat,
            });
        }
        ranks.sort_by(|a, b| {
            b.stat
                .score
                .total_cmp(&a.stat.score)
                .then_with(|| a.player_id.cmp(&b.player_id))
        });
        Ok(ranks.into_iter().skip(offset).take(limit).collect())
    }

    fn store_match(&self, record: &StoredMatch, governor_id: &str) -> anyhow::Result<()> {
        self.lock()
            .matches
            .push((governor_id.to_owned(), record.clone()));
        Ok(())
    }

    fn get_tournament_configs(&self, tournament_id: &str) -> anyhow::Result<Option<StoredConfigs>> {
        Ok(self.lock().configs.get(tournament_id).cloned())
    }

    fn store_tournament_configs(&self, tournament_id: &str, configs: StoredConfigs) -> anyhow::Result<()> {
        self.lock().configs.insert(tournament_id.to_owned(), configs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stat(name: &str, score: f64) -> Value {
        serde_json::to_value(StoredStat {
            name: name.into(),
            score,
            matches_played: 1,
            wins: 0,
            ties: 0,
            losses: 0,
            rank_state: json!({ "score": score }),
        })
        .unwrap()
    }

    #[test]
    fn patch_creates_then_merges() {
        let store = InMemoryPersistence::new();
        assert!(store.get_user("u1").unwrap().is_none());

        store
            .update_user(
                "u1",
                UserPatch {
                    name: Some("alice".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_user(
                "u1",
                UserPatch {
                    disabled: Some(true),
                    statistics: HashMap::from([("t".to_owned(), stat("alice", 3.0))]),
                    ..Default::default()
                },
            )
            .unwrap();

        let user = store.get_user("u1").unwrap().unwrap();
        assert_eq!(user.name, "alice");
        assert!(user.disabled);
        assert!(user.statistics.contains_key("t"));
    }

    #[test]
    fn ranks_are_paged_best_first() {
        let store = InMemoryPersistence::new();
        for (id, score) in [("a", 1.0), ("b", 5.0), ("c", 3.0)] {
            store
                .update_user(
                    id,
                    UserPatch {
                        statistics: HashMap::from([("t".to_owned(), stat(id, score))]),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let ids: Vec<_> = store
            .get_ranks("t", 0, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.player_id)
            .collect();
        assert_eq!(ids, ["b", "c", "a"]);
        assert_eq!(store.get_ranks("t", 1, 1).unwrap()[0].player_id, "c");
        assert!(store.get_ranks("other", 0, 10).unwrap().is_empty());
    }

    #[test]
    fn configs_round_trip() {
        let store = InMemoryPersistence::new();
        let configs = StoredConfigs {
            configs: json!({ "max_concurrent_matches": 2 }),
            status: TournamentStatus::Running,
            updated_at: SystemTime::UNIX_EPOCH,
        };
        store.store_tournament_configs("t", configs.clone()).unwrap();
        assert_eq!(store.get_tournament_configs("t").unwrap(), Some(configs));
    }
}
