use std::{
    cmp::Ordering as CmpOrdering,
    collections::{HashMap, VecDeque},
    fs, mem,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    cached_path, AgentSource, MatchRecord, Player, PlayerEntry, PlayerIdentity, PlayerKey,
    PlayerStat, QueuedMatch, Ranking, RoundContext, TournamentConfig, TournamentStatus,
    TournamentStrategy,
};
use crate::agent::AgentSpec;
use crate::error::{MatchError, TournamentError};
use crate::game_interface::GameFactory;
use crate::logger::init_logger;
use crate::match_runner::{Match, MatchHandle};
use crate::observer::LifecycleEvent;
use crate::persistence::{StoredMatch, StoredStat, UserPatch, UserRecord};
use crate::rank_system::RankSystem;

struct LiveMatch {
    handle: MatchHandle,
    players: Vec<PlayerKey>,
    label: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_concurrent: usize,
    max_total: Option<u64>,
    end_date: Option<SystemTime>,
}

struct Shared<S> {
    status: TournamentStatus,
    players: HashMap<PlayerKey, PlayerStat<S>>,
    order: Vec<PlayerKey>,
    queue: VecDeque<QueuedMatch>,
    live: HashMap<u64, LiveMatch>,
    limits: Limits,
    total_matches: u64,
    round_results: Vec<MatchRecord>,
    past_results: VecDeque<MatchRecord>,
    next_anonymous: u64,
}

impl<S> Shared<S> {
    fn limit_reached(&self) -> bool {
        self.limits
            .end_date
            .is_some_and(|end| SystemTime::now() >= end)
            || self
                .limits
                .max_total
                .is_some_and(|max| self.total_matches >= max)
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.status,
            TournamentStatus::Finished | TournamentStatus::Crashed
        ) && self.live.is_empty()
    }

    fn is_enabled(&self, key: &PlayerKey) -> bool {
        self.players.get(key).is_some_and(|s| !s.player.disabled)
    }

    fn is_runnable(&self, queued: &QueuedMatch) -> bool {
        queued.players.iter().all(|key| self.is_enabled(key))
    }

    /// Removes queued matches `key` plays in, returns how many.
    fn purge_queue(&mut self, key: &PlayerKey) -> usize {
        let before = self.queue.len();
        self.queue.retain(|m| !m.involves(key));
        before - self.queue.len()
    }

    fn agent_specs(&self, queued: &QueuedMatch) -> Option<Vec<AgentSpec>> {
        queued
            .players
            .iter()
            .map(|key| {
                let stat = self.players.get(key).filter(|s| !s.player.disabled)?;
                Some(AgentSpec::new(stat.player.local_path.clone()).with_name(stat.player.name.clone()))
            })
            .collect()
    }

    fn enabled_players(&self) -> Vec<PlayerKey> {
        self.order
            .iter()
            .filter(|key| self.is_enabled(key))
            .cloned()
            .collect()
    }
}

struct Recorded {
    record: MatchRecord,
    snapshots: Vec<(String, StoredStat)>,
}

struct Inner<R: RankSystem> {
    config: TournamentConfig<R>,
    game: Arc<dyn GameFactory>,
    shared: Mutex<Shared<R::State>>,
    idle: Condvar,
    strategy: Mutex<Box<dyn TournamentStrategy>>,
    pass_guard: Mutex<()>,
    pass_requested: AtomicBool,
    rng: Mutex<StdRng>,
}

/// The tournament core, shared by every format.
///
/// Cheap to clone; clones drive the same tournament. Matches run on their own threads, at most
/// `max_concurrent_matches` at a time. A runner pass is triggered by [`start`](Self::start),
/// [`resume`](Self::resume), player registration and every match completion.
pub struct Tournament<R: RankSystem> {
    inner: Arc<Inner<R>>,
}

impl<R: RankSystem> Clone for Tournament<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RankSystem> Tournament<R> {
    /// Builds a tournament playing the matches `strategy` asks for.
    ///
    /// Fails when the configuration is inconsistent, e.g. a rank system that cannot rank the
    /// configured match sizes.
    pub fn new(
        config: TournamentConfig<R>,
        game: impl GameFactory + 'static,
        strategy: Box<dyn TournamentStrategy>,
    ) -> Result<Self, TournamentError> {
        config.validate()?;
        if config.configuration.log {
            if let Err(e) = init_logger(&config.configuration) {
                eprintln!("could not initialize logging: {e:#}");
            }
        }
        trace!(id = %config.id, agents_per_match = ?config.agents_per_match, "new tournament");

        let rng = config
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        let limits = Limits {
            max_concurrent: config.max_concurrent,
            max_total: config.max_total,
            end_date: config.end_date,
        };
        let shared = Shared {
            status: TournamentStatus::Initialized,
            players: HashMap::new(),
            order: vec![],
            queue: VecDeque::new(),
            live: HashMap::new(),
            limits,
            total_matches: 0,
            round_results: vec![],
            past_results: VecDeque::new(),
            next_anonymous: 0,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                game: Arc::new(game),
                shared: Mutex::new(shared),
                idle: Condvar::new(),
                strategy: Mutex::new(strategy),
                pass_guard: Mutex::new(()),
                pass_requested: AtomicBool::new(false),
                rng: Mutex::new(rng),
            }),
        })
    }

    /// Tournament id.
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The configuration the tournament was built with. Limits changed at runtime are not
    /// reflected here.
    pub fn config(&self) -> &TournamentConfig<R> {
        &self.inner.config
    }

    /// Current status.
    pub fn status(&self) -> TournamentStatus {
        self.inner.lock_shared().status
    }

    /// Registers a player.
    ///
    /// Local sources must exist; stored sources are downloaded right away. An identified player
    /// picks up its persisted statistics and disabled flag when a backend is attached.
    #[instrument(skip_all, fields(tournament = %self.inner.config.id, player = %entry.name))]
    pub fn add_player(&self, entry: PlayerEntry) -> Result<PlayerKey, TournamentError> {
        self.ensure_player_changes("add players")?;
        let key = self.register(entry)?;
        self.inner.pass();
        Ok(key)
    }

    /// Unregisters a player and drops the queued matches it plays in. Live matches finish but
    /// are not ranked.
    #[instrument(skip_all, fields(tournament = %self.inner.config.id, player = %key))]
    pub fn remove_player(&self, key: &PlayerKey) -> Result<(), TournamentError> {
        self.ensure_player_changes("remove players")?;
        let mut shared = self.inner.lock_shared();
        if shared.players.remove(key).is_none() {
            return Err(TournamentError::PlayerNotFound(key.clone()));
        }
        shared.order.retain(|k| k != key);
        let purged = shared.purge_queue(key);
        info!(purged, "player removed");
        Ok(())
    }

    /// Replaces a player's agent, or only bumps its version when `source` is `None`.
    ///
    /// Counters are reset and the rank state goes through
    /// [`RankSystem::on_player_update`].
    #[instrument(skip_all, fields(tournament = %self.inner.config.id, player = %key))]
    pub fn update_player(
        &self,
        key: &PlayerKey,
        source: Option<AgentSource>,
    ) -> Result<(), TournamentError> {
        let fetched = match &source {
            Some(source) => Some(self.inner.fetch_source(source, key.as_str())?),
            None => None,
        };
        let mut shared = self.inner.lock_shared();
        let stat = shared
            .players
            .get_mut(key)
            .ok_or_else(|| TournamentError::PlayerNotFound(key.clone()))?;
        if let (Some(source), Some(path)) = (source, fetched) {
            stat.player.source = source;
            stat.player.local_path = path;
        }
        stat.player.version += 1;
        stat.matches_played = 0;
        stat.wins = 0;
        stat.ties = 0;
        stat.losses = 0;
        stat.rank_state = self.inner.config.rank_system.on_player_update(&stat.rank_state);
        info!(version = stat.player.version, "player updated");
        Ok(())
    }

    /// Enables or disables a player. Disabling drops the queued matches it plays in.
    pub fn set_player_disabled(&self, key: &PlayerKey, disabled: bool) -> Result<(), TournamentError> {
        let mut shared = self.inner.lock_shared();
        let stat = shared
            .players
            .get_mut(key)
            .ok_or_else(|| TournamentError::PlayerNotFound(key.clone()))?;
        if stat.player.disabled == disabled {
            return Ok(());
        }
        stat.player.disabled = disabled;
        if disabled {
            let purged = shared.purge_queue(key);
            info!(player = %key, purged, "player disabled");
        } else {
            info!(player = %key, "player enabled");
            drop(shared);
            self.inner.pass();
        }
        Ok(())
    }

    /// Statistics of one player.
    pub fn player_stat(&self, key: &PlayerKey) -> Option<PlayerStat<R::State>> {
        self.inner.lock_shared().players.get(key).cloned()
    }

    /// Every registered player, in registration order.
    pub fn players(&self) -> Vec<Player> {
        let shared = self.inner.lock_shared();
        shared
            .order
            .iter()
            .filter_map(|key| shared.players.get(key))
            .map(|stat| stat.player.clone())
            .collect()
    }

    /// The leaderboard, best first. Equal rank states share a position and keep registration
    /// order.
    pub fn rankings(&self) -> Vec<Ranking<R::State>> {
        let placements = self.inner.lock_strategy().placements();
        let rank_system = &self.inner.config.rank_system;
        let shared = self.inner.lock_shared();

        let place = |stat: &PlayerStat<R::State>| {
            placements
                .as_ref()
                .and_then(|p| p.get(stat.key()).copied())
                .unwrap_or(1)
        };
        let mut stats: Vec<&PlayerStat<R::State>> = shared
            .order
            .iter()
            .filter_map(|key| shared.players.get(key))
            .collect();
        stats.sort_by(|a, b| {
            let by_place = if placements.is_some() {
                place(a).cmp(&place(b))
            } else {
                CmpOrdering::Equal
            };
            by_place.then_with(|| rank_system.rank_comparator(&a.rank_state, &b.rank_state))
        });

        let mut rankings: Vec<Ranking<R::State>> = Vec::with_capacity(stats.len());
        for (i, stat) in stats.into_iter().enumerate() {
            let position = if placements.is_some() {
                place(stat)
            } else {
                match rankings.last() {
                    Some(prev)
                        if rank_system.rank_comparator(&prev.stat.rank_state, &stat.rank_state)
                            == CmpOrdering::Equal =>
                    {
                        prev.position
                    }
                    _ => i as u32 + 1,
                }
            };
            rankings.push(Ranking {
                position,
                score: rank_system.score(&stat.rank_state),
                stat: stat.clone(),
            });
        }
        rankings
    }

    /// Handles of the matches running right now.
    pub fn live_matches(&self) -> Vec<MatchHandle> {
        let shared = self.inner.lock_shared();
        let mut live: Vec<_> = shared.live.values().map(|m| m.handle.clone()).collect();
        live.sort_by_key(MatchHandle::id);
        live
    }

    /// Matches waiting to start, in queue order.
    pub fn queued_matches(&self) -> Vec<QueuedMatch> {
        self.inner.lock_shared().queue.iter().cloned().collect()
    }

    /// Number of matches waiting to start.
    pub fn queue_len(&self) -> usize {
        self.inner.lock_shared().queue.len()
    }

    /// Matches completed and ranked so far.
    pub fn total_matches(&self) -> u64 {
        self.inner.lock_shared().total_matches
    }

    /// The most recent match records, oldest first. Empty unless past results are kept.
    pub fn past_results(&self) -> Vec<MatchRecord> {
        self.inner.lock_shared().past_results.iter().cloned().collect()
    }

    /// Current concurrency cap.
    pub fn max_concurrent_matches(&self) -> usize {
        self.inner.lock_shared().limits.max_concurrent
    }

    /// Changes the concurrency cap. Live matches above the new cap are not interrupted.
    pub fn set_max_concurrent_matches(&self, max: usize) -> Result<(), TournamentError> {
        if max == 0 {
            return Err(TournamentError::InvalidConfig(
                "at least one concurrent match is required".into(),
            ));
        }
        self.inner.lock_shared().limits.max_concurrent = max;
        self.inner.pass();
        Ok(())
    }

    /// Current cap on completed matches.
    pub fn max_total_matches(&self) -> Option<u64> {
        self.inner.lock_shared().limits.max_total
    }

    /// Changes the cap on completed matches.
    pub fn set_max_total_matches(&self, max: Option<u64>) {
        self.inner.lock_shared().limits.max_total = max;
        self.inner.pass();
    }

    /// Current end date.
    pub fn end_date(&self) -> Option<SystemTime> {
        self.inner.lock_shared().limits.end_date
    }

    /// Changes the end date.
    pub fn set_end_date(&self, end: Option<SystemTime>) {
        self.inner.lock_shared().limits.end_date = end;
        self.inner.pass();
    }

    /// Starts scheduling. Only legal once, from `Initialized`.
    #[instrument(skip_all, fields(tournament = %self.inner.config.id))]
    pub fn start(&self) -> Result<(), TournamentError> {
        self.inner
            .transition("start", TournamentStatus::Initialized, TournamentStatus::Running)?;
        self.inner.pass();
        Ok(())
    }

    /// Stops starting new matches. Live matches run to completion.
    pub fn stop(&self) -> Result<(), TournamentError> {
        self.inner
            .transition("stop", TournamentStatus::Running, TournamentStatus::Stopped)
    }

    /// Starts scheduling again after [`stop`](Self::stop).
    pub fn resume(&self) -> Result<(), TournamentError> {
        self.inner
            .transition("resume", TournamentStatus::Stopped, TournamentStatus::Running)?;
        self.inner.pass();
        Ok(())
    }

    /// Finishes the tournament now: clears the queue and destroys every live match. Idempotent.
    #[instrument(skip_all, fields(tournament = %self.inner.config.id))]
    pub fn destroy(&self) {
        let mut shared = self.inner.lock_shared();
        if shared.is_settled() {
            return;
        }
        shared.queue.clear();
        let handles: Vec<MatchHandle> = shared.live.values().map(|m| m.handle.clone()).collect();
        let event = if shared.status == TournamentStatus::Crashed {
            None
        } else {
            self.inner.set_status(&mut shared, TournamentStatus::Finished)
        };
        drop(shared);

        info!(live = handles.len(), "destroying tournament");
        for handle in handles {
            handle.destroy();
        }
        self.inner.publish(event);
    }

    /// Blocks until the tournament finished or crashed and no match is live.
    ///
    /// Never returns for a tournament that keeps running, such as a ladder without limits.
    pub fn wait(&self) {
        let shared = self.inner.lock_shared();
        let _shared = self
            .inner
            .idle
            .wait_while(shared, |s| !s.is_settled())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns true when settled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let shared = self.inner.lock_shared();
        let (shared, _) = self
            .inner
            .idle
            .wait_timeout_while(shared, timeout, |s| !s.is_settled())
            .unwrap_or_else(PoisonError::into_inner);
        shared.is_settled()
    }

    /// Registers a player whatever the strategy allows; used by formats that fix their
    /// players at construction.
    pub(crate) fn register(&self, entry: PlayerEntry) -> Result<PlayerKey, TournamentError> {
        self.inner.register(entry)
    }

    pub(crate) fn with_strategy<T>(&self, f: impl FnOnce(&mut dyn TournamentStrategy) -> T) -> T {
        let mut strategy = self.inner.lock_strategy();
        f(strategy.as_mut())
    }

    fn ensure_player_changes(&self, action: &str) -> Result<(), TournamentError> {
        let allowed = self.inner.lock_strategy().allows_player_changes();
        if allowed {
            Ok(())
        } else {
            Err(TournamentError::NotSupported(format!(
                "tournament '{}' cannot {action}",
                self.inner.config.id
            )))
        }
    }
}

impl<R: RankSystem> Inner<R> {
    fn lock_shared(&self) -> MutexGuard<'_, Shared<R::State>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_strategy(&self) -> MutexGuard<'_, Box<dyn TournamentStrategy>> {
        self.strategy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: impl IntoIterator<Item = LifecycleEvent>) {
        for event in events {
            self.config.observers.publish(event);
        }
    }

    fn set_status(
        &self,
        shared: &mut Shared<R::State>,
        status: TournamentStatus,
    ) -> Option<LifecycleEvent> {
        if shared.status == status {
            return None;
        }
        info!(tournament = %self.config.id, "{:?} -> {status:?}", shared.status);
        shared.status = status;
        self.idle.notify_all();
        Some(LifecycleEvent::TournamentStatusChanged {
            tournament_id: self.config.id.clone(),
            status,
        })
    }

    fn transition(
        &self,
        action: &str,
        from: TournamentStatus,
        to: TournamentStatus,
    ) -> Result<(), TournamentError> {
        let mut shared = self.lock_shared();
        if shared.status != from {
            warn!(tournament = %self.config.id, "cannot {action} a tournament that is {:?}", shared.status);
            return Err(TournamentError::NotSupported(format!(
                "cannot {action} tournament '{}' while it is {:?}",
                self.config.id, shared.status
            )));
        }
        let event = self.set_status(&mut shared, to);
        drop(shared);
        self.publish(event);
        Ok(())
    }

    fn register(&self, entry: PlayerEntry) -> Result<PlayerKey, TournamentError> {
        let local_path = self.fetch_source(&entry.source, &entry.name)?;
        let stored = entry.id.as_deref().and_then(|id| self.stored_user(id));

        let mut shared = self.lock_shared();
        let identity = match entry.id {
            Some(id) => PlayerIdentity::Identified { id },
            None => {
                shared.next_anonymous += 1;
                PlayerIdentity::Anonymous {
                    local_id: shared.next_anonymous,
                }
            }
        };
        let key = identity.key();
        if shared.players.contains_key(&key) {
            return Err(TournamentError::InvalidConfig(format!(
                "player '{key}' is already registered"
            )));
        }

        let player = Player {
            key: key.clone(),
            identity,
            name: entry.name,
            source: entry.source,
            local_path,
            version: 1,
            disabled: false,
        };
        let mut stat = PlayerStat::new(player, self.config.rank_system.initialize_rank_state());
        if let Some(user) = stored {
            stat.player.disabled = user.disabled;
            self.restore_stat(&mut stat, &user);
        }
        shared.order.push(key.clone());
        shared.players.insert(key.clone(), stat);
        info!(player = %key, "player registered");
        Ok(key)
    }

    fn fetch_source(&self, source: &AgentSource, name: &str) -> Result<PathBuf, TournamentError> {
        match source {
            AgentSource::Local(path) => {
                if !path.exists() {
                    return Err(MatchError::AgentSetup {
                        name: name.to_owned(),
                        reason: format!("{} does not exist", path.display()),
                    }
                    .into());
                }
                Ok(path.clone())
            }
            AgentSource::Stored { key } => {
                let storage = self.config.storage.as_ref().ok_or_else(|| {
                    TournamentError::InvalidConfig(format!(
                        "agent '{key}' is stored remotely but no storage is attached"
                    ))
                })?;
                let dir = self.config.cache_dir();
                fs::create_dir_all(&dir)
                    .with_context(|| format!("could not create {}", dir.display()))
                    .map_err(TournamentError::Persistence)?;
                storage
                    .download(key, &cached_path(&dir, key), false)
                    .map_err(TournamentError::Persistence)
            }
        }
    }

    fn stored_user(&self, id: &str) -> Option<UserRecord> {
        let persistence = self.config.persistence.as_ref()?;
        persistence
            .get_user(id)
            .inspect_err(|e| warn!(user = id, "could not read user: {e:#}"))
            .ok()
            .flatten()
    }

    fn restore_stat(&self, stat: &mut PlayerStat<R::State>, user: &UserRecord) {
        let Some(value) = user.statistics.get(&self.config.id) else {
            return;
        };
        let restored = serde_json::from_value::<StoredStat>(value.clone()).and_then(|stored| {
            let rank_state = serde_json::from_value::<R::State>(stored.rank_state.clone())?;
            Ok((stored, rank_state))
        });
        match restored {
            Ok((stored, rank_state)) => {
                stat.matches_played = stored.matches_played;
                stat.wins = stored.wins;
                stat.ties = stored.ties;
                stat.losses = stored.losses;
                stat.rank_state = rank_state;
                debug!(user = %user.id, "statistics restored");
            }
            Err(e) => warn!(user = %user.id, "ignoring stored statistics: {e}"),
        }
    }

    fn stored_stat(&self, stat: &PlayerStat<R::State>) -> StoredStat {
        StoredStat {
            name: stat.player.name.clone(),
            score: self.config.rank_system.score(&stat.rank_state),
            matches_played: stat.matches_played,
            wins: stat.wins,
            ties: stat.ties,
            losses: stat.losses,
            rank_state: serde_json::to_value(&stat.rank_state).unwrap_or(Value::Null),
        }
    }

    /// Runs scheduling passes until nobody asks for one. Only one thread passes at a time;
    /// a request made meanwhile is picked up by that thread.
    fn pass(self: &Arc<Self>) {
        self.pass_requested.store(true, Ordering::SeqCst);
        loop {
            let guard = match self.pass_guard.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while self.pass_requested.swap(false, Ordering::SeqCst) {
                self.run_pass();
            }
            drop(guard);
            if !self.pass_requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn run_pass(self: &Arc<Self>) {
        let mut events = vec![];
        let launched = {
            let mut shared = self.lock_shared();
            let launched = self.schedule(&mut shared, &mut events);
            if self.config.configuration.verbose && !launched.is_empty() {
                print_running_matches(&shared.live);
            }
            launched
        };
        self.publish(events);
        for m in launched {
            self.spawn(m);
        }
    }

    fn schedule(&self, shared: &mut Shared<R::State>, events: &mut Vec<LifecycleEvent>) -> Vec<Match> {
        if shared.status != TournamentStatus::Running {
            return vec![];
        }
        if shared.limit_reached() {
            shared.queue.clear();
            if shared.live.is_empty() {
                info!(tournament = %self.config.id, total = shared.total_matches, "limit reached");
                events.extend(self.set_status(shared, TournamentStatus::Finished));
            }
            return vec![];
        }
        if !self.refill(shared) {
            info!(tournament = %self.config.id, total = shared.total_matches, "no more matches");
            events.extend(self.set_status(shared, TournamentStatus::Finished));
            return vec![];
        }
        self.launch_ready(shared, events)
    }

    /// Asks the strategy for matches when needed. False once a round based strategy is done.
    fn refill(&self, shared: &mut Shared<R::State>) -> bool {
        let mut strategy = self.lock_strategy();
        let continuous = strategy.is_continuous();
        let wanted = 2 * shared.limits.max_concurrent;
        loop {
            if continuous {
                if shared.queue.len() >= wanted {
                    return true;
                }
            } else if !shared.queue.is_empty() || !shared.live.is_empty() {
                return true;
            }

            let results = mem::take(&mut shared.round_results);
            let players = shared.enabled_players();
            let ranked = self.ranked(shared, &players);
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let next = strategy.advance_round(RoundContext {
                results,
                registered: &shared.order,
                players,
                ranked,
                agents_per_match: &self.config.agents_per_match,
                wanted,
                rng: &mut *rng,
            });
            drop(rng);

            if next.is_empty() {
                return continuous;
            }
            trace!(tournament = %self.config.id, matches = next.len(), "queueing matches");
            for queued in next {
                if shared.is_runnable(&queued) {
                    shared.queue.push_back(queued);
                } else {
                    warn!(tournament = %self.config.id, "not queueing {queued}: a player is missing or disabled");
                }
            }
            if continuous {
                return true;
            }
        }
    }

    fn ranked(&self, shared: &Shared<R::State>, players: &[PlayerKey]) -> Vec<PlayerKey> {
        let mut ranked: Vec<&PlayerStat<R::State>> =
            players.iter().filter_map(|key| shared.players.get(key)).collect();
        ranked.sort_by(|a, b| {
            self.config
                .rank_system
                .rank_comparator(&a.rank_state, &b.rank_state)
        });
        ranked.into_iter().map(|stat| stat.key().clone()).collect()
    }

    fn launch_ready(&self, shared: &mut Shared<R::State>, events: &mut Vec<LifecycleEvent>) -> Vec<Match> {
        let mut launched = vec![];
        while shared.live.len() < shared.limits.max_concurrent {
            if let Some(max) = shared.limits.max_total {
                if shared.total_matches + shared.live.len() as u64 >= max {
                    break;
                }
            }
            let Some(queued) = shared.queue.pop_front() else {
                break;
            };
            let Some(specs) = shared.agent_specs(&queued) else {
                warn!(tournament = %self.config.id, "dropping {queued}: a player is missing or disabled");
                continue;
            };

            let m = self.build_match(specs, &queued);
            debug!(tournament = %self.config.id, match_id = m.id(), "launching {queued}");
            shared.live.insert(
                m.id(),
                LiveMatch {
                    handle: m.handle(),
                    players: queued.players.clone(),
                    label: queued.label,
                },
            );
            events.push(LifecycleEvent::MatchStarted {
                tournament_id: self.config.id.clone(),
                match_id: m.id(),
                players: queued.players,
                live: shared.live.len(),
            });
            launched.push(m);
        }
        launched
    }

    fn build_match(&self, specs: Vec<AgentSpec>, queued: &QueuedMatch) -> Match {
        let tournament_ids = queued.players.iter().cloned().enumerate().collect();
        Match::new(self.game.new_game(), specs)
            .with_name(format!("{} {queued}", self.config.name))
            .with_options(self.config.engine_options.clone())
            .with_configuration(self.config.configuration.clone())
            .with_resolver(Arc::clone(&self.config.resolver))
            .with_tournament_ids(tournament_ids)
            .with_observers(self.config.observers.clone())
    }

    fn spawn(self: &Arc<Self>, mut m: Match) {
        let id = m.id();
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("match-{id}"))
            .spawn(move || {
                let result = m.run();
                inner.complete_match(&m, result);
                inner.pass();
            });

        if let Err(e) = spawned {
            error!(tournament = %self.config.id, match_id = id, "could not start match thread: {e}");
            let mut shared = self.lock_shared();
            shared.live.remove(&id);
            let event = self.set_status(&mut shared, TournamentStatus::Crashed);
            drop(shared);
            self.publish(event);
        }
    }

    fn complete_match(&self, m: &Match, result: Result<Value, MatchError>) {
        let match_id = m.id();
        let mut shared = self.lock_shared();
        let Some(live) = shared.live.remove(&match_id) else {
            warn!(match_id, "got the result of a match that is not live");
            return;
        };

        let recorded = match result {
            Ok(results) => self
                .record(&mut shared, match_id, live, results)
                .inspect_err(|e| warn!(match_id, "match results were not ranked: {e:#}"))
                .ok(),
            Err(e) if e.is_destroyed() => {
                info!(match_id, "match destroyed");
                None
            }
            Err(e) => {
                warn!(match_id, "match failed: {e}");
                None
            }
        };
        if self.config.configuration.verbose {
            print_match_result(m.name(), recorded.as_ref().map(|r| &r.record));
        }

        let mut events = vec![LifecycleEvent::MatchEnded {
            tournament_id: self.config.id.clone(),
            match_id,
            success: recorded.is_some(),
            live: shared.live.len(),
        }];
        if recorded.is_some() {
            events.push(LifecycleEvent::RanksUpdated {
                tournament_id: self.config.id.clone(),
            });
        }
        self.idle.notify_all();
        drop(shared);

        if let Some(recorded) = recorded {
            self.persist(recorded);
        }
        self.publish(events);
    }

    /// Folds one match outcome into the players' statistics.
    fn record(
        &self,
        shared: &mut Shared<R::State>,
        match_id: u64,
        live: LiveMatch,
        results: Value,
    ) -> anyhow::Result<Recorded> {
        let outcome = (self.config.result_handler)(&results).context("result handler failed")?;
        let ranks = outcome.seat_ranks(live.players.len())?;

        let prior = live
            .players
            .iter()
            .map(|key| {
                shared
                    .players
                    .get(key)
                    .map(|stat| stat.rank_state.clone())
                    .with_context(|| format!("player '{key}' left the tournament"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let next = self.config.rank_system.update_ranks(&prior, &ranks)?;

        let best = ranks.iter().copied().min().unwrap_or(1);
        let all_tied = ranks.iter().all(|&rank| rank == best);
        let mut snapshots = vec![];
        for ((key, &rank), rank_state) in live.players.iter().zip(&ranks).zip(next) {
            let Some(stat) = shared.players.get_mut(key) else {
                continue;
            };
            stat.matches_played += 1;
            if all_tied {
                stat.ties += 1;
            } else if rank == best {
                stat.wins += 1;
            } else {
                stat.losses += 1;
            }
            stat.rank_state = rank_state;
            if let Some(id) = stat.player.identity.external_id() {
                snapshots.push((id.to_owned(), self.stored_stat(stat)));
            }
        }
        shared.total_matches += 1;

        let record = MatchRecord {
            match_id,
            label: live.label,
            players: live.players,
            ranks,
            results,
        };
        debug!(match_id, ranks = ?record.ranks, "match ranked");
        shared.round_results.push(record.clone());
        if let Some(keep) = self.config.past_results {
            shared.past_results.push_back(record.clone());
            while shared.past_results.len() > keep {
                shared.past_results.pop_front();
            }
        }
        Ok(Recorded { record, snapshots })
    }

    fn persist(&self, recorded: Recorded) {
        let Some(persistence) = &self.config.persistence else {
            return;
        };
        let Recorded { record, snapshots } = recorded;
        let stored = StoredMatch {
            match_id: record.match_id,
            tournament_id: self.config.id.clone(),
            players: record.players,
            ranks: record.ranks,
            results: record.results,
        };
        if let Err(e) = persistence.store_match(&stored, &self.config.governor_id) {
            warn!(match_id = stored.match_id, "could not store match: {e:#}");
        }
        for (id, stat) in snapshots {
            let value = match serde_json::to_value(&stat) {
                Ok(value) => value,
                Err(e) => {
                    warn!(user = %id, "could not serialize statistics: {e}");
                    continue;
                }
            };
            let patch = UserPatch {
                statistics: HashMap::from([(self.config.id.clone(), value)]),
                ..UserPatch::default()
            };
            if let Err(e) = persistence.update_user(&id, patch) {
                warn!(user = %id, "could not store statistics: {e:#}");
            }
        }
    }
}

fn print_running_matches(live: &HashMap<u64, LiveMatch>) {
    let mut running: Vec<_> = live.iter().collect();
    running.sort_by_key(|(id, _)| **id);
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(|(id, m)| {
                let players = m.players.iter().map(PlayerKey::as_str).collect::<Vec<_>>();
                format!("#{id} {}", players.join(" vs "))
            })
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_match_result(name: &str, record: Option<&MatchRecord>) {
    match record {
        Some(record) => {
            let ranks = record
                .ranks
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join("-");
            // clear line, green match, ranks, start of line
            println!("\x1b[2K\x1b[32m{name}: \x1b[39m{ranks}\x1b[0G");
        }
        None => println!("\x1b[2K\x1b[32m{name}: \x1b[31mno result\x1b[39m\x1b[0G"),
    }
}
