//! A single match: agents, game logic and the round loop tying them together.
//!
//! ```text
//! Uninitialized -> Ready -> Running <-> Stopped
//!                             |  \
//!                             |   -> Error
//!                             -> Finished
//! ```
//!
//! [`Match::run`] blocks the calling thread. Use a [`MatchHandle`] to stop, resume or destroy
//! the match from elsewhere.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentId, AgentProcess, AgentSpec, StderrSink};
use crate::configuration::Configuration;
use crate::engine::{Command, EngineOptions, MatchControl, MatchEngine};
use crate::error::MatchError;
use crate::game_interface::GameLogic;
use crate::observer::{LifecycleEvent, Observers};
use crate::resolver::{CommandResolver, ExtensionResolver};
use crate::tournament::PlayerKey;

static NEXT_MATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Status of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    /// Built, agents not started.
    Uninitialized,
    /// Agents started and game initialized.
    Ready,
    /// Rounds are being played.
    Running,
    /// Agents suspended, the round loop waits for a resume.
    Stopped,
    /// The game ended and results are available.
    Finished,
    /// The match failed or was destroyed. Final.
    Error,
}

/// Identity of a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchInfo {
    /// Process-unique id.
    pub id: u64,
    /// Display name.
    pub name: String,
}

/// How seriously an agent broke the game protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// Description shown in logs and errors.
    pub message: String,
    /// A fatal error ends the match.
    pub fatal: bool,
}

impl ProtocolError {
    /// Logged, the match goes on.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// Ends the match with [`MatchError::Protocol`].
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// What game logic sees of the match while it runs.
pub struct MatchContext<'a> {
    engine: &'a mut MatchEngine,
    info: &'a MatchInfo,
    round: u64,
    state: &'a mut Value,
    fault: &'a mut Option<MatchError>,
}

impl MatchContext<'_> {
    /// Match id.
    pub fn match_id(&self) -> u64 {
        self.info.id
    }

    /// Match name.
    pub fn match_name(&self) -> &str {
        &self.info.name
    }

    /// Index of the round being played, starting at 0.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Every agent of the match, terminated ones included.
    pub fn agents(&self) -> &[AgentProcess] {
        self.engine.agents()
    }

    /// Ids of every agent of the match.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.engine.agents().iter().map(AgentProcess::id).collect()
    }

    /// Looks an agent up.
    pub fn agent(&self, id: AgentId) -> Option<&AgentProcess> {
        self.engine.agent(id)
    }

    /// Opaque game state.
    pub fn state(&self) -> &Value {
        self.state
    }

    /// Opaque game state, writable.
    pub fn state_mut(&mut self) -> &mut Value {
        self.state
    }

    /// Sends one line to an agent. Fails if the agent is terminated.
    pub fn send(&mut self, agent: AgentId, message: &str) -> Result<(), MatchError> {
        self.engine.send(agent, message)
    }

    /// Sends one line to every live agent.
    pub fn send_all(&mut self, message: &str) {
        self.engine.send_all(message)
    }

    /// Terminates one agent. It contributes no further commands.
    pub fn kill(&mut self, agent: AgentId) {
        self.engine.kill(agent)
    }

    /// Reports a protocol violation by `agent`.
    pub fn throw(&mut self, agent: AgentId, error: ProtocolError) {
        let name = self
            .engine
            .agent(agent)
            .map(|a| a.name().to_owned())
            .unwrap_or_default();
        if !error.fatal {
            warn!(match_id = self.info.id, agent, %name, "protocol error: {}", error.message);
            return;
        }
        error!(match_id = self.info.id, agent, %name, "fatal protocol error: {}", error.message);
        if self.fault.is_none() {
            *self.fault = Some(MatchError::Protocol {
                agent,
                message: error.message,
            });
        }
    }
}

/// Controls a match from another thread.
#[derive(Clone)]
pub struct MatchHandle {
    info: MatchInfo,
    control: Arc<MatchControl>,
    observers: Observers,
}

impl MatchHandle {
    /// Match id.
    pub fn id(&self) -> u64 {
        self.info.id
    }

    /// Match name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Current status.
    pub fn status(&self) -> MatchStatus {
        self.control.status()
    }

    /// Suspends every agent; the round loop waits until [`resume`](Self::resume).
    ///
    /// Only legal while running. Otherwise a warning is logged and an error returned.
    pub fn stop(&self) -> Result<(), MatchError> {
        self.move_to("stop", MatchStatus::Running, MatchStatus::Stopped)
    }

    /// Continues a stopped match where it left off.
    pub fn resume(&self) -> Result<(), MatchError> {
        self.move_to("resume", MatchStatus::Stopped, MatchStatus::Running)
    }

    /// Kills every agent and makes a pending or future `run()` fail with
    /// [`MatchError::Destroyed`]. Idempotent.
    pub fn destroy(&self) {
        if self.control.destroy() {
            info!(match_id = self.info.id, "destroying match");
            self.observers.publish(LifecycleEvent::MatchStatusChanged {
                match_id: self.info.id,
                status: self.control.status(),
            });
        }
    }

    /// True once [`destroy`](Self::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.control.is_destroyed()
    }

    fn move_to(
        &self,
        action: &'static str,
        from: MatchStatus,
        to: MatchStatus,
    ) -> Result<(), MatchError> {
        match self.control.transition(from, to) {
            Ok(()) => {
                debug!(match_id = self.info.id, "{action}: {from:?} -> {to:?}");
                self.observers.publish(LifecycleEvent::MatchStatusChanged {
                    match_id: self.info.id,
                    status: to,
                });
                Ok(())
            }
            Err(status) => {
                warn!(match_id = self.info.id, "cannot {action} a match that is {status:?}");
                Err(MatchError::InvalidTransition {
                    action,
                    match_id: self.info.id,
                    status,
                })
            }
        }
    }
}

/// A match between agent processes, driven by caller supplied [`GameLogic`].
pub struct Match {
    info: MatchInfo,
    specs: Vec<AgentSpec>,
    engine: MatchEngine,
    logic: Box<dyn GameLogic>,
    round: u64,
    state: Value,
    results: Option<Value>,
    tournament_ids: HashMap<AgentId, PlayerKey>,
    config: Configuration,
    resolver: Arc<dyn CommandResolver>,
    observers: Observers,
    fault: Option<MatchError>,
}

impl Match {
    /// Builds a match. Agent ids follow the order of `agents`.
    pub fn new(logic: Box<dyn GameLogic>, agents: Vec<AgentSpec>) -> Self {
        let id = NEXT_MATCH_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            info: MatchInfo {
                id,
                name: format!("match_{id}"),
            },
            specs: agents,
            engine: MatchEngine::new(EngineOptions::default()),
            logic,
            round: 0,
            state: Value::Null,
            results: None,
            tournament_ids: HashMap::new(),
            config: Configuration::default(),
            resolver: Arc::new(ExtensionResolver),
            observers: Observers::default(),
            fault: None,
        }
    }

    /// Display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    /// Engine options for this match. Must be called before [`handle`](Self::handle).
    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.engine = MatchEngine::new(options);
        self
    }

    /// Crate-wide configuration (agent stderr handling).
    #[must_use]
    pub fn with_configuration(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Source to command resolution.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn CommandResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Maps agents to the tournament players they stand for.
    #[must_use]
    pub fn with_tournament_ids(mut self, ids: HashMap<AgentId, PlayerKey>) -> Self {
        self.tournament_ids = ids;
        self
    }

    /// Lifecycle observers.
    #[must_use]
    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Match id.
    pub fn id(&self) -> u64 {
        self.info.id
    }

    /// Match name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Id and name.
    pub fn info(&self) -> &MatchInfo {
        &self.info
    }

    /// Current status.
    pub fn status(&self) -> MatchStatus {
        self.engine.control().status()
    }

    /// Rounds played so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Opaque game state.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Results, once finished.
    pub fn results(&self) -> Option<&Value> {
        self.results.as_ref()
    }

    /// Agents of the match.
    pub fn agents(&self) -> &[AgentProcess] {
        self.engine.agents()
    }

    /// Engine options in use.
    pub fn options(&self) -> &EngineOptions {
        self.engine.options()
    }

    /// Agent to player mapping when run inside a tournament.
    pub fn tournament_ids(&self) -> &HashMap<AgentId, PlayerKey> {
        &self.tournament_ids
    }

    /// A handle to control the match from another thread.
    pub fn handle(&self) -> MatchHandle {
        MatchHandle {
            info: self.info.clone(),
            control: self.engine.control().clone(),
            observers: self.observers.clone(),
        }
    }

    /// Starts every agent and initializes the game.
    ///
    /// Fails, without reaching `Ready`, if an agent cannot be set up.
    #[instrument(skip_all, fields(match_id = self.info.id))]
    pub fn initialize(&mut self) -> Result<(), MatchError> {
        self.ensure_status("initialize", MatchStatus::Uninitialized)?;
        self.observers.publish(LifecycleEvent::MatchCreated {
            match_id: self.info.id,
            name: self.info.name.clone(),
        });

        let config = &self.config;
        let match_id = self.info.id;
        self.engine
            .spawn_agents(&self.specs, self.resolver.as_ref(), |_, spec| {
                stderr_sink(config, match_id, spec)
            })
            .inspect_err(|e| error!("setup failed: {e}"))?;

        let mut ctx = MatchContext {
            engine: &mut self.engine,
            info: &self.info,
            round: 0,
            state: &mut self.state,
            fault: &mut self.fault,
        };
        if let Err(e) = self.logic.initialize(&mut ctx) {
            self.engine.kill_all();
            return Err(MatchError::GameLogic(e));
        }
        if let Some(fault) = self.fault.take() {
            self.engine.kill_all();
            return Err(fault);
        }

        self.set_status(MatchStatus::Ready);
        info!(agents = self.specs.len(), "match ready");
        Ok(())
    }

    /// Plays rounds until the game finishes and returns its results.
    ///
    /// Initializes the match first if needed. Returns [`MatchError::Destroyed`] if the match is
    /// destroyed meanwhile.
    #[instrument(skip_all, fields(match_id = self.info.id, name = %self.info.name))]
    pub fn run(&mut self) -> Result<Value, MatchError> {
        if self.status() == MatchStatus::Uninitialized {
            self.initialize()?;
        }
        self.ensure_status("run", MatchStatus::Ready)?;
        self.engine.start_round();
        self.set_status(MatchStatus::Running);

        loop {
            match self.step() {
                Ok(MatchStatus::Finished) => break,
                Ok(_) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }

        info!(rounds = self.round, "match finished");
        self.results
            .clone()
            .ok_or_else(|| MatchError::GameLogic(anyhow::anyhow!("match finished without results")))
    }

    /// Plays one round: waits for every agent's move, then updates the game.
    pub fn step(&mut self) -> Result<MatchStatus, MatchError> {
        // a stop landing after the checkpoint is honored inside the round
        let status = self.engine.checkpoint(&self.info)?;
        if !matches!(status, MatchStatus::Running | MatchStatus::Stopped) {
            return Err(MatchError::InvalidTransition {
                action: "step",
                match_id: self.info.id,
                status,
            });
        }

        let commands = self.engine.collect_commands(&self.info)?;
        debug!(round = self.round, commands = commands.len(), "round collected");
        let next = self.update(&commands)?;

        match next {
            MatchStatus::Finished => {
                self.finish()?;
                Ok(MatchStatus::Finished)
            }
            MatchStatus::Error => Err(MatchError::GameLogic(anyhow::anyhow!(
                "game logic reported an error status"
            ))),
            MatchStatus::Stopped => {
                self.prepare_next_round();
                let _ = self.handle().stop();
                Ok(MatchStatus::Stopped)
            }
            _ => {
                self.prepare_next_round();
                Ok(MatchStatus::Running)
            }
        }
    }

    /// Kills every agent and makes `run()` fail with [`MatchError::Destroyed`]. Idempotent.
    pub fn destroy(&mut self) {
        self.handle().destroy();
        self.engine.kill_all();
    }

    fn update(&mut self, commands: &[Command]) -> Result<MatchStatus, MatchError> {
        let mut ctx = MatchContext {
            engine: &mut self.engine,
            info: &self.info,
            round: self.round,
            state: &mut self.state,
            fault: &mut self.fault,
        };
        let next = self
            .logic
            .update(&mut ctx, commands)
            .map_err(MatchError::GameLogic)?;
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        Ok(next.unwrap_or(MatchStatus::Running))
    }

    fn prepare_next_round(&mut self) {
        self.engine.start_round();
        self.round += 1;
    }

    fn finish(&mut self) -> Result<(), MatchError> {
        self.round += 1;
        if self.results.is_none() {
            let mut ctx = MatchContext {
                engine: &mut self.engine,
                info: &self.info,
                round: self.round,
                state: &mut self.state,
                fault: &mut self.fault,
            };
            let results = self
                .logic
                .get_results(&mut ctx)
                .map_err(MatchError::GameLogic)?;
            self.results = Some(results);
        }
        self.engine.kill_all();
        self.set_status(MatchStatus::Finished);
        Ok(())
    }

    /// Tears the match down after an error and returns that error.
    fn fail(&mut self, error: MatchError) -> MatchError {
        self.engine.kill_all();
        if error.is_destroyed() {
            info!("match destroyed");
        } else {
            error!("match failed: {error}");
            self.set_status(MatchStatus::Error);
        }
        error
    }

    fn ensure_status(&self, action: &'static str, expected: MatchStatus) -> Result<(), MatchError> {
        let status = self.status();
        if self.engine.control().is_destroyed() {
            return Err(MatchError::Destroyed {
                match_id: self.info.id,
            });
        }
        if status != expected {
            return Err(MatchError::InvalidTransition {
                action,
                match_id: self.info.id,
                status,
            });
        }
        Ok(())
    }

    fn set_status(&self, status: MatchStatus) {
        self.engine.control().set_status(status);
        self.observers.publish(LifecycleEvent::MatchStatusChanged {
            match_id: self.info.id,
            status,
        });
    }
}

fn stderr_sink(config: &Configuration, match_id: u64, spec: &AgentSpec) -> StderrSink {
    if config.debug_agent_stderr {
        StderrSink::Log
    } else if let Some(dir) = &config.agent_log_dir {
        StderrSink::File(dir.join(format!("{}_match_{match_id}.txt", spec.name)))
    } else {
        StderrSink::Discard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolvedCommand;
    use std::path::Path;

    struct NoopGame;

    impl GameLogic for NoopGame {
        fn initialize(&mut self, _ctx: &mut MatchContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn update(
            &mut self,
            _ctx: &mut MatchContext<'_>,
            _commands: &[Command],
        ) -> anyhow::Result<Option<MatchStatus>> {
            Ok(Some(MatchStatus::Finished))
        }

        fn get_results(&mut self, _ctx: &mut MatchContext<'_>) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    /// Finishes after `rounds` agentless rounds.
    struct CountRounds {
        rounds: u64,
        played: u64,
    }

    impl GameLogic for CountRounds {
        fn initialize(&mut self, _ctx: &mut MatchContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn update(
            &mut self,
            _ctx: &mut MatchContext<'_>,
            _commands: &[Command],
        ) -> anyhow::Result<Option<MatchStatus>> {
            self.played += 1;
            Ok((self.played >= self.rounds).then_some(MatchStatus::Finished))
        }

        fn get_results(&mut self, _ctx: &mut MatchContext<'_>) -> anyhow::Result<Value> {
            Ok(serde_json::json!({ "played": self.played }))
        }
    }

    struct FailingResolver;

    impl CommandResolver for FailingResolver {
        fn resolve(&self, source: &Path) -> anyhow::Result<ResolvedCommand> {
            anyhow::bail!("no interpreter for {}", source.display())
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = Match::new(Box::new(NoopGame), vec![]);
        let b = Match::new(Box::new(NoopGame), vec![]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.status(), MatchStatus::Uninitialized);
    }

    #[test]
    fn setup_failure_never_reaches_ready() {
        let mut m = Match::new(Box::new(NoopGame), vec![AgentSpec::new("bot.xyz")])
            .with_resolver(Arc::new(FailingResolver));
        let err = m.initialize().unwrap_err();
        assert!(matches!(err, MatchError::AgentSetup { ref name, .. } if name == "bot"));
        assert_eq!(m.status(), MatchStatus::Uninitialized);
    }

    #[test]
    fn stop_and_resume_out_of_state_are_recoverable() {
        let m = Match::new(Box::new(NoopGame), vec![]);
        let handle = m.handle();
        assert!(matches!(
            handle.stop(),
            Err(MatchError::InvalidTransition { action: "stop", .. })
        ));
        assert!(handle.resume().is_err());
        assert_eq!(m.status(), MatchStatus::Uninitialized);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut m = Match::new(Box::new(NoopGame), vec![]);
        m.destroy();
        m.destroy();
        assert!(m.handle().is_destroyed());
        assert!(m.run().unwrap_err().is_destroyed());
    }

    #[test]
    fn concurrent_stop_and_resume_never_fail_the_match() {
        for _ in 0..10 {
            let mut m = Match::new(Box::new(CountRounds { rounds: 50_000, played: 0 }), vec![]);
            let handle = m.handle();
            let runner = std::thread::spawn(move || m.run());

            let mut cycles = 0;
            while !runner.is_finished() && cycles < 20_000 {
                if handle.stop().is_ok() {
                    cycles += 1;
                    // finishing may win the race against resume
                    let _ = handle.resume();
                }
            }

            let results = runner.join().unwrap().unwrap();
            assert_eq!(results, serde_json::json!({ "played": 50_000 }));
            assert_eq!(handle.status(), MatchStatus::Finished);
            assert!(cycles > 0);
        }
    }

    #[test]
    fn agentless_match_finishes_after_one_round() {
        let mut m = Match::new(Box::new(NoopGame), vec![]);
        assert_eq!(m.run().unwrap(), Value::Null);
        assert_eq!(m.status(), MatchStatus::Finished);
        assert_eq!(m.round(), 1);
    }
}
