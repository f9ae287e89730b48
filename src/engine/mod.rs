//! Match engine: owns the agents of one match and steps them through rounds.
//!
//! The engine is driven by [`Match`](crate::match_runner::Match); game logic reaches it through
//! [`MatchContext`](crate::match_runner::MatchContext).

use std::sync::{
    mpsc::{self, Receiver, Sender},
    Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::{AgentId, AgentProcess, AgentSpec, StderrSink};
use crate::error::MatchError;
use crate::match_runner::{MatchInfo, MatchStatus};
use crate::resolver::CommandResolver;

pub(crate) mod control;
mod coordinator;
pub mod options;

pub(crate) use control::MatchControl;
use coordinator::CommandCoordinator;
pub use options::{EngineOptions, FinishPolicy, MoveFinishPredicate, ViolationCallback};

/// Sent by agent reader threads and by match handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineEvent {
    /// One complete stdout line.
    Line { agent: AgentId, line: String },
    /// Stdout reached end of file.
    Closed { agent: AgentId },
    /// A stop, resume or destroy request.
    Wake,
}

/// One token an agent sent during the current round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// Sender.
    pub agent_id: AgentId,
    /// Command text, without delimiter.
    pub text: String,
}

/// Owns the agent processes of a match and the coordinator merging their output.
pub struct MatchEngine {
    agents: Vec<AgentProcess>,
    coordinator: CommandCoordinator,
    options: EngineOptions,
    control: Arc<MatchControl>,
    events: Sender<EngineEvent>,
}

impl MatchEngine {
    pub(crate) fn new(options: EngineOptions) -> Self {
        let (tx, rx): (Sender<EngineEvent>, Receiver<EngineEvent>) = mpsc::channel();
        let control = Arc::new(MatchControl::new(tx.clone()));
        Self {
            agents: vec![],
            coordinator: CommandCoordinator::new(rx, &options),
            options,
            control,
            events: tx,
        }
    }

    pub(crate) fn control(&self) -> &Arc<MatchControl> {
        &self.control
    }

    /// Spawns one process per spec. On failure every agent spawned so far is killed.
    pub(crate) fn spawn_agents(
        &mut self,
        specs: &[AgentSpec],
        resolver: &dyn CommandResolver,
        stderr: impl Fn(AgentId, &AgentSpec) -> StderrSink,
    ) -> Result<(), MatchError> {
        for (id, spec) in specs.iter().enumerate() {
            let spawned = resolver
                .resolve(&spec.source)
                .map_err(|e| MatchError::AgentSetup {
                    name: spec.name.clone(),
                    reason: format!("{e:#}"),
                })
                .and_then(|command| {
                    AgentProcess::spawn(
                        id,
                        spec.name.clone(),
                        &command,
                        stderr(id, spec),
                        self.events.clone(),
                    )
                });
            match spawned {
                Ok(agent) => self.agents.push(agent),
                Err(e) => {
                    self.kill_all();
                    self.agents.clear();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Options in use.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Agents of the match, indexed by id.
    pub fn agents(&self) -> &[AgentProcess] {
        &self.agents
    }

    /// Looks an agent up.
    pub fn agent(&self, id: AgentId) -> Option<&AgentProcess> {
        self.agents.get(id)
    }

    /// Resets every surviving agent for a new round and arms its move timer.
    pub(crate) fn start_round(&mut self) {
        let budget = self.options.move_budget();
        for agent in self.agents.iter_mut().filter(|a| !a.is_terminated()) {
            agent.reset_move();
            if let Some(budget) = budget {
                agent.timer.arm(budget);
            }
        }
    }

    /// Blocks until the round is complete and returns its commands.
    pub(crate) fn collect_commands(&mut self, info: &MatchInfo) -> Result<Vec<Command>, MatchError> {
        let result = self
            .coordinator
            .collect(&mut self.agents, &self.options, info, &self.control);
        if let Err(MatchError::Destroyed { .. }) = &result {
            self.kill_all();
        }
        result
    }

    /// Honors pending stop and destroy requests between rounds. Returns the status seen last.
    pub(crate) fn checkpoint(&mut self, info: &MatchInfo) -> Result<MatchStatus, MatchError> {
        let result = self
            .coordinator
            .checkpoint(&mut self.agents, &self.options, info, &self.control);
        if result.is_err() {
            self.kill_all();
        }
        result
    }

    /// Writes one line to an agent.
    pub fn send(&mut self, agent: AgentId, message: &str) -> Result<(), MatchError> {
        match self.agents.get_mut(agent) {
            Some(a) => a.send(message),
            None => Err(MatchError::AgentTerminated { agent }),
        }
    }

    /// Writes one line to every live agent. Failures are logged and skipped.
    pub fn send_all(&mut self, message: &str) {
        for agent in self.agents.iter_mut().filter(|a| !a.is_terminated()) {
            if let Err(e) = agent.send(message) {
                warn!(agent = agent.id(), "could not send to agent: {e}");
            }
        }
    }

    /// Suspends every live agent.
    pub fn stop(&mut self) {
        for agent in &mut self.agents {
            if let Err(e) = agent.pause() {
                warn!(agent = agent.id(), "could not suspend agent: {e}");
            }
        }
    }

    /// Continues every suspended agent.
    pub fn resume(&mut self) {
        for agent in &mut self.agents {
            if let Err(e) = agent.resume() {
                warn!(agent = agent.id(), "could not resume agent: {e}");
            }
        }
    }

    /// Terminates one agent.
    pub fn kill(&mut self, agent: AgentId) {
        if let Some(a) = self.agents.get_mut(agent) {
            a.terminate();
        }
    }

    /// Terminates every agent.
    pub fn kill_all(&mut self) {
        debug!("killing {} agents", self.agents.len());
        for agent in &mut self.agents {
            agent.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::coordinator::{accept_line, extract_commands};
    use std::sync::Arc;

    fn feed(agent: &mut AgentProcess, options: &EngineOptions, lines: &[&str]) {
        for line in lines {
            accept_line(agent, line.to_string(), options);
        }
    }

    #[test]
    fn finish_symbol_is_not_a_command() {
        let options = EngineOptions::new().with_finish_symbol("FINISH");
        let mut agent = AgentProcess::detached(0, "rock");
        feed(&mut agent, &options, &["R", "FINISH"]);
        assert!(agent.move_complete);

        let commands = extract_commands(std::slice::from_ref(&agent), options.command_delimiter());
        assert_eq!(
            commands,
            vec![Command {
                agent_id: 0,
                text: "R".into()
            }]
        );
    }

    #[test]
    fn delimiter_splits_and_drops_empty_tokens() {
        let options = EngineOptions::new();
        let mut a = AgentProcess::detached(0, "a");
        let mut b = AgentProcess::detached(1, "b");
        feed(&mut a, &options, &["m 1,,m 2,", "", "m 3", "D_FINISH"]);
        feed(&mut b, &options, &["x", "D_FINISH"]);

        let texts: Vec<_> = extract_commands(&[a, b], ",")
            .into_iter()
            .map(|c| (c.agent_id, c.text))
            .collect();
        assert_eq!(
            texts,
            vec![
                (0, "m 1".to_owned()),
                (0, "m 2".to_owned()),
                (0, "m 3".to_owned()),
                (1, "x".to_owned())
            ]
        );
    }

    #[test]
    fn line_count_finishes_after_max_lines_or_symbol() {
        let options = EngineOptions::new().with_finish_policy(FinishPolicy::LineCount { max: 2 });
        let mut agent = AgentProcess::detached(0, "a");
        feed(&mut agent, &options, &["1"]);
        assert!(!agent.move_complete);
        feed(&mut agent, &options, &["2"]);
        assert!(agent.move_complete);

        let mut early = AgentProcess::detached(1, "b");
        feed(&mut early, &options, &["1", "D_FINISH"]);
        assert!(early.move_complete);
        assert_eq!(early.move_lines(), ["1"]);
    }

    #[test]
    fn custom_policy_sees_accumulated_lines() {
        let predicate = |lines: &[String]| lines.last().is_some_and(|l| l.ends_with('.'));
        let options =
            EngineOptions::new().with_finish_policy(FinishPolicy::Custom(Arc::new(predicate)));
        let mut agent = AgentProcess::detached(0, "a");
        feed(&mut agent, &options, &["go", "north."]);
        assert!(agent.move_complete);
        assert_eq!(agent.move_lines(), ["go", "north."]);
    }

    #[test]
    fn output_after_move_is_held_for_next_round() {
        let options = EngineOptions::new().without_timeout().without_memory_limit();
        let (tx, rx) = mpsc::channel();
        let control = MatchControl::new(tx.clone());
        control.set_status(crate::match_runner::MatchStatus::Running);
        let info = MatchInfo {
            id: 0,
            name: "held".into(),
        };
        let mut coordinator = CommandCoordinator::new(rx, &options);
        let mut agents = vec![AgentProcess::detached(0, "a")];

        for line in ["R", "D_FINISH", "P", "D_FINISH"] {
            tx.send(EngineEvent::Line {
                agent: 0,
                line: line.into(),
            })
            .unwrap();
        }
        let first = coordinator
            .collect(&mut agents, &options, &info, &control)
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].text, "R");

        agents[0].reset_move();
        // "P" may still be in the channel or already held: both must be picked up
        let second = coordinator
            .collect(&mut agents, &options, &info, &control)
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text, "P");
    }

    #[test]
    fn queued_move_beats_an_expired_timer() {
        let options = EngineOptions::new().without_memory_limit();
        let (tx, rx) = mpsc::channel();
        let control = MatchControl::new(tx.clone());
        control.set_status(crate::match_runner::MatchStatus::Running);
        let info = MatchInfo {
            id: 3,
            name: "late wake-up".into(),
        };
        let mut coordinator = CommandCoordinator::new(rx, &options);
        let mut agents = vec![AgentProcess::detached(0, "a")];
        agents[0].timer.arm(std::time::Duration::ZERO);

        for line in ["R", "D_FINISH"] {
            tx.send(EngineEvent::Line {
                agent: 0,
                line: line.into(),
            })
            .unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));

        let commands = coordinator
            .collect(&mut agents, &options, &info, &control)
            .unwrap();
        assert!(!agents[0].is_terminated());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].text, "R");
    }

    #[test]
    fn disabled_memory_limit_removes_the_sampler() {
        let (_tx, rx) = mpsc::channel();
        let coordinator =
            CommandCoordinator::new(rx, &EngineOptions::new().without_memory_limit());
        assert!(coordinator.memory.is_none());

        let (_tx, rx) = mpsc::channel();
        let coordinator = CommandCoordinator::new(rx, &EngineOptions::new());
        assert!(coordinator.memory.is_some());
    }

    #[test]
    fn destroyed_control_interrupts_collection() {
        let options = EngineOptions::new().without_timeout().without_memory_limit();
        let (tx, rx) = mpsc::channel();
        let control = MatchControl::new(tx);
        control.set_status(crate::match_runner::MatchStatus::Running);
        control.destroy();
        let info = MatchInfo {
            id: 7,
            name: "gone".into(),
        };
        let mut coordinator = CommandCoordinator::new(rx, &options);
        let mut agents = vec![AgentProcess::detached(0, "a")];

        let err = coordinator
            .collect(&mut agents, &options, &info, &control)
            .unwrap_err();
        assert!(err.is_destroyed());
    }
}
