//! Round protocol: merges every agent's output into one batch of commands per round.
//!
//! A round is over once every agent that is still alive completed its move. Move timers and
//! the memory sampler are serviced from the same wait loop, so no extra thread is involved.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{trace, warn};

use super::{control::MatchControl, Command, EngineEvent};
use crate::agent::{AgentId, AgentProcess};
use crate::engine::options::{EngineOptions, FinishPolicy};
use crate::error::MatchError;
use crate::match_runner::{MatchInfo, MatchStatus};

/// Events handled before deadlines are checked, per wait loop iteration.
const PENDING_BATCH: usize = 256;

pub(super) struct MemoryWatch {
    system: System,
    next_check: Instant,
}

impl MemoryWatch {
    fn new(rate: Duration) -> Self {
        Self {
            system: System::new(),
            next_check: Instant::now() + rate,
        }
    }

    /// Resident memory of each live agent, in bytes.
    fn sample(&mut self, agents: &[AgentProcess]) -> Vec<(AgentId, u64)> {
        let pids: Vec<Pid> = agents
            .iter()
            .filter(|a| !a.is_terminated())
            .filter_map(|a| a.pid().map(Pid::from_u32))
            .collect();
        if pids.is_empty() {
            return vec![];
        }
        self.system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
        agents
            .iter()
            .filter(|a| !a.is_terminated())
            .filter_map(|a| {
                let pid = Pid::from_u32(a.pid()?);
                Some((a.id(), self.system.process(pid)?.memory()))
            })
            .collect()
    }
}

/// Single consumer of the agents' output events of one match.
pub(crate) struct CommandCoordinator {
    events: Receiver<EngineEvent>,
    pub(super) memory: Option<MemoryWatch>,
}

impl CommandCoordinator {
    pub(crate) fn new(events: Receiver<EngineEvent>, options: &EngineOptions) -> Self {
        let memory = options
            .memory
            .active
            .then(|| MemoryWatch::new(options.memory.check_rate));
        Self { events, memory }
    }

    /// Blocks until every live agent completed its move, then splits their lines into commands.
    pub(crate) fn collect(
        &mut self,
        agents: &mut [AgentProcess],
        options: &EngineOptions,
        info: &MatchInfo,
        control: &MatchControl,
    ) -> Result<Vec<Command>, MatchError> {
        for agent in agents.iter_mut() {
            while !agent.move_complete && !agent.is_terminated() {
                let Some(line) = agent.held_lines.pop_front() else {
                    break;
                };
                accept_line(agent, line, options);
            }
        }

        loop {
            self.checkpoint(agents, options, info, control)?;
            if round_complete(agents) {
                break;
            }

            // lines already received count as on time, whatever the clock says now
            for event in self.events.try_iter().take(PENDING_BATCH) {
                dispatch(event, agents, options);
            }
            if round_complete(agents) {
                break;
            }

            let now = Instant::now();
            for agent in agents.iter_mut() {
                if agent.is_terminated() || agent.move_complete {
                    continue;
                }
                if agent.timer.deadline().is_some_and(|deadline| now >= deadline) {
                    agent.timer.disarm();
                    (options.timeout.callback)(agent, info, options);
                }
            }
            self.check_memory(agents, options, info, now);
            if round_complete(agents) {
                break;
            }

            let event = match self.next_wake_up(agents) {
                Some(at) => match self.events.recv_timeout(at.saturating_duration_since(now)) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.events.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            dispatch(event, agents, options);
        }

        Ok(extract_commands(agents, &options.command_delimiter))
    }

    /// Honors a pending stop or destroy request. Blocks while the match is stopped.
    ///
    /// Returns the status seen last. It may already be `Stopped` again when a stop request
    /// raced the resume; the next checkpoint honors it.
    pub(crate) fn checkpoint(
        &mut self,
        agents: &mut [AgentProcess],
        options: &EngineOptions,
        info: &MatchInfo,
        control: &MatchControl,
    ) -> Result<MatchStatus, MatchError> {
        let status = control.status();
        if control.is_destroyed() {
            return Err(MatchError::Destroyed { match_id: info.id });
        }
        if status != MatchStatus::Stopped {
            return Ok(status);
        }

        trace!(match_id = info.id, "match stopped, suspending agents");
        for agent in agents.iter_mut() {
            if let Err(e) = agent.pause() {
                warn!(match_id = info.id, agent = agent.id(), "could not suspend agent: {e}");
            }
        }
        if control.wait_while_stopped() {
            return Err(MatchError::Destroyed { match_id: info.id });
        }
        trace!(match_id = info.id, "match resumed");
        for agent in agents.iter_mut() {
            if let Err(e) = agent.resume() {
                warn!(match_id = info.id, agent = agent.id(), "could not resume agent: {e}");
            }
        }
        if let Some(watch) = &mut self.memory {
            watch.next_check = Instant::now() + options.memory.check_rate;
        }
        Ok(control.status())
    }

    fn check_memory(
        &mut self,
        agents: &mut [AgentProcess],
        options: &EngineOptions,
        info: &MatchInfo,
        now: Instant,
    ) {
        let Some(watch) = &mut self.memory else {
            return;
        };
        if now < watch.next_check {
            return;
        }
        watch.next_check = now + options.memory.check_rate;
        for (id, bytes) in watch.sample(agents) {
            if bytes <= options.memory.limit_bytes {
                continue;
            }
            if let Some(agent) = agents.iter_mut().find(|a| a.id() == id) {
                (options.memory.callback)(agent, info, options);
            }
        }
    }

    fn next_wake_up(&self, agents: &[AgentProcess]) -> Option<Instant> {
        let timers = agents
            .iter()
            .filter(|a| !a.is_terminated() && !a.move_complete)
            .filter_map(|a| a.timer.deadline());
        let memory = self.memory.as_ref().map(|w| w.next_check);
        timers.chain(memory).min()
    }
}

fn round_complete(agents: &[AgentProcess]) -> bool {
    agents.iter().all(|a| a.is_terminated() || a.move_complete)
}

fn dispatch(event: EngineEvent, agents: &mut [AgentProcess], options: &EngineOptions) {
    match event {
        EngineEvent::Line { agent, line } => {
            let Some(agent) = agents.iter_mut().find(|a| a.id() == agent) else {
                return;
            };
            if agent.is_terminated() {
                trace!(agent = agent.id(), "ignoring output of terminated agent");
            } else if agent.move_complete {
                agent.held_lines.push_back(line);
            } else {
                accept_line(agent, line, options);
            }
        }
        EngineEvent::Closed { agent } => {
            if let Some(agent) = agents.iter_mut().find(|a| a.id() == agent) {
                agent.on_stream_closed();
            }
        }
        EngineEvent::Wake => {}
    }
}

/// Applies the finish policy to one line of an agent's current move.
pub(crate) fn accept_line(agent: &mut AgentProcess, line: String, options: &EngineOptions) {
    if line.is_empty() {
        return;
    }
    let finished = match &options.finish_policy {
        FinishPolicy::FinishSymbol => {
            if line == options.finish_symbol {
                true
            } else {
                agent.move_lines.push(line);
                false
            }
        }
        FinishPolicy::LineCount { max } => {
            if line == options.finish_symbol {
                true
            } else {
                agent.move_lines.push(line);
                agent.move_lines.len() >= *max
            }
        }
        FinishPolicy::Custom(predicate) => {
            agent.move_lines.push(line);
            predicate.is_finished(&agent.move_lines)
        }
    };
    if finished {
        agent.move_complete = true;
        agent.timer.disarm();
    }
}

/// Splits every agent's move into commands. Empty tokens are dropped.
pub(crate) fn extract_commands(agents: &[AgentProcess], delimiter: &str) -> Vec<Command> {
    agents
        .iter()
        .flat_map(|agent| {
            agent.move_lines.iter().flat_map(move |line| {
                line.split(delimiter)
                    .filter(|token| !token.is_empty())
                    .map(move |token| Command {
                        agent_id: agent.id(),
                        text: token.to_owned(),
                    })
            })
        })
        .collect()
}
