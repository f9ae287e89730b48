//! Per-match engine options: round protocol, timeout and memory budget.
//!
//! Options are built with chainable `with_*` methods, or read from the environment with
//! [`EngineOptions::from_env()`]:
//!
//! - `ARENA_ACTION_TIMEOUT_MS` (u64): per-round move timeout, `0` disables it
//! - `ARENA_AGENT_MEMORY_MB` (u64): memory limit per agent, `0` disables the watchdog
//! - `ARENA_MEMORY_CHECK_RATE_MS` (u64): memory sampling period
//! - `ARENA_COMMAND_DELIMITER` (string): separator between commands on one line

use std::{env, fmt, sync::Arc, time::Duration};

use tracing::error;

use crate::agent::AgentProcess;
use crate::match_runner::MatchInfo;

/// Added to the move timeout to absorb scheduling noise.
pub const TIMEOUT_BUFFER: Duration = Duration::from_millis(25);

/// Called when an agent breaks its timeout or memory budget.
pub type ViolationCallback = Arc<dyn Fn(&mut AgentProcess, &MatchInfo, &EngineOptions) + Send + Sync>;

/// Decides whether an agent's move is complete from the lines it sent this round.
pub trait MoveFinishPredicate: Send + Sync {
    /// `lines` holds every accepted line of the current move, including the last one.
    fn is_finished(&self, lines: &[String]) -> bool;
}

impl<F> MoveFinishPredicate for F
where
    F: Fn(&[String]) -> bool + Send + Sync,
{
    fn is_finished(&self, lines: &[String]) -> bool {
        self(lines)
    }
}

/// When an agent is done with its move for the round.
#[derive(Clone, Default)]
pub enum FinishPolicy {
    /// The move ends on a line equal to the finish symbol.
    #[default]
    FinishSymbol,
    /// The move ends after `max` lines, or earlier on the finish symbol.
    LineCount {
        /// Lines per move.
        max: usize,
    },
    /// The move ends when the predicate says so.
    Custom(Arc<dyn MoveFinishPredicate>),
}

impl fmt::Debug for FinishPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishPolicy::FinishSymbol => write!(f, "FinishSymbol"),
            FinishPolicy::LineCount { max } => write!(f, "LineCount({max})"),
            FinishPolicy::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Per-round move timeout.
#[derive(Clone)]
pub struct TimeoutOptions {
    /// Disabling removes every move timer.
    pub active: bool,
    /// Time an agent has to complete its move.
    pub max: Duration,
    /// Runs once per round when an agent misses the deadline.
    pub callback: ViolationCallback,
}

/// Periodic memory watchdog.
#[derive(Clone)]
pub struct MemoryOptions {
    /// Disabling removes the sampler.
    pub active: bool,
    /// Resident memory limit per agent.
    pub limit_bytes: u64,
    /// Sampling period.
    pub check_rate: Duration,
    /// Runs for each sample above the limit.
    pub callback: ViolationCallback,
}

/// Engine configuration, fixed for the duration of a match.
#[derive(Clone)]
pub struct EngineOptions {
    pub(crate) command_delimiter: String,
    pub(crate) finish_symbol: String,
    pub(crate) finish_policy: FinishPolicy,
    pub(crate) timeout: TimeoutOptions,
    pub(crate) memory: MemoryOptions,
}

fn terminate_on_timeout(agent: &mut AgentProcess, info: &MatchInfo, options: &EngineOptions) {
    error!(
        match_id = info.id,
        agent = agent.id(),
        "agent '{}' timed out after {}ms",
        agent.name(),
        options.timeout.max.as_millis()
    );
    agent.terminate();
}

fn terminate_on_memory(agent: &mut AgentProcess, info: &MatchInfo, options: &EngineOptions) {
    error!(
        match_id = info.id,
        agent = agent.id(),
        "agent '{}' exceeded the memory limit of {} bytes",
        agent.name(),
        options.memory.limit_bytes
    );
    agent.terminate();
}

impl EngineOptions {
    /// Default options: `,` delimiter, `D_FINISH` symbol, 1s timeout, 1 GiB sampled every 100ms.
    #[must_use]
    pub fn new() -> Self {
        Self {
            command_delimiter: ",".into(),
            finish_symbol: "D_FINISH".into(),
            finish_policy: FinishPolicy::FinishSymbol,
            timeout: TimeoutOptions {
                active: true,
                max: Duration::from_millis(1000),
                callback: Arc::new(terminate_on_timeout),
            },
            memory: MemoryOptions {
                active: true,
                limit_bytes: 1 << 30,
                check_rate: Duration::from_millis(100),
                callback: Arc::new(terminate_on_memory),
            },
        }
    }

    /// Defaults overridden by the environment variables listed in the module documentation.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_u64(var: &str) -> Option<u64> {
            env::var(var).ok()?.trim().parse().ok()
        }

        let mut options = Self::new();
        if let Some(ms) = parse_u64("ARENA_ACTION_TIMEOUT_MS") {
            options = if ms == 0 {
                options.without_timeout()
            } else {
                options.with_timeout(Duration::from_millis(ms))
            };
        }
        if let Some(mb) = parse_u64("ARENA_AGENT_MEMORY_MB") {
            options = if mb == 0 {
                options.without_memory_limit()
            } else {
                options.with_memory_limit(mb.saturating_mul(1024 * 1024))
            };
        }
        if let Some(ms) = parse_u64("ARENA_MEMORY_CHECK_RATE_MS") {
            options = options.with_memory_check_rate(Duration::from_millis(ms.max(1)));
        }
        if let Ok(delimiter) = env::var("ARENA_COMMAND_DELIMITER") {
            if !delimiter.is_empty() {
                options = options.with_command_delimiter(delimiter);
            }
        }
        options
    }

    /// Separator between several commands sent on one line.
    #[must_use]
    pub fn with_command_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.command_delimiter = delimiter.into();
        self
    }

    /// Line that ends a move.
    #[must_use]
    pub fn with_finish_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.finish_symbol = symbol.into();
        self
    }

    /// How a move ends.
    #[must_use]
    pub fn with_finish_policy(mut self, policy: FinishPolicy) -> Self {
        self.finish_policy = policy;
        self
    }

    /// Enables the move timeout with the given budget.
    #[must_use]
    pub fn with_timeout(mut self, max: Duration) -> Self {
        self.timeout.active = true;
        self.timeout.max = max;
        self
    }

    /// Removes every move timer.
    #[must_use]
    pub fn without_timeout(mut self) -> Self {
        self.timeout.active = false;
        self
    }

    /// Replaces the default timeout handling (terminate the agent).
    #[must_use]
    pub fn with_timeout_callback(mut self, callback: ViolationCallback) -> Self {
        self.timeout.callback = callback;
        self
    }

    /// Enables the memory watchdog with the given limit.
    #[must_use]
    pub fn with_memory_limit(mut self, limit_bytes: u64) -> Self {
        self.memory.active = true;
        self.memory.limit_bytes = limit_bytes;
        self
    }

    /// Removes the memory sampler.
    #[must_use]
    pub fn without_memory_limit(mut self) -> Self {
        self.memory.active = false;
        self
    }

    /// Memory sampling period.
    #[must_use]
    pub fn with_memory_check_rate(mut self, rate: Duration) -> Self {
        self.memory.check_rate = rate;
        self
    }

    /// Replaces the default memory handling (terminate the agent).
    #[must_use]
    pub fn with_memory_callback(mut self, callback: ViolationCallback) -> Self {
        self.memory.callback = callback;
        self
    }

    /// Separator between commands.
    pub fn command_delimiter(&self) -> &str {
        &self.command_delimiter
    }

    /// Line that ends a move.
    pub fn finish_symbol(&self) -> &str {
        &self.finish_symbol
    }

    /// Move completion policy.
    pub fn finish_policy(&self) -> &FinishPolicy {
        &self.finish_policy
    }

    /// Timeout settings.
    pub fn timeout(&self) -> &TimeoutOptions {
        &self.timeout
    }

    /// Memory watchdog settings.
    pub fn memory(&self) -> &MemoryOptions {
        &self.memory
    }

    /// Time budget armed at the start of every round, `None` when disabled.
    pub(crate) fn move_budget(&self) -> Option<Duration> {
        self.timeout.active.then(|| self.timeout.max + TIMEOUT_BUFFER)
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("command_delimiter", &self.command_delimiter)
            .field("finish_symbol", &self.finish_symbol)
            .field("finish_policy", &self.finish_policy)
            .field("timeout_active", &self.timeout.active)
            .field("timeout_max", &self.timeout.max)
            .field("memory_active", &self.memory.active)
            .field("memory_limit_bytes", &self.memory.limit_bytes)
            .field("memory_check_rate", &self.memory.check_rate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = EngineOptions::new();
        assert_eq!(options.command_delimiter(), ",");
        assert_eq!(options.finish_symbol(), "D_FINISH");
        assert!(matches!(options.finish_policy(), FinishPolicy::FinishSymbol));
        assert_eq!(options.move_budget(), Some(Duration::from_millis(1025)));
        assert!(options.memory().active);
        assert_eq!(options.memory().limit_bytes, 1024 * 1024 * 1024);
        assert_eq!(options.memory().check_rate, Duration::from_millis(100));
    }

    #[test]
    fn disabling_timeout_removes_budget() {
        let options = EngineOptions::new().without_timeout();
        assert_eq!(options.move_budget(), None);
        let options = options.with_timeout(Duration::from_millis(150));
        assert_eq!(options.move_budget(), Some(Duration::from_millis(175)));
    }

    #[test]
    fn huge_memory_limit_from_env_saturates() {
        env::set_var("ARENA_AGENT_MEMORY_MB", u64::MAX.to_string());
        let options = EngineOptions::from_env();
        env::remove_var("ARENA_AGENT_MEMORY_MB");
        assert!(options.memory().active);
        assert_eq!(options.memory().limit_bytes, u64::MAX);
    }

    #[test]
    fn closures_are_finish_predicates() {
        let policy = FinishPolicy::Custom(Arc::new(|lines: &[String]| lines.len() >= 2));
        let FinishPolicy::Custom(predicate) = &policy else {
            unreachable!()
        };
        assert!(!predicate.is_finished(&["a".into()]));
        assert!(predicate.is_finished(&["a".into(), "b".into()]));
        assert_eq!(format!("{policy:?}"), "Custom");
    }
}
