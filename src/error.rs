//! Error kinds surfaced by matches and tournaments.
//!
//! Callers can tell a deliberate teardown ([`MatchError::Destroyed`]) apart from a real failure,
//! and setup problems ([`MatchError::AgentSetup`]) apart from problems that happen mid-match.

use std::io;

use crate::agent::AgentId;
use crate::match_runner::MatchStatus;
use crate::tournament::PlayerKey;

/// Errors raised by an agent process, the match engine or a match.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// The agent source is missing, cannot be compiled, or its process cannot be started.
    /// Never retried.
    #[error("could not set up agent '{name}': {reason}")]
    AgentSetup {
        /// Display name of the agent.
        name: String,
        /// Human readable cause.
        reason: String,
    },

    /// The agent was already terminated when it was written to.
    #[error("agent {agent} is terminated")]
    AgentTerminated {
        /// Offending agent.
        agent: AgentId,
    },

    /// Writing to, or signalling, the agent process failed.
    #[error("i/o error on agent {agent}: {source}")]
    AgentIo {
        /// Offending agent.
        agent: AgentId,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The match was destroyed while it was running.
    #[error("match {match_id} was destroyed")]
    Destroyed {
        /// Destroyed match.
        match_id: u64,
    },

    /// A lifecycle method was called from a state that does not allow it.
    #[error("cannot {action} match {match_id} while it is {status:?}")]
    InvalidTransition {
        /// The attempted operation.
        action: &'static str,
        /// Match concerned.
        match_id: u64,
        /// Status at the time of the call.
        status: MatchStatus,
    },

    /// An agent broke the game protocol and the game logic decided to end the match.
    #[error("agent {agent} broke the protocol: {message}")]
    Protocol {
        /// Offending agent.
        agent: AgentId,
        /// What went wrong.
        message: String,
    },

    /// The game logic itself failed.
    #[error("game logic failed: {0:#}")]
    GameLogic(#[source] anyhow::Error),
}

impl MatchError {
    /// True for the error a destroyed match settles with.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, MatchError::Destroyed { .. })
    }
}

/// Errors raised while configuring or driving a tournament.
#[derive(Debug, thiserror::Error)]
pub enum TournamentError {
    /// A match could not be set up or run.
    #[error(transparent)]
    Match(#[from] MatchError),

    /// Two players were given the same elimination seed.
    #[error("seed {0} is used more than once")]
    DuplicateSeed(u32),

    /// A seed is outside `1..=player_count`.
    #[error("seed {seed} is out of range for {players} players")]
    SeedOutOfRange {
        /// The bad seed.
        seed: u32,
        /// Number of registered players.
        players: usize,
    },

    /// The rank system cannot rank matches of this format.
    #[error("rank system '{rank_system}' is not supported for {format}")]
    UnsupportedRankSystem {
        /// Name of the rank system.
        rank_system: &'static str,
        /// Tournament format or match layout.
        format: String,
    },

    /// No player is registered under this key.
    #[error("player '{0}' does not exist")]
    PlayerNotFound(PlayerKey),

    /// The operation is not allowed for this tournament format.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Inconsistent tournament configuration.
    #[error("invalid tournament configuration: {0}")]
    InvalidConfig(String),

    /// A rank update got an outcome it cannot interpret.
    #[error("rank update failed: {0}")]
    Rank(String),

    /// The persistence or storage collaborator failed.
    #[error("persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),
}
