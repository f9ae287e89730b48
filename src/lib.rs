//! # Agent Arena
//!
//! Runs AI agents against each other and ranks them.
//!
//! It provides:
//! - A match engine driving agent processes over stdin/stdout, round by round (`Match`)
//! - Game rules plugged in through the [`GameLogic`](crate::game_interface::GameLogic) trait
//! - Tournament formats: [`Ladder`](crate::tournament::Ladder),
//!   [`Elimination`](crate::tournament::Elimination) and
//!   [`RoundRobin`](crate::tournament::RoundRobin)
//! - Rank systems: wins counting, ELO and TrueSkill
//!
//! Each agent runs as a separate OS process. Every round, the game sends messages to the agents,
//! then the engine collects commands from each of them until they print the finish symbol, run
//! out of time, or die. Per-move timeouts and memory limits are enforced by the engine.
//!
//! # Documentation Overview
//!
//! - For the match lifecycle and what game logic can do during a round, see [`match_runner`].
//! - For the round protocol, timeouts and memory limits, see
//!   [`EngineOptions`](crate::engine::EngineOptions).
//! - For running many matches and ranking agents, see [`tournament`] and [`rank_system`].
//! - For logging and agent stderr capture, see
//!   [`Configuration`](crate::configuration::Configuration).
//!
//! # Usage Example
//!
//! ```no_run
//! use agent_arena::prelude::*;
//! use serde_json::{json, Value};
//!
//! /// First agent to answer "stop" loses.
//! struct Chicken;
//!
//! impl GameLogic for Chicken {
//!     fn initialize(&mut self, ctx: &mut MatchContext<'_>) -> anyhow::Result<()> {
//!         ctx.send_all("go");
//!         Ok(())
//!     }
//!
//!     fn update(
//!         &mut self,
//!         ctx: &mut MatchContext<'_>,
//!         commands: &[Command],
//!     ) -> anyhow::Result<Option<MatchStatus>> {
//!         let losers: Vec<_> = commands
//!             .iter()
//!             .filter(|c| c.text == "stop")
//!             .map(|c| c.agent_id)
//!             .collect();
//!         if losers.is_empty() {
//!             ctx.send_all("go");
//!             return Ok(None);
//!         }
//!         *ctx.state_mut() = json!({ "losers": losers });
//!         Ok(Some(MatchStatus::Finished))
//!     }
//!
//!     fn get_results(&mut self, ctx: &mut MatchContext<'_>) -> anyhow::Result<Value> {
//!         let losers = ctx.state()["losers"].clone();
//!         let winners: Vec<_> = ctx
//!             .agent_ids()
//!             .into_iter()
//!             .filter(|id| !losers.as_array().is_some_and(|l| l.contains(&json!(id))))
//!             .collect();
//!         Ok(json!({ "winners": winners, "losers": losers }))
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let game = || Box::new(Chicken) as Box<dyn GameLogic>;
//!     let config = RoundRobin::config("chicken").with_max_concurrent_matches(4);
//!     let players = vec![
//!         PlayerEntry::local("agents/brave.py"),
//!         PlayerEntry::local("agents/careful.js"),
//!         PlayerEntry::local("agents/random.sh"),
//!     ];
//!     let tournament = RoundRobin::new(config, game, players, RoundRobin::DEFAULT_TIMES)?;
//!     for ranking in tournament.run()? {
//!         println!("{}. {} ({})", ranking.position, ranking.stat.player.name, ranking.score);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Agent Requirements
//!
//! - Agents read messages line by line on stdin
//! - Commands are written on stdout; several commands on one line are separated by the
//!   command delimiter (`,` by default)
//! - A move ends with a line holding only the finish symbol (`D_FINISH` by default)
//! - Anything written to stderr is ignored unless agent stderr capture is enabled
#![warn(missing_docs)]

pub use anyhow;
pub mod agent;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod game_interface;
mod logger;
pub mod match_runner;
pub mod observer;
pub mod persistence;
pub mod rank_system;
pub mod resolver;
pub mod storage;
pub mod tournament;

pub use logger::init_logger;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use agent_arena::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{AgentId, AgentSpec};
    pub use crate::configuration::Configuration;
    pub use crate::engine::{Command, EngineOptions, FinishPolicy};
    pub use crate::error::{MatchError, TournamentError};
    pub use crate::game_interface::{GameFactory, GameLogic};
    pub use crate::match_runner::{Match, MatchContext, MatchHandle, MatchStatus, ProtocolError};
    pub use crate::observer::{LifecycleEvent, LifecycleObserver, Observers};
    pub use crate::rank_system::{EloSystem, RankSystem, TrueSkillSystem, WinsSystem};
    pub use crate::tournament::{
        AgentSource, Elimination, EliminationOptions, Ladder, LadderOptions, MatchOutcome,
        PlayerEntry, PlayerKey, Ranking, RoundRobin, Tournament, TournamentConfig,
        TournamentStatus,
    };
}
