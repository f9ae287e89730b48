//! Traits the caller implements to plug game rules into a match

use serde_json::Value;

use crate::engine::Command;
use crate::match_runner::{MatchContext, MatchStatus};

/// Rules of one match.
///
/// The match calls `initialize` once before the first round, `update` once per round with the
/// commands every agent sent, and `get_results` exactly once after `update` reported
/// [`MatchStatus::Finished`].
///
/// Game state may live in the implementor or in [`MatchContext::state_mut`]; the match never
/// looks inside either.
pub trait GameLogic: Send {
    /// Prepares the game and typically tells each agent who it is.
    fn initialize(&mut self, ctx: &mut MatchContext<'_>) -> anyhow::Result<()>;

    /// Applies one round of commands.
    ///
    /// Returns the next status; `None` keeps the match running. Return
    /// `Some(MatchStatus::Finished)` to end it.
    fn update(
        &mut self,
        ctx: &mut MatchContext<'_>,
        commands: &[Command],
    ) -> anyhow::Result<Option<MatchStatus>>;

    /// Final results, in whatever shape the result handler of a tournament expects.
    fn get_results(&mut self, ctx: &mut MatchContext<'_>) -> anyhow::Result<Value>;
}

/// Creates a fresh [`GameLogic`] for every match of a tournament.
pub trait GameFactory: Send + Sync {
    /// Returns a new, uninitialized game
    fn new_game(&self) -> Box<dyn GameLogic>;
}

impl<F> GameFactory for F
where
    F: Fn() -> Box<dyn GameLogic> + Send + Sync,
{
    fn new_game(&self) -> Box<dyn GameLogic> {
        self()
    }
}

#[cfg(test)]
mod interface_tests {
    use super::*;

    struct CountdownGame {
        rounds: u32,
    }

    impl GameLogic for CountdownGame {
        fn initialize(&mut self, _ctx: &mut MatchContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn update(
            &mut self,
            _ctx: &mut MatchContext<'_>,
            _commands: &[Command],
        ) -> anyhow::Result<Option<MatchStatus>> {
            self.rounds = self.rounds.saturating_sub(1);
            Ok((self.rounds == 0).then_some(MatchStatus::Finished))
        }

        fn get_results(&mut self, _ctx: &mut MatchContext<'_>) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn borrow_factory(factory: &dyn GameFactory) -> Box<dyn GameLogic> {
        factory.new_game()
    }

    #[test]
    fn closures_are_factories() {
        let factory = || Box::new(CountdownGame { rounds: 3 }) as Box<dyn GameLogic>;
        let _game = borrow_factory(&factory);
    }
}
