use std::{cmp::Ordering, path::PathBuf};

use agent_arena::prelude::*;
use serde_json::{json, Value};
use time::format_description;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn agent(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/agents")
        .join(format!("{name}.sh"))
}

pub fn init_as_file_logger() {
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_timer(timer)
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hand {
    Rock,
    Paper,
    Scissors,
}

impl Hand {
    fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "R" => Some(Hand::Rock),
            "P" => Some(Hand::Paper),
            "S" => Some(Hand::Scissors),
            _ => None,
        }
    }

    fn beats(self, other: Hand) -> bool {
        matches!(
            (self, other),
            (Hand::Rock, Hand::Scissors) | (Hand::Paper, Hand::Rock) | (Hand::Scissors, Hand::Paper)
        )
    }
}

/// Two agents, `rounds` hands. An agent that does not play loses the hand.
pub struct RockPaperScissors {
    rounds: u32,
    played: u32,
    points: [u32; 2],
}

impl RockPaperScissors {
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds,
            played: 0,
            points: [0; 2],
        }
    }

    pub fn factory(rounds: u32) -> impl GameFactory + 'static {
        move || Box::new(RockPaperScissors::new(rounds)) as Box<dyn GameLogic>
    }
}

impl GameLogic for RockPaperScissors {
    fn initialize(&mut self, ctx: &mut MatchContext<'_>) -> anyhow::Result<()> {
        ctx.send_all("play");
        Ok(())
    }

    fn update(
        &mut self,
        ctx: &mut MatchContext<'_>,
        commands: &[Command],
    ) -> anyhow::Result<Option<MatchStatus>> {
        let hand = |agent: AgentId| {
            commands
                .iter()
                .rev()
                .filter(|c| c.agent_id == agent)
                .find_map(|c| Hand::parse(&c.text))
        };
        match (hand(0), hand(1)) {
            (Some(a), Some(b)) if a.beats(b) => self.points[0] += 1,
            (Some(a), Some(b)) if b.beats(a) => self.points[1] += 1,
            (Some(_), None) => self.points[0] += 1,
            (None, Some(_)) => self.points[1] += 1,
            _ => {}
        }

        self.played += 1;
        if self.played >= self.rounds {
            return Ok(Some(MatchStatus::Finished));
        }
        ctx.send_all("play");
        Ok(None)
    }

    fn get_results(&mut self, _ctx: &mut MatchContext<'_>) -> anyhow::Result<Value> {
        Ok(match self.points[0].cmp(&self.points[1]) {
            Ordering::Greater => json!({ "winners": [0], "losers": [1], "points": self.points }),
            Ordering::Less => json!({ "winners": [1], "losers": [0], "points": self.points }),
            Ordering::Equal => json!({ "ties": [0, 1], "points": self.points }),
        })
    }
}
