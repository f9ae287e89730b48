use std::{
    collections::{HashMap, HashSet},
    mem,
    ops::Deref,
};

use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use tracing::{debug, info, warn};

use super::{
    MatchRecord, PlayerEntry, PlayerKey, QueuedMatch, Ranking, RoundContext, Tournament,
    TournamentConfig, TournamentStrategy,
};
use crate::error::TournamentError;
use crate::game_interface::GameFactory;
use crate::rank_system::{RankSystem, WinsState, WinsSystem};

/// How a match between two players with the same relative rank is decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// The better (lower) seed advances.
    #[default]
    BetterSeed,
    /// A fair coin drawn from the tournament's random generator, reproducible with a seed.
    CoinFlip,
}

/// Seeding and tie-break of an [`Elimination`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EliminationOptions {
    /// Seed of each player, in the order players are given. Unseeded players get the free
    /// seeds at random.
    pub seeds: Vec<Option<u32>>,
    /// Tie-break policy.
    pub tie_break: TieBreak,
}

impl EliminationOptions {
    /// Explicit seeds.
    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<Option<u32>>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Tie-break policy.
    #[must_use]
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }
}

/// Single bracket knockout.
///
/// The bracket has the next power of two slots; missing opponents are byes. Each round, slot
/// `i` meets slot `size - i + 1`, so seed 1 meets the lowest seed first. Losers leave and are
/// placed by the round they lost in.
pub struct Elimination {
    tournament: Tournament<WinsSystem>,
}

impl Elimination {
    /// Default configuration: a win is worth 3 points, ties and losses nothing.
    pub fn config(id: impl Into<String>) -> TournamentConfig<WinsSystem> {
        TournamentConfig::new(id, WinsSystem::new(3.0, 0.0, 0.0))
    }

    /// Validates the seeds and registers `players`. Players cannot change afterwards.
    pub fn new(
        config: TournamentConfig<WinsSystem>,
        game: impl GameFactory + 'static,
        players: Vec<PlayerEntry>,
        options: EliminationOptions,
    ) -> Result<Self, TournamentError> {
        if config.agents_per_match != [2] {
            return Err(TournamentError::UnsupportedRankSystem {
                rank_system: WinsSystem::NAME,
                format: format!(
                    "elimination with {:?} agents per match",
                    config.agents_per_match
                ),
            });
        }
        check_seeds(&options.seeds, players.len())?;

        let tournament = Tournament::new(config, game, Box::new(Bracket::new(options)))?;
        for entry in players {
            tournament.register(entry)?;
        }
        Ok(Self { tournament })
    }

    /// Starts the tournament, blocks until the champion is known and returns the rankings.
    pub fn run(&self) -> Result<Vec<Ranking<WinsState>>, TournamentError> {
        self.tournament.start()?;
        self.tournament.wait();
        Ok(self.tournament.rankings())
    }

    /// Placement of every eliminated player, and of the champion once known.
    pub fn placements(&self) -> HashMap<PlayerKey, u32> {
        self.tournament
            .with_strategy(|s| s.placements())
            .unwrap_or_default()
    }
}

impl Deref for Elimination {
    type Target = Tournament<WinsSystem>;

    fn deref(&self) -> &Self::Target {
        &self.tournament
    }
}

fn check_seeds(seeds: &[Option<u32>], players: usize) -> Result<(), TournamentError> {
    if seeds.len() > players {
        return Err(TournamentError::InvalidConfig(format!(
            "{} seeds given for {players} players",
            seeds.len()
        )));
    }
    let mut seen = HashSet::new();
    for &seed in seeds.iter().flatten() {
        if seed == 0 || seed as usize > players {
            return Err(TournamentError::SeedOutOfRange { seed, players });
        }
        if !seen.insert(seed) {
            return Err(TournamentError::DuplicateSeed(seed));
        }
    }
    Ok(())
}

struct Pairing {
    slot: usize,
    label: String,
    a: PlayerKey,
    b: PlayerKey,
}

pub(crate) struct Bracket {
    seeds: Vec<Option<u32>>,
    tie_break: TieBreak,
    started: bool,
    /// Players still in, by slot; the length is the current round size.
    slots: Vec<Option<PlayerKey>>,
    /// Next round's slots, byes already filled in.
    next_slots: Vec<Option<PlayerKey>>,
    pairings: Vec<Pairing>,
    seed_of: HashMap<PlayerKey, u32>,
    placements: HashMap<PlayerKey, u32>,
}

impl Bracket {
    pub(crate) fn new(options: EliminationOptions) -> Self {
        Self {
            seeds: options.seeds,
            tie_break: options.tie_break,
            started: false,
            slots: vec![],
            next_slots: vec![],
            pairings: vec![],
            seed_of: HashMap::new(),
            placements: HashMap::new(),
        }
    }

    fn seed_players(&mut self, registered: &[PlayerKey], rng: &mut StdRng) {
        let n = registered.len();
        let mut by_seed: Vec<Option<PlayerKey>> = vec![None; n];
        let mut unseeded = vec![];
        for (i, key) in registered.iter().enumerate() {
            match self.seeds.get(i).copied().flatten() {
                Some(seed) if seed >= 1 && seed as usize <= n && by_seed[seed as usize - 1].is_none() => {
                    by_seed[seed as usize - 1] = Some(key.clone());
                }
                _ => unseeded.push(key.clone()),
            }
        }
        unseeded.shuffle(rng);
        let mut unseeded = unseeded.into_iter();
        for slot in by_seed.iter_mut().filter(|slot| slot.is_none()) {
            *slot = unseeded.next();
        }

        by_seed.resize(n.next_power_of_two(), None);
        for (i, key) in by_seed.iter().enumerate() {
            if let Some(key) = key {
                self.seed_of.insert(key.clone(), i as u32 + 1);
            }
        }
        info!(players = n, slots = by_seed.len(), "bracket seeded");
        self.slots = by_seed;
    }

    fn better_seed_is_a(&self, a: &PlayerKey, b: &PlayerKey) -> bool {
        let seed = |key: &PlayerKey| self.seed_of.get(key).copied().unwrap_or(u32::MAX);
        seed(a) <= seed(b)
    }

    fn break_tie(&self, pairing: &Pairing, rng: &mut StdRng) -> bool {
        let a_wins = match self.tie_break {
            TieBreak::BetterSeed => self.better_seed_is_a(&pairing.a, &pairing.b),
            TieBreak::CoinFlip => rng.random_bool(0.5),
        };
        info!(
            pairing = %pairing.label,
            policy = ?self.tie_break,
            "tie between {} and {}",
            pairing.a,
            pairing.b
        );
        a_wins
    }

    /// Applies the results of the round that just ended.
    fn settle_round(&mut self, results: &[MatchRecord], enabled: &[PlayerKey], rng: &mut StdRng) {
        let loser_place = (self.slots.len() / 2 + 1) as u32;
        let mut next = mem::take(&mut self.next_slots);

        for pairing in mem::take(&mut self.pairings) {
            let ranks = results
                .iter()
                .find(|r| {
                    r.label.as_deref() == Some(pairing.label.as_str())
                        && r.players.contains(&pairing.a)
                        && r.players.contains(&pairing.b)
                })
                .and_then(|r| Some((r.rank_of(&pairing.a)?, r.rank_of(&pairing.b)?)));

            let a_wins = match ranks {
                Some((a, b)) if a != b => a < b,
                Some(_) => self.break_tie(&pairing, rng),
                None => {
                    warn!(pairing = %pairing.label, "no result for {} vs {}, advancing the better seed", pairing.a, pairing.b);
                    let (a_in, b_in) = (enabled.contains(&pairing.a), enabled.contains(&pairing.b));
                    if a_in != b_in {
                        a_in
                    } else {
                        self.better_seed_is_a(&pairing.a, &pairing.b)
                    }
                }
            };

            let (winner, loser) = if a_wins {
                (pairing.a, pairing.b)
            } else {
                (pairing.b, pairing.a)
            };
            debug!(pairing = %pairing.label, "{winner} eliminates {loser}");
            self.placements.insert(loser, loser_place);
            next[pairing.slot] = Some(winner);
        }
        self.slots = next;
    }

    /// Queues the next round, skipping rounds made only of byes.
    fn next_round(&mut self) -> Vec<QueuedMatch> {
        loop {
            if self.slots.len() <= 1 {
                if let Some(Some(champion)) = self.slots.first() {
                    info!(%champion, "champion");
                    self.placements.insert(champion.clone(), 1);
                }
                return vec![];
            }

            let size = self.slots.len();
            let mut advanced: Vec<Option<PlayerKey>> = vec![None; size / 2];
            let mut queued = vec![];
            for i in 0..size / 2 {
                let j = size - 1 - i;
                match (self.slots[i].clone(), self.slots[j].clone()) {
                    (Some(a), Some(b)) => {
                        let label = format!("{},{}", i + 1, j + 1);
                        queued.push(
                            QueuedMatch::new(vec![a.clone(), b.clone()]).with_label(label.clone()),
                        );
                        self.pairings.push(Pairing {
                            slot: i,
                            label,
                            a,
                            b,
                        });
                    }
                    (Some(a), None) | (None, Some(a)) => {
                        debug!(player = %a, "bye");
                        advanced[i] = Some(a);
                    }
                    (None, None) => {}
                }
            }

            if queued.is_empty() {
                self.slots = advanced;
                continue;
            }
            info!(size, matches = queued.len(), "elimination round");
            self.next_slots = advanced;
            return queued;
        }
    }
}

impl TournamentStrategy for Bracket {
    fn advance_round(&mut self, ctx: RoundContext<'_>) -> Vec<QueuedMatch> {
        if self.started {
            self.settle_round(&ctx.results, &ctx.players, ctx.rng);
        } else {
            self.started = true;
            self.seed_players(ctx.registered, ctx.rng);
        }
        self.next_round()
    }

    fn allows_player_changes(&self) -> bool {
        false
    }

    fn placements(&self) -> Option<HashMap<PlayerKey, u32>> {
        Some(self.placements.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use serde_json::Value;

    fn keys(n: usize) -> Vec<PlayerKey> {
        (1..=n).map(|i| PlayerKey::new(format!("s{i}"))).collect()
    }

    fn seeded(n: usize) -> EliminationOptions {
        EliminationOptions::default().with_seeds((1..=n as u32).map(Some).collect())
    }

    fn advance(
        bracket: &mut Bracket,
        players: &[PlayerKey],
        results: Vec<MatchRecord>,
        rng: &mut StdRng,
    ) -> Vec<QueuedMatch> {
        bracket.advance_round(RoundContext {
            results,
            registered: players,
            players: players.to_vec(),
            ranked: players.to_vec(),
            agents_per_match: &[2],
            wanted: 0,
            rng,
        })
    }

    /// The first seat wins when `first_wins`, ties when `None`.
    fn play(m: &QueuedMatch, first_wins: Option<bool>) -> MatchRecord {
        let ranks = match first_wins {
            Some(true) => vec![1, 2],
            Some(false) => vec![2, 1],
            None => vec![1, 1],
        };
        MatchRecord {
            match_id: 0,
            label: m.label.clone(),
            players: m.players.clone(),
            ranks,
            results: Value::Null,
        }
    }

    fn labels(round: &[QueuedMatch]) -> Vec<&str> {
        round.iter().filter_map(|m| m.label.as_deref()).collect()
    }

    #[test]
    fn four_seeded_players_play_three_matches() {
        let players = keys(4);
        let mut rng = StdRng::seed_from_u64(0);
        let mut bracket = Bracket::new(seeded(4));

        let round1 = advance(&mut bracket, &players, vec![], &mut rng);
        assert_eq!(labels(&round1), ["1,4", "2,3"]);
        assert_eq!(round1[0].players, [players[0].clone(), players[3].clone()]);
        assert_eq!(round1[1].players, [players[1].clone(), players[2].clone()]);

        // seed 1 wins, seed 3 upsets seed 2
        let results = vec![play(&round1[0], Some(true)), play(&round1[1], Some(false))];
        let round2 = advance(&mut bracket, &players, results, &mut rng);
        assert_eq!(labels(&round2), ["1,2"]);
        assert_eq!(round2[0].players, [players[0].clone(), players[2].clone()]);

        let results = vec![play(&round2[0], Some(false))];
        assert!(advance(&mut bracket, &players, results, &mut rng).is_empty());

        let placements = bracket.placements().unwrap();
        assert_eq!(placements[&players[2]], 1);
        assert_eq!(placements[&players[0]], 2);
        assert_eq!(placements[&players[1]], 3);
        assert_eq!(placements[&players[3]], 3);
    }

    #[test]
    fn top_seed_gets_the_bye() {
        let players = keys(3);
        let mut rng = StdRng::seed_from_u64(0);
        let mut bracket = Bracket::new(seeded(3));

        let round1 = advance(&mut bracket, &players, vec![], &mut rng);
        assert_eq!(labels(&round1), ["2,3"]);
        let results = vec![play(&round1[0], Some(true))];
        let round2 = advance(&mut bracket, &players, results, &mut rng);
        assert_eq!(round2[0].players, [players[0].clone(), players[1].clone()]);
    }

    #[test]
    fn ties_go_to_the_better_seed() {
        let players = keys(2);
        let mut rng = StdRng::seed_from_u64(0);
        let mut bracket = Bracket::new(seeded(2).with_seeds(vec![Some(2), Some(1)]));

        let round1 = advance(&mut bracket, &players, vec![], &mut rng);
        assert_eq!(round1[0].players, [players[1].clone(), players[0].clone()]);
        let results = vec![play(&round1[0], None)];
        advance(&mut bracket, &players, results, &mut rng);
        assert_eq!(bracket.placements().unwrap()[&players[1]], 1);
    }

    #[test]
    fn missing_result_advances_the_better_seed() {
        let players = keys(2);
        let mut rng = StdRng::seed_from_u64(0);
        let mut bracket = Bracket::new(seeded(2));
        advance(&mut bracket, &players, vec![], &mut rng);
        assert!(advance(&mut bracket, &players, vec![], &mut rng).is_empty());
        assert_eq!(bracket.placements().unwrap()[&players[0]], 1);
    }

    #[test]
    fn random_seeding_is_reproducible() {
        let players = keys(8);
        let first = advance(
            &mut Bracket::new(EliminationOptions::default()),
            &players,
            vec![],
            &mut StdRng::seed_from_u64(9),
        );
        let second = advance(
            &mut Bracket::new(EliminationOptions::default()),
            &players,
            vec![],
            &mut StdRng::seed_from_u64(9),
        );
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn seeds_are_validated() {
        assert!(matches!(
            check_seeds(&[Some(1), Some(1)], 2),
            Err(TournamentError::DuplicateSeed(1))
        ));
        assert!(matches!(
            check_seeds(&[Some(5), None], 4),
            Err(TournamentError::SeedOutOfRange { seed: 5, players: 4 })
        ));
        assert!(check_seeds(&[Some(0)], 4).is_err());
        assert!(check_seeds(&[None, Some(2)], 4).is_ok());
    }
}
