//! Ladder matchmaking policies.

use rand::{
    rngs::StdRng,
    seq::{IndexedRandom, SliceRandom},
    Rng,
};

use super::{PlayerKey, QueuedMatch};

/// Picks who plays whom in a ladder.
pub trait Matchmaker: Send {
    /// Up to `count` new matches among `ranked` players (best first). Each match size is
    /// drawn from `agents_per_match`; sizes larger than the field are skipped.
    fn make_matches(
        &self,
        ranked: &[PlayerKey],
        agents_per_match: &[usize],
        count: usize,
        rng: &mut StdRng,
    ) -> Vec<QueuedMatch>;

    /// Width of the rank window, for policies that have one.
    fn range(&self) -> Option<usize> {
        None
    }

    /// Changes the rank window. Ignored by policies without one.
    fn set_range(&mut self, _range: usize) {}
}

/// Pairs a random player with opponents at most `range` places away in the rankings.
///
/// The window widens when it holds too few opponents. Seats are shuffled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankRangeMatchmaker {
    /// Maximum rank distance between opponents.
    pub range: usize,
}

impl Default for RankRangeMatchmaker {
    fn default() -> Self {
        Self { range: 4 }
    }
}

impl Matchmaker for RankRangeMatchmaker {
    fn make_matches(
        &self,
        ranked: &[PlayerKey],
        agents_per_match: &[usize],
        count: usize,
        rng: &mut StdRng,
    ) -> Vec<QueuedMatch> {
        let mut matches = vec![];
        for _ in 0..count {
            let Some(&size) = agents_per_match.choose(rng) else {
                break;
            };
            if size == 0 || size > ranked.len() {
                continue;
            }
            let anchor = rng.random_range(0..ranked.len());
            let mut range = self.range.max(1);
            loop {
                let low = anchor.saturating_sub(range);
                let high = (anchor + range + 1).min(ranked.len());
                let window: Vec<&PlayerKey> = (low..high)
                    .filter(|&i| i != anchor)
                    .map(|i| &ranked[i])
                    .collect();
                if window.len() + 1 >= size {
                    let mut players = vec![ranked[anchor].clone()];
                    players.extend(window.choose_multiple(rng, size - 1).map(|&key| key.clone()));
                    players.shuffle(rng);
                    matches.push(QueuedMatch::new(players));
                    break;
                }
                range *= 2;
            }
        }
        matches
    }

    fn range(&self) -> Option<usize> {
        Some(self.range)
    }

    fn set_range(&mut self, range: usize) {
        self.range = range;
    }
}

/// Draws opponents uniformly from the whole field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RandomMatchmaker;

impl Matchmaker for RandomMatchmaker {
    fn make_matches(
        &self,
        ranked: &[PlayerKey],
        agents_per_match: &[usize],
        count: usize,
        rng: &mut StdRng,
    ) -> Vec<QueuedMatch> {
        let mut matches = vec![];
        for _ in 0..count {
            let Some(&size) = agents_per_match.choose(rng) else {
                break;
            };
            if size == 0 || size > ranked.len() {
                continue;
            }
            let mut players: Vec<PlayerKey> = ranked.choose_multiple(rng, size).cloned().collect();
            players.shuffle(rng);
            matches.push(QueuedMatch::new(players));
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn field(n: usize) -> Vec<PlayerKey> {
        (0..n).map(|i| PlayerKey::new(format!("p{i}"))).collect()
    }

    fn index(key: &PlayerKey) -> usize {
        key.as_str()[1..].parse().unwrap()
    }

    #[test]
    fn opponents_stay_within_range() {
        let ranked = field(40);
        let mut rng = StdRng::seed_from_u64(7);
        let matchmaker = RankRangeMatchmaker { range: 3 };
        let matches = matchmaker.make_matches(&ranked, &[2], 200, &mut rng);
        assert_eq!(matches.len(), 200);
        for m in matches {
            assert_eq!(m.players.len(), 2);
            let (a, b) = (index(&m.players[0]), index(&m.players[1]));
            assert_ne!(a, b);
            assert!(a.abs_diff(b) <= 3, "{a} vs {b}");
        }
    }

    #[test]
    fn window_widens_for_large_matches() {
        let ranked = field(6);
        let mut rng = StdRng::seed_from_u64(1);
        let matchmaker = RankRangeMatchmaker { range: 1 };
        let matches = matchmaker.make_matches(&ranked, &[5], 10, &mut rng);
        assert_eq!(matches.len(), 10);
        for m in matches {
            let distinct: HashSet<_> = m.players.iter().collect();
            assert_eq!(distinct.len(), 5);
        }
    }

    #[test]
    fn too_small_field_yields_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(RankRangeMatchmaker::default()
            .make_matches(&field(1), &[2], 4, &mut rng)
            .is_empty());
        assert!(RandomMatchmaker
            .make_matches(&field(2), &[3], 4, &mut rng)
            .is_empty());
        assert!(RandomMatchmaker.make_matches(&field(2), &[], 4, &mut rng).is_empty());
    }

    #[test]
    fn same_seed_same_matches() {
        let ranked = field(10);
        let a = RandomMatchmaker.make_matches(&ranked, &[2, 3], 20, &mut StdRng::seed_from_u64(3));
        let b = RandomMatchmaker.make_matches(&ranked, &[2, 3], 20, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
