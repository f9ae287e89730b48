use crate::games::{agent, init_as_file_logger, RockPaperScissors};

use agent_arena::prelude::*;
use agent_arena::tournament::TieBreak;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

mod games;

fn short_moves() -> EngineOptions {
    EngineOptions::new()
        .with_timeout(Duration::from_millis(500))
        .without_memory_limit()
}

#[test]
fn round_robin_ranks_paper_over_rock() {
    init_as_file_logger();

    let config = RoundRobin::config("rr-rps").with_engine_options(short_moves());
    let players = vec![PlayerEntry::local(agent("rock")), PlayerEntry::local(agent("paper"))];
    let tournament = RoundRobin::new(config, RockPaperScissors::factory(3), players, 1).unwrap();

    let rankings = tournament.run().unwrap();
    assert_eq!(tournament.status(), TournamentStatus::Finished);
    assert_eq!(tournament.total_matches(), 1);

    assert_eq!(rankings[0].position, 1);
    assert_eq!(rankings[0].stat.player.name, "paper");
    assert_eq!((rankings[0].stat.wins, rankings[0].stat.losses), (1, 0));
    assert_eq!(rankings[1].stat.player.name, "rock");
    assert_eq!((rankings[1].stat.wins, rankings[1].stat.losses), (0, 1));
}

#[test]
fn elimination_plays_a_four_player_bracket() {
    init_as_file_logger();

    let config = Elimination::config("knockout")
        .with_engine_options(short_moves())
        .with_max_concurrent_matches(2)
        .with_past_results(10);
    let players = vec![
        PlayerEntry::local(agent("rock")),
        PlayerEntry::local(agent("paper")),
        PlayerEntry::local(agent("scissors")),
        PlayerEntry::local(agent("rock")).with_name("rock2"),
    ];
    let options = EliminationOptions::default()
        .with_seeds(vec![Some(1), Some(2), Some(3), Some(4)])
        .with_tie_break(TieBreak::BetterSeed);
    let tournament = Elimination::new(config, RockPaperScissors::factory(1), players, options).unwrap();

    let rankings = tournament.run().unwrap();
    assert_eq!(tournament.total_matches(), 3);

    let mut labels: Vec<String> = tournament
        .past_results()
        .into_iter()
        .filter_map(|record| record.label)
        .collect();
    labels.sort();
    assert_eq!(labels, ["1,2", "1,4", "2,3"]);

    // rock draws rock2 and advances on seed, scissors beats paper, rock beats scissors
    let position: HashMap<String, u32> = rankings
        .iter()
        .map(|r| (r.stat.player.name.clone(), r.position))
        .collect();
    assert_eq!(position["rock"], 1);
    assert_eq!(position["scissors"], 2);
    assert_eq!(position["paper"], 3);
    assert_eq!(position["rock2"], 3);

    assert!(matches!(
        tournament.add_player(PlayerEntry::local(agent("rock"))),
        Err(TournamentError::NotSupported(_))
    ));
}

#[test]
fn ladder_respects_the_concurrency_cap() {
    init_as_file_logger();

    let max_live = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    let observer = {
        let (max_live, started) = (max_live.clone(), started.clone());
        move |event: &LifecycleEvent| {
            if let LifecycleEvent::MatchStarted { live, .. } = event {
                max_live.fetch_max(*live, Ordering::SeqCst);
                started.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    let config = TournamentConfig::new("ladder-elo", EloSystem::default())
        .with_engine_options(short_moves())
        .with_max_concurrent_matches(1)
        .with_max_total_matches(6)
        .with_seed(42)
        .with_observers(Observers::new().with(Arc::new(observer)));
    let players = vec![
        PlayerEntry::local(agent("rock")),
        PlayerEntry::local(agent("paper")),
        PlayerEntry::local(agent("scissors")),
    ];
    let ladder = Ladder::new(
        config,
        RockPaperScissors::factory(1),
        players,
        LadderOptions::default(),
    )
    .unwrap();

    ladder.start().unwrap();
    assert!(ladder.wait_timeout(Duration::from_secs(60)));

    assert_eq!(ladder.status(), TournamentStatus::Finished);
    assert_eq!(ladder.total_matches(), 6);
    assert_eq!(started.load(Ordering::SeqCst), 6);
    assert_eq!(max_live.load(Ordering::SeqCst), 1);

    let played: u64 = ladder
        .rankings()
        .iter()
        .map(|r| r.stat.matches_played)
        .sum();
    assert_eq!(played, 12);
}

#[test]
fn destroyed_ladder_stops_scheduling() {
    init_as_file_logger();

    let config = TournamentConfig::new("ladder-destroyed", EloSystem::default())
        .with_engine_options(EngineOptions::new().without_timeout().without_memory_limit())
        .with_max_concurrent_matches(2);
    let players = vec![
        PlayerEntry::local(agent("silent")),
        PlayerEntry::local(agent("silent")).with_name("silent2"),
    ];
    let ladder = Ladder::new(config, RockPaperScissors::factory(1), players, LadderOptions::default())
        .unwrap();

    ladder.start().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    ladder.destroy();
    ladder.destroy();

    assert!(ladder.wait_timeout(Duration::from_secs(10)));
    assert_eq!(ladder.status(), TournamentStatus::Finished);
    assert_eq!(ladder.queue_len(), 0);
    assert!(ladder.start().is_err());
}
