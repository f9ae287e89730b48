use crate::games::{agent, init_as_file_logger, RockPaperScissors};

use agent_arena::agent::AgentProcess;
use agent_arena::engine::ViolationCallback;
use agent_arena::match_runner::MatchInfo;
use agent_arena::prelude::*;
use serde_json::{json, Value};
use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

mod games;

fn rps_match(rounds: u32, a: &str, b: &str) -> Match {
    Match::new(
        Box::new(RockPaperScissors::new(rounds)),
        vec![
            AgentSpec::new(agent(a)).with_name(a),
            AgentSpec::new(agent(b)).with_name(b),
        ],
    )
    .with_name(format!("{a} vs {b}"))
}

fn wait_for(handle: &MatchHandle, status: MatchStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.status() != status {
        assert!(Instant::now() < deadline, "match never reached {status:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn paper_covers_rock() {
    init_as_file_logger();

    let mut m = rps_match(3, "rock", "paper");
    let results = m.run().unwrap();
    assert_eq!(results["winners"], json!([1]));
    assert_eq!(results["points"], json!([0, 3]));
    assert_eq!(m.status(), MatchStatus::Finished);
    assert_eq!(m.results(), Some(&results));
}

#[test]
fn slow_agent_is_terminated_and_the_round_completes() {
    init_as_file_logger();

    let mut m = rps_match(1, "rock", "slow")
        .with_options(EngineOptions::new().with_timeout(Duration::from_millis(150)));
    let started = Instant::now();
    let results = m.run().unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(results["winners"], json!([0]));
    assert_eq!(results["losers"], json!([1]));
    assert!(m.agents()[1].is_terminated());
}

fn recorder() -> (Arc<Mutex<Vec<AgentId>>>, ViolationCallback) {
    let hits = Arc::new(Mutex::new(vec![]));
    let callback: ViolationCallback = {
        let hits = hits.clone();
        Arc::new(move |agent: &mut AgentProcess, _: &MatchInfo, _: &EngineOptions| {
            hits.lock().unwrap().push(agent.id());
        })
    };
    (hits, callback)
}

#[test]
fn move_timer_starts_with_the_first_round() {
    init_as_file_logger();

    let mut m = rps_match(1, "rock", "paper")
        .with_options(EngineOptions::new().with_timeout(Duration::from_millis(150)));
    m.initialize().unwrap();
    thread::sleep(Duration::from_millis(400));
    let results = m.run().unwrap();

    assert_eq!(results["winners"], json!([1]));
    assert_eq!(results["points"], json!([0, 1]));
}

#[test]
fn custom_timeout_callback_replaces_termination() {
    init_as_file_logger();

    let (hits, callback) = recorder();
    let mut m = rps_match(1, "rock", "silent").with_options(
        EngineOptions::new()
            .with_timeout(Duration::from_millis(100))
            .with_timeout_callback(callback)
            .without_memory_limit(),
    );
    let handle = m.handle();
    let runner = thread::spawn(move || m.run());

    // the callback leaves the silent agent alive, so the round never ends on its own
    let deadline = Instant::now() + Duration::from_secs(5);
    while hits.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "timeout callback never ran");
        thread::sleep(Duration::from_millis(10));
    }
    handle.destroy();
    assert!(matches!(runner.join().unwrap(), Err(MatchError::Destroyed { .. })));
    assert_eq!(hits.lock().unwrap().as_slice(), [1]);
}

#[test]
fn memory_watchdog_reports_agents_over_the_limit() {
    init_as_file_logger();

    let (hits, callback) = recorder();
    let mut m = rps_match(1, "rock", "silent").with_options(
        EngineOptions::new()
            .with_timeout(Duration::from_millis(300))
            .with_memory_limit(1)
            .with_memory_check_rate(Duration::from_millis(10))
            .with_memory_callback(callback),
    );
    let results = m.run().unwrap();

    assert_eq!(results["winners"], json!([0]));
    let hits = hits.lock().unwrap();
    assert!(hits.contains(&1), "silent agent never sampled: {hits:?}");
}

#[test]
fn disabled_memory_watchdog_never_samples() {
    init_as_file_logger();

    let (hits, callback) = recorder();
    let mut m = rps_match(1, "rock", "silent").with_options(
        EngineOptions::new()
            .with_timeout(Duration::from_millis(300))
            .with_memory_limit(1)
            .with_memory_check_rate(Duration::from_millis(10))
            .with_memory_callback(callback)
            .without_memory_limit(),
    );
    let results = m.run().unwrap();

    assert_eq!(results["winners"], json!([0]));
    assert!(hits.lock().unwrap().is_empty());
}

#[test]
fn stopping_and_resuming_keeps_the_results() {
    init_as_file_logger();

    let reference = rps_match(10, "scissors", "thinker").run().unwrap();
    assert_eq!(reference["points"], json!([10, 0]));

    let mut m = rps_match(10, "scissors", "thinker");
    let handle = m.handle();
    let runner = thread::spawn(move || m.run());

    wait_for(&handle, MatchStatus::Running);
    handle.stop().unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(handle.status(), MatchStatus::Stopped);
    handle.resume().unwrap();

    let results: Value = runner.join().unwrap().unwrap();
    assert_eq!(results, reference);
    assert_eq!(handle.status(), MatchStatus::Finished);
}

#[test]
fn out_of_state_stop_is_rejected() {
    let m = rps_match(1, "rock", "paper");
    assert!(matches!(
        m.handle().stop(),
        Err(MatchError::InvalidTransition { action: "stop", .. })
    ));
    assert!(m.handle().resume().is_err());
}

#[test]
fn destroy_ends_a_blocked_round() {
    init_as_file_logger();

    let mut m = rps_match(1, "rock", "silent").with_options(EngineOptions::new().without_timeout());
    let handle = m.handle();
    let runner = thread::spawn(move || m.run());

    wait_for(&handle, MatchStatus::Running);
    thread::sleep(Duration::from_millis(100));
    handle.destroy();
    handle.destroy();

    let result = runner.join().unwrap();
    assert!(matches!(result, Err(MatchError::Destroyed { .. })));
    assert!(handle.is_destroyed());
}

#[test]
fn missing_agent_fails_setup() {
    let mut m = Match::new(
        Box::new(RockPaperScissors::new(1)),
        vec![
            AgentSpec::new(agent("rock")),
            AgentSpec::new(agent("does_not_exist")),
        ],
    );
    assert!(matches!(m.run(), Err(MatchError::AgentSetup { .. })));
}
