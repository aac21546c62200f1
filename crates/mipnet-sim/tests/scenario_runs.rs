//! End-to-end scenario runs against the simulated substrate.
//!
//! Time is virtual, so waits of tens of seconds finish instantly and the
//! substrate call log records exactly when each step happened.

use std::time::Duration;

use mipnet_sim::catalogue;
use mipnet_sim::substrate::sim::{SimOp, SimSubstrate};
use mipnet_sim::{
    Clock, HarnessConfig, HarnessError, HostId, LinkParams, LinkState, ProcessSupervisor,
    Scenario, ScenarioStep, Scheduler, Session, Topology, VirtualClock,
};

// ─── Helpers ────────────────────────────────────────────────────────

/// Route harness logs to the test output; `RUST_LOG` picks the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn chain(names: &[&str]) -> Topology {
    let mut topo = Topology::new("chain");
    for name in names {
        topo.add_host(*name).unwrap();
    }
    for pair in names.windows(2) {
        topo.add_link(pair[0], pair[1], LinkParams::default()).unwrap();
    }
    topo
}

fn sim_session(topology: Topology) -> (Session<SimSubstrate>, VirtualClock) {
    init_tracing();
    let clock = VirtualClock::new();
    let session = Session::new(
        HarnessConfig::default(),
        topology,
        SimSubstrate::with_clock(clock.clone()),
        clock.clone(),
    )
    .unwrap();
    (session, clock)
}

fn call_time(sim: &SimSubstrate, pred: impl Fn(&SimOp) -> bool) -> Duration {
    sim.calls()
        .iter()
        .find(|c| pred(&c.op))
        .map(|c| c.at)
        .expect("no matching substrate call")
}

fn id(s: &str) -> HostId {
    HostId::from(s)
}

// ─── Ordering ───────────────────────────────────────────────────────

#[test]
fn fault_happens_after_the_preceding_wait() {
    let (mut session, clock) = sim_session(chain(&["A", "B"]));
    let scenario = Scenario::builder("ordering")
        .spawn("A", "daemon", ["./mip_daemon", "usockA", "1"], None)
        .wait(Duration::from_secs(3))
        .link_down("A", "B")
        .build();

    let report = session.run_scenario(&scenario).unwrap();

    let sim = session.substrate();
    let spawned_at = call_time(sim, |op| matches!(op, SimOp::Exec { .. }));
    let fault_at = call_time(sim, |op| matches!(op, SimOp::SetLinkState(..)));
    assert!(fault_at >= spawned_at + Duration::from_secs(3));
    assert_eq!(report.elapsed(), Duration::from_secs(3));
    assert_eq!(clock.now(), Duration::from_secs(3));
}

#[test]
fn spawns_follow_declaration_order() {
    let (mut session, _clock) = sim_session(chain(&["A", "B", "C"]));
    let scenario = Scenario::builder("order")
        .spawn("C", "third-host-first", ["x"], None)
        .spawn("A", "then-a", ["y"], None)
        .spawn("B", "then-b", ["z"], None)
        .build();

    session.run_scenario(&scenario).unwrap();

    let hosts: Vec<&str> = session
        .substrate()
        .calls()
        .iter()
        .filter_map(|c| match &c.op {
            SimOp::Exec { host, .. } => Some(host.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(hosts, ["C", "A", "B"]);
}

// ─── Teardown ───────────────────────────────────────────────────────

/// A daemon on each of A, B and C, then a server on B, then a client on A.
#[test]
fn three_host_chain_tears_down_every_process() {
    let (mut session, _clock) = sim_session(chain(&["A", "B", "C"]));
    let scenario = Scenario::builder("chain")
        .spawn("A", "MIP A", ["./mip_daemon", "usockA", "1"], None)
        .spawn("B", "MIP B", ["./mip_daemon", "usockB", "2"], None)
        .spawn("C", "MIP C", ["./mip_daemon", "usockC", "3"], None)
        .wait(Duration::from_secs(1))
        .spawn("B", "server", ["./ping_server", "usockB"], None)
        .wait(Duration::from_secs(1))
        .spawn("A", "client", ["./ping_client", "2", "Hello IN3230", "usockA"], None)
        .build();

    let report = session.run_scenario(&scenario).unwrap();
    assert_eq!(report.spawned.len(), 5);
    assert_eq!(session.alive_count(), 5);

    let kill = session.shutdown().unwrap();
    assert_eq!(kill.signalled.len(), 5);
    assert!(kill.failed.is_empty());
    assert!(session.supervisor().is_empty());
    assert!(session.substrate().alive_pids().is_empty());

    let kills_before = session
        .substrate()
        .calls()
        .iter()
        .filter(|c| matches!(c.op, SimOp::Kill(_)))
        .count();
    assert!(session.shutdown().is_none());
    let kills_after = session
        .substrate()
        .calls()
        .iter()
        .filter(|c| matches!(c.op, SimOp::Kill(_)))
        .count();
    assert_eq!(kills_before, kills_after);
}

#[test]
fn kill_all_twice_is_a_no_op() {
    let clock = VirtualClock::new();
    let mut sim = SimSubstrate::with_clock(clock.clone());
    let mut topo = chain(&["A", "B"]);
    topo.instantiate(&mut sim).unwrap();
    let mut supervisor = ProcessSupervisor::new();

    let scenario = Scenario::builder("two")
        .spawn("A", "a", ["sleep", "60"], None)
        .spawn("B", "b", ["sleep", "60"], None)
        .build();
    Scheduler::new(clock)
        .run(&mut topo, &mut sim, &mut supervisor, &scenario)
        .unwrap();

    assert_eq!(supervisor.kill_all(&mut sim).total(), 2);
    let second = supervisor.kill_all(&mut sim);
    assert_eq!(second.total(), 0);
    assert_eq!(
        sim.calls()
            .iter()
            .filter(|c| matches!(c.op, SimOp::Kill(_)))
            .count(),
        2
    );
}

#[test]
fn failed_kills_do_not_stop_teardown() {
    let (mut session, _clock) = sim_session(chain(&["A", "B"]));
    let scenario = Scenario::builder("two")
        .spawn("A", "a", ["sleep", "60"], None)
        .spawn("B", "b", ["sleep", "60"], None)
        .build();
    let report = session.run_scenario(&scenario).unwrap();

    let first_pid = session
        .supervisor()
        .get(report.spawned[0])
        .map(|h| h.pid)
        .unwrap();
    session.substrate_mut().fail_kill(first_pid);

    let kill = session.shutdown().unwrap();
    assert_eq!(kill.signalled.len(), 1);
    assert_eq!(kill.failed.len(), 1);
    assert_eq!(kill.failed[0].0, report.spawned[0]);
    assert!(session.supervisor().is_empty());
}

// ─── Link faults ────────────────────────────────────────────────────

#[test]
fn h1_link_b_c_goes_down_and_comes_back() {
    let mut config = HarnessConfig::from_toml_str(
        "[timings.init_h1]\nfault_after_ms = 5000\nfault_duration_ms = 7000",
    )
    .unwrap();
    config.daemons.debug = false;
    let clock = VirtualClock::new();
    let mut session = Session::new(
        config,
        catalogue::topology("h1").unwrap(),
        SimSubstrate::with_clock(clock.clone()),
        clock,
    )
    .unwrap();

    let report = session.run_catalogue("init_h1").unwrap().unwrap();
    assert_eq!(report.spawned.len(), 13);

    let sim = session.substrate();
    let down_at = call_time(sim, |op| {
        matches!(op, SimOp::SetLinkState(_, _, LinkState::Down))
    });
    let up_at = call_time(sim, |op| matches!(op, SimOp::SetLinkState(_, _, LinkState::Up)));
    assert_eq!(up_at - down_at, Duration::from_millis(7000));

    assert_eq!(sim.link_state(&id("B"), &id("C")), Some(LinkState::Up));
    let topo = session.topology();
    assert_eq!(topo.link(&id("C"), &id("B")).unwrap().state, LinkState::Up);
    assert!(topo.links().iter().all(|l| l.state == LinkState::Up));
}

#[test]
fn h1_link_b_c_state_tracks_each_toggle() {
    let (mut session, _clock) = sim_session(catalogue::topology("h1").unwrap());
    let full = catalogue::scenario("init_h1", session.config()).unwrap();
    let (b, c) = (id("B"), id("C"));

    // Split right after the link goes down
    let split = full
        .steps()
        .iter()
        .position(|step| {
            matches!(
                step,
                ScenarioStep::SetLinkState {
                    state: LinkState::Down,
                    ..
                }
            )
        })
        .unwrap()
        + 1;
    let phase = |name: &str, steps: &[ScenarioStep]| {
        steps
            .iter()
            .cloned()
            .fold(Scenario::builder(name), |builder, step| builder.step(step))
            .build()
    };
    let until_down = phase("until_down", &full.steps()[..split]);
    let after_down = phase("after_down", &full.steps()[split..]);

    session.run_scenario(&until_down).unwrap();
    assert_eq!(session.topology().link(&b, &c).unwrap().state, LinkState::Down);
    assert_eq!(session.substrate().link_state(&b, &c), Some(LinkState::Down));
    assert!(session
        .topology()
        .links()
        .iter()
        .filter(|l| !l.connects(&b, &c))
        .all(|l| l.state == LinkState::Up));

    session.run_scenario(&after_down).unwrap();
    assert_eq!(session.topology().link(&b, &c).unwrap().state, LinkState::Up);
    assert_eq!(session.substrate().link_state(&b, &c), Some(LinkState::Up));
}

#[test]
fn manual_fault_is_visible_in_both_topology_and_substrate() {
    let (mut session, _clock) = sim_session(catalogue::topology("h1").unwrap());

    session
        .set_link_state(&id("B"), &id("C"), LinkState::Down)
        .unwrap();
    assert_eq!(
        session.topology().link(&id("B"), &id("C")).unwrap().state,
        LinkState::Down
    );
    assert_eq!(
        session.substrate().link_state(&id("B"), &id("C")),
        Some(LinkState::Down)
    );

    session.substrate_mut().fail_link_state("B", "C");
    let err = session
        .set_link_state(&id("B"), &id("C"), LinkState::Up)
        .unwrap_err();
    assert!(matches!(err, HarnessError::Substrate(_)));
    assert_eq!(
        session.topology().link(&id("B"), &id("C")).unwrap().state,
        LinkState::Down
    );

    session.substrate_mut().clear_failures();
    session
        .set_link_state(&id("C"), &id("B"), LinkState::Up)
        .unwrap();
    assert_eq!(
        session.substrate().link_state(&id("B"), &id("C")),
        Some(LinkState::Up)
    );
}

// ─── Failure paths ──────────────────────────────────────────────────

#[test]
fn scenario_on_the_wrong_topology_fails_up_front() {
    let (mut session, clock) = sim_session(catalogue::topology("oblig").unwrap());

    let err = session.run_catalogue("init_h1").unwrap().unwrap_err();
    assert!(matches!(err, HarnessError::UnknownHost(ref h) if h.as_str() == "D"));
    assert!(session.supervisor().is_empty());
    assert_eq!(clock.now(), Duration::ZERO);
}

#[test]
fn spawn_failure_mid_scenario_keeps_earlier_processes_for_teardown() {
    let (mut session, _clock) = sim_session(catalogue::topology("oblig").unwrap());
    session.substrate_mut().fail_exec_on("C");

    let err = session.run_catalogue("init_oblig").unwrap().unwrap_err();
    assert!(matches!(err, HarnessError::Spawn { ref host, .. } if host.as_str() == "C"));
    assert_eq!(session.supervisor().len(), 2);

    let kill = session.shutdown().unwrap();
    assert_eq!(kill.total(), 2);
    assert!(session.substrate().alive_pids().is_empty());
}
