//! The fixed test catalogue: three topologies and the scenarios that run
//! on them.
//!
//! | scenario     | topology | exercises                                  |
//! |--------------|----------|--------------------------------------------|
//! | `init_oblig` | `oblig`  | MIP ping across a 3-host chain             |
//! | `init_h1`    | `h1`     | routing convergence around a failed link   |
//! | `init`       | `h2`     | reliable file transfer over a lossy chain  |
//!
//! Scenarios are plain [`Scenario`] values; adding one means adding a
//! builder function here, not touching the scheduler.

use std::time::Duration;

use crate::config::{DaemonPaths, HarnessConfig, ScenarioTimings};
use crate::scenario::{Scenario, ScenarioBuilder};
use crate::topology::{LinkParams, Topology};

pub const DEFAULT_TOPOLOGY: &str = "oblig";

pub const TOPOLOGIES: &[&str] = &["oblig", "h1", "h2"];

pub const SCENARIOS: &[&str] = &["init_oblig", "init_h1", "init"];

const BANDWIDTH_MBIT: f64 = 10.0;
const DELAY: Duration = Duration::from_millis(10);

/// Loss on the `h2` links, to give the transport layer something to recover from.
const H2_LOSS: f64 = 0.02;

fn params(loss: f64) -> LinkParams {
    LinkParams {
        bandwidth_mbit: BANDWIDTH_MBIT,
        delay: DELAY,
        loss,
    }
}

/// Build the catalogue topology `name`.
pub fn topology(name: &str) -> Option<Topology> {
    match name {
        "oblig" => build(name, &["A", "B", "C"], &[("A", "B"), ("B", "C")], 0.0),
        "h1" => build(
            name,
            &["A", "B", "C", "D", "E"],
            &[("A", "B"), ("B", "C"), ("B", "D"), ("C", "D"), ("D", "E")],
            0.0,
        ),
        "h2" => build(name, &["A", "B", "C"], &[("A", "B"), ("B", "C")], H2_LOSS),
        _ => None,
    }
}

fn build(name: &str, hosts: &[&str], links: &[(&str, &str)], loss: f64) -> Option<Topology> {
    let mut topo = Topology::new(name);
    for &host in hosts {
        topo.add_host(host).ok()?;
    }
    for &(a, b) in links {
        topo.add_link(a, b, params(loss)).ok()?;
    }
    Some(topo)
}

/// The topology a catalogue scenario was written for.
pub fn scenario_topology(scenario: &str) -> Option<&'static str> {
    match scenario {
        "init_oblig" => Some("oblig"),
        "init_h1" => Some("h1"),
        "init" => Some("h2"),
        _ => None,
    }
}

/// Build the catalogue scenario `name` with the configured binaries and
/// timings.
pub fn scenario(name: &str, config: &HarnessConfig) -> Option<Scenario> {
    let bins = &config.daemons;
    let timings = config.timings_for(name);
    match name {
        "init_oblig" => Some(init_oblig(bins, &timings)),
        "init_h1" => Some(init_h1(bins, &timings)),
        "init" => Some(init_h2(bins, &timings)),
        _ => None,
    }
}

/// `mip_daemon [-d] usock<H> <mip address>`
fn mip_daemon(bins: &DaemonPaths, host: &str, addr: u8) -> Vec<String> {
    let mut argv = vec![bins.binary("mip_daemon")];
    if bins.debug {
        argv.push("-d".into());
    }
    argv.push(usock(host));
    argv.push(addr.to_string());
    argv
}

/// `routing_daemon [-d] usock<H>`
fn routing_daemon(bins: &DaemonPaths, host: &str) -> Vec<String> {
    let mut argv = vec![bins.binary("routing_daemon")];
    if bins.debug {
        argv.push("-d".into());
    }
    argv.push(usock(host));
    argv
}

/// `ping_client <dest addr> <message> usock<H>`
fn ping_client(bins: &DaemonPaths, host: &str, dest: u8, message: &str) -> Vec<String> {
    vec![
        bins.binary("ping_client"),
        dest.to_string(),
        message.to_string(),
        usock(host),
    ]
}

fn usock(host: &str) -> String {
    format!("usock{host}")
}

fn init_oblig(bins: &DaemonPaths, t: &ScenarioTimings) -> Scenario {
    Scenario::builder("init_oblig")
        .description("MIP ping over the 3-host chain A-B-C")
        .spawn("A", "Host A", mip_daemon(bins, "A", 1), Some("80x20+0+0"))
        .spawn("B", "Host B", mip_daemon(bins, "B", 2), Some("80x20+550+0"))
        .spawn("C", "Host C", mip_daemon(bins, "C", 3), Some("80x20+1100+0"))
        .wait(t.daemon_ready)
        .spawn(
            "B",
            "Server [B]",
            [bins.binary("ping_server"), usock("B")],
            Some("80x20+550+300"),
        )
        .wait(t.stagger)
        .spawn(
            "A",
            "Client [A]",
            ping_client(bins, "A", 2, "Hello IN3230"),
            Some("80x20+0+300"),
        )
        .spawn(
            "C",
            "Client [C]",
            ping_client(bins, "C", 2, "Hello IN4230"),
            Some("80x20+0+600"),
        )
        .build()
}

fn with_mip_and_routing(
    builder: ScenarioBuilder,
    bins: &DaemonPaths,
    t: &ScenarioTimings,
    hosts: &[(&str, u8, &str, &str)],
) -> ScenarioBuilder {
    let builder = hosts.iter().fold(builder, |b, &(host, addr, mip_geo, _)| {
        b.spawn(host, format!("MIP {host}"), mip_daemon(bins, host, addr), Some(mip_geo))
    });
    hosts
        .iter()
        .fold(builder.wait(t.daemon_ready), |b, &(host, _, _, routing_geo)| {
            b.spawn(
                host,
                format!("ROUTING {host}"),
                routing_daemon(bins, host),
                Some(routing_geo),
            )
        })
        .wait(t.convergence)
}

fn init_h1(bins: &DaemonPaths, t: &ScenarioTimings) -> Scenario {
    let hosts = [
        ("A", 10, "80x14+0+0", "80x14+0+210"),
        ("B", 20, "80x14+0+450", "80x14+0+660"),
        ("C", 30, "80x14+555+0", "80x14+555+210"),
        ("D", 40, "80x14+1110+450", "80x14+1110+660"),
        ("E", 50, "80x14+1110+0", "80x14+1110+210"),
    ];

    let builder = Scenario::builder("init_h1")
        .description("Distance-vector convergence on 5 hosts with link B-C failing and recovering");
    with_mip_and_routing(builder, bins, t, &hosts)
        .spawn(
            "E",
            "SERVER [E]",
            [bins.binary("ping_server"), usock("E")],
            Some("38x20+807+583"),
        )
        .wait(t.stagger)
        .spawn(
            "A",
            "CLIENT [A]",
            ping_client(bins, "A", 50, "Hello from A"),
            Some("38x20+555+583"),
        )
        .wait(t.stagger)
        .spawn(
            "C",
            "CLIENT [C]",
            ping_client(bins, "C", 50, "Hello from C"),
            Some("38x20+555+583"),
        )
        .wait(t.fault_after)
        // Traffic from A must reroute while B-C is down
        .link_down("B", "C")
        .wait(t.fault_duration)
        .link_up("B", "C")
        .build()
}

fn init_h2(bins: &DaemonPaths, t: &ScenarioTimings) -> Scenario {
    let hosts = [
        ("A", 10, "80x14+0+0", "80x14+0+210"),
        ("B", 20, "80x14+555+0", "80x14+555+210"),
        ("C", 30, "80x14+1110+0", "80x14+1110+210"),
    ];

    let builder = Scenario::builder("init")
        .description("Reliable file transfer from A to C over routed, lossy links");
    with_mip_and_routing(builder, bins, t, &hosts)
        .spawn(
            "A",
            "TRANSPORT [A]",
            [bins.binary("transport_daemon"), usock("A"), "hostA_app".into()],
            Some("80x14+0+420"),
        )
        .spawn(
            "C",
            "TRANSPORT [C]",
            [bins.binary("transport_daemon"), usock("C"), "hostC_app".into()],
            Some("80x14+1110+420"),
        )
        .wait(t.stagger)
        .spawn(
            "C",
            "SERVER [C]",
            [bins.binary("transport_server"), "hostC_app".into(), "12".into()],
            Some("38x20+555+300"),
        )
        .wait(t.stagger)
        .spawn(
            "A",
            "CLIENT [A]",
            [
                bins.binary("transport_client"),
                "30".into(),
                "12".into(),
                "hostA_app".into(),
                "file.txt".into(),
            ],
            Some("38x20+555+583"),
        )
        .build()
}
