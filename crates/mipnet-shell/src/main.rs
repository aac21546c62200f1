//! mipnet shell
//!
//! Builds one of the catalogue topologies on an emulation substrate and
//! drops into a command prompt where each catalogue scenario is a
//! command.
//!
//! - `--substrate netns` (default) uses Linux network namespaces and
//!   needs root or passwordless sudo
//! - `--substrate sim` runs everything against the in-process simulator
//!   on virtual time
//! - `--run <scenario>` runs one scenario, tears down, and exits

mod shell;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use mipnet_sim::catalogue;
use mipnet_sim::substrate::netns::NetnsSubstrate;
use mipnet_sim::substrate::sim::SimSubstrate;
use mipnet_sim::{
    CommandOutcome, CommandRegistry, HarnessConfig, Session, Substrate, SystemClock, VirtualClock,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SubstrateKind {
    Netns,
    Sim,
}

/// Scenario shell for MIP daemon testing.
#[derive(Parser, Debug)]
#[command(name = "mipnet-shell", about = "Run MIP test scenarios on an emulated network")]
struct Cli {
    /// Harness configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Catalogue topology to build (overrides the config file).
    #[arg(long)]
    topology: Option<String>,

    /// Directory holding the daemon binaries.
    #[arg(long)]
    bin_dir: Option<PathBuf>,

    /// Emulation backend.
    #[arg(long, value_enum, default_value_t = SubstrateKind::Netns)]
    substrate: SubstrateKind,

    /// Run this scenario, tear down, and exit instead of prompting.
    #[arg(long)]
    run: Option<String>,

    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let topology = catalogue::topology(&config.topology)
        .with_context(|| format!("unknown topology '{}'", config.topology))?;

    tracing::info!(
        topology = %config.topology,
        substrate = ?cli.substrate,
        bin_dir = %config.daemons.bin_dir.display(),
        "mipnet-shell starting"
    );

    let mut session: Session<Box<dyn Substrate>> = match cli.substrate {
        SubstrateKind::Netns => {
            let substrate: Box<dyn Substrate> = Box::new(NetnsSubstrate::new(config.netns.clone()));
            Session::new(config, topology, substrate, SystemClock::new())
        }
        SubstrateKind::Sim => {
            let clock = VirtualClock::new();
            let substrate: Box<dyn Substrate> = Box::new(SimSubstrate::with_clock(clock.clone()));
            Session::new(config, topology, substrate, clock)
        }
    }
    .context("failed to build topology")?;

    let mut registry = CommandRegistry::with_defaults();

    if let Some(scenario) = cli.run.as_deref() {
        let result = registry.dispatch(&mut session, scenario);
        if let Some(report) = session.shutdown() {
            tracing::info!(killed = report.total(), "teardown complete");
        }
        return match result {
            Ok(CommandOutcome::Continue(msg)) | Ok(CommandOutcome::Exit(msg)) => {
                println!("{msg}");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("scenario '{scenario}' failed")),
        };
    }

    shell::run(&mut session, &mut registry)
}

fn load_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    if let Some(name) = &cli.topology {
        config.set_topology(name)?;
    }
    if let Some(dir) = &cli.bin_dir {
        config.daemons.bin_dir = dir.clone();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_netns() {
        let cli = Cli::try_parse_from(["mipnet-shell"]).unwrap();
        assert_eq!(cli.substrate, SubstrateKind::Netns);
        assert!(cli.run.is_none());
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cli = Cli::try_parse_from([
            "mipnet-shell",
            "--substrate",
            "sim",
            "--topology",
            "h1",
            "--bin-dir",
            "/opt/mip/bin",
            "--run",
            "init_h1",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.topology, "h1");
        assert_eq!(config.daemons.bin_dir, PathBuf::from("/opt/mip/bin"));
        assert_eq!(cli.run.as_deref(), Some("init_h1"));
    }

    #[test]
    fn unknown_topology_is_rejected() {
        let cli = Cli::try_parse_from(["mipnet-shell", "--topology", "ring"]).unwrap();
        assert!(load_config(&cli).is_err());
    }
}
