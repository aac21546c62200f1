//! The session a control surface drives, and the table of named commands
//! it exposes.
//!
//! A [`Session`] owns one instantiated topology, its substrate, the
//! process supervisor and the scheduler. All mutation goes through
//! `&mut Session`, so a scenario and shutdown can never overlap.
//!
//! The [`CommandRegistry`] maps command names to callbacks taking the
//! session and the raw argument text. [`CommandRegistry::with_defaults`]
//! registers one command per catalogue scenario plus the shell built-ins.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;
use tracing::{info, warn};

use crate::catalogue;
use crate::clock::Clock;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::fault::{self, Transition};
use crate::scenario::{RunReport, Scenario, Scheduler};
use crate::substrate::Substrate;
use crate::supervisor::{KillReport, ProcessHandle, ProcessSupervisor};
use crate::topology::{HostId, LinkState, Topology};

pub struct Session<S: Substrate> {
    config: HarnessConfig,
    topology: Topology,
    substrate: S,
    supervisor: ProcessSupervisor,
    scheduler: Scheduler,
    shut_down: bool,
}

impl<S: Substrate> Session<S> {
    /// Instantiate `topology` on `substrate` and start with an empty
    /// process registry.
    pub fn new(
        config: HarnessConfig,
        mut topology: Topology,
        mut substrate: S,
        clock: impl Clock + 'static,
    ) -> Result<Self> {
        topology.instantiate(&mut substrate)?;
        info!(
            topology = %topology.name(),
            substrate = substrate.name(),
            "session ready"
        );
        Ok(Self {
            config,
            topology,
            substrate,
            supervisor: ProcessSupervisor::new(),
            scheduler: Scheduler::new(clock),
            shut_down: false,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn substrate_mut(&mut self) -> &mut S {
        &mut self.substrate
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn run_scenario(&mut self, scenario: &Scenario) -> Result<RunReport> {
        self.ensure_open()?;
        self.scheduler.run(
            &mut self.topology,
            &mut self.substrate,
            &mut self.supervisor,
            scenario,
        )
    }

    /// Run the catalogue scenario `name`, or `None` if there is no such
    /// scenario.
    pub fn run_catalogue(&mut self, name: &str) -> Option<Result<RunReport>> {
        let scenario = catalogue::scenario(name, &self.config)?;
        if let Some(expected) = catalogue::scenario_topology(name) {
            if expected != self.topology.name() {
                warn!(
                    scenario = name,
                    expected,
                    actual = %self.topology.name(),
                    "scenario was written for another topology"
                );
            }
        }
        Some(self.run_scenario(&scenario))
    }

    pub fn set_link_state(&mut self, a: &HostId, b: &HostId, state: LinkState) -> Result<Transition> {
        self.ensure_open()?;
        fault::set_link_state(&mut self.topology, &mut self.substrate, a, b, state)
    }

    /// Tracked processes with whether each is still running.
    pub fn process_status(&mut self) -> Vec<(ProcessHandle, bool)> {
        let handles: Vec<ProcessHandle> = self.supervisor.tracked().cloned().collect();
        handles
            .into_iter()
            .map(|h| {
                let alive = self.substrate.is_alive(h.pid);
                (h, alive)
            })
            .collect()
    }

    pub fn alive_count(&mut self) -> usize {
        self.supervisor.alive_count(&mut self.substrate)
    }

    /// Kill every tracked process. Only the first call does anything;
    /// later calls return `None`.
    pub fn shutdown(&mut self) -> Option<KillReport> {
        if self.shut_down {
            return None;
        }
        self.shut_down = true;
        info!("shutting down session");
        Some(self.supervisor.kill_all(&mut self.substrate))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shut_down {
            return Err(HarnessError::SessionClosed);
        }
        Ok(())
    }
}

impl<S: Substrate> Drop for Session<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// What the control surface should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Continue(String),
    Exit(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

pub type CommandResult = std::result::Result<CommandOutcome, CommandError>;

type Handler<S> = Box<dyn FnMut(&mut Session<S>, &str) -> CommandResult>;

struct Command<S: Substrate> {
    help: String,
    handler: Handler<S>,
}

/// Name → callback table for the interactive surface.
pub struct CommandRegistry<S: Substrate> {
    commands: BTreeMap<String, Command<S>>,
}

const LINK_USAGE: &str = "link <host> <host> up|down";

impl<S: Substrate> CommandRegistry<S> {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// Catalogue scenarios, shutdown (`EOF`, `exit`, `quit`), `status` and
    /// `link`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        for &name in catalogue::SCENARIOS {
            let help = match catalogue::scenario_topology(name) {
                Some(topo) => format!("run scenario '{name}' (topology {topo})"),
                None => format!("run scenario '{name}'"),
            };
            registry.register(name, help, move |session, _line| {
                let report = session
                    .run_catalogue(name)
                    .ok_or_else(|| CommandError::Unknown(name.to_string()))??;
                Ok(CommandOutcome::Continue(format!(
                    "{}: {} steps, {} processes started",
                    report.scenario,
                    report.steps_executed,
                    report.spawned.len()
                )))
            });
        }

        for name in ["EOF", "exit", "quit"] {
            registry.register(name, "kill all spawned processes and exit", |session, _| {
                let message = match session.shutdown() {
                    Some(report) => format!(
                        "killed {} processes ({} failed)",
                        report.total(),
                        report.failed.len()
                    ),
                    None => "already shut down".to_string(),
                };
                Ok(CommandOutcome::Exit(message))
            });
        }

        registry.register("status", "list spawned processes and link states", |session, _| {
            Ok(CommandOutcome::Continue(status_report(session)))
        });

        registry.register("link", LINK_USAGE, |session, args| {
            let parts: Vec<&str> = args.split_whitespace().collect();
            let [a, b, state] = parts.as_slice() else {
                return Err(CommandError::Usage(LINK_USAGE));
            };
            let state: LinkState = state.parse().map_err(|_| CommandError::Usage(LINK_USAGE))?;
            let outcome = session.set_link_state(&HostId::from(*a), &HostId::from(*b), state)?;
            Ok(CommandOutcome::Continue(match outcome {
                Transition::Changed { from, to } => format!("link {a}-{b}: {from} -> {to}"),
                Transition::Unchanged(s) => format!("link {a}-{b} already {s}"),
            }))
        });

        registry
    }

    /// Add or replace the command `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, help: impl Into<String>, handler: F)
    where
        F: FnMut(&mut Session<S>, &str) -> CommandResult + 'static,
    {
        self.commands.insert(
            name.into(),
            Command {
                help: help.into(),
                handler: Box::new(handler),
            },
        );
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Run one input line: the first word picks the command, the rest is
    /// passed through as its argument text.
    pub fn dispatch(&mut self, session: &mut Session<S>, line: &str) -> CommandResult {
        let line = line.trim();
        if line.is_empty() {
            return Ok(CommandOutcome::Continue(String::new()));
        }
        let (name, args) = match line.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (line, ""),
        };

        if name == "help" || name == "?" {
            return Ok(CommandOutcome::Continue(self.help()));
        }

        let command = self
            .commands
            .get_mut(name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        (command.handler)(session, args)
    }

    pub fn help(&self) -> String {
        let width = self.commands.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::from("commands:\n");
        for (name, cmd) in &self.commands {
            let _ = writeln!(out, "  {name:<width$}  {}", cmd.help);
        }
        let _ = write!(out, "  {:<width$}  show this list", "help");
        out
    }
}

impl<S: Substrate> Default for CommandRegistry<S> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn status_report<S: Substrate>(session: &mut Session<S>) -> String {
    let mut out = String::new();
    let processes = session.process_status();
    let _ = writeln!(out, "processes ({}):", processes.len());
    for (handle, alive) in &processes {
        let _ = writeln!(
            out,
            "  {} pid {} on {} [{}] {}",
            handle.id,
            handle.pid,
            handle.host,
            if *alive { "running" } else { "exited" },
            handle.title
        );
    }
    let _ = write!(out, "links ({}):", session.topology().links().len());
    for link in session.topology().links() {
        let _ = write!(out, "\n  {}-{} {}", link.a, link.b, link.state);
    }
    out
}
