//! Scenarios and the scheduler that runs them.
//!
//! A [`Scenario`] is a flat, ordered list of steps: spawn a process, wait,
//! or flip a link. The [`Scheduler`] executes them one at a time on the
//! caller's thread, so step N's effect is visible before step N+1 starts.
//! Spawned processes run on their own; the only synchronisation with them
//! is the scenario's explicit waits.

use std::time::Duration;

use tracing::{error, info, info_span};

use crate::clock::Clock;
use crate::error::Result;
use crate::fault::set_link_state;
use crate::substrate::{ExecRequest, Placement, Substrate};
use crate::supervisor::{HandleId, ProcessSupervisor};
use crate::topology::{HostId, LinkState, Topology};

/// Start a process inside a host.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnStep {
    pub host: HostId,
    pub title: String,
    pub argv: Vec<String>,
    pub placement: Option<Placement>,
}

impl SpawnStep {
    fn request(&self) -> ExecRequest {
        ExecRequest {
            argv: self.argv.clone(),
            title: self.title.clone(),
            placement: self.placement.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioStep {
    Spawn(SpawnStep),
    Wait(Duration),
    SetLinkState {
        a: HostId,
        b: HostId,
        state: LinkState,
    },
}

/// A named, immutable step sequence.
#[derive(Debug, Clone)]
pub struct Scenario {
    name: String,
    description: String,
    steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn builder(name: impl Into<String>) -> ScenarioBuilder {
        ScenarioBuilder {
            scenario: Scenario {
                name: name.into(),
                description: String::new(),
                steps: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn steps(&self) -> &[ScenarioStep] {
        &self.steps
    }

    /// Sum of all waits: the minimum wall time a run takes.
    pub fn total_wait(&self) -> Duration {
        self.steps
            .iter()
            .filter_map(|s| match s {
                ScenarioStep::Wait(d) => Some(*d),
                _ => None,
            })
            .sum()
    }
}

pub struct ScenarioBuilder {
    scenario: Scenario,
}

impl ScenarioBuilder {
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.scenario.description = text.into();
        self
    }

    pub fn step(mut self, step: ScenarioStep) -> Self {
        self.scenario.steps.push(step);
        self
    }

    pub fn spawn<I, S>(
        self,
        host: impl Into<HostId>,
        title: impl Into<String>,
        argv: I,
        geometry: Option<&str>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step(ScenarioStep::Spawn(SpawnStep {
            host: host.into(),
            title: title.into(),
            argv: argv.into_iter().map(Into::into).collect(),
            placement: geometry.map(|g| Placement {
                geometry: g.to_string(),
            }),
        }))
    }

    pub fn wait(self, duration: Duration) -> Self {
        self.step(ScenarioStep::Wait(duration))
    }

    pub fn link_down(self, a: impl Into<HostId>, b: impl Into<HostId>) -> Self {
        self.set_link(a, b, LinkState::Down)
    }

    pub fn link_up(self, a: impl Into<HostId>, b: impl Into<HostId>) -> Self {
        self.set_link(a, b, LinkState::Up)
    }

    fn set_link(self, a: impl Into<HostId>, b: impl Into<HostId>, state: LinkState) -> Self {
        self.step(ScenarioStep::SetLinkState {
            a: a.into(),
            b: b.into(),
            state,
        })
    }

    pub fn build(self) -> Scenario {
        self.scenario
    }
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub scenario: String,
    pub steps_executed: usize,
    pub spawned: Vec<HandleId>,
    pub started_at: Duration,
    pub finished_at: Duration,
}

impl RunReport {
    pub fn elapsed(&self) -> Duration {
        self.finished_at.saturating_sub(self.started_at)
    }
}

/// Sequential, single-threaded scenario executor.
pub struct Scheduler {
    clock: Box<dyn Clock>,
}

impl Scheduler {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Run `scenario` against an instantiated topology.
    ///
    /// Host names are checked before the first step. The first failing
    /// step aborts the rest; processes spawned so far stay registered with
    /// `supervisor` until it is told to tear down.
    pub fn run(
        &mut self,
        topology: &mut Topology,
        substrate: &mut dyn Substrate,
        supervisor: &mut ProcessSupervisor,
        scenario: &Scenario,
    ) -> Result<RunReport> {
        let span = info_span!("scenario", name = %scenario.name());
        let _enter = span.enter();

        topology.validate_scenario(scenario)?;

        let started_at = self.clock.now();
        let mut spawned = Vec::new();
        info!(
            topology = %topology.name(),
            steps = scenario.steps().len(),
            "scenario started"
        );

        for (idx, step) in scenario.steps().iter().enumerate() {
            if let Err(e) = self.execute(topology, substrate, supervisor, step, &mut spawned) {
                error!(step = idx, ?step, error = %e, "scenario aborted");
                return Err(e);
            }
        }

        let report = RunReport {
            scenario: scenario.name().to_string(),
            steps_executed: scenario.steps().len(),
            spawned,
            started_at,
            finished_at: self.clock.now(),
        };
        info!(
            spawned = report.spawned.len(),
            elapsed_ms = report.elapsed().as_millis() as u64,
            "scenario completed"
        );
        Ok(report)
    }

    fn execute(
        &mut self,
        topology: &mut Topology,
        substrate: &mut dyn Substrate,
        supervisor: &mut ProcessSupervisor,
        step: &ScenarioStep,
        spawned: &mut Vec<HandleId>,
    ) -> Result<()> {
        match step {
            ScenarioStep::Spawn(spawn) => {
                let now = self.clock.now();
                let handle = supervisor.spawn(substrate, &spawn.host, spawn.request(), now)?;
                spawned.push(handle.id);
            }
            ScenarioStep::Wait(duration) => {
                info!(wait_ms = duration.as_millis() as u64, "waiting");
                self.clock.sleep(*duration);
            }
            ScenarioStep::SetLinkState { a, b, state } => {
                set_link_state(topology, substrate, a, b, *state)?;
            }
        }
        Ok(())
    }
}
