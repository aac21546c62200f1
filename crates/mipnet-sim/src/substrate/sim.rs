//! In-memory substrate on a [`VirtualClock`].
//!
//! Records every call with the logical time it happened at, hands out fake
//! pids and tracks which of them are alive. Tests can make operations fail
//! and processes exit on their own.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tracing::debug;

use super::{ExecRequest, HostContext, Pid, Substrate, SubstrateError};
use crate::clock::{Clock, VirtualClock};
use crate::topology::{HostId, LinkParams, LinkState};

const FIRST_PID: Pid = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    CreateHost(HostId),
    CreateLink(HostId, HostId),
    SetLinkState(HostId, HostId, LinkState),
    Exec { host: HostId, argv: Vec<String> },
    Kill(Pid),
}

/// One substrate call as seen by the simulation.
#[derive(Debug, Clone)]
pub struct SimCall {
    pub at: Duration,
    pub op: SimOp,
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct SimProcess {
    pub host: HostId,
    pub argv: Vec<String>,
    pub title: String,
    pub alive: bool,
}

#[derive(Debug, Default)]
pub struct SimSubstrate {
    clock: VirtualClock,
    hosts: HashMap<HostId, HostContext>,
    links: HashMap<(HostId, HostId), LinkState>,
    processes: BTreeMap<Pid, SimProcess>,
    next_pid: Pid,
    calls: Vec<SimCall>,
    failing_exec: HashSet<HostId>,
    failing_links: HashSet<(HostId, HostId)>,
    failing_kills: HashSet<Pid>,
}

impl SimSubstrate {
    pub fn new() -> Self {
        Self::with_clock(VirtualClock::new())
    }

    /// Share `clock` with the scheduler so recorded call times line up
    /// with scenario waits.
    pub fn with_clock(clock: VirtualClock) -> Self {
        Self {
            clock,
            next_pid: FIRST_PID,
            ..Default::default()
        }
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn calls(&self) -> &[SimCall] {
        &self.calls
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn link_state(&self, a: &HostId, b: &HostId) -> Option<LinkState> {
        self.links.get(&pair(a, b)).copied()
    }

    pub fn process(&self, pid: Pid) -> Option<&SimProcess> {
        self.processes.get(&pid)
    }

    pub fn alive_pids(&self) -> Vec<Pid> {
        self.processes
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(&pid, _)| pid)
            .collect()
    }

    /// Make every `exec` on `host` fail until cleared.
    pub fn fail_exec_on(&mut self, host: impl Into<HostId>) {
        self.failing_exec.insert(host.into());
    }

    /// Make every `set_link_state` on the `a`-`b` link fail until cleared.
    pub fn fail_link_state(&mut self, a: impl Into<HostId>, b: impl Into<HostId>) {
        self.failing_links.insert(pair(&a.into(), &b.into()));
    }

    /// Make killing `pid` fail; the process stays alive.
    pub fn fail_kill(&mut self, pid: Pid) {
        self.failing_kills.insert(pid);
    }

    pub fn clear_failures(&mut self) {
        self.failing_exec.clear();
        self.failing_links.clear();
        self.failing_kills.clear();
    }

    /// Mark `pid` as having exited by itself.
    pub fn exit_process(&mut self, pid: Pid) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.alive = false;
        }
    }

    fn record(&mut self, op: SimOp, ok: bool) {
        debug!(at = ?self.clock.now(), ?op, ok, "sim substrate call");
        self.calls.push(SimCall {
            at: self.clock.now(),
            op,
            ok,
        });
    }

    fn ensure_host(&self, id: &HostId) -> Result<(), SubstrateError> {
        if self.hosts.contains_key(id) {
            Ok(())
        } else {
            Err(SubstrateError::UnknownHost(id.clone()))
        }
    }
}

impl Substrate for SimSubstrate {
    fn name(&self) -> &str {
        "sim"
    }

    fn create_host(&mut self, id: &HostId) -> Result<HostContext, SubstrateError> {
        let context = HostContext(format!("sim-{id}"));
        self.hosts.insert(id.clone(), context.clone());
        self.record(SimOp::CreateHost(id.clone()), true);
        Ok(context)
    }

    fn create_link(
        &mut self,
        a: &HostId,
        b: &HostId,
        _params: &LinkParams,
    ) -> Result<(), SubstrateError> {
        let result = self.ensure_host(a).and_then(|()| self.ensure_host(b));
        if result.is_ok() {
            self.links.insert(pair(a, b), LinkState::Up);
        }
        self.record(SimOp::CreateLink(a.clone(), b.clone()), result.is_ok());
        result
    }

    fn set_link_state(
        &mut self,
        a: &HostId,
        b: &HostId,
        state: LinkState,
    ) -> Result<(), SubstrateError> {
        let key = pair(a, b);
        let result = if self.failing_links.contains(&key) {
            Err(SubstrateError::rejected(
                format!("set link {a}-{b} {state}"),
                "injected failure",
            ))
        } else if let Some(current) = self.links.get_mut(&key) {
            *current = state;
            Ok(())
        } else {
            Err(SubstrateError::rejected(
                format!("set link {a}-{b} {state}"),
                "no such link",
            ))
        };
        self.record(
            SimOp::SetLinkState(a.clone(), b.clone(), state),
            result.is_ok(),
        );
        result
    }

    fn exec(&mut self, host: &HostId, request: &ExecRequest) -> Result<Pid, SubstrateError> {
        let op = SimOp::Exec {
            host: host.clone(),
            argv: request.argv.clone(),
        };
        if let Err(err) = self.ensure_host(host) {
            self.record(op, false);
            return Err(err);
        }
        if self.failing_exec.contains(host) || request.argv.is_empty() {
            self.record(op, false);
            return Err(SubstrateError::rejected(
                format!("exec on {host}"),
                "injected failure",
            ));
        }

        let pid = self.next_pid;
        self.next_pid += 1;
        self.processes.insert(
            pid,
            SimProcess {
                host: host.clone(),
                argv: request.argv.clone(),
                title: request.title.clone(),
                alive: true,
            },
        );
        self.record(op, true);
        Ok(pid)
    }

    fn signal_kill(&mut self, pid: Pid) -> Result<(), SubstrateError> {
        if self.failing_kills.contains(&pid) {
            self.record(SimOp::Kill(pid), false);
            return Err(SubstrateError::rejected(
                format!("kill {pid}"),
                "injected failure",
            ));
        }
        if let Some(process) = self.processes.get_mut(&pid) {
            process.alive = false;
        }
        self.record(SimOp::Kill(pid), true);
        Ok(())
    }

    fn is_alive(&mut self, pid: Pid) -> bool {
        self.processes.get(&pid).is_some_and(|p| p.alive)
    }
}

fn pair(a: &HostId, b: &HostId) -> (HostId, HostId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(argv: &[&str]) -> ExecRequest {
        ExecRequest {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            title: "test".into(),
            placement: None,
        }
    }

    #[test]
    fn exec_requires_known_host() {
        let mut sim = SimSubstrate::new();
        let err = sim.exec(&"A".into(), &request(&["true"])).unwrap_err();
        assert!(matches!(err, SubstrateError::UnknownHost(_)));
        assert!(!sim.calls()[0].ok);
    }

    #[test]
    fn killing_a_dead_process_succeeds() {
        let mut sim = SimSubstrate::new();
        sim.create_host(&"A".into()).unwrap();
        let pid = sim.exec(&"A".into(), &request(&["sleep", "1"])).unwrap();

        assert_eq!(sim.process(pid).map(|p| p.title.as_str()), Some("test"));
        sim.exit_process(pid);
        assert!(!sim.is_alive(pid));
        sim.signal_kill(pid).unwrap();
        sim.signal_kill(4242).unwrap();
    }

    #[test]
    fn calls_carry_logical_time() {
        let clock = VirtualClock::new();
        let mut sim = SimSubstrate::with_clock(clock.clone());
        sim.create_host(&"A".into()).unwrap();
        clock.advance(Duration::from_secs(3));
        sim.create_host(&"B".into()).unwrap();

        let times: Vec<_> = sim.calls().iter().map(|c| c.at).collect();
        assert_eq!(times, vec![Duration::ZERO, Duration::from_secs(3)]);
    }
}
