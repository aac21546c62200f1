//! Process supervisor: spawns processes inside hosts and guarantees none
//! outlive the harness.
//!
//! Every spawned process lands in the registry. [`ProcessSupervisor::kill_all`]
//! SIGKILLs all of them, alive or not, and never fails: a process that is
//! already gone counts as killed, and any other error is logged and
//! skipped so teardown always completes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::substrate::{ExecRequest, Pid, Placement, Substrate};
use crate::topology::HostId;

/// Registry key for a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A process the harness started.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: HandleId,
    pub pid: Pid,
    pub host: HostId,
    pub title: String,
    pub argv: Vec<String>,
    pub placement: Option<Placement>,
    /// Clock time at spawn.
    pub spawned_at: Duration,
}

/// Outcome of a [`ProcessSupervisor::kill_all`] pass.
#[derive(Debug, Default)]
pub struct KillReport {
    pub signalled: Vec<HandleId>,
    /// Processes whose kill failed, with the error text. They are dropped
    /// from the registry anyway.
    pub failed: Vec<(HandleId, String)>,
}

impl KillReport {
    pub fn total(&self) -> usize {
        self.signalled.len() + self.failed.len()
    }
}

#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    registry: BTreeMap<HandleId, ProcessHandle>,
    next_id: u64,
}

impl ProcessSupervisor {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `request` inside `host` and track it. The command line is never
    /// inspected. Failure leaves already-tracked processes alone.
    pub fn spawn(
        &mut self,
        substrate: &mut dyn Substrate,
        host: &HostId,
        request: ExecRequest,
        now: Duration,
    ) -> Result<&ProcessHandle> {
        let pid = substrate
            .exec(host, &request)
            .map_err(|source| HarnessError::Spawn {
                host: host.clone(),
                title: request.title.clone(),
                source,
            })?;

        let id = HandleId(self.next_id);
        self.next_id += 1;

        info!(
            handle = %id,
            pid,
            host = %host,
            title = %request.title,
            cmd = %request.command_line(),
            "spawned process"
        );

        let handle = ProcessHandle {
            id,
            pid,
            host: host.clone(),
            title: request.title,
            argv: request.argv,
            placement: request.placement,
            spawned_at: now,
        };
        Ok(self.registry.entry(id).or_insert(handle))
    }

    /// Kill every tracked process and empty the registry.
    pub fn kill_all(&mut self, substrate: &mut dyn Substrate) -> KillReport {
        let mut report = KillReport::default();
        if self.registry.is_empty() {
            return report;
        }

        for (id, handle) in std::mem::take(&mut self.registry) {
            match substrate.signal_kill(handle.pid) {
                Ok(()) => report.signalled.push(id),
                Err(e) => {
                    warn!(
                        handle = %id,
                        pid = handle.pid,
                        title = %handle.title,
                        error = %e,
                        "failed to kill process, skipping"
                    );
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            killed = report.signalled.len(),
            failed = report.failed.len(),
            "supervisor teardown complete"
        );
        report
    }

    /// Tracked processes in spawn order.
    pub fn tracked(&self) -> impl Iterator<Item = &ProcessHandle> {
        self.registry.values()
    }

    pub fn get(&self, id: HandleId) -> Option<&ProcessHandle> {
        self.registry.get(&id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// How many tracked processes the substrate still reports as running.
    pub fn alive_count(&self, substrate: &mut dyn Substrate) -> usize {
        self.registry
            .values()
            .filter(|h| substrate.is_alive(h.pid))
            .count()
    }
}
