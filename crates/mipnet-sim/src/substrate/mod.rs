//! Emulation substrate: the capability set the harness needs from whatever
//! provides virtual hosts, links and in-host process execution.
//!
//! - [`netns`]: Linux network namespaces, veth pairs and `tc netem`
//! - [`sim`]: In-memory substrate on a virtual clock, for deterministic tests

pub mod netns;
pub mod sim;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::topology::{HostId, LinkParams, LinkState};

/// Substrate-side handle for a host, e.g. a namespace name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostContext(pub String);

impl fmt::Display for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operating-system process id of a spawned process.
pub type Pid = u32;

/// Presentation hint for where a process' window goes, e.g. `80x20+0+300`.
/// Carries no functional meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub geometry: String,
}

/// A command to run inside a host.
///
/// `argv` is passed through untouched: the daemon's positional argument
/// contract is its own business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub title: String,
    pub placement: Option<Placement>,
}

impl ExecRequest {
    /// Space-joined argv, quoting arguments that contain whitespace.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| {
                if arg.chars().any(char::is_whitespace) || arg.is_empty() {
                    format!("\"{arg}\"")
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The substrate ran the operation and it failed.
    #[error("{op} rejected: {detail}")]
    Rejected { op: String, detail: String },
    /// The operation could not be attempted at all.
    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: io::Error,
    },
    #[error("substrate has no host '{0}'")]
    UnknownHost(HostId),
}

impl SubstrateError {
    pub fn rejected(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Rejected {
            op: op.into(),
            detail: detail.into(),
        }
    }

    pub fn io(op: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            op: op.into(),
            source,
        }
    }
}

/// What the harness requires of an emulation backend.
///
/// Host and link identities are the topology's own ids; the substrate maps
/// them onto whatever it uses internally.
pub trait Substrate {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn create_host(&mut self, id: &HostId) -> Result<HostContext, SubstrateError>;

    fn create_link(
        &mut self,
        a: &HostId,
        b: &HostId,
        params: &LinkParams,
    ) -> Result<(), SubstrateError>;

    fn set_link_state(
        &mut self,
        a: &HostId,
        b: &HostId,
        state: LinkState,
    ) -> Result<(), SubstrateError>;

    /// Start `request` inside `host` and return its pid. Does not wait.
    fn exec(&mut self, host: &HostId, request: &ExecRequest) -> Result<Pid, SubstrateError>;

    /// Forcefully terminate a process. A process that is already gone is
    /// not an error.
    fn signal_kill(&mut self, pid: Pid) -> Result<(), SubstrateError>;

    fn is_alive(&mut self, pid: Pid) -> bool;
}

impl<S: Substrate + ?Sized> Substrate for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn create_host(&mut self, id: &HostId) -> Result<HostContext, SubstrateError> {
        (**self).create_host(id)
    }

    fn create_link(
        &mut self,
        a: &HostId,
        b: &HostId,
        params: &LinkParams,
    ) -> Result<(), SubstrateError> {
        (**self).create_link(a, b, params)
    }

    fn set_link_state(
        &mut self,
        a: &HostId,
        b: &HostId,
        state: LinkState,
    ) -> Result<(), SubstrateError> {
        (**self).set_link_state(a, b, state)
    }

    fn exec(&mut self, host: &HostId, request: &ExecRequest) -> Result<Pid, SubstrateError> {
        (**self).exec(host, request)
    }

    fn signal_kill(&mut self, pid: Pid) -> Result<(), SubstrateError> {
        (**self).signal_kill(pid)
    }

    fn is_alive(&mut self, pid: Pid) -> bool {
        (**self).is_alive(pid)
    }
}

impl<S: Substrate + ?Sized> Substrate for &mut S {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn create_host(&mut self, id: &HostId) -> Result<HostContext, SubstrateError> {
        (**self).create_host(id)
    }

    fn create_link(
        &mut self,
        a: &HostId,
        b: &HostId,
        params: &LinkParams,
    ) -> Result<(), SubstrateError> {
        (**self).create_link(a, b, params)
    }

    fn set_link_state(
        &mut self,
        a: &HostId,
        b: &HostId,
        state: LinkState,
    ) -> Result<(), SubstrateError> {
        (**self).set_link_state(a, b, state)
    }

    fn exec(&mut self, host: &HostId, request: &ExecRequest) -> Result<Pid, SubstrateError> {
        (**self).exec(host, request)
    }

    fn signal_kill(&mut self, pid: Pid) -> Result<(), SubstrateError> {
        (**self).signal_kill(pid)
    }

    fn is_alive(&mut self, pid: Pid) -> bool {
        (**self).is_alive(pid)
    }
}
