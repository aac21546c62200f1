//! Hosts, links and the topology graph handed to the emulation substrate.
//!
//! The model is pure in-memory state. It performs no I/O until
//! [`Topology::instantiate`] replays it onto a [`Substrate`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::scenario::{Scenario, ScenarioStep};
use crate::substrate::{HostContext, Substrate};

/// Short unique host name, e.g. `A`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An emulated host.
///
/// `context` is the substrate's handle for the host and is only set once
/// the topology has been instantiated.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    pub context: Option<HostContext>,
}

/// Operational state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Up => f.write_str("up"),
            LinkState::Down => f.write_str("down"),
        }
    }
}

impl FromStr for LinkState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(LinkState::Up),
            "down" => Ok(LinkState::Down),
            other => Err(format!("invalid link state '{other}' (expected up or down)")),
        }
    }
}

/// Physical parameters of a link, applied symmetrically to both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkParams {
    /// Bandwidth in Mbit/s.
    pub bandwidth_mbit: f64,
    /// One-way delay.
    pub delay: Duration,
    /// Loss probability as a fraction in `[0.0, 1.0]`.
    pub loss: f64,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            bandwidth_mbit: 10.0,
            delay: Duration::from_millis(10),
            loss: 0.0,
        }
    }
}

/// A bidirectional link between two hosts.
#[derive(Debug, Clone)]
pub struct Link {
    pub a: HostId,
    pub b: HostId,
    pub params: LinkParams,
    pub state: LinkState,
}

impl Link {
    /// True if this link joins `x` and `y`, in either order.
    pub fn connects(&self, x: &HostId, y: &HostId) -> bool {
        (&self.a == x && &self.b == y) || (&self.a == y && &self.b == x)
    }
}

/// Named set of hosts and links.
///
/// Every link endpoint references a host of the same topology, and an
/// unordered host pair carries at most one link. Once instantiated only
/// link states may change.
#[derive(Debug, Clone)]
pub struct Topology {
    name: String,
    hosts: Vec<Host>,
    host_index: HashMap<HostId, usize>,
    links: Vec<Link>,
    link_index: HashMap<(HostId, HostId), usize>,
    instantiated: bool,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: Vec::new(),
            host_index: HashMap::new(),
            links: Vec::new(),
            link_index: HashMap::new(),
            instantiated: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_instantiated(&self) -> bool {
        self.instantiated
    }

    pub fn add_host(&mut self, id: impl Into<HostId>) -> Result<&Host> {
        self.ensure_mutable()?;
        let id = id.into();
        if self.host_index.contains_key(&id) {
            return Err(HarnessError::DuplicateHost(id));
        }

        let idx = self.hosts.len();
        self.host_index.insert(id.clone(), idx);
        self.hosts.push(Host { id, context: None });
        Ok(&self.hosts[idx])
    }

    pub fn add_link(
        &mut self,
        a: impl Into<HostId>,
        b: impl Into<HostId>,
        params: LinkParams,
    ) -> Result<&Link> {
        self.ensure_mutable()?;
        let (a, b) = (a.into(), b.into());

        for endpoint in [&a, &b] {
            if !self.host_index.contains_key(endpoint) {
                return Err(HarnessError::UnknownHost(endpoint.clone()));
            }
        }
        if a == b {
            return Err(invalid(&a, &b, "a link needs two distinct hosts"));
        }
        if !(0.0..=1.0).contains(&params.loss) {
            return Err(invalid(
                &a,
                &b,
                format!("loss {} is outside 0.0..=1.0", params.loss),
            ));
        }
        if !params.bandwidth_mbit.is_finite() || params.bandwidth_mbit <= 0.0 {
            return Err(invalid(
                &a,
                &b,
                format!("bandwidth {} Mbit/s must be positive", params.bandwidth_mbit),
            ));
        }

        let key = pair_key(&a, &b);
        if self.link_index.contains_key(&key) {
            return Err(HarnessError::DuplicateLink(a, b));
        }

        let idx = self.links.len();
        self.link_index.insert(key, idx);
        self.links.push(Link {
            a,
            b,
            params,
            state: LinkState::Up,
        });
        Ok(&self.links[idx])
    }

    /// Hosts in insertion order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Links in insertion order.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn host(&self, id: &HostId) -> Option<&Host> {
        self.host_index.get(id).map(|&idx| &self.hosts[idx])
    }

    /// Look up the link joining `a` and `b`, in either order.
    pub fn link(&self, a: &HostId, b: &HostId) -> Option<&Link> {
        self.link_index
            .get(&pair_key(a, b))
            .map(|&idx| &self.links[idx])
    }

    pub(crate) fn link_mut(&mut self, a: &HostId, b: &HostId) -> Option<&mut Link> {
        self.link_index
            .get(&pair_key(a, b))
            .map(|&idx| &mut self.links[idx])
    }

    /// Replay the topology onto a substrate: hosts first, then links, both
    /// in insertion order. Each host records the context the substrate
    /// hands back.
    pub fn instantiate(&mut self, substrate: &mut dyn Substrate) -> Result<()> {
        if self.instantiated {
            return Err(HarnessError::AlreadyInstantiated(self.name.clone()));
        }

        for host in &mut self.hosts {
            let context = substrate.create_host(&host.id)?;
            debug!(host = %host.id, context = %context, "host created");
            host.context = Some(context);
        }
        for link in &self.links {
            substrate.create_link(&link.a, &link.b, &link.params)?;
            debug!(a = %link.a, b = %link.b, "link created");
        }

        self.instantiated = true;
        info!(
            topology = %self.name,
            hosts = self.hosts.len(),
            links = self.links.len(),
            "topology instantiated"
        );
        Ok(())
    }

    /// Check that every host a scenario names exists here.
    ///
    /// Runs before the first step so a scenario written for another
    /// topology fails without spawning anything.
    pub fn validate_scenario(&self, scenario: &Scenario) -> Result<()> {
        let named = scenario.steps().iter().flat_map(|step| match step {
            ScenarioStep::Spawn(spawn) => vec![&spawn.host],
            ScenarioStep::SetLinkState { a, b, .. } => vec![a, b],
            ScenarioStep::Wait(_) => Vec::new(),
        });
        for id in named {
            if self.host(id).is_none() {
                return Err(HarnessError::UnknownHost(id.clone()));
            }
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.instantiated {
            return Err(HarnessError::AlreadyInstantiated(self.name.clone()));
        }
        Ok(())
    }
}

/// Order-independent key for a host pair.
fn pair_key(a: &HostId, b: &HostId) -> (HostId, HostId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn invalid(a: &HostId, b: &HostId, reason: impl Into<String>) -> HarnessError {
    HarnessError::InvalidLink {
        a: a.clone(),
        b: b.clone(),
        reason: reason.into(),
    }
}
