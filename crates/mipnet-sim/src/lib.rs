//! Scenario orchestration for testing MIP, routing and transport daemons
//! on an emulated multi-host network.
//!
//! The harness builds a [`Topology`], hands it to an emulation
//! [`Substrate`], then runs timed [`Scenario`]s that spawn daemons, wait,
//! and toggle links. Every spawned process is tracked by the
//! [`ProcessSupervisor`] and killed on shutdown.
//!
//! # Modules
//!
//! - [`topology`]: Hosts, links and their physical parameters
//! - [`substrate`]: Emulation capability trait, plus Linux netns and simulated backends
//! - [`fault`]: Link up/down injection
//! - [`supervisor`]: Process registry and teardown
//! - [`clock`]: Wall-clock and virtual time for the scheduler
//! - [`scenario`]: Step sequences and the scheduler that runs them
//! - [`catalogue`]: The fixed set of topologies and scenarios
//! - [`config`]: TOML harness configuration
//! - [`commands`]: Command registry and the session it drives
//! - [`test_util`]: Privilege checks and unique name generation for tests

pub mod catalogue;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod fault;
pub mod scenario;
pub mod substrate;
pub mod supervisor;
pub mod test_util;
pub mod topology;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use commands::{CommandError, CommandOutcome, CommandRegistry, Session};
pub use config::{HarnessConfig, ScenarioTimings};
pub use error::{HarnessError, Result};
pub use fault::set_link_state;
pub use scenario::{RunReport, Scenario, ScenarioStep, Scheduler};
pub use substrate::{ExecRequest, HostContext, Pid, Substrate, SubstrateError};
pub use supervisor::{HandleId, KillReport, ProcessHandle, ProcessSupervisor};
pub use topology::{Host, HostId, Link, LinkParams, LinkState, Topology};
