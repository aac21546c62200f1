//! Harness configuration from TOML.
//!
//! Parsed into `*Input` structs where every field is optional, then
//! resolved against defaults and the catalogue into a validated
//! [`HarnessConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::catalogue;
use crate::substrate::netns::NetnsConfig;

pub const CONFIG_VERSION: u32 = 1;

/// Longest namespace prefix that still leaves room for `-<host>-eth<N>`.
const MAX_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown topology '{0}'")]
    UnknownTopology(String),
    #[error("timings given for unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfigInput {
    pub version: u32,
    pub topology: Option<String>,
    pub debug: Option<bool>,
    pub daemons: DaemonsInput,
    pub terminal: TerminalInput,
    pub netns: NetnsInput,
    pub timings: HashMap<String, TimingsInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonsInput {
    pub bin_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TerminalInput {
    pub program: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetnsInput {
    pub prefix: Option<String>,
    pub sudo: Option<bool>,
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingsInput {
    pub daemon_ready_ms: Option<u64>,
    pub convergence_ms: Option<u64>,
    pub stagger_ms: Option<u64>,
    pub fault_after_ms: Option<u64>,
    pub fault_duration_ms: Option<u64>,
}

/// Delays a scenario uses between its steps.
///
/// The defaults were tuned against one particular daemon implementation's
/// start-up and convergence speed and are not expected to fit others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioTimings {
    /// After starting MIP daemons, before starting what depends on them.
    pub daemon_ready: Duration,
    /// After starting routing daemons, before traffic starts.
    pub convergence: Duration,
    /// Between consecutive servers/clients.
    pub stagger: Duration,
    /// From the last client to the link failure.
    pub fault_after: Duration,
    /// How long the failed link stays down.
    pub fault_duration: Duration,
}

impl Default for ScenarioTimings {
    fn default() -> Self {
        Self {
            daemon_ready: Duration::from_secs(1),
            convergence: Duration::from_secs(10),
            stagger: Duration::from_secs(1),
            fault_after: Duration::from_secs(30),
            fault_duration: Duration::from_secs(20),
        }
    }
}

impl TimingsInput {
    fn resolve(&self) -> ScenarioTimings {
        let d = ScenarioTimings::default();
        let ms = |v: Option<u64>, fallback: Duration| v.map(Duration::from_millis).unwrap_or(fallback);
        ScenarioTimings {
            daemon_ready: ms(self.daemon_ready_ms, d.daemon_ready),
            convergence: ms(self.convergence_ms, d.convergence),
            stagger: ms(self.stagger_ms, d.stagger),
            fault_after: ms(self.fault_after_ms, d.fault_after),
            fault_duration: ms(self.fault_duration_ms, d.fault_duration),
        }
    }
}

/// Where the daemon binaries live and how they are invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub bin_dir: PathBuf,
    /// Pass `-d` to the MIP and routing daemons.
    pub debug: bool,
}

impl Default for DaemonPaths {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("."),
            debug: true,
        }
    }
}

impl DaemonPaths {
    /// Command path for daemon `name`, e.g. `./mip_daemon`.
    pub fn binary(&self, name: &str) -> String {
        if self.bin_dir == Path::new(".") {
            format!("./{name}")
        } else {
            self.bin_dir.join(name).display().to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub version: u32,
    pub topology: String,
    pub daemons: DaemonPaths,
    pub netns: NetnsConfig,
    timings: HashMap<String, ScenarioTimings>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            topology: catalogue::DEFAULT_TOPOLOGY.to_string(),
            daemons: DaemonPaths::default(),
            netns: NetnsConfig::default(),
            timings: HashMap::new(),
        }
    }
}

impl HarnessConfigInput {
    pub fn resolve(self) -> Result<HarnessConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = HarnessConfig::default();

        let topology = match self.topology {
            Some(name) => {
                let name = name.trim().to_string();
                if catalogue::topology(&name).is_none() {
                    return Err(ConfigError::UnknownTopology(name));
                }
                name
            }
            None => defaults.topology,
        };

        let daemons = DaemonPaths {
            bin_dir: self
                .daemons
                .bin_dir
                .map(|d| PathBuf::from(d.trim()))
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or(defaults.daemons.bin_dir),
            debug: self.debug.unwrap_or(defaults.daemons.debug),
        };

        let prefix = self
            .netns
            .prefix
            .map(|p| p.trim().to_string())
            .unwrap_or(defaults.netns.prefix);
        validate_prefix(&prefix)?;

        let netns = NetnsConfig {
            prefix,
            sudo: self.netns.sudo.unwrap_or(defaults.netns.sudo),
            terminal: self
                .terminal
                .program
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            log_dir: self.netns.log_dir.map(PathBuf::from),
        };

        let mut timings = HashMap::new();
        for (scenario, input) in self.timings {
            if !catalogue::SCENARIOS.contains(&scenario.as_str()) {
                return Err(ConfigError::UnknownScenario(scenario));
            }
            timings.insert(scenario, input.resolve());
        }

        Ok(HarnessConfig {
            version,
            topology,
            daemons,
            netns,
            timings,
        })
    }
}

impl HarnessConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(HarnessConfig::default());
        }
        let parsed: HarnessConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Timings for `scenario`, falling back to the defaults.
    pub fn timings_for(&self, scenario: &str) -> ScenarioTimings {
        self.timings.get(scenario).copied().unwrap_or_default()
    }

    /// Switch to another catalogue topology.
    pub fn set_topology(&mut self, name: &str) -> Result<(), ConfigError> {
        if catalogue::topology(name).is_none() {
            return Err(ConfigError::UnknownTopology(name.to_string()));
        }
        self.topology = name.to_string();
        Ok(())
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        field: "netns.prefix".into(),
        reason: reason.into(),
    };
    if prefix.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(invalid("must be at most 8 characters"));
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("must be ASCII letters and digits"));
    }
    Ok(())
}
