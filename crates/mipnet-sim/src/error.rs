use thiserror::Error;

use crate::substrate::SubstrateError;
use crate::topology::HostId;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Errors raised while building topologies or running scenarios.
///
/// `DuplicateHost`, `UnknownHost`, `DuplicateLink` and `InvalidLink` are
/// definition errors and surface before any process is spawned. The rest
/// abort the scenario that hit them.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("host '{0}' already exists")]
    DuplicateHost(HostId),
    #[error("unknown host '{0}'")]
    UnknownHost(HostId),
    #[error("link {0}-{1} already exists")]
    DuplicateLink(HostId, HostId),
    #[error("invalid link {a}-{b}: {reason}")]
    InvalidLink {
        a: HostId,
        b: HostId,
        reason: String,
    },
    #[error("no link between {0} and {1}")]
    LinkNotFound(HostId, HostId),
    #[error("topology '{0}' has not been instantiated on a substrate")]
    NotInstantiated(String),
    #[error("topology '{0}' is already instantiated and can no longer change shape")]
    AlreadyInstantiated(String),
    #[error("session has already been shut down")]
    SessionClosed,
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),
    #[error("failed to spawn '{title}' on {host}: {source}")]
    Spawn {
        host: HostId,
        title: String,
        #[source]
        source: SubstrateError,
    },
}
