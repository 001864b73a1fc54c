//! Error types for enrollment, synchronization and tunnel management.

use std::fmt;
use thiserror::Error;

/// Body fragments the control plane uses when it has no record for a node.
const NO_RECORD_MARKERS: [&str; 2] = ["no result found", "could not find any records"];

/// Errors produced by the agent core.
#[derive(Debug, Error)]
pub enum Error {
    /// The network already has a local record on this host
    #[error("network {0} is already installed; leave it before joining again")]
    AlreadyInstalled(String),

    /// Join was attempted without a network name
    #[error("no network provided")]
    NoNetworkProvided,

    /// No up, non-loopback interface carried a qualifying address
    #[error("no local address found{}", .0.as_deref().map(|r| format!(" in range {r}")).unwrap_or_default())]
    AddressNotFound(Option<String>),

    /// Every public address echo endpoint failed
    #[error("public address lookup failed on all {0} endpoints")]
    LookupFailed(usize),

    /// Every port between the start and the upper bound is taken
    #[error("no free listen port between {0} and {max}", max = crate::resolver::MAX_LISTEN_PORT)]
    NoFreePort(u16),

    /// No interface exposes a hardware address
    #[error("no hardware identifier found on any interface")]
    NoIdentifier,

    /// The tunnel driver rejected the interface
    #[error("failed to create tunnel interface {interface}: {reason}")]
    DeviceCreateFailed { interface: String, reason: String },

    /// The peer table could not be applied; interface state must be treated as stale
    #[error("failed to apply configuration to {interface}: {reason}")]
    ApplyFailed { interface: String, reason: String },

    /// Transport failure while fetching the authoritative peer view
    #[error("sync of network {network} failed: {reason}")]
    SyncFailed { network: String, reason: String },

    /// The control plane has no record for this node
    #[error("control plane has no record: {0}")]
    EmptyRecord(String),

    /// A rollback or wipe step failed but the remaining steps still ran
    #[error("cleanup of network {network} incomplete: {}", .failures.join("; "))]
    RollbackPartial {
        network: String,
        failures: Vec<String>,
    },

    /// Join failed at a given step; rollback has already been attempted
    #[error("joining network {network} failed while {step}: {source}")]
    Join {
        network: String,
        step: JoinStep,
        #[source]
        source: Box<Error>,
    },

    /// The network has no local record
    #[error("network {0} is not installed on this host")]
    NotInstalled(String),

    /// Control-plane request failed
    #[error("control plane request failed: {0}")]
    Control(String),

    /// Key material could not be decoded
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Daemon manager failed
    #[error("daemon manager error: {0}")]
    Daemon(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this failure means "the control plane has nothing for us" rather
    /// than a transport problem.
    pub fn is_empty_record(&self) -> bool {
        match self {
            Error::EmptyRecord(_) => true,
            Error::Control(message) | Error::SyncFailed { reason: message, .. } => {
                is_empty_record_message(message)
            }
            _ => false,
        }
    }

    /// The innermost error of a wrapped join failure.
    pub fn root(&self) -> &Error {
        match self {
            Error::Join { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Message inspection used to tell missing records apart from transport errors.
pub fn is_empty_record_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    NO_RECORD_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Steps of the join state machine, used to report where a join failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    PersistProvisional,
    ResolveLocalAddress,
    StoreSecret,
    ResolveEndpoint,
    GenerateKeys,
    ResolveIdentifier,
    Register,
    ResolveListenPort,
    PersistRecord,
    StorePrivateKey,
    FetchPeers,
    BringUp,
}

impl fmt::Display for JoinStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JoinStep::PersistProvisional => "persisting the provisional record",
            JoinStep::ResolveLocalAddress => "resolving the local address",
            JoinStep::StoreSecret => "storing the passphrase",
            JoinStep::ResolveEndpoint => "resolving the endpoint",
            JoinStep::GenerateKeys => "preparing the key pair",
            JoinStep::ResolveIdentifier => "resolving the hardware identifier",
            JoinStep::Register => "registering with the control plane",
            JoinStep::ResolveListenPort => "resolving the listen port",
            JoinStep::PersistRecord => "persisting the node record",
            JoinStep::StorePrivateKey => "storing the private key",
            JoinStep::FetchPeers => "fetching peers",
            JoinStep::BringUp => "bringing up the tunnel interface",
        };
        f.write_str(text)
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;
