use std::time::Duration;

use crate::entity::EntityKind;

/// Failures talking to a bridge.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bridge error {kind} at {address}: {description}")]
    Bridge {
        kind: u32,
        address: String,
        description: String,
    },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0} is not supported")]
    Unsupported(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{kind} {token:?} not found")]
    NotFound { kind: EntityKind, token: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Errors raised while parsing or executing a `set` line.
///
/// `NotANumber`, `OutOfRange` and `InvalidFormat` are all invalid-argument
/// errors; see [`CommandError::is_invalid_argument`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid {param}: {value:?} is not a number")]
    NotANumber { param: &'static str, value: String },
    #[error("invalid {param}: {value} is outside {min}..={max}")]
    OutOfRange {
        param: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("invalid {param}: {value:?} ({reason})")]
    InvalidFormat {
        param: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("not enough arguments: {0} needs a value")]
    NotEnoughArguments(&'static str),
    #[error("unknown argument {0:?}")]
    UnknownArgument(String),
    #[error("{0} cannot be used as a target here")]
    UnsupportedTarget(&'static str),
    #[error("no target specified")]
    NoTargetSpecified,
    #[error("no action specified")]
    NoActionSpecified,
    #[error("no state found for {0}")]
    NoStateFound(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to {verb}: {source}")]
    Action {
        verb: &'static str,
        #[source]
        source: ApiError,
    },
}

impl CommandError {
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            CommandError::NotANumber { .. }
                | CommandError::OutOfRange { .. }
                | CommandError::InvalidFormat { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no viable network interfaces to scan")]
    NoViableInterfaces,
    #[error("no bridges available")]
    NoBridgesAvailable,
    #[error("no bridge answered on any scanned address")]
    Exhausted,
    #[error("discovery cancelled")]
    Cancelled,
    #[error("discovery declined")]
    Declined,
    #[error("failed to build probe client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Credential provisioning failures. Always terminal for the bridge in question.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("link button confirmation declined")]
    Declined,
    #[error("username must be at least {min} characters")]
    InvalidUsername { min: usize },
    #[error("failed to create user: {0}")]
    CreateUser(#[source] ApiError),
    #[error("failed to verify login: {0}")]
    Login(#[source] ApiError),
    #[error("failed to build bridge client: {0}")]
    Client(#[source] ApiError),
}
