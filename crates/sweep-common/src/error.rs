//! Errors
//!
//! One enum per failure domain. The orchestrator is the only place where
//! these are turned into terminal states; nothing below it retries.

use bitcoin::Txid;
use thiserror::Error;

use crate::key_set::{AccountId, KeySetId};

/// Generation errors.
///
/// Batch-fatal: one failing key set aborts the whole generation pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SweepError {
    /// The wallet backend could not enumerate the account's key sets
    #[error("Failed to list key sets: {0}")]
    FailedToListKeySets(String),
    /// A sweep transaction could not be built for a key set
    #[error("Failed to build sweep transaction for key set `{key_set}`: {cause}")]
    FailedToBuildTransaction {
        /// Key set being swept
        key_set: KeySetId,
        /// Backend cause
        cause: String,
    },
    /// Fee environment unavailable
    #[error("Failed to estimate fee: {0}")]
    FailedToEstimateFee(String),
    /// The active wallet could not provide a destination address
    #[error("Failed to resolve sweep destination: {0}")]
    FailedToResolveDestination(String),
    /// Zero or several key sets claim to be active
    #[error("Account has no single active key set")]
    NoActiveKeySet,
}

/// Error returned by a spending wallet when building a sweep
#[derive(Debug, Error)]
pub enum BuildSweepError {
    /// Spendable value does not cover the fee
    #[error("Insufficient funds")]
    InsufficientFunds,
    /// Backend failure
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Hardware errors.
///
/// Always retryable by tapping again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    /// Device is locked
    #[error("Hardware device is locked")]
    Locked,
    /// Device requires fingerprint authentication
    #[error("Hardware device is not authenticated")]
    Unauthenticated,
    /// Device failed the authenticity check
    #[error("Hardware device is not authentic")]
    Inauthentic,
    /// Transport failure while talking to the device
    #[error("Hardware transport error: {0}")]
    Transport(String),
    /// A continuation was resumed against a session that is already closed
    #[error("Hardware session is closed")]
    SessionClosed,
    /// The interaction did not complete within the allowed number of taps
    #[error("Hardware interaction exceeded {0} taps")]
    TapLimitExceeded(usize),
    /// An emulated prompt option that does not exist was selected
    #[error("Invalid prompt selection: {0}")]
    InvalidPromptSelection(usize),
    /// The user dismissed the tap
    #[error("Hardware interaction cancelled")]
    Cancelled,
    /// Device replied with something the command did not expect
    #[error("Unexpected hardware response: {0}")]
    UnexpectedResponse(String),
}

impl HardwareError {
    /// Human readable classification for display
    pub fn classification(&self) -> &'static str {
        match self {
            Self::Locked | Self::Unauthenticated => {
                "Unlock your device with your fingerprint and tap again"
            }
            Self::Inauthentic => "This device could not be verified as authentic",
            Self::Transport(_) | Self::SessionClosed => {
                "Connection to the device was lost, hold it steady and tap again"
            }
            Self::TapLimitExceeded(_) | Self::UnexpectedResponse(_) => {
                "The device did not finish the operation, tap again"
            }
            Self::InvalidPromptSelection(_) => "Invalid selection, tap again",
            Self::Cancelled => "Tap cancelled",
        }
    }

    /// Whether the error belongs to the transport class
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::SessionClosed)
    }

    /// Hardware errors are retryable by re-tapping
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Networking errors for calls to the co-signing server.
///
/// Retryable, and never discard signing progress already obtained.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkingError {
    /// HTTP error with status code
    #[error("HTTP error ({status}): {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Error message
        message: String,
    },
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
    /// Request timeout
    #[error("Request timeout")]
    Timeout,
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Invalid url
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
}

impl From<serde_json::Error> for NetworkingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Broadcast errors.
///
/// Terminal for the current attempt, never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    /// Network rejected the transaction
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    /// Transaction could not be extracted or encoded
    #[error("Malformed transaction: {0}")]
    Malformed(String),
    /// Broadcast transport failure
    #[error(transparent)]
    Network(#[from] NetworkingError),
}

/// Local ledger failure, logged and never surfaced as a sweep failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Persistence error: {0}")]
pub struct PersistenceError(pub String);

/// App key signing failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to sign with app key for key set `{key_set}`: {cause}")]
pub struct SigningError {
    /// Key set whose app key was used
    pub key_set: KeySetId,
    /// Wallet cause
    pub cause: String,
}

/// Broad error class used for display and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Key set enumeration, fee or transaction construction
    Generation,
    /// Hardware device interaction
    Hardware,
    /// Co-signing server
    Network,
    /// Broadcast rejection
    Broadcast,
    /// App key signing
    Signing,
    /// Orchestrator misuse or lifecycle
    Orchestration,
}

/// Sweep engine Error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Generation error
    #[error(transparent)]
    Sweep(#[from] SweepError),
    /// Hardware error
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    /// Co-sign networking error
    #[error(transparent)]
    Networking(#[from] NetworkingError),
    /// Broadcast error
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    /// App signing error
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// Event is not accepted in the current state
    #[error("Event `{event}` is not valid in state `{state}`")]
    InvalidTransition {
        /// Current state name
        state: &'static str,
        /// Rejected event name
        event: &'static str,
    },
    /// Another sweep is already running for the account
    #[error("A sweep is already in progress for account `{0}`")]
    SweepInProgress(AccountId),
    /// A hardware-plan sweep has no hardware-signed payload
    #[error("Missing hardware signed payload for `{0}`")]
    MissingHardwareSignature(Txid),
    /// A hardware-signed payload does not match the sweep it claims to sign
    #[error("Hardware signed payload does not match sweep `{0}`")]
    HardwarePayloadMismatch(Txid),
    /// Cancellation requested after broadcasting started
    #[error("Sweep can not be cancelled once signing and broadcast started")]
    CancellationNotAllowed,
    /// Amount overflow
    #[error("Amount overflow")]
    AmountOverflow,
    /// Orchestrator actor is no longer running
    #[error("Sweep actor stopped")]
    ActorStopped,
}

impl Error {
    /// Error class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sweep(_) => ErrorKind::Generation,
            Self::Hardware(_) => ErrorKind::Hardware,
            Self::Networking(_) => ErrorKind::Network,
            Self::Broadcast(_) => ErrorKind::Broadcast,
            Self::Signing(_) => ErrorKind::Signing,
            Self::AmountOverflow => ErrorKind::Generation,
            Self::InvalidTransition { .. }
            | Self::SweepInProgress(_)
            | Self::MissingHardwareSignature(_)
            | Self::HardwarePayloadMismatch(_)
            | Self::CancellationNotAllowed
            | Self::ActorStopped => ErrorKind::Orchestration,
        }
    }

    /// Whether a user-triggered retry may succeed.
    ///
    /// Broadcast rejections are retryable only by regenerating the batch,
    /// which is what the orchestrator's retry does.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sweep(SweepError::NoActiveKeySet) => false,
            Self::Sweep(_) | Self::Hardware(_) | Self::Networking(_) => true,
            Self::Broadcast(_) | Self::Signing(_) | Self::AmountOverflow => true,
            Self::InvalidTransition { .. }
            | Self::SweepInProgress(_)
            | Self::MissingHardwareSignature(_)
            | Self::HardwarePayloadMismatch(_)
            | Self::CancellationNotAllowed
            | Self::ActorStopped => false,
        }
    }

    /// Message suitable for display next to a retry action
    pub fn display_message(&self) -> String {
        match self {
            Self::Hardware(err) => err.classification().to_string(),
            Self::Networking(_) => {
                "Could not reach the server, check your connection and try again".to_string()
            }
            other => other.to_string(),
        }
    }
}
