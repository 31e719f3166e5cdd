//! Recovery sweep shared types and traits.
//!
//! This crate is the base the sweep engine and its collaborators build on:
//! the sweep data model, the error taxonomy, the hardware signing protocol
//! and the interfaces of every external party the engine talks to.

pub mod broadcast;
pub mod cosign;
pub mod error;
pub mod hardware;
pub mod key_set;
pub mod sweep;
pub mod util;
pub mod wallet;

// re-exporting external crates
pub use bitcoin;

pub use self::broadcast::{Broadcaster, ExchangeRateProvider, TransactionRepository};
pub use self::cosign::{Environment, ServerCoSigner};
pub use self::error::{
    BroadcastError, BuildSweepError, Error, ErrorKind, HardwareError, NetworkingError,
    PersistenceError, SigningError, SweepError,
};
pub use self::hardware::{
    Continuation, EmulatedPromptOption, HardwareCommands, HardwareInteraction, HardwareSession,
    HardwareTransport, ResumeTap, SealedKey, UnsealedKey, MAX_TAPS,
};
pub use self::key_set::{AccountId, KeySet, KeySetId, ServerKeySetId};
pub use self::sweep::{
    BroadcastReceipt, ExchangeRate, GenerationOutcome, SignaturePlan, SignedOutcome, SweepBatch,
    SweepPsbt, UnsignedSweep,
};
pub use self::wallet::{ConfirmationTarget, FeeEstimator, SpendingWallet, WalletProvider};
