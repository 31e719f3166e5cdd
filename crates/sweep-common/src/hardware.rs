//! Hardware signing protocol
//!
//! Every hardware-dependent command returns a [`HardwareInteraction`]. A
//! physical device may need a human gesture before it discloses a result,
//! so the first tap can only start an operation and a second tap, on a
//! fresh session, fetches the result.
//!
//! ```text
//! tap 1 ──► Completed(r)
//!       ├─► RequiresConfirmation(continuation) ──► tap 2 ──► Completed(r)
//!       └─► ConfirmWithEmulatedPrompt(options) ──► pick ──► tap 2 ──► Completed(r)
//! ```
//!
//! Continuations are consumed when resumed, so a continuation can not be
//! replayed. Resuming against a closed session fails with
//! [`HardwareError::SessionClosed`], a transport-class error.

use std::fmt;

use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::Psbt;

use crate::error::HardwareError;
use crate::key_set::KeySet;

/// Taps allowed for one interaction, by protocol convention
pub const MAX_TAPS: usize = 2;

/// One acquired transport session, valid for a single tap
#[async_trait]
pub trait HardwareSession: Send + fmt::Debug {
    /// Session identifier, unique per acquisition
    fn id(&self) -> u64;

    /// Whether the session can still carry commands
    fn is_open(&self) -> bool;

    /// Release the session. Idempotent.
    fn close(&mut self);

    /// Exchange one command frame with the device
    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, HardwareError>;
}

/// Source of hardware sessions
#[async_trait]
pub trait HardwareTransport: Send + Sync {
    /// Acquire a new session for one tap
    async fn open_session(&self) -> Result<Box<dyn HardwareSession>, HardwareError>;
}

/// Deferred second half of a hardware operation
#[async_trait]
pub trait ResumeTap<R: Send + 'static>: Send {
    /// Finish the operation on a new session
    async fn resume(
        self: Box<Self>,
        session: &mut dyn HardwareSession,
    ) -> Result<HardwareInteraction<R>, HardwareError>;
}

/// Single-use continuation token
pub struct Continuation<R: Send + 'static> {
    inner: Box<dyn ResumeTap<R>>,
}

impl<R: Send + 'static> Continuation<R> {
    /// Wrap a deferred operation
    pub fn new<C>(resume: C) -> Self
    where
        C: ResumeTap<R> + 'static,
    {
        Self {
            inner: Box::new(resume),
        }
    }

    /// Resume on the next tap, consuming the continuation
    pub async fn resume(
        self,
        session: &mut dyn HardwareSession,
    ) -> Result<HardwareInteraction<R>, HardwareError> {
        if !session.is_open() {
            return Err(HardwareError::SessionClosed);
        }
        self.inner.resume(session).await
    }
}

impl<R: Send + 'static> fmt::Debug for Continuation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").finish_non_exhaustive()
    }
}

/// Side effect run as soon as an emulated option is selected
pub type OnSelect = Box<dyn FnOnce() + Send>;

/// One option of an emulated on-screen prompt
pub struct EmulatedPromptOption<R: Send + 'static> {
    /// Display label
    pub label: String,
    /// Run immediately on selection
    pub on_select: Option<OnSelect>,
    /// Fetches the final result on the next tap
    pub continuation: Continuation<R>,
}

impl<R: Send + 'static> EmulatedPromptOption<R> {
    /// Create new [`EmulatedPromptOption`]
    pub fn new<S: Into<String>>(
        label: S,
        on_select: Option<OnSelect>,
        continuation: Continuation<R>,
    ) -> Self {
        Self {
            label: label.into(),
            on_select,
            continuation,
        }
    }
}

impl<R: Send + 'static> fmt::Debug for EmulatedPromptOption<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedPromptOption")
            .field("label", &self.label)
            .field("on_select", &self.on_select.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of one hardware tap
pub enum HardwareInteraction<R: Send + 'static> {
    /// Result available now
    Completed(R),
    /// Device needs a confirmation gesture, then a second tap
    RequiresConfirmation(Continuation<R>),
    /// Fake hardware only: on-screen choice standing in for the physical gesture
    ConfirmWithEmulatedPrompt(Vec<EmulatedPromptOption<R>>),
}

impl<R: Send + 'static> HardwareInteraction<R> {
    /// State name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::RequiresConfirmation(_) => "requires_confirmation",
            Self::ConfirmWithEmulatedPrompt(_) => "confirm_with_emulated_prompt",
        }
    }
}

impl<R: Send + 'static + fmt::Debug> fmt::Debug for HardwareInteraction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(r) => f.debug_tuple("Completed").field(r).finish(),
            Self::RequiresConfirmation(c) => {
                f.debug_tuple("RequiresConfirmation").field(c).finish()
            }
            Self::ConfirmWithEmulatedPrompt(options) => f
                .debug_tuple("ConfirmWithEmulatedPrompt")
                .field(options)
                .finish(),
        }
    }
}

/// Key material sealed by the device
#[derive(Clone, PartialEq, Eq)]
pub struct SealedKey(pub Vec<u8>);

impl fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedKey(<{} bytes>)", self.0.len())
    }
}

/// Key material in the clear
#[derive(Clone, PartialEq, Eq)]
pub struct UnsealedKey(pub Vec<u8>);

impl fmt::Debug for UnsealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnsealedKey(<redacted>)")
    }
}

/// Hardware command surface
#[async_trait]
pub trait HardwareCommands: Send + Sync {
    /// Add the hardware signature to a sweep PSBT
    async fn sign_transaction(
        &self,
        session: &mut dyn HardwareSession,
        psbt: &Psbt,
        key_set: &KeySet,
    ) -> Result<HardwareInteraction<Psbt>, HardwareError>;

    /// Seal key material with the device's key
    async fn seal_key(
        &self,
        session: &mut dyn HardwareSession,
        key: &UnsealedKey,
    ) -> Result<HardwareInteraction<SealedKey>, HardwareError>;

    /// Unseal key material sealed by this device
    async fn unseal_key(
        &self,
        session: &mut dyn HardwareSession,
        sealed: &SealedKey,
    ) -> Result<HardwareInteraction<UnsealedKey>, HardwareError>;

    /// Sign an authentication challenge with the hardware key
    async fn sign_challenge(
        &self,
        session: &mut dyn HardwareSession,
        challenge: &[u8],
    ) -> Result<HardwareInteraction<Signature>, HardwareError>;
}
