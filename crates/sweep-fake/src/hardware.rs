//! Fake hardware device.
//!
//! Every session counts as one tap. Depending on [`ConfirmationMode`] a
//! command completes on the first tap, asks for a confirmation and a second
//! tap, or offers an emulated on-screen prompt in place of the gesture.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{rand, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::Psbt;
use sweep_common::{
    Continuation, EmulatedPromptOption, HardwareCommands, HardwareError, HardwareInteraction,
    HardwareSession, HardwareTransport, KeySet, ResumeTap, SealedKey, UnsealedKey,
};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::signature::{self, Party};

/// Label of the emulated option that approves
pub const APPROVE_LABEL: &str = "Approve";
/// Label of the emulated option that rejects
pub const REJECT_LABEL: &str = "Reject";

/// How the fake device confirms an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationMode {
    /// Result on the first tap
    #[default]
    Immediate,
    /// Confirmation gesture, then a second tap
    TwoTap,
    /// On-screen approve/reject prompt, then a second tap
    EmulatedPrompt,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_session: AtomicU64,
    open_sessions: AtomicUsize,
    taps: AtomicUsize,
    approvals: AtomicUsize,
    signatures: AtomicUsize,
    locked: AtomicBool,
    transport_failure: AtomicBool,
}

/// Fake device; both the transport and the command surface
#[derive(Debug)]
pub struct FakeHardware {
    mode: Mutex<ConfirmationMode>,
    secret: SecretKey,
    device: Arc<DeviceState>,
}

impl FakeHardware {
    /// Create new [`FakeHardware`] with a random device key
    pub fn new(mode: ConfirmationMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            secret: SecretKey::new(&mut rand::thread_rng()),
            device: Arc::new(DeviceState::default()),
        }
    }

    /// Change the confirmation mode
    pub async fn set_mode(&self, mode: ConfirmationMode) {
        *self.mode.lock().await = mode;
    }

    /// Lock or unlock the device
    pub fn set_locked(&self, locked: bool) {
        self.device.locked.store(locked, Ordering::SeqCst);
    }

    /// Make every exchange fail at the transport
    pub fn set_transport_failure(&self, fail: bool) {
        self.device.transport_failure.store(fail, Ordering::SeqCst);
    }

    /// Device public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &self.secret)
    }

    /// Sessions opened so far
    pub fn taps(&self) -> usize {
        self.device.taps.load(Ordering::SeqCst)
    }

    /// Sessions not yet closed
    pub fn open_sessions(&self) -> usize {
        self.device.open_sessions.load(Ordering::SeqCst)
    }

    /// Emulated approvals selected so far
    pub fn approvals(&self) -> usize {
        self.device.approvals.load(Ordering::SeqCst)
    }

    /// Transactions signed so far
    pub fn signatures(&self) -> usize {
        self.device.signatures.load(Ordering::SeqCst)
    }

    fn xor(&self, bytes: &[u8]) -> Vec<u8> {
        let secret = self.secret.secret_bytes();
        bytes
            .iter()
            .zip(secret.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }

    async fn interaction<R: Send + 'static>(&self, result: R) -> HardwareInteraction<R> {
        match *self.mode.lock().await {
            ConfirmationMode::Immediate => HardwareInteraction::Completed(result),
            ConfirmationMode::TwoTap => {
                HardwareInteraction::RequiresConfirmation(Continuation::new(Ready { result }))
            }
            ConfirmationMode::EmulatedPrompt => {
                let device = self.device.clone();
                HardwareInteraction::ConfirmWithEmulatedPrompt(vec![
                    EmulatedPromptOption::new(
                        APPROVE_LABEL,
                        Some(Box::new(move || {
                            device.approvals.fetch_add(1, Ordering::SeqCst);
                        })),
                        Continuation::new(Ready { result }),
                    ),
                    EmulatedPromptOption::new(REJECT_LABEL, None, Continuation::new(Declined)),
                ])
            }
        }
    }
}

/// Second tap fetching a result the device already computed
struct Ready<R> {
    result: R,
}

#[async_trait]
impl<R: Send + 'static> ResumeTap<R> for Ready<R> {
    async fn resume(
        self: Box<Self>,
        session: &mut dyn HardwareSession,
    ) -> Result<HardwareInteraction<R>, HardwareError> {
        session.transceive(b"fetch").await?;
        Ok(HardwareInteraction::Completed(self.result))
    }
}

/// Second tap after the user rejected on screen
struct Declined;

#[async_trait]
impl<R: Send + 'static> ResumeTap<R> for Declined {
    async fn resume(
        self: Box<Self>,
        session: &mut dyn HardwareSession,
    ) -> Result<HardwareInteraction<R>, HardwareError> {
        session.transceive(b"fetch").await?;
        Err(HardwareError::Cancelled)
    }
}

/// Session of the fake device
#[derive(Debug)]
pub struct FakeSession {
    id: u64,
    open: bool,
    device: Arc<DeviceState>,
}

#[async_trait]
impl HardwareSession for FakeSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.device.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, HardwareError> {
        if !self.open {
            return Err(HardwareError::SessionClosed);
        }
        if self.device.transport_failure.load(Ordering::SeqCst) {
            return Err(HardwareError::Transport("tag was lost".to_string()));
        }
        if self.device.locked.load(Ordering::SeqCst) {
            return Err(HardwareError::Locked);
        }
        Ok(command.to_vec())
    }
}

#[async_trait]
impl HardwareTransport for FakeHardware {
    async fn open_session(&self) -> Result<Box<dyn HardwareSession>, HardwareError> {
        let id = self.device.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        self.device.taps.fetch_add(1, Ordering::SeqCst);
        self.device.open_sessions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(session = id, "Fake hardware session opened");
        Ok(Box::new(FakeSession {
            id,
            open: true,
            device: self.device.clone(),
        }))
    }
}

#[async_trait]
impl HardwareCommands for FakeHardware {
    #[instrument(skip(self, session, psbt), fields(key_set = %key_set.id))]
    async fn sign_transaction(
        &self,
        session: &mut dyn HardwareSession,
        psbt: &Psbt,
        key_set: &KeySet,
    ) -> Result<HardwareInteraction<Psbt>, HardwareError> {
        session.transceive(b"sign-transaction").await?;
        self.device.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .interaction(signature::sign(psbt, Party::Hardware))
            .await)
    }

    async fn seal_key(
        &self,
        session: &mut dyn HardwareSession,
        key: &UnsealedKey,
    ) -> Result<HardwareInteraction<SealedKey>, HardwareError> {
        session.transceive(b"seal-key").await?;
        Ok(self.interaction(SealedKey(self.xor(&key.0))).await)
    }

    async fn unseal_key(
        &self,
        session: &mut dyn HardwareSession,
        sealed: &SealedKey,
    ) -> Result<HardwareInteraction<UnsealedKey>, HardwareError> {
        session.transceive(b"unseal-key").await?;
        if sealed.0.is_empty() {
            return Err(HardwareError::UnexpectedResponse(
                "empty sealed key".to_string(),
            ));
        }
        Ok(self.interaction(UnsealedKey(self.xor(&sealed.0))).await)
    }

    async fn sign_challenge(
        &self,
        session: &mut dyn HardwareSession,
        challenge: &[u8],
    ) -> Result<HardwareInteraction<Signature>, HardwareError> {
        session.transceive(b"sign-challenge").await?;
        let digest = sha256::Hash::hash(challenge);
        let message = Message::from_digest(digest.to_byte_array());
        let signature = Secp256k1::signing_only().sign_ecdsa(&message, &self.secret);
        Ok(self.interaction(signature).await)
    }
}
