//! Hardware tap driver
//!
//! Drives [`HardwareInteraction`] chains to completion. Each tap acquires a
//! new session through a [`SessionGuard`], which releases it on every exit
//! path. The user is asked for confirmations and emulated prompt choices
//! through a [`TapPrompter`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::{Psbt, Txid};
use sweep_common::{
    HardwareCommands, HardwareError, HardwareInteraction, HardwareSession, HardwareTransport,
    KeySet, SealedKey, SweepBatch, UnsealedKey, MAX_TAPS,
};
use tracing::instrument;

use crate::settings::Settings;

/// Session held for exactly one tap
#[derive(Debug)]
pub struct SessionGuard {
    session: Box<dyn HardwareSession>,
}

impl SessionGuard {
    /// Acquire a new session
    pub async fn acquire(transport: &dyn HardwareTransport) -> Result<Self, HardwareError> {
        let session = transport.open_session().await?;
        tracing::debug!("Acquired hardware session {}", session.id());
        Ok(Self { session })
    }

    /// Session identifier
    pub fn id(&self) -> u64 {
        self.session.id()
    }

    /// The session
    pub fn session(&mut self) -> &mut dyn HardwareSession {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
        tracing::debug!("Released hardware session {}", self.session.id());
    }
}

/// User side of a multi-tap interaction
#[async_trait]
pub trait TapPrompter: Send + Sync {
    /// Ask the user to confirm on the device, then tap again for tap number `tap`
    async fn request_confirmation(&self, tap: usize) -> Result<(), HardwareError>;

    /// Ask the user to pick one of the emulated prompt options, returning its index
    async fn choose(&self, labels: &[String]) -> Result<usize, HardwareError>;
}

/// Prompter that confirms everything and picks the first emulated option
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

#[async_trait]
impl TapPrompter for AutoConfirm {
    async fn request_confirmation(&self, _tap: usize) -> Result<(), HardwareError> {
        Ok(())
    }

    async fn choose(&self, _labels: &[String]) -> Result<usize, HardwareError> {
        Ok(0)
    }
}

/// Runs hardware commands and follows their interactions to a result
pub struct TapDriver {
    transport: Arc<dyn HardwareTransport>,
    prompter: Arc<dyn TapPrompter>,
    max_taps: usize,
}

impl std::fmt::Debug for TapDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapDriver")
            .field("max_taps", &self.max_taps)
            .finish_non_exhaustive()
    }
}

impl TapDriver {
    /// Create new [`TapDriver`] allowing [`MAX_TAPS`] taps per interaction
    pub fn new(transport: Arc<dyn HardwareTransport>, prompter: Arc<dyn TapPrompter>) -> Self {
        Self {
            transport,
            prompter,
            max_taps: MAX_TAPS,
        }
    }

    /// Create new [`TapDriver`] bounded by `sweep.max_hardware_taps`
    pub fn from_settings(
        settings: &Settings,
        transport: Arc<dyn HardwareTransport>,
        prompter: Arc<dyn TapPrompter>,
    ) -> Self {
        Self::new(transport, prompter).with_max_taps(settings.sweep.max_hardware_taps)
    }

    /// Override the tap bound
    pub fn with_max_taps(mut self, max_taps: usize) -> Self {
        self.max_taps = max_taps.max(1);
        self
    }

    fn ensure_tap_available(&self, taps: usize) -> Result<(), HardwareError> {
        if taps >= self.max_taps {
            tracing::warn!("Hardware interaction did not complete in {} taps", taps);
            return Err(HardwareError::TapLimitExceeded(self.max_taps));
        }
        Ok(())
    }

    /// Follow an interaction started on the first tap until it completes
    pub async fn complete<R: Send + 'static>(
        &self,
        interaction: HardwareInteraction<R>,
    ) -> Result<R, HardwareError> {
        let mut interaction = interaction;
        let mut taps = 1;

        loop {
            tracing::debug!("Hardware tap {} returned {}", taps, interaction.name());

            let continuation = match interaction {
                HardwareInteraction::Completed(result) => return Ok(result),
                HardwareInteraction::RequiresConfirmation(continuation) => {
                    self.ensure_tap_available(taps)?;
                    self.prompter.request_confirmation(taps + 1).await?;
                    continuation
                }
                HardwareInteraction::ConfirmWithEmulatedPrompt(mut options) => {
                    self.ensure_tap_available(taps)?;
                    let labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();
                    let choice = self.prompter.choose(&labels).await?;
                    if choice >= options.len() {
                        return Err(HardwareError::InvalidPromptSelection(choice));
                    }
                    let option = options.swap_remove(choice);
                    tracing::debug!("Emulated prompt option `{}` selected", option.label);
                    if let Some(on_select) = option.on_select {
                        on_select();
                    }
                    option.continuation
                }
            };

            taps += 1;
            let mut guard = SessionGuard::acquire(self.transport.as_ref()).await?;
            interaction = continuation.resume(guard.session()).await?;
            drop(guard);
        }
    }

    /// Hardware-sign one PSBT
    #[instrument(skip(self, commands, psbt), fields(key_set = %key_set.id))]
    pub async fn sign_transaction(
        &self,
        commands: &dyn HardwareCommands,
        psbt: &Psbt,
        key_set: &KeySet,
    ) -> Result<Psbt, HardwareError> {
        let mut guard = SessionGuard::acquire(self.transport.as_ref()).await?;
        let interaction = commands
            .sign_transaction(guard.session(), psbt, key_set)
            .await?;
        drop(guard);
        self.complete(interaction).await
    }

    /// Hardware-sign every sweep of the batch that needs it into `signed`,
    /// keyed by txid.
    ///
    /// Sweeps already in `signed` are skipped. On error the sweeps signed so
    /// far stay in `signed`, so tapping again only signs the rest.
    #[instrument(skip_all)]
    pub async fn sign_sweeps(
        &self,
        commands: &dyn HardwareCommands,
        batch: &SweepBatch,
        signed: &mut HashMap<Txid, Psbt>,
    ) -> Result<(), HardwareError> {
        for (key_set_id, sweep) in batch.hardware_required() {
            if signed.contains_key(&sweep.txid) {
                tracing::debug!("Sweep {} already hardware signed", sweep.txid);
                continue;
            }
            tracing::info!("Hardware signing sweep {} for key set {}", sweep.txid, key_set_id);
            let psbt = self
                .sign_transaction(commands, &sweep.psbt, &sweep.source)
                .await?;
            signed.insert(sweep.txid, psbt);
        }
        Ok(())
    }

    /// Seal key material with the device
    pub async fn seal_key(
        &self,
        commands: &dyn HardwareCommands,
        key: &UnsealedKey,
    ) -> Result<SealedKey, HardwareError> {
        let mut guard = SessionGuard::acquire(self.transport.as_ref()).await?;
        let interaction = commands.seal_key(guard.session(), key).await?;
        drop(guard);
        self.complete(interaction).await
    }

    /// Unseal key material sealed by the device
    pub async fn unseal_key(
        &self,
        commands: &dyn HardwareCommands,
        sealed: &SealedKey,
    ) -> Result<UnsealedKey, HardwareError> {
        let mut guard = SessionGuard::acquire(self.transport.as_ref()).await?;
        let interaction = commands.unseal_key(guard.session(), sealed).await?;
        drop(guard);
        self.complete(interaction).await
    }

    /// Sign an authentication challenge
    pub async fn sign_challenge(
        &self,
        commands: &dyn HardwareCommands,
        challenge: &[u8],
    ) -> Result<Signature, HardwareError> {
        let mut guard = SessionGuard::acquire(self.transport.as_ref()).await?;
        let interaction = commands.sign_challenge(guard.session(), challenge).await?;
        drop(guard);
        self.complete(interaction).await
    }
}
