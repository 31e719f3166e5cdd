//! Sweep orchestrator
//!
//! Single-writer state machine sequencing one sweep attempt for an account:
//! generation, the optional hardware round-trip, then app signing,
//! co-signing and broadcast sweep by sweep.
//!
//! # Events
//!
//! | Event | Accepted in | Leads to |
//! |-------|-------------|----------|
//! | `generate` | `GeneratingPsbts` | `NoFundsFound`, `PsbtsGenerated`, `GeneratePsbtsFailed` |
//! | `start_sweep` | `PsbtsGenerated` | `AwaitingHardwareSignedSweeps` or `SignAndBroadcast` |
//! | `submit_hardware_signed` | `AwaitingHardwareSignedSweeps` | `SignAndBroadcast` |
//! | `retry` | `GeneratePsbtsFailed`, `SweepFailed` | `GeneratingPsbts` |
//! | `cancel` | before `SignAndBroadcast` | `Cancelled` |
//!
//! `SignAndBroadcast` always runs to `SweepComplete` or `SweepFailed`
//! within the event that entered it. The first failure aborts the rest of
//! the batch; retry regenerates the batch from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{Psbt, Txid};
use sweep_common::{
    AccountId, Broadcaster, ConfirmationTarget, Environment, Error, ExchangeRateProvider,
    FeeEstimator, GenerationOutcome, ServerCoSigner, SignedOutcome, SigningError, SweepBatch,
    TransactionRepository, UnsignedSweep, WalletProvider,
};
use tokio::sync::watch;
use tracing::instrument;
use uuid::Uuid;

use crate::generator::SweepGenerator;
use crate::ledger::LedgerWriter;
use crate::settings::Settings;

mod actor;
mod state;

pub use self::actor::{AccountLockGuard, AccountLocks, SweepActor, SweepHandle};
pub use self::state::{SweepFailure, SweepState, SweepSummary};

/// Collaborators of a sweep
#[derive(Clone)]
pub struct SweepServices {
    /// Wallets of the account's key sets
    pub wallets: Arc<dyn WalletProvider>,
    /// Fee environment
    pub fee_estimator: Arc<dyn FeeEstimator>,
    /// Remote co-signer
    pub co_signer: Arc<dyn ServerCoSigner>,
    /// Broadcast transport
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Transaction ledger
    pub repository: Arc<dyn TransactionRepository>,
    /// Display exchange rates
    pub exchange_rates: Arc<dyn ExchangeRateProvider>,
}

impl std::fmt::Debug for SweepServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepServices").finish_non_exhaustive()
    }
}

/// Sweep orchestrator for one account
pub struct SweepOrchestrator {
    account_id: AccountId,
    environment: Environment,
    wallets: Arc<dyn WalletProvider>,
    co_signer: Arc<dyn ServerCoSigner>,
    generator: SweepGenerator,
    ledger: LedgerWriter,
    attempt_id: Uuid,
    state: watch::Sender<SweepState>,
}

impl std::fmt::Debug for SweepOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepOrchestrator")
            .field("account_id", &self.account_id)
            .field("environment", &self.environment)
            .field("attempt_id", &self.attempt_id)
            .field("state", &self.state.borrow().name())
            .finish_non_exhaustive()
    }
}

impl SweepOrchestrator {
    /// Create new [`SweepOrchestrator`] in `GeneratingPsbts`
    pub fn new(account_id: AccountId, environment: Environment, services: SweepServices) -> Self {
        let generator =
            SweepGenerator::new(services.wallets.clone(), services.fee_estimator.clone());
        let ledger = LedgerWriter::new(
            services.broadcaster,
            services.repository,
            services.exchange_rates,
        );
        let (state, _) = watch::channel(SweepState::GeneratingPsbts);

        Self {
            account_id,
            environment,
            wallets: services.wallets,
            co_signer: services.co_signer,
            generator,
            ledger,
            attempt_id: Uuid::new_v4(),
            state,
        }
    }

    /// Create new [`SweepOrchestrator`] for the account, environment,
    /// network and confirmation target of `settings`
    pub fn from_settings(
        settings: &Settings,
        services: SweepServices,
    ) -> Result<Self, config::ConfigError> {
        Ok(
            Self::new(settings.account_id(), settings.environment()?, services)
                .with_confirmation_target(settings.confirmation_target())
                .with_network(settings.network),
        )
    }

    /// Override the fee estimation confirmation target
    pub fn with_confirmation_target(mut self, target: ConfirmationTarget) -> Self {
        self.generator = self.generator.with_confirmation_target(target);
        self
    }

    /// Reject sweep destinations that are not valid on `network`
    pub fn with_network(mut self, network: bitcoin::Network) -> Self {
        self.generator = self.generator.with_network(network);
        self
    }

    /// Account being swept
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Current attempt, renewed on every retry
    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    /// Snapshot of the current state
    pub fn state(&self) -> SweepState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<SweepState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SweepState) {
        let from = self.state.borrow().name();
        tracing::info!(
            "Sweep {} for account {}: {} -> {}",
            self.attempt_id,
            self.account_id,
            from,
            next.name()
        );
        self.state.send_replace(next);
    }

    /// Batch of the current state if `accepts` it
    fn batch_in(&self, accepts: impl Fn(&SweepState) -> bool) -> Option<SweepBatch> {
        let state = self.state.borrow();
        if accepts(&state) {
            state.batch().cloned()
        } else {
            None
        }
    }

    fn reject(&self, event: &'static str) -> Error {
        let state = self.state.borrow().name();
        tracing::warn!("Rejected `{}` in state `{}`", event, state);
        Error::InvalidTransition { state, event }
    }

    /// Run the generation pass.
    ///
    /// Generation failures land in `GeneratePsbtsFailed`; the returned error
    /// is reserved for events the current state does not accept.
    #[instrument(skip(self), fields(account = %self.account_id))]
    pub async fn generate(&mut self) -> Result<SweepState, Error> {
        if !matches!(*self.state.borrow(), SweepState::GeneratingPsbts) {
            return Err(self.reject("generate"));
        }

        let next = match self.generator.generate_for_account(&self.account_id).await {
            Ok(GenerationOutcome::Empty) => SweepState::NoFundsFound,
            Ok(GenerationOutcome::Batch(batch)) => match self.drop_recorded(batch).await {
                Some(batch) => SweepState::PsbtsGenerated { batch },
                None => SweepState::NoFundsFound,
            },
            Err(err) => {
                tracing::error!("Sweep generation failed: {}", err);
                SweepState::GeneratePsbtsFailed { cause: err.into() }
            }
        };

        self.transition(next);
        Ok(self.state())
    }

    /// Drop sweeps an interrupted attempt already broadcast
    async fn drop_recorded(&self, batch: SweepBatch) -> Option<SweepBatch> {
        let mut remaining = Vec::with_capacity(batch.len());
        for sweep in batch.into_sweeps() {
            if self.ledger.is_recorded(&sweep.txid).await {
                tracing::warn!(
                    "Sweep {} for key set {} was already broadcast, skipping",
                    sweep.txid,
                    sweep.source.id
                );
                continue;
            }
            remaining.push(sweep);
        }
        SweepBatch::new(remaining)
    }

    /// User confirmed the sweep
    #[instrument(skip(self), fields(account = %self.account_id))]
    pub async fn start_sweep(&mut self) -> Result<SweepState, Error> {
        let Some(batch) = self.batch_in(|s| matches!(s, SweepState::PsbtsGenerated { .. })) else {
            return Err(self.reject("start_sweep"));
        };

        if batch.requires_hardware() {
            self.transition(SweepState::AwaitingHardwareSignedSweeps { batch });
        } else {
            self.sign_and_broadcast(batch).await;
        }

        Ok(self.state())
    }

    /// Hardware-signed payloads for every hardware-plan sweep, keyed by txid.
    ///
    /// A missing or mismatched payload is rejected and the state is kept, so
    /// the caller can tap again and resubmit.
    #[instrument(skip_all, fields(account = %self.account_id))]
    pub async fn submit_hardware_signed(
        &mut self,
        signed: HashMap<Txid, Psbt>,
    ) -> Result<SweepState, Error> {
        let Some(mut batch) = self.batch_in(|s| {
            matches!(s, SweepState::AwaitingHardwareSignedSweeps { .. })
        }) else {
            return Err(self.reject("submit_hardware_signed"));
        };

        if let Err(err) = batch.merge_hardware_signed(&signed) {
            tracing::warn!("Hardware signed payloads rejected: {}", err);
            return Err(err);
        }

        self.sign_and_broadcast(batch).await;
        Ok(self.state())
    }

    /// Start over from generation after a failure
    #[instrument(skip(self), fields(account = %self.account_id))]
    pub async fn retry(&mut self) -> Result<SweepState, Error> {
        self.restart()?;
        self.generate().await
    }

    /// Start a new attempt in `GeneratingPsbts` without generating yet
    fn restart(&mut self) -> Result<(), Error> {
        if !matches!(
            *self.state.borrow(),
            SweepState::GeneratePsbtsFailed { .. } | SweepState::SweepFailed(_)
        ) {
            return Err(self.reject("retry"));
        }

        self.attempt_id = Uuid::new_v4();
        self.transition(SweepState::GeneratingPsbts);
        Ok(())
    }

    /// Abandon the sweep. Only possible before anything was broadcast.
    pub fn cancel(&mut self) -> Result<SweepState, Error> {
        let state = self.state.borrow().clone();
        if state.is_cancellable() {
            self.transition(SweepState::Cancelled);
            return Ok(self.state());
        }
        if let SweepState::SignAndBroadcast { .. } = state {
            return Err(Error::CancellationNotAllowed);
        }
        Err(self.reject("cancel"))
    }

    async fn sign_and_broadcast(&mut self, batch: SweepBatch) {
        let total_fee = match batch.total_fee() {
            Ok(total_fee) => total_fee,
            Err(cause) => {
                self.transition(SweepState::SweepFailed(SweepFailure {
                    cause,
                    completed: vec![],
                    failed_sweep: None,
                }));
                return;
            }
        };

        self.transition(SweepState::SignAndBroadcast {
            batch: batch.clone(),
            completed: vec![],
        });

        let mut completed: Vec<SignedOutcome> = Vec::with_capacity(batch.len());
        for sweep in batch.sweeps() {
            match self.sign_and_broadcast_one(sweep).await {
                Ok(outcome) => {
                    completed.push(outcome);
                    self.state.send_replace(SweepState::SignAndBroadcast {
                        batch: batch.clone(),
                        completed: completed.clone(),
                    });
                }
                Err((cause, latest)) => {
                    tracing::error!("Sweep {} failed: {}", sweep.txid, cause);
                    let failed_sweep = UnsignedSweep {
                        psbt: latest,
                        ..sweep.clone()
                    };
                    self.transition(SweepState::SweepFailed(SweepFailure {
                        cause,
                        completed,
                        failed_sweep: Some(Box::new(failed_sweep)),
                    }));
                    return;
                }
            }
        }

        self.transition(SweepState::SweepComplete(SweepSummary {
            outcomes: completed,
            total_fee,
        }));
    }

    /// App-sign, co-sign and broadcast one sweep.
    ///
    /// On failure returns the cause together with the latest payload, which
    /// keeps every signature gathered before the failing step.
    #[instrument(skip_all, fields(txid = %sweep.txid, plan = %sweep.plan))]
    async fn sign_and_broadcast_one(
        &self,
        sweep: &UnsignedSweep,
    ) -> Result<SignedOutcome, (Error, Psbt)> {
        let mut psbt = sweep.psbt.clone();

        if sweep.plan.requires_app() {
            let signing_error = |cause: String| -> Error {
                SigningError {
                    key_set: sweep.source.id.clone(),
                    cause,
                }
                .into()
            };

            let wallet = match self.wallets.spending_wallet(&sweep.source).await {
                Ok(wallet) => wallet,
                Err(err) => return Err((signing_error(err.to_string()), psbt)),
            };
            psbt = match wallet.sign_psbt(&psbt).await {
                Ok(signed) => signed,
                Err(err) => return Err((signing_error(err.to_string()), psbt)),
            };
            tracing::debug!("App signed sweep {}", sweep.txid);
        }

        if sweep.plan.requires_server() {
            psbt = match self
                .co_signer
                .co_sign(
                    &self.environment,
                    &self.account_id,
                    &sweep.source.server_key_set_id,
                    &psbt,
                )
                .await
            {
                Ok(signed) => signed,
                Err(err) => return Err((err.into(), psbt)),
            };
            tracing::debug!("Server co-signed sweep {}", sweep.txid);
        }

        match self.ledger.broadcast_and_record(sweep, &psbt).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err((err.into(), psbt)),
        }
    }
}
