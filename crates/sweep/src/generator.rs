//! Sweep generator
//!
//! Produces one unsigned sweep per inactive key set that holds value worth
//! moving. Key sets whose balance does not cover the fee are skipped
//! silently; any other failure aborts the whole pass, since a batch that
//! quietly omits a key set would under-recover funds.

use std::sync::Arc;

use bitcoin::{Address, FeeRate, Network};
use sweep_common::key_set::single_active;
use sweep_common::{
    AccountId, BuildSweepError, ConfirmationTarget, FeeEstimator, GenerationOutcome, KeySet,
    KeySetId, SignaturePlan, SweepBatch, SweepError, UnsignedSweep, WalletProvider,
};
use tracing::instrument;

/// Builds [`SweepBatch`]es
pub struct SweepGenerator {
    wallets: Arc<dyn WalletProvider>,
    fee_estimator: Arc<dyn FeeEstimator>,
    confirmation_target: ConfirmationTarget,
    network: Option<Network>,
}

impl std::fmt::Debug for SweepGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepGenerator")
            .field("confirmation_target", &self.confirmation_target)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl SweepGenerator {
    /// Create new [`SweepGenerator`] estimating fees for a 30 minute target
    pub fn new(wallets: Arc<dyn WalletProvider>, fee_estimator: Arc<dyn FeeEstimator>) -> Self {
        Self {
            wallets,
            fee_estimator,
            confirmation_target: ConfirmationTarget::THIRTY_MINUTES,
            network: None,
        }
    }

    /// Override the confirmation target
    pub fn with_confirmation_target(mut self, target: ConfirmationTarget) -> Self {
        self.confirmation_target = target;
        self
    }

    /// Reject destinations that are not valid on `network`
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    /// Confirmation target used for fee estimation
    pub fn confirmation_target(&self) -> ConfirmationTarget {
        self.confirmation_target
    }

    /// Enumerate the account's key sets and generate sweeps for it
    #[instrument(skip(self))]
    pub async fn generate_for_account(
        &self,
        account_id: &AccountId,
    ) -> Result<GenerationOutcome, SweepError> {
        let key_sets = self
            .wallets
            .key_sets(account_id)
            .await
            .map_err(|e| SweepError::FailedToListKeySets(e.to_string()))?;

        let active = single_active(&key_sets).ok_or(SweepError::NoActiveKeySet)?;

        self.generate(&active.id, &key_sets).await
    }

    /// Generate one sweep per inactive key set with value above the fee
    #[instrument(skip(self, key_sets))]
    pub async fn generate(
        &self,
        active_key_set_id: &KeySetId,
        key_sets: &[KeySet],
    ) -> Result<GenerationOutcome, SweepError> {
        let active = key_sets
            .iter()
            .find(|k| &k.id == active_key_set_id)
            .ok_or(SweepError::NoActiveKeySet)?;

        let candidates: Vec<&KeySet> = key_sets
            .iter()
            .filter(|k| &k.id != active_key_set_id)
            .collect();

        if candidates.is_empty() {
            tracing::info!("No inactive key sets to sweep");
            return Ok(GenerationOutcome::Empty);
        }

        let fee_rate = self
            .fee_estimator
            .fee_rate(self.confirmation_target)
            .await
            .map_err(|e| SweepError::FailedToEstimateFee(e.to_string()))?;

        let destination = self.destination(active).await?;

        tracing::debug!(
            "Generating sweeps for {} key sets at {} sat/vB",
            candidates.len(),
            fee_rate.to_sat_per_vb_ceil()
        );

        let mut sweeps = Vec::with_capacity(candidates.len());
        for key_set in candidates {
            if let Some(sweep) = self.sweep_for(key_set, &destination, fee_rate).await? {
                sweeps.push(sweep);
            }
        }

        match SweepBatch::new(sweeps) {
            Some(batch) => {
                tracing::info!(
                    "Generated {} sweeps, {} requiring hardware",
                    batch.len(),
                    batch.hardware_required().len()
                );
                Ok(GenerationOutcome::Batch(batch))
            }
            None => {
                tracing::info!("No key set holds value worth sweeping");
                Ok(GenerationOutcome::Empty)
            }
        }
    }

    async fn destination(&self, active: &KeySet) -> Result<Address, SweepError> {
        let wallet = self
            .wallets
            .spending_wallet(active)
            .await
            .map_err(|e| SweepError::FailedToResolveDestination(e.to_string()))?;
        let address = wallet
            .receive_address()
            .await
            .map_err(|e| SweepError::FailedToResolveDestination(e.to_string()))?;

        if let Some(network) = self.network {
            if !address.as_unchecked().is_valid_for_network(network) {
                return Err(SweepError::FailedToResolveDestination(format!(
                    "{address} is not valid on {network}"
                )));
            }
        }

        Ok(address)
    }

    /// Sweep for one key set, `None` when there is nothing worth moving
    async fn sweep_for(
        &self,
        key_set: &KeySet,
        destination: &Address,
        fee_rate: FeeRate,
    ) -> Result<Option<UnsignedSweep>, SweepError> {
        let build_error = |cause: String| SweepError::FailedToBuildTransaction {
            key_set: key_set.id.clone(),
            cause,
        };

        let wallet = self
            .wallets
            .spending_wallet(key_set)
            .await
            .map_err(|e| build_error(e.to_string()))?;

        let balance = wallet
            .spendable_balance()
            .await
            .map_err(|e| build_error(e.to_string()))?;
        if balance == bitcoin::Amount::ZERO {
            tracing::debug!("Key set {} has no spendable balance", key_set.id);
            return Ok(None);
        }

        let sweep_psbt = match wallet.create_sweep_psbt(destination, fee_rate).await {
            Ok(sweep_psbt) => sweep_psbt,
            Err(BuildSweepError::InsufficientFunds) => {
                tracing::info!(
                    "Skipping key set {}: balance {} does not cover the fee",
                    key_set.id,
                    balance
                );
                return Ok(None);
            }
            Err(BuildSweepError::Backend(err)) => return Err(build_error(err.to_string())),
        };

        // The output must clear the destination's dust limit or the
        // broadcast is rejected
        let dust_limit = destination.script_pubkey().minimal_non_dust();
        let floor = sweep_psbt
            .fee
            .checked_add(dust_limit)
            .ok_or_else(|| build_error("amount overflow".to_string()))?;
        if sweep_psbt.total_input < floor {
            tracing::info!(
                "Skipping key set {}: inputs {} do not cover fee {} plus dust limit {}",
                key_set.id,
                sweep_psbt.total_input,
                sweep_psbt.fee,
                dust_limit
            );
            return Ok(None);
        }

        let plan =
            SignaturePlan::for_key_set(self.wallets.is_hardware_authorization_cached(key_set).await);

        let sweep = UnsignedSweep::new(key_set.clone(), sweep_psbt, plan);
        tracing::debug!(
            "Sweep {} for key set {}: fee {}, {} inputs, plan {}",
            sweep.txid,
            key_set.id,
            sweep.fee,
            sweep.input_count,
            sweep.plan
        );

        Ok(Some(sweep))
    }
}
