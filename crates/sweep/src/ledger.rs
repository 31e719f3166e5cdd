//! Broadcaster and ledger writer

use std::sync::Arc;

use bitcoin::{Amount, Psbt, Txid};
use sweep_common::{
    BroadcastError, Broadcaster, ExchangeRateProvider, SignedOutcome, TransactionRepository,
    UnsignedSweep,
};
use tracing::instrument;

/// Broadcasts fully signed sweeps and records them in the ledger.
///
/// The network is the source of truth: once a broadcast succeeded the sweep
/// is done, and a failure to record it is only logged.
pub struct LedgerWriter {
    broadcaster: Arc<dyn Broadcaster>,
    repository: Arc<dyn TransactionRepository>,
    exchange_rates: Arc<dyn ExchangeRateProvider>,
}

impl std::fmt::Debug for LedgerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerWriter").finish_non_exhaustive()
    }
}

impl LedgerWriter {
    /// Create new [`LedgerWriter`]
    pub fn new(
        broadcaster: Arc<dyn Broadcaster>,
        repository: Arc<dyn TransactionRepository>,
        exchange_rates: Arc<dyn ExchangeRateProvider>,
    ) -> Self {
        Self {
            broadcaster,
            repository,
            exchange_rates,
        }
    }

    /// Broadcast `signed` and, on success, record the outcome
    #[instrument(skip_all, fields(txid = %sweep.txid, key_set = %sweep.source.id))]
    pub async fn broadcast_and_record(
        &self,
        sweep: &UnsignedSweep,
        signed: &Psbt,
    ) -> Result<SignedOutcome, BroadcastError> {
        let receipt = self.broadcaster.broadcast(signed).await?;
        if receipt.txid != sweep.txid {
            tracing::warn!(
                "Broadcast reported txid {} for sweep {}",
                receipt.txid,
                sweep.txid
            );
        }
        tracing::info!("Broadcast sweep {}", receipt.txid);

        let outcome = SignedOutcome {
            txid: receipt.txid,
            key_set: sweep.source.id.clone(),
            fee: sweep.fee,
            amount: sweep.sweep_amount().unwrap_or(Amount::ZERO),
            broadcast_time: receipt.broadcast_time,
            exchange_rate: self.exchange_rates.current_rate().await,
        };

        if let Err(err) = self.repository.set_transaction(outcome.clone()).await {
            tracing::error!(
                "Sweep {} broadcast but could not be recorded: {}",
                outcome.txid,
                err
            );
        }

        Ok(outcome)
    }

    /// Whether a previous attempt already recorded `txid`
    pub async fn is_recorded(&self, txid: &Txid) -> bool {
        match self.repository.get_transaction(txid).await {
            Ok(outcome) => outcome.is_some(),
            Err(err) => {
                tracing::warn!("Could not look up sweep {} in the ledger: {}", txid, err);
                false
            }
        }
    }
}
