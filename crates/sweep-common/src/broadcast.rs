//! Broadcast transport, ledger and exchange rate interfaces

use async_trait::async_trait;
use bitcoin::{Psbt, Txid};

use crate::error::{BroadcastError, PersistenceError};
use crate::sweep::{BroadcastReceipt, ExchangeRate, SignedOutcome};

/// Submits fully signed transactions to the network
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Broadcast the transaction of a fully signed PSBT
    async fn broadcast(&self, psbt: &Psbt) -> Result<BroadcastReceipt, BroadcastError>;
}

/// Local transaction ledger
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Record a broadcast sweep
    async fn set_transaction(&self, outcome: SignedOutcome) -> Result<(), PersistenceError>;

    /// Look up a recorded sweep
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<SignedOutcome>, PersistenceError>;
}

/// Display exchange rate source
#[async_trait]
pub trait ExchangeRateProvider: Send + Sync {
    /// Current rate, `None` if unavailable
    async fn current_rate(&self) -> Option<ExchangeRate>;
}
