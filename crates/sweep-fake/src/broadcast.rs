//! Fake broadcaster, in-memory ledger and fixed exchange rate

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Psbt, Txid};
use sweep_common::util::unix_time;
use sweep_common::{
    BroadcastError, BroadcastReceipt, Broadcaster, ExchangeRate, ExchangeRateProvider,
    PersistenceError, SignedOutcome, TransactionRepository,
};
use tokio::sync::Mutex;

use crate::chain::FakeChain;
use crate::signature::{self, Party};

/// Broadcaster applying transactions to a [`FakeChain`].
///
/// A payload is accepted only when both the app and the server signed it.
#[derive(Debug)]
pub struct FakeBroadcaster {
    chain: Arc<FakeChain>,
    calls: AtomicUsize,
    failures: Mutex<HashMap<usize, BroadcastError>>,
    accepted: Mutex<Vec<Psbt>>,
}

impl FakeBroadcaster {
    /// Create new [`FakeBroadcaster`]
    pub fn new(chain: Arc<FakeChain>) -> Self {
        Self {
            chain,
            calls: AtomicUsize::new(0),
            failures: Mutex::new(HashMap::new()),
            accepted: Mutex::new(Vec::new()),
        }
    }

    /// Fail the `n`th call (1-based) with `error`
    pub async fn fail_call(&self, n: usize, error: BroadcastError) {
        self.failures.lock().await.insert(n, error);
    }

    /// Calls received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Payloads accepted so far, in order
    pub async fn accepted(&self) -> Vec<Psbt> {
        self.accepted.lock().await.clone()
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn broadcast(&self, psbt: &Psbt) -> Result<BroadcastReceipt, BroadcastError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.failures.lock().await.remove(&n) {
            tracing::debug!(call = n, "Fake broadcast failure injected");
            return Err(err);
        }

        for party in [Party::App, Party::Server] {
            if !signature::is_signed_by(psbt, party) {
                return Err(BroadcastError::Malformed(format!(
                    "missing {party:?} signature"
                )));
            }
        }

        let tx = psbt.clone().extract_tx_unchecked_fee_rate();
        let txid = self
            .chain
            .apply(&tx)
            .await
            .map_err(BroadcastError::Rejected)?;
        self.accepted.lock().await.push(psbt.clone());

        Ok(BroadcastReceipt {
            txid,
            broadcast_time: unix_time(),
        })
    }
}

/// In-memory transaction ledger
#[derive(Debug, Default)]
pub struct MemoryTransactionRepository {
    outcomes: Mutex<BTreeMap<Txid, SignedOutcome>>,
    fail_writes: AtomicBool,
}

impl MemoryTransactionRepository {
    /// Create new [`MemoryTransactionRepository`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every recorded outcome
    pub async fn outcomes(&self) -> Vec<SignedOutcome> {
        self.outcomes.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl TransactionRepository for MemoryTransactionRepository {
    async fn set_transaction(&self, outcome: SignedOutcome) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError("disk full".to_string()));
        }
        self.outcomes.lock().await.insert(outcome.txid, outcome);
        Ok(())
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Option<SignedOutcome>, PersistenceError> {
        Ok(self.outcomes.lock().await.get(txid).cloned())
    }
}

/// Exchange rate provider returning a fixed rate
#[derive(Debug, Clone, Default)]
pub struct FixedExchangeRate {
    rate: Option<ExchangeRate>,
}

impl FixedExchangeRate {
    /// Always `rate` in `currency`
    pub fn new<S: Into<String>>(currency: S, rate: f64) -> Self {
        Self {
            rate: Some(ExchangeRate {
                currency: currency.into(),
                rate,
                time: unix_time(),
            }),
        }
    }

    /// Never any rate
    pub fn unavailable() -> Self {
        Self { rate: None }
    }
}

#[async_trait]
impl ExchangeRateProvider for FixedExchangeRate {
    async fn current_rate(&self) -> Option<ExchangeRate> {
        self.rate.clone()
    }
}
