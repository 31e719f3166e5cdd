//! Fake wallet provider backed by [`FakeChain`]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{rand, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, FeeRate, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use sweep_common::{
    AccountId, BuildSweepError, ConfirmationTarget, FeeEstimator, KeySet, KeySetId,
    ServerKeySetId, SpendingWallet, SweepPsbt, WalletProvider,
};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::chain::FakeChain;
use crate::signature::{self, Party};

/// Virtual size of a transaction without inputs or outputs
const TX_OVERHEAD_VB: u64 = 11;
/// Virtual size of a 2-of-3 p2wsh input
const INPUT_VB: u64 = 105;
/// Virtual size of a p2wsh output
const OUTPUT_VB: u64 = 43;

/// Key set with fresh random public keys
pub fn fake_key_set(id: &str, active: bool) -> KeySet {
    let secp = Secp256k1::new();
    let (_, app_pubkey) = secp.generate_keypair(&mut rand::thread_rng());
    let (_, hardware_pubkey) = secp.generate_keypair(&mut rand::thread_rng());
    KeySet::new(
        KeySetId::new(id),
        app_pubkey,
        hardware_pubkey,
        ServerKeySetId::new(format!("server-{id}")),
        active,
    )
}

/// Fake wallet provider
#[derive(Debug)]
pub struct FakeWalletProvider {
    chain: Arc<FakeChain>,
    key_sets: RwLock<Vec<KeySet>>,
    hardware_cached: Arc<Mutex<HashSet<KeySetId>>>,
    failing_builds: Arc<Mutex<HashSet<KeySetId>>>,
    failing_signs: Arc<Mutex<HashSet<KeySetId>>>,
    fail_listing: AtomicBool,
    fixed_fee: Option<Amount>,
}

impl FakeWalletProvider {
    /// Create new [`FakeWalletProvider`]
    pub fn new(chain: Arc<FakeChain>, key_sets: Vec<KeySet>) -> Self {
        Self {
            chain,
            key_sets: RwLock::new(key_sets),
            hardware_cached: Arc::new(Mutex::new(HashSet::new())),
            failing_builds: Arc::new(Mutex::new(HashSet::new())),
            failing_signs: Arc::new(Mutex::new(HashSet::new())),
            fail_listing: AtomicBool::new(false),
            fixed_fee: None,
        }
    }

    /// Charge exactly `fee` per sweep regardless of the fee rate
    pub fn with_fixed_fee(mut self, fee: Amount) -> Self {
        self.fixed_fee = Some(fee);
        self
    }

    /// Mark a key set's hardware authorization as cached
    pub async fn cache_hardware_authorization(&self, key_set_id: &KeySetId) {
        self.hardware_cached.lock().await.insert(key_set_id.clone());
    }

    /// Make sweep construction fail for a key set
    pub async fn fail_build_for(&self, key_set_id: &KeySetId) {
        self.failing_builds.lock().await.insert(key_set_id.clone());
    }

    /// Make app signing fail for a key set
    pub async fn fail_sign_for(&self, key_set_id: &KeySetId) {
        self.failing_signs.lock().await.insert(key_set_id.clone());
    }

    /// Make key set enumeration fail
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletProvider for FakeWalletProvider {
    async fn key_sets(&self, account_id: &AccountId) -> Result<Vec<KeySet>, anyhow::Error> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(anyhow!("key set listing unavailable for {account_id}"));
        }
        Ok(self.key_sets.read().await.clone())
    }

    async fn spending_wallet(
        &self,
        key_set: &KeySet,
    ) -> Result<Arc<dyn SpendingWallet>, anyhow::Error> {
        self.chain.register(&key_set.id).await;
        Ok(Arc::new(FakeSpendingWallet {
            key_set: key_set.clone(),
            chain: self.chain.clone(),
            fixed_fee: self.fixed_fee,
            fail_build: self.failing_builds.lock().await.contains(&key_set.id),
            fail_sign: self.failing_signs.lock().await.contains(&key_set.id),
        }))
    }

    async fn is_hardware_authorization_cached(&self, key_set: &KeySet) -> bool {
        self.hardware_cached.lock().await.contains(&key_set.id)
    }
}

/// Fake wallet for one key set
#[derive(Debug)]
pub struct FakeSpendingWallet {
    key_set: KeySet,
    chain: Arc<FakeChain>,
    fixed_fee: Option<Amount>,
    fail_build: bool,
    fail_sign: bool,
}

impl FakeSpendingWallet {
    fn fee(&self, fee_rate: FeeRate, inputs: usize) -> Result<Amount, BuildSweepError> {
        if let Some(fee) = self.fixed_fee {
            return Ok(fee);
        }
        let vsize = TX_OVERHEAD_VB + INPUT_VB * inputs as u64 + OUTPUT_VB;
        fee_rate
            .fee_vb(vsize)
            .ok_or_else(|| BuildSweepError::Backend(anyhow!("fee overflow")))
    }
}

#[async_trait]
impl SpendingWallet for FakeSpendingWallet {
    async fn spendable_balance(&self) -> Result<Amount, anyhow::Error> {
        Ok(self.chain.balance(&self.key_set.id).await)
    }

    async fn receive_address(&self) -> Result<Address, anyhow::Error> {
        Ok(FakeChain::address_for(&self.key_set.id))
    }

    #[instrument(skip(self, destination), fields(key_set = %self.key_set.id))]
    async fn create_sweep_psbt(
        &self,
        destination: &Address,
        fee_rate: FeeRate,
    ) -> Result<SweepPsbt, BuildSweepError> {
        if self.fail_build {
            return Err(BuildSweepError::Backend(anyhow!(
                "descriptor unavailable for {}",
                self.key_set.id
            )));
        }

        let utxos = self.chain.unspent(&self.key_set.id).await;
        if utxos.is_empty() {
            return Err(BuildSweepError::InsufficientFunds);
        }

        let total_input = utxos
            .iter()
            .try_fold(Amount::ZERO, |acc, (_, value, _)| acc.checked_add(*value))
            .ok_or_else(|| BuildSweepError::Backend(anyhow!("amount overflow")))?;
        let fee = self.fee(fee_rate, utxos.len())?;
        let output_value = match total_input.checked_sub(fee) {
            Some(value) if value > Amount::ZERO => value,
            _ => return Err(BuildSweepError::InsufficientFunds),
        };

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos
                .iter()
                .map(|(outpoint, _, _)| TxIn {
                    previous_output: *outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: output_value,
                script_pubkey: destination.script_pubkey(),
            }],
        };

        let mut psbt =
            Psbt::from_unsigned_tx(tx).map_err(|e| BuildSweepError::Backend(e.into()))?;
        for (input, (_, value, script_pubkey)) in psbt.inputs.iter_mut().zip(utxos.iter()) {
            input.witness_utxo = Some(TxOut {
                value: *value,
                script_pubkey: script_pubkey.clone(),
            });
        }

        Ok(SweepPsbt {
            psbt,
            fee,
            input_count: utxos.len(),
            total_input,
        })
    }

    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, anyhow::Error> {
        if self.fail_sign {
            return Err(anyhow!("app key for {} is not available", self.key_set.id));
        }
        Ok(signature::sign(psbt, Party::App))
    }
}

/// Fee estimator returning a fixed rate
#[derive(Debug)]
pub struct FixedFeeEstimator {
    fee_rate: FeeRate,
    fail: AtomicBool,
    last_target: Mutex<Option<ConfirmationTarget>>,
}

impl FixedFeeEstimator {
    /// Create new [`FixedFeeEstimator`]
    pub fn new(fee_rate: FeeRate) -> Self {
        Self {
            fee_rate,
            fail: AtomicBool::new(false),
            last_target: Mutex::new(None),
        }
    }

    /// Make estimation fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Target requested by the last call
    pub async fn last_target(&self) -> Option<ConfirmationTarget> {
        *self.last_target.lock().await
    }
}

#[async_trait]
impl FeeEstimator for FixedFeeEstimator {
    async fn fee_rate(&self, target: ConfirmationTarget) -> Result<FeeRate, anyhow::Error> {
        *self.last_target.lock().await = Some(target);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("fee estimates unavailable"));
        }
        Ok(self.fee_rate)
    }
}
