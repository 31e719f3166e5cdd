//! Wallet collaborators consumed by the sweep generator

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Address, Amount, FeeRate, Psbt};

use crate::error::BuildSweepError;
use crate::key_set::{AccountId, KeySet};
use crate::sweep::SweepPsbt;

/// Confirmation target used for fee estimation, in blocks
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfirmationTarget(u16);

impl ConfirmationTarget {
    /// Roughly 30 minutes
    pub const THIRTY_MINUTES: Self = Self(3);

    /// Create new [`ConfirmationTarget`], at least one block
    pub fn new(blocks: u16) -> Self {
        Self(blocks.max(1))
    }

    /// Target in blocks
    pub fn blocks(&self) -> u16 {
        self.0
    }
}

impl Default for ConfirmationTarget {
    fn default() -> Self {
        Self::THIRTY_MINUTES
    }
}

impl fmt::Display for ConfirmationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} blocks", self.0)
    }
}

/// Wallet bound to one key set
#[async_trait]
pub trait SpendingWallet: Send + Sync {
    /// Value spendable right now
    async fn spendable_balance(&self) -> Result<Amount, anyhow::Error>;

    /// Fresh receiving address
    async fn receive_address(&self) -> Result<Address, anyhow::Error>;

    /// Build a PSBT spending every spendable output to `destination`
    async fn create_sweep_psbt(
        &self,
        destination: &Address,
        fee_rate: FeeRate,
    ) -> Result<SweepPsbt, BuildSweepError>;

    /// Sign with the app key. The input PSBT is left untouched.
    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, anyhow::Error>;
}

/// Resolves wallets for the account's key sets
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Every key set of the account, active and inactive
    async fn key_sets(&self, account_id: &AccountId) -> Result<Vec<KeySet>, anyhow::Error>;

    /// Wallet for one key set
    async fn spending_wallet(
        &self,
        key_set: &KeySet,
    ) -> Result<Arc<dyn SpendingWallet>, anyhow::Error>;

    /// Whether hardware authorization for the key set is cached locally,
    /// making a hardware tap unnecessary
    async fn is_hardware_authorization_cached(&self, key_set: &KeySet) -> bool;
}

/// Fee environment
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    /// Fee rate expected to confirm within `target`
    async fn fee_rate(&self, target: ConfirmationTarget) -> Result<FeeRate, anyhow::Error>;
}
