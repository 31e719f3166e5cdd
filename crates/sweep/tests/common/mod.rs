//! Shared harness wiring the engine to in-process fakes

#![allow(dead_code)]

use std::sync::Arc;

use bitcoin::{Amount, FeeRate, Network};
use sweep::{SweepOrchestrator, SweepServices};
use sweep_common::{AccountId, Environment, KeySet};
use sweep_fake::{
    fake_key_set, FakeBroadcaster, FakeChain, FakeCoSigner, FakeWalletProvider,
    FixedExchangeRate, FixedFeeEstimator, MemoryTransactionRepository,
};
use url::Url;

/// Fee charged per sweep by the fake wallets
pub const SWEEP_FEE: Amount = Amount::from_sat(500);

pub struct Harness {
    pub chain: Arc<FakeChain>,
    /// Two retired key sets followed by the active one
    pub key_sets: Vec<KeySet>,
    pub wallets: Arc<FakeWalletProvider>,
    pub fees: Arc<FixedFeeEstimator>,
    pub co_signer: Arc<FakeCoSigner>,
    pub broadcaster: Arc<FakeBroadcaster>,
    pub repository: Arc<MemoryTransactionRepository>,
}

impl Harness {
    pub fn new() -> Self {
        let chain = Arc::new(FakeChain::new());
        let key_sets = vec![
            fake_key_set("ks-2023", false),
            fake_key_set("ks-2024", false),
            fake_key_set("ks-2025", true),
        ];
        let wallets = Arc::new(
            FakeWalletProvider::new(chain.clone(), key_sets.clone()).with_fixed_fee(SWEEP_FEE),
        );

        Self {
            broadcaster: Arc::new(FakeBroadcaster::new(chain.clone())),
            chain,
            key_sets,
            wallets,
            fees: Arc::new(FixedFeeEstimator::new(FeeRate::from_sat_per_vb_unchecked(2))),
            co_signer: Arc::new(FakeCoSigner::new()),
            repository: Arc::new(MemoryTransactionRepository::new()),
        }
    }

    /// Harness whose retired key sets have cached hardware authorization
    pub async fn without_hardware() -> Self {
        let harness = Self::new();
        for key_set in harness.retired() {
            harness
                .wallets
                .cache_hardware_authorization(&key_set.id)
                .await;
        }
        harness
    }

    pub fn retired(&self) -> &[KeySet] {
        &self.key_sets[..2]
    }

    pub fn active(&self) -> &KeySet {
        &self.key_sets[2]
    }

    pub fn account_id(&self) -> AccountId {
        AccountId::new("acct-1")
    }

    pub fn environment(&self) -> Environment {
        Environment::new(
            "test",
            Url::parse("https://cosigner.test/").expect("valid url"),
        )
    }

    pub fn services(&self) -> SweepServices {
        SweepServices {
            wallets: self.wallets.clone(),
            fee_estimator: self.fees.clone(),
            co_signer: self.co_signer.clone(),
            broadcaster: self.broadcaster.clone(),
            repository: self.repository.clone(),
            exchange_rates: Arc::new(FixedExchangeRate::new("USD", 60_000.0)),
        }
    }

    pub fn orchestrator(&self) -> SweepOrchestrator {
        self.orchestrator_with(self.services())
    }

    pub fn orchestrator_with(&self, services: SweepServices) -> SweepOrchestrator {
        SweepOrchestrator::new(self.account_id(), self.environment(), services)
            .with_network(Network::Regtest)
    }

    /// Fund both retired key sets
    pub async fn fund_retired(&self) {
        self.chain
            .fund(&self.key_sets[0].id, Amount::from_sat(20_000))
            .await;
        self.chain
            .fund(&self.key_sets[1].id, Amount::from_sat(30_000))
            .await;
    }
}
