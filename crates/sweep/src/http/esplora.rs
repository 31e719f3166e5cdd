//! Esplora broadcast and fee estimate client

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{FeeRate, Psbt, Txid};
use sweep_common::util::unix_time;
use sweep_common::{
    BroadcastError, BroadcastReceipt, Broadcaster, ConfirmationTarget, FeeEstimator,
    NetworkingError,
};
use tracing::instrument;
use url::Url;

use super::{endpoint, HttpClientCore};
use crate::settings::Settings;

/// Esplora REST client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    base_url: Url,
    core: HttpClientCore,
}

impl EsploraClient {
    /// Create new [`EsploraClient`]
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, NetworkingError> {
        Ok(Self {
            base_url,
            core: HttpClientCore::new(timeout)?,
        })
    }

    /// Create new [`EsploraClient`] for the configured esplora endpoint
    pub fn from_settings(settings: &Settings) -> Result<Self, NetworkingError> {
        let base_url = settings
            .esplora_url()
            .map_err(|e| NetworkingError::InvalidUrl(e.to_string()))?;
        Self::new(base_url, settings.esplora_timeout())
    }

    /// Fee estimates in sat/vB keyed by confirmation target
    pub async fn fee_estimates(&self) -> Result<HashMap<u16, f64>, NetworkingError> {
        let url = endpoint(&self.base_url, "fee-estimates")?;
        let raw: HashMap<String, f64> = self.core.http_get(url).await?;

        Ok(raw
            .into_iter()
            .filter_map(|(target, rate)| target.parse::<u16>().ok().map(|t| (t, rate)))
            .collect())
    }
}

/// Pick the estimate for `target`: exact, else the nearest slower target,
/// else the nearest faster one
fn select_estimate(estimates: &HashMap<u16, f64>, target: u16) -> Option<f64> {
    if let Some(rate) = estimates.get(&target) {
        return Some(*rate);
    }

    let slower = estimates
        .iter()
        .filter(|(t, _)| **t > target)
        .min_by_key(|(t, _)| **t);
    let faster = estimates
        .iter()
        .filter(|(t, _)| **t < target)
        .max_by_key(|(t, _)| **t);

    slower.or(faster).map(|(_, rate)| *rate)
}

/// sat/vB to [`FeeRate`], rounding up
fn fee_rate_from_sat_per_vb(rate: f64) -> FeeRate {
    let sat_per_kwu = (rate * 250.0).ceil().max(0.0) as u64;
    FeeRate::from_sat_per_kwu(sat_per_kwu)
}

#[async_trait]
impl Broadcaster for EsploraClient {
    #[instrument(skip_all)]
    async fn broadcast(&self, psbt: &Psbt) -> Result<BroadcastReceipt, BroadcastError> {
        let tx = psbt
            .clone()
            .extract_tx()
            .map_err(|e| BroadcastError::Malformed(e.to_string()))?;
        let url = endpoint(&self.base_url, "tx")?;

        let body = match self.core.http_post_text(url, serialize_hex(&tx)).await {
            Ok(body) => body,
            Err(NetworkingError::Http { status, message }) if (400..500).contains(&status) => {
                tracing::warn!("Esplora rejected {}: {}", tx.compute_txid(), message);
                return Err(BroadcastError::Rejected(message));
            }
            Err(err) => return Err(err.into()),
        };

        let txid = Txid::from_str(body.trim())
            .map_err(|e| NetworkingError::Serialization(e.to_string()))?;

        Ok(BroadcastReceipt {
            txid,
            broadcast_time: unix_time(),
        })
    }
}

#[async_trait]
impl FeeEstimator for EsploraClient {
    #[instrument(skip(self))]
    async fn fee_rate(&self, target: ConfirmationTarget) -> Result<FeeRate, anyhow::Error> {
        let estimates = self.fee_estimates().await?;
        let rate = select_estimate(&estimates, target.blocks())
            .ok_or_else(|| anyhow!("No fee estimates available"))?;

        tracing::debug!("Fee estimate for {} blocks: {} sat/vB", target.blocks(), rate);

        Ok(fee_rate_from_sat_per_vb(rate))
    }
}
