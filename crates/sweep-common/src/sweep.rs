//! Sweep data model

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bitcoin::{Amount, Psbt, Txid};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::key_set::{KeySet, KeySetId};

/// Parties whose signatures finalize a sweep.
///
/// Fixed when the sweep is generated, never changed afterwards.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignaturePlan {
    /// App key alone
    AppOnly,
    /// App key then server co-signature
    AppAndServer,
    /// Hardware tap, app key, then server co-signature
    AppAndHardwareAndServer,
}

impl SignaturePlan {
    /// Plan for a key set given whether its hardware authorization is cached locally
    pub fn for_key_set(hardware_authorization_cached: bool) -> Self {
        if hardware_authorization_cached {
            Self::AppAndServer
        } else {
            Self::AppAndHardwareAndServer
        }
    }

    /// App key signs
    pub fn requires_app(&self) -> bool {
        true
    }

    /// A hardware round-trip is needed before app signing
    pub fn requires_hardware(&self) -> bool {
        matches!(self, Self::AppAndHardwareAndServer)
    }

    /// Server co-signs
    pub fn requires_server(&self) -> bool {
        !matches!(self, Self::AppOnly)
    }
}

impl fmt::Display for SignaturePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppOnly => write!(f, "app_only"),
            Self::AppAndServer => write!(f, "app_and_server"),
            Self::AppAndHardwareAndServer => write!(f, "app_and_hardware_and_server"),
        }
    }
}

/// A sweep PSBT as built by a spending wallet
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPsbt {
    /// Unsigned PSBT paying everything to the destination
    pub psbt: Psbt,
    /// Absolute fee
    pub fee: Amount,
    /// Number of inputs spent
    pub input_count: usize,
    /// Sum of all inputs
    pub total_input: Amount,
}

/// Proposed transaction moving everything a source key set controls to the
/// active wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedSweep {
    /// Transaction id of the unsigned transaction
    pub txid: Txid,
    /// Current payload. Gains signatures as the sweep moves through signing.
    pub psbt: Psbt,
    /// Absolute fee
    pub fee: Amount,
    /// Number of inputs spent
    pub input_count: usize,
    /// Sum of all inputs
    pub total_input: Amount,
    /// Signature plan
    pub plan: SignaturePlan,
    /// Source key set
    pub source: KeySet,
}

impl UnsignedSweep {
    /// Create new [`UnsignedSweep`]
    pub fn new(source: KeySet, sweep_psbt: SweepPsbt, plan: SignaturePlan) -> Self {
        Self {
            txid: sweep_psbt.psbt.unsigned_tx.compute_txid(),
            psbt: sweep_psbt.psbt,
            fee: sweep_psbt.fee,
            input_count: sweep_psbt.input_count,
            total_input: sweep_psbt.total_input,
            plan,
            source,
        }
    }

    /// Base64 encoded payload
    pub fn psbt_base64(&self) -> String {
        self.psbt.to_string()
    }

    /// Amount arriving at the destination
    pub fn sweep_amount(&self) -> Option<Amount> {
        self.total_input.checked_sub(self.fee)
    }
}

/// Every sweep produced by one generation pass.
///
/// Never empty; an empty pass is reported as [`GenerationOutcome::Empty`].
#[derive(Debug, Clone, PartialEq)]
pub struct SweepBatch {
    sweeps: Vec<UnsignedSweep>,
}

impl SweepBatch {
    /// Create new [`SweepBatch`], `None` if there is nothing to sweep
    pub fn new(sweeps: Vec<UnsignedSweep>) -> Option<Self> {
        if sweeps.is_empty() {
            return None;
        }
        Some(Self { sweeps })
    }

    /// Sweeps in generation order
    pub fn sweeps(&self) -> &[UnsignedSweep] {
        &self.sweeps
    }

    /// Consume into the sweeps
    pub fn into_sweeps(self) -> Vec<UnsignedSweep> {
        self.sweeps
    }

    /// Number of sweeps
    pub fn len(&self) -> usize {
        self.sweeps.len()
    }

    /// Always false, kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.sweeps.is_empty()
    }

    /// Sum of every sweep's fee
    pub fn total_fee(&self) -> Result<Amount, Error> {
        self.sweeps
            .iter()
            .try_fold(Amount::ZERO, |acc, s| acc.checked_add(s.fee))
            .ok_or(Error::AmountOverflow)
    }

    /// Sum of every sweep's inputs
    pub fn total_input(&self) -> Result<Amount, Error> {
        self.sweeps
            .iter()
            .try_fold(Amount::ZERO, |acc, s| acc.checked_add(s.total_input))
            .ok_or(Error::AmountOverflow)
    }

    /// Sweeps that need a hardware round-trip, keyed by source key set
    pub fn hardware_required(&self) -> BTreeMap<KeySetId, &UnsignedSweep> {
        self.sweeps
            .iter()
            .filter(|s| s.plan.requires_hardware())
            .map(|s| (s.source.id.clone(), s))
            .collect()
    }

    /// Whether any sweep needs a hardware round-trip
    pub fn requires_hardware(&self) -> bool {
        self.sweeps.iter().any(|s| s.plan.requires_hardware())
    }

    /// Merge hardware signed payloads by transaction id.
    ///
    /// Every hardware-plan sweep must have a payload whose unsigned
    /// transaction matches. Nothing is modified unless all of them do.
    /// Entries of other plans are left untouched.
    pub fn merge_hardware_signed(&mut self, signed: &HashMap<Txid, Psbt>) -> Result<(), Error> {
        for sweep in self.sweeps.iter().filter(|s| s.plan.requires_hardware()) {
            let psbt = signed
                .get(&sweep.txid)
                .ok_or(Error::MissingHardwareSignature(sweep.txid))?;
            if psbt.unsigned_tx.compute_txid() != sweep.txid {
                return Err(Error::HardwarePayloadMismatch(sweep.txid));
            }
        }

        for sweep in self
            .sweeps
            .iter_mut()
            .filter(|s| s.plan.requires_hardware())
        {
            if let Some(psbt) = signed.get(&sweep.txid) {
                sweep.psbt = psbt.clone();
            }
        }

        Ok(())
    }
}

/// Result of a generation pass
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// No key set holds value worth sweeping
    Empty,
    /// Sweeps to sign and broadcast
    Batch(SweepBatch),
}

/// Exchange rate snapshot used for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    /// Fiat currency code
    pub currency: String,
    /// Fiat value of one bitcoin
    pub rate: f64,
    /// Unix time the rate was observed
    pub time: u64,
}

/// Broadcast detail returned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReceipt {
    /// Broadcast transaction id
    pub txid: Txid,
    /// Unix time of broadcast
    pub broadcast_time: u64,
}

/// Terminal record of a swept key set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedOutcome {
    /// Transaction id
    pub txid: Txid,
    /// Source key set
    pub key_set: KeySetId,
    /// Fee paid
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
    /// Amount received by the active wallet
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    /// Unix time of broadcast
    pub broadcast_time: u64,
    /// Exchange rate at submission time
    pub exchange_rate: Option<ExchangeRate>,
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

    use super::*;
    use crate::key_set::ServerKeySetId;

    fn key_set(id: &str) -> KeySet {
        let secp = Secp256k1::new();
        let pk = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[3u8; 32]).unwrap());
        KeySet::new(
            KeySetId::new(id),
            pk,
            pk,
            ServerKeySetId::new(id),
            false,
        )
    }

    fn sweep(seed: u8, fee: u64, plan: SignaturePlan) -> UnsignedSweep {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([seed; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(10_000 - fee),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let psbt = Psbt::from_unsigned_tx(tx).unwrap();
        UnsignedSweep::new(
            key_set(&format!("ks-{seed}")),
            SweepPsbt {
                psbt,
                fee: Amount::from_sat(fee),
                input_count: 1,
                total_input: Amount::from_sat(10_000),
            },
            plan,
        )
    }

    #[test]
    fn test_empty_batch_is_not_constructed() {
        assert!(SweepBatch::new(vec![]).is_none());
    }

    #[test]
    fn test_total_fee_is_sum_of_fees() {
        let batch = SweepBatch::new(vec![
            sweep(1, 500, SignaturePlan::AppAndServer),
            sweep(2, 500, SignaturePlan::AppAndServer),
        ])
        .unwrap();
        assert_eq!(batch.total_fee().unwrap(), Amount::from_sat(1_000));
        assert_eq!(batch.total_input().unwrap(), Amount::from_sat(20_000));
    }

    #[test]
    fn test_plan_for_key_set() {
        assert_eq!(SignaturePlan::for_key_set(true), SignaturePlan::AppAndServer);
        assert_eq!(
            SignaturePlan::for_key_set(false),
            SignaturePlan::AppAndHardwareAndServer
        );
        assert!(!SignaturePlan::AppOnly.requires_server());
        assert!(SignaturePlan::AppAndHardwareAndServer.requires_hardware());
    }

    #[test]
    fn test_hardware_required_subset() {
        let batch = SweepBatch::new(vec![
            sweep(1, 500, SignaturePlan::AppAndServer),
            sweep(2, 500, SignaturePlan::AppAndHardwareAndServer),
        ])
        .unwrap();
        let hw = batch.hardware_required();
        assert_eq!(hw.len(), 1);
        assert!(hw.contains_key(&KeySetId::new("ks-2")));
        assert!(batch.requires_hardware());
    }

    #[test]
    fn test_merge_leaves_other_plans_untouched() {
        let plain = sweep(1, 500, SignaturePlan::AppAndServer);
        let hardware = sweep(2, 500, SignaturePlan::AppAndHardwareAndServer);
        let mut batch = SweepBatch::new(vec![plain.clone(), hardware.clone()]).unwrap();

        let mut signed_hw = hardware.psbt.clone();
        signed_hw.inputs[0].final_script_witness = Some(Witness::from_slice(&[[1u8; 64]]));
        // A payload for a non-hardware sweep must be ignored
        let mut bogus = plain.psbt.clone();
        bogus.inputs[0].final_script_witness = Some(Witness::from_slice(&[[9u8; 64]]));

        let signed = HashMap::from([(hardware.txid, signed_hw.clone()), (plain.txid, bogus)]);
        batch.merge_hardware_signed(&signed).unwrap();

        assert_eq!(batch.sweeps()[0].psbt.serialize(), plain.psbt.serialize());
        assert_eq!(batch.sweeps()[1].psbt, signed_hw);
    }

    #[test]
    fn test_merge_requires_every_hardware_payload() {
        let hardware = sweep(2, 500, SignaturePlan::AppAndHardwareAndServer);
        let mut batch = SweepBatch::new(vec![hardware.clone()]).unwrap();
        let err = batch.merge_hardware_signed(&HashMap::new()).unwrap_err();
        assert_eq!(err, Error::MissingHardwareSignature(hardware.txid));
        assert_eq!(batch.sweeps()[0], hardware);
    }

    #[test]
    fn test_merge_rejects_mismatched_payload() {
        let hardware = sweep(2, 500, SignaturePlan::AppAndHardwareAndServer);
        let other = sweep(3, 500, SignaturePlan::AppAndHardwareAndServer);
        let mut batch = SweepBatch::new(vec![hardware.clone()]).unwrap();
        let signed = HashMap::from([(hardware.txid, other.psbt)]);
        assert_eq!(
            batch.merge_hardware_signed(&signed).unwrap_err(),
            Error::HardwarePayloadMismatch(hardware.txid)
        );
    }

    #[test]
    fn test_psbt_base64_round_trips() {
        let s = sweep(4, 300, SignaturePlan::AppOnly);
        let decoded: Psbt = s.psbt_base64().parse().unwrap();
        assert_eq!(decoded, s.psbt);
        assert_eq!(s.sweep_amount(), Some(Amount::from_sat(9_700)));
    }
}
