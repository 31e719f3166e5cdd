//! Simulated UTXO set shared by fake wallets and the fake broadcaster

use std::collections::{BTreeMap, HashMap};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, Txid};
use sweep_common::KeySetId;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Utxo {
    owner: KeySetId,
    value: Amount,
    script_pubkey: ScriptBuf,
}

#[derive(Debug, Default)]
struct ChainState {
    utxos: BTreeMap<OutPoint, Utxo>,
    owners: HashMap<ScriptBuf, KeySetId>,
    broadcast: Vec<Txid>,
    funding_counter: u64,
}

/// In-memory chain.
///
/// Spending a transaction removes its inputs and credits outputs paying a
/// known key set's address to that key set.
#[derive(Debug, Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    /// Create new [`FakeChain`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic address owned by a key set
    pub fn address_for(key_set_id: &KeySetId) -> Address {
        let witness_script = ScriptBuf::from_bytes(
            sha256::Hash::hash(key_set_id.as_str().as_bytes())
                .to_byte_array()
                .to_vec(),
        );
        Address::p2wsh(&witness_script, Network::Regtest)
    }

    /// Credit a new output to `key_set_id`
    pub async fn fund(&self, key_set_id: &KeySetId, value: Amount) -> OutPoint {
        let mut state = self.state.lock().await;
        state.funding_counter += 1;
        let txid = Txid::from_byte_array(
            sha256::Hash::hash(&state.funding_counter.to_be_bytes()).to_byte_array(),
        );
        let outpoint = OutPoint::new(txid, 0);
        let script_pubkey = Self::address_for(key_set_id).script_pubkey();
        state
            .owners
            .insert(script_pubkey.clone(), key_set_id.clone());
        state.utxos.insert(
            outpoint,
            Utxo {
                owner: key_set_id.clone(),
                value,
                script_pubkey,
            },
        );
        outpoint
    }

    /// Make outputs to the key set's address count towards its balance
    pub async fn register(&self, key_set_id: &KeySetId) {
        let script_pubkey = Self::address_for(key_set_id).script_pubkey();
        self.state
            .lock()
            .await
            .owners
            .insert(script_pubkey, key_set_id.clone());
    }

    /// Unspent outputs of a key set
    pub async fn unspent(&self, key_set_id: &KeySetId) -> Vec<(OutPoint, Amount, ScriptBuf)> {
        self.state
            .lock()
            .await
            .utxos
            .iter()
            .filter(|(_, utxo)| &utxo.owner == key_set_id)
            .map(|(outpoint, utxo)| (*outpoint, utxo.value, utxo.script_pubkey.clone()))
            .collect()
    }

    /// Sum of a key set's unspent outputs
    pub async fn balance(&self, key_set_id: &KeySetId) -> Amount {
        self.unspent(key_set_id)
            .await
            .iter()
            .map(|(_, value, _)| *value)
            .fold(Amount::ZERO, |acc, v| acc.checked_add(v).unwrap_or(Amount::MAX))
    }

    /// Apply a transaction, failing if any input is unknown or already spent
    pub async fn apply(&self, tx: &Transaction) -> Result<Txid, String> {
        let mut state = self.state.lock().await;
        if tx
            .input
            .iter()
            .any(|input| !state.utxos.contains_key(&input.previous_output))
        {
            return Err("bad-txns-inputs-missingorspent".to_string());
        }

        for input in &tx.input {
            state.utxos.remove(&input.previous_output);
        }

        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            if let Some(owner) = state.owners.get(&output.script_pubkey).cloned() {
                state.utxos.insert(
                    OutPoint::new(txid, vout as u32),
                    Utxo {
                        owner,
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                    },
                );
            }
        }
        state.broadcast.push(txid);

        Ok(txid)
    }

    /// Transactions accepted so far, in order
    pub async fn broadcast_txids(&self) -> Vec<Txid> {
        self.state.lock().await.broadcast.clone()
    }
}
