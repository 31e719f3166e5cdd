//! Signature markers.
//!
//! Fake parties do not hold real keys for the sweep script; they tag the
//! PSBT with a proprietary entry instead, which is enough for the fakes
//! downstream to check who signed.

use bitcoin::psbt::raw::ProprietaryKey;
use bitcoin::Psbt;

const PREFIX: &[u8] = b"fakesig";

/// A signing party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    /// Mobile application key
    App,
    /// Hardware key
    Hardware,
    /// Co-signing server
    Server,
}

impl Party {
    fn key(&self) -> ProprietaryKey {
        let name: &[u8] = match self {
            Party::App => b"app",
            Party::Hardware => b"hardware",
            Party::Server => b"server",
        };
        ProprietaryKey {
            prefix: PREFIX.to_vec(),
            subtype: 0,
            key: name.to_vec(),
        }
    }
}

/// Copy of `psbt` signed by `party`
pub fn sign(psbt: &Psbt, party: Party) -> Psbt {
    let mut signed = psbt.clone();
    signed.proprietary.insert(party.key(), vec![1]);
    signed
}

/// Whether `party` signed `psbt`
pub fn is_signed_by(psbt: &Psbt, party: Party) -> bool {
    psbt.proprietary.contains_key(&party.key())
}
