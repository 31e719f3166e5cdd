//! Key set identity
//!
//! A key set is one generation of the three signing keys (application,
//! hardware, server) controlling a wallet. Exactly one key set of an account
//! is active; every other one is a candidate for sweeping.

use std::fmt;

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// Account identifier as known by the co-signing server
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create new [`AccountId`]
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Account id as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local identifier of a key set
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySetId(String);

impl KeySetId {
    /// Create new [`KeySetId`]
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Key set id as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeySetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key set identifier on the co-signing server side
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerKeySetId(String);

impl ServerKeySetId {
    /// Create new [`ServerKeySetId`]
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Server key set id as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerKeySetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One generation of signing keys.
///
/// Immutable once created. Retirement of a swept key set is owned by the
/// account, not by the sweep engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    /// Local key set id
    pub id: KeySetId,
    /// Application public key
    pub app_pubkey: PublicKey,
    /// Hardware public key
    pub hardware_pubkey: PublicKey,
    /// Server side key set id
    pub server_key_set_id: ServerKeySetId,
    /// Whether this is the account's active key set
    pub active: bool,
}

impl KeySet {
    /// Create new [`KeySet`]
    pub fn new(
        id: KeySetId,
        app_pubkey: PublicKey,
        hardware_pubkey: PublicKey,
        server_key_set_id: ServerKeySetId,
        active: bool,
    ) -> Self {
        Self {
            id,
            app_pubkey,
            hardware_pubkey,
            server_key_set_id,
            active,
        }
    }
}

/// Exactly one key set must be active.
///
/// Returns the active key set or `None` when zero or several claim to be active.
pub fn single_active(key_sets: &[KeySet]) -> Option<&KeySet> {
    let mut active = key_sets.iter().filter(|k| k.active);
    match (active.next(), active.next()) {
        (Some(key_set), None) => Some(key_set),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::*;

    fn key_set(id: &str, active: bool) -> KeySet {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        KeySet::new(
            KeySetId::new(id),
            pk,
            pk,
            ServerKeySetId::new(format!("server-{id}")),
            active,
        )
    }

    #[test]
    fn test_single_active() {
        let sets = vec![key_set("a", false), key_set("b", true)];
        assert_eq!(single_active(&sets).map(|k| k.id.as_str()), Some("b"));

        let none = vec![key_set("a", false)];
        assert!(single_active(&none).is_none());

        let many = vec![key_set("a", true), key_set("b", true)];
        assert!(single_active(&many).is_none());
    }

    #[test]
    fn test_ids_display() {
        assert_eq!(KeySetId::new("ks-1").to_string(), "ks-1");
        assert_eq!(ServerKeySetId::new("srv").to_string(), "srv");
        assert_eq!(AccountId::new("acct").to_string(), "acct");
    }
}
