//! Server co-signing interface

use std::fmt;

use async_trait::async_trait;
use bitcoin::Psbt;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::NetworkingError;
use crate::key_set::{AccountId, ServerKeySetId};

/// Remote service environment the account lives in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Environment name, for logs
    pub name: String,
    /// Base url of the co-signing service
    pub base_url: Url,
}

impl Environment {
    /// Create new [`Environment`]
    pub fn new<S: Into<String>>(name: S, base_url: Url) -> Self {
        Self {
            name: name.into(),
            base_url,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.base_url)
    }
}

/// Remote co-signer.
///
/// Submitting the same payload twice is safe: the server returns an
/// equivalent co-signature or rejects a structurally altered payload.
#[async_trait]
pub trait ServerCoSigner: Send + Sync {
    /// Add the server's signature to a partially signed PSBT
    async fn co_sign(
        &self,
        environment: &Environment,
        account_id: &AccountId,
        key_set_id: &ServerKeySetId,
        psbt: &Psbt,
    ) -> Result<Psbt, NetworkingError>;
}
