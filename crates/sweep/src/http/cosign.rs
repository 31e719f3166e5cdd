//! Co-signing server client

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Psbt;
use serde::{Deserialize, Serialize};
use sweep_common::{AccountId, Environment, NetworkingError, ServerCoSigner, ServerKeySetId};
use tracing::instrument;

use super::{endpoint, HttpClientCore};
use crate::settings::Settings;

#[derive(Debug, Serialize)]
struct SignTransactionRequest {
    psbt: String,
}

#[derive(Debug, Deserialize)]
struct SignTransactionResponse {
    tx: String,
}

/// [`ServerCoSigner`] over the server's HTTP API
#[derive(Debug, Clone)]
pub struct HttpCoSigner {
    core: HttpClientCore,
}

impl HttpCoSigner {
    /// Create new [`HttpCoSigner`]
    pub fn new(timeout: Duration) -> Result<Self, NetworkingError> {
        Ok(Self {
            core: HttpClientCore::new(timeout)?,
        })
    }

    /// Create new [`HttpCoSigner`] with the configured server timeout
    pub fn from_settings(settings: &Settings) -> Result<Self, NetworkingError> {
        Self::new(settings.server_timeout())
    }
}

#[async_trait]
impl ServerCoSigner for HttpCoSigner {
    #[instrument(skip(self, psbt), fields(environment = %environment.name))]
    async fn co_sign(
        &self,
        environment: &Environment,
        account_id: &AccountId,
        key_set_id: &ServerKeySetId,
        psbt: &Psbt,
    ) -> Result<Psbt, NetworkingError> {
        let url = endpoint(
            &environment.base_url,
            &format!(
                "api/accounts/{}/keysets/{}/sign-transaction",
                account_id, key_set_id
            ),
        )?;
        let request = SignTransactionRequest {
            psbt: psbt.to_string(),
        };

        let response: SignTransactionResponse = self.core.http_post(url, &request).await?;
        let signed = Psbt::from_str(&response.tx)
            .map_err(|e| NetworkingError::Serialization(e.to_string()))?;

        if signed.unsigned_tx != psbt.unsigned_tx {
            return Err(NetworkingError::Serialization(
                "co-signed transaction differs from the submitted one".to_string(),
            ));
        }

        Ok(signed)
    }
}
