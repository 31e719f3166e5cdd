//! Fake co-signing server

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bitcoin::Psbt;
use sweep_common::{AccountId, Environment, NetworkingError, ServerCoSigner, ServerKeySetId};
use tokio::sync::Mutex;

use crate::signature::{self, Party};

/// Co-signer that adds the server marker to app-signed payloads
#[derive(Debug, Default)]
pub struct FakeCoSigner {
    failure: Mutex<Option<NetworkingError>>,
    calls: AtomicUsize,
}

impl FakeCoSigner {
    /// Create new [`FakeCoSigner`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `error` until cleared with `None`
    pub async fn set_failure(&self, error: Option<NetworkingError>) {
        *self.failure.lock().await = error;
    }

    /// Calls received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerCoSigner for FakeCoSigner {
    async fn co_sign(
        &self,
        environment: &Environment,
        account_id: &AccountId,
        key_set_id: &ServerKeySetId,
        psbt: &Psbt,
    ) -> Result<Psbt, NetworkingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%environment, %account_id, %key_set_id, "Fake co-sign");

        if let Some(err) = self.failure.lock().await.clone() {
            return Err(err);
        }

        if !signature::is_signed_by(psbt, Party::App) {
            return Err(NetworkingError::Http {
                status: 400,
                message: "app signature missing".to_string(),
            });
        }

        Ok(signature::sign(psbt, Party::Server))
    }
}
