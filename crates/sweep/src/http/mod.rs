//! HTTP clients for the co-signing server and the Esplora broadcast/fee API

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sweep_common::NetworkingError;
use url::Url;

mod cosign;
mod esplora;

pub use self::cosign::HttpCoSigner;
pub use self::esplora::EsploraClient;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Map a reqwest error into a [`NetworkingError`]
fn networking_error(err: reqwest::Error) -> NetworkingError {
    if err.is_timeout() {
        NetworkingError::Timeout
    } else if let Some(status) = err.status() {
        NetworkingError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else if err.is_decode() {
        NetworkingError::Serialization(err.to_string())
    } else {
        NetworkingError::Connection(err.to_string())
    }
}

/// Join `path` onto `base`, keeping any path prefix of `base`
fn endpoint(base: &Url, path: &str) -> Result<Url, NetworkingError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|e| NetworkingError::InvalidUrl(e.to_string()))
}

#[derive(Debug, Clone)]
struct HttpClientCore {
    inner: Client,
}

impl HttpClientCore {
    fn new(timeout: Duration) -> Result<Self, NetworkingError> {
        let inner = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(networking_error)?;
        Ok(Self { inner })
    }

    /// Fail on non-success status, keeping the response body as message
    async fn check_status(response: Response) -> Result<Response, NetworkingError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(NetworkingError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn http_get<R: DeserializeOwned>(&self, url: Url) -> Result<R, NetworkingError> {
        let response = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(networking_error)?;
        let body = Self::check_status(response)
            .await?
            .text()
            .await
            .map_err(networking_error)?;

        serde_json::from_str::<R>(&body).map_err(|err| {
            tracing::warn!("Http Response error: {}", err);
            err.into()
        })
    }

    async fn http_post<P: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: Url,
        payload: &P,
    ) -> Result<R, NetworkingError> {
        let response = self
            .inner
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(networking_error)?;
        let body = Self::check_status(response)
            .await?
            .text()
            .await
            .map_err(networking_error)?;

        serde_json::from_str::<R>(&body).map_err(|err| {
            tracing::warn!("Http Response error: {}", err);
            err.into()
        })
    }

    async fn http_post_text(&self, url: Url, body: String) -> Result<String, NetworkingError> {
        let response = self
            .inner
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(networking_error)?;
        Self::check_status(response)
            .await?
            .text()
            .await
            .map_err(networking_error)
    }
}
