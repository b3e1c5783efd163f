// src/fetch.rs

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::{OidcFedError, Result};

/// The path every federation participant serves its self-assertion on.
pub const WELL_KNOWN_PATH: &str = ".well-known/openid-federation";

/// Retrieves remote federation artifacts.
///
/// Responses are returned as untrusted compact-JWS strings; all trust
/// decisions happen in the JOSE layer and the entity configuration.
#[derive(Clone)]
pub struct EntityFetcher {
    inner: Arc<Inner>,
}

struct Inner {
    http_client: reqwest::Client,
    retries: u32,
}

impl EntityFetcher {
    pub fn new(http_timeout: Duration, retries: u32) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(http_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http_client,
                retries,
            }),
        })
    }

    /// Downloads the self-signed entity configuration of `subject` from its
    /// well-known endpoint.
    #[instrument(skip(self), err)]
    pub async fn get_entity_configuration(&self, subject: &str) -> Result<String> {
        let url = format!("{}/{}", subject.trim_end_matches('/'), WELL_KNOWN_PATH);

        self.get(&url).await
    }

    /// Downloads the statement `fetch_endpoint`'s owner issued about
    /// `subject`.
    #[instrument(skip(self), err)]
    pub async fn get_entity_statement(
        &self,
        fetch_endpoint: &str,
        subject: &str,
    ) -> Result<String> {
        let url = reqwest::Url::parse_with_params(fetch_endpoint, &[("sub", subject)])
            .map_err(|e| OidcFedError::InvalidUrl(e.to_string()))?;

        self.get(url.as_str()).await
    }

    async fn get(&self, url: &str) -> Result<String> {
        let mut attempt = 0;

        loop {
            match self.try_get(url).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.inner.retries && is_transport_error(&e) => {
                    attempt += 1;
                    warn!("fetch of {url} failed ({e}), retry {attempt}");
                }
                Err(e) => {
                    return Err(OidcFedError::FetchFailed(format!("GET {url}: {e}")));
                }
            }
        }
    }

    async fn try_get(&self, url: &str) -> std::result::Result<String, reqwest::Error> {
        debug!("GET {url}");

        let response = self
            .inner
            .http_client
            .get(url)
            .send()
            .await?
            .error_for_status()?;

        response.text().await
    }
}

fn is_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
