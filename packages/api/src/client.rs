//! reqwest implementation of the geolocation API traits.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Call | Method | Path |
//! |---|---|---|
//! | cache-status check | `POST` | `/geolocation/check` |
//! | cached fetch | `GET` | `/geolocation/{code}` |
//! | batch save | `POST` | `/geolocation/batch` |
//!
//! No retries happen here. A failed check sends the census down its
//! fallback path and a failed save is only logged.

use geocensus_api_models::{
    BatchSaveItem, BatchSaveRequest, BatchSaveResponse, CacheStatusRequest, CacheStatusResponse,
    CachedGeolocation,
};
use reqwest::Url;
use serde::de::DeserializeOwned;

use crate::{ApiError, CacheStatusChecker, PersistenceGateway, Session};

/// Maximum length of the response body preview included in errors.
const BODY_PREVIEW_LEN: usize = 300;

/// HTTP client for the back-office geolocation API.
#[derive(Debug, Clone)]
pub struct GeolocationApiClient {
    client: reqwest::Client,
    base_url: Url,
}

impl GeolocationApiClient {
    /// Creates a client rooted at `base_url` (e.g.
    /// `"https://backoffice.example.com/api"`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Url`] if `base_url` is not an absolute URL that
    /// can carry path segments.
    pub fn new(client: reqwest::Client, base_url: &str) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|e| ApiError::Url {
            message: format!("{base_url}: {e}"),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Url {
                message: format!("{base_url} cannot be used as a base URL"),
            });
        }
        Ok(Self { client, base_url })
    }

    /// Appends path segments (percent-encoded) to the base URL.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send_json<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
        session: &Session,
    ) -> Result<T, ApiError> {
        let response = request.bearer_auth(session.bearer()?).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.len() > BODY_PREVIEW_LEN {
                let mut end = BODY_PREVIEW_LEN;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &body[..end])
            } else {
                body
            };
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl CacheStatusChecker for GeolocationApiClient {
    async fn check(
        &self,
        session: &Session,
        codes: &[String],
    ) -> Result<CacheStatusResponse, ApiError> {
        let url = self.endpoint(&["geolocation", "check"]);
        log::debug!("Checking cache status of {} codes at {url}", codes.len());
        let body = CacheStatusRequest {
            codes: codes.to_vec(),
        };
        Self::send_json(self.client.post(url).json(&body), session).await
    }

    async fn fetch_cached(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<CachedGeolocation, ApiError> {
        let url = self.endpoint(&["geolocation", code]);
        Self::send_json(self.client.get(url), session).await
    }
}

#[async_trait::async_trait]
impl PersistenceGateway for GeolocationApiClient {
    async fn save_batch(
        &self,
        session: &Session,
        items: &[BatchSaveItem],
    ) -> Result<BatchSaveResponse, ApiError> {
        let url = self.endpoint(&["geolocation", "batch"]);
        log::debug!("Saving {} geocode results to {url}", items.len());
        let body = BatchSaveRequest {
            items: items.to_vec(),
        };
        Self::send_json(self.client.post(url).json(&body), session).await
    }
}
