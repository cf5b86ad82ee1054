//! Shared reqwest plumbing for the REST services.

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use url::Url;

use crate::chat::api::dto::ErrorBody;
use crate::chat::core::config::ApiConfig;
use crate::chat::core::errors::ApiError;

/// Build an HTTP client with the configured timeouts and default headers.
pub(crate) fn build_client(config: &ApiConfig) -> Result<reqwest::Client, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Ok(ua) = HeaderValue::from_str(&format!("galaxy-chat/{}", env!("CARGO_PKG_VERSION"))) {
        headers.insert(USER_AGENT, ua);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .gzip(true)
        .build()
        .map_err(ApiError::from)
}

/// Append percent-encoded path segments to the base URL.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| ApiError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Map non-success statuses to [`ApiError`], keeping the backend's message.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized(message));
    }

    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Decode a JSON body, reporting shape mismatches as [`ApiError::Decode`].
pub(crate) async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
