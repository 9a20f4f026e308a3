//! Authenticated JSON client shared by the HTTP-based connectors.

use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ConnectorError;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Header carrying the client idempotency key on submissions.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Thin wrapper around `reqwest` with bearer auth and taxonomy mapping.
#[derive(Debug)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    /// Create a client for `base_url` (no trailing slash needed).
    ///
    /// # Errors
    /// Returns `Validation` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConnectorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConnectorError::Validation(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Base URL without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Set the bearer token used for subsequent requests.
    pub fn set_token(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token.into());
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder, ConnectorError> {
        let token = self
            .token
            .read()
            .ok()
            .and_then(|t| t.clone())
            .ok_or_else(|| ConnectorError::Auth("not connected".into()))?;
        Ok(builder.bearer_auth(token))
    }

    /// Authenticated GET returning JSON.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConnectorError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");
        let response = self.authorize(self.client.get(&url))?.send().await?;
        Self::handle_response(response).await
    }

    /// Authenticated GET returning the status code and raw body, whatever
    /// the status. Callers map non-success codes themselves.
    pub async fn get_raw(&self, path: &str) -> Result<(u16, Vec<u8>), ConnectorError> {
        let url = self.url(path);
        debug!(url = %url, "GET request (raw)");
        let response = self.authorize(self.client.get(&url))?.send().await?;
        let status = response.status().as_u16();
        Ok((status, response.bytes().await?.to_vec()))
    }

    /// Unauthenticated GET of an absolute URL returning status and body.
    pub async fn get_absolute(&self, url: &str) -> Result<(u16, Vec<u8>), ConnectorError> {
        debug!(url = %url, "GET request (absolute)");
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        Ok((status, response.bytes().await?.to_vec()))
    }

    /// Authenticated POST with a JSON body, optionally tagged with an idempotency key.
    pub async fn post<T, B>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<T, ConnectorError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync,
    {
        let url = self.url(path);
        debug!(url = %url, "POST request");
        let mut builder = self.authorize(self.client.post(&url))?.json(body);
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        let response = builder.send().await?;
        Self::handle_response(response).await
    }

    /// Authenticated PATCH with a JSON body.
    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ConnectorError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync,
    {
        let url = self.url(path);
        debug!(url = %url, "PATCH request");
        let response = self
            .authorize(self.client.patch(&url))?
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Authenticated DELETE; a 404 counts as already gone.
    pub async fn delete(&self, path: &str) -> Result<(), ConnectorError> {
        let url = self.url(path);
        debug!(url = %url, "DELETE request");
        let response = self.authorize(self.client.delete(&url))?.send().await?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ConnectorError::from_status(status.as_u16(), &text))
        }
    }

    /// Unauthenticated GET of an absolute URL; returns only the status code.
    pub async fn probe(&self, url: &str) -> Result<u16, ConnectorError> {
        debug!(url = %url, "Probe request");
        let response = self.client.get(url).send().await?;
        Ok(response.status().as_u16())
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, ConnectorError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ConnectorError::from(e)
            })
        } else {
            Err(ConnectorError::from_status(status.as_u16(), &text))
        }
    }
}

/// Percent-encode a query parameter value.
#[must_use]
pub fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_encode_query() {
        assert_eq!(encode_query("abc-123"), "abc-123");
        assert_eq!(encode_query("a b/c"), "a%20b%2Fc");
    }

    #[tokio::test]
    async fn test_requires_token() {
        let client = ApiClient::new("http://127.0.0.1:9").unwrap();
        let err = client.get::<serde_json::Value>("/x").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Auth(_)));
    }

    #[tokio::test]
    async fn test_error_statuses_map_to_taxonomy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"a": 1})))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri()).unwrap();
        client.set_token("t0k");

        let err = client.get::<serde_json::Value>("/busy").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Transient(_)));

        let ok: serde_json::Value = client.get("/ok").await.unwrap();
        assert_eq!(ok["a"], 1);
    }
}
