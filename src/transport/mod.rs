//! Shared request layer for the refstore API.
//!
//! Every wire exchange in the crate flows through [`Transport::execute`]:
//! it rebuilds the HTTP request from a [`RequestSpec`] on each attempt,
//! classifies the response status into typed errors, and recovers from
//! rate limiting locally by sleeping and replaying until the backoff
//! ceiling fires. A request is described by plain data (method, URL,
//! headers, payload) captured once, never by a live request handle, so a
//! replay is always a clean reconstruction.
//!
//! The storage-endpoint upload uses the same transport but with
//! [`RequestSpec::unauthenticated`]: the binary store is a different trust
//! domain and must never receive the API bearer credential.

mod backoff;

pub use backoff::{Backoff, INITIAL_DELAY_UNITS, MAX_DELAY_UNITS, TOTAL_WAIT_UNITS};

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, USER_AGENT};
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, ResponseContext};

/// API protocol version sent with every authenticated request.
pub const API_VERSION: &str = "3";

/// Header carrying the protocol version.
pub const API_VERSION_HEADER: &str = "Refstore-API-Version";

/// Header carrying a write-token on item-creation requests.
pub const WRITE_TOKEN_HEADER: &str = "Refstore-Write-Token";

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Generous read timeout; attachment transfers can be large.
const READ_TIMEOUT_SECS: u64 = 300;

/// Wall-clock length of one backoff delay unit.
const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Library User-Agent sent on every request, including storage uploads.
#[must_use]
pub fn default_user_agent() -> String {
    format!("refstore/{}", env!("CARGO_PKG_VERSION"))
}

/// Mints a unique 32-char hex write-token for a mutating request.
///
/// The server uses the token to reject accidental duplicate submissions
/// of the same logical write. A fresh token is minted per call, so
/// re-submitting a batch after a partial failure is safe but may create
/// duplicate preliminary item shells.
#[must_use]
pub fn write_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Request body representation, rebuilt into a wire body on every attempt.
#[derive(Debug, Clone)]
pub enum Payload {
    /// JSON document.
    Json(Value),
    /// URL-encoded form fields.
    Form(Vec<(String, String)>),
    /// Raw bytes, e.g. an assembled upload body.
    Bytes(Bytes),
}

/// A complete description of one HTTP request.
///
/// Captures everything needed to issue (and re-issue) the request: method,
/// absolute URL, extra headers, query pairs, and an optional payload.
/// Cloning is cheap; `Payload::Bytes` holds refcounted [`Bytes`].
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    payload: Option<Payload>,
    authenticated: bool,
}

impl RequestSpec {
    /// Creates a spec for the given method and absolute URL.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            payload: None,
            authenticated: true,
        }
    }

    /// Convenience constructor for GET.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Convenience constructor for POST.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Convenience constructor for PUT.
    #[must_use]
    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    /// Convenience constructor for PATCH.
    #[must_use]
    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    /// Convenience constructor for DELETE.
    #[must_use]
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Adds a header to the request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds query parameters to the request URL.
    #[must_use]
    pub fn query(mut self, pairs: Vec<(String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    /// Sets a JSON payload.
    #[must_use]
    pub fn json(mut self, value: Value) -> Self {
        self.payload = Some(Payload::Json(value));
        self
    }

    /// Sets a URL-encoded form payload.
    #[must_use]
    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.payload = Some(Payload::Form(pairs));
        self
    }

    /// Sets a raw byte payload.
    #[must_use]
    pub fn bytes(mut self, body: Bytes) -> Self {
        self.payload = Some(Payload::Bytes(body));
        self
    }

    /// Strips the default API headers from this request.
    ///
    /// Required for the binary-storage endpoint, which must not see the
    /// API bearer credential.
    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// The request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request method as text.
    #[must_use]
    pub fn method_name(&self) -> &str {
        self.method.as_str()
    }
}

/// A completed, classified response.
///
/// Only produced for exchanges the classifier accepted; error statuses
/// become typed [`Error`] values instead.
#[derive(Debug)]
pub struct ApiResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The final response URL after redirects.
    pub url: String,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    /// All response headers, including the raw `Link` relations the
    /// paginator consumes.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single header value, decoded as text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The raw response body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the response, returning the body bytes.
    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The response body decoded as text (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses the response body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedResponse`] when the body is not valid
    /// JSON.
    pub fn json(&self) -> Result<Value, Error> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::unexpected_response(&self.url, format!("invalid JSON: {e}")))
    }
}

/// Shared HTTP transport bound to one API endpoint and credential.
///
/// Holds the pooled `reqwest` client and the client-wide [`Backoff`]
/// counter. Create once per [`Client`](crate::Client) and share by
/// reference.
#[derive(Debug)]
pub struct Transport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    backoff: Backoff,
    backoff_unit: Duration,
}

impl Transport {
    /// Creates a transport against the given endpoint root.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .gzip(true)
            .build()
            .expect("HTTP client builds with static configuration");
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            backoff: Backoff::new(),
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }

    /// Overrides the wall-clock length of one backoff delay unit.
    ///
    /// The give-up arithmetic is unchanged; only the sleep scale moves.
    /// Intended for tests that compress the 62-unit ceiling into
    /// milliseconds.
    #[must_use]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// The configured endpoint root, without a trailing slash.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Joins a path+query fragment onto the endpoint root.
    #[must_use]
    pub fn api_url(&self, fragment: &str) -> String {
        format!("{}{}", self.endpoint, fragment)
    }

    /// Issues the request, replaying on rate limits, and classifies the
    /// outcome.
    ///
    /// Each attempt rebuilds the wire request from the spec. A 429
    /// response doubles the shared backoff counter and sleeps; once the
    /// doubled delay crosses [`MAX_DELAY_UNITS`] the counter resets and
    /// the call fails with [`Error::TooManyRetries`]. Any successful
    /// response resets the counter. All other failure statuses map to
    /// their typed errors immediately, without retry.
    ///
    /// # Errors
    ///
    /// Returns the classified [`Error`] for transport failures and
    /// non-success statuses.
    pub async fn execute(&self, spec: RequestSpec) -> Result<ApiResponse, Error> {
        loop {
            let response = self.dispatch(&spec).await?;
            let status = response.status().as_u16();

            // mirror the "ok" range: anything below 400 is a success
            if status < 400 {
                self.backoff.reset();
                return self.finish(&spec, response).await;
            }

            if status == 429 {
                let delay = self.backoff.next_delay();
                if delay > MAX_DELAY_UNITS {
                    self.backoff.reset();
                    return Err(Error::TooManyRetries {
                        waited_units: TOTAL_WAIT_UNITS,
                    });
                }
                warn!(
                    delay_units = delay,
                    url = spec.url(),
                    "rate limited; backing off before replay"
                );
                tokio::time::sleep(self.backoff_unit * u32::try_from(delay).unwrap_or(u32::MAX))
                    .await;
                continue;
            }

            return Err(Self::classify_failure(&spec, response).await);
        }
    }

    /// Builds and sends one wire request from the spec.
    async fn dispatch(&self, spec: &RequestSpec) -> Result<reqwest::Response, Error> {
        let mut builder = self
            .client
            .request(spec.method.clone(), &spec.url)
            .header(USER_AGENT, default_user_agent());

        if spec.authenticated {
            builder = builder.header(API_VERSION_HEADER, API_VERSION);
            if let Some(key) = &self.api_key {
                builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
            }
        }

        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !spec.query.is_empty() {
            builder = builder.query(&spec.query);
        }
        builder = match &spec.payload {
            Some(Payload::Json(value)) => builder.json(value),
            Some(Payload::Form(pairs)) => builder.form(pairs),
            Some(Payload::Bytes(body)) => builder.body(body.clone()),
            None => builder,
        };

        debug!(method = spec.method_name(), url = spec.url(), "dispatching request");
        builder
            .send()
            .await
            .map_err(|e| Error::network(spec.method_name(), spec.url(), e))
    }

    /// Reads out a successful response.
    async fn finish(
        &self,
        spec: &RequestSpec,
        response: reqwest::Response,
    ) -> Result<ApiResponse, Error> {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::network(spec.method_name(), &url, e))?;
        debug!(status, url = url.as_str(), bytes = body.len(), "response received");
        Ok(ApiResponse {
            status,
            url,
            headers,
            body,
        })
    }

    /// Maps a non-retryable failure status to its typed error.
    async fn classify_failure(spec: &RequestSpec, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        let context = ResponseContext {
            status,
            method: spec.method_name().to_string(),
            url,
            body,
        };
        match status {
            400 => Error::UnsupportedParams { context },
            401 | 403 => Error::UserNotAuthorised { context },
            404 => Error::ResourceNotFound { context },
            409 => Error::Conflict { context },
            412 => Error::PreConditionFailed { context },
            413 => Error::RequestEntityTooLarge { context },
            428 => Error::PreConditionRequired { context },
            _ => Error::Http { context },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_spec_builder_accumulates() {
        let spec = RequestSpec::post("https://api.refstore.org/users/1/items")
            .header(WRITE_TOKEN_HEADER, "abc")
            .query(vec![("format".to_string(), "json".to_string())])
            .json(serde_json::json!([{"itemType": "attachment"}]));
        assert_eq!(spec.method_name(), "POST");
        assert_eq!(spec.url(), "https://api.refstore.org/users/1/items");
        assert_eq!(spec.headers.len(), 1);
        assert_eq!(spec.query.len(), 1);
        assert!(matches!(spec.payload, Some(Payload::Json(_))));
        assert!(spec.authenticated);
    }

    #[test]
    fn test_request_spec_unauthenticated() {
        let spec = RequestSpec::post("https://storage.example.com/upload").unauthenticated();
        assert!(!spec.authenticated);
    }

    #[test]
    fn test_default_user_agent_names_crate() {
        let ua = default_user_agent();
        assert!(ua.starts_with("refstore/"), "unexpected UA: {ua}");
    }

    #[test]
    fn test_write_token_is_32_hex_chars() {
        let token = write_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, write_token(), "tokens must be unique per call");
    }

    #[test]
    fn test_api_url_joins_fragment() {
        let transport = Transport::new("https://api.refstore.org", None);
        assert_eq!(
            transport.api_url("/users/1/items?limit=5"),
            "https://api.refstore.org/users/1/items?limit=5"
        );
    }
}
