//! Request client handed to destinations.
//!
//! Wraps a shared `reqwest::Client` with default options (auth headers,
//! timeout, basic credentials) and turns transport and HTTP failures into
//! [`ActionError`]s: timeouts and connection failures become `Retryable`,
//! non-2xx responses become `Api` with the response status.

use actionkit::ActionError;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::Write;
use std::time::Duration;
use tracing::debug;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Options for one outbound request.
///
/// Unset fields fall back to the client's defaults; headers are merged by
/// name (case-insensitive) with the request's own values winning.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub headers: Vec<(String, String)>,
    pub json: Option<Value>,
    pub form: Option<Vec<(String, String)>>,
    pub body: Option<String>,
    pub search_params: Vec<(String, String)>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Option<Duration>,
    /// Fail on non-2xx responses (default true)
    pub throw_http_errors: Option<bool>,
    /// Gzip the request body
    pub gzip: bool,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::method(Method::GET)
    }

    pub fn post_json(json: Value) -> Self {
        Self {
            method: Some(Method::POST),
            json: Some(json),
            ..Self::default()
        }
    }

    pub fn method(method: Method) -> Self {
        Self {
            method: Some(method),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    pub fn form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = Some(form);
        self
    }

    pub fn search_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.search_params.push((name.into(), value.into()));
        self
    }

    pub fn allow_http_errors(mut self) -> Self {
        self.throw_http_errors = Some(false);
        self
    }

    /// Layers `other` on top of `self`.
    pub fn merge(&self, other: &RequestOptions) -> RequestOptions {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| {
                !other
                    .headers
                    .iter()
                    .any(|(o, _)| o.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect();
        headers.extend(other.headers.iter().cloned());

        let mut search_params = self.search_params.clone();
        search_params.extend(other.search_params.iter().cloned());

        RequestOptions {
            method: other.method.clone().or_else(|| self.method.clone()),
            headers,
            json: other.json.clone().or_else(|| self.json.clone()),
            form: other.form.clone().or_else(|| self.form.clone()),
            body: other.body.clone().or_else(|| self.body.clone()),
            search_params,
            username: other.username.clone().or_else(|| self.username.clone()),
            password: other.password.clone().or_else(|| self.password.clone()),
            timeout: other.timeout.or(self.timeout),
            throw_http_errors: other.throw_http_errors.or(self.throw_http_errors),
            gzip: other.gzip || self.gzip,
        }
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Buffered HTTP response.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub content: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ActionError> {
        serde_json::from_str(&self.content).map_err(|e| {
            ActionError::integration(
                format!("Response body is not the expected JSON: {}", e),
                "INVALID_RESPONSE",
                400,
            )
        })
    }

    /// JSON body when it parses, otherwise the raw text.
    pub fn data(&self) -> Value {
        if self.content.is_empty() {
            return Value::Null;
        }
        serde_json::from_str(&self.content).unwrap_or_else(|_| Value::String(self.content.clone()))
    }
}

/// HTTP client with layered default options.
#[derive(Clone)]
pub struct RequestClient {
    http: Client,
    defaults: RequestOptions,
}

impl RequestClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            defaults: RequestOptions::default(),
        }
    }

    /// Returns a client whose defaults are extended by `options`.
    pub fn with_defaults(&self, options: RequestOptions) -> Self {
        Self {
            http: self.http.clone(),
            defaults: self.defaults.merge(&options),
        }
    }

    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<Response, ActionError> {
        let options = self.defaults.merge(&options);
        let method = options.method.clone().unwrap_or(Method::GET);

        let mut builder = self
            .http
            .request(method.clone(), url)
            .timeout(options.timeout.unwrap_or(DEFAULT_TIMEOUT));

        if !options.search_params.is_empty() {
            builder = builder.query(&options.search_params);
        }
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(username) = &options.username {
            builder = builder.basic_auth(username, options.password.as_deref());
        }

        if let Some((body, content_type)) = encode_body(&options)? {
            if !options.has_header(CONTENT_TYPE.as_str()) {
                if let Some(content_type) = content_type {
                    builder = builder.header(CONTENT_TYPE, content_type);
                }
            }
            let body = if options.gzip {
                builder = builder.header(CONTENT_ENCODING, "gzip");
                gzip(&body)?
            } else {
                body
            };
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let content = response.text().await.map_err(transport_error)?;

        debug!(method = %method, url = %url, status = status.as_u16(), "Outbound request completed");

        if !status.is_success() && options.throw_http_errors.unwrap_or(true) {
            let message = status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(ActionError::api(message, status.as_u16()));
        }

        Ok(Response {
            status: status.as_u16(),
            headers,
            content,
        })
    }
}

fn encode_body(options: &RequestOptions) -> Result<Option<(Vec<u8>, Option<&'static str>)>, ActionError> {
    if let Some(json) = &options.json {
        let bytes = serde_json::to_vec(json)
            .map_err(|e| ActionError::payload_validation(format!("Body is not serializable: {}", e)))?;
        return Ok(Some((bytes, Some("application/json"))));
    }
    if let Some(form) = &options.form {
        let encoded = serde_urlencoded::to_string(form)
            .map_err(|e| ActionError::payload_validation(format!("Form is not encodable: {}", e)))?;
        return Ok(Some((encoded.into_bytes(), Some("application/x-www-form-urlencoded"))));
    }
    Ok(options.body.as_ref().map(|b| (b.clone().into_bytes(), None)))
}

fn gzip(body: &[u8]) -> Result<Vec<u8>, ActionError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map_err(|e| ActionError::retryable(format!("Failed to compress request body: {}", e)))
}

fn transport_error(err: reqwest::Error) -> ActionError {
    if err.is_timeout() {
        ActionError::retryable_with_status("Request timed out", 408)
    } else {
        ActionError::retryable(format!("Request failed: {}", err))
    }
}
