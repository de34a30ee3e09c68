use std::collections;
use std::sync::Arc;
use std::time;

use http::{Method, StatusCode};
use reqwest::header;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::endpoint::DiscoveryEndpoint;
use crate::retry::RetryPolicy;

/// Errors raised by a `RequestMiddleware`, or by validating the spec it returned.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    #[error("request middleware rejected the request: {0}")]
    Rejected(String),
    #[error("request body must be a JSON object")]
    BodyNotAnObject,
    #[error("request path must start with '/', got {0:?}")]
    RelativePath(String),
}

/// Enumeration of errors that can happen while talking to the discovery server.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
    #[error("error building discovery url")]
    ParseUrlError(#[from] url::ParseError),
    #[error("error parsing request headers")]
    ParseHeadersError(http::Error),
    #[error("failed to construct http client: {0}")]
    ClientBuildError(reqwest::Error),
    #[error("request to the discovery server failed: {0}")]
    RequestError(reqwest::Error),
    #[error("discovery server responded with {status}")]
    ServerError { status: StatusCode, body: String },
    #[error("failed to decode discovery server response: {0}")]
    DecodeError(#[from] serde_json::Error),
}

impl TransportError {
    /// Network failures, timeouts and 5xx responses may go away if we try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::RequestError(_) | TransportError::ServerError { .. }
        )
    }
}

/// Describes a single request to the discovery server, before middleware runs.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    /// Route relative to the endpoint's base path, e.g. `/heartbeat`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: collections::HashMap<String, String>,
    pub body: Option<Value>,
    /// Keep the response body as text instead of parsing it as JSON.
    pub raw: bool,
    /// Overrides the transport's default timeout.
    pub timeout: Option<time::Duration>,
    /// Overrides the transport's default retry policy.
    pub retry_policy: Option<RetryPolicy>,
}

impl RequestSpec {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_owned(),
            query: Vec::new(),
            headers: collections::HashMap::new(),
            body: None,
            raw: false,
            timeout: None,
            retry_policy: None,
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    fn validate(&self) -> Result<(), MiddlewareError> {
        if !self.path.starts_with('/') {
            return Err(MiddlewareError::RelativePath(self.path.clone()));
        }

        match &self.body {
            Some(body) if !body.is_object() => Err(MiddlewareError::BodyNotAnObject),
            _ => Ok(()),
        }
    }
}

/// A transform applied to every `RequestSpec` before it is dispatched.
/// Typical uses are injecting auth headers or tagging requests.
pub trait RequestMiddleware: Send + Sync {
    fn transform(&self, spec: RequestSpec) -> Result<RequestSpec, MiddlewareError>;
}

impl<F> RequestMiddleware for F
where
    F: Fn(RequestSpec) -> Result<RequestSpec, MiddlewareError> + Send + Sync,
{
    fn transform(&self, spec: RequestSpec) -> Result<RequestSpec, MiddlewareError> {
        self(spec)
    }
}

/// Middleware that hands the spec through untouched.
pub struct Passthrough;

impl RequestMiddleware for Passthrough {
    fn transform(&self, spec: RequestSpec) -> Result<RequestSpec, MiddlewareError> {
        Ok(spec)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

/// The outcome of a request that was not retryable, or that eventually succeeded.
/// 4xx responses are returned here too: interpreting them is up to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub body: ResponseBody,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Deserialize the body into `T`.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        let parsed = match self.body {
            ResponseBody::Json(value) => serde_json::from_value(value)?,
            ResponseBody::Text(text) => serde_json::from_str(&text)?,
        };
        Ok(parsed)
    }
}

/// The request pipeline every interaction with the discovery server goes through:
/// middleware, then dispatch, then a bounded retry on retryable failures.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    endpoint: DiscoveryEndpoint,
    retry_policy: RetryPolicy,
    timeout: time::Duration,
    middleware: Arc<dyn RequestMiddleware>,
}

impl Transport {
    pub fn new(
        endpoint: DiscoveryEndpoint,
        retry_policy: RetryPolicy,
        timeout: time::Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("BitMonX Discovery Client")
            .build()
            .map_err(TransportError::ClientBuildError)?;

        Ok(Self {
            client,
            endpoint,
            retry_policy,
            timeout,
            middleware: Arc::new(Passthrough),
        })
    }

    /// Replace the request middleware.
    pub fn with_middleware<M: RequestMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware = Arc::new(middleware);
        self
    }

    pub fn endpoint(&self) -> &DiscoveryEndpoint {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Send a request to the discovery server.
    ///
    /// Middleware failures are returned straight away. Network errors, timeouts and 5xx
    /// responses are retried according to the request's retry policy (or the transport's
    /// default), waiting `RetryPolicy::next_delay` between attempts. Any other response,
    /// 4xx included, is returned as is.
    pub async fn send(&self, spec: RequestSpec) -> Result<Response, TransportError> {
        let spec = self.middleware.transform(spec)?;
        spec.validate()?;

        let retry_policy = spec.retry_policy.unwrap_or(self.retry_policy);
        let url = self.endpoint.url(&spec.path, &spec.query)?;
        let headers: header::HeaderMap = (&spec.headers)
            .try_into()
            .map_err(TransportError::ParseHeadersError)?;

        let mut attempt = 0;
        loop {
            let result = self.dispatch(&spec, url.clone(), headers.clone()).await;

            match result {
                Err(error) if error.is_retryable() && retry_policy.should_retry(attempt) => {
                    let delay = retry_policy.next_delay(attempt);
                    warn!(
                        "{} {} failed on attempt {}, retrying in {:?}: {}",
                        spec.method, spec.path, attempt, delay, error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn dispatch(
        &self,
        spec: &RequestSpec,
        url: reqwest::Url,
        headers: header::HeaderMap,
    ) -> Result<Response, TransportError> {
        let mut request = self
            .client
            .request(spec.method.clone(), url)
            .headers(headers)
            .timeout(spec.timeout.unwrap_or(self.timeout));

        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let now = tokio::time::Instant::now();
        let result = request.send().await;
        let elapsed = now.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(response) => response.status().as_u16().to_string(),
            Err(error) if error.is_timeout() => "timeout".to_owned(),
            Err(_) => "error".to_owned(),
        };
        let labels = [("path", spec.path.clone()), ("outcome", outcome)];
        metrics::counter!("discovery_requests_total", &labels).increment(1);
        metrics::histogram!("discovery_request_duration_seconds", &labels).record(elapsed);

        let response = result.map_err(TransportError::RequestError)?;
        let status = response.status();
        let text = response.text().await.map_err(TransportError::RequestError)?;

        debug!("{} {} responded with {}", spec.method, spec.path, status);

        if status.is_server_error() {
            return Err(TransportError::ServerError { status, body: text });
        }

        let body = decode_body(status, text, spec.raw)?;

        Ok(Response { status, body })
    }
}

/// Parse a response body as JSON unless `raw` is set. Empty bodies decode to `null`.
/// A client error may carry a plain text explanation, so it falls back to text.
fn decode_body(
    status: StatusCode,
    text: String,
    raw: bool,
) -> Result<ResponseBody, TransportError> {
    if raw {
        return Ok(ResponseBody::Text(text));
    }

    if text.trim().is_empty() {
        return Ok(ResponseBody::Json(Value::Null));
    }

    match serde_json::from_str(&text) {
        Ok(value) => Ok(ResponseBody::Json(value)),
        Err(_) if !status.is_success() => Ok(ResponseBody::Text(text)),
        Err(error) => Err(TransportError::DecodeError(error)),
    }
}
