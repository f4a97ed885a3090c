//! # OffKit Net
//!
//! Request/response model and HTTP fetching for the OffKit offline-first
//! proxy engine.
//!
//! ## Design Goals
//!
//! 1. **Explicit request identity**: method + URL + navigation mode
//! 2. **Single-consumption bodies**: a [`Body`] is consumed once; paths
//!    that must both return and store a response use [`Response::split`]
//! 3. **Pluggable networking**: the [`Fetcher`] seam hides the HTTP client

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod fetch;

pub use fetch::{Fetcher, FetcherConfig, HttpFetcher};

/// Errors that can occur while fetching.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a request is a top-level navigation or a subresource fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    /// Script, style, image, data fetch.
    #[default]
    Subresource,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET subresource request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::Subresource,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create a GET navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request represents a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// A single-consumption response body.
#[derive(Debug)]
pub enum Body {
    /// Empty.
    Empty,
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
}

impl Body {
    /// Consume the body into contiguous bytes.
    pub async fn collect(self) -> Result<Bytes, NetError> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(b) => Ok(b),
            Body::Stream(mut rx) => {
                let mut chunks = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    chunks.push(chunk?);
                }
                Ok(chunks.into_iter().flatten().collect())
            }
        }
    }
}

/// A network or cached response.
#[derive(Debug)]
pub struct Response {
    pub request_id: RequestId,
    /// Final URL after any redirects.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_type: Option<Mime>,
    /// Whether the fetch was answered via one or more redirects.
    pub redirected: bool,
    body: Body,
}

impl Response {
    /// Create a response; content type is derived from the headers.
    pub fn new(
        request_id: RequestId,
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    ) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok());

        Self {
            request_id,
            url,
            status,
            headers,
            content_type,
            redirected: false,
            body,
        }
    }

    /// Check if the response was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Consume the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        self.body.collect().await
    }

    /// Consume the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Consume the body as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Duplicate the response into two independently consumable copies.
    ///
    /// The body is single-consumption, so a path that must both return a
    /// response and store it has to split first. Streaming bodies are
    /// materialized; the returned copies share one buffer.
    pub async fn split(self) -> Result<(Response, Response), NetError> {
        let Response {
            request_id,
            url,
            status,
            headers,
            content_type,
            redirected,
            body,
        } = self;

        let bytes = body.collect().await?;

        let make = |body: Bytes| Response {
            request_id,
            url: url.clone(),
            status,
            headers: headers.clone(),
            content_type: content_type.clone(),
            redirected,
            body: Body::Full(body),
        };

        Ok((make(bytes.clone()), make(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = Request::get(url("https://app.example/data.json"))
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(5));

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.mode, RequestMode::Subresource);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_navigate_request_mode() {
        let request = Request::navigate(url("https://app.example/"));
        assert!(request.is_navigation());

        let request = Request::get(url("https://app.example/app.js"));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_request_id_uniqueness() {
        let (a, b) = (RequestId::new(), RequestId::new());
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[tokio::test]
    async fn test_body_collect_stream() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"hello "))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"world"))).await.unwrap();
        drop(tx);

        let bytes = Body::Stream(rx).collect().await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn test_split_yields_two_consumable_copies() {
        let response = Response::new(
            RequestId::new(),
            url("https://app.example/a.css"),
            StatusCode::OK,
            HeaderMap::new(),
            Body::Full(Bytes::from_static(b"body { margin: 0 }")),
        );

        let (one, two) = response.split().await.unwrap();
        assert_eq!(one.bytes().await.unwrap(), two.bytes().await.unwrap());
    }

    #[tokio::test]
    async fn test_split_materializes_streams() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"chunked"))).await.unwrap();
        drop(tx);

        let response = Response::new(
            RequestId::new(),
            url("https://app.example/stream"),
            StatusCode::OK,
            HeaderMap::new(),
            Body::Stream(rx),
        );

        let (one, two) = response.split().await.unwrap();
        assert_eq!(&one.bytes().await.unwrap()[..], b"chunked");
        assert_eq!(&two.bytes().await.unwrap()[..], b"chunked");
    }

    #[test]
    fn test_content_type_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );

        let response = Response::new(
            RequestId::new(),
            url("https://app.example/"),
            StatusCode::OK,
            headers,
            Body::Empty,
        );

        assert_eq!(
            response.content_type.as_ref().map(|m| m.essence_str()),
            Some("text/html")
        );
    }
}
