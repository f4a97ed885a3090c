//! The network seam and its HTTP implementation.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use tracing::{debug, trace};

use crate::{Body, NetError, Request, Response};

/// Asynchronous network fetch, as handed to the proxy by its host.
///
/// Implementations must resolve a [`Request`] to a [`Response`] or fail
/// with a network error; they never consult any cache.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout for requests that set none.
    pub default_timeout: Duration,
    /// Maximum redirects to follow.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "OffKit/1.0".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// [`Fetcher`] backed by a reqwest client.
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: FetcherConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        Ok(Self { client, config })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
        let client = self.client.clone();
        let accept_language = self.config.accept_language.clone();
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        async move {
            debug!(url = %request.url, method = %request.method, "Fetching resource");

            let mut builder = client
                .request(request.method.clone(), request.url.clone())
                .timeout(timeout);

            for (name, value) in request.headers.iter() {
                builder = builder.header(name, value);
            }
            builder = builder.header("Accept-Language", &accept_language);

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    NetError::Timeout(timeout)
                } else {
                    NetError::HttpError(e)
                }
            })?;

            let status = response.status();
            let headers = response.headers().clone();
            let final_url = response.url().clone();
            let redirected = final_url != request.url;

            let body = response.bytes().await?;

            trace!(
                url = %final_url,
                status = %status,
                redirected,
                body_len = body.len(),
                "Response received"
            );

            let mut resolved = Response::new(
                request.id,
                final_url,
                status,
                headers,
                Body::Full(body),
            );
            resolved.redirected = redirected;
            Ok(resolved)
        }
        .boxed()
    }
}
