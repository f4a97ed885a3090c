//! # OffKit Proxy
//!
//! The offline-first interception proxy for the OffKit engine.
//!
//! ## Features
//!
//! - **Install**: precache a fixed asset manifest as an atomic batch
//! - **Activate**: delete every cache store but the current version
//! - **Fetch interception**: cache-first, network fallback, offline page
//! - **Control channel**: `FORCE_ACTIVATE` and `CLEAR_CACHE` commands
//!
//! ## Architecture
//!
//! ```text
//! Host glue (registration, event delivery)
//!     │
//!     └── OfflineProxy ── dispatch(LifecycleEvent)
//!             ├── handle_install   ─→ CacheStorage (version-named store)
//!             ├── handle_activate  ─→ CacheStorage (stale-store sweep)
//!             ├── handle_fetch     ─→ CacheStore │ Fetcher │ offline page
//!             └── handle_message   ─→ ControlCommand
//!
//! ProxyEvent (mpsc) ─→ host diagnostics
//! ```
//!
//! The proxy never talks to a real browser: the cache store, the network
//! fetch, and the lifecycle events are capabilities handed in by the host.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use offkit_cache::{CacheError, CacheStorage, CacheStore, CachedResponse};
use offkit_common::{run_with_backoff, BackoffPolicy};
use offkit_net::{Body, Fetcher, NetError, Request, RequestId, Response};

// ==================== Errors ====================

/// Errors surfaced by the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Precache failed for {url}: {source}")]
    Precache {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("Lifecycle error: {0}")]
    State(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),
}

// ==================== Configuration ====================

/// Proxy configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Version-tagged cache store name (e.g. "app-shell-v3").
    pub cache_name: String,

    /// Origin this proxy controls; requests elsewhere pass through.
    pub origin: Url,

    /// Assets guaranteed available offline after install.
    pub precache_manifest: Vec<String>,

    /// Fallback page for failed navigations; must appear in the manifest.
    pub offline_page: String,

    /// Ask the host to activate without waiting for idle clients.
    pub skip_waiting: bool,

    /// Take control of open clients on activation.
    pub claim_clients: bool,

    /// Per-asset retry policy during precaching. The hosting environment
    /// owns retry of the install cycle itself, so the default is a single
    /// attempt.
    pub precache_backoff: BackoffPolicy,
}

impl ProxyConfig {
    pub fn new(
        cache_name: impl Into<String>,
        origin: Url,
        precache_manifest: Vec<String>,
        offline_page: impl Into<String>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            origin,
            precache_manifest,
            offline_page: offline_page.into(),
            skip_waiting: true,
            claim_clients: true,
            precache_backoff: BackoffPolicy::none(),
        }
    }
}

// ==================== State ====================

/// Lifecycle state of one proxy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyState {
    /// Constructed, nothing installed.
    #[default]
    New,
    /// Install in flight.
    Installing,
    /// Manifest committed, not yet controlling traffic.
    Installed,
    /// Stale-store sweep in flight.
    Activating,
    /// Controlling fetch traffic.
    Active,
    /// Superseded, purged, or failed; never controls traffic again.
    Redundant,
}

// ==================== Events ====================

/// Diagnostics emitted to the host.
///
/// Fire-and-forget cache population reports its failures here (and via
/// `tracing`) because the response has already been delivered by then.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Installed { assets: usize },
    SkipWaitingRequested,
    Activated { removed: Vec<String> },
    ClientsClaimed,
    CachePopulated { url: String },
    CachePopulationFailed { url: String, error: String },
    CachePurged { name: String },
    Unregistered,
}

// ==================== Lifecycle dispatch ====================

/// A lifecycle event delivered by the host.
#[derive(Debug)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(JsonValue),
}

/// Result of dispatching a lifecycle event.
#[derive(Debug)]
pub enum EventOutcome {
    /// The phase ran to completion.
    Completed,
    /// A fetch event was decided.
    Fetch(FetchOutcome),
}

// ==================== Fetch outcome ====================

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Cache,
    Network,
    OfflineFallback,
}

/// Decision of the fetch interceptor.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Out of scope; the host's default networking proceeds.
    Passthrough,
    /// The proxy answered the request.
    Served {
        response: Response,
        source: ServedFrom,
    },
}

// ==================== Control channel ====================

/// Out-of-band commands from the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
enum ControlCommand {
    #[serde(rename = "FORCE_ACTIVATE")]
    ForceActivate,
    #[serde(rename = "CLEAR_CACHE")]
    ClearCache,
}

// ==================== Proxy ====================

/// The interception proxy for one version of the application shell.
pub struct OfflineProxy {
    config: ProxyConfig,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    state: RwLock<ProxyState>,
    offline_url: Url,
    event_tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl OfflineProxy {
    /// Create a proxy over the given storage and network seam.
    ///
    /// Validates that every manifest entry resolves within the configured
    /// origin and that the offline page is part of the manifest.
    pub fn new(
        config: ProxyConfig,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProxyEvent>), ProxyError> {
        if config.precache_manifest.is_empty() {
            return Err(ProxyError::Config("empty precache manifest".to_string()));
        }
        if !config
            .precache_manifest
            .iter()
            .any(|path| path == &config.offline_page)
        {
            return Err(ProxyError::Config(format!(
                "offline page {} missing from precache manifest",
                config.offline_page
            )));
        }

        for path in &config.precache_manifest {
            let resolved = config
                .origin
                .join(path)
                .map_err(|e| ProxyError::Config(format!("bad manifest path {path}: {e}")))?;
            if resolved.origin() != config.origin.origin() {
                return Err(ProxyError::Config(format!(
                    "manifest path {path} resolves outside origin {}",
                    config.origin
                )));
            }
        }

        let offline_url = config
            .origin
            .join(&config.offline_page)
            .map_err(|e| ProxyError::Config(format!("bad offline page path: {e}")))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                config,
                storage,
                fetcher,
                state: RwLock::new(ProxyState::New),
                offline_url,
                event_tx,
            },
            event_rx,
        ))
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ProxyState {
        *self.state.read().await
    }

    /// Name of the current version's cache store.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Dispatch a lifecycle event to its handler.
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<EventOutcome, ProxyError> {
        match event {
            LifecycleEvent::Install => {
                self.handle_install().await?;
                Ok(EventOutcome::Completed)
            }
            LifecycleEvent::Activate => {
                self.handle_activate().await?;
                Ok(EventOutcome::Completed)
            }
            LifecycleEvent::Fetch(request) => {
                Ok(EventOutcome::Fetch(self.handle_fetch(request).await?))
            }
            LifecycleEvent::Message(payload) => {
                self.handle_message(payload).await;
                Ok(EventOutcome::Completed)
            }
        }
    }

    // ==================== Install phase ====================

    /// Precache the manifest as an atomic batch.
    ///
    /// Assets are fetched concurrently and staged in memory; nothing is
    /// written to the store until every asset succeeded, so a failed or
    /// aborted install leaves no partially populated store. Failure parks
    /// the proxy in [`ProxyState::Redundant`]; the host retries with a new
    /// install cycle.
    pub async fn handle_install(&self) -> Result<(), ProxyError> {
        {
            let mut state = self.state.write().await;
            if matches!(*state, ProxyState::Installing | ProxyState::Activating) {
                return Err(ProxyError::State(format!(
                    "install while {:?}",
                    *state
                )));
            }
            *state = ProxyState::Installing;
        }

        info!(
            store = %self.config.cache_name,
            assets = self.config.precache_manifest.len(),
            "Installing"
        );

        match self.precache_manifest().await {
            Ok(assets) => {
                *self.state.write().await = ProxyState::Installed;
                info!(store = %self.config.cache_name, assets, "Install committed");
                self.emit(ProxyEvent::Installed { assets });
                if self.config.skip_waiting {
                    self.emit(ProxyEvent::SkipWaitingRequested);
                }
                Ok(())
            }
            Err(e) => {
                warn!(store = %self.config.cache_name, error = %e, "Install failed");
                *self.state.write().await = ProxyState::Redundant;
                Err(e)
            }
        }
    }

    async fn precache_manifest(&self) -> Result<usize, ProxyError> {
        let staged = try_join_all(
            self.config
                .precache_manifest
                .iter()
                .map(|path| self.fetch_asset(path)),
        )
        .await?;

        let count = staged.len();
        let store = self.storage.open(&self.config.cache_name).await;
        store.put_all(staged).await?;
        Ok(count)
    }

    async fn fetch_asset(&self, path: &str) -> Result<CachedResponse, ProxyError> {
        // Manifest paths were validated at construction.
        let url = self
            .config
            .origin
            .join(path)
            .map_err(|e| ProxyError::Config(format!("bad manifest path {path}: {e}")))?;

        let response = run_with_backoff(&self.config.precache_backoff, || {
            self.fetcher.fetch(Request::get(url.clone()))
        })
        .await
        .map_err(|source| ProxyError::Precache {
            url: url.to_string(),
            source,
        })?;

        if !response.ok() || response.redirected {
            return Err(ProxyError::Precache {
                url: url.to_string(),
                source: NetError::RequestFailed(format!(
                    "asset resolved with status {}{}",
                    response.status,
                    if response.redirected { " via redirect" } else { "" }
                )),
            });
        }

        cached_from_response(response)
            .await
            .map_err(|source| ProxyError::Precache {
                url: url.to_string(),
                source,
            })
    }

    // ==================== Activate phase ====================

    /// Sweep stale stores and start controlling traffic.
    ///
    /// Wholesale deletion of non-current stores is the sole eviction
    /// mechanism; there is no per-entry expiry.
    pub async fn handle_activate(&self) -> Result<(), ProxyError> {
        {
            let mut state = self.state.write().await;
            if *state != ProxyState::Installed {
                return Err(ProxyError::State(format!(
                    "activate requires a committed install, state is {:?}",
                    *state
                )));
            }
            *state = ProxyState::Activating;
        }

        let mut removed = Vec::new();
        for name in self.storage.keys().await {
            if name != self.config.cache_name && self.storage.delete(&name).await {
                debug!(store = %name, "Deleted stale cache store");
                removed.push(name);
            }
        }

        *self.state.write().await = ProxyState::Active;
        info!(store = %self.config.cache_name, stale = removed.len(), "Activated");
        self.emit(ProxyEvent::Activated { removed });
        if self.config.claim_clients {
            self.emit(ProxyEvent::ClientsClaimed);
        }
        Ok(())
    }

    // ==================== Fetch interception ====================

    /// Decide one intercepted request.
    ///
    /// Order: scope filter, cache lookup, network fetch with opportunistic
    /// population, offline/second-look fallbacks. Cache population is
    /// fire-and-forget relative to the response path.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, ProxyError> {
        // Scope filter: only an active proxy handles same-origin GETs.
        if *self.state.read().await != ProxyState::Active {
            trace!(url = %request.url, "Not controlling; passing through");
            return Ok(FetchOutcome::Passthrough);
        }
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Non-GET; passing through");
            return Ok(FetchOutcome::Passthrough);
        }
        if request.url.origin() != self.config.origin.origin() {
            trace!(url = %request.url, "Cross-origin; passing through");
            return Ok(FetchOutcome::Passthrough);
        }

        let store = self.storage.open(&self.config.cache_name).await;

        // Cache-first: no freshness check, entries live until rollover.
        if let Some(entry) = store.match_request(request.url.as_str()).await {
            debug!(url = %request.url, "Serving from cache");
            return Ok(FetchOutcome::Served {
                response: response_from_cached(request.id, &request.url, &entry),
                source: ServedFrom::Cache,
            });
        }

        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if self.cacheable(&response) {
                    let (to_caller, to_store) = response.split().await?;
                    self.spawn_population(store, to_store);
                    Ok(FetchOutcome::Served {
                        response: to_caller,
                        source: ServedFrom::Network,
                    })
                } else {
                    debug!(
                        url = %request.url,
                        status = %response.status,
                        redirected = response.redirected,
                        "Response not cacheable; passing along"
                    );
                    Ok(FetchOutcome::Served {
                        response,
                        source: ServedFrom::Network,
                    })
                }
            }
            Err(net_err) => {
                warn!(url = %request.url, error = %net_err, "Network fetch failed");

                if request.is_navigation() {
                    if let Some(entry) = store.match_request(self.offline_url.as_str()).await {
                        info!(url = %request.url, "Serving offline page");
                        return Ok(FetchOutcome::Served {
                            response: response_from_cached(request.id, &self.offline_url, &entry),
                            source: ServedFrom::OfflineFallback,
                        });
                    }
                    return Err(ProxyError::Network(net_err));
                }

                // Best-effort second look: a concurrent population may have
                // landed the entry since the miss above.
                if let Some(entry) = store.match_request(request.url.as_str()).await {
                    debug!(url = %request.url, "Serving from cache on second look");
                    return Ok(FetchOutcome::Served {
                        response: response_from_cached(request.id, &request.url, &entry),
                        source: ServedFrom::Cache,
                    });
                }
                Err(ProxyError::Network(net_err))
            }
        }
    }

    /// Only direct, same-origin 200 responses enter the cache.
    fn cacheable(&self, response: &Response) -> bool {
        response.status == StatusCode::OK
            && !response.redirected
            && response.url.origin() == self.config.origin.origin()
    }

    fn spawn_population(&self, store: CacheStore, response: Response) {
        let events = self.event_tx.clone();
        let url = response.url.to_string();

        tokio::spawn(async move {
            let entry = match cached_from_response(response).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(url = %url, error = %e, "Cache population failed");
                    let _ = events.send(ProxyEvent::CachePopulationFailed {
                        url,
                        error: e.to_string(),
                    });
                    return;
                }
            };

            match store.put(entry).await {
                Ok(()) => {
                    debug!(url = %url, "Cached network response");
                    let _ = events.send(ProxyEvent::CachePopulated { url });
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Cache population failed");
                    let _ = events.send(ProxyEvent::CachePopulationFailed {
                        url,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    // ==================== Control channel ====================

    /// Handle an out-of-band command. Unrecognized payloads are ignored.
    pub async fn handle_message(&self, payload: JsonValue) {
        match serde_json::from_value::<ControlCommand>(payload) {
            Ok(ControlCommand::ForceActivate) => {
                info!("Force-activate requested");
                self.force_activate().await;
            }
            Ok(ControlCommand::ClearCache) => {
                info!("Cache purge requested");
                self.purge().await;
            }
            Err(_) => {
                trace!("Ignoring unrecognized control message");
            }
        }
    }

    async fn force_activate(&self) {
        self.emit(ProxyEvent::SkipWaitingRequested);
        if *self.state.read().await == ProxyState::Installed {
            if let Err(e) = self.handle_activate().await {
                warn!(error = %e, "Forced activation failed");
            }
        }
    }

    /// Full reset: delete the store and stop controlling traffic. The host
    /// deregisters the scope on [`ProxyEvent::Unregistered`].
    async fn purge(&self) {
        self.storage.delete(&self.config.cache_name).await;
        *self.state.write().await = ProxyState::Redundant;
        self.emit(ProxyEvent::CachePurged {
            name: self.config.cache_name.clone(),
        });
        self.emit(ProxyEvent::Unregistered);
    }

    fn emit(&self, event: ProxyEvent) {
        let _ = self.event_tx.send(event);
    }
}

// ==================== Conversions ====================

/// Materialize a response into its stored form.
async fn cached_from_response(response: Response) -> Result<CachedResponse, NetError> {
    let url = response.url.to_string();
    let status = response.status.as_u16();

    let mut headers = hashbrown::HashMap::new();
    for (name, value) in response.headers.iter() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_string(), v.to_string());
        }
    }

    let body = response.bytes().await?;
    Ok(CachedResponse::get(&url, status, headers, body.to_vec()))
}

/// Rehydrate a stored entry into a servable response.
fn response_from_cached(request_id: RequestId, url: &Url, entry: &CachedResponse) -> Response {
    let url = Url::parse(&entry.url).unwrap_or_else(|_| url.clone());

    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(n, v);
        }
    }

    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    Response::new(
        request_id,
        url,
        status,
        headers,
        Body::Full(Bytes::from(entry.body.clone())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use serde_json::json;

    /// Fetcher that always fails, for wiring-level tests.
    struct DownFetcher;

    impl Fetcher for DownFetcher {
        fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
            let url = request.url.to_string();
            async move { Err(NetError::RequestFailed(format!("offline: {url}"))) }.boxed()
        }
    }

    fn origin() -> Url {
        Url::parse("https://app.example").unwrap()
    }

    fn config() -> ProxyConfig {
        ProxyConfig::new(
            "shell-v1",
            origin(),
            vec!["/".to_string(), "/offline.html".to_string()],
            "/offline.html",
        )
    }

    fn proxy(config: ProxyConfig) -> (OfflineProxy, mpsc::UnboundedReceiver<ProxyEvent>) {
        OfflineProxy::new(config, CacheStorage::new(), Arc::new(DownFetcher)).unwrap()
    }

    #[test]
    fn test_offline_page_must_be_precached() {
        let config = ProxyConfig::new(
            "shell-v1",
            origin(),
            vec!["/".to_string()],
            "/offline.html",
        );
        let result = OfflineProxy::new(config, CacheStorage::new(), Arc::new(DownFetcher));
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_manifest_must_stay_in_origin() {
        let config = ProxyConfig::new(
            "shell-v1",
            origin(),
            vec![
                "https://cdn.example/app.js".to_string(),
                "/offline.html".to_string(),
            ],
            "/offline.html",
        );
        let result = OfflineProxy::new(config, CacheStorage::new(), Arc::new(DownFetcher));
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let config = ProxyConfig::new("shell-v1", origin(), vec![], "/offline.html");
        let result = OfflineProxy::new(config, CacheStorage::new(), Arc::new(DownFetcher));
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let (proxy, _rx) = proxy(config());
        assert!(matches!(
            proxy.handle_activate().await,
            Err(ProxyError::State(_))
        ));
        assert_eq!(proxy.state().await, ProxyState::New);
    }

    #[tokio::test]
    async fn test_failed_install_is_redundant() {
        let (proxy, _rx) = proxy(config());
        assert!(proxy.handle_install().await.is_err());
        assert_eq!(proxy.state().await, ProxyState::Redundant);
    }

    #[tokio::test]
    async fn test_fetch_passthrough_before_activation() {
        let (proxy, _rx) = proxy(config());
        let request = Request::get(origin().join("/app.js").unwrap());
        let outcome = proxy.handle_fetch(request).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough));
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let (proxy, mut rx) = proxy(config());
        proxy.handle_message(json!({ "type": "REFRESH_TOKENS" })).await;
        proxy.handle_message(json!("not even an object")).await;
        proxy.handle_message(json!({ "kind": "CLEAR_CACHE" })).await;

        assert_eq!(proxy.state().await, ProxyState::New);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_control_command_parsing() {
        let cmd: ControlCommand =
            serde_json::from_value(json!({ "type": "FORCE_ACTIVATE" })).unwrap();
        assert_eq!(cmd, ControlCommand::ForceActivate);

        let cmd: ControlCommand = serde_json::from_value(json!({ "type": "CLEAR_CACHE" })).unwrap();
        assert_eq!(cmd, ControlCommand::ClearCache);

        assert!(serde_json::from_value::<ControlCommand>(json!({ "type": "NOPE" })).is_err());
    }

    #[tokio::test]
    async fn test_cached_response_round_trip() {
        let url = origin().join("/data.json").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let response = Response::new(
            RequestId::new(),
            url.clone(),
            StatusCode::OK,
            headers,
            Body::Full(Bytes::from_static(b"{\"n\":1}")),
        );

        let entry = cached_from_response(response).await.unwrap();
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.url, url.to_string());

        let served = response_from_cached(RequestId::new(), &url, &entry);
        assert_eq!(served.status, StatusCode::OK);
        assert_eq!(
            served.content_type.as_ref().map(|m| m.essence_str()),
            Some("application/json")
        );
        assert_eq!(&served.bytes().await.unwrap()[..], b"{\"n\":1}");
    }
}
