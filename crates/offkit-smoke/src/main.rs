//! OffKit smoke harness.
//!
//! Exercises the full proxy lifecycle against a scripted in-process
//! network: install, activate, warm and cold fetches, a simulated outage
//! with offline fallback, and a control-channel purge. Prints a JSON
//! summary of every step and exits non-zero if any step misbehaved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde_json::json;
use tracing::info;
use url::Url;

use offkit_cache::CacheStorage;
use offkit_common::{init_logging, BackoffPolicy, LogConfig};
use offkit_net::{Body, Fetcher, NetError, Request, Response};
use offkit_proxy::{
    EventOutcome, FetchOutcome, LifecycleEvent, OfflineProxy, ProxyConfig, ProxyEvent, ProxyState,
    ServedFrom,
};

/// Scripted network for the harness: a static site that can be unplugged.
struct ScriptedSite {
    pages: Mutex<hashbrown::HashMap<String, String>>,
    online: AtomicBool,
}

impl ScriptedSite {
    fn new() -> Arc<Self> {
        let mut pages = hashbrown::HashMap::new();
        pages.insert(
            "https://app.example/".to_string(),
            "<html>shell</html>".to_string(),
        );
        pages.insert(
            "https://app.example/favicon.svg".to_string(),
            "<svg/>".to_string(),
        );
        pages.insert(
            "https://app.example/offline.html".to_string(),
            "<html>offline</html>".to_string(),
        );
        pages.insert(
            "https://app.example/api/data.json".to_string(),
            "{\"ok\":true}".to_string(),
        );

        Arc::new(Self {
            pages: Mutex::new(pages),
            online: AtomicBool::new(true),
        })
    }

    fn unplug(&self) {
        self.online.store(false, Ordering::SeqCst);
    }
}

impl Fetcher for ScriptedSite {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
        let online = self.online.load(Ordering::SeqCst);
        let page = self
            .pages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(request.url.as_str())
            .cloned();

        async move {
            if !online {
                return Err(NetError::RequestFailed("cable unplugged".to_string()));
            }

            let (status, body) = match page {
                Some(body) => (StatusCode::OK, body),
                None => (StatusCode::NOT_FOUND, "not found".to_string()),
            };

            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            Ok(Response::new(
                request.id,
                request.url,
                status,
                headers,
                Body::Full(body.into_bytes().into()),
            ))
        }
        .boxed()
    }
}

struct StepLog {
    steps: Vec<serde_json::Value>,
    all_ok: bool,
}

impl StepLog {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            all_ok: true,
        }
    }

    fn record(&mut self, name: &str, ok: bool, detail: String, elapsed: Duration) {
        info!(step = name, ok, %detail, "Step finished");
        self.all_ok &= ok;
        self.steps.push(json!({
            "step": name,
            "ok": ok,
            "detail": detail,
            "elapsed_ms": (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        }));
    }
}

async fn describe_fetch(proxy: &OfflineProxy, request: Request) -> (bool, String, ServedFrom) {
    match proxy.handle_fetch(request).await {
        Ok(FetchOutcome::Served { response, source }) => {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<body error: {e}>"));
            (true, format!("{source:?}: {body}"), source)
        }
        Ok(FetchOutcome::Passthrough) => (true, "passthrough".to_string(), ServedFrom::Network),
        Err(e) => (false, format!("error: {e}"), ServedFrom::Network),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogConfig::default().with_filter("offkit=info,offkit_smoke=info"));

    let origin = Url::parse("https://app.example")?;
    let mut config = ProxyConfig::new(
        "smoke-shell-v1",
        origin.clone(),
        vec![
            "/".to_string(),
            "/favicon.svg".to_string(),
            "/offline.html".to_string(),
        ],
        "/offline.html",
    );
    config.precache_backoff = BackoffPolicy::exponential(2);

    let site = ScriptedSite::new();
    let storage = CacheStorage::new();
    let (proxy, mut events) = OfflineProxy::new(config, storage.clone(), site.clone())?;

    let mut log = StepLog::new();

    // Install + activate through the dispatch table, as a host would.
    let started = Instant::now();
    let installed = proxy.dispatch(LifecycleEvent::Install).await;
    log.record(
        "install",
        matches!(installed, Ok(EventOutcome::Completed)),
        format!("state {:?}", proxy.state().await),
        started.elapsed(),
    );

    let started = Instant::now();
    let activated = proxy.dispatch(LifecycleEvent::Activate).await;
    log.record(
        "activate",
        matches!(activated, Ok(EventOutcome::Completed))
            && proxy.state().await == ProxyState::Active,
        format!("state {:?}", proxy.state().await),
        started.elapsed(),
    );

    // Warm fetch: precached shell, no network involved.
    let started = Instant::now();
    let (ok, detail, source) = describe_fetch(&proxy, Request::get(origin.join("/")?)).await;
    log.record(
        "fetch_precached",
        ok && source == ServedFrom::Cache,
        detail,
        started.elapsed(),
    );

    // Cold fetch: network miss populates the store.
    let started = Instant::now();
    let (ok, detail, source) =
        describe_fetch(&proxy, Request::get(origin.join("/api/data.json")?)).await;
    log.record(
        "fetch_cold",
        ok && source == ServedFrom::Network,
        detail,
        started.elapsed(),
    );

    // Population is fire-and-forget; wait for the entry to land before
    // simulating the outage.
    let store = storage.open("smoke-shell-v1").await;
    for _ in 0..50 {
        if store
            .match_request("https://app.example/api/data.json")
            .await
            .is_some()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Unplug the network; the populated entry and offline page carry us.
    site.unplug();

    let started = Instant::now();
    let (ok, detail, source) =
        describe_fetch(&proxy, Request::get(origin.join("/api/data.json")?)).await;
    log.record(
        "fetch_populated_offline",
        ok && source == ServedFrom::Cache,
        detail,
        started.elapsed(),
    );

    let started = Instant::now();
    let (ok, detail, source) =
        describe_fetch(&proxy, Request::navigate(origin.join("/dashboard")?)).await;
    log.record(
        "navigate_offline",
        ok && source == ServedFrom::OfflineFallback,
        detail,
        started.elapsed(),
    );

    // Purge over the control channel; the proxy stops controlling.
    let started = Instant::now();
    proxy
        .dispatch(LifecycleEvent::Message(json!({ "type": "CLEAR_CACHE" })))
        .await?;
    let gone = !storage.has("smoke-shell-v1").await;
    let (_, detail, _) = describe_fetch(&proxy, Request::get(origin.join("/")?)).await;
    log.record(
        "purge",
        gone && detail == "passthrough" && proxy.state().await == ProxyState::Redundant,
        format!("store gone: {gone}, follow-up: {detail}"),
        started.elapsed(),
    );

    let mut event_names = Vec::new();
    while let Ok(event) = events.try_recv() {
        event_names.push(match event {
            ProxyEvent::Installed { .. } => "installed",
            ProxyEvent::SkipWaitingRequested => "skip_waiting_requested",
            ProxyEvent::Activated { .. } => "activated",
            ProxyEvent::ClientsClaimed => "clients_claimed",
            ProxyEvent::CachePopulated { .. } => "cache_populated",
            ProxyEvent::CachePopulationFailed { .. } => "cache_population_failed",
            ProxyEvent::CachePurged { .. } => "cache_purged",
            ProxyEvent::Unregistered => "unregistered",
        });
    }

    let summary = json!({
        "harness": "offkit-smoke",
        "ok": log.all_ok,
        "steps": log.steps,
        "events": event_names,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !log.all_ok {
        std::process::exit(1);
    }
    Ok(())
}
