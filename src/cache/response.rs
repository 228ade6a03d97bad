//! HTTP response cache.
//!
//! Stores complete responses (status, headers, buffered body) keyed by
//! [`derive_key`]. Each entry costs its body length in bytes. Concurrent
//! misses for the same key are coalesced onto the first request's fill when
//! locking is enabled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use http_body_util::BodyExt;
use metrics::counter;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::error::HttpError;

use super::config::CacheConfig;
use super::keys::{derive_key, key_path};
use super::policy::CachePolicy;
use super::store::{BoundedCache, CacheStats};

const SOURCE: &str = "cache::response";
const STORE_NAME: &str = "responses";
const METRIC_RESPONSE: &str = "tiercache_response_total";

/// Response extension that keeps a response out of the cache.
///
/// Handlers return it alongside their body, e.g.
/// `(Extension(NoStore), html)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStore;

/// A buffered response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
    stored_at: Instant,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers: headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            body,
            stored_at: Instant::now(),
        }
    }

    /// Rebuild the stored response with an `age` header.
    pub fn into_response(self) -> Response {
        let age = self.stored_at.elapsed().as_secs();
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            headers.append(name, value);
        }
        headers.insert(header::AGE, HeaderValue::from(age));

        response
    }
}

/// Response cache counters plus the backing store's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResponseStats {
    pub store: CacheStats,
    pub bypassed: u64,
    pub uncacheable: u64,
    pub coalesced: u64,
    pub pending: usize,
}

#[derive(Default)]
struct ResponseCounters {
    bypassed: AtomicU64,
    uncacheable: AtomicU64,
    coalesced: AtomicU64,
}

type PendingFill = Shared<BoxFuture<'static, Option<CachedResponse>>>;

/// Caches full responses for routes wrapped with the output cache layer.
pub struct ResponseCache {
    entries: BoundedCache<CachedResponse>,
    default_expiration: Duration,
    maximum_body_bytes: usize,
    allow_locking: bool,
    policies: HashMap<String, Arc<CachePolicy>>,
    pending: Arc<DashMap<String, PendingFill>>,
    counters: ResponseCounters,
}

impl ResponseCache {
    pub fn from_config(config: &CacheConfig) -> Self {
        let entries = BoundedCache::new(STORE_NAME, config.response_capacity_bytes)
            .with_statistics(config.track_statistics);
        let policies = config
            .policies
            .iter()
            .map(|policy| (policy.name().to_string(), Arc::new(policy.clone())))
            .collect();

        Self {
            entries,
            default_expiration: config.response_default_expiration,
            maximum_body_bytes: config.response_max_body_bytes,
            allow_locking: config.allow_locking,
            policies,
            pending: Arc::new(DashMap::new()),
            counters: ResponseCounters::default(),
        }
    }

    /// Look up a configured policy by name.
    pub fn policy(&self, name: &str) -> Option<Arc<CachePolicy>> {
        self.policies.get(name).cloned()
    }

    pub fn default_expiration(&self) -> Duration {
        self.default_expiration
    }

    /// Serve `request` from the cache or from `downstream`, storing what
    /// downstream produced when it is cacheable.
    pub async fn handle<F, Fut>(
        &self,
        request: Request<Body>,
        policy: Option<&CachePolicy>,
        downstream: F,
    ) -> Response
    where
        F: FnOnce(Request<Body>) -> Fut,
        Fut: Future<Output = Response>,
    {
        if !is_eligible(&request) {
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_RESPONSE, "outcome" => "bypass").increment(1);
            return downstream(request).await;
        }

        let key = derive_key(
            request.method(),
            request.uri().path(),
            request.uri().query(),
            policy,
        );

        if let Some(cached) = self.entries.get(&key) {
            counter!(METRIC_RESPONSE, "outcome" => "hit").increment(1);
            debug!(cache = "response", key = %key, outcome = "hit");
            return cached.into_response();
        }
        counter!(METRIC_RESPONSE, "outcome" => "miss").increment(1);
        debug!(cache = "response", key = %key, outcome = "miss");

        if !self.allow_locking {
            let response = downstream(request).await;
            return self.fill(&key, policy, response).await.0;
        }

        match self.join_or_lead(&key) {
            FillRole::Waiter(pending) => {
                if let Some(cached) = pending.await {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    counter!(METRIC_RESPONSE, "outcome" => "coalesced").increment(1);
                    return cached.into_response();
                }
                debug!(
                    cache = "response",
                    key = %key,
                    "coalesced fill produced nothing cacheable; running handler"
                );
                let response = downstream(request).await;
                self.fill(&key, policy, response).await.0
            }
            FillRole::Leader(slot) => {
                let response = downstream(request).await;
                let (response, stored) = self.fill(&key, policy, response).await;
                slot.complete(stored);
                response
            }
        }
    }

    fn join_or_lead(&self, key: &str) -> FillRole {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(occupied) => FillRole::Waiter(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                vacant.insert(receiver.map(Result::ok).boxed().shared());
                FillRole::Leader(FillSlot {
                    key: key.to_string(),
                    pending: Arc::clone(&self.pending),
                    sender: Some(sender),
                })
            }
        }
    }

    /// Buffer and store `response` under `key` if it is cacheable.
    ///
    /// Returns the response to send and the stored copy, if any.
    async fn fill(
        &self,
        key: &str,
        policy: Option<&CachePolicy>,
        response: Response,
    ) -> (Response, Option<CachedResponse>) {
        if let Some(reason) = uncacheable_reason(&response) {
            self.mark_uncacheable(key, reason);
            return (response, None);
        }
        if HttpBody::size_hint(response.body()).lower() > self.maximum_body_bytes as u64 {
            self.mark_uncacheable(key, "body_too_large");
            return (response, None);
        }

        let (response, cached) = match buffer_response(response).await {
            Ok(buffered) => buffered,
            Err(err) => {
                warn!(key, error = %err, "failed to buffer response body");
                let response = HttpError::from_error(
                    SOURCE,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Response could not be read",
                    &err,
                )
                .into_response();
                return (response, None);
            }
        };
        if cached.body.len() > self.maximum_body_bytes {
            self.mark_uncacheable(key, "body_too_large");
            return (response, None);
        }

        let expiration = policy.map_or(self.default_expiration, CachePolicy::expiration);
        let cost = (cached.body.len() as u64).max(1);
        match self
            .entries
            .set(key, cached.clone(), cost, Some(expiration))
        {
            Ok(evicted) => {
                counter!(METRIC_RESPONSE, "outcome" => "stored").increment(1);
                debug!(
                    cache = "response",
                    key,
                    bytes = cost,
                    evicted,
                    expiration = ?expiration,
                    "stored response"
                );
                (response, Some(cached))
            }
            Err(err) => {
                warn!(key, error = %err, "response served without caching");
                (response, None)
            }
        }
    }

    fn mark_uncacheable(&self, key: &str, reason: &'static str) {
        self.counters.uncacheable.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_RESPONSE, "outcome" => "uncacheable").increment(1);
        debug!(cache = "response", key, reason, "response not cacheable");
    }

    /// Remove one entry by its exact key.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key)
    }

    /// Remove every entry for `path`, whatever method or query variant.
    pub fn invalidate_path(&self, path: &str) -> usize {
        let removed = self
            .entries
            .remove_where(|key, _| key_path(key) == path);
        debug!(cache = "response", path, removed, "invalidated path");
        removed
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.purge_expired()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn stats(&self) -> ResponseStats {
        ResponseStats {
            store: self.entries.stats(),
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            uncacheable: self.counters.uncacheable.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }
}

enum FillRole {
    Leader(FillSlot),
    Waiter(PendingFill),
}

/// Held by the request filling a key; waiters are released when it is
/// completed or dropped.
struct FillSlot {
    key: String,
    pending: Arc<DashMap<String, PendingFill>>,
    sender: Option<oneshot::Sender<CachedResponse>>,
}

impl FillSlot {
    fn complete(mut self, stored: Option<CachedResponse>) {
        if let (Some(sender), Some(cached)) = (self.sender.take(), stored) {
            let _ = sender.send(cached);
        }
    }
}

impl Drop for FillSlot {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

fn is_eligible(request: &Request<Body>) -> bool {
    (request.method() == Method::GET || request.method() == Method::HEAD)
        && !request.headers().contains_key(header::AUTHORIZATION)
}

fn uncacheable_reason(response: &Response) -> Option<&'static str> {
    if response.status() != StatusCode::OK {
        return Some("status");
    }

    let headers = response.headers();
    if headers.contains_key(header::SET_COOKIE) {
        return Some("set_cookie");
    }

    let forbids_storage = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim())
        .any(|directive| {
            directive.eq_ignore_ascii_case("no-store") || directive.eq_ignore_ascii_case("private")
        });
    if forbids_storage {
        return Some("cache_control");
    }

    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return Some("event_stream");
    }

    if response.extensions().get::<NoStore>().is_some() {
        return Some("no_store");
    }

    None
}

async fn buffer_response(
    response: Response,
) -> Result<(Response, CachedResponse), axum::Error> {
    let (parts, body) = response.into_parts();
    let bytes = BodyExt::collect(body).await?.to_bytes();
    let cached = CachedResponse::new(parts.status, &parts.headers, bytes.clone());
    Ok((Response::from_parts(parts, Body::from(bytes)), cached))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::sync::atomic::AtomicUsize;

    use axum::Extension;

    use super::*;
    use crate::application::error::ErrorReport;

    fn cache() -> ResponseCache {
        ResponseCache::from_config(&CacheConfig::default())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn body_text(response: Response) -> String {
        let bytes = BodyExt::collect(response.into_body())
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let handler = |_req: Request<Body>| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { format!("body-{n}").into_response() }
        };

        let first = cache.handle(get("/cached"), None, handler).await;
        let second = cache.handle(get("/cached"), None, handler).await;

        assert_eq!(body_text(first).await, "body-0");
        assert!(second.headers().contains_key(header::AGE));
        assert_eq!(body_text(second).await, "body-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorized_and_non_get_requests_bypass() {
        let cache = cache();
        let post = Request::builder()
            .method(Method::POST)
            .uri("/cached")
            .body(Body::empty())
            .expect("request");
        let authorized = Request::builder()
            .uri("/cached")
            .header(header::AUTHORIZATION, "Bearer x")
            .body(Body::empty())
            .expect("request");

        for request in [post, authorized] {
            cache
                .handle(request, None, |_| async { "x".into_response() })
                .await;
        }

        let stats = cache.stats();
        assert_eq!(stats.bypassed, 2);
        assert_eq!(stats.store.entry_count, 0);
    }

    #[test]
    fn uncacheable_responses_are_detected() {
        let not_found = StatusCode::NOT_FOUND.into_response();
        assert_eq!(uncacheable_reason(&not_found), Some("status"));

        let cookie = ([(header::SET_COOKIE, "a=b")], "x").into_response();
        assert_eq!(uncacheable_reason(&cookie), Some("set_cookie"));

        let private = ([(header::CACHE_CONTROL, "max-age=5, Private")], "x").into_response();
        assert_eq!(uncacheable_reason(&private), Some("cache_control"));

        let stream = ([(header::CONTENT_TYPE, "text/event-stream")], "x").into_response();
        assert_eq!(uncacheable_reason(&stream), Some("event_stream"));

        let marked = (Extension(NoStore), "x").into_response();
        assert_eq!(uncacheable_reason(&marked), Some("no_store"));

        assert_eq!(uncacheable_reason(&"ok".into_response()), None);
    }

    #[tokio::test]
    async fn oversized_body_is_served_but_not_stored() {
        let config = CacheConfig {
            response_max_body_bytes: 4,
            ..CacheConfig::default()
        };
        let cache = ResponseCache::from_config(&config);

        let response = cache
            .handle(get("/big"), None, |_| async { "0123456789".into_response() })
            .await;

        assert_eq!(body_text(response).await, "0123456789");
        assert!(!cache.contains("GET:/big"));
    }

    #[tokio::test]
    async fn body_over_capacity_is_served_uncached() {
        let config = CacheConfig {
            response_capacity_bytes: NonZeroU64::new(3).expect("non-zero"),
            ..CacheConfig::default()
        };
        let cache = ResponseCache::from_config(&config);

        let response = cache
            .handle(get("/x"), None, |_| async { "four".into_response() })
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(cache.stats().store.entry_count, 0);
    }

    #[tokio::test]
    async fn unreadable_body_becomes_a_reported_server_error() {
        let cache = cache();

        let response = cache
            .handle(get("/broken"), None, |_| async {
                let chunks = futures::stream::iter([
                    Ok(Bytes::from_static(b"partial")),
                    Err(std::io::Error::other("upstream reset")),
                ]);
                Body::from_stream(chunks).into_response()
            })
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.source, SOURCE);
        assert!(report.messages.iter().any(|m| m.contains("upstream reset")));
        assert!(!cache.contains("GET:/broken"));
    }

    #[tokio::test]
    async fn invalidate_path_drops_every_variant() {
        let cache = cache();
        let policy = cache.policy("views").expect("views policy");
        for uri in ["/views?alertstyle=a", "/views?alertstyle=b", "/other"] {
            cache
                .handle(get(uri), Some(policy.as_ref()), |_| async { "x".into_response() })
                .await;
        }

        assert_eq!(cache.invalidate_path("/views"), 2);
        assert!(cache.contains("GET:/other"));
    }
}
