use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Extension,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::future::join_all;
use tiercache::cache::{CacheConfig, CachePolicy, NoStore, ResponseCache, derive_key};

fn response_cache(allow_locking: bool) -> ResponseCache {
    ResponseCache::from_config(&CacheConfig {
        allow_locking,
        ..CacheConfig::default()
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8")
}

/// Serve `uri`, counting how often the handler runs.
async fn serve(
    cache: &ResponseCache,
    policy: Option<&CachePolicy>,
    uri: &str,
    calls: &Arc<AtomicUsize>,
) -> Response {
    let calls = Arc::clone(calls);
    cache
        .handle(get(uri), policy, move |request| async move {
            let run = calls.fetch_add(1, Ordering::SeqCst);
            format!("run {run} for {}", request.uri()).into_response()
        })
        .await
}

/// Like [`serve`], but the handler takes 50ms and may set a cookie.
async fn serve_slow(
    cache: &ResponseCache,
    uri: &str,
    calls: &Arc<AtomicUsize>,
    set_cookie: bool,
) -> Response {
    let calls = Arc::clone(calls);
    cache
        .handle(get(uri), None, move |_request| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if set_cookie {
                ([(header::SET_COOKIE, "session=abc")], "personal").into_response()
            } else {
                "shared".into_response()
            }
        })
        .await
}

#[tokio::test]
async fn varied_parameters_select_the_entry_regardless_of_order() {
    let cache = response_cache(true);
    let policy = cache.policy("views").expect("views policy");
    let calls = Arc::new(AtomicUsize::new(0));

    let first = serve(
        &cache,
        Some(policy.as_ref()),
        "/views?alertstyle=warning&page=2",
        &calls,
    )
    .await;
    let first = body_text(first).await;

    // `page` is not varied, and parameter order does not matter.
    let second = serve(
        &cache,
        Some(policy.as_ref()),
        "/views?page=9&alertstyle=warning",
        &calls,
    )
    .await;
    assert!(second.headers().contains_key(header::AGE));
    assert_eq!(body_text(second).await, first);

    let other = serve(&cache, Some(policy.as_ref()), "/views?alertstyle=danger", &calls).await;
    assert_ne!(body_text(other).await, first);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.contains(&derive_key(
        &axum::http::Method::GET,
        "/views",
        Some("alertstyle=warning"),
        Some(policy.as_ref()),
    )));
}

#[tokio::test]
async fn responses_with_cookies_or_no_store_are_never_stored() {
    let cache = response_cache(true);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let response = cache
            .handle(get("/profile"), None, move |_request| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ([(header::SET_COOKIE, "session=abc")], "hello").into_response()
            })
            .await;
        assert!(!response.headers().contains_key(header::AGE));
    }

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        cache
            .handle(get("/draft"), None, move |_request| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                (Extension(NoStore), "draft").into_response()
            })
            .await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(cache.stats().uncacheable, 4);
    assert_eq!(cache.stats().store.entry_count, 0);
}

#[tokio::test]
async fn error_statuses_are_passed_through_uncached() {
    let cache = response_cache(true);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let response = cache
            .handle(get("/missing"), None, move |_request| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                StatusCode::NOT_FOUND.into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_are_coalesced() {
    let cache = response_cache(true);
    let calls = Arc::new(AtomicUsize::new(0));

    let responses = join_all((0..5).map(|_| serve_slow(&cache, "/cached", &calls, false))).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "shared");
    }
    let stats = cache.stats();
    assert_eq!(stats.coalesced, 4);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn without_locking_every_miss_runs_the_handler() {
    let cache = response_cache(false);
    let calls = Arc::new(AtomicUsize::new(0));

    join_all((0..3).map(|_| serve_slow(&cache, "/cached", &calls, false))).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.stats().coalesced, 0);
}

#[tokio::test(start_paused = true)]
async fn waiters_run_the_handler_when_the_leader_stores_nothing() {
    let cache = response_cache(true);
    let calls = Arc::new(AtomicUsize::new(0));

    let responses = join_all((0..3).map(|_| serve_slow(&cache, "/me", &calls, true))).await;

    // Private responses are never shared between callers.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    for response in responses {
        assert!(response.headers().contains_key(header::SET_COOKIE));
    }
    assert_eq!(cache.stats().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn stored_response_expires_after_the_policy_lifetime() {
    let cache = response_cache(true);
    let calls = Arc::new(AtomicUsize::new(0));

    serve(&cache, None, "/cached", &calls).await;
    tokio::time::advance(Duration::from_secs(29)).await;
    let response = serve(&cache, None, "/cached", &calls).await;
    assert_eq!(
        response.headers().get(header::AGE).map(|age| age.as_bytes()),
        Some(&b"29"[..])
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    serve(&cache, None, "/cached", &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_all_empties_the_store() {
    let cache = response_cache(true);
    let calls = Arc::new(AtomicUsize::new(0));

    serve(&cache, None, "/a", &calls).await;
    serve(&cache, None, "/b", &calls).await;
    assert_eq!(cache.stats().store.entry_count, 2);

    cache.invalidate_all();
    serve(&cache, None, "/a", &calls).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
