//! Output cache middleware.
//!
//! Wraps a route with the response cache. Routes without the layer are never
//! cached; routes with it use a named policy or, without one, the default
//! expiration keyed by method and path.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::{instrument, warn};

use super::policy::CachePolicy;
use super::response::ResponseCache;

/// State for [`output_cache_layer`].
#[derive(Clone)]
pub struct OutputCacheState {
    cache: Arc<ResponseCache>,
    policy: Option<Arc<CachePolicy>>,
}

impl OutputCacheState {
    /// Cache with the default expiration, varying by method and path only.
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self {
            cache,
            policy: None,
        }
    }

    /// Cache with the named policy.
    ///
    /// An unknown name falls back to the default behaviour.
    pub fn for_policy(cache: Arc<ResponseCache>, name: &str) -> Self {
        let policy = cache.policy(name);
        if policy.is_none() {
            warn!(policy = name, "unknown cache policy; using defaults");
        }
        Self { cache, policy }
    }

    pub fn policy(&self) -> Option<&CachePolicy> {
        self.policy.as_deref()
    }
}

#[instrument(skip_all, fields(path = %request.uri().path(), policy = ?state.policy().map(CachePolicy::name)))]
pub async fn output_cache_layer(
    State(state): State<OutputCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    state
        .cache
        .handle(request, state.policy(), move |request| next.run(request))
        .await
}
