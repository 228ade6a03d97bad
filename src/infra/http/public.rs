use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    application::{
        customers::CustomerService,
        error::{AppError, HttpError},
    },
    cache::{HybridStats, OutputCacheState, ResponseCache, ResponseStats, output_cache_layer},
    domain::{customers::CustomerId, entities::CustomerRecord, error::DomainError},
    infra::db::PostgresRepositories,
};

use super::{
    db_health_response,
    middleware::{log_responses, set_request_context},
};

const SOURCE: &str = "infra::http::public";
const DEFAULT_ALERT_STYLE: &str = "info";

#[derive(Clone)]
pub struct HttpState {
    pub customers: Arc<CustomerService>,
    pub responses: Arc<ResponseCache>,
    pub db: Option<Arc<PostgresRepositories>>,
    pub environment: Arc<str>,
}

pub fn build_router(state: HttpState) -> Router {
    let responses = Arc::clone(&state.responses);

    // Default policy: expiration only, keyed by method and path.
    let cached_routes = Router::new()
        .route("/cached", get(time_probe))
        .layer(middleware::from_fn_with_state(
            OutputCacheState::new(Arc::clone(&responses)),
            output_cache_layer,
        ));

    let view_routes = Router::new()
        .route("/views", get(alert_view))
        .layer(middleware::from_fn_with_state(
            OutputCacheState::for_policy(Arc::clone(&responses), "views"),
            output_cache_layer,
        ));

    let customer_list_routes = Router::new()
        .route("/customers", get(customer_list))
        .layer(middleware::from_fn_with_state(
            OutputCacheState::for_policy(responses, "customers"),
            output_cache_layer,
        ));

    let uncached_routes = Router::new()
        .route("/notcached", get(time_probe))
        .route("/env", get(environment))
        .route("/customers/{id}", get(customer_detail))
        .route("/customers/{id}/cache", delete(invalidate_customer))
        .route("/_cache/stats", get(cache_stats))
        .route("/_health/db", get(db_health));

    cached_routes
        .merge(view_routes)
        .merge(customer_list_routes)
        .merge(uncached_routes)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

/// Current UTC time. Served by both `/notcached` and `/cached`.
async fn time_probe() -> Result<String, HttpError> {
    now_rfc3339()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlertQuery {
    alertstyle: Option<String>,
    page: Option<u32>,
}

async fn alert_view(Query(query): Query<AlertQuery>) -> Result<String, HttpError> {
    let style = query
        .alertstyle
        .as_deref()
        .map(str::trim)
        .filter(|style| !style.is_empty())
        .unwrap_or(DEFAULT_ALERT_STYLE);
    let page = query.page.unwrap_or(1);
    if page == 0 {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Invalid page",
            "page numbers start at 1",
        ));
    }
    let rendered_at = now_rfc3339()?;

    Ok(format!(
        "alert style: {style}; page: {page}; rendered at {rendered_at}"
    ))
}

async fn environment(State(state): State<HttpState>) -> String {
    format!("Environment is {}", state.environment)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CustomerListQuery {
    country: Option<String>,
}

async fn customer_list(
    State(state): State<HttpState>,
    Query(query): Query<CustomerListQuery>,
) -> Result<Json<Vec<CustomerRecord>>, HttpError> {
    let customers = state.customers.customers(query.country.as_deref()).await?;
    Ok(Json(customers))
}

async fn customer_detail(
    State(state): State<HttpState>,
    Path(raw_id): Path<String>,
) -> Result<Json<CustomerRecord>, HttpError> {
    let id = CustomerId::parse(&raw_id).map_err(AppError::from)?;
    let customer = state
        .customers
        .customer(&id)
        .await?
        .ok_or_else(|| AppError::from(DomainError::not_found("customer")))?;
    Ok(Json(customer))
}

async fn invalidate_customer(
    State(state): State<HttpState>,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, HttpError> {
    let id = CustomerId::parse(&raw_id).map_err(AppError::from)?;
    state.customers.invalidate_customer(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct CacheStatsView {
    hybrid: HybridStats,
    responses: ResponseStats,
}

async fn cache_stats(State(state): State<HttpState>) -> Json<CacheStatsView> {
    Json(CacheStatsView {
        hybrid: state.customers.cache().stats(),
        responses: state.responses.stats(),
    })
}

async fn db_health(State(state): State<HttpState>) -> Response {
    match state.db.as_ref() {
        Some(db) => db_health_response(db.health_check().await),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn now_rfc3339() -> Result<String, HttpError> {
    OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
        HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Clock unavailable",
            &err,
        )
    })
}
