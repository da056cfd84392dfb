//! Axum JSON read API over stored seismic events, plus the manual fetch trigger.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quakewatch_core::recent_window_start;
use quakewatch_storage::{EventFilter, EventStore, Pagination};
use quakewatch_sync::SyncPipeline;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "quakewatch-web";
pub const DEFAULT_PER_PAGE: u32 = 15;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            store: pipeline.store(),
            pipeline,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/earthquakes", get(index_handler))
        .route("/api/earthquakes/recent", get(recent_handler))
        .route("/api/earthquakes/significant", get(significant_handler))
        .route("/api/earthquakes/fetch", post(fetch_handler))
        .route("/api/earthquakes/{id}", get(show_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct IndexQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub min_magnitude: Option<f64>,
    pub max_magnitude: Option<f64>,
    pub region: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
struct FetchResponse {
    success: bool,
    message: String,
    new_events: usize,
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC).
fn parse_date_param(name: &str, value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Some(naive) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(naive.and_utc());
    }
    Err(format!("invalid {name}: {value:?}"))
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

impl IndexQuery {
    fn to_filter(&self) -> Result<EventFilter, String> {
        let start = self
            .start_date
            .as_deref()
            .map(|v| parse_date_param("start_date", v))
            .transpose()?;
        let end = self
            .end_date
            .as_deref()
            .map(|v| parse_date_param("end_date", v))
            .transpose()?;
        Ok(EventFilter {
            start,
            end,
            min_magnitude: self.min_magnitude,
            max_magnitude: self.max_magnitude,
            region: self.region.clone(),
            page: Some(Pagination {
                page: self.page.unwrap_or(1).max(1),
                per_page: self
                    .per_page
                    .unwrap_or(DEFAULT_PER_PAGE)
                    .clamp(1, MAX_PER_PAGE),
            }),
            ..Default::default()
        })
    }
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Response {
    let filter = match query.to_filter() {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };
    match state.store.query(&filter).await {
        Ok(page) => Json(serde_json::json!({
            "data": page.data,
            "page": page.page,
            "per_page": page.per_page,
            "total": page.total,
            "last_page": page.last_page,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn list_unpaged(state: &AppState, filter: EventFilter) -> Response {
    match state.store.query(&filter).await {
        Ok(page) => Json(page.data).into_response(),
        Err(err) => server_error(err),
    }
}

async fn recent_handler(State(state): State<Arc<AppState>>) -> Response {
    let filter = EventFilter {
        since: Some(recent_window_start(Utc::now())),
        ..Default::default()
    };
    list_unpaged(&state, filter).await
}

async fn significant_handler(State(state): State<Arc<AppState>>) -> Response {
    let filter = EventFilter {
        significant_only: true,
        ..Default::default()
    };
    list_unpaged(&state, filter).await
}

async fn show_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.store.find(id).await {
        Ok(Some(event)) => Json(event).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("earthquake {id} not found") })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn fetch_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => {
            let count = summary.new_events();
            Json(FetchResponse {
                success: true,
                message: format!("Earthquake data updated: {count} new earthquakes added"),
                new_events: count,
            })
            .into_response()
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "manual fetch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(FetchResponse {
                    success: false,
                    message: format!("{err:#}"),
                    new_events: 0,
                }),
            )
                .into_response()
        }
    }
}
