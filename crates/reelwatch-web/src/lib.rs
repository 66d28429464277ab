//! JSON API over the film store and refresh pipeline.
//!
//! Read endpoints are public. Mutating endpoints require a static bearer
//! token; when no token is configured they answer 503 so an unconfigured
//! deployment is read-only rather than wide open.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reelwatch_core::{Film, RatingSnapshot};
use reelwatch_storage::{FilmStore, StoreError};
use reelwatch_sync::{extract_slug, JobStatus, RegisterError, ScrapePipeline, TrackerScheduler};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "reelwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ScrapePipeline>,
    /// Present only in the process that runs the refresh job.
    pub scheduler: Option<Arc<TrackerScheduler>>,
    pub admin_token: Option<String>,
    pub scheduler_enabled: bool,
}

impl AppState {
    fn store(&self) -> &Arc<dyn FilmStore> {
        self.pipeline.store()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/films", get(list_films_handler).post(register_film_handler))
        .route("/api/films/reorder", post(reorder_handler))
        .route(
            "/api/films/{id}",
            get(film_detail_handler).delete(delete_film_handler),
        )
        .route("/api/films/{id}/history", get(history_handler))
        .route("/api/films/{id}/chart", get(chart_handler))
        .route("/api/films/{id}/refresh", post(refresh_handler))
        .route("/api/films/{id}/tracked", post(set_tracked_handler))
        .route("/api/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving http api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RegisterFilmRequest {
    /// Bare slug or a full letterboxd film URL.
    film: String,
}

#[derive(Debug, Deserialize)]
struct SetTrackedRequest {
    tracked: bool,
}

#[derive(Debug, Deserialize)]
struct ReorderRequest {
    ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct FilmDetail {
    #[serde(flatten)]
    film: Film,
    history: Vec<RatingSnapshot>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    films: usize,
    tracked_films: usize,
    scheduler_enabled: bool,
    job: Option<JobStatus>,
    last_tick: Option<reelwatch_sync::TickSummary>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    success: bool,
    snapshot_recorded: bool,
}

async fn list_films_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store().all_films().await {
        Ok(films) => Json(films).into_response(),
        Err(err) => store_error(err),
    }
}

async fn film_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    let film = match state.store().film_by_id(id).await {
        Ok(Some(film)) => film,
        Ok(None) => return not_found(id),
        Err(err) => return store_error(err),
    };
    match state.store().snapshots_for(id).await {
        Ok(history) => Json(FilmDetail { film, history }).into_response(),
        Err(err) => store_error(err),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.store().film_by_id(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(id),
        Err(err) => return store_error(err),
    }
    match state.store().snapshots_for(id).await {
        Ok(history) => Json(history).into_response(),
        Err(err) => store_error(err),
    }
}

/// Plotly-shaped payload: the rating trace on the left axis, the vote count
/// trace on the right.
async fn chart_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    let film = match state.store().film_by_id(id).await {
        Ok(Some(film)) => film,
        Ok(None) => return not_found(id),
        Err(err) => return store_error(err),
    };
    let history = match state.store().snapshots_for(id).await {
        Ok(history) => history,
        Err(err) => return store_error(err),
    };

    let x: Vec<String> = history.iter().map(|s| s.recorded_at.to_rfc3339()).collect();
    let ratings: Vec<f64> = history.iter().map(|s| s.average_rating).collect();
    let counts: Vec<i64> = history.iter().map(|s| s.rating_count).collect();
    Json(serde_json::json!({
        "data": [
            {
                "type": "scatter",
                "mode": "lines+markers",
                "name": "average rating",
                "x": x,
                "y": ratings,
                "marker": {"color": "#0ea5e9"}
            },
            {
                "type": "scatter",
                "mode": "lines",
                "name": "rating count",
                "x": x,
                "y": counts,
                "yaxis": "y2",
                "marker": {"color": "#94a3b8"}
            }
        ],
        "layout": {
            "title": film.display_name,
            "yaxis": {"title": "average rating", "range": [0.0, 5.0]},
            "yaxis2": {"title": "rating count", "overlaying": "y", "side": "right"}
        }
    }))
    .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let films = match state.store().all_films().await {
        Ok(films) => films,
        Err(err) => return store_error(err),
    };
    let tracked = films.iter().filter(|f| f.is_tracked).count();
    let job = match &state.scheduler {
        Some(scheduler) => Some(scheduler.job_status().await),
        None => None,
    };
    Json(StatusResponse {
        films: films.len(),
        tracked_films: tracked,
        scheduler_enabled: state.scheduler_enabled,
        job,
        last_tick: state.pipeline.last_tick().await,
    })
    .into_response()
}

async fn register_film_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterFilmRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let Some(slug) = extract_slug(&body.film) else {
        return json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("not a film slug or film url: {}", body.film),
        );
    };
    match state.pipeline.register_film(&slug).await {
        Ok(film) => (StatusCode::CREATED, Json(film)).into_response(),
        Err(RegisterError::Store(err)) => store_error(err),
        Err(RegisterError::Scrape(err)) => {
            json_error(StatusCode::BAD_GATEWAY, format!("scrape failed: {err}"))
        }
    }
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.pipeline.refresh_now(id).await {
        Ok(report) => Json(RefreshResponse {
            success: report.success,
            snapshot_recorded: report.snapshot_recorded,
        })
        .into_response(),
        Err(err) => match err.downcast::<StoreError>() {
            Ok(err) => store_error(err),
            Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        },
    }
}

async fn set_tracked_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<SetTrackedRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.store().set_tracked(id, body.tracked).await {
        Ok(film) => Json(film).into_response(),
        Err(err) => store_error(err),
    }
}

async fn delete_film_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.store().delete_film(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn reorder_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ReorderRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.store().reorder(&body.ids).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.admin_token else {
        return Err(json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin token not configured".to_string(),
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(expected.as_str()) {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid bearer token".to_string(),
        ));
    }
    Ok(())
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(id) => not_found(id),
        StoreError::DuplicateSlug(slug) => json_error(
            StatusCode::CONFLICT,
            format!("film with slug {slug} is already tracked"),
        ),
        StoreError::Database(err) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn not_found(id: i64) -> Response {
    json_error(StatusCode::NOT_FOUND, format!("film {id} not found"))
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
