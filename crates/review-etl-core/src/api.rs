//! HTTP surface of the query service as an axum [`Router`].
//!
//! | route | success |
//! | --- | --- |
//! | `GET /health` | service status |
//! | `GET /entities?filter=&page=&limit=` | `{"items": [...], "next_page": ...}` |
//! | `GET /entities/{key}` | summary, records and aggregates |
//! | `GET /entities/{key}/aggregates?window=LO..HI` | list of aggregates |
//! | `GET /api/v1/sentiment/{key}` | latest sentiment figures |
//!
//! Missing entities and unknown routes answer 404 `{"error":"not_found"}`;
//! bad parameters answer 400 `{"error":"validation_error","detail":...}`.
//! When an API key is configured, every route except `/health` requires it
//! in the `X-API-Key` header and answers 403 `{"error":"forbidden",...}`
//! otherwise.
//!
//! The router is served by any hyper-compatible server; [`call`] drives it
//! in-process for one request, which is how the CLI's `serve-request` works.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path, Query, Request, State,
        rejection::{PathRejection, QueryRejection},
    },
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use snafu::prelude::*;
use tower::ServiceExt;

use crate::{
    error::ErrorKind,
    query::{EntityFilter, PageRequest, QueryError, QueryService, WindowRange},
};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone)]
struct ApiState {
    service: Arc<QueryService>,
    api_key: Option<Arc<str>>,
}

/// Failure of one request, rendered as the JSON error body.
#[derive(Debug)]
struct ApiError {
    kind: ErrorKind,
    detail: Option<String>,
}

impl ApiError {
    fn not_found() -> Self {
        Self {
            kind: ErrorKind::NotFound,
            detail: None,
        }
    }

    fn forbidden() -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            detail: Some("Invalid API Key".to_string()),
        }
    }

    fn bad_params(rejection: QueryRejection) -> Self {
        Self {
            kind: ErrorKind::ValidationError,
            detail: Some(rejection.body_text()),
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::not_found(),
            kind => Self {
                kind,
                detail: Some(err.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self.detail {
            Some(detail) => json!({ "error": self.kind.as_str(), "detail": detail }),
            None => json!({ "error": self.kind.as_str() }),
        };
        (self.status(), Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    filter: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AggregateParams {
    window: Option<String>,
}

/// Routes over `service`. With `api_key` set, every route but `/health`
/// requires it.
pub fn router(service: Arc<QueryService>, api_key: Option<String>) -> Router {
    let state = ApiState {
        service,
        api_key: api_key.map(Arc::from),
    };

    Router::new()
        .route("/entities", get(list_entities))
        .route("/entities/:key", get(get_entity))
        .route("/entities/:key/aggregates", get(get_aggregates))
        .route("/api/v1/sentiment/:key", get(sentiment))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

async fn require_api_key(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let given = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            return ApiError::forbidden().into_response();
        }
    }
    next.run(req).await
}

async fn not_found() -> ApiError {
    ApiError::not_found()
}

async fn health(State(state): State<ApiState>) -> Response {
    Json(state.service.health()).into_response()
}

async fn list_entities(
    State(state): State<ApiState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params.map_err(ApiError::bad_params)?;
    let filter = EntityFilter::parse(params.filter.as_deref().unwrap_or(""))?;
    let page = PageRequest::from_params(params.limit.as_deref(), params.page.as_deref())?;
    Ok(Json(state.service.list_entities(&filter, &page)?).into_response())
}

async fn get_entity(
    State(state): State<ApiState>,
    key: Result<Path<String>, PathRejection>,
) -> ApiResult {
    let Path(key) = key.map_err(|_| ApiError::not_found())?;
    let data = state.service.get_entity(&key)?;
    Ok(Json(data.as_ref()).into_response())
}

async fn get_aggregates(
    State(state): State<ApiState>,
    key: Result<Path<String>, PathRejection>,
    params: Result<Query<AggregateParams>, QueryRejection>,
) -> ApiResult {
    let Path(key) = key.map_err(|_| ApiError::not_found())?;
    let Query(params) = params.map_err(ApiError::bad_params)?;
    let range = match params.window.as_deref() {
        Some(raw) => WindowRange::parse(raw)?,
        None => WindowRange::all(),
    };
    Ok(Json(state.service.get_aggregates(&key, &range)).into_response())
}

async fn sentiment(
    State(state): State<ApiState>,
    key: Result<Path<String>, PathRejection>,
) -> ApiResult {
    let Path(key) = key.map_err(|_| ApiError::not_found())?;
    Ok(Json(state.service.sentiment_summary(&key)?).into_response())
}

/// Status code and JSON body of one response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

/// Errors from [`call`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiCallError {
    /// The URI or header could not form a request.
    #[snafu(display("Invalid request {uri:?}: {source}"))]
    BuildRequest {
        /// Requested URI.
        uri: String,
        /// Underlying HTTP error.
        source: axum::http::Error,
    },

    /// The response body could not be collected.
    #[snafu(display("Failed to read response body: {source}"))]
    ReadBody {
        /// Underlying body error.
        source: axum::Error,
    },

    /// The response body is not JSON.
    #[snafu(display("Response body is not JSON: {source}"))]
    DecodeBody {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// Send one `GET uri` through `router`, with `api_key` in the key header if
/// given.
pub async fn call(
    router: &Router,
    uri: &str,
    api_key: Option<&str>,
) -> Result<ApiResponse, ApiCallError> {
    let mut builder = axum::http::Request::builder().method(Method::GET).uri(uri);
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    let request = builder
        .body(Body::empty())
        .context(BuildRequestSnafu { uri })?;

    let Ok(response) = router.clone().oneshot(request).await;
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .context(ReadBodySnafu)?;
    let body = serde_json::from_slice(&bytes).context(DecodeBodySnafu)?;
    Ok(ApiResponse { status, body })
}
