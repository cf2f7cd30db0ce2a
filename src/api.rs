//! HTTP Surface
//!
//! Thin axum glue over the transparency core. Protocol payloads are the
//! wire encodings from `wire`; labels travel base64url-encoded in paths.
//! The router is not part of the core design: handlers only translate
//! between HTTP and the core's request/response types.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::common::KtError;
use crate::sequencer::{MutateRequest, SequencerHandle};
use crate::transparency::TransparencyLog;
use crate::wire::{InclusionProof, SearchRequest, UpdateValue};

/// Shared application state for all endpoints.
pub struct AppState {
    pub log: Arc<TransparencyLog>,
    pub sequencer: SequencerHandle,
    pub mutate_timeout: std::time::Duration,
}

pub type SharedAppState = Arc<AppState>;

pub fn create_router(state: SharedAppState) -> Router {
    Router::new()
        .route("/v1/meta", get(handle_meta))
        .route("/v1/consistency/:m/:n", get(handle_consistency))
        .route("/v1/account/:label", get(handle_search).post(handle_update))
        .route("/v1/account/:label/:last", get(handle_search_with_last))
        .route("/v1/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: SharedAppState, port: u16) -> Result<(), std::io::Error> {
    let addr = format!("0.0.0.0:{port}");
    info!(target: "ktlog::api", %addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, create_router(state)).await
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_meta(State(state): State<SharedAppState>) -> Response {
    octets(state.log.public_config().encode())
}

async fn handle_consistency(
    State(state): State<SharedAppState>,
    Path((m, n)): Path<(u64, u64)>,
) -> Response {
    match state.log.consistency(m, n).await {
        Ok(elements) => {
            let proof = InclusionProof { elements };
            let mut enc = crate::wire::Encoder::new();
            proof.write(&mut enc);
            octets(enc.finish())
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize, Default)]
struct SearchQuery {
    version: Option<u32>,
}

async fn handle_search(
    state: State<SharedAppState>,
    Path(label): Path<String>,
    query: Query<SearchQuery>,
) -> Response {
    search(state, label, None, query.0).await
}

async fn handle_search_with_last(
    state: State<SharedAppState>,
    Path((label, last)): Path<(String, u64)>,
    query: Query<SearchQuery>,
) -> Response {
    search(state, label, Some(last), query.0).await
}

async fn search(
    State(state): State<SharedAppState>,
    label: String,
    last: Option<u64>,
    query: SearchQuery,
) -> Response {
    let label = match decode_label(&label) {
        Ok(label) => label,
        Err(e) => return error_response(e),
    };
    let req = SearchRequest {
        last,
        label,
        version: query.version,
    };
    match state.log.search(&req).await {
        Ok(res) => octets(res.encode()),
        Err(e) => error_response(e),
    }
}

async fn handle_update(
    State(state): State<SharedAppState>,
    Path(label): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let label = match decode_label(&label) {
        Ok(label) => label,
        Err(e) => return error_response(e),
    };
    let value = match UpdateValue::read(&mut crate::wire::Decoder::new(&body)) {
        Ok(value) => value,
        Err(e) => return error_response(KtError::from(e)),
    };
    let request = MutateRequest {
        adds: vec![(label, value)],
        removes: vec![],
    };
    match state.sequencer.mutate(request, state.mutate_timeout).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(serde_json::json!({ "tree_size": receipt.tree_size })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn decode_label(raw: &str) -> Result<Vec<u8>, KtError> {
    URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| KtError::BadRequest("label is not valid base64url".into()))
}

fn octets(bytes: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response()
}

fn error_response(e: KtError) -> Response {
    let status = match &e {
        KtError::BadRequest(_) | KtError::Wire(_) => StatusCode::BAD_REQUEST,
        KtError::LabelNotFound => StatusCode::NOT_FOUND,
        KtError::LabelExpired => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = Json(serde_json::json!({
        "error": e.error_code(),
        "message": e.to_string(),
    }));
    (status, body).into_response()
}
