//! HTTP boundary for the engine, built on axum.
//!
//! Write endpoints answer `{"status":"ok"}` once the task is accepted;
//! query endpoints answer a JSON array of record ids. Every error the
//! engine raises surfaces as `{"error": "<message>"}` with status 400.
//! Engine calls that take the lock run under `spawn_blocking` so the
//! async workers never sit on a contended lock.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::engine::model::{
    DeleteRequest, EmbeddingQueryRequest, ErrorBody, HealthBody, HybridQueryRequest, StatusBody,
    TableStatsBody, UpsertRequest,
};
use crate::engine::{valid_table_name, Database};
use crate::error::DbError;

pub fn router(db: Arc<Database>) -> Router {
    Router::new()
        .route("/insert", post(insert))
        .route("/update", post(update))
        .route("/delete", post(delete))
        .route("/queryField/:table", get(query_field))
        .route("/queryEmbedding/:table", post(query_embedding))
        .route("/queryHybrid/:table", post(query_hybrid))
        .route("/health", get(health))
        .route("/stats/:table", get(table_stats))
        .with_state(db)
}

async fn insert(
    State(db): State<Arc<Database>>,
    body: Result<Json<UpsertRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match db.insert(&req.table, &req.id, req.fields, req.embedding) {
        Ok(()) => (StatusCode::OK, Json(StatusBody::ok())).into_response(),
        Err(e) => error_response(e),
    }
}

async fn update(
    State(db): State<Arc<Database>>,
    body: Result<Json<UpsertRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match db.update(&req.table, &req.id, req.fields, req.embedding) {
        Ok(()) => (StatusCode::OK, Json(StatusBody::ok())).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete(
    State(db): State<Arc<Database>>,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let result = spawn_blocking(move || db.delete(&req.table, &req.id)).await;
    match result {
        Ok(Ok(())) => (StatusCode::OK, Json(StatusBody::ok())).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(resp) => resp,
    }
}

async fn query_field(
    State(db): State<Arc<Database>>,
    Path(table): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !valid_table_name(&table) {
        return bad_request(format!("invalid table name '{table}'"));
    }
    let (Some(field), Some(value)) = (params.get("field").cloned(), params.get("value").cloned())
    else {
        return bad_request("missing query parameters 'field' and 'value'".into());
    };
    let result = spawn_blocking(move || db.query_field(&table, &field, &value)).await;
    match result {
        Ok(ids) => (StatusCode::OK, Json(ids)).into_response(),
        Err(resp) => resp,
    }
}

async fn query_embedding(
    State(db): State<Arc<Database>>,
    Path(table): Path<String>,
    body: Result<Json<EmbeddingQueryRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if !valid_table_name(&table) {
        return bad_request(format!("invalid table name '{table}'"));
    }
    let result =
        spawn_blocking(move || db.query_embedding(&table, &req.embedding, req.top_k)).await;
    match result {
        Ok(Ok(ids)) => (StatusCode::OK, Json(ids)).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(resp) => resp,
    }
}

async fn query_hybrid(
    State(db): State<Arc<Database>>,
    Path(table): Path<String>,
    body: Result<Json<HybridQueryRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if !valid_table_name(&table) {
        return bad_request(format!("invalid table name '{table}'"));
    }
    let result = spawn_blocking(move || {
        db.query_hybrid(&table, &req.field, &req.value, &req.embedding, req.top_k)
    })
    .await;
    match result {
        Ok(Ok(ids)) => (StatusCode::OK, Json(ids)).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(resp) => resp,
    }
}

async fn health(State(db): State<Arc<Database>>) -> Response {
    let body = HealthBody {
        status: "ok",
        tables: db.table_count(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn table_stats(State(db): State<Arc<Database>>, Path(table): Path<String>) -> Response {
    if !valid_table_name(&table) {
        return bad_request(format!("invalid table name '{table}'"));
    }
    let stats = db.table_stats(&table).unwrap_or_default();
    (StatusCode::OK, Json::<TableStatsBody>(stats)).into_response()
}

/// Run a blocking engine call off the async workers, folding a join
/// failure into a 500.
async fn spawn_blocking<T, F>(f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("worker join error: {e}"),
            }),
        )
            .into_response()
    })
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response()
}

fn error_response(e: DbError) -> Response {
    let status = match e {
        DbError::BadRequest(_) | DbError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
        DbError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
        .into_response()
}
