//! HTTP surface: axum router and handlers.
//!
//! Handlers bridge into the coordinator and answer with the service's
//! response envelope; every response carries an `x-request-id` (propagated
//! from the caller or freshly minted). Recognition errors map to stable
//! HTTP statuses through one classifier.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::batch::{BatchEngine, BatchItem, BatchOptions};
use crate::error::RecognitionError;
use crate::metrics::Metrics;
use crate::model::{
    ApiResponse, BatchCreateResponse, BatchJobDetail, BatchRequest, ComponentHealth, ErrorBody,
    HealthDetailResponse, HealthResponse, RebuildResponse, RecognizeRequest, RegisterRequest,
    RegisterResponse, StatsResponse, UpdateRequest,
};
use crate::recognizer::{IdentifyOptions, Recognizer, Registration};

pub struct ServiceState {
    pub recognizer: Arc<Recognizer>,
    pub batch: Arc<BatchEngine>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

pub fn create_router(state: Arc<ServiceState>) -> Router {
    let metrics = state.metrics.clone();
    Router::new()
        .route("/recognition/register", post(register))
        .route("/recognition/recognize", post(recognize))
        .route("/recognition/update", put(update))
        .route("/recognition/batch", post(batch_create).get(batch_list))
        .route("/recognition/batch/{job_id}", get(batch_get))
        .route("/recognition/index/rebuild", post(index_rebuild))
        .route("/recognition/stats", get(stats))
        .route("/metrics", get(metrics_exposition))
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .layer(middleware::from_fn_with_state(metrics, track_http))
        .with_state(state)
}

async fn track_http(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    metrics.record_http(
        method.as_str(),
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn register(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Response {
    let request_id = request_id(&headers);

    let image = match decode_base64_image(&body.image) {
        Ok(image) => image,
        Err(e) => return recognition_error_response(&request_id, &e),
    };

    let registration = Registration {
        external_id: body.external_id,
        display_name: body.display_name.unwrap_or_default(),
        client_ref: body.client_ref.unwrap_or_default(),
    };

    match state.recognizer.enroll(&image, registration).await {
        Ok(outcome) => {
            let payload = ApiResponse {
                data: RegisterResponse {
                    user_id: outcome.user_id,
                    external_id: outcome.external_id,
                    confidence: outcome.confidence,
                    bounding_box: outcome.bounding_box,
                    processing_ms: outcome.processing_ms,
                },
            };
            json_response(StatusCode::CREATED, &request_id, &payload)
        }
        Err(e) => recognition_error_response(&request_id, &e),
    }
}

async fn recognize(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    Json(body): Json<RecognizeRequest>,
) -> Response {
    let request_id = request_id(&headers);

    let image = match decode_base64_image(&body.image) {
        Ok(image) => image,
        Err(e) => return recognition_error_response(&request_id, &e),
    };

    match state
        .recognizer
        .identify(&image, IdentifyOptions::default())
        .await
    {
        Ok(outcome) if outcome.matched.is_some() => {
            json_response(StatusCode::OK, &request_id, &ApiResponse { data: outcome })
        }
        Ok(_) => error_response(
            StatusCode::NOT_FOUND,
            &request_id,
            "no_match",
            "no enrolled user matched the face".to_string(),
        ),
        Err(e) => recognition_error_response(&request_id, &e),
    }
}

async fn update(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateRequest>,
) -> Response {
    let request_id = request_id(&headers);

    let image = match decode_base64_image(&body.image) {
        Ok(image) => image,
        Err(e) => return recognition_error_response(&request_id, &e),
    };

    match state.recognizer.update(&image, &body.external_id).await {
        Ok(outcome) => {
            let payload = ApiResponse {
                data: RegisterResponse {
                    user_id: outcome.user_id,
                    external_id: outcome.external_id,
                    confidence: outcome.confidence,
                    bounding_box: outcome.bounding_box,
                    processing_ms: outcome.processing_ms,
                },
            };
            json_response(StatusCode::OK, &request_id, &payload)
        }
        Err(e) => recognition_error_response(&request_id, &e),
    }
}

async fn batch_create(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    Json(body): Json<BatchRequest>,
) -> Response {
    let request_id = request_id(&headers);

    let mut items = Vec::with_capacity(body.images.len());
    for entry in body.images {
        match decode_base64_image(&entry.image) {
            Ok(image) => items.push(BatchItem {
                id: entry.id,
                image,
            }),
            Err(e) => return recognition_error_response(&request_id, &e),
        }
    }

    match state.batch.create_job(items, BatchOptions::default()) {
        Ok(summary) => json_response(
            StatusCode::ACCEPTED,
            &request_id,
            &ApiResponse {
                data: BatchCreateResponse::from(summary),
            },
        ),
        Err(e) => recognition_error_response(&request_id, &e),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    20
}

async fn batch_list(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let request_id = request_id(&headers);
    let jobs = state.batch.list_jobs(query.limit.min(100));
    json_response(StatusCode::OK, &request_id, &ApiResponse { data: jobs })
}

async fn batch_get(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Response {
    let request_id = request_id(&headers);
    match state.batch.get_job(job_id) {
        Some(job) => json_response(
            StatusCode::OK,
            &request_id,
            &ApiResponse {
                data: BatchJobDetail::from(job),
            },
        ),
        None => error_response(
            StatusCode::NOT_FOUND,
            &request_id,
            "job_not_found",
            format!("no batch job {}", job_id),
        ),
    }
}

async fn index_rebuild(State(state): State<Arc<ServiceState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);

    // Rebuild runs detached; the response is sent before it completes.
    let recognizer = state.recognizer.clone();
    tokio::spawn(async move {
        match recognizer.rebuild_index().await {
            Ok(size) => tracing::info!("index rebuild finished: {} vectors", size),
            Err(e) => error!("index rebuild failed: {}", e),
        }
    });

    json_response(
        StatusCode::ACCEPTED,
        &request_id,
        &ApiResponse {
            data: RebuildResponse { status: "accepted" },
        },
    )
}

async fn stats(State(state): State<Arc<ServiceState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);

    let store = state.recognizer.store();
    let active_users = tokio::task::spawn_blocking(move || store.count_active())
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(0);

    let payload = ApiResponse {
        data: StatsResponse {
            recognition: state.recognizer.stats(),
            index: state.recognizer.index().read().stats(),
            cache_backend: state.recognizer.cache().backend().as_str(),
            active_users,
            batch_jobs: state.batch.job_count(),
        },
    };
    json_response(StatusCode::OK, &request_id, &payload)
}

async fn metrics_exposition(State(state): State<Arc<ServiceState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let body = state.metrics.render();

    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    set_request_id(&mut response, &request_id);
    response
}

async fn health(State(state): State<Arc<ServiceState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let payload = ApiResponse {
        data: HealthResponse {
            status: "ok",
            uptime_secs: state.started_at.elapsed().as_secs(),
        },
    };
    json_response(StatusCode::OK, &request_id, &payload)
}

async fn health_detailed(State(state): State<Arc<ServiceState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);

    let store = state.recognizer.store();
    let store_health = tokio::task::spawn_blocking(move || store.count_active())
        .await
        .map_err(|e| e.to_string())
        .and_then(|r| r.map_err(|e| e.to_string()));

    let index_initialized = state.recognizer.index().read().is_initialized();
    let index_size = state.recognizer.index().read().stats().live_vectors;
    let cache_backend = state.recognizer.cache().backend();

    let store_component = match store_health {
        Ok(count) => ComponentHealth {
            healthy: true,
            detail: format!("{} active users", count),
        },
        Err(e) => ComponentHealth {
            healthy: false,
            detail: e,
        },
    };
    let healthy = store_component.healthy && index_initialized;

    let payload = ApiResponse {
        data: HealthDetailResponse {
            status: if healthy { "ok" } else { "degraded" },
            uptime_secs: state.started_at.elapsed().as_secs(),
            store: store_component,
            index: ComponentHealth {
                healthy: index_initialized,
                detail: format!("{} live vectors", index_size),
            },
            cache: ComponentHealth {
                healthy: true,
                detail: cache_backend.as_str().to_string(),
            },
        },
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &request_id, &payload)
}

/// Decode a base64 image body, tolerating data-URL prefixes.
fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, RecognitionError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| RecognitionError::InvalidImage(format!("bad base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(RecognitionError::InvalidImage("empty image".to_string()));
    }
    Ok(bytes)
}

fn classify(err: &RecognitionError) -> StatusCode {
    match err {
        RecognitionError::InvalidImage(_)
        | RecognitionError::NoFace
        | RecognitionError::FaceTooSmall { .. }
        | RecognitionError::FaceTooLarge { .. }
        | RecognitionError::LowQuality { .. } => StatusCode::BAD_REQUEST,
        RecognitionError::Duplicate(_) => StatusCode::CONFLICT,
        RecognitionError::NotFound(_) => StatusCode::NOT_FOUND,
        RecognitionError::CapacityExceeded { .. } | RecognitionError::NotInitialized => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RecognitionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RecognitionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn recognition_error_response(request_id: &str, err: &RecognitionError) -> Response {
    let status = classify(err);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        // Internals never leak through production responses.
        error!("internal error serving request {}: {}", request_id, err);
        "internal error".to_string()
    } else {
        err.to_string()
    };
    error_response(status, request_id, err.code(), message)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(new_request_id)
}

fn set_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
}

fn json_response<T: serde::Serialize>(
    status: StatusCode,
    request_id: &str,
    payload: &T,
) -> Response {
    let mut response = (status, Json(payload)).into_response();
    set_request_id(&mut response, request_id);
    response
}

fn error_response(
    status: StatusCode,
    request_id: &str,
    code: &'static str,
    message: String,
) -> Response {
    json_response(status, request_id, &ErrorBody { code, message })
}

fn new_request_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut suffix = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        suffix.push_str(&format!("{:02x}", b));
    }
    format!(
        "req_{}_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_decoding_accepts_plain_and_data_urls() {
        let plain = BASE64.encode(b"image-bytes");
        assert_eq!(decode_base64_image(&plain).unwrap(), b"image-bytes");

        let data_url = format!("data:image/png;base64,{}", plain);
        assert_eq!(decode_base64_image(&data_url).unwrap(), b"image-bytes");
    }

    #[test]
    fn base64_decoding_rejects_bad_input() {
        assert!(matches!(
            decode_base64_image("!!not-base64!!"),
            Err(RecognitionError::InvalidImage(_))
        ));
        assert!(matches!(
            decode_base64_image(""),
            Err(RecognitionError::InvalidImage(_))
        ));
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            classify(&RecognitionError::NoFace),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            classify(&RecognitionError::Duplicate("A1".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            classify(&RecognitionError::NotFound("A1".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            classify(&RecognitionError::Timeout { ms: 1 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            classify(&RecognitionError::NotInitialized),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
