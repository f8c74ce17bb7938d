//! HTTP ingress: router, middleware chain (panic recovery → access log →
//! trusted subnet → compression → decryption → hash verification), and
//! handlers.

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ipnet::IpNet;
use serde::Deserialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::codec::{compress, crypto::Decryptor, hash};
use crate::error::AppError;
use crate::metric::{Metric, MetricDto, MetricKey, MetricKind};
use crate::usecase::MetricUseCase;

pub struct HttpConfig {
    pub hash_key: Option<String>,
    pub trusted_subnet: Option<IpNet>,
    pub decryptor: Option<Decryptor>,
}

pub struct AppState {
    pub usecase: Arc<MetricUseCase>,
    pub config: HttpConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/update/:type/:name/:value", post(update_by_params))
        .route("/update/", post(update_by_json))
        .route("/updates/", post(updates_by_json))
        .route("/value/:type/:name", get(get_by_params))
        .route("/value/", post(get_by_json))
        .route("/", get(report))
        .route("/ping", get(ping))
        .layer(middleware::from_fn_with_state(state.clone(), hash_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), decrypt_middleware))
        .layer(middleware::from_fn(compress_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), trusted_subnet_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

// ---------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------

/// Panic recovery is handled by `CatchPanicLayer`; access logging by
/// `TraceLayer` (both applied in `router()`, outermost in the chain).

async fn trusted_subnet_middleware(
    State(state): State<Arc<AppState>>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(subnet) = state.config.trusted_subnet else {
        return next.run(req).await;
    };

    let ip_header = req.headers().get("X-Real-IP").and_then(|v| v.to_str().ok());
    let Some(ip_str) = ip_header else {
        debug!("X-Real-IP is empty");
        return StatusCode::FORBIDDEN.into_response();
    };
    let Ok(ip) = ip_str.parse::<IpAddr>() else {
        debug!(ip = ip_str, "failed to parse X-Real-IP header");
        return StatusCode::FORBIDDEN.into_response();
    };
    if !subnet.contains(&ip) {
        debug!(ip = ip_str, subnet = %subnet, "X-Real-IP doesn't belong to the trusted subnet");
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await
}

async fn compress_middleware(req: axum::extract::Request, next: Next) -> Response {
    let content_encoding = req
        .headers()
        .get("Content-Encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (mut parts, body) = req.into_parts();
    if content_encoding.contains("gzip") {
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(b) => b,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
        let decompressed = match compress::gunzip(&bytes) {
            Ok(d) => d,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
        let req = axum::extract::Request::from_parts(parts, axum::body::Body::from(decompressed));
        return run_with_response_compression(req, next).await;
    } else if !content_encoding.is_empty() {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let req = axum::extract::Request::from_parts(parts, body);
    run_with_response_compression(req, next).await
}

/// Compresses the response body when the client advertised `gzip` and the
/// outbound content-type is compressible.
async fn run_with_response_compression(req: axum::extract::Request, next: Next) -> Response {
    let accepts_gzip = req
        .headers()
        .get("Accept-Encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .contains("gzip");

    let resp = next.run(req).await;
    if !accepts_gzip {
        return resp;
    }

    let content_type = resp
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !compress::is_compressible_content_type(&content_type) {
        return resp;
    }

    let (mut parts, body) = resp.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let Ok(compressed) = compress::gzip(&bytes) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    parts.headers.insert("Content-Encoding", HeaderValue::from_static("gzip"));
    Response::from_parts(parts, axum::body::Body::from(compressed))
}

async fn decrypt_middleware(
    State(state): State<Arc<AppState>>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let has_encryption_header = req.headers().contains_key("Encryption");
    let Some(decryptor) = state.config.decryptor.as_ref() else {
        return next.run(req).await;
    };
    if !has_encryption_header {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let decrypted = match decryptor.decrypt(&bytes) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to decrypt body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let req = axum::extract::Request::from_parts(parts, axum::body::Body::from(decrypted));
    next.run(req).await
}

async fn hash_middleware(
    State(state): State<Arc<AppState>>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(key) = state.config.hash_key.as_deref() else {
        return next.run(req).await;
    };

    let header_value = req
        .headers()
        .get(hash::HEADER_HASH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (parts, body) = req.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    // Empty header bypasses the check (client did not opt in).
    if let Some(header_value) = header_value.filter(|h| !h.is_empty()) {
        if !hash::verify(key, &bytes, &header_value) {
            debug!("invalid request hash");
            return StatusCode::BAD_REQUEST.into_response();
        }
    }

    let req = axum::extract::Request::from_parts(parts, axum::body::Body::from(bytes));
    let resp = next.run(req).await;

    let (mut parts, body) = resp.into_parts();
    let Ok(response_bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    if !response_bytes.is_empty() {
        let signature = hash::hmac_sha256_base64url(key, &response_bytes);
        if let Ok(v) = HeaderValue::from_str(&signature) {
            parts.headers.insert(hash::HEADER_HASH, v);
        }
    }
    Response::from_parts(parts, axum::body::Body::from(response_bytes))
}

// ---------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------

/// Storage liveness probe: `500` if the backend isn't reachable.
async fn ping(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.usecase.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(error = %e, "ping: storage not reachable");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn update_by_params(
    State(state): State<Arc<AppState>>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Response {
    match Metric::new(&name, &kind, &value) {
        Ok(metric) => match state.usecase.update(vec![metric]).await {
            Ok(_) => StatusCode::OK.into_response(),
            Err(e) => app_error_response(&e),
        },
        Err(e) => metric_error_response(&e),
    }
}

async fn update_by_json(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json_content_type(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let dto: MetricDto = match serde_json::from_slice(&body) {
        Ok(dto) => dto,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let metric: Metric = match dto.try_into() {
        Ok(m) => m,
        Err(e) => return metric_error_response(&e),
    };
    match state.usecase.update(vec![metric]).await {
        Ok(mut applied) => {
            let Some(result) = applied.pop() else { return StatusCode::INTERNAL_SERVER_ERROR.into_response() };
            (StatusCode::OK, Json(MetricDto::from(result))).into_response()
        }
        Err(e) => app_error_response(&e),
    }
}

async fn updates_by_json(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json_content_type(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let dtos: Vec<MetricDto> = match serde_json::from_slice(&body) {
        Ok(dtos) => dtos,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let mut metrics = Vec::with_capacity(dtos.len());
    for dto in dtos {
        match Metric::try_from(dto) {
            Ok(m) => metrics.push(m),
            Err(e) => return metric_error_response(&e),
        }
    }
    match state.usecase.update_batch(metrics).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => app_error_response(&e),
    }
}

async fn get_by_params(State(state): State<Arc<AppState>>, Path((kind, name)): Path<(String, String)>) -> Response {
    let Some(kind) = MetricKind::parse(&kind) else { return StatusCode::NOT_FOUND.into_response() };
    match state.usecase.get(&MetricKey::new(name, kind)).await {
        Ok(metric) => (StatusCode::OK, metric.string_value()).into_response(),
        Err(AppError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => app_error_response(&e),
    }
}

#[derive(Deserialize)]
struct MetricKeyRequest {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

async fn get_by_json(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json_content_type(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let req: MetricKeyRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let Some(kind) = MetricKind::parse(&req.kind) else { return StatusCode::NOT_FOUND.into_response() };
    match state.usecase.get(&MetricKey::new(req.id, kind)).await {
        Ok(metric) => (StatusCode::OK, Json(MetricDto::from(metric))).into_response(),
        Err(AppError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => app_error_response(&e),
    }
}

async fn report(State(state): State<Arc<AppState>>) -> Response {
    match state.usecase.get_all().await {
        Ok(metrics) => {
            let mut lines: Vec<String> = metrics
                .iter()
                .map(|m| format!("<p>{}: {}\n</p>", m.name(), m.string_value()))
                .collect();
            lines.sort();
            let body = lines.concat();
            (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
                body,
            )
                .into_response()
        }
        Err(e) => app_error_response(&e),
    }
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

fn metric_error_response(err: &crate::metric::MetricError) -> Response {
    use crate::metric::MetricError::*;
    match err {
        InvalidMetricName => StatusCode::NOT_FOUND.into_response(),
        InvalidMetricType(_) | InvalidMetricValue(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn app_error_response(err: &AppError) -> Response {
    match err {
        AppError::Invalid(_) => StatusCode::BAD_REQUEST.into_response(),
        AppError::NotFound => StatusCode::NOT_FOUND.into_response(),
        AppError::UnsupportedMetricType => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        AppError::Internal(_) | AppError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let usecase = Arc::new(MetricUseCase::new(Arc::new(MemoryStorage::new())));
        let state = Arc::new(AppState {
            usecase,
            config: HttpConfig { hash_key: None, trusted_subnet: None, decryptor: None },
        });
        router(state)
    }

    #[tokio::test]
    async fn ping_is_ok_when_storage_is_live() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().method("GET").uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn update_then_get_gauge_by_params() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/update/gauge/key/3.0000003").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::builder().method("GET").uri("/value/gauge/key").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"3.0000003");
    }

    #[tokio::test]
    async fn counter_accumulates_across_posts() {
        let app = test_app();
        for delta in [1, 2] {
            let body = format!(r#"{{"id":"key","type":"counter","delta":{delta}}}"#);
            let resp = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/update/")
                        .header("Content-Type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/value/")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"id":"key","type":"counter"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let dto: MetricDto = serde_json::from_slice(&body).unwrap();
        assert_eq!(dto.delta, Some(3));
    }

    #[tokio::test]
    async fn wrong_content_type_on_update_is_415() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/update/")
                    .header("Content-Type", "application/xml")
                    .body(Body::from("<x/>"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn report_lists_metrics_sorted_as_html() {
        let app = test_app();
        app.clone()
            .oneshot(Request::builder().method("POST").uri("/update/counter/counter_key/3").body(Body::empty()).unwrap())
            .await
            .unwrap();
        app.clone()
            .oneshot(Request::builder().method("POST").uri("/update/gauge/gauge_key/4.0000004").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let resp = app
            .oneshot(Request::builder().method("GET").uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<p>counter_key: 3\n</p><p>gauge_key: 4.0000004\n</p>");
    }
}
