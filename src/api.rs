use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::batch;
use crate::browser;
use crate::extractor::ScrapeOptions;

/// Body of POST /scrape. Absent or null `options` means defaults.
#[derive(Debug, ToSchema)]
pub struct ScrapeRequest {
    pub urls: Vec<String>,
    pub options: Option<ScrapeOptions>,
}

pub fn router() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chrome-status", get(chrome_status))
        .route("/scrape", post(scrape))
}

#[utoipa::path(
    get,
    path = "/",
    tag = "scraper",
    responses((status = 200, description = "Service banner with version"))
)]
pub async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "scraper",
    responses((status = 200, description = "Liveness check"))
)]
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

/// Launches and drops a browser to prove the Chrome setup works.
#[utoipa::path(
    get,
    path = "/chrome-status",
    tag = "scraper",
    responses((status = 200, description = "Probe outcome, working or failed"))
)]
pub async fn chrome_status() -> Json<Value> {
    let probe = tokio::task::spawn_blocking(browser::probe).await;
    match probe {
        Ok(Ok(())) => Json(json!({
            "status": "Chrome working",
            "timestamp": Utc::now(),
        })),
        Ok(Err(e)) => Json(json!({
            "status": "Chrome failed",
            "error": format!("{e:#}"),
            "timestamp": Utc::now(),
        })),
        Err(e) => Json(json!({
            "status": "Chrome failed",
            "error": e.to_string(),
            "timestamp": Utc::now(),
        })),
    }
}

#[utoipa::path(
    post,
    path = "/scrape",
    tag = "scraper",
    request_body = ScrapeRequest,
    responses(
        (status = 200, description = "Batch results in input order", body = batch::BatchResponse),
        (status = 400, description = "Missing or malformed urls/options"),
        (status = 500, description = "Browser could not be launched", body = batch::BatchFailure)
    )
)]
pub async fn scrape(Json(payload): Json<Value>) -> Response {
    let request = match parse_request(&payload) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };

    match batch::run_batch(request.urls, request.options.unwrap_or_default()).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(failure) => (StatusCode::INTERNAL_SERVER_ERROR, Json(failure)).into_response(),
    }
}

/// Pulls urls/options out of the raw body. Working on the raw JSON lets
/// the 400 report the type the caller actually sent for `urls`.
fn parse_request(payload: &Value) -> Result<ScrapeRequest, Response> {
    let urls = match payload.get("urls") {
        Some(Value::Array(urls)) if !urls.is_empty() => urls,
        other => return Err(urls_required(other)),
    };

    let mut parsed = Vec::with_capacity(urls.len());
    for url in urls {
        match url.as_str() {
            Some(url) => parsed.push(url.to_string()),
            None => {
                return Err(bad_request(json!({
                    "error": "URLs array must contain only strings",
                    "received": "array",
                })))
            }
        }
    }

    let options = match payload.get("options") {
        None | Some(Value::Null) => None,
        Some(options) => match serde_json::from_value(options.clone()) {
            Ok(options) => Some(options),
            Err(e) => {
                return Err(bad_request(json!({
                    "error": format!("Invalid options: {e}"),
                })))
            }
        },
    };

    Ok(ScrapeRequest {
        urls: parsed,
        options,
    })
}

fn urls_required(field: Option<&Value>) -> Response {
    bad_request(json!({
        "error": "URLs array is required",
        "received": json_type_name(field),
    }))
}

fn bad_request(body: Value) -> Response {
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn json_type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "missing",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn post_scrape(body: Value) -> (StatusCode, Value) {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/scrape")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn root_reports_version() {
        let response = router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["version"], json!(env!("CARGO_PKG_VERSION")));
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], json!("healthy"));
    }

    #[tokio::test]
    async fn missing_urls_is_rejected_before_any_browser_work() {
        let (status, body) = post_scrape(json!({})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("URLs array is required"));
        assert_eq!(body["received"], json!("missing"));
    }

    #[tokio::test]
    async fn non_array_urls_reports_sent_type() {
        let (status, body) = post_scrape(json!({"urls": "https://a.example"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["received"], json!("string"));

        let (status, body) = post_scrape(json!({"urls": 42})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["received"], json!("number"));

        let (status, body) = post_scrape(json!({"urls": null})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["received"], json!("null"));
    }

    #[tokio::test]
    async fn empty_urls_array_is_rejected() {
        let (status, body) = post_scrape(json!({"urls": []})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("URLs array is required"));
        assert_eq!(body["received"], json!("array"));
    }

    #[tokio::test]
    async fn non_string_url_entries_are_rejected() {
        let (status, body) = post_scrape(json!({"urls": ["https://a.example", 7]})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("URLs array must contain only strings"));
    }

    #[tokio::test]
    async fn malformed_options_are_rejected() {
        let (status, body) =
            post_scrape(json!({"urls": ["https://a.example"], "options": {"concurrency": "two"}}))
                .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid options"));
    }

    #[tokio::test]
    async fn launch_failure_returns_500_with_empty_products() {
        // A binary override that cannot exist makes the launch fail
        // without Chrome being installed at all.
        std::env::set_var("CHROME_PATH", "/nonexistent/chrome");

        let (status, body) = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            post_scrape(json!({"urls": ["https://a.example"]})),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("launch"));
        assert_eq!(body["products"], json!([]));
        assert!(body["processingTimeMs"].is_u64());
    }

    #[test]
    fn json_type_names_cover_all_variants() {
        assert_eq!(json_type_name(None), "missing");
        assert_eq!(json_type_name(Some(&json!(null))), "null");
        assert_eq!(json_type_name(Some(&json!(true))), "boolean");
        assert_eq!(json_type_name(Some(&json!(1.5))), "number");
        assert_eq!(json_type_name(Some(&json!("x"))), "string");
        assert_eq!(json_type_name(Some(&json!([]))), "array");
        assert_eq!(json_type_name(Some(&json!({}))), "object");
    }
}
