use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::browser;
use crate::extractor::{self, ScrapeOptions, ScrapeResult};

/// Pause between chunk dispatches, never after the last chunk.
const CHUNK_DELAY: Duration = Duration::from_millis(500);

/// Successful batch envelope. `products` holds one entry per input URL,
/// in input order, regardless of how individual URLs fared.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub success: bool,
    pub total_urls: usize,
    pub successful_scrapes: usize,
    pub products: Vec<ScrapeResult>,
    pub processing_time_ms: u64,
    #[schema(value_type = String)]
    pub processed_at: DateTime<Utc>,
}

/// 500 body for a batch that never got off the ground.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub success: bool,
    pub error: String,
    pub products: Vec<ScrapeResult>,
    pub processing_time_ms: u64,
}

/// Runs one batch: a single browser process, URLs chunked to the
/// effective concurrency, chunks dispatched sequentially with a pause
/// between them, every URL settling into exactly one result.
pub async fn run_batch(
    urls: Vec<String>,
    options: ScrapeOptions,
) -> Result<BatchResponse, BatchFailure> {
    let started = Instant::now();
    let batch_id = Uuid::new_v4();
    let concurrency = options.effective_concurrency();

    info!(
        "[batch {}] Scraping {} URLs (concurrency: {})",
        batch_id,
        urls.len(),
        concurrency
    );

    let browser = match tokio::task::spawn_blocking(browser::launch).await {
        Ok(Ok(browser)) => Arc::new(browser),
        Ok(Err(e)) => return Err(launch_failure(batch_id, started, format!("{e:#}"))),
        Err(e) => return Err(launch_failure(batch_id, started, e.to_string())),
    };

    let mut products: Vec<ScrapeResult> = Vec::with_capacity(urls.len());
    let total_chunks = urls.len().div_ceil(concurrency);

    for (index, chunk) in urls.chunks(concurrency).enumerate() {
        info!(
            "[batch {}] Chunk {}/{} ({} URLs)",
            batch_id,
            index + 1,
            total_chunks,
            chunk.len()
        );

        let mut handles = Vec::with_capacity(chunk.len());
        for url in chunk {
            let browser = browser.clone();
            let url = url.clone();
            let options = options.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                extractor::extract_one(&browser, &url, &options)
            }));
        }

        // Settle in submission order so results line up with input order.
        for (url, handle) in chunk.iter().zip(handles) {
            match handle.await {
                Ok(result) => products.push(result),
                Err(e) => {
                    warn!("[batch {}] Scrape task for {} died: {}", batch_id, url, e);
                    products.push(ScrapeResult::failed(url, format!("scrape task failed: {e}")));
                }
            }
        }

        if index + 1 < total_chunks {
            sleep(CHUNK_DELAY).await;
        }
    }

    // Last handle on the browser; dropping it reaps the Chrome process.
    drop(browser);

    let successful = products.iter().filter(|r| r.success).count();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "[batch {}] Done: {}/{} succeeded in {}ms",
        batch_id,
        successful,
        urls.len(),
        elapsed_ms
    );

    Ok(BatchResponse {
        success: true,
        total_urls: urls.len(),
        successful_scrapes: successful,
        products,
        processing_time_ms: elapsed_ms,
        processed_at: Utc::now(),
    })
}

fn launch_failure(batch_id: Uuid, started: Instant, error: String) -> BatchFailure {
    error!("[batch {}] Browser launch failed: {}", batch_id, error);
    BatchFailure {
        success: false,
        error,
        products: Vec::new(),
        processing_time_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_response_serializes_camel_case() {
        let response = BatchResponse {
            success: true,
            total_urls: 2,
            successful_scrapes: 1,
            products: vec![ScrapeResult::failed("https://a.example", "HTTP 500 Internal Server Error")],
            processing_time_ms: 1234,
            processed_at: Utc::now(),
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["totalUrls"], json!(2));
        assert_eq!(value["successfulScrapes"], json!(1));
        assert_eq!(value["processingTimeMs"], json!(1234));
        assert!(value["processedAt"].is_string());
        assert_eq!(value["products"][0]["success"], json!(false));
    }

    #[test]
    fn failure_body_keeps_partial_fields() {
        let failure = BatchFailure {
            success: false,
            error: "failed to launch Chrome".to_string(),
            products: Vec::new(),
            processing_time_ms: 7,
        };

        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!("failed to launch Chrome"));
        assert_eq!(value["products"], json!([]));
        assert_eq!(value["processingTimeMs"], json!(7));
    }

    #[test]
    fn chunking_covers_every_url_in_order() {
        let urls: Vec<String> = (0..7).map(|i| format!("https://site{i}.example")).collect();
        let chunks: Vec<&[String]> = urls.chunks(3).collect();

        assert_eq!(chunks.len(), urls.len().div_ceil(3));
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[2].len(), 1);
        let flattened: Vec<&String> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened.len(), 7);
        assert!(flattened.iter().zip(&urls).all(|(a, b)| *a == b));
    }
}
