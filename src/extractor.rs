use headless_chrome::browser::tab::{RequestInterceptor, RequestPausedDecision};
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::events::{RequestPausedEvent, RequestPausedEventParams};
use headless_chrome::protocol::cdp::Fetch::{FailRequest, RequestPattern, RequestStage};
use headless_chrome::protocol::cdp::Network::{ErrorReason, ResourceType};
use headless_chrome::{Browser, Tab};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use utoipa::ToSchema;

pub const DEFAULT_CONCURRENCY: usize = 2;
/// Hard ceiling on parallel tabs against the shared browser.
pub const MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

const SELECTOR_WAIT: Duration = Duration::from_secs(3);
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Key under which the embedded product object (or null) lands in `data`.
const PRODUCT_KEY: &str = "productJson";

static PRODUCT_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[Pp]roduct"\s*:"#).unwrap());

/// Per-request knobs for POST /scrape.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrapeOptions {
    /// Parallel tabs per chunk. Default 2, capped at 3.
    pub concurrency: Option<usize>,
    /// Navigation timeout in milliseconds. Default 20000.
    pub timeout: Option<u64>,
    /// Selector to wait up to 3s for before extracting (non-fatal).
    pub wait_for_selector: Option<String>,
    /// Field name to CSS selector. The "images" field is special-cased.
    pub extract_data: Option<HashMap<String, String>>,
}

impl ScrapeOptions {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency
            .unwrap_or(DEFAULT_CONCURRENCY)
            .clamp(1, MAX_CONCURRENCY)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)
    }
}

/// Outcome for one URL. Exactly one of these per input URL per batch.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub url: String,
    pub success: bool,
    #[schema(value_type = Option<Object>)]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[schema(value_type = String)]
    pub scraped_at: DateTime<Utc>,
}

impl ScrapeResult {
    fn ok(url: &str, data: Map<String, Value>) -> Self {
        Self {
            url: url.to_string(),
            success: true,
            data: Some(data),
            error: None,
            scraped_at: Utc::now(),
        }
    }

    pub fn failed(url: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            data: None,
            error: Some(error.into()),
            scraped_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageEntry {
    pub src: String,
    pub alt: String,
}

#[derive(Debug, Clone)]
struct PageStatus {
    code: u32,
    text: String,
}

type StatusSlot = Arc<Mutex<Option<PageStatus>>>;

/// Scrapes a single URL in its own tab. Never fails: every error path is
/// folded into the returned result so one bad page cannot sink a batch.
pub fn extract_one(browser: &Browser, url: &str, options: &ScrapeOptions) -> ScrapeResult {
    match scrape_page(browser, url, options) {
        Ok(data) => ScrapeResult::ok(url, data),
        Err(e) => {
            warn!("Scrape failed for {}: {:#}", url, e);
            ScrapeResult::failed(url, format!("{e:#}"))
        }
    }
}

fn scrape_page(browser: &Browser, url: &str, options: &ScrapeOptions) -> Result<Map<String, Value>> {
    let tab = browser.new_tab().context("failed to open tab")?;
    let outcome = drive_page(&tab, url, options);
    // The tab goes away on success and failure alike.
    if let Err(e) = tab.close(false) {
        warn!("Failed to close tab for {}: {}", url, e);
    }
    outcome
}

fn drive_page(tab: &Arc<Tab>, url: &str, options: &ScrapeOptions) -> Result<Map<String, Value>> {
    tab.set_default_timeout(Duration::from_millis(options.timeout_ms()));
    tab.set_user_agent(USER_AGENT, None, None)
        .context("failed to set user agent")?;

    let status = block_heavy_resources(tab)?;

    tab.navigate_to(url)
        .with_context(|| format!("navigation to {url} failed"))?;
    tab.wait_until_navigated()
        .with_context(|| format!("{url} did not reach DOM ready in time"))?;

    match status.lock().unwrap().clone() {
        None => anyhow::bail!("no response received for {url}"),
        Some(PageStatus { code, text }) if !(200..300).contains(&code) => {
            anyhow::bail!("HTTP {code} {text}")
        }
        Some(_) => {}
    }

    if let Some(selector) = options.wait_for_selector.as_deref() {
        // Missing selector is tolerated, the page is extracted as-is.
        if let Err(e) = tab.wait_for_element_with_custom_timeout(selector, SELECTOR_WAIT) {
            warn!("Selector '{}' not found on {} within 3s: {}", selector, url, e);
        }
    }

    let html = tab.get_content().context("failed to read page content")?;
    Ok(build_page_data(&html, options.extract_data.as_ref()))
}

/// Installs a Fetch-domain filter on the tab: static assets are aborted
/// before download, and the main document's HTTP status is recorded for
/// the post-navigation check. Redirect hops are skipped so the final
/// status wins; sub-frame documents arrive later and are ignored.
fn block_heavy_resources(tab: &Arc<Tab>) -> Result<StatusSlot> {
    let patterns = vec![
        RequestPattern {
            url_pattern: Some("*".to_string()),
            resource_Type: None,
            request_stage: Some(RequestStage::Request),
        },
        RequestPattern {
            url_pattern: Some("*".to_string()),
            resource_Type: Some(ResourceType::Document),
            request_stage: Some(RequestStage::Response),
        },
    ];
    tab.enable_fetch(Some(&patterns), None)
        .context("failed to enable request interception")?;

    let slot: StatusSlot = Arc::new(Mutex::new(None));
    let writer = slot.clone();
    let interceptor: Arc<dyn RequestInterceptor + Send + Sync> = Arc::new(
        move |_transport: Arc<Transport>, _session: SessionId, event: RequestPausedEvent| {
            let RequestPausedEventParams {
                request_id,
                resource_Type: resource_type,
                response_status_code,
                response_status_text,
                ..
            } = event.params;

            // A status code means we are paused at the response stage,
            // which only document requests reach under our patterns.
            if let Some(code) = response_status_code {
                if !(300..400).contains(&code) {
                    let mut recorded = writer.lock().unwrap();
                    if recorded.is_none() {
                        *recorded = Some(PageStatus {
                            code,
                            text: response_status_text.unwrap_or_default(),
                        });
                    }
                }
                return RequestPausedDecision::Continue(None);
            }

            if is_blocked_type(&resource_type) {
                RequestPausedDecision::Fail(FailRequest {
                    request_id,
                    error_reason: ErrorReason::BlockedByClient,
                })
            } else {
                RequestPausedDecision::Continue(None)
            }
        },
    );
    tab.enable_request_interception(interceptor)?;

    Ok(slot)
}

fn is_blocked_type(resource_type: &ResourceType) -> bool {
    matches!(
        resource_type,
        ResourceType::Image | ResourceType::Stylesheet | ResourceType::Font | ResourceType::Media
    )
}

/// Runs the caller's extraction map against the rendered HTML and tacks
/// the embedded-product scan onto the result.
pub fn build_page_data(html: &str, extract: Option<&HashMap<String, String>>) -> Map<String, Value> {
    let document = Html::parse_document(html);
    let mut data = Map::new();

    if let Some(fields) = extract {
        for (field, selector_str) in fields {
            match Selector::parse(selector_str) {
                Ok(selector) => {
                    if field == "images" {
                        let images = extract_field_images(&document, &selector);
                        data.insert(
                            field.clone(),
                            serde_json::to_value(images).unwrap_or(Value::Null),
                        );
                    } else {
                        let text = document
                            .select(&selector)
                            .next()
                            .map(|el| el.text().collect::<String>().trim().to_string())
                            .unwrap_or_default();
                        data.insert(field.clone(), Value::String(text));
                    }
                }
                Err(e) => {
                    // Invalid selectors cost the field, not the page.
                    warn!("Dropping field '{}', bad selector '{}': {}", field, selector_str, e);
                }
            }
        }
    }

    data.insert(
        PRODUCT_KEY.to_string(),
        find_embedded_product(&document).unwrap_or(Value::Null),
    );
    data
}

/// Collects image descriptors for the "images" field: all matches with a
/// resolvable source, src preferred over the lazy-load attributes.
fn extract_field_images(document: &Html, selector: &Selector) -> Vec<ImageEntry> {
    document
        .select(selector)
        .filter_map(|el| {
            let src = el
                .value()
                .attr("src")
                .or_else(|| el.value().attr("data-src"))
                .or_else(|| el.value().attr("data-lazy-src"))?;
            if src.is_empty() {
                return None;
            }
            Some(ImageEntry {
                src: src.to_string(),
                alt: el.value().attr("alt").unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// Best-effort lift of an embedded product object from inline scripts.
/// Storefront templates commonly inline the product as a JSON literal
/// keyed "product" with a "variants" list; the first balanced object
/// after that key is tried, and any miss yields None.
pub fn find_embedded_product(document: &Html) -> Option<Value> {
    let script_sel = Selector::parse("script").unwrap();
    for script in document.select(&script_sel) {
        let body = script.text().collect::<String>();
        if !body.contains(r#""variants""#) {
            continue;
        }
        let Some(anchor) = PRODUCT_KEY_RE.find(&body) else {
            continue;
        };
        return balanced_json_object(&body[anchor.end()..])
            .filter(|candidate| candidate.contains(r#""variants""#))
            .and_then(|candidate| serde_json::from_str::<Value>(candidate).ok());
    }
    None
}

/// First balanced `{...}` literal in `s`. String-aware: braces inside
/// quoted values (and escaped quotes) do not end the object early.
fn balanced_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in s.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
