mod api;
mod batch;
mod browser;
mod extractor;

use axum::Router;
use dotenv::dotenv;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(api::root, api::health, api::chrome_status, api::scrape),
    components(
        schemas(
            api::ScrapeRequest,
            crate::extractor::ScrapeOptions,
            crate::extractor::ScrapeResult,
            crate::batch::BatchResponse,
            crate::batch::BatchFailure
        )
    ),
    tags(
        (name = "scraper", description = "Batch Product Scraping API")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api::router())
        .layer(CorsLayer::permissive());

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_marks_options_as_optional() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let request = &doc["components"]["schemas"]["ScrapeRequest"];

        let required: Vec<&str> = request["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(required.contains(&"urls"));
        assert!(!required.contains(&"options"));
        assert!(request["properties"]["options"].is_object());
    }
}
