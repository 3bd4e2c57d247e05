//! JSON HTTP surface over the discovery pipeline.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bidscout_core::{parse_work_type_filter, Classification, Filter, WorkType, DEFAULT_PAGE_SIZE};
use bidscout_discovery::{
    detect_state, detect_work_type, render_source_health, should_trigger_discovery, Discovery,
    DiscoveryConfig, DiscoveryError, DiscoveryResult,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bidscout-web";

#[derive(Clone)]
pub struct AppState {
    pub discovery: Arc<Discovery>,
}

impl AppState {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self { discovery }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesQuery {
    work_type: Option<String>,
    state: Option<String>,
    city_or_county: Option<String>,
    classification: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct OpportunitiesResponse {
    #[serde(flatten)]
    result: DiscoveryResult,
    summary: String,
    source_health_note: Option<String>,
}

fn default_supports_discovery() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct IntentRequest {
    text: String,
    #[serde(default = "default_supports_discovery")]
    agent_supports_discovery: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IntentResponse {
    pub trigger: bool,
    pub work_type: Option<WorkType>,
    pub state: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/intent", post(intent_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &DiscoveryConfig) -> anyhow::Result<()> {
    let discovery = Discovery::from_config(config).await?;
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app(AppState::new(Arc::new(discovery))))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "sources": state.discovery.source_names(),
    }))
    .into_response()
}

fn filter_from_query(query: OpportunitiesQuery) -> Result<Filter, String> {
    let work_type = match query.work_type.as_deref() {
        Some(raw) => parse_work_type_filter(raw).map_err(|e| e.to_string())?,
        None => None,
    };
    let classification = match query.classification.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            Some(raw.parse::<Classification>().map_err(|e| e.to_string())?)
        }
        _ => None,
    };
    let mut filter = Filter::new(work_type, query.state.unwrap_or_default());
    filter.city_or_county = query
        .city_or_county
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    filter.classification = classification;
    filter.page = query.page.unwrap_or(1);
    filter.page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    Ok(filter)
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    let filter = match filter_from_query(query) {
        Ok(filter) => filter,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    match state.discovery.discover(&filter).await {
        Ok(result) => {
            let summary = result.summary(&filter);
            let source_health_note = render_source_health(&result.source_health);
            Json(OpportunitiesResponse {
                result,
                summary,
                source_health_note,
            })
            .into_response()
        }
        Err(err @ DiscoveryError::InvalidFilter(_)) => {
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

async fn intent_handler(Json(req): Json<IntentRequest>) -> Response {
    let trigger = should_trigger_discovery(&req.text, req.agent_supports_discovery);
    Json(IntentResponse {
        trigger,
        work_type: detect_work_type(&req.text),
        state: detect_state(&req.text).map(str::to_string),
    })
    .into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use bidscout_adapters::{AdapterError, SourceAdapter};
    use bidscout_core::{OpportunityDraft, SourceType};
    use bidscout_http::{HttpClientConfig, HttpFetcher};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct FixedAdapter;

    #[async_trait]
    impl SourceAdapter for FixedAdapter {
        fn source_name(&self) -> &str {
            "Bid Search"
        }

        fn source_type(&self) -> SourceType {
            SourceType::SearchAggregator
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _filter: &Filter,
        ) -> Result<Vec<OpportunityDraft>, AdapterError> {
            let mut d = OpportunityDraft::new(SourceType::SearchAggregator, "Bid Search");
            d.title = Some("Low Voltage Cabling - Fresno USD".to_string());
            d.url = Some("https://www.bidnetdirect.com/rfp-2627-08".to_string());
            d.agency_or_client = Some("Fresno Unified".to_string());
            Ok(vec![d])
        }
    }

    struct DownAdapter;

    #[async_trait]
    impl SourceAdapter for DownAdapter {
        fn source_name(&self) -> &str {
            "SAM.gov"
        }

        fn source_type(&self) -> SourceType {
            SourceType::FederalRegistry
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _filter: &Filter,
        ) -> Result<Vec<OpportunityDraft>, AdapterError> {
            Err(AdapterError::Parse("maintenance page".to_string()))
        }
    }

    fn test_app() -> Router {
        let discovery = Discovery::new(
            vec![Box::new(DownAdapter), Box::new(FixedAdapter)],
            HttpClientConfig::default(),
        );
        app(AppState::new(Arc::new(discovery)))
    }

    async fn body_json(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_lists_sources() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sources"][1], "Bid Search");
    }

    #[tokio::test]
    async fn opportunities_returns_page_summary_and_health_note() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/api/opportunities?work_type=low_voltage&state=CA")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["opportunities"][0]["work_type"], "low_voltage");
        assert_eq!(json["opportunities"][0]["priority_score"], 10);
        assert_eq!(json["source_health"].as_array().unwrap().len(), 2);
        assert!(json["summary"]
            .as_str()
            .unwrap()
            .starts_with("Found 1 live opportunity for low voltage in California:"));
        assert_eq!(
            json["source_health_note"],
            "Source SAM.gov returned an error: unparseable response: maintenance page"
        );
    }

    #[tokio::test]
    async fn missing_state_is_bad_request() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/api/opportunities?work_type=all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("state is required"));
    }

    #[tokio::test]
    async fn unknown_work_type_is_bad_request() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/api/opportunities?work_type=underwater_welding&state=CA")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn intent_classifies_prompt() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/intent")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"text":"Find low voltage bids in California"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: IntentResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            parsed,
            IntentResponse {
                trigger: true,
                work_type: Some(WorkType::LowVoltage),
                state: Some("California".to_string()),
            }
        );
    }
}
