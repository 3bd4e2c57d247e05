//! Source adapter contract plus the federal registry, county portal and search
//! aggregator adapters.
//!
//! Every adapter maps its provider's record shape into [`OpportunityDraft`]s
//! through an explicit, pure mapping function; only `fetch` touches the network.

use async_trait::async_trait;
use bidscout_core::{
    canonical_state_name, contains_phrase, detect_state, parse_money, state_code, word_normalize,
    Filter, OpportunityDraft, SourceType, WorkType,
};
use bidscout_http::{FetchError, HttpFetcher};
use chrono::{Duration, NaiveDate, Utc};
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "bidscout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing credentials for {source_name} (set {env_hint})")]
    MissingCredentials { source_name: String, env_hint: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unparseable response: {0}")]
    Parse(String),
    #[error("invalid adapter config: {0}")]
    InvalidConfig(String),
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Human label reported in source health and on every record.
    fn source_name(&self) -> &str;
    fn source_type(&self) -> SourceType;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        filter: &Filter,
    ) -> Result<Vec<OpportunityDraft>, AdapterError>;
}

/// One configured source; `kind` selects the adapter family.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    FederalRegistry(FederalRegistryConfig),
    CountyPortal(CountyPortalConfig),
    SearchAggregator(SearchAggregatorConfig),
}

impl SourceSpec {
    pub fn display_name(&self) -> &str {
        match self {
            SourceSpec::FederalRegistry(c) => &c.display_name,
            SourceSpec::CountyPortal(c) => &c.display_name,
            SourceSpec::SearchAggregator(c) => &c.display_name,
        }
    }

    /// Fills `api_key` from the env var named by `api_key_env`, using `lookup`
    /// so callers decide where credentials come from.
    pub fn resolve_credentials(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let (env, key) = match self {
            SourceSpec::FederalRegistry(c) => (&c.api_key_env, &mut c.api_key),
            SourceSpec::SearchAggregator(c) => (&c.api_key_env, &mut c.api_key),
            SourceSpec::CountyPortal(_) => return,
        };
        if key.is_none() {
            *key = env.as_deref().and_then(|name| lookup(name)).filter(|v| !v.trim().is_empty());
        }
    }

    pub fn into_adapter(self) -> Box<dyn SourceAdapter> {
        match self {
            SourceSpec::FederalRegistry(c) => Box::new(FederalRegistryAdapter::new(c)),
            SourceSpec::CountyPortal(c) => Box::new(CountyPortalAdapter::new(c)),
            SourceSpec::SearchAggregator(c) => Box::new(SearchAggregatorAdapter::new(c)),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared post-mapping helpers
// ---------------------------------------------------------------------------

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn draft_text(draft: &OpportunityDraft) -> String {
    format!(
        "{} {}",
        draft.title.as_deref().unwrap_or_default(),
        draft.description.as_deref().unwrap_or_default()
    )
}

/// Tags each draft with a detected trade, falling back to the filter's.
pub fn assign_work_type(drafts: &mut [OpportunityDraft], filter: &Filter) {
    for draft in drafts.iter_mut().filter(|d| d.work_type.is_none()) {
        draft.work_type = WorkType::detect(&draft_text(draft)).or(filter.work_type);
    }
}

/// Keeps drafts that mention the filter's trade. No-op for "all". Run before
/// [`assign_work_type`], which falls back to the filter's trade.
pub fn retain_work_type(drafts: &mut Vec<OpportunityDraft>, filter: &Filter) {
    let Some(wanted) = filter.work_type else {
        return;
    };
    drafts.retain(|d| d.work_type == Some(wanted) || wanted.matches(&draft_text(d)));
}

fn same_place(a: &str, b: &str) -> bool {
    let strip = |s: &str| {
        let lower = s.trim().to_lowercase();
        lower
            .strip_suffix(" county")
            .map(str::to_string)
            .unwrap_or(lower)
    };
    strip(a) == strip(b)
}

fn same_state(a: &str, b: &str) -> bool {
    match (canonical_state_name(a), canonical_state_name(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

/// Drops drafts whose known locality contradicts the filter. Unknown locality
/// is kept.
pub fn retain_in_scope(drafts: &mut Vec<OpportunityDraft>, filter: &Filter) {
    drafts.retain(|d| {
        if let Some(state) = d.state.as_deref() {
            if !same_state(state, &filter.state) {
                return false;
            }
        }
        match filter.city_or_county.as_deref() {
            Some(place) => {
                let known = [d.city.as_deref(), d.county.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>();
                known.is_empty() || known.iter().any(|k| same_place(k, place))
            }
            None => true,
        }
    })
}

static SOLICITATION_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(RFP|RFQ|RFI|RFB|IFB|ITB)[\s#:-]*(\d[\w-]*)").expect("valid regex")
});

static DUE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:due|deadline|closing|closes|close)\b[^0-9a-z]{0,3}(?:date|on|by)?[^0-9a-z]{0,3}(\d{1,2}/\d{1,2}/\d{2,4}|\d{4}-\d{2}-\d{2}|(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{4})",
    )
    .expect("valid regex")
});

static DOLLAR_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$\s?\d[\d,]*(?:\.\d+)?(?:\s*(?:million|thousand|m|k)\b)?")
        .expect("valid regex")
});

pub fn extract_solicitation_number(text: &str) -> Option<String> {
    let caps = SOLICITATION_NUMBER.captures(text)?;
    Some(format!("{} {}", caps[1].to_ascii_uppercase(), &caps[2]))
}

/// Pulls the first "due ..." date phrase out of free text.
pub fn extract_due_date(text: &str) -> Option<String> {
    DUE_DATE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_value(text: &str) -> Option<f64> {
    DOLLAR_AMOUNT.find(text).and_then(|m| parse_money(m.as_str()))
}

// ---------------------------------------------------------------------------
// Federal contracting registry (SAM.gov opportunities API)
// ---------------------------------------------------------------------------

fn default_federal_base_url() -> String {
    "https://api.sam.gov/opportunities/v2/search".to_string()
}

fn default_posted_window_days() -> i64 {
    60
}

fn default_federal_limit() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederalRegistryConfig {
    pub display_name: String,
    #[serde(default = "default_federal_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_posted_window_days")]
    pub posted_window_days: i64,
    #[serde(default = "default_federal_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FederalSearchResponse {
    #[serde(default)]
    opportunities_data: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FederalNotice {
    notice_id: Option<String>,
    title: Option<String>,
    solicitation_number: Option<String>,
    full_parent_path_name: Option<String>,
    posted_date: Option<String>,
    #[serde(rename = "type")]
    notice_type: Option<String>,
    response_dead_line: Option<String>,
    naics_code: Option<String>,
    ui_link: Option<String>,
    place_of_performance: Option<PlaceOfPerformance>,
    award: Option<FederalAward>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaceOfPerformance {
    city: Option<NamedCode>,
    state: Option<NamedCode>,
}

#[derive(Debug, Deserialize)]
struct NamedCode {
    code: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FederalAward {
    amount: Option<JsonValue>,
}

pub struct FederalRegistryAdapter {
    config: FederalRegistryConfig,
}

impl FederalRegistryAdapter {
    pub fn new(config: FederalRegistryConfig) -> Self {
        Self { config }
    }
}

/// Query parameters (minus the API key) for one registry search.
/// The registry has no buyer-type parameter, so `filter.classification` is
/// not sent.
pub fn federal_query(
    config: &FederalRegistryConfig,
    filter: &Filter,
    today: NaiveDate,
) -> Vec<(&'static str, String)> {
    let from = today - Duration::days(config.posted_window_days.max(1));
    let mut params = vec![
        ("postedFrom", from.format("%m/%d/%Y").to_string()),
        ("postedTo", today.format("%m/%d/%Y").to_string()),
        ("limit", config.limit.to_string()),
        ("offset", "0".to_string()),
        // solicitations, combined synopses, presolicitations
        ("ptype", "o,k,p".to_string()),
    ];
    if let Some(code) = filter.state_code() {
        params.push(("state", code.to_string()));
    }
    if let Some(naics) = filter.work_type.and_then(|wt| wt.naics_codes().first()) {
        params.push(("ncode", naics.to_string()));
    }
    params
}

fn agency_from_path(path: &str) -> Option<String> {
    path.split('.').find_map(text_or_none)
}

fn award_amount(award: Option<&FederalAward>) -> Option<f64> {
    match award?.amount.as_ref()? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_money(s),
        _ => None,
    }
}

fn map_federal_notice(notice: FederalNotice, source_name: &str) -> OpportunityDraft {
    let mut draft = OpportunityDraft::new(SourceType::FederalRegistry, source_name);
    let description = [
        notice.notice_type.clone(),
        notice.solicitation_number.as_ref().map(|n| format!("Solicitation {n}")),
        notice.naics_code.as_ref().map(|n| format!("NAICS {n}")),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join("; ");

    draft.estimated_value = award_amount(notice.award.as_ref());
    let place = notice.place_of_performance.unwrap_or_default();
    draft.state = place.state.and_then(|s| s.name.or(s.code));
    draft.city = place.city.and_then(|c| c.name);
    draft.external_id = notice.notice_id;
    draft.title = notice.title;
    draft.agency_or_client = notice.full_parent_path_name.as_deref().and_then(agency_from_path);
    draft.description = text_or_none(&description);
    draft.due_date_raw = notice.response_dead_line;
    draft.posted_date_raw = notice.posted_date;
    draft.url = notice.ui_link;
    draft
}

/// Decodes each entry on its own; entries that do not fit `T` are skipped.
fn decode_entries<T: DeserializeOwned>(entries: Vec<JsonValue>, source_name: &str) -> Vec<T> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(idx, entry)| match serde_json::from_value(entry) {
            Ok(item) => Some(item),
            Err(e) => {
                debug!(source = source_name, idx, error = %e, "skipping malformed entry");
                None
            }
        })
        .collect()
}

pub fn parse_federal_response(
    body: &[u8],
    source_name: &str,
) -> Result<Vec<OpportunityDraft>, AdapterError> {
    let response: FederalSearchResponse = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Parse(format!("federal registry JSON: {e}")))?;
    Ok(decode_entries::<FederalNotice>(response.opportunities_data, source_name)
        .into_iter()
        .map(|notice| map_federal_notice(notice, source_name))
        .collect())
}

#[async_trait]
impl SourceAdapter for FederalRegistryAdapter {
    fn source_name(&self) -> &str {
        &self.config.display_name
    }

    fn source_type(&self) -> SourceType {
        SourceType::FederalRegistry
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        filter: &Filter,
    ) -> Result<Vec<OpportunityDraft>, AdapterError> {
        let Some(api_key) = self.config.api_key.clone() else {
            return Err(AdapterError::MissingCredentials {
                source_name: self.config.display_name.clone(),
                env_hint: self
                    .config
                    .api_key_env
                    .clone()
                    .unwrap_or_else(|| "api_key_env".to_string()),
            });
        };

        let mut query = federal_query(&self.config, filter, Utc::now().date_naive());
        query.push(("api_key", api_key));

        let resp = http
            .get(&self.config.display_name, &self.config.base_url, &query)
            .await?;
        let mut drafts = parse_federal_response(&resp.body, &self.config.display_name)?;
        retain_in_scope(&mut drafts, filter);
        assign_work_type(&mut drafts, filter);
        Ok(drafts)
    }
}

// ---------------------------------------------------------------------------
// County / municipal procurement portals (HTML listings)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CountyPortalConfig {
    pub display_name: String,
    #[serde(default)]
    pub portals: Vec<PortalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    pub listing_url: String,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub selectors: PortalSelectors,
}

/// CSS selectors; everything but `row` is evaluated inside a row.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalSelectors {
    pub row: String,
    pub title: String,
    pub link: String,
    pub due_date: String,
    pub value: Option<String>,
    pub agency: Option<String>,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            row: "tr.solicitation".to_string(),
            title: ".title".to_string(),
            link: ".title a[href]".to_string(),
            due_date: ".due".to_string(),
            value: Some(".value".to_string()),
            agency: Some(".agency".to_string()),
        }
    }
}

impl PortalConfig {
    pub fn serves(&self, filter: &Filter) -> bool {
        if !same_state(&self.state, &filter.state) {
            return false;
        }
        match filter.city_or_county.as_deref() {
            Some(place) => [self.county.as_deref(), self.city.as_deref()]
                .into_iter()
                .flatten()
                .any(|p| same_place(p, place)),
            None => true,
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidConfig(format!("{selector}: {e}")))
}

fn select_text(row: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    row.select(selector)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

pub fn parse_portal_listing(
    html: &str,
    portal: &PortalConfig,
    source_name: &str,
) -> Result<Vec<OpportunityDraft>, AdapterError> {
    let base = Url::parse(&portal.listing_url)
        .map_err(|e| AdapterError::InvalidConfig(format!("{}: {e}", portal.listing_url)))?;
    let row_sel = parse_selector(&portal.selectors.row)?;
    let title_sel = parse_selector(&portal.selectors.title)?;
    let link_sel = parse_selector(&portal.selectors.link)?;
    let due_sel = parse_selector(&portal.selectors.due_date)?;
    let value_sel = portal.selectors.value.as_deref().map(parse_selector).transpose()?;
    let agency_sel = portal.selectors.agency.as_deref().map(parse_selector).transpose()?;

    let document = Html::parse_document(html);
    let mut drafts = Vec::new();
    for row in document.select(&row_sel) {
        let mut draft = OpportunityDraft::new(SourceType::CountyPortal, source_name);
        draft.title = select_text(&row, &title_sel);
        draft.url = row
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| base.join(href.trim()).ok())
            .map(|u| u.to_string());
        draft.due_date_raw = select_text(&row, &due_sel);
        draft.estimated_value = value_sel
            .as_ref()
            .and_then(|sel| select_text(&row, sel))
            .and_then(|v| parse_money(&v));
        draft.agency_or_client = agency_sel
            .as_ref()
            .and_then(|sel| select_text(&row, sel))
            .or_else(|| portal.agency.clone())
            .or_else(|| Some(portal.name.clone()));
        draft.external_id = draft.title.as_deref().and_then(extract_solicitation_number);
        draft.state = Some(portal.state.clone());
        draft.county = portal.county.clone();
        draft.city = portal.city.clone();
        drafts.push(draft);
    }
    Ok(drafts)
}

/// Portals are picked by state and city/county only; every configured portal
/// is a public buyer, so `filter.classification` does not narrow them.
pub struct CountyPortalAdapter {
    config: CountyPortalConfig,
}

impl CountyPortalAdapter {
    pub fn new(config: CountyPortalConfig) -> Self {
        Self { config }
    }

    async fn fetch_portal(
        &self,
        http: &HttpFetcher,
        portal: &PortalConfig,
    ) -> Result<Vec<OpportunityDraft>, AdapterError> {
        let resp = http
            .get(&self.config.display_name, &portal.listing_url, &[])
            .await?;
        parse_portal_listing(&resp.text(), portal, &self.config.display_name)
    }
}

#[async_trait]
impl SourceAdapter for CountyPortalAdapter {
    fn source_name(&self) -> &str {
        &self.config.display_name
    }

    fn source_type(&self) -> SourceType {
        SourceType::CountyPortal
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        filter: &Filter,
    ) -> Result<Vec<OpportunityDraft>, AdapterError> {
        let portals = self
            .config
            .portals
            .iter()
            .filter(|p| p.serves(filter))
            .collect::<Vec<_>>();
        if portals.is_empty() {
            debug!(source = %self.config.display_name, state = %filter.state, "no portals configured for filter");
            return Ok(Vec::new());
        }

        let results = join_all(portals.iter().map(|p| self.fetch_portal(http, p))).await;

        let mut drafts = Vec::new();
        let mut first_error = None;
        let mut any_ok = false;
        for (portal, result) in portals.iter().zip(results) {
            match result {
                Ok(mut portal_drafts) => {
                    any_ok = true;
                    drafts.append(&mut portal_drafts);
                }
                Err(err) => {
                    warn!(source = %self.config.display_name, portal = %portal.name, error = %err, "portal fetch failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if !any_ok {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        retain_work_type(&mut drafts, filter);
        assign_work_type(&mut drafts, filter);
        Ok(drafts)
    }
}

// ---------------------------------------------------------------------------
// Generic business-opportunity aggregators (web search API)
// ---------------------------------------------------------------------------

fn default_search_endpoint() -> String {
    "https://api.tavily.com/search".to_string()
}

fn default_max_results() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchAggregatorConfig {
    pub display_name: String,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub include_domains: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: String,
    search_depth: &'static str,
    max_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_domains: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    published_date: Option<String>,
}

const SOLICITATION_TERMS: [&str; 14] = [
    "bid",
    "bids",
    "rfp",
    "rfq",
    "rfi",
    "ifb",
    "itb",
    "solicitation",
    "solicitations",
    "proposals",
    "request for proposals",
    "invitation for bid",
    "invitation to bid",
    "request for qualifications",
];

fn looks_like_solicitation(text: &str) -> bool {
    let words = word_normalize(text);
    SOLICITATION_TERMS.iter().any(|t| contains_phrase(&words, t))
}

pub fn build_search_query(filter: &Filter) -> String {
    let mut parts = vec![
        filter.work_type.map(WorkType::label).unwrap_or("construction").to_string(),
        "bid RFP".to_string(),
    ];
    if let Some(classification) = filter.classification {
        parts.push(classification.as_str().to_string());
    }
    if let Some(place) = filter.city_or_county.as_deref() {
        parts.push(place.trim().to_string());
    }
    parts.push(filter.state.trim().to_string());
    parts.push("open solicitation".to_string());
    parts.join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

fn map_search_result(result: SearchResult, source_name: &str) -> Option<OpportunityDraft> {
    let title = result.title.unwrap_or_default();
    let content = result.content.unwrap_or_default();
    let combined = format!("{title} {content}");
    if !looks_like_solicitation(&combined) {
        return None;
    }
    let mut draft = OpportunityDraft::new(SourceType::SearchAggregator, source_name);
    draft.title = text_or_none(&title);
    draft.external_id = extract_solicitation_number(&combined);
    draft.description = text_or_none(&truncate_chars(&content, 500));
    draft.due_date_raw = extract_due_date(&content);
    draft.estimated_value = extract_value(&content);
    draft.posted_date_raw = result.published_date;
    draft.state = detect_state(&combined).map(str::to_string);
    draft.url = result.url.as_deref().and_then(text_or_none);
    Some(draft)
}

pub fn parse_search_response(
    body: &[u8],
    source_name: &str,
) -> Result<Vec<OpportunityDraft>, AdapterError> {
    let response: SearchResponse = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Parse(format!("search aggregator JSON: {e}")))?;
    Ok(decode_entries::<SearchResult>(response.results, source_name)
        .into_iter()
        .filter_map(|r| map_search_result(r, source_name))
        .collect())
}

pub struct SearchAggregatorAdapter {
    config: SearchAggregatorConfig,
}

impl SearchAggregatorAdapter {
    pub fn new(config: SearchAggregatorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceAdapter for SearchAggregatorAdapter {
    fn source_name(&self) -> &str {
        &self.config.display_name
    }

    fn source_type(&self) -> SourceType {
        SourceType::SearchAggregator
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        filter: &Filter,
    ) -> Result<Vec<OpportunityDraft>, AdapterError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(AdapterError::MissingCredentials {
                source_name: self.config.display_name.clone(),
                env_hint: self
                    .config
                    .api_key_env
                    .clone()
                    .unwrap_or_else(|| "api_key_env".to_string()),
            });
        };

        let request = SearchRequest {
            api_key,
            query: build_search_query(filter),
            search_depth: "basic",
            max_results: self.config.max_results,
            include_domains: (!self.config.include_domains.is_empty())
                .then_some(self.config.include_domains.as_slice()),
        };
        let resp = http
            .post_json(&self.config.display_name, &self.config.endpoint, &request)
            .await?;
        let mut drafts = parse_search_response(&resp.body, &self.config.display_name)?;
        retain_in_scope(&mut drafts, filter);
        retain_work_type(&mut drafts, filter);
        assign_work_type(&mut drafts, filter);
        Ok(drafts)
    }
}

/// Resolves a state name or postal code; exposed for config validation.
pub fn known_state(value: &str) -> bool {
    state_code(value).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidscout_core::normalize_draft;
    use bidscout_http::HttpClientConfig;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(rel: &str) -> Vec<u8> {
        let path = workspace_root().join("fixtures").join(rel);
        fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn san_diego_portal() -> PortalConfig {
        PortalConfig {
            name: "San Diego County Purchasing".to_string(),
            state: "CA".to_string(),
            county: Some("San Diego".to_string()),
            city: None,
            listing_url: "https://www.sandiegocounty.gov/content/sdc/purchasing/open.html"
                .to_string(),
            agency: None,
            selectors: PortalSelectors::default(),
        }
    }

    fn federal_config(api_key: Option<&str>) -> FederalRegistryConfig {
        FederalRegistryConfig {
            display_name: "SAM.gov".to_string(),
            base_url: default_federal_base_url(),
            api_key_env: Some("SAM_API_KEY".to_string()),
            api_key: api_key.map(str::to_string),
            posted_window_days: 60,
            limit: 25,
        }
    }

    fn low_voltage_ca() -> Filter {
        Filter::new(Some(WorkType::LowVoltage), "California")
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(uuid::Uuid::new_v4(), &HttpClientConfig::default()).expect("fetcher")
    }

    #[test]
    fn federal_fixture_maps_into_drafts() {
        let drafts =
            parse_federal_response(&fixture("federal-registry/search_response.json"), "SAM.gov")
                .unwrap();
        assert_eq!(drafts.len(), 4);

        let first = &drafts[0];
        assert_eq!(first.external_id.as_deref(), Some("a1b2c3d4e5f6"));
        assert_eq!(first.agency_or_client.as_deref(), Some("DEPT OF DEFENSE"));
        assert_eq!(first.city.as_deref(), Some("San Diego"));
        assert_eq!(first.state.as_deref(), Some("California"));
        assert_eq!(first.estimated_value, Some(1_250_000.0));
        assert_eq!(first.url.as_deref(), Some("https://sam.gov/opp/a1b2c3d4e5f6/view"));
        assert_eq!(
            first.description.as_deref(),
            Some("Solicitation; Solicitation W912PL26R0012; NAICS 238210")
        );

        assert_eq!(drafts[1].state.as_deref(), Some("CA"));
        assert_eq!(drafts[3].estimated_value, Some(480_000.0));
        assert_eq!(drafts[3].due_date_raw, None);

        let normalized = drafts
            .into_iter()
            .filter_map(|d| normalize_draft(d).ok())
            .collect::<Vec<_>>();
        assert_eq!(normalized.len(), 3, "empty-title notice is malformed");
    }

    #[test]
    fn federal_notice_with_odd_shape_is_skipped_alone() {
        let body = serde_json::json!({
            "totalRecords": 3,
            "opportunitiesData": [
                {"noticeId": "n1", "title": "Fire Alarm Upgrade", "uiLink": "https://sam.gov/opp/n1/view"},
                {"noticeId": "n2", "title": "Cabling", "placeOfPerformance": "San Diego, CA"},
                {"noticeId": "n3", "title": "Access Control Install", "award": {"amount": "$75,000"}}
            ]
        });
        let drafts = parse_federal_response(body.to_string().as_bytes(), "SAM.gov").unwrap();
        let ids = drafts
            .iter()
            .map(|d| d.external_id.as_deref().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["n1", "n3"]);
        assert_eq!(drafts[1].estimated_value, Some(75_000.0));

        let err = parse_federal_response(b"not json", "SAM.gov").unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }

    #[test]
    fn federal_query_scopes_by_window_state_and_naics() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let params = federal_query(&federal_config(None), &low_voltage_ca(), today);
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("postedFrom"), Some("08/17/2026"));
        assert_eq!(get("postedTo"), Some("10/16/2026"));
        assert_eq!(get("state"), Some("CA"));
        assert_eq!(get("ncode"), Some("238210"));
        assert_eq!(get("limit"), Some("25"));
        assert_eq!(get("api_key"), None);

        let mut classified = low_voltage_ca();
        classified.classification = Some(bidscout_core::Classification::Education);
        assert_eq!(federal_query(&federal_config(None), &classified, today), params);
    }

    #[tokio::test]
    async fn federal_adapter_without_key_reports_missing_credentials() {
        let adapter = FederalRegistryAdapter::new(federal_config(None));
        let err = adapter.fetch(&fetcher(), &low_voltage_ca()).await.unwrap_err();
        match err {
            AdapterError::MissingCredentials { env_hint, .. } => assert_eq!(env_hint, "SAM_API_KEY"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = parse_federal_response(b"<html>maintenance</html>", "SAM.gov").unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }

    #[test]
    fn portal_listing_rows_map_into_drafts() {
        let html = String::from_utf8(fixture("county-portal/listing.html")).unwrap();
        let drafts = parse_portal_listing(&html, &san_diego_portal(), "County Portals").unwrap();
        assert_eq!(drafts.len(), 4);

        let cabling = &drafts[0];
        assert_eq!(
            cabling.url.as_deref(),
            Some("https://www.sandiegocounty.gov/content/sdc/purchasing/bids/RFP-26-0114.html")
        );
        assert_eq!(cabling.external_id.as_deref(), Some("RFP 26-0114"));
        assert_eq!(cabling.agency_or_client.as_deref(), Some("County Library"));
        assert_eq!(cabling.due_date_raw.as_deref(), Some("11/10/2026"));
        assert_eq!(cabling.estimated_value, Some(340_000.0));
        assert_eq!(cabling.county.as_deref(), Some("San Diego"));

        assert!(drafts[1].estimated_value.unwrap() > 1_000_000.0);
        assert_eq!(drafts[2].title, None);
        assert_eq!(
            drafts[3].url.as_deref(),
            Some("https://www.sandiegocounty.gov/content/sdc/purchasing/bids/RFQ-26-0310.html")
        );
    }

    #[test]
    fn portal_rows_are_narrowed_to_the_requested_trade() {
        let html = String::from_utf8(fixture("county-portal/listing.html")).unwrap();
        let filter = low_voltage_ca();
        let mut drafts = parse_portal_listing(&html, &san_diego_portal(), "County Portals").unwrap();
        retain_work_type(&mut drafts, &filter);
        let titles = drafts
            .iter()
            .filter_map(|d| d.title.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(
            titles,
            vec![
                "RFP 26-0114 Structured Cabling Services for County Libraries",
                "RFQ 26-0310 Security Camera System, East Mesa Detention",
            ]
        );
    }

    #[test]
    fn portal_serves_matching_state_and_county_only() {
        let portal = san_diego_portal();
        let mut filter = low_voltage_ca();
        assert!(portal.serves(&filter));
        filter.city_or_county = Some("San Diego County".to_string());
        assert!(portal.serves(&filter));
        filter.city_or_county = Some("Orange".to_string());
        assert!(!portal.serves(&filter));
        assert!(!portal.serves(&Filter::new(None, "Nevada")));
    }

    #[tokio::test]
    async fn county_adapter_without_matching_portals_returns_nothing() {
        let adapter = CountyPortalAdapter::new(CountyPortalConfig {
            display_name: "County Portals".to_string(),
            portals: vec![san_diego_portal()],
        });
        let drafts = adapter
            .fetch(&fetcher(), &Filter::new(None, "Oregon"))
            .await
            .unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn invalid_selector_is_a_config_error() {
        let mut portal = san_diego_portal();
        portal.selectors.row = "tr[".to_string();
        let err = parse_portal_listing("<table></table>", &portal, "County Portals").unwrap_err();
        assert!(matches!(err, AdapterError::InvalidConfig(_)));
    }

    #[test]
    fn search_results_keep_only_solicitations() {
        let drafts =
            parse_search_response(&fixture("search-aggregator/response.json"), "Bid Search")
                .unwrap();
        assert_eq!(drafts.len(), 3, "blog post is not a solicitation");

        let fresno = &drafts[0];
        assert_eq!(fresno.due_date_raw.as_deref(), Some("11/14/2026"));
        assert_eq!(fresno.estimated_value, Some(2_500_000.0));
        assert_eq!(fresno.posted_date_raw.as_deref(), Some("2026-10-02"));
        assert_eq!(fresno.agency_or_client, None);

        assert_eq!(drafts[1].due_date_raw.as_deref(), Some("November 3, 2026"));
        assert_eq!(drafts[2].title, None);
        assert_eq!(drafts[2].due_date_raw.as_deref(), Some("2026-11-21"));
    }

    #[test]
    fn search_entry_with_bad_field_does_not_sink_the_batch() {
        let body = serde_json::json!({
            "results": [
                {"title": "RFP structured cabling", "url": "https://a.gov/1", "content": "Due 11/14/2026"},
                {"title": "RFQ security cameras", "content": "Bids due December 1, 2026", "url": null},
                {"title": 42, "url": "https://a.gov/3", "content": "RFP fire alarm"},
                {"title": null, "url": "https://a.gov/4", "content": null}
            ]
        });
        let drafts = parse_search_response(body.to_string().as_bytes(), "Bid Search").unwrap();
        assert_eq!(drafts.len(), 2, "numeric title skipped, empty result not a solicitation");
        assert_eq!(drafts[0].url.as_deref(), Some("https://a.gov/1"));
        assert_eq!(drafts[1].title.as_deref(), Some("RFQ security cameras"));
        assert_eq!(drafts[1].url, None);
    }

    #[test]
    fn search_query_carries_trade_place_and_classification() {
        let mut filter = low_voltage_ca();
        filter.city_or_county = Some("Fresno".to_string());
        filter.classification = Some(bidscout_core::Classification::Education);
        assert_eq!(
            build_search_query(&filter),
            "low voltage bid RFP education Fresno California open solicitation"
        );
        assert_eq!(
            build_search_query(&Filter::new(None, "Texas")),
            "construction bid RFP Texas open solicitation"
        );
    }

    #[test]
    fn scope_filter_drops_records_from_other_states() {
        let mut in_state = OpportunityDraft::new(SourceType::SearchAggregator, "Bid Search");
        in_state.state = Some("CA".to_string());
        let mut elsewhere = in_state.clone();
        elsewhere.state = Some("Nevada".to_string());
        let unknown = OpportunityDraft::new(SourceType::SearchAggregator, "Bid Search");

        let mut drafts = vec![in_state, elsewhere, unknown];
        retain_in_scope(&mut drafts, &low_voltage_ca());
        assert_eq!(drafts.len(), 2);
        assert!(drafts.iter().all(|d| d.state.as_deref() != Some("Nevada")));
    }

    #[test]
    fn credentials_resolve_from_named_env_var_only() {
        let mut spec = SourceSpec::FederalRegistry(federal_config(None));
        spec.resolve_credentials(|name| (name == "SAM_API_KEY").then(|| "secret".to_string()));
        match &spec {
            SourceSpec::FederalRegistry(c) => assert_eq!(c.api_key.as_deref(), Some("secret")),
            _ => unreachable!(),
        }
        assert_eq!(spec.display_name(), "SAM.gov");
    }

    #[test]
    fn text_extractors_handle_common_phrasing() {
        assert_eq!(
            extract_due_date("Bids close on 12/01/2026 at noon").as_deref(),
            Some("12/01/2026")
        );
        assert_eq!(
            extract_due_date("Deadline: Dec. 4, 2026").as_deref(),
            Some("Dec. 4, 2026")
        );
        assert_eq!(extract_due_date("Posted 2026-10-01"), None);
        assert_eq!(extract_value("Budget $750K total"), Some(750_000.0));
        assert_eq!(
            extract_solicitation_number("ifb #2026-44 paving").as_deref(),
            Some("IFB 2026-44")
        );
    }
}
