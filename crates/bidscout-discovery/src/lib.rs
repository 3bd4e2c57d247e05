//! Discovery pipeline: concurrent source fan-out, normalization, dedup,
//! ranking, change detection, chat summaries and scheduled alert polling.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bidscout_adapters::{known_state, AdapterError, SourceAdapter, SourceSpec};
use bidscout_core::{
    canonical_state_name, contains_phrase, normalize_draft, normalize_title, word_normalize,
    Filter, Opportunity, SourceHealthEntry, WorkType, MAX_PAGE_SIZE,
};
use bidscout_http::{HttpClientConfig, HttpFetcher, DEFAULT_USER_AGENT};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use bidscout_core::detect_state;

pub const CRATE_NAME: &str = "bidscout-discovery";

pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(8);

/// Title similarity at or above which cross-source records are reported as
/// possible duplicates.
pub const NEAR_DUPLICATE_THRESHOLD: f64 = 0.93;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub sources_file: PathBuf,
    pub adapter_timeout_secs: u64,
    pub user_agent: String,
    pub poll_cron: String,
    pub bind_addr: String,
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        Self {
            sources_file: std::env::var("BIDSCOUT_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            adapter_timeout_secs: std::env::var("BIDSCOUT_ADAPTER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_ADAPTER_TIMEOUT.as_secs()),
            user_agent: std::env::var("BIDSCOUT_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            poll_cron: std::env::var("BIDSCOUT_POLL_CRON")
                .unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            bind_addr: std::env::var("BIDSCOUT_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        }
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.adapter_timeout(),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub spec: SourceSpec,
}

impl SourceRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let registry: SourceRegistry =
            serde_yaml::from_str(yaml).context("parsing source registry yaml")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading source registry {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for source in &self.sources {
            if !ids.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {}", source.source_id);
            }
            if let SourceSpec::CountyPortal(county) = &source.spec {
                if let Some(portal) = county.portals.iter().find(|p| !known_state(&p.state)) {
                    bail!(
                        "portal {} in {} names unknown state {:?}",
                        portal.name,
                        source.source_id,
                        portal.state
                    );
                }
            }
        }
        Ok(())
    }

    /// Builds adapters for enabled sources in file order, resolving
    /// credentials through `lookup`.
    pub fn into_adapters(
        self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<Box<dyn SourceAdapter>> {
        self.sources
            .into_iter()
            .filter(|s| s.enabled)
            .map(|mut source| {
                source.spec.resolve_credentials(&lookup);
                source.spec.into_adapter()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Intent classification
// ---------------------------------------------------------------------------

const EXCLUSION_PHRASES: [&str; 14] = [
    "what factors",
    "how to",
    "how do",
    "how should",
    "should i",
    "can you explain",
    "explain",
    "what is",
    "what are",
    "why",
    "tell me about",
    "difference between",
    "best way to",
    "tips for",
];

const ACTION_WORDS: [&str; 9] = [
    "find",
    "search",
    "discover",
    "look for",
    "get",
    "pull",
    "scrape",
    "locate",
    "identify",
];

const TARGET_WORDS: [&str; 10] = [
    "bid",
    "bids",
    "rfp",
    "rfps",
    "rfq",
    "rfqs",
    "opportunity",
    "opportunities",
    "solicitation",
    "solicitations",
];

const SOURCE_MENTIONS: [&str; 8] = [
    "sam.gov",
    "planetbids",
    "bidnet",
    "demandstar",
    "bonfire",
    "publicpurchase",
    "govspend",
    "periscope",
];

/// Decides whether a chat message asks for live bid discovery. Advisory
/// questions never trigger, even when they mention bids.
pub fn should_trigger_discovery(text: &str, agent_supports_discovery: bool) -> bool {
    if !agent_supports_discovery {
        return false;
    }
    let words = word_normalize(text);
    if words.trim().is_empty() {
        return false;
    }
    if EXCLUSION_PHRASES.iter().any(|p| contains_phrase(&words, p)) {
        return false;
    }
    let lower = text.to_lowercase();
    if SOURCE_MENTIONS.iter().any(|s| lower.contains(s)) {
        return true;
    }
    ACTION_WORDS.iter().any(|a| contains_phrase(&words, a))
        && TARGET_WORDS.iter().any(|t| contains_phrase(&words, t))
}

pub fn detect_work_type(text: &str) -> Option<WorkType> {
    WorkType::detect(text)
}

// ---------------------------------------------------------------------------
// Dedup, near-duplicate report, ranking, change detection
// ---------------------------------------------------------------------------

/// Drops later records whose fingerprint was already seen. First occurrence
/// wins; nothing is merged.
pub fn dedupe(list: Vec<Opportunity>) -> Vec<Opportunity> {
    let mut seen = HashSet::new();
    list.into_iter()
        .filter(|o| seen.insert(o.fingerprint.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PossibleDuplicate {
    pub fingerprint_a: String,
    pub source_a: String,
    pub fingerprint_b: String,
    pub source_b: String,
    pub title_similarity: f64,
}

/// Cross-source pairs with near-identical titles but distinct fingerprints.
pub fn possible_duplicates(list: &[Opportunity]) -> Vec<PossibleDuplicate> {
    let titles = list
        .iter()
        .map(|o| normalize_title(&o.title))
        .collect::<Vec<_>>();
    let mut pairs = Vec::new();
    for i in 0..list.len() {
        for j in (i + 1)..list.len() {
            let (a, b) = (&list[i], &list[j]);
            if a.source_name == b.source_name || a.fingerprint == b.fingerprint {
                continue;
            }
            let score = jaro_winkler(&titles[i], &titles[j]);
            if score >= NEAR_DUPLICATE_THRESHOLD {
                pairs.push(PossibleDuplicate {
                    fingerprint_a: a.fingerprint.clone(),
                    source_a: a.source_name.clone(),
                    fingerprint_b: b.fingerprint.clone(),
                    source_b: b.source_name.clone(),
                    title_similarity: score,
                });
            }
        }
    }
    pairs
}

/// Urgency (0..=30) + value (0..=20) + 10 for a link, rounded.
pub fn priority_score(opportunity: &Opportunity, today: NaiveDate) -> i64 {
    let urgency = opportunity
        .due_date
        .map(|due| {
            let days = (due - today).num_days().max(0);
            (30 - days).max(0) as f64
        })
        .unwrap_or(0.0);
    let value = opportunity
        .estimated_value
        .map(|v| (v / 50_000.0).min(20.0))
        .unwrap_or(0.0);
    let completeness = if opportunity.url.is_some() { 10.0 } else { 0.0 };
    (urgency + value + completeness).round() as i64
}

/// Scores every record against `now` and sorts descending. Ties keep their
/// input order.
pub fn rank_at(list: Vec<Opportunity>, now: DateTime<Utc>) -> Vec<Opportunity> {
    let today = now.date_naive();
    let mut scored = list
        .into_iter()
        .map(|mut o| {
            o.priority_score = priority_score(&o, today);
            o
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));
    scored
}

pub fn rank(list: Vec<Opportunity>) -> Vec<Opportunity> {
    rank_at(list, Utc::now())
}

pub fn fingerprints(list: &[Opportunity]) -> HashSet<String> {
    list.iter().map(|o| o.fingerprint.clone()).collect()
}

/// Records whose fingerprint is not in `previous`. `previous` is not touched.
pub fn detect_new(previous: &HashSet<String>, list: &[Opportunity]) -> Vec<Opportunity> {
    list.iter()
        .filter(|o| !previous.contains(&o.fingerprint))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

const SUMMARY_LINES: usize = 3;

fn state_label(filter: &Filter) -> String {
    canonical_state_name(&filter.state)
        .map(str::to_string)
        .unwrap_or_else(|| filter.state.trim().to_string())
}

fn render_summary(count: usize, top: &[Opportunity], filter: &Filter) -> String {
    let work = filter.work_type_label();
    let state = state_label(filter);
    if count == 0 || top.is_empty() {
        return format!("No live opportunities found for {work} in {state}.");
    }
    let noun = if count == 1 { "opportunity" } else { "opportunities" };
    let mut out = format!("Found {count} live {noun} for {work} in {state}:");
    for (idx, o) in top.iter().take(SUMMARY_LINES).enumerate() {
        let due = o
            .due_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "No due date".to_string());
        out.push_str(&format!(
            "\n{}) {} — {} — Due: {}",
            idx + 1,
            o.title,
            o.agency_or_client.as_deref().unwrap_or("Agency not listed"),
            due
        ));
    }
    out
}

/// Chat-ready text for a ranked list. Only titles present in `list` appear.
pub fn summarize(list: &[Opportunity], filter: &Filter) -> String {
    render_summary(list.len(), list, filter)
}

/// One line per failed source, or `None` when every source answered.
pub fn render_source_health(health: &[SourceHealthEntry]) -> Option<String> {
    let lines = health
        .iter()
        .filter(|h| !h.success)
        .map(|h| {
            format!(
                "Source {} returned an error: {}",
                h.source_name,
                h.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("discovery cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub run_id: Uuid,
    pub opportunities: Vec<Opportunity>,
    pub source_health: Vec<SourceHealthEntry>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub possible_duplicates: Vec<PossibleDuplicate>,
}

impl DiscoveryResult {
    pub fn all_sources_failed(&self) -> bool {
        !self.source_health.is_empty() && self.source_health.iter().all(|h| !h.success)
    }

    /// Like [`summarize`], but counts every match rather than just this page.
    pub fn summary(&self, filter: &Filter) -> String {
        render_summary(self.total, &self.opportunities, filter)
    }
}

pub struct Discovery {
    adapters: Vec<Box<dyn SourceAdapter>>,
    adapter_timeout: Duration,
    http: HttpClientConfig,
}

impl Discovery {
    pub fn new(adapters: Vec<Box<dyn SourceAdapter>>, http: HttpClientConfig) -> Self {
        Self {
            adapters,
            adapter_timeout: DEFAULT_ADAPTER_TIMEOUT,
            http,
        }
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    pub async fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let adapters = registry.into_adapters(|name| std::env::var(name).ok());
        info!(
            sources = adapters.len(),
            file = %config.sources_file.display(),
            "loaded source registry"
        );
        Ok(Self::new(adapters, config.http_config()).with_adapter_timeout(config.adapter_timeout()))
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.source_name()).collect()
    }

    pub async fn discover(&self, filter: &Filter) -> Result<DiscoveryResult, DiscoveryError> {
        self.discover_with_cancel(filter, &CancellationToken::new())
            .await
    }

    /// Runs every adapter concurrently and assembles one ranked page. Failed
    /// or slow sources show up in `source_health` only.
    pub async fn discover_with_cancel(
        &self,
        filter: &Filter,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        self.run(filter, cancel, Paging::Page).await
    }

    /// Same pipeline as [`Discovery::discover`], but returns every deduped,
    /// ranked record. The filter is still validated but its page is not applied.
    pub async fn discover_all(&self, filter: &Filter) -> Result<DiscoveryResult, DiscoveryError> {
        self.run(filter, &CancellationToken::new(), Paging::All).await
    }

    async fn run(
        &self,
        filter: &Filter,
        cancel: &CancellationToken,
        paging: Paging,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        filter
            .validate()
            .map_err(|e| DiscoveryError::InvalidFilter(e.to_string()))?;

        let run_id = Uuid::new_v4();
        let span = info_span!(
            "discover",
            %run_id,
            state = %filter.state,
            work_type = filter.work_type_label()
        );

        async move {
            let fan_out = join_all(
                self.adapters
                    .iter()
                    .map(|adapter| self.run_adapter(run_id, adapter.as_ref(), filter)),
            );
            let outcomes = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("discovery cancelled");
                    return Err(DiscoveryError::Cancelled);
                }
                outcomes = fan_out => outcomes,
            };

            let result = assemble(run_id, outcomes, filter, paging, Utc::now());
            info!(
                total = result.total,
                failed_sources = result.source_health.iter().filter(|h| !h.success).count(),
                "discovery finished"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }

    async fn run_adapter(
        &self,
        run_id: Uuid,
        adapter: &dyn SourceAdapter,
        filter: &Filter,
    ) -> (SourceHealthEntry, Vec<Opportunity>) {
        let started = Instant::now();
        let source = adapter.source_name();

        let fetched = match HttpFetcher::new(run_id, &self.http) {
            Ok(http) => match tokio::time::timeout(self.adapter_timeout, adapter.fetch(&http, filter)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(AdapterError::Timeout {
                    secs: self.adapter_timeout.as_secs(),
                }
                .to_string()),
            },
            Err(err) => Err(format!("{err:#}")),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match fetched {
            Ok(drafts) => {
                let mut records = Vec::with_capacity(drafts.len());
                for draft in drafts {
                    match normalize_draft(draft) {
                        Ok(o) => records.push(o),
                        Err(err) => debug!(source, error = %err, "dropping malformed record"),
                    }
                }
                info!(source, count = records.len(), elapsed_ms, "source returned records");
                (
                    SourceHealthEntry::ok(source, adapter.source_type(), records.len(), elapsed_ms),
                    records,
                )
            }
            Err(error) => {
                warn!(source, error = %error, elapsed_ms, "source unavailable");
                (
                    SourceHealthEntry::failed(source, adapter.source_type(), error, elapsed_ms),
                    Vec::new(),
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Paging {
    Page,
    All,
}

fn paginate(list: Vec<Opportunity>, page: usize, page_size: usize) -> Vec<Opportunity> {
    let skip = page.saturating_sub(1).saturating_mul(page_size);
    list.into_iter().skip(skip).take(page_size).collect()
}

fn assemble(
    run_id: Uuid,
    outcomes: Vec<(SourceHealthEntry, Vec<Opportunity>)>,
    filter: &Filter,
    paging: Paging,
    now: DateTime<Utc>,
) -> DiscoveryResult {
    let mut source_health = Vec::with_capacity(outcomes.len());
    let mut all = Vec::new();
    for (health, mut records) in outcomes {
        source_health.push(health);
        all.append(&mut records);
    }

    let unique = dedupe(all);
    let possible_duplicates = possible_duplicates(&unique);
    if !possible_duplicates.is_empty() {
        debug!(pairs = possible_duplicates.len(), "near-duplicate titles across sources");
    }
    let ranked = rank_at(unique, now);
    let total = ranked.len();
    let (opportunities, page, page_size) = match paging {
        Paging::Page => (
            paginate(ranked, filter.page, filter.page_size),
            filter.page,
            filter.page_size,
        ),
        Paging::All => (ranked, 1, total),
    };

    DiscoveryResult {
        run_id,
        opportunities,
        source_health,
        total,
        page,
        page_size,
        possible_duplicates,
    }
}

// ---------------------------------------------------------------------------
// Alert polling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    NewOpportunities {
        run_id: Uuid,
        opportunities: Vec<Opportunity>,
    },
    NoChange {
        run_id: Uuid,
        checked: usize,
    },
    SourcesUnavailable {
        run_id: Uuid,
        source_health: Vec<SourceHealthEntry>,
    },
}

/// Re-runs one saved search and reports records not seen on the previous poll.
/// Each poll compares the full result set, not a single page.
pub struct AlertPoller {
    discovery: Arc<Discovery>,
    filter: Filter,
    seen: Option<HashSet<String>>,
}

impl AlertPoller {
    pub fn new(discovery: Arc<Discovery>, mut filter: Filter) -> Self {
        filter.page = 1;
        filter.page_size = MAX_PAGE_SIZE;
        Self {
            discovery,
            filter,
            seen: None,
        }
    }

    pub fn with_baseline(mut self, seen: HashSet<String>) -> Self {
        self.seen = Some(seen);
        self
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn seen(&self) -> Option<&HashSet<String>> {
        self.seen.as_ref()
    }

    pub async fn poll_once(&mut self) -> Result<AlertEvent, DiscoveryError> {
        let result = self.discovery.discover_all(&self.filter).await?;
        let run_id = result.run_id;

        if result.all_sources_failed() {
            warn!(%run_id, "every source failed; keeping previous baseline");
            return Ok(AlertEvent::SourcesUnavailable {
                run_id,
                source_health: result.source_health,
            });
        }

        let current = fingerprints(&result.opportunities);
        let event = match self.seen.as_ref() {
            None => {
                info!(%run_id, tracked = current.len(), "alert baseline established");
                AlertEvent::NoChange {
                    run_id,
                    checked: result.total,
                }
            }
            Some(previous) => {
                let fresh = detect_new(previous, &result.opportunities);
                if fresh.is_empty() {
                    AlertEvent::NoChange {
                        run_id,
                        checked: result.total,
                    }
                } else {
                    info!(%run_id, new = fresh.len(), "new opportunities detected");
                    AlertEvent::NewOpportunities {
                        run_id,
                        opportunities: fresh,
                    }
                }
            }
        };
        self.seen = Some(current);
        Ok(event)
    }
}

/// Registers a cron job that polls and forwards each event on `tx`. The
/// returned scheduler is already started.
pub async fn start_alert_scheduler(
    poller: Arc<Mutex<AlertPoller>>,
    cron: &str,
    tx: mpsc::Sender<AlertEvent>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let poller = poller.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let mut poller = poller.lock().await;
            match poller.poll_once().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!("alert receiver dropped");
                    }
                }
                Err(err) => warn!(error = %err, "scheduled poll failed"),
            }
        })
    })
    .with_context(|| format!("creating alert job for cron {cron}"))?;
    sched.add(job).await.context("adding alert job")?;
    sched.start().await.context("starting scheduler")?;
    Ok(sched)
}
