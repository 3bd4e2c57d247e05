//! Canonical bid-opportunity model, fingerprinting and text detection tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bidscout-core";

/// Separator between the three fingerprint components.
pub const FINGERPRINT_SEPARATOR: char = '|';

pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    LowVoltage,
    Electrical,
    Hvac,
    Plumbing,
    Roofing,
    Concrete,
    Painting,
    Landscaping,
    FireProtection,
    GeneralConstruction,
    Other,
}

/// Detection order: more specific trades first so "low voltage electrical"
/// resolves to low voltage rather than electrical.
const DETECTION_ORDER: [WorkType; 10] = [
    WorkType::LowVoltage,
    WorkType::FireProtection,
    WorkType::Hvac,
    WorkType::Plumbing,
    WorkType::Electrical,
    WorkType::Roofing,
    WorkType::Concrete,
    WorkType::Painting,
    WorkType::Landscaping,
    WorkType::GeneralConstruction,
];

impl WorkType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkType::LowVoltage => "low_voltage",
            WorkType::Electrical => "electrical",
            WorkType::Hvac => "hvac",
            WorkType::Plumbing => "plumbing",
            WorkType::Roofing => "roofing",
            WorkType::Concrete => "concrete",
            WorkType::Painting => "painting",
            WorkType::Landscaping => "landscaping",
            WorkType::FireProtection => "fire_protection",
            WorkType::GeneralConstruction => "general_construction",
            WorkType::Other => "other",
        }
    }

    /// Human label used in summaries and search queries.
    pub fn label(self) -> &'static str {
        match self {
            WorkType::LowVoltage => "low voltage",
            WorkType::Electrical => "electrical",
            WorkType::Hvac => "HVAC",
            WorkType::Plumbing => "plumbing",
            WorkType::Roofing => "roofing",
            WorkType::Concrete => "concrete",
            WorkType::Painting => "painting",
            WorkType::Landscaping => "landscaping",
            WorkType::FireProtection => "fire protection",
            WorkType::GeneralConstruction => "general construction",
            WorkType::Other => "other",
        }
    }

    /// Phrases (already word-normalized) that identify this trade in free text.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            WorkType::LowVoltage => &[
                "low voltage",
                "structured cabling",
                "data cabling",
                "cabling",
                "fiber optic",
                "access control",
                "security camera",
                "cctv",
                "audio visual",
                "intercom",
                "telecommunications",
            ],
            WorkType::Electrical => &[
                "electrical",
                "electric",
                "lighting",
                "wiring",
                "power distribution",
                "generator",
            ],
            WorkType::Hvac => &[
                "hvac",
                "heating",
                "ventilation",
                "air conditioning",
                "mechanical",
                "chiller",
                "boiler",
            ],
            WorkType::Plumbing => &["plumbing", "water heater", "sewer", "piping", "backflow"],
            WorkType::Roofing => &["roofing", "roof", "reroof", "re roof"],
            WorkType::Concrete => &["concrete", "paving", "sidewalk", "asphalt", "curb"],
            WorkType::Painting => &["painting", "paint", "coating", "coatings"],
            WorkType::Landscaping => &[
                "landscaping",
                "landscape",
                "irrigation",
                "tree trimming",
                "grounds maintenance",
            ],
            WorkType::FireProtection => &[
                "fire alarm",
                "fire sprinkler",
                "fire protection",
                "fire suppression",
            ],
            WorkType::GeneralConstruction => &[
                "general contractor",
                "general construction",
                "construction",
                "renovation",
                "remodel",
                "tenant improvement",
            ],
            WorkType::Other => &[],
        }
    }

    /// NAICS codes used to scope federal registry queries.
    pub fn naics_codes(self) -> &'static [&'static str] {
        match self {
            WorkType::LowVoltage | WorkType::Electrical => &["238210"],
            WorkType::Hvac | WorkType::Plumbing => &["238220"],
            WorkType::FireProtection => &["238220", "238210"],
            WorkType::Roofing => &["238160"],
            WorkType::Concrete => &["238110", "237310"],
            WorkType::Painting => &["238320"],
            WorkType::Landscaping => &["561730"],
            WorkType::GeneralConstruction => &["236220"],
            WorkType::Other => &[],
        }
    }

    pub fn matches(self, text: &str) -> bool {
        let words = word_normalize(text);
        self.keywords().iter().any(|k| contains_phrase(&words, k))
    }

    /// First trade whose keyword list appears in `text`.
    pub fn detect(text: &str) -> Option<WorkType> {
        let words = word_normalize(text);
        DETECTION_ORDER
            .into_iter()
            .find(|wt| wt.keywords().iter().any(|k| contains_phrase(&words, k)))
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for WorkType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = word_normalize(s).trim().replace(' ', "_");
        let found = DETECTION_ORDER
            .into_iter()
            .chain(std::iter::once(WorkType::Other))
            .find(|wt| wt.as_str() == key);
        found.ok_or_else(|| UnknownVariant {
            kind: "work type",
            value: s.to_string(),
        })
    }
}

/// Parses a work-type filter value where "all" (or empty) means no restriction.
pub fn parse_work_type_filter(s: &str) -> Result<Option<WorkType>, UnknownVariant> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    trimmed.parse().map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Government,
    Education,
    Business,
    Healthcare,
    Nonprofit,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Government => "government",
            Classification::Education => "education",
            Classification::Business => "business",
            Classification::Healthcare => "healthcare",
            Classification::Nonprofit => "nonprofit",
        }
    }
}

impl FromStr for Classification {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "government" | "gov" => Ok(Classification::Government),
            "education" | "edu" => Ok(Classification::Education),
            "business" | "commercial" => Ok(Classification::Business),
            "healthcare" | "health" => Ok(Classification::Healthcare),
            "nonprofit" | "non_profit" | "non-profit" => Ok(Classification::Nonprofit),
            _ => Err(UnknownVariant {
                kind: "classification",
                value: s.to_string(),
            }),
        }
    }
}

/// Adapter family that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    FederalRegistry,
    CountyPortal,
    SearchAggregator,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::FederalRegistry => "federal_registry",
            SourceType::CountyPortal => "county_portal",
            SourceType::SearchAggregator => "search_aggregator",
        }
    }
}

/// Query shape for one discovery call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub work_type: Option<WorkType>,
    pub state: String,
    #[serde(default)]
    pub city_or_county: Option<String>,
    /// Only the search aggregator uses this, as extra query text.
    #[serde(default)]
    pub classification: Option<Classification>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("state is required")]
    MissingState,
    #[error("page must be >= 1")]
    InvalidPage,
    #[error("page_size must be between 1 and 100, got {0}")]
    InvalidPageSize(usize),
}

impl Filter {
    pub fn new(work_type: Option<WorkType>, state: impl Into<String>) -> Self {
        Self {
            work_type,
            state: state.into(),
            city_or_county: None,
            classification: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        if self.state.trim().is_empty() {
            return Err(FilterError::MissingState);
        }
        if self.page == 0 {
            return Err(FilterError::InvalidPage);
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(FilterError::InvalidPageSize(self.page_size));
        }
        Ok(())
    }

    pub fn work_type_label(&self) -> &'static str {
        self.work_type.map(WorkType::label).unwrap_or("all work types")
    }

    /// Two-letter postal code for the filter's state, when it names a US state.
    pub fn state_code(&self) -> Option<&'static str> {
        state_code(&self.state)
    }
}

/// Pre-normalized hand-off from an adapter's provider mapping into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    pub source_type: SourceType,
    pub source_name: String,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub agency_or_client: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub estimated_value: Option<f64>,
    pub due_date_raw: Option<String>,
    pub posted_date_raw: Option<String>,
    pub work_type: Option<WorkType>,
    pub url: Option<String>,
    pub requirements: Vec<String>,
}

impl OpportunityDraft {
    pub fn new(source_type: SourceType, source_name: impl Into<String>) -> Self {
        Self {
            source_type,
            source_name: source_name.into(),
            external_id: None,
            title: None,
            agency_or_client: None,
            description: None,
            location: None,
            state: None,
            city: None,
            county: None,
            estimated_value: None,
            due_date_raw: None,
            posted_date_raw: None,
            work_type: None,
            url: None,
            requirements: Vec::new(),
        }
    }
}

/// Canonical bid/procurement listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub external_id: Option<String>,
    pub fingerprint: String,
    pub title: String,
    pub agency_or_client: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub estimated_value: Option<f64>,
    pub due_date: Option<NaiveDate>,
    pub posted_date: Option<NaiveDate>,
    pub work_type: WorkType,
    pub source_type: SourceType,
    pub source_name: String,
    pub url: Option<String>,
    #[serde(default)]
    pub priority_score: i64,
    #[serde(default)]
    pub requirements_checklist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("record from {source_name} has no usable title")]
    MissingTitle { source_name: String },
}

/// Maps a draft into the canonical record, rejecting drafts without a title.
pub fn normalize_draft(draft: OpportunityDraft) -> Result<Opportunity, MalformedRecord> {
    let title = match draft.title.as_deref().and_then(clean_text) {
        Some(t) if !normalize_title(&t).is_empty() => t,
        _ => {
            return Err(MalformedRecord::MissingTitle {
                source_name: draft.source_name,
            })
        }
    };

    let url = draft
        .url
        .as_deref()
        .and_then(clean_text)
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"));
    let due_raw = draft.due_date_raw.as_deref().and_then(clean_text);
    let due_date = due_raw.as_deref().and_then(parse_due_date);
    let posted_date = draft.posted_date_raw.as_deref().and_then(parse_due_date);

    // Raw due text, not the parsed date: "11/03/2026" and "2026-11-03" stay distinct.
    let fingerprint = fingerprint(url.as_deref(), Some(&title), due_raw.as_deref());

    let description = draft.description.as_deref().and_then(clean_text);
    let work_type = draft.work_type.unwrap_or_else(|| {
        let text = format!("{} {}", title, description.as_deref().unwrap_or_default());
        WorkType::detect(&text).unwrap_or(WorkType::Other)
    });

    let state = draft
        .state
        .as_deref()
        .and_then(clean_text)
        .map(|s| canonical_state_name(&s).map(str::to_string).unwrap_or(s));
    let city = draft.city.as_deref().and_then(clean_text);
    let county = draft.county.as_deref().and_then(clean_text);
    let location = draft
        .location
        .as_deref()
        .and_then(clean_text)
        .or_else(|| compose_location(city.as_deref(), county.as_deref(), state.as_deref()));

    Ok(Opportunity {
        external_id: draft.external_id.as_deref().and_then(clean_text),
        fingerprint,
        title,
        agency_or_client: draft.agency_or_client.as_deref().and_then(clean_text),
        description,
        location,
        state,
        city,
        county,
        estimated_value: draft.estimated_value.filter(|v| v.is_finite() && *v > 0.0),
        due_date,
        posted_date,
        work_type,
        source_type: draft.source_type,
        source_name: draft.source_name,
        url,
        priority_score: 0,
        requirements_checklist: draft.requirements,
    })
}

fn clean_text(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn compose_location(city: Option<&str>, county: Option<&str>, state: Option<&str>) -> Option<String> {
    let parts = [city, county, state]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

/// Per-adapter outcome of one discovery call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHealthEntry {
    pub source_name: String,
    pub source_type: SourceType,
    pub success: bool,
    pub count: usize,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl SourceHealthEntry {
    pub fn ok(source_name: &str, source_type: SourceType, count: usize, elapsed_ms: u64) -> Self {
        Self {
            source_name: source_name.to_string(),
            source_type,
            success: true,
            count,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(
        source_name: &str,
        source_type: SourceType,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            source_type,
            success: false,
            count: 0,
            error: Some(error.into()),
            elapsed_ms,
        }
    }
}

pub fn normalize_title(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_url(input: &str) -> String {
    let mut url = input.trim().to_lowercase();
    if let Some(idx) = url.find('#') {
        url.truncate(idx);
    }
    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            url = rest.to_string();
            break;
        }
    }
    if let Some(rest) = url.strip_prefix("www.") {
        url = rest.to_string();
    }
    url.trim_end_matches('/').to_string()
}

/// Dedup key: normalized URL, normalized title and due date joined by `|`.
pub fn fingerprint(url: Option<&str>, title: Option<&str>, due_date: Option<&str>) -> String {
    let url = url.map(normalize_url).unwrap_or_default();
    let title = title.map(normalize_title).unwrap_or_default();
    let due = due_date.map(str::trim).unwrap_or_default();
    format!("{url}{FINGERPRINT_SEPARATOR}{title}{FINGERPRINT_SEPARATOR}{due}")
}

const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%m-%d-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%Y/%m/%d",
];

/// Lenient date parser for the formats providers actually emit.
pub fn parse_due_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    let cleaned = raw.replace('.', "");
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, fmt) {
            return Some(date);
        }
    }
    // Timestamps with offsets like "-0500" or trailing times like "2:00 PM".
    if raw.len() >= 10 && raw.is_char_boundary(10) {
        if let Ok(date) = NaiveDate::parse_from_str(&raw[..10], "%Y-%m-%d") {
            return Some(date);
        }
    }
    let first_token = raw.split_whitespace().next()?;
    ["%m/%d/%Y", "%Y-%m-%d"]
        .into_iter()
        .find_map(|fmt| NaiveDate::parse_from_str(first_token, fmt).ok())
}

/// Extracts a dollar amount such as "$1,250,000" or "$2.5 million".
pub fn parse_money(text: &str) -> Option<f64> {
    let lower = text.to_ascii_lowercase();
    let start = match lower.find('$') {
        Some(idx) => idx + 1,
        None => 0,
    };
    let rest = lower[start..].trim_start();
    let number_len = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == ',' || *c == '.')
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let digits = rest[..number_len].replace(',', "");
    let mut value: f64 = digits.trim_end_matches('.').parse().ok()?;
    let suffix = rest[number_len..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>();
    match suffix.as_str() {
        "m" | "mm" | "million" => value *= 1_000_000.0,
        "k" | "thousand" => value *= 1_000.0,
        _ => {}
    }
    if value > 0.0 {
        Some(value)
    } else {
        None
    }
}

/// Lower-cases and replaces non-alphanumerics with single spaces, padded on
/// both sides so phrases can be matched on word boundaries.
pub fn word_normalize(text: &str) -> String {
    format!(" {} ", normalize_title(text))
}

/// `words` must come from [`word_normalize`].
pub fn contains_phrase(words: &str, phrase: &str) -> bool {
    words.contains(&format!(" {phrase} "))
}

const US_STATES: [(&str, &str); 51] = [
    ("Alabama", "AL"),
    ("Alaska", "AK"),
    ("Arizona", "AZ"),
    ("Arkansas", "AR"),
    ("California", "CA"),
    ("Colorado", "CO"),
    ("Connecticut", "CT"),
    ("Delaware", "DE"),
    ("District of Columbia", "DC"),
    ("Florida", "FL"),
    ("Georgia", "GA"),
    ("Hawaii", "HI"),
    ("Idaho", "ID"),
    ("Illinois", "IL"),
    ("Indiana", "IN"),
    ("Iowa", "IA"),
    ("Kansas", "KS"),
    ("Kentucky", "KY"),
    ("Louisiana", "LA"),
    ("Maine", "ME"),
    ("Maryland", "MD"),
    ("Massachusetts", "MA"),
    ("Michigan", "MI"),
    ("Minnesota", "MN"),
    ("Mississippi", "MS"),
    ("Missouri", "MO"),
    ("Montana", "MT"),
    ("Nebraska", "NE"),
    ("Nevada", "NV"),
    ("New Hampshire", "NH"),
    ("New Jersey", "NJ"),
    ("New Mexico", "NM"),
    ("New York", "NY"),
    ("North Carolina", "NC"),
    ("North Dakota", "ND"),
    ("Ohio", "OH"),
    ("Oklahoma", "OK"),
    ("Oregon", "OR"),
    ("Pennsylvania", "PA"),
    ("Rhode Island", "RI"),
    ("South Carolina", "SC"),
    ("South Dakota", "SD"),
    ("Tennessee", "TN"),
    ("Texas", "TX"),
    ("Utah", "UT"),
    ("Vermont", "VT"),
    ("Virginia", "VA"),
    ("Washington", "WA"),
    ("West Virginia", "WV"),
    ("Wisconsin", "WI"),
    ("Wyoming", "WY"),
];

/// Postal codes that collide with ordinary English words in all-caps text.
const AMBIGUOUS_CODES: [&str; 5] = ["IN", "OR", "ME", "OK", "HI"];

pub fn state_code(name_or_code: &str) -> Option<&'static str> {
    let needle = name_or_code.trim();
    US_STATES
        .iter()
        .find(|(name, code)| name.eq_ignore_ascii_case(needle) || code.eq_ignore_ascii_case(needle))
        .map(|(_, code)| *code)
}

pub fn canonical_state_name(name_or_code: &str) -> Option<&'static str> {
    let needle = name_or_code.trim();
    US_STATES
        .iter()
        .find(|(name, code)| name.eq_ignore_ascii_case(needle) || code.eq_ignore_ascii_case(needle))
        .map(|(name, _)| *name)
}

/// Finds the first US state named in free text.
pub fn detect_state(text: &str) -> Option<&'static str> {
    let words = word_normalize(text);
    // Multi-word names first so "West Virginia" is not read as "Virginia".
    let by_name = US_STATES
        .iter()
        .filter(|(name, _)| name.contains(' '))
        .chain(US_STATES.iter().filter(|(name, _)| !name.contains(' ')))
        .find(|(name, _)| contains_phrase(&words, &name.to_lowercase()))
        .map(|(name, _)| *name);
    if by_name.is_some() {
        return by_name;
    }
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|tok| tok.len() == 2 && tok.chars().all(|c| c.is_ascii_uppercase()))
        .filter(|tok| !AMBIGUOUS_CODES.contains(tok))
        .find_map(|tok| US_STATES.iter().find(|(_, code)| *code == tok))
        .map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(title: Option<&str>) -> OpportunityDraft {
        let mut d = OpportunityDraft::new(SourceType::CountyPortal, "San Diego County");
        d.title = title.map(str::to_string);
        d
    }

    #[test]
    fn fingerprint_ignores_case_scheme_and_punctuation() {
        let a = fingerprint(
            Some("https://www.Example.gov/bids/123/"),
            Some("Low-Voltage Cabling, Phase II"),
            Some("2026-11-15"),
        );
        let b = fingerprint(
            Some("http://example.gov/bids/123#details"),
            Some("low voltage cabling phase ii"),
            Some("2026-11-15"),
        );
        assert_eq!(a, b);
        assert_eq!(a, "example.gov/bids/123|low voltage cabling phase ii|2026-11-15");
    }

    #[test]
    fn fingerprint_with_all_components_absent_is_still_non_empty() {
        assert_eq!(fingerprint(None, None, None), "||");
    }

    #[test]
    fn normalize_draft_rejects_missing_or_punctuation_only_titles() {
        assert!(matches!(
            normalize_draft(draft(None)),
            Err(MalformedRecord::MissingTitle { .. })
        ));
        assert!(normalize_draft(draft(Some("   "))).is_err());
        assert!(normalize_draft(draft(Some("--- !!"))).is_err());
    }

    #[test]
    fn normalize_draft_fingerprints_the_raw_due_text() {
        let mut a = draft(Some("Fire Alarm Upgrade"));
        a.due_date_raw = Some(" 11/15/2026 ".into());
        a.url = Some("https://bids.example.gov/77".into());
        let mut b = draft(Some("FIRE ALARM UPGRADE"));
        b.due_date_raw = Some("11/15/2026".into());
        b.url = Some("https://bids.example.gov/77".into());
        let mut c = b.clone();
        c.due_date_raw = Some("2026-11-15T14:00:00-05:00".into());

        let a = normalize_draft(a).unwrap();
        let b = normalize_draft(b).unwrap();
        let c = normalize_draft(c).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert!(a.fingerprint.ends_with("|fire alarm upgrade|11/15/2026"));
        assert_ne!(b.fingerprint, c.fingerprint, "different due text never collides");
        assert_eq!(a.due_date, NaiveDate::from_ymd_opt(2026, 11, 15));
        assert_eq!(c.due_date, a.due_date);
        assert_eq!(a.work_type, WorkType::FireProtection);
    }

    #[test]
    fn normalize_draft_keeps_unparseable_due_text_in_fingerprint() {
        let mut d = draft(Some("Roof Replacement"));
        d.due_date_raw = Some("Upon award".into());
        let opp = normalize_draft(d).unwrap();
        assert_eq!(opp.due_date, None);
        assert!(opp.fingerprint.ends_with("|Upon award"));
    }

    #[test]
    fn normalize_draft_drops_non_http_urls_and_non_positive_values() {
        let mut d = draft(Some("Paving"));
        d.url = Some("javascript:void(0)".into());
        d.estimated_value = Some(0.0);
        d.state = Some("ca".into());
        d.city = Some("San Diego".into());
        let opp = normalize_draft(d).unwrap();
        assert_eq!(opp.url, None);
        assert_eq!(opp.estimated_value, None);
        assert_eq!(opp.state.as_deref(), Some("California"));
        assert_eq!(opp.location.as_deref(), Some("San Diego, California"));
    }

    #[test]
    fn work_type_detection_prefers_specific_trades() {
        assert_eq!(WorkType::detect("Low voltage electrical install"), Some(WorkType::LowVoltage));
        assert_eq!(WorkType::detect("Electrical service upgrade"), Some(WorkType::Electrical));
        assert_eq!(WorkType::detect("HVAC replacement at library"), Some(WorkType::Hvac));
        assert_eq!(WorkType::detect("Annual report printing"), None);
        assert!(!WorkType::Roofing.matches("Proof of insurance"));
    }

    #[test]
    fn work_type_parses_snake_and_spaced_forms() {
        assert_eq!("low_voltage".parse::<WorkType>().unwrap(), WorkType::LowVoltage);
        assert_eq!("Low Voltage".parse::<WorkType>().unwrap(), WorkType::LowVoltage);
        assert_eq!(parse_work_type_filter("all").unwrap(), None);
        assert!(parse_work_type_filter("carpentry").is_err());
    }

    #[test]
    fn state_detection_handles_names_and_codes() {
        assert_eq!(detect_state("Find low voltage bids in California"), Some("California"));
        assert_eq!(detect_state("bids in west virginia please"), Some("West Virginia"));
        assert_eq!(detect_state("RFPs near Austin, TX"), Some("Texas"));
        assert_eq!(detect_state("FIND BIDS IN OR NEAR CA"), Some("California"));
        assert_eq!(detect_state("find bids"), None);
        assert_eq!(state_code("california"), Some("CA"));
    }

    #[test]
    fn due_dates_parse_from_common_provider_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 11, 15);
        for raw in [
            "2026-11-15",
            "11/15/2026",
            "November 15, 2026",
            "Nov. 15, 2026",
            "2026-11-15T14:00:00-0500",
            "11/15/2026 2:00 PM",
        ] {
            assert_eq!(parse_due_date(raw), expected, "{raw}");
        }
        assert_eq!(parse_due_date("TBD"), None);
    }

    #[test]
    fn money_parses_commas_and_suffixes() {
        assert_eq!(parse_money("$1,250,000"), Some(1_250_000.0));
        assert_eq!(parse_money("Estimate: $2.5 million"), Some(2_500_000.0));
        assert_eq!(parse_money("$750K"), Some(750_000.0));
        assert_eq!(parse_money("400000"), Some(400_000.0));
        assert_eq!(parse_money("n/a"), None);
    }

    #[test]
    fn filter_validation_rejects_bad_paging_and_missing_state() {
        let mut filter = Filter::new(Some(WorkType::LowVoltage), "California");
        assert!(filter.validate().is_ok());
        filter.page = 0;
        assert_eq!(filter.validate(), Err(FilterError::InvalidPage));
        filter.page = 1;
        filter.page_size = MAX_PAGE_SIZE + 1;
        assert!(matches!(filter.validate(), Err(FilterError::InvalidPageSize(_))));
        assert_eq!(Filter::new(None, " ").validate(), Err(FilterError::MissingState));
    }

    #[test]
    fn opportunity_serializes_enums_in_snake_case() {
        let mut d = draft(Some("Structured cabling"));
        d.work_type = Some(WorkType::LowVoltage);
        let json = serde_json::to_value(normalize_draft(d).unwrap()).unwrap();
        assert_eq!(json["work_type"], "low_voltage");
        assert_eq!(json["source_type"], "county_portal");
    }
}
