//! Field extraction and listing parsing for the TMD earthquake table, plus
//! reverse-geocoding enrichment.

mod geocode;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use quakewatch_core::{derive_external_id, EventDraft, RegionSource};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use geocode::{
    enrich_regions, CachingGeocoder, GeocodeError, NominatimGeocoder, NoopGeocoder,
    RegionGeocoder, DEFAULT_NOMINATIM_URL,
};

pub const CRATE_NAME: &str = "quakewatch-adapters";
pub const EXTRACTOR_VERSION: &str = "tmd-listing/1";
pub const DEFAULT_SOURCE_URL: &str = "https://earthquake.tmd.go.th/";

const ROW_SELECTOR: &str = "#table_inside_home tr.tbis_leq1, #table_inside_home tr.tbis_leq2";
const EXPECTED_CELLS: usize = 6;

static TIMESTAMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").expect("timestamp regex"));
static LATITUDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*°\s*([NS])").expect("latitude regex"));
static LONGITUDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*°\s*([EW])").expect("longitude regex"));
static EVENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"earthquake=(\d+)").expect("event id regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Latitude,
    Longitude,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Latitude => f.write_str("latitude"),
            Axis::Longitude => f.write_str("longitude"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractError {
    #[error("row has {found} cells, expected at least {expected}")]
    MissingCell { expected: usize, found: usize },
    #[error("malformed timestamp {0:?}")]
    MalformedTimestamp(String),
    #[error("unparsable {axis} {text:?}")]
    UnparsableCoordinate { axis: Axis, text: String },
    #[error("invalid {field} {text:?}")]
    InvalidNumber { field: &'static str, text: String },
    #[error("selector error: {0}")]
    Selector(String),
}

/// Provenance stamped on every draft produced from one fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

impl ExtractContext {
    pub fn new(source_url: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source_url: source_url.into(),
            fetched_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub index: usize,
    pub error: ExtractError,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingParse {
    pub candidates: Vec<EventDraft>,
    pub rejected: Vec<RejectedRow>,
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn collapsed_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

fn direct_cells(row: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "td")
        .collect()
}

const NAIVE_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d %B %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
];

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

/// Parse an origin time, preferring the fixed `YYYY-MM-DD HH:MM:SS` layout
/// anywhere in the text. Values without an offset are UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ExtractError> {
    let trimmed = text.trim();
    if let Some(m) = TIMESTAMP_RE.find(trimmed) {
        if let Ok(naive) = NaiveDateTime::parse_from_str(m.as_str(), "%Y-%m-%d %H:%M:%S") {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    let without_zone = trimmed
        .strip_suffix("UTC")
        .or_else(|| trimmed.strip_suffix("GMT"))
        .map(str::trim_end)
        .unwrap_or(trimmed);
    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(without_zone, layout) {
            return Ok(naive.and_utc());
        }
    }
    for layout in DATE_LAYOUTS {
        if let Ok(date) = NaiveDate::parse_from_str(without_zone, layout) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(naive.and_utc());
            }
        }
    }

    Err(ExtractError::MalformedTimestamp(trimmed.to_string()))
}

/// Magnitude text is reduced to digits and dots. Nothing left means `0.0`,
/// which is kept as a valid reading rather than rejected.
pub fn parse_magnitude(text: &str) -> f64 {
    let stripped: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if stripped.is_empty() {
        return 0.0;
    }
    stripped
        .parse::<f64>()
        .ok()
        .or_else(|| extract_numbers(&stripped).first().copied())
        .unwrap_or(0.0)
}

/// `13.5°S` -> `-13.5`, `100.2°E` -> `100.2`.
pub fn parse_coordinate(text: &str, axis: Axis) -> Result<f64, ExtractError> {
    let re = match axis {
        Axis::Latitude => &*LATITUDE_RE,
        Axis::Longitude => &*LONGITUDE_RE,
    };
    let unparsable = || ExtractError::UnparsableCoordinate {
        axis,
        text: text.trim().to_string(),
    };

    let caps = re.captures(text).ok_or_else(unparsable)?;
    let value: f64 = caps[1].parse().map_err(|_| unparsable())?;
    match &caps[2] {
        "S" | "W" => Ok(-value),
        _ => Ok(value),
    }
}

pub fn parse_depth(text: &str) -> Result<f64, ExtractError> {
    extract_numbers(text)
        .first()
        .copied()
        .ok_or_else(|| ExtractError::InvalidNumber {
            field: "depth",
            text: text.trim().to_string(),
        })
}

fn timestamp_text(cell: ElementRef<'_>, font: &Selector) -> String {
    cell.select(font)
        .next()
        .and_then(|f| text_or_none(collapsed_text(f)))
        .unwrap_or_else(|| collapsed_text(cell))
}

/// Returns `(region, region_local)`.
fn region_texts(cell: ElementRef<'_>, font: &Selector) -> (String, Option<String>) {
    let blocks: Vec<Option<String>> = cell
        .select(font)
        .map(|f| text_or_none(collapsed_text(f)))
        .collect();
    let local = blocks.first().cloned().flatten();
    let display = blocks.get(1).cloned().flatten();

    match (display, local) {
        (Some(display), local) => (display, local),
        (None, Some(local)) => (local.clone(), Some(local)),
        (None, None) => {
            let full = collapsed_text(cell);
            let local = text_or_none(full.clone());
            (full, local)
        }
    }
}

fn source_event_id(row: ElementRef<'_>) -> Option<String> {
    let onclick = row.value().attr("onclick")?;
    EVENT_ID_RE
        .captures(onclick)
        .map(|caps| caps[1].to_string())
}

/// Extract one banded table row into a draft.
pub fn extract_row(row: ElementRef<'_>, ctx: &ExtractContext) -> Result<EventDraft, ExtractError> {
    let cells = direct_cells(row);
    if cells.len() < EXPECTED_CELLS {
        return Err(ExtractError::MissingCell {
            expected: EXPECTED_CELLS,
            found: cells.len(),
        });
    }
    let font = selector("font")?;

    let origin_time = parse_timestamp(&timestamp_text(cells[0], &font))?;
    let magnitude = parse_magnitude(&collapsed_text(cells[1]));
    let latitude = parse_coordinate(&collapsed_text(cells[2]), Axis::Latitude)?;
    let longitude = parse_coordinate(&collapsed_text(cells[3]), Axis::Longitude)?;
    let depth_km = parse_depth(&collapsed_text(cells[4]))?;
    let (region, region_local) = region_texts(cells[5], &font);

    let external_id = source_event_id(row)
        .unwrap_or_else(|| derive_external_id(origin_time, latitude, longitude));

    Ok(EventDraft {
        origin_time,
        magnitude,
        latitude,
        longitude,
        depth_km,
        region,
        region_local,
        region_source: RegionSource::Scraped,
        external_id,
        source_url: ctx.source_url.clone(),
        fetched_at: ctx.fetched_at,
        extractor_version: EXTRACTOR_VERSION.to_string(),
    })
}

/// Walk the listing table top to bottom.
///
/// Rows with fewer than six cells are header or footer rows and are skipped
/// without comment. Every other failure is kept in `rejected` and logged with
/// the raw row markup; it never aborts the pass.
pub fn parse_listing(html: &str, ctx: &ExtractContext) -> Result<ListingParse, ExtractError> {
    let document = Html::parse_document(html);
    let rows = selector(ROW_SELECTOR)?;

    let mut out = ListingParse::default();
    for (index, row) in document.select(&rows).enumerate() {
        let cell_count = direct_cells(row).len();
        if cell_count < EXPECTED_CELLS {
            debug!(index, cell_count, "skipping non-data row");
            continue;
        }

        match extract_row(row, ctx) {
            Ok(draft) => out.candidates.push(draft),
            Err(error) => {
                let snippet = row.html();
                warn!(index, error = %error, row = %snippet, "failed to parse earthquake row");
                out.rejected.push(RejectedRow {
                    index,
                    error,
                    snippet,
                });
            }
        }
    }

    debug!(
        candidates = out.candidates.len(),
        rejected = out.rejected.len(),
        "parsed listing"
    );
    Ok(out)
}
