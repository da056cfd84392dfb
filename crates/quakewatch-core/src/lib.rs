//! Core domain model for quakewatch: seismic events, candidate drafts, thresholds.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "quakewatch-core";

/// Notification fires only for magnitudes strictly above this value.
pub const NOTIFY_MAGNITUDE_THRESHOLD: f64 = 4.0;

/// The read API's "significant" view includes this value (inclusive).
pub const SIGNIFICANT_MAGNITUDE: f64 = 4.0;

pub const RECENT_WINDOW_HOURS: i64 = 24;

/// Where the canonical `region` text of a draft came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegionSource {
    #[default]
    Scraped,
    Geocoded,
}

/// Parsed, not yet deduplicated event handed from the parser to ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub origin_time: DateTime<Utc>,
    pub magnitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub region: String,
    pub region_local: Option<String>,
    pub region_source: RegionSource,
    pub external_id: String,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
}

/// Persisted, immutable seismic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeismicEvent {
    pub id: i64,
    pub origin_time: DateTime<Utc>,
    pub magnitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub region: String,
    pub region_local: Option<String>,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

impl SeismicEvent {
    pub fn from_draft(id: i64, created_at: DateTime<Utc>, draft: &EventDraft) -> Self {
        Self {
            id,
            origin_time: draft.origin_time,
            magnitude: draft.magnitude,
            latitude: draft.latitude,
            longitude: draft.longitude,
            depth_km: draft.depth_km,
            region: draft.region.clone(),
            region_local: draft.region_local.clone(),
            external_id: draft.external_id.clone(),
            created_at,
        }
    }

    pub fn is_significant(&self) -> bool {
        is_significant(self.magnitude)
    }
}

pub fn exceeds_notify_threshold(magnitude: f64, threshold: f64) -> bool {
    magnitude > threshold
}

pub fn is_significant(magnitude: f64) -> bool {
    magnitude >= SIGNIFICANT_MAGNITUDE
}

pub fn recent_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(RECENT_WINDOW_HOURS)
}

/// Stable identifier for events the source does not label itself.
///
/// Repeated fetches of the same row produce the same id because the key only
/// depends on the second-resolution origin time and the parsed coordinates.
pub fn derive_external_id(origin_time: DateTime<Utc>, latitude: f64, longitude: f64) -> String {
    let key = format!(
        "{}|{}|{}",
        origin_time.format("%Y-%m-%d %H:%M:%S"),
        latitude,
        longitude
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}
