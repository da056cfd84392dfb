use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use quakewatch_adapters::{parse_listing, Axis, ExtractContext, ExtractError, EXTRACTOR_VERSION};
use quakewatch_core::RegionSource;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct GoldenEvent {
    external_id: String,
    origin_time: DateTime<Utc>,
    magnitude: f64,
    latitude: f64,
    longitude: f64,
    depth_km: f64,
    region: String,
    region_local: Option<String>,
}

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/tmd/sample")
        .canonicalize()
        .expect("fixture dir")
}

fn assert_close(actual: f64, expected: f64, what: &str) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "{what}: expected {expected}, got {actual}"
    );
}

#[test]
fn sample_listing_matches_snapshot() {
    let dir = fixture_dir();
    let html = fs::read_to_string(dir.join("listing.html")).expect("read listing");
    let golden: Vec<GoldenEvent> =
        serde_json::from_str(&fs::read_to_string(dir.join("snapshot.json")).expect("read snapshot"))
            .expect("parse snapshot");

    let fetched_at = Utc.with_ymd_and_hms(2025, 3, 28, 9, 0, 0).single().expect("ts");
    let ctx = ExtractContext::new("https://earthquake.tmd.go.th/", fetched_at);
    let parsed = parse_listing(&html, &ctx).expect("parse listing");

    assert_eq!(parsed.candidates.len(), golden.len());
    for (draft, expected) in parsed.candidates.iter().zip(&golden) {
        assert_eq!(draft.external_id, expected.external_id);
        assert_eq!(draft.origin_time, expected.origin_time);
        assert_close(draft.magnitude, expected.magnitude, "magnitude");
        assert_close(draft.latitude, expected.latitude, "latitude");
        assert_close(draft.longitude, expected.longitude, "longitude");
        assert_close(draft.depth_km, expected.depth_km, "depth");
        assert_eq!(draft.region, expected.region);
        assert_eq!(draft.region_local, expected.region_local);
        assert_eq!(draft.region_source, RegionSource::Scraped);
        assert_eq!(draft.fetched_at, fetched_at);
        assert_eq!(draft.extractor_version, EXTRACTOR_VERSION);
    }

    assert_eq!(parsed.rejected.len(), 1);
    let rejected = &parsed.rejected[0];
    assert_eq!(rejected.index, 3);
    assert!(matches!(
        rejected.error,
        ExtractError::UnparsableCoordinate {
            axis: Axis::Latitude,
            ..
        }
    ));
    assert!(rejected.snippet.contains("08:02:33"));
}

#[test]
fn rows_outside_the_listing_table_are_ignored() {
    let html = fs::read_to_string(fixture_dir().join("listing.html")).expect("read listing");
    let ctx = ExtractContext::new("https://earthquake.tmd.go.th/", Utc::now());
    let parsed = parse_listing(&html, &ctx).expect("parse listing");

    assert!(parsed
        .candidates
        .iter()
        .all(|d| d.external_id != "99999" && d.region != "Footer"));
}
