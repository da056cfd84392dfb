use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use quakewatch_core::{EventDraft, RegionSource};
use quakewatch_storage::{
    BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding geocoder response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Resolves coordinates to a display name. `Ok(None)` means the provider had
/// nothing useful to say.
#[async_trait]
pub trait RegionGeocoder: Send + Sync {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<String>, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
}

#[derive(Debug)]
pub struct NominatimGeocoder {
    http: HttpFetcher,
    base_url: String,
}

impl NominatimGeocoder {
    /// Requests are throttled to one per second.
    pub fn new(
        base_url: impl Into<String>,
        user_agent: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(user_agent.into()),
            concurrency: 1,
            backoff: BackoffPolicy::none(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            }),
        })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl RegionGeocoder for NominatimGeocoder {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<String>, GeocodeError> {
        let url = format!("{}/reverse", self.base_url.trim_end_matches('/'));
        let query = [
            ("lat", latitude.to_string()),
            ("lon", longitude.to_string()),
            ("format", "json".to_string()),
            ("zoom", "6".to_string()),
            ("accept-language", "en".to_string()),
        ];
        let response = self.http.fetch_with_query("nominatim", &url, &query).await?;
        let parsed: ReverseResponse = serde_json::from_slice(&response.body)?;
        Ok(parsed
            .display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGeocoder;

#[async_trait]
impl RegionGeocoder for NoopGeocoder {
    async fn reverse(&self, _latitude: f64, _longitude: f64) -> Result<Option<String>, GeocodeError> {
        Ok(None)
    }
}

/// In-process cache keyed by exact coordinates. Errors are not cached.
#[derive(Debug)]
pub struct CachingGeocoder<G> {
    inner: G,
    cache: Mutex<HashMap<(u64, u64), Option<String>>>,
}

impl<G> CachingGeocoder<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<G: RegionGeocoder> RegionGeocoder for CachingGeocoder<G> {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<String>, GeocodeError> {
        let key = (latitude.to_bits(), longitude.to_bits());
        if let Some(hit) = self.cache.lock().await.get(&key) {
            return Ok(hit.clone());
        }
        let resolved = self.inner.reverse(latitude, longitude).await?;
        self.cache.lock().await.insert(key, resolved.clone());
        Ok(resolved)
    }
}

/// Second pass over extracted drafts. A non-empty geocoder answer replaces
/// the scraped region; anything else leaves the draft alone. Returns how many
/// drafts were overridden.
pub async fn enrich_regions(drafts: &mut [EventDraft], geocoder: &dyn RegionGeocoder) -> usize {
    let mut overridden = 0;
    for draft in drafts.iter_mut() {
        match geocoder.reverse(draft.latitude, draft.longitude).await {
            Ok(Some(name)) => {
                debug!(external_id = %draft.external_id, region = %name, "region geocoded");
                draft.region = name;
                draft.region_source = RegionSource::Geocoded;
                overridden += 1;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    external_id = %draft.external_id,
                    latitude = draft.latitude,
                    longitude = draft.longitude,
                    error = %err,
                    "reverse geocoding failed, keeping scraped region"
                );
            }
        }
    }
    overridden
}
