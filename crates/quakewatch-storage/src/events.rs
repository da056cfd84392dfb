use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quakewatch_core::{EventDraft, SeismicEvent, SIGNIFICANT_MAGNITUDE};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event with external id {external_id} already exists")]
    Duplicate { external_id: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * i64::from(self.per_page)
    }
}

/// Read-side filter shared by the API views.
///
/// `since` and `significant_only` narrow the explicit bounds rather than
/// replacing them, so `/recent` and `/significant` are just preset filters.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub min_magnitude: Option<f64>,
    pub max_magnitude: Option<f64>,
    pub region: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub significant_only: bool,
    pub page: Option<Pagination>,
}

impl EventFilter {
    fn effective_start(&self) -> Option<DateTime<Utc>> {
        match (self.start, self.since) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn effective_min_magnitude(&self) -> Option<f64> {
        let floor = self.significant_only.then_some(SIGNIFICANT_MAGNITUDE);
        match (self.min_magnitude, floor) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn region_needle(&self) -> Option<&str> {
        self.region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    pub fn matches(&self, event: &SeismicEvent) -> bool {
        if self.effective_start().is_some_and(|s| event.origin_time < s) {
            return false;
        }
        if self.end.is_some_and(|e| event.origin_time > e) {
            return false;
        }
        if self
            .effective_min_magnitude()
            .is_some_and(|m| event.magnitude < m)
        {
            return false;
        }
        if self.max_magnitude.is_some_and(|m| event.magnitude > m) {
            return false;
        }
        if let Some(needle) = self.region_needle() {
            let needle = needle.to_lowercase();
            let in_region = event.region.to_lowercase().contains(&needle);
            let in_local = event
                .region_local
                .as_deref()
                .is_some_and(|r| r.to_lowercase().contains(&needle));
            if !in_region && !in_local {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub data: Vec<SeismicEvent>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub last_page: u32,
}

impl EventPage {
    fn assemble(data: Vec<SeismicEvent>, total: u64, page: Option<Pagination>) -> Self {
        match page {
            Some(p) => {
                let per_page = p.per_page.max(1);
                let last_page = total.div_ceil(u64::from(per_page)).max(1) as u32;
                Self {
                    data,
                    page: p.page.max(1),
                    per_page,
                    total,
                    last_page,
                }
            }
            None => Self {
                per_page: data.len() as u32,
                data,
                page: 1,
                total,
                last_page: 1,
            },
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, StoreError>;

    /// Persist a new event. Returns [`StoreError::Duplicate`] when the external
    /// id is already taken.
    async fn insert(&self, draft: &EventDraft) -> Result<SeismicEvent, StoreError>;

    async fn find(&self, id: i64) -> Result<Option<SeismicEvent>, StoreError>;

    /// Newest first by origin time.
    async fn query(&self, filter: &EventFilter) -> Result<EventPage, StoreError>;
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn phone_numbers(&self) -> Result<Vec<String>, StoreError>;
}

pub async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPool::connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying migrations")
}

const EVENT_COLUMNS: &str = "id, origin_time, magnitude, latitude, longitude, depth_km, region, region_local, external_id, created_at";

const FILTER_CLAUSE: &str = r#"
    WHERE ($1::timestamptz IS NULL OR origin_time >= $1)
      AND ($2::timestamptz IS NULL OR origin_time <= $2)
      AND ($3::float8 IS NULL OR magnitude >= $3)
      AND ($4::float8 IS NULL OR magnitude <= $4)
      AND ($5::text IS NULL OR (region ILIKE $5 OR region_local ILIKE $5))
"#;

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn event_from_row(row: &PgRow) -> Result<SeismicEvent, sqlx::Error> {
    Ok(SeismicEvent {
        id: row.try_get("id")?,
        origin_time: row.try_get("origin_time")?,
        magnitude: row.try_get("magnitude")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        depth_km: row.try_get("depth_km")?,
        region: row.try_get("region")?,
        region_local: row.try_get("region_local")?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self))]
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM seismic_events WHERE external_id = $1)")
                .bind(external_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    #[instrument(skip(self, draft), fields(external_id = %draft.external_id))]
    async fn insert(&self, draft: &EventDraft) -> Result<SeismicEvent, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO seismic_events
                (origin_time, magnitude, latitude, longitude, depth_km, region, region_local, external_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING id, created_at
            "#,
        )
        .bind(draft.origin_time)
        .bind(draft.magnitude)
        .bind(draft.latitude)
        .bind(draft.longitude)
        .bind(draft.depth_km)
        .bind(&draft.region)
        .bind(&draft.region_local)
        .bind(&draft.external_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::Duplicate {
                external_id: draft.external_id.clone(),
            });
        };

        let id: i64 = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(SeismicEvent::from_draft(id, created_at, draft))
    }

    #[instrument(skip(self))]
    async fn find(&self, id: i64) -> Result<Option<SeismicEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM seismic_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(event_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    #[instrument(skip(self, filter))]
    async fn query(&self, filter: &EventFilter) -> Result<EventPage, StoreError> {
        let start = filter.effective_start();
        let min_magnitude = filter.effective_min_magnitude();
        let region = filter.region_needle().map(like_pattern);
        let (limit, offset) = match filter.page {
            Some(p) => (Some(i64::from(p.per_page.max(1))), p.offset()),
            None => (None, 0),
        };

        let count_sql = format!("SELECT COUNT(*) FROM seismic_events {FILTER_CLAUSE}");
        let total: i64 = sqlx::query_scalar(&count_sql)
            .bind(start)
            .bind(filter.end)
            .bind(min_magnitude)
            .bind(filter.max_magnitude)
            .bind(region.as_deref())
            .fetch_one(&self.pool)
            .await?;

        let select_sql = format!(
            "SELECT {EVENT_COLUMNS} FROM seismic_events {FILTER_CLAUSE} \
             ORDER BY origin_time DESC, id DESC LIMIT $6 OFFSET $7"
        );
        let rows = sqlx::query(&select_sql)
            .bind(start)
            .bind(filter.end)
            .bind(min_magnitude)
            .bind(filter.max_magnitude)
            .bind(region.as_deref())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let data = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(returned = data.len(), total, "queried seismic events");

        Ok(EventPage::assemble(data, total.max(0) as u64, filter.page))
    }
}

#[derive(Debug, Clone)]
pub struct PgRecipientDirectory {
    pool: PgPool,
}

impl PgRecipientDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for PgRecipientDirectory {
    async fn phone_numbers(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT phone_number
            FROM recipients
            WHERE phone_number IS NOT NULL AND btrim(phone_number) <> ''
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut numbers = Vec::with_capacity(rows.len());
        for row in rows {
            numbers.push(row.try_get::<String, _>("phone_number")?);
        }
        Ok(numbers)
    }
}

/// Fixed recipient list, used for configured numbers and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRecipients(pub Vec<String>);

#[async_trait]
impl RecipientDirectory for StaticRecipients {
    async fn phone_numbers(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default)]
struct MemoryEvents {
    next_id: i64,
    events: Vec<SeismicEvent>,
    external_ids: HashSet<String>,
}

/// Process-local event store with the same uniqueness rule as the table.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryEvents>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<SeismicEvent> {
        self.inner.lock().await.events.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.external_ids.contains(external_id))
    }

    async fn insert(&self, draft: &EventDraft) -> Result<SeismicEvent, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.external_ids.insert(draft.external_id.clone()) {
            return Err(StoreError::Duplicate {
                external_id: draft.external_id.clone(),
            });
        }
        inner.next_id += 1;
        let event = SeismicEvent::from_draft(inner.next_id, Utc::now(), draft);
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn find(&self, id: i64) -> Result<Option<SeismicEvent>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn query(&self, filter: &EventFilter) -> Result<EventPage, StoreError> {
        let mut matched: Vec<SeismicEvent> = self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.origin_time.cmp(&a.origin_time).then(b.id.cmp(&a.id)));

        let total = matched.len() as u64;
        let data = match filter.page {
            Some(p) => matched
                .into_iter()
                .skip(p.offset() as usize)
                .take(p.per_page.max(1) as usize)
                .collect(),
            None => matched,
        };
        Ok(EventPage::assemble(data, total, filter.page))
    }
}
