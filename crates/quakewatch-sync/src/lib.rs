//! Ingestion pipeline orchestration: change detection, parse, enrich, persist, notify.

mod change;
mod config;
mod ingest;
mod notify;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quakewatch_adapters::{
    enrich_regions, parse_listing, CachingGeocoder, ExtractContext, NominatimGeocoder,
    NoopGeocoder, RegionGeocoder,
};
use quakewatch_core::{EventDraft, SeismicEvent};
use quakewatch_storage::{
    connect_pool, EventStore, FileSnapshotStore, HttpClientConfig, HttpFetcher,
    PgEventStore, PgRecipientDirectory, RecipientDirectory, SnapshotStore, SourceFetch,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub use change::{ChangeDecision, ChangeDetector, SNAPSHOT_KEY};
pub use config::{
    parse_recipient_list, SyncConfig, TwilioConfig, CONFIG_FILE_NAME, DEFAULT_SNAPSHOT_TTL_SECS,
    MAX_SNAPSHOT_TTL_SECS,
};
pub use ingest::{IngestSummary, IngestionCoordinator};
pub use notify::{
    dedupe_recipients, format_alert, DispatchSummary, LogOnlySms, NotificationTrigger,
    SendOutcome, SmsError, SmsTransport, TwilioSms,
};

pub const CRATE_NAME: &str = "quakewatch-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_url: String,
    /// The source could not be fetched; nothing was parsed.
    pub source_unavailable: bool,
    pub rejected_rows: usize,
    pub geocoded: usize,
    pub ingest: IngestSummary,
}

impl SyncRunSummary {
    pub fn new_events(&self) -> usize {
        self.ingest.inserted
    }
}

/// Result of a manual `notify` request.
#[derive(Debug, Clone)]
pub struct ManualNotification {
    pub event: SeismicEvent,
    pub dispatch: DispatchSummary,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn EventStore>,
    recipients: Arc<dyn RecipientDirectory>,
    fetcher: Arc<dyn SourceFetch>,
    snapshots: Arc<dyn SnapshotStore>,
    geocoder: Arc<dyn RegionGeocoder>,
    transport: Arc<dyn SmsTransport>,
}

impl SyncPipeline {
    /// Builds the production collaborators from `config`: HTTP fetcher, file
    /// snapshots, Nominatim geocoding when enabled, and Twilio when
    /// credentials are present.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn EventStore>,
        recipients: Arc<dyn RecipientDirectory>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let geocoder: Arc<dyn RegionGeocoder> = if config.geocoder_enabled {
            Arc::new(CachingGeocoder::new(NominatimGeocoder::new(
                config.geocoder_url.clone(),
                config.geocoder_user_agent.clone(),
                timeout,
            )?))
        } else {
            Arc::new(NoopGeocoder)
        };

        let transport: Arc<dyn SmsTransport> = match &config.twilio {
            Some(twilio) => Arc::new(TwilioSms::new(twilio.clone(), timeout)?),
            None => {
                warn!("twilio credentials not configured, alerts will only be logged");
                Arc::new(LogOnlySms)
            }
        };

        let snapshots = Arc::new(FileSnapshotStore::new(config.snapshot_dir.clone()));

        Ok(Self {
            config,
            store,
            recipients,
            fetcher: Arc::new(fetcher),
            snapshots,
            geocoder,
            transport,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetch>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn RegionGeocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SmsTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    fn detector(&self) -> ChangeDetector {
        ChangeDetector::new(
            self.fetcher.clone(),
            self.snapshots.clone(),
            self.config.source_url.clone(),
            self.config.snapshot_ttl(),
        )
    }

    fn notifier(&self) -> NotificationTrigger {
        NotificationTrigger::new(
            self.config.notify_threshold,
            self.recipients.clone(),
            self.transport.clone(),
        )
        .with_region_filter(self.config.notify_region_contains.clone())
        .with_static_recipients(self.config.notification_recipients.clone())
    }

    /// Manual pass: always fetches and ingests, ignoring and leaving alone
    /// the change-detection snapshot. An unreachable source is a pass with
    /// no new events, not an error.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let fetched_at = Utc::now();
        match self.fetcher.fetch(&self.config.source_url).await {
            Ok(response) => self.process_document(&response.body, fetched_at).await,
            Err(err) => {
                warn!(url = %self.config.source_url, error = %err, "source fetch failed, no update");
                let now = Utc::now();
                Ok(SyncRunSummary {
                    run_id: Uuid::new_v4(),
                    started_at: fetched_at,
                    finished_at: now,
                    source_url: self.config.source_url.clone(),
                    source_unavailable: true,
                    rejected_rows: 0,
                    geocoded: 0,
                    ingest: IngestSummary::default(),
                })
            }
        }
    }

    /// Parse, enrich and ingest one already-fetched document.
    pub async fn process_document(
        &self,
        body: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let html = String::from_utf8_lossy(body);
        let ctx = ExtractContext::new(self.config.source_url.clone(), fetched_at);

        let mut parsed = parse_listing(&html, &ctx).context("parsing source listing")?;
        let geocoded = self.enrich_unseen(&mut parsed.candidates).await;

        let coordinator = IngestionCoordinator::new(self.store.clone(), Arc::new(self.notifier()));
        let ingest = coordinator.ingest(parsed.candidates).await;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_url: self.config.source_url.clone(),
            source_unavailable: false,
            rejected_rows: parsed.rejected.len(),
            geocoded,
            ingest,
        })
    }

    /// Geocode only candidates not already stored; the provider is throttled
    /// and stored rows would be skipped as duplicates anyway.
    async fn enrich_unseen(&self, candidates: &mut [EventDraft]) -> usize {
        let mut unseen = Vec::new();
        for (idx, draft) in candidates.iter().enumerate() {
            match self.store.exists_by_external_id(&draft.external_id).await {
                Ok(true) => {}
                Ok(false) => unseen.push(idx),
                Err(err) => {
                    warn!(external_id = %draft.external_id, error = %err, "existence check failed before geocoding");
                    unseen.push(idx);
                }
            }
        }
        if unseen.is_empty() {
            return 0;
        }

        let mut batch: Vec<EventDraft> = unseen.iter().map(|&idx| candidates[idx].clone()).collect();
        let geocoded = enrich_regions(&mut batch, self.geocoder.as_ref()).await;
        for (idx, draft) in unseen.into_iter().zip(batch) {
            candidates[idx] = draft;
        }
        geocoded
    }

    /// One monitor tick. True only when the source changed and at least one
    /// new event was persisted; every failure is logged and reads as false.
    pub async fn check_for_updates(&self) -> bool {
        self.check_for_updates_at(Utc::now()).await
    }

    pub async fn check_for_updates_at(&self, now: DateTime<Utc>) -> bool {
        match self.detector().detect_at(now).await {
            ChangeDecision::Unavailable | ChangeDecision::Unchanged => false,
            ChangeDecision::Changed {
                body, fetched_at, ..
            } => match self.process_document(&body, fetched_at).await {
                Ok(summary) => {
                    info!(
                        run_id = %summary.run_id,
                        new_events = summary.new_events(),
                        "processed changed source"
                    );
                    summary.new_events() > 0
                }
                Err(err) => {
                    warn!(error = %err, "ingestion pass failed");
                    false
                }
            },
        }
    }

    /// Send the alert for a stored event regardless of magnitude. `None`
    /// when no event has that id.
    pub async fn notify_event(
        &self,
        event_id: i64,
        phones: &[String],
        include_registered: bool,
    ) -> Result<Option<ManualNotification>> {
        let Some(event) = self
            .store
            .find(event_id)
            .await
            .with_context(|| format!("loading event {event_id}"))?
        else {
            return Ok(None);
        };
        let dispatch = self
            .notifier()
            .send_manual(&event, phones, include_registered)
            .await;
        Ok(Some(ManualNotification { event, dispatch }))
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.fetch_cron.as_str();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let changed = pipeline.check_for_updates().await;
                info!(changed, "scheduled change check finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Connect to Postgres and build a pipeline backed by it.
pub async fn pipeline_from_config(config: SyncConfig) -> Result<SyncPipeline> {
    let pool = connect_pool(&config.database_url).await?;
    let store = Arc::new(PgEventStore::new(pool.clone()));
    let recipients = Arc::new(PgRecipientDirectory::new(pool));
    SyncPipeline::new(config, store, recipients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingSms;
    use async_trait::async_trait;
    use quakewatch_storage::{
        FetchError, FetchedResponse, MemoryEventStore, MemorySnapshotStore, StaticRecipients,
    };
    use reqwest::StatusCode;
    use std::sync::Mutex;

    const TWO_ROWS: &str = r#"<html><body><table id="table_inside_home">
        <tr class="tbis_leq1" onclick="go('?earthquake=1001')">
          <td valign="top" align="center">2025-03-28 13:20:52<br><font>2025-03-28 06:20:52 UTC</font></td>
          <td>4.5</td><td>13.5°N</td><td>100.2°E</td><td>10</td>
          <td><font>กรุงเทพ</font><br><font>Bangkok</font></td>
        </tr>
        <tr class="tbis_leq2" onclick="go('?earthquake=1002')">
          <td valign="top" align="center">2025-03-28 14:00:00<br><font>2025-03-28 07:00:00 UTC</font></td>
          <td>2.0</td><td>18.8°N</td><td>98.9°E</td><td>5</td>
          <td><font>เชียงใหม่</font><br><font>Chiang Mai</font></td>
        </tr>
    </table></body></html>"#;

    struct SwappableFetch {
        body: Mutex<Option<String>>,
        calls: Mutex<usize>,
    }

    impl SwappableFetch {
        fn serving(body: &str) -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(Some(body.to_string())),
                calls: Mutex::new(0),
            })
        }

        fn set(&self, body: Option<&str>) {
            *self.body.lock().unwrap() = body.map(str::to_string);
        }
    }

    #[async_trait]
    impl SourceFetch for SwappableFetch {
        async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            *self.calls.lock().unwrap() += 1;
            let body = self.body.lock().unwrap().clone();
            match body {
                Some(body) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body: body.into_bytes(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 502,
                    url: url.to_string(),
                }),
            }
        }
    }

    struct Harness {
        pipeline: SyncPipeline,
        store: Arc<MemoryEventStore>,
        sms: Arc<RecordingSms>,
        fetch: Arc<SwappableFetch>,
    }

    fn harness(body: &str) -> Harness {
        let config = SyncConfig {
            source_url: "https://tmd.test/".to_string(),
            geocoder_enabled: false,
            ..SyncConfig::default()
        };
        let store = Arc::new(MemoryEventStore::new());
        let sms = Arc::new(RecordingSms::default());
        let fetch = SwappableFetch::serving(body);
        let pipeline = SyncPipeline::new(
            config,
            store.clone(),
            Arc::new(StaticRecipients(vec!["+66811111111".to_string()])),
        )
        .expect("pipeline")
        .with_fetcher(fetch.clone())
        .with_snapshots(Arc::new(MemorySnapshotStore::new()))
        .with_transport(sms.clone());
        Harness {
            pipeline,
            store,
            sms,
            fetch,
        }
    }

    #[tokio::test]
    async fn two_rows_persist_and_only_the_larger_one_alerts() {
        let h = harness(TWO_ROWS);

        assert!(h.pipeline.check_for_updates().await);
        assert_eq!(h.store.len().await, 2);

        let sent = h.sms.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Magnitude: 4.5"));
        assert!(sent[0].1.contains("Location: Bangkok"));
    }

    #[tokio::test]
    async fn identical_refetch_skips_ingestion() {
        let h = harness(TWO_ROWS);
        assert!(h.pipeline.check_for_updates().await);
        assert!(!h.pipeline.check_for_updates().await);
        assert_eq!(h.store.len().await, 2);
        assert_eq!(h.sms.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn changed_page_without_new_rows_reports_false() {
        let h = harness(TWO_ROWS);
        assert!(h.pipeline.check_for_updates().await);

        h.fetch.set(Some(&format!("{TWO_ROWS} ")));
        assert!(!h.pipeline.check_for_updates().await);
        assert_eq!(h.store.len().await, 2);
    }

    #[tokio::test]
    async fn fetch_failure_reads_as_no_update() {
        let h = harness(TWO_ROWS);
        h.fetch.set(None);
        assert!(!h.pipeline.check_for_updates().await);
        assert!(h.store.is_empty().await);

        let manual = h.pipeline.run_once().await.expect("unreachable source is not an error");
        assert!(manual.source_unavailable);
        assert_eq!(manual.new_events(), 0);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn manual_pass_ignores_snapshot_and_is_idempotent() {
        let h = harness(TWO_ROWS);

        let first = h.pipeline.run_once().await.expect("run");
        assert_eq!(first.new_events(), 2);
        let second = h.pipeline.run_once().await.expect("run");
        assert_eq!(second.new_events(), 0);
        assert_eq!(second.ingest.duplicates, 2);
        assert_eq!(*h.fetch.calls.lock().unwrap(), 2);

        // the manual pass never wrote a snapshot, so the monitor still sees a first run
        assert!(!h.pipeline.check_for_updates().await);
        assert_eq!(*h.fetch.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn manual_notify_reports_missing_events() {
        let h = harness(TWO_ROWS);
        h.pipeline.run_once().await.expect("run");

        assert!(h
            .pipeline
            .notify_event(999, &["+66822222222".to_string()], false)
            .await
            .expect("lookup")
            .is_none());

        let small = h.store.all().await.into_iter().find(|e| e.magnitude < 4.0).expect("small event");
        let sent_before = h.sms.sent.lock().await.len();
        let manual = h
            .pipeline
            .notify_event(small.id, &["+66822222222".to_string()], true)
            .await
            .expect("lookup")
            .expect("event exists");
        assert_eq!(manual.dispatch.attempted, 2);
        assert_eq!(manual.dispatch.succeeded, 2);
        assert_eq!(h.sms.sent.lock().await.len(), sent_before + 2);
    }

    struct CountingGeocoder {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl RegionGeocoder for CountingGeocoder {
        async fn reverse(
            &self,
            _latitude: f64,
            _longitude: f64,
        ) -> Result<Option<String>, quakewatch_adapters::GeocodeError> {
            *self.calls.lock().unwrap() += 1;
            Ok(Some("Geocoded Place".to_string()))
        }
    }

    #[tokio::test]
    async fn stored_events_are_not_geocoded_again() {
        let geocoder = Arc::new(CountingGeocoder {
            calls: Mutex::new(0),
        });
        let h = harness(TWO_ROWS);
        let pipeline = h.pipeline.with_geocoder(geocoder.clone());

        let first = pipeline.run_once().await.expect("run");
        assert_eq!(first.geocoded, 2);
        assert_eq!(*geocoder.calls.lock().unwrap(), 2);
        assert!(h.store.all().await.iter().all(|e| e.region == "Geocoded Place"));

        let second = pipeline.run_once().await.expect("run");
        assert_eq!(second.geocoded, 0);
        assert_eq!(second.ingest.duplicates, 2);
        assert_eq!(*geocoder.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let h = harness(TWO_ROWS);
        let pipeline = Arc::new(h.pipeline);
        assert!(pipeline.maybe_build_scheduler().await.expect("build").is_none());
    }
}
