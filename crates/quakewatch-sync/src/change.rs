use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use quakewatch_storage::{SnapshotStore, SourceFetch, SourceSnapshot};
use tracing::{debug, info, warn};

pub const SNAPSHOT_KEY: &str = "tmd-listing";

/// Outcome of one comparison against the cached snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Fetch failed or returned a non-success status.
    Unavailable,
    Unchanged,
    Changed {
        body: Vec<u8>,
        fetched_at: DateTime<Utc>,
        first_run: bool,
    },
}

/// Decides whether the source has moved since the last look.
///
/// The snapshot is replaced only when the document changed. A read error on
/// the snapshot store is treated like a miss.
pub struct ChangeDetector {
    fetcher: Arc<dyn SourceFetch>,
    snapshots: Arc<dyn SnapshotStore>,
    source_url: String,
    ttl: Duration,
    key: String,
}

impl ChangeDetector {
    pub fn new(
        fetcher: Arc<dyn SourceFetch>,
        snapshots: Arc<dyn SnapshotStore>,
        source_url: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            fetcher,
            snapshots,
            source_url: source_url.into(),
            ttl,
            key: SNAPSHOT_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub async fn detect(&self) -> ChangeDecision {
        self.detect_at(Utc::now()).await
    }

    pub async fn detect_at(&self, now: DateTime<Utc>) -> ChangeDecision {
        let response = match self.fetcher.fetch(&self.source_url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %self.source_url, error = %err, "source fetch failed, treating as no update");
                return ChangeDecision::Unavailable;
            }
        };

        let previous = match self.snapshots.get(&self.key).await {
            Ok(snapshot) => snapshot.filter(|s| !s.is_expired(now)),
            Err(err) => {
                warn!(key = %self.key, error = %err, "snapshot read failed, treating as first run");
                None
            }
        };

        if previous.as_ref().is_some_and(|s| s.matches(&response.body)) {
            debug!(url = %self.source_url, "source unchanged");
            return ChangeDecision::Unchanged;
        }

        let first_run = previous.is_none();
        let snapshot = SourceSnapshot::new(response.body.clone(), now, self.ttl);
        info!(
            url = %self.source_url,
            first_run,
            content_hash = %snapshot.content_hash,
            bytes = response.body.len(),
            "source changed"
        );
        if let Err(err) = self.snapshots.put(&self.key, snapshot).await {
            warn!(key = %self.key, error = %err, "failed to store source snapshot");
        }

        ChangeDecision::Changed {
            body: response.body,
            fetched_at: now,
            first_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quakewatch_storage::{FetchError, FetchedResponse, MemorySnapshotStore};
    use reqwest::StatusCode;
    use std::sync::Mutex;

    /// Serves queued bodies in order, repeating the last one.
    struct QueuedFetch {
        bodies: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl QueuedFetch {
        fn new(bodies: Vec<Option<&str>>) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(
                    bodies
                        .into_iter()
                        .map(|b| b.map(|b| b.as_bytes().to_vec()))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl SourceFetch for QueuedFetch {
        async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            let next = {
                let mut bodies = self.bodies.lock().unwrap();
                if bodies.len() > 1 {
                    bodies.remove(0)
                } else {
                    bodies[0].clone()
                }
            };
            match next {
                Some(body) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body,
                }),
                None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn detector(fetch: Arc<QueuedFetch>, snapshots: Arc<MemorySnapshotStore>) -> ChangeDetector {
        ChangeDetector::new(fetch, snapshots, "https://tmd.test/", Duration::hours(24))
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn first_fetch_is_a_change_and_identical_refetch_is_not() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let detector = detector(QueuedFetch::new(vec![Some("<html>a</html>")]), snapshots.clone());

        let first = detector.detect_at(at("2025-03-28T06:00:00Z")).await;
        assert!(matches!(first, ChangeDecision::Changed { first_run: true, .. }));

        let stored = snapshots.get(SNAPSHOT_KEY).await.unwrap().expect("snapshot");
        let second = detector.detect_at(at("2025-03-28T06:00:01Z")).await;
        assert_eq!(second, ChangeDecision::Unchanged);

        let untouched = snapshots.get(SNAPSHOT_KEY).await.unwrap().expect("snapshot");
        assert_eq!(untouched.fetched_at, stored.fetched_at);
    }

    #[tokio::test]
    async fn one_byte_difference_replaces_the_snapshot() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let detector = detector(
            QueuedFetch::new(vec![Some("<td>4.5</td>"), Some("<td>4.6</td>")]),
            snapshots.clone(),
        );

        detector.detect_at(at("2025-03-28T06:00:00Z")).await;
        let decision = detector.detect_at(at("2025-03-28T06:00:01Z")).await;

        match decision {
            ChangeDecision::Changed { body, first_run, .. } => {
                assert_eq!(body, b"<td>4.6</td>".to_vec());
                assert!(!first_run);
            }
            other => panic!("expected change, got {other:?}"),
        }
        let stored = snapshots.get(SNAPSHOT_KEY).await.unwrap().expect("snapshot");
        assert!(stored.matches(b"<td>4.6</td>"));
    }

    #[tokio::test]
    async fn expired_snapshot_counts_as_first_run() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let detector = detector(QueuedFetch::new(vec![Some("same")]), snapshots);

        detector.detect_at(at("2025-03-28T06:00:00Z")).await;
        let decision = detector.detect_at(at("2025-03-29T06:00:00Z")).await;
        assert!(matches!(decision, ChangeDecision::Changed { first_run: true, .. }));
    }

    #[tokio::test]
    async fn fetch_failure_is_not_a_change_and_keeps_snapshot() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let detector = detector(QueuedFetch::new(vec![Some("body"), None]), snapshots.clone());

        detector.detect_at(at("2025-03-28T06:00:00Z")).await;
        let decision = detector.detect_at(at("2025-03-28T06:00:01Z")).await;
        assert_eq!(decision, ChangeDecision::Unavailable);
        assert!(snapshots.get(SNAPSHOT_KEY).await.unwrap().is_some());
    }
}
