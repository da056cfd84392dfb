use std::collections::HashSet;
use std::sync::Arc;

use quakewatch_core::EventDraft;
use quakewatch_storage::{EventStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::notify::NotificationTrigger;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub candidates: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub inserted_ids: Vec<i64>,
    pub alerts: usize,
    pub sends_succeeded: usize,
    pub sends_failed: usize,
}

/// Dedups candidates against storage, persists new ones and hands each new
/// event to the notification trigger. Notification results never undo a write.
pub struct IngestionCoordinator {
    store: Arc<dyn EventStore>,
    notifier: Arc<NotificationTrigger>,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn EventStore>, notifier: Arc<NotificationTrigger>) -> Self {
        Self { store, notifier }
    }

    pub async fn ingest(&self, candidates: Vec<EventDraft>) -> IngestSummary {
        let mut summary = IngestSummary {
            candidates: candidates.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for draft in candidates {
            if !seen.insert(draft.external_id.clone()) {
                debug!(external_id = %draft.external_id, "repeated external id in batch, skipping");
                summary.duplicates += 1;
                continue;
            }

            match self.store.exists_by_external_id(&draft.external_id).await {
                Ok(true) => {
                    debug!(external_id = %draft.external_id, "event already stored");
                    summary.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(external_id = %draft.external_id, error = %err, "existence check failed");
                    summary.failed += 1;
                    continue;
                }
            }

            let event = match self.store.insert(&draft).await {
                Ok(event) => event,
                Err(StoreError::Duplicate { external_id }) => {
                    debug!(%external_id, "lost insert race, already stored");
                    summary.duplicates += 1;
                    continue;
                }
                Err(err) => {
                    warn!(external_id = %draft.external_id, error = %err, "failed to persist event");
                    summary.failed += 1;
                    continue;
                }
            };
            summary.inserted += 1;
            summary.inserted_ids.push(event.id);

            if let Some(dispatch) = self.notifier.on_new_event(&event).await {
                summary.alerts += 1;
                summary.sends_succeeded += dispatch.succeeded;
                summary.sends_failed += dispatch.failed;
            }
        }

        info!(
            candidates = summary.candidates,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "earthquake data updated"
        );
        summary
    }
}
