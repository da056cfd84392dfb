use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use quakewatch_core::{exceeds_notify_threshold, SeismicEvent};
use quakewatch_storage::RecipientDirectory;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TwilioConfig;

pub const TWILIO_API_BASE: &str = "https://api.twilio.com";

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("sms request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sms provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, destination: &str, body: &str) -> Result<(), SmsError>;
}

/// Twilio Messages API over plain REST.
#[derive(Debug, Clone)]
pub struct TwilioSms {
    client: reqwest::Client,
    config: TwilioConfig,
    api_base: String,
}

impl TwilioSms {
    pub fn new(config: TwilioConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building twilio client")?;
        Ok(Self {
            client,
            config,
            api_base: TWILIO_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsTransport for TwilioSms {
    async fn send(&self, destination: &str, body: &str) -> Result<(), SmsError> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", destination),
                ("From", self.config.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(to = destination, message_length = body.len(), "sms sent");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SmsError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Dry-run transport used when no SMS credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySms;

#[async_trait]
impl SmsTransport for LogOnlySms {
    async fn send(&self, destination: &str, body: &str) -> Result<(), SmsError> {
        info!(to = destination, body, "sms transport not configured, logging alert only");
        Ok(())
    }
}

pub fn format_alert(event: &SeismicEvent) -> String {
    format!(
        "EARTHQUAKE ALERT\nTime: {}\nMagnitude: {}\nLocation: {}\nCoordinates: {}°, {}°\nDepth: {} km",
        event.origin_time.format("%Y-%m-%d %H:%M:%S"),
        event.magnitude,
        event.region,
        event.latitude,
        event.longitude,
        event.depth_km,
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub destination: String,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<SendOutcome>,
}

impl DispatchSummary {
    pub fn record(&mut self, outcome: SendOutcome) {
        self.attempted += 1;
        if outcome.succeeded() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    /// True only when something was attempted and nothing got through.
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.succeeded == 0
    }
}

/// Blanks dropped, first occurrence wins.
pub fn dedupe_recipients<I, S>(numbers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    numbers
        .into_iter()
        .map(|n| n.as_ref().trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.clone()))
        .collect()
}

pub struct NotificationTrigger {
    threshold: f64,
    region_contains: Option<String>,
    directory: Arc<dyn RecipientDirectory>,
    static_recipients: Vec<String>,
    transport: Arc<dyn SmsTransport>,
}

impl NotificationTrigger {
    pub fn new(
        threshold: f64,
        directory: Arc<dyn RecipientDirectory>,
        transport: Arc<dyn SmsTransport>,
    ) -> Self {
        Self {
            threshold,
            region_contains: None,
            directory,
            static_recipients: Vec::new(),
            transport,
        }
    }

    pub fn with_region_filter(mut self, region_contains: Option<String>) -> Self {
        self.region_contains = region_contains
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty());
        self
    }

    pub fn with_static_recipients(mut self, numbers: Vec<String>) -> Self {
        self.static_recipients = numbers;
        self
    }

    pub fn should_notify(&self, event: &SeismicEvent) -> bool {
        if !exceeds_notify_threshold(event.magnitude, self.threshold) {
            return false;
        }
        match &self.region_contains {
            Some(needle) => std::iter::once(event.region.as_str())
                .chain(event.region_local.as_deref())
                .any(|label| label.to_lowercase().contains(needle)),
            None => true,
        }
    }

    /// Registered numbers followed by configured ones. A directory failure
    /// still leaves the configured numbers.
    pub async fn registered_recipients(&self) -> Vec<String> {
        let registered = match self.directory.phone_numbers().await {
            Ok(numbers) => numbers,
            Err(err) => {
                warn!(error = %err, "failed to load registered recipients");
                Vec::new()
            }
        };
        dedupe_recipients(registered.iter().chain(self.static_recipients.iter()))
    }

    /// Automatic path for a freshly persisted event. `None` when the event
    /// does not qualify.
    pub async fn on_new_event(&self, event: &SeismicEvent) -> Option<DispatchSummary> {
        if !self.should_notify(event) {
            info!(
                event_id = event.id,
                magnitude = event.magnitude,
                threshold = self.threshold,
                region = %event.region,
                "skipping notification, criteria not met"
            );
            return None;
        }

        let recipients = self.registered_recipients().await;
        if recipients.is_empty() {
            info!(event_id = event.id, "no recipients to notify");
            return Some(DispatchSummary::default());
        }
        Some(self.dispatch(event, &recipients).await)
    }

    /// Manual send that ignores the threshold.
    pub async fn send_manual(
        &self,
        event: &SeismicEvent,
        phones: &[String],
        include_registered: bool,
    ) -> DispatchSummary {
        let mut recipients = phones.to_vec();
        if include_registered {
            recipients.extend(self.registered_recipients().await);
        }
        let recipients = dedupe_recipients(recipients);
        self.dispatch(event, &recipients).await
    }

    /// Sequential sends; each recipient yields one outcome.
    pub async fn dispatch(&self, event: &SeismicEvent, recipients: &[String]) -> DispatchSummary {
        let message = format_alert(event);
        let mut summary = DispatchSummary::default();
        for destination in recipients {
            let outcome = match self.transport.send(destination, &message).await {
                Ok(()) => SendOutcome {
                    destination: destination.clone(),
                    error: None,
                },
                Err(err) => {
                    warn!(to = %destination, error = %err, "failed to send sms");
                    SendOutcome {
                        destination: destination.clone(),
                        error: Some(err.to_string()),
                    }
                }
            };
            summary.record(outcome);
        }
        info!(
            event_id = event.id,
            magnitude = event.magnitude,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            "earthquake notifications sent"
        );
        summary
    }
}
