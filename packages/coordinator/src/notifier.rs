//! Delivery of alerts to donors.
//!
//! The transport (push, SMS) lives outside this service. A [`Notifier`]
//! reports whether a single delivery succeeded; the dispatcher bounds every
//! call with its own timeout and treats anything but `true` as "not
//! notified".

use std::sync::Arc;

use async_trait::async_trait;
use bloodlink_blood_models::{BloodType, Urgency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NotifierConfig;

/// What a donor is told about a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub alert_id: Uuid,
    pub request_id: Uuid,
    pub round: u32,
    pub blood_type_needed: BloodType,
    pub urgency: Urgency,
    pub units_needed: u32,
    pub distance_meters: f64,
    pub location_name: Option<String>,
    pub contact_phone: Option<String>,
    /// When the donor's window to respond closes.
    pub respond_by: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Attempts to deliver `summary` to `donor_id`. Returns whether the
    /// transport accepted it.
    async fn notify(&self, donor_id: Uuid, summary: &AlertSummary) -> bool;
}

/// Writes alerts to the log. Always succeeds.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, donor_id: Uuid, summary: &AlertSummary) -> bool {
        log::info!(
            "ALERT donor={donor_id} request={} round={} {} {} ({:.0}m away)",
            summary.request_id,
            summary.round,
            summary.urgency,
            summary.blood_type_needed,
            summary.distance_meters
        );
        true
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    donor_id: Uuid,
    alert: &'a AlertSummary,
}

/// POSTs each alert as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, donor_id: Uuid, summary: &AlertSummary) -> bool {
        let payload = WebhookPayload {
            donor_id,
            alert: summary,
        };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                log::warn!(
                    "Webhook rejected alert {} for donor {donor_id}: {}",
                    summary.alert_id,
                    response.status()
                );
                false
            }
            Err(e) => {
                log::warn!(
                    "Webhook delivery of alert {} failed: {e}",
                    summary.alert_id
                );
                false
            }
        }
    }
}

/// Builds the notifier described by `config`.
#[must_use]
pub fn from_config(config: &NotifierConfig) -> Arc<dyn Notifier> {
    match config {
        NotifierConfig::Log => Arc::new(LogNotifier),
        NotifierConfig::Webhook { url } => {
            log::info!("Delivering alerts to webhook {url}");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
    }
}
