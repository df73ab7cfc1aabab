use crate::models::DeliveryStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Brevo posts either one event or an array of them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WebhookPayload {
    Single(BrevoEvent),
    Batch(Vec<BrevoEvent>),
}

impl WebhookPayload {
    pub fn into_events(self) -> Vec<BrevoEvent> {
        match self {
            WebhookPayload::Single(event) => vec![event],
            WebhookPayload::Batch(events) => events,
        }
    }
}

/// One transactional email event from Brevo.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrevoEvent {
    pub event: String,

    #[serde(default)]
    pub email: Option<String>,

    /// Message id, sometimes wrapped in angle brackets.
    #[serde(rename = "message-id", default)]
    pub message_id: Option<String>,

    /// Event date in Brevo's `YYYY-MM-DD HH:MM:SS` form.
    #[serde(default)]
    pub date: Option<String>,

    /// Unix seconds.
    #[serde(default)]
    pub ts: Option<i64>,

    #[serde(default)]
    pub ts_event: Option<i64>,

    #[serde(default)]
    pub link: Option<String>,

    /// A single tag or a list of tags.
    #[serde(default)]
    pub tag: Option<Value>,

    /// Every other field Brevo sends.
    #[serde(flatten)]
    pub raw: Value,
}

impl BrevoEvent {
    /// Delivery status carried by the event. `None` for events that change nothing.
    pub fn delivery_status(&self) -> Option<DeliveryStatus> {
        map_brevo_event(&self.event)
    }

    /// When the event happened: `ts_event`, then `ts`, then `date`.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.ts_event
            .or(self.ts)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| self.date.as_deref().and_then(parse_event_date))
    }

    /// Deduplication key for the event time, as stored.
    pub fn event_ts_key(&self) -> Option<String> {
        self.ts_event
            .or(self.ts)
            .map(|secs| secs.to_string())
            .or_else(|| self.date.clone().filter(|d| !d.is_empty()))
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref().filter(|l| !l.is_empty())
    }
}

pub fn map_brevo_event(event: &str) -> Option<DeliveryStatus> {
    match event.trim().to_lowercase().as_str() {
        "delivered" => Some(DeliveryStatus::Delivered),
        "opened" | "unique_opened" | "proxy_open" => Some(DeliveryStatus::Opened),
        "click" | "clicked" => Some(DeliveryStatus::Clicked),
        "hard_bounce" | "soft_bounce" | "blocked" | "invalid_email" => {
            Some(DeliveryStatus::Bounced)
        }
        "spam" | "complaint" => Some(DeliveryStatus::Spam),
        "unsubscribed" => Some(DeliveryStatus::Unsubscribed),
        _ => None,
    }
}

/// Parses RFC 3339 or Brevo's naive `YYYY-MM-DD HH:MM:SS` (taken as UTC).
pub fn parse_event_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f %z").map(|dt| dt.with_timezone(&Utc))
        })
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

/// Webhook acknowledgement. Always sent with HTTP 200.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct WebhookResponse {
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub not_found: usize,
    pub ignored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebhookStatus {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
