use crate::auth::constant_time_compare;
use crate::brevo_client::normalize_message_id;
use crate::db_storage::{DeliveryUpdate, NewEmailEvent};
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::DeliveryStatus;
use crate::webhook_models::{BrevoEvent, WebhookPayload, WebhookQuery, WebhookResponse, WebhookStatus};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Brevo transactional webhook.
///
/// Accepts one event or an array. Answers 200 whatever happens to the events so
/// Brevo does not retry; failures are reported in the body.
#[utoipa::path(
    post,
    path = "/api/webhooks/brevo",
    responses((status = 200, body = WebhookResponse), (status = 401, description = "Bad token")),
    tag = "webhooks"
)]
pub async fn brevo_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    validate_webhook_token(&state, &query)?;

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Unreadable Brevo webhook payload: {}", e);
            return Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    error: Some(format!("invalid payload: {}", e)),
                    ..Default::default()
                }),
            ));
        }
    };

    let events = payload.into_events();
    let mut response = WebhookResponse {
        received: events.len(),
        ..Default::default()
    };
    tracing::info!("Processing {} Brevo event(s)", response.received);

    for event in &events {
        match process_event(&state, event).await {
            Ok(EventOutcome::Processed) => response.processed += 1,
            Ok(EventOutcome::Duplicate) => {
                response.duplicates += 1;
                tracing::debug!("Skipped duplicate {} event", event.event);
            }
            Ok(EventOutcome::NotFound) => {
                response.not_found += 1;
                tracing::info!(
                    "No sent email for {} event ({:?})",
                    event.event,
                    event.email
                );
            }
            Ok(EventOutcome::Ignored) => response.ignored += 1,
            Err(e) => {
                // Continue with the remaining events
                tracing::error!("Failed to process Brevo {} event: {}", event.event, e);
                response.error = Some(e.to_string());
            }
        }
    }

    tracing::info!(
        "Brevo webhook: {} received, {} processed, {} duplicates, {} not found",
        response.received,
        response.processed,
        response.duplicates,
        response.not_found
    );
    Ok((StatusCode::OK, Json(response)))
}

/// Liveness probe for the webhook URL configured in Brevo.
#[utoipa::path(
    get,
    path = "/api/webhooks/brevo",
    responses((status = 200, body = WebhookStatus)),
    tag = "webhooks"
)]
pub async fn brevo_webhook_status() -> Json<WebhookStatus> {
    Json(WebhookStatus {
        status: "active".to_string(),
        message: "SoignantVoice Brevo Webhook".to_string(),
        timestamp: Utc::now(),
    })
}

fn validate_webhook_token(state: &AppState, query: &WebhookQuery) -> Result<(), AppError> {
    let Some(ref expected) = state.config.brevo_webhook_token else {
        return Ok(());
    };
    let token = query
        .token
        .as_deref()
        .ok_or_else(|| AppError::Unauthorized("Missing webhook token".to_string()))?;
    if !constant_time_compare(token, expected) {
        tracing::warn!("Invalid Brevo webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum EventOutcome {
    Processed,
    Duplicate,
    NotFound,
    Ignored,
}

async fn process_event(state: &AppState, event: &BrevoEvent) -> Result<EventOutcome, AppError> {
    let Some(status) = event.delivery_status() else {
        tracing::debug!("Ignoring Brevo event '{}'", event.event);
        return Ok(EventOutcome::Ignored);
    };

    let message_id = event
        .message_id
        .as_deref()
        .map(normalize_message_id)
        .filter(|m| !m.is_empty());
    let Some(sent) = state
        .storage
        .find_email_for_event(message_id.as_deref(), event.email.as_deref())
        .await?
    else {
        return Ok(EventOutcome::NotFound);
    };

    let occurred_at = event.occurred_at().unwrap_or_else(Utc::now);
    let dedup_message_id = sent
        .brevo_message_id
        .clone()
        .or(message_id)
        .unwrap_or_else(|| format!("email:{}", sent.id));
    let event_ts = event
        .event_ts_key()
        .unwrap_or_else(|| occurred_at.to_rfc3339());
    let payload = serde_json::to_value(event)?;

    let recorded = NewEmailEvent {
        message_id: &dedup_message_id,
        event: &event.event,
        email: event.email.as_deref(),
        link: event.link(),
        event_ts: &event_ts,
        payload: &payload,
    };
    let update = DeliveryUpdate {
        status,
        link: event.link(),
        occurred_at,
    };
    let fresh = state
        .storage
        .apply_email_event(sent.id, sent.contact_id, &recorded, &update)
        .await?;
    if !fresh {
        return Ok(EventOutcome::Duplicate);
    }

    if let Some(contact_id) = sent.contact_id {
        match status {
            DeliveryStatus::Bounced => {
                tracing::info!("Contact {} marked invalid after {}", contact_id, event.event)
            }
            DeliveryStatus::Unsubscribed => tracing::info!("Contact {} unsubscribed", contact_id),
            _ => {}
        }
    }

    Ok(EventOutcome::Processed)
}
