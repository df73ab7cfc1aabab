use crate::config::Config;
use crate::errors::AppError;
use crate::throttle::{error_for_status, VendorGate};
use crate::vendor_models::{
    BrevoAddress, BrevoAggregatedReport, BrevoEmailRequest, BrevoSendResponse,
};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

/// Outbound message handed to [`BrevoClient::send_email`].
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_content: String,
    pub text_content: Option<String>,
    pub tags: Vec<String>,
    pub params: Option<serde_json::Value>,
}

/// Client for the Brevo transactional email API.
#[derive(Clone)]
pub struct BrevoClient {
    client: Client,
    base_url: String,
    api_key: String,
    sender_email: String,
    sender_name: String,
    gate: VendorGate,
}

impl BrevoClient {
    pub fn new(
        client: Client,
        base_url: String,
        api_key: String,
        sender_email: String,
        sender_name: String,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            sender_email,
            sender_name,
            gate: VendorGate::new("Brevo", Duration::from_millis(200)),
        }
    }

    pub fn from_config(config: &Config, client: &Client) -> Option<Self> {
        config.brevo_api_key.as_ref().map(|key| {
            Self::new(
                client.clone(),
                config.brevo_base_url.clone(),
                key.clone(),
                config.brevo_sender_email.clone(),
                config.brevo_sender_name.clone(),
            )
        })
    }

    /// Sends a transactional email and returns Brevo's message id, angle brackets stripped.
    pub async fn send_email(&self, email: &OutboundEmail) -> Result<String, AppError> {
        let url = format!("{}/smtp/email", self.base_url);
        tracing::info!("Sending email via Brevo to {}: {}", email.to_email, email.subject);

        let tags = if email.tags.is_empty() {
            vec!["soignantvoice".to_string(), "prospection".to_string()]
        } else {
            email.tags.clone()
        };

        let body = BrevoEmailRequest {
            sender: BrevoAddress {
                email: self.sender_email.clone(),
                name: Some(self.sender_name.clone()),
            },
            to: vec![BrevoAddress {
                email: email.to_email.clone(),
                name: email.to_name.clone().filter(|n| !n.trim().is_empty()),
            }],
            subject: email.subject.clone(),
            html_content: email.html_content.clone(),
            text_content: email.text_content.clone(),
            reply_to: Some(BrevoAddress {
                email: self.sender_email.clone(),
                name: None,
            }),
            tags,
            params: email.params.clone(),
            headers: Some(json!({ "X-Mailin-custom": "soignantvoice-crm" })),
        };

        let request = self
            .client
            .post(&url)
            .header("api-key", &self.api_key)
            .header("accept", "application/json")
            .json(&body);

        let response = self.gate.send(request).await?;
        let response = error_for_status("Brevo", response).await?;

        let sent: BrevoSendResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Brevo response: {}", e))
        })?;

        let message_id = normalize_message_id(&sent.message_id);
        tracing::info!("Brevo accepted email: {}", message_id);
        Ok(message_id)
    }

    /// Creates or updates a Brevo contact.
    pub async fn upsert_contact(
        &self,
        email: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
        list_ids: &[i64],
    ) -> Result<(), AppError> {
        let url = format!("{}/contacts", self.base_url);
        tracing::info!("Upserting Brevo contact {}", email);

        let body = json!({
            "email": email,
            "attributes": {
                "PRENOM": first_name.unwrap_or_default(),
                "NOM": last_name.unwrap_or_default(),
            },
            "listIds": list_ids,
            "updateEnabled": true,
        });

        let request = self
            .client
            .post(&url)
            .header("api-key", &self.api_key)
            .json(&body);

        let response = self.gate.send(request).await?;
        error_for_status("Brevo", response).await?;
        Ok(())
    }

    /// Account-wide transactional statistics.
    pub async fn aggregated_report(&self) -> Result<BrevoAggregatedReport, AppError> {
        let url = format!("{}/smtp/statistics/aggregatedReport", self.base_url);
        let request = self.client.get(&url).header("api-key", &self.api_key);
        let response = self.gate.send(request).await?;
        let response = error_for_status("Brevo", response).await?;

        response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Brevo report: {}", e))
        })
    }
}

/// Brevo wraps message ids in angle brackets in some payloads and not others.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_brackets_are_stripped() {
        assert_eq!(
            normalize_message_id("<202401011200.123@smtp-relay.mailin.fr>"),
            "202401011200.123@smtp-relay.mailin.fr"
        );
        assert_eq!(normalize_message_id(" abc@x "), "abc@x");
    }
}
