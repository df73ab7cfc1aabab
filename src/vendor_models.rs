use crate::models::EmailStatus;
use serde::{Deserialize, Serialize};

// ============ Hunter ============

#[derive(Debug, Clone, Deserialize)]
pub struct HunterEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DomainSearchData {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub emails: Vec<HunterEmail>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HunterEmail {
    pub value: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub confidence: i32,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailFinderData {
    pub email: Option<String>,
    #[serde(default)]
    pub score: i32,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailVerifierData {
    pub email: String,
    /// deliverable, undeliverable, risky or unknown
    pub result: String,
    #[serde(default)]
    pub score: i32,
}

impl EmailVerifierData {
    pub fn email_status(&self) -> EmailStatus {
        map_hunter_verification(&self.result, self.score)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HunterAccountData {
    pub requests: HunterRequests,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HunterRequests {
    pub searches: HunterQuota,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HunterQuota {
    #[serde(default)]
    pub used: i64,
    #[serde(default)]
    pub available: i64,
}

/// `deliverable` or any non-undeliverable result scored 80+ is valid.
pub fn map_hunter_verification(result: &str, score: i32) -> EmailStatus {
    match result {
        "deliverable" => EmailStatus::Valide,
        "undeliverable" => EmailStatus::Invalide,
        _ if score >= 80 => EmailStatus::Valide,
        _ => EmailStatus::AVerifier,
    }
}

// ============ ZeroBounce ============

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZeroBounceResult {
    pub address: String,
    pub status: String,
    #[serde(default)]
    pub sub_status: Option<String>,
    #[serde(default)]
    pub did_you_mean: Option<String>,
}

impl ZeroBounceResult {
    pub fn email_status(&self) -> EmailStatus {
        map_zerobounce_status(&self.status)
    }

    /// Statuses safe to send to.
    pub fn is_safe(&self) -> bool {
        matches!(self.status.as_str(), "valid" | "catch-all")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZeroBounceBatchResponse {
    #[serde(default)]
    pub email_batch: Vec<ZeroBounceResult>,
    #[serde(default)]
    pub errors: Vec<ZeroBounceBatchError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZeroBounceBatchError {
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZeroBounceCredits {
    #[serde(rename = "Credits")]
    pub credits: String,
}

pub fn map_zerobounce_status(status: &str) -> EmailStatus {
    match status {
        "valid" => EmailStatus::Valide,
        "invalid" | "spamtrap" | "abuse" | "do_not_mail" => EmailStatus::Invalide,
        _ => EmailStatus::AVerifier,
    }
}

// ============ Serper ============

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SerperResponse {
    #[serde(default)]
    pub organic: Vec<SerperItem>,
    #[serde(default)]
    pub news: Vec<SerperItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerperItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub link: Option<String>,
}

impl SerperResponse {
    /// Up to five organic results then up to three news items, as one line each.
    pub fn snippets(&self) -> Vec<String> {
        let organic = self
            .organic
            .iter()
            .take(5)
            .map(|r| format!("{}: {}", r.title, r.snippet));
        let news = self
            .news
            .iter()
            .take(3)
            .map(|r| format!("[ACTUALITÉ] {}: {}", r.title, r.snippet));
        organic.chain(news).collect()
    }
}

// ============ Anthropic ============

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessagesResponse {
    pub fn first_text(&self) -> Option<String> {
        self.content
            .iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text.as_deref())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

// ============ Brevo ============

#[derive(Debug, Clone, Serialize)]
pub struct BrevoAddress {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrevoEmailRequest {
    pub sender: BrevoAddress,
    pub to: Vec<BrevoAddress>,
    pub subject: String,
    pub html_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<BrevoAddress>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrevoSendResponse {
    pub message_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrevoAggregatedReport {
    #[serde(default)]
    pub requests: i64,
    #[serde(default)]
    pub delivered: i64,
    #[serde(default)]
    pub hard_bounces: i64,
    #[serde(default)]
    pub soft_bounces: i64,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub unique_clicks: i64,
    #[serde(default)]
    pub opens: i64,
    #[serde(default)]
    pub unique_opens: i64,
    #[serde(default)]
    pub spam_reports: i64,
    #[serde(default)]
    pub unsubscribed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zerobounce_mapping() {
        assert_eq!(map_zerobounce_status("valid"), EmailStatus::Valide);
        for s in ["invalid", "spamtrap", "abuse", "do_not_mail"] {
            assert_eq!(map_zerobounce_status(s), EmailStatus::Invalide);
        }
        for s in ["catch-all", "unknown", "something_new"] {
            assert_eq!(map_zerobounce_status(s), EmailStatus::AVerifier);
        }
    }

    #[test]
    fn zerobounce_safe_statuses() {
        let mut r = ZeroBounceResult {
            address: "a@b.fr".into(),
            status: "catch-all".into(),
            sub_status: None,
            did_you_mean: None,
        };
        assert!(r.is_safe());
        r.status = "unknown".into();
        assert!(!r.is_safe());
    }

    #[test]
    fn hunter_verification_mapping() {
        assert_eq!(map_hunter_verification("deliverable", 10), EmailStatus::Valide);
        assert_eq!(map_hunter_verification("risky", 85), EmailStatus::Valide);
        assert_eq!(map_hunter_verification("undeliverable", 20), EmailStatus::Invalide);
        assert_eq!(map_hunter_verification("unknown", 50), EmailStatus::AVerifier);
    }

    #[test]
    fn serper_snippets_limit_and_prefix() {
        let item = |t: &str| SerperItem {
            title: t.to_string(),
            snippet: "s".to_string(),
            link: None,
        };
        let resp = SerperResponse {
            organic: (0..7).map(|i| item(&format!("o{}", i))).collect(),
            news: (0..5).map(|i| item(&format!("n{}", i))).collect(),
        };
        let lines = resp.snippets();
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0], "o0: s");
        assert_eq!(lines[5], "[ACTUALITÉ] n0: s");
    }

    #[test]
    fn brevo_request_serializes_camel_case() {
        let req = BrevoEmailRequest {
            sender: BrevoAddress {
                email: "from@x.fr".into(),
                name: Some("From".into()),
            },
            to: vec![BrevoAddress {
                email: "to@x.fr".into(),
                name: None,
            }],
            subject: "Hi".into(),
            html_content: "<p>Hi</p>".into(),
            text_content: None,
            reply_to: None,
            tags: vec![],
            params: None,
            headers: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["htmlContent"], "<p>Hi</p>");
        assert!(v.get("tags").is_none());
        assert!(v["to"][0].get("name").is_none());
    }

    #[test]
    fn anthropic_first_text() {
        let resp: MessagesResponse = serde_json::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "  Bonjour  "}]
        }))
        .unwrap();
        assert_eq!(resp.first_text().as_deref(), Some("Bonjour"));
    }
}
