use crate::cache_validator::ValidatedCacheEntry;
use crate::config::Config;
use crate::errors::AppError;
use crate::throttle::{error_for_status, VendorGate};
use crate::vendor_models::*;
use moka::future::Cache;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Builds the HTTP client shared by every vendor wrapper.
pub fn build_http_client() -> Result<Client, AppError> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| AppError::InternalError(format!("Failed to create HTTP client: {}", e)))
}

/// Search result caches. One hour is long enough to cover a master run.
pub fn build_lookup_cache() -> Cache<String, String> {
    Cache::builder()
        .time_to_live(Duration::from_secs(3600))
        .max_capacity(10_000)
        .build()
}

fn build_url(base: &str, path: &str, params: &[(&str, &str)]) -> Result<reqwest::Url, AppError> {
    reqwest::Url::parse_with_params(&format!("{}{}", base, path), params)
        .map_err(|e| AppError::InternalError(format!("Failed to build URL: {}", e)))
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    vendor: &str,
    response: reqwest::Response,
) -> Result<T, AppError> {
    response.json().await.map_err(|e| {
        AppError::ExternalApiError(format!(
            "Failed to parse {} response: {}",
            vendor,
            e.without_url()
        ))
    })
}

// ============ Hunter ============

/// Hunter.io: domain search, email finder, email verifier.
#[derive(Clone)]
pub struct HunterService {
    client: Client,
    base_url: String,
    api_key: String,
    gate: VendorGate,
    domain_cache: Cache<String, String>,
}

impl HunterService {
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            gate: VendorGate::new("Hunter", Duration::from_millis(1000)),
            domain_cache: build_lookup_cache(),
        }
    }

    pub fn from_config(config: &Config, client: &Client) -> Option<Self> {
        config
            .hunter_api_key
            .as_ref()
            .map(|key| Self::new(client.clone(), config.hunter_base_url.clone(), key.clone()))
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Option<T>, AppError> {
        let mut all = vec![("api_key", self.api_key.as_str())];
        all.extend_from_slice(params);
        let url = build_url(&self.base_url, path, &all)?;
        tracing::debug!("Hunter GET {}?{:?} api_key=[REDACTED]", path, params);

        let response = self.gate.send(self.client.get(url)).await?;
        // Hunter answers 404 when it has nothing for the input.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status("Hunter", response).await?;
        let envelope: HunterEnvelope<T> = parse_json("Hunter", response).await?;
        Ok(Some(envelope.data))
    }

    /// Lists the emails Hunter knows for a domain.
    pub async fn domain_search(
        &self,
        domain: &str,
        kind: Option<&str>,
        limit: u32,
    ) -> Result<DomainSearchData, AppError> {
        tracing::info!("Hunter domain search for {}", domain);
        let limit = limit.to_string();
        let mut params = vec![("domain", domain), ("limit", limit.as_str())];
        if let Some(kind) = kind {
            params.push(("type", kind));
        }
        Ok(self
            .get::<DomainSearchData>("/domain-search", &params)
            .await?
            .unwrap_or_default())
    }

    /// Resolves an organisation name to its web domain. Results are cached.
    pub async fn find_company_domain(&self, company: &str) -> Result<Option<String>, AppError> {
        let key = format!("company:{}", company.to_lowercase());
        if let Some(cached) = self.domain_cache.get(&key).await {
            if let Some(domain) = ValidatedCacheEntry::deserialize_and_validate(&cached) {
                tracing::debug!("Company domain cache hit for {}", company);
                return Ok(Some(domain).filter(|d| !d.is_empty()));
            }
            self.domain_cache.invalidate(&key).await;
        }

        tracing::info!("Hunter company lookup for {}", company);
        let data = self
            .get::<DomainSearchData>("/domain-search", &[("company", company), ("limit", "1")])
            .await?;
        let domain = data.and_then(|d| d.domain).filter(|d| !d.is_empty());

        let entry = ValidatedCacheEntry::new(domain.clone().unwrap_or_default());
        self.domain_cache.insert(key, entry.serialize()).await;
        Ok(domain)
    }

    /// Finds the most likely address of a named person at a domain.
    pub async fn email_finder(
        &self,
        domain: &str,
        first_name: &str,
        last_name: &str,
        company: Option<&str>,
    ) -> Result<Option<EmailFinderData>, AppError> {
        tracing::info!("Hunter email finder for {} {} @ {}", first_name, last_name, domain);
        let mut params = vec![
            ("domain", domain),
            ("first_name", first_name),
            ("last_name", last_name),
        ];
        if let Some(company) = company {
            params.push(("company", company));
        }
        let data = self
            .get::<EmailFinderData>("/email-finder", &params)
            .await?;
        Ok(data.filter(|d| d.email.is_some()))
    }

    pub async fn email_verifier(&self, email: &str) -> Result<Option<EmailVerifierData>, AppError> {
        tracing::info!("Hunter verifying {}", email);
        self.get::<EmailVerifierData>("/email-verifier", &[("email", email)])
            .await
    }

    /// Remaining domain searches on the account.
    pub async fn remaining_searches(&self) -> Result<i64, AppError> {
        let data = self.get::<HunterAccountData>("/account", &[]).await?;
        Ok(data.map(|d| d.requests.searches.available - d.requests.searches.used).unwrap_or(0))
    }
}

// ============ ZeroBounce ============

/// ZeroBounce email validation.
#[derive(Clone)]
pub struct ZeroBounceService {
    client: Client,
    base_url: String,
    bulk_base_url: String,
    api_key: String,
    gate: VendorGate,
}

impl ZeroBounceService {
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            bulk_base_url: base_url.clone(),
            base_url,
            api_key,
            gate: VendorGate::new("ZeroBounce", Duration::from_millis(200)),
        }
    }

    pub fn with_bulk_base_url(mut self, bulk_base_url: String) -> Self {
        self.bulk_base_url = bulk_base_url;
        self
    }

    pub fn from_config(config: &Config, client: &Client) -> Option<Self> {
        config.zerobounce_api_key.as_ref().map(|key| {
            Self::new(client.clone(), config.zerobounce_base_url.clone(), key.clone())
                .with_bulk_base_url(config.zerobounce_bulk_base_url.clone())
        })
    }

    pub async fn validate(&self, email: &str) -> Result<ZeroBounceResult, AppError> {
        let url = build_url(
            &self.base_url,
            "/validate",
            &[("api_key", self.api_key.as_str()), ("email", email), ("ip_address", "")],
        )?;
        tracing::info!("ZeroBounce validating {}", email);

        let response = self.gate.send(self.client.get(url)).await?;
        let response = error_for_status("ZeroBounce", response).await?;
        parse_json("ZeroBounce", response).await
    }

    pub async fn validate_batch(&self, emails: &[String]) -> Result<ZeroBounceBatchResponse, AppError> {
        let url = format!("{}/validatebatch", self.bulk_base_url);
        let body = serde_json::json!({
            "api_key": self.api_key,
            "email_batch": emails
                .iter()
                .map(|e| serde_json::json!({ "email_address": e }))
                .collect::<Vec<_>>(),
        });
        tracing::info!("ZeroBounce batch validating {} emails", emails.len());

        let response = self.gate.send(self.client.post(url).json(&body)).await?;
        let response = error_for_status("ZeroBounce", response).await?;
        parse_json("ZeroBounce", response).await
    }

    /// Remaining credits. ZeroBounce reports them as a string, `-1` on a bad key.
    pub async fn get_credits(&self) -> Result<i64, AppError> {
        let url = build_url(
            &self.base_url,
            "/getcredits",
            &[("api_key", self.api_key.as_str())],
        )?;
        let response = self.gate.send(self.client.get(url)).await?;
        let response = error_for_status("ZeroBounce", response).await?;
        let credits: ZeroBounceCredits = parse_json("ZeroBounce", response).await?;
        Ok(credits.credits.trim().parse::<i64>().unwrap_or(0).max(0))
    }
}

// ============ Serper ============

/// Google search through serper.dev, used to ground ice breakers.
#[derive(Clone)]
pub struct SerperService {
    client: Client,
    base_url: String,
    api_key: String,
    gate: VendorGate,
    cache: Cache<String, String>,
}

impl SerperService {
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            gate: VendorGate::new("Serper", Duration::from_millis(200)),
            cache: build_lookup_cache(),
        }
    }

    pub fn from_config(config: &Config, client: &Client) -> Option<Self> {
        config
            .serper_api_key
            .as_ref()
            .map(|key| Self::new(client.clone(), config.serper_base_url.clone(), key.clone()))
    }

    /// Returns `"title: snippet"` lines for a French-localised query.
    pub async fn search(&self, query: &str) -> Result<Vec<String>, AppError> {
        let key = format!("serper:{}", query);
        if let Some(cached) = self.cache.get(&key).await {
            if let Some(data) = ValidatedCacheEntry::deserialize_and_validate(&cached) {
                if let Ok(lines) = serde_json::from_str::<Vec<String>>(&data) {
                    tracing::debug!("Serper cache hit: {}", query);
                    return Ok(lines);
                }
            }
            self.cache.invalidate(&key).await;
        }

        tracing::info!("Serper search: {}", query);
        let body = serde_json::json!({ "q": query, "gl": "fr", "hl": "fr", "num": 5 });
        let request = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .json(&body);

        let response = self.gate.send(request).await?;
        let response = error_for_status("Serper", response).await?;
        let parsed: SerperResponse = parse_json("Serper", response).await?;
        let lines = parsed.snippets();

        let entry = ValidatedCacheEntry::new(serde_json::to_string(&lines)?);
        self.cache.insert(key, entry.serialize()).await;
        Ok(lines)
    }
}

// ============ Anthropic ============

/// Claude Messages API wrapper.
#[derive(Clone)]
pub struct AnthropicService {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    gate: VendorGate,
}

impl AnthropicService {
    pub fn new(client: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
            gate: VendorGate::new("Anthropic", Duration::from_millis(1000)),
        }
    }

    pub fn from_config(config: &Config, client: &Client) -> Option<Self> {
        config.anthropic_api_key.as_ref().map(|key| {
            Self::new(
                client.clone(),
                config.anthropic_base_url.clone(),
                key.clone(),
                config.anthropic_model.clone(),
            )
        })
    }

    /// Sends a single user turn and returns the first text block, trimmed.
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, AppError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        tracing::info!("Anthropic completion with {} ({} chars)", self.model, prompt.len());

        let request = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body);

        let response = self.gate.send(request).await?;
        let response = error_for_status("Anthropic", response).await?;
        let parsed: MessagesResponse = parse_json("Anthropic", response).await?;
        parsed
            .first_text()
            .ok_or_else(|| AppError::ExternalApiError("Anthropic returned no text".to_string()))
    }
}
