//! Email validation with ZeroBounce, Hunter's verifier as fallback.

use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{ContactWithEstablishment, EmailStatus, ValidationResult};
use crate::vendor_models::{map_hunter_verification, ZeroBounceResult};
use bigdecimal::BigDecimal;
use serde::Serialize;
use std::collections::HashMap;
use utoipa::ToSchema;

pub const VALIDATION_BATCH_LIMIT: i64 = 25;
pub const MIN_ZEROBOUNCE_CREDITS: i64 = 5;

/// ZeroBounce list price of one validation, in euros.
pub fn cost_per_validation() -> BigDecimal {
    BigDecimal::from(8) / BigDecimal::from(1000)
}

/// Cost of validating `count` addresses, rounded to cents.
pub fn estimate_cost(count: i64) -> BigDecimal {
    (cost_per_validation() * BigDecimal::from(count)).with_scale(2)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub email: String,
    pub status: EmailStatus,
    /// Vendor's own status string, stored as the validation result.
    pub raw_status: String,
    pub provider: &'static str,
}

fn zerobounce_verdict(email: &str, result: ZeroBounceResult) -> Verdict {
    Verdict {
        email: email.to_string(),
        status: result.email_status(),
        raw_status: result.status,
        provider: "zerobounce",
    }
}

async fn verify_with_zerobounce(state: &AppState, email: &str) -> Option<Result<Verdict, AppError>> {
    let zerobounce = state.zerobounce.as_ref()?;
    Some(
        zerobounce
            .validate(email)
            .await
            .map(|result| zerobounce_verdict(email, result)),
    )
}

/// Validates a whole batch in one ZeroBounce call, keyed by lower-cased address.
/// Empty when ZeroBounce is missing or the call fails; callers then go one by one.
pub async fn prevalidate_batch(state: &AppState, emails: &[String]) -> HashMap<String, Verdict> {
    let Some(zerobounce) = state.zerobounce.as_ref() else {
        return HashMap::new();
    };
    if emails.len() < 2 {
        return HashMap::new();
    }
    match zerobounce.validate_batch(emails).await {
        Ok(batch) => {
            for error in &batch.errors {
                tracing::warn!(
                    "ZeroBounce batch error for {:?}: {}",
                    error.email_address,
                    error.error
                );
            }
            batch
                .email_batch
                .into_iter()
                .map(|result| {
                    let key = result.address.trim().to_lowercase();
                    (key.clone(), zerobounce_verdict(&key, result))
                })
                .collect()
        }
        Err(e) => {
            tracing::warn!("ZeroBounce batch failed, validating one by one: {}", e);
            HashMap::new()
        }
    }
}

async fn verify_with_hunter(state: &AppState, email: &str) -> Result<Verdict, AppError> {
    let hunter = state
        .hunter
        .as_ref()
        .ok_or_else(|| AppError::VendorUnavailable("no email validator configured".to_string()))?;
    let data = hunter
        .email_verifier(email)
        .await?
        .ok_or_else(|| AppError::ExternalApiError(format!("Hunter has no verdict for {}", email)))?;
    Ok(Verdict {
        email: email.to_string(),
        status: map_hunter_verification(&data.result, data.score),
        raw_status: data.result,
        provider: "hunter",
    })
}

/// ZeroBounce verdict, or Hunter's when ZeroBounce is missing or failing.
pub async fn verify_single_email(state: &AppState, email: &str) -> Result<Verdict, AppError> {
    match verify_with_zerobounce(state, email).await {
        Some(Ok(verdict)) => Ok(verdict),
        Some(Err(e)) if state.hunter.is_some() => {
            tracing::warn!("ZeroBounce failed for {}, falling back to Hunter: {}", email, e);
            verify_with_hunter(state, email).await
        }
        Some(Err(e)) => Err(e),
        None => verify_with_hunter(state, email).await,
    }
}

/// Validates the pending addresses and opens a prospection for each valid one.
pub async fn validate_emails(state: &AppState) -> Result<ValidationResult, AppError> {
    let mut result = ValidationResult::default();

    if state.zerobounce.is_none() && state.hunter.is_none() {
        result.message = Some("no email validator configured".to_string());
        result.errors.push("ZeroBounce not configured".to_string());
        return Ok(result);
    }

    let mut limit = VALIDATION_BATCH_LIMIT;
    if let Some(zerobounce) = &state.zerobounce {
        match zerobounce.get_credits().await {
            Ok(credits) => {
                result.credits_remaining = Some(credits);
                if credits < MIN_ZEROBOUNCE_CREDITS {
                    tracing::warn!("ZeroBounce credits too low: {}", credits);
                    result.message = Some("not enough ZeroBounce credits".to_string());
                    return Ok(result);
                }
                limit = limit.min(credits);
            }
            Err(e) => {
                tracing::warn!("ZeroBounce credits unavailable: {}", e);
                result.errors.push(format!("ZeroBounce credits: {}", e));
            }
        }
    }

    let contacts = state.storage.contacts_to_validate(limit).await?;
    tracing::info!("Validating {} emails", contacts.len());

    let emails: Vec<String> = contacts.iter().filter_map(|c| c.email.clone()).collect();
    let mut prevalidated = prevalidate_batch(state, &emails).await;

    for contact in &contacts {
        let Some(email) = contact.email.as_deref() else {
            continue;
        };
        result.processed += 1;
        let known = prevalidated.remove(&email.trim().to_lowercase());
        match validate_contact(state, contact, email, known).await {
            Ok(Some(status)) => match status {
                EmailStatus::Valide => result.valid += 1,
                EmailStatus::Invalide => result.invalid += 1,
                _ => result.risky += 1,
            },
            Ok(None) => {}
            Err(e) => {
                result.errors.push(format!("{}: {}", email, e));
                if e.is_vendor_down() {
                    tracing::warn!("Stopping validation batch: {}", e);
                    break;
                }
            }
        }
    }

    result.success = true;
    result.message = Some(if contacts.is_empty() {
        "no emails to validate".to_string()
    } else {
        "validation completed".to_string()
    });
    tracing::info!(
        "Validation done: {} processed, {} valid, {} invalid, {} risky",
        result.processed,
        result.valid,
        result.invalid,
        result.risky
    );
    Ok(result)
}

/// `None` when another run already moved the contact.
async fn validate_contact(
    state: &AppState,
    contact: &ContactWithEstablishment,
    email: &str,
    known: Option<Verdict>,
) -> Result<Option<EmailStatus>, AppError> {
    let verdict = match known {
        Some(verdict) => verdict,
        None => verify_single_email(state, email).await?,
    };
    let written = state
        .storage
        .record_validation(contact.id, verdict.status, &verdict.raw_status)
        .await?;
    if !written {
        tracing::debug!("Contact {} no longer pending validation", contact.id);
        return Ok(None);
    }
    if verdict.status == EmailStatus::Valide {
        state.storage.ensure_prospection(contact.id).await?;
    }
    Ok(Some(verdict.status))
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HunterCredits {
    pub available: bool,
    pub credits: Option<i64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ZeroBounceCreditsStatus {
    pub available: bool,
    pub credits: Option<i64>,
    /// Euros, two decimals.
    #[schema(value_type = String)]
    pub estimated_cost_per_100: BigDecimal,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CreditsOverview {
    pub hunter: HunterCredits,
    pub zerobounce: ZeroBounceCreditsStatus,
}

/// Remaining vendor credits. Lookup failures show as `null` credits.
pub async fn credits_overview(state: &AppState) -> CreditsOverview {
    let hunter_credits = match &state.hunter {
        Some(hunter) => hunter
            .remaining_searches()
            .await
            .map_err(|e| tracing::warn!("Hunter account lookup failed: {}", e))
            .ok(),
        None => None,
    };
    let zerobounce_credits = match &state.zerobounce {
        Some(zerobounce) => zerobounce
            .get_credits()
            .await
            .map_err(|e| tracing::warn!("ZeroBounce credits lookup failed: {}", e))
            .ok(),
        None => None,
    };

    CreditsOverview {
        hunter: HunterCredits {
            available: state.hunter.is_some(),
            credits: hunter_credits,
        },
        zerobounce: ZeroBounceCreditsStatus {
            available: state.zerobounce.is_some(),
            credits: zerobounce_credits,
            estimated_cost_per_100: estimate_cost(100),
        },
    }
}
