use crate::brevo_client::{BrevoClient, OutboundEmail};
use crate::config::Config;
use crate::db_storage::ProspectionStorage;
use crate::enrichment;
use crate::errors::AppError;
use crate::establishments;
use crate::icebreaker::{self, GeneratedIcebreaker, IcebreakerStatus};
use crate::models::*;
use crate::report::{self, MasterRunResponse};
use crate::sequence;
use crate::services::{
    build_http_client, AnthropicService, HunterService, SerperService, ZeroBounceService,
};
use crate::templating::{contact_variables, insert_icebreaker, render_template};
use crate::validation::{self, CreditsOverview};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    pub storage: ProspectionStorage,
    pub config: Config,
    /// Vendor clients. `None` when the vendor's API key is not configured.
    pub hunter: Option<HunterService>,
    pub zerobounce: Option<ZeroBounceService>,
    pub brevo: Option<BrevoClient>,
    pub anthropic: Option<AnthropicService>,
    pub serper: Option<SerperService>,
}

impl AppState {
    /// Builds every configured vendor client around one shared HTTP client.
    pub fn from_config(config: Config, db: PgPool) -> Result<Self, AppError> {
        let client = build_http_client()?;
        let state = Self {
            storage: ProspectionStorage::new(db.clone()),
            hunter: HunterService::from_config(&config, &client),
            zerobounce: ZeroBounceService::from_config(&config, &client),
            brevo: BrevoClient::from_config(&config, &client),
            anthropic: AnthropicService::from_config(&config, &client),
            serper: SerperService::from_config(&config, &client),
            config,
            db,
        };
        for (vendor, configured) in [
            ("Hunter", state.hunter.is_some()),
            ("ZeroBounce", state.zerobounce.is_some()),
            ("Brevo", state.brevo.is_some()),
            ("Anthropic", state.anthropic.is_some()),
            ("Serper", state.serper.is_some()),
        ] {
            if configured {
                tracing::info!("✓ {} client initialized", vendor);
            } else {
                tracing::warn!("{} API key not set, dependent steps will be skipped", vendor);
            }
        }
        Ok(state)
    }
}

/// Health check endpoint.
#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")), tag = "system")]
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-prospection-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

// ============ Cron steps ============

/// GET /api/cron/import-establishments
#[utoipa::path(get, path = "/api/cron/import-establishments", responses((status = 200, body = ImportResult)), tag = "cron")]
pub async fn cron_import_establishments(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ImportResult>, AppError> {
    tracing::info!("GET /api/cron/import-establishments");
    let records = establishments::embedded_dataset()?;
    let result = establishments::import_establishments(&state.storage, &records).await?;
    Ok(Json(result))
}

/// GET /api/cron/generate-contacts
#[utoipa::path(get, path = "/api/cron/generate-contacts", responses((status = 200, body = GenerateContactsResult)), tag = "cron")]
pub async fn cron_generate_contacts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GenerateContactsResult>, AppError> {
    tracing::info!("GET /api/cron/generate-contacts");
    let result =
        enrichment::generate_contacts(&state, report::CRON_CONTACT_GENERATION_LIMIT).await?;
    Ok(Json(result))
}

/// GET /api/cron/enrich-contacts
#[utoipa::path(get, path = "/api/cron/enrich-contacts", responses((status = 200, body = EnrichResult)), tag = "cron")]
pub async fn cron_enrich_contacts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EnrichResult>, AppError> {
    tracing::info!("GET /api/cron/enrich-contacts");
    let result = enrichment::enrich_contacts(&state, report::CRON_ENRICH_LIMIT).await?;
    Ok(Json(result))
}

/// GET /api/cron/validate-emails
#[utoipa::path(get, path = "/api/cron/validate-emails", responses((status = 200, body = ValidationResult)), tag = "cron")]
pub async fn cron_validate_emails(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ValidationResult>, AppError> {
    tracing::info!("GET /api/cron/validate-emails");
    Ok(Json(validation::validate_emails(&state).await?))
}

/// GET /api/cron/icebreakers
#[utoipa::path(get, path = "/api/cron/icebreakers", responses((status = 200, body = IcebreakerRunResult)), tag = "cron")]
pub async fn cron_icebreakers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IcebreakerRunResult>, AppError> {
    tracing::info!("GET /api/cron/icebreakers");
    Ok(Json(
        icebreaker::generate_bulk(&state, icebreaker::CRON_LIMIT).await?,
    ))
}

/// GET /api/cron/send-sequences
#[utoipa::path(
    get,
    path = "/api/cron/send-sequences",
    responses((status = 200, body = SequenceResult), (status = 400, description = "Templates missing")),
    tag = "cron"
)]
pub async fn cron_send_sequences(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SequenceResult>, AppError> {
    tracing::info!("GET /api/cron/send-sequences");
    Ok(Json(sequence::run(&state, Utc::now()).await?))
}

/// GET /api/cron/master
///
/// Runs every step in order and mails the daily report.
#[utoipa::path(get, path = "/api/cron/master", responses((status = 200, body = MasterRunResponse)), tag = "cron")]
pub async fn cron_master(State(state): State<Arc<AppState>>) -> Json<MasterRunResponse> {
    tracing::info!("GET /api/cron/master");
    Json(report::run_master(&state, report::STEP_PAUSE).await)
}

// ============ Contacts ============

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EnrichActionRequest {
    /// `find_domain`, `search_contacts`, `verify_email` or `bulk_create_contacts`
    pub action: String,
    pub establishment_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub email: Option<String>,
}

/// POST /api/contacts/enrich
#[utoipa::path(
    post,
    path = "/api/contacts/enrich",
    request_body = EnrichActionRequest,
    responses((status = 200, description = "Action result"), (status = 400, description = "Unknown action")),
    tag = "contacts"
)]
pub async fn contacts_enrich_action(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnrichActionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("POST /api/contacts/enrich - action: {}", request.action);

    match request.action.as_str() {
        "find_domain" => {
            let establishment = load_establishment(&state, request.establishment_id).await?;
            let domain = enrichment::resolve_domain(
                &state,
                establishment.id,
                &establishment.name,
                establishment.city.as_deref(),
                establishment.website.as_deref(),
            )
            .await?;
            Ok(Json(json!({ "domain": domain })))
        }
        "search_contacts" => {
            let establishment_id = request
                .establishment_id
                .ok_or_else(|| AppError::BadRequest("establishment_id required".to_string()))?;
            let outcome = enrichment::search_contacts(&state, establishment_id).await?;
            Ok(Json(serde_json::to_value(outcome)?))
        }
        "verify_email" => {
            let email = request
                .email
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| AppError::BadRequest("email required".to_string()))?;
            let verdict = validation::verify_single_email(&state, email).await?;
            if let Some(contact_id) = request.contact_id {
                let written = state
                    .storage
                    .record_validation(contact_id, verdict.status, &verdict.raw_status)
                    .await?;
                if written && verdict.status == EmailStatus::Valide {
                    state.storage.ensure_prospection(contact_id).await?;
                }
            }
            Ok(Json(serde_json::to_value(verdict)?))
        }
        "bulk_create_contacts" => {
            let result = enrichment::bulk_create_contacts(&state, 100).await?;
            Ok(Json(json!({
                "created": result.created,
                "establishments": result.establishments,
                "errors": result.errors,
            })))
        }
        other => Err(AppError::BadRequest(format!("Action non reconnue: {}", other))),
    }
}

async fn load_establishment(
    state: &AppState,
    id: Option<Uuid>,
) -> Result<Establishment, AppError> {
    let id = id.ok_or_else(|| AppError::BadRequest("establishment_id required".to_string()))?;
    state
        .storage
        .get_establishment(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Establishment {} not found", id)))
}

/// GET /api/contacts/enrich
#[utoipa::path(get, path = "/api/contacts/enrich", responses((status = 200, body = CreditsOverview)), tag = "contacts")]
pub async fn contacts_enrich_status(State(state): State<Arc<AppState>>) -> Json<CreditsOverview> {
    Json(validation::credits_overview(&state).await)
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct IcebreakerActionRequest {
    /// `generate` or `bulk_generate`
    pub action: String,
    pub contact_id: Option<Uuid>,
}

/// POST /api/contacts/icebreaker
#[utoipa::path(
    post,
    path = "/api/contacts/icebreaker",
    request_body = IcebreakerActionRequest,
    responses(
        (status = 200, body = GeneratedIcebreaker),
        (status = 400, description = "Unknown action"),
        (status = 404, description = "Contact not found")
    ),
    tag = "contacts"
)]
pub async fn icebreaker_action(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IcebreakerActionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("POST /api/contacts/icebreaker - action: {}", request.action);

    match request.action.as_str() {
        "generate" => {
            let contact_id = request
                .contact_id
                .ok_or_else(|| AppError::BadRequest("contact_id required".to_string()))?;
            let generated = icebreaker::generate_for_contact(&state, contact_id).await?;
            Ok(Json(serde_json::to_value(generated)?))
        }
        "bulk_generate" => {
            let result = icebreaker::generate_bulk(&state, icebreaker::BULK_ACTION_LIMIT).await?;
            Ok(Json(json!({
                "success": result.errors.is_empty() || result.generated > 0,
                "generated": result.generated,
                "processed": result.processed,
                "errors": result.errors,
            })))
        }
        other => Err(AppError::BadRequest(format!("Action non reconnue: {}", other))),
    }
}

/// GET /api/contacts/icebreaker
#[utoipa::path(get, path = "/api/contacts/icebreaker", responses((status = 200, body = IcebreakerStatus)), tag = "contacts")]
pub async fn icebreaker_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IcebreakerStatus>, AppError> {
    Ok(Json(icebreaker::status(&state).await?))
}

// ============ Emails ============

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SendEmailRequest {
    pub contact_id: Option<Uuid>,
    #[serde(default)]
    pub to_email: String,
    pub to_name: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub html_content: String,
    pub template_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub include_icebreaker: bool,
    #[serde(default = "default_true")]
    pub is_first_email: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SendEmailResponse {
    pub success: bool,
    pub message_id: String,
    pub email_id: Uuid,
    pub had_icebreaker: bool,
}

/// POST /api/emails/send
///
/// Sends one email outside the sequence and moves the prospection to `en_cours`.
#[utoipa::path(
    post,
    path = "/api/emails/send",
    request_body = SendEmailRequest,
    responses((status = 200, body = SendEmailResponse), (status = 400, description = "Missing fields")),
    tag = "emails"
)]
pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendEmailRequest>,
) -> Result<Json<SendEmailResponse>, AppError> {
    tracing::info!("POST /api/emails/send - to: {}", request.to_email);

    if request.to_email.trim().is_empty()
        || request.subject.trim().is_empty()
        || request.html_content.trim().is_empty()
    {
        return Err(AppError::BadRequest(
            "to_email, subject and html_content are required".to_string(),
        ));
    }
    let brevo = state
        .brevo
        .as_ref()
        .ok_or_else(|| AppError::VendorUnavailable("Brevo not configured".to_string()))?;

    let contact = match request.contact_id {
        Some(id) => Some(
            state
                .storage
                .get_contact(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Contact {} not found", id)))?,
        ),
        None => None,
    };

    let (subject, mut html) = match &contact {
        Some(c) => {
            let vars = contact_variables(c);
            (
                render_template(&request.subject, &vars),
                render_template(&request.html_content, &vars),
            )
        }
        None => (request.subject.clone(), request.html_content.clone()),
    };

    let icebreaker = contact
        .as_ref()
        .and_then(|c| c.icebreaker.as_deref())
        .filter(|i| request.include_icebreaker && request.is_first_email && !i.trim().is_empty());
    if let Some(text) = icebreaker {
        html = insert_icebreaker(&html, text);
    }
    let had_icebreaker = icebreaker.is_some();

    let message_id = brevo
        .send_email(&OutboundEmail {
            to_email: request.to_email.trim().to_string(),
            to_name: request.to_name.clone(),
            subject: subject.clone(),
            html_content: html,
            text_content: None,
            tags: Vec::new(),
            params: None,
        })
        .await?;

    let prospection_id = match request.contact_id {
        Some(contact_id) => Some(state.storage.record_manual_send(contact_id).await?),
        None => None,
    };

    let email_id = state
        .storage
        .insert_email_sent(&NewEmailSent {
            contact_id: request.contact_id,
            prospection_id,
            template_id: request.template_id,
            brevo_message_id: Some(message_id.clone()),
            subject,
            to_email: request.to_email.trim().to_string(),
            sequence_step: None,
            is_first_email: request.is_first_email,
            has_icebreaker: had_icebreaker,
        })
        .await?;

    tracing::info!("Manual email {} sent as {}", email_id, message_id);
    Ok(Json(SendEmailResponse {
        success: true,
        message_id,
        email_id,
        had_icebreaker,
    }))
}

// ============ Pipeline ============

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateProspectionRequest {
    pub status: Option<ProspectionStatus>,
    pub notes: Option<String>,
    pub next_action_at: Option<DateTime<Utc>>,
}

/// PATCH /api/prospection/:id
#[utoipa::path(
    patch,
    path = "/api/prospection/{id}",
    params(("id" = Uuid, Path, description = "Prospection id")),
    request_body = UpdateProspectionRequest,
    responses(
        (status = 200, body = Prospection),
        (status = 400, description = "Transition not allowed"),
        (status = 404, description = "Prospection not found")
    ),
    tag = "pipeline"
)]
pub async fn update_prospection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateProspectionRequest>,
) -> Result<Json<Prospection>, AppError> {
    tracing::info!("PATCH /api/prospection/{}", id);

    let current = state
        .storage
        .get_prospection(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Prospection {} not found", id)))?;

    if let Some(next) = request.status {
        let from = current.status().ok_or_else(|| {
            AppError::InternalError(format!("Unknown stored status '{}'", current.status))
        })?;
        if from != next && !from.can_transition_to(next) {
            return Err(AppError::BadRequest(format!(
                "Transition {} -> {} not allowed",
                from, next
            )));
        }
    }

    let updated = state
        .storage
        .update_prospection(
            id,
            request.status,
            request.notes.as_deref(),
            request.next_action_at,
        )
        .await?;
    Ok(Json(updated))
}

/// GET /api/stats
#[utoipa::path(get, path = "/api/stats", responses((status = 200, body = PipelineStats)), tag = "pipeline")]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<PipelineStats>, AppError> {
    Ok(Json(state.storage.pipeline_stats().await?))
}

/// GET /api/leads/hot
#[utoipa::path(get, path = "/api/leads/hot", responses((status = 200, body = [HotLead])), tag = "pipeline")]
pub async fn hot_leads(State(state): State<Arc<AppState>>) -> Result<Json<Vec<HotLead>>, AppError> {
    Ok(Json(state.storage.hot_leads(report::HOT_LEADS_LIMIT).await?))
}
