//! HTTP surface: route table, security layers and the OpenAPI document.

use crate::auth::require_cron_secret;
use crate::handlers::{self, AppState};
use crate::webhook_handler;
use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Maximum accepted request body, webhook batches included.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(OpenApi)]
#[openapi(
    info(title = "SoignantVoice Prospection API"),
    paths(
        crate::handlers::health,
        crate::handlers::cron_import_establishments,
        crate::handlers::cron_generate_contacts,
        crate::handlers::cron_enrich_contacts,
        crate::handlers::cron_validate_emails,
        crate::handlers::cron_icebreakers,
        crate::handlers::cron_send_sequences,
        crate::handlers::cron_master,
        crate::handlers::contacts_enrich_action,
        crate::handlers::contacts_enrich_status,
        crate::handlers::icebreaker_action,
        crate::handlers::icebreaker_status,
        crate::handlers::send_email,
        crate::handlers::update_prospection,
        crate::handlers::stats,
        crate::handlers::hot_leads,
        crate::webhook_handler::brevo_webhook,
        crate::webhook_handler::brevo_webhook_status,
    ),
    components(schemas(
        crate::models::EmailStatus,
        crate::models::ProspectionStatus,
        crate::models::DeliveryStatus,
        crate::models::Prospection,
        crate::models::ImportResult,
        crate::models::GenerateContactsResult,
        crate::models::EnrichResult,
        crate::models::ValidationResult,
        crate::models::IcebreakerRunResult,
        crate::models::SequenceSend,
        crate::models::SequenceResult,
        crate::models::HotLead,
        crate::models::PipelineStats,
        crate::handlers::EnrichActionRequest,
        crate::handlers::IcebreakerActionRequest,
        crate::handlers::SendEmailRequest,
        crate::handlers::SendEmailResponse,
        crate::handlers::UpdateProspectionRequest,
        crate::validation::HunterCredits,
        crate::validation::ZeroBounceCreditsStatus,
        crate::validation::CreditsOverview,
        crate::icebreaker::GeneratedIcebreaker,
        crate::icebreaker::IcebreakerApis,
        crate::icebreaker::IcebreakerStatus,
        crate::enrichment::CreatedContact,
        crate::enrichment::SearchContactsOutcome,
        crate::report::StepOutcome,
        crate::report::MasterReport,
        crate::report::MasterRunResponse,
        crate::webhook_models::WebhookResponse,
        crate::webhook_models::WebhookStatus,
    )),
    tags(
        (name = "system"),
        (name = "cron", description = "Pipeline steps triggered by the scheduler"),
        (name = "contacts", description = "Manual enrichment and ice breaker actions"),
        (name = "emails"),
        (name = "pipeline"),
        (name = "webhooks"),
    )
)]
pub struct ApiDoc;

/// Internal routes, gated by the cron secret.
fn internal_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/cron/import-establishments",
            get(handlers::cron_import_establishments),
        )
        .route(
            "/api/cron/generate-contacts",
            get(handlers::cron_generate_contacts),
        )
        .route("/api/cron/enrich-contacts", get(handlers::cron_enrich_contacts))
        .route("/api/cron/validate-emails", get(handlers::cron_validate_emails))
        .route("/api/cron/icebreakers", get(handlers::cron_icebreakers))
        .route("/api/cron/send-sequences", get(handlers::cron_send_sequences))
        .route("/api/cron/master", get(handlers::cron_master))
        .route(
            "/api/contacts/enrich",
            get(handlers::contacts_enrich_status).post(handlers::contacts_enrich_action),
        )
        .route(
            "/api/contacts/icebreaker",
            get(handlers::icebreaker_status).post(handlers::icebreaker_action),
        )
        .route("/api/emails/send", post(handlers::send_email))
        .route("/api/prospection/:id", patch(handlers::update_prospection))
        .route("/api/stats", get(handlers::stats))
        .route("/api/leads/hot", get(handlers::hot_leads))
        .route_layer(middleware::from_fn_with_state(state, require_cron_secret))
}

/// Builds the full application router.
///
/// `/health` bypasses rate limiting. Everything else shares the per-IP
/// limiter and the body size cap.
pub fn build_router(state: Arc<AppState>) -> anyhow::Result<Router> {
    // 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let limited_routes = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/api/webhooks/brevo",
            post(webhook_handler::brevo_webhook).get(webhook_handler::brevo_webhook_status),
        )
        .merge(internal_routes(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    Ok(Router::new()
        .route("/health", get(handlers::health))
        .merge(limited_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        for expected in [
            "/health",
            "/api/cron/master",
            "/api/contacts/enrich",
            "/api/contacts/icebreaker",
            "/api/emails/send",
            "/api/prospection/{id}",
            "/api/stats",
            "/api/leads/hot",
            "/api/webhooks/brevo",
        ] {
            assert!(
                paths.iter().any(|p| p.as_str() == expected),
                "missing {}",
                expected
            );
        }
    }

    #[test]
    fn webhook_path_has_both_methods() {
        let doc = ApiDoc::openapi();
        let item = &doc.paths.paths["/api/webhooks/brevo"];
        assert_eq!(item.operations.len(), 2);
    }
}
