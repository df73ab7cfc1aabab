//! Daily master run: every batch step in order, hot leads, then the e-mailed report.

use crate::brevo_client::OutboundEmail;
use crate::enrichment;
use crate::errors::AppError;
use crate::establishments;
use crate::handlers::AppState;
use crate::icebreaker;
use crate::models::HotLead;
use crate::sequence;
use crate::templating::escape_html;
use crate::validation;
use crate::vendor_models::BrevoAggregatedReport;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

pub const STEP_PAUSE: Duration = Duration::from_secs(2);
pub const HOT_LEADS_LIMIT: i64 = 10;
pub const CRON_CONTACT_GENERATION_LIMIT: i64 = 30;
pub const CRON_ENRICH_LIMIT: i64 = 20;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StepOutcome {
    pub name: String,
    /// `success`, `failed` or `error`
    pub status: String,
    #[schema(value_type = Object)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MasterReport {
    pub date: DateTime<Utc>,
    pub steps: Vec<StepOutcome>,
    pub total_new_prospects: usize,
    pub total_contacts_generated: usize,
    pub total_emails_enriched: usize,
    pub total_emails_validated: usize,
    pub total_icebreakers: usize,
    pub total_emails_sent: usize,
    /// Every email recorded in the last 24 hours, manual sends included.
    pub emails_sent_last_24h: Option<i64>,
    /// Brevo account statistics, when Brevo answered.
    #[schema(value_type = Option<Object>)]
    pub brevo_stats: Option<BrevoAggregatedReport>,
    pub hot_leads: Vec<HotLead>,
    pub errors: Vec<String>,
}

impl MasterReport {
    fn new(date: DateTime<Utc>) -> Self {
        Self {
            date,
            steps: Vec::new(),
            total_new_prospects: 0,
            total_contacts_generated: 0,
            total_emails_enriched: 0,
            total_emails_validated: 0,
            total_icebreakers: 0,
            total_emails_sent: 0,
            emails_sent_last_24h: None,
            brevo_stats: None,
            hot_leads: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Records a step and hands back its result when it ran.
    fn record<T: Serialize>(
        &mut self,
        name: &str,
        outcome: Result<T, AppError>,
        succeeded: impl Fn(&T) -> bool,
    ) -> Option<T> {
        match outcome {
            Ok(value) => {
                let status = if succeeded(&value) { "success" } else { "failed" };
                self.steps.push(StepOutcome {
                    name: name.to_string(),
                    status: status.to_string(),
                    details: serde_json::to_value(&value).unwrap_or(serde_json::Value::Null),
                });
                Some(value)
            }
            Err(e) => {
                tracing::error!("Master run step '{}' failed: {}", name, e);
                self.steps.push(StepOutcome {
                    name: name.to_string(),
                    status: "error".to_string(),
                    details: serde_json::Value::String(e.to_string()),
                });
                self.errors.push(format!("{}: {}", name, e));
                None
            }
        }
    }

    /// Every step errored: nothing ran, the run itself is broken.
    pub fn is_fatal(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == "error")
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MasterRunResponse {
    pub success: bool,
    pub duration_secs: u64,
    pub report: MasterReport,
}

/// Runs the whole pipeline in process, pausing `pause` between steps.
pub async fn run_master(state: &AppState, pause: Duration) -> MasterRunResponse {
    let started = Instant::now();
    let mut report = MasterReport::new(Utc::now());

    tracing::info!("Master run step 1: establishment import");
    let import = match establishments::embedded_dataset() {
        Ok(records) => establishments::import_establishments(&state.storage, &records).await,
        Err(e) => Err(e),
    };
    if let Some(r) = report.record("Import établissements", import, |r| r.errors.is_empty()) {
        report.total_new_prospects = r.new_establishments;
    }
    tokio::time::sleep(pause).await;

    tracing::info!("Master run step 2: contact generation");
    let generated = enrichment::generate_contacts(state, CRON_CONTACT_GENERATION_LIMIT).await;
    if let Some(r) = report.record("Génération contacts", generated, |r| r.errors.is_empty()) {
        report.total_contacts_generated = r.created;
    }
    tokio::time::sleep(pause).await;

    tracing::info!("Master run step 3: email discovery");
    let enriched = enrichment::enrich_contacts(state, CRON_ENRICH_LIMIT).await;
    if let Some(r) = report.record("Enrichissement emails", enriched, |r| {
        r.processed == 0 || r.enriched > 0 || r.errors.is_empty()
    }) {
        report.total_emails_enriched = r.enriched;
    }
    tokio::time::sleep(pause).await;

    tracing::info!("Master run step 4: email validation");
    let validated = validation::validate_emails(state).await;
    if let Some(r) = report.record("Validation emails", validated, |r| r.success) {
        report.total_emails_validated = r.valid;
    }
    tokio::time::sleep(pause).await;

    tracing::info!("Master run step 5: ice breakers");
    let icebreakers = icebreaker::generate_bulk(state, icebreaker::CRON_LIMIT).await;
    if let Some(r) = report.record("Ice breakers", icebreakers, |r| {
        r.processed == 0 || r.generated > 0
    }) {
        report.total_icebreakers = r.generated;
    }
    tokio::time::sleep(pause).await;

    tracing::info!("Master run step 6: sequences");
    let sent = sequence::run(state, Utc::now()).await;
    if let Some(r) = report.record("Envoi séquences", sent, |r| r.errors.is_empty()) {
        report.total_emails_sent = r.emails_sent;
    }

    match state.storage.hot_leads(HOT_LEADS_LIMIT).await {
        Ok(leads) => report.hot_leads = leads,
        Err(e) => report.errors.push(format!("Hot leads: {}", e)),
    }
    match state
        .storage
        .emails_sent_since(Utc::now() - ChronoDuration::hours(24))
        .await
    {
        Ok(count) => report.emails_sent_last_24h = Some(count),
        Err(e) => tracing::warn!("Could not count recent sends: {}", e),
    }
    if let Some(brevo) = &state.brevo {
        match brevo.aggregated_report().await {
            Ok(stats) => report.brevo_stats = Some(stats),
            Err(e) => tracing::warn!("Brevo statistics unavailable: {}", e),
        }
    }

    let duration_secs = started.elapsed().as_secs();
    let success = !report.is_fatal();
    if success {
        send_daily_report(state, &report, duration_secs).await;
    } else {
        send_error_alert(state, &report.errors.join("\n")).await;
    }

    tracing::info!(
        "Master run done in {}s: {} sent, {} hot leads, {} errors",
        duration_secs,
        report.total_emails_sent,
        report.hot_leads.len(),
        report.errors.len()
    );
    MasterRunResponse {
        success,
        duration_secs,
        report,
    }
}

fn lead_name(lead: &HotLead) -> String {
    let name = format!(
        "{} {}",
        lead.first_name.as_deref().unwrap_or_default(),
        lead.last_name.as_deref().unwrap_or_default()
    );
    let name = name.trim();
    if name.is_empty() {
        "Inconnu".to_string()
    } else {
        name.to_string()
    }
}

fn status_icon(status: &str) -> &'static str {
    match status {
        "success" => "✅",
        "failed" => "❌",
        _ => "⚠️",
    }
}

pub fn report_subject(report: &MasterReport) -> String {
    format!(
        "📊 SoignantVoice - {} emails envoyés | {} hot leads",
        report.total_emails_sent,
        report.hot_leads.len()
    )
}

pub fn render_report_html(report: &MasterReport, duration_secs: u64, app_url: &str) -> String {
    let hot_leads = if report.hot_leads.is_empty() {
        "<li>Aucun hot lead aujourd'hui</li>".to_string()
    } else {
        report
            .hot_leads
            .iter()
            .map(|lead| {
                format!(
                    "<li>🔥 <strong>{}</strong> - {} (score: {})</li>",
                    escape_html(&lead_name(lead)),
                    escape_html(&lead.establishment_name),
                    lead.score
                )
            })
            .collect()
    };

    let steps: String = report
        .steps
        .iter()
        .map(|step| {
            format!(
                r#"<tr><td style="padding: 8px; border-bottom: 1px solid #eee;">{}</td><td style="padding: 8px; border-bottom: 1px solid #eee;">{} {}</td></tr>"#,
                escape_html(&step.name),
                status_icon(&step.status),
                step.status
            )
        })
        .collect();

    let deliverability = match &report.brevo_stats {
        Some(stats) => format!(
            r#"<div style="background: #ecfdf5; border-radius: 8px; padding: 20px; margin: 20px 0;"><h2 style="margin-top: 0;">📬 Délivrabilité Brevo</h2><table style="width: 100%;"><tr><td>Délivrés</td><td><strong>{}</strong> / {}</td></tr><tr><td>Ouvertures uniques</td><td><strong>{}</strong></td></tr><tr><td>Clics uniques</td><td><strong>{}</strong></td></tr><tr><td>Bounces</td><td><strong>{}</strong></td></tr><tr><td>Désinscriptions</td><td><strong>{}</strong></td></tr></table></div>"#,
            stats.delivered,
            stats.requests,
            stats.unique_opens,
            stats.unique_clicks,
            stats.hard_bounces + stats.soft_bounces,
            stats.unsubscribed
        ),
        None => String::new(),
    };
    let sent_24h = report
        .emails_sent_last_24h
        .map(|n| format!("<tr><td>Emails sur 24h</td><td><strong>{}</strong></td></tr>", n))
        .unwrap_or_default();

    let errors = if report.errors.is_empty() {
        String::new()
    } else {
        let items: String = report
            .errors
            .iter()
            .map(|e| format!("<li>{}</li>", escape_html(e)))
            .collect();
        format!(
            r#"<div style="background: #fee2e2; border-radius: 8px; padding: 20px; margin: 20px 0;"><h2 style="margin-top: 0; color: #dc2626;">⚠️ Erreurs</h2><ul>{}</ul></div>"#,
            items
        )
    };

    format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
<h1 style="color: #7c3aed;">📊 Rapport SoignantVoice</h1>
<p style="color: #666;">Rapport automatique du {date}</p>
<div style="background: #f9fafb; border-radius: 8px; padding: 20px; margin: 20px 0;">
<h2 style="margin-top: 0;">📈 Résumé</h2>
<table style="width: 100%;">
<tr><td>Nouveaux établissements</td><td><strong>{new}</strong></td></tr>
<tr><td>Contacts générés</td><td><strong>{generated}</strong></td></tr>
<tr><td>Emails enrichis</td><td><strong>{enriched}</strong></td></tr>
<tr><td>Emails validés</td><td><strong>{validated}</strong></td></tr>
<tr><td>Ice breakers</td><td><strong>{icebreakers}</strong></td></tr>
<tr><td>Emails envoyés</td><td><strong>{sent}</strong></td></tr>
{sent_24h}
<tr><td>Durée totale</td><td><strong>{duration}s</strong></td></tr>
</table>
</div>
<div style="background: #fef3c7; border-radius: 8px; padding: 20px; margin: 20px 0;">
<h2 style="margin-top: 0;">🔥 Hot Leads à contacter</h2>
<ul>{hot_leads}</ul>
</div>
{deliverability}
<div style="margin: 20px 0;">
<h2>⚙️ Détail des étapes</h2>
<table style="width: 100%; border-collapse: collapse;">{steps}</table>
</div>
{errors}
<p style="color: #666; font-size: 12px; margin-top: 30px;"><a href="{app_url}">Ouvrir le dashboard</a></p>
</div>"#,
        date = report.date.format("%d/%m/%Y"),
        new = report.total_new_prospects,
        generated = report.total_contacts_generated,
        enriched = report.total_emails_enriched,
        validated = report.total_emails_validated,
        icebreakers = report.total_icebreakers,
        sent = report.total_emails_sent,
        sent_24h = sent_24h,
        duration = duration_secs,
        hot_leads = hot_leads,
        deliverability = deliverability,
        steps = steps,
        errors = errors,
        app_url = app_url,
    )
}

pub fn render_alert_html(message: &str, app_url: &str) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif;">
<h1 style="color: #dc2626;">🚨 Erreur dans l'automatisation</h1>
<p>Une erreur est survenue dans le CRON quotidien:</p>
<pre style="background: #f3f4f6; padding: 15px; border-radius: 8px;">{}</pre>
<p><a href="{}">Vérifier le dashboard</a></p>
</div>"#,
        escape_html(message),
        app_url
    )
}

async fn send_internal(state: &AppState, subject: String, html: String) {
    let Some(brevo) = &state.brevo else {
        tracing::warn!("Brevo not configured, report '{}' not sent", subject);
        return;
    };
    let email = OutboundEmail {
        to_email: state.config.report_recipient.clone(),
        to_name: None,
        subject,
        html_content: html,
        text_content: None,
        tags: vec!["soignantvoice".to_string(), "rapport".to_string()],
        params: None,
    };
    if let Err(e) = brevo.send_email(&email).await {
        tracing::error!("Failed to send report email: {}", e);
    }
}

pub async fn send_daily_report(state: &AppState, report: &MasterReport, duration_secs: u64) {
    let html = render_report_html(report, duration_secs, &state.config.app_url);
    send_internal(state, report_subject(report), html).await;
}

pub async fn send_error_alert(state: &AppState, message: &str) {
    let html = render_alert_html(message, &state.config.app_url);
    send_internal(
        state,
        "🚨 ERREUR SoignantVoice - Action requise".to_string(),
        html,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn lead(first: Option<&str>, opens: i32, clicks: i32) -> HotLead {
        HotLead {
            prospection_id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            first_name: first.map(str::to_string),
            last_name: None,
            role: "Directeur".into(),
            email: None,
            establishment_name: "EHPAD <Ham>".into(),
            city: None,
            phone: None,
            open_count: opens,
            click_count: clicks,
            score: HotLead::compute_score(opens, clicks),
        }
    }

    fn report() -> MasterReport {
        MasterReport::new(Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap())
    }

    #[test]
    fn step_statuses() {
        let mut r = report();
        let ok: Result<u32, AppError> = Ok(3);
        assert_eq!(r.record("a", ok, |v| *v > 0), Some(3));
        let failed: Result<u32, AppError> = Ok(0);
        r.record("b", failed, |v| *v > 0);
        let err: Result<u32, AppError> = Err(AppError::InternalError("boom".into()));
        assert_eq!(r.record("c", err, |_| true), None);

        let statuses: Vec<&str> = r.steps.iter().map(|s| s.status.as_str()).collect();
        assert_eq!(statuses, vec!["success", "failed", "error"]);
        assert_eq!(r.errors, vec!["c: Internal error: boom"]);
        assert!(!r.is_fatal());
    }

    #[test]
    fn all_errors_is_fatal() {
        let mut r = report();
        let err: Result<u32, AppError> = Err(AppError::InternalError("db".into()));
        r.record("a", err, |_| true);
        assert!(r.is_fatal());
        assert!(!report().is_fatal());
    }

    #[test]
    fn subject_counts() {
        let mut r = report();
        r.total_emails_sent = 12;
        r.hot_leads = vec![lead(Some("Anne"), 3, 0), lead(None, 0, 1)];
        assert_eq!(report_subject(&r), "📊 SoignantVoice - 12 emails envoyés | 2 hot leads");
    }

    #[test]
    fn html_lists_leads_escaped() {
        let mut r = report();
        r.hot_leads = vec![lead(None, 2, 1)];
        let html = render_report_html(&r, 42, "https://crm.example.fr");
        assert!(html.contains("<strong>Inconnu</strong> - EHPAD &lt;Ham&gt; (score: 45)"));
        assert!(html.contains("Rapport automatique du 02/05/2024"));
        assert!(html.contains("<strong>42s</strong>"));
        assert!(!html.contains("Erreurs"));
    }

    #[test]
    fn html_shows_brevo_stats_when_present() {
        let mut r = report();
        assert!(!render_report_html(&r, 1, "http://x").contains("Délivrabilité"));

        r.emails_sent_last_24h = Some(17);
        r.brevo_stats = Some(BrevoAggregatedReport {
            requests: 120,
            delivered: 115,
            hard_bounces: 2,
            soft_bounces: 3,
            unique_opens: 40,
            unique_clicks: 6,
            ..Default::default()
        });
        let html = render_report_html(&r, 1, "http://x");
        assert!(html.contains("<strong>115</strong> / 120"));
        assert!(html.contains("<td>Bounces</td><td><strong>5</strong>"));
        assert!(html.contains("<td>Emails sur 24h</td><td><strong>17</strong>"));
    }

    #[test]
    fn html_without_leads() {
        let html = render_report_html(&report(), 1, "http://localhost:3000");
        assert!(html.contains("Aucun hot lead aujourd'hui"));
    }

    #[test]
    fn alert_escapes_message() {
        let html = render_alert_html("relation <x> does not exist", "http://localhost:3000");
        assert!(html.contains("relation &lt;x&gt; does not exist"));
    }
}
