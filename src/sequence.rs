//! Four-step drip sequence: day 0 with the ice breaker, then days 3, 7 and 14.

use crate::brevo_client::OutboundEmail;
use crate::db_storage::SequenceCandidate;
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::*;
use crate::templating::{contact_variables, html_to_text, insert_icebreaker, render_template};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub const SEQUENCE_STEPS: i32 = 4;
/// Day offsets from the sequence start, step 1 first.
pub const DEFAULT_DELAYS: [i64; 4] = [0, 3, 7, 14];
pub const MAX_SENDS_PER_RUN: usize = 50;
pub const MAX_NEW_STARTS_PER_RUN: usize = 25;

/// Templates indexed by step, complete only when all four steps exist.
#[derive(Debug, Clone)]
pub struct SequencePlan {
    templates: Vec<EmailTemplate>,
}

impl SequencePlan {
    pub fn from_templates(mut templates: Vec<EmailTemplate>) -> Result<Self, AppError> {
        templates.retain(|t| (1..=SEQUENCE_STEPS).contains(&t.step_number));
        templates.sort_by_key(|t| t.step_number);
        templates.dedup_by_key(|t| t.step_number);
        if templates.len() < SEQUENCE_STEPS as usize {
            return Err(AppError::BadRequest("4 templates required".to_string()));
        }
        Ok(Self { templates })
    }

    pub fn template(&self, step: i32) -> Option<&EmailTemplate> {
        self.templates.iter().find(|t| t.step_number == step)
    }

    /// Days between the sequence start and `step`.
    pub fn delay_days(&self, step: i32) -> i64 {
        let fallback = usize::try_from(step - 1)
            .ok()
            .and_then(|i| DEFAULT_DELAYS.get(i).copied())
            .unwrap_or(0);
        self.template(step)
            .map(|t| i64::from(t.delay_days))
            .filter(|d| *d >= 0)
            .unwrap_or(fallback)
    }

    /// When the step after `sent_step` is due. `None` once the last step went out.
    pub fn next_contact_at(&self, started_at: DateTime<Utc>, sent_step: i32) -> Option<DateTime<Utc>> {
        if sent_step >= SEQUENCE_STEPS {
            return None;
        }
        Some(started_at + Duration::days(self.delay_days(sent_step + 1)))
    }
}

/// Rendered subject, HTML and text of one step for one contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
    pub has_icebreaker: bool,
}

pub fn compose(
    template: &EmailTemplate,
    contact: &ContactWithEstablishment,
    with_icebreaker: bool,
) -> ComposedEmail {
    let vars = contact_variables(contact);
    let mut html = render_template(&template.body_html, &vars);
    let icebreaker = contact
        .icebreaker
        .as_deref()
        .filter(|i| with_icebreaker && !i.trim().is_empty());
    if let Some(icebreaker) = icebreaker {
        html = insert_icebreaker(&html, icebreaker);
    }
    ComposedEmail {
        subject: render_template(&template.subject, &vars),
        text: html_to_text(&html),
        html,
        has_icebreaker: icebreaker.is_some(),
    }
}

fn recipient_name(contact: &ContactWithEstablishment) -> Option<String> {
    let name = format!(
        "{} {}",
        contact.first_name.as_deref().unwrap_or_default(),
        contact.last_name.as_deref().unwrap_or_default()
    );
    Some(name.trim().to_string()).filter(|n| !n.is_empty())
}

/// What became of one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Sent(Uuid),
    /// The step was no longer ours to send.
    Skipped,
}

/// Claims one step, sends it and records it.
async fn send_step(
    state: &AppState,
    plan: &SequencePlan,
    candidate: &SequenceCandidate,
    prospection_id: Uuid,
    step: i32,
    now: DateTime<Utc>,
) -> Result<StepOutcome, AppError> {
    let brevo = state
        .brevo
        .as_ref()
        .ok_or_else(|| AppError::VendorUnavailable("Brevo not configured".to_string()))?;
    let contact = &candidate.contact;
    let to_email = contact
        .email
        .clone()
        .ok_or_else(|| AppError::BadRequest(format!("contact {} has no email", contact.id)))?;
    let template = plan
        .template(step)
        .ok_or_else(|| AppError::InternalError(format!("no template for step {}", step)))?;

    let started_at = candidate.sequence_started_at.unwrap_or(now);
    let claimed = state
        .storage
        .claim_sequence_step(
            prospection_id,
            step,
            now,
            plan.next_contact_at(started_at, step),
            step >= SEQUENCE_STEPS,
        )
        .await?;
    if !claimed {
        tracing::info!("Step {} for {} already taken, skipping", step, to_email);
        return Ok(StepOutcome::Skipped);
    }

    if step == 1 {
        if let Err(e) = brevo
            .upsert_contact(
                &to_email,
                contact.first_name.as_deref(),
                contact.last_name.as_deref(),
                &[],
            )
            .await
        {
            tracing::warn!("Brevo contact upsert failed for {}: {}", to_email, e);
        }
    }

    let composed = compose(template, contact, step == 1);
    let sent = brevo
        .send_email(&OutboundEmail {
            to_email: to_email.clone(),
            to_name: recipient_name(contact),
            subject: composed.subject.clone(),
            html_content: composed.html,
            text_content: Some(composed.text),
            tags: vec![
                "soignantvoice".to_string(),
                "sequence".to_string(),
                format!("step-{}", step),
            ],
            params: None,
        })
        .await;
    let message_id = match sent {
        Ok(message_id) => message_id,
        Err(e) => {
            if let Err(release) = state
                .storage
                .release_sequence_step(prospection_id, step, now)
                .await
            {
                tracing::error!("Could not release step {} for {}: {}", step, to_email, release);
            }
            return Err(e);
        }
    };

    let email_id = state
        .storage
        .insert_email_sent(&NewEmailSent {
            contact_id: Some(contact.id),
            prospection_id: Some(prospection_id),
            template_id: Some(template.id),
            brevo_message_id: Some(message_id),
            subject: composed.subject,
            to_email,
            sequence_step: Some(step),
            is_first_email: step == 1,
            has_icebreaker: composed.has_icebreaker,
        })
        .await?;
    state.storage.record_step_sent(prospection_id, now).await?;
    Ok(StepOutcome::Sent(email_id))
}

fn has_stopped(candidate: &SequenceCandidate) -> bool {
    candidate
        .prospection_status
        .as_deref()
        .and_then(|s| s.parse::<ProspectionStatus>().ok())
        .is_some_and(|s| s.stops_sequence())
}

/// Starts new sequences and sends the follow-ups that are due.
pub async fn run(state: &AppState, now: DateTime<Utc>) -> Result<SequenceResult, AppError> {
    let mut result = SequenceResult::default();
    if state.brevo.is_none() {
        result.errors.push("Brevo not configured".to_string());
        return Ok(result);
    }
    let plan = SequencePlan::from_templates(state.storage.templates().await?)?;

    let starts = state
        .storage
        .sequence_start_candidates(MAX_NEW_STARTS_PER_RUN as i64)
        .await?;
    result.checked += starts.len();
    tracing::info!("Sequence run: {} new starts to send", starts.len());

    for candidate in &starts {
        if has_stopped(candidate) {
            continue;
        }
        let contact = &candidate.contact;
        let outcome: Result<StepOutcome, AppError> = async {
            let prospection_id = match candidate.prospection_id {
                Some(id) => id,
                None => state.storage.ensure_prospection(contact.id).await?,
            };
            send_step(state, &plan, candidate, prospection_id, 1, now).await
        }
        .await;
        if !record_outcome(&mut result, candidate, 1, "new", outcome) {
            break;
        }
    }

    let remaining = MAX_SENDS_PER_RUN.saturating_sub(result.emails_sent);
    if remaining > 0 {
        let followups = state
            .storage
            .sequence_followups_due(now, remaining as i64)
            .await?;
        result.checked += followups.len();
        tracing::info!("Sequence run: {} follow-ups due", followups.len());

        for candidate in &followups {
            let (Some(prospection_id), Some(current)) =
                (candidate.prospection_id, candidate.sequence_step)
            else {
                continue;
            };
            if has_stopped(candidate) {
                continue;
            }
            let step = current + 1;
            let outcome = send_step(state, &plan, candidate, prospection_id, step, now).await;
            if !record_outcome(&mut result, candidate, step, "followup", outcome) {
                break;
            }
        }
    }

    tracing::info!(
        "Sequence run done: {} checked, {} sent, {} skipped, {} errors",
        result.checked,
        result.emails_sent,
        result.skipped,
        result.errors.len()
    );
    Ok(result)
}

/// Tallies one send. Returns false when the batch should stop.
fn record_outcome(
    result: &mut SequenceResult,
    candidate: &SequenceCandidate,
    step: i32,
    kind: &str,
    outcome: Result<StepOutcome, AppError>,
) -> bool {
    let email = candidate.contact.email.clone().unwrap_or_default();
    match outcome {
        Ok(StepOutcome::Skipped) => {
            result.skipped += 1;
            true
        }
        Ok(StepOutcome::Sent(_)) => {
            result.emails_sent += 1;
            result.details.push(SequenceSend {
                contact_id: candidate.contact.id,
                email,
                step,
                kind: kind.to_string(),
            });
            true
        }
        Err(e) => {
            result.errors.push(format!("{}: {}", email, e));
            if e.is_vendor_down() {
                tracing::warn!("Stopping sequence run: {}", e);
                return false;
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn template(step: i32, delay: i32) -> EmailTemplate {
        EmailTemplate {
            id: Uuid::new_v4(),
            step_number: step,
            delay_days: delay,
            name: format!("step {}", step),
            subject: "{{nom_etablissement}} : vos transmissions".to_string(),
            body_html: "<p>Bonjour {{prenom}},</p><p>Pour {{type_etablissement}} à {{ville}}.</p>"
                .to_string(),
        }
    }

    fn full_plan() -> SequencePlan {
        SequencePlan::from_templates(vec![
            template(4, 14),
            template(1, 0),
            template(3, 7),
            template(2, 3),
        ])
        .unwrap()
    }

    fn contact(icebreaker: Option<&str>) -> ContactWithEstablishment {
        ContactWithEstablishment {
            id: Uuid::new_v4(),
            establishment_id: Uuid::new_v4(),
            role: "Directeur".into(),
            first_name: Some("Anne".into()),
            last_name: None,
            email: Some("anne@ehpad.fr".into()),
            email_status: "valide".into(),
            icebreaker: icebreaker.map(str::to_string),
            establishment_name: "EHPAD Ham".into(),
            establishment_category: "EHPAD".into(),
            city: Some("Ham".into()),
            website: None,
        }
    }

    #[test]
    fn plan_requires_four_steps() {
        let err = SequencePlan::from_templates(vec![template(1, 0), template(2, 3), template(3, 7)])
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(ref m) if m == "4 templates required"));
    }

    #[test]
    fn schedule_is_counted_from_start() {
        let plan = full_plan();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(plan.next_contact_at(start, 1), Some(start + Duration::days(3)));
        assert_eq!(plan.next_contact_at(start, 2), Some(start + Duration::days(7)));
        assert_eq!(plan.next_contact_at(start, 3), Some(start + Duration::days(14)));
        assert_eq!(plan.next_contact_at(start, 4), None);
    }

    #[test]
    fn negative_delay_falls_back_to_default() {
        let plan = SequencePlan::from_templates(vec![
            template(1, 0),
            template(2, -1),
            template(3, 7),
            template(4, 14),
        ])
        .unwrap();
        assert_eq!(plan.delay_days(2), 3);
    }

    #[test]
    fn first_step_carries_icebreaker() {
        let plan = full_plan();
        let c = contact(Some("Bravo pour la rénovation."));
        let first = compose(plan.template(1).unwrap(), &c, true);
        assert!(first.has_icebreaker);
        assert_eq!(first.subject, "EHPAD Ham : vos transmissions");
        assert!(first
            .html
            .starts_with("<p>Bonjour Anne,</p><p style=\"color: #374151; margin-bottom: 16px;\">Bravo pour la rénovation.</p>"));
        assert!(first.text.contains("Pour EHPAD à Ham."));

        let followup = compose(plan.template(2).unwrap(), &c, false);
        assert!(!followup.has_icebreaker);
        assert!(!followup.html.contains("rénovation"));
    }

    fn candidate() -> SequenceCandidate {
        SequenceCandidate {
            contact: contact(None),
            prospection_id: Some(Uuid::new_v4()),
            sequence_step: Some(1),
            sequence_started_at: None,
            prospection_status: Some("en_cours".into()),
        }
    }

    #[test]
    fn skipped_step_is_counted_and_batch_goes_on() {
        let mut result = SequenceResult::default();
        assert!(record_outcome(&mut result, &candidate(), 2, "followup", Ok(StepOutcome::Skipped)));
        assert_eq!(result.skipped, 1);
        assert_eq!(result.emails_sent, 0);
        assert!(result.details.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn vendor_outage_stops_the_batch() {
        let mut result = SequenceResult::default();
        let keep_going = record_outcome(
            &mut result,
            &candidate(),
            1,
            "new",
            Err(AppError::VendorUnavailable("Brevo circuit open".into())),
        );
        assert!(!keep_going);
        assert_eq!(result.errors, vec!["anne@ehpad.fr: Vendor unavailable: Brevo circuit open".to_string()]);
    }

    #[test]
    fn stopped_prospects_are_detected() {
        let mut c = candidate();
        assert!(!has_stopped(&c));
        c.prospection_status = Some("pas_interesse".into());
        assert!(has_stopped(&c));
        c.prospection_status = Some("client".into());
        assert!(has_stopped(&c));
    }

    #[test]
    fn blank_icebreaker_is_ignored() {
        let plan = full_plan();
        let out = compose(plan.template(1).unwrap(), &contact(Some("  ")), true);
        assert!(!out.has_icebreaker);
    }
}
