/// Batch workflows against a real Postgres with mocked vendors.
/// Ignored by default; point TEST_DATABASE_URL at a dedicated database to run them.
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{Duration, SubsecRound, Utc};
use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rust_prospection_api::api::build_router;
use rust_prospection_api::config::Config;
use rust_prospection_api::db::Database;
use rust_prospection_api::db_storage::{NewEstablishment, ProspectionStorage};
use rust_prospection_api::handlers::AppState;
use rust_prospection_api::models::{
    EmailStatus, EstablishmentCategory, NewContact, NewEmailSent, ProspectionStatus,
};
use rust_prospection_api::sequence::{self, MAX_NEW_STARTS_PER_RUN, MAX_SENDS_PER_RUN};
use rust_prospection_api::validation::validate_emails;

fn database_url() -> anyhow::Result<String> {
    env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))
}

async fn state_with(config: Config) -> anyhow::Result<AppState> {
    let db = Database::new(&config.database_url).await?;
    db.migrate().await?;
    Ok(AppState::from_config(config, db.pool.clone())?)
}

/// One establishment with one contact, named uniquely so runs never collide.
async fn seed_contact(
    storage: &ProspectionStorage,
    label: &str,
    email: &str,
    status: EmailStatus,
) -> anyhow::Result<Uuid> {
    let establishment_id = storage
        .insert_establishment(&NewEstablishment {
            name: format!("EHPAD {}", label),
            category: EstablishmentCategory::Ehpad,
            city: "Ham".to_string(),
            postal_code: "80400".to_string(),
            department: "Somme".to_string(),
            region: "Hauts-de-France".to_string(),
            phone: None,
            website: Some("https://www.ehpad-test.fr".to_string()),
        })
        .await?
        .ok_or_else(|| anyhow::anyhow!("establishment {} already exists", label))?;
    let contact_id = storage
        .insert_contact(&NewContact {
            establishment_id,
            role: "Directeur".to_string(),
            first_name: Some("Claire".to_string()),
            last_name: Some("Martin".to_string()),
            email: Some(email.to_string()),
            email_status: status,
            source: "test".to_string(),
        })
        .await?;
    Ok(contact_id)
}

fn webhook_post(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/webhooks/brevo")
        .header("x-forwarded-for", "203.0.113.9")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
#[ignore]
async fn claimed_step_is_sent_at_most_once() -> anyhow::Result<()> {
    let state = state_with(Config::for_tests(&database_url()?)).await?;
    let storage = &state.storage;
    let suffix = Uuid::new_v4().simple().to_string();

    let contact_id = seed_contact(
        storage,
        &format!("Claim {}", suffix),
        &format!("claim.{}@ehpad-test.fr", &suffix[..8]),
        EmailStatus::Valide,
    )
    .await?;
    let prospection_id = storage.ensure_prospection(contact_id).await?;
    let now = Utc::now();

    // A second run reaching the same candidate loses the race
    assert!(storage.claim_sequence_step(prospection_id, 1, now, None, false).await?);
    assert!(!storage.claim_sequence_step(prospection_id, 1, now, None, false).await?);
    // Steps cannot be skipped
    assert!(!storage.claim_sequence_step(prospection_id, 3, now, None, false).await?);
    assert!(storage.claim_sequence_step(prospection_id, 2, now, None, false).await?);

    // A failed send hands the step back and leaves it due again
    let retry_at = now + Duration::days(365);
    storage.release_sequence_step(prospection_id, 2, retry_at).await?;
    let released = storage
        .get_prospection(prospection_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("prospection missing"))?;
    assert_eq!(released.sequence_step, 1);
    assert_eq!(released.next_contact_at.map(|t| t.timestamp()), Some(retry_at.timestamp()));
    assert_eq!(released.status(), Some(ProspectionStatus::EnCours));

    // Status changed between selection and send
    storage
        .update_prospection(prospection_id, Some(ProspectionStatus::PasInteresse), None, None)
        .await?;
    assert!(!storage.claim_sequence_step(prospection_id, 2, now, None, false).await?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn sequence_runs_through_all_four_steps() -> anyhow::Result<()> {
    let brevo = MockServer::start().await;
    let suffix = Uuid::new_v4().simple().to_string();
    let failing_email = format!("bounce.{}@ehpad-test.fr", &suffix[..8]);

    Mock::given(method("POST"))
        .and(path("/smtp/email"))
        .and(body_partial_json(serde_json::json!({"to": [{"email": failing_email}]})))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid recipient"))
        .with_priority(1)
        .mount(&brevo)
        .await;
    Mock::given(method("POST"))
        .and(path("/smtp/email"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "messageId": format!("<{}@smtp-relay.test>", suffix)
        })))
        .mount(&brevo)
        .await;
    Mock::given(method("POST"))
        .and(path("/contacts"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&brevo)
        .await;

    let mut config = Config::for_tests(&database_url()?);
    config.brevo_api_key = Some("brevo_key".to_string());
    config.brevo_base_url = brevo.uri();
    let state = state_with(config).await?;
    let storage = &state.storage;

    let mut ours = Vec::new();
    for i in 0..30 {
        let contact_id = seed_contact(
            storage,
            &format!("Sequence {} {}", suffix, i),
            &format!("dir{}.{}@ehpad-test.fr", i, &suffix[..8]),
            EmailStatus::Valide,
        )
        .await?;
        storage
            .save_icebreaker(contact_id, "Bravo pour la rénovation du jardin.", "test")
            .await?;
        ours.push(contact_id);
    }
    // Seeded last so it sits behind every other new start
    let failing = seed_contact(
        storage,
        &format!("Sequence {} bounce", suffix),
        &failing_email,
        EmailStatus::Valide,
    )
    .await?;
    storage
        .save_icebreaker(failing, "Bravo pour le projet.", "test")
        .await?;
    let our_ids: HashSet<Uuid> = ours.iter().copied().collect();

    let start = Utc::now().trunc_subsecs(0);

    let first = sequence::run(&state, start).await?;
    let new_starts = first.details.iter().filter(|d| d.kind == "new").count();
    assert_eq!(new_starts, MAX_NEW_STARTS_PER_RUN);
    assert!(first.emails_sent <= MAX_SENDS_PER_RUN);

    // Drain the remaining new starts
    for _ in 0..10 {
        let run = sequence::run(&state, start).await?;
        assert!(run.emails_sent <= MAX_SENDS_PER_RUN);
        if run.details.iter().all(|d| d.kind != "new") {
            assert!(run.errors.iter().any(|e| e.contains(&failing_email)));
            break;
        }
    }

    let mut prospections = Vec::new();
    for contact_id in &ours {
        let id = storage.ensure_prospection(*contact_id).await?;
        let p = storage
            .get_prospection(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("prospection missing"))?;
        assert_eq!(p.sequence_step, 1);
        assert_eq!(p.status(), Some(ProspectionStatus::EnCours));
        assert_eq!(p.sequence_started_at, Some(start));
        assert_eq!(p.next_contact_at, Some(start + Duration::days(3)));
        assert_eq!(p.emails_sent_count, 1);
        prospections.push(id);
    }

    // The failed first send was handed back
    let failing_prospection = storage.ensure_prospection(failing).await?;
    let released = storage
        .get_prospection(failing_prospection)
        .await?
        .ok_or_else(|| anyhow::anyhow!("prospection missing"))?;
    assert_eq!(released.sequence_step, 0);
    assert_eq!(released.status(), Some(ProspectionStatus::AProspecter));
    assert!(released.sequence_started_at.is_none());

    // Nothing of ours is due before day 3
    let early = sequence::run(&state, start + Duration::days(2)).await?;
    assert!(early.details.iter().all(|d| !our_ids.contains(&d.contact_id)));

    let stopped = prospections[0];
    storage
        .update_prospection(stopped, Some(ProspectionStatus::PasInteresse), None, None)
        .await?;

    for (step, day) in [(2, 3), (3, 7), (4, 14)] {
        let at = start + Duration::days(day);
        for _ in 0..10 {
            let run = sequence::run(&state, at).await?;
            assert!(run.emails_sent <= MAX_SENDS_PER_RUN);
            assert!(run
                .details
                .iter()
                .filter(|d| our_ids.contains(&d.contact_id))
                .all(|d| d.step == step && d.kind == "followup"));
            if run.emails_sent == 0 {
                break;
            }
        }
        for id in &prospections[1..] {
            let p = storage
                .get_prospection(*id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("prospection missing"))?;
            assert_eq!(p.sequence_step, step);
        }
    }

    let done = storage
        .get_prospection(prospections[1])
        .await?
        .ok_or_else(|| anyhow::anyhow!("prospection missing"))?;
    assert_eq!(done.sequence_completed_at, Some(start + Duration::days(14)));
    assert!(done.next_contact_at.is_none());
    assert_eq!(done.status(), Some(ProspectionStatus::EnCours));
    assert_eq!(done.emails_sent_count, 4);

    let not_interested = storage
        .get_prospection(stopped)
        .await?
        .ok_or_else(|| anyhow::anyhow!("prospection missing"))?;
    assert_eq!(not_interested.sequence_step, 1);
    assert_eq!(not_interested.status(), Some(ProspectionStatus::PasInteresse));

    let later = sequence::run(&state, start + Duration::days(30)).await?;
    assert!(later.details.iter().all(|d| !our_ids.contains(&d.contact_id)));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn webhook_events_update_contacts_once() -> anyhow::Result<()> {
    let state = Arc::new(state_with(Config::for_tests(&database_url()?)).await?);
    let storage = state.storage.clone();
    let app = build_router(state.clone())?;
    let suffix = Uuid::new_v4().simple().to_string();

    let bounced_email = format!("bounced.{}@ehpad-test.fr", &suffix[..8]);
    let bounced = seed_contact(&storage, &format!("Bounce {}", suffix), &bounced_email, EmailStatus::Valide).await?;
    let leaving_email = format!("leaving.{}@ehpad-test.fr", &suffix[..8]);
    let leaving = seed_contact(&storage, &format!("Leave {}", suffix), &leaving_email, EmailStatus::Valide).await?;

    let bounced_mid = format!("{}.1@smtp-relay.test", suffix);
    let leaving_mid = format!("{}.2@smtp-relay.test", suffix);
    for (contact_id, email, mid) in [
        (bounced, &bounced_email, &bounced_mid),
        (leaving, &leaving_email, &leaving_mid),
    ] {
        let prospection_id = storage.ensure_prospection(contact_id).await?;
        storage
            .insert_email_sent(&NewEmailSent {
                contact_id: Some(contact_id),
                prospection_id: Some(prospection_id),
                template_id: None,
                brevo_message_id: Some(mid.clone()),
                subject: "Vos transmissions".to_string(),
                to_email: email.clone(),
                sequence_step: Some(1),
                is_first_email: true,
                has_icebreaker: true,
            })
            .await?;
    }

    let bounce = serde_json::json!({
        "event": "hard_bounce",
        "email": bounced_email,
        "message-id": format!("<{}>", bounced_mid),
        "ts_event": 1714640400
    });
    let response = app.clone().oneshot(webhook_post(bounce.clone())).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["processed"], 1);
    assert!(json.get("error").is_none(), "{}", json);

    let contact = storage
        .get_contact(bounced)
        .await?
        .ok_or_else(|| anyhow::anyhow!("contact missing"))?;
    assert_eq!(contact.email_status, "invalide");

    // Brevo retries deliver the same event again
    let response = app.clone().oneshot(webhook_post(bounce)).await?;
    let json = body_json(response).await;
    assert_eq!(json["processed"], 0);
    assert_eq!(json["duplicates"], 1);

    let batch = serde_json::json!([
        {"event": "unsubscribed", "email": leaving_email, "ts_event": 1714640500},
        {"event": "request", "email": leaving_email, "ts_event": 1714640501},
        {"event": "opened", "email": format!("nobody.{}@ehpad-test.fr", suffix),
         "message-id": "<unknown@smtp-relay.test>", "ts_event": 1714640502}
    ]);
    let response = app.oneshot(webhook_post(batch)).await?;
    let json = body_json(response).await;
    assert_eq!(json["received"], 3);
    assert_eq!(json["processed"], 1);
    assert_eq!(json["ignored"], 1);
    assert_eq!(json["not_found"], 1);

    let prospection_id = storage.ensure_prospection(leaving).await?;
    let prospection = storage
        .get_prospection(prospection_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("prospection missing"))?;
    assert_eq!(prospection.status(), Some(ProspectionStatus::PasInteresse));
    assert!(prospection.next_contact_at.is_none());
    Ok(())
}

#[tokio::test]
#[ignore]
async fn validation_uses_batch_then_single_checks() -> anyhow::Result<()> {
    let zerobounce = MockServer::start().await;
    let suffix = Uuid::new_v4().simple().to_string();
    let sure_email = format!("sure.{}@ehpad-test.fr", &suffix[..8]);
    let risky_email = format!("risky.{}@ehpad-test.fr", &suffix[..8]);

    Mock::given(method("GET"))
        .and(path("/getcredits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Credits": "100"})))
        .mount(&zerobounce)
        .await;
    Mock::given(method("POST"))
        .and(path("/validatebatch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "email_batch": [{"address": sure_email, "status": "valid"}],
            "errors": []
        })))
        .mount(&zerobounce)
        .await;
    // Anything the batch left out is checked alone
    Mock::given(method("GET"))
        .and(path("/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "address": risky_email,
            "status": "catch-all"
        })))
        .mount(&zerobounce)
        .await;

    let mut config = Config::for_tests(&database_url()?);
    config.zerobounce_api_key = Some("zb_key".to_string());
    config.zerobounce_base_url = zerobounce.uri();
    config.zerobounce_bulk_base_url = zerobounce.uri();
    let state = state_with(config).await?;
    let storage = &state.storage;

    let sure = seed_contact(storage, &format!("Sure {}", suffix), &sure_email, EmailStatus::Trouve).await?;
    let risky = seed_contact(storage, &format!("Risky {}", suffix), &risky_email, EmailStatus::Trouve).await?;

    let (mut valid, mut risky_count) = (0, 0);
    for _ in 0..5 {
        let result = validate_emails(&state).await?;
        assert!(result.success);
        assert_eq!(result.credits_remaining, Some(100));
        valid += result.valid;
        risky_count += result.risky;
        if result.processed == 0 {
            break;
        }
    }
    assert!(valid >= 1);
    assert!(risky_count >= 1);

    let sure_contact = storage
        .get_contact(sure)
        .await?
        .ok_or_else(|| anyhow::anyhow!("contact missing"))?;
    assert_eq!(sure_contact.email_status, "valide");
    let risky_contact = storage
        .get_contact(risky)
        .await?
        .ok_or_else(|| anyhow::anyhow!("contact missing"))?;
    assert_eq!(risky_contact.email_status, "a_verifier");

    let pool = &state.db;
    let opened: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prospection WHERE contact_id = $1")
        .bind(sure)
        .fetch_one(pool)
        .await?;
    assert_eq!(opened, 1);
    let not_opened: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prospection WHERE contact_id = $1")
        .bind(risky)
        .fetch_one(pool)
        .await?;
    assert_eq!(not_opened, 0);
    Ok(())
}
