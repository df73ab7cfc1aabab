use chrono::Utc;
use std::env;
use uuid::Uuid;

use rust_prospection_api::db::Database;
use rust_prospection_api::db_storage::{DeliveryUpdate, NewEmailEvent, ProspectionStorage};
use rust_prospection_api::establishments::{import_establishments, parse_dataset};
use rust_prospection_api::models::{
    DeliveryStatus, EmailStatus, NewEmailSent, ProspectionStatus,
};

async fn storage() -> anyhow::Result<ProspectionStorage> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;
    db.migrate().await?;
    Ok(ProspectionStorage::new(db.pool.clone()))
}

/// Import, validation and webhook bookkeeping against a real Postgres.
/// Marked ignored to avoid running against production by accident; set TEST_DATABASE_URL to run.
#[tokio::test]
#[ignore]
async fn import_then_track_delivery_smoke_test() -> anyhow::Result<()> {
    let storage = storage().await?;

    // Unique names so repeated runs import fresh rows.
    let suffix = Uuid::new_v4().simple().to_string();
    let dataset = format!(
        r#"[
            {{"name": "EHPAD Test {s}", "category": "EHPAD", "city": "Ham", "postal_code": "80400",
              "department": "Somme", "phone": "03 22 36 00 00", "website": "www.ehpad-test.fr/accueil"}},
            {{"name": "EHPAD Test {s}", "category": "EHPAD", "city": "HAM", "postal_code": "80400",
              "department": "Somme"}}
        ]"#,
        s = suffix
    );
    let records = parse_dataset(&dataset)?;

    let first = import_establishments(&storage, &records).await?;
    assert_eq!(first.fetched, 2);
    assert_eq!(first.filtered, 1, "same name and city differ only by case");
    assert_eq!(first.new_establishments, 1);
    assert_eq!(first.new_contacts, 1);
    assert!(first.errors.is_empty(), "{:?}", first.errors);

    let again = import_establishments(&storage, &records).await?;
    assert_eq!(again.new_establishments, 0);

    let establishment = storage
        .list_establishments(10_000)
        .await?
        .into_iter()
        .find(|e| e.name == format!("EHPAD Test {}", suffix))
        .ok_or_else(|| anyhow::anyhow!("imported establishment missing"))?;
    assert_eq!(establishment.phone.as_deref(), Some("+33322360000"));
    assert_eq!(establishment.website.as_deref(), Some("https://www.ehpad-test.fr"));
    assert!(storage.existing_roles(establishment.id).await?.contains("directeur"));

    let contact_id = storage
        .contacts_to_enrich(10_000)
        .await?
        .into_iter()
        .find(|c| c.establishment_id == establishment.id)
        .map(|c| c.id)
        .ok_or_else(|| anyhow::anyhow!("placeholder contact missing"))?;

    let email = format!("direction.{}@ehpad-test.fr", &suffix[..8]);
    assert!(
        storage
            .set_found_email(contact_id, &email, EmailStatus::Trouve, None, None, "hunter")
            .await?
    );
    assert!(storage.record_validation(contact_id, EmailStatus::Valide, "valid").await?);
    // Already validated: the conditional update leaves the row alone.
    assert!(!storage.record_validation(contact_id, EmailStatus::Invalide, "invalid").await?);

    let prospection_id = storage.ensure_prospection(contact_id).await?;
    assert_eq!(storage.ensure_prospection(contact_id).await?, prospection_id);

    let message_id = format!("{}@smtp-relay.test", suffix);
    let email_id = storage
        .insert_email_sent(&NewEmailSent {
            contact_id: Some(contact_id),
            prospection_id: Some(prospection_id),
            template_id: None,
            brevo_message_id: Some(message_id.clone()),
            subject: "Test".to_string(),
            to_email: email.clone(),
            sequence_step: None,
            is_first_email: true,
            has_icebreaker: false,
        })
        .await?;

    let found = storage
        .find_email_for_event(Some(&message_id), None)
        .await?
        .ok_or_else(|| anyhow::anyhow!("sent email not found by message id"))?;
    assert_eq!(found.id, email_id);
    let by_address = storage
        .find_email_for_event(None, Some(&email.to_uppercase()))
        .await?
        .ok_or_else(|| anyhow::anyhow!("sent email not found by address"))?;
    assert_eq!(by_address.id, email_id);

    let now = Utc::now();
    let payload = serde_json::json!({"event": "click"});
    let click = NewEmailEvent {
        message_id: &message_id,
        event: "click",
        email: Some(email.as_str()),
        link: Some("https://x"),
        event_ts: "1714640400",
        payload: &payload,
    };
    let clicked = DeliveryUpdate {
        status: DeliveryStatus::Clicked,
        link: Some("https://x"),
        occurred_at: now,
    };
    assert!(storage.apply_email_event(email_id, Some(contact_id), &click, &clicked).await?);
    // Same event replayed: recorded once, applied once
    assert!(!storage.apply_email_event(email_id, Some(contact_id), &click, &clicked).await?);

    let open = NewEmailEvent {
        event: "opened",
        link: None,
        event_ts: "1714640500",
        ..click.clone()
    };
    let opened = DeliveryUpdate {
        status: DeliveryStatus::Opened,
        link: None,
        occurred_at: now,
    };
    assert!(storage.apply_email_event(email_id, Some(contact_id), &open, &opened).await?);

    let tracked = storage
        .find_email_for_event(Some(&message_id), None)
        .await?
        .ok_or_else(|| anyhow::anyhow!("sent email vanished"))?;
    assert_eq!(tracked.status(), Some(DeliveryStatus::Clicked));
    assert_eq!(tracked.open_count, 1);
    assert_eq!(tracked.click_count, 1);

    let updated = storage
        .update_prospection(prospection_id, Some(ProspectionStatus::Interesse), Some("Rappeler lundi"), None)
        .await?;
    assert_eq!(updated.status(), Some(ProspectionStatus::Interesse));
    assert!(updated.replied);

    let stats = storage.pipeline_stats().await?;
    assert!(stats.total_prospects >= 1);
    Ok(())
}
