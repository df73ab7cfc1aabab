use crate::errors::{AppError, ResultExt};
use crate::models::*;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::HashSet;
use uuid::Uuid;

const CONTACT_WITH_ESTABLISHMENT: &str = r#"
    c.id, c.establishment_id, c.role, c.first_name, c.last_name, c.email,
    c.email_status, c.icebreaker,
    e.name AS establishment_name, e.category AS establishment_category,
    e.city, e.website
"#;

/// Contact picked for a sequence send, with its prospection if one exists.
#[derive(Debug, Clone, FromRow)]
pub struct SequenceCandidate {
    #[sqlx(flatten)]
    pub contact: ContactWithEstablishment,
    pub prospection_id: Option<Uuid>,
    pub sequence_step: Option<i32>,
    pub sequence_started_at: Option<DateTime<Utc>>,
    pub prospection_status: Option<String>,
}

/// Establishment as written by the importer, already normalised.
#[derive(Debug, Clone)]
pub struct NewEstablishment {
    pub name: String,
    pub category: EstablishmentCategory,
    pub city: String,
    pub postal_code: String,
    pub department: String,
    pub region: String,
    pub phone: Option<String>,
    pub website: Option<String>,
}

/// One Brevo event as stored for deduplication.
#[derive(Debug, Clone)]
pub struct NewEmailEvent<'a> {
    pub message_id: &'a str,
    pub event: &'a str,
    pub email: Option<&'a str>,
    pub link: Option<&'a str>,
    pub event_ts: &'a str,
    pub payload: &'a serde_json::Value,
}

/// Engagement change carried by one Brevo event.
#[derive(Debug, Clone)]
pub struct DeliveryUpdate<'a> {
    pub status: DeliveryStatus,
    pub link: Option<&'a str>,
    pub occurred_at: DateTime<Utc>,
}

/// All reads and writes of the prospection database.
#[derive(Clone)]
pub struct ProspectionStorage {
    pool: PgPool,
}

impl ProspectionStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ============ Establishments ============

    /// Lower-cased `name-city` keys of every stored establishment.
    pub async fn establishment_keys(&self) -> Result<HashSet<String>, AppError> {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT name, city FROM establishments")
                .fetch_all(&self.pool)
                .await
                .context("loading establishment keys")?;
        Ok(rows
            .into_iter()
            .map(|(name, city)| crate::establishments::dedup_key(&name, city.as_deref().unwrap_or("")))
            .collect())
    }

    /// Inserts an establishment. Returns `None` when it already exists.
    pub async fn insert_establishment(
        &self,
        record: &NewEstablishment,
    ) -> Result<Option<Uuid>, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO establishments
                (name, category, city, postal_code, department, region, phone, website)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&record.name)
        .bind(record.category.as_str())
        .bind(&record.city)
        .bind(&record.postal_code)
        .bind(&record.department)
        .bind(&record.region)
        .bind(&record.phone)
        .bind(&record.website)
        .fetch_optional(&self.pool)
        .await
        .context("inserting establishment")?;
        Ok(id)
    }

    pub async fn get_establishment(&self, id: Uuid) -> Result<Option<Establishment>, AppError> {
        let row = sqlx::query_as::<_, Establishment>("SELECT * FROM establishments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn set_website(&self, id: Uuid, website: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE establishments SET website = $2 WHERE id = $1 AND (website IS NULL OR website = '')")
            .bind(id)
            .bind(website)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn establishments_without_contacts(
        &self,
        limit: i64,
    ) -> Result<Vec<Establishment>, AppError> {
        let rows = sqlx::query_as::<_, Establishment>(
            r#"
            SELECT e.* FROM establishments e
            WHERE NOT EXISTS (SELECT 1 FROM contacts c WHERE c.establishment_id = e.id)
            ORDER BY e.created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_establishments(&self, limit: i64) -> Result<Vec<Establishment>, AppError> {
        let rows = sqlx::query_as::<_, Establishment>(
            "SELECT * FROM establishments ORDER BY created_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ============ Contacts ============

    pub async fn insert_contact(&self, contact: &NewContact) -> Result<Uuid, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO contacts
                (establishment_id, role, first_name, last_name, email, email_status, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(contact.establishment_id)
        .bind(&contact.role)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.email)
        .bind(contact.email_status.as_str())
        .bind(&contact.source)
        .fetch_one(&self.pool)
        .await
        .context("inserting contact")?;
        Ok(id)
    }

    /// Lower-cased roles already present on an establishment.
    pub async fn existing_roles(&self, establishment_id: Uuid) -> Result<HashSet<String>, AppError> {
        let roles: Vec<String> =
            sqlx::query_scalar("SELECT lower(role) FROM contacts WHERE establishment_id = $1")
                .bind(establishment_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(roles.into_iter().collect())
    }

    pub async fn contact_email_exists(
        &self,
        establishment_id: Uuid,
        email: &str,
    ) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM contacts WHERE establishment_id = $1 AND lower(email) = lower($2))",
        )
        .bind(establishment_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn get_contact(&self, id: Uuid) -> Result<Option<ContactWithEstablishment>, AppError> {
        let sql = format!(
            "SELECT {} FROM contacts c JOIN establishments e ON e.id = c.establishment_id WHERE c.id = $1",
            CONTACT_WITH_ESTABLISHMENT
        );
        let row = sqlx::query_as::<_, ContactWithEstablishment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn contacts_to_enrich(
        &self,
        limit: i64,
    ) -> Result<Vec<ContactWithEstablishment>, AppError> {
        let sql = format!(
            r#"
            SELECT {} FROM contacts c JOIN establishments e ON e.id = c.establishment_id
            WHERE c.email_status = 'a_trouver' AND c.email IS NULL
            ORDER BY c.created_at
            LIMIT $1
            "#,
            CONTACT_WITH_ESTABLISHMENT
        );
        let rows = sqlx::query_as::<_, ContactWithEstablishment>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Writes a discovered address. Only applies while the contact is still `a_trouver`.
    pub async fn set_found_email(
        &self,
        contact_id: Uuid,
        email: &str,
        status: EmailStatus,
        first_name: Option<&str>,
        last_name: Option<&str>,
        source: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE contacts SET
                email = $2,
                email_status = $3,
                first_name = COALESCE(first_name, $4),
                last_name = COALESCE(last_name, $5),
                source = $6,
                updated_at = NOW()
            WHERE id = $1 AND email_status = 'a_trouver'
            "#,
        )
        .bind(contact_id)
        .bind(email)
        .bind(status.as_str())
        .bind(first_name)
        .bind(last_name)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn contacts_to_validate(
        &self,
        limit: i64,
    ) -> Result<Vec<ContactWithEstablishment>, AppError> {
        let sql = format!(
            r#"
            SELECT {} FROM contacts c JOIN establishments e ON e.id = c.establishment_id
            WHERE c.email_status IN ('trouve', 'a_verifier')
              AND c.email IS NOT NULL
              AND c.email_validated_at IS NULL
            ORDER BY c.updated_at
            LIMIT $1
            "#,
            CONTACT_WITH_ESTABLISHMENT
        );
        let rows = sqlx::query_as::<_, ContactWithEstablishment>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Stores a validation verdict unless the contact already left the validatable states.
    pub async fn record_validation(
        &self,
        contact_id: Uuid,
        status: EmailStatus,
        raw_result: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE contacts SET
                email_status = $2,
                email_validated_at = NOW(),
                email_validation_result = $3,
                updated_at = NOW()
            WHERE id = $1 AND email_status IN ('a_trouver', 'trouve', 'a_verifier')
            "#,
        )
        .bind(contact_id)
        .bind(status.as_str())
        .bind(raw_result)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hard bounce: the address is dead whatever its previous state.
    pub async fn contacts_needing_icebreaker(
        &self,
        limit: i64,
    ) -> Result<Vec<ContactWithEstablishment>, AppError> {
        let sql = format!(
            r#"
            SELECT {} FROM contacts c JOIN establishments e ON e.id = c.establishment_id
            WHERE c.email_status = 'valide' AND c.icebreaker IS NULL
            ORDER BY c.email_validated_at NULLS LAST
            LIMIT $1
            "#,
            CONTACT_WITH_ESTABLISHMENT
        );
        let rows = sqlx::query_as::<_, ContactWithEstablishment>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn save_icebreaker(
        &self,
        contact_id: Uuid,
        icebreaker: &str,
        context: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE contacts SET
                icebreaker = $2,
                icebreaker_context = $3,
                icebreaker_generated_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(contact_id)
        .bind(icebreaker)
        .bind(context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `(valid contacts, valid contacts with an ice breaker)`
    pub async fn icebreaker_counts(&self) -> Result<(i64, i64), AppError> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(icebreaker)
            FROM contacts WHERE email_status = 'valide'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    // ============ Prospection ============

    /// Returns the contact's prospection id, creating an `a_prospecter` one if needed.
    pub async fn ensure_prospection(&self, contact_id: Uuid) -> Result<Uuid, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO prospection (contact_id, status, sequence_step)
            VALUES ($1, 'a_prospecter', 0)
            ON CONFLICT (contact_id) DO UPDATE SET contact_id = EXCLUDED.contact_id
            RETURNING id
            "#,
        )
        .bind(contact_id)
        .fetch_one(&self.pool)
        .await
        .context("ensuring prospection")?;
        Ok(id)
    }

    pub async fn get_prospection(&self, id: Uuid) -> Result<Option<Prospection>, AppError> {
        let row = sqlx::query_as::<_, Prospection>("SELECT * FROM prospection WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn update_prospection(
        &self,
        id: Uuid,
        status: Option<ProspectionStatus>,
        notes: Option<&str>,
        next_action_at: Option<DateTime<Utc>>,
    ) -> Result<Prospection, AppError> {
        let row = sqlx::query_as::<_, Prospection>(
            r#"
            UPDATE prospection SET
                status = COALESCE($2, status),
                notes = COALESCE($3, notes),
                next_action_at = COALESCE($4, next_action_at),
                replied = replied OR COALESCE($2 IN ('interesse', 'rdv_pris', 'client'), FALSE),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.map(|s| s.as_str()))
        .bind(notes)
        .bind(next_action_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Valid contacts with an ice breaker whose sequence has not started.
    pub async fn sequence_start_candidates(
        &self,
        limit: i64,
    ) -> Result<Vec<SequenceCandidate>, AppError> {
        let sql = format!(
            r#"
            SELECT {},
                p.id AS prospection_id, p.sequence_step, p.sequence_started_at,
                p.status AS prospection_status
            FROM contacts c
            JOIN establishments e ON e.id = c.establishment_id
            LEFT JOIN prospection p ON p.contact_id = c.id
            WHERE c.email_status = 'valide'
              AND c.email IS NOT NULL
              AND c.icebreaker IS NOT NULL
              AND (p.id IS NULL OR (p.sequence_started_at IS NULL AND p.status = 'a_prospecter'))
            ORDER BY c.icebreaker_generated_at NULLS LAST
            LIMIT $1
            "#,
            CONTACT_WITH_ESTABLISHMENT
        );
        let rows = sqlx::query_as::<_, SequenceCandidate>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Running sequences whose next step is due.
    pub async fn sequence_followups_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SequenceCandidate>, AppError> {
        let sql = format!(
            r#"
            SELECT {},
                p.id AS prospection_id, p.sequence_step, p.sequence_started_at,
                p.status AS prospection_status
            FROM prospection p
            JOIN contacts c ON c.id = p.contact_id
            JOIN establishments e ON e.id = c.establishment_id
            WHERE p.status = 'en_cours'
              AND p.sequence_step BETWEEN 1 AND 3
              AND p.sequence_completed_at IS NULL
              AND p.next_contact_at <= $1
              AND c.email_status = 'valide'
              AND c.email IS NOT NULL
            ORDER BY p.next_contact_at
            LIMIT $2
            "#,
            CONTACT_WITH_ESTABLISHMENT
        );
        let rows = sqlx::query_as::<_, SequenceCandidate>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Reserves `step` before it is sent. Only succeeds when the previous step is
    /// the current one and the prospect is still in the sequence, so two overlapping
    /// runs never send the same step twice.
    pub async fn claim_sequence_step(
        &self,
        prospection_id: Uuid,
        step: i32,
        now: DateTime<Utc>,
        next_contact_at: Option<DateTime<Utc>>,
        completed: bool,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE prospection SET
                status = CASE WHEN status = 'a_prospecter' THEN 'en_cours' ELSE status END,
                sequence_step = $2,
                sequence_started_at = COALESCE(sequence_started_at, $3),
                next_contact_at = $4,
                sequence_completed_at = CASE WHEN $5 THEN $3 ELSE sequence_completed_at END,
                updated_at = NOW()
            WHERE id = $1
              AND sequence_step = $2 - 1
              AND sequence_completed_at IS NULL
              AND status IN ('a_prospecter', 'en_cours')
              AND ($2 > 1 OR sequence_started_at IS NULL)
            "#,
        )
        .bind(prospection_id)
        .bind(step)
        .bind(now)
        .bind(next_contact_at)
        .bind(completed)
        .execute(&self.pool)
        .await
        .context("claiming sequence step")?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts a claimed step as sent.
    pub async fn record_step_sent(
        &self,
        prospection_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE prospection SET
                last_contact_at = $2,
                emails_sent_count = emails_sent_count + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(prospection_id)
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .context("recording sequence send")?;
        Ok(())
    }

    /// Gives back a claimed step whose send failed. A first step returns the prospect
    /// to `a_prospecter`; a follow-up stays due at `retry_at`.
    pub async fn release_sequence_step(
        &self,
        prospection_id: Uuid,
        step: i32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE prospection SET
                status = CASE WHEN $2 = 1 AND status = 'en_cours' THEN 'a_prospecter' ELSE status END,
                sequence_step = $2 - 1,
                sequence_started_at = CASE WHEN $2 = 1 THEN NULL ELSE sequence_started_at END,
                next_contact_at = CASE WHEN $2 = 1 THEN NULL ELSE $3 END,
                sequence_completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND sequence_step = $2
            "#,
        )
        .bind(prospection_id)
        .bind(step)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .context("releasing sequence step")?;
        Ok(())
    }

    /// Manual send: move to `en_cours` (never backwards) and bump the step.
    pub async fn record_manual_send(&self, contact_id: Uuid) -> Result<Uuid, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO prospection
                (contact_id, status, sequence_step, sequence_started_at, last_contact_at, emails_sent_count)
            VALUES ($1, 'en_cours', 1, NOW(), NOW(), 1)
            ON CONFLICT (contact_id) DO UPDATE SET
                status = CASE WHEN prospection.status = 'a_prospecter' THEN 'en_cours' ELSE prospection.status END,
                sequence_step = LEAST(prospection.sequence_step + 1, 4),
                sequence_started_at = COALESCE(prospection.sequence_started_at, NOW()),
                last_contact_at = NOW(),
                emails_sent_count = prospection.emails_sent_count + 1,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(contact_id)
        .fetch_one(&self.pool)
        .await
        .context("recording manual send")?;
        Ok(id)
    }

    pub async fn hot_leads(&self, limit: i64) -> Result<Vec<HotLead>, AppError> {
        let rows = sqlx::query_as::<_, HotLead>(
            r#"
            SELECT
                p.id AS prospection_id, c.id AS contact_id,
                c.first_name, c.last_name, c.role, c.email,
                e.name AS establishment_name, e.city, e.phone,
                p.open_count, p.click_count,
                (p.open_count * 10 + p.click_count * 25) AS score
            FROM prospection p
            JOIN contacts c ON c.id = p.contact_id
            JOIN establishments e ON e.id = c.establishment_id
            WHERE (p.open_count >= 3 OR p.click_count >= 1) AND p.replied = FALSE
            ORDER BY score DESC, p.updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn pipeline_stats(&self) -> Result<PipelineStats, AppError> {
        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM prospection GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let (emails_sent, opened, clicked): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(opened_at), COUNT(clicked_at) FROM emails_sent",
        )
        .fetch_one(&self.pool)
        .await?;
        let replies: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM prospection WHERE replied")
                .fetch_one(&self.pool)
                .await?;

        let mut stats = PipelineStats {
            emails_sent,
            opened,
            clicked,
            replies,
            open_rate: percentage(opened, emails_sent),
            click_rate: percentage(clicked, emails_sent),
            ..Default::default()
        };
        for status in ProspectionStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for (status, count) in by_status {
            stats.total_prospects += count;
            stats.by_status.insert(status, count);
        }
        Ok(stats)
    }

    // ============ Emails ============

    pub async fn templates(&self) -> Result<Vec<EmailTemplate>, AppError> {
        let rows = sqlx::query_as::<_, EmailTemplate>(
            "SELECT id, step_number, delay_days, name, subject, body_html FROM email_templates ORDER BY step_number",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn insert_email_sent(&self, email: &NewEmailSent) -> Result<Uuid, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO emails_sent
                (contact_id, prospection_id, template_id, brevo_message_id, subject, to_email,
                 sequence_step, is_first_email, has_icebreaker, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'sent')
            RETURNING id
            "#,
        )
        .bind(email.contact_id)
        .bind(email.prospection_id)
        .bind(email.template_id)
        .bind(&email.brevo_message_id)
        .bind(&email.subject)
        .bind(&email.to_email)
        .bind(email.sequence_step)
        .bind(email.is_first_email)
        .bind(email.has_icebreaker)
        .fetch_one(&self.pool)
        .await
        .context("recording sent email")?;
        Ok(id)
    }

    /// Finds the email an event refers to: by message id first, else the latest send to the address.
    pub async fn find_email_for_event(
        &self,
        message_id: Option<&str>,
        address: Option<&str>,
    ) -> Result<Option<EmailSent>, AppError> {
        if let Some(mid) = message_id.filter(|m| !m.is_empty()) {
            let row = sqlx::query_as::<_, EmailSent>(
                "SELECT * FROM emails_sent WHERE brevo_message_id = $1 LIMIT 1",
            )
            .bind(mid)
            .fetch_optional(&self.pool)
            .await?;
            if row.is_some() {
                return Ok(row);
            }
        }
        let Some(address) = address.filter(|a| !a.is_empty()) else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, EmailSent>(
            "SELECT * FROM emails_sent WHERE lower(to_email) = lower($1) ORDER BY sent_at DESC LIMIT 1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Logs a webhook event. Returns false when the same event was already stored.
    /// Records a Brevo event and applies it in one transaction. Returns `false`
    /// for an event already recorded, in which case nothing changes.
    pub async fn apply_email_event(
        &self,
        email_id: Uuid,
        contact_id: Option<Uuid>,
        event: &NewEmailEvent<'_>,
        update: &DeliveryUpdate<'_>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO email_events (message_id, event, email, link, event_ts, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id, event, event_ts) DO NOTHING
            "#,
        )
        .bind(event.message_id)
        .bind(event.event)
        .bind(event.email)
        .bind(event.link)
        .bind(event.event_ts)
        .bind(event.payload)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        apply_delivery_update(&mut tx, email_id, update)
            .await
            .context("applying delivery event")?;

        if let Some(contact_id) = contact_id {
            match update.status {
                DeliveryStatus::Opened => add_engagement(&mut tx, contact_id, 1, 0).await?,
                DeliveryStatus::Clicked => add_engagement(&mut tx, contact_id, 0, 1).await?,
                DeliveryStatus::Bounced => {
                    mark_contact_invalid(&mut tx, contact_id, event.event).await?
                }
                DeliveryStatus::Unsubscribed => mark_not_interested(&mut tx, contact_id).await?,
                _ => {}
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn emails_sent_since(&self, since: DateTime<Utc>) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM emails_sent WHERE sent_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// The status only moves forward; timestamps keep their first value; counters always increment.
async fn apply_delivery_update(
    conn: &mut PgConnection,
    email_id: Uuid,
    update: &DeliveryUpdate<'_>,
) -> Result<(), AppError> {
    let predecessors: Vec<String> = DeliveryStatus::predecessors(update.status)
        .into_iter()
        .map(str::to_string)
        .collect();
    sqlx::query(
        r#"
        UPDATE emails_sent SET
            status = CASE WHEN status = ANY($2) THEN $3 ELSE status END,
            delivered_at = CASE WHEN $3 = 'delivered' THEN COALESCE(delivered_at, $5) ELSE delivered_at END,
            opened_at = CASE WHEN $3 IN ('opened', 'clicked') THEN COALESCE(opened_at, $5) ELSE opened_at END,
            clicked_at = CASE WHEN $3 = 'clicked' THEN COALESCE(clicked_at, $5) ELSE clicked_at END,
            open_count = open_count + CASE WHEN $3 = 'opened' THEN 1 ELSE 0 END,
            click_count = click_count + CASE WHEN $3 = 'clicked' THEN 1 ELSE 0 END,
            last_clicked_link = COALESCE($4, last_clicked_link)
        WHERE id = $1
        "#,
    )
    .bind(email_id)
    .bind(&predecessors)
    .bind(update.status.as_str())
    .bind(update.link)
    .bind(update.occurred_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn add_engagement(
    conn: &mut PgConnection,
    contact_id: Uuid,
    opens: i32,
    clicks: i32,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE prospection SET
            open_count = open_count + $2,
            click_count = click_count + $3,
            updated_at = NOW()
        WHERE contact_id = $1
        "#,
    )
    .bind(contact_id)
    .bind(opens)
    .bind(clicks)
    .execute(conn)
    .await?;
    Ok(())
}

async fn mark_contact_invalid(
    conn: &mut PgConnection,
    contact_id: Uuid,
    reason: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE contacts SET email_status = 'invalide', email_validation_result = $2, updated_at = NOW()
        WHERE id = $1 AND email_status <> 'invalide'
        "#,
    )
    .bind(contact_id)
    .bind(reason)
    .execute(conn)
    .await?;
    Ok(())
}

/// Unsubscribe ends the pipeline unless it already reached a terminal state.
async fn mark_not_interested(conn: &mut PgConnection, contact_id: Uuid) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE prospection SET
            status = 'pas_interesse',
            next_contact_at = NULL,
            updated_at = NOW()
        WHERE contact_id = $1 AND status NOT IN ('client', 'pas_interesse')
        "#,
    )
    .bind(contact_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Percentage with one decimal; zero when nothing was sent.
pub fn percentage(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 1000.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_rounds_to_one_decimal() {
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(10, 10), 100.0);
    }
}
