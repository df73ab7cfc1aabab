use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

// ============ Status enums ============

/// Lifecycle of a contact's email address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    ATrouver,
    Trouve,
    AVerifier,
    #[serde(alias = "valid")]
    Valide,
    #[serde(alias = "invalid")]
    Invalide,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::ATrouver => "a_trouver",
            EmailStatus::Trouve => "trouve",
            EmailStatus::AVerifier => "a_verifier",
            EmailStatus::Valide => "valide",
            EmailStatus::Invalide => "invalide",
        }
    }

    /// Statuses reachable in one step. `Invalide` is terminal; `Valide` may only
    /// fall to `Invalide` (hard bounce).
    pub fn allowed_next(&self) -> &'static [EmailStatus] {
        use EmailStatus::*;
        match self {
            ATrouver => &[Trouve, AVerifier],
            Trouve => &[AVerifier, Valide, Invalide],
            AVerifier => &[Valide, Invalide],
            Valide => &[Invalide],
            Invalide => &[],
        }
    }

    pub fn can_transition_to(&self, next: EmailStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

/// Sales pipeline state of a prospection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProspectionStatus {
    AProspecter,
    #[serde(alias = "sequence_en_cours", alias = "envoye")]
    EnCours,
    Interesse,
    RdvPris,
    Client,
    PasInteresse,
}

impl ProspectionStatus {
    pub const ALL: [ProspectionStatus; 6] = [
        ProspectionStatus::AProspecter,
        ProspectionStatus::EnCours,
        ProspectionStatus::Interesse,
        ProspectionStatus::RdvPris,
        ProspectionStatus::Client,
        ProspectionStatus::PasInteresse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProspectionStatus::AProspecter => "a_prospecter",
            ProspectionStatus::EnCours => "en_cours",
            ProspectionStatus::Interesse => "interesse",
            ProspectionStatus::RdvPris => "rdv_pris",
            ProspectionStatus::Client => "client",
            ProspectionStatus::PasInteresse => "pas_interesse",
        }
    }

    pub fn allowed_next(&self) -> &'static [ProspectionStatus] {
        use ProspectionStatus::*;
        match self {
            AProspecter => &[EnCours, Interesse, RdvPris, Client, PasInteresse],
            EnCours => &[Interesse, RdvPris, Client, PasInteresse],
            Interesse => &[RdvPris, Client, PasInteresse],
            RdvPris => &[Client, PasInteresse],
            Client | PasInteresse => &[],
        }
    }

    pub fn can_transition_to(&self, next: ProspectionStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Prospects in these states have answered one way or another and get no more sequence mail.
    pub fn stops_sequence(&self) -> bool {
        matches!(
            self,
            ProspectionStatus::Interesse
                | ProspectionStatus::RdvPris
                | ProspectionStatus::Client
                | ProspectionStatus::PasInteresse
        )
    }
}

/// Delivery state of one outbound email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Spam,
    Unsubscribed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Opened => "opened",
            DeliveryStatus::Clicked => "clicked",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Spam => "spam",
            DeliveryStatus::Unsubscribed => "unsubscribed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Bounced | DeliveryStatus::Spam | DeliveryStatus::Unsubscribed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Opened => 2,
            DeliveryStatus::Clicked => 3,
            _ => 4,
        }
    }

    /// `sent → delivered → opened → clicked`, and any non-terminal state may
    /// end in bounced/spam/unsubscribed.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }

    /// Storage spelling for every status that may precede `next`.
    pub fn predecessors(next: DeliveryStatus) -> Vec<&'static str> {
        DeliveryStatus::all()
            .iter()
            .filter(|s| s.can_transition_to(next))
            .map(|s| s.as_str())
            .collect()
    }

    pub fn all() -> [DeliveryStatus; 7] {
        [
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Opened,
            DeliveryStatus::Clicked,
            DeliveryStatus::Bounced,
            DeliveryStatus::Spam,
            DeliveryStatus::Unsubscribed,
        ]
    }
}

macro_rules! impl_str_enum {
    ($ty:ty, $label:literal, { $($alias:literal => $variant:expr),* $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($alias => Ok($variant),)*
                    other => Err(format!("unknown {}: {}", $label, other)),
                }
            }
        }
    };
}

impl_str_enum!(EmailStatus, "email status", {
    "a_trouver" => EmailStatus::ATrouver,
    "trouve" => EmailStatus::Trouve,
    "a_verifier" => EmailStatus::AVerifier,
    "valide" => EmailStatus::Valide,
    "valid" => EmailStatus::Valide,
    "invalide" => EmailStatus::Invalide,
    "invalid" => EmailStatus::Invalide,
});

impl_str_enum!(ProspectionStatus, "prospection status", {
    "a_prospecter" => ProspectionStatus::AProspecter,
    "en_cours" => ProspectionStatus::EnCours,
    "sequence_en_cours" => ProspectionStatus::EnCours,
    "envoye" => ProspectionStatus::EnCours,
    "interesse" => ProspectionStatus::Interesse,
    "rdv_pris" => ProspectionStatus::RdvPris,
    "client" => ProspectionStatus::Client,
    "pas_interesse" => ProspectionStatus::PasInteresse,
});

impl_str_enum!(DeliveryStatus, "delivery status", {
    "sent" => DeliveryStatus::Sent,
    "delivered" => DeliveryStatus::Delivered,
    "opened" => DeliveryStatus::Opened,
    "clicked" => DeliveryStatus::Clicked,
    "bounced" => DeliveryStatus::Bounced,
    "spam" => DeliveryStatus::Spam,
    "unsubscribed" => DeliveryStatus::Unsubscribed,
});

/// Kind of care establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum EstablishmentCategory {
    Ehpad,
    Ehpa,
    Ime,
    Itep,
    Esat,
    Fam,
    Mas,
    Sessad,
    Samsah,
    Savs,
    Ssiad,
    Cmpp,
    Camsp,
    #[serde(other)]
    Other,
}

impl EstablishmentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstablishmentCategory::Ehpad => "EHPAD",
            EstablishmentCategory::Ehpa => "EHPA",
            EstablishmentCategory::Ime => "IME",
            EstablishmentCategory::Itep => "ITEP",
            EstablishmentCategory::Esat => "ESAT",
            EstablishmentCategory::Fam => "FAM",
            EstablishmentCategory::Mas => "MAS",
            EstablishmentCategory::Sessad => "SESSAD",
            EstablishmentCategory::Samsah => "SAMSAH",
            EstablishmentCategory::Savs => "SAVS",
            EstablishmentCategory::Ssiad => "SSIAD",
            EstablishmentCategory::Cmpp => "CMPP",
            EstablishmentCategory::Camsp => "CAMSP",
            EstablishmentCategory::Other => "OTHER",
        }
    }

    /// Maps a FINESS `categetab` code onto a category.
    pub fn from_finess_code(code: &str) -> Option<Self> {
        use EstablishmentCategory::*;
        let category = match code.trim() {
            "500" | "502" => Ehpad,
            "501" => Ehpa,
            "183" | "188" | "189" | "190" => Ime,
            "186" => Itep,
            "194" | "382" => Sessad,
            "195" => Cmpp,
            "196" => Camsp,
            "238" | "246" | "249" => Esat,
            "252" | "253" => Fam,
            "255" => Mas,
            "390" | "445" => Savs,
            "395" | "446" => Samsah,
            "448" | "449" => Ssiad,
            _ => return None,
        };
        Some(category)
    }
}

impl fmt::Display for EstablishmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstablishmentCategory {
    type Err = String;

    /// Unknown categories parse as `Other`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use EstablishmentCategory::*;
        Ok(match s.trim().to_uppercase().as_str() {
            "EHPAD" => Ehpad,
            "EHPA" => Ehpa,
            "IME" => Ime,
            "ITEP" => Itep,
            "ESAT" => Esat,
            "FAM" => Fam,
            "MAS" => Mas,
            "SESSAD" => Sessad,
            "SAMSAH" => Samsah,
            "SAVS" => Savs,
            "SSIAD" => Ssiad,
            "CMPP" => Cmpp,
            "CAMSP" => Camsp,
            _ => Other,
        })
    }
}

// ============ Database Models ============

/// A care facility imported from the establishment dataset.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Establishment {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub department: Option<String>,
    pub region: Option<String>,
    /// E.164 phone number.
    pub phone: Option<String>,
    pub website: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Establishment {
    pub fn category(&self) -> EstablishmentCategory {
        self.category
            .parse()
            .unwrap_or(EstablishmentCategory::Other)
    }
}

/// A person or role at an establishment, target of outreach.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Contact {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub email_status: String,
    pub email_validated_at: Option<DateTime<Utc>>,
    /// Raw status returned by the validation vendor.
    pub email_validation_result: Option<String>,
    pub icebreaker: Option<String>,
    pub icebreaker_context: Option<String>,
    pub icebreaker_generated_at: Option<DateTime<Utc>>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn email_status(&self) -> Option<EmailStatus> {
        self.email_status.parse().ok()
    }

    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{} {}", f, l),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => self.role.clone(),
        }
    }
}

/// Contact joined with the establishment fields used for rendering and prompts.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ContactWithEstablishment {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub email_status: String,
    pub icebreaker: Option<String>,
    pub establishment_name: String,
    pub establishment_category: String,
    pub city: Option<String>,
    pub website: Option<String>,
}

/// One pipeline entry per contact.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Prospection {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
    pub sequence_step: i32,
    pub sequence_started_at: Option<DateTime<Utc>>,
    pub sequence_completed_at: Option<DateTime<Utc>>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub next_contact_at: Option<DateTime<Utc>>,
    pub emails_sent_count: i32,
    pub open_count: i32,
    pub click_count: i32,
    pub replied: bool,
    pub notes: Option<String>,
    pub next_action_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prospection {
    pub fn status(&self) -> Option<ProspectionStatus> {
        self.status.parse().ok()
    }
}

/// A recorded outbound email.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct EmailSent {
    pub id: Uuid,
    pub contact_id: Option<Uuid>,
    pub prospection_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub brevo_message_id: Option<String>,
    pub subject: String,
    pub to_email: String,
    pub sequence_step: Option<i32>,
    pub is_first_email: bool,
    pub has_icebreaker: bool,
    pub status: String,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub last_clicked_link: Option<String>,
    pub open_count: i32,
    pub click_count: i32,
}

impl EmailSent {
    pub fn status(&self) -> Option<DeliveryStatus> {
        self.status.parse().ok()
    }
}

/// Template for one step of the drip sequence.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub step_number: i32,
    pub delay_days: i32,
    pub name: String,
    pub subject: String,
    pub body_html: String,
}

// ============ Inserts ============

/// Establishment record as found in the import dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishmentRecord {
    pub name: String,
    pub category: EstablishmentCategory,
    pub city: String,
    pub postal_code: String,
    pub department: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub establishment_id: Uuid,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub email_status: EmailStatus,
    pub source: String,
}

impl NewContact {
    /// Role placeholder with no known person or email.
    pub fn placeholder(establishment_id: Uuid, role: &str, source: &str) -> Self {
        Self {
            establishment_id,
            role: role.to_string(),
            first_name: None,
            last_name: None,
            email: None,
            email_status: EmailStatus::ATrouver,
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewEmailSent {
    pub contact_id: Option<Uuid>,
    pub prospection_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub brevo_message_id: Option<String>,
    pub subject: String,
    pub to_email: String,
    pub sequence_step: Option<i32>,
    pub is_first_email: bool,
    pub has_icebreaker: bool,
}

// ============ Batch results ============

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ImportResult {
    pub fetched: usize,
    pub filtered: usize,
    pub new_establishments: usize,
    pub new_contacts: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct GenerateContactsResult {
    pub establishments: usize,
    pub created: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct EnrichResult {
    pub processed: usize,
    pub enriched: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ValidationResult {
    pub success: bool,
    pub processed: usize,
    pub valid: usize,
    pub invalid: usize,
    pub risky: usize,
    pub credits_remaining: Option<i64>,
    pub message: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct IcebreakerRunResult {
    pub processed: usize,
    pub generated: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SequenceSend {
    pub contact_id: Uuid,
    pub email: String,
    pub step: i32,
    /// `new` or `followup`
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct SequenceResult {
    pub checked: usize,
    pub emails_sent: usize,
    /// Candidates another run claimed first, or whose status changed meanwhile.
    pub skipped: usize,
    pub errors: Vec<String>,
    pub details: Vec<SequenceSend>,
}

/// A prospection with enough engagement to deserve a call.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct HotLead {
    pub prospection_id: Uuid,
    pub contact_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: String,
    pub email: Option<String>,
    pub establishment_name: String,
    pub city: Option<String>,
    pub phone: Option<String>,
    pub open_count: i32,
    pub click_count: i32,
    #[sqlx(default)]
    pub score: i32,
}

impl HotLead {
    pub fn compute_score(open_count: i32, click_count: i32) -> i32 {
        open_count * 10 + click_count * 25
    }
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct PipelineStats {
    pub total_prospects: i64,
    pub by_status: std::collections::BTreeMap<String, i64>,
    pub emails_sent: i64,
    pub opened: i64,
    pub clicked: i64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub replies: i64,
}
