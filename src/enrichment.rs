/// Contact generation and email discovery.
///
/// 1. Placeholder contacts per establishment, one per expected role
/// 2. Domain resolution from the website, else a Hunter company lookup
/// 3. Hunter domain search, then email finder, then a guessed pattern
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::*;
use crate::services::HunterService;
use crate::vendor_models::HunterEmail;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use utoipa::ToSchema;
use uuid::Uuid;

pub const CRON_ROLES_PER_ESTABLISHMENT: usize = 2;
pub const BULK_ROLES_PER_ESTABLISHMENT: usize = 3;
pub const MIN_CONTACTS_PER_SEARCH: usize = 3;

/// Expected decision makers, most relevant first.
pub fn roles_for_category(category: EstablishmentCategory) -> &'static [&'static str] {
    use EstablishmentCategory::*;
    match category {
        Ehpad => &[
            "Directeur",
            "IDEC",
            "Médecin coordonnateur",
            "Cadre de santé",
            "Responsable RH",
        ],
        Ime => &[
            "Directeur",
            "Chef de service éducatif",
            "Psychologue",
            "Médecin",
        ],
        Esat => &[
            "Directeur",
            "Moniteur principal",
            "Chef de production",
            "Responsable RH",
        ],
        Fam => &["Directeur", "Chef de service", "Cadre de santé", "Psychologue"],
        Mas => &[
            "Directeur",
            "IDEC",
            "Médecin coordonnateur",
            "Cadre de santé",
        ],
        Sessad | Samsah => &["Directeur", "Chef de service", "Coordinateur"],
        Savs => &["Directeur", "Chef de service"],
        Itep => &["Directeur", "Chef de service éducatif", "Psychologue"],
        _ => &["Directeur", "Responsable", "Adjoint de direction"],
    }
}

// ============ Normalisation helpers ============

/// Bare host of a website, without scheme, `www.` or path.
pub fn extract_domain(website: &str) -> Option<String> {
    let trimmed = website.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = url::Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if !host.contains('.') || host.starts_with('.') || host.ends_with('.') {
        return None;
    }
    Some(host.to_string())
}

/// `https://host` form of a website, keeping the `www.` if present.
pub fn normalize_website(website: &str) -> Option<String> {
    let trimmed = website.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = url::Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_lowercase();
    if !host.contains('.') {
        return None;
    }
    Some(format!("https://{}", host))
}

pub fn strip_accents(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            'à' | 'â' | 'ä' | 'á' | 'ã' | 'å' => out.push('a'),
            'À' | 'Â' | 'Ä' | 'Á' | 'Ã' | 'Å' => out.push('A'),
            'ç' => out.push('c'),
            'Ç' => out.push('C'),
            'é' | 'è' | 'ê' | 'ë' => out.push('e'),
            'É' | 'È' | 'Ê' | 'Ë' => out.push('E'),
            'î' | 'ï' | 'í' | 'ì' => out.push('i'),
            'Î' | 'Ï' | 'Í' | 'Ì' => out.push('I'),
            'ô' | 'ö' | 'ó' | 'ò' | 'õ' => out.push('o'),
            'Ô' | 'Ö' | 'Ó' | 'Ò' | 'Õ' => out.push('O'),
            'ù' | 'û' | 'ü' | 'ú' => out.push('u'),
            'Ù' | 'Û' | 'Ü' | 'Ú' => out.push('U'),
            'ÿ' | 'ý' => out.push('y'),
            'ñ' => out.push('n'),
            'Ñ' => out.push('N'),
            'œ' => out.push_str("oe"),
            'Œ' => out.push_str("OE"),
            'æ' => out.push_str("ae"),
            'Æ' => out.push_str("AE"),
            _ => out.push(c),
        }
    }
    out
}

/// Lower-case ASCII local-part fragment of a name: accents stripped, spaces and
/// apostrophes dropped, hyphens kept.
pub fn email_name_part(name: &str) -> String {
    strip_accents(name.trim())
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

/// Common French corporate address formats, most likely first.
pub fn generate_email_patterns(
    first_name: Option<&str>,
    last_name: Option<&str>,
    domain: &str,
) -> Vec<String> {
    let first = first_name.map(email_name_part).filter(|s| !s.is_empty());
    let last = last_name.map(email_name_part).filter(|s| !s.is_empty());

    let mut locals: Vec<String> = Vec::new();
    if let (Some(f), Some(l)) = (&first, &last) {
        let initial = &f[..f.chars().next().map(char::len_utf8).unwrap_or(0)];
        locals.push(format!("{}.{}", f, l));
        locals.push(format!("{}{}", f, l));
        locals.push(format!("{}.{}", initial, l));
        locals.push(format!("{}{}", initial, l));
        locals.push(format!("{}.{}", l, f));
        locals.push(format!("{}{}", l, initial));
        locals.push(f.clone());
        locals.push(l.clone());
    }
    locals.push("direction".to_string());
    locals.push("contact".to_string());

    locals
        .into_iter()
        .map(|local| format!("{}@{}", local, domain))
        .collect()
}

fn is_director_position(position: &str) -> bool {
    let p = strip_accents(position).to_lowercase();
    p.contains("directeur") || p.contains("directrice") || p.contains("direction")
}

/// Prefers a director, then someone whose position matches the target role, then the first hit.
pub fn pick_best_email<'a>(emails: &'a [HunterEmail], role: &str) -> Option<&'a HunterEmail> {
    let usable: Vec<&HunterEmail> = emails.iter().filter(|e| is_valid_email(&e.value)).collect();
    let role_key = strip_accents(role).to_lowercase();

    usable
        .iter()
        .find(|e| e.position.as_deref().is_some_and(is_director_position))
        .or_else(|| {
            usable.iter().find(|e| {
                e.position
                    .as_deref()
                    .is_some_and(|p| !role_key.is_empty() && strip_accents(p).to_lowercase().contains(&role_key))
            })
        })
        .or_else(|| usable.first())
        .copied()
}

/// Hunter confidence above 80 counts as found, anything else needs verification.
pub fn status_for_confidence(confidence: i32) -> EmailStatus {
    if confidence > 80 {
        EmailStatus::Trouve
    } else {
        EmailStatus::AVerifier
    }
}

fn email_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .ok()
    })
    .as_ref()
}

/// Syntactic check before an address is stored or sent to a validator.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.len() < 6 || email.len() > 254 {
        return false;
    }
    let Some(re) = email_regex() else {
        return false;
    };
    if !re.is_match(email) {
        tracing::debug!("Invalid email format: {}", email);
        return false;
    }
    true
}

/// Normalises a French phone number to E.164. Placeholder digits such as
/// `03 22 XX XX XX` are rejected rather than read as keypad letters.
pub fn normalize_fr_phone(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.chars().any(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    match phonenumber::parse(Some(CountryId::FR), raw) {
        Ok(number) if phonenumber::is_valid(&number) => {
            Some(number.format().mode(Mode::E164).to_string())
        }
        Ok(_) => {
            tracing::debug!("Invalid FR phone number: {}", raw);
            None
        }
        Err(e) => {
            tracing::debug!("Failed to parse FR phone '{}': {:?}", raw, e);
            None
        }
    }
}

// ============ Contact generation ============

/// Adds placeholder contacts for the first `roles` roles of the category,
/// skipping roles the establishment already has.
pub async fn create_role_contacts(
    state: &AppState,
    establishment: &Establishment,
    roles: usize,
    source: &str,
) -> Result<usize, AppError> {
    let existing = state.storage.existing_roles(establishment.id).await?;
    let mut created = 0;
    for role in roles_for_category(establishment.category()).iter().take(roles) {
        if existing.contains(&role.to_lowercase()) {
            continue;
        }
        state
            .storage
            .insert_contact(&NewContact::placeholder(establishment.id, role, source))
            .await?;
        created += 1;
    }
    Ok(created)
}

/// Cron: placeholders for establishments that have no contact yet.
pub async fn generate_contacts(state: &AppState, limit: i64) -> Result<GenerateContactsResult, AppError> {
    let establishments = state.storage.establishments_without_contacts(limit).await?;
    tracing::info!("Generating contacts for {} establishments", establishments.len());
    fill_roles(state, establishments, CRON_ROLES_PER_ESTABLISHMENT, "auto_generated").await
}

/// Manual bulk action: top every establishment up to three roles.
pub async fn bulk_create_contacts(state: &AppState, limit: i64) -> Result<GenerateContactsResult, AppError> {
    let establishments = state.storage.list_establishments(limit).await?;
    fill_roles(state, establishments, BULK_ROLES_PER_ESTABLISHMENT, "auto_generated").await
}

async fn fill_roles(
    state: &AppState,
    establishments: Vec<Establishment>,
    roles: usize,
    source: &str,
) -> Result<GenerateContactsResult, AppError> {
    let mut result = GenerateContactsResult {
        establishments: establishments.len(),
        ..Default::default()
    };
    for establishment in &establishments {
        match create_role_contacts(state, establishment, roles, source).await {
            Ok(n) => result.created += n,
            Err(e) => result.errors.push(format!("{}: {}", establishment.name, e)),
        }
    }
    tracing::info!(
        "Contact generation: {} created over {} establishments",
        result.created,
        result.establishments
    );
    Ok(result)
}

// ============ Email discovery ============

#[derive(Debug, Clone, PartialEq)]
pub struct FoundEmail {
    pub email: String,
    pub status: EmailStatus,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub source: &'static str,
}

fn hunter(state: &AppState) -> Result<&HunterService, AppError> {
    state
        .hunter
        .as_ref()
        .ok_or_else(|| AppError::VendorUnavailable("Hunter not configured".to_string()))
}

/// Domain for an establishment: website first, else a Hunter company lookup
/// whose result is written back as the website.
pub async fn resolve_domain(
    state: &AppState,
    establishment_id: Uuid,
    name: &str,
    city: Option<&str>,
    website: Option<&str>,
) -> Result<Option<String>, AppError> {
    if let Some(domain) = website.and_then(extract_domain) {
        return Ok(Some(domain));
    }
    let company = match city {
        Some(city) if !city.is_empty() => format!("{} {}", name, city),
        _ => name.to_string(),
    };
    let domain = hunter(state)?.find_company_domain(&company).await?;
    if let Some(ref d) = domain {
        tracing::info!("Resolved {} to {}", name, d);
        state
            .storage
            .set_website(establishment_id, &format!("https://{}", d))
            .await?;
    }
    Ok(domain)
}

/// Finds an address for one placeholder contact. `None` when no domain is known.
pub async fn discover_email(
    state: &AppState,
    contact: &ContactWithEstablishment,
) -> Result<Option<FoundEmail>, AppError> {
    let Some(domain) = resolve_domain(
        state,
        contact.establishment_id,
        &contact.establishment_name,
        contact.city.as_deref(),
        contact.website.as_deref(),
    )
    .await?
    else {
        return Ok(None);
    };

    let hunter = hunter(state)?;
    let search = hunter.domain_search(&domain, Some("personal"), 10).await?;
    if let Some(best) = pick_best_email(&search.emails, &contact.role) {
        return Ok(Some(FoundEmail {
            email: best.value.to_lowercase(),
            status: status_for_confidence(best.confidence),
            first_name: best.first_name.clone(),
            last_name: best.last_name.clone(),
            source: "hunter",
        }));
    }

    if let (Some(first), Some(last)) = (&contact.first_name, &contact.last_name) {
        if let Some(found) = hunter
            .email_finder(&domain, first, last, Some(&contact.establishment_name))
            .await?
        {
            if let Some(email) = found.email.filter(|e| is_valid_email(e)) {
                return Ok(Some(FoundEmail {
                    email: email.to_lowercase(),
                    status: status_for_confidence(found.score),
                    first_name: found.first_name,
                    last_name: found.last_name,
                    source: "hunter",
                }));
            }
        }
    }

    let patterns = generate_email_patterns(
        contact.first_name.as_deref(),
        contact.last_name.as_deref(),
        &domain,
    );
    let guess = if patterns.len() > 2 {
        patterns.into_iter().next()
    } else {
        Some(format!("contact@{}", domain))
    };
    Ok(guess.map(|email| FoundEmail {
        email,
        status: EmailStatus::AVerifier,
        first_name: None,
        last_name: None,
        source: "pattern_guess",
    }))
}

/// Cron: discovers addresses for placeholder contacts.
pub async fn enrich_contacts(state: &AppState, limit: i64) -> Result<EnrichResult, AppError> {
    let mut result = EnrichResult::default();
    if state.hunter.is_none() {
        result.errors.push("Hunter not configured".to_string());
        return Ok(result);
    }

    let contacts = state.storage.contacts_to_enrich(limit).await?;
    tracing::info!("Enriching {} contacts", contacts.len());

    for contact in &contacts {
        result.processed += 1;
        match discover_email(state, contact).await {
            Ok(Some(found)) => {
                let written = state
                    .storage
                    .set_found_email(
                        contact.id,
                        &found.email,
                        found.status,
                        found.first_name.as_deref(),
                        found.last_name.as_deref(),
                        found.source,
                    )
                    .await?;
                if written {
                    result.enriched += 1;
                } else {
                    tracing::debug!("Contact {} changed during enrichment, skipped", contact.id);
                    result.skipped += 1;
                }
            }
            Ok(None) => {
                result.skipped += 1;
                result
                    .errors
                    .push(format!("{}: no domain found", contact.establishment_name));
            }
            Err(e) => {
                result
                    .errors
                    .push(format!("{}: {}", contact.establishment_name, e));
                if e.is_vendor_down() {
                    tracing::warn!("Stopping enrichment batch: {}", e);
                    break;
                }
            }
        }
    }

    tracing::info!(
        "Enrichment done: {} processed, {} enriched, {} skipped",
        result.processed,
        result.enriched,
        result.skipped
    );
    Ok(result)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CreatedContact {
    pub id: Uuid,
    pub role: String,
    pub email: Option<String>,
    pub email_status: EmailStatus,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SearchContactsOutcome {
    pub domain: String,
    pub contacts: Vec<CreatedContact>,
    pub total_found: usize,
}

/// Manual action: imports every address Hunter knows for the establishment's
/// domain, then tops up with role placeholders to reach three new contacts.
pub async fn search_contacts(
    state: &AppState,
    establishment_id: Uuid,
) -> Result<SearchContactsOutcome, AppError> {
    let establishment = state
        .storage
        .get_establishment(establishment_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Establishment {} not found", establishment_id)))?;

    let domain = resolve_domain(
        state,
        establishment.id,
        &establishment.name,
        establishment.city.as_deref(),
        establishment.website.as_deref(),
    )
    .await?
    .ok_or_else(|| AppError::BadRequest(format!("No domain found for {}", establishment.name)))?;

    let search = hunter(state)?.domain_search(&domain, None, 10).await?;
    let mut created = Vec::new();

    for found in search.emails.iter().filter(|e| is_valid_email(&e.value)) {
        let email = found.value.to_lowercase();
        if state
            .storage
            .contact_email_exists(establishment.id, &email)
            .await?
        {
            continue;
        }
        let role = found
            .position
            .clone()
            .or_else(|| found.department.clone())
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "Contact".to_string());
        let status = status_for_confidence(found.confidence);
        let id = state
            .storage
            .insert_contact(&NewContact {
                establishment_id: establishment.id,
                role: role.clone(),
                first_name: found.first_name.clone(),
                last_name: found.last_name.clone(),
                email: Some(email.clone()),
                email_status: status,
                source: "hunter".to_string(),
            })
            .await?;
        created.push(CreatedContact {
            id,
            role,
            email: Some(email),
            email_status: status,
        });
    }

    if created.len() < MIN_CONTACTS_PER_SEARCH {
        let existing = state.storage.existing_roles(establishment.id).await?;
        for role in roles_for_category(establishment.category()) {
            if created.len() >= MIN_CONTACTS_PER_SEARCH {
                break;
            }
            if existing.contains(&role.to_lowercase()) {
                continue;
            }
            let id = state
                .storage
                .insert_contact(&NewContact::placeholder(establishment.id, role, "auto_generated"))
                .await?;
            created.push(CreatedContact {
                id,
                role: role.to_string(),
                email: None,
                email_status: EmailStatus::ATrouver,
            });
        }
    }

    tracing::info!(
        "Contact search for {}: {} found, {} created",
        establishment.name,
        search.emails.len(),
        created.len()
    );
    Ok(SearchContactsOutcome {
        domain,
        total_found: search.emails.len(),
        contacts: created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hunter_email(value: &str, position: Option<&str>, confidence: i32) -> HunterEmail {
        HunterEmail {
            value: value.to_string(),
            kind: Some("personal".to_string()),
            confidence,
            first_name: None,
            last_name: None,
            position: position.map(str::to_string),
            department: None,
        }
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(extract_domain("www.korian.fr").as_deref(), Some("korian.fr"));
        assert_eq!(
            extract_domain("https://www.adsea80.org/etablissements/ime").as_deref(),
            Some("adsea80.org")
        );
        assert_eq!(extract_domain("HTTP://Croix-Rouge.FR").as_deref(), Some("croix-rouge.fr"));
        assert_eq!(extract_domain(""), None);
        assert_eq!(extract_domain("localhost"), None);
    }

    #[test]
    fn website_normalisation() {
        assert_eq!(
            normalize_website("www.korian.fr/").as_deref(),
            Some("https://www.korian.fr")
        );
        assert_eq!(normalize_website("  "), None);
    }

    #[test]
    fn patterns_in_priority_order() {
        let patterns = generate_email_patterns(Some("Hélène"), Some("Le Bœuf"), "ehpad.fr");
        assert_eq!(
            patterns,
            vec![
                "helene.leboeuf@ehpad.fr",
                "heleneleboeuf@ehpad.fr",
                "h.leboeuf@ehpad.fr",
                "hleboeuf@ehpad.fr",
                "leboeuf.helene@ehpad.fr",
                "leboeufh@ehpad.fr",
                "helene@ehpad.fr",
                "leboeuf@ehpad.fr",
                "direction@ehpad.fr",
                "contact@ehpad.fr",
            ]
        );
    }

    #[test]
    fn patterns_without_names_are_generic() {
        assert_eq!(
            generate_email_patterns(None, Some("Martin"), "ime.fr"),
            vec!["direction@ime.fr", "contact@ime.fr"]
        );
    }

    #[test]
    fn director_is_preferred() {
        let emails = vec![
            hunter_email("a.b@x.fr", Some("Infirmière"), 95),
            hunter_email("c.d@x.fr", Some("Directrice adjointe"), 60),
        ];
        assert_eq!(pick_best_email(&emails, "IDEC").unwrap().value, "c.d@x.fr");
    }

    #[test]
    fn role_match_then_first() {
        let emails = vec![
            hunter_email("a@x.fr", Some("Comptable"), 95),
            hunter_email("b@x.fr", Some("Cadre de santé"), 60),
        ];
        assert_eq!(pick_best_email(&emails, "Cadre de sante").unwrap().value, "b@x.fr");
        assert_eq!(pick_best_email(&emails, "Psychologue").unwrap().value, "a@x.fr");
        assert!(pick_best_email(&[], "Directeur").is_none());
    }

    #[test]
    fn confidence_threshold() {
        assert_eq!(status_for_confidence(81), EmailStatus::Trouve);
        assert_eq!(status_for_confidence(80), EmailStatus::AVerifier);
    }

    #[test]
    fn email_syntax() {
        assert!(is_valid_email("direction@ehpad-ham.fr"));
        assert!(!is_valid_email("direction@localhost"));
        assert!(!is_valid_email("not an email"));
    }

    #[test]
    fn french_phone_normalisation() {
        assert_eq!(normalize_fr_phone("03 22 22 45 00").as_deref(), Some("+33322224500"));
        assert_eq!(normalize_fr_phone("03 22 XX XX XX"), None);
        assert_eq!(normalize_fr_phone(""), None);
    }

    #[test]
    fn roles_table() {
        assert_eq!(roles_for_category(EstablishmentCategory::Ehpad).len(), 5);
        assert_eq!(roles_for_category(EstablishmentCategory::Savs), &["Directeur", "Chef de service"]);
        assert_eq!(roles_for_category(EstablishmentCategory::Ssiad)[0], "Directeur");
        assert_eq!(roles_for_category(EstablishmentCategory::Ssiad)[2], "Adjoint de direction");
    }
}
