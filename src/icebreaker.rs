//! Personalised opening lines: web search through Serper, writing through Claude.

use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{ContactWithEstablishment, IcebreakerRunResult};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

pub const ICEBREAKER_MAX_TOKENS: u32 = 300;
pub const CONTEXT_SNIPPETS: usize = 3;
pub const CONTEXT_MAX_CHARS: usize = 500;
pub const BULK_ACTION_LIMIT: i64 = 10;
pub const CRON_LIMIT: i64 = 15;

/// Search queries for a contact, most specific last.
pub fn search_queries(contact: &ContactWithEstablishment) -> Vec<String> {
    let city = contact.city.as_deref().unwrap_or_default();
    let mut queries = vec![
        format!("\"{}\" {}", contact.establishment_name, city)
            .trim()
            .to_string(),
        format!("{} actualité projet", contact.establishment_name),
    ];
    if let Some(last) = contact.last_name.as_deref().filter(|l| !l.trim().is_empty()) {
        let first = contact.first_name.as_deref().unwrap_or_default();
        queries.push(format!(
            "\"{}\" {}",
            format!("{} {}", first, last).trim(),
            contact.establishment_name
        ));
    }
    queries
}

/// Removes repeated snippets, keeping the first occurrence.
pub fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// First snippets joined with ` | `, cut at a char boundary.
pub fn context_summary(snippets: &[String]) -> String {
    snippets
        .iter()
        .take(CONTEXT_SNIPPETS)
        .cloned()
        .collect::<Vec<_>>()
        .join(" | ")
        .chars()
        .take(CONTEXT_MAX_CHARS)
        .collect()
}

pub fn build_prompt(contact: &ContactWithEstablishment, snippets: &[String]) -> String {
    let name = format!(
        "{} {}",
        contact.first_name.as_deref().unwrap_or_default(),
        contact.last_name.as_deref().unwrap_or_default()
    );
    let findings = if snippets.is_empty() {
        "Aucune information spécifique trouvée.".to_string()
    } else {
        snippets.join("\n\n")
    };

    format!(
        r#"Tu es un expert en prospection B2B pour SoignantVoice, une solution de transcription vocale pour les soignants en EHPAD et établissements médico-sociaux.

CONTEXTE DU CONTACT:
- Établissement: {establishment}
- Type: {category}
- Ville: {city}
- Poste du contact: {role}
- Nom: {name}
- Site web: {website}

INFORMATIONS TROUVÉES SUR INTERNET:
{findings}

MISSION:
Génère un "ice breaker" personnalisé de 2-3 phrases MAXIMUM pour débuter un email de prospection.

RÈGLES:
1. Mentionne quelque chose de SPÉCIFIQUE à l'établissement ou à la personne (actualité, projet, rénovation, certification, événement, agrandissement, nouveau service...)
2. Montre que tu as fait des recherches (sans être intrusif)
3. Fais le lien naturellement avec les problématiques des transmissions soignantes
4. Ton chaleureux et professionnel, comme un vrai humain
5. PAS de formules génériques type "J'espère que vous allez bien"
6. Si pas d'info spécifique trouvée, utilise le contexte local (ville, région) ou le type d'établissement

Réponds UNIQUEMENT avec le ice breaker, rien d'autre."#,
        establishment = contact.establishment_name,
        category = contact.establishment_category,
        city = contact.city.as_deref().unwrap_or_default(),
        role = contact.role,
        name = name.trim(),
        website = contact.website.as_deref().unwrap_or("Non trouvé"),
        findings = findings,
    )
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GeneratedIcebreaker {
    pub success: bool,
    pub icebreaker: String,
    pub context: String,
    pub search_results_count: usize,
}

/// Runs the queries through Serper. Without Serper the prompt falls back to local context.
async fn gather_snippets(state: &AppState, queries: &[String]) -> Result<Vec<String>, AppError> {
    let Some(serper) = &state.serper else {
        return Ok(Vec::new());
    };
    let mut all = Vec::new();
    for query in queries {
        all.extend(serper.search(query).await?);
    }
    Ok(dedup_preserving_order(all))
}

async fn write_icebreaker(
    state: &AppState,
    contact: &ContactWithEstablishment,
    queries: &[String],
) -> Result<GeneratedIcebreaker, AppError> {
    let anthropic = state
        .anthropic
        .as_ref()
        .ok_or_else(|| AppError::VendorUnavailable("Anthropic not configured".to_string()))?;

    let snippets = gather_snippets(state, queries).await?;
    let prompt = build_prompt(contact, &snippets);
    let icebreaker = anthropic.complete(&prompt, ICEBREAKER_MAX_TOKENS).await?;
    let context = context_summary(&snippets);

    state
        .storage
        .save_icebreaker(contact.id, &icebreaker, &context)
        .await?;
    tracing::info!("Ice breaker generated for contact {}", contact.id);

    Ok(GeneratedIcebreaker {
        success: true,
        icebreaker,
        context,
        search_results_count: snippets.len(),
    })
}

/// Generates and stores the ice breaker of one contact, using every query.
pub async fn generate_for_contact(
    state: &AppState,
    contact_id: Uuid,
) -> Result<GeneratedIcebreaker, AppError> {
    let contact = state
        .storage
        .get_contact(contact_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Contact non trouvé".to_string()))?;
    let queries = search_queries(&contact);
    write_icebreaker(state, &contact, &queries).await
}

/// Valid contacts without an ice breaker, first query only.
pub async fn generate_bulk(state: &AppState, limit: i64) -> Result<IcebreakerRunResult, AppError> {
    let mut result = IcebreakerRunResult::default();
    if state.anthropic.is_none() {
        result.errors.push("Anthropic not configured".to_string());
        return Ok(result);
    }

    let contacts = state.storage.contacts_needing_icebreaker(limit).await?;
    tracing::info!("Generating ice breakers for {} contacts", contacts.len());

    for contact in &contacts {
        result.processed += 1;
        let queries: Vec<String> = search_queries(contact).into_iter().take(1).collect();
        match write_icebreaker(state, contact, &queries).await {
            Ok(_) => result.generated += 1,
            Err(e) => {
                result
                    .errors
                    .push(format!("{}: {}", contact.establishment_name, e));
                if e.is_vendor_down() {
                    tracing::warn!("Stopping ice breaker batch: {}", e);
                    break;
                }
            }
        }
    }
    Ok(result)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IcebreakerApis {
    pub anthropic: bool,
    pub serper: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IcebreakerStatus {
    pub total_valid_contacts: i64,
    pub with_icebreaker: i64,
    pub pending: i64,
    pub apis: IcebreakerApis,
}

pub async fn status(state: &AppState) -> Result<IcebreakerStatus, AppError> {
    let (total, with_icebreaker) = state.storage.icebreaker_counts().await?;
    Ok(IcebreakerStatus {
        total_valid_contacts: total,
        with_icebreaker,
        pending: total - with_icebreaker,
        apis: IcebreakerApis {
            anthropic: state.anthropic.is_some(),
            serper: state.serper.is_some(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(first: Option<&str>, last: Option<&str>) -> ContactWithEstablishment {
        ContactWithEstablishment {
            id: Uuid::new_v4(),
            establishment_id: Uuid::new_v4(),
            role: "Directeur".into(),
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
            email: Some("direction@ehpad-ham.fr".into()),
            email_status: "valide".into(),
            icebreaker: None,
            establishment_name: "EHPAD Les Tilleuls".into(),
            establishment_category: "EHPAD".into(),
            city: Some("Ham".into()),
            website: None,
        }
    }

    #[test]
    fn queries_include_person_when_known() {
        let q = search_queries(&contact(Some("Anne"), Some("Martin")));
        assert_eq!(
            q,
            vec![
                "\"EHPAD Les Tilleuls\" Ham",
                "EHPAD Les Tilleuls actualité projet",
                "\"Anne Martin\" EHPAD Les Tilleuls",
            ]
        );
        assert_eq!(search_queries(&contact(Some("Anne"), None)).len(), 2);
        assert_eq!(
            search_queries(&contact(None, Some("Martin")))[2],
            "\"Martin\" EHPAD Les Tilleuls"
        );
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let out = dedup_preserving_order(vec!["a".into(), "b".into(), "a".into(), "c".into()]);
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn context_takes_three_and_truncates_on_chars() {
        let snippets: Vec<String> = vec!["un".into(), "deux".into(), "trois".into(), "quatre".into()];
        assert_eq!(context_summary(&snippets), "un | deux | trois");

        let long = vec!["é".repeat(600)];
        let ctx = context_summary(&long);
        assert_eq!(ctx.chars().count(), CONTEXT_MAX_CHARS);
        assert!(ctx.chars().all(|c| c == 'é'));
    }

    #[test]
    fn prompt_falls_back_when_nothing_found() {
        let prompt = build_prompt(&contact(None, None), &[]);
        assert!(prompt.contains("Aucune information spécifique trouvée."));
        assert!(prompt.contains("Site web: Non trouvé"));
        assert!(prompt.contains("- Nom: \n"));
        assert!(prompt.ends_with("Réponds UNIQUEMENT avec le ice breaker, rien d'autre."));
    }
}
