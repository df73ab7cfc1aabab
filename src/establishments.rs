//! Establishment import from the bundled Hauts-de-France dataset.

use crate::db_storage::{NewEstablishment, ProspectionStorage};
use crate::enrichment::{normalize_fr_phone, normalize_website};
use crate::errors::AppError;
use crate::models::{EstablishmentRecord, ImportResult, NewContact};
use std::collections::HashSet;

const EMBEDDED_DATASET: &str = include_str!("../data/establishments.json");

pub const DEFAULT_REGION: &str = "Hauts-de-France";

/// Establishments compiled into the binary.
pub fn embedded_dataset() -> Result<Vec<EstablishmentRecord>, AppError> {
    parse_dataset(EMBEDDED_DATASET)
}

pub fn parse_dataset(json: &str) -> Result<Vec<EstablishmentRecord>, AppError> {
    serde_json::from_str(json)
        .map_err(|e| AppError::InternalError(format!("Invalid establishment dataset: {}", e)))
}

/// Case-insensitive `name-city` identity of an establishment.
pub fn dedup_key(name: &str, city: &str) -> String {
    format!("{}-{}", name.trim(), city.trim()).to_lowercase()
}

pub fn normalize_record(record: &EstablishmentRecord) -> NewEstablishment {
    NewEstablishment {
        name: record.name.trim().to_string(),
        category: record.category,
        city: record.city.trim().to_string(),
        postal_code: record.postal_code.trim().to_string(),
        department: record.department.trim().to_string(),
        region: DEFAULT_REGION.to_string(),
        phone: record.phone.as_deref().and_then(normalize_fr_phone),
        website: record.website.as_deref().and_then(normalize_website),
    }
}

/// Inserts every establishment not yet known, each with a `Directeur` placeholder
/// contact and an `a_prospecter` prospection.
pub async fn import_establishments(
    storage: &ProspectionStorage,
    records: &[EstablishmentRecord],
) -> Result<ImportResult, AppError> {
    let mut result = ImportResult {
        fetched: records.len(),
        ..Default::default()
    };

    let mut known = storage.establishment_keys().await?;
    let mut batch_keys = HashSet::new();

    let fresh: Vec<&EstablishmentRecord> = records
        .iter()
        .filter(|r| {
            let key = dedup_key(&r.name, &r.city);
            !known.contains(&key) && batch_keys.insert(key)
        })
        .collect();
    result.filtered = fresh.len();
    tracing::info!(
        "Establishment import: {} fetched, {} new",
        result.fetched,
        result.filtered
    );

    for record in fresh {
        let normalized = normalize_record(record);
        let establishment_id = match storage.insert_establishment(&normalized).await {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!("Failed to insert {}: {}", record.name, e);
                result.errors.push(format!("{}: {}", record.name, e));
                continue;
            }
        };
        result.new_establishments += 1;
        known.insert(dedup_key(&record.name, &record.city));

        let contact = NewContact::placeholder(establishment_id, "Directeur", "import");
        match storage.insert_contact(&contact).await {
            Ok(contact_id) => {
                result.new_contacts += 1;
                if let Err(e) = storage.ensure_prospection(contact_id).await {
                    result.errors.push(format!("{}: {}", record.name, e));
                }
            }
            Err(e) => result.errors.push(format!("{}: {}", record.name, e)),
        }
    }

    tracing::info!(
        "Establishment import done: {} establishments, {} contacts, {} errors",
        result.new_establishments,
        result.new_contacts,
        result.errors.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EstablishmentCategory;

    #[test]
    fn embedded_dataset_parses() {
        let records = embedded_dataset().unwrap();
        assert!(records.len() > 50);
        assert!(records
            .iter()
            .any(|r| r.name == "Korian Samarobriva" && r.category == EstablishmentCategory::Ehpad));
    }

    #[test]
    fn dedup_key_ignores_case_and_padding() {
        assert_eq!(dedup_key(" EHPAD Ham", "HAM "), dedup_key("ehpad ham", "Ham"));
        assert_ne!(dedup_key("EHPAD Ham", "Ham"), dedup_key("EHPAD Ham", "Roye"));
    }

    #[test]
    fn normalize_drops_placeholder_phone_and_fixes_website() {
        let record = EstablishmentRecord {
            name: "IME de la Somme ADSEA".into(),
            category: EstablishmentCategory::Ime,
            city: "Dury".into(),
            postal_code: "80480".into(),
            department: "Somme".into(),
            phone: Some("03 22 53 77 40".into()),
            website: Some("www.adsea80.org".into()),
        };
        let n = normalize_record(&record);
        assert_eq!(n.phone.as_deref(), Some("+33322537740"));
        assert_eq!(n.website.as_deref(), Some("https://www.adsea80.org"));
        assert_eq!(n.region, DEFAULT_REGION);

        let placeholder = EstablishmentRecord {
            phone: Some("03 22 XX XX XX".into()),
            website: Some(String::new()),
            ..record
        };
        let n = normalize_record(&placeholder);
        assert_eq!(n.phone, None);
        assert_eq!(n.website, None);
    }
}
