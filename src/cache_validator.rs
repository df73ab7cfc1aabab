use sha2::{Digest, Sha256};

/// Cached vendor lookup paired with a SHA-256 digest of its payload.
///
/// Search snippets end up inside LLM prompts and domains drive outbound
/// email, so a cached value is only trusted when its digest still matches.
/// A mismatch is treated as a cache miss.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatedCacheEntry {
    pub data: String,
    /// Hex-encoded SHA-256 of `data`.
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        hex::encode(Sha256::digest(data.as_bytes()))
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// JSON form stored in the moka cache.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Returns the payload if the stored form parses and its digest matches.
    pub fn deserialize_and_validate(serialized: &str) -> Option<String> {
        let entry: ValidatedCacheEntry = serde_json::from_str(serialized).ok()?;

        if entry.is_valid() {
            Some(entry.data)
        } else {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_lines_survive_the_cache() {
        let lines = vec!["EHPAD Les Jardins: ouverture d'une unité".to_string()];
        let stored = ValidatedCacheEntry::new(serde_json::to_string(&lines).unwrap()).serialize();

        let data = ValidatedCacheEntry::deserialize_and_validate(&stored).unwrap();
        let back: Vec<String> = serde_json::from_str(&data).unwrap();
        assert_eq!(back, lines);
    }

    #[test]
    fn empty_domain_is_a_valid_negative_entry() {
        let stored = ValidatedCacheEntry::new(String::new()).serialize();
        assert_eq!(
            ValidatedCacheEntry::deserialize_and_validate(&stored),
            Some(String::new())
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let stored = ValidatedCacheEntry::new("korian.fr".to_string()).serialize();
        let tampered = stored.replace("korian.fr", "evil.example");
        assert_eq!(ValidatedCacheEntry::deserialize_and_validate(&tampered), None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(ValidatedCacheEntry::deserialize_and_validate("not json"), None);
    }
}
