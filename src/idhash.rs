//! Deterministic entity IDs derived from identity fields.

use sha2::{Digest, Sha256};

/// Canonical identity string for a person.
pub fn format_indv_input(name: &str, employer: &str, occupation: &str, zip: &str) -> String {
    format!(
        "{} - {} - {} - {}",
        name.trim(),
        employer.trim(),
        occupation.trim(),
        zip.trim()
    )
}

/// Canonical identity string for an organization.
pub fn format_org_input(name: &str, zip: &str) -> String {
    format!("{} - {}", name.trim(), zip.trim())
}

/// Hex SHA-256 of the canonical input. Always 64 characters, so it can never
/// be mistaken for an FEC committee or candidate ID.
pub fn new_hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

pub fn person_id(name: &str, employer: &str, occupation: &str, zip: &str) -> String {
    new_hash(&format_indv_input(name, employer, occupation, zip))
}

pub fn organization_id(name: &str, zip: &str) -> String {
    new_hash(&format_org_input(name, zip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_identity_same_id() {
        let a = person_id("DOE, JANE", "ACME", "ENGINEER", "78701");
        let b = person_id(" DOE, JANE", "ACME ", "ENGINEER", "78701");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fields_are_not_interchangeable() {
        assert_ne!(
            person_id("DOE, JANE", "ACME", "ENGINEER", "78701"),
            person_id("DOE, JANE", "ENGINEER", "ACME", "78701")
        );
        assert_ne!(
            organization_id("ACME", "78701"),
            person_id("ACME", "", "", "78701")
        );
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            new_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
