use sha2::{Digest, Sha256};

use crate::store::mapping::{self, CONTACT_MAPPINGS, IDENTITY_MAPPINGS};
use crate::store::models::Registration;

/// Identity fields a customer is deduplicated on, plus contact fields that
/// ride along onto the customer record. Absent identity fields normalize to
/// the empty string and still participate in hashing: a missing email does
/// not prevent dedup on name + business alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityCandidate {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub business_name: String,
    /// Never hashed; copied onto the customer on creation/merge
    pub phone: String,
    pub address: String,
}

impl IdentityCandidate {
    /// Build a candidate from a registration: typed contact columns first,
    /// then the field-mapping table over the intake payload for anything
    /// the columns do not carry.
    pub fn from_registration(registration: &Registration) -> Self {
        let from_column = |column: &Option<String>, target: &str| {
            column
                .as_deref()
                .map(str::to_string)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| mapping::extract_target(IDENTITY_MAPPINGS, target, &registration.raw))
                .unwrap_or_default()
        };

        Self {
            first_name: from_column(&registration.contact_first_name, "first_name"),
            last_name: from_column(&registration.contact_last_name, "last_name"),
            email: from_column(&registration.contact_email, "email"),
            business_name: mapping::extract_target(
                IDENTITY_MAPPINGS,
                "business_name",
                &registration.raw,
            )
            .unwrap_or_default(),
            phone: mapping::extract_target(CONTACT_MAPPINGS, "phone", &registration.raw)
                .unwrap_or_default(),
            address: mapping::extract_target(CONTACT_MAPPINGS, "address", &registration.raw)
                .unwrap_or_default(),
        }
    }

    fn normalize(value: &str) -> String {
        value.trim().to_lowercase()
    }

    pub fn normalized_email(&self) -> String {
        Self::normalize(&self.email)
    }

    pub fn normalized_business_name(&self) -> String {
        Self::normalize(&self.business_name)
    }

    /// The dedup key covers only name + business when both email and
    /// business name are empty - a deliberately broad key the resolver
    /// warns about.
    pub fn is_broad_key(&self) -> bool {
        self.normalized_email().is_empty() && self.normalized_business_name().is_empty()
    }

    /// Canonical identity hash: SHA-256 over the normalized fields joined
    /// with a fixed delimiter. A pure function - identical identities always
    /// produce the same hash regardless of which registration introduced
    /// them.
    pub fn identity_hash(&self) -> String {
        let joined = format!(
            "{}|{}|{}|{}",
            Self::normalize(&self.first_name),
            Self::normalize(&self.last_name),
            Self::normalize(&self.email),
            Self::normalize(&self.business_name),
        );
        let digest = Sha256::digest(joined.as_bytes());
        hex::encode(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_idempotent() {
        let candidate = IdentityCandidate {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            ..Default::default()
        };
        assert_eq!(candidate.identity_hash(), candidate.identity_hash());
    }

    #[test]
    fn test_hash_normalizes_case_and_whitespace() {
        let a = IdentityCandidate {
            first_name: "  Ada ".into(),
            last_name: "LOVELACE".into(),
            email: "Ada@Example.COM".into(),
            ..Default::default()
        };
        let b = IdentityCandidate {
            first_name: "ada".into(),
            last_name: "lovelace".into(),
            email: "ada@example.com".into(),
            ..Default::default()
        };
        assert_eq!(a.identity_hash(), b.identity_hash());
    }

    #[test]
    fn test_distinct_identities_hash_differently() {
        let a = IdentityCandidate {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            ..Default::default()
        };
        let b = IdentityCandidate {
            email: "grace@example.com".into(),
            ..a.clone()
        };
        assert_ne!(a.identity_hash(), b.identity_hash());
    }

    #[test]
    fn test_missing_fields_still_hash() {
        let candidate = IdentityCandidate {
            first_name: "John".into(),
            last_name: "Smith".into(),
            ..Default::default()
        };
        assert!(candidate.is_broad_key());
        assert_eq!(candidate.identity_hash().len(), 64);
    }
}
