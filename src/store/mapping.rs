use serde_json::Value;

/// Declarative field mapping: one target field, an ordered list of candidate
/// source paths, and an optional transform. Intake payloads arrive in several
/// historical shapes; new shapes are handled by adding a path here, not by
/// branching at call sites.
pub struct FieldMapping {
    pub target: &'static str,
    /// Dot-separated JSON paths, tried in order; first hit wins
    pub paths: &'static [&'static str],
    pub transform: Option<fn(&str) -> String>,
}

fn lowercase(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Candidate source paths for customer identity fields
pub const IDENTITY_MAPPINGS: &[FieldMapping] = &[
    FieldMapping {
        target: "first_name",
        paths: &[
            "firstName",
            "first_name",
            "contact.firstName",
            "attendee.firstName",
            "billingDetails.firstName",
        ],
        transform: None,
    },
    FieldMapping {
        target: "last_name",
        paths: &[
            "lastName",
            "last_name",
            "surname",
            "contact.lastName",
            "attendee.lastName",
            "billingDetails.lastName",
        ],
        transform: None,
    },
    FieldMapping {
        target: "email",
        paths: &[
            "email",
            "emailAddress",
            "email_address",
            "contact.email",
            "billingDetails.email",
        ],
        transform: Some(lowercase),
    },
    FieldMapping {
        target: "business_name",
        paths: &[
            "businessName",
            "business_name",
            "lodgeName",
            "organisationName",
            "organisation.name",
        ],
        transform: None,
    },
];

/// Candidate source paths for non-identity contact fields
pub const CONTACT_MAPPINGS: &[FieldMapping] = &[
    FieldMapping {
        target: "phone",
        paths: &["phone", "phoneNumber", "mobile", "contact.phone"],
        transform: None,
    },
    FieldMapping {
        target: "address",
        paths: &[
            "address",
            "addressLine1",
            "billingDetails.address.line1",
            "contact.address",
        ],
        transform: None,
    },
];

/// Candidate source paths for an embedded provider payment reference
pub const PAYMENT_REF_MAPPINGS: &[FieldMapping] = &[FieldMapping {
    target: "provider_payment_id",
    paths: &[
        "stripePaymentIntentId",
        "stripeChargeId",
        "stripe_charge_id",
        "squarePaymentId",
        "square_payment_id",
        "payment.reference",
        "payment.transactionId",
    ],
    transform: None,
}];

/// Walk a dot-separated path into a JSON object
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Evaluate a single mapping against a payload
pub fn extract(mapping: &FieldMapping, payload: &Value) -> Option<String> {
    for path in mapping.paths {
        if let Some(value) = lookup(payload, path) {
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if text.is_empty() {
                continue;
            }
            return Some(match mapping.transform {
                Some(f) => f(&text),
                None => text,
            });
        }
    }
    None
}

/// Evaluate a named target from a mapping table
pub fn extract_target(mappings: &[FieldMapping], target: &str, payload: &Value) -> Option<String> {
    mappings
        .iter()
        .find(|m| m.target == target)
        .and_then(|m| extract(m, payload))
}

/// Any provider payment reference embedded in an intake payload
pub fn embedded_payment_reference(payload: &Value) -> Option<String> {
    extract(&PAYMENT_REF_MAPPINGS[0], payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_path_wins() {
        let payload = json!({"firstName": "Grace", "first_name": "Wrong"});
        assert_eq!(
            extract_target(IDENTITY_MAPPINGS, "first_name", &payload),
            Some("Grace".to_string())
        );
    }

    #[test]
    fn test_nested_path_and_transform() {
        let payload = json!({"contact": {"email": "  Grace@Example.COM "}});
        assert_eq!(
            extract_target(IDENTITY_MAPPINGS, "email", &payload),
            Some("grace@example.com".to_string())
        );
    }

    #[test]
    fn test_missing_and_empty_values_skipped() {
        let payload = json!({"email": "", "emailAddress": "g@example.com"});
        assert_eq!(
            extract_target(IDENTITY_MAPPINGS, "email", &payload),
            Some("g@example.com".to_string())
        );
        assert_eq!(extract_target(IDENTITY_MAPPINGS, "business_name", &payload), None);
    }

    #[test]
    fn test_embedded_payment_reference() {
        let payload = json!({"payment": {"reference": "ch_42"}});
        assert_eq!(embedded_payment_reference(&payload), Some("ch_42".to_string()));
        assert_eq!(embedded_payment_reference(&json!({})), None);
    }
}
