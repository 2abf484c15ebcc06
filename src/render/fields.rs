//! Vendor-agnostic lookup of logical lead fields.
//!
//! Imported leads carry the same information under many header spellings
//! (`First Name`, `first_name`, `FNAME`, `Borrower First`...). Keys are
//! normalized to lowercase alphanumerics and matched against synonym sets.

use serde_json::Value;
use std::collections::BTreeMap;

const FIRST_NAME: &[&str] = &[
    "firstname",
    "first",
    "fname",
    "givenname",
    "forename",
    "clientfirstname",
    "contactfirstname",
    "leadfirstname",
    "borrowerfirstname",
    "borrowerfirst",
    "ownerfirstname",
    "insuredfirstname",
    "primaryfirstname",
];

const LAST_NAME: &[&str] = &[
    "lastname",
    "last",
    "lname",
    "surname",
    "familyname",
    "clientlastname",
    "contactlastname",
    "leadlastname",
    "borrowerlastname",
    "borrowerlast",
    "ownerlastname",
    "insuredlastname",
    "primarylastname",
];

const FULL_NAME: &[&str] = &[
    "fullname",
    "name",
    "clientname",
    "contactname",
    "leadname",
    "customername",
    "borrowername",
    "ownername",
    "insuredname",
    "primaryname",
    "clientfullname",
    "contactfullname",
];

const PHONE: &[&str] = &[
    "phone",
    "phonenumber",
    "phone1",
    "mobile",
    "mobilephone",
    "mobilenumber",
    "cell",
    "cellphone",
    "cellnumber",
    "primaryphone",
    "homephone",
    "workphone",
    "tel",
    "telephone",
    "contactphone",
    "leadphone",
    "clientphone",
    "borrowerphone",
    "phonemobile",
];

/// Lowercase and strip everything but ASCII letters and digits.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn value_as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

/// A lead's fields, indexed by normalized key.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    fields: BTreeMap<String, String>,
}

impl FieldIndex {
    pub fn new(raw: &BTreeMap<String, Value>) -> Self {
        let mut fields = BTreeMap::new();
        for (key, value) in raw {
            if let Some(text) = value_as_text(value) {
                // First spelling wins when two headers normalize to the same key.
                fields.entry(normalize_key(key)).or_insert(text);
            }
        }
        Self { fields }
    }

    /// First non-empty value among `synonyms`, in synonym order.
    pub fn find(&self, synonyms: &[&str]) -> Option<&str> {
        synonyms
            .iter()
            .find_map(|s| self.fields.get(*s))
            .map(String::as_str)
    }

    pub fn phone(&self) -> Option<String> {
        PHONE
            .iter()
            .filter_map(|s| self.fields.get(*s))
            .find_map(|raw| normalize_phone(raw))
    }

    pub fn contact_name(&self) -> PersonName {
        PersonName::compose(
            self.find(FIRST_NAME).map(str::to_string),
            self.find(LAST_NAME).map(str::to_string),
            self.find(FULL_NAME).map(str::to_string),
        )
    }
}

/// First, last and full name with the missing parts filled in from each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonName {
    pub first: Option<String>,
    pub last: Option<String>,
    pub full: Option<String>,
}

impl PersonName {
    pub fn compose(first: Option<String>, last: Option<String>, full: Option<String>) -> Self {
        let mut first = first.filter(|s| !s.trim().is_empty());
        let mut last = last.filter(|s| !s.trim().is_empty());
        let full = full.filter(|s| !s.trim().is_empty());

        if let Some(full) = &full {
            let mut parts = full.split_whitespace();
            if first.is_none() {
                first = parts.next().map(str::to_string);
            } else {
                parts.next();
            }
            if last.is_none() {
                let rest: Vec<&str> = parts.collect();
                if !rest.is_empty() {
                    last = Some(rest.join(" "));
                }
            }
        }

        let full = full.or_else(|| match (&first, &last) {
            (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
            (Some(f), None) => Some(f.clone()),
            (None, Some(l)) => Some(l.clone()),
            (None, None) => None,
        });

        Self { first, last, full }
    }

    pub fn from_full(full: &str) -> Self {
        Self::compose(None, None, Some(full.to_string()))
    }
}

/// Normalize a phone number to E.164. Bare 10-digit numbers are taken as
/// North American.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if trimmed.starts_with('+') && (10..=15).contains(&digits.len()) {
        return Some(format!("+{}", digits));
    }

    match digits.len() {
        10 => Some(format!("+1{}", digits)),
        11 if digits.starts_with('1') => Some(format!("+{}", digits)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index(value: Value) -> FieldIndex {
        let map: BTreeMap<String, Value> = serde_json::from_value(value).unwrap();
        FieldIndex::new(&map)
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("First Name"), "firstname");
        assert_eq!(normalize_key("first_name"), "firstname");
        assert_eq!(normalize_key("FIRST-NAME:"), "firstname");
    }

    #[test]
    fn test_vendor_header_variants() {
        let idx = index(json!({ "Borrower First Name": "Dana", "SURNAME": "Reyes" }));
        let name = idx.contact_name();
        assert_eq!(name.first.as_deref(), Some("Dana"));
        assert_eq!(name.last.as_deref(), Some("Reyes"));
        assert_eq!(name.full.as_deref(), Some("Dana Reyes"));
    }

    #[test]
    fn test_full_name_splits_into_parts() {
        let idx = index(json!({ "Name": "Ana Maria Lopez" }));
        let name = idx.contact_name();
        assert_eq!(name.first.as_deref(), Some("Ana"));
        assert_eq!(name.last.as_deref(), Some("Maria Lopez"));
        assert_eq!(name.full.as_deref(), Some("Ana Maria Lopez"));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let idx = index(json!({ "first_name": "  ", "fname": "Lee" }));
        assert_eq!(idx.contact_name().first.as_deref(), Some("Lee"));
    }

    #[test]
    fn test_phone_resolution_and_normalization() {
        let idx = index(json!({ "Mobile Phone": "(555) 010-2000" }));
        assert_eq!(idx.phone().as_deref(), Some("+15550102000"));

        let idx = index(json!({ "Phone": "n/a", "Cell": "1-555-010-3000" }));
        assert_eq!(idx.phone().as_deref(), Some("+15550103000"));

        let idx = index(json!({ "phone": 5550104000u64 }));
        assert_eq!(idx.phone().as_deref(), Some("+15550104000"));

        let idx = index(json!({ "email": "x@example.com" }));
        assert_eq!(idx.phone(), None);
    }

    #[test]
    fn test_normalize_phone_international() {
        assert_eq!(normalize_phone("+44 20 7946 0000").as_deref(), Some("+442079460000"));
        assert_eq!(normalize_phone("12345"), None);
    }
}
