//! NewType wrappers for strong typing throughout the engine.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a lead id where a campaign id is expected).

use serde::{Deserialize, Serialize};
use std::fmt;
use surrealdb::RecordId;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Tenant (account) that owns leads, campaigns and enrollments.
    TenantId
);

newtype_string!(
    /// Key of a lead document (the part after `lead:`).
    LeadId
);

newtype_string!(
    /// Key of a campaign document (the part after `campaign:`).
    CampaignId
);

newtype_string!(
    /// Deduplication key handed to the delivery gateway.
    ///
    /// Derived from the enrollment, the step index and the scheduled time so
    /// that a retried send of the same step carries the same key.
    IdempotencyKey
);

newtype_string!(
    /// Identifier returned by the delivery gateway for an accepted message.
    MessageId
);

impl LeadId {
    /// Record id of the lead document.
    pub fn record_id(&self) -> RecordId {
        RecordId::from_table_key("lead", self.0.clone())
    }
}

impl CampaignId {
    /// Record id of the campaign document.
    pub fn record_id(&self) -> RecordId {
        RecordId::from_table_key("campaign", self.0.clone())
    }
}

/// Deterministic record id for the enrollment of `lead` in `campaign`.
///
/// Deriving the id from the identity triple makes the store itself reject a
/// second enrollment of the same lead in the same campaign.
pub fn enrollment_record_id(tenant: &TenantId, lead: &LeadId, campaign: &CampaignId) -> RecordId {
    RecordId::from_table_key("enrollment", format!("{}|{}|{}", tenant, lead, campaign))
}
