use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use surrealdb::{RecordId, sql::Datetime};

use crate::campaign::RawStep;
use crate::types::{CampaignId, LeadId, TenantId};

/// Lifecycle state of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Error,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Why an enrollment is not runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Paused by the owner; may be resumed.
    Paused,
    /// Every campaign for the lead was stopped (e.g. the lead opted out).
    Stopped,
    /// Disabled without a more specific reason.
    Disabled,
}

fn default_true() -> bool {
    true
}

/// Persisted progress of one lead through one campaign (table: `enrollment`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    /// Derived from (tenant, lead, campaign); see `types::enrollment_record_id`.
    pub id: RecordId,
    pub tenant: TenantId,
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub status: EnrollmentStatus,
    /// Index into the campaign's ordered steps. Never decreases.
    #[serde(default)]
    pub cursor_step: u32,
    #[serde(default)]
    pub next_send_at: Option<Datetime>,
    /// Transient claim flag held by the worker executing the current step.
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub processing_at: Option<Datetime>,
    /// Step index → delivery time. Entries are only ever added.
    #[serde(default)]
    pub sent_at_by_index: BTreeMap<String, Datetime>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_sent_at: Option<Datetime>,
    /// Consecutive failed delivery attempts of the current step.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    /// Business-timezone date every step's send day is counted from.
    #[serde(default)]
    pub anchor_date: Option<NaiveDate>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub completed_at: Option<Datetime>,
    #[serde(default)]
    pub created_at: Option<Datetime>,
    #[serde(default)]
    pub updated_at: Option<Datetime>,
}

impl EnrollmentRecord {
    pub fn cursor(&self) -> usize {
        self.cursor_step as usize
    }

    /// Delivery time recorded in the ledger for `step`.
    pub fn sent_at(&self, step: usize) -> Option<DateTime<Utc>> {
        self.sent_at_by_index.get(&step.to_string()).map(|dt| dt.0)
    }

    pub fn has_sent(&self, step: usize) -> bool {
        self.sent_at_by_index.contains_key(&step.to_string())
    }

    pub fn next_send_at(&self) -> Option<DateTime<Utc>> {
        self.next_send_at.as_ref().map(|dt| dt.0)
    }

    /// Client-side mirror of the due-set predicate.
    pub fn is_due(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        let claim_free = !self.processing
            || self
                .processing_at
                .as_ref()
                .is_none_or(|at| at.0 < stale_before);

        self.status == EnrollmentStatus::Active
            && self.enabled
            && self.next_send_at().is_some_and(|at| at <= now)
            && claim_free
    }

    /// Ledger with `step` marked as delivered at `at`. An existing entry is kept.
    pub fn ledger_with(&self, step: usize, at: DateTime<Utc>) -> BTreeMap<String, Datetime> {
        let mut ledger = self.sent_at_by_index.clone();
        ledger
            .entry(step.to_string())
            .or_insert_with(|| Datetime::from(at));
        ledger
    }
}

/// Payload used when inserting a new enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentCreate {
    pub tenant: TenantId,
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub status: EnrollmentStatus,
    pub cursor_step: u32,
    pub next_send_at: Option<Datetime>,
    pub processing: bool,
    pub sent_at_by_index: BTreeMap<String, Datetime>,
    pub attempts: u32,
    pub enabled: bool,
    pub anchor_date: NaiveDate,
    pub source: String,
    pub created_at: Datetime,
    pub updated_at: Datetime,
}

/// Legacy enable/disable aliases written by older services.
///
/// Values are kept loosely typed because historical writers stored strings
/// and numbers as well as booleans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyFlags {
    #[serde(default)]
    pub active: Option<Value>,
    #[serde(default, rename = "isActive", alias = "is_active")]
    pub is_active: Option<Value>,
    #[serde(default)]
    pub enabled: Option<Value>,
    #[serde(default)]
    pub paused: Option<Value>,
    #[serde(default, rename = "isPaused", alias = "is_paused")]
    pub is_paused: Option<Value>,
    #[serde(default, rename = "stopAll", alias = "stop_all")]
    pub stop_all: Option<Value>,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !(s.is_empty() || s == "false" || s == "0" || s == "no")
        }
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl LegacyFlags {
    pub fn is_empty(&self) -> bool {
        self.active.is_none()
            && self.is_active.is_none()
            && self.enabled.is_none()
            && self.paused.is_none()
            && self.is_paused.is_none()
            && self.stop_all.is_none()
    }

    /// Collapse the alias set into `(enabled, pause_reason)`.
    ///
    /// Every enable alias that is present must be truthy and every disable
    /// alias falsy for the enrollment to stay enabled.
    pub fn canonicalize(&self) -> (bool, Option<PauseReason>) {
        if self.stop_all.as_ref().is_some_and(truthy) {
            return (false, Some(PauseReason::Stopped));
        }
        if [&self.paused, &self.is_paused]
            .iter()
            .any(|v| v.as_ref().is_some_and(truthy))
        {
            return (false, Some(PauseReason::Paused));
        }
        if [&self.active, &self.is_active, &self.enabled]
            .iter()
            .any(|v| v.as_ref().is_some_and(|v| !truthy(v)))
        {
            return (false, Some(PauseReason::Disabled));
        }
        (true, None)
    }
}

/// Campaign definition owned by the campaign service (table: `campaign`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: RecordId,
    #[serde(default)]
    pub tenant: Option<TenantId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Channel discriminator; only message campaigns are driven by the engine.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Payload used when writing a campaign definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignCreate {
    pub tenant: TenantId,
    pub name: String,
    pub active: bool,
    pub kind: String,
    pub steps: Vec<RawStep>,
    pub agent_name: Option<String>,
}

/// Lead document owned by the lead service (table: `lead`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: RecordId,
    #[serde(default)]
    pub tenant: Option<TenantId>,
    /// Imported columns under whatever header names the source used.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub folder_name: Option<String>,
}

/// Payload used when writing a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadCreate {
    pub tenant: TenantId,
    pub fields: BTreeMap<String, Value>,
    pub folder_name: Option<String>,
}

/// Named mutex entry (table: `send_lock`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub namespace: String,
    pub key: String,
    pub expires_at: Datetime,
}
