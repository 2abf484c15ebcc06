//! Bulk enrollment of leads into a campaign.
//!
//! Each lead gets one enrollment, keyed by (tenant, lead, campaign), starting
//! at step 0. Enrolling a lead twice is reported, not failed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use surrealdb::sql::Datetime;
use tracing::{debug, info, warn};

use crate::campaign::{Campaign, CampaignProblem, DayOffset};
use crate::config::EngineConfig;
use crate::db::{EnrollmentCreate, EnrollmentStatus, EnrollmentStore, QueryBuilder};
use crate::schedule;
use crate::types::{enrollment_record_id, CampaignId, LeadId, TenantId};

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRequest {
    pub tenant: TenantId,
    pub campaign_id: CampaignId,
    /// Leads to enroll. Empty means every lead of the tenant (or of `folder`).
    #[serde(default)]
    pub lead_ids: Vec<LeadId>,
    #[serde(default)]
    pub folder: Option<String>,
    /// Provenance tag stored on each enrollment.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub requested: usize,
    pub created: usize,
    pub already_enrolled: usize,
    pub missing_leads: Vec<LeadId>,
}

#[derive(Debug)]
pub enum SeedError {
    /// The campaign cannot drive sends.
    Campaign(CampaignProblem),
    /// The campaign has no steps to send.
    EmptyCampaign,
    Store(anyhow::Error),
}

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Campaign(problem) => write!(f, "Cannot seed campaign: {}", problem),
            Self::EmptyCampaign => write!(f, "Cannot seed campaign: it has no steps"),
            Self::Store(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for SeedError {}

impl From<anyhow::Error> for SeedError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

/// First send instant of a freshly seeded enrollment.
///
/// An immediate (or unscheduled) first step is due right away; a first step
/// on day N is due at the send hour N days after the anchor.
fn initial_send_at(campaign: &Campaign, config: &EngineConfig, tz: chrono_tz::Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let anchor = schedule::business_date(now, tz);
    match campaign.step(0).map(|s| s.offset) {
        Some(DayOffset::Day(n)) => schedule::send_time(anchor, n, config.send_hour, tz),
        _ => now,
    }
}

pub async fn seed_enrollments(
    store: &EnrollmentStore,
    config: &EngineConfig,
    request: &SeedRequest,
    now: DateTime<Utc>,
) -> Result<SeedReport, SeedError> {
    let tz = config.timezone()?;

    let record = QueryBuilder::get_campaign(store.db(), &request.campaign_id)
        .await?
        .ok_or(SeedError::Campaign(CampaignProblem::Missing))?;
    if record.tenant.as_ref().is_some_and(|t| t != &request.tenant) {
        return Err(SeedError::Campaign(CampaignProblem::Missing));
    }
    let campaign = Campaign::from_record(request.campaign_id.clone(), record)
        .map_err(SeedError::Campaign)?;
    if campaign.is_empty() {
        return Err(SeedError::EmptyCampaign);
    }

    let lead_ids = if request.lead_ids.is_empty() {
        QueryBuilder::list_lead_ids(store.db(), &request.tenant, request.folder.as_deref()).await?
    } else {
        request.lead_ids.clone()
    };

    let anchor_date = schedule::business_date(now, tz);
    let next_send_at = initial_send_at(&campaign, config, tz, now);
    let source = request.source.clone().unwrap_or_else(|| "bulk".to_string());

    let mut report = SeedReport {
        requested: lead_ids.len(),
        ..Default::default()
    };

    for lead_id in lead_ids {
        let lead = QueryBuilder::get_lead(store.db(), &lead_id).await?;
        let belongs = lead.is_some_and(|l| l.tenant.as_ref().is_none_or(|t| t == &request.tenant));
        if !belongs {
            warn!("Lead {} not found for tenant {}; skipping", lead_id, request.tenant);
            report.missing_leads.push(lead_id);
            continue;
        }

        let id = enrollment_record_id(&request.tenant, &lead_id, &request.campaign_id);
        let data = EnrollmentCreate {
            tenant: request.tenant.clone(),
            lead_id: lead_id.clone(),
            campaign_id: request.campaign_id.clone(),
            status: EnrollmentStatus::Active,
            cursor_step: 0,
            next_send_at: Some(Datetime::from(next_send_at)),
            processing: false,
            sent_at_by_index: BTreeMap::new(),
            attempts: 0,
            enabled: true,
            anchor_date,
            source: source.clone(),
            created_at: Datetime::from(now),
            updated_at: Datetime::from(now),
        };

        if store.create(&id, &data).await? {
            debug!("Enrolled {} in {}", lead_id, request.campaign_id);
            report.created += 1;
        } else {
            report.already_enrolled += 1;
        }
    }

    info!(
        "Seeded campaign {}: requested={} created={} already_enrolled={} missing={}",
        request.campaign_id,
        report.requested,
        report.created,
        report.already_enrolled,
        report.missing_leads.len()
    );

    Ok(report)
}
