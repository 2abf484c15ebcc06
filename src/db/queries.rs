// Lookups and writes for the documents the engine consumes but does not own:
// campaign definitions and leads.

use crate::db::schema::*;
use crate::types::{CampaignId, LeadId, TenantId};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use surrealdb::{engine::any::Any, Surreal};

pub struct QueryBuilder;

#[derive(Debug, Deserialize)]
struct KeyRow {
    key: String,
}

impl QueryBuilder {
    /// Fetch a campaign definition by key.
    pub async fn get_campaign(
        db: &Surreal<Any>,
        id: &CampaignId,
    ) -> Result<Option<CampaignRecord>> {
        let mut res = db
            .query("SELECT * FROM $id")
            .bind(("id", id.record_id()))
            .await?;

        let rows: Vec<CampaignRecord> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Fetch a lead by key.
    pub async fn get_lead(db: &Surreal<Any>, id: &LeadId) -> Result<Option<LeadRecord>> {
        let mut res = db
            .query("SELECT * FROM $id")
            .bind(("id", id.record_id()))
            .await?;

        let rows: Vec<LeadRecord> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Write a campaign definition, replacing any existing document with the
    /// same key.
    pub async fn put_campaign(
        db: &Surreal<Any>,
        id: &CampaignId,
        data: &CampaignCreate,
    ) -> Result<CampaignRecord> {
        let mut res = db
            .query("UPSERT $id CONTENT $data")
            .bind(("id", id.record_id()))
            .bind(("data", data.clone()))
            .await?;

        let rows: Vec<CampaignRecord> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("failed to write campaign {}", id))
    }

    /// Write a lead, replacing any existing document with the same key.
    pub async fn put_lead(db: &Surreal<Any>, id: &LeadId, data: &LeadCreate) -> Result<LeadRecord> {
        let mut res = db
            .query("UPSERT $id CONTENT $data")
            .bind(("id", id.record_id()))
            .bind(("data", data.clone()))
            .await?;

        let rows: Vec<LeadRecord> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("failed to write lead {}", id))
    }

    /// Keys of a tenant's leads, optionally restricted to one folder.
    pub async fn list_lead_ids(
        db: &Surreal<Any>,
        tenant: &TenantId,
        folder: Option<&str>,
    ) -> Result<Vec<LeadId>> {
        let mut res = match folder {
            Some(folder) => {
                db.query("SELECT meta::id(id) AS key FROM lead WHERE tenant = $tenant AND folder_name = $folder ORDER BY key")
                    .bind(("tenant", tenant.clone()))
                    .bind(("folder", folder.to_string()))
                    .await?
            }
            None => {
                db.query("SELECT meta::id(id) AS key FROM lead WHERE tenant = $tenant ORDER BY key")
                    .bind(("tenant", tenant.clone()))
                    .await?
            }
        };

        let rows: Vec<KeyRow> = res.take(0)?;
        Ok(rows.into_iter().map(|row| LeadId::new(row.key)).collect())
    }
}
