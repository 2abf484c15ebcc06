//! The drip tick: find due enrollments, claim them one at a time, send the
//! current step and move each enrollment forward.
//!
//! A tick is stateless. Any number may run at once against the same store;
//! the conditional claim on `cursor_step` decides which worker executes a
//! step, the per-step lock guards the gateway call and the sent ledger makes
//! a crash between delivery and advance harmless.

mod outcome;

pub use outcome::{GateInfo, Preview, PreviewAction, StepOutcome, TickReport};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::{FutureExt, StreamExt, stream};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::campaign::{Campaign, CampaignProblem, CampaignStep};
use crate::config::EngineConfig;
use crate::db::{Advance, Db, EnrollmentRecord, EnrollmentStatus, EnrollmentStore, LeadRecord, QueryBuilder};
use crate::gateway::{DeliveryGateway, SendOutcome, SendRequest, idempotency_key};
use crate::lock::LockService;
use crate::render::{FieldIndex, PersonName, RenderContext, RenderDefaults, Renderer};
use crate::schedule;
use crate::types::CampaignId;

/// Lock namespace for per-step send locks.
pub const STEP_LOCK_NAMESPACE: &str = "drip-step";

/// Trigger parameters for one tick.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TickOptions {
    /// Run even outside the send window.
    #[serde(default)]
    pub force: bool,
    /// Evaluate and render without claiming, locking, sending or writing.
    #[serde(default)]
    pub dry: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

type CampaignLookup = Result<Arc<Campaign>, CampaignProblem>;

pub struct Engine {
    store: EnrollmentStore,
    gateway: Option<Arc<dyn DeliveryGateway>>,
    locks: Arc<dyn LockService>,
    config: EngineConfig,
    timezone: Tz,
    renderer: Renderer,
}

impl Engine {
    pub fn new(db: Db, locks: Arc<dyn LockService>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let timezone = config.timezone()?;
        let renderer = Renderer::new(RenderDefaults::from_config(&config));

        Ok(Self {
            store: EnrollmentStore::new(db),
            gateway: None,
            locks,
            config,
            timezone,
            renderer,
        })
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn DeliveryGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn store(&self) -> &EnrollmentStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one tick as of `now`.
    pub async fn run_tick(&self, options: TickOptions, now: DateTime<Utc>) -> Result<TickReport> {
        let limit = self.config.effective_limit(options.limit);
        let stale_before = now - self.config.claim_timeout();
        let mut report = TickReport::new(now, options.dry, options.force, limit);

        report.gate.in_window = schedule::within_window(
            now,
            self.timezone,
            self.config.window_start_hour,
            self.config.window_end_hour,
        );

        if !options.force && !report.gate.in_window {
            let overdue_before = now - self.config.overdue_grace();
            report.gate.overdue = self
                .store
                .has_overdue(now, overdue_before, stale_before)
                .await?;

            if !report.gate.overdue {
                info!("Tick {}: outside send window with nothing overdue; skipping", report.run_id);
                return Ok(report);
            }
            info!("Tick {}: outside send window but backlog is overdue", report.run_id);
        }

        if !options.dry && self.gateway.is_none() {
            bail!("Delivery gateway is not configured");
        }
        report.gate.ran = true;

        let batch = self.store.due_batch(now, stale_before, limit).await?;
        report.checked = batch.len();
        if batch.is_empty() {
            debug!("No due enrollments");
            return Ok(report);
        }

        let campaigns = self.load_campaigns(&batch).await?;

        let outcomes: Vec<StepOutcome> = stream::iter(batch)
            .map(|snapshot| {
                let campaign = campaigns
                    .get(&snapshot.campaign_id)
                    .cloned()
                    .unwrap_or(Err(CampaignProblem::Missing));
                self.process(snapshot, campaign, options.dry, now, stale_before)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            "Tick {} finished: checked={} sent={} scheduled={} suppressed={} failed={} completed={} claim_miss={} already_sent={} no_phone={} invalid_campaign={} exhausted={} previewed={} errors={}",
            report.run_id,
            report.checked,
            report.sent,
            report.scheduled,
            report.suppressed,
            report.failed,
            report.completed,
            report.claim_miss,
            report.already_sent,
            report.no_phone,
            report.invalid_campaign,
            report.exhausted,
            report.previewed,
            report.errors,
        );

        Ok(report)
    }

    /// Load and parse each campaign referenced by the batch once.
    async fn load_campaigns(
        &self,
        batch: &[EnrollmentRecord],
    ) -> Result<HashMap<CampaignId, CampaignLookup>> {
        let ids: BTreeSet<_> = batch.iter().map(|e| e.campaign_id.clone()).collect();
        let mut campaigns = HashMap::with_capacity(ids.len());

        for id in ids {
            let lookup = match QueryBuilder::get_campaign(self.store.db(), &id).await? {
                Some(record) => Campaign::from_record(id.clone(), record).map(Arc::new),
                None => Err(CampaignProblem::Missing),
            };
            if let Err(problem) = &lookup {
                warn!("Campaign {} cannot drive sends: {}", id, problem);
            }
            campaigns.insert(id, lookup);
        }

        Ok(campaigns)
    }

    async fn process(
        &self,
        snapshot: EnrollmentRecord,
        campaign: CampaignLookup,
        dry: bool,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StepOutcome {
        if dry {
            return match self.preview(&snapshot, campaign, now, stale_before).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Preview of {} failed: {}", snapshot.id, e);
                    StepOutcome::Errored(e.to_string())
                }
            };
        }

        let claimed = match self
            .store
            .claim(&snapshot.id, snapshot.cursor_step, now, stale_before)
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!("Claim miss on {}", snapshot.id);
                return StepOutcome::ClaimMiss;
            }
            Err(e) => {
                warn!("Claim on {} failed: {}", snapshot.id, e);
                return StepOutcome::Errored(e.to_string());
            }
        };

        let outcome = match AssertUnwindSafe(self.execute(&claimed, campaign, now))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("Step for {} failed: {}", claimed.id, e);
                StepOutcome::Errored(e.to_string())
            }
            Err(_) => {
                error!("Step for {} panicked", claimed.id);
                StepOutcome::Errored("step execution panicked".to_string())
            }
        };

        if let Err(e) = self.store.release(&claimed.id, now).await {
            warn!("Failed to release claim on {}: {}", claimed.id, e);
        }

        debug!("{} -> {:?}", claimed.id, outcome);
        outcome
    }

    /// Execute the current step of a claimed enrollment.
    async fn execute(
        &self,
        enrollment: &EnrollmentRecord,
        campaign: CampaignLookup,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let campaign = match campaign {
            Ok(campaign) => campaign,
            Err(problem) => return Ok(StepOutcome::CampaignInvalid(problem)),
        };

        let cursor = enrollment.cursor();
        let Some(step) = campaign.step(cursor) else {
            let advance = Advance::Complete {
                cursor: enrollment.cursor_step,
            };
            if !self.store.advance(&enrollment.id, enrollment.cursor_step, advance, now).await? {
                return Ok(StepOutcome::ClaimMiss);
            }
            info!("{} has no steps left; completed", enrollment.id);
            return Ok(StepOutcome::Completed);
        };

        if enrollment.has_sent(cursor) {
            let advance = self.next_advance(enrollment, &campaign, now);
            if !self.store.advance(&enrollment.id, enrollment.cursor_step, advance, now).await? {
                return Ok(StepOutcome::ClaimMiss);
            }
            info!("Step {} of {} was already sent; advanced", cursor, enrollment.id);
            return Ok(StepOutcome::AlreadySent {
                step: cursor,
                completed: matches!(advance, Advance::Complete { .. }),
            });
        }

        let Some(lead) = QueryBuilder::get_lead(self.store.db(), &enrollment.lead_id).await? else {
            self.store
                .record_skip(&enrollment.id, enrollment.cursor_step, "lead not found", now)
                .await?;
            return Ok(StepOutcome::MissingPhone);
        };
        let fields = FieldIndex::new(&lead.fields);
        let Some(destination) = fields.phone() else {
            self.store
                .record_skip(&enrollment.id, enrollment.cursor_step, "missing phone", now)
                .await?;
            return Ok(StepOutcome::MissingPhone);
        };
        let body = self.render_step(step, &fields, &lead, &campaign, now);

        // Claim and send are not atomic with each other; look again.
        let current = self.store.get(&enrollment.id).await?;
        let still_eligible = current.is_some_and(|c| {
            c.status == EnrollmentStatus::Active
                && c.enabled
                && c.cursor_step == enrollment.cursor_step
                && !c.has_sent(cursor)
        });
        if !still_eligible {
            info!("{} changed after claim; not sending step {}", enrollment.id, cursor);
            return Ok(StepOutcome::Ineligible);
        }

        let lock_key = format!(
            "{}:{}:{}:{}",
            enrollment.tenant, enrollment.lead_id, enrollment.campaign_id, cursor
        );
        if !self
            .locks
            .acquire(STEP_LOCK_NAMESPACE, &lock_key, self.config.lock_ttl())
            .await?
        {
            info!("Send lock {} is held; skipping", lock_key);
            return Ok(StepOutcome::LockContention);
        }

        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| anyhow!("Delivery gateway is not configured"))?;

        let request = SendRequest {
            destination,
            body,
            tenant: enrollment.tenant.clone(),
            lead_ref: enrollment.lead_id.clone(),
            idempotency_key: idempotency_key(&enrollment.id, cursor, enrollment.next_send_at()),
            enrollment_ref: enrollment.id.to_string(),
            campaign_ref: enrollment.campaign_id.clone(),
            step_index: cursor,
        };

        match gateway.send(&request).await {
            Ok(sent) => {
                let ledger = enrollment.ledger_with(cursor, now);
                if !self.store.mark_sent(&enrollment.id, enrollment.cursor_step, ledger, now).await? {
                    warn!("{} moved while step {} was being sent", enrollment.id, cursor);
                }

                let advance = self.next_advance(enrollment, &campaign, now);
                let advanced = self
                    .store
                    .advance(&enrollment.id, enrollment.cursor_step, advance, now)
                    .await?;
                if !advanced {
                    warn!("{} moved before step {} could be advanced", enrollment.id, cursor);
                }
                let completed = advanced && matches!(advance, Advance::Complete { .. });

                Ok(match sent {
                    SendOutcome::Sent { message_id } => {
                        info!("Sent step {} of {}", cursor, enrollment.id);
                        StepOutcome::Sent { step: cursor, message_id, completed }
                    }
                    SendOutcome::Scheduled { scheduled_at } => {
                        info!("Scheduled step {} of {} for {}", cursor, enrollment.id, scheduled_at);
                        StepOutcome::Scheduled { step: cursor, scheduled_at, completed }
                    }
                })
            }
            Err(error) => {
                let attempts = enrollment.attempts.saturating_add(1);
                let terminal = error.is_permanent() || attempts >= self.config.max_attempts;

                self.store
                    .record_failure(
                        &enrollment.id,
                        enrollment.cursor_step,
                        &error.to_string(),
                        attempts,
                        terminal,
                        now,
                    )
                    .await?;

                if let Err(e) = self.locks.release(STEP_LOCK_NAMESPACE, &lock_key).await {
                    warn!("Failed to release send lock {}: {}", lock_key, e);
                }

                if terminal {
                    warn!(
                        "Giving up on {} at step {} after {} attempts: {}",
                        enrollment.id, cursor, attempts, error
                    );
                    Ok(StepOutcome::Exhausted { step: cursor, error })
                } else {
                    warn!("Step {} of {} failed (attempt {}): {}", cursor, enrollment.id, attempts, error);
                    Ok(StepOutcome::DeliveryFailure { step: cursor, error })
                }
            }
        }
    }

    /// Dry-run evaluation of one due snapshot. Reads only.
    async fn preview(
        &self,
        snapshot: &EnrollmentRecord,
        campaign: CampaignLookup,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        if !snapshot.is_due(now, stale_before) {
            return Ok(StepOutcome::ClaimMiss);
        }
        let campaign = match campaign {
            Ok(campaign) => campaign,
            Err(problem) => return Ok(StepOutcome::CampaignInvalid(problem)),
        };

        let cursor = snapshot.cursor();
        let mut preview = Preview {
            enrollment: snapshot.id.to_string(),
            lead_id: snapshot.lead_id.clone(),
            campaign_id: snapshot.campaign_id.clone(),
            step_index: cursor,
            action: PreviewAction::Send,
            destination: None,
            body: None,
        };

        match campaign.step(cursor) {
            None => preview.action = PreviewAction::Complete,
            Some(_) if snapshot.has_sent(cursor) => preview.action = PreviewAction::AdvanceAlreadySent,
            Some(step) => {
                let Some(lead) = QueryBuilder::get_lead(self.store.db(), &snapshot.lead_id).await? else {
                    return Ok(StepOutcome::MissingPhone);
                };
                let fields = FieldIndex::new(&lead.fields);
                let Some(destination) = fields.phone() else {
                    return Ok(StepOutcome::MissingPhone);
                };
                preview.body = Some(self.render_step(step, &fields, &lead, &campaign, now));
                preview.destination = Some(destination);
            }
        }

        Ok(StepOutcome::Previewed(preview))
    }

    fn render_step(
        &self,
        step: &CampaignStep,
        fields: &FieldIndex,
        lead: &LeadRecord,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> String {
        let ctx = RenderContext {
            contact: fields.contact_name(),
            agent: campaign.agent_name.as_deref().map(PersonName::from_full),
            campaign_name: campaign.name.clone(),
            folder_name: lead.folder_name.clone(),
            now,
            timezone: self.timezone,
        };
        self.renderer.render(&step.text, &ctx)
    }

    /// Schedule anchor: the enrollment's start date in the business timezone.
    fn anchor_date(&self, enrollment: &EnrollmentRecord, now: DateTime<Utc>) -> NaiveDate {
        enrollment.anchor_date.unwrap_or_else(|| {
            let started = enrollment.created_at.as_ref().map(|dt| dt.0).unwrap_or(now);
            schedule::business_date(started, self.timezone)
        })
    }

    /// Where the enrollment goes once its current step is settled.
    fn next_advance(&self, enrollment: &EnrollmentRecord, campaign: &Campaign, now: DateTime<Utc>) -> Advance {
        let cursor = enrollment.cursor();
        let next = cursor + 1;
        let next_cursor = u32::try_from(next).unwrap_or(u32::MAX);

        if next >= campaign.len() {
            return Advance::Complete { cursor: next_cursor };
        }

        let next_send_at = schedule::next_send_time(
            self.anchor_date(enrollment, now),
            campaign.effective_day(cursor),
            campaign.effective_day(next),
            self.config.send_hour,
            self.timezone,
        );

        Advance::Next {
            cursor: next_cursor,
            next_send_at,
        }
    }
}
