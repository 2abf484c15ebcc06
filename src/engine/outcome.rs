use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::campaign::CampaignProblem;
use crate::gateway::DeliveryError;
use crate::types::{CampaignId, LeadId, MessageId};

/// Result of handling one due enrollment within a tick.
///
/// None of these abort the batch; they are folded into the [`TickReport`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Sent {
        step: usize,
        message_id: Option<MessageId>,
        completed: bool,
    },
    Scheduled {
        step: usize,
        scheduled_at: DateTime<Utc>,
        completed: bool,
    },
    /// The ledger already had the step; the cursor was moved without sending.
    AlreadySent { step: usize, completed: bool },
    /// The cursor was past the last step.
    Completed,
    /// Another worker holds or has moved the enrollment.
    ClaimMiss,
    /// The enrollment changed between claim and send (paused, advanced...).
    Ineligible,
    /// The per-step send lock is held elsewhere.
    LockContention,
    /// Lead missing, or no usable phone number.
    MissingPhone,
    CampaignInvalid(CampaignProblem),
    /// Retryable failure; the same step is attempted again next tick.
    DeliveryFailure { step: usize, error: DeliveryError },
    /// Permanent failure or retry cap reached; the enrollment is in `error`.
    Exhausted { step: usize, error: DeliveryError },
    Previewed(Preview),
    /// Infrastructure failure while handling this enrollment.
    Errored(String),
}

/// What a dry run would do with an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewAction {
    Send,
    AdvanceAlreadySent,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub enrollment: String,
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub step_index: usize,
    pub action: PreviewAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Why the tick did or did not run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateInfo {
    pub in_window: bool,
    pub overdue: bool,
    pub forced: bool,
    pub ran: bool,
}

/// Aggregate counters returned by every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Correlates the report with the tick's log lines.
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
    pub dry: bool,
    pub limit: usize,
    pub gate: GateInfo,
    pub checked: usize,
    pub sent: usize,
    pub scheduled: usize,
    pub suppressed: usize,
    pub failed: usize,
    pub completed: usize,
    pub claim_miss: usize,
    pub already_sent: usize,
    pub no_phone: usize,
    pub invalid_campaign: usize,
    pub exhausted: usize,
    pub previewed: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previews: Vec<Preview>,
}

impl TickReport {
    pub fn new(now: DateTime<Utc>, dry: bool, forced: bool, limit: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            now,
            dry,
            limit,
            gate: GateInfo {
                forced,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Sent { completed, .. } => {
                self.sent += 1;
                self.completed += usize::from(completed);
            }
            StepOutcome::Scheduled { completed, .. } => {
                self.scheduled += 1;
                self.completed += usize::from(completed);
            }
            StepOutcome::AlreadySent { completed, .. } => {
                self.already_sent += 1;
                self.completed += usize::from(completed);
            }
            StepOutcome::Completed => self.completed += 1,
            StepOutcome::ClaimMiss => self.claim_miss += 1,
            StepOutcome::Ineligible | StepOutcome::LockContention => self.suppressed += 1,
            StepOutcome::MissingPhone => self.no_phone += 1,
            StepOutcome::CampaignInvalid(_) => self.invalid_campaign += 1,
            StepOutcome::DeliveryFailure { .. } => self.failed += 1,
            StepOutcome::Exhausted { .. } => {
                self.failed += 1;
                self.exhausted += 1;
            }
            StepOutcome::Previewed(preview) => {
                self.previewed += 1;
                self.previews.push(preview);
            }
            StepOutcome::Errored(_) => self.errors += 1,
        }
    }
}
