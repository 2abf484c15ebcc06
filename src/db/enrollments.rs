//! Enrollment storage: the due-set query, the optimistic claim and every
//! conditional mutation the engine performs on an enrollment.
//!
//! Every write that moves an enrollment forward is guarded by
//! `cursor_step = $expected`, so two workers holding stale snapshots can never
//! both advance the same step.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use surrealdb::{RecordId, sql::Datetime};
use tracing::{debug, info};

use crate::db::Db;
use crate::db::schema::{
    EnrollmentCreate, EnrollmentRecord, EnrollmentStatus, LegacyFlags, PauseReason,
};

/// Predicate shared by the due-set read, the overdue probe and the claim.
const DUE_PREDICATE: &str = "status = 'active'
    AND enabled = true
    AND next_send_at != NONE
    AND next_send_at <= $now
    AND (processing != true OR processing_at = NONE OR processing_at < $stale_before)";

/// Where an enrollment goes after its current step is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Move to `cursor` and send it at `next_send_at`.
    Next { cursor: u32, next_send_at: DateTime<Utc> },
    /// No steps remain; park at `cursor` as completed.
    Complete { cursor: u32 },
}

/// Whether an error is an optimistic-transaction conflict lost to another
/// writer. The store reports these only through the message text.
fn is_write_conflict(err: &surrealdb::Error) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("conflict") || message.contains("can be retried")
}

/// Whether an error reports that the record (or a unique index entry) exists.
pub(crate) fn is_already_exists(err: &surrealdb::Error) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("already exists") || message.contains("already contains")
}

#[derive(Debug, Deserialize)]
struct IdRow {
    #[allow(dead_code)]
    id: RecordId,
}

#[derive(Debug, Deserialize)]
struct LegacyRow {
    id: RecordId,
    #[serde(default)]
    status: Option<EnrollmentStatus>,
    flags: LegacyFlags,
}

/// Enrollment store for database operations.
#[derive(Clone)]
pub struct EnrollmentStore {
    db: Db,
}

impl EnrollmentStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Insert a new enrollment under its deterministic id.
    ///
    /// Returns `false` when the lead is already enrolled in the campaign.
    pub async fn create(&self, id: &RecordId, data: &EnrollmentCreate) -> Result<bool> {
        let result = async {
            self.db
                .query("CREATE $id CONTENT $data RETURN NONE")
                .bind(("id", id.clone()))
                .bind(("data", data.clone()))
                .await?
                .check()
        }
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_already_exists(&e) => {
                debug!("Enrollment {} already exists", id);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &RecordId) -> Result<Option<EnrollmentRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM $id")
            .bind(("id", id.clone()))
            .await?;

        let rows: Vec<EnrollmentRecord> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Oldest-first snapshot of at most `limit` due enrollments.
    pub async fn due_batch(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EnrollmentRecord>> {
        let query = format!(
            "SELECT * FROM enrollment WHERE {} ORDER BY next_send_at ASC LIMIT {}",
            DUE_PREDICATE, limit
        );

        let mut res = self
            .db
            .query(query)
            .bind(("now", Datetime::from(now)))
            .bind(("stale_before", Datetime::from(stale_before)))
            .await?;

        let rows: Vec<EnrollmentRecord> = res.take(0)?;
        Ok(rows)
    }

    /// Whether any due enrollment was scheduled before `overdue_before`.
    pub async fn has_overdue(
        &self,
        now: DateTime<Utc>,
        overdue_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let query = format!(
            "SELECT id FROM enrollment WHERE {} AND next_send_at < $overdue_before LIMIT 1",
            DUE_PREDICATE
        );

        let mut res = self
            .db
            .query(query)
            .bind(("now", Datetime::from(now)))
            .bind(("overdue_before", Datetime::from(overdue_before)))
            .bind(("stale_before", Datetime::from(stale_before)))
            .await?;

        let rows: Vec<IdRow> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Atomically claim an enrollment for the step at `expected_cursor`.
    ///
    /// Succeeds only if the enrollment still satisfies the due predicate and
    /// its cursor has not moved. `None` means another worker got there first
    /// (or the enrollment stopped being due), which is not an error.
    pub async fn claim(
        &self,
        id: &RecordId,
        expected_cursor: u32,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<EnrollmentRecord>> {
        let query = format!(
            "UPDATE $id SET processing = true, processing_at = $now, updated_at = $now
             WHERE {} AND cursor_step = $expected
             RETURN AFTER",
            DUE_PREDICATE
        );

        let result: surrealdb::Result<Vec<EnrollmentRecord>> = async {
            let mut res = self
                .db
                .query(query)
                .bind(("id", id.clone()))
                .bind(("now", Datetime::from(now)))
                .bind(("stale_before", Datetime::from(stale_before)))
                .bind(("expected", expected_cursor))
                .await?;
            res.take(0)
        }
        .await;

        match result {
            Ok(rows) => Ok(rows.into_iter().next()),
            Err(e) if is_write_conflict(&e) => {
                debug!("Claim on {} lost a write conflict: {}", id, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the claim flag. Safe to call whether or not the claim is held.
    pub async fn release(&self, id: &RecordId, now: DateTime<Utc>) -> Result<()> {
        self.db
            .query("UPDATE $id SET processing = false, processing_at = NONE, updated_at = $now RETURN NONE")
            .bind(("id", id.clone()))
            .bind(("now", Datetime::from(now)))
            .await?
            .check()?;

        Ok(())
    }

    /// Persist the delivery ledger for the step at `cursor`.
    ///
    /// This write is durable on its own, before the cursor moves, so a crash
    /// between delivery and advance is detected as already-sent next time.
    pub async fn mark_sent(
        &self,
        id: &RecordId,
        cursor: u32,
        ledger: BTreeMap<String, Datetime>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut res = self
            .db
            .query(
                r#"
                UPDATE $id SET
                    sent_at_by_index = $ledger,
                    last_sent_at = $now,
                    updated_at = $now
                WHERE cursor_step = $cursor
                RETURN AFTER
                "#,
            )
            .bind(("id", id.clone()))
            .bind(("cursor", cursor))
            .bind(("ledger", ledger))
            .bind(("now", Datetime::from(now)))
            .await?;

        let rows: Vec<EnrollmentRecord> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Move the cursor past a settled step.
    ///
    /// Returns `false` if the cursor was no longer `from_cursor`.
    pub async fn advance(
        &self,
        id: &RecordId,
        from_cursor: u32,
        advance: Advance,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut res = match advance {
            Advance::Next { cursor, next_send_at } => {
                if cursor < from_cursor {
                    return Ok(false);
                }
                self.db
                    .query(
                        r#"
                        UPDATE $id SET
                            cursor_step = $cursor,
                            next_send_at = $next_send_at,
                            last_error = NONE,
                            attempts = 0,
                            updated_at = $now
                        WHERE cursor_step = $expected
                        RETURN AFTER
                        "#,
                    )
                    .bind(("id", id.clone()))
                    .bind(("cursor", cursor))
                    .bind(("expected", from_cursor))
                    .bind(("next_send_at", Datetime::from(next_send_at)))
                    .bind(("now", Datetime::from(now)))
                    .await?
            }
            Advance::Complete { cursor } => {
                if cursor < from_cursor {
                    return Ok(false);
                }
                self.db
                    .query(
                        r#"
                        UPDATE $id SET
                            cursor_step = $cursor,
                            status = 'completed',
                            next_send_at = NONE,
                            last_error = NONE,
                            attempts = 0,
                            completed_at = $now,
                            updated_at = $now
                        WHERE cursor_step = $expected
                        RETURN AFTER
                        "#,
                    )
                    .bind(("id", id.clone()))
                    .bind(("cursor", cursor))
                    .bind(("expected", from_cursor))
                    .bind(("now", Datetime::from(now)))
                    .await?
            }
        };

        let rows: Vec<EnrollmentRecord> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Record a failed delivery attempt of the step at `cursor`.
    ///
    /// With `terminal` set the enrollment moves to `error` and leaves the due
    /// set; otherwise it stays due and is retried on the next tick.
    pub async fn record_failure(
        &self,
        id: &RecordId,
        cursor: u32,
        error: &str,
        attempts: u32,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let status_clause = if terminal { ", status = 'error'" } else { "" };
        let query = format!(
            "UPDATE $id SET last_error = $error, attempts = $attempts, updated_at = $now{}
             WHERE cursor_step = $cursor
             RETURN AFTER",
            status_clause
        );

        let mut res = self
            .db
            .query(query)
            .bind(("id", id.clone()))
            .bind(("cursor", cursor))
            .bind(("error", error.to_string()))
            .bind(("attempts", attempts))
            .bind(("now", Datetime::from(now)))
            .await?;

        let rows: Vec<EnrollmentRecord> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Record why a step was skipped without touching cursor or status.
    pub async fn record_skip(
        &self,
        id: &RecordId,
        cursor: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db
            .query(
                "UPDATE $id SET last_error = $reason, updated_at = $now
                 WHERE cursor_step = $cursor RETURN NONE",
            )
            .bind(("id", id.clone()))
            .bind(("cursor", cursor))
            .bind(("reason", reason.to_string()))
            .bind(("now", Datetime::from(now)))
            .await?
            .check()?;

        Ok(())
    }

    /// Apply an enable/pause/stop decision.
    ///
    /// Active and paused enrollments follow the flag; completed and errored
    /// enrollments keep their status.
    pub async fn set_enabled(
        &self,
        id: &RecordId,
        enabled: bool,
        reason: Option<PauseReason>,
        now: DateTime<Utc>,
    ) -> Result<Option<EnrollmentRecord>> {
        let status = if enabled {
            EnrollmentStatus::Active
        } else {
            EnrollmentStatus::Paused
        };

        let mut res = self
            .db
            .query(
                r#"
                UPDATE $id SET enabled = $enabled, pause_reason = $reason, updated_at = $now RETURN NONE;
                UPDATE $id SET status = $status WHERE status IN ['active', 'paused'] RETURN NONE;
                SELECT * FROM $id;
                "#,
            )
            .bind(("id", id.clone()))
            .bind(("enabled", enabled))
            .bind(("reason", reason))
            .bind(("status", status))
            .bind(("now", Datetime::from(now)))
            .await?;

        let rows: Vec<EnrollmentRecord> = res.take(2)?;
        Ok(rows.into_iter().next())
    }

    /// Rewrite documents that still carry legacy enable/disable aliases into
    /// the canonical `enabled` + `pause_reason` pair. Returns the number of
    /// enrollments rewritten.
    pub async fn normalize_legacy(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT
                    id,
                    status,
                    {
                        active: active,
                        isActive: isActive,
                        enabled: enabled,
                        paused: paused,
                        isPaused: isPaused,
                        stopAll: stopAll
                    } AS flags
                FROM enrollment
                WHERE active != NONE
                    OR isActive != NONE
                    OR paused != NONE
                    OR isPaused != NONE
                    OR stopAll != NONE
                    OR type::is::bool(enabled) = false
                "#,
            )
            .await?;

        let rows: Vec<LegacyRow> = res.take(0)?;
        let mut rewritten = 0;

        for row in rows {
            let (enabled, reason) = row.flags.canonicalize();
            let status = match row.status {
                Some(status) if status.is_terminal() => Some(status),
                Some(_) if enabled => Some(EnrollmentStatus::Active),
                Some(_) => Some(EnrollmentStatus::Paused),
                None => None,
            };

            self.db
                .query(
                    r#"
                    UPDATE $id SET
                        enabled = $enabled,
                        pause_reason = $reason,
                        status = $status,
                        active = NONE,
                        isActive = NONE,
                        paused = NONE,
                        isPaused = NONE,
                        stopAll = NONE,
                        updated_at = $now
                    RETURN NONE
                    "#,
                )
                .bind(("id", row.id.clone()))
                .bind(("enabled", enabled))
                .bind(("reason", reason))
                .bind(("status", status.unwrap_or(EnrollmentStatus::Active)))
                .bind(("now", Datetime::from(now)))
                .await?
                .check()?;

            debug!("Normalized legacy flags on {}: enabled={}", row.id, enabled);
            rewritten += 1;
        }

        info!("Normalized legacy flags on {} enrollments", rewritten);
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_connection, ensure_schema, DatabaseConfig};
    use crate::types::{enrollment_record_id, CampaignId, LeadId, TenantId};
    use chrono::{Duration, NaiveDate, TimeZone};

    async fn setup_test_db() -> Db {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        db
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 15, 0, 0).unwrap()
    }

    fn create_payload(lead: &str, next_send_at: DateTime<Utc>) -> (RecordId, EnrollmentCreate) {
        let tenant = TenantId::new("acme");
        let lead = LeadId::new(lead);
        let campaign = CampaignId::new("welcome");
        let id = enrollment_record_id(&tenant, &lead, &campaign);
        let data = EnrollmentCreate {
            tenant,
            lead_id: lead,
            campaign_id: campaign,
            status: EnrollmentStatus::Active,
            cursor_step: 0,
            next_send_at: Some(Datetime::from(next_send_at)),
            processing: false,
            sent_at_by_index: BTreeMap::new(),
            attempts: 0,
            enabled: true,
            anchor_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            source: "test".to_string(),
            created_at: Datetime::from(now()),
            updated_at: Datetime::from(now()),
        };
        (id, data)
    }

    async fn seeded(store: &EnrollmentStore, lead: &str, next_send_at: DateTime<Utc>) -> RecordId {
        let (id, data) = create_payload(lead, next_send_at);
        assert!(store.create(&id, &data).await.unwrap());
        id
    }

    fn stale_before() -> DateTime<Utc> {
        now() - Duration::minutes(10)
    }

    #[tokio::test]
    async fn test_create_is_unique_per_identity() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let (id, data) = create_payload("l1", now());

        assert!(store.create(&id, &data).await.unwrap());
        assert!(!store.create(&id, &data).await.unwrap());

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, EnrollmentStatus::Active);
        assert_eq!(record.cursor_step, 0);
        assert!(record.enabled);
    }

    #[tokio::test]
    async fn test_due_batch_orders_and_filters() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let later = seeded(&store, "later", now() - Duration::minutes(1)).await;
        let earlier = seeded(&store, "earlier", now() - Duration::hours(2)).await;
        seeded(&store, "future", now() + Duration::hours(1)).await;

        let batch = store.due_batch(now(), stale_before(), 10).await.unwrap();
        let ids: Vec<RecordId> = batch.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![earlier.clone(), later]);

        let limited = store.due_batch(now(), stale_before(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, earlier);
    }

    #[tokio::test]
    async fn test_disabled_enrollment_is_not_due() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::minutes(1)).await;

        store
            .set_enabled(&id, false, Some(PauseReason::Paused), now())
            .await
            .unwrap();
        assert!(store.due_batch(now(), stale_before(), 10).await.unwrap().is_empty());

        let resumed = store.set_enabled(&id, true, None, now()).await.unwrap().unwrap();
        assert_eq!(resumed.status, EnrollmentStatus::Active);
        assert_eq!(store.due_batch(now(), stale_before(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::minutes(1)).await;

        let first = store.claim(&id, 0, now(), stale_before()).await.unwrap();
        assert!(first.unwrap().processing);

        let second = store.claim(&id, 0, now(), stale_before()).await.unwrap();
        assert!(second.is_none());

        store.release(&id, now()).await.unwrap();
        assert!(store.claim(&id, 0, now(), stale_before()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::seconds(1)).await;

        let (a, b) = tokio::join!(
            store.claim(&id, 0, now(), stale_before()),
            store.claim(&id, 0, now(), stale_before()),
        );

        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_requires_expected_cursor() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::minutes(1)).await;

        assert!(store.claim(&id, 3, now(), stale_before()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_is_reclaimable() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::hours(1)).await;

        let abandoned_at = now() - Duration::minutes(30);
        assert!(store.claim(&id, 0, abandoned_at, abandoned_at - Duration::minutes(10)).await.unwrap().is_some());

        // Still held from the point of view of a fresh claim timeout window.
        assert!(store.claim(&id, 0, now(), now() - Duration::hours(1)).await.unwrap().is_none());
        // Abandoned once it is older than the timeout.
        assert!(store.claim(&id, 0, now(), stale_before()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_advance_is_conditional_on_cursor() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::minutes(1)).await;
        let next = now() + Duration::days(3);

        let moved = store
            .advance(&id, 0, Advance::Next { cursor: 1, next_send_at: next }, now())
            .await
            .unwrap();
        assert!(moved);

        // A stale worker still believing the cursor is 0 changes nothing.
        let stale = store
            .advance(&id, 0, Advance::Next { cursor: 1, next_send_at: now() }, now())
            .await
            .unwrap();
        assert!(!stale);

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.cursor_step, 1);
        assert_eq!(record.next_send_at(), Some(next));
    }

    #[tokio::test]
    async fn test_complete_clears_next_send() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::minutes(1)).await;

        assert!(store.advance(&id, 0, Advance::Complete { cursor: 1 }, now()).await.unwrap());

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, EnrollmentStatus::Completed);
        assert!(record.next_send_at.is_none());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_sent_and_failure_bookkeeping() {
        let store = EnrollmentStore::new(setup_test_db().await);
        let id = seeded(&store, "l1", now() - Duration::minutes(1)).await;

        let record = store.get(&id).await.unwrap().unwrap();
        assert!(store.mark_sent(&id, 0, record.ledger_with(0, now()), now()).await.unwrap());
        let record = store.get(&id).await.unwrap().unwrap();
        assert!(record.has_sent(0));
        assert_eq!(record.sent_at(0), Some(now()));

        assert!(store.record_failure(&id, 0, "gateway 503", 1, false, now()).await.unwrap());
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.status, EnrollmentStatus::Active);

        assert!(store.record_failure(&id, 0, "invalid number", 2, true, now()).await.unwrap());
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, EnrollmentStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("invalid number"));
    }

    #[tokio::test]
    async fn test_normalize_legacy_flags() {
        let db = setup_test_db().await;
        let store = EnrollmentStore::new(db.clone());
        let paused = seeded(&store, "paused", now() - Duration::minutes(1)).await;
        let fine = seeded(&store, "fine", now() - Duration::minutes(1)).await;

        db.query("UPDATE $id SET isPaused = true, active = true")
            .bind(("id", paused.clone()))
            .await
            .unwrap();
        db.query("UPDATE $id SET isActive = 'true'")
            .bind(("id", fine.clone()))
            .await
            .unwrap();

        let rewritten = store.normalize_legacy(now()).await.unwrap();
        assert_eq!(rewritten, 2);

        let record = store.get(&paused).await.unwrap().unwrap();
        assert!(!record.enabled);
        assert_eq!(record.pause_reason, Some(PauseReason::Paused));
        assert_eq!(record.status, EnrollmentStatus::Paused);

        let record = store.get(&fine).await.unwrap().unwrap();
        assert!(record.enabled);
        assert_eq!(record.status, EnrollmentStatus::Active);

        // Second run finds nothing left to rewrite.
        assert_eq!(store.normalize_legacy(now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_normalize_keeps_terminal_status() {
        let db = setup_test_db().await;
        let store = EnrollmentStore::new(db.clone());
        let done = seeded(&store, "done", now() - Duration::minutes(1)).await;

        db.query("UPDATE $id SET status = 'completed', stopAll = 1")
            .bind(("id", done.clone()))
            .await
            .unwrap();

        assert_eq!(store.normalize_legacy(now()).await.unwrap(), 1);

        let record = store.get(&done).await.unwrap().unwrap();
        assert!(!record.enabled);
        assert_eq!(record.pause_reason, Some(PauseReason::Stopped));
        assert_eq!(record.status, EnrollmentStatus::Completed);
    }
}
