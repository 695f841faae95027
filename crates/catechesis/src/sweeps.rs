//! Periodic expiry sweeps: temporary pages, audit detail past retention, raw
//! objects of closed enrollments, and extractions that never finished.
//!
//! Every job is idempotent, so overlapping or skipped runs are harmless. Each
//! job run is logged in the registry store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::access::AuditTrail;
use crate::config::MaintenanceConfig;
use crate::error::PipelineError;
use crate::objects::ObjectStore;
use crate::stores::StoreSet;
use crate::workflows::access_pages::repository as access_pages;
use crate::workflows::documents::repository as documents;
use crate::workflows::documents::service::{fail_extraction, request_manual_entry};
use crate::workflows::notify::GuardianNotifier;

const EXPIRE_PAGES: &str = "access_pages.expire";
const SCRUB_AUDIT: &str = "audit.scrub";
const PURGE_OBJECTS: &str = "documents.purge";
const RECOVER_EXTRACTIONS: &str = "documents.recover_stalled";
const STALLED_REASON: &str = "extraction did not finish; please enter the fields by hand";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_pages: u64,
    pub scrubbed_audit_entries: u64,
    pub purged_documents: u64,
    pub stalled_extractions: u64,
    pub failed_jobs: Vec<&'static str>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed_jobs.is_empty()
    }
}

/// One row of `sweep_runs`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SweepRun {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub affected: i64,
    pub outcome: String,
}

pub struct Sweeper<O, N> {
    stores: StoreSet,
    trail: AuditTrail,
    objects: Arc<O>,
    notifier: Arc<N>,
    config: MaintenanceConfig,
}

impl<O, N> Sweeper<O, N>
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    pub fn new(
        stores: StoreSet,
        objects: Arc<O>,
        notifier: Arc<N>,
        config: MaintenanceConfig,
    ) -> Self {
        let trail = AuditTrail::new(stores.enrollment().clone());
        Self {
            stores,
            trail,
            objects,
            notifier,
            config,
        }
    }

    /// Run every job once. A failing job is logged and recorded; the others
    /// still run.
    pub async fn run_once(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        match self.job(EXPIRE_PAGES, self.expire_pages(now)).await {
            Some(affected) => report.expired_pages = affected,
            None => report.failed_jobs.push(EXPIRE_PAGES),
        }
        match self.job(SCRUB_AUDIT, self.scrub_audit(now)).await {
            Some(affected) => report.scrubbed_audit_entries = affected,
            None => report.failed_jobs.push(SCRUB_AUDIT),
        }
        match self.job(PURGE_OBJECTS, self.purge_objects(now)).await {
            Some(affected) => report.purged_documents = affected,
            None => report.failed_jobs.push(PURGE_OBJECTS),
        }
        match self.job(RECOVER_EXTRACTIONS, self.recover_extractions(now)).await {
            Some(affected) => report.stalled_extractions = affected,
            None => report.failed_jobs.push(RECOVER_EXTRACTIONS),
        }

        info!(
            expired_pages = report.expired_pages,
            scrubbed = report.scrubbed_audit_entries,
            purged = report.purged_documents,
            stalled = report.stalled_extractions,
            failed = report.failed_jobs.len(),
            "sweep finished"
        );
        report
    }

    /// Run the sweeps on a fixed cadence until the task is aborted. Late ticks
    /// are skipped rather than bunched.
    pub fn spawn(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    pub async fn history(&self, limit: i64) -> Result<Vec<SweepRun>, PipelineError> {
        let runs = sqlx::query_as::<_, SweepRun>(
            "SELECT job, started_at, finished_at, affected, outcome FROM sweep_runs \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.stores.registry())
        .await?;
        Ok(runs)
    }

    async fn job<F>(&self, name: &'static str, work: F) -> Option<u64>
    where
        F: std::future::Future<Output = Result<u64, PipelineError>>,
    {
        let started_at = Utc::now();
        let result = work.await;
        let (affected, outcome) = match &result {
            Ok(affected) => (*affected, "success".to_string()),
            Err(err) => {
                warn!(job = name, error = %err, "sweep job failed");
                (0, format!("failure: {}", err.kind()))
            }
        };

        let logged = sqlx::query(
            "INSERT INTO sweep_runs (job, started_at, finished_at, affected, outcome) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(started_at)
        .bind(Utc::now())
        .bind(affected as i64)
        .bind(&outcome)
        .execute(self.stores.registry())
        .await;
        if let Err(err) = logged {
            warn!(job = name, error = %err, "sweep run could not be logged");
        }

        result.ok()
    }

    async fn expire_pages(&self, now: DateTime<Utc>) -> Result<u64, PipelineError> {
        access_pages::delete_expired(self.stores.access_pages(), now).await
    }

    async fn scrub_audit(&self, now: DateTime<Utc>) -> Result<u64, PipelineError> {
        self.trail
            .scrub_older_than(now - self.config.audit_retention)
            .await
    }

    async fn purge_objects(&self, now: DateTime<Utc>) -> Result<u64, PipelineError> {
        let cutoff = now - self.config.document_retention;
        let candidates = documents::purgeable(self.stores.enrollment(), cutoff).await?;

        let mut purged = 0;
        for (id, key) in candidates {
            let removed = self.objects.delete(&key).await?;
            if !removed {
                debug!(document = %id, "raw object already gone");
            }
            if documents::mark_purged(self.stores.enrollment(), id).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Fail documents stuck in `pending` or `running` past the stall horizon,
    /// for example after a restart, and ask their guardians for manual entry.
    async fn recover_extractions(&self, now: DateTime<Utc>) -> Result<u64, PipelineError> {
        let pool = self.stores.enrollment();
        let stalled = documents::stalled(pool, now - self.config.extraction_stall).await?;

        let mut failed = 0;
        for (id, enrollment_id) in stalled {
            if fail_extraction(&self.stores, id, STALLED_REASON).await? {
                warn!(document = %id, "stalled extraction failed over to manual entry");
                request_manual_entry(self.notifier.as_ref(), pool, enrollment_id, id, STALLED_REASON)
                    .await;
                failed += 1;
            }
        }
        Ok(failed)
    }
}
