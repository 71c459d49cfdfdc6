use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use ferry_core::{
    FerryError, FerryResult, ImportResult, JobId, JobLedger, JobProgress, JobRow, Operation,
    RowId, RowUpdate, Tuple, TupleError, TupleOutcome, TupleWriter, validate_all,
};

use crate::aggregator::ResultAggregator;
use crate::audit::AuditLog;
use crate::chunker::{Batch, BatchBuilder, build_batches};
use crate::ramp::{RampConfig, RampController, RampStats, WorkItem};

#[derive(Clone, Debug)]
pub struct ImportOptions {
    pub max_tuples_per_write: usize,
    pub ramp: RampConfig,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            max_tuples_per_write: 1,
            ramp: RampConfig::default(),
        }
    }
}

impl ImportOptions {
    pub fn validate(&self) -> FerryResult<()> {
        if self.max_tuples_per_write == 0 {
            return Err(FerryError::validation(
                "max tuples per write must be greater than zero",
            ));
        }
        self.ramp.validate()
    }
}

#[derive(Clone, Debug)]
pub struct ImportReport {
    pub result: ImportResult,
    /// Ledger counts after the run; absent for ad-hoc runs.
    pub progress: Option<JobProgress>,
    pub stats: RampStats,
}

/// A run that failed or was cancelled. When batches had already been sent,
/// `partial` carries their outcomes.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ImportFailure {
    pub error: FerryError,
    pub partial: Option<Box<ImportReport>>,
}

impl ImportFailure {
    fn with_partial(error: FerryError, report: ImportReport) -> Self {
        Self {
            error,
            partial: Some(Box::new(report)),
        }
    }

    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

impl From<FerryError> for ImportFailure {
    fn from(error: FerryError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

impl From<ImportFailure> for FerryError {
    fn from(failure: ImportFailure) -> Self {
        failure.error
    }
}

pub struct ImportExecutor {
    ledger: Arc<dyn JobLedger>,
    writer: Arc<dyn TupleWriter>,
    options: ImportOptions,
    audit: Option<AuditLog>,
}

impl ImportExecutor {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        writer: Arc<dyn TupleWriter>,
        options: ImportOptions,
    ) -> FerryResult<Self> {
        options.validate()?;
        Ok(Self {
            ledger,
            writer,
            options,
            audit: None,
        })
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Drive every pending row of `job_id` through the writer.
    ///
    /// Each work item claims its own rows when it runs, so rows claimed by
    /// another process are skipped and a crash leaves unclaimed rows pending.
    /// Work items keep coming until a claim finds nothing left. A cancelled
    /// or aborted run carries the outcomes of the batches that finished.
    pub async fn run_job(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportFailure> {
        let summary = self
            .ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| FerryError::not_found(format!("job {job_id}")))?;
        log::info!(
            "import: job {job_id} has {} pending tuples",
            summary.progress.pending
        );

        let aggregator = Arc::new(ResultAggregator::new(self.audit.clone()));
        let fatal: Arc<Mutex<Option<FerryError>>> = Arc::new(Mutex::new(None));
        let run_cancel = cancel.child_token();
        let claims = Arc::new(RunClaims::default());
        let limit = u32::try_from(self.options.max_tuples_per_write).unwrap_or(u32::MAX);
        let store_id: Arc<str> = summary.store_id.into();

        let items = std::iter::from_fn(|| {
            if claims.is_exhausted() {
                return None;
            }
            let work = JobBatch {
                ledger: self.ledger.clone(),
                writer: self.writer.clone(),
                aggregator: aggregator.clone(),
                claims: claims.clone(),
                store_id: store_id.clone(),
                job_id,
                limit,
            };
            let fatal = fatal.clone();
            let run_cancel = run_cancel.clone();
            Some(Box::pin(async move {
                let job_id = work.job_id;
                if let Err(err) = work.run().await {
                    log::error!("import: job {job_id} ledger failure: {err}");
                    let mut slot = fatal.lock().await;
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    run_cancel.cancel();
                }
            }) as WorkItem)
        });

        let controller = RampController::new(self.options.ramp)?;
        let driven = controller.drive(items, &run_cancel).await;
        let result = aggregator.snapshot().await;
        if let Some(err) = fatal.lock().await.take() {
            log::error!(
                "import: job {job_id} aborted after {} succeeded and {} failed",
                result.success_count(),
                result.failure_count()
            );
            let report = ImportReport {
                result,
                progress: None,
                stats: driven.unwrap_or_default(),
            };
            return Err(ImportFailure::with_partial(err, report));
        }
        let stats = driven?;
        let progress = self.ledger.job_progress(job_id).await?;
        log::info!(
            "import: job {job_id} run {}: {} succeeded, {} failed, {} still pending",
            if stats.cancelled { "cancelled" } else { "finished" },
            result.success_count(),
            result.failure_count(),
            progress.pending
        );
        let report = ImportReport {
            result,
            progress: Some(progress),
            stats,
        };
        if stats.cancelled {
            return Err(cancelled(report));
        }
        Ok(report)
    }

    /// Reset failed rows of `job_id` to pending, then run the job again.
    pub async fn retry_job(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportFailure> {
        let reset = self.ledger.retry_failed(job_id).await?;
        log::info!("import: job {job_id} retrying {reset} failed tuples");
        self.run_job(job_id, cancel).await
    }

    /// Write and delete tuples without recording them in the ledger.
    pub async fn run_tuples(
        &self,
        store_id: &str,
        writes: Vec<Tuple>,
        deletes: Vec<Tuple>,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportFailure> {
        if store_id.trim().is_empty() {
            return Err(FerryError::validation("store id is required").into());
        }
        validate_all(&writes)?;
        validate_all(&deletes)?;
        let batches = build_batches(writes, deletes, self.options.max_tuples_per_write)?;
        let controller = RampController::new(self.options.ramp)?;
        let aggregator = Arc::new(ResultAggregator::new(self.audit.clone()));
        let store_id: Arc<str> = store_id.into();

        let items = batches.into_iter().map(|batch| {
            let writer = self.writer.clone();
            let aggregator = aggregator.clone();
            let store_id = store_id.clone();
            Box::pin(async move {
                let outcomes = deliver(writer.as_ref(), &store_id, &batch).await;
                aggregator.record(outcomes).await;
            }) as WorkItem
        });
        let stats = controller.drive(items, cancel).await?;
        let result = aggregator.snapshot().await;
        log::info!(
            "import: ad-hoc run on store {store_id} {}: {} succeeded, {} failed",
            if stats.cancelled { "cancelled" } else { "finished" },
            result.success_count(),
            result.failure_count()
        );
        let report = ImportReport {
            result,
            progress: None,
            stats,
        };
        if stats.cancelled {
            return Err(cancelled(report));
        }
        Ok(report)
    }
}

/// Claims can come back to the same run when a lease lapses mid-write; a
/// row is handed to at most one batch per run.
#[derive(Default)]
struct RunClaims {
    handed_out: Mutex<HashSet<RowId>>,
    exhausted: AtomicBool,
}

impl RunClaims {
    fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
    }

    /// Keep only rows this run has not handed out yet, and reserve them.
    async fn take_fresh(&self, rows: Vec<JobRow>) -> Vec<JobRow> {
        let mut handed_out = self.handed_out.lock().await;
        rows.into_iter()
            .filter(|row| handed_out.insert(row.row_id))
            .collect()
    }
}

/// Claim attempts per work item that only turn up rows already in flight.
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// One durable work item: claim, write, record.
struct JobBatch {
    ledger: Arc<dyn JobLedger>,
    writer: Arc<dyn TupleWriter>,
    aggregator: Arc<ResultAggregator>,
    claims: Arc<RunClaims>,
    store_id: Arc<str>,
    job_id: JobId,
    limit: u32,
}

impl JobBatch {
    async fn run(self) -> FerryResult<()> {
        let Some(rows) = self.claim().await? else {
            return Ok(());
        };
        let tuples: Vec<Tuple> = rows.iter().map(|row| row.tuple.clone()).collect();
        let mut builder = BatchBuilder::new(tuples, Vec::new(), rows.len())?;
        let Some(batch) = builder.next_batch() else {
            return Ok(());
        };
        let outcomes = self.deliver_holding_claims(&rows, &batch).await;
        let outcomes = match_outcomes(&rows, outcomes);
        let updates = rows
            .iter()
            .zip(&outcomes)
            .map(|(row, outcome)| match &outcome.error {
                None => RowUpdate::inserted(row.row_id),
                Some(error) => RowUpdate::failed(row.row_id, error.message.clone()),
            })
            .collect();
        self.ledger.update_statuses(updates).await?;
        self.aggregator.record(outcomes).await;
        Ok(())
    }

    async fn claim(&self) -> FerryResult<Option<Vec<JobRow>>> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let rows = self
                .ledger
                .get_remaining_tuples(self.job_id, self.limit)
                .await?;
            if rows.is_empty() {
                self.claims.mark_exhausted();
                return Ok(None);
            }
            let fresh = self.claims.take_fresh(rows).await;
            if !fresh.is_empty() {
                return Ok(Some(fresh));
            }
            // Only lapsed leases of rows still in flight here; claiming them
            // renewed those leases, so the next claim moves past them.
        }
        log::debug!(
            "import: job {} claims kept returning rows already in flight",
            self.job_id
        );
        Ok(None)
    }

    /// Write the batch, renewing the rows' leases until the writer answers.
    async fn deliver_holding_claims(&self, rows: &[JobRow], batch: &Batch) -> Vec<TupleOutcome> {
        let row_ids: Vec<RowId> = rows.iter().map(|row| row.row_id).collect();
        let period = (self.ledger.claim_lease() / 2).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut write = std::pin::pin!(deliver(self.writer.as_ref(), &self.store_id, batch));
        loop {
            tokio::select! {
                biased;
                outcomes = &mut write => return outcomes,
                _ = renew.tick() => {
                    if let Err(err) = self.ledger.renew_claims(&row_ids).await {
                        log::warn!(
                            "import: job {} could not renew {} claims: {err}",
                            self.job_id,
                            row_ids.len()
                        );
                    }
                }
            }
        }
    }
}

fn cancelled(report: ImportReport) -> ImportFailure {
    let message = format!(
        "run cancelled after {} of {} dispatched batches completed",
        report.stats.completed, report.stats.dispatched
    );
    ImportFailure::with_partial(FerryError::cancelled(message), report)
}

/// Call the writer once. A failed call fails every tuple of the batch with
/// the call's error.
async fn deliver(writer: &dyn TupleWriter, store_id: &str, batch: &Batch) -> Vec<TupleOutcome> {
    match writer
        .write_batch(store_id, &batch.writes, &batch.deletes)
        .await
    {
        Ok(outcomes) => outcomes,
        Err(err) => {
            log::warn!(
                "import: batch of {} tuples for store {store_id} failed: {err}",
                batch.len()
            );
            let reason = TupleError::from(&err);
            batch
                .writes
                .iter()
                .map(|tuple| (tuple, Operation::Write))
                .chain(batch.deletes.iter().map(|tuple| (tuple, Operation::Delete)))
                .map(|(tuple, operation)| {
                    TupleOutcome::failed(tuple.clone(), operation, reason.clone())
                })
                .collect()
        }
    }
}

/// Line outcomes up with claimed rows. Writers answer in request order; when
/// one does not, fall back to matching by tuple.
fn match_outcomes(rows: &[JobRow], outcomes: Vec<TupleOutcome>) -> Vec<TupleOutcome> {
    let in_order = outcomes.len() == rows.len()
        && rows
            .iter()
            .zip(&outcomes)
            .all(|(row, outcome)| row.tuple == outcome.tuple);
    if in_order {
        return outcomes;
    }
    let mut remaining: Vec<Option<TupleOutcome>> = outcomes.into_iter().map(Some).collect();
    rows.iter()
        .map(|row| {
            let found = remaining.iter_mut().find(|slot| {
                slot.as_ref()
                    .is_some_and(|outcome| outcome.tuple == row.tuple)
            });
            match found.and_then(Option::take) {
                Some(outcome) => outcome,
                None => TupleOutcome::failed(
                    row.tuple.clone(),
                    Operation::Write,
                    TupleError::new("missing_outcome", "writer reported no outcome for tuple"),
                ),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ferry_core::{JobRow, Operation, RowId, RowStatus, Tuple, TupleOutcome};

    use super::match_outcomes;

    fn row(id: i64, user: &str) -> JobRow {
        JobRow {
            row_id: RowId(id),
            job_id: ferry_core::JobId::new(),
            store_id: "store".to_string(),
            tuple: Tuple::new(user, "viewer", "doc:1"),
            inserted_at: 0,
            imported_at: None,
            status: RowStatus::Claimed,
            reason: None,
        }
    }

    #[test]
    fn reordered_outcomes_are_matched_by_tuple() {
        let rows = vec![row(1, "user:a"), row(2, "user:b")];
        let outcomes = vec![
            TupleOutcome::succeeded(rows[1].tuple.clone(), Operation::Write),
            TupleOutcome::succeeded(rows[0].tuple.clone(), Operation::Write),
        ];
        let matched = match_outcomes(&rows, outcomes);
        assert_eq!(matched[0].tuple, rows[0].tuple);
        assert_eq!(matched[1].tuple, rows[1].tuple);
    }

    #[test]
    fn missing_outcome_fails_the_row() {
        let rows = vec![row(1, "user:a"), row(2, "user:b")];
        let outcomes = vec![TupleOutcome::succeeded(rows[0].tuple.clone(), Operation::Write)];
        let matched = match_outcomes(&rows, outcomes);
        assert!(matched[0].is_success());
        assert_eq!(
            matched[1].error.as_ref().map(|error| error.code.as_str()),
            Some("missing_outcome")
        );
    }
}
