use std::time::Duration;

use async_trait::async_trait;

use crate::{
    FerryResult, JobId, JobProgress, JobRow, JobSummary, RowId, RowStatus, RowUpdate, Tuple,
    TupleOutcome,
};

/// Durable record of every tuple of every job.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Persist all tuples as pending rows of a new job. All or nothing.
    async fn create_job(&self, store_id: &str, tuples: Vec<Tuple>) -> FerryResult<JobId>;

    /// Claim up to `limit` pending rows in row-id order.
    ///
    /// Returned rows are held under a lease; no concurrent caller receives
    /// them until they are updated or the lease lapses.
    async fn get_remaining_tuples(&self, job_id: JobId, limit: u32) -> FerryResult<Vec<JobRow>>;

    /// Extend the lease of rows that are still claimed; returns how many were
    /// extended. Workers holding rows longer than `claim_lease` call this.
    async fn renew_claims(&self, row_ids: &[RowId]) -> FerryResult<u64>;

    /// How long a claim holds without renewal.
    fn claim_lease(&self) -> Duration;

    async fn update_status(
        &self,
        row_id: RowId,
        status: RowStatus,
        reason: Option<String>,
    ) -> FerryResult<()>;

    /// Apply many row updates in one transaction.
    async fn update_statuses(&self, updates: Vec<RowUpdate>) -> FerryResult<()>;

    async fn job_progress(&self, job_id: JobId) -> FerryResult<JobProgress>;

    /// `(pending, terminal)` row counts.
    async fn get_total_and_remaining_tuples(&self, job_id: JobId) -> FerryResult<(u64, u64)> {
        let progress = self.job_progress(job_id).await?;
        Ok((progress.pending, progress.terminal()))
    }

    async fn get_job(&self, job_id: JobId) -> FerryResult<Option<JobSummary>>;

    /// Reset failed rows to pending; returns how many were reset.
    async fn retry_failed(&self, job_id: JobId) -> FerryResult<u64>;

    async fn list_jobs(&self) -> FerryResult<Vec<JobSummary>>;
}

/// Batched write primitive of the authorization service.
///
/// `Err` means the call itself failed and no per-tuple detail exists.
#[async_trait]
pub trait TupleWriter: Send + Sync {
    async fn write_batch(
        &self,
        store_id: &str,
        writes: &[Tuple],
        deletes: &[Tuple],
    ) -> FerryResult<Vec<TupleOutcome>>;
}
