use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Expr, Func, Order, Query, SimpleExpr};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, QueryResult, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use tokio::sync::Mutex;

use crate::FerryConfig;
use crate::db::{ImportJob, col_name, exec, query_all, query_one};
use crate::migration::Migrator;
use crate::tuples::LocalTupleStore;
use ferry_core::{
    Condition, FerryError, FerryResult, JobId, JobLedger, JobProgress, JobRow, JobSummary, RowId,
    RowStatus, RowUpdate, Tuple, unix_millis, validate_all,
};

const ROW_COLUMNS: [ImportJob; 11] = [
    ImportJob::RowId,
    ImportJob::BulkJobId,
    ImportJob::StoreId,
    ImportJob::InsertedAt,
    ImportJob::ImportedAt,
    ImportJob::Subject,
    ImportJob::Relation,
    ImportJob::Object,
    ImportJob::Condition,
    ImportJob::Status,
    ImportJob::Reason,
];

/// Serializes write transactions issued from this process. SQLite rejects a
/// deferred transaction that reads, then writes after another writer committed.
pub(crate) type WriteGate = Arc<Mutex<()>>;

#[derive(Clone)]
pub struct LedgerStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    limits: LedgerLimits,
    write_gate: WriteGate,
    failpoints: Arc<HashSet<String>>,
}

#[derive(Clone, Copy, Debug)]
struct LedgerLimits {
    max_create_batch: usize,
    claim_lease_ms: u64,
}

impl LedgerLimits {
    fn from_config(config: &FerryConfig) -> Self {
        let defaults = crate::LimitsConfig::with_defaults();
        let limits = config.limits.clone().unwrap_or(defaults);
        Self {
            max_create_batch: limits.max_create_batch.unwrap_or(500).max(1),
            claim_lease_ms: limits.claim_lease_ms.unwrap_or(120_000),
        }
    }
}

impl LedgerStore {
    pub async fn connect(config: &FerryConfig, base_dir: &Path) -> FerryResult<Self> {
        let url = config.connection_url(base_dir)?;
        let mut options = ConnectOptions::new(url);
        options.sqlx_logging(false);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(FerryError::from)?;
        let backend = conn.get_database_backend();
        let store = Self {
            conn,
            backend,
            limits: LedgerLimits::from_config(config),
            write_gate: Arc::new(Mutex::new(())),
            failpoints: Arc::new(
                config
                    .failpoints
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .collect(),
            ),
        };
        Migrator::up(&store.conn, None)
            .await
            .map_err(FerryError::from)?;
        log::info!(
            "ledger: connected to {} backend",
            config.backend_name()
        );
        Ok(store)
    }

    pub async fn connect_sqlite(path: &Path) -> FerryResult<Self> {
        let config = FerryConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new("."))).await
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    /// Local tuple store sharing this ledger's database and write gate.
    pub fn tuple_store(&self) -> LocalTupleStore {
        LocalTupleStore::new(
            self.conn.clone(),
            self.write_gate.clone(),
            self.failpoints.clone(),
        )
    }

    fn maybe_failpoint(&self, key: &str) -> FerryResult<()> {
        if self.failpoints.contains(key) {
            Err(FerryError::storage(format!("failpoint {key}")))
        } else {
            Ok(())
        }
    }

    /// Read rows of a job without claiming them, in row-id order.
    pub async fn list_rows(
        &self,
        job_id: JobId,
        status: Option<RowStatus>,
        limit: u32,
    ) -> FerryResult<Vec<JobRow>> {
        let mut select = Query::select()
            .from(ImportJob::Table)
            .columns(ROW_COLUMNS)
            .and_where(Expr::col(ImportJob::BulkJobId).eq(job_id.to_string()))
            .order_by(ImportJob::RowId, Order::Asc)
            .limit(limit as u64)
            .to_owned();
        if let Some(status) = status {
            select.and_where(Expr::col(ImportJob::Status).eq(status_value(status)));
        }
        let rows = query_all(&self.conn, &select).await?;
        rows.iter().map(read_row).collect()
    }

    async fn apply_update(
        &self,
        tx: &DatabaseTransaction,
        update: &RowUpdate,
        now: i64,
    ) -> FerryResult<()> {
        let imported_at = (update.status == RowStatus::Inserted).then_some(now);
        let stmt = Query::update()
            .table(ImportJob::Table)
            .values([
                (ImportJob::Status, status_value(update.status).into()),
                (ImportJob::Reason, update.reason.clone().into()),
                (ImportJob::ImportedAt, imported_at.into()),
                (ImportJob::LeaseExpiresAt, Option::<i64>::None.into()),
            ])
            .and_where(Expr::col(ImportJob::RowId).eq(update.row_id.0))
            .and_where(Expr::col(ImportJob::Status).is_in([
                status_value(RowStatus::Pending),
                status_value(RowStatus::Claimed),
            ]))
            .to_owned();
        let result = exec(tx, &stmt).await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        match read_status(tx, update.row_id).await? {
            None => Err(FerryError::not_found(format!("row {}", update.row_id))),
            Some(current) if current == update.status => Ok(()),
            Some(current) => Err(FerryError::conflict(format!(
                "row {} is {}; cannot mark it {}",
                update.row_id,
                current.as_str(),
                update.status.as_str()
            ))),
        }
    }
}

#[async_trait]
impl JobLedger for LedgerStore {
    async fn create_job(&self, store_id: &str, tuples: Vec<Tuple>) -> FerryResult<JobId> {
        if store_id.trim().is_empty() {
            return Err(FerryError::validation("store id is required"));
        }
        if tuples.is_empty() {
            return Err(FerryError::validation("job has no tuples"));
        }
        validate_all(&tuples)?;
        self.maybe_failpoint("ledger.create_job")?;

        let job_id = JobId::new();
        let now = unix_millis();
        let _gate = self.write_gate.lock().await;
        let tx = self.conn.begin().await?;
        for (index, chunk) in tuples.chunks(self.limits.max_create_batch).enumerate() {
            if index > 0 {
                self.maybe_failpoint("ledger.create_job.chunk")?;
            }
            let mut insert = Query::insert()
                .into_table(ImportJob::Table)
                .columns([
                    ImportJob::BulkJobId,
                    ImportJob::StoreId,
                    ImportJob::InsertedAt,
                    ImportJob::ImportedAt,
                    ImportJob::Subject,
                    ImportJob::Relation,
                    ImportJob::Object,
                    ImportJob::Condition,
                    ImportJob::Status,
                    ImportJob::Reason,
                    ImportJob::LeaseExpiresAt,
                ])
                .to_owned();
            for tuple in chunk {
                insert.values_panic([
                    job_id.to_string().into(),
                    store_id.to_string().into(),
                    now.into(),
                    Option::<i64>::None.into(),
                    tuple.user.clone().into(),
                    tuple.relation.clone().into(),
                    tuple.object.clone().into(),
                    condition_json(tuple.condition.as_ref())?.into(),
                    status_value(RowStatus::Pending).into(),
                    Option::<String>::None.into(),
                    Option::<i64>::None.into(),
                ]);
            }
            exec(&tx, &insert).await?;
        }
        tx.commit().await?;
        log::info!(
            "ledger: created job {job_id} for store {store_id} with {} tuples",
            tuples.len()
        );
        Ok(job_id)
    }

    async fn get_remaining_tuples(&self, job_id: JobId, limit: u32) -> FerryResult<Vec<JobRow>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.maybe_failpoint("ledger.claim")?;
        let _gate = self.write_gate.lock().await;
        let now = unix_millis();
        let tx = self.conn.begin().await?;
        let select = Query::select()
            .from(ImportJob::Table)
            .columns(ROW_COLUMNS)
            .and_where(Expr::col(ImportJob::BulkJobId).eq(job_id.to_string()))
            .and_where(claimable(now))
            .order_by(ImportJob::RowId, Order::Asc)
            .limit(limit as u64)
            .to_owned();
        let rows = query_all(&tx, &select).await?;
        let lease_expires_at = now + self.limits.claim_lease_ms as i64;
        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job_row = read_row(&row)?;
            let update = Query::update()
                .table(ImportJob::Table)
                .values([
                    (
                        ImportJob::Status,
                        status_value(RowStatus::Claimed).into(),
                    ),
                    (ImportJob::LeaseExpiresAt, lease_expires_at.into()),
                ])
                .and_where(Expr::col(ImportJob::RowId).eq(job_row.row_id.0))
                .and_where(claimable(now))
                .to_owned();
            let result = exec(&tx, &update).await?;
            if result.rows_affected() == 0 {
                continue;
            }
            job_row.status = RowStatus::Claimed;
            claimed.push(job_row);
        }
        tx.commit().await?;
        log::debug!("ledger: claimed {} rows of job {job_id}", claimed.len());
        Ok(claimed)
    }

    async fn renew_claims(&self, row_ids: &[RowId]) -> FerryResult<u64> {
        if row_ids.is_empty() {
            return Ok(0);
        }
        let _gate = self.write_gate.lock().await;
        let lease_expires_at = unix_millis() + self.limits.claim_lease_ms as i64;
        let update = Query::update()
            .table(ImportJob::Table)
            .values([(ImportJob::LeaseExpiresAt, lease_expires_at.into())])
            .and_where(Expr::col(ImportJob::RowId).is_in(row_ids.iter().map(|row_id| row_id.0)))
            .and_where(Expr::col(ImportJob::Status).eq(status_value(RowStatus::Claimed)))
            .to_owned();
        let renewed = exec(&self.conn, &update).await?.rows_affected();
        log::trace!("ledger: renewed {renewed} of {} claims", row_ids.len());
        Ok(renewed)
    }

    fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.limits.claim_lease_ms)
    }

    async fn update_status(
        &self,
        row_id: RowId,
        status: RowStatus,
        reason: Option<String>,
    ) -> FerryResult<()> {
        self.update_statuses(vec![RowUpdate {
            row_id,
            status,
            reason,
        }])
        .await
    }

    async fn update_statuses(&self, updates: Vec<RowUpdate>) -> FerryResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        if let Some(update) = updates.iter().find(|update| !update.status.is_terminal()) {
            return Err(FerryError::validation(format!(
                "row {} cannot be set to {}; only retry returns rows to pending",
                update.row_id,
                update.status.as_str()
            )));
        }
        self.maybe_failpoint("ledger.update_statuses")?;
        let _gate = self.write_gate.lock().await;
        let now = unix_millis();
        let tx = self.conn.begin().await?;
        for update in &updates {
            self.apply_update(&tx, update, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn job_progress(&self, job_id: JobId) -> FerryResult<JobProgress> {
        let select = Query::select()
            .from(ImportJob::Table)
            .column(ImportJob::Status)
            .expr_as(
                Func::count(Expr::col(ImportJob::RowId)),
                Alias::new("row_count"),
            )
            .and_where(Expr::col(ImportJob::BulkJobId).eq(job_id.to_string()))
            .group_by_col(ImportJob::Status)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        if rows.is_empty() {
            return Err(FerryError::not_found(format!("job {job_id}")));
        }
        let mut progress = JobProgress::default();
        for row in rows {
            let (status, count) = read_status_count(&row)?;
            add_count(&mut progress, status, count);
        }
        Ok(progress)
    }

    async fn get_job(&self, job_id: JobId) -> FerryResult<Option<JobSummary>> {
        let select = Query::select()
            .from(ImportJob::Table)
            .column(ImportJob::StoreId)
            .column(ImportJob::Status)
            .expr_as(
                Func::min(Expr::col(ImportJob::InsertedAt)),
                Alias::new("created_at"),
            )
            .expr_as(
                Func::count(Expr::col(ImportJob::RowId)),
                Alias::new("row_count"),
            )
            .and_where(Expr::col(ImportJob::BulkJobId).eq(job_id.to_string()))
            .group_by_columns([ImportJob::StoreId, ImportJob::Status])
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut summary: Option<JobSummary> = None;
        for row in rows {
            let store_id: String = row.try_get("", &col_name(ImportJob::StoreId))?;
            let created_at: i64 = row.try_get("", "created_at")?;
            let (status, count) = read_status_count(&row)?;
            let entry = summary.get_or_insert_with(|| JobSummary {
                job_id,
                store_id,
                created_at,
                progress: JobProgress::default(),
            });
            entry.created_at = entry.created_at.min(created_at);
            add_count(&mut entry.progress, status, count);
        }
        Ok(summary)
    }

    async fn retry_failed(&self, job_id: JobId) -> FerryResult<u64> {
        let _gate = self.write_gate.lock().await;
        let update = Query::update()
            .table(ImportJob::Table)
            .values([
                (ImportJob::Status, status_value(RowStatus::Pending).into()),
                (ImportJob::Reason, Option::<String>::None.into()),
                (ImportJob::ImportedAt, Option::<i64>::None.into()),
                (ImportJob::LeaseExpiresAt, Option::<i64>::None.into()),
            ])
            .and_where(Expr::col(ImportJob::BulkJobId).eq(job_id.to_string()))
            .and_where(Expr::col(ImportJob::Status).eq(status_value(RowStatus::Failed)))
            .to_owned();
        let result = exec(&self.conn, &update).await?;
        let reset = result.rows_affected();
        log::info!("ledger: reset {reset} failed rows of job {job_id} to pending");
        Ok(reset)
    }

    async fn list_jobs(&self) -> FerryResult<Vec<JobSummary>> {
        let select = Query::select()
            .from(ImportJob::Table)
            .column(ImportJob::BulkJobId)
            .column(ImportJob::StoreId)
            .column(ImportJob::Status)
            .expr_as(
                Func::min(Expr::col(ImportJob::InsertedAt)),
                Alias::new("created_at"),
            )
            .expr_as(
                Func::count(Expr::col(ImportJob::RowId)),
                Alias::new("row_count"),
            )
            .group_by_columns([ImportJob::BulkJobId, ImportJob::StoreId, ImportJob::Status])
            .order_by(ImportJob::BulkJobId, Order::Asc)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut jobs: BTreeMap<JobId, JobSummary> = BTreeMap::new();
        for row in rows {
            let job_id = read_job_id(&row)?;
            let store_id: String = row.try_get("", &col_name(ImportJob::StoreId))?;
            let created_at: i64 = row.try_get("", "created_at")?;
            let (status, count) = read_status_count(&row)?;
            let entry = jobs.entry(job_id).or_insert_with(|| JobSummary {
                job_id,
                store_id,
                created_at,
                progress: JobProgress::default(),
            });
            entry.created_at = entry.created_at.min(created_at);
            add_count(&mut entry.progress, status, count);
        }
        Ok(jobs.into_values().collect())
    }
}

fn status_value(status: RowStatus) -> i32 {
    i32::from(status.as_i16())
}

/// Pending rows, plus claimed rows whose lease has lapsed.
fn claimable(now: i64) -> SimpleExpr {
    Expr::col(ImportJob::Status)
        .eq(status_value(RowStatus::Pending))
        .or(Expr::col(ImportJob::Status)
            .eq(status_value(RowStatus::Claimed))
            .and(Expr::col(ImportJob::LeaseExpiresAt).lt(now)))
}

fn add_count(progress: &mut JobProgress, status: RowStatus, count: u64) {
    match status {
        RowStatus::Pending | RowStatus::Claimed => progress.pending += count,
        RowStatus::Inserted => progress.inserted += count,
        RowStatus::Failed => progress.failed += count,
    }
}

fn condition_json(condition: Option<&Condition>) -> FerryResult<Option<String>> {
    condition
        .map(|condition| {
            serde_json::to_string(condition)
                .map_err(|err| FerryError::storage(format!("encode condition: {err}")))
        })
        .transpose()
}

async fn read_status<C: ConnectionTrait>(conn: &C, row_id: RowId) -> FerryResult<Option<RowStatus>> {
    let select = Query::select()
        .from(ImportJob::Table)
        .column(ImportJob::Status)
        .and_where(Expr::col(ImportJob::RowId).eq(row_id.0))
        .to_owned();
    let Some(row) = query_one(conn, &select).await? else {
        return Ok(None);
    };
    let status: i32 = row.try_get("", &col_name(ImportJob::Status))?;
    Ok(Some(read_status_code(status)?))
}

fn read_status_code(value: i32) -> FerryResult<RowStatus> {
    let code = i16::try_from(value)
        .map_err(|_| FerryError::storage(format!("unknown row status {value}")))?;
    RowStatus::from_i16(code)
}

fn read_status_count(row: &QueryResult) -> FerryResult<(RowStatus, u64)> {
    let status: i32 = row.try_get("", &col_name(ImportJob::Status))?;
    let count: i64 = row.try_get("", "row_count")?;
    Ok((read_status_code(status)?, count.max(0) as u64))
}

fn read_job_id(row: &QueryResult) -> FerryResult<JobId> {
    let raw: String = row.try_get("", &col_name(ImportJob::BulkJobId))?;
    JobId::parse(&raw).map_err(|err| FerryError::storage(err.message().to_string()))
}

fn read_row(row: &QueryResult) -> FerryResult<JobRow> {
    let row_id: i64 = row.try_get("", &col_name(ImportJob::RowId))?;
    let store_id: String = row.try_get("", &col_name(ImportJob::StoreId))?;
    let inserted_at: i64 = row.try_get("", &col_name(ImportJob::InsertedAt))?;
    let imported_at: Option<i64> = row.try_get("", &col_name(ImportJob::ImportedAt))?;
    let user: String = row.try_get("", &col_name(ImportJob::Subject))?;
    let relation: String = row.try_get("", &col_name(ImportJob::Relation))?;
    let object: String = row.try_get("", &col_name(ImportJob::Object))?;
    let condition: Option<String> = row.try_get("", &col_name(ImportJob::Condition))?;
    let status: i32 = row.try_get("", &col_name(ImportJob::Status))?;
    let reason: Option<String> = row.try_get("", &col_name(ImportJob::Reason))?;
    let condition = condition
        .map(|raw| {
            serde_json::from_str::<Condition>(&raw)
                .map_err(|err| FerryError::storage(format!("decode condition of row {row_id}: {err}")))
        })
        .transpose()?;
    Ok(JobRow {
        row_id: RowId(row_id),
        job_id: read_job_id(row)?,
        store_id,
        tuple: Tuple {
            user,
            relation,
            object,
            condition,
        },
        inserted_at,
        imported_at,
        status: read_status_code(status)?,
        reason,
    })
}
