use serde::{Deserialize, Serialize};

use crate::{FerryError, FerryResult, JobId, RowId, Tuple};

/// Per-row import status as persisted in the ledger.
///
/// `Claimed` is transient: a worker holds the row under a lease while its
/// batch is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Pending,
    Inserted,
    Failed,
    Claimed,
}

impl RowStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            RowStatus::Pending => 0,
            RowStatus::Inserted => 1,
            RowStatus::Failed => 2,
            RowStatus::Claimed => 3,
        }
    }

    pub fn from_i16(value: i16) -> FerryResult<Self> {
        match value {
            0 => Ok(RowStatus::Pending),
            1 => Ok(RowStatus::Inserted),
            2 => Ok(RowStatus::Failed),
            3 => Ok(RowStatus::Claimed),
            other => Err(FerryError::storage(format!("unknown row status {other}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RowStatus::Inserted | RowStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Inserted => "inserted",
            RowStatus::Failed => "failed",
            RowStatus::Claimed => "claimed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub row_id: RowId,
    pub job_id: JobId,
    pub store_id: String,
    pub tuple: Tuple,
    pub inserted_at: i64,
    pub imported_at: Option<i64>,
    pub status: RowStatus,
    pub reason: Option<String>,
}

/// Terminal outcome for one row, applied by the executor after a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowUpdate {
    pub row_id: RowId,
    pub status: RowStatus,
    pub reason: Option<String>,
}

impl RowUpdate {
    pub fn inserted(row_id: RowId) -> Self {
        Self {
            row_id,
            status: RowStatus::Inserted,
            reason: None,
        }
    }

    pub fn failed(row_id: RowId, reason: impl Into<String>) -> Self {
        Self {
            row_id,
            status: RowStatus::Failed,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Pending plus claimed rows.
    pub pending: u64,
    pub inserted: u64,
    pub failed: u64,
}

impl JobProgress {
    pub fn total(&self) -> u64 {
        self.pending + self.inserted + self.failed
    }

    pub fn terminal(&self) -> u64 {
        self.inserted + self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub store_id: String,
    pub created_at: i64,
    pub progress: JobProgress,
}
