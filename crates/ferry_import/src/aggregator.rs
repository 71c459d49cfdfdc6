use tokio::sync::Mutex;

use ferry_core::{FailedTuple, ImportResult, TupleOutcome};

use crate::audit::AuditLog;

/// Collects outcomes from concurrently finishing batches.
pub struct ResultAggregator {
    result: Mutex<ImportResult>,
    audit: Option<AuditLog>,
}

impl ResultAggregator {
    pub fn new(audit: Option<AuditLog>) -> Self {
        Self {
            result: Mutex::new(ImportResult::default()),
            audit,
        }
    }

    pub async fn record(&self, outcomes: Vec<TupleOutcome>) {
        if let Some(audit) = &self.audit {
            write_audit(audit.clone(), outcomes.clone()).await;
        }
        let mut result = self.result.lock().await;
        for outcome in outcomes {
            let TupleOutcome { tuple, error, .. } = outcome;
            match error {
                None => result.successful.push(tuple),
                Some(reason) => result.failed.push(FailedTuple { tuple, reason }),
            }
        }
    }

    pub async fn snapshot(&self) -> ImportResult {
        self.result.lock().await.clone()
    }
}

/// File writes and syncs block, so they run off the async workers.
async fn write_audit(audit: AuditLog, outcomes: Vec<TupleOutcome>) {
    let path = audit.path().to_path_buf();
    match tokio::task::spawn_blocking(move || audit.append_all(&outcomes)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("import: audit append to {} failed: {err}", path.display()),
        Err(err) => log::warn!("import: audit writer for {} did not finish: {err}", path.display()),
    }
}
