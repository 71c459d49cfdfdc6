use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use ferry_core::{
    Condition, FerryError, FerryResult, Operation, TupleError, TupleOutcome,
};

use crate::tuple_file::{CSV_HEADERS, FileFormat, TupleRecord};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuditFilter {
    #[default]
    All,
    FailedOnly,
}

impl AuditFilter {
    fn accepts(self, outcome: &TupleOutcome) -> bool {
        match self {
            AuditFilter::All => true,
            AuditFilter::FailedOnly => !outcome.is_success(),
        }
    }
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    user: &'a str,
    relation: &'a str,
    object: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<&'a Condition>,
    operation: Operation,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a TupleError>,
}

impl<'a> AuditRecord<'a> {
    fn new(outcome: &'a TupleOutcome) -> Self {
        Self {
            user: &outcome.tuple.user,
            relation: &outcome.tuple.relation,
            object: &outcome.tuple.object,
            condition: outcome.tuple.condition.as_ref(),
            operation: outcome.operation,
            success: outcome.is_success(),
            error: outcome.error.as_ref(),
        }
    }
}

/// Append-only outcome log. Records are flushed and synced before `append`
/// returns, so a crash loses at most the records being written. CSV logs get
/// their header with the first record, so a log nothing reached stays empty.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    format: FileFormat,
    filter: AuditFilter,
    file: Arc<Mutex<File>>,
}

impl AuditLog {
    pub fn open(path: &Path, filter: AuditFilter) -> FerryResult<Self> {
        let format = FileFormat::from_path(path)?;
        Self::open_with_format(path, format, filter)
    }

    pub fn open_with_format(
        path: &Path,
        format: FileFormat,
        filter: AuditFilter,
    ) -> FerryResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| io_error(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            filter,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, outcome: &TupleOutcome) -> FerryResult<()> {
        self.append_all(std::slice::from_ref(outcome))
    }

    /// Append a batch of outcomes with a single sync. Blocking.
    pub fn append_all(&self, outcomes: &[TupleOutcome]) -> FerryResult<()> {
        let mut payload = Vec::new();
        for outcome in outcomes {
            if self.filter.accepts(outcome) {
                payload.extend(self.encode(outcome)?);
            }
        }
        if payload.is_empty() {
            return Ok(());
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| FerryError::storage("audit log lock poisoned"))?;
        if self.format == FileFormat::Csv {
            let is_empty = file
                .metadata()
                .map_err(|err| io_error(&self.path, err))?
                .len()
                == 0;
            if is_empty {
                let mut header = CSV_HEADERS.join(",").into_bytes();
                header.push(b'\n');
                payload.splice(0..0, header);
            }
        }
        file.write_all(&payload)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data())
            .map_err(|err| io_error(&self.path, err))
    }

    fn encode(&self, outcome: &TupleOutcome) -> FerryResult<Vec<u8>> {
        match self.format {
            FileFormat::Json => {
                let mut line = serde_json::to_vec(&AuditRecord::new(outcome))
                    .map_err(|err| FerryError::storage(format!("encode audit record: {err}")))?;
                line.push(b'\n');
                Ok(line)
            }
            FileFormat::Yaml => {
                let body = serde_yaml::to_string(&AuditRecord::new(outcome))
                    .map_err(|err| FerryError::storage(format!("encode audit record: {err}")))?;
                Ok(format!("---\n{body}").into_bytes())
            }
            FileFormat::Csv => {
                let record = TupleRecord::from_tuple(&outcome.tuple)?;
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(Vec::new());
                writer
                    .serialize(&record)
                    .map_err(|err| FerryError::storage(format!("encode audit row: {err}")))?;
                writer
                    .into_inner()
                    .map_err(|err| FerryError::storage(format!("encode audit row: {err}")))
            }
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> FerryError {
    FerryError::storage(format!("audit log {}: {err}", path.display()))
}
