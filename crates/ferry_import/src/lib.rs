//! Bulk import engine: batching, rate ramp, execution and reporting.

pub mod aggregator;
pub mod audit;
pub mod chunker;
pub mod executor;
pub mod ramp;
pub mod tuple_file;

pub use aggregator::ResultAggregator;
pub use audit::{AuditFilter, AuditLog};
pub use chunker::{Batch, BatchBuilder, build_batches};
pub use executor::{ImportExecutor, ImportFailure, ImportOptions, ImportReport};
pub use ramp::{RampConfig, RampController, RampStats, WorkItem};
pub use tuple_file::{CSV_HEADERS, FileFormat, TupleRecord, parse_tuples, read_tuple_file};
