//! # pg-tablesync
//!
//! Staged bulk-merge synchronization of PostgreSQL tables under declarative
//! column mappings.
//!
//! Rows flow from a source table through conditional filters, duplicate
//! detection and batched COPY into a job-scoped staging table; a single
//! transaction then merges staging into the destination (update-existing /
//! insert-new), removes rows absent from the source, and commits — across
//! any number of foreign-key-ordered table mappings, all-or-nothing.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_tablesync::{Config, JobRunner};
//!
//! #[tokio::main]
//! async fn main() -> pg_tablesync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let runner = JobRunner::new(config).await?;
//!     let result = runner.run(None).await?;
//!     println!("Staged {} rows", result.rows_staged);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ident;
pub mod mapping;
pub mod merge;
pub mod orchestrator;
pub mod row;
pub mod schema;
pub mod source;
pub mod staging;
pub mod value;

// Re-exports for convenient access
pub use config::Config;
pub use error::{Result, SyncError};
pub use mapping::{ColumnMapping, Conditional, ConditionalOperator, Mapping, ValueScript};
pub use orchestrator::{JobResult, JobRunner, TableOutcome};
pub use row::SourceRow;
pub use schema::{Column, ForeignKey, SchemaProvider, Table};
pub use source::{ResponseWriter, SourceReader};
pub use staging::{BulkLoader, CopyBulkLoader, StagingTable, StagingWriter};
pub use value::{SqlNullType, SqlValue};
