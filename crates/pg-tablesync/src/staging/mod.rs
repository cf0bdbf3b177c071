//! Staging-table lifecycle and the staging writer.
//!
//! Each mapping gets one scratch table named from the destination table plus
//! a job-scoped suffix, created at job start and dropped unconditionally at
//! close. Rows are buffered in memory and pushed through the bulk-load
//! collaborator in fixed-size batches.

mod assemble;
mod bulk;
mod dedup;

pub use assemble::RowAssembler;
pub use bulk::{copy_text, BulkLoader, CopyBulkLoader};
pub use dedup::DuplicateDetector;

use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::ident::{qualify, quote_ident};
use crate::mapping::Mapping;
use crate::row::SourceRow;
use crate::schema::Column;
use crate::value::SqlValue;

/// Log a progress line every this many accepted rows.
const LOG_ROWS_INTERVAL: u64 = 10_000;

/// Maximum identifier length PostgreSQL keeps; staging names are truncated
/// on the destination part so the suffix always survives.
const MAX_NAME_LENGTH: usize = 63;

/// Derive the staging table name from the destination table and the
/// job-scoped suffix.
pub fn staging_table_name(destination: &str, suffix: &str) -> String {
    let max_base = MAX_NAME_LENGTH.saturating_sub(suffix.len());
    let mut base = destination.to_string();
    if base.len() > max_base {
        base.truncate(max_base);
    }
    format!("{}{}", base, suffix)
}

/// A created staging table: name, qualified SQL name and the staged columns.
#[derive(Debug, Clone)]
pub struct StagingTable {
    pub name: String,
    pub qualified: String,
    pub columns: Vec<Column>,
}

impl StagingTable {
    /// Create the scratch table for a mapping: schema-identical to the
    /// destination's mapped columns, plus any configured extra columns.
    pub async fn create(
        client: &Client,
        mapping: &Mapping,
        suffix: &str,
        extra_columns: &[String],
    ) -> Result<StagingTable> {
        let columns = mapping.staging_columns();
        let name = staging_table_name(&mapping.destination_table.name, suffix);
        let schema = &mapping.destination_table.schema;
        let qualified = qualify(schema, &name)?;

        let col_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let sql = format!(
            "CREATE UNLOGGED TABLE {} AS SELECT {} FROM {} WITH NO DATA",
            qualified,
            col_list,
            qualify(schema, &mapping.destination_table.name)?
        );
        client.execute(sql.as_str(), &[]).await?;

        for extra in extra_columns {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} integer",
                qualified,
                quote_ident(extra)?
            );
            client.execute(sql.as_str(), &[]).await?;
        }

        debug!("Created staging table {}", qualified);
        Ok(StagingTable {
            name,
            qualified,
            columns,
        })
    }

    /// Drop the scratch table. Runs on every job exit path.
    pub async fn drop(&self, client: &Client) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.qualified);
        client.execute(sql.as_str(), &[]).await?;
        debug!("Dropped staging table {}", self.qualified);
        Ok(())
    }
}

/// Buffers destination-shaped rows and batches them into the staging table.
pub struct StagingWriter<'a, L: BulkLoader> {
    mapping: &'a Mapping,
    staging: &'a StagingTable,
    assembler: RowAssembler,
    detector: Option<DuplicateDetector>,
    loader: L,
    buffer: Vec<Vec<SqlValue>>,
    batch_size: usize,
    accepted: u64,
    rejected: u64,
    filtered: u64,
    last_log_rows: u64,
}

impl<'a, L: BulkLoader> StagingWriter<'a, L> {
    pub fn new(
        mapping: &'a Mapping,
        staging: &'a StagingTable,
        loader: L,
        batch_size: usize,
        discard_duplicates: bool,
    ) -> Result<Self> {
        let assembler = RowAssembler::new(mapping)?;
        let detector = if discard_duplicates {
            Some(DuplicateDetector::new(mapping, assembler.shape())?)
        } else {
            None
        };

        Ok(Self {
            mapping,
            staging,
            assembler,
            detector,
            loader,
            buffer: Vec::new(),
            batch_size,
            accepted: 0,
            rejected: 0,
            filtered: 0,
            last_log_rows: 0,
        })
    }

    /// Write one source row: conditionals, assembly, duplicate filter,
    /// buffer, periodic flush.
    pub async fn write(&mut self, row: &SourceRow) -> Result<()> {
        if !self.mapping.check_conditionals(row) {
            self.filtered += 1;
            return Ok(());
        }

        let staged = self.assembler.assemble(row)?;

        if let Some(detector) = &mut self.detector {
            if detector.is_duplicate(&staged) {
                return Ok(());
            }
        }

        self.buffer.push(staged);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }

        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch_len = self.buffer.len() as u64;
        let rejected = self
            .loader
            .load_batch(&self.staging.qualified, &self.staging.columns, &self.buffer)
            .await? as u64;
        if rejected > batch_len {
            return Err(SyncError::BulkLoad {
                table: self.staging.qualified.clone(),
                message: format!("loader reported {} rejects for {} rows", rejected, batch_len),
            });
        }

        self.accepted += batch_len - rejected;
        self.rejected += rejected;
        self.buffer.clear();

        if self.accepted >= self.last_log_rows + LOG_ROWS_INTERVAL {
            self.last_log_rows = self.accepted;
            info!(
                "Added {} rows to staging table for {}.",
                self.accepted, self.mapping.destination_table.name
            );
        }

        Ok(())
    }

    /// Flush remaining buffered rows and return the total accepted count.
    /// Zero accepted rows is a legitimate outcome.
    pub async fn finish(&mut self) -> Result<u64> {
        self.flush().await?;
        if self.accepted > 0 {
            info!(
                "Added {} rows to staging table for {}.",
                self.accepted, self.mapping.destination_table.name
            );
        }
        if self.rejected > 0 {
            warn!(
                "{} rows were rejected during bulk load for {}.",
                self.rejected, self.mapping.destination_table.name
            );
        }
        Ok(self.accepted)
    }

    /// Rows accepted into staging so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Rows rejected by the bulk loader (skip-failing-rows mode).
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Rows silently skipped by conditionals.
    pub fn filtered(&self) -> u64 {
        self.filtered
    }

    /// Rows dropped as duplicates.
    pub fn duplicates(&self) -> u64 {
        self.detector.as_ref().map(|d| d.duplicates()).unwrap_or(0)
    }
}
