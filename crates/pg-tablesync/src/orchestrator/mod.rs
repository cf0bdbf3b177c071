//! Job orchestrator: sequences table transfers, owns the single transaction
//! and implements the partial-failure policy.
//!
//! One job run: order mappings by destination foreign-key dependency, stage
//! every mapping's rows into its scratch table, then merge staged tables into
//! their destinations (dependency order) and delete excess rows (reverse
//! order) inside one transaction. Staging tables are dropped on every exit
//! path.

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::{Result, SyncError};
use crate::mapping::Mapping;
use crate::merge;
use crate::schema::{ForeignKey, SchemaProvider};
use crate::source::{convert_row_value, ResponseWriter, SourceReader};
use crate::staging::{CopyBulkLoader, StagingTable, StagingWriter};

/// Runs one synchronization job.
pub struct JobRunner {
    config: Config,
    pool: Pool,
}

/// Result of a job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Unique run identifier; also scopes the staging table names.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// When the job started.
    pub started_at: DateTime<Utc>,

    /// When the job completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Per-table outcomes, in execution order.
    pub tables: Vec<TableOutcome>,

    /// Total rows accepted into staging.
    pub rows_staged: u64,

    /// Total rows affected by merges.
    pub rows_affected: u64,

    /// Total rows removed by excess-deletion.
    pub rows_deleted: u64,
}

/// Per-table counts for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOutcome {
    pub source_table: String,
    pub destination_table: String,

    /// Rows accepted into staging.
    pub staged: u64,

    /// Rows rejected during bulk load (skip-failing-rows mode).
    pub rejected: u64,

    /// Rows dropped as duplicates.
    pub duplicates_discarded: u64,

    /// Rows skipped by conditionals.
    pub filtered: u64,

    /// Rows affected by the merge.
    pub affected: u64,

    /// Rows removed by excess-deletion.
    pub deleted: u64,

    /// Write-back statements that failed (logged, never fatal).
    pub write_back_failures: u64,
}

impl JobResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Per-mapping bookkeeping across the job phases.
struct MappingRun {
    mapping_idx: usize,
    staging: StagingTable,
    accepted: u64,
    rejected: u64,
    duplicates: u64,
    filtered: u64,
    affected: u64,
    deleted: u64,
    response: Option<ResponseWriter>,
    write_back_failed: usize,
}

impl MappingRun {
    fn new(mapping_idx: usize, staging: StagingTable) -> Self {
        Self {
            mapping_idx,
            staging,
            accepted: 0,
            rejected: 0,
            duplicates: 0,
            filtered: 0,
            affected: 0,
            deleted: 0,
            response: None,
            write_back_failed: 0,
        }
    }
}

impl JobRunner {
    /// Create a runner: validates the configuration and opens the pool.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = db::connect(&config.connection).await?;
        Ok(Self { config, pool })
    }

    /// Resolve every active mapping against the live schema without moving
    /// any data. Used by the CLI `validate` command.
    pub async fn check(&self) -> Result<()> {
        let schema = SchemaProvider::new(self.pool.clone(), self.config.connection.schema.clone());
        schema.load_foreign_keys().await?;
        for cfg in &self.config.job.mappings {
            if !cfg.active {
                continue;
            }
            let source = schema.get_table(&cfg.source_table).await?;
            let destination = schema.get_table(&cfg.destination_table).await?;
            Mapping::resolve(cfg, source, destination)?;
        }
        Ok(())
    }

    /// Run the job to completion.
    ///
    /// Any fatal error rolls back the merge/delete transaction; staging
    /// tables are dropped regardless of outcome.
    pub async fn run(self, cancel: Option<watch::Receiver<bool>>) -> Result<JobResult> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().simple().to_string();
        let suffix = format!("_sync_{}", &run_id[..8]);

        let cancel = cancel.unwrap_or_else(|| {
            let (_, rx) = watch::channel(false);
            rx
        });

        info!("Starting sync job: {}", run_id);

        let schema = SchemaProvider::new(self.pool.clone(), self.config.connection.schema.clone());
        let foreign_keys = schema.load_foreign_keys().await?;

        let mut mappings = Vec::new();
        for cfg in &self.config.job.mappings {
            if !cfg.active {
                debug!(
                    "Skipping inactive mapping {} -> {}",
                    cfg.source_table, cfg.destination_table
                );
                continue;
            }
            let source = schema.get_table(&cfg.source_table).await?;
            let destination = schema.get_table(&cfg.destination_table).await?;
            mappings.push(Mapping::resolve(cfg, source, destination)?);
        }

        let order = order_mappings(&mappings, &foreign_keys);

        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "opening job connection"))?;

        let mut runs: Vec<MappingRun> = Vec::new();
        let outcome = self
            .execute(&mut client, &mappings, &order, &foreign_keys, &suffix, &mut runs, cancel)
            .await;

        // Closed state: drop every staging table, success or failure.
        for run in &runs {
            if let Err(e) = run.staging.drop(&client).await {
                warn!("Failed to drop staging table {}: {}", run.staging.qualified, e);
            }
        }

        match outcome {
            Ok(()) => {
                let completed_at = Utc::now();
                let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
                let tables: Vec<TableOutcome> = runs
                    .iter()
                    .map(|run| {
                        let mapping = &mappings[run.mapping_idx];
                        TableOutcome {
                            source_table: mapping.source_table.name.clone(),
                            destination_table: mapping.destination_table.name.clone(),
                            staged: run.accepted,
                            rejected: run.rejected,
                            duplicates_discarded: run.duplicates,
                            filtered: run.filtered,
                            affected: run.affected,
                            deleted: run.deleted,
                            write_back_failures: run.write_back_failed as u64,
                        }
                    })
                    .collect();

                let result = JobResult {
                    run_id,
                    status: "completed".to_string(),
                    started_at,
                    completed_at,
                    duration_seconds: duration,
                    rows_staged: tables.iter().map(|t| t.staged).sum(),
                    rows_affected: tables.iter().map(|t| t.affected).sum(),
                    rows_deleted: tables.iter().map(|t| t.deleted).sum(),
                    tables,
                };

                info!(
                    "Sync {}: {} tables, {} rows staged, {} affected, {} deleted in {:.1}s",
                    result.status,
                    result.tables.len(),
                    result.rows_staged,
                    result.rows_affected,
                    result.rows_deleted,
                    result.duration_seconds
                );

                Ok(result)
            }
            Err(e) => {
                if e.is_unique_violation() {
                    info!(
                        "This error usually indicates duplicates in a column used as a key or identity."
                    );
                }
                error!("Sync job failed: {}", e.format_detailed());
                Err(e)
            }
        }
    }

    /// Staging phase, then merge + delete inside one transaction, then
    /// write-back flush. Rollback happens here; cleanup happens in `run`.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        client: &mut deadpool_postgres::Object,
        mappings: &[Mapping],
        order: &[usize],
        foreign_keys: &[ForeignKey],
        suffix: &str,
        runs: &mut Vec<MappingRun>,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let job = &self.config.job;

        // Staging phase, in dependency order.
        for &idx in order {
            if *cancel.borrow() {
                return Err(SyncError::Cancelled);
            }

            let mapping = &mappings[idx];
            info!(
                "Starting import of data to table: {}",
                mapping.destination_table.name
            );

            let extras = job
                .staging_extra_columns
                .get(&mapping.destination_table.name)
                .cloned()
                .unwrap_or_default();

            let conn: &tokio_postgres::Client = client;
            let staging = StagingTable::create(conn, mapping, suffix, &extras).await?;
            runs.push(MappingRun::new(idx, staging));
            let run_pos = runs.len() - 1;

            let discard = mapping.discard_duplicates.unwrap_or(job.discard_duplicates);
            let staging_ref = runs[run_pos].staging.clone();
            let loader = CopyBulkLoader::new(conn, job.skip_failing_rows);
            let mut writer =
                StagingWriter::new(mapping, &staging_ref, loader, job.batch_size, discard)?;

            let mut reader = SourceReader::open(&self.pool, mapping).await?;
            while let Some(row) = reader.next_row().await? {
                if let Err(e) = writer.write(&row).await {
                    error!("Failed while processing source row: {}", row.describe());
                    return Err(e);
                }
            }

            let accepted = writer.finish().await?;
            let (rejected, filtered, duplicates) =
                (writer.rejected(), writer.filtered(), writer.duplicates());
            drop(writer);
            reader.close().await;

            let run = &mut runs[run_pos];
            run.accepted = accepted;
            run.rejected = rejected;
            run.filtered = filtered;
            run.duplicates = duplicates;

            info!(
                "Finished import of data to table: {}",
                mapping.destination_table.name
            );
        }

        if *cancel.borrow() {
            return Err(SyncError::Cancelled);
        }

        // Merge + delete, one transaction covering all tables.
        info!("Import done, doing cleanup");
        let txn = client.transaction().await?;
        match self
            .merge_and_delete(&txn, mappings, foreign_keys, runs)
            .await
        {
            Ok(()) => {
                txn.commit().await?;
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!("Rollback failed: {}", rb);
                }
                return Err(e);
            }
        }
        info!("Cleanup done");

        // Write-back runs outside the main transaction, after commit.
        for run in runs.iter_mut() {
            if let Some(writer) = run.response.as_mut() {
                run.write_back_failed = writer.flush().await;
            }
        }

        Ok(())
    }

    async fn merge_and_delete(
        &self,
        txn: &tokio_postgres::Transaction<'_>,
        mappings: &[Mapping],
        foreign_keys: &[ForeignKey],
        runs: &mut [MappingRun],
    ) -> Result<()> {
        let job = &self.config.job;

        // Merge in dependency order; only writers that accepted rows.
        for run in runs.iter_mut() {
            let mapping = &mappings[run.mapping_idx];
            if run.accepted == 0 {
                info!(
                    "No rows were imported to the table: {}.",
                    mapping.destination_table.name
                );
                continue;
            }

            let affected = merge::merge_into_main(txn, mapping, &run.staging).await?;
            if affected > 0 {
                info!(
                    "The number of rows affected: {} in the {} table",
                    affected, mapping.destination_table.name
                );
            }
            run.affected = affected;

            self.stage_response_writes(txn, mapping, run).await?;
        }

        // Delete excess in reverse dependency order.
        for run in runs.iter_mut().rev() {
            let mapping = &mappings[run.mapping_idx];
            if run.accepted == 0 {
                continue;
            }
            let remove = mapping
                .remove_missing_after_import
                .unwrap_or(job.remove_missing_after_import);
            if !(remove || job.remove_missing_destination_tables_only) {
                continue;
            }

            let deleted = merge::delete_excess(
                txn,
                mapping,
                &run.staging,
                None,
                job.remove_missing_destination_tables_only,
                foreign_keys,
            )
            .await?;
            if deleted > 0 {
                info!(
                    "The number of deleted rows: {} for the destination {} table mapping",
                    deleted, mapping.destination_table.name
                );
            }
            run.deleted = deleted;
        }

        Ok(())
    }

    /// Fetch generated values for a mapping's response columns and stage the
    /// source updates. Fetch failures are logged, never fatal.
    async fn stage_response_writes(
        &self,
        txn: &tokio_postgres::Transaction<'_>,
        mapping: &Mapping,
        run: &mut MappingRun,
    ) -> Result<()> {
        let Some((sql, targets, key_sources)) =
            merge::build_response_fetch_sql(mapping, &run.staging.qualified)?
        else {
            return Ok(());
        };

        let rows = match txn.query(sql.as_str(), &[]).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    "Write-back fetch failed for {}: {}",
                    mapping.destination_table.name, e
                );
                return Ok(());
            }
        };

        let mut writer = ResponseWriter::new(self.pool.clone(), mapping)?;
        for row in rows {
            let keys: Vec<_> = key_sources
                .iter()
                .enumerate()
                .map(|(j, key)| (key.clone(), convert_row_value(&row, targets.len() + j)))
                .collect();
            for (i, target) in targets.iter().enumerate() {
                writer.stage(&keys, target, &convert_row_value(&row, i))?;
            }
        }

        debug!(
            "Staged {} write-back statements for {}",
            writer.staged_len(),
            mapping.source_table.name
        );
        run.response = Some(writer);
        Ok(())
    }
}

/// Order mappings parents-before-children by destination foreign-key
/// dependency. Stable for independent mappings; on a dependency cycle the
/// remaining mappings keep their declared order.
pub fn order_mappings(mappings: &[Mapping], foreign_keys: &[ForeignKey]) -> Vec<usize> {
    let n = mappings.len();

    // edges[p] lists children of p; indegree counts FK parents per mapping.
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];

    for fk in foreign_keys {
        let parent = mappings
            .iter()
            .position(|m| m.destination_table.name.eq_ignore_ascii_case(&fk.parent_table));
        let child = mappings
            .iter()
            .position(|m| m.destination_table.name.eq_ignore_ascii_case(&fk.child_table));
        if let (Some(p), Some(c)) = (parent, child) {
            if p != c && !edges[p].contains(&c) {
                edges[p].push(c);
                indegree[c] += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(n);
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();

    while let Some(&next) = ready.first() {
        ready.remove(0);
        order.push(next);
        for &child in &edges[next] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                // Keep declaration order among newly ready mappings.
                let pos = ready.partition_point(|&r| r < child);
                ready.insert(pos, child);
            }
        }
    }

    if order.len() < n {
        warn!("Foreign-key cycle among destination tables; falling back to declared order for the rest");
        for i in 0..n {
            if !order.contains(&i) {
                order.push(i);
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnMappingConfig, MappingConfig};
    use crate::schema::{Column, Table};

    fn column(name: &str) -> Column {
        Column {
            name: name.to_string(),
            data_type: "int4".to_string(),
            is_nullable: true,
            is_identity: false,
            is_primary_key: false,
            ordinal_pos: 1,
        }
    }

    fn mapping(dest: &str) -> Mapping {
        let source = Table {
            schema: "public".to_string(),
            name: format!("src_{}", dest),
            columns: vec![column("id")],
        };
        let destination = Table {
            schema: "public".to_string(),
            name: dest.to_string(),
            columns: vec![column("Id")],
        };
        let cfg = MappingConfig {
            source_table: source.name.clone(),
            destination_table: dest.to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: None,
            columns: vec![ColumnMappingConfig {
                source: Some("id".to_string()),
                destination: "Id".to_string(),
                key: true,
                active: true,
                script: None,
            }],
            conditionals: vec![],
            response_columns: vec![],
        };
        Mapping::resolve(&cfg, source, destination).unwrap()
    }

    fn fk(child: &str, parent: &str) -> ForeignKey {
        ForeignKey {
            name: format!("fk_{}_{}", child, parent),
            child_table: child.to_string(),
            child_columns: vec!["Id".to_string()],
            parent_table: parent.to_string(),
            parent_columns: vec!["Id".to_string()],
        }
    }

    #[test]
    fn test_parents_merge_before_children() {
        // Declared child-first; FK forces parent first.
        let mappings = vec![mapping("OrderLines"), mapping("Orders")];
        let order = order_mappings(&mappings, &[fk("OrderLines", "Orders")]);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_independent_mappings_keep_declared_order() {
        let mappings = vec![mapping("A"), mapping("B"), mapping("C")];
        let order = order_mappings(&mappings, &[]);
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_chain_ordering() {
        let mappings = vec![mapping("C"), mapping("B"), mapping("A")];
        let fks = vec![fk("C", "B"), fk("B", "A")];
        let order = order_mappings(&mappings, &fks);
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_cycle_falls_back_to_declared_order() {
        let mappings = vec![mapping("A"), mapping("B")];
        let fks = vec![fk("A", "B"), fk("B", "A")];
        let order = order_mappings(&mappings, &fks);
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_foreign_keys_to_unmapped_tables_are_ignored() {
        let mappings = vec![mapping("A")];
        let order = order_mappings(&mappings, &[fk("A", "Elsewhere")]);
        assert_eq!(order, vec![0]);
    }
}
