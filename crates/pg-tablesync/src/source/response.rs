//! Response write-back: pushing destination-generated values into the source.
//!
//! Staged update statements run outside the job transaction, on their own
//! pooled connection, in bounded batches. Failures here never abort the job;
//! they are logged and surfaced as a count.

use deadpool_postgres::Pool;
use tracing::{debug, error, info};

use crate::error::{Result, SyncError};
use crate::ident::{qualify, quote_ident};
use crate::mapping::Mapping;
use crate::row::SourceRow;
use crate::value::SqlValue;

/// Statements executed per round trip when flushing.
const RESPONSE_CHUNK_SIZE: usize = 100;

/// One staged update: SQL text plus its bound parameters.
type StagedUpdate = (String, Vec<Option<String>>);

/// Buffers keyed UPDATE statements against the source table and executes
/// them in chunks at flush time.
pub struct ResponseWriter {
    pool: Pool,
    source_table_sql: String,
    key_columns: Vec<String>,
    staged: Vec<StagedUpdate>,
}

impl ResponseWriter {
    pub fn new(pool: Pool, mapping: &Mapping) -> Result<Self> {
        Ok(Self {
            pool,
            source_table_sql: qualify(&mapping.source_table.schema, &mapping.source_table.name)?,
            key_columns: mapping
                .source_key_columns()
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
            staged: Vec::new(),
        })
    }

    /// Stage one keyed update per generated column, addressing the source
    /// record behind `row` through the mapping's key columns.
    pub fn stage_for_row(
        &mut self,
        row: &SourceRow,
        generated: &[(String, SqlValue)],
    ) -> Result<()> {
        if generated.is_empty() {
            return Ok(());
        }
        if self.key_columns.is_empty() {
            return Err(SyncError::Mapping(format!(
                "Write-back against {} requires at least one key column set",
                self.source_table_sql
            )));
        }

        let keys = self
            .key_columns
            .iter()
            .map(|k| {
                let value = row.get(k).cloned().ok_or_else(|| {
                    SyncError::Mapping(format!("Key column {} missing from source row", k))
                })?;
                Ok((k.clone(), value))
            })
            .collect::<Result<Vec<_>>>()?;

        for (column, value) in generated {
            self.stage(&keys, column, value)?;
        }
        Ok(())
    }

    /// Stage one `UPDATE <source> SET <column> = $1 WHERE <keys>` statement.
    pub fn stage(
        &mut self,
        keys: &[(String, SqlValue)],
        column: &str,
        value: &SqlValue,
    ) -> Result<()> {
        if keys.is_empty() {
            return Err(SyncError::Mapping(format!(
                "Write-back against {} requires at least one key column set",
                self.source_table_sql
            )));
        }

        let mut params: Vec<Option<String>> = vec![value.to_param()];
        let mut sql = format!(
            "UPDATE {} SET {} = $1{}",
            self.source_table_sql,
            quote_ident(column)?,
            value.sql_cast()
        );

        let mut clauses = Vec::with_capacity(keys.len());
        for (key, key_value) in keys {
            params.push(key_value.to_param());
            clauses.push(format!(
                "{} = ${}{}",
                quote_ident(key)?,
                params.len(),
                key_value.sql_cast()
            ));
        }
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));

        self.staged.push((sql, params));
        Ok(())
    }

    /// Number of staged, not yet flushed statements.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Execute the staged statements in chunks. Returns the number of
    /// statements that failed; a failing statement aborts its chunk but not
    /// the remaining ones.
    pub async fn flush(&mut self) -> usize {
        if self.staged.is_empty() {
            return 0;
        }

        let staged = std::mem::take(&mut self.staged);
        let total = staged.len();
        let mut failed = 0usize;

        for chunk in staged.chunks(RESPONSE_CHUNK_SIZE) {
            let client = match self.pool.get().await {
                Ok(c) => c,
                Err(e) => {
                    error!(
                        "Write-back: failed to get connection, dropping {} statements: {}",
                        chunk.len(),
                        e
                    );
                    failed += chunk.len();
                    continue;
                }
            };

            // A failing statement abandons the rest of its chunk; later
            // chunks still run.
            let mut chunk_failed = false;
            for (sql, params) in chunk {
                if chunk_failed {
                    failed += 1;
                    continue;
                }
                let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                    params.iter().map(|p| p as _).collect();
                if let Err(e) = client.execute(sql.as_str(), &refs).await {
                    error!("Write-back statement failed ({}): {}", sql, e);
                    failed += 1;
                    chunk_failed = true;
                }
            }
        }

        if failed > 0 {
            info!(
                "Write-back finished: {} of {} statements failed",
                failed, total
            );
        } else {
            debug!("Write-back finished: {} statements applied", total);
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<(String, SqlValue)> {
        vec![("sku".to_string(), SqlValue::Text("A-1".to_string()))]
    }

    fn writer() -> ResponseWriter {
        // Pool construction needs no live server until `get()` is called.
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some("localhost".to_string());
        cfg.dbname = Some("unused".to_string());
        let pool = cfg
            .create_pool(
                Some(deadpool_postgres::Runtime::Tokio1),
                tokio_postgres::NoTls,
            )
            .unwrap();
        ResponseWriter {
            pool,
            source_table_sql: "\"public\".\"src_items\"".to_string(),
            key_columns: vec!["sku".to_string()],
            staged: Vec::new(),
        }
    }

    #[test]
    fn test_stage_builds_keyed_update() {
        let mut w = writer();
        w.stage(&keys(), "ext_id", &SqlValue::I64(99)).unwrap();
        assert_eq!(w.staged_len(), 1);
        let (sql, params) = &w.staged[0];
        assert_eq!(
            sql,
            "UPDATE \"public\".\"src_items\" SET \"ext_id\" = $1::bigint WHERE \"sku\" = $2::text"
        );
        assert_eq!(
            params,
            &vec![Some("99".to_string()), Some("A-1".to_string())]
        );
    }

    #[test]
    fn test_stage_without_keys_is_mapping_error() {
        let mut w = writer();
        let err = w.stage(&[], "ext_id", &SqlValue::I64(1)).unwrap_err();
        assert!(matches!(err, SyncError::Mapping(_)));
    }
}
