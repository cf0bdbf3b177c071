//! The bulk-load collaborator: batches of staged rows into the staging table.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use tokio_postgres::Client;
use tracing::{error, warn};

use crate::error::{Result, SyncError};
use crate::ident::quote_ident;
use crate::schema::Column;
use crate::value::SqlValue;

/// Accepts a batch of rows for a target scratch table and either writes them
/// or reports how many were rejected.
///
/// With skip-and-report mode enabled the implementation absorbs per-row
/// failures and returns the rejected count; with it disabled any rejection
/// is an error.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    async fn load_batch(
        &self,
        table_sql: &str,
        columns: &[Column],
        rows: &[Vec<SqlValue>],
    ) -> Result<usize>;
}

/// COPY-protocol bulk loader.
///
/// The happy path streams the whole batch through `COPY ... FROM STDIN`.
/// When the batch is refused and skip-failing-rows is enabled, rows are
/// retried one at a time with a parameterized INSERT so the good ones
/// survive and the bad ones are counted and logged.
pub struct CopyBulkLoader<'a> {
    client: &'a Client,
    skip_failing_rows: bool,
}

impl<'a> CopyBulkLoader<'a> {
    pub fn new(client: &'a Client, skip_failing_rows: bool) -> Self {
        Self {
            client,
            skip_failing_rows,
        }
    }

    async fn copy_batch(
        &self,
        table_sql: &str,
        columns: &[Column],
        rows: &[Vec<SqlValue>],
    ) -> Result<()> {
        let col_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let copy_stmt = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
            table_sql, col_list
        );

        let sink = self.client.copy_in(&copy_stmt).await?;
        futures::pin_mut!(sink);

        let mut buf = BytesMut::with_capacity(64 * 1024);
        for row in rows {
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    buf.put_u8(b'\t');
                }
                buf.extend_from_slice(copy_text(value).as_bytes());
            }
            buf.put_u8(b'\n');
        }
        sink.send(buf.split().freeze()).await?;
        sink.finish().await?;

        Ok(())
    }

    /// Retry a refused batch row-by-row, counting rejects.
    async fn insert_rows_individually(
        &self,
        table_sql: &str,
        columns: &[Column],
        rows: &[Vec<SqlValue>],
    ) -> Result<usize> {
        let col_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let mut rejected = 0usize;
        for row in rows {
            let placeholders: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(i, v)| format!("${}{}", i + 1, v.sql_cast()))
                .collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table_sql,
                col_list,
                placeholders.join(", ")
            );

            let params: Vec<Option<String>> = row.iter().map(|v| v.to_param()).collect();
            let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                params.iter().map(|p| p as _).collect();

            if let Err(e) = self.client.execute(sql.as_str(), &refs).await {
                rejected += 1;
                warn!(
                    "Skipped failing row ({}): {}",
                    row.iter()
                        .map(|v| v.render_text())
                        .collect::<Vec<_>>()
                        .join(", "),
                    e
                );
            }
        }

        Ok(rejected)
    }
}

#[async_trait]
impl BulkLoader for CopyBulkLoader<'_> {
    async fn load_batch(
        &self,
        table_sql: &str,
        columns: &[Column],
        rows: &[Vec<SqlValue>],
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        match self.copy_batch(table_sql, columns, rows).await {
            Ok(()) => Ok(0),
            Err(e) if self.skip_failing_rows => {
                error!(
                    "Bulk load into {} refused ({}); retrying {} rows individually",
                    table_sql,
                    e,
                    rows.len()
                );
                self.insert_rows_individually(table_sql, columns, rows).await
            }
            Err(e) => Err(SyncError::BulkLoad {
                table: table_sql.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Render a value in COPY text format. Escapes backslash, tab, newline and
/// carriage return; NULL is `\N`.
pub fn copy_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null(_) => "\\N".to_string(),
        SqlValue::Text(s) => escape_copy_text(s),
        SqlValue::Bytes(b) => format!("\\\\x{}", hex::encode(b)),
        other => other.render_text(),
    }
}

fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}
