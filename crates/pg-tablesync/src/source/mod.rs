//! Source reader: streams projected source rows through the mapping's
//! conditional filter.

mod response;

pub use response::ResponseWriter;

use std::pin::Pin;
use std::sync::Arc;

use deadpool_postgres::Pool;
use futures::TryStreamExt;
use tokio_postgres::RowStream;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::ident::{qualify, quote_ident};
use crate::mapping::Mapping;
use crate::row::SourceRow;
use crate::value::{SqlNullType, SqlValue};

/// Build the source query: the distinct set of projected columns, filtered by
/// the mapping's conditionals with bound parameters.
pub fn build_select_sql(mapping: &Mapping) -> Result<(String, Vec<Option<String>>)> {
    let columns = mapping.projected_source_columns();
    if columns.is_empty() {
        return Err(SyncError::Mapping(format!(
            "Mapping {} projects no source columns",
            mapping.describe()
        )));
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let mut sql = format!(
        "SELECT {} FROM {}",
        column_list,
        qualify(&mapping.source_table.schema, &mapping.source_table.name)?
    );

    let mut params: Vec<Option<String>> = Vec::new();
    if !mapping.conditionals.is_empty() {
        let fragments = mapping
            .conditionals
            .iter()
            .map(|c| c.to_sql(&mut params))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" WHERE ");
        sql.push_str(&fragments.join(" AND "));
    }

    Ok((sql, params))
}

/// Streams source rows for one mapping.
///
/// The reader checks out its own pooled client and holds it until closed;
/// the job's shared connection stays free for staging uploads.
pub struct SourceReader {
    columns: Arc<Vec<String>>,
    stream: Pin<Box<RowStream>>,
    response: ResponseWriter,
    // Keeps the connection checked out for the lifetime of the stream.
    _client: deadpool_postgres::Object,
}

impl SourceReader {
    /// Open a reader for the mapping: builds and executes the source query.
    pub async fn open(pool: &Pool, mapping: &Mapping) -> Result<Self> {
        let client = pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "opening source reader connection"))?;

        let (sql, params) = build_select_sql(mapping)?;
        debug!("Source query for {}: {}", mapping.describe(), sql);

        let stream = client.query_raw(sql.as_str(), params).await?;

        Ok(Self {
            columns: Arc::new(mapping.projected_source_columns()),
            stream: Box::pin(stream),
            response: ResponseWriter::new(pool.clone(), mapping)?,
            _client: client,
        })
    }

    /// Fetch the next row, or `None` once the result set is exhausted.
    pub async fn next_row(&mut self) -> Result<Option<SourceRow>> {
        let Some(row) = self.stream.as_mut().try_next().await? else {
            return Ok(None);
        };

        let values = (0..self.columns.len())
            .map(|idx| convert_row_value(&row, idx))
            .collect();

        Ok(Some(SourceRow::new(self.columns.clone(), values)))
    }

    /// Stage a write-back of destination-generated values for the given
    /// source row. The update statements run at close, outside the job
    /// transaction.
    pub fn write_back(&mut self, row: &SourceRow, generated: &[(String, SqlValue)]) -> Result<()> {
        self.response.stage_for_row(row, generated)
    }

    /// Close the reader, flushing any staged write-back statements.
    /// Write-back failures are logged and returned as a count, never raised.
    pub async fn close(mut self) -> usize {
        self.response.flush().await
    }
}

/// Convert one column of a fetched row into a [`SqlValue`], by wire type.
pub(crate) fn convert_row_value(row: &tokio_postgres::Row, idx: usize) -> SqlValue {
    let ty = row.columns()[idx].type_().name().to_string();

    match ty.as_str() {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bytes)
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null(SqlNullType::Text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnMappingConfig, ConditionalConfig, MappingConfig};
    use crate::mapping::ConditionalOperator;
    use crate::schema::{Column, Table};

    fn column(name: &str, udt: &str) -> Column {
        Column {
            name: name.to_string(),
            data_type: udt.to_string(),
            is_nullable: true,
            is_identity: false,
            is_primary_key: false,
            ordinal_pos: 1,
        }
    }

    fn mapping(conditionals: Vec<ConditionalConfig>) -> Mapping {
        let source = Table {
            schema: "public".to_string(),
            name: "src_items".to_string(),
            columns: vec![
                column("sku", "text"),
                column("title", "text"),
                column("qty", "int4"),
            ],
        };
        let destination = Table {
            schema: "public".to_string(),
            name: "Items".to_string(),
            columns: vec![column("Sku", "text"), column("Title", "text")],
        };
        let cfg = MappingConfig {
            source_table: "src_items".to_string(),
            destination_table: "Items".to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: None,
            columns: vec![
                ColumnMappingConfig {
                    source: Some("sku".to_string()),
                    destination: "Sku".to_string(),
                    key: true,
                    active: true,
                    script: None,
                },
                ColumnMappingConfig {
                    source: Some("sku".to_string()),
                    destination: "Title".to_string(),
                    key: false,
                    active: true,
                    script: None,
                },
                ColumnMappingConfig {
                    source: Some("title".to_string()),
                    destination: "Title".to_string(),
                    key: false,
                    active: true,
                    script: None,
                },
            ],
            conditionals,
            response_columns: vec![],
        };
        Mapping::resolve(&cfg, source, destination).unwrap()
    }

    #[test]
    fn test_select_deduplicates_columns() {
        let (sql, params) = build_select_sql(&mapping(vec![])).unwrap();
        assert_eq!(
            sql,
            "SELECT \"sku\", \"title\" FROM \"public\".\"src_items\""
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_select_appends_conditional_filter() {
        let (sql, params) = build_select_sql(&mapping(vec![ConditionalConfig {
            column: "qty".to_string(),
            operator: ConditionalOperator::GreaterThan,
            values: vec!["0".to_string()],
        }]))
        .unwrap();
        assert_eq!(
            sql,
            "SELECT \"sku\", \"title\", \"qty\" FROM \"public\".\"src_items\" WHERE \"qty\" > $1::integer"
        );
        assert_eq!(params, vec![Some("0".to_string())]);
    }
}
