//! Configuration type definitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::mapping::ConditionalOperator;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database connection configuration.
    pub connection: ConnectionConfig,

    /// Job behavior configuration and table mappings.
    pub job: JobConfig,
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Schema holding both source and destination tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Connection pool size (default: 4). One client is held for the whole
    /// job; the source reader and write-back path take their own.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// Job behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Delete destination rows not present in the import (default: false).
    #[serde(default)]
    pub remove_missing_after_import: bool,

    /// Like `remove_missing_after_import`, but withholds cascading deletes
    /// to dependent tables (default: false).
    #[serde(default)]
    pub remove_missing_destination_tables_only: bool,

    /// Skip rows whose dedup key was already staged (default: false).
    #[serde(default)]
    pub discard_duplicates: bool,

    /// Tolerate per-row bulk-load failures instead of aborting (default: false).
    #[serde(default)]
    pub skip_failing_rows: bool,

    /// Rows buffered before a bulk-load flush (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Extra synthetic nullable integer columns appended to the staging table
    /// of specific destination tables, keyed by table name. Empty by default;
    /// exists for legacy destinations whose merge procedures expect it.
    #[serde(default)]
    pub staging_extra_columns: HashMap<String, Vec<String>>,

    /// Table mappings, in declared order. Execution order is derived from
    /// destination foreign-key dependencies, not declaration order.
    pub mappings: Vec<MappingConfig>,
}

/// One source-table to destination-table mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Source table name.
    pub source_table: String,

    /// Destination table name.
    pub destination_table: String,

    /// Inactive mappings are skipped entirely (default: true).
    #[serde(default = "default_true")]
    pub active: bool,

    /// Per-mapping override of the job-level option.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_missing_after_import: Option<bool>,

    /// Per-mapping override of the job-level option.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_duplicates: Option<bool>,

    /// Column mappings, in declared order (fan-in concatenates in this order).
    pub columns: Vec<ColumnMappingConfig>,

    /// Row filters applied in the source query and against in-memory rows.
    #[serde(default)]
    pub conditionals: Vec<ConditionalConfig>,

    /// Write-back of destination-generated values into the source table.
    #[serde(default)]
    pub response_columns: Vec<ResponseColumnConfig>,
}

/// One column mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMappingConfig {
    /// Source column; omit for script-derived values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Destination column.
    pub destination: String,

    /// Key columns form the merge join condition and the dedup key.
    #[serde(default)]
    pub key: bool,

    /// Inactive column mappings are ignored (default: true).
    #[serde(default = "default_true")]
    pub active: bool,

    /// Optional value-generating script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptConfig>,
}

/// Value-generating script kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptConfig {
    /// A fixed constant value.
    Constant { value: String },
    /// A fresh v4 UUID per row (insert-only).
    NewUuid,
    /// The assembly-time timestamp.
    Now,
}

/// One row-filter conditional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalConfig {
    /// Source column to compare.
    pub column: String,

    /// Comparison operator.
    pub operator: ConditionalOperator,

    /// Comparison values; exactly one unless the operator is `in`.
    pub values: Vec<String>,
}

/// One response (write-back) column mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseColumnConfig {
    /// Destination-side column whose post-merge value is propagated.
    pub source: String,

    /// Source-side column receiving the value.
    pub target: String,
}

// Default value functions for serde

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_batch_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}
