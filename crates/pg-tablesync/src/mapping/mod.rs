//! The mapping model: an immutable description of one source-table to
//! destination-table transfer.
//!
//! Mappings are resolved once, at load time, against the introspected schema
//! of both tables. Everything downstream (reader projection, staging shape,
//! merge join condition, response write-back) derives from the resolved form,
//! so configuration mistakes surface before any row moves.

mod conditional;

pub use conditional::{Conditional, ConditionalOperator};

use chrono::Utc;
use uuid::Uuid;

use crate::config::{ColumnMappingConfig, MappingConfig, ScriptConfig};
use crate::error::{Result, SyncError};
use crate::schema::{Column, Table};
use crate::value::SqlValue;

/// A value-generating script attached to a column mapping.
///
/// Script-derived mappings need no source column; `NewUuid` is generated once
/// per row at insert and is therefore excluded from merge UPDATE set-lists.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueScript {
    /// A fixed constant, converted to the destination representation.
    Constant(String),
    /// A fresh v4 UUID per row.
    NewUuid,
    /// The wall-clock timestamp at assembly time.
    Now,
}

impl ValueScript {
    pub fn evaluate(&self) -> SqlValue {
        match self {
            ValueScript::Constant(s) => SqlValue::Text(s.clone()),
            ValueScript::NewUuid => SqlValue::Uuid(Uuid::new_v4()),
            ValueScript::Now => SqlValue::DateTime(Utc::now().naive_utc()),
        }
    }

    /// Whether the scripted value is only meaningful at insert time.
    pub fn insert_only(&self) -> bool {
        matches!(self, ValueScript::NewUuid)
    }
}

/// One resolved column mapping.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    /// Source column descriptor; absent when the value is script-derived.
    pub source_column: Option<Column>,

    /// Destination column descriptor.
    pub destination_column: Column,

    /// Whether this column participates in the merge join / dedup key.
    pub is_key: bool,

    /// Inactive mappings are kept for round-tripping but ignored everywhere.
    pub active: bool,

    /// Optional value-generating script.
    pub script: Option<ValueScript>,
}

impl ColumnMapping {
    /// Whether merge UPDATE statements must leave this column alone.
    pub fn insert_only(&self) -> bool {
        self.script.as_ref().map(|s| s.insert_only()).unwrap_or(false)
    }
}

/// Write-back of a destination-generated value into the source table.
#[derive(Debug, Clone)]
pub struct ResponseColumnMapping {
    /// Destination-side column whose post-merge value is propagated.
    pub source_column: Column,

    /// Source-side column receiving the value.
    pub target_column: Column,
}

/// A resolved table mapping.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub source_table: Table,
    pub destination_table: Table,
    pub column_mappings: Vec<ColumnMapping>,
    pub conditionals: Vec<Conditional>,
    pub response_mappings: Vec<ResponseColumnMapping>,
    pub active: bool,

    /// Per-mapping option overrides; `None` falls back to the job option.
    pub remove_missing_after_import: Option<bool>,
    pub discard_duplicates: Option<bool>,
}

impl Mapping {
    /// Resolve a mapping definition against the introspected source and
    /// destination tables, validating every invariant that can be checked
    /// before rows flow.
    pub fn resolve(cfg: &MappingConfig, source_table: Table, destination_table: Table) -> Result<Self> {
        let mut column_mappings = Vec::with_capacity(cfg.columns.len());
        for cm in &cfg.columns {
            column_mappings.push(resolve_column_mapping(cm, &source_table, &destination_table)?);
        }

        if !column_mappings.iter().any(|cm| cm.active) {
            return Err(SyncError::Config(format!(
                "Mapping {} -> {} has no active column mappings",
                source_table.name, destination_table.name
            )));
        }

        collapse_keys_onto_identity(&mut column_mappings, &destination_table);

        let conditionals = cfg
            .conditionals
            .iter()
            .map(|c| {
                let column = source_table.column(&c.column).cloned().ok_or_else(|| {
                    SyncError::Config(format!(
                        "Conditional column {} not found in source table {}",
                        c.column, source_table.name
                    ))
                })?;
                Conditional::resolve(column, c.operator, &c.values)
            })
            .collect::<Result<Vec<_>>>()?;

        let response_mappings = cfg
            .response_columns
            .iter()
            .map(|rc| {
                let source_column = destination_table.column(&rc.source).cloned().ok_or_else(|| {
                    SyncError::Config(format!(
                        "Response column {} not found in destination table {}",
                        rc.source, destination_table.name
                    ))
                })?;
                let target_column = source_table.column(&rc.target).cloned().ok_or_else(|| {
                    SyncError::Config(format!(
                        "Response target column {} not found in source table {}",
                        rc.target, source_table.name
                    ))
                })?;
                Ok(ResponseColumnMapping {
                    source_column,
                    target_column,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mapping = Self {
            source_table,
            destination_table,
            column_mappings,
            conditionals,
            response_mappings,
            active: cfg.active,
            remove_missing_after_import: cfg.remove_missing_after_import,
            discard_duplicates: cfg.discard_duplicates,
        };

        if !mapping.response_mappings.is_empty() && mapping.source_key_columns().is_empty() {
            return Err(SyncError::Mapping(format!(
                "Mapping {} -> {} declares response mappings but no key column is set",
                mapping.source_table.name, mapping.destination_table.name
            )));
        }

        Ok(mapping)
    }

    /// Active column mappings, in declaration order.
    pub fn active_mappings(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.column_mappings.iter().filter(|cm| cm.active)
    }

    /// Active key-flagged mappings.
    pub fn key_mappings(&self) -> Vec<&ColumnMapping> {
        self.active_mappings().filter(|cm| cm.is_key).collect()
    }

    /// Mappings forming the merge join condition: key-flagged columns, or
    /// every non-script-derived column when no key is declared.
    pub fn join_mappings(&self) -> Vec<&ColumnMapping> {
        let keys = self.key_mappings();
        if !keys.is_empty() {
            return keys;
        }
        self.active_mappings()
            .filter(|cm| cm.script.is_none())
            .collect()
    }

    /// Distinct source-side key column names (drives write-back addressing).
    pub fn source_key_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for cm in self.active_mappings() {
            if !cm.is_key {
                continue;
            }
            if let Some(src) = &cm.source_column {
                if !out.iter().any(|c| c.eq_ignore_ascii_case(&src.name)) {
                    out.push(&src.name);
                }
            }
        }
        out
    }

    /// Destination columns staged for this mapping: the distinct destination
    /// columns of active mappings, in declaration order.
    pub fn staging_columns(&self) -> Vec<Column> {
        let mut out: Vec<Column> = Vec::new();
        for cm in self.active_mappings() {
            if !out
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&cm.destination_column.name))
            {
                out.push(cm.destination_column.clone());
            }
        }
        out
    }

    /// The distinct set of source columns the reader must project: columns
    /// referenced by active mappings first, then conditional-only columns.
    pub fn projected_source_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for cm in self.active_mappings() {
            if let Some(src) = &cm.source_column {
                if !out.iter().any(|c| c.eq_ignore_ascii_case(&src.name)) {
                    out.push(src.name.clone());
                }
            }
        }
        for cond in &self.conditionals {
            if !out.iter().any(|c| c.eq_ignore_ascii_case(&cond.column.name)) {
                out.push(cond.column.name.clone());
            }
        }
        out
    }

    /// Whether the destination's identity column is actively mapped.
    pub fn maps_identity_column(&self) -> bool {
        match self.destination_table.identity_column() {
            Some(id) => self
                .active_mappings()
                .any(|cm| cm.destination_column.name.eq_ignore_ascii_case(&id.name)),
            None => false,
        }
    }

    /// Evaluate all conditionals against a row; rows failing any conditional
    /// are filtered out.
    pub fn check_conditionals(&self, row: &crate::row::SourceRow) -> bool {
        self.conditionals.iter().all(|c| c.matches(row))
    }

    /// Short "source -> destination" label for logs and errors.
    pub fn describe(&self) -> String {
        format!("{} -> {}", self.source_table.name, self.destination_table.name)
    }
}

fn resolve_column_mapping(
    cm: &ColumnMappingConfig,
    source_table: &Table,
    destination_table: &Table,
) -> Result<ColumnMapping> {
    let destination_column = destination_table.column(&cm.destination).cloned().ok_or_else(|| {
        SyncError::Config(format!(
            "Destination column {} not found in table {}",
            cm.destination, destination_table.name
        ))
    })?;

    let source_column = match &cm.source {
        Some(name) => Some(source_table.column(name).cloned().ok_or_else(|| {
            SyncError::Config(format!(
                "Source column {} not found in table {}",
                name, source_table.name
            ))
        })?),
        None => None,
    };

    let script = cm.script.as_ref().map(|s| match s {
        ScriptConfig::Constant { value } => ValueScript::Constant(value.clone()),
        ScriptConfig::NewUuid => ValueScript::NewUuid,
        ScriptConfig::Now => ValueScript::Now,
    });

    if source_column.is_none() && script.is_none() {
        return Err(SyncError::Config(format!(
            "Column mapping to {} has neither a source column nor a script",
            destination_column.name
        )));
    }

    Ok(ColumnMapping {
        source_column,
        destination_column,
        is_key: cm.key,
        active: cm.active,
        script,
    })
}

/// When the destination table's identity column is actively mapped, key flags
/// collapse onto that mapping: the identity is the authoritative row
/// identity for merge joins and duplicate keys.
fn collapse_keys_onto_identity(column_mappings: &mut [ColumnMapping], destination: &Table) {
    let Some(identity) = destination.identity_column() else {
        return;
    };
    let mapped = column_mappings.iter().any(|cm| {
        cm.active && cm.destination_column.name.eq_ignore_ascii_case(&identity.name)
    });
    if !mapped {
        return;
    }
    for cm in column_mappings.iter_mut() {
        cm.is_key = cm.active && cm.destination_column.name.eq_ignore_ascii_case(&identity.name);
    }
}
