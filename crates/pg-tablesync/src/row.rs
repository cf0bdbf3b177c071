//! Row representations for source records and staged destination rows.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::schema::Column;
use crate::value::{SqlValue, TypeCategory};

/// One source record: the projected column set with its values, in query
/// order. Produced fresh per record and immutable once handed downstream.
#[derive(Debug, Clone)]
pub struct SourceRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SourceRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Look up a value by column name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|i| &self.values[i])
    }

    /// Column names in projection order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Compact single-line rendering for failure diagnostics.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| format!("{}={}", c, v.render_text()))
            .collect();
        parts.join(", ")
    }
}

/// The shape of a staged row: the staging table's column list, fixed at
/// staging-writer construction. Unknown destination columns are rejected
/// here, before any row is assembled.
#[derive(Debug, Clone)]
pub struct RowShape {
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

impl RowShape {
    pub fn new(columns: Vec<Column>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_lowercase(), i))
            .collect();
        Self { columns, index }
    }

    /// Position of a destination column in the shape.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.index.get(&name.to_lowercase()).copied().ok_or_else(|| {
            SyncError::Mapping(format!("Unknown destination column in mapping: {}", name))
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// A fresh row of typed NULLs matching this shape.
    pub fn empty_row(&self) -> Vec<SqlValue> {
        self.columns
            .iter()
            .map(|c| SqlValue::Null(TypeCategory::from_udt_name(&c.data_type).null_hint()))
            .collect()
    }
}
