//! Row-filter conditionals.
//!
//! A conditional compares one source column against fixed values. It renders
//! to parameterized SQL for the source query and evaluates against in-memory
//! rows in the staging writer; both paths share the same comparison rules.

use std::cmp::Ordering;

use crate::error::{Result, SyncError};
use crate::ident::quote_ident;
use crate::row::SourceRow;
use crate::schema::Column;
use crate::value::{SqlValue, TypeCategory};

/// Comparison operator of a conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalOperator {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    Contains,
    In,
}

/// A resolved conditional: source column descriptor, operator and the
/// comparison values coerced to the column's representation.
#[derive(Debug, Clone)]
pub struct Conditional {
    pub column: Column,
    pub operator: ConditionalOperator,
    pub values: Vec<SqlValue>,
}

impl Conditional {
    /// Resolve raw comparison strings against the source column's type.
    pub fn resolve(
        column: Column,
        operator: ConditionalOperator,
        raw_values: &[String],
    ) -> Result<Self> {
        if raw_values.is_empty() {
            return Err(SyncError::Config(format!(
                "Conditional on column {} has no comparison value",
                column.name
            )));
        }
        if operator != ConditionalOperator::In && raw_values.len() != 1 {
            return Err(SyncError::Config(format!(
                "Conditional on column {} expects exactly one comparison value",
                column.name
            )));
        }
        if operator == ConditionalOperator::Contains
            && TypeCategory::from_udt_name(&column.data_type) != TypeCategory::Text
        {
            return Err(SyncError::Config(format!(
                "Contains conditional requires a text column, got {} ({})",
                column.name, column.data_type
            )));
        }

        let values = raw_values
            .iter()
            .map(|raw| SqlValue::Text(raw.clone()).coerce_to(&column))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| {
                SyncError::Config(format!(
                    "Conditional value for column {} does not fit its type: {}",
                    column.name, e
                ))
            })?;

        Ok(Self {
            column,
            operator,
            values,
        })
    }

    /// Render this conditional as a SQL fragment, appending its bound values
    /// to `params`. Placeholders continue from the current params length.
    pub fn to_sql(&self, params: &mut Vec<Option<String>>) -> Result<String> {
        let col = quote_ident(&self.column.name)?;
        let cast = self.values[0].sql_cast();

        let fragment = match self.operator {
            ConditionalOperator::Equal => {
                params.push(self.values[0].to_param());
                format!("{} = ${}{}", col, params.len(), cast)
            }
            ConditionalOperator::NotEqual => {
                params.push(self.values[0].to_param());
                format!("{} <> ${}{}", col, params.len(), cast)
            }
            ConditionalOperator::LessThan => {
                params.push(self.values[0].to_param());
                format!("{} < ${}{}", col, params.len(), cast)
            }
            ConditionalOperator::GreaterThan => {
                params.push(self.values[0].to_param());
                format!("{} > ${}{}", col, params.len(), cast)
            }
            ConditionalOperator::Contains => {
                let needle = self.values[0].render_text();
                params.push(Some(format!("%{}%", like_escape(&needle))));
                format!("{} LIKE ${}::text", col, params.len())
            }
            ConditionalOperator::In => {
                let mut placeholders = Vec::with_capacity(self.values.len());
                for v in &self.values {
                    params.push(v.to_param());
                    placeholders.push(format!("${}{}", params.len(), cast));
                }
                format!("{} IN ({})", col, placeholders.join(", "))
            }
        };

        Ok(fragment)
    }

    /// Evaluate this conditional against an in-memory row.
    ///
    /// A row whose column is missing or NULL never matches, mirroring SQL
    /// comparison semantics.
    pub fn matches(&self, row: &SourceRow) -> bool {
        let Some(actual) = row.get(&self.column.name) else {
            return false;
        };
        if actual.is_null() {
            return false;
        }

        match self.operator {
            ConditionalOperator::Equal => compare(actual, &self.values[0]) == Some(Ordering::Equal),
            ConditionalOperator::NotEqual => {
                matches!(compare(actual, &self.values[0]), Some(o) if o != Ordering::Equal)
            }
            ConditionalOperator::LessThan => {
                compare(actual, &self.values[0]) == Some(Ordering::Less)
            }
            ConditionalOperator::GreaterThan => {
                compare(actual, &self.values[0]) == Some(Ordering::Greater)
            }
            ConditionalOperator::Contains => {
                actual.render_text().contains(&self.values[0].render_text())
            }
            ConditionalOperator::In => self
                .values
                .iter()
                .any(|v| compare(actual, v) == Some(Ordering::Equal)),
        }
    }
}

/// Compare two values of compatible types. Incomparable pairs yield None,
/// which every operator treats as no-match.
fn compare(a: &SqlValue, b: &SqlValue) -> Option<Ordering> {
    use SqlValue::*;
    match (a, b) {
        (Bool(x), Bool(y)) => x.partial_cmp(y),
        (Text(x), Text(y)) => x.partial_cmp(y),
        (Uuid(x), Uuid(y)) => x.partial_cmp(y),
        (Decimal(x), Decimal(y)) => x.partial_cmp(y),
        (DateTime(x), DateTime(y)) => x.partial_cmp(y),
        (DateTimeOffset(x), DateTimeOffset(y)) => x.partial_cmp(y),
        (Date(x), Date(y)) => x.partial_cmp(y),
        (Time(x), Time(y)) => x.partial_cmp(y),
        (Bytes(x), Bytes(y)) => x.partial_cmp(y),
        _ => {
            let (x, y) = (as_f64(a)?, as_f64(b)?);
            x.partial_cmp(&y)
        }
    }
}

fn as_f64(v: &SqlValue) -> Option<f64> {
    match v {
        SqlValue::I16(n) => Some(*n as f64),
        SqlValue::I32(n) => Some(*n as f64),
        SqlValue::I64(n) => Some(*n as f64),
        SqlValue::F32(n) => Some(*n as f64),
        SqlValue::F64(n) => Some(*n as f64),
        _ => None,
    }
}

/// Escape LIKE metacharacters in a Contains needle.
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
