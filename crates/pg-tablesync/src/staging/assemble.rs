//! Assembly of destination-shaped rows from source records.

use crate::error::{Result, SyncError};
use crate::mapping::{Mapping, ValueScript};
use crate::row::{RowShape, SourceRow};
use crate::schema::Column;
use crate::value::SqlValue;

struct AssembleStep {
    source_column: Option<String>,
    script: Option<ValueScript>,
    dest_index: usize,
    dest_column: Column,
    fan_in: bool,
}

/// Turns a source row into a staged row: resolves each active column
/// mapping's value (source column or script), converts it to the destination
/// representation, and writes it into the staging shape — overwriting, or
/// appending when several mappings fan in to one destination column.
pub struct RowAssembler {
    shape: RowShape,
    steps: Vec<AssembleStep>,
    source_table: String,
}

impl RowAssembler {
    pub fn new(mapping: &Mapping) -> Result<Self> {
        let shape = RowShape::new(mapping.staging_columns());

        let active: Vec<_> = mapping.active_mappings().collect();
        let steps = active
            .iter()
            .map(|cm| {
                let fan_in = active
                    .iter()
                    .filter(|other| {
                        other
                            .destination_column
                            .name
                            .eq_ignore_ascii_case(&cm.destination_column.name)
                    })
                    .count()
                    > 1;
                Ok(AssembleStep {
                    source_column: cm.source_column.as_ref().map(|c| c.name.clone()),
                    script: cm.script.clone(),
                    dest_index: shape.index_of(&cm.destination_column.name)?,
                    dest_column: cm.destination_column.clone(),
                    fan_in,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            shape,
            steps,
            source_table: mapping.source_table.name.clone(),
        })
    }

    pub fn shape(&self) -> &RowShape {
        &self.shape
    }

    /// Assemble one staged row. A mapped source column missing from the row
    /// is fatal: it signals a mapping/schema mismatch the whole job must
    /// fail on.
    pub fn assemble(&self, row: &SourceRow) -> Result<Vec<SqlValue>> {
        let mut out = self.shape.empty_row();

        for step in &self.steps {
            let value = match (&step.script, &step.source_column) {
                (Some(script), _) => script.evaluate(),
                (None, Some(source)) => row
                    .get(source)
                    .cloned()
                    .ok_or_else(|| self.value_not_found(source, row))?,
                (None, None) => unreachable!("validated at mapping resolution"),
            };

            let converted = value.coerce_to(&step.dest_column)?;

            if step.fan_in {
                let existing = out[step.dest_index].render_text();
                out[step.dest_index] =
                    SqlValue::Text(format!("{}{}", existing, converted.render_text()));
            } else {
                out[step.dest_index] = converted;
            }
        }

        Ok(out)
    }

    fn value_not_found(&self, column: &str, row: &SourceRow) -> SyncError {
        SyncError::Mapping(format!(
            "No value found for column {} of source table {}. Row: {}",
            column,
            self.source_table,
            row.describe()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnMappingConfig, MappingConfig, ScriptConfig};
    use crate::schema::Table;
    use std::sync::Arc;

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

    fn source_table() -> Table {
        Table {
            schema: "public".to_string(),
            name: "src".to_string(),
            columns: vec![
                column("first", "text"),
                column("last", "text"),
                column("age", "text"),
            ],
        }
    }

    fn dest_table() -> Table {
        Table {
            schema: "public".to_string(),
            name: "People".to_string(),
            columns: vec![
                column("FullName", "text"),
                column("Age", "int4"),
                column("Source", "text"),
            ],
        }
    }

    fn col_cfg(src: Option<&str>, dst: &str) -> ColumnMappingConfig {
        ColumnMappingConfig {
            source: src.map(|s| s.to_string()),
            destination: dst.to_string(),
            key: false,
            active: true,
            script: None,
        }
    }

    fn row(cols: &[(&str, SqlValue)]) -> SourceRow {
        SourceRow::new(
            Arc::new(cols.iter().map(|(c, _)| c.to_string()).collect()),
            cols.iter().map(|(_, v)| v.clone()).collect(),
        )
    }

    fn resolve(columns: Vec<ColumnMappingConfig>) -> Mapping {
        let cfg = MappingConfig {
            source_table: "src".to_string(),
            destination_table: "People".to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: None,
            columns,
            conditionals: vec![],
            response_columns: vec![],
        };
        Mapping::resolve(&cfg, source_table(), dest_table()).unwrap()
    }

    #[test]
    fn test_fan_in_concatenates_in_declaration_order() {
        let m = resolve(vec![
            col_cfg(Some("first"), "FullName"),
            col_cfg(Some("last"), "FullName"),
            col_cfg(Some("age"), "Age"),
        ]);
        let a = RowAssembler::new(&m).unwrap();
        let out = a
            .assemble(&row(&[
                ("first", SqlValue::Text("Ada ".into())),
                ("last", SqlValue::Text("Lovelace".into())),
                ("age", SqlValue::Text("36".into())),
            ]))
            .unwrap();
        assert_eq!(out[0], SqlValue::Text("Ada Lovelace".into()));
        assert_eq!(out[1], SqlValue::I32(36));
    }

    #[test]
    fn test_missing_source_column_is_fatal() {
        let m = resolve(vec![col_cfg(Some("first"), "FullName")]);
        let a = RowAssembler::new(&m).unwrap();
        let err = a
            .assemble(&row(&[("last", SqlValue::Text("x".into()))]))
            .unwrap_err();
        assert!(matches!(err, SyncError::Mapping(_)));
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn test_script_constant_converted_to_destination_type() {
        let mut columns = vec![col_cfg(Some("first"), "FullName")];
        columns.push(ColumnMappingConfig {
            source: None,
            destination: "Age".to_string(),
            key: false,
            active: true,
            script: Some(ScriptConfig::Constant {
                value: "7".to_string(),
            }),
        });
        let m = resolve(columns);
        let a = RowAssembler::new(&m).unwrap();
        let out = a
            .assemble(&row(&[("first", SqlValue::Text("x".into()))]))
            .unwrap();
        assert_eq!(out[1], SqlValue::I32(7));
    }

    #[test]
    fn test_script_wins_over_source_column() {
        let mut cm = col_cfg(Some("first"), "Source");
        cm.script = Some(ScriptConfig::Constant {
            value: "import".to_string(),
        });
        let m = resolve(vec![col_cfg(Some("first"), "FullName"), cm]);
        let a = RowAssembler::new(&m).unwrap();
        let out = a
            .assemble(&row(&[("first", SqlValue::Text("x".into()))]))
            .unwrap();
        // Staged shape is [FullName, Source]; the script value lands second.
        assert_eq!(out[1], SqlValue::Text("import".into()));
    }

    #[test]
    fn test_inactive_mappings_are_ignored() {
        let mut inactive = col_cfg(Some("last"), "Source");
        inactive.active = false;
        let m = resolve(vec![col_cfg(Some("first"), "FullName"), inactive]);
        let a = RowAssembler::new(&m).unwrap();
        // Only FullName is staged.
        assert_eq!(a.shape().len(), 1);
    }
}
