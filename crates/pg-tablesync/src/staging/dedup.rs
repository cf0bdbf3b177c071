//! Duplicate detection over staged rows.

use std::collections::HashSet;

use crate::error::{Result, SyncError};
use crate::mapping::Mapping;
use crate::row::RowShape;
use crate::value::SqlValue;

/// Tracks the dedup keys seen in the current staging session.
///
/// The key is the tuple of key-flagged destination column values; text parts
/// compare case-insensitively, everything else exactly. First-seen wins.
#[derive(Debug)]
pub struct DuplicateDetector {
    key_indices: Vec<usize>,
    seen: HashSet<Vec<String>>,
    duplicates: u64,
}

impl DuplicateDetector {
    /// Build a detector for the mapping's key columns.
    ///
    /// Discard-duplicates with no key-flagged column is a configuration
    /// error: there is no defensible default key set to guess.
    pub fn new(mapping: &Mapping, shape: &RowShape) -> Result<Self> {
        let keys = mapping.key_mappings();
        if keys.is_empty() {
            return Err(SyncError::Mapping(format!(
                "Mapping {} enables discard-duplicates but flags no key column",
                mapping.describe()
            )));
        }

        let mut key_indices = Vec::with_capacity(keys.len());
        for cm in keys {
            let idx = shape.index_of(&cm.destination_column.name)?;
            if !key_indices.contains(&idx) {
                key_indices.push(idx);
            }
        }

        Ok(Self {
            key_indices,
            seen: HashSet::new(),
            duplicates: 0,
        })
    }

    /// Whether this staged row duplicates an earlier one. Records the key
    /// either way, so the first occurrence always passes.
    pub fn is_duplicate(&mut self, staged_row: &[SqlValue]) -> bool {
        let key: Vec<String> = self
            .key_indices
            .iter()
            .map(|&i| staged_row[i].dedup_key_part())
            .collect();

        if self.seen.insert(key) {
            false
        } else {
            self.duplicates += 1;
            true
        }
    }

    /// Number of rows dropped as duplicates so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnMappingConfig, MappingConfig};
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

    fn mapping(with_key: bool) -> Mapping {
        let source = Table {
            schema: "public".to_string(),
            name: "src".to_string(),
            columns: vec![column("id", "int4"), column("name", "text")],
        };
        let destination = Table {
            schema: "public".to_string(),
            name: "Dest".to_string(),
            columns: vec![column("Id", "int4"), column("Name", "text")],
        };
        let cfg = MappingConfig {
            source_table: "src".to_string(),
            destination_table: "Dest".to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: Some(true),
            columns: vec![
                ColumnMappingConfig {
                    source: Some("id".to_string()),
                    destination: "Id".to_string(),
                    key: with_key,
                    active: true,
                    script: None,
                },
                ColumnMappingConfig {
                    source: Some("name".to_string()),
                    destination: "Name".to_string(),
                    key: false,
                    active: true,
                    script: None,
                },
            ],
            conditionals: vec![],
            response_columns: vec![],
        };
        Mapping::resolve(&cfg, source, destination).unwrap()
    }

    fn shape(m: &Mapping) -> RowShape {
        RowShape::new(m.staging_columns())
    }

    #[test]
    fn test_first_seen_wins() {
        let m = mapping(true);
        let mut d = DuplicateDetector::new(&m, &shape(&m)).unwrap();
        let row_a = vec![SqlValue::I32(1), SqlValue::Text("A".into())];
        let row_b = vec![SqlValue::I32(2), SqlValue::Text("B".into())];
        let row_a2 = vec![SqlValue::I32(1), SqlValue::Text("other".into())];

        assert!(!d.is_duplicate(&row_a));
        assert!(!d.is_duplicate(&row_b));
        assert!(d.is_duplicate(&row_a2));
        assert_eq!(d.duplicates(), 1);
    }

    #[test]
    fn test_text_keys_compare_case_insensitively() {
        let source = Table {
            schema: "public".to_string(),
            name: "src".to_string(),
            columns: vec![column("name", "text")],
        };
        let destination = Table {
            schema: "public".to_string(),
            name: "Dest".to_string(),
            columns: vec![column("Name", "text")],
        };
        let cfg = MappingConfig {
            source_table: "src".to_string(),
            destination_table: "Dest".to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: Some(true),
            columns: vec![ColumnMappingConfig {
                source: Some("name".to_string()),
                destination: "Name".to_string(),
                key: true,
                active: true,
                script: None,
            }],
            conditionals: vec![],
            response_columns: vec![],
        };
        let m = Mapping::resolve(&cfg, source, destination).unwrap();
        let mut d = DuplicateDetector::new(&m, &shape(&m)).unwrap();

        assert!(!d.is_duplicate(&[SqlValue::Text("Alice".into())]));
        assert!(d.is_duplicate(&[SqlValue::Text("ALICE".into())]));
    }

    #[test]
    fn test_no_key_is_configuration_error() {
        let m = mapping(false);
        // Key collapse does not apply (no identity column), so no key exists.
        let err = DuplicateDetector::new(&m, &shape(&m)).unwrap_err();
        assert!(matches!(err, SyncError::Mapping(_)));
    }
}
