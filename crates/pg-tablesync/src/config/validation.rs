//! Structural configuration validation.
//!
//! Schema-dependent checks (column existence, type fit, response key
//! invariants) happen later, when mappings are resolved against the
//! introspected destination; this pass catches what the YAML alone reveals.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::ident::validate_identifier;

pub fn validate(config: &Config) -> Result<()> {
    if config.connection.host.is_empty() {
        return Err(SyncError::Config("connection.host must not be empty".into()));
    }
    if config.connection.database.is_empty() {
        return Err(SyncError::Config("connection.database must not be empty".into()));
    }
    if config.connection.pool_size < 2 {
        return Err(SyncError::Config(
            "connection.pool_size must be at least 2 (job connection plus reader)".into(),
        ));
    }
    if config.job.batch_size == 0 {
        return Err(SyncError::Config("job.batch_size must be greater than zero".into()));
    }
    if config.job.mappings.is_empty() {
        return Err(SyncError::Config("job.mappings must not be empty".into()));
    }

    for mapping in &config.job.mappings {
        validate_identifier(&mapping.source_table)?;
        validate_identifier(&mapping.destination_table)?;

        if mapping.columns.is_empty() {
            return Err(SyncError::Config(format!(
                "Mapping {} -> {} has no column mappings",
                mapping.source_table, mapping.destination_table
            )));
        }

        for cm in &mapping.columns {
            validate_identifier(&cm.destination)?;
            if let Some(src) = &cm.source {
                validate_identifier(src)?;
            }
            if cm.source.is_none() && cm.script.is_none() {
                return Err(SyncError::Config(format!(
                    "Column mapping to {} in {} -> {} has neither a source column nor a script",
                    cm.destination, mapping.source_table, mapping.destination_table
                )));
            }
        }

        for cond in &mapping.conditionals {
            validate_identifier(&cond.column)?;
            if cond.values.is_empty() {
                return Err(SyncError::Config(format!(
                    "Conditional on {} in mapping {} -> {} has no comparison values",
                    cond.column, mapping.source_table, mapping.destination_table
                )));
            }
        }

        for rc in &mapping.response_columns {
            validate_identifier(&rc.source)?;
            validate_identifier(&rc.target)?;
        }
    }

    for (table, columns) in &config.job.staging_extra_columns {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::Config;

    fn base_yaml(mappings: &str) -> String {
        format!(
            r#"
connection:
  host: localhost
  database: shop
  user: sync
  password: secret
job:
  mappings:
{}
"#,
            mappings
        )
    }

    #[test]
    fn test_mapping_without_columns_rejected() {
        let yaml = base_yaml(
            r#"    - source_table: a
      destination_table: b
      columns: []"#,
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_column_without_source_or_script_rejected() {
        let yaml = base_yaml(
            r#"    - source_table: a
      destination_table: b
      columns:
        - destination: C"#,
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_conditional_without_values_rejected() {
        let yaml = base_yaml(
            r#"    - source_table: a
      destination_table: b
      columns:
        - source: x
          destination: C
      conditionals:
        - column: x
          operator: equal
          values: []"#,
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let yaml = r#"
connection:
  host: localhost
  database: shop
  user: sync
  password: secret
job:
  batch_size: 0
  mappings:
    - source_table: a
      destination_table: b
      columns:
        - source: x
          destination: C
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }
}
