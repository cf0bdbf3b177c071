//! Merge engine: moves staged rows into the destination table and removes
//! excess rows.
//!
//! Statement generation is pure (and unit-tested without a database); the
//! executors run on the job transaction owned by the orchestrator. Identifier
//! quoting goes through `ident`; staged data never appears in statement text.

use tokio_postgres::Transaction;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::ident::{qualify, quote_ident};
use crate::mapping::Mapping;
use crate::schema::{Column, ForeignKey};
use crate::staging::StagingTable;

/// Join condition equating destination and staging rows, or `None` for a
/// degenerate mapping (no key and no non-script column).
pub fn join_condition(mapping: &Mapping, dest_alias: &str, stg_alias: &str) -> Result<Option<String>> {
    let join = mapping.join_mappings();
    if join.is_empty() {
        return Ok(None);
    }

    let mut seen: Vec<&str> = Vec::new();
    let mut clauses = Vec::new();
    for cm in join {
        let name = cm.destination_column.name.as_str();
        if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            continue;
        }
        seen.push(name);
        let col = quote_ident(name)?;
        clauses.push(format!("{}.{} = {}.{}", dest_alias, col, stg_alias, col));
    }
    Ok(Some(clauses.join(" AND ")))
}

/// Columns updated on matched rows: every staged column that is not part of
/// the join condition, not an identity column and not insert-only scripted.
fn update_set_columns(mapping: &Mapping) -> Vec<Column> {
    let join: Vec<String> = mapping
        .join_mappings()
        .iter()
        .map(|cm| cm.destination_column.name.clone())
        .collect();
    let insert_only: Vec<String> = mapping
        .active_mappings()
        .filter(|cm| cm.insert_only())
        .map(|cm| cm.destination_column.name.clone())
        .collect();

    mapping
        .staging_columns()
        .into_iter()
        .filter(|c| !c.is_identity)
        .filter(|c| !join.iter().any(|j| j.eq_ignore_ascii_case(&c.name)))
        .filter(|c| !insert_only.iter().any(|s| s.eq_ignore_ascii_case(&c.name)))
        .collect()
}

/// Build the UPDATE of destination rows matched by staging rows. `None` when
/// the mapping is degenerate or every staged column is part of the join.
pub fn build_update_sql(mapping: &Mapping, staging_sql: &str) -> Result<Option<String>> {
    let Some(join) = join_condition(mapping, "d", "stg")? else {
        return Ok(None);
    };

    let set_columns = update_set_columns(mapping);
    if set_columns.is_empty() {
        return Ok(None);
    }

    let set_list = set_columns
        .iter()
        .map(|c| Ok(format!("{} = stg.{}", quote_ident(&c.name)?, quote_ident(&c.name)?)))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    Ok(Some(format!(
        "UPDATE {} AS d SET {} FROM {} AS stg WHERE {}",
        qualify(&mapping.destination_table.schema, &mapping.destination_table.name)?,
        set_list,
        staging_sql,
        join
    )))
}

/// Build the INSERT of staging rows with no matching destination row
/// (left-outer-join anti-pattern). `None` for a degenerate mapping.
pub fn build_insert_sql(mapping: &Mapping, staging_sql: &str) -> Result<Option<String>> {
    let Some(join) = join_condition(mapping, "d", "stg")? else {
        return Ok(None);
    };

    let columns = mapping.staging_columns();
    let col_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let select_list = columns
        .iter()
        .map(|c| Ok(format!("stg.{}", quote_ident(&c.name)?)))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    // Explicit-identity-insert mode, scoped to this statement.
    let overriding = if mapping.maps_identity_column() {
        " OVERRIDING SYSTEM VALUE"
    } else {
        ""
    };

    let anti_col = quote_ident(&mapping.join_mappings()[0].destination_column.name)?;

    Ok(Some(format!(
        "INSERT INTO {} ({}){} SELECT {} FROM {} AS stg LEFT JOIN {} AS d ON {} WHERE d.{} IS NULL",
        qualify(&mapping.destination_table.schema, &mapping.destination_table.name)?,
        col_list,
        overriding,
        select_list,
        staging_sql,
        qualify(&mapping.destination_table.schema, &mapping.destination_table.name)?,
        join,
        anti_col
    )))
}

/// Build the deletion of destination rows absent from staging.
pub fn build_delete_sql(
    mapping: &Mapping,
    staging_sql: &str,
    extra_filter: Option<&str>,
) -> Result<Option<String>> {
    let Some(join) = join_condition(mapping, "d", "stg")? else {
        return Ok(None);
    };

    let mut sql = format!(
        "DELETE FROM {} AS d WHERE NOT EXISTS (SELECT 1 FROM {} AS stg WHERE {})",
        qualify(&mapping.destination_table.schema, &mapping.destination_table.name)?,
        staging_sql,
        join
    );
    if let Some(extra) = extra_filter {
        sql.push_str(&format!(" AND ({})", extra));
    }
    Ok(Some(sql))
}

/// Build cascade deletes for child tables referencing rows the main delete
/// will remove. Full removal mode only; the destination-tables-only variant
/// withholds these.
pub fn build_cascade_delete_sqls(
    mapping: &Mapping,
    staging_sql: &str,
    foreign_keys: &[ForeignKey],
    extra_filter: Option<&str>,
) -> Result<Vec<String>> {
    let Some(join) = join_condition(mapping, "d", "stg")? else {
        return Ok(Vec::new());
    };

    let dest = &mapping.destination_table;
    let mut out = Vec::new();

    for fk in foreign_keys {
        if !fk.parent_table.eq_ignore_ascii_case(&dest.name) {
            continue;
        }
        // Self-references resolve through the main delete.
        if fk.child_table.eq_ignore_ascii_case(&dest.name) {
            continue;
        }

        let fk_clauses = fk
            .child_columns
            .iter()
            .zip(&fk.parent_columns)
            .map(|(cc, pc)| Ok(format!("c.{} = d.{}", quote_ident(cc)?, quote_ident(pc)?)))
            .collect::<Result<Vec<_>>>()?
            .join(" AND ");

        let mut sql = format!(
            "DELETE FROM {} AS c USING {} AS d WHERE {} AND NOT EXISTS (SELECT 1 FROM {} AS stg WHERE {})",
            qualify(&dest.schema, &fk.child_table)?,
            qualify(&dest.schema, &dest.name)?,
            fk_clauses,
            staging_sql,
            join
        );
        if let Some(extra) = extra_filter {
            sql.push_str(&format!(" AND ({})", extra));
        }
        out.push(sql);
    }

    Ok(out)
}

/// Generated-value fetch for response write-back: selects the response
/// columns from merged destination rows joined back to staging, plus the
/// staged key columns addressing the source records.
///
/// Returns the SQL, the source-side target columns (one per response
/// mapping) and the source-side key columns, in select-list order.
pub fn build_response_fetch_sql(
    mapping: &Mapping,
    staging_sql: &str,
) -> Result<Option<(String, Vec<String>, Vec<String>)>> {
    if mapping.response_mappings.is_empty() {
        return Ok(None);
    }
    let Some(join) = join_condition(mapping, "d", "stg")? else {
        return Ok(None);
    };

    let mut select = Vec::new();
    let mut targets = Vec::new();
    for rm in &mapping.response_mappings {
        select.push(format!("d.{}", quote_ident(&rm.source_column.name)?));
        targets.push(rm.target_column.name.clone());
    }

    let mut key_sources = Vec::new();
    for src_key in mapping.source_key_columns() {
        let dest_col = mapping
            .active_mappings()
            .find(|cm| {
                cm.is_key
                    && cm
                        .source_column
                        .as_ref()
                        .map(|c| c.name.eq_ignore_ascii_case(src_key))
                        .unwrap_or(false)
            })
            .map(|cm| cm.destination_column.name.clone())
            .ok_or_else(|| {
                SyncError::Mapping(format!(
                    "No staged column found for source key {} in mapping {}",
                    src_key,
                    mapping.describe()
                ))
            })?;
        select.push(format!("stg.{}", quote_ident(&dest_col)?));
        key_sources.push(src_key.to_string());
    }

    let sql = format!(
        "SELECT {} FROM {} AS stg JOIN {} AS d ON {}",
        select.join(", "),
        staging_sql,
        qualify(&mapping.destination_table.schema, &mapping.destination_table.name)?,
        join
    );

    Ok(Some((sql, targets, key_sources)))
}

/// Execute the update-existing / insert-new statement set for one staged
/// table. Returns total rows affected. Always fatal on failure.
pub async fn merge_into_main(
    txn: &Transaction<'_>,
    mapping: &Mapping,
    staging: &StagingTable,
) -> Result<u64> {
    let table = mapping.destination_table.full_name();
    let columns = mapping
        .staging_columns()
        .iter()
        .map(|c| c.name.clone())
        .collect::<Vec<_>>()
        .join(", ");

    let Some(insert_sql) = build_insert_sql(mapping, &staging.qualified)? else {
        warn!(
            "Mapping {} has no derivable join condition; merge skipped",
            mapping.describe()
        );
        return Ok(0);
    };

    let mut affected = 0u64;

    if let Some(update_sql) = build_update_sql(mapping, &staging.qualified)? {
        debug!("Merge update for {}: {}", table, update_sql);
        affected += txn
            .execute(update_sql.as_str(), &[])
            .await
            .map_err(|e| SyncError::merge(&table, &columns, e))?;
    }

    debug!("Merge insert for {}: {}", table, insert_sql);
    affected += txn
        .execute(insert_sql.as_str(), &[])
        .await
        .map_err(|e| SyncError::merge(&table, &columns, e))?;

    if mapping.maps_identity_column() {
        resync_identity_sequence(txn, mapping)
            .await
            .map_err(|e| SyncError::merge(&table, &columns, e))?;
    }

    Ok(affected)
}

/// Resynchronize the identity sequence after explicit-identity inserts,
/// within the same transaction.
async fn resync_identity_sequence(txn: &Transaction<'_>, mapping: &Mapping) -> Result<()> {
    let dest = &mapping.destination_table;
    let Some(identity) = dest.identity_column() else {
        return Ok(());
    };

    let qualified = qualify(&dest.schema, &dest.name)?;
    let sql = format!(
        "SELECT COALESCE(MAX({})::bigint, 0) FROM {}",
        quote_ident(&identity.name)?,
        qualified
    );
    let row = txn.query_one(sql.as_str(), &[]).await?;
    let max_val: i64 = row.get(0);
    if max_val == 0 {
        return Ok(());
    }

    let restart = format!(
        "ALTER TABLE {} ALTER COLUMN {} RESTART WITH {}",
        qualified,
        quote_ident(&identity.name)?,
        max_val + 1
    );
    if txn.execute(restart.as_str(), &[]).await.is_err() {
        // Fall back to setval for SERIAL columns.
        let setval = format!(
            "SELECT setval(pg_get_serial_sequence('{}', '{}'), {})",
            qualified,
            identity.name.replace('\'', "''"),
            max_val
        );
        txn.execute(setval.as_str(), &[]).await?;
    }

    debug!("Resynced identity sequence for {}.{}", qualified, identity.name);
    Ok(())
}

/// Delete destination rows whose keys are absent from staging. In full
/// removal mode, dependent rows in child tables go first; the
/// destination-tables-only variant touches only the mapped table.
pub async fn delete_excess(
    txn: &Transaction<'_>,
    mapping: &Mapping,
    staging: &StagingTable,
    extra_filter: Option<&str>,
    destination_tables_only: bool,
    foreign_keys: &[ForeignKey],
) -> Result<u64> {
    let table = mapping.destination_table.full_name();
    let columns = mapping
        .staging_columns()
        .iter()
        .map(|c| c.name.clone())
        .collect::<Vec<_>>()
        .join(", ");

    let Some(delete_sql) = build_delete_sql(mapping, &staging.qualified, extra_filter)? else {
        warn!(
            "Mapping {} has no derivable join condition; excess-deletion skipped",
            mapping.describe()
        );
        return Ok(0);
    };

    if !destination_tables_only {
        let cascades =
            build_cascade_delete_sqls(mapping, &staging.qualified, foreign_keys, extra_filter)?;
        for sql in cascades {
            debug!("Cascade delete for {}: {}", table, sql);
            let removed = txn
                .execute(sql.as_str(), &[])
                .await
                .map_err(|e| SyncError::merge(&table, &columns, e))?;
            if removed > 0 {
                info!("Removed {} dependent rows before deleting from {}", removed, table);
            }
        }
    }

    debug!("Excess delete for {}: {}", table, delete_sql);
    txn.execute(delete_sql.as_str(), &[])
        .await
        .map_err(|e| SyncError::merge(&table, &columns, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnMappingConfig, MappingConfig, ResponseColumnConfig, ScriptConfig};
    use crate::schema::Table;

    fn column(name: &str, udt: &str, identity: bool) -> Column {
        Column {
            name: name.to_string(),
            data_type: udt.to_string(),
            is_nullable: true,
            is_identity: identity,
            is_primary_key: false,
            ordinal_pos: 1,
        }
    }

    fn tables(identity: bool) -> (Table, Table) {
        let source = Table {
            schema: "public".to_string(),
            name: "src_orders".to_string(),
            columns: vec![
                column("id", "int8", false),
                column("ref", "text", false),
                column("total", "numeric", false),
            ],
        };
        let destination = Table {
            schema: "public".to_string(),
            name: "Orders".to_string(),
            columns: vec![
                column("Id", "int8", identity),
                column("Ref", "text", false),
                column("Total", "numeric", false),
            ],
        };
        (source, destination)
    }

    fn col_cfg(src: &str, dst: &str, key: bool) -> ColumnMappingConfig {
        ColumnMappingConfig {
            source: Some(src.to_string()),
            destination: dst.to_string(),
            key,
            active: true,
            script: None,
        }
    }

    fn mapping(identity: bool, columns: Vec<ColumnMappingConfig>) -> Mapping {
        let (source, destination) = tables(identity);
        let cfg = MappingConfig {
            source_table: "src_orders".to_string(),
            destination_table: "Orders".to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: None,
            columns,
            conditionals: vec![],
            response_columns: vec![],
        };
        Mapping::resolve(&cfg, source, destination).unwrap()
    }

    const STG: &str = "\"public\".\"Orders_sync_x\"";

    #[test]
    fn test_update_sets_non_key_columns_only() {
        let m = mapping(
            false,
            vec![
                col_cfg("id", "Id", true),
                col_cfg("ref", "Ref", false),
                col_cfg("total", "Total", false),
            ],
        );
        let sql = build_update_sql(&m, STG).unwrap().unwrap();
        assert_eq!(
            sql,
            "UPDATE \"public\".\"Orders\" AS d SET \"Ref\" = stg.\"Ref\", \"Total\" = stg.\"Total\" \
             FROM \"public\".\"Orders_sync_x\" AS stg WHERE d.\"Id\" = stg.\"Id\""
        );
    }

    #[test]
    fn test_insert_uses_anti_join() {
        let m = mapping(
            false,
            vec![col_cfg("id", "Id", true), col_cfg("ref", "Ref", false)],
        );
        let sql = build_insert_sql(&m, STG).unwrap().unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"Orders\" (\"Id\", \"Ref\") SELECT stg.\"Id\", stg.\"Ref\" \
             FROM \"public\".\"Orders_sync_x\" AS stg LEFT JOIN \"public\".\"Orders\" AS d \
             ON d.\"Id\" = stg.\"Id\" WHERE d.\"Id\" IS NULL"
        );
    }

    #[test]
    fn test_insert_overrides_identity_when_mapped() {
        let m = mapping(
            true,
            vec![col_cfg("id", "Id", true), col_cfg("ref", "Ref", false)],
        );
        let sql = build_insert_sql(&m, STG).unwrap().unwrap();
        assert!(sql.contains("OVERRIDING SYSTEM VALUE"));
    }

    #[test]
    fn test_update_excludes_identity_column() {
        // Identity actively mapped: keys collapse onto it, and the identity
        // column itself never appears in the SET list.
        let m = mapping(
            true,
            vec![
                col_cfg("id", "Id", false),
                col_cfg("ref", "Ref", true),
                col_cfg("total", "Total", false),
            ],
        );
        let sql = build_update_sql(&m, STG).unwrap().unwrap();
        assert!(sql.contains("WHERE d.\"Id\" = stg.\"Id\""));
        assert!(sql.contains("SET \"Ref\" = stg.\"Ref\", \"Total\" = stg.\"Total\""));
    }

    #[test]
    fn test_join_falls_back_to_all_non_script_columns() {
        let m = mapping(
            false,
            vec![col_cfg("id", "Id", false), col_cfg("ref", "Ref", false)],
        );
        let join = join_condition(&m, "d", "stg").unwrap().unwrap();
        assert_eq!(join, "d.\"Id\" = stg.\"Id\" AND d.\"Ref\" = stg.\"Ref\"");
        // Every staged column is part of the join: no update statement.
        assert!(build_update_sql(&m, STG).unwrap().is_none());
    }

    #[test]
    fn test_degenerate_mapping_has_no_join() {
        let (source, destination) = tables(false);
        let cfg = MappingConfig {
            source_table: "src_orders".to_string(),
            destination_table: "Orders".to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: None,
            columns: vec![ColumnMappingConfig {
                source: None,
                destination: "Ref".to_string(),
                key: false,
                active: true,
                script: Some(ScriptConfig::Constant {
                    value: "fixed".to_string(),
                }),
            }],
            conditionals: vec![],
            response_columns: vec![],
        };
        let m = Mapping::resolve(&cfg, source, destination).unwrap();
        assert!(join_condition(&m, "d", "stg").unwrap().is_none());
        assert!(build_insert_sql(&m, STG).unwrap().is_none());
        assert!(build_delete_sql(&m, STG, None).unwrap().is_none());
    }

    #[test]
    fn test_delete_excess_shape() {
        let m = mapping(
            false,
            vec![col_cfg("id", "Id", true), col_cfg("ref", "Ref", false)],
        );
        let sql = build_delete_sql(&m, STG, None).unwrap().unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"public\".\"Orders\" AS d WHERE NOT EXISTS \
             (SELECT 1 FROM \"public\".\"Orders_sync_x\" AS stg WHERE d.\"Id\" = stg.\"Id\")"
        );
    }

    #[test]
    fn test_delete_excess_appends_extra_filter() {
        let m = mapping(false, vec![col_cfg("id", "Id", true)]);
        let sql = build_delete_sql(&m, STG, Some("d.\"CustomerId\" = 7"))
            .unwrap()
            .unwrap();
        assert!(sql.ends_with(" AND (d.\"CustomerId\" = 7)"));
    }

    #[test]
    fn test_cascade_deletes_only_for_children_of_destination() {
        let m = mapping(false, vec![col_cfg("id", "Id", true)]);
        let fks = vec![
            ForeignKey {
                name: "fk_lines_orders".to_string(),
                child_table: "OrderLines".to_string(),
                child_columns: vec!["OrderId".to_string()],
                parent_table: "Orders".to_string(),
                parent_columns: vec!["Id".to_string()],
            },
            ForeignKey {
                name: "fk_other".to_string(),
                child_table: "Payments".to_string(),
                child_columns: vec!["InvoiceId".to_string()],
                parent_table: "Invoices".to_string(),
                parent_columns: vec!["Id".to_string()],
            },
        ];
        let sqls = build_cascade_delete_sqls(&m, STG, &fks, None).unwrap();
        assert_eq!(sqls.len(), 1);
        assert_eq!(
            sqls[0],
            "DELETE FROM \"public\".\"OrderLines\" AS c USING \"public\".\"Orders\" AS d \
             WHERE c.\"OrderId\" = d.\"Id\" AND NOT EXISTS \
             (SELECT 1 FROM \"public\".\"Orders_sync_x\" AS stg WHERE d.\"Id\" = stg.\"Id\")"
        );
    }

    #[test]
    fn test_response_fetch_selects_generated_and_key_columns() {
        let (source, destination) = tables(true);
        let cfg = MappingConfig {
            source_table: "src_orders".to_string(),
            destination_table: "Orders".to_string(),
            active: true,
            remove_missing_after_import: None,
            discard_duplicates: None,
            columns: vec![col_cfg("ref", "Ref", true)],
            conditionals: vec![],
            response_columns: vec![ResponseColumnConfig {
                source: "Id".to_string(),
                target: "id".to_string(),
            }],
        };
        let m = Mapping::resolve(&cfg, source, destination).unwrap();
        let (sql, targets, keys) = build_response_fetch_sql(&m, STG).unwrap().unwrap();
        assert_eq!(
            sql,
            "SELECT d.\"Id\", stg.\"Ref\" FROM \"public\".\"Orders_sync_x\" AS stg \
             JOIN \"public\".\"Orders\" AS d ON d.\"Ref\" = stg.\"Ref\""
        );
        assert_eq!(targets, vec!["id".to_string()]);
        assert_eq!(keys, vec!["ref".to_string()]);
    }
}
