//! Destination schema descriptors and introspection.
//!
//! Tables and columns are immutable descriptors fetched once per job from the
//! destination database; every staging table, merge statement and validation
//! check is derived from them rather than from ad-hoc queries.

use deadpool_postgres::Pool;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Table metadata.
#[derive(Debug, Clone)]
pub struct Table {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Column definitions, in ordinal order.
    pub columns: Vec<Column>,
}

impl Table {
    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Look up a column by name (case-insensitive, as identifiers compare in
    /// the store's default collation).
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The identity column, if the table declares one.
    pub fn identity_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_identity)
    }
}

/// Column metadata.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// PostgreSQL udt name (e.g. "int4", "varchar", "timestamptz").
    pub data_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Whether the column is an identity column.
    pub is_identity: bool,

    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

/// Foreign key between two destination tables.
///
/// Used for dependency ordering of mappings and for cascading excess-deletes
/// in full removal mode.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Referencing (child) table name.
    pub child_table: String,

    /// Referencing column names.
    pub child_columns: Vec<String>,

    /// Referenced (parent) table name.
    pub parent_table: String,

    /// Referenced column names.
    pub parent_columns: Vec<String>,
}

/// Reads table and constraint metadata from the destination database.
pub struct SchemaProvider {
    pool: Pool,
    schema: String,
}

impl SchemaProvider {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Fetch a table descriptor with columns, identity and primary-key flags.
    pub async fn get_table(&self, name: &str) -> Result<Table> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "getting connection for get_table"))?;

        let query = r#"
            SELECT
                c.column_name,
                c.udt_name,
                CASE WHEN c.is_nullable = 'YES' THEN true ELSE false END,
                COALESCE(
                    (SELECT true FROM pg_catalog.pg_class cl
                     JOIN pg_catalog.pg_attribute a ON a.attrelid = cl.oid
                     JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace
                     WHERE n.nspname = c.table_schema
                       AND cl.relname = c.table_name
                       AND a.attname = c.column_name
                       AND a.attidentity IN ('a', 'd')),
                    false
                ) AS is_identity,
                COALESCE(
                    (SELECT true FROM pg_catalog.pg_constraint pc
                     JOIN pg_catalog.pg_class cl ON cl.oid = pc.conrelid
                     JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace
                     JOIN pg_catalog.pg_attribute a ON a.attrelid = cl.oid
                     WHERE n.nspname = c.table_schema
                       AND cl.relname = c.table_name
                       AND pc.contype = 'p'
                       AND a.attnum = ANY(pc.conkey)
                       AND a.attname = c.column_name),
                    false
                ) AS is_primary_key,
                c.ordinal_position::int4
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;

        let rows = client.query(query, &[&self.schema, &name]).await?;

        if rows.is_empty() {
            return Err(SyncError::Config(format!(
                "Destination table {}.{} does not exist or has no columns",
                self.schema, name
            )));
        }

        let columns = rows
            .iter()
            .map(|row| Column {
                name: row.get::<_, String>(0),
                data_type: row.get::<_, String>(1),
                is_nullable: row.get::<_, bool>(2),
                is_identity: row.get::<_, bool>(3),
                is_primary_key: row.get::<_, bool>(4),
                ordinal_pos: row.get::<_, i32>(5),
            })
            .collect::<Vec<_>>();

        let table = Table {
            schema: self.schema.clone(),
            name: name.to_string(),
            columns,
        };

        debug!("Loaded {} columns for {}", table.columns.len(), table.full_name());
        Ok(table)
    }

    /// Load all foreign keys between tables in the destination schema.
    pub async fn load_foreign_keys(&self) -> Result<Vec<ForeignKey>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "getting connection for load_foreign_keys"))?;

        let query = r#"
            SELECT
                c.conname,
                ct.relname  AS child_table,
                ca.attname  AS child_column,
                ft.relname  AS parent_table,
                fa.attname  AS parent_column
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class ct ON ct.oid = c.conrelid
            JOIN pg_catalog.pg_namespace ns ON ns.oid = ct.relnamespace
            JOIN pg_catalog.pg_class ft ON ft.oid = c.confrelid
            JOIN pg_catalog.pg_namespace fs ON fs.oid = ft.relnamespace
            JOIN LATERAL unnest(c.conkey, c.confkey)
                WITH ORDINALITY AS k(attnum, fattnum, ord) ON true
            JOIN pg_catalog.pg_attribute ca
                ON ca.attrelid = ct.oid AND ca.attnum = k.attnum
            JOIN pg_catalog.pg_attribute fa
                ON fa.attrelid = ft.oid AND fa.attnum = k.fattnum
            WHERE c.contype = 'f'
              AND ns.nspname = $1
              AND fs.nspname = $1
            ORDER BY ct.relname, c.conname, k.ord
        "#;

        let rows = client.query(query, &[&self.schema]).await?;

        let mut fks: Vec<ForeignKey> = Vec::new();
        for row in rows {
            let name: String = row.get(0);
            let child_table: String = row.get(1);
            let child_column: String = row.get(2);
            let parent_table: String = row.get(3);
            let parent_column: String = row.get(4);

            // Constraint names are only unique per table.
            match fks.last_mut() {
                Some(fk) if fk.name == name && fk.child_table == child_table => {
                    fk.child_columns.push(child_column);
                    fk.parent_columns.push(parent_column);
                }
                _ => fks.push(ForeignKey {
                    name,
                    child_table,
                    child_columns: vec![child_column],
                    parent_table,
                    parent_columns: vec![parent_column],
                }),
            }
        }

        debug!("Loaded {} foreign keys in schema '{}'", fks.len(), self.schema);
        Ok(fks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_column(name: &str, identity: bool) -> Column {
        Column {
            name: name.to_string(),
            data_type: "int4".to_string(),
            is_nullable: false,
            is_identity: identity,
            is_primary_key: false,
            ordinal_pos: 1,
        }
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let table = Table {
            schema: "public".to_string(),
            name: "Orders".to_string(),
            columns: vec![make_column("OrderId", false)],
        };
        assert!(table.column("orderid").is_some());
        assert!(table.column("missing").is_none());
    }

    #[test]
    fn test_identity_column() {
        let table = Table {
            schema: "public".to_string(),
            name: "Orders".to_string(),
            columns: vec![make_column("OrderId", true), make_column("Total", false)],
        };
        assert_eq!(table.identity_column().unwrap().name, "OrderId");
    }

    #[test]
    fn test_full_name() {
        let table = Table {
            schema: "public".to_string(),
            name: "Orders".to_string(),
            columns: vec![],
        };
        assert_eq!(table.full_name(), "public.Orders");
    }
}
