use std::path::Path;

use anyhow::{anyhow, Context, Result};
use drift_repair_core::{CatalogError, Key, KeyKind, MismatchCatalog};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

/// Conflict table written by the first comparison round.
pub const DEFAULT_TABLE: &str = "key";

/// Mismatch catalog stored in a full-check result database.
///
/// The database holds one conflict table per comparison round (`key`,
/// `key_1`, `key_2`, ...), each with at least a `key` and a `type` column.
/// The catalog is opened read-only and never written.
pub struct SqliteCatalog {
    conn: Connection,
    table: String,
    db_filter: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct CatalogSummary {
    pub table: String,
    pub db: Option<i64>,
    pub rows: usize,
    pub string_keys: usize,
    pub set_keys: usize,
    pub hash_keys: usize,
    /// Distinct keys of kinds the value pass does not repair.
    pub other_keys: usize,
}

impl SqliteCatalog {
    /// Open a result database read-only and check the conflict table shape.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened, the table name is not
    /// a plain identifier, or the table lacks the `key`/`type` columns.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open catalog database at {}", path.display()))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;
        Self::from_connection(conn, table)
    }

    /// Wrap an already open connection.
    ///
    /// # Errors
    /// Same shape checks as [`SqliteCatalog::open`].
    pub fn from_connection(conn: Connection, table: &str) -> Result<Self> {
        if !is_identifier(table) {
            return Err(anyhow!("invalid catalog table name `{table}`"));
        }
        if !table_exists(&conn, table)? {
            return Err(anyhow!("catalog table `{table}` does not exist"));
        }
        for column in ["key", "type"] {
            if !table_has_column(&conn, table, column)? {
                return Err(anyhow!("catalog table `{table}` has no `{column}` column"));
            }
        }
        tracing::debug!(table, "catalog opened");
        Ok(Self { conn, table: table.to_string(), db_filter: None })
    }

    /// Restrict every listing to rows recorded for one logical database.
    ///
    /// # Errors
    /// Returns an error when a filter is requested but the table has no `db`
    /// column.
    pub fn with_db_filter(mut self, db: Option<i64>) -> Result<Self> {
        if db.is_some() && !table_has_column(&self.conn, &self.table, "db")? {
            return Err(anyhow!("catalog table `{}` has no `db` column", self.table));
        }
        self.db_filter = db;
        Ok(self)
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Distinct keys of `kind`, in the order they were first recorded.
    ///
    /// # Errors
    /// Returns an error when the query fails or a key cell is neither text
    /// nor blob.
    pub fn keys_of_type(&self, kind: KeyKind) -> Result<Vec<Key>> {
        let sql = match self.db_filter {
            Some(_) => format!(
                "SELECT key FROM \"{}\" WHERE type = ?1 AND db = ?2 GROUP BY key ORDER BY MIN(rowid)",
                self.table
            ),
            None => format!(
                "SELECT key FROM \"{}\" WHERE type = ?1 GROUP BY key ORDER BY MIN(rowid)",
                self.table
            ),
        };
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare key listing on `{}`", self.table))?;
        let mut rows = match self.db_filter {
            Some(db) => stmt.query(params![kind.as_str(), db]),
            None => stmt.query(params![kind.as_str()]),
        }
        .with_context(|| format!("failed to list {kind} keys from `{}`", self.table))?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            let key = match row.get_ref(0)? {
                ValueRef::Text(raw) | ValueRef::Blob(raw) => Key::new(raw.to_vec()),
                other => {
                    return Err(anyhow!(
                        "catalog key cell has unsupported type {:?}",
                        other.data_type()
                    ))
                }
            };
            keys.push(key);
        }
        tracing::debug!(table = %self.table, %kind, keys = keys.len(), "catalog keys listed");
        Ok(keys)
    }

    /// Row and distinct-key counts per kind.
    ///
    /// # Errors
    /// Returns an error when the counting query fails.
    pub fn summary(&self) -> Result<CatalogSummary> {
        let filter = if self.db_filter.is_some() { " WHERE db = ?1" } else { "" };
        let sql = format!(
            "SELECT type, COUNT(*), COUNT(DISTINCT key) FROM \"{}\"{filter} GROUP BY type",
            self.table
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare summary on `{}`", self.table))?;
        let mut rows = match self.db_filter {
            Some(db) => stmt.query(params![db]),
            None => stmt.query([]),
        }
        .with_context(|| format!("failed to summarise `{}`", self.table))?;

        let mut summary = CatalogSummary {
            table: self.table.clone(),
            db: self.db_filter,
            rows: 0,
            string_keys: 0,
            set_keys: 0,
            hash_keys: 0,
            other_keys: 0,
        };
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let rows_of_kind = count(row.get::<_, i64>(1)?);
            let keys = count(row.get::<_, i64>(2)?);
            summary.rows += rows_of_kind;
            match KeyKind::parse(&kind) {
                Some(KeyKind::String) => summary.string_keys += keys,
                Some(KeyKind::Set) => summary.set_keys += keys,
                Some(KeyKind::Hash) => summary.hash_keys += keys,
                None => summary.other_keys += keys,
            }
        }
        Ok(summary)
    }
}

impl MismatchCatalog for SqliteCatalog {
    fn mismatched_keys(&self, kind: KeyKind) -> Result<Vec<Key>, CatalogError> {
        self.keys_of_type(kind).map_err(|err| CatalogError::Query(format!("{err:#}")))
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|byte| byte.is_ascii_alphanumeric() || byte == b'_')
}

fn count(raw: i64) -> usize {
    usize::try_from(raw).unwrap_or(0)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
