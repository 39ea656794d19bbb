use std::collections::BTreeMap;
use std::path::Path;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use shared::protocol::VENDOR_NOT_FOUND;
use shared::{FieldChange, InventoryEntry, MacAddr};
use crate::error::StoreError;
use crate::inventory::query::{self, SortKey};

type Result<T> = std::result::Result<T, StoreError>;

const COLUMNS: &str = "mac, hostname, notes, first_seen, expiry, ip, vendor";

pub struct InventoryDb {
    conn: Connection,
    table: String,
}

impl InventoryDb {
    /// Open the SQLite file (WAL mode). The client table is migrated if it
    /// exists in an older layout, but not created; see `recreate`.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::with_connection(conn, table)
    }

    /// Open an existing inventory without writing to it: nothing is
    /// created, and a table in an older layout is reported instead of
    /// migrated.
    pub fn open_read_only(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let db = Self {
            conn,
            table: table.to_string(),
        };
        if db.table_exists()? && db.legacy_columns()?.is_some() {
            return Err(StoreError::NeedsMigration(db.table));
        }
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory(table: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let db = Self {
            conn,
            table: table.to_string(),
        };
        if db.table_exists()? && db.migrate()? {
            tracing::warn!("Migrated inventory table {} to the current layout", db.table);
        }
        Ok(db)
    }

    pub fn table_exists(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![&self.table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Create the client table if it does not exist
    #[cfg(test)]
    pub fn ensure_table(&self) -> Result<()> {
        self.conn.execute_batch(&create_table_sql(&self.table))?;
        Ok(())
    }

    /// Drop all clients and start with an empty table
    pub fn recreate(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", self.table))?;
        tx.execute_batch(&create_table_sql(&self.table))?;
        tx.commit()?;
        Ok(())
    }

    /// Column names (lowercased) of the client table when it predates the
    /// current layout: no primary key on `mac`, or no `vendor` column.
    fn legacy_columns(&self) -> Result<Option<Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", self.table))?;
        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let pk: i64 = row.get(5)?;
                Ok((name.to_ascii_lowercase(), pk > 0))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mac_is_key = columns.iter().any(|(n, pk)| n == "mac" && *pk);
        let has_vendor = columns.iter().any(|(n, _)| n == "vendor");
        if mac_is_key && has_vendor {
            return Ok(None);
        }
        Ok(Some(columns.into_iter().map(|(n, _)| n).collect()))
    }

    /// Rebuild a table created by older releases: no primary key, `MACOUI`
    /// instead of `vendor`, float timestamps. Returns true if it rebuilt.
    fn migrate(&self) -> Result<bool> {
        let Some(columns) = self.legacy_columns()? else {
            return Ok(false);
        };
        let has_column = |name: &str| columns.iter().any(|n| n == name);

        let vendor_expr = if has_column("vendor") {
            "vendor"
        } else if has_column("macoui") {
            "MACOUI"
        } else {
            "NULL"
        };
        let legacy = format!("{}_legacy", self.table);

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&format!("ALTER TABLE {} RENAME TO {};", self.table, legacy))?;
        tx.execute_batch(&create_table_sql(&self.table))?;
        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {table} ({COLUMNS})
                 SELECT lower(mac),
                        coalesce(hostname, ''),
                        coalesce(notes, ''),
                        CAST(coalesce(first_seen, 0) AS INTEGER),
                        CAST(coalesce(expiry, 0) AS INTEGER),
                        coalesce(ip, ''),
                        coalesce({vendor_expr}, ?1)
                 FROM {legacy}
                 ORDER BY rowid",
                table = self.table,
            ),
            params![VENDOR_NOT_FOUND],
        )?;
        tx.execute_batch(&format!("DROP TABLE {};", legacy))?;
        tx.commit()?;
        Ok(true)
    }

    /// All stored clients, keyed by MAC
    pub fn get_all(&self) -> Result<BTreeMap<MacAddr, InventoryEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM {}", COLUMNS, self.table))?;

        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries.into_iter().map(|e| (e.mac, e)).collect())
    }

    pub fn get(&self, mac: &MacAddr) -> Result<Option<InventoryEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {} FROM {} WHERE mac = ?1", COLUMNS, self.table),
                params![mac.to_string()],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert a new client. A key that already exists is `DuplicateKey`.
    pub fn insert(&self, entry: &InventoryEntry) -> Result<()> {
        let result = self.conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                self.table, COLUMNS
            ),
            params![
                entry.mac.to_string(),
                &entry.hostname,
                &entry.notes,
                entry.first_seen,
                entry.lease_expiry,
                &entry.ip,
                &entry.vendor,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateKey(entry.mac))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write exactly one changed column
    pub fn update_field(&self, mac: &MacAddr, change: &FieldChange) -> Result<()> {
        let sql = |column: &str| format!("UPDATE {} SET {} = ?1 WHERE mac = ?2", self.table, column);
        let mac_str = mac.to_string();

        let updated = match change {
            FieldChange::Hostname { new, .. } => {
                self.conn.execute(&sql("hostname"), params![new, mac_str])?
            }
            FieldChange::Ip { new, .. } => self.conn.execute(&sql("ip"), params![new, mac_str])?,
            FieldChange::Expiry { new, .. } => {
                self.conn.execute(&sql("expiry"), params![new, mac_str])?
            }
        };

        if updated == 0 {
            return Err(StoreError::NotFound(*mac));
        }
        Ok(())
    }

    pub fn set_note(&self, mac: &MacAddr, notes: &str) -> Result<()> {
        let updated = self.conn.execute(
            &format!("UPDATE {} SET notes = ?1 WHERE mac = ?2", self.table),
            params![notes, mac.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(*mac));
        }
        Ok(())
    }

    pub fn set_vendor(&self, mac: &MacAddr, vendor: &str) -> Result<()> {
        let updated = self.conn.execute(
            &format!("UPDATE {} SET vendor = ?1 WHERE mac = ?2", self.table),
            params![vendor, mac.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(*mac));
        }
        Ok(())
    }

    /// Remove a client, returning what was stored
    pub fn delete(&self, mac: &MacAddr) -> Result<InventoryEntry> {
        let entry = self.get(mac)?.ok_or(StoreError::NotFound(*mac))?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE mac = ?1", self.table),
            params![mac.to_string()],
        )?;
        Ok(entry)
    }

    /// Entries matching `search` (empty matches all), ordered by `sort`
    pub fn find(&self, search: &str, sort: SortKey) -> Result<Vec<InventoryEntry>> {
        let mut entries: Vec<InventoryEntry> = self
            .get_all()?
            .into_values()
            .filter(|e| query::matches_search(e, search))
            .collect();
        query::sort_entries(&mut entries, sort);
        Ok(entries)
    }

    pub fn entries_with_vendor(&self, vendor: &str) -> Result<Vec<InventoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE vendor = ?1 ORDER BY mac",
            COLUMNS, self.table
        ))?;
        let entries = stmt
            .query_map(params![vendor], Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn row_to_entry(row: &rusqlite::Row) -> std::result::Result<InventoryEntry, rusqlite::Error> {
        let mac_str: String = row.get(0)?;
        let mac = mac_str.parse::<MacAddr>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(InventoryEntry {
            mac,
            hostname: row.get(1)?,
            notes: row.get(2)?,
            first_seen: row.get(3)?,
            lease_expiry: row.get(4)?,
            ip: row.get(5)?,
            vendor: row.get(6)?,
        })
    }
}

/// The table name is formatted into SQL, so only plain identifiers pass
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidTableName(table.to_string()));
    }
    Ok(())
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            mac        TEXT PRIMARY KEY NOT NULL,
            hostname   TEXT NOT NULL DEFAULT '',
            notes      TEXT NOT NULL DEFAULT '',
            first_seen INTEGER NOT NULL,
            expiry     INTEGER NOT NULL DEFAULT 0,
            ip         TEXT NOT NULL DEFAULT '',
            vendor     TEXT NOT NULL DEFAULT '{VENDOR_NOT_FOUND}'
        );
        "#
    )
}
