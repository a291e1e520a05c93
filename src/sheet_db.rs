use crate::reconcile::RawLineItem;
use rusqlite::{Connection, Result as SqliteResult, params};
use sha2::{Digest, Sha256};
use std::path::Path;

pub struct SheetStore {
    conn: Connection,
}

/// One uploaded sheet photo. Recognition state lives here; the line items
/// live in their own table.
#[derive(Debug)]
pub struct StoredSheet {
    pub uid: String,
    pub filename: String,
    pub mime: String,
    pub image_data: Vec<u8>,
    /// "pending", "ok", "empty", or "error"
    pub recognition_status: String,
    pub recognition_error: Option<String>,
}

/// A recognized line as stored, with its row id for later edits.
#[derive(Debug)]
pub struct StoredItem {
    pub id: i64,
    pub raw: RawLineItem,
}

impl SheetStore {
    /// Create a new sheet store with SQLite backend.
    ///
    /// Only RAW recognized fields are persisted. Derived numbers and the
    /// diagnostic status are recomputed through the reconciliation engine
    /// on every read, so an edit can never leave stale derived state.
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sheets (
                uid TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                mime TEXT NOT NULL,
                image_data BLOB NOT NULL,
                recognition_status TEXT NOT NULL DEFAULT 'pending',
                recognition_error TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS line_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sheet_uid TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                quantity TEXT,
                unit_price TEXT,
                line_total TEXT,
                category TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (sheet_uid) REFERENCES sheets(uid) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sheets_status ON sheets(recognition_status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_line_items_sheet_uid ON line_items(sheet_uid)",
            [],
        )?;

        Ok(SheetStore { conn })
    }

    /// Stable identity for an upload: hash of filename + image bytes.
    /// Re-ingesting the same photo maps to the same uid.
    pub fn generate_uid(filename: &str, image_data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(filename.as_bytes());
        hasher.update(image_data);
        format!("{:x}", hasher.finalize())
    }

    /// Insert a sheet if its uid is new. Returns true when inserted;
    /// an already-known sheet keeps its recognition state untouched.
    pub fn insert_sheet(&self, sheet: &StoredSheet) -> SqliteResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO sheets (uid, filename, mime, image_data, recognition_status, recognition_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sheet.uid,
                sheet.filename,
                sheet.mime,
                sheet.image_data,
                sheet.recognition_status,
                sheet.recognition_error,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_sheet(&self, uid: &str) -> SqliteResult<Option<StoredSheet>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, filename, mime, image_data, recognition_status, recognition_error
             FROM sheets WHERE uid = ?1",
        )?;
        let mut rows = stmt.query_map(params![uid], row_to_sheet)?;
        rows.next().transpose()
    }

    /// Sheets still waiting for a recognition pass.
    pub fn get_pending_sheets(&self) -> SqliteResult<Vec<StoredSheet>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, filename, mime, image_data, recognition_status, recognition_error
             FROM sheets WHERE recognition_status = 'pending' ORDER BY created_at, uid",
        )?;
        let rows = stmt.query_map([], row_to_sheet)?;
        rows.collect()
    }

    /// Every sheet, in ingest order.
    pub fn list_sheets(&self) -> SqliteResult<Vec<StoredSheet>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, filename, mime, image_data, recognition_status, recognition_error
             FROM sheets ORDER BY created_at, uid",
        )?;
        let rows = stmt.query_map([], row_to_sheet)?;
        rows.collect()
    }

    pub fn set_recognition(
        &self,
        uid: &str,
        status: &str,
        error: Option<&str>,
    ) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE sheets SET recognition_status = ?2, recognition_error = ?3 WHERE uid = ?1",
            params![uid, status, error],
        )?;
        Ok(())
    }

    /// Replace all line items of a sheet with a fresh recognition result.
    pub fn replace_items(&self, uid: &str, items: &[RawLineItem]) -> SqliteResult<()> {
        self.conn
            .execute("DELETE FROM line_items WHERE sheet_uid = ?1", params![uid])?;

        let mut stmt = self.conn.prepare(
            "INSERT INTO line_items (sheet_uid, position, name, quantity, unit_price, line_total, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for (pos, item) in items.iter().enumerate() {
            stmt.execute(params![
                uid,
                pos as i64,
                item.name,
                item.quantity_raw,
                item.unit_price_raw,
                item.line_total_raw,
                item.category,
            ])?;
        }
        Ok(())
    }

    /// Line items of one sheet in recognized order.
    pub fn get_items(&self, uid: &str) -> SqliteResult<Vec<StoredItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, quantity, unit_price, line_total, category
             FROM line_items WHERE sheet_uid = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![uid], |row| {
            Ok(StoredItem {
                id: row.get(0)?,
                raw: RawLineItem {
                    name: row.get(1)?,
                    quantity_raw: row.get(2)?,
                    unit_price_raw: row.get(3)?,
                    line_total_raw: row.get(4)?,
                    category: row.get(5)?,
                },
            })
        })?;
        rows.collect()
    }

    /// Human correction of one raw field. Derived values are not stored, so
    /// the next reconcile pass picks the edit up automatically.
    pub fn update_item_field(&self, item_id: i64, field: &str, value: &str) -> SqliteResult<usize> {
        let column = match field {
            "name" => "name",
            "quantity" => "quantity",
            "unit_price" => "unit_price",
            "line_total" => "line_total",
            "category" => "category",
            other => {
                return Err(rusqlite::Error::InvalidParameterName(format!(
                    "not an editable column: {other}"
                )));
            }
        };
        let sql = format!("UPDATE line_items SET {column} = ?2 WHERE id = ?1");
        self.conn.execute(&sql, params![item_id, value])
    }

    /// (total sheets, recognized sheets, total line items)
    pub fn get_counts(&self) -> SqliteResult<(i64, i64, i64)> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sheets", [], |r| r.get(0))?;
        let recognized: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sheets WHERE recognition_status != 'pending'",
            [],
            |r| r.get(0),
        )?;
        let items: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM line_items", [], |r| r.get(0))?;
        Ok((total, recognized, items))
    }
}

fn row_to_sheet(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSheet> {
    Ok(StoredSheet {
        uid: row.get(0)?,
        filename: row.get(1)?,
        mime: row.get(2)?,
        image_data: row.get(3)?,
        recognition_status: row.get(4)?,
        recognition_error: row.get(5)?,
    })
}
