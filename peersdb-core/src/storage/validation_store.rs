use crate::error::{PeersError, Result};
use crate::types::{ContentRef, ValidationRecord};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

/// Private, never replicated store of validation records, one per content ref.
pub struct ValidationStore {
    db_path: PathBuf,
}

impl ValidationStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS validations (
                content_ref TEXT PRIMARY KEY,
                is_valid INTEGER NOT NULL,
                vote_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get(&self, content_ref: &ContentRef) -> Result<Option<ValidationRecord>> {
        let conn = self.get_conn()?;

        let row: Option<(String, bool, i64)> = conn
            .query_row(
                "SELECT content_ref, is_valid, vote_count FROM validations WHERE content_ref = ?1",
                [content_ref.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(stored_ref, is_valid, vote_count)| {
            record_from_row(&stored_ref, is_valid, vote_count)
        })
        .transpose()
    }

    /// Insert or replace the record for its content ref.
    ///
    /// A quorum-derived record is never replaced by one carrying fewer votes.
    /// Returns whether the write was applied.
    pub fn upsert(&self, record: &ValidationRecord) -> Result<bool> {
        let conn = self.get_conn()?;

        let affected = conn.execute(
            "INSERT INTO validations (content_ref, is_valid, vote_count, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(content_ref) DO UPDATE SET
                is_valid = excluded.is_valid,
                vote_count = excluded.vote_count,
                updated_at = excluded.updated_at
             WHERE validations.vote_count = 0
                OR excluded.vote_count >= validations.vote_count",
            params![
                record.content_ref.to_string(),
                record.is_valid,
                record.vote_count as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(affected > 0)
    }

    pub fn list(&self) -> Result<Vec<ValidationRecord>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT content_ref, is_valid, vote_count FROM validations ORDER BY content_ref",
        )?;

        let rows = stmt.query_map([], |row| {
            let content_ref: String = row.get(0)?;
            let is_valid: bool = row.get(1)?;
            let vote_count: i64 = row.get(2)?;
            Ok((content_ref, is_valid, vote_count))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (content_ref, is_valid, vote_count) = row?;
            records.push(record_from_row(&content_ref, is_valid, vote_count)?);
        }

        Ok(records)
    }
}

fn record_from_row(stored_ref: &str, is_valid: bool, vote_count: i64) -> Result<ValidationRecord> {
    Ok(ValidationRecord {
        content_ref: ContentRef::parse(stored_ref)?,
        is_valid,
        vote_count: u32::try_from(vote_count).map_err(|_| {
            PeersError::Internal(format!("corrupt vote count {} for {}", vote_count, stored_ref))
        })?,
    })
}
