//! SQLite permission store implementation.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use crate::{ActivityEntry, Error, GrantRecord, HistoryEntry, Result};

/// History grouped by subject, then by target.
pub type HistoryBySubject = BTreeMap<String, BTreeMap<String, HistoryEntry>>;

/// SQLite-backed store for grants, permission history and the activity log.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS grants (
                id TEXT NOT NULL UNIQUE,
                subject TEXT NOT NULL,
                target TEXT NOT NULL,
                caveats TEXT NOT NULL,
                granted_at TEXT NOT NULL,
                PRIMARY KEY (subject, target)
            );
            CREATE TABLE IF NOT EXISTS history (
                subject TEXT NOT NULL,
                target TEXT NOT NULL,
                last_approved TEXT NOT NULL,
                accounts TEXT NOT NULL,
                PRIMARY KEY (subject, target)
            );
            CREATE TABLE IF NOT EXISTS activity (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                subject TEXT NOT NULL,
                method TEXT NOT NULL,
                request_time TEXT NOT NULL,
                response_time TEXT,
                success INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert a grant, replacing any grant for the same (subject, target).
    pub fn put_grant(&self, grant: &GrantRecord) -> Result<()> {
        upsert_grant(&self.conn, grant)
    }

    /// Insert a grant and fold the approval into its history, atomically.
    ///
    /// Either both writes land or neither does.
    pub fn grant_and_record(
        &mut self,
        grant: &GrantRecord,
        accounts: &[String],
    ) -> Result<HistoryEntry> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        upsert_grant(&tx, grant)?;
        let entry = merge_history(&tx, &grant.subject, &grant.target, accounts, grant.granted_at)?;
        tx.commit()?;

        debug!(subject = %grant.subject, target = %grant.target, "stored grant with history");
        Ok(entry)
    }

    pub fn get_grant(&self, subject: &str, target: &str) -> Result<Option<GrantRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, subject, target, caveats, granted_at FROM grants
                 WHERE subject = ?1 AND target = ?2",
                params![subject, target],
                grant_row,
            )
            .optional()?;
        row.map(decode_grant).transpose()
    }

    /// Grants held by one subject, ordered by target.
    pub fn grants_for(&self, subject: &str) -> Result<Vec<GrantRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject, target, caveats, granted_at FROM grants
             WHERE subject = ?1 ORDER BY target",
        )?;
        let rows = stmt
            .query_map([subject], grant_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_grant).collect()
    }

    /// Every grant, ordered by subject then target.
    pub fn all_grants(&self) -> Result<Vec<GrantRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject, target, caveats, granted_at FROM grants
             ORDER BY subject, target",
        )?;
        let rows = stmt
            .query_map([], grant_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_grant).collect()
    }

    /// Delete one grant. Returns whether a grant existed.
    pub fn delete_grant(&self, subject: &str, target: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM grants WHERE subject = ?1 AND target = ?2",
            params![subject, target],
        )?;
        Ok(deleted > 0)
    }

    /// Delete every grant of one subject, returning the targets removed.
    pub fn delete_grants_for(&mut self, subject: &str) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;
        let targets = {
            let mut stmt =
                tx.prepare("SELECT target FROM grants WHERE subject = ?1 ORDER BY target")?;
            stmt.query_map([subject], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        tx.execute("DELETE FROM grants WHERE subject = ?1", [subject])?;
        tx.commit()?;
        Ok(targets)
    }

    /// Delete every grant of every subject.
    pub fn clear_grants(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM grants", [])?)
    }

    /// Fold an approval or use of `target` by `subject` into its history.
    ///
    /// The read-merge-write runs in one immediate transaction, so concurrent
    /// writers to the same key never lose each other's accounts.
    pub fn record_history(
        &mut self,
        subject: &str,
        target: &str,
        accounts: &[String],
        at: DateTime<Utc>,
    ) -> Result<HistoryEntry> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = merge_history(&tx, subject, target, accounts, at)?;
        tx.commit()?;

        debug!(subject, target, accounts = entry.accounts.len(), "recorded history");
        Ok(entry)
    }

    /// History of one subject, keyed by target.
    pub fn query_history(&self, subject: &str) -> Result<BTreeMap<String, HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject, target, last_approved, accounts FROM history
             WHERE subject = ?1",
        )?;
        let rows = stmt
            .query_map([subject], history_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|row| decode_history(row).map(|entry| (entry.target.clone(), entry)))
            .collect()
    }

    /// History of every subject.
    pub fn all_history(&self) -> Result<HistoryBySubject> {
        let mut stmt = self
            .conn
            .prepare("SELECT subject, target, last_approved, accounts FROM history")?;
        let rows = stmt
            .query_map([], history_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut all = HistoryBySubject::new();
        for row in rows {
            let entry = decode_history(row)?;
            all.entry(entry.subject.clone())
                .or_default()
                .insert(entry.target.clone(), entry);
        }
        Ok(all)
    }

    /// Append to the activity log, keeping only the newest `limit` entries.
    pub fn append_activity(&self, entry: &ActivityEntry, limit: usize) -> Result<()> {
        self.conn.execute(
            "INSERT INTO activity (id, subject, method, request_time, response_time, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id.to_string(),
                entry.subject,
                entry.method,
                entry.request_time.to_rfc3339(),
                entry.response_time.map(|t| t.to_rfc3339()),
                entry.success,
            ],
        )?;
        let trimmed = self.conn.execute(
            "DELETE FROM activity WHERE seq NOT IN
                (SELECT seq FROM activity ORDER BY seq DESC LIMIT ?1)",
            [sql_limit(limit)],
        )?;
        if trimmed > 0 {
            debug!(trimmed, "trimmed activity log");
        }
        Ok(())
    }

    /// The newest `limit` activity entries, oldest first.
    pub fn activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject, method, request_time, response_time, success FROM
                (SELECT * FROM activity ORDER BY seq DESC LIMIT ?1)
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([sql_limit(limit)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, subject, method, request_time, response_time, success)| {
                Ok(ActivityEntry {
                    id: parse_uuid(&id)?,
                    subject,
                    method,
                    request_time: parse_time(&request_time)?,
                    response_time: response_time.as_deref().map(parse_time).transpose()?,
                    success,
                })
            })
            .collect()
    }
}

fn upsert_grant(conn: &Connection, grant: &GrantRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO grants (id, subject, target, caveats, granted_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(subject, target) DO UPDATE SET
            id = excluded.id,
            caveats = excluded.caveats,
            granted_at = excluded.granted_at",
        params![
            grant.id.to_string(),
            grant.subject,
            grant.target,
            serde_json::to_string(&grant.caveats)?,
            grant.granted_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Read-merge-write of one history row. Callers run it inside a transaction.
fn merge_history(
    conn: &Connection,
    subject: &str,
    target: &str,
    accounts: &[String],
    at: DateTime<Utc>,
) -> Result<HistoryEntry> {
    let existing = conn
        .query_row(
            "SELECT subject, target, last_approved, accounts FROM history
             WHERE subject = ?1 AND target = ?2",
            params![subject, target],
            history_row,
        )
        .optional()?
        .map(decode_history)
        .transpose()?;

    let entry = match existing {
        Some(mut entry) => {
            entry.observe(at, accounts);
            entry
        }
        None => HistoryEntry::new(subject, target, at, accounts),
    };

    conn.execute(
        "INSERT INTO history (subject, target, last_approved, accounts)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(subject, target) DO UPDATE SET
            last_approved = excluded.last_approved,
            accounts = excluded.accounts",
        params![
            entry.subject,
            entry.target,
            entry.last_approved.to_rfc3339(),
            serde_json::to_string(&entry.accounts)?,
        ],
    )?;
    Ok(entry)
}

type GrantRow = (String, String, String, String, String);
type HistoryRow = (String, String, String, String);

fn grant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GrantRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_grant((id, subject, target, caveats, granted_at): GrantRow) -> Result<GrantRecord> {
    Ok(GrantRecord {
        id: parse_uuid(&id)?,
        subject,
        target,
        caveats: serde_json::from_str(&caveats)?,
        granted_at: parse_time(&granted_at)?,
    })
}

fn decode_history((subject, target, last_approved, accounts): HistoryRow) -> Result<HistoryEntry> {
    Ok(HistoryEntry {
        subject,
        target,
        last_approved: parse_time(&last_approved)?,
        accounts: serde_json::from_str(&accounts)?,
    })
}

/// SQLite reads a negative LIMIT as unbounded; saturate instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    s.parse()
        .map_err(|_| Error::Corrupt(format!("invalid timestamp '{s}'")))
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid> {
    s.parse()
        .map_err(|_| Error::Corrupt(format!("invalid id '{s}'")))
}
