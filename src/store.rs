//! SQLite-backed participant roster, credential map, and append-only
//! attendance log.
//!
//! One [`AttendanceStore`] is shared by the verification engine and the
//! administrative commands.  All access goes through a single serialized
//! connection; `record_attendance` additionally wraps its check-then-insert
//! transaction in a bounded busy retry so concurrent presentations of the
//! same credential resolve to exactly one recorded row.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::{BlockingRetryable as _, ConstantBuilder};
use rusqlite::{params, Connection, OptionalExtension as _, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{GatepassError, Result, ResultExt as _};
use crate::token::Credential;
use crate::util;

pub const STORE_SCHEMA_VERSION: i64 = 1;

/// Per-attempt wait inside SQLite before it reports busy.  The bounded
/// retry policy above it owns the overall waiting budget.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub name: String,
    pub contact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub participant_id: String,
    pub ts_utc: String,
    pub source: String,
    pub note: String,
}

/// Attendance row joined with roster fields for export; `name`/`contact`
/// are `None` when the log row has no matching participant.
#[derive(Debug, Clone)]
pub struct JoinedAttendanceRow {
    pub record: AttendanceRecord,
    pub name: Option<String>,
    pub contact: Option<String>,
}

/// Result of an attendance write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This call inserted the first attendance row for the participant.
    Recorded { ts_utc: String },
    /// A row already existed (earlier scan or a lost race); nothing written.
    AlreadyMarked,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AttendanceStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    retry_attempts: usize,
    retry_delay: Duration,
}

impl std::fmt::Debug for AttendanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttendanceStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AttendanceStore {
    /// Open (creating if necessary) the attendance database.
    pub fn open(db_path: &Path, cfg: &StoreConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatepassError::Store(format!(
                        "create db parent dir {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .map_err(|e| GatepassError::Store(format!("open db {}: {e}", db_path.display())))?;
        conn.busy_timeout(BUSY_TIMEOUT).ctx_store("set busy timeout")?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS meta(
              k TEXT PRIMARY KEY,
              v TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS participants(
              participant_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              contact TEXT NOT NULL,
              token TEXT,
              issued_at_utc TEXT
            );

            CREATE TABLE IF NOT EXISTS attendance(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              participant_id TEXT NOT NULL,
              ts_utc TEXT NOT NULL,
              source TEXT NOT NULL,
              note TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_attendance_participant
              ON attendance(participant_id);
            CREATE INDEX IF NOT EXISTS idx_participants_token
              ON participants(token);
            "#,
        )
        .ctx_store("create tables")?;

        conn.execute(
            "INSERT OR IGNORE INTO meta(k,v) VALUES ('schema_version', ?1)",
            params![STORE_SCHEMA_VERSION.to_string()],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO meta(k,v) VALUES ('created_at_utc', ?1)",
            params![util::now_utc_rfc3339()],
        )?;

        let schema_version: i64 = conn
            .query_row("SELECT v FROM meta WHERE k='schema_version'", [], |row| {
                row.get::<_, String>(0)
            })
            .ctx_store("read schema_version")?
            .parse()
            .ctx_store("parse schema_version")?;
        if schema_version != STORE_SCHEMA_VERSION {
            return Err(GatepassError::Store(format!(
                "unsupported schema_version {schema_version} (expected {STORE_SCHEMA_VERSION})"
            )));
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
            retry_attempts: cfg.retry_attempts,
            retry_delay: cfg.retry_delay(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retry_policy(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(self.retry_attempts)
    }

    // -----------------------------------------------------------------------
    // Roster and credentials
    // -----------------------------------------------------------------------

    /// Insert or update a roster entry.  Re-importing a participant updates
    /// name/contact and leaves any issued credential in place.
    pub fn upsert_participant(&self, p: &Participant) -> Result<()> {
        self.lock()
            .execute(
                r#"
                INSERT INTO participants(participant_id, name, contact)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(participant_id)
                DO UPDATE SET name=excluded.name, contact=excluded.contact
                "#,
                params![p.participant_id, p.name, p.contact],
            )
            .ctx_store("upsert participant")?;
        debug!(participant = %p.participant_id, "roster row upserted");
        Ok(())
    }

    /// Replace the participant's credential.  At most one credential per
    /// participant exists; re-issuing overwrites, it never appends.
    pub fn upsert_credential(&self, cred: &Credential) -> Result<()> {
        let changed = self
            .lock()
            .execute(
                "UPDATE participants SET token=?2, issued_at_utc=?3 WHERE participant_id=?1",
                params![cred.participant_id, cred.token, cred.issued_at_utc],
            )
            .ctx_store("store credential")?;
        if changed == 0 {
            return Err(GatepassError::Store(format!(
                "unknown participant '{}'",
                cred.participant_id
            )));
        }
        debug!(participant = %cred.participant_id, "credential stored");
        Ok(())
    }

    pub fn find_participant(&self, participant_id: &str) -> Result<Option<Participant>> {
        self.lock()
            .query_row(
                "SELECT participant_id, name, contact FROM participants WHERE participant_id=?1",
                params![participant_id],
                |row| {
                    Ok(Participant {
                        participant_id: row.get(0)?,
                        name: row.get(1)?,
                        contact: row.get(2)?,
                    })
                },
            )
            .optional()
            .ctx_store("find participant by id")
    }

    /// Fallback lookup by exact stored token text.
    pub fn find_participant_by_token(&self, token: &str) -> Result<Option<Participant>> {
        self.lock()
            .query_row(
                "SELECT participant_id, name, contact FROM participants WHERE token=?1",
                params![token],
                |row| {
                    Ok(Participant {
                        participant_id: row.get(0)?,
                        name: row.get(1)?,
                        contact: row.get(2)?,
                    })
                },
            )
            .optional()
            .ctx_store("find participant by token")
    }

    pub fn credential(&self, participant_id: &str) -> Result<Option<Credential>> {
        self.lock()
            .query_row(
                r#"
                SELECT participant_id, token, issued_at_utc
                FROM participants
                WHERE participant_id=?1 AND token IS NOT NULL
                "#,
                params![participant_id],
                |row| {
                    Ok(Credential {
                        participant_id: row.get(0)?,
                        token: row.get(1)?,
                        issued_at_utc: row.get(2)?,
                    })
                },
            )
            .optional()
            .ctx_store("read credential")
    }

    // -----------------------------------------------------------------------
    // Attendance
    // -----------------------------------------------------------------------

    pub fn has_attendance(&self, participant_id: &str) -> Result<bool> {
        self.lock()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM attendance WHERE participant_id=?1)",
                params![participant_id],
                |row| row.get(0),
            )
            .ctx_store("check attendance")
    }

    /// Record attendance, first-write-wins.
    ///
    /// The check and the insert run inside one immediate transaction, so two
    /// near-simultaneous callers for the same participant resolve to one
    /// `Recorded` and one `AlreadyMarked`.  Busy/locked errors are retried on
    /// a constant delay; exhausting the budget yields
    /// [`GatepassError::StoreUnavailable`] instead of blocking further.
    pub fn record_attendance(
        &self,
        participant_id: &str,
        source: &str,
        note: &str,
    ) -> Result<RecordOutcome> {
        let attempt = || -> std::result::Result<RecordOutcome, rusqlite::Error> {
            let mut conn = self.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let already: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM attendance WHERE participant_id=?1)",
                params![participant_id],
                |row| row.get(0),
            )?;
            if already {
                return Ok(RecordOutcome::AlreadyMarked);
            }
            let ts_utc = util::now_utc_rfc3339();
            tx.execute(
                "INSERT INTO attendance(participant_id, ts_utc, source, note) VALUES (?1,?2,?3,?4)",
                params![participant_id, ts_utc, source, note],
            )?;
            tx.commit()?;
            Ok(RecordOutcome::Recorded { ts_utc })
        };

        attempt
            .retry(self.retry_policy())
            .when(is_busy)
            .notify(|err: &rusqlite::Error, delay: Duration| {
                warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "attendance store busy, retrying"
                );
            })
            .call()
            .map_err(|e| {
                if is_busy(&e) {
                    GatepassError::StoreUnavailable(format!(
                        "record attendance for '{participant_id}' failed after {} retries: {e}",
                        self.retry_attempts
                    ))
                } else {
                    e.into()
                }
            })
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    pub fn list_participants(&self) -> Result<Vec<Participant>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT participant_id, name, contact FROM participants ORDER BY participant_id",
            )
            .ctx_store("prepare select participants")?;
        let mut rows = stmt.query([]).ctx_store("query participants")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().ctx_store("next participant row")? {
            out.push(Participant {
                participant_id: row.get(0)?,
                name: row.get(1)?,
                contact: row.get(2)?,
            });
        }
        Ok(out)
    }

    /// Attendance log in insertion order.
    pub fn list_attendance(&self) -> Result<Vec<AttendanceRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, participant_id, ts_utc, source, note FROM attendance ORDER BY id ASC",
            )
            .ctx_store("prepare select attendance")?;
        let mut rows = stmt.query([]).ctx_store("query attendance")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().ctx_store("next attendance row")? {
            out.push(AttendanceRecord {
                id: row.get(0)?,
                participant_id: row.get(1)?,
                ts_utc: row.get(2)?,
                source: row.get(3)?,
                note: row.get(4)?,
            });
        }
        Ok(out)
    }

    /// Attendance log joined with roster name/contact, insertion order.
    pub fn list_attendance_joined(&self) -> Result<Vec<JoinedAttendanceRow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT a.id, a.participant_id, a.ts_utc, a.source, a.note, p.name, p.contact
                FROM attendance a
                LEFT JOIN participants p ON p.participant_id = a.participant_id
                ORDER BY a.id ASC
                "#,
            )
            .ctx_store("prepare attendance join")?;
        let mut rows = stmt.query([]).ctx_store("query attendance join")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().ctx_store("next joined row")? {
            out.push(JoinedAttendanceRow {
                record: AttendanceRecord {
                    id: row.get(0)?,
                    participant_id: row.get(1)?,
                    ts_utc: row.get(2)?,
                    source: row.get(3)?,
                    note: row.get(4)?,
                },
                name: row.get(5)?,
                contact: row.get(6)?,
            });
        }
        Ok(out)
    }

    pub fn count_participants(&self) -> Result<i64> {
        self.lock()
            .query_row("SELECT COUNT(*) FROM participants", [], |row| row.get(0))
            .ctx_store("count participants")
    }

    pub fn count_attendance(&self) -> Result<i64> {
        self.lock()
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))
            .ctx_store("count attendance")
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> AttendanceStore {
        AttendanceStore::open(&dir.path().join("test.db"), &StoreConfig::default()).unwrap()
    }

    fn participant(id: &str) -> Participant {
        Participant {
            participant_id: id.to_string(),
            name: format!("Name {id}"),
            contact: format!("{id}@example.com"),
        }
    }

    #[test]
    fn open_creates_schema_and_reopens() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let store = AttendanceStore::open(&db, &StoreConfig::default()).unwrap();
        assert_eq!(store.count_participants().unwrap(), 0);
        assert_eq!(store.count_attendance().unwrap(), 0);
        drop(store);

        let store2 = AttendanceStore::open(&db, &StoreConfig::default()).unwrap();
        assert_eq!(store2.count_participants().unwrap(), 0);
    }

    #[test]
    fn unsupported_schema_version_rejected() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        drop(AttendanceStore::open(&db, &StoreConfig::default()).unwrap());

        let conn = Connection::open(&db).unwrap();
        conn.execute("UPDATE meta SET v='99' WHERE k='schema_version'", [])
            .unwrap();
        drop(conn);

        let err = AttendanceStore::open(&db, &StoreConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unsupported schema_version"));
    }

    #[test]
    fn upsert_participant_inserts_then_updates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_participant(&participant("R001")).unwrap();
        store
            .upsert_participant(&Participant {
                participant_id: "R001".to_string(),
                name: "Renamed".to_string(),
                contact: "new@example.com".to_string(),
            })
            .unwrap();

        let found = store.find_participant("R001").unwrap().unwrap();
        assert_eq!(found.name, "Renamed");
        assert_eq!(store.count_participants().unwrap(), 1);
    }

    #[test]
    fn reimport_preserves_credential() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_participant(&participant("R001")).unwrap();
        store
            .upsert_credential(&Credential {
                participant_id: "R001".to_string(),
                token: "tok-1".to_string(),
                issued_at_utc: util::now_utc_rfc3339(),
            })
            .unwrap();

        store.upsert_participant(&participant("R001")).unwrap();
        let cred = store.credential("R001").unwrap().unwrap();
        assert_eq!(cred.token, "tok-1");
    }

    #[test]
    fn upsert_credential_replaces_not_appends() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_participant(&participant("R001")).unwrap();
        for token in ["tok-1", "tok-2"] {
            store
                .upsert_credential(&Credential {
                    participant_id: "R001".to_string(),
                    token: token.to_string(),
                    issued_at_utc: util::now_utc_rfc3339(),
                })
                .unwrap();
        }

        assert_eq!(store.credential("R001").unwrap().unwrap().token, "tok-2");
        assert_eq!(store.count_participants().unwrap(), 1);
        // The superseded token no longer matches by text.
        assert!(store.find_participant_by_token("tok-1").unwrap().is_none());
        assert!(store.find_participant_by_token("tok-2").unwrap().is_some());
    }

    #[test]
    fn upsert_credential_unknown_participant_errs() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let err = store
            .upsert_credential(&Credential {
                participant_id: "GHOST".to_string(),
                token: "tok".to_string(),
                issued_at_utc: util::now_utc_rfc3339(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("unknown participant"));
    }

    #[test]
    fn credential_absent_until_issued() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_participant(&participant("R001")).unwrap();
        assert!(store.credential("R001").unwrap().is_none());
    }

    #[test]
    fn record_attendance_first_write_wins() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_participant(&participant("R001")).unwrap();

        assert!(!store.has_attendance("R001").unwrap());
        let first = store.record_attendance("R001", "test", "").unwrap();
        match first {
            RecordOutcome::Recorded { ts_utc } => assert!(ts_utc.ends_with('Z')),
            RecordOutcome::AlreadyMarked => panic!("first write must record"),
        }
        assert!(store.has_attendance("R001").unwrap());

        let second = store.record_attendance("R001", "test", "").unwrap();
        assert_eq!(second, RecordOutcome::AlreadyMarked);
        assert_eq!(store.count_attendance().unwrap(), 1);
    }

    #[test]
    fn attendance_listed_in_insertion_order() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        for id in ["R003", "R001", "R002"] {
            store.upsert_participant(&participant(id)).unwrap();
            store.record_attendance(id, "test", "").unwrap();
        }
        let log = store.list_attendance().unwrap();
        let order: Vec<&str> = log.iter().map(|r| r.participant_id.as_str()).collect();
        assert_eq!(order, ["R003", "R001", "R002"]);
        assert!(log.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn joined_rows_carry_roster_fields() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_participant(&participant("R001")).unwrap();
        store.record_attendance("R001", "test", "note-1").unwrap();
        // Log rows without a roster match export with empty name/contact.
        store.record_attendance("GHOST", "test", "").unwrap();

        let joined = store.list_attendance_joined().unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].name.as_deref(), Some("Name R001"));
        assert_eq!(joined[0].record.note, "note-1");
        assert!(joined[1].name.is_none());
    }

    #[test]
    fn concurrent_records_single_winner() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_participant(&participant("R001")).unwrap();

        let n = 8;
        let barrier = Arc::new(std::sync::Barrier::new(n));
        let mut handles = Vec::new();
        for _ in 0..n {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                store.record_attendance("R001", "race", "").unwrap()
            }));
        }
        let outcomes: Vec<RecordOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let recorded = outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Recorded { .. }))
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(store.count_attendance().unwrap(), 1);
    }
}
