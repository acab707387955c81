//! SQLite-backed persistence for report recipients, schedules, and run history.
//! Implements the recipient source, ledger, schedule store, and run history
//! the dispatch engine depends on.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use milo_core::error::{MiloError, Result};
use milo_core::traits::{DispatchLedger, RecipientSource, RunHistory, ScheduleStore};
use milo_core::types::{
    DispatchBatchResult, DispatchRun, Frequency, RecipientRecord, RunTrigger, ScheduleConfig,
    ScheduleKey, is_valid_email,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Deserialize;

/// Input for a new recipient.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipient {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub scope: Option<i64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipientUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
    pub active: Option<bool>,
}

/// Report database: one SQLite file shared by the scheduler and the gateway.
pub struct ReportDb {
    conn: Mutex<Connection>,
}

const RECIPIENT_COLUMNS: &str =
    "id, email, name, report_type, project_id, is_active, last_sent_at";
const SCHEDULE_COLUMNS: &str =
    "report_type, project_id, frequency, time_of_day, weekday, month_day, is_active, last_run_at";

impl ReportDb {
    /// Open or create the report database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| MiloError::database(format!("DB open: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::with_connection(conn)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| MiloError::database(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MiloError::database(format!("Lock: {e}")))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS report_recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                report_type TEXT NOT NULL,
                project_id INTEGER,              -- NULL = not tied to a project
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_report
                ON report_recipients (report_type, project_id);

            CREATE TABLE IF NOT EXISTS report_schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_type TEXT NOT NULL,
                project_id INTEGER,
                frequency TEXT NOT NULL DEFAULT 'manual',  -- manual, daily, weekly, monthly
                time_of_day TEXT NOT NULL DEFAULT '09:00',
                weekday INTEGER,                 -- 0 = Sunday
                month_day INTEGER,
                is_active INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            DELETE FROM report_schedules WHERE id NOT IN (
                SELECT MAX(id) FROM report_schedules GROUP BY report_type, IFNULL(project_id, -1)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_schedules_key
                ON report_schedules (report_type, IFNULL(project_id, -1));

            CREATE TABLE IF NOT EXISTS dispatch_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_type TEXT NOT NULL,
                project_id INTEGER,
                triggered_by TEXT NOT NULL,      -- scheduled, manual
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                attempted INTEGER NOT NULL,
                sent INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                skipped_duplicate INTEGER NOT NULL,
                failed_emails TEXT NOT NULL DEFAULT '[]',  -- JSON array
                connection_error TEXT
            );
         ",
            )
            .map_err(|e| MiloError::database(format!("Migration: {e}")))
    }

    // ─── Recipients ───────────────────────────────────────────

    /// Recipients of a report type. `None` lists every scope.
    pub fn list_recipients(&self, report_type: &str, scope: Option<i64>) -> Result<Vec<RecipientRecord>> {
        self.query_recipients(report_type, scope, false)
    }

    fn query_recipients(
        &self,
        report_type: &str,
        scope: Option<i64>,
        active_only: bool,
    ) -> Result<Vec<RecipientRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECIPIENT_COLUMNS} FROM report_recipients
             WHERE report_type = ?1
               AND (?2 IS NULL OR project_id = ?2)
               AND (?3 = 0 OR is_active = 1)
             ORDER BY id"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MiloError::database(format!("Query recipients: {e}")))?;
        let rows = stmt
            .query_map(params![report_type, scope, active_only as i32], recipient_from_row)
            .map_err(|e| MiloError::database(format!("Query recipients: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MiloError::database(format!("Read recipient: {e}")))
    }

    pub fn get_recipient(&self, id: i64) -> Result<RecipientRecord> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RECIPIENT_COLUMNS} FROM report_recipients WHERE id = ?1"),
            params![id],
            recipient_from_row,
        )
        .optional()
        .map_err(|e| MiloError::database(format!("Get recipient: {e}")))?
        .ok_or_else(|| MiloError::NotFound(format!("recipient {id}")))
    }

    /// Add a recipient. Rejects invalid emails and case-insensitive duplicates
    /// within the same report type and scope.
    pub fn add_recipient(&self, report_type: &str, new: &NewRecipient) -> Result<RecipientRecord> {
        let email = new.email.trim();
        let name = new.name.trim();
        if email.is_empty() || name.is_empty() {
            return Err(MiloError::InvalidInput("email and name are required".into()));
        }
        if !is_valid_email(email) {
            return Err(MiloError::InvalidInput(format!("invalid email: '{email}'")));
        }
        if self.email_taken(report_type, new.scope, email, None)? {
            return Err(MiloError::InvalidInput(format!(
                "a recipient with email '{email}' already exists for this project"
            )));
        }

        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO report_recipients (email, name, report_type, project_id, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    email,
                    name,
                    report_type,
                    new.scope,
                    new.active as i32,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| MiloError::database(format!("Add recipient: {e}")))?;
            conn.last_insert_rowid()
        };
        tracing::info!("👤 Recipient added: {email} ({report_type})");
        self.get_recipient(id)
    }

    pub fn update_recipient(&self, id: i64, update: &RecipientUpdate) -> Result<RecipientRecord> {
        let mut current = self.get_recipient(id)?;

        if let Some(email) = &update.email {
            let email = email.trim();
            if !is_valid_email(email) {
                return Err(MiloError::InvalidInput(format!("invalid email: '{email}'")));
            }
            if self.email_taken(&current.report_type, current.scope, email, Some(id))? {
                return Err(MiloError::InvalidInput(format!(
                    "a recipient with email '{email}' already exists for this project"
                )));
            }
            current.email = email.to_string();
        }
        if let Some(name) = &update.name {
            current.name = name.trim().to_string();
        }
        if let Some(active) = update.active {
            current.active = active;
        }

        self.conn()?
            .execute(
                "UPDATE report_recipients SET email = ?1, name = ?2, is_active = ?3 WHERE id = ?4",
                params![current.email, current.name, current.active as i32, id],
            )
            .map_err(|e| MiloError::database(format!("Update recipient: {e}")))?;
        Ok(current)
    }

    pub fn delete_recipient(&self, id: i64) -> Result<()> {
        let removed = self
            .conn()?
            .execute("DELETE FROM report_recipients WHERE id = ?1", params![id])
            .map_err(|e| MiloError::database(format!("Delete recipient: {e}")))?;
        if removed == 0 {
            return Err(MiloError::NotFound(format!("recipient {id}")));
        }
        tracing::info!("🗑️ Recipient {id} deleted");
        Ok(())
    }

    fn email_taken(
        &self,
        report_type: &str,
        scope: Option<i64>,
        email: &str,
        except_id: Option<i64>,
    ) -> Result<bool> {
        let count: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM report_recipients
                 WHERE report_type = ?1 AND project_id IS ?2
                   AND LOWER(TRIM(email)) = LOWER(?3)
                   AND id IS NOT ?4",
                params![report_type, scope, email.trim(), except_id],
                |r| r.get(0),
            )
            .map_err(|e| MiloError::database(format!("Check duplicate: {e}")))?;
        Ok(count > 0)
    }

    // ─── Schedules ────────────────────────────────────────────

    pub fn get_schedule(&self, key: &ScheduleKey) -> Result<Option<ScheduleConfig>> {
        query_schedule(&*self.conn()?, key)
    }

    pub fn all_schedules(&self) -> Result<Vec<ScheduleConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM report_schedules ORDER BY report_type, project_id"
            ))
            .map_err(|e| MiloError::database(format!("List schedules: {e}")))?;
        let rows = stmt
            .query_map([], schedule_from_row)
            .map_err(|e| MiloError::database(format!("List schedules: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MiloError::database(format!("Read schedule: {e}")))
    }

    /// Insert or update a schedule. A `manual` schedule is always stored
    /// inactive; any other frequency is stored active. `last_run_at` is
    /// preserved across saves.
    pub fn save_schedule(&self, schedule: &ScheduleConfig) -> Result<ScheduleConfig> {
        schedule.validate()?;
        let mut saved = schedule.clone();
        saved.active = saved.frequency != Frequency::Manual;

        let now = Utc::now().to_rfc3339();
        let time = saved.time_of_day.format("%H:%M").to_string();
        let key = saved.key();
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO report_schedules
                 (report_type, project_id, frequency, time_of_day, weekday, month_day,
                  is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT (report_type, IFNULL(project_id, -1)) DO UPDATE SET
                     frequency = excluded.frequency,
                     time_of_day = excluded.time_of_day,
                     weekday = excluded.weekday,
                     month_day = excluded.month_day,
                     is_active = excluded.is_active,
                     updated_at = excluded.updated_at",
                params![
                    saved.report_type,
                    saved.scope,
                    saved.frequency.as_str(),
                    time,
                    saved.weekday,
                    saved.month_day,
                    saved.active as i32,
                    now
                ],
            )
            .map_err(|e| MiloError::database(format!("Save schedule: {e}")))?;
            saved.last_run_at = query_schedule(&conn, &key)?.and_then(|s| s.last_run_at);
        }

        tracing::info!(
            "📅 Schedule saved: {} {} at {} (active: {})",
            saved.key(),
            saved.frequency.as_str(),
            time,
            saved.active
        );
        Ok(saved)
    }

    pub fn set_last_run(&self, key: &ScheduleKey, at: DateTime<Utc>) -> Result<()> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE report_schedules SET last_run_at = ?3
                 WHERE report_type = ?1 AND project_id IS ?2",
                params![key.report_type, key.scope, at.to_rfc3339()],
            )
            .map_err(|e| MiloError::database(format!("Mark fired: {e}")))?;
        if updated == 0 {
            return Err(MiloError::NotFound(format!("schedule {key}")));
        }
        Ok(())
    }

    // ─── Ledger ───────────────────────────────────────────────

    /// Write `last_sent_at` for every notified recipient in one transaction.
    pub fn set_last_sent(&self, updates: &[(i64, DateTime<Utc>)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| MiloError::database(format!("Begin ledger write: {e}")))?;
        {
            let mut stmt = tx
                .prepare("UPDATE report_recipients SET last_sent_at = ?2 WHERE id = ?1")
                .map_err(|e| MiloError::database(format!("Ledger write: {e}")))?;
            for (id, at) in updates {
                stmt.execute(params![id, at.to_rfc3339()])
                    .map_err(|e| MiloError::database(format!("Ledger write: {e}")))?;
            }
        }
        tx.commit()
            .map_err(|e| MiloError::database(format!("Commit ledger write: {e}")))
    }

    // ─── Run history ──────────────────────────────────────────

    pub fn insert_run(&self, run: &DispatchRun) -> Result<i64> {
        let conn = self.conn()?;
        let failed_emails = serde_json::to_string(&run.result.failed_emails)?;
        conn.execute(
            "INSERT INTO dispatch_runs
             (report_type, project_id, triggered_by, started_at, finished_at, attempted, sent,
              failed, skipped_duplicate, failed_emails, connection_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.report_type,
                run.scope,
                run.trigger.as_str(),
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                run.result.attempted as i64,
                run.result.sent as i64,
                run.result.failed as i64,
                run.result.skipped_duplicate as i64,
                failed_emails,
                run.result.connection_error,
            ],
        )
        .map_err(|e| MiloError::database(format!("Record run: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<DispatchRun>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, report_type, project_id, triggered_by, started_at, finished_at, attempted,
                        sent, failed, skipped_duplicate, failed_emails, connection_error
                 FROM dispatch_runs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| MiloError::database(format!("List runs: {e}")))?;
        let rows = stmt
            .query_map(params![limit as i64], run_from_row)
            .map_err(|e| MiloError::database(format!("List runs: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MiloError::database(format!("Read run: {e}")))
    }
}

fn query_schedule(conn: &Connection, key: &ScheduleKey) -> Result<Option<ScheduleConfig>> {
    conn.query_row(
        &format!(
            "SELECT {SCHEDULE_COLUMNS} FROM report_schedules
             WHERE report_type = ?1 AND project_id IS ?2"
        ),
        params![key.report_type, key.scope],
        schedule_from_row,
    )
    .optional()
    .map_err(|e| MiloError::database(format!("Get schedule: {e}")))
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<RecipientRecord> {
    Ok(RecipientRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        report_type: row.get(3)?,
        scope: row.get(4)?,
        active: row.get::<_, i32>(5)? != 0,
        last_sent_at: parse_ts(row.get(6)?),
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleConfig> {
    let frequency: String = row.get(2)?;
    let time: String = row.get(3)?;
    Ok(ScheduleConfig {
        report_type: row.get(0)?,
        scope: row.get(1)?,
        frequency: frequency
            .parse::<Frequency>()
            .map_err(|e| conversion_error(2, Box::new(e)))?,
        time_of_day: milo_core::types::hhmm::parse(&time).map_err(|e| conversion_error(3, e.into()))?,
        weekday: row.get(4)?,
        month_day: row.get(5)?,
        active: row.get::<_, i32>(6)? != 0,
        last_run_at: parse_ts(row.get(7)?),
    })
}

fn conversion_error(column: usize, err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<DispatchRun> {
    let trigger: String = row.get(3)?;
    let failed_emails: String = row.get(10)?;
    let started_at = parse_ts(row.get(4)?).unwrap_or_default();
    Ok(DispatchRun {
        id: row.get(0)?,
        report_type: row.get(1)?,
        scope: row.get(2)?,
        trigger: trigger.parse().unwrap_or(RunTrigger::Manual),
        started_at,
        finished_at: parse_ts(row.get(5)?).unwrap_or(started_at),
        result: DispatchBatchResult {
            attempted: row.get::<_, i64>(6)? as usize,
            sent: row.get::<_, i64>(7)? as usize,
            failed: row.get::<_, i64>(8)? as usize,
            skipped_duplicate: row.get::<_, i64>(9)? as usize,
            failed_emails: serde_json::from_str(&failed_emails).unwrap_or_default(),
            connection_error: row.get(11)?,
        },
    })
}

#[async_trait]
impl RecipientSource for ReportDb {
    async fn active_recipients(&self, report_type: &str, scope: Option<i64>) -> Result<Vec<RecipientRecord>> {
        self.query_recipients(report_type, scope, true)
    }
}

#[async_trait]
impl DispatchLedger for ReportDb {
    async fn record_sent(&self, updates: &[(i64, DateTime<Utc>)]) -> Result<()> {
        self.set_last_sent(updates)
    }
}

#[async_trait]
impl ScheduleStore for ReportDb {
    async fn load_schedule(&self, key: &ScheduleKey) -> Result<Option<ScheduleConfig>> {
        self.get_schedule(key)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleConfig>> {
        self.all_schedules()
    }

    async fn mark_fired(&self, key: &ScheduleKey, at: DateTime<Utc>) -> Result<()> {
        self.set_last_run(key, at)
    }
}

#[async_trait]
impl RunHistory for ReportDb {
    async fn record_run(&self, run: &DispatchRun) -> Result<i64> {
        self.insert_run(run)
    }
}
