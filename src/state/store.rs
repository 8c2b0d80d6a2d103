//! SQLite-backed store for run, worker, output and planning records.
//!
//! All state transitions are single statements executed under one
//! connection lock, so each per-task transition is atomic. Completions are
//! broadcast on a watch channel so dependency waits need not poll.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::state::records::{
    PlanningRow, RunId, RunPhase, RunRecord, RunStatus, RunSummary, TaskOutput, WorkerRun,
};
use crate::{twlog_debug, twlog_trace};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    request     TEXT NOT NULL,
    phase       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    finished_at TEXT
);
CREATE TABLE IF NOT EXISTS worker_runs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL,
    task_id      TEXT NOT NULL,
    agent        TEXT NOT NULL,
    status       TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    completed_at TEXT,
    duration_ms  INTEGER,
    error        TEXT,
    output_ref   INTEGER,
    UNIQUE (run_id, task_id)
);
CREATE TABLE IF NOT EXISTS task_outputs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT NOT NULL,
    task_id    TEXT NOT NULL,
    agent      TEXT NOT NULL,
    payload    TEXT NOT NULL,
    metadata   TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_outputs_run ON task_outputs (run_id, task_id);
CREATE TABLE IF NOT EXISTS planning (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id            TEXT NOT NULL,
    task_id           TEXT NOT NULL,
    agent             TEXT NOT NULL,
    agent_description TEXT NOT NULL,
    canonical_path    TEXT NOT NULL,
    tools             TEXT,
    tool_params       TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT,
    UNIQUE (run_id, task_id)
);
";

const WORKER_COLUMNS: &str =
    "run_id, task_id, agent, status, started_at, completed_at, duration_ms, error, output_ref";
const OUTPUT_COLUMNS: &str = "id, run_id, task_id, agent, payload, metadata, created_at";
const PLAN_COLUMNS: &str = "run_id, task_id, agent, agent_description, canonical_path, tools, \
                            tool_params, created_at, updated_at";

/// Durable store of everything recorded about runs.
pub struct RunStore {
    conn: Mutex<Connection>,
    completions: watch::Sender<u64>,
}

impl RunStore {
    /// Open (creating if needed) a store file.
    pub fn open(path: &Path) -> Result<Self> {
        twlog_debug!("RunStore::open path={}", path.display());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// A private store that lives as long as the value.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let (completions, _) = watch::channel(0);
        Ok(Self {
            conn: Mutex::new(conn),
            completions,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Internal(format!("store lock poisoned: {}", e)))
    }

    /// Receiver bumped after every task completion.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.completions.subscribe()
    }

    // ========== Runs ==========

    pub fn begin_run(&self, run_id: &RunId, request: &str) -> Result<RunRecord> {
        let created_at = Utc::now();
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO runs (run_id, request, phase, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, request, RunPhase::Running, created_at],
        )?;
        if inserted == 0 {
            return Err(Error::Validation(format!("Run {} already exists", run_id)));
        }
        twlog_debug!("RunStore::begin_run run={}", run_id);
        Ok(RunRecord {
            run_id: run_id.clone(),
            request: request.to_string(),
            phase: RunPhase::Running,
            created_at,
            finished_at: None,
        })
    }

    pub fn finish_run(&self, run_id: &RunId) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET phase = ?1, finished_at = ?2 WHERE run_id = ?3",
            params![RunPhase::Finished, Utc::now(), run_id],
        )?;
        if updated == 0 {
            return Err(Error::UnknownRun(run_id.to_string()));
        }
        twlog_debug!("RunStore::finish_run run={}", run_id);
        Ok(())
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT run_id, request, phase, created_at, finished_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All runs, most recent first.
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, request, phase, created_at, finished_at
             FROM runs ORDER BY rowid DESC",
        )?;
        let rows = stmt.query_map([], run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========== Worker runs ==========

    /// Record that a task started. A task may start only once per run.
    pub fn start_task(&self, run_id: &RunId, task_id: &TaskId, agent: &str) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO worker_runs (run_id, task_id, agent, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, task_id, agent, RunStatus::Running, Utc::now()],
        )?;
        if inserted == 0 {
            return Err(Error::DuplicateTask {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        twlog_trace!("RunStore::start_task run={} task={}", run_id, task_id);
        Ok(())
    }

    /// Move a running task to a terminal status.
    pub fn complete_task(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        status: RunStatus,
        duration_ms: u64,
        output_ref: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::Validation(format!(
                "Cannot complete task {} with status {}",
                task_id, status
            )));
        }
        {
            let conn = self.conn()?;
            let updated = conn.execute(
                "UPDATE worker_runs
                 SET status = ?1, completed_at = ?2, duration_ms = ?3, output_ref = ?4, error = ?5
                 WHERE run_id = ?6 AND task_id = ?7 AND status = ?8",
                params![
                    status,
                    Utc::now(),
                    duration_ms,
                    output_ref,
                    error,
                    run_id,
                    task_id,
                    RunStatus::Running
                ],
            )?;
            if updated == 0 {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS (SELECT 1 FROM worker_runs WHERE run_id = ?1 AND task_id = ?2)",
                    params![run_id, task_id],
                    |row| row.get(0),
                )?;
                let (run_id, task_id) = (run_id.to_string(), task_id.to_string());
                return Err(if exists {
                    Error::TaskAlreadyCompleted { run_id, task_id }
                } else {
                    Error::UnknownTask { run_id, task_id }
                });
            }
        }
        twlog_trace!(
            "RunStore::complete_task run={} task={} status={}",
            run_id,
            task_id,
            status
        );
        self.completions.send_modify(|n| *n += 1);
        Ok(())
    }

    pub fn get_worker_run(&self, run_id: &RunId, task_id: &TaskId) -> Result<Option<WorkerRun>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM worker_runs WHERE run_id = ?1 AND task_id = ?2",
            WORKER_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![run_id, task_id], worker_run_from_row)
            .optional()?)
    }

    /// Every worker row of a run, in start order.
    pub fn list_worker_runs(&self, run_id: &RunId) -> Result<Vec<WorkerRun>> {
        self.query_worker_runs(run_id, None)
    }

    pub fn get_failed_tasks(&self, run_id: &RunId) -> Result<Vec<WorkerRun>> {
        self.query_worker_runs(run_id, Some(RunStatus::Failed))
    }

    fn query_worker_runs(&self, run_id: &RunId, status: Option<RunStatus>) -> Result<Vec<WorkerRun>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM worker_runs
             WHERE run_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id",
            WORKER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id, status], worker_run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn is_task_complete(&self, run_id: &RunId, task_id: &TaskId) -> Result<bool> {
        let conn = self.conn()?;
        Ok(task_complete(&conn, run_id, task_id)?)
    }

    /// True when every listed task reached a terminal status. Failed counts
    /// as complete.
    pub fn are_dependencies_complete(&self, run_id: &RunId, task_ids: &[TaskId]) -> Result<bool> {
        if task_ids.is_empty() {
            return Ok(true);
        }
        let conn = self.conn()?;
        for task_id in task_ids {
            if !task_complete(&conn, run_id, task_id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn get_run_summary(&self, run_id: &RunId) -> Result<RunSummary> {
        let conn = self.conn()?;
        let summary = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'success'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COALESCE(SUM(status = 'running'), 0),
                    COALESCE(SUM(duration_ms), 0),
                    AVG(duration_ms),
                    MIN(duration_ms),
                    MAX(duration_ms)
             FROM worker_runs WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok(RunSummary {
                    run_id: run_id.clone(),
                    total: row.get::<_, i64>(0)? as usize,
                    success: row.get::<_, i64>(1)? as usize,
                    failed: row.get::<_, i64>(2)? as usize,
                    running: row.get::<_, i64>(3)? as usize,
                    total_duration_ms: row.get::<_, i64>(4)? as u64,
                    avg_duration_ms: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    min_duration_ms: row.get::<_, Option<i64>>(6)?.unwrap_or(0) as u64,
                    max_duration_ms: row.get::<_, Option<i64>>(7)?.unwrap_or(0) as u64,
                })
            },
        )?;
        Ok(summary)
    }

    // ========== Task outputs ==========

    /// Append an output record and return its row id.
    pub fn store_output(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        agent: &str,
        payload: &serde_json::Value,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        let payload = serde_json::to_string(payload)?;
        let metadata = serde_json::to_string(metadata)?;
        let conn = self.conn()?;
        let run_exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM runs WHERE run_id = ?1)",
            params![run_id],
            |row| row.get(0),
        )?;
        if !run_exists {
            return Err(Error::UnknownRun(run_id.to_string()));
        }
        conn.execute(
            "INSERT INTO task_outputs (run_id, task_id, agent, payload, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run_id, task_id, agent, payload, metadata, Utc::now()],
        )?;
        let id = conn.last_insert_rowid();
        twlog_trace!("RunStore::store_output run={} task={} id={}", run_id, task_id, id);
        Ok(id)
    }

    /// Most recent output of a task.
    pub fn get_task_output(&self, run_id: &RunId, task_id: &TaskId) -> Result<Option<TaskOutput>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM task_outputs WHERE run_id = ?1 AND task_id = ?2
             ORDER BY id DESC LIMIT 1",
            OUTPUT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![run_id, task_id], output_from_row)
            .optional()?)
    }

    /// Every output of a run, in creation order.
    pub fn get_all_task_outputs(&self, run_id: &RunId) -> Result<Vec<TaskOutput>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM task_outputs WHERE run_id = ?1 ORDER BY id",
            OUTPUT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id], output_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========== Planning ==========

    pub fn insert_plan_row(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        agent: &str,
        agent_description: &str,
        canonical_path: &[TaskId],
    ) -> Result<()> {
        let path = serde_json::to_string(canonical_path)?;
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO planning
                (run_id, task_id, agent, agent_description, canonical_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run_id, task_id, agent, agent_description, path, Utc::now()],
        )?;
        if inserted == 0 {
            return Err(Error::DuplicateTask {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Record the resolved tool list and per-tool parameters for a task.
    pub fn update_plan_tools(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        tools: &[String],
        tool_params: &serde_json::Value,
    ) -> Result<()> {
        let tools = serde_json::to_string(tools)?;
        let tool_params = serde_json::to_string(tool_params)?;
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE planning SET tools = ?1, tool_params = ?2, updated_at = ?3
             WHERE run_id = ?4 AND task_id = ?5",
            params![tools, tool_params, Utc::now(), run_id, task_id],
        )?;
        if updated == 0 {
            return Err(Error::UnknownTask {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Planning rows of a run, in insertion order.
    pub fn get_plan(&self, run_id: &RunId) -> Result<Vec<PlanningRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM planning WHERE run_id = ?1 ORDER BY id",
            PLAN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id], plan_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore")
            .field("completions", &*self.completions.borrow())
            .finish()
    }
}

fn task_complete(conn: &Connection, run_id: &RunId, task_id: &TaskId) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM worker_runs
                        WHERE run_id = ?1 AND task_id = ?2 AND status IN ('success', 'failed'))",
        params![run_id, task_id],
        |row| row.get(0),
    )
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        request: row.get(1)?,
        phase: row.get(2)?,
        created_at: row.get(3)?,
        finished_at: row.get::<_, Option<DateTime<Utc>>>(4)?,
    })
}

fn worker_run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkerRun> {
    Ok(WorkerRun {
        run_id: row.get(0)?,
        task_id: row.get(1)?,
        agent: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        duration_ms: row.get(6)?,
        error: row.get(7)?,
        output_ref: row.get(8)?,
    })
}

fn output_from_row(row: &Row<'_>) -> rusqlite::Result<TaskOutput> {
    Ok(TaskOutput {
        id: row.get(0)?,
        run_id: row.get(1)?,
        task_id: row.get(2)?,
        agent: row.get(3)?,
        payload: json_column(row, 4)?,
        metadata: json_column(row, 5)?,
        created_at: row.get(6)?,
    })
}

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<PlanningRow> {
    Ok(PlanningRow {
        run_id: row.get(0)?,
        task_id: row.get(1)?,
        agent: row.get(2)?,
        agent_description: row.get(3)?,
        canonical_path: json_column(row, 4)?,
        tools: optional_json_column(row, 5)?,
        tool_params: optional_json_column(row, 6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
