use crate::error::OxideError;
use crate::types::{BroadcastResult, ExecutionMode, TaskCategory, TaskRecord, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;

/// Durable task record store. WAL mode is enabled so the web backend
/// and an MCP server (both out of scope here, but real future
/// readers of this database) can read concurrently with a writer
/// without blocking on file locks.
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, OxideError> {
        let path = path.into();
        let conn = Connection::open(&path).map_err(sqlite_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sqlite_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                prompt TEXT NOT NULL,
                files TEXT NOT NULL,
                preferences TEXT NOT NULL,
                service TEXT,
                category TEXT,
                execution_mode TEXT,
                result TEXT,
                error TEXT,
                broadcast_results TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_service ON tasks(service);
            CREATE INDEX IF NOT EXISTS idx_tasks_category ON tasks(category);
            CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);",
        ).map_err(sqlite_err)?;
        Ok(Self { path })
    }

    fn conn(&self) -> Result<Connection, OxideError> {
        Connection::open(&self.path).map_err(sqlite_err)
    }

    pub fn insert(&self, record: &TaskRecord) -> Result<(), OxideError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, status, prompt, files, preferences, service, category, execution_mode, result, error, broadcast_results, created_at, started_at, completed_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.id,
                status_str(record.status),
                record.prompt,
                serde_json::to_string(&record.files).map_err(json_err)?,
                serde_json::to_string(&record.preferences).map_err(json_err)?,
                record.service,
                record.category.map(|c| c.as_str()),
                record.execution_mode.map(mode_str),
                record.result,
                record.error,
                serde_json::to_string(&record.broadcast_results).map_err(json_err)?,
                record.created_at.to_rfc3339(),
                record.started_at.map(|t| t.to_rfc3339()),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.duration_ms,
            ],
        ).map_err(sqlite_err)?;
        Ok(())
    }

    pub fn update(&self, record: &TaskRecord) -> Result<(), OxideError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET status=?2, service=?3, category=?4, execution_mode=?5, result=?6, error=?7,
             broadcast_results=?8, started_at=?9, completed_at=?10, duration_ms=?11 WHERE id=?1",
            params![
                record.id,
                status_str(record.status),
                record.service,
                record.category.map(|c| c.as_str()),
                record.execution_mode.map(mode_str),
                record.result,
                record.error,
                serde_json::to_string(&record.broadcast_results).map_err(json_err)?,
                record.started_at.map(|t| t.to_rfc3339()),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.duration_ms,
            ],
        ).map_err(sqlite_err)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TaskRecord>, OxideError> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_record)
            .optional()
            .map_err(sqlite_err)
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, OxideError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at DESC").map_err(sqlite_err)?;
        let rows = stmt.query_map(params![status_str(status)], row_to_record).map_err(sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sqlite_err)?);
        }
        Ok(out)
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "queued",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> TaskStatus {
    match s {
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Queued,
    }
}

fn mode_str(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Single => "single",
        ExecutionMode::Parallel => "parallel",
        ExecutionMode::BroadcastAll => "broadcast_all",
    }
}

fn parse_mode(s: &str) -> ExecutionMode {
    match s {
        "parallel" => ExecutionMode::Parallel,
        "broadcast_all" => ExecutionMode::BroadcastAll,
        _ => ExecutionMode::Single,
    }
}

fn parse_category(s: &str) -> TaskCategory {
    match s {
        "code_generation" => TaskCategory::CodeGeneration,
        "code_review" => TaskCategory::CodeReview,
        "bug_search" => TaskCategory::BugSearch,
        "refactor" => TaskCategory::Refactor,
        "documentation" => TaskCategory::Documentation,
        "codebase_analysis" => TaskCategory::CodebaseAnalysis,
        "quick_query" => TaskCategory::QuickQuery,
        _ => TaskCategory::General,
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
    let files_json: String = row.get("files")?;
    let prefs_json: String = row.get("preferences")?;
    let broadcast_json: String = row.get("broadcast_results")?;
    let status_s: String = row.get("status")?;
    let category: Option<String> = row.get("category")?;
    let mode: Option<String> = row.get("execution_mode")?;
    let created_at: String = row.get("created_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(TaskRecord {
        id: row.get("id")?,
        status: parse_status(&status_s),
        prompt: row.get("prompt")?,
        files: serde_json::from_str(&files_json).unwrap_or_default(),
        preferences: serde_json::from_str::<HashMap<String, serde_json::Value>>(&prefs_json).unwrap_or_default(),
        service: row.get("service")?,
        category: category.map(|c| parse_category(&c)),
        execution_mode: mode.map(|m| parse_mode(&m)),
        result: row.get("result")?,
        error: row.get("error")?,
        broadcast_results: serde_json::from_str::<Vec<BroadcastResult>>(&broadcast_json).unwrap_or_default(),
        created_at: parse_rfc3339(&created_at),
        started_at: started_at.map(|t| parse_rfc3339(&t)),
        completed_at: completed_at.map(|t| parse_rfc3339(&t)),
        duration_ms: row.get("duration_ms")?,
    })
}

fn sqlite_err(e: rusqlite::Error) -> OxideError {
    OxideError::Protocol { service: "task_store".to_string(), detail: e.to_string() }
}

fn json_err(e: serde_json::Error) -> OxideError {
    OxideError::Protocol { service: "task_store".to_string(), detail: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (TaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        (TaskStore::new(&path).unwrap(), dir)
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (store, _dir) = store();
        let record = TaskRecord::new("t1".to_string(), "do stuff".to_string(), vec![], HashMap::new());
        store.insert(&record).unwrap();
        let loaded = store.get("t1").unwrap().unwrap();
        assert_eq!(loaded.prompt, "do stuff");
        assert_eq!(loaded.status, TaskStatus::Queued);
    }

    #[test]
    fn update_reflects_terminal_status() {
        let (store, _dir) = store();
        let mut record = TaskRecord::new("t2".to_string(), "prompt".to_string(), vec![], HashMap::new());
        store.insert(&record).unwrap();
        record.transition(TaskStatus::Running);
        store.update(&record).unwrap();
        record.transition(TaskStatus::Completed);
        record.set_result_truncated("done");
        store.update(&record).unwrap();

        let loaded = store.get("t2").unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result.as_deref(), Some("done"));
        assert!(loaded.duration_ms.is_some());
    }

    #[test]
    fn list_by_status_filters() {
        let (store, _dir) = store();
        let mut a = TaskRecord::new("a".to_string(), "p".to_string(), vec![], HashMap::new());
        let b = TaskRecord::new("b".to_string(), "p".to_string(), vec![], HashMap::new());
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();
        a.transition(TaskStatus::Running);
        store.update(&a).unwrap();

        let running = store.list_by_status(TaskStatus::Running).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a");
    }
}
