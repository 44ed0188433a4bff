use crate::error::OxideError;
use crate::types::{Budget, BudgetAlert, CostRecord};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Per-token $ rates for one service. Local/self-hosted backends are
/// typically zero on both.
#[derive(Debug, Clone, Copy)]
pub struct ServicePricing {
    pub input_per_token: f64,
    pub output_per_token: f64,
}

fn default_pricing() -> HashMap<&'static str, ServicePricing> {
    HashMap::from([
        ("gemini", ServicePricing { input_per_token: 0.000_000_35, output_per_token: 0.000_001_05 }),
        ("qwen", ServicePricing { input_per_token: 0.000_000_4, output_per_token: 0.000_001_2 }),
        ("ollama_local", ServicePricing { input_per_token: 0.0, output_per_token: 0.0 }),
        ("ollama_remote", ServicePricing { input_per_token: 0.0, output_per_token: 0.0 }),
        ("lmstudio", ServicePricing { input_per_token: 0.0, output_per_token: 0.0 }),
        ("openrouter", ServicePricing { input_per_token: 0.000_000_5, output_per_token: 0.000_001_5 }),
    ])
}

/// `len/4` as a rough token estimate, matching the original's
/// heuristic — this crate never calls a tokenizer for cost purposes.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.len() as i64 / 4).max(1)
}

/// SQLite-backed cost ledger. One fresh connection per operation —
/// rusqlite connections are cheap and this keeps the store `Sync`
/// without a held lock across awaits.
pub struct CostTracker {
    path: PathBuf,
    pricing: Mutex<HashMap<String, ServicePricing>>,
}

impl CostTracker {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, OxideError> {
        let path = path.into();
        let conn = Connection::open(&path).map_err(sqlite_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS llm_costs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                service_id TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                cost REAL NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_llm_costs_timestamp ON llm_costs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_llm_costs_service ON llm_costs(service_id);
            CREATE INDEX IF NOT EXISTS idx_llm_costs_task ON llm_costs(task_id);
            CREATE TABLE IF NOT EXISTS budgets (
                period TEXT NOT NULL,
                limit_amount REAL NOT NULL,
                alert_fraction REAL NOT NULL,
                active INTEGER NOT NULL
            );",
        ).map_err(sqlite_err)?;

        let pricing = default_pricing()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<HashMap<_, _>>();

        Ok(Self {
            path,
            pricing: Mutex::new(pricing),
        })
    }

    fn conn(&self) -> Result<Connection, OxideError> {
        Connection::open(&self.path).map_err(sqlite_err)
    }

    pub fn set_pricing(&self, service_id: &str, pricing: ServicePricing) {
        self.pricing.lock().unwrap().insert(service_id.to_string(), pricing);
    }

    /// Records one call's cost. Services with no configured pricing
    /// are treated as free, with a warning rather than a hard error —
    /// a missing price table entry should never break execution.
    pub fn record_cost(&self, task_id: &str, service_id: &str, tokens_in: i64, tokens_out: i64) -> Result<f64, OxideError> {
        let pricing = {
            let table = self.pricing.lock().unwrap();
            match table.get(service_id) {
                Some(p) => *p,
                None => {
                    tracing::warn!(service = %service_id, "no pricing configured, treating as free");
                    ServicePricing { input_per_token: 0.0, output_per_token: 0.0 }
                }
            }
        };
        let cost = tokens_in as f64 * pricing.input_per_token + tokens_out as f64 * pricing.output_per_token;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO llm_costs (task_id, service_id, tokens_in, tokens_out, cost, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![task_id, service_id, tokens_in, tokens_out, cost, Utc::now().to_rfc3339()],
        ).map_err(sqlite_err)?;
        Ok(cost)
    }

    pub fn total_cost(&self) -> Result<f64, OxideError> {
        let conn = self.conn()?;
        conn.query_row("SELECT COALESCE(SUM(cost), 0.0) FROM llm_costs", [], |row| row.get(0))
            .map_err(sqlite_err)
    }

    pub fn cost_by_service(&self) -> Result<HashMap<String, f64>, OxideError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT service_id, SUM(cost) FROM llm_costs GROUP BY service_id").map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))
            .map_err(sqlite_err)?;
        let mut out = HashMap::new();
        for row in rows {
            let (service, cost) = row.map_err(sqlite_err)?;
            out.insert(service, cost);
        }
        Ok(out)
    }

    pub fn daily_costs(&self, days: i64) -> Result<Vec<(String, f64)>, OxideError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT date(timestamp) as d, SUM(cost) FROM llm_costs
                 WHERE timestamp >= date('now', ?1) GROUP BY d ORDER BY d",
            )
            .map_err(sqlite_err)?;
        let modifier = format!("-{} days", days);
        let rows = stmt
            .query_map(params![modifier], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))
            .map_err(sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sqlite_err)?);
        }
        Ok(out)
    }

    pub fn token_usage(&self) -> Result<(i64, i64), OxideError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COALESCE(SUM(tokens_in), 0), COALESCE(SUM(tokens_out), 0) FROM llm_costs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).map_err(sqlite_err)
    }

    /// Deactivates any existing active budget for the same period
    /// before inserting the new one — at most one active budget per
    /// period at a time.
    pub fn set_budget(&self, budget: &Budget) -> Result<(), OxideError> {
        let conn = self.conn()?;
        conn.execute("UPDATE budgets SET active = 0 WHERE period = ?1 AND active = 1", params![budget.period]).map_err(sqlite_err)?;
        conn.execute(
            "INSERT INTO budgets (period, limit_amount, alert_fraction, active) VALUES (?1, ?2, ?3, ?4)",
            params![budget.period, budget.limit, budget.alert_fraction, budget.active as i32],
        ).map_err(sqlite_err)?;
        Ok(())
    }

    pub fn check_budget_alert(&self, period: &str) -> Result<Option<BudgetAlert>, OxideError> {
        let conn = self.conn()?;
        let budget: Option<(f64, f64)> = conn
            .query_row(
                "SELECT limit_amount, alert_fraction FROM budgets WHERE period = ?1 AND active = 1 ORDER BY rowid DESC LIMIT 1",
                params![period],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sqlite_err)?;

        let Some((limit, alert_fraction)) = budget else {
            return Ok(None);
        };

        let current: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM llm_costs WHERE strftime('%Y-%m', timestamp) = ?1",
                params![period],
                |row| row.get(0),
            )
            .map_err(sqlite_err)?;

        let ratio = if limit > 0.0 { current / limit } else { 0.0 };
        if ratio < alert_fraction {
            return Ok(None);
        }

        Ok(Some(BudgetAlert {
            period: period.to_string(),
            limit,
            current,
            ratio,
            alert_fraction,
            exceeded: current >= limit,
        }))
    }

    pub fn statistics(&self) -> Result<(f64, i64, i64), OxideError> {
        let total = self.total_cost()?;
        let (tokens_in, tokens_out) = self.token_usage()?;
        Ok((total, tokens_in, tokens_out))
    }
}

fn sqlite_err(e: rusqlite::Error) -> OxideError {
    OxideError::Protocol { service: "cost_store".to_string(), detail: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (CostTracker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.db");
        (CostTracker::new(&path).unwrap(), dir)
    }

    #[test]
    fn record_cost_uses_configured_pricing() {
        let (tracker, _dir) = tracker();
        let cost = tracker.record_cost("task-1", "gemini", 1000, 500).unwrap();
        assert!(cost > 0.0);
        assert_eq!(tracker.total_cost().unwrap(), cost);
    }

    #[test]
    fn unknown_service_is_free() {
        let (tracker, _dir) = tracker();
        let cost = tracker.record_cost("task-1", "unknown_service", 1000, 500).unwrap();
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn estimate_tokens_has_floor_of_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(400)), 100);
    }

    #[test]
    fn budget_alert_reflects_spend_ratio() {
        let (tracker, _dir) = tracker();
        let period = Utc::now().format("%Y-%m").to_string();
        tracker.set_budget(&Budget { period: period.clone(), limit: 1.0, alert_fraction: 0.8, active: true }).unwrap();
        tracker.record_cost("task-1", "gemini", 1_000_000, 1_000_000).unwrap();
        let alert = tracker.check_budget_alert(&period).unwrap().unwrap();
        assert!(alert.current > 0.0);
        assert!(alert.ratio >= alert.alert_fraction);
        assert!(alert.exceeded);
    }

    #[test]
    fn budget_alert_is_none_below_threshold() {
        let (tracker, _dir) = tracker();
        let period = Utc::now().format("%Y-%m").to_string();
        tracker.set_budget(&Budget { period: period.clone(), limit: 10.0, alert_fraction: 0.8, active: true }).unwrap();
        tracker.record_cost("task-1", "gemini", 1_000_000, 1_000_000).unwrap();
        assert!(tracker.check_budget_alert(&period).unwrap().is_none());
    }
}
