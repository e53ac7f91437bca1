//! Execution history in SQLite.
//!
//! Append-heavy: executions insert as `pending` and receive one terminal
//! update; steps track per-step timing; `execution_paths` is a redundant index
//! of `affected_paths` for fast overlap queries. Graph fields (correlation,
//! parent, trigger, repair) arrive through migrations.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::migrations::run_migrations;
use crate::similarity::{PathSimilarity, SimilarityEngine, SimilarityScore};
use crate::ExecutorError;

pub(crate) fn base_schema() -> &'static str {
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        plan_id TEXT NOT NULL,
        changeset_id TEXT NOT NULL,
        decision_id TEXT NOT NULL,
        checksum TEXT NOT NULL,
        verdict TEXT NOT NULL,
        status TEXT NOT NULL,
        risk_level TEXT,
        affected_paths TEXT,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        duration_seconds REAL,
        files_changed INTEGER DEFAULT 0,
        verification_passed INTEGER DEFAULT 0,
        health_checks_passed INTEGER DEFAULT 0,
        rolled_back INTEGER DEFAULT 0,
        artifact_path TEXT,
        error_message TEXT,
        error_step TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
    CREATE INDEX IF NOT EXISTS idx_executions_started_at ON executions(started_at DESC);
    CREATE INDEX IF NOT EXISTS idx_executions_plan_id ON executions(plan_id);
    CREATE INDEX IF NOT EXISTS idx_executions_verdict ON executions(verdict);
    CREATE INDEX IF NOT EXISTS idx_executions_risk_level ON executions(risk_level);

    CREATE TABLE IF NOT EXISTS execution_steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        step_num INTEGER NOT NULL,
        step_name TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        duration_seconds REAL,
        error_code TEXT,
        error_message TEXT,
        log_ref TEXT,
        metadata TEXT,
        FOREIGN KEY (execution_id) REFERENCES executions(execution_id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_execution_steps_execution_id ON execution_steps(execution_id);
    CREATE INDEX IF NOT EXISTS idx_execution_steps_step_name ON execution_steps(step_name);
    CREATE INDEX IF NOT EXISTS idx_execution_steps_status ON execution_steps(status);
    "#
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub plan_id: String,
    pub changeset_id: String,
    pub decision_id: String,
    pub checksum: String,
    pub verdict: String,
    pub status: String,
    pub risk_level: Option<String>,
    pub affected_paths: Vec<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub files_changed: i64,
    pub verification_passed: bool,
    pub health_checks_passed: bool,
    pub rolled_back: bool,
    pub artifact_path: Option<String>,
    pub error_message: Option<String>,
    pub error_step: Option<String>,
    pub correlation_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub trigger_kind: Option<String>,
    pub run_id: Option<String>,
    pub is_repair: bool,
    pub repair_for_execution_id: Option<String>,
}

impl ExecutionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let affected_json: Option<String> = row.get("affected_paths")?;
        Ok(Self {
            execution_id: row.get("execution_id")?,
            plan_id: row.get("plan_id")?,
            changeset_id: row.get("changeset_id")?,
            decision_id: row.get("decision_id")?,
            checksum: row.get("checksum")?,
            verdict: row.get("verdict")?,
            status: row.get("status")?,
            risk_level: row.get("risk_level")?,
            affected_paths: affected_json
                .and_then(|j| serde_json::from_str(&j).ok())
                .unwrap_or_default(),
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            duration_seconds: row.get("duration_seconds")?,
            files_changed: row.get::<_, Option<i64>>("files_changed")?.unwrap_or(0),
            verification_passed: row
                .get::<_, Option<i64>>("verification_passed")?
                .unwrap_or(0)
                != 0,
            health_checks_passed: row
                .get::<_, Option<i64>>("health_checks_passed")?
                .unwrap_or(0)
                != 0,
            rolled_back: row.get::<_, Option<i64>>("rolled_back")?.unwrap_or(0) != 0,
            artifact_path: row.get("artifact_path")?,
            error_message: row.get("error_message")?,
            error_step: row.get("error_step")?,
            correlation_id: row.get("correlation_id")?,
            parent_execution_id: row.get("parent_execution_id")?,
            trigger_kind: row.get("trigger_kind")?,
            run_id: row.get("run_id")?,
            is_repair: row.get::<_, Option<i64>>("is_repair")?.unwrap_or(0) != 0,
            repair_for_execution_id: row.get("repair_for_execution_id")?,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StepRecord {
    pub id: i64,
    pub execution_id: String,
    pub step_num: i64,
    pub step_name: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub log_ref: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionStatistics {
    pub total_executions: i64,
    pub by_status: std::collections::BTreeMap<String, i64>,
    pub avg_duration_seconds: Option<f64>,
    pub success_rate_percent: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionLineage {
    pub execution: Option<ExecutionRecord>,
    /// Root first.
    pub ancestors: Vec<ExecutionRecord>,
    /// BFS order, capped at `depth * 10`.
    pub descendants: Vec<ExecutionRecord>,
    pub siblings: Vec<ExecutionRecord>,
}

/// Optional graph metadata for `record_execution_start`.
#[derive(Clone, Debug, Default)]
pub struct StartGraphFields {
    pub correlation_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub trigger_kind: Option<String>,
    pub run_id: Option<String>,
    pub is_repair: bool,
    pub repair_for_execution_id: Option<String>,
}

#[derive(Clone)]
pub struct ExecutionStore {
    db: Arc<Mutex<Connection>>,
}

impl ExecutionStore {
    /// Opens `.lonelycat/executor.db` under the workspace root, creating the
    /// schema and applying migrations.
    pub fn new(workspace_root: &Path) -> Result<Self, ExecutorError> {
        let db_dir = workspace_root.join(".lonelycat");
        std::fs::create_dir_all(&db_dir)?;
        Self::open(&db_dir.join("executor.db"))
    }

    pub fn open(db_path: &Path) -> Result<Self, ExecutorError> {
        let conn = Connection::open(db_path).map_err(storage)?;
        conn.pragma_update(None, "foreign_keys", true).map_err(storage)?;
        conn.execute_batch(base_schema()).map_err(storage)?;
        run_migrations(&conn).map_err(storage)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", true).unwrap();
        conn.execute_batch(base_schema()).unwrap();
        run_migrations(&conn).unwrap();
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_execution_start(
        &self,
        execution_id: &str,
        plan_id: &str,
        changeset_id: &str,
        decision_id: &str,
        checksum: &str,
        verdict: &str,
        risk_level: &str,
        affected_paths: &[String],
        artifact_path: &str,
        graph: StartGraphFields,
    ) -> Result<(), ExecutorError> {
        // A missing correlation id marks a root: it correlates with itself.
        let correlation_id = graph
            .correlation_id
            .unwrap_or_else(|| execution_id.to_string());
        let trigger_kind = graph.trigger_kind.unwrap_or_else(|| "manual".to_string());

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO executions (
                execution_id, plan_id, changeset_id, decision_id, checksum, verdict, status,
                risk_level, affected_paths, started_at, artifact_path,
                correlation_id, parent_execution_id, trigger_kind, run_id,
                is_repair, repair_for_execution_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                execution_id,
                plan_id,
                changeset_id,
                decision_id,
                checksum,
                verdict,
                risk_level,
                serde_json::to_string(affected_paths)?,
                chrono::Utc::now().to_rfc3339(),
                artifact_path,
                correlation_id,
                graph.parent_execution_id,
                trigger_kind,
                graph.run_id,
                graph.is_repair as i64,
                graph.repair_for_execution_id,
            ],
        )
        .map_err(storage)?;

        // Dual-write to the path index.
        for path in affected_paths {
            let trimmed = path.trim();
            if trimmed.is_empty() {
                continue;
            }
            conn.execute(
                "INSERT OR IGNORE INTO execution_paths (execution_id, path) VALUES (?1, ?2)",
                params![execution_id, trimmed],
            )
            .map_err(storage)?;
        }
        Ok(())
    }

    pub fn update_execution_status(
        &self,
        execution_id: &str,
        status: &str,
        error_message: Option<&str>,
        error_step: Option<&str>,
    ) -> Result<(), ExecutorError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE executions SET status = ?1, error_message = ?2, error_step = ?3 WHERE execution_id = ?4",
            params![status, error_message, error_step, execution_id],
        )
        .map_err(storage)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_execution_end(
        &self,
        execution_id: &str,
        status: &str,
        duration_seconds: f64,
        files_changed: usize,
        verification_passed: bool,
        health_checks_passed: bool,
        rolled_back: bool,
        error_message: Option<&str>,
        error_step: Option<&str>,
    ) -> Result<(), ExecutorError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE executions SET status = ?1, ended_at = ?2, duration_seconds = ?3,
                files_changed = ?4, verification_passed = ?5, health_checks_passed = ?6,
                rolled_back = ?7, error_message = ?8, error_step = ?9
             WHERE execution_id = ?10",
            params![
                status,
                chrono::Utc::now().to_rfc3339(),
                duration_seconds,
                files_changed as i64,
                verification_passed as i64,
                health_checks_passed as i64,
                rolled_back as i64,
                error_message,
                error_step,
                execution_id,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn record_step_start(
        &self,
        execution_id: &str,
        step_num: u32,
        step_name: &str,
        log_ref: Option<&str>,
    ) -> Result<i64, ExecutorError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO execution_steps (execution_id, step_num, step_name, status, started_at, log_ref)
             VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
            params![
                execution_id,
                step_num,
                step_name,
                chrono::Utc::now().to_rfc3339(),
                log_ref,
            ],
        )
        .map_err(storage)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_step_end(
        &self,
        step_id: i64,
        status: &str,
        duration_seconds: f64,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), ExecutorError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE execution_steps SET status = ?1, ended_at = ?2, duration_seconds = ?3,
                error_code = ?4, error_message = ?5
             WHERE id = ?6",
            params![
                status,
                chrono::Utc::now().to_rfc3339(),
                duration_seconds,
                error_code,
                error_message,
                step_id,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, ExecutorError> {
        let conn = self.lock()?;
        get_execution_locked(&conn, execution_id)
    }

    pub fn list_executions(
        &self,
        limit: usize,
        status: Option<&str>,
        verdict: Option<&str>,
        risk_level: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, ExecutorError> {
        let mut query = "SELECT * FROM executions WHERE 1=1".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(s) = status {
            query.push_str(" AND status = ?");
            args.push(Box::new(s.to_string()));
        }
        if let Some(v) = verdict {
            query.push_str(" AND verdict = ?");
            args.push(Box::new(v.to_string()));
        }
        if let Some(r) = risk_level {
            query.push_str(" AND risk_level = ?");
            args.push(Box::new(r.to_string()));
        }
        query.push_str(" ORDER BY started_at DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.lock()?;
        query_executions(&conn, &query, &args)
    }

    pub fn get_execution_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, ExecutorError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, execution_id, step_num, step_name, status, started_at, ended_at,
                        duration_seconds, error_code, error_message, log_ref
                 FROM execution_steps WHERE execution_id = ?1 ORDER BY step_num ASC",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(StepRecord {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    step_num: row.get(2)?,
                    step_name: row.get(3)?,
                    status: row.get(4)?,
                    started_at: row.get(5)?,
                    ended_at: row.get(6)?,
                    duration_seconds: row.get(7)?,
                    error_code: row.get(8)?,
                    error_message: row.get(9)?,
                    log_ref: row.get(10)?,
                })
            })
            .map_err(storage)?;
        rows.collect::<rusqlite::Result<_>>().map_err(storage)
    }

    pub fn get_statistics(&self) -> Result<ExecutionStatistics, ExecutorError> {
        let conn = self.lock()?;
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM executions", [], |r| r.get(0))
            .map_err(storage)?;

        let mut by_status = std::collections::BTreeMap::new();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage)?;
        for row in rows {
            let (status, count) = row.map_err(storage)?;
            by_status.insert(status, count);
        }

        let avg_duration: Option<f64> = conn
            .query_row(
                "SELECT AVG(duration_seconds) FROM executions WHERE duration_seconds IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .map_err(storage)?;

        let completed = by_status.get("completed").copied().unwrap_or(0);
        let failed = by_status.get("failed").copied().unwrap_or(0)
            + by_status.get("rolled_back").copied().unwrap_or(0);
        let success_rate_percent = if completed + failed > 0 {
            completed as f64 / (completed + failed) as f64 * 100.0
        } else {
            0.0
        };

        Ok(ExecutionStatistics {
            total_executions: total,
            by_status,
            avg_duration_seconds: avg_duration,
            success_rate_percent,
        })
    }

    /// Ancestors (root first), descendants (BFS, budget `depth * 10`) and
    /// siblings of an execution. Cycle-guarded with visited sets.
    pub fn get_execution_lineage(
        &self,
        execution_id: &str,
        depth: usize,
    ) -> Result<ExecutionLineage, ExecutorError> {
        let conn = self.lock()?;
        let Some(execution) = get_execution_locked(&conn, execution_id)? else {
            return Ok(ExecutionLineage {
                execution: None,
                ancestors: Vec::new(),
                descendants: Vec::new(),
                siblings: Vec::new(),
            });
        };

        let mut ancestors = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut current = execution.parent_execution_id.clone();
        while let Some(parent_id) = current {
            if ancestors.len() >= depth || !visited.insert(parent_id.clone()) {
                break;
            }
            match get_execution_locked(&conn, &parent_id)? {
                Some(parent) => {
                    current = parent.parent_execution_id.clone();
                    ancestors.push(parent);
                }
                None => break,
            }
        }
        ancestors.reverse();

        let mut descendants = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut queue = std::collections::VecDeque::from([execution.execution_id.clone()]);
        while let Some(current_id) = queue.pop_front() {
            if descendants.len() >= depth * 10 || !visited.insert(current_id.clone()) {
                continue;
            }
            let args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(current_id)];
            let children = query_executions(
                &conn,
                "SELECT * FROM executions WHERE parent_execution_id = ? ORDER BY started_at ASC",
                &args,
            )?;
            for child in children {
                queue.push_back(child.execution_id.clone());
                descendants.push(child);
                if descendants.len() >= depth * 10 {
                    break;
                }
            }
        }

        let siblings = if let Some(parent_id) = &execution.parent_execution_id {
            let args: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(parent_id.clone()),
                Box::new(execution.execution_id.clone()),
            ];
            query_executions(
                &conn,
                "SELECT * FROM executions WHERE parent_execution_id = ? AND execution_id != ? ORDER BY started_at ASC",
                &args,
            )?
        } else {
            Vec::new()
        };

        Ok(ExecutionLineage {
            execution: Some(execution),
            ancestors,
            descendants,
            siblings,
        })
    }

    pub fn list_executions_by_correlation(
        &self,
        correlation_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, ExecutorError> {
        let conn = self.lock()?;
        let args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(correlation_id.to_string()), Box::new(limit as i64)];
        query_executions(
            &conn,
            "SELECT * FROM executions WHERE correlation_id = ? ORDER BY started_at ASC LIMIT ?",
            &args,
        )
    }

    pub fn get_root_execution(
        &self,
        correlation_id: &str,
    ) -> Result<Option<ExecutionRecord>, ExecutorError> {
        let conn = self.lock()?;
        let args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(correlation_id.to_string())];
        let rows = query_executions(
            &conn,
            "SELECT * FROM executions WHERE correlation_id = ? AND parent_execution_id IS NULL ORDER BY started_at ASC LIMIT 1",
            &args,
        )?;
        Ok(rows.into_iter().next())
    }

    /// Similarity search for a stored execution. Candidates come from the path
    /// index when the target has paths; otherwise the most recent 1000 rows.
    pub fn find_similar_executions(
        &self,
        execution_id: &str,
        limit: usize,
        min_similarity: f64,
        exclude_same_correlation: bool,
    ) -> Result<Vec<(ExecutionRecord, SimilarityScore)>, ExecutorError> {
        let conn = self.lock()?;
        let Some(target) = get_execution_locked(&conn, execution_id)? else {
            return Ok(Vec::new());
        };
        let target_paths = paths_for_execution(&conn, execution_id, &target.affected_paths)?;

        let mut candidates: Vec<ExecutionRecord> = Vec::new();
        if !target_paths.is_empty() {
            let placeholders = vec!["?"; target_paths.len()].join(",");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = target_paths
                .iter()
                .map(|p| Box::new(p.clone()) as Box<dyn rusqlite::ToSql>)
                .collect();
            args.push(Box::new(execution_id.to_string()));
            let mut query = format!(
                "SELECT * FROM executions WHERE execution_id IN (
                    SELECT DISTINCT execution_id FROM execution_paths WHERE path IN ({placeholders})
                 ) AND execution_id != ?"
            );
            if exclude_same_correlation {
                if let Some(corr) = &target.correlation_id {
                    query.push_str(" AND (correlation_id IS NULL OR correlation_id != ?)");
                    args.push(Box::new(corr.clone()));
                }
            }
            candidates = query_executions(&conn, &query, &args)?;
        }

        if candidates.is_empty() {
            let mut query = "SELECT * FROM executions WHERE execution_id != ?".to_string();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(execution_id.to_string())];
            if exclude_same_correlation {
                if let Some(corr) = &target.correlation_id {
                    query.push_str(" AND (correlation_id IS NULL OR correlation_id != ?)");
                    args.push(Box::new(corr.clone()));
                }
            }
            query.push_str(" ORDER BY started_at DESC LIMIT 1000");
            candidates = query_executions(&conn, &query, &args)?;
        }

        let engine = SimilarityEngine::default();
        let mut scored: Vec<(ExecutionRecord, SimilarityScore)> = Vec::new();
        for candidate in candidates {
            let candidate_paths =
                paths_for_execution(&conn, &candidate.execution_id, &candidate.affected_paths)?;
            let score = engine.compute_similarity_score(
                target.error_message.as_deref(),
                &target_paths,
                &target.status,
                &target.verdict,
                &candidate.execution_id,
                candidate.error_message.as_deref(),
                &candidate_paths,
                &candidate.status,
                &candidate.verdict,
            );
            if score.total_score >= min_similarity {
                scored.push((candidate, score));
            }
        }
        scored.sort_by(|a, b| {
            b.1.total_score
                .partial_cmp(&a.1.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Error-text similarity against executions that have an error message.
    pub fn find_similar_by_error(
        &self,
        error_message: &str,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<(ExecutionRecord, f64)>, ExecutorError> {
        let conn = self.lock()?;
        let candidates = query_executions(
            &conn,
            "SELECT * FROM executions WHERE error_message IS NOT NULL ORDER BY started_at DESC LIMIT 1000",
            &[],
        )?;

        let engine = SimilarityEngine::default();
        let target_vec = engine.vectorizer.vectorize(error_message);
        let mut scored: Vec<(ExecutionRecord, f64)> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let error = candidate.error_message.clone()?;
                let sim = engine
                    .vectorizer
                    .cosine_similarity(&target_vec, &engine.vectorizer.vectorize(&error));
                (sim >= min_similarity).then_some((candidate, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Path-overlap similarity; prefers the path index as candidate source.
    pub fn find_similar_by_paths(
        &self,
        affected_paths: &[String],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<(ExecutionRecord, f64)>, ExecutorError> {
        let conn = self.lock()?;
        let mut candidates: Vec<ExecutionRecord> = Vec::new();
        if !affected_paths.is_empty() {
            let placeholders = vec!["?"; affected_paths.len()].join(",");
            let args: Vec<Box<dyn rusqlite::ToSql>> = affected_paths
                .iter()
                .map(|p| Box::new(p.clone()) as Box<dyn rusqlite::ToSql>)
                .collect();
            candidates = query_executions(
                &conn,
                &format!(
                    "SELECT * FROM executions WHERE execution_id IN (
                        SELECT DISTINCT execution_id FROM execution_paths WHERE path IN ({placeholders})
                     )"
                ),
                &args,
            )?;
        }
        if candidates.is_empty() {
            candidates = query_executions(
                &conn,
                "SELECT * FROM executions WHERE affected_paths IS NOT NULL AND affected_paths != '[]'
                 ORDER BY started_at DESC LIMIT 1000",
                &[],
            )?;
        }

        let mut scored: Vec<(ExecutionRecord, f64)> = Vec::new();
        for candidate in candidates {
            let candidate_paths =
                paths_for_execution(&conn, &candidate.execution_id, &candidate.affected_paths)?;
            if candidate_paths.is_empty() {
                continue;
            }
            let sim = PathSimilarity::jaccard_similarity(affected_paths, &candidate_paths);
            if sim >= min_similarity {
                scored.push((candidate, sim));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ExecutorError> {
        self.db
            .lock()
            .map_err(|_| ExecutorError::Storage("lock poisoned".to_string()))
    }
}

fn get_execution_locked(
    conn: &Connection,
    execution_id: &str,
) -> Result<Option<ExecutionRecord>, ExecutorError> {
    let mut stmt = conn
        .prepare("SELECT * FROM executions WHERE execution_id = ?1")
        .map_err(storage)?;
    let mut rows = stmt
        .query_map(params![execution_id], ExecutionRecord::from_row)
        .map_err(storage)?;
    match rows.next() {
        Some(row) => Ok(Some(row.map_err(storage)?)),
        None => Ok(None),
    }
}

fn query_executions(
    conn: &Connection,
    query: &str,
    args: &[Box<dyn rusqlite::ToSql>],
) -> Result<Vec<ExecutionRecord>, ExecutorError> {
    let mut stmt = conn.prepare(query).map_err(storage)?;
    let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params.as_slice(), ExecutionRecord::from_row)
        .map_err(storage)?;
    rows.collect::<rusqlite::Result<_>>().map_err(storage)
}

/// Paths from the index table, falling back to the record's JSON column.
fn paths_for_execution(
    conn: &Connection,
    execution_id: &str,
    fallback: &[String],
) -> Result<Vec<String>, ExecutorError> {
    let mut stmt = conn
        .prepare("SELECT path FROM execution_paths WHERE execution_id = ?1 ORDER BY path")
        .map_err(storage)?;
    let rows: Vec<String> = stmt
        .query_map(params![execution_id], |row| row.get(0))
        .map_err(storage)?
        .collect::<rusqlite::Result<_>>()
        .map_err(storage)?;
    if rows.is_empty() {
        Ok(fallback.to_vec())
    } else {
        Ok(rows)
    }
}

fn storage(e: rusqlite::Error) -> ExecutorError {
    ExecutorError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(store: &ExecutionStore, id: &str, paths: &[&str], graph: StartGraphFields) {
        store
            .record_execution_start(
                id,
                "plan_1",
                "cs_1",
                "dec_1",
                "checksum",
                "allow",
                "low",
                &paths.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                "/artifacts",
                graph,
            )
            .unwrap();
    }

    #[test]
    fn start_defaults_correlation_to_execution_id() {
        let store = ExecutionStore::in_memory();
        start(&store, "exec_root", &["src/a.rs"], StartGraphFields::default());

        let record = store.get_execution("exec_root").unwrap().unwrap();
        assert_eq!(record.correlation_id.as_deref(), Some("exec_root"));
        assert_eq!(record.status, "pending");
        assert_eq!(record.trigger_kind.as_deref(), Some("manual"));
        assert_eq!(record.affected_paths, vec!["src/a.rs"]);
    }

    #[test]
    fn end_updates_terminal_fields() {
        let store = ExecutionStore::in_memory();
        start(&store, "exec_1", &["src/a.rs"], StartGraphFields::default());
        store
            .record_execution_end("exec_1", "completed", 1.5, 1, true, true, false, None, None)
            .unwrap();

        let record = store.get_execution("exec_1").unwrap().unwrap();
        assert_eq!(record.status, "completed");
        assert_eq!(record.duration_seconds, Some(1.5));
        assert!(record.verification_passed);
        assert!(!record.rolled_back);
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn steps_are_ordered_and_timed() {
        let store = ExecutionStore::in_memory();
        start(&store, "exec_1", &[], StartGraphFields::default());
        let s1 = store
            .record_step_start("exec_1", 1, "validate", Some("steps/01_validate.log"))
            .unwrap();
        let s2 = store.record_step_start("exec_1", 2, "checksum", None).unwrap();
        store.record_step_end(s1, "completed", 0.1, None, None).unwrap();
        store
            .record_step_end(s2, "failed", 0.2, Some("CHECKSUM_FAILED"), Some("bad"))
            .unwrap();

        let steps = store.get_execution_steps("exec_1").unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_name, "validate");
        assert_eq!(steps[0].status, "completed");
        assert_eq!(steps[1].error_code.as_deref(), Some("CHECKSUM_FAILED"));
    }

    #[test]
    fn list_executions_filters() {
        let store = ExecutionStore::in_memory();
        start(&store, "exec_1", &[], StartGraphFields::default());
        start(&store, "exec_2", &[], StartGraphFields::default());
        store
            .record_execution_end("exec_1", "completed", 1.0, 0, true, true, false, None, None)
            .unwrap();
        store
            .record_execution_end("exec_2", "failed", 1.0, 0, false, false, true, Some("x"), None)
            .unwrap();

        assert_eq!(store.list_executions(10, None, None, None).unwrap().len(), 2);
        assert_eq!(
            store
                .list_executions(10, Some("failed"), None, None)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .list_executions(10, None, Some("allow"), Some("low"))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn statistics_histogram_and_success_rate() {
        let store = ExecutionStore::in_memory();
        for (id, status) in [("e1", "completed"), ("e2", "completed"), ("e3", "rolled_back")] {
            start(&store, id, &[], StartGraphFields::default());
            store
                .record_execution_end(id, status, 2.0, 0, true, true, false, None, None)
                .unwrap();
        }
        let stats = store.get_statistics().unwrap();
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.by_status.get("completed"), Some(&2));
        assert!((stats.success_rate_percent - 66.666).abs() < 0.1);
        assert_eq!(stats.avg_duration_seconds, Some(2.0));
    }

    #[test]
    fn lineage_walks_ancestors_descendants_siblings() {
        let store = ExecutionStore::in_memory();
        start(&store, "root", &[], StartGraphFields::default());
        start(
            &store,
            "child_a",
            &[],
            StartGraphFields {
                correlation_id: Some("root".to_string()),
                parent_execution_id: Some("root".to_string()),
                trigger_kind: Some("child".to_string()),
                ..Default::default()
            },
        );
        start(
            &store,
            "child_b",
            &[],
            StartGraphFields {
                correlation_id: Some("root".to_string()),
                parent_execution_id: Some("root".to_string()),
                trigger_kind: Some("retry".to_string()),
                ..Default::default()
            },
        );
        start(
            &store,
            "grandchild",
            &[],
            StartGraphFields {
                correlation_id: Some("root".to_string()),
                parent_execution_id: Some("child_a".to_string()),
                trigger_kind: Some("repair".to_string()),
                is_repair: true,
                repair_for_execution_id: Some("child_a".to_string()),
                ..Default::default()
            },
        );

        let lineage = store.get_execution_lineage("child_a", 20).unwrap();
        assert_eq!(lineage.ancestors.len(), 1);
        assert_eq!(lineage.ancestors[0].execution_id, "root");
        assert_eq!(lineage.descendants.len(), 1);
        assert_eq!(lineage.descendants[0].execution_id, "grandchild");
        assert!(lineage.descendants[0].is_repair);
        assert_eq!(lineage.siblings.len(), 1);
        assert_eq!(lineage.siblings[0].execution_id, "child_b");

        let chain = store.list_executions_by_correlation("root", 100).unwrap();
        assert_eq!(chain.len(), 4);
        let root = store.get_root_execution("root").unwrap().unwrap();
        assert_eq!(root.execution_id, "root");
    }

    #[test]
    fn lineage_survives_cycles() {
        let store = ExecutionStore::in_memory();
        start(&store, "a", &[], StartGraphFields::default());
        start(
            &store,
            "b",
            &[],
            StartGraphFields {
                parent_execution_id: Some("a".to_string()),
                ..Default::default()
            },
        );
        // Introduce a cycle a -> b -> a.
        {
            let conn = store.db.lock().unwrap();
            conn.execute(
                "UPDATE executions SET parent_execution_id = 'b' WHERE execution_id = 'a'",
                [],
            )
            .unwrap();
        }
        let lineage = store.get_execution_lineage("a", 20).unwrap();
        assert!(lineage.ancestors.len() <= 20);
        assert!(lineage.descendants.len() <= 200);
    }

    #[test]
    fn similarity_narrows_by_path_index_and_excludes_correlation() {
        let store = ExecutionStore::in_memory();
        start(&store, "target", &["src/a.rs"], StartGraphFields::default());
        store
            .record_execution_end("target", "failed", 1.0, 0, false, false, true, Some("checksum mismatch"), Some("checksum"))
            .unwrap();

        start(&store, "twin", &["src/a.rs"], StartGraphFields::default());
        store
            .record_execution_end("twin", "failed", 1.0, 0, false, false, true, Some("checksum mismatch"), Some("checksum"))
            .unwrap();

        start(
            &store,
            "same_corr",
            &["src/a.rs"],
            StartGraphFields {
                correlation_id: Some("target".to_string()),
                parent_execution_id: Some("target".to_string()),
                ..Default::default()
            },
        );
        store
            .record_execution_end("same_corr", "failed", 1.0, 0, false, false, true, Some("checksum mismatch"), None)
            .unwrap();

        let similar = store
            .find_similar_executions("target", 5, 0.3, true)
            .unwrap();
        let ids: Vec<&str> = similar.iter().map(|(r, _)| r.execution_id.as_str()).collect();
        assert!(ids.contains(&"twin"));
        assert!(!ids.contains(&"same_corr"));
        assert!(similar[0].1.total_score > 0.9);
    }

    #[test]
    fn find_similar_by_error_and_paths() {
        let store = ExecutionStore::in_memory();
        start(&store, "e1", &["src/x.rs"], StartGraphFields::default());
        store
            .record_execution_end("e1", "failed", 1.0, 0, false, false, true, Some("verification failed exit 1"), None)
            .unwrap();
        start(&store, "e2", &["docs/y.md"], StartGraphFields::default());
        store
            .record_execution_end("e2", "completed", 1.0, 1, true, true, false, None, None)
            .unwrap();

        let by_error = store
            .find_similar_by_error("verification failed exit 1", 5, 0.3)
            .unwrap();
        assert_eq!(by_error.len(), 1);
        assert_eq!(by_error[0].0.execution_id, "e1");

        let by_paths = store
            .find_similar_by_paths(&["src/x.rs".to_string()], 5, 0.3)
            .unwrap();
        assert_eq!(by_paths.len(), 1);
        assert_eq!(by_paths[0].0.execution_id, "e1");
        assert_eq!(by_paths[0].1, 1.0);
    }
}
