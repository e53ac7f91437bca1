//! Offline reflection analysis over the execution store.
//!
//! Produces failure attribution (top error steps, heuristic error codes,
//! failure durations, risk histogram) and WriteGate feedback signals
//! (false-allow rate, manual-review false-deny placeholder).
//!
//! Exit codes: 0 success, 1 when the false-allow rate exceeds 10% or on a
//! runtime error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rusqlite::Connection;
use serde_json::json;

const FALSE_ALLOW_THRESHOLD: f64 = 0.10;

#[derive(Parser)]
#[command(name = "reflection", about = "Failure attribution and WriteGate feedback")]
struct Args {
    /// Workspace root containing .lonelycat/executor.db
    #[arg(long)]
    workspace: PathBuf,

    /// How many recent failed executions to analyze
    #[arg(long, default_value_t = 100)]
    failed_limit: usize,

    /// Write the JSON report to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(exceeded) => {
            if exceeded {
                eprintln!("false-allow rate exceeds {:.0}%", FALSE_ALLOW_THRESHOLD * 100.0);
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("reflection analysis failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let db_path = args.workspace.join(".lonelycat").join("executor.db");
    let conn = Connection::open(&db_path)?;

    let failures = load_failures(&conn, args.failed_limit)?;

    let mut error_steps: BTreeMap<String, usize> = BTreeMap::new();
    let mut error_codes: BTreeMap<String, usize> = BTreeMap::new();
    let mut risk_histogram: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_duration = 0.0;
    let mut durations = 0usize;

    for failure in &failures {
        if let Some(step) = &failure.error_step {
            *error_steps.entry(step.clone()).or_default() += 1;
        }
        if let Some(code) = failure.error_message.as_deref().and_then(heuristic_error_code) {
            *error_codes.entry(code).or_default() += 1;
        }
        let risk = failure.risk_level.clone().unwrap_or_else(|| "unknown".to_string());
        *risk_histogram.entry(risk).or_default() += 1;
        if let Some(d) = failure.duration_seconds {
            total_duration += d;
            durations += 1;
        }
    }

    let avg_failure_duration = (durations > 0).then(|| total_duration / durations as f64);

    // WriteGate feedback: allowed executions that still failed or rolled back.
    let allowed_total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM executions WHERE verdict = 'allow'",
        [],
        |r| r.get(0),
    )?;
    let false_allow: i64 = conn.query_row(
        "SELECT COUNT(*) FROM executions WHERE verdict = 'allow' AND status IN ('failed', 'rolled_back')",
        [],
        |r| r.get(0),
    )?;
    let false_allow_rate = if allowed_total > 0 {
        false_allow as f64 / allowed_total as f64
    } else {
        0.0
    };

    let report = json!({
        "failures_analyzed": failures.len(),
        "top_error_steps": rank(&error_steps),
        "top_error_codes": rank(&error_codes),
        "avg_failure_duration_seconds": avg_failure_duration,
        "failures_by_risk_level": risk_histogram,
        "writegate_feedback": {
            "false_allow_count": false_allow,
            "allowed_total": allowed_total,
            "false_allow_rate": false_allow_rate,
            // Manual review placeholder: denied plans that might have been safe.
            "potential_false_deny": serde_json::Value::Array(vec![]),
        },
    });

    let rendered = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => std::fs::write(path, rendered)?,
        None => println!("{rendered}"),
    }

    Ok(false_allow_rate > FALSE_ALLOW_THRESHOLD)
}

struct FailureRow {
    error_step: Option<String>,
    error_message: Option<String>,
    risk_level: Option<String>,
    duration_seconds: Option<f64>,
}

fn load_failures(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<FailureRow>> {
    let mut stmt = conn.prepare(
        "SELECT error_step, error_message, risk_level, duration_seconds
         FROM executions
         WHERE status IN ('failed', 'rolled_back')
         ORDER BY started_at DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok(FailureRow {
            error_step: row.get(0)?,
            error_message: row.get(1)?,
            risk_level: row.get(2)?,
            duration_seconds: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// First `[BRACKETED]` token, else the first word.
fn heuristic_error_code(message: &str) -> Option<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(start) = trimmed.find('[') {
        if let Some(end) = trimmed[start..].find(']') {
            let token = &trimmed[start + 1..start + end];
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    trimmed.split_whitespace().next().map(str::to_string)
}

fn rank(counts: &BTreeMap<String, usize>) -> Vec<serde_json::Value> {
    let mut entries: Vec<(&String, &usize)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .take(10)
        .map(|(name, count)| json!({"name": name, "count": count}))
        .collect()
}
