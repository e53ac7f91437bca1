//! Environment configuration.
//!
//! Every knob has a default and clamps invalid input instead of failing:
//! a service must come up with a usable configuration even when the
//! environment is garbage. `.env` is loaded once per process; existing
//! process environment always wins.

use std::sync::Once;

use tracing::warn;

static LOAD_ENV: Once = Once::new();

/// Load `.env` into the process environment (existing env wins). Idempotent.
pub fn load_env() {
    LOAD_ENV.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Web search backends the worker knows how to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebSearchBackend {
    Stub,
    DdgHtml,
    Searxng,
    BaiduHtml,
}

impl WebSearchBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebSearchBackend::Stub => "stub",
            WebSearchBackend::DdgHtml => "ddg_html",
            WebSearchBackend::Searxng => "searxng",
            WebSearchBackend::BaiduHtml => "baidu_html",
        }
    }
}

/// `WEB_SEARCH_BACKEND`; unknown values warn and fall back to the stub.
pub fn web_search_backend() -> WebSearchBackend {
    match env_str("WEB_SEARCH_BACKEND").as_deref() {
        None | Some("stub") => WebSearchBackend::Stub,
        Some("ddg_html") => WebSearchBackend::DdgHtml,
        Some("searxng") => WebSearchBackend::Searxng,
        Some("baidu_html") => WebSearchBackend::BaiduHtml,
        Some(other) => {
            warn!(backend = other, "unknown WEB_SEARCH_BACKEND, falling back to stub");
            WebSearchBackend::Stub
        }
    }
}

/// `WEB_SEARCH_TIMEOUT_MS`, default 15000, clamped to >= 1000.
pub fn web_search_timeout_ms() -> u64 {
    env_ms("WEB_SEARCH_TIMEOUT_MS", 15_000)
}

/// `WEB_FETCH_TIMEOUT_MS`, default 15000, clamped to >= 1000.
pub fn web_fetch_timeout_ms() -> u64 {
    env_ms("WEB_FETCH_TIMEOUT_MS", 15_000)
}

/// `SEARXNG_BASE_URL` (no default).
pub fn searxng_base_url() -> Option<String> {
    env_str("SEARXNG_BASE_URL")
}

/// `SEARXNG_TIMEOUT_MS`, default 15000, clamped to >= 1000.
pub fn searxng_timeout_ms() -> u64 {
    env_ms("SEARXNG_TIMEOUT_MS", 15_000)
}

/// `AGENT_LOOP_ENABLED`: "1"/"true"/"yes" (case-insensitive) enable.
pub fn agent_loop_enabled() -> bool {
    env_flag("AGENT_LOOP_ENABLED", false)
}

pub const DEFAULT_ALLOWED_RUN_TYPES: &[&str] =
    &["research_report", "summarize_conversation", "run_code_snippet"];

/// `AGENT_ALLOWED_RUN_TYPES`: comma-separated whitelist; empty entries are
/// dropped; unset falls back to the default set.
pub fn agent_allowed_run_types() -> Vec<String> {
    match env_str("AGENT_ALLOWED_RUN_TYPES") {
        Some(raw) => {
            let types: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if types.is_empty() {
                DEFAULT_ALLOWED_RUN_TYPES.iter().map(|s| s.to_string()).collect()
            } else {
                types
            }
        }
        None => DEFAULT_ALLOWED_RUN_TYPES.iter().map(|s| s.to_string()).collect(),
    }
}

/// `AGENT_DECISION_TIMEOUT_SECONDS`, default 30, clamped to >= 1.
pub fn agent_decision_timeout_seconds() -> u64 {
    match env_str("AGENT_DECISION_TIMEOUT_SECONDS").and_then(|s| s.parse::<u64>().ok()) {
        Some(v) if v >= 1 => v,
        Some(_) => {
            warn!("AGENT_DECISION_TIMEOUT_SECONDS below minimum, using 1");
            1
        }
        None => 30,
    }
}

/// `MEMORY_AUTO_ACCEPT`: "1" enables.
pub fn memory_auto_accept() -> bool {
    env_flag("MEMORY_AUTO_ACCEPT", false)
}

/// `MEMORY_AUTO_ACCEPT_MIN_CONF`, default 0.85, clamped to [0, 1].
pub fn memory_auto_accept_min_conf() -> f64 {
    match env_str("MEMORY_AUTO_ACCEPT_MIN_CONF").and_then(|s| s.parse::<f64>().ok()) {
        Some(v) if (0.0..=1.0).contains(&v) => v,
        Some(_) => {
            warn!("MEMORY_AUTO_ACCEPT_MIN_CONF out of range, using 0.85");
            0.85
        }
        None => 0.85,
    }
}

/// Single MCP server fallback from `MCP_SERVER_CMD` + optional
/// `MCP_SERVER_ARGS_JSON` / `MCP_SERVER_ARGS` / `MCP_SERVER_CWD` /
/// `MCP_SERVER_NAME`.
#[derive(Clone, Debug, PartialEq)]
pub struct McpSingleServer {
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
}

pub fn mcp_single_server() -> Option<McpSingleServer> {
    let cmd = env_str("MCP_SERVER_CMD")?;
    let mut full_cmd = vec![cmd];

    if let Some(args_json) = env_str("MCP_SERVER_ARGS_JSON") {
        match serde_json::from_str::<Vec<String>>(&args_json) {
            Ok(args) => full_cmd.extend(args),
            Err(e) => warn!(error = %e, "MCP_SERVER_ARGS_JSON invalid, ignoring"),
        }
    } else if let Some(args) = env_str("MCP_SERVER_ARGS") {
        full_cmd.extend(args.split_whitespace().map(str::to_string));
    }

    Some(McpSingleServer {
        name: env_str("MCP_SERVER_NAME").unwrap_or_else(|| "srv".to_string()),
        cmd: full_cmd,
        cwd: env_str("MCP_SERVER_CWD"),
    })
}

/// Raw `MCP_SERVERS_JSON` (the catalog parses it permissively).
pub fn mcp_servers_json_raw() -> Option<String> {
    env_str("MCP_SERVERS_JSON")
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_ms(key: &str, default: u64) -> u64 {
    match env_str(key).and_then(|s| s.parse::<u64>().ok()) {
        Some(v) if v >= 1000 => v,
        Some(_) => {
            warn!(key, "timeout below 1000ms, clamping");
            1000
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each test uses its own keys via a
    // helper that restores the previous value.
    fn with_var<T>(key: &str, value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let prev = std::env::var(key).ok();
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
        let out = f();
        match prev {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
        out
    }

    #[test]
    fn backend_defaults_and_unknown_fallback() {
        with_var("WEB_SEARCH_BACKEND", None, || {
            assert_eq!(web_search_backend(), WebSearchBackend::Stub);
        });
        with_var("WEB_SEARCH_BACKEND", Some("baidu_html"), || {
            assert_eq!(web_search_backend(), WebSearchBackend::BaiduHtml);
        });
        with_var("WEB_SEARCH_BACKEND", Some("nonsense"), || {
            assert_eq!(web_search_backend(), WebSearchBackend::Stub);
        });
    }

    #[test]
    fn timeout_clamps_to_minimum() {
        with_var("WEB_SEARCH_TIMEOUT_MS", Some("10"), || {
            assert_eq!(web_search_timeout_ms(), 1000);
        });
        with_var("WEB_SEARCH_TIMEOUT_MS", Some("not-a-number"), || {
            assert_eq!(web_search_timeout_ms(), 15_000);
        });
        with_var("WEB_SEARCH_TIMEOUT_MS", None, || {
            assert_eq!(web_search_timeout_ms(), 15_000);
        });
    }

    #[test]
    fn run_types_parse_and_default() {
        with_var("AGENT_ALLOWED_RUN_TYPES", Some("a, b ,,c"), || {
            assert_eq!(agent_allowed_run_types(), vec!["a", "b", "c"]);
        });
        with_var("AGENT_ALLOWED_RUN_TYPES", None, || {
            assert_eq!(
                agent_allowed_run_types(),
                DEFAULT_ALLOWED_RUN_TYPES
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            );
        });
    }

    #[test]
    fn agent_loop_flag_parsing() {
        with_var("AGENT_LOOP_ENABLED", Some("1"), || assert!(agent_loop_enabled()));
        with_var("AGENT_LOOP_ENABLED", Some("false"), || {
            assert!(!agent_loop_enabled())
        });
        with_var("AGENT_LOOP_ENABLED", None, || assert!(!agent_loop_enabled()));
    }

    #[test]
    fn auto_accept_confidence_bounds() {
        with_var("MEMORY_AUTO_ACCEPT_MIN_CONF", Some("0.5"), || {
            assert_eq!(memory_auto_accept_min_conf(), 0.5);
        });
        with_var("MEMORY_AUTO_ACCEPT_MIN_CONF", Some("7"), || {
            assert_eq!(memory_auto_accept_min_conf(), 0.85);
        });
    }

    #[test]
    fn mcp_single_server_composes_cmd() {
        with_var("MCP_SERVER_CMD", Some("npx"), || {
            with_var("MCP_SERVER_ARGS_JSON", Some("[\"-y\", \"server\"]"), || {
                let server = mcp_single_server().unwrap();
                assert_eq!(server.cmd, vec!["npx", "-y", "server"]);
                assert_eq!(server.name, "srv");
            })
        });
        with_var("MCP_SERVER_CMD", None, || {
            assert!(mcp_single_server().is_none());
        });
    }
}
