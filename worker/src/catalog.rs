//! Tool catalog: multi-provider resolution with capability metadata.
//!
//! Capability levels: L0 read-only, L1 writes files, L2 executes code or
//! reaches the network. Providers are iterated in `preferred_provider_order`
//! and the first one listing a name wins; `list_tools` deduplicates under the
//! same order. `MCP_SERVERS_JSON` is parsed permissively: a bad document or a
//! bad entry warns and is skipped, it never takes the worker down.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

pub const CAPABILITY_L0: &str = "L0";
pub const CAPABILITY_L1: &str = "L1";
pub const CAPABILITY_L2: &str = "L2";

static MCP_SERVER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("server name regex"));

const MCP_SERVERS_JSON_RAW_TRUNCATE: usize = 200;

#[derive(Clone, Debug)]
pub struct ToolMeta {
    pub name: String,
    pub input_schema: Value,
    pub side_effects: bool,
    /// "read_only" | "write"
    pub risk_level: String,
    pub capability_level: String,
    pub requires_confirm: bool,
    pub timeout_ms: Option<u64>,
    pub provider_id: String,
}

impl ToolMeta {
    pub fn read_only(name: &str, input_schema: Value, provider_id: &str, timeout_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            input_schema,
            side_effects: false,
            risk_level: "read_only".to_string(),
            capability_level: CAPABILITY_L0.to_string(),
            requires_confirm: false,
            timeout_ms: Some(timeout_ms),
            provider_id: provider_id.to_string(),
        }
    }
}

/// A source of tools. Implementations include the builtin set, stubs, and MCP
/// bridges living outside this crate.
pub trait ToolProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn list_tools(&self) -> Vec<ToolMeta>;
    /// Best-effort shutdown; must be safe to call more than once.
    fn close(&self) {}
}

/// Builtin tools every worker carries.
pub struct BuiltinProvider {
    provider_id: String,
}

impl BuiltinProvider {
    pub fn new() -> Self {
        Self {
            provider_id: "builtin".to_string(),
        }
    }
}

impl Default for BuiltinProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolProvider for BuiltinProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn list_tools(&self) -> Vec<ToolMeta> {
        vec![
            ToolMeta::read_only(
                "web.search",
                json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
                &self.provider_id,
                30_000,
            ),
            ToolMeta::read_only(
                "web.fetch",
                json!({"type": "object", "properties": {"urls": {"type": "array", "items": {"type": "string"}}}, "required": ["urls"]}),
                &self.provider_id,
                30_000,
            ),
            ToolMeta::read_only(
                "text.summarize",
                json!({"type": "object", "properties": {"text": {"type": "string"}, "max_length": {"type": "integer"}}, "required": ["text"]}),
                &self.provider_id,
                60_000,
            ),
        ]
    }
}

/// Empty provider used when a configured backend cannot be built.
pub struct StubProvider;

impl ToolProvider for StubProvider {
    fn provider_id(&self) -> &str {
        "stub"
    }

    fn list_tools(&self) -> Vec<ToolMeta> {
        Vec::new()
    }
}

pub struct ToolCatalog {
    providers: HashMap<String, Box<dyn ToolProvider>>,
    preferred_provider_order: Vec<String>,
}

impl ToolCatalog {
    pub fn new(preferred_provider_order: Option<Vec<String>>) -> Self {
        Self {
            providers: HashMap::new(),
            preferred_provider_order: preferred_provider_order
                .unwrap_or_else(|| vec!["builtin".to_string(), "stub".to_string()]),
        }
    }

    pub fn register_provider(&mut self, provider: Box<dyn ToolProvider>) {
        let id = provider.provider_id().to_string();
        if !self.preferred_provider_order.contains(&id) {
            self.preferred_provider_order.push(id.clone());
        }
        self.providers.insert(id, provider);
    }

    pub fn set_preferred_provider_order(&mut self, order: Vec<String>) {
        self.preferred_provider_order = order;
    }

    pub fn get_provider(&self, provider_id: &str) -> Option<&dyn ToolProvider> {
        self.providers.get(provider_id).map(Box::as_ref)
    }

    /// First provider in preferred order that lists the name.
    pub fn get(&self, name: &str) -> Option<ToolMeta> {
        for provider_id in &self.preferred_provider_order {
            let Some(provider) = self.providers.get(provider_id) else {
                continue;
            };
            if let Some(meta) = provider.list_tools().into_iter().find(|m| m.name == name) {
                return Some(meta);
            }
        }
        None
    }

    /// All tools, deduplicated by name under the preferred order.
    pub fn list_tools(&self) -> Vec<ToolMeta> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for provider_id in &self.preferred_provider_order {
            let Some(provider) = self.providers.get(provider_id) else {
                continue;
            };
            for meta in provider.list_tools() {
                if seen.insert(meta.name.clone()) {
                    out.push(meta);
                }
            }
        }
        out
    }

    /// Close every provider, swallowing failures. Safe to call repeatedly;
    /// wired to worker shutdown.
    pub fn close_providers(&self) {
        for provider in self.providers.values() {
            provider.close();
        }
    }
}

/// One MCP server entry parsed from the environment.
#[derive(Clone, Debug, PartialEq)]
pub struct McpServerSpec {
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
}

/// Parse `MCP_SERVERS_JSON`. Unset returns `None`; invalid JSON warns and
/// returns `None`; a valid list yields the surviving entries (possibly empty).
/// Bad entries are skipped with a warning: name must match `^[a-z0-9_]+$`,
/// `cmd` must be a non-empty list or string, duplicates keep the first.
pub fn parse_mcp_servers_json(raw: Option<&str>) -> Option<Vec<McpServerSpec>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    let data: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            let preview: String = raw.chars().take(MCP_SERVERS_JSON_RAW_TRUNCATE).collect();
            warn!(error = %e, raw = %preview, "MCP_SERVERS_JSON invalid JSON, ignoring");
            return None;
        }
    };
    let Some(list) = data.as_array() else {
        warn!("MCP_SERVERS_JSON root is not a list, ignoring");
        return None;
    };

    let mut out = Vec::new();
    let mut seen_names = HashSet::new();
    for item in list {
        let Some(map) = item.as_object() else { continue };
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("srv")
            .to_string();
        if !MCP_SERVER_NAME.is_match(&name) {
            warn!(name = %name, "MCP server name invalid (allowed [a-z0-9_]+), skipping");
            continue;
        }
        if !seen_names.insert(name.clone()) {
            warn!(name = %name, "duplicate MCP server name, skipping");
            continue;
        }

        let cmd: Vec<String> = match map.get("cmd") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            Some(_) => {
                warn!(name = %name, "MCP server cmd must be a list or string, skipping");
                continue;
            }
            None => {
                warn!(name = %name, "MCP server missing cmd, skipping");
                continue;
            }
        };
        if cmd.is_empty() {
            warn!(name = %name, "MCP server cmd empty, skipping");
            continue;
        }

        let cwd = map.get("cwd").and_then(Value::as_str).map(str::to_string);
        let env = map
            .get("env")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        out.push(McpServerSpec { name, cmd, cwd, env });
    }
    Some(out)
}

/// Server specs from the environment: the multi-server JSON when present,
/// else the single-server fallback variables.
pub fn mcp_servers_from_env() -> Vec<McpServerSpec> {
    if let Some(specs) = parse_mcp_servers_json(config::mcp_servers_json_raw().as_deref()) {
        return specs;
    }
    match config::mcp_single_server() {
        Some(single) => vec![McpServerSpec {
            name: single.name,
            cmd: single.cmd,
            cwd: single.cwd,
            env: HashMap::new(),
        }],
        None => Vec::new(),
    }
}
