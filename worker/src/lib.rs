//! Worker-side tooling: search backends the run handlers call into, and the
//! catalog that describes every tool's capability surface.

pub mod catalog;
pub mod web;

pub use catalog::{
    mcp_servers_from_env, parse_mcp_servers_json, BuiltinProvider, McpServerSpec, StubProvider,
    ToolCatalog, ToolMeta, ToolProvider, CAPABILITY_L0, CAPABILITY_L1, CAPABILITY_L2,
};
pub use web::{
    build_search_backend_from_env, BaiduHtmlSearchBackend, SearchBackend, SearchResult,
    StubSearchBackend, WebError,
};
