//! Pluggable web search backends and their shared error taxonomy.

pub mod backend;
pub mod baidu_html;
pub mod baidu_parser;
pub mod errors;

pub use backend::{
    build_search_backend_from_env, HttpResponse, HttpTransport, ReqwestTransport, SearchBackend,
    SearchResult, StubSearchBackend, TransportError,
};
pub use baidu_html::BaiduHtmlSearchBackend;
pub use errors::WebError;
