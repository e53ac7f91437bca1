//! Web backend error taxonomy.
//!
//! Blocked errors carry a `detail_code` distinguishing rate limits from
//! captcha walls; parse errors carry the structural reason and a serp probe
//! for diagnosis. Backends never let a transport error escape unclassified.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    /// Remote refused us: `http_403`, `http_429`, `captcha_required`,
    /// `captcha_cooldown`.
    #[error("blocked ({detail_code}): {message}")]
    Blocked {
        message: String,
        detail_code: String,
        serp_meta: Option<Value>,
    },
    /// Response arrived but could not be interpreted: `parse_failed`,
    /// `dom_mismatch`, `unknown_structure`.
    #[error("parse error ({reason}): {message}")]
    Parse {
        message: String,
        reason: String,
        serp_meta: Option<Value>,
    },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("network: {0}")]
    Network(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
}

impl WebError {
    pub fn blocked(message: impl Into<String>, detail_code: &str) -> Self {
        WebError::Blocked {
            message: message.into(),
            detail_code: detail_code.to_string(),
            serp_meta: None,
        }
    }

    pub fn blocked_with_meta(
        message: impl Into<String>,
        detail_code: &str,
        serp_meta: Value,
    ) -> Self {
        WebError::Blocked {
            message: message.into(),
            detail_code: detail_code.to_string(),
            serp_meta: Some(serp_meta),
        }
    }

    pub fn parse(message: impl Into<String>, reason: &str, serp_meta: Value) -> Self {
        WebError::Parse {
            message: message.into(),
            reason: reason.to_string(),
            serp_meta: Some(serp_meta),
        }
    }

    pub fn detail_code(&self) -> Option<&str> {
        match self {
            WebError::Blocked { detail_code, .. } => Some(detail_code),
            WebError::Parse { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
