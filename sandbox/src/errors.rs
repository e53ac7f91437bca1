//! Sandbox error taxonomy, mapped at the HTTP boundary to 403/400/500.

use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("sandbox runtime: {0}")]
    Runtime(String),
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::PolicyDenied(_) => "POLICY_DENIED",
            SandboxError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SandboxError::Runtime(_) => "RUNTIME_ERROR",
        }
    }

    /// Structured payload for the API and the exec record's `error_reason`.
    pub fn to_reason(&self) -> serde_json::Value {
        let message = match self {
            SandboxError::PolicyDenied(m)
            | SandboxError::InvalidArgument(m)
            | SandboxError::Runtime(m) => m,
        };
        json!({"code": self.code(), "message": message})
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Runtime(e.to_string())
    }
}
