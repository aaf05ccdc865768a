//! Error taxonomy for the pipeline engine.
//!
//! Every variant maps to exactly one HTTP status code (see
//! [`ConstellationError::http_status`]) and to one JSON `kind` tag used in
//! API error bodies.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, ConstellationError>;

/// A single line/column-tagged compile diagnostic.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CompileMessage {
    pub line: u32,
    pub col: u32,
    pub msg: String,
}

/// Errors produced anywhere in the engine.
///
/// Every variant corresponds to a row of the error taxonomy table. The
/// `kind()` method returns the user-visible tag used in JSON responses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConstellationError {
    /// Parse/type error raised by the pipeline compiler.
    #[error("compile error: {}", .messages.iter().map(|m| m.msg.as_str()).collect::<Vec<_>>().join("; "))]
    CompileError { messages: Vec<CompileMessage> },

    /// Required pipeline input not provided and suspension not permitted.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Provided value's type does not match the declared type.
    #[error("type mismatch for `{name}`: expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Resume supplied an input already present in `providedInputs`.
    #[error("input already provided: {0}")]
    AlreadyProvided(String),

    /// Resume supplied an input that isn't in `missingInputs`.
    #[error("unknown input: {0}")]
    UnknownInput(String),

    /// Resume supplied a node value that's already computed.
    #[error("node already resolved: {0}")]
    AlreadyResolved(String),

    /// Pipeline name or hash could not be resolved.
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Suspension handle is unknown (never existed, or TTL-evicted).
    #[error("suspension not found: {0}")]
    SuspensionNotFound(String),

    /// Another resume is already in flight for this handle.
    #[error("resume already in progress for {0}")]
    ResumeInProgress(String),

    /// The structural hash a suspension was created against is gone.
    #[error("pipeline changed since suspension: {0}")]
    PipelineChanged(String),

    /// A module raised an error during invocation.
    #[error("module `{node_id}` failed: {cause}")]
    ModuleFailure { node_id: String, cause: String },

    /// Execution exceeded its deadline.
    #[error("execution timed out")]
    Timeout,

    /// Execution was explicitly cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// The DAG graph is not acyclic, or an `InputRef` does not resolve.
    #[error("invalid dag: {0}")]
    InvalidDag(String),

    /// A request body failed validation (e.g. a malformed `CanaryConfig`).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Rate limiter denied the request.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Credentials valid but role insufficient.
    #[error("forbidden")]
    Forbidden,

    /// Catch-all for everything else. The display value is sanitized
    /// before being placed in an HTTP body (see [`sanitize`]).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConstellationError {
    /// The user-visible `kind` tag used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CompileError { .. } => "CompileError",
            Self::MissingInput(_) => "MissingInput",
            Self::TypeMismatch { .. } => "TypeMismatch",
            Self::AlreadyProvided(_) => "AlreadyProvided",
            Self::UnknownInput(_) => "UnknownInput",
            Self::AlreadyResolved(_) => "AlreadyResolved",
            Self::PipelineNotFound(_) => "PipelineNotFound",
            Self::SuspensionNotFound(_) => "SuspensionNotFound",
            Self::ResumeInProgress(_) => "ResumeInProgress",
            Self::PipelineChanged(_) => "PipelineChanged",
            Self::ModuleFailure { .. } => "ModuleFailure",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::InvalidDag(_) => "InvalidDag",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::RateLimited { .. } => "RateLimited",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status code this error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::CompileError { .. }
            | Self::MissingInput(_)
            | Self::TypeMismatch { .. }
            | Self::AlreadyProvided(_)
            | Self::UnknownInput(_)
            | Self::AlreadyResolved(_)
            | Self::PipelineChanged(_)
            | Self::InvalidDag(_)
            | Self::InvalidRequest(_) => 400,
            Self::PipelineNotFound(_) | Self::SuspensionNotFound(_) => 404,
            Self::ResumeInProgress(_) => 409,
            Self::ModuleFailure { .. } | Self::Internal(_) => 500,
            Self::Timeout => 504,
            Self::Cancelled => 499,
            Self::RateLimited { .. } => 429,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
        }
    }

    /// Sanitized message safe to place in an HTTP response body: redacts
    /// bearer tokens, `sk-...`-shaped keys, and `password=...` fragments.
    pub fn sanitized_message(&self) -> String {
        sanitize(&self.to_string())
    }
}

/// Redact secrets from an arbitrary error/log message before it's exposed.
///
/// Matches `Authorization: Bearer <token>`, `sk-[A-Za-z0-9_-]+`-shaped API
/// keys, and `password=...` query-string-style fragments.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    loop {
        if let Some(pos) = rest.find("Bearer ") {
            out.push_str(&rest[..pos]);
            out.push_str("Bearer [REDACTED]");
            let after = &rest[pos + "Bearer ".len()..];
            let skip = after
                .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
                .unwrap_or(after.len());
            rest = &after[skip..];
            continue;
        }
        break;
    }
    out.push_str(rest);

    redact_pattern(&redact_pattern(&out, "sk-", "[REDACTED]"), "password=", "password=[REDACTED]")
}

fn redact_pattern(input: &str, prefix: &str, replacement: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(prefix) {
        result.push_str(&rest[..pos]);
        result.push_str(replacement);
        let after = &rest[pos + prefix.len()..];
        let skip = after
            .find(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == '&')
            .unwrap_or(after.len());
        rest = &after[skip..];
    }
    result.push_str(rest);
    result
}

impl From<serde_json::Error> for ConstellationError {
    fn from(err: serde_json::Error) -> Self {
        ConstellationError::Internal(format!("serialization error: {err}"))
    }
}

impl From<std::io::Error> for ConstellationError {
    fn from(err: std::io::Error) -> Self {
        ConstellationError::Internal(format!("io error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ConstellationError::Unauthorized.http_status(), 401);
        assert_eq!(ConstellationError::Forbidden.http_status(), 403);
        assert_eq!(ConstellationError::Timeout.http_status(), 504);
        assert_eq!(ConstellationError::Cancelled.http_status(), 499);
        assert_eq!(
            ConstellationError::RateLimited { retry_after_secs: 1 }.http_status(),
            429
        );
        assert_eq!(
            ConstellationError::ResumeInProgress("h".into()).http_status(),
            409
        );
    }

    #[test]
    fn kind_tags_match_taxonomy() {
        assert_eq!(ConstellationError::MissingInput("a".into()).kind(), "MissingInput");
        assert_eq!(
            ConstellationError::TypeMismatch {
                name: "a".into(),
                expected: "Int64".into(),
                actual: "String".into()
            }
            .kind(),
            "TypeMismatch"
        );
    }

    #[test]
    fn sanitize_redacts_bearer_token() {
        let msg = sanitize("failed request with Authorization: Bearer abc123secret more text");
        assert!(!msg.contains("abc123secret"));
        assert!(msg.contains("[REDACTED]"));
    }

    #[test]
    fn sanitize_redacts_sk_keys() {
        let msg = sanitize("key sk-abcdef1234567890 leaked");
        assert!(!msg.contains("abcdef1234567890"));
    }

    #[test]
    fn sanitize_redacts_password_fragment() {
        let msg = sanitize("connection string password=hunter2&host=db");
        assert!(!msg.contains("hunter2"));
        assert!(msg.contains("host=db"));
    }

    #[test]
    fn sanitize_passthrough_when_no_secret() {
        let msg = sanitize("plain error with no secrets");
        assert_eq!(msg, "plain error with no secrets");
    }
}
