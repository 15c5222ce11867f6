use std::path::PathBuf;

/// Errors that can occur across the Lumen crates.
///
/// Lower layers return distinguishable kinds; the manager and query layers
/// log them with context and pass them through unchanged. The binary crate
/// renders them through `miette`.
///
/// # Examples
///
/// ```
/// use lumen_core::LumenError;
///
/// let err = LumenError::Config("missing API key".into());
/// assert!(err.to_string().contains("missing API key"));
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum LumenError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(code(lumen::config))]
    Config(String),

    /// Caller supplied arguments that violate an operation's contract.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Non-retryable failure reported by the embedding API.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Non-retryable failure reported by the LLM API.
    #[error("LLM error: {0}")]
    Llm(String),

    /// The remote API rejected the credentials.
    #[error("{service} rejected the credentials: {message}")]
    #[diagnostic(
        code(lumen::auth),
        help("check the api_key in .lumen.toml or the provider's API key env var")
    )]
    Auth {
        /// Which API raised the error (`"embedding"` or `"llm"`).
        service: String,
        /// Provider message.
        message: String,
    },

    /// The account behind the credentials has no quota left.
    #[error("{service} quota exhausted: {message}")]
    #[diagnostic(code(lumen::quota))]
    QuotaExceeded {
        /// Which API raised the error.
        service: String,
        /// Provider message.
        message: String,
    },

    /// The remote API is throttling requests.
    #[error("{service} rate limited: {message}")]
    RateLimited {
        /// Which API raised the error.
        service: String,
        /// Provider message.
        message: String,
    },

    /// The remote API answered with a server-side failure (5xx).
    #[error("{service} unavailable: {message}")]
    Unavailable {
        /// Which API raised the error.
        service: String,
        /// Provider message.
        message: String,
    },

    /// The request never completed (connect, timeout, broken stream).
    #[error("{service} network error: {message}")]
    Network {
        /// Which API raised the error.
        service: String,
        /// Transport message.
        message: String,
    },

    /// The remote API answered with something that cannot be used.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A vector's length does not match the store's dimension.
    #[error("dimension mismatch: store expects {expected}, got {actual}")]
    #[diagnostic(
        code(lumen::dimension),
        help("the embedding model and the vector store must agree on the dimension")
    )]
    DimensionMismatch {
        /// Dimension configured for the store.
        expected: usize,
        /// Dimension of the rejected vector.
        actual: usize,
    },

    /// Vector store backend failure.
    #[error("store error: {0}")]
    Database(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl LumenError {
    /// Whether retrying the same request may succeed.
    ///
    /// Only throttling, server-side failures, and transport failures are
    /// transient. Credential, quota, and malformed-response errors are not.
    ///
    /// # Examples
    ///
    /// ```
    /// use lumen_core::LumenError;
    ///
    /// let throttled = LumenError::RateLimited {
    ///     service: "embedding".into(),
    ///     message: "slow down".into(),
    /// };
    /// assert!(throttled.is_retryable());
    ///
    /// let denied = LumenError::Auth {
    ///     service: "embedding".into(),
    ///     message: "bad key".into(),
    /// };
    /// assert!(!denied.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Network { .. }
        )
    }

    /// Classify a non-success HTTP status from `service` into an error kind.
    ///
    /// # Examples
    ///
    /// ```
    /// use lumen_core::LumenError;
    ///
    /// let err = LumenError::from_status("llm", 401, "invalid api key");
    /// assert!(matches!(err, LumenError::Auth { .. }));
    ///
    /// let err = LumenError::from_status("llm", 503, "overloaded");
    /// assert!(err.is_retryable());
    /// ```
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        let service = service.to_string();
        let message = format!("HTTP {status}: {}", body.trim());
        match status {
            401 | 403 => Self::Auth { service, message },
            429 if body.contains("insufficient_quota") => Self::QuotaExceeded { service, message },
            429 => Self::RateLimited { service, message },
            500..=599 => Self::Unavailable { service, message },
            _ if service == "llm" => Self::Llm(message),
            _ => Self::Embedding(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LumenError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_displays_message() {
        let err = LumenError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = LumenError::FileNotFound(PathBuf::from("/tmp/missing.jsonl"));
        assert!(err.to_string().contains("/tmp/missing.jsonl"));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            LumenError::from_status("embedding", 403, "forbidden"),
            LumenError::Auth { .. }
        ));
        assert!(matches!(
            LumenError::from_status("embedding", 429, "too many requests"),
            LumenError::RateLimited { .. }
        ));
        assert!(matches!(
            LumenError::from_status("llm", 429, r#"{"error":{"code":"insufficient_quota"}}"#),
            LumenError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            LumenError::from_status("embedding", 502, "bad gateway"),
            LumenError::Unavailable { .. }
        ));
        assert!(matches!(
            LumenError::from_status("embedding", 400, "bad input"),
            LumenError::Embedding(_)
        ));
        assert!(matches!(
            LumenError::from_status("llm", 404, "no such model"),
            LumenError::Llm(_)
        ));
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        let network = LumenError::Network {
            service: "llm".into(),
            message: "connection reset".into(),
        };
        assert!(network.is_retryable());
        assert!(!LumenError::InvalidResponse("truncated".into()).is_retryable());
        assert!(!LumenError::DimensionMismatch {
            expected: 3,
            actual: 2
        }
        .is_retryable());
        assert!(!LumenError::QuotaExceeded {
            service: "llm".into(),
            message: "no credit".into()
        }
        .is_retryable());
    }

    #[test]
    fn dimension_mismatch_mentions_both_sizes() {
        let err = LumenError::DimensionMismatch {
            expected: 1024,
            actual: 768,
        };
        let text = err.to_string();
        assert!(text.contains("1024"));
        assert!(text.contains("768"));
    }
}
