/// Unified error type for the execution runtime
/// Provides structured error handling with categories for the failure modes a
/// fragment can surface to its coordinator
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Memory errors: allocation exceeded limit (and grace), reservation failures
    #[error("Out of memory: {message}")]
    OutOfMemory {
        message: String,
        requested: Option<u64>,
        limit: Option<u64>,
        allocated: Option<u64>,
        context: Option<String>,
    },

    /// Schema errors: an operator received a schema it cannot reconcile
    #[error("Schema change error: {message}")]
    SchemaChange {
        message: String,
        operator: Option<String>,
        context: Option<String>,
    },

    /// Setup errors: evaluator construction failed (missing field, bad type)
    #[error("Setup failure: {message}")]
    Setup {
        message: String,
        context: Option<String>,
    },

    /// Execution errors: operator failures, invalid state
    #[error("Execution error: {message}")]
    Execution {
        message: String,
        operator: Option<String>,
        context: Option<String>,
    },

    /// IO errors: tunnel sends, config file reads
    #[error("IO error: {message}")]
    IO {
        message: String,
        path: Option<String>,
        source_message: Option<String>,
        context: Option<String>,
    },

    /// Cancellation: cooperative stop, not a failure
    #[error("Cancellation: {message}")]
    Cancellation {
        message: String,
        reason: Option<String>,
        context: Option<String>,
    },

    /// Configuration errors: invalid option values
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        key: Option<String>,
        context: Option<String>,
    },

    /// Internal errors: should never happen, indicates bug
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: Option<String>,
    },
}

impl EngineError {
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: message.into(),
            requested: None,
            limit: None,
            allocated: None,
            context: None,
        }
    }

    pub fn out_of_memory_with_usage(
        message: impl Into<String>,
        requested: u64,
        limit: u64,
        allocated: u64,
    ) -> Self {
        Self::OutOfMemory {
            message: message.into(),
            requested: Some(requested),
            limit: Some(limit),
            allocated: Some(allocated),
            context: None,
        }
    }

    pub fn schema_change(message: impl Into<String>) -> Self {
        Self::SchemaChange {
            message: message.into(),
            operator: None,
            context: None,
        }
    }

    pub fn schema_change_in(message: impl Into<String>, operator: impl Into<String>) -> Self {
        Self::SchemaChange {
            message: message.into(),
            operator: Some(operator.into()),
            context: None,
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
            context: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            operator: None,
            context: None,
        }
    }

    pub fn execution_with_operator(message: impl Into<String>, operator: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            operator: Some(operator.into()),
            context: None,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
            path: None,
            source_message: None,
            context: None,
        }
    }

    pub fn io_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
            path: Some(path.into()),
            source_message: None,
            context: None,
        }
    }

    pub fn cancellation(message: impl Into<String>) -> Self {
        Self::Cancellation {
            message: message.into(),
            reason: None,
            context: None,
        }
    }

    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            key: Some(key.into()),
            context: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            context: None,
        }
    }

    /// Add context to an error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let slot = match &mut self {
            Self::OutOfMemory { context: slot, .. }
            | Self::SchemaChange { context: slot, .. }
            | Self::Setup { context: slot, .. }
            | Self::Execution { context: slot, .. }
            | Self::IO { context: slot, .. }
            | Self::Cancellation { context: slot, .. }
            | Self::Config { context: slot, .. }
            | Self::Internal { context: slot, .. } => slot,
        };
        *slot = Some(context.into());
        self
    }

    pub fn context(&self) -> Option<&str> {
        match self {
            Self::OutOfMemory { context, .. }
            | Self::SchemaChange { context, .. }
            | Self::Setup { context, .. }
            | Self::Execution { context, .. }
            | Self::IO { context, .. }
            | Self::Cancellation { context, .. }
            | Self::Config { context, .. }
            | Self::Internal { context, .. } => context.as_deref(),
        }
    }

    /// Cancellation is a terminal state, everything else aborts the fragment
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancellation { .. })
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl From<arrow::error::ArrowError> for EngineError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Execution {
            message: err.to_string(),
            operator: None,
            context: Some("arrow".to_string()),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::IO {
            message: err.to_string(),
            path: None,
            source_message: None,
            context: None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            message: err.to_string(),
            key: None,
            context: None,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_context_sets_field() {
        let err = EngineError::setup("missing field 'k'").with_context("filter predicate");
        match err {
            EngineError::Setup { context, .. } => {
                assert_eq!(context.as_deref(), Some("filter predicate"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_with_context_kept_on_every_variant() {
        let errors = vec![
            EngineError::schema_change_in("int64 became utf8", "filter"),
            EngineError::io("tunnel closed"),
            EngineError::cancellation("stop"),
            EngineError::config("must be positive", "exchange.thread_factor"),
            EngineError::out_of_memory("oom"),
        ];
        for err in errors {
            let err = err.with_context("fragment 1:0");
            assert_eq!(err.context(), Some("fragment 1:0"), "{err:?}");
        }
    }

    #[test]
    fn test_cancellation_is_not_fatal() {
        assert!(!EngineError::cancellation("stop").is_fatal());
        assert!(EngineError::out_of_memory("oom").is_fatal());
        assert!(EngineError::out_of_memory("oom").is_out_of_memory());
    }
}
