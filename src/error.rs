use serde::Serialize;

/// Errors returned by the analysis engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("input rejected: {reason}")]
    Input { reason: String },

    #[error("baseline needs at least {required} samples, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },

    #[error("every detection strategy failed: {}", failures.join("; "))]
    EnsembleExhausted { failures: Vec<String> },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    ExternalDependency {
        operation: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("malformed metrics in {field}: {reason}")]
    MalformedMetrics { field: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn input(reason: impl Into<String>) -> Self {
        Self::Input {
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures at the storage and source-matching boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {message}")]
    Database { message: String },

    #[error("could not (de)serialize {what}: {message}")]
    Serialization { what: String, message: String },

    #[error("collaborator unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    /// Transient failures are worth another attempt; corrupt payloads are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

/// A single ensemble strategy failing. Never surfaced on its own.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{strategy}: {reason}")]
pub struct StrategyError {
    pub strategy: String,
    pub reason: String,
}

impl StrategyError {
    pub fn new(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: f64,
    },

    #[error("normal threshold ({normal}) must be below suspicious threshold ({suspicious})")]
    ThresholdOrder { normal: f64, suspicious: f64 },

    #[error("could not read config: {0}")]
    Unreadable(String),
}

/// Non-fatal conditions attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineWarning {
    StaleBaseline { age_days: i64, max_age_days: i64 },
    BaselineMissing { student_id: String },
    StrategyFailed { strategy: String, reason: String },
    StrategyTimedOut { strategy: String, timeout_ms: u64 },
    SourceMatcherUnavailable { reason: String },
    NoSignals,
}

impl std::fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaleBaseline {
                age_days,
                max_age_days,
            } => write!(
                f,
                "baseline is {age_days} days old (limit {max_age_days}); rebuild from recent history"
            ),
            Self::BaselineMissing { student_id } => {
                write!(f, "no baseline established for student {student_id}")
            }
            Self::StrategyFailed { strategy, reason } => {
                write!(f, "strategy {strategy} failed: {reason}")
            }
            Self::StrategyTimedOut {
                strategy,
                timeout_ms,
            } => write!(f, "strategy {strategy} timed out after {timeout_ms}ms"),
            Self::SourceMatcherUnavailable { reason } => {
                write!(f, "source matching unavailable: {reason}")
            }
            Self::NoSignals => write!(f, "no input signal was available for scoring"),
        }
    }
}
