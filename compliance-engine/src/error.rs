use serde::Serialize;

use crate::store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification used for reporting and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    DataUnavailable,
    Lifecycle,
    InvalidRequest,
    NotFound,
    Store,
    Cancelled,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::DataUnavailable => "data_unavailable",
            Self::Lifecycle => "lifecycle",
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::Store => "store",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Unknown type code, malformed parameter, out-of-range threshold, or a
    /// window that does not cover the requested period.
    #[error("configuration error in clause {clause_id}, field '{field}': {reason}")]
    Configuration {
        clause_id: String,
        field: String,
        reason: String,
    },

    /// Incomplete coverage, open events, timed-out or failed reads.
    #[error("data unavailable for contract {contract_id}, period {period}: {reason}")]
    DataUnavailable {
        contract_id: String,
        period: String,
        clause_id: Option<String>,
        reason: String,
    },

    #[error("default event {id} cannot be {action} from status {from}")]
    InvalidTransition {
        id: String,
        from: String,
        action: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("evaluation cancelled before it started")]
    Cancelled,

    #[error("batch worker {worker} failed: {reason}")]
    WorkerFailed { worker: usize, reason: String },

    #[error("failed to encode result: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl EngineError {
    pub fn config(clause_id: impl Into<String>, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            clause_id: clause_id.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn data_unavailable(
        contract_id: impl Into<String>,
        period: impl Into<String>,
        clause_id: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DataUnavailable {
            contract_id: contract_id.into(),
            period: period.into(),
            clause_id: clause_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::DataUnavailable { .. } => ErrorCategory::DataUnavailable,
            Self::InvalidTransition { .. } => ErrorCategory::Lifecycle,
            Self::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Store(_) => ErrorCategory::Store,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::WorkerFailed { .. } => ErrorCategory::Internal,
            Self::Encoding(_) => ErrorCategory::Internal,
        }
    }
}
