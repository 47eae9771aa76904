//! Failure taxonomy for the session pipeline.
//!
//! [`StoreError`] is what persistence backends report. [`PipelineError`] is
//! what every public pipeline operation reports; it keeps validation,
//! upstream, persistence, correlation and empty-session failures apart so a
//! caller can react to each differently.

use crate::ids::{DeviceId, SessionId, SessionKey};

/// Result alias used throughout the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Errors raised by a [`SessionStore`](crate::store::SessionStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store snapshot could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The referenced record does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The write would violate a uniqueness or ownership rule.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing or malformed input. Nothing was written.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// A collaborator (device, forecasting service) could not be reached or
    /// answered with a failure.
    #[error("{service} unavailable: {detail}")]
    Upstream {
        service: &'static str,
        detail: String,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// An emission record referenced a session that has no aggregate.
    #[error("no session aggregate with id {0}")]
    Correlation(SessionId),

    /// The session was closed with an empty buffer; no aggregate was written.
    #[error("session {0} closed with no buffered samples")]
    NoData(SessionKey),

    #[error("session {0} is not open")]
    SessionNotOpen(SessionKey),

    #[error("{0} already has an open session")]
    SessionAlreadyOpen(DeviceId),

    /// The aggregate was persisted but the emission step failed. The session
    /// stays pending and can be resumed with its id.
    #[error("session {session_id} aggregated but not completed: {source}")]
    Incomplete {
        session_id: SessionId,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::Validation`].
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`PipelineError::Upstream`].
    pub fn upstream(service: &'static str, detail: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            detail: detail.into(),
        }
    }

    /// Stable machine-readable class of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Upstream { .. } => "upstream",
            Self::Persistence(StoreError::Conflict(_)) => "conflict",
            Self::Persistence(_) => "persistence",
            Self::Correlation(_) => "correlation",
            Self::NoData(_) => "no_data",
            Self::SessionNotOpen(_) => "not_open",
            Self::SessionAlreadyOpen(_) => "conflict",
            Self::Incomplete { .. } => "incomplete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct_per_class() {
        let key = SessionKey::new();
        let kinds = [
            PipelineError::validation("power", "negative").kind(),
            PipelineError::upstream("device", "refused").kind(),
            PipelineError::Persistence(StoreError::Unavailable("down".into())).kind(),
            PipelineError::Correlation(SessionId(1)).kind(),
            PipelineError::NoData(key).kind(),
            PipelineError::SessionNotOpen(key).kind(),
        ];
        let mut unique = kinds.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), kinds.len());
    }

    #[test]
    fn test_store_conflict_reports_conflict_kind() {
        let err = PipelineError::from(StoreError::Conflict("duplicate".into()));
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn test_incomplete_keeps_the_cause() {
        let err = PipelineError::Incomplete {
            session_id: SessionId(4),
            source: Box::new(PipelineError::Correlation(SessionId(4))),
        };
        let msg = err.to_string();
        assert!(msg.contains("session 4"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = PipelineError::validation("Vrms", "label missing");
        assert_eq!(err.to_string(), "invalid Vrms: label missing");
    }
}
