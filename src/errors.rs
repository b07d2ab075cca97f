//! Typed error hierarchy for the lifecycle engine.
//!
//! One enum covers every business outcome the engine can reject with:
//! - `EngineError` — gate denials, precondition failures, business rejections,
//!   expired access, storage faults
//!
//! The HTTP layer maps these onto status codes and a `{error, code, retryable}`
//! body; see `engine::api`.

use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Business rejections (`ValidationRejected`, payment/KYC/signing denials) are
/// expected, recoverable outcomes and always carry a reason string; they are
/// distinguishable from transport and storage faults so callers can offer a
/// retry path.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    #[error("Already terminal: {reason}")]
    AlreadyTerminal { reason: String },

    #[error("Rejected: {reason}")]
    ValidationRejected { reason: String },

    #[error("Access code expired")]
    ExpiredAccess,

    #[error("Identity analysis unavailable: {0}")]
    AnalyzerUnavailable(#[source] anyhow::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            reason: reason.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::AlreadyTerminal {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for HTTP bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound { .. } => "not_found",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::ExpiredAccess => "expired_access",
            Self::AnalyzerUnavailable(_) => "analyzer_unavailable",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether the caller can meaningfully retry the same request.
    ///
    /// Business rejections are retryable (resubmit a corrected proof, re-sign,
    /// re-join with a fresh code); ordering violations and terminal states are
    /// not — the caller must take a different action first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ValidationRejected { .. } | Self::ExpiredAccess | Self::AnalyzerUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_carries_reason() {
        let err = EngineError::unauthorized("client access not approved");
        match &err {
            EngineError::Unauthorized { reason } => {
                assert_eq!(reason, "client access not approved");
            }
            _ => panic!("Expected Unauthorized variant"),
        }
        assert!(err.to_string().contains("client access not approved"));
    }

    #[test]
    fn precondition_failed_is_matchable() {
        let err = EngineError::precondition("kyc_completed requires payment_confirmed");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
        assert_eq!(err.code(), "precondition_failed");
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_rejected_is_retryable() {
        let err = EngineError::rejected("proof filename does not match deposit-*.pdf");
        assert!(err.is_retryable());
        assert_eq!(err.code(), "validation_rejected");
    }

    #[test]
    fn already_terminal_carries_reason() {
        let err = EngineError::terminal("transaction 7 is locked");
        match &err {
            EngineError::AlreadyTerminal { reason } => assert!(reason.contains("7")),
            _ => panic!("Expected AlreadyTerminal"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn expired_access_has_stable_code() {
        let err = EngineError::ExpiredAccess;
        assert_eq!(err.code(), "expired_access");
        assert!(err.is_retryable());
    }

    #[test]
    fn storage_converts_from_anyhow() {
        let err: EngineError = anyhow::anyhow!("disk full").into();
        match &err {
            EngineError::Storage(inner) => assert!(inner.to_string().contains("disk full")),
            _ => panic!("Expected Storage variant"),
        }
    }

    #[test]
    fn all_variants_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::ExpiredAccess);
        assert_std_error(&EngineError::not_found("Transaction 9"));
    }
}
