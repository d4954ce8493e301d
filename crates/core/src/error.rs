//! Domain error model.
//!
//! Domain errors represent business-logic failures (validation, invariant
//! violations, conflicts). Infrastructure failures (store, broker) live in
//! their own error types and are mapped at the boundary where they surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Stable, machine-readable error codes.
///
/// These are part of the external contract: they appear in logs, agent
/// results, and (outside this workspace) HTTP error bodies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    OptimisticLockConflict,
    InsufficientStock,
    NegativeStockBlocked,
    IdempotencyConflict,
    LotNotPickable,
    NotFound,
    DownstreamUnavailable,
    Internal,
}

impl ErrorCode {
    /// Whether an operation failing with this code may be retried as-is.
    ///
    /// Only the optimistic-lock CAS loss and downstream transients are
    /// retriable; domain conflicts are deterministic and will fail again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::OptimisticLockConflict | ErrorCode::DownstreamUnavailable | ErrorCode::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::OptimisticLockConflict => "OPTIMISTIC_LOCK_CONFLICT",
            ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
            ErrorCode::NegativeStockBlocked => "NEGATIVE_STOCK_BLOCKED",
            ErrorCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ErrorCode::LotNotPickable => "LOT_NOT_PICKABLE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::DownstreamUnavailable => "DOWNSTREAM_UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error (deterministic business failures).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct DomainError {
    code: ErrorCode,
    message: String,
}

impl DomainError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, msg)
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, msg)
    }

    pub fn optimistic_lock(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::OptimisticLockConflict, msg)
    }

    pub fn insufficient_stock(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientStock, msg)
    }

    pub fn negative_stock(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NegativeStockBlocked, msg)
    }

    pub fn idempotency(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::IdempotencyConflict, msg)
    }

    pub fn lot_not_pickable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::LotNotPickable, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, msg)
    }

    pub fn downstream(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DownstreamUnavailable, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cas_and_transients_are_retriable() {
        assert!(DomainError::optimistic_lock("lost").is_retriable());
        assert!(DomainError::downstream("broker down").is_retriable());
        assert!(!DomainError::negative_stock("would go below zero").is_retriable());
        assert!(!DomainError::not_found("missing").is_retriable());
        assert!(!DomainError::validation("bad payload").is_retriable());
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::NegativeStockBlocked).unwrap();
        assert_eq!(json, "\"NEGATIVE_STOCK_BLOCKED\"");
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = DomainError::insufficient_stock("7 requested, 3 available");
        assert_eq!(err.to_string(), "INSUFFICIENT_STOCK: 7 requested, 3 available");
    }
}
