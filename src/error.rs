//! Error types for the volume engine

use thiserror::Error;

use crate::planner::rules::RuleViolation;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the volume engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid keypair: {0}")]
    InvalidKeypair(String),

    #[error("Insecure keypair permissions: {0}")]
    InsecureKeypair(String),

    // Planner input errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rule violation: {}", format_violations(.0))]
    RuleViolation(Vec<RuleViolation>),

    // Wallet ownership
    #[error("Wallet {wallet_id} not authorized for session {session_id}")]
    Authorization {
        wallet_id: String,
        session_id: String,
    },

    // Venue / execution errors
    #[error("Execution failed on {venue}: {message}")]
    Execution { venue: String, message: String },

    #[error("Slippage exceeded: {0}")]
    SlippageExceeded(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("Bonding curve decode failed: {0}")]
    BondingCurveDecode(String),

    // Risk evaluation
    #[error("Price data is stale: last update {age_ms}ms ago (max {max_age_ms}ms)")]
    Staleness { age_ms: u64, max_age_ms: u64 },

    // Persistence
    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    // Stream errors
    #[error("Stream connection failed: {0}")]
    StreamConnection(String),

    #[error("Stream disconnected")]
    StreamDisconnected,

    #[error("Heartbeat timeout: no liveness response within {0}ms")]
    HeartbeatTimeout(u64),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn format_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_)
                | Error::Timeout { .. }
                | Error::StreamConnection(_)
                | Error::StreamDisconnected
                | Error::HeartbeatTimeout(_)
        )
    }

    /// Reason code recorded on an execution record for this error
    pub fn reason_code(&self) -> crate::executor::record::ReasonCode {
        use crate::executor::record::ReasonCode;

        match self {
            Error::Authorization { .. } => ReasonCode::WalletNotAuthorized,
            Error::Validation(_) => ReasonCode::InvalidVolume,
            Error::Timeout { .. } => ReasonCode::Timeout,
            Error::SlippageExceeded(_) => ReasonCode::SlippageExceeded,
            Error::PriceUnavailable(_) | Error::BondingCurveDecode(_) => {
                ReasonCode::PriceUnavailable
            }
            Error::Rpc(_) => ReasonCode::NetworkError,
            _ => ReasonCode::VenueError,
        }
    }
}

// Conversion from solana_client errors
impl From<solana_client::client_error::ClientError> for Error {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        Error::Rpc(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::record::ReasonCode;

    #[test]
    fn test_rule_violation_display_lists_all() {
        let err = Error::RuleViolation(vec![
            RuleViolation::WalletCountExceeded {
                requested: 5,
                max: 3,
            },
            RuleViolation::VolumeCapExceeded {
                requested: 2.0,
                max: 1.0,
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("5 wallets"));
        assert!(text.contains("cap 1"));
    }

    #[test]
    fn test_reason_codes() {
        let err = Error::Authorization {
            wallet_id: "w1".to_string(),
            session_id: "s1".to_string(),
        };
        assert_eq!(err.reason_code(), ReasonCode::WalletNotAuthorized);

        let err = Error::Timeout {
            operation: "buy".to_string(),
            timeout_ms: 100,
        };
        assert_eq!(err.reason_code(), ReasonCode::Timeout);
        assert!(err.is_retryable());
    }
}
