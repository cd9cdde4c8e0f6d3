//! Fabric error types
//!
//! One variant per error kind the fabric distinguishes. Peer-loop
//! errors are logged and swallowed by their callers; deployment-path
//! errors are surfaced, possibly aggregated with a peer error.

use std::io;
use thiserror::Error;

/// Fabric result type
pub type Result<T> = std::result::Result<T, FabricError>;

/// Canonical message fragment for a node that cannot place a request.
/// Delegation decisions match on this fragment when the error crossed
/// the wire as a plain string.
pub const NO_AVAILABLE_PROVIDER: &str = "no available provider";

/// Errors produced by the fabric
#[derive(Debug, Error)]
pub enum FabricError {
    /// Required address, tag, or option absent
    #[error("not configured: {what}")]
    NotConfigured { what: String },

    /// Provider-token mismatch
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Unknown node, provider, component, or object
    #[error("not found: {what}")]
    NotFound { what: String },

    /// No provider fits the request; triggers delegation fallback
    #[error("no available provider: {message}")]
    CapacityExhausted { message: String },

    /// A schedule proposal was rejected by the policy chain
    #[error("[{policy}] {reason}")]
    PolicyRejected { policy: String, reason: String },

    /// Duplicate message ID or duplicate object save
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// RPC or build timeout
    #[error("deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },

    /// Dial or stream failure
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Language or encoding not supported
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Everything else
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FabricError {
    /// Create a new not-configured error
    pub fn not_configured(what: impl Into<String>) -> Self {
        Self::NotConfigured { what: what.into() }
    }

    /// Create a new unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    /// Create a new not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new capacity-exhausted error
    pub fn capacity_exhausted(message: impl Into<String>) -> Self {
        Self::CapacityExhausted { message: message.into() }
    }

    /// Create a new conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    /// Create a new deadline-exceeded error
    pub fn deadline(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded { operation: operation.into() }
    }

    /// Create a new transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a new unsupported error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported { message: message.into() }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this error should trigger the peer-delegation fallback.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }

    /// Whether a stringified error (from a remote `{success, error}`
    /// envelope) indicates capacity exhaustion on the remote node.
    pub fn message_indicates_capacity(message: &str) -> bool {
        message.contains(NO_AVAILABLE_PROVIDER)
    }
}

impl From<io::Error> for FabricError {
    fn from(err: io::Error) -> Self {
        Self::Transport { message: err.to_string() }
    }
}

impl From<bincode::Error> for FabricError {
    fn from(err: bincode::Error) -> Self {
        Self::Internal { message: format!("codec: {err}") }
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal { message: format!("json: {err}") }
    }
}

impl From<tokio::time::error::Elapsed> for FabricError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::DeadlineExceeded { operation: "rpc".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_carry_the_canonical_fragment() {
        let err = FabricError::capacity_exhausted("cpu request 4000m on node-a");
        assert!(err.is_capacity_exhausted());
        assert!(FabricError::message_indicates_capacity(&err.to_string()));
    }

    #[test]
    fn policy_rejections_render_with_policy_name() {
        let err = FabricError::PolicyRejected {
            policy: "domain-guard".to_string(),
            reason: "proposal crosses domains".to_string(),
        };
        assert_eq!(err.to_string(), "[domain-guard] proposal crosses domains");
    }

    #[test]
    fn foreign_messages_do_not_trigger_delegation() {
        assert!(!FabricError::message_indicates_capacity("provider disconnected"));
    }
}
