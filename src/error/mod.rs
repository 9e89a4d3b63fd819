//! Error handling for the relay harness
//!
//! Connection-level errors (`Framing`, `Handshake`, `Connection`) are local to
//! one peer connection. Everything else aborts the running scenario.

use std::fmt;
use std::time::Duration;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Error types for harness operations
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessError {
    /// Malformed wire bytes (truncated frame, bad length, checksum or command)
    Framing(String),
    /// Version/verack negotiation failed
    Handshake(String),
    /// Transport failure in the middle of a stream
    Connection(String),
    /// A wait bound expired before its predicate held
    Timeout {
        description: String,
        timeout: Duration,
    },
    /// An operation referenced an unknown node or link
    Topology(String),
    /// Nodes did not reach the expected chain state in time
    Convergence { target: String, lagging: Vec<String> },
    /// Proof-of-work search ran out of nonces
    ExhaustedNonceSpace { height: u64, attempts: u64 },
    /// The node-under-test rejected or failed an RPC call
    Rpc(String),
    /// Block failed structural or proof-of-work checks
    InvalidBlock(String),
    /// A scenario check on received data failed
    Assertion(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// File and socket I/O errors
    Io(String),
}

impl HarnessError {
    /// Whether the error only affects a single peer connection
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            HarnessError::Framing(_) | HarnessError::Handshake(_) | HarnessError::Connection(_)
        )
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Framing(msg) => write!(f, "Framing error: {msg}"),
            HarnessError::Handshake(msg) => write!(f, "Handshake error: {msg}"),
            HarnessError::Connection(msg) => write!(f, "Connection error: {msg}"),
            HarnessError::Timeout {
                description,
                timeout,
            } => write!(
                f,
                "Timed out after {}ms waiting for: {description}",
                timeout.as_millis()
            ),
            HarnessError::Topology(msg) => write!(f, "Topology error: {msg}"),
            HarnessError::Convergence { target, lagging } => write!(
                f,
                "Convergence error: {target} not reached by {}",
                lagging.join(", ")
            ),
            HarnessError::ExhaustedNonceSpace { height, attempts } => write!(
                f,
                "Exhausted nonce space for block at height {height} after {attempts} attempts"
            ),
            HarnessError::Rpc(msg) => write!(f, "RPC error: {msg}"),
            HarnessError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            HarnessError::Assertion(msg) => write!(f, "Assertion failed: {msg}"),
            HarnessError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            HarnessError::Config(msg) => write!(f, "Configuration error: {msg}"),
            HarnessError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Io(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for HarnessError {
    fn from(err: bincode::error::EncodeError) -> Self {
        HarnessError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for HarnessError {
    fn from(err: bincode::error::DecodeError) -> Self {
        HarnessError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(err: toml::de::Error) -> Self {
        HarnessError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_predicate() {
        let err = HarnessError::Timeout {
            description: "all blocks received".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 5000ms waiting for: all blocks received"
        );
    }

    #[test]
    fn test_convergence_message_lists_lagging_nodes() {
        let err = HarnessError::Convergence {
            target: "height 12".to_string(),
            lagging: vec!["node0 (height 11)".to_string(), "node2 (height 3)".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("node0 (height 11)"));
        assert!(msg.contains("node2 (height 3)"));
    }

    #[test]
    fn test_connection_local_classification() {
        assert!(HarnessError::Framing("x".into()).is_connection_local());
        assert!(HarnessError::Connection("x".into()).is_connection_local());
        assert!(!HarnessError::Topology("x".into()).is_connection_local());
    }
}
