//! Error types for the peer node.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The address given to `connect` did not resolve to anything usable.
    #[error("could not resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A peer sent more than `max` bytes without a frame terminator.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },

    /// A field would not survive the wire format intact.
    #[error("{field} {value:?} {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    /// The node task has ended and can no longer take commands.
    #[error("node is not running")]
    NodeStopped,
}
