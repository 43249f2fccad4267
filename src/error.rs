//! Error types for the replicated store and its gossip layer.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a cluster node.
#[derive(Debug)]
pub enum Error {
    /// The local gossip socket could not be bound.
    Bind {
        /// Address we attempted to bind.
        addr: SocketAddr,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// An encoded change does not fit in a gossip packet.
    MessageTooLarge {
        /// Size of the encoded change in bytes.
        size: usize,
        /// Largest payload a gossip packet can carry.
        max_size: usize,
    },

    /// Failed to encode a message.
    Encode(String),

    /// Failed to decode a message.
    Decode(String),

    /// Network send operation failed.
    Send {
        /// Target address that we failed to send to.
        target: SocketAddr,
        /// Underlying error message.
        reason: String,
    },

    /// The transport reported an error during a reliable exchange.
    Transport(String),

    /// A network operation did not complete in time.
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Configured timeout.
        after: Duration,
    },

    /// None of the seed nodes could be contacted.
    JoinFailed {
        /// Number of seeds that were tried.
        attempted: usize,
        /// Last error observed.
        reason: String,
    },

    /// A peer answered with a message of the wrong kind.
    UnexpectedMessage(String),

    /// The node has been shut down.
    Shutdown,

    /// Configuration error.
    Config(String),

    /// Internal channel error.
    Channel(String),

    /// Generic IO error.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bind { addr, source } => {
                write!(f, "failed to bind {}: {}", addr, source)
            }
            Error::MessageTooLarge { size, max_size } => {
                write!(
                    f,
                    "message size ({} bytes) exceeds maximum ({} bytes)",
                    size, max_size
                )
            }
            Error::Encode(msg) => {
                write!(f, "failed to encode message: {}", msg)
            }
            Error::Decode(msg) => {
                write!(f, "failed to decode message: {}", msg)
            }
            Error::Send { target, reason } => {
                write!(f, "failed to send to {}: {}", target, reason)
            }
            Error::Transport(msg) => {
                write!(f, "transport error: {}", msg)
            }
            Error::Timeout { operation, after } => {
                write!(f, "{} timed out after {:?}", operation, after)
            }
            Error::JoinFailed { attempted, reason } => {
                write!(
                    f,
                    "failed to join cluster: none of {} seed(s) reachable (last error: {})",
                    attempted, reason
                )
            }
            Error::UnexpectedMessage(msg) => {
                write!(f, "unexpected message: {}", msg)
            }
            Error::Shutdown => {
                write!(f, "node has been shut down")
            }
            Error::Config(msg) => {
                write!(f, "configuration error: {}", msg)
            }
            Error::Channel(msg) => {
                write!(f, "channel error: {}", msg)
            }
            Error::Io(err) => {
                write!(f, "IO error: {}", err)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind { source, .. } => Some(source),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Error::Io(err.into())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Decode(err.to_string())
        } else {
            Error::Encode(err.to_string())
        }
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

impl From<async_channel::RecvError> for Error {
    fn from(err: async_channel::RecvError) -> Self {
        Error::Channel(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::JoinFailed {
            attempted: 2,
            reason: "connection refused".into(),
        };
        assert!(err.to_string().contains("2 seed"));
        assert!(err.to_string().contains("connection refused"));

        let err = Error::Timeout {
            operation: "push/pull",
            after: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("push/pull"));

        let err = Error::MessageTooLarge {
            size: 2000,
            max_size: 1395,
        };
        assert!(err.to_string().contains("2000"));
        assert!(err.to_string().contains("1395"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "test error");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let err: Error = serde_json::from_slice::<Vec<u8>>(b"{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_bind_error_has_source() {
        use std::error::Error as _;
        let err = Error::Bind {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.source().is_some());
    }
}
