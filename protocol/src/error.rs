use std::{io, sync::Arc};

use thiserror::Error;

#[derive(Error, Clone, Debug)]
pub enum TransportError {
    #[error("IO Error: {0:?}")]
    Io(Arc<io::Error>),
    #[error("Other Error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(x: anyhow::Error) -> Self {
        TransportError::Other(Arc::new(x))
    }
}

#[derive(Error, Clone, Debug)]
pub enum FramingError {
    #[error("Invalid binary block header: {0}")]
    InvalidBinaryHeader(String),
    /// The delimiter was not found within the configured buffer limit. Whatever was
    /// available has been consumed from the stream and is returned in `partial`.
    #[error("Message exceeded buffer limit of {limit} bytes after {} bytes", .partial.len())]
    LimitExceeded { limit: usize, partial: Vec<u8> },
    /// The stream ended before the message was complete.
    #[error("Connection closed after {} bytes, expected {:?}", .partial.len(), .expected)]
    Incomplete {
        expected: Option<usize>,
        partial: Vec<u8>,
    },
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Transport Error {0}")]
    Transport(TransportError),
    #[error("Framing Error {0}")]
    Framing(FramingError),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Cannot interpret response: {0}")]
    Interpretation(Arc<anyhow::Error>),
    #[error("Argument Error {0}")]
    Argument(Arc<anyhow::Error>),
    #[error("Instrument is disconnected")]
    Disconnected,
}

impl Error {
    pub fn transport<T: Into<TransportError>>(err: T) -> Self {
        Self::Transport(err.into())
    }

    pub fn framing(err: FramingError) -> Self {
        Self::Framing(err)
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn interpretation<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Interpretation(Arc::new(err.into()))
    }

    pub fn argument<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Argument(Arc::new(err.into()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Returns true if the error indicates that the peer went away, i.e. no further
    /// commands can succeed on this connection.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Transport(TransportError::Io(err)) => {
                err.kind() == io::ErrorKind::ConnectionReset
                    || err.kind() == io::ErrorKind::ConnectionAborted
                    || err.kind() == io::ErrorKind::BrokenPipe
                    || err.kind() == io::ErrorKind::UnexpectedEof
            }
            Error::Framing(FramingError::Incomplete { .. }) => true,
            Error::Disconnected => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(x: io::Error) -> Self {
        Error::Transport(TransportError::Io(Arc::new(x)))
    }
}

impl From<FramingError> for Error {
    fn from(x: FramingError) -> Self {
        Error::Framing(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_connection_lost());
        let err = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!err.is_connection_lost());
        assert!(!Error::timeout("foo").is_connection_lost());
        assert!(Error::timeout("foo").is_timeout());
    }

    #[test]
    fn incomplete_message() {
        let err = Error::framing(FramingError::Incomplete {
            expected: Some(10),
            partial: vec![1, 2, 3],
        });
        assert!(err.to_string().contains("after 3 bytes, expected Some(10)"));
        let err = Error::framing(FramingError::Incomplete {
            expected: None,
            partial: vec![],
        });
        assert!(err.to_string().contains("after 0 bytes, expected None"));
    }
}
