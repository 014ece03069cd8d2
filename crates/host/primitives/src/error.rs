use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Failure of the secure-channel handshake. Fatal to the raw connection:
/// the dial is not retried, a fresh attempt starts a fresh connection.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("malformed handshake message")]
    Malformed,

    #[error("no common {category} algorithm")]
    NoCommonAlgorithm { category: &'static str },

    #[error("peer authentication failed: {reason}")]
    AuthenticationFailed { reason: &'static str },

    #[error("handshake timed out")]
    Timeout,

    #[error("handshake io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Failure of the muxer's framing protocol. Fatal to the whole connection,
/// never to a single stream.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum MuxerError {
    #[error("muxer protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for MuxerError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Failure of the per-stream protocol negotiation. Fatal only to the
/// affected stream.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum NegotiationError {
    #[error("none of the proposed protocols are supported by the peer")]
    NoSuchProtocol,

    #[error("malformed negotiation message")]
    Malformed,

    #[error("negotiation timed out")]
    Timeout,

    #[error("negotiation io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for NegotiationError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Terminal states surfaced by stream reads and writes.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum StreamError {
    /// The stream was reset, locally or by the remote.
    #[error("stream was reset")]
    Reset,

    /// The local write side is closed; reads may still drain.
    #[error("stream is closed for writing")]
    Closed,

    /// The owning connection went away, taking the stream with it.
    #[error("connection closed")]
    ConnectionClosed,
}

impl StreamError {
    /// Embeds the error into an [`io::Error`] so it survives a trip through
    /// the `AsyncRead`/`AsyncWrite` surface of a stream.
    #[must_use]
    pub fn into_io(self) -> io::Error {
        let kind = match self {
            Self::Reset => io::ErrorKind::ConnectionReset,
            Self::Closed => io::ErrorKind::BrokenPipe,
            Self::ConnectionClosed => io::ErrorKind::ConnectionAborted,
        };
        io::Error::new(kind, self)
    }

    /// Recovers a [`StreamError`] previously embedded by [`Self::into_io`].
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()?.downcast_ref().copied()
    }
}

/// Umbrella error resolved through the asynchronous handles handed out by
/// the host. Each layer's failure keeps its own shape.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Muxer(#[from] MuxerError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("no local binding registered for protocol {0}")]
    NoBinding(String),

    #[error("protocol handler failed: {0}")]
    Handler(String),

    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    #[error("operation timed out")]
    Timeout,

    #[error("host is shutting down")]
    Shutdown,
}

impl HostError {
    #[must_use]
    pub fn transport(err: io::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_roundtrips_through_io() {
        for err in [
            StreamError::Reset,
            StreamError::Closed,
            StreamError::ConnectionClosed,
        ] {
            let io_err = err.into_io();
            assert_eq!(StreamError::from_io(&io_err), Some(err));
        }
    }

    #[test]
    fn foreign_io_error_is_not_a_stream_error() {
        let io_err = io::Error::new(io::ErrorKind::Other, "unrelated");
        assert_eq!(StreamError::from_io(&io_err), None);
    }
}
