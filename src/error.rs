use thiserror::Error;

/// Errors that can occur in link, stream and multiplexer operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed frame, unknown frame type, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload or control message could not be encoded/decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Handshake-acceptance hook declined the connection
    #[error("Connection rejected")]
    Rejected,

    /// Stream was destroyed while an operation was pending
    #[error("Stream destroyed")]
    StreamDestroyed,

    /// Channel is not open or has already been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// A live channel already exists for this (protocol, id)
    #[error("Channel already exists: protocol={protocol} id={id}")]
    ChannelExists { protocol: String, id: String },

    /// Link transport has shut down
    #[error("Link closed")]
    LinkClosed,

    /// Multiplexer is closing or closed
    #[error("Multiplexer closed")]
    MultiplexerClosed,

    /// Timeout waiting for operation
    #[error("Operation timed out")]
    Timeout,

    /// Frame too large
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::StreamDestroyed | Error::ChannelClosed | Error::LinkClosed => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)
            }
            Error::Rejected => std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e),
            Error::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, e),
            Error::Codec(_) | Error::Protocol(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
