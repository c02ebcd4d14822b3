//! Virtual stream multiplexing over a single channel-capable link
//!
//! Many independent bidirectional streams share one transport. Streams are
//! paired by id through a small rendezvous protocol on a dedicated control
//! channel, and each stream gets its own data channel on the link.
//!
//! # Architecture
//!
//! ```text
//! Application (VirtualStream: send/recv, AsyncRead/AsyncWrite)
//!     ↓
//! Multiplexer (control channel, listeners, shutdown)
//!     ↓
//! Link (framed channels over any AsyncRead + AsyncWrite)
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use plex_stream::{ConnectOptions, Link, LinkConfig, Multiplexer, MultiplexerConfig};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (a, b) = Link::pair(LinkConfig::default());
//!     let server: Multiplexer = Multiplexer::new(a, MultiplexerConfig::default())?;
//!     let client: Multiplexer = Multiplexer::new(b, MultiplexerConfig::default())?;
//!
//!     let mut listener = server.listen();
//!     let mut stream = client.connect(ConnectOptions::new());
//!     stream.write_all(b"Hello, World!").await?;
//!     stream.shutdown().await?;
//!
//!     let mut incoming = listener.accept().await?;
//!     let mut buf = String::new();
//!     incoming.stream.read_to_string(&mut buf).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod link;
pub mod multiplexer;
pub mod protocol;
pub mod rendezvous;
mod shutdown;
pub mod stream;

// Re-export main types
pub use codec::{Codec, CodecContext, CodecSource, ControlCodec, JsonCodec, RawCodec, SharedCodec};
pub use error::{Error, Result};
pub use link::{Channel, ChannelEvent, Link, LinkConfig};
pub use multiplexer::{
    ConnectOptions, ListenOptions, MultiplexerConfig, Multiplexer, MuxEvent, MuxState,
    DEFAULT_PARK_TIMEOUT,
};
pub use protocol::{
    random_id, ControlMessage, ID_LEN, MAX_ID_LEN, PROTOCOL_CHANNEL, PROTOCOL_CONTROL,
};
pub use rendezvous::{Incoming, Listener};
pub use stream::{handshake_hook, HandshakeHook, HandshakeInfo, StreamState, VirtualStream};
