use crate::error::Error;
use crate::link::Channel;
use crate::protocol::short_id;
use crate::rendezvous::Rendezvous;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How far a multiplexer shutdown goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum Shutdown {
    /// Finish every stream and wait for both sides to let go
    Graceful = 1,
    /// Destroy every stream at once
    Forced = 2,
}

/// Tear down every stream, then the control channel
///
/// Streams still waiting for an ack fail with `MultiplexerClosed`. Attached
/// streams are finished (or destroyed). Each stays in the pending-close set
/// until both its channel and the stream itself are destroyed, and only then
/// is the control channel closed. A stream whose consumer never drains a
/// corked read side holds the close open; `destroy()` escalates.
pub(crate) async fn run<T: Send + 'static>(
    rendezvous: Arc<Rendezvous<T>>,
    control: Arc<Channel>,
    mode: Shutdown,
) {
    let (opening, active) = rendezvous.begin_closing();
    for stream in opening {
        stream.fail(&Error::MultiplexerClosed);
    }

    let mut pending: HashMap<Bytes, (CancellationToken, CancellationToken)> = HashMap::new();
    for stream in active {
        match (mode, stream.channel_destroyed()) {
            (Shutdown::Graceful, Some(destroyed)) => {
                pending.insert(stream.id().clone(), (destroyed, stream.cancelled()));
                stream.finish();
            }
            _ => stream.destroy(),
        }
    }

    debug!("Shutdown ({:?}): waiting for {} streams", mode, pending.len());
    let mut waits: FuturesUnordered<_> = pending
        .into_iter()
        .map(|(id, (channel, stream))| async move {
            channel.cancelled().await;
            stream.cancelled().await;
            id
        })
        .collect();
    while let Some(id) = waits.next().await {
        trace!("Stream id={} released", short_id(&id));
    }

    match mode {
        Shutdown::Graceful => control.close(),
        Shutdown::Forced => control.destroy(),
    }
    control.destroyed().cancelled().await;
    debug!("Shutdown ({:?}) complete", mode);
}
