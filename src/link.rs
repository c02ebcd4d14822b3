//! Channel multiplexer over one framed byte transport.
//!
//! A [`Link`] owns a reader task and a writer task on top of any
//! `AsyncRead + AsyncWrite` transport. Both peers create [`Channel`]s keyed by
//! `(protocol, id)`; a local channel pairs with the remote `OPEN` for the same
//! key, whichever side opens first.
//!
//! ```text
//!  Channel ─┐                          ┌─> reader_task ─> per-channel events
//!  Channel ─┼─> outgoing queue ─> writer_task ─> transport
//!  Channel ─┘
//! ```

use crate::error::{Error, Result};
use crate::protocol::{short_id, Frame};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Default maximum encoded frame length (1 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Default outbound high-water mark (64 KiB)
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Link tuning
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Largest frame accepted or produced
    pub max_frame_length: usize,
    /// Queued outbound bytes above which `Channel::send` reports congestion
    pub high_water_mark: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl LinkConfig {
    pub fn max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }
}

/// Events delivered to a channel's owner, in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Paired with the remote half; carries the remote handshake
    Opened(Bytes),
    /// One inbound message
    Message(Bytes),
    /// Channel is gone; no further events follow
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    protocol: String,
    id: Bytes,
}

struct RemoteOpen {
    remote: u32,
    handshake: Bytes,
}

struct Slot {
    key: ChannelKey,
    /// OPEN sent
    opened: bool,
    /// Remote channel number once paired
    remote: Option<u32>,
    /// CLOSE sent
    local_closed: bool,
    /// Destroyed, kept only to flush held events
    dead: bool,
    corked: bool,
    held: VecDeque<ChannelEvent>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    destroyed: CancellationToken,
}

impl Slot {
    fn deliver(&mut self, event: ChannelEvent) {
        if self.corked || !self.held.is_empty() {
            self.held.push_back(event);
        } else {
            let _ = self.events.send(event);
        }
    }
}

#[derive(Default)]
struct LinkState {
    next_local: u32,
    slots: HashMap<u32, Slot>,
    by_key: HashMap<ChannelKey, u32>,
    by_remote: HashMap<u32, u32>,
    /// Remote opens with no local channel opened for their key yet
    parked: HashMap<ChannelKey, RemoteOpen>,
    closed: bool,
}

impl LinkState {
    fn pair(&mut self, local: u32, remote: RemoteOpen) {
        if let Some(slot) = self.slots.get_mut(&local) {
            slot.remote = Some(remote.remote);
            self.by_remote.insert(remote.remote, local);
            trace!(
                "Paired channel local={} remote={} protocol={} id={}",
                local,
                remote.remote,
                slot.key.protocol,
                short_id(&slot.key.id)
            );
            slot.deliver(ChannelEvent::Opened(remote.handshake));
        }
    }

    /// Unroute a channel and signal its destruction. Held events are still
    /// flushed on uncork; `Closed` is queued behind them.
    fn kill(&mut self, local: u32) {
        let Some(slot) = self.slots.get_mut(&local) else {
            return;
        };
        if slot.dead {
            return;
        }
        slot.dead = true;
        if self.by_key.get(&slot.key) == Some(&local) {
            self.by_key.remove(&slot.key);
        }
        if let Some(remote) = slot.remote {
            self.by_remote.remove(&remote);
        }
        slot.deliver(ChannelEvent::Closed);
        slot.destroyed.cancel();
        debug!(
            "Channel destroyed local={} protocol={} id={}",
            local,
            slot.key.protocol,
            short_id(&slot.key.id)
        );
        if slot.held.is_empty() {
            self.slots.remove(&local);
        }
    }
}

struct Shared {
    state: Mutex<LinkState>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    /// Encoded bytes queued but not yet flushed to the transport
    queued: AtomicUsize,
    drain: Notify,
    config: LinkConfig,
    cancel: CancellationToken,
}

impl Shared {
    /// Encode and queue one frame
    ///
    /// A frame that cannot be put on the wire fails here, so only the
    /// calling channel sees the error.
    fn enqueue(&self, frame: Frame) -> Result<usize> {
        let len = frame.encoded_len();
        if len > self.config.max_frame_length {
            return Err(Error::FrameTooLarge(len, self.config.max_frame_length));
        }
        let encoded = frame.encode()?;
        let queued = self.queued.fetch_add(len, Ordering::AcqRel) + len;
        if self.outgoing.send(encoded).is_err() {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            return Err(Error::LinkClosed);
        }
        Ok(queued)
    }

    fn is_congested(&self) -> bool {
        self.queued.load(Ordering::Acquire) > self.config.high_water_mark
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        // Cancel before killing so channel owners observe a dead link
        self.cancel.cancel();
        let locals: Vec<u32> = state.slots.keys().copied().collect();
        for local in locals {
            state.kill(local);
        }
        state.parked.clear();
        drop(state);
        self.drain.notify_waiters();
        debug!("Link closed");
    }
}

/// Channel multiplexer bound to one transport
///
/// Cloning is cheap; all clones share the same transport and channel table.
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// Wrap a transport and spawn the reader and writer tasks
    pub fn new<T>(io: T, config: LinkConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(LinkState::default()),
            outgoing: outgoing_tx,
            queued: AtomicUsize::new(0),
            drain: Notify::new(),
            config,
            cancel: CancellationToken::new(),
        });

        let (read_half, write_half) = tokio::io::split(io);
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(shared.config.max_frame_length)
                .new_codec()
        };
        let framed_read = FramedRead::new(read_half, codec());
        let framed_write = FramedWrite::new(write_half, codec());

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = reader_task(framed_read, &reader_shared).await {
                error!("Reader task error: {}", e);
            }
            reader_shared.teardown();
        });

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = writer_task(framed_write, outgoing_rx, &writer_shared).await {
                error!("Writer task error: {}", e);
            }
            writer_shared.teardown();
        });

        Self { shared }
    }

    /// Two links joined by an in-memory duplex pipe
    pub fn pair(config: LinkConfig) -> (Link, Link) {
        let (a, b) = tokio::io::duplex(config.max_frame_length.max(64 * 1024));
        (Link::new(a, config.clone()), Link::new(b, config))
    }

    /// Create a local channel half for `(protocol, id)`
    ///
    /// Returns the handle and the receiver of its events. At most one live
    /// channel may exist per key.
    pub fn create_channel(
        &self,
        protocol: &str,
        id: Bytes,
    ) -> Result<(Channel, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let key = ChannelKey {
            protocol: protocol.to_string(),
            id,
        };
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::LinkClosed);
        }
        if state.by_key.contains_key(&key) {
            return Err(Error::ChannelExists {
                protocol: key.protocol,
                id: hex::encode(&key.id),
            });
        }

        let local = state.next_local;
        state.next_local = state.next_local.wrapping_add(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let destroyed = CancellationToken::new();
        state.by_key.insert(key.clone(), local);
        state.slots.insert(
            local,
            Slot {
                key: key.clone(),
                opened: false,
                remote: None,
                local_closed: false,
                dead: false,
                corked: false,
                held: VecDeque::new(),
                events: events_tx,
                destroyed: destroyed.clone(),
            },
        );
        trace!(
            "Created channel local={} protocol={} id={}",
            local,
            key.protocol,
            short_id(&key.id)
        );

        Ok((
            Channel {
                shared: self.shared.clone(),
                local,
                key,
                destroyed,
            },
            events_rx,
        ))
    }

    /// Whether queued outbound bytes exceed the high-water mark
    pub fn is_congested(&self) -> bool {
        self.shared.is_congested()
    }

    /// Wait until the outbound queue is back under the high-water mark
    ///
    /// The drain notification is shared by every waiter, so each one
    /// re-checks congestion after waking.
    pub async fn drained(&self) -> Result<()> {
        loop {
            let notified = self.shared.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.cancel.is_cancelled() {
                return Err(Error::LinkClosed);
            }
            if !self.shared.is_congested() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Check if the transport is still up
    pub fn is_alive(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Resolves once the link has shut down
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Get the number of live channels
    pub fn channel_count(&self) -> usize {
        self.shared.state.lock().by_key.len()
    }

    /// Destroy every channel and stop the transport tasks
    pub fn close(&self) {
        self.shared.teardown();
    }
}

/// One half of a paired channel
///
/// Dropping the handle does not close the channel; call [`Channel::close`]
/// or [`Channel::destroy`].
pub struct Channel {
    shared: Arc<Shared>,
    local: u32,
    key: ChannelKey,
    destroyed: CancellationToken,
}

impl Channel {
    pub fn protocol(&self) -> &str {
        &self.key.protocol
    }

    pub fn id(&self) -> &Bytes {
        &self.key.id
    }

    /// Send OPEN with the local handshake
    ///
    /// Pairs at once if the remote half has already opened.
    pub fn open(&self, handshake: Bytes) -> Result<()> {
        let mut state = self.shared.state.lock();
        let slot = match state.slots.get_mut(&self.local) {
            Some(slot) if !slot.dead && !slot.local_closed => slot,
            _ => return Err(Error::ChannelClosed),
        };
        if slot.opened {
            return Err(Error::Protocol(format!(
                "Channel {} already opened",
                self.local
            )));
        }
        self.shared.enqueue(Frame::Open {
            channel: self.local,
            protocol: self.key.protocol.clone(),
            id: self.key.id.clone(),
            handshake,
        })?;
        slot.opened = true;

        if let Some(remote) = state.parked.remove(&self.key) {
            state.pair(self.local, remote);
        }
        Ok(())
    }

    /// Queue one message for the remote half
    ///
    /// Returns `Ok(false)` when the link's outbound buffer is above its
    /// high-water mark; the message is still queued.
    pub fn send(&self, payload: Bytes) -> Result<bool> {
        let state = self.shared.state.lock();
        match state.slots.get(&self.local) {
            Some(slot) if !slot.dead && !slot.local_closed && slot.remote.is_some() => {}
            _ => return Err(Error::ChannelClosed),
        }
        let queued = self.shared.enqueue(Frame::Message {
            channel: self.local,
            payload,
        })?;
        drop(state);
        Ok(queued <= self.shared.config.high_water_mark)
    }

    /// Hold inbound events inside the link
    pub fn cork(&self) {
        if let Some(slot) = self.shared.state.lock().slots.get_mut(&self.local) {
            slot.corked = true;
        }
    }

    /// Resume inbound delivery, flushing held events in order
    pub fn uncork(&self) {
        let mut state = self.shared.state.lock();
        let Some(slot) = state.slots.get_mut(&self.local) else {
            return;
        };
        slot.corked = false;
        while let Some(event) = slot.held.pop_front() {
            let _ = slot.events.send(event);
        }
        if slot.dead {
            state.slots.remove(&self.local);
        }
    }

    pub fn is_corked(&self) -> bool {
        self.shared
            .state
            .lock()
            .slots
            .get(&self.local)
            .map(|slot| slot.corked)
            .unwrap_or(false)
    }

    /// Graceful close
    ///
    /// CLOSE is queued behind in-flight messages. A paired channel is
    /// destroyed once the remote answers; an unpaired one immediately.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        let Some(slot) = state.slots.get_mut(&self.local) else {
            return;
        };
        if slot.dead || slot.local_closed {
            return;
        }
        slot.local_closed = true;
        let opened = slot.opened;
        let paired = slot.remote.is_some();
        if opened {
            let _ = self.shared.enqueue(Frame::Close {
                channel: self.local,
            });
        }
        if !paired {
            state.kill(self.local);
        }
    }

    /// Immediate teardown; held inbound events are discarded
    pub fn destroy(&self) {
        let mut state = self.shared.state.lock();
        let Some(slot) = state.slots.get_mut(&self.local) else {
            return;
        };
        if slot.dead {
            return;
        }
        slot.held.clear();
        slot.corked = false;
        if slot.opened && !slot.local_closed {
            slot.local_closed = true;
            let _ = self.shared.enqueue(Frame::Close {
                channel: self.local,
            });
        }
        state.kill(self.local);
    }

    /// Whether the underlying transport is still up
    pub fn is_link_alive(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Whether the channel has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    /// Token cancelled exactly once, when the channel is destroyed
    ///
    /// Fires regardless of cork state.
    pub fn destroyed(&self) -> CancellationToken {
        self.destroyed.clone()
    }

    /// Wait for the link's outbound queue to drain
    pub async fn drained(&self) -> Result<()> {
        Link {
            shared: self.shared.clone(),
        }
        .drained()
        .await
    }
}

/// Background reader task
///
/// Decodes frames from the transport and routes them to channel slots.
async fn reader_task<R>(mut framed: FramedRead<R, LengthDelimitedCodec>, shared: &Shared) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            next = framed.next() => {
                let buf = match next {
                    Some(result) => result?,
                    None => {
                        debug!("Transport reached EOF");
                        return Ok(());
                    }
                };
                let frame = match Frame::decode(buf.freeze()) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("Failed to decode frame: {}", e);
                        continue;
                    }
                };
                handle_frame(shared, frame);
            }
            _ = shared.cancel.cancelled() => {
                debug!("Reader task cancelled");
                return Ok(());
            }
        }
    }
}

fn handle_frame(shared: &Shared, frame: Frame) {
    let mut state = shared.state.lock();
    match frame {
        Frame::Open {
            channel,
            protocol,
            id,
            handshake,
        } => {
            trace!("rx OPEN remote={} protocol={} id={}", channel, protocol, short_id(&id));
            if state.by_remote.contains_key(&channel) {
                warn!("Duplicate OPEN for remote channel {}, ignoring", channel);
                return;
            }
            let key = ChannelKey { protocol, id };
            let remote = RemoteOpen {
                remote: channel,
                handshake,
            };
            let local = state.by_key.get(&key).copied();
            match local {
                Some(local)
                    if state
                        .slots
                        .get(&local)
                        .map(|s| s.opened && s.remote.is_none() && !s.local_closed)
                        .unwrap_or(false) =>
                {
                    state.pair(local, remote);
                }
                _ => {
                    if state.parked.insert(key, remote).is_some() {
                        warn!("Remote re-opened an unpaired channel; keeping the latest");
                    }
                }
            }
        }
        Frame::Message { channel, payload } => {
            let Some(local) = state.by_remote.get(&channel).copied() else {
                trace!("Message for unknown remote channel {}, dropping", channel);
                return;
            };
            trace!("rx MESSAGE remote={} len={}", channel, payload.len());
            if let Some(slot) = state.slots.get_mut(&local) {
                slot.deliver(ChannelEvent::Message(payload));
            }
        }
        Frame::Close { channel } => {
            trace!("rx CLOSE remote={}", channel);
            if let Some(local) = state.by_remote.get(&channel).copied() {
                if let Some(slot) = state.slots.get_mut(&local) {
                    if !slot.local_closed {
                        slot.local_closed = true;
                        let _ = shared.enqueue(Frame::Close { channel: local });
                    }
                }
                state.kill(local);
                return;
            }
            // Remote gave up before we paired
            let parked_key = state
                .parked
                .iter()
                .find(|(_, open)| open.remote == channel)
                .map(|(key, _)| key.clone());
            match parked_key {
                Some(key) => {
                    state.parked.remove(&key);
                    trace!("Dropped parked OPEN for remote channel {}", channel);
                }
                None => trace!("CLOSE for unknown remote channel {}", channel),
            }
        }
    }
}

/// Background writer task
///
/// Drains the outgoing queue onto the transport, batching whatever is ready
/// before each flush, and fires the drain notification.
async fn writer_task<W>(
    mut framed: FramedWrite<W, LengthDelimitedCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    shared: &Shared,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    debug!("Outgoing queue closed");
                    return Ok(());
                };
                let mut written = 0;
                let mut next = Some(frame);
                while let Some(frame) = next.take() {
                    written += frame.len();
                    framed.feed(frame).await?;
                    next = outgoing.try_recv().ok();
                }
                SinkExt::<Bytes>::flush(&mut framed).await?;
                let before = shared.queued.fetch_sub(written, Ordering::AcqRel);
                trace!("Flushed {} bytes, {} still queued", written, before - written);
                if before - written <= shared.config.high_water_mark {
                    shared.drain.notify_waiters();
                }
            }
            _ = shared.cancel.cancelled() => {
                // Push out whatever was queued before shutdown (e.g. final CLOSE frames)
                while let Ok(frame) = outgoing.try_recv() {
                    framed.feed(frame).await?;
                }
                let _ = SinkExt::<Bytes>::flush(&mut framed).await;
                debug!("Writer task cancelled");
                return Ok(());
            }
        }
    }
}
