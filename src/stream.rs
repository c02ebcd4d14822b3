use crate::codec::{CodecContext, CodecSource, SharedCodec};
use crate::error::{Error, Result};
use crate::link::{Channel, ChannelEvent, Link};
use crate::protocol::{short_id, PROTOCOL_CHANNEL};
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Records held for the consumer before the stream counts as backpressured
pub const DEFAULT_READ_HIGH_WATER_MARK: usize = 16;

/// Stream state
///
/// ```text
/// Opening ─> Open ─> HalfClosedLocal ──> Destroyed
///    │         │                            ^
///    └─────────┴──> HalfClosedRemote ───────┘
/// ```
/// Any state may jump straight to `Destroyed` on forced destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for rendezvous and the channel's open handshake
    Opening,
    /// Active, can send/receive
    Open,
    /// Local side finished writing, waiting for the channel to go away
    HalfClosedLocal,
    /// Remote channel destroyed, local write side not yet finished
    HalfClosedRemote,
    /// Close logic has run; terminal
    Destroyed,
}

impl StreamState {
    fn on_open(self) -> Option<Self> {
        match self {
            StreamState::Opening => Some(StreamState::Open),
            _ => None,
        }
    }

    fn on_local_final(self) -> Option<Self> {
        match self {
            StreamState::Open => Some(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => Some(StreamState::Destroyed),
            _ => None,
        }
    }

    fn on_remote_closed(self) -> Option<Self> {
        match self {
            StreamState::Opening | StreamState::Open => Some(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => Some(StreamState::Destroyed),
            _ => None,
        }
    }

    fn on_destroy(self) -> Option<Self> {
        match self {
            StreamState::Destroyed => None,
            _ => Some(StreamState::Destroyed),
        }
    }

    pub fn is_destroyed(self) -> bool {
        self == StreamState::Destroyed
    }
}

/// Remote handshake presented to the acceptance hook
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub is_initiator: bool,
    pub id: Bytes,
    pub handshake: Bytes,
}

/// Asynchronous handshake-acceptance hook: `Ok(false)` rejects the stream
pub type HandshakeHook = Arc<dyn Fn(HandshakeInfo) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Wrap an async closure as a [`HandshakeHook`]
pub fn handshake_hook<F, Fut>(f: F) -> HandshakeHook
where
    F: Fn(HandshakeInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |info| Box::pin(f(info)))
}

/// Why a stream went down, kept so every observer sees the same error
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Rejected,
    Timeout,
    MultiplexerClosed,
    ChannelClosed,
    LinkClosed,
    FrameTooLarge(usize, usize),
    Codec(String),
    Other(String),
}

impl From<&Error> for Failure {
    fn from(e: &Error) -> Self {
        match e {
            Error::Rejected => Failure::Rejected,
            Error::Timeout => Failure::Timeout,
            Error::MultiplexerClosed => Failure::MultiplexerClosed,
            Error::ChannelClosed => Failure::ChannelClosed,
            Error::LinkClosed => Failure::LinkClosed,
            Error::FrameTooLarge(len, max) => Failure::FrameTooLarge(*len, *max),
            Error::Codec(msg) => Failure::Codec(msg.clone()),
            other => Failure::Other(other.to_string()),
        }
    }
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Failure::Rejected => Error::Rejected,
            Failure::Timeout => Error::Timeout,
            Failure::MultiplexerClosed => Error::MultiplexerClosed,
            Failure::ChannelClosed => Error::ChannelClosed,
            Failure::LinkClosed => Error::LinkClosed,
            Failure::FrameTooLarge(len, max) => Error::FrameTooLarge(*len, *max),
            Failure::Codec(msg) => Error::Codec(msg.clone()),
            Failure::Other(msg) => Error::Protocol(msg.clone()),
        }
    }
}

/// Construction parameters resolved by the multiplexer
pub(crate) struct StreamParams<T> {
    pub id: Bytes,
    pub is_initiator: bool,
    pub handshake: Bytes,
    pub codec: CodecSource<T>,
    pub on_handshake: Option<HandshakeHook>,
    pub high_water_mark: usize,
}

struct Inner<T> {
    state: StreamState,
    channel: Option<Arc<Channel>>,
    codec: Option<SharedCodec<T>>,
    remote_handshake: Option<Bytes>,
    /// Records ready for the consumer, at most `high_water_mark`
    readable: VecDeque<T>,
    /// Overflow kept while the consumer is backpressured
    queue: VecDeque<T>,
    corked: bool,
    /// No more inbound records will arrive
    eof: bool,
    /// Writes issued before open
    pending: VecDeque<T>,
    /// `finish()` called before open
    pending_final: bool,
    failure: Option<Failure>,
    failure_reported: bool,
}

struct Shared<T> {
    id: Bytes,
    is_initiator: bool,
    local_handshake: Bytes,
    high_water_mark: usize,
    codec_source: CodecSource<T>,
    on_handshake: Option<HandshakeHook>,
    inner: Mutex<Inner<T>>,
    state: watch::Sender<StreamState>,
    /// Records or EOF became available
    readable: Notify,
    /// Stream opened or went down
    writable: Notify,
    /// Consumer has room again; the driver rechecks cork state
    relieved: Notify,
    /// Serializes writers so only one waits on drain
    write_gate: tokio::sync::Mutex<()>,
    /// Cancelled on `Destroyed`
    cancel: CancellationToken,
}

/// Application-facing bidirectional stream backed by one data channel
///
/// Cloning is cheap; clones share the same stream.
pub struct VirtualStream<T> {
    shared: Arc<Shared<T>>,
    read_fut: Option<BoxFuture<'static, Option<Result<T>>>>,
    leftover: Bytes,
    write_fut: Option<BoxFuture<'static, Result<()>>>,
    write_len: usize,
}

impl<T> Clone for VirtualStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            read_fut: None,
            leftover: Bytes::new(),
            write_fut: None,
            write_len: 0,
        }
    }
}

impl<T> fmt::Debug for VirtualStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualStream")
            .field("id", &hex::encode(&self.shared.id))
            .field("is_initiator", &self.shared.is_initiator)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

impl<T: Send + 'static> VirtualStream<T> {
    pub(crate) fn new(params: StreamParams<T>) -> Self {
        let (state, _) = watch::channel(StreamState::Opening);
        let shared = Arc::new(Shared {
            id: params.id,
            is_initiator: params.is_initiator,
            local_handshake: params.handshake,
            high_water_mark: params.high_water_mark.max(1),
            codec_source: params.codec,
            on_handshake: params.on_handshake,
            inner: Mutex::new(Inner {
                state: StreamState::Opening,
                channel: None,
                codec: None,
                remote_handshake: None,
                readable: VecDeque::new(),
                queue: VecDeque::new(),
                corked: false,
                eof: false,
                pending: VecDeque::new(),
                pending_final: false,
                failure: None,
                failure_reported: false,
            }),
            state,
            readable: Notify::new(),
            writable: Notify::new(),
            relieved: Notify::new(),
            write_gate: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        Self {
            shared,
            read_fut: None,
            leftover: Bytes::new(),
            write_fut: None,
            write_len: 0,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> &Bytes {
        &self.shared.id
    }

    /// Whether this side requested the stream
    pub fn is_initiator(&self) -> bool {
        self.shared.is_initiator
    }

    /// Get current stream state
    pub fn state(&self) -> StreamState {
        self.shared.inner.lock().state
    }

    /// Local handshake sent at channel open
    pub fn handshake(&self) -> &Bytes {
        &self.shared.local_handshake
    }

    /// Remote handshake, once the stream has opened
    pub fn remote_handshake(&self) -> Option<Bytes> {
        self.shared.inner.lock().remote_handshake.clone()
    }

    /// Whether both handles refer to the same stream
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Wait for the open handshake
    ///
    /// Returns the remote handshake, or the error that prevented the stream
    /// from opening (rejection, timeout, destroy).
    pub fn connected(&self) -> impl Future<Output = Result<Bytes>> + Send + 'static {
        connected_owned(self.shared.clone())
    }

    /// Wait until the stream is destroyed
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.state.subscribe();
        async move {
            let _ = rx.wait_for(|s| s.is_destroyed()).await;
        }
    }

    /// Send one record
    ///
    /// Before open, up to the high-water mark of records are buffered and
    /// the call returns at once. Once open, the call returns when the link
    /// has room again.
    pub fn send(&self, item: T) -> impl Future<Output = Result<()>> + Send + 'static {
        send_owned(self.shared.clone(), item)
    }

    /// Receive the next record; `None` at end of stream
    pub fn recv(&self) -> impl Future<Output = Option<Result<T>>> + Send + 'static {
        recv_owned(self.shared.clone())
    }

    /// Finish the local write side (graceful close)
    pub fn finish(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.state == StreamState::Opening {
            inner.pending_final = true;
            return;
        }
        let Some(next) = inner.state.on_local_final() else {
            return;
        };
        if next == StreamState::HalfClosedLocal {
            if let Some(channel) = &inner.channel {
                channel.close();
            }
        }
        shared.transition(&mut inner, next);
    }

    /// Forced destroy; pending writes fail with `StreamDestroyed`
    pub fn destroy(&self) {
        self.shared.destroy(None);
    }

    /// Destroy with a recorded cause
    pub(crate) fn fail(&self, err: &Error) {
        self.shared.destroy(Some(Failure::from(err)));
    }

    /// Cancelled once the stream is destroyed
    pub(crate) fn cancelled(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Destruction signal of the underlying channel, once attached
    pub(crate) fn channel_destroyed(&self) -> Option<CancellationToken> {
        self.shared
            .inner
            .lock()
            .channel
            .as_ref()
            .map(|channel| channel.destroyed())
    }

    /// Create and open the local channel half, then start the driver
    pub(crate) fn attach(&self, link: &Link) -> Result<()> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.state != StreamState::Opening || inner.channel.is_some() {
            return Err(Error::StreamDestroyed);
        }

        let opened = link
            .create_channel(PROTOCOL_CHANNEL, shared.id.clone())
            .and_then(|(channel, events)| {
                channel.open(shared.local_handshake.clone())?;
                Ok((Arc::new(channel), events))
            });
        let (channel, events) = match opened {
            Ok(v) => v,
            Err(e) => {
                drop(inner);
                shared.destroy(Some(Failure::from(&e)));
                return Err(e);
            }
        };
        inner.channel = Some(channel.clone());
        drop(inner);

        trace!(
            "Attached stream id={} initiator={}",
            short_id(&shared.id),
            shared.is_initiator
        );
        tokio::spawn(drive(shared.clone(), channel, events));
        Ok(())
    }
}

impl<T: Send + 'static> Shared<T> {
    fn transition(&self, inner: &mut Inner<T>, next: StreamState) {
        trace!(
            "Stream id={} {:?} -> {:?}",
            short_id(&self.id),
            inner.state,
            next
        );
        inner.state = next;
        self.state.send_replace(next);
        if next == StreamState::Destroyed {
            self.cancel.cancel();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn destroy(&self, failure: Option<Failure>) {
        let mut inner = self.inner.lock();
        let Some(next) = inner.state.on_destroy() else {
            return;
        };
        if let Some(failure) = failure {
            inner.failure.get_or_insert(failure);
        }
        inner.readable.clear();
        inner.queue.clear();
        inner.pending.clear();
        inner.eof = true;
        let channel = inner.channel.clone();
        self.transition(&mut inner, next);
        drop(inner);

        if let Some(channel) = channel {
            channel.destroy();
        }
        debug!("Stream id={} destroyed", short_id(&self.id));
    }

    /// Move overflow into the consumer buffer; ask the driver to uncork once
    /// the overflow is gone
    fn refill(&self, inner: &mut Inner<T>) {
        while inner.readable.len() < self.high_water_mark {
            match inner.queue.pop_front() {
                Some(item) => inner.readable.push_back(item),
                None => break,
            }
        }
        if inner.corked && inner.queue.is_empty() {
            self.relieved.notify_one();
        }
    }

    async fn on_opened(&self, channel: &Channel, handshake: Bytes) {
        if self.inner.lock().state != StreamState::Opening {
            return;
        }

        if let Some(hook) = &self.on_handshake {
            let info = HandshakeInfo {
                is_initiator: self.is_initiator,
                id: self.id.clone(),
                handshake: handshake.clone(),
            };
            match hook(info).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Stream id={} rejected by handshake hook", short_id(&self.id));
                    self.destroy(Some(Failure::Rejected));
                    return;
                }
                Err(e) => {
                    warn!("Handshake hook failed for stream id={}: {}", short_id(&self.id), e);
                    self.destroy(Some(Failure::from(&e)));
                    return;
                }
            }
        }

        let codec = self.codec_source.resolve(CodecContext {
            is_initiator: self.is_initiator,
            id: &self.id,
            handshake: &handshake,
        });

        let mut inner = self.inner.lock();
        // Destroyed while the hook was pending
        let Some(next) = inner.state.on_open() else {
            return;
        };
        inner.codec = Some(codec.clone());
        inner.remote_handshake = Some(handshake);

        let pending: Vec<T> = inner.pending.drain(..).collect();
        for item in &pending {
            if let Err(e) = encode_and_send(channel, &codec, item) {
                drop(inner);
                warn!("Flushing early writes failed for stream id={}: {}", short_id(&self.id), e);
                self.destroy(Some(Failure::from(&e)));
                return;
            }
        }
        if !pending.is_empty() {
            trace!("Flushed {} early writes on stream id={}", pending.len(), short_id(&self.id));
        }

        self.transition(&mut inner, next);
        debug!(
            "Stream id={} open (initiator={})",
            short_id(&self.id),
            self.is_initiator
        );

        if inner.pending_final {
            inner.pending_final = false;
            if let Some(after) = next.on_local_final() {
                channel.close();
                self.transition(&mut inner, after);
            }
        }
    }

    fn on_message(&self, channel: &Channel, payload: Bytes) {
        let mut inner = self.inner.lock();
        if inner.state == StreamState::Destroyed {
            return;
        }
        let Some(codec) = inner.codec.clone() else {
            warn!("Message before open on stream id={}, dropping", short_id(&self.id));
            return;
        };
        let item = match codec.decode(payload) {
            Ok(item) => item,
            Err(e) => {
                drop(inner);
                warn!("Failed to decode message on stream id={}: {}", short_id(&self.id), e);
                self.destroy(Some(Failure::from(&e)));
                return;
            }
        };

        if !inner.queue.is_empty() || inner.readable.len() >= self.high_water_mark {
            inner.queue.push_back(item);
            if !inner.corked {
                inner.corked = true;
                channel.cork();
                trace!("Corked stream id={}", short_id(&self.id));
            }
        } else {
            inner.readable.push_back(item);
        }
        self.readable.notify_waiters();
    }

    fn recheck_backpressure(&self, channel: &Channel) {
        let mut inner = self.inner.lock();
        if inner.corked
            && inner.queue.is_empty()
            && inner.readable.len() < self.high_water_mark
        {
            inner.corked = false;
            channel.uncork();
            trace!("Uncorked stream id={}", short_id(&self.id));
        }
    }

    fn on_remote_closed(&self, transport_failed: bool) {
        let mut inner = self.inner.lock();
        inner.eof = true;
        let state = inner.state;
        let Some(next) = state.on_remote_closed() else {
            return;
        };
        if transport_failed {
            inner.failure.get_or_insert(Failure::LinkClosed);
        }
        if state == StreamState::Opening {
            inner.pending.clear();
            inner.failure.get_or_insert(Failure::ChannelClosed);
        }
        self.transition(&mut inner, next);
        // Finish the write side
        if let Some(after) = next.on_local_final() {
            self.transition(&mut inner, after);
        }
        debug!("Stream id={} closed by remote", short_id(&self.id));
    }
}

fn encode_and_send<T: Send + 'static>(
    channel: &Channel,
    codec: &SharedCodec<T>,
    item: &T,
) -> Result<bool> {
    let mut buf = BytesMut::new();
    codec.encode(item, &mut buf)?;
    channel.send(buf.freeze())
}

/// Per-stream driver task
///
/// Applies channel events in wire order and flips the cork once the
/// consumer has caught up.
async fn drive<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    channel: Arc<Channel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Opened(handshake)) => shared.on_opened(&channel, handshake).await,
                Some(ChannelEvent::Message(payload)) => shared.on_message(&channel, payload),
                Some(ChannelEvent::Closed) | None => {
                    shared.on_remote_closed(!channel.is_link_alive());
                    return;
                }
            },
            _ = shared.relieved.notified() => shared.recheck_backpressure(&channel),
        }
    }
}

async fn connected_owned<T: Send + 'static>(shared: Arc<Shared<T>>) -> Result<Bytes> {
    let mut rx = shared.state.subscribe();
    let _ = rx.wait_for(|s| *s != StreamState::Opening).await;
    let inner = shared.inner.lock();
    match &inner.remote_handshake {
        Some(handshake) => Ok(handshake.clone()),
        None => Err(inner
            .failure
            .as_ref()
            .map(Failure::to_error)
            .unwrap_or(Error::StreamDestroyed)),
    }
}

async fn recv_owned<T: Send + 'static>(shared: Arc<Shared<T>>) -> Option<Result<T>> {
    loop {
        let notified = shared.readable.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut inner = shared.inner.lock();
            shared.refill(&mut inner);
            if let Some(item) = inner.readable.pop_front() {
                shared.refill(&mut inner);
                return Some(Ok(item));
            }
            if !inner.failure_reported {
                if let Some(failure) = &inner.failure {
                    let err = failure.to_error();
                    inner.failure_reported = true;
                    return Some(Err(err));
                }
            }
            if inner.eof || inner.state == StreamState::Destroyed {
                return None;
            }
        }

        notified.await;
    }
}

async fn send_owned<T: Send + 'static>(shared: Arc<Shared<T>>, item: T) -> Result<()> {
    let _gate = shared.write_gate.lock().await;
    let mut item = Some(item);

    loop {
        let notified = shared.writable.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let congested = {
            let mut inner = shared.inner.lock();
            match inner.state {
                StreamState::Destroyed => {
                    return Err(inner
                        .failure
                        .as_ref()
                        .map(Failure::to_error)
                        .unwrap_or(Error::StreamDestroyed));
                }
                StreamState::HalfClosedLocal | StreamState::HalfClosedRemote => {
                    return Err(Error::ChannelClosed);
                }
                StreamState::Opening => {
                    if inner.pending_final {
                        return Err(Error::ChannelClosed);
                    }
                    if inner.pending.len() < shared.high_water_mark {
                        if let Some(item) = item.take() {
                            inner.pending.push_back(item);
                        }
                        return Ok(());
                    }
                    None
                }
                StreamState::Open => {
                    let (Some(channel), Some(codec), Some(item)) =
                        (inner.channel.clone(), inner.codec.clone(), item.as_ref())
                    else {
                        return Err(Error::ChannelClosed);
                    };
                    if encode_and_send(&channel, &codec, item)? {
                        return Ok(());
                    }
                    Some(channel)
                }
            }
        };

        match congested {
            // Early-write buffer full: wait for open or destroy
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = shared.cancel.cancelled() => {}
                }
            }
            Some(channel) => {
                trace!("Stream id={} waiting for link drain", short_id(&shared.id));
                return tokio::select! {
                    drained = channel.drained() => drained,
                    _ = shared.cancel.cancelled() => Err(Error::StreamDestroyed),
                };
            }
        }
    }
}

impl<T> VirtualStream<T> {
    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some(fut) = self.write_fut.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let result = ready!(fut.as_mut().poll(cx));
        self.write_fut = None;
        Poll::Ready(result.map(|()| self.write_len).map_err(io::Error::from))
    }
}

impl AsyncRead for VirtualStream<Bytes> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.leftover.is_empty() {
                let n = buf.remaining().min(this.leftover.len());
                buf.put_slice(&this.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let shared = this.shared.clone();
            let fut = this
                .read_fut
                .get_or_insert_with(|| recv_owned(shared).boxed());
            let next = ready!(fut.as_mut().poll(cx));
            this.read_fut = None;

            match next {
                // Empty records carry no bytes; keep reading
                Some(Ok(bytes)) => this.leftover = bytes,
                Some(Err(e)) => return Poll::Ready(Err(e.into())),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for VirtualStream<Bytes> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_fut.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.write_len = buf.len();
            this.write_fut =
                Some(send_owned(this.shared.clone(), Bytes::copy_from_slice(buf)).boxed());
        }
        this.poll_pending_write(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        this.finish();
        Poll::Ready(Ok(()))
    }
}
