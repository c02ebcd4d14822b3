use crate::codec::{Codec, CodecSource, ControlCodec, SharedCodec};
use crate::error::{Error, Result};
use crate::link::{Channel, ChannelEvent, Link};
use crate::protocol::{short_id, ControlMessage, PROTOCOL_CONTROL};
use crate::rendezvous::{Listener, Rendezvous};
use crate::shutdown::{self, Shutdown};
use crate::stream::{HandshakeHook, VirtualStream, DEFAULT_READ_HIGH_WATER_MARK};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// How long an inbound request waits for a listener before it is declined
pub const DEFAULT_PARK_TIMEOUT: Duration = Duration::from_secs(2);

/// Multiplexer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    /// Control channel not yet open on both sides
    Connecting,
    Open,
    /// `close()` or `destroy()` in progress
    Closing,
    /// Control channel destroyed; terminal
    Closed,
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// Control channel opened; carries the remote control handshake
    Opened { handshake: Bytes },
    /// Control channel destroyed
    Closed { protocol: String, id: Bytes },
    /// Non-fatal control-plane error
    Error(String),
}

/// Multiplexer configuration
pub struct MultiplexerConfig<T> {
    /// Default handshake sent when a stream's channel opens
    pub handshake: Bytes,
    pub codec: CodecSource<T>,
    /// Default handshake-acceptance hook
    pub on_handshake: Option<HandshakeHook>,
    pub read_high_water_mark: usize,
    /// Default open timeout for `connect`; `None` waits forever
    pub connect_timeout: Option<Duration>,
    /// How long a remote request may wait for a listener; `None` parks it
    /// until the multiplexer closes
    pub park_timeout: Option<Duration>,
    /// Id of the control channel; both peers must agree
    pub control_id: Bytes,
    pub control_handshake: Bytes,
    pub control_codec: SharedCodec<ControlMessage>,
}

impl<T: Send + 'static> MultiplexerConfig<T> {
    pub fn new(codec: CodecSource<T>) -> Self {
        Self {
            handshake: Bytes::new(),
            codec,
            on_handshake: None,
            read_high_water_mark: DEFAULT_READ_HIGH_WATER_MARK,
            connect_timeout: None,
            park_timeout: Some(DEFAULT_PARK_TIMEOUT),
            control_id: Bytes::new(),
            control_handshake: Bytes::new(),
            control_codec: Arc::new(ControlCodec),
        }
    }

    pub fn handshake(mut self, handshake: impl Into<Bytes>) -> Self {
        self.handshake = handshake.into();
        self
    }

    pub fn on_handshake(mut self, hook: HandshakeHook) -> Self {
        self.on_handshake = Some(hook);
        self
    }

    pub fn read_high_water_mark(mut self, records: usize) -> Self {
        self.read_high_water_mark = records;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn park_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.park_timeout = timeout;
        self
    }

    pub fn control_id(mut self, id: impl Into<Bytes>) -> Self {
        self.control_id = id.into();
        self
    }

    pub fn control_handshake(mut self, handshake: impl Into<Bytes>) -> Self {
        self.control_handshake = handshake.into();
        self
    }

    pub fn control_codec<C: Codec<Item = ControlMessage>>(mut self, codec: C) -> Self {
        self.control_codec = Arc::new(codec);
        self
    }
}

impl Default for MultiplexerConfig<Bytes> {
    fn default() -> Self {
        Self::new(CodecSource::default())
    }
}

impl<T> Clone for MultiplexerConfig<T> {
    fn clone(&self) -> Self {
        Self {
            handshake: self.handshake.clone(),
            codec: self.codec.clone(),
            on_handshake: self.on_handshake.clone(),
            read_high_water_mark: self.read_high_water_mark,
            connect_timeout: self.connect_timeout,
            park_timeout: self.park_timeout,
            control_id: self.control_id.clone(),
            control_handshake: self.control_handshake.clone(),
            control_codec: self.control_codec.clone(),
        }
    }
}

impl<T> fmt::Debug for MultiplexerConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerConfig")
            .field("handshake", &self.handshake)
            .field("codec", &self.codec)
            .field("on_handshake", &self.on_handshake.is_some())
            .field("read_high_water_mark", &self.read_high_water_mark)
            .field("connect_timeout", &self.connect_timeout)
            .field("park_timeout", &self.park_timeout)
            .field("control_id", &self.control_id)
            .finish()
    }
}

/// Per-call overrides for [`Multiplexer::connect`]
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Stream id; a random 32-byte id when unset
    pub id: Option<Bytes>,
    pub handshake: Option<Bytes>,
    pub on_handshake: Option<HandshakeHook>,
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<Bytes>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn handshake(mut self, handshake: impl Into<Bytes>) -> Self {
        self.handshake = Some(handshake.into());
        self
    }

    pub fn on_handshake(mut self, hook: HandshakeHook) -> Self {
        self.on_handshake = Some(hook);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("id", &self.id)
            .field("handshake", &self.handshake)
            .field("on_handshake", &self.on_handshake.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Per-listener overrides
#[derive(Clone, Default)]
pub struct ListenOptions {
    pub handshake: Option<Bytes>,
    pub on_handshake: Option<HandshakeHook>,
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handshake(mut self, handshake: impl Into<Bytes>) -> Self {
        self.handshake = Some(handshake.into());
        self
    }

    pub fn on_handshake(mut self, hook: HandshakeHook) -> Self {
        self.on_handshake = Some(hook);
        self
    }
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("handshake", &self.handshake)
            .field("on_handshake", &self.on_handshake.is_some())
            .finish()
    }
}

struct MuxInner<T> {
    link: Link,
    control: Arc<Channel>,
    rendezvous: Arc<Rendezvous<T>>,
    state: watch::Sender<MuxState>,
    events: broadcast::Sender<MuxEvent>,
    remote_handshake: Mutex<Option<Bytes>>,
    /// Highest shutdown mode started so far (0 = none)
    shutdown: AtomicU8,
}

/// Stream multiplexer over one [`Link`]
///
/// Owns the control channel, the listener registry and the set of active
/// streams. Cloning is cheap; all clones drive the same multiplexer.
pub struct Multiplexer<T = Bytes> {
    inner: Arc<MuxInner<T>>,
}

impl<T> Clone for Multiplexer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Multiplexer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("control_id", self.inner.control.id())
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<T: Send + 'static> Multiplexer<T> {
    /// Open the control channel on `link` and start the control task
    pub fn new(link: Link, config: MultiplexerConfig<T>) -> Result<Self> {
        let (control, events) = link.create_channel(PROTOCOL_CONTROL, config.control_id.clone())?;
        let control = Arc::new(control);
        let control_handshake = config.control_handshake.clone();

        let (state, _) = watch::channel(MuxState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(MuxInner {
            rendezvous: Rendezvous::new(link.clone(), control.clone(), config),
            link,
            control: control.clone(),
            state,
            events: events_tx,
            remote_handshake: Mutex::new(None),
            shutdown: AtomicU8::new(0),
        });

        control.open(control_handshake)?;
        debug!("Opening control channel id={}", short_id(control.id()));
        tokio::spawn(control_task(inner.clone(), events));

        Ok(Self { inner })
    }

    /// Request a stream from the remote side
    ///
    /// Returns at once; the stream buffers writes until it opens. On a
    /// closing multiplexer the returned stream is already destroyed.
    pub fn connect(&self, opts: ConnectOptions) -> VirtualStream<T> {
        self.inner.rendezvous.connect(opts)
    }

    /// Accept streams for any id without a dedicated listener
    pub fn listen(&self) -> Listener<T> {
        self.listen_with(ListenOptions::default())
    }

    pub fn listen_with(&self, opts: ListenOptions) -> Listener<T> {
        self.inner.rendezvous.listen(opts)
    }

    /// Accept streams for one id
    pub fn listen_on(&self, id: impl Into<Bytes>) -> Listener<T> {
        self.listen_on_with(id, ListenOptions::default())
    }

    pub fn listen_on_with(&self, id: impl Into<Bytes>, opts: ListenOptions) -> Listener<T> {
        self.inner.rendezvous.listen_on(id.into(), opts)
    }

    pub fn unlisten(&self, id: &[u8]) {
        self.inner.rendezvous.unlisten(id)
    }

    /// Streams that are opening or attached
    pub fn streams(&self) -> Vec<VirtualStream<T>> {
        self.inner.rendezvous.streams()
    }

    /// Get the number of live streams
    pub fn stream_count(&self) -> usize {
        self.inner.rendezvous.stream_count()
    }

    pub fn state(&self) -> MuxState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<MuxEvent> {
        self.inner.events.subscribe()
    }

    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    /// Wait for the control channel to open; returns the remote control
    /// handshake
    pub async fn opened(&self) -> Result<Bytes> {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s != MuxState::Connecting).await;
        self.inner
            .remote_handshake
            .lock()
            .clone()
            .ok_or(Error::MultiplexerClosed)
    }

    /// Graceful close
    ///
    /// Finishes every stream, waits for each data channel to be destroyed on
    /// both sides, then closes the control channel. Safe to call repeatedly;
    /// every call resolves once the multiplexer is closed.
    pub async fn close(&self) {
        self.start_shutdown(Shutdown::Graceful);
        self.closed().await;
    }

    /// Forced close: destroys every stream and the control channel
    pub async fn destroy(&self) {
        self.start_shutdown(Shutdown::Forced);
        self.closed().await;
    }

    /// Resolves once the control channel is destroyed
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == MuxState::Closed).await;
    }

    fn start_shutdown(&self, mode: Shutdown) {
        let previous = self.inner.shutdown.fetch_max(mode as u8, Ordering::SeqCst);
        if previous >= mode as u8 {
            return;
        }
        let started = self.inner.state.send_if_modified(|state| match state {
            MuxState::Closed => false,
            MuxState::Closing => true,
            _ => {
                *state = MuxState::Closing;
                true
            }
        });
        if !started {
            return;
        }
        debug!("Closing multiplexer ({:?})", mode);
        tokio::spawn(shutdown::run(
            self.inner.rendezvous.clone(),
            self.inner.control.clone(),
            mode,
        ));
    }
}

/// Control channel task
///
/// Feeds control messages to the rendezvous table and marks the multiplexer
/// closed once the control channel is gone, whichever side closed it.
async fn control_task<T: Send + 'static>(
    inner: Arc<MuxInner<T>>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Opened(handshake) => {
                *inner.remote_handshake.lock() = Some(handshake.clone());
                inner.state.send_if_modified(|state| {
                    if *state == MuxState::Connecting {
                        *state = MuxState::Open;
                        true
                    } else {
                        false
                    }
                });
                inner.rendezvous.control_opened();
                debug!("Control channel open");
                let _ = inner.events.send(MuxEvent::Opened { handshake });
            }
            ChannelEvent::Message(payload) => match inner.rendezvous.decode_control(payload) {
                Ok(msg) => {
                    trace!(
                        "Control message initiator={} declined={} id={}",
                        msg.is_initiator,
                        msg.declined,
                        short_id(&msg.id)
                    );
                    inner.rendezvous.on_control(msg);
                }
                Err(e) => {
                    warn!("Dropping malformed control message: {}", e);
                    let _ = inner.events.send(MuxEvent::Error(e.to_string()));
                }
            },
            ChannelEvent::Closed => break,
        }
    }

    // Remote teardown lands here too: nothing new may start
    let (opening, _) = inner.rendezvous.begin_closing();
    for stream in opening {
        stream.fail(&Error::MultiplexerClosed);
    }
    let _ = inner.events.send(MuxEvent::Closed {
        protocol: PROTOCOL_CONTROL.to_string(),
        id: inner.control.id().clone(),
    });
    inner.state.send_replace(MuxState::Closed);
    debug!("Multiplexer closed");
}
