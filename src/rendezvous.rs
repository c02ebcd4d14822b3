//! Control-channel rendezvous.
//!
//! A stream is requested by sending `{is_initiator: true, id}` over the
//! control channel and answered with `{is_initiator: false, id}`. Each side
//! creates its data channel half for `id` only once it knows the other side
//! wants the stream: the responder right before it sends the ack, the
//! initiator as soon as the ack arrives.
//!
//! A request nobody listens for is parked. If no listener shows up within
//! the park window, the request is answered with a decline and the
//! initiator's stream goes down with `Error::Rejected`.

use crate::codec::SharedCodec;
use crate::error::{Error, Result};
use crate::link::{Channel, Link};
use crate::multiplexer::{ConnectOptions, ListenOptions, MultiplexerConfig};
use crate::protocol::{random_id, short_id, ControlMessage, MAX_ID_LEN, PROTOCOL_CHANNEL};
use crate::stream::{HandshakeHook, StreamParams, VirtualStream};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Buffered inbound streams per listener
const LISTENER_BACKLOG: usize = 16;

/// A stream accepted by a [`Listener`]
#[derive(Debug)]
pub struct Incoming<T> {
    pub stream: VirtualStream<T>,
    pub id: Bytes,
    /// Handshake the initiator sent at channel open
    pub handshake: Bytes,
}

/// Receives inbound streams for one id, or for every id
pub struct Listener<T> {
    id: Option<Bytes>,
    rx: mpsc::Receiver<Incoming<T>>,
}

impl<T> Listener<T> {
    /// The id this listener is bound to; `None` for the catch-all listener
    pub fn id(&self) -> Option<&Bytes> {
        self.id.as_ref()
    }

    /// Accept the next inbound stream once its open handshake has completed
    pub async fn accept(&mut self) -> Result<Incoming<T>> {
        self.rx.recv().await.ok_or(Error::MultiplexerClosed)
    }
}

struct ListenerEntry<T> {
    tx: mpsc::Sender<Incoming<T>>,
    handshake: Option<Bytes>,
    on_handshake: Option<HandshakeHook>,
}

impl<T> Clone for ListenerEntry<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            handshake: self.handshake.clone(),
            on_handshake: self.on_handshake.clone(),
        }
    }
}

/// A remote request waiting for a listener
struct Parked {
    id: Bytes,
    /// Distinguishes re-parks of the same id for the decline timer
    ticket: u64,
}

struct Table<T> {
    control_open: bool,
    /// Control messages issued before the control channel opened
    outbox: Vec<ControlMessage>,
    closing: bool,
    /// Local requests awaiting an ack
    waiters: HashMap<Bytes, VirtualStream<T>>,
    /// Streams with an attached data channel
    active: HashMap<Bytes, VirtualStream<T>>,
    /// Remote requests no listener has taken yet, in arrival order
    parked: VecDeque<Parked>,
    next_ticket: u64,
    listeners: HashMap<Bytes, ListenerEntry<T>>,
    catch_all: Option<ListenerEntry<T>>,
}

impl<T> Table<T> {
    /// Listener for `id`: exact match first, then catch-all. Dropped
    /// listeners are pruned on the way.
    fn listener_for(&mut self, id: &Bytes) -> Option<ListenerEntry<T>> {
        if let Some(entry) = self.listeners.get(id) {
            if !entry.tx.is_closed() {
                return Some(entry.clone());
            }
            self.listeners.remove(id);
        }
        if let Some(entry) = &self.catch_all {
            if !entry.tx.is_closed() {
                return Some(entry.clone());
            }
            self.catch_all = None;
        }
        None
    }

    fn take_parked(&mut self, id: &Bytes) -> bool {
        match self.parked.iter().position(|parked| parked.id == *id) {
            Some(pos) => {
                self.parked.remove(pos);
                true
            }
            None => false,
        }
    }

    fn is_parked(&self, id: &Bytes) -> bool {
        self.parked.iter().any(|parked| parked.id == *id)
    }
}

pub(crate) struct Rendezvous<T> {
    link: Link,
    control: Arc<Channel>,
    control_codec: SharedCodec<ControlMessage>,
    config: MultiplexerConfig<T>,
    table: Mutex<Table<T>>,
}

impl<T: Send + 'static> Rendezvous<T> {
    pub(crate) fn new(link: Link, control: Arc<Channel>, config: MultiplexerConfig<T>) -> Arc<Self> {
        Arc::new(Self {
            link,
            control,
            control_codec: config.control_codec.clone(),
            config,
            table: Mutex::new(Table {
                control_open: false,
                outbox: Vec::new(),
                closing: false,
                waiters: HashMap::new(),
                active: HashMap::new(),
                parked: VecDeque::new(),
                next_ticket: 0,
                listeners: HashMap::new(),
                catch_all: None,
            }),
        })
    }

    fn params(
        &self,
        id: Bytes,
        is_initiator: bool,
        handshake: Option<Bytes>,
        on_handshake: Option<HandshakeHook>,
    ) -> StreamParams<T> {
        StreamParams {
            id,
            is_initiator,
            handshake: handshake.unwrap_or_else(|| self.config.handshake.clone()),
            codec: self.config.codec.clone(),
            on_handshake: on_handshake.or_else(|| self.config.on_handshake.clone()),
            high_water_mark: self.config.read_high_water_mark,
        }
    }

    fn send_control(&self, table: &mut Table<T>, msg: ControlMessage) -> Result<()> {
        if !table.control_open {
            table.outbox.push(msg);
            return Ok(());
        }
        let mut buf = BytesMut::new();
        self.control_codec.encode(&msg, &mut buf)?;
        self.control.send(buf.freeze())?;
        Ok(())
    }

    /// Control channel finished its open handshake; flush early requests
    pub(crate) fn control_opened(&self) {
        let mut table = self.table.lock();
        if table.control_open {
            return;
        }
        table.control_open = true;
        let outbox = std::mem::take(&mut table.outbox);
        if !outbox.is_empty() {
            trace!("Flushing {} early control messages", outbox.len());
        }
        for msg in outbox {
            if let Err(e) = self.send_control(&mut table, msg) {
                warn!("Failed to send control message: {}", e);
            }
        }
    }

    pub(crate) fn decode_control(&self, payload: Bytes) -> Result<ControlMessage> {
        self.control_codec.decode(payload)
    }

    /// Request a new stream
    pub(crate) fn connect(self: &Arc<Self>, opts: ConnectOptions) -> VirtualStream<T> {
        let id = opts.id.unwrap_or_else(random_id);
        let stream = VirtualStream::new(self.params(
            id.clone(),
            true,
            opts.handshake,
            opts.on_handshake,
        ));

        if id.len() > MAX_ID_LEN {
            warn!("Stream id of {} bytes is too long", id.len());
            stream.fail(&Error::FrameTooLarge(id.len(), MAX_ID_LEN));
            return stream;
        }

        let mut table = self.table.lock();
        if table.closing {
            drop(table);
            debug!("Connect on closing multiplexer id={}", short_id(&id));
            stream.fail(&Error::MultiplexerClosed);
            return stream;
        }
        if table.waiters.contains_key(&id) || table.active.contains_key(&id) {
            drop(table);
            warn!("Stream id={} already in use", short_id(&id));
            stream.fail(&Error::ChannelExists {
                protocol: PROTOCOL_CHANNEL.to_string(),
                id: hex::encode(&id),
            });
            return stream;
        }

        if table.take_parked(&id) {
            // The remote already asked for this id: answer its request
            // with our stream instead of sending one of our own
            debug!("Answering parked request with local stream id={}", short_id(&id));
            if let Err(e) = self.send_control(&mut table, ControlMessage::ack(id.clone())) {
                drop(table);
                stream.fail(&e);
                return stream;
            }
            self.activate(&mut table, id, stream.clone());
        } else {
            table.waiters.insert(id.clone(), stream.clone());
            if let Err(e) = self.send_control(&mut table, ControlMessage::request(id.clone())) {
                table.waiters.remove(&id);
                drop(table);
                warn!("Failed to request stream id={}: {}", short_id(&id), e);
                stream.fail(&e);
                return stream;
            }
            debug!("Requested stream id={}", short_id(&id));
        }
        drop(table);

        self.track(&stream);
        if let Some(limit) = opts.timeout.or(self.config.connect_timeout) {
            let stream = stream.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stream.connected() => {}
                    _ = tokio::time::sleep(limit) => {
                        debug!("Stream id={} timed out after {:?}", short_id(stream.id()), limit);
                        stream.fail(&Error::Timeout);
                    }
                }
            });
        }
        stream
    }

    /// Register the catch-all listener and answer every parked request
    pub(crate) fn listen(self: &Arc<Self>, opts: ListenOptions) -> Listener<T> {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let mut table = self.table.lock();
        if table.closing {
            return Listener { id: None, rx };
        }
        let entry = ListenerEntry {
            tx,
            handshake: opts.handshake,
            on_handshake: opts.on_handshake,
        };
        table.catch_all = Some(entry);

        let parked: Vec<Parked> = table.parked.drain(..).collect();
        for parked in parked {
            match table.listener_for(&parked.id) {
                Some(entry) => self.respond(&mut table, parked.id, entry),
                None => table.parked.push_back(parked),
            }
        }
        Listener { id: None, rx }
    }

    /// Register a listener for one id; takes precedence over the catch-all
    pub(crate) fn listen_on(self: &Arc<Self>, id: Bytes, opts: ListenOptions) -> Listener<T> {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let mut table = self.table.lock();
        if table.closing {
            return Listener { id: Some(id), rx };
        }
        let entry = ListenerEntry {
            tx,
            handshake: opts.handshake,
            on_handshake: opts.on_handshake,
        };
        if table.listeners.insert(id.clone(), entry.clone()).is_some() {
            debug!("Replaced listener for id={}", short_id(&id));
        }

        if table.take_parked(&id) {
            self.respond(&mut table, id.clone(), entry);
        }
        Listener { id: Some(id), rx }
    }

    pub(crate) fn unlisten(&self, id: &[u8]) {
        if self.table.lock().listeners.remove(id).is_some() {
            trace!("Removed listener for id={}", short_id(id));
        }
    }

    /// Handle one decoded control message
    pub(crate) fn on_control(self: &Arc<Self>, msg: ControlMessage) {
        let mut table = self.table.lock();
        if table.closing {
            trace!("Ignoring control message while closing id={}", short_id(&msg.id));
            return;
        }
        let id = msg.id;

        if !msg.is_initiator {
            match table.waiters.remove(&id) {
                Some(stream) if msg.declined => {
                    drop(table);
                    debug!("Remote declined stream id={}", short_id(&id));
                    stream.fail(&Error::Rejected);
                }
                Some(stream) => {
                    trace!("Ack for stream id={}", short_id(&id));
                    self.activate(&mut table, id, stream);
                }
                None => debug!("Answer with no waiter id={}, ignoring", short_id(&id)),
            }
            return;
        }

        if id.len() > MAX_ID_LEN {
            warn!("Declining request with {}-byte id", id.len());
            if let Err(e) = self.send_control(&mut table, ControlMessage::decline(id)) {
                warn!("Failed to decline request: {}", e);
            }
            return;
        }

        if let Some(stream) = table.waiters.remove(&id) {
            // Both sides requested the same id: their request is our ack
            debug!("Simultaneous open id={}", short_id(&id));
            if let Err(e) = self.send_control(&mut table, ControlMessage::ack(id.clone())) {
                drop(table);
                stream.fail(&e);
                return;
            }
            self.activate(&mut table, id, stream);
            return;
        }

        if table.active.contains_key(&id) || table.is_parked(&id) {
            warn!("Duplicate open request id={}, ignoring", short_id(&id));
            return;
        }

        match table.listener_for(&id) {
            Some(entry) => self.respond(&mut table, id, entry),
            None => {
                trace!("No listener for id={}, parking request", short_id(&id));
                self.park(&mut table, id);
            }
        }
    }

    /// Hold a request for a listener; decline it once the park window ends
    fn park(self: &Arc<Self>, table: &mut Table<T>, id: Bytes) {
        let ticket = table.next_ticket;
        table.next_ticket += 1;
        table.parked.push_back(Parked {
            id: id.clone(),
            ticket,
        });

        let Some(window) = self.config.park_timeout else {
            return;
        };
        let rendezvous: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(rendezvous) = rendezvous.upgrade() {
                rendezvous.decline(&id, ticket);
            }
        });
    }

    /// Answer a still-parked request with a decline
    fn decline(&self, id: &Bytes, ticket: u64) {
        let mut table = self.table.lock();
        if table.closing {
            return;
        }
        let Some(pos) = table
            .parked
            .iter()
            .position(|parked| parked.id == *id && parked.ticket == ticket)
        else {
            return;
        };
        table.parked.remove(pos);
        debug!("No listener for id={}, declining", short_id(id));
        if let Err(e) = self.send_control(&mut table, ControlMessage::decline(id.clone())) {
            warn!("Failed to decline stream id={}: {}", short_id(id), e);
        }
    }

    /// Attach the initiator's data channel once the remote has agreed
    fn activate(&self, table: &mut Table<T>, id: Bytes, stream: VirtualStream<T>) {
        match stream.attach(&self.link) {
            Ok(()) => {
                table.active.insert(id, stream);
            }
            Err(e) => debug!("Stream id={} not attached: {}", short_id(&id), e),
        }
    }

    /// Answer a remote request: open our half, ack, then hand the stream to
    /// the listener once its open handshake completes
    fn respond(self: &Arc<Self>, table: &mut Table<T>, id: Bytes, entry: ListenerEntry<T>) {
        let stream = VirtualStream::new(self.params(
            id.clone(),
            false,
            entry.handshake,
            entry.on_handshake,
        ));
        if let Err(e) = stream.attach(&self.link) {
            warn!("Failed to open inbound stream id={}: {}", short_id(&id), e);
            return;
        }
        if let Err(e) = self.send_control(table, ControlMessage::ack(id.clone())) {
            warn!("Failed to ack stream id={}: {}", short_id(&id), e);
            stream.fail(&e);
            return;
        }
        debug!("Accepted stream id={}", short_id(&id));
        table.active.insert(id.clone(), stream.clone());
        self.track(&stream);

        let tx = entry.tx;
        tokio::spawn(async move {
            match stream.connected().await {
                Ok(handshake) => {
                    let incoming = Incoming {
                        stream: stream.clone(),
                        id,
                        handshake,
                    };
                    if tx.send(incoming).await.is_err() {
                        debug!("Listener gone, dropping stream id={}", short_id(stream.id()));
                        stream.destroy();
                    }
                }
                Err(e) => debug!("Inbound stream id={} did not open: {}", short_id(&id), e),
            }
        });
    }

    /// Drop the stream from the tables once it is destroyed
    fn track(self: &Arc<Self>, stream: &VirtualStream<T>) {
        let rendezvous: Weak<Self> = Arc::downgrade(self);
        let stream = stream.clone();
        tokio::spawn(async move {
            stream.closed().await;
            if let Some(rendezvous) = rendezvous.upgrade() {
                rendezvous.forget(&stream);
            }
        });
    }

    fn forget(&self, stream: &VirtualStream<T>) {
        let mut table = self.table.lock();
        let id = stream.id();
        if table.waiters.get(id).is_some_and(|s| s.ptr_eq(stream)) {
            table.waiters.remove(id);
            trace!("Released waiter id={}", short_id(id));
        }
        if table.active.get(id).is_some_and(|s| s.ptr_eq(stream)) {
            table.active.remove(id);
            trace!("Stream id={} left the active set", short_id(id));
        }
    }

    /// Stop accepting work
    ///
    /// Returns the streams still waiting for an ack and the streams with an
    /// attached channel. Listeners are dropped and parked requests forgotten.
    pub(crate) fn begin_closing(&self) -> (Vec<VirtualStream<T>>, Vec<VirtualStream<T>>) {
        let mut table = self.table.lock();
        table.closing = true;
        table.parked.clear();
        table.listeners.clear();
        table.catch_all = None;
        table.outbox.clear();
        let opening = table.waiters.drain().map(|(_, s)| s).collect();
        let active = table.active.values().cloned().collect();
        (opening, active)
    }

    pub(crate) fn streams(&self) -> Vec<VirtualStream<T>> {
        let table = self.table.lock();
        table
            .active
            .values()
            .chain(table.waiters.values())
            .cloned()
            .collect()
    }

    pub(crate) fn stream_count(&self) -> usize {
        let table = self.table.lock();
        table.active.len() + table.waiters.len()
    }
}
