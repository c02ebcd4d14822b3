// End-to-end tests: two multiplexers over in-memory and TCP transports

use bytes::{Buf, BufMut, Bytes, BytesMut};
use plex_stream::{
    handshake_hook, Codec, CodecSource, ConnectOptions, Error, HandshakeInfo, JsonCodec,
    ListenOptions, Link, LinkConfig, MuxEvent, MuxState, Multiplexer, MultiplexerConfig, SharedCodec,
    StreamState, ID_LEN,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MESSAGE: &str = "Hello, World!";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,plex_stream=debug")
        .try_init();
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Server and client multiplexers over an in-memory duplex pipe
fn testenv() -> (Multiplexer, Multiplexer) {
    init_tracing();
    let (a, b) = Link::pair(LinkConfig::default());
    (
        Multiplexer::new(a, MultiplexerConfig::default()).unwrap(),
        Multiplexer::new(b, MultiplexerConfig::default()).unwrap(),
    )
}

#[tokio::test]
async fn test_client_to_server() {
    let (server, client) = testenv();
    let mut listener = server.listen();

    let mut stream = client.connect(ConnectOptions::new());
    stream.write_all(MESSAGE.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut incoming = within(listener.accept()).await.unwrap();
    assert_eq!(incoming.id.len(), ID_LEN);
    assert_eq!(&incoming.id, stream.id());

    let mut received = String::new();
    within(incoming.stream.read_to_string(&mut received))
        .await
        .unwrap();
    assert_eq!(received, MESSAGE);
}

#[tokio::test]
async fn test_server_to_client() {
    let (server, client) = testenv();
    let mut listener = client.listen();

    let stream = server.connect(ConnectOptions::new());
    stream.send(Bytes::from_static(MESSAGE.as_bytes())).await.unwrap();
    stream.finish();

    let incoming = within(listener.accept()).await.unwrap();
    let mut received = BytesMut::new();
    while let Some(chunk) = within(incoming.stream.recv()).await {
        received.put(chunk.unwrap());
    }
    assert_eq!(&received[..], MESSAGE.as_bytes());
}

#[tokio::test]
async fn test_many_clients() {
    let (server, client) = testenv();
    let mut listener = server.listen();

    let count = 25;
    for _ in 0..count {
        let stream = client.connect(ConnectOptions::new());
        stream.send(Bytes::from_static(MESSAGE.as_bytes())).await.unwrap();
        stream.finish();
    }

    let mut readers = Vec::new();
    for _ in 0..count {
        let mut incoming = within(listener.accept()).await.unwrap();
        readers.push(tokio::spawn(async move {
            let mut received = String::new();
            incoming.stream.read_to_string(&mut received).await.unwrap();
            received
        }));
    }
    for reader in readers {
        assert_eq!(within(reader).await.unwrap(), MESSAGE);
    }
}

#[tokio::test]
async fn test_write_before_listener_registered() {
    let (server, client) = testenv();
    let id = Bytes::from_static(b"late listener");

    let stream = server.connect(ConnectOptions::new().id(id.clone()));
    stream.send(Bytes::from_static(MESSAGE.as_bytes())).await.unwrap();
    stream.finish();
    assert_eq!(stream.state(), StreamState::Opening);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut listener = client.listen_on(id.clone());
    let mut incoming = within(listener.accept()).await.unwrap();
    assert_eq!(incoming.id, id);

    let mut received = String::new();
    within(incoming.stream.read_to_string(&mut received))
        .await
        .unwrap();
    assert_eq!(received, MESSAGE);
}

#[tokio::test]
async fn test_bidirectional_with_handshakes() {
    let (server, client) = testenv();
    let mut listener =
        server.listen_with(ListenOptions::new().handshake(Bytes::from_static(b"server hello")));

    let mut stream =
        client.connect(ConnectOptions::new().handshake(Bytes::from_static(b"client hello")));
    assert_eq!(within(stream.connected()).await.unwrap(), "server hello");

    let mut incoming = within(listener.accept()).await.unwrap();
    assert_eq!(incoming.handshake, "client hello");
    assert!(stream.is_initiator());
    assert!(!incoming.stream.is_initiator());

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    within(incoming.stream.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"ping");

    incoming.stream.write_all(b"pong").await.unwrap();
    within(stream.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"pong");

    stream.shutdown().await.unwrap();
    incoming.stream.shutdown().await.unwrap();
    within(stream.closed()).await;
    within(incoming.stream.closed()).await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    greeting: String,
}

#[tokio::test]
async fn test_json_records() {
    init_tracing();
    let (a, b) = Link::pair(LinkConfig::default());
    let config = MultiplexerConfig::new(CodecSource::fixed(JsonCodec::<Greeting>::new()));
    let server = Multiplexer::new(a, config.clone()).unwrap();
    let client = Multiplexer::new(b, config).unwrap();
    let mut listener = server.listen();

    let stream = client.connect(ConnectOptions::new());
    let greeting = Greeting {
        greeting: MESSAGE.to_string(),
    };
    stream.send(greeting.clone()).await.unwrap();
    stream.finish();

    let incoming = within(listener.accept()).await.unwrap();
    assert_eq!(within(incoming.stream.recv()).await.unwrap().unwrap(), greeting);
    assert!(within(incoming.stream.recv()).await.is_none());
}

/// Byte-wise inversion, so a codec mismatch would garble the payload
struct Inverted;

impl Codec for Inverted {
    type Item = Bytes;

    fn encode(&self, item: &Bytes, dst: &mut BytesMut) -> plex_stream::Result<()> {
        dst.extend(item.iter().map(|b| !b));
        Ok(())
    }

    fn decode(&self, src: Bytes) -> plex_stream::Result<Bytes> {
        Ok(src.chunk().iter().map(|b| !b).collect())
    }
}

#[tokio::test]
async fn test_codec_resolved_from_handshake() {
    init_tracing();
    let calls: Arc<Mutex<Vec<(bool, Vec<u8>)>>> = Arc::default();
    let resolver = {
        let calls = calls.clone();
        CodecSource::resolver(move |cx| {
            calls
                .lock()
                .unwrap()
                .push((cx.is_initiator, cx.handshake.to_vec()));
            (cx.handshake == b"inverted").then(|| Arc::new(Inverted) as SharedCodec<Bytes>)
        })
    };
    let (a, b) = Link::pair(LinkConfig::default());
    let server = Multiplexer::new(a, MultiplexerConfig::new(resolver.clone())).unwrap();
    let client = Multiplexer::new(b, MultiplexerConfig::new(resolver)).unwrap();

    let mut listener =
        server.listen_with(ListenOptions::new().handshake(Bytes::from_static(b"inverted")));
    let stream =
        client.connect(ConnectOptions::new().handshake(Bytes::from_static(b"inverted")));
    stream.send(Bytes::from_static(MESSAGE.as_bytes())).await.unwrap();
    stream.finish();

    let incoming = within(listener.accept()).await.unwrap();
    let received = within(incoming.stream.recv()).await.unwrap().unwrap();
    assert_eq!(received, MESSAGE);

    let mut calls = calls.lock().unwrap().clone();
    calls.sort();
    assert_eq!(
        calls,
        vec![(false, b"inverted".to_vec()), (true, b"inverted".to_vec())]
    );
}

#[tokio::test]
async fn test_rejected_handshake() {
    init_tracing();
    let (a, b) = Link::pair(LinkConfig::default());
    let hook = handshake_hook(|info: HandshakeInfo| async move {
        Ok(info.handshake.as_ref() == b"secret")
    });
    let server: Multiplexer =
        Multiplexer::new(a, MultiplexerConfig::default().on_handshake(hook)).unwrap();
    let client: Multiplexer = Multiplexer::new(b, MultiplexerConfig::default()).unwrap();
    let mut listener = server.listen();

    let denied = client.connect(ConnectOptions::new().handshake(Bytes::from_static(b"guess")));
    denied.send(Bytes::from_static(b"let me in")).await.unwrap();
    // The remote side tears the channel down without delivering anything
    within(denied.closed()).await;

    let allowed = client.connect(ConnectOptions::new().handshake(Bytes::from_static(b"secret")));
    allowed.send(Bytes::from_static(MESSAGE.as_bytes())).await.unwrap();
    allowed.finish();

    let incoming = within(listener.accept()).await.unwrap();
    assert_eq!(incoming.handshake, "secret");
    assert_eq!(&incoming.id, allowed.id());
    assert_eq!(within(incoming.stream.recv()).await.unwrap().unwrap(), MESSAGE);
}

#[tokio::test]
async fn test_close_waits_for_every_stream() {
    let (server, client) = testenv();
    let mut listener = server.listen();

    let first = client.connect(ConnectOptions::new());
    let second = client.connect(ConnectOptions::new());
    first.send(Bytes::from_static(b"one")).await.unwrap();
    second.send(Bytes::from_static(b"two")).await.unwrap();
    within(first.connected()).await.unwrap();
    within(second.connected()).await.unwrap();
    let a = within(listener.accept()).await.unwrap();
    let b = within(listener.accept()).await.unwrap();
    assert_eq!(client.stream_count(), 2);

    // Both streams must be destroyed by the time the control channel goes
    let mut events = client.events();
    let ((), at_control_close) = within(async {
        tokio::join!(client.close(), async {
            loop {
                match events.recv().await {
                    Ok(MuxEvent::Closed { .. }) => break [first.state(), second.state()],
                    Ok(_) => {}
                    Err(e) => panic!("event stream failed: {}", e),
                }
            }
        })
    })
    .await;
    assert_eq!(at_control_close, [StreamState::Destroyed, StreamState::Destroyed]);
    assert_eq!(client.state(), MuxState::Closed);
    // Every data channel and the control channel are gone on this side
    assert_eq!(client.link().channel_count(), 0);
    for incoming in [&a, &b] {
        let payload = within(incoming.stream.recv()).await.unwrap().unwrap();
        assert!(payload == "one" || payload == "two");
        assert!(within(incoming.stream.recv()).await.is_none());
        within(incoming.stream.closed()).await;
    }

    within(server.closed()).await;
    assert_eq!(server.link().channel_count(), 0);
    within(async {
        while client.stream_count() > 0 || server.stream_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_close_and_destroy_are_idempotent() {
    let (server, client) = testenv();
    within(client.opened()).await.unwrap();

    within(async {
        tokio::join!(client.close(), client.close(), client.destroy());
        client.close().await;
        client.destroy().await;
    })
    .await;
    assert_eq!(client.state(), MuxState::Closed);
    within(server.closed()).await;
}

#[tokio::test]
async fn test_destroy_drops_streams() {
    let (server, client) = testenv();
    let mut listener = server.listen();

    let stream = client.connect(ConnectOptions::new());
    within(stream.connected()).await.unwrap();
    let incoming = within(listener.accept()).await.unwrap();

    within(client.destroy()).await;
    assert_eq!(stream.state(), StreamState::Destroyed);
    assert!(matches!(
        stream.send(Bytes::from_static(b"late")).await,
        Err(Error::StreamDestroyed)
    ));
    assert!(within(incoming.stream.recv()).await.is_none());
    within(server.closed()).await;
}

#[tokio::test]
async fn test_connect_after_close() {
    let (_server, client) = testenv();
    within(client.close()).await;

    let stream = client.connect(ConnectOptions::new());
    assert_eq!(stream.state(), StreamState::Destroyed);
    assert!(matches!(stream.connected().await, Err(Error::MultiplexerClosed)));
    assert!(matches!(
        stream.send(Bytes::from_static(b"x")).await,
        Err(Error::MultiplexerClosed)
    ));
}

#[tokio::test]
async fn test_unanswered_request_fails_on_close() {
    let (_server, client) = testenv();
    // Nobody on the server listens for this id; close lands inside the park window
    let stream = client.connect(ConnectOptions::new().id(Bytes::from_static(b"nobody")));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(stream.state(), StreamState::Opening);

    within(client.close()).await;
    assert!(matches!(
        within(stream.connected()).await,
        Err(Error::MultiplexerClosed)
    ));
}

#[tokio::test]
async fn test_unlistened_id_is_declined() {
    init_tracing();
    let (a, b) = Link::pair(LinkConfig::default());
    let server: Multiplexer = Multiplexer::new(
        a,
        MultiplexerConfig::default().park_timeout(Some(Duration::from_millis(50))),
    )
    .unwrap();
    let client: Multiplexer = Multiplexer::new(b, MultiplexerConfig::default()).unwrap();

    let mut listener = server.listen_on(Bytes::from_static(b"address"));
    let wanted = client.connect(ConnectOptions::new().id(Bytes::from_static(b"address")));
    let unwanted = client.connect(ConnectOptions::new().id(Bytes::from_static(b"not listening")));

    within(unwanted.closed()).await;
    assert!(matches!(unwanted.connected().await, Err(Error::Rejected)));

    let incoming = within(listener.accept()).await.unwrap();
    assert_eq!(incoming.id, "address");
    within(wanted.connected()).await.unwrap();
    assert_eq!(server.stream_count(), 1);
    assert_eq!(server.state(), MuxState::Open);
}

#[tokio::test]
async fn test_oversized_id_leaves_link_up() {
    let (server, client) = testenv();
    let mut listener = server.listen();

    let healthy = client.connect(ConnectOptions::new());
    within(healthy.connected()).await.unwrap();
    let incoming = within(listener.accept()).await.unwrap();

    let oversized = client.connect(ConnectOptions::new().id(vec![7u8; 70_000]));
    assert!(matches!(
        within(oversized.connected()).await,
        Err(Error::FrameTooLarge(..))
    ));
    assert_eq!(oversized.state(), StreamState::Destroyed);

    healthy.send(Bytes::from_static(b"still up")).await.unwrap();
    assert_eq!(within(incoming.stream.recv()).await.unwrap().unwrap(), "still up");
    assert!(client.link().is_alive());
    assert!(server.link().is_alive());
    assert_eq!(client.state(), MuxState::Open);
    assert_eq!(server.state(), MuxState::Open);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    init_tracing();
    let (a, b) = Link::pair(LinkConfig::default());
    let _server: Multiplexer = Multiplexer::new(a, MultiplexerConfig::default()).unwrap();
    let client: Multiplexer = Multiplexer::new(
        b,
        MultiplexerConfig::default().connect_timeout(Duration::from_millis(50)),
    )
    .unwrap();

    let stream = client.connect(ConnectOptions::new());
    assert!(matches!(within(stream.connected()).await, Err(Error::Timeout)));
    within(async {
        while client.stream_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_remote_close_closes_peer() {
    let (server, client) = testenv();
    within(client.opened()).await.unwrap();
    let mut events = client.events();

    within(server.close()).await;
    within(client.closed()).await;
    assert_eq!(client.state(), MuxState::Closed);
    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        saw_closed |= matches!(event, MuxEvent::Closed { .. });
    }
    assert!(saw_closed);

    let stream = client.connect(ConnectOptions::new());
    assert_eq!(stream.state(), StreamState::Destroyed);
}

#[tokio::test]
async fn test_simultaneous_open() {
    let (server, client) = testenv();
    let id = Bytes::from_static(b"both");

    let left = server.connect(ConnectOptions::new().id(id.clone()));
    let right = client.connect(ConnectOptions::new().id(id.clone()));

    within(left.connected()).await.unwrap();
    within(right.connected()).await.unwrap();

    left.send(Bytes::from_static(b"from left")).await.unwrap();
    right.send(Bytes::from_static(b"from right")).await.unwrap();
    assert_eq!(within(right.recv()).await.unwrap().unwrap(), "from left");
    assert_eq!(within(left.recv()).await.unwrap().unwrap(), "from right");
    assert_eq!(server.stream_count(), 1);
    assert_eq!(client.stream_count(), 1);
}

#[tokio::test]
async fn test_slow_reader_keeps_order() {
    init_tracing();
    let (a, b) = Link::pair(LinkConfig::default().high_water_mark(1024));
    let server: Multiplexer =
        Multiplexer::new(a, MultiplexerConfig::default().read_high_water_mark(4)).unwrap();
    let client: Multiplexer = Multiplexer::new(b, MultiplexerConfig::default()).unwrap();
    let mut listener = server.listen();

    let stream = client.connect(ConnectOptions::new());
    let writer = tokio::spawn(async move {
        for i in 0..200u32 {
            let mut buf = BytesMut::with_capacity(256);
            buf.put_u32(i);
            buf.put_bytes(0xab, 252);
            stream.send(buf.freeze()).await.unwrap();
        }
        stream.finish();
    });

    let incoming = within(listener.accept()).await.unwrap();
    let mut expected = 0u32;
    while let Some(record) = within(incoming.stream.recv()).await {
        let mut record = record.unwrap();
        assert_eq!(record.len(), 256);
        assert_eq!(record.get_u32(), expected);
        expected += 1;
        if expected % 16 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    assert_eq!(expected, 200);
    within(writer).await.unwrap();
}

#[tokio::test]
async fn test_over_tcp() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let server: Multiplexer =
            Multiplexer::new(Link::new(socket, LinkConfig::default()), MultiplexerConfig::default())
                .unwrap();
        let mut listener = server.listen();
        let mut incoming = listener.accept().await.unwrap();
        let mut received = vec![0u8; MESSAGE.len()];
        incoming.stream.read_exact(&mut received).await.unwrap();
        incoming.stream.write_all(&received).await.unwrap();
        // Closing the channel from the client ends the stream on this side
        let mut rest = Vec::new();
        incoming.stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        server.closed().await;
    });

    let socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    let client: Multiplexer =
        Multiplexer::new(Link::new(socket, LinkConfig::default()), MultiplexerConfig::default())
            .unwrap();
    let mut stream = client.connect(ConnectOptions::new());
    stream.write_all(MESSAGE.as_bytes()).await.unwrap();

    let mut echoed = vec![0u8; MESSAGE.len()];
    within(stream.read_exact(&mut echoed)).await.unwrap();
    assert_eq!(echoed, MESSAGE.as_bytes());
    stream.shutdown().await.unwrap();

    within(client.close()).await;
    within(accept).await.unwrap();
}
