use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_quic_transport::{
    ConnectionContext, ConnectionId, DispatchError, EndpointInformation, ListenMode, LongHeader,
    QuicConfiguration, QuicTransport, TransportError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    transport: Arc<QuicTransport>,
    endpoint: Arc<RwLock<EndpointInformation>>,
    connections: mpsc::UnboundedReceiver<ConnectionContext>,
    stops: Arc<AtomicUsize>,
}

impl Harness {
    fn new(mode: ListenMode) -> Self {
        let (tx, connections) = mpsc::unbounded_channel();
        Self::with_dispatcher(mode, move |connection: ConnectionContext| {
            let _ = tx.send(connection);
            Ok(())
        }, connections)
    }

    fn with_dispatcher<F>(
        mode: ListenMode,
        dispatcher: F,
        connections: mpsc::UnboundedReceiver<ConnectionContext>,
    ) -> Self
    where
        F: Fn(ConnectionContext) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        let endpoint = Arc::new(RwLock::new(EndpointInformation::new(
            "127.0.0.1:0".parse().unwrap(),
        )));
        let stops = Arc::new(AtomicUsize::new(0));
        let lifetime = {
            let stops = stops.clone();
            move || {
                stops.fetch_add(1, Ordering::SeqCst);
            }
        };
        let configuration = QuicConfiguration {
            mode,
            io_queue_count: 2,
            ..Default::default()
        };
        let transport = Arc::new(
            QuicTransport::new(
                endpoint.clone(),
                Arc::new(dispatcher),
                Arc::new(lifetime),
                configuration,
            )
            .unwrap(),
        );
        Self {
            transport,
            endpoint,
            connections,
            stops,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.endpoint.read().unwrap().addr
    }

    async fn next_connection(&mut self) -> ConnectionContext {
        timeout(TIMEOUT, self.connections.recv())
            .await
            .expect("no connection dispatched")
            .unwrap()
    }
}

fn initial_datagram(dcid: &[u8], payload: &[u8]) -> Vec<u8> {
    let header = LongHeader {
        version: [0, 0, 0, 1],
        destination_connection_id: ConnectionId::new(dcid).unwrap(),
        source_connection_id: ConnectionId::new(&[9; 4]).unwrap(),
        payload_length: payload.len() as u64,
        packet_number: 1,
    };
    let mut datagram = vec![0x7f];
    header.write(&mut datagram).unwrap();
    datagram.extend_from_slice(payload);
    datagram
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn bind_writes_back_the_assigned_port() {
    let harness = Harness::new(ListenMode::Datagram);
    harness.transport.bind().await.unwrap();

    assert_ne!(harness.addr().port(), 0);
    assert_eq!(harness.transport.endpoint().addr, harness.addr());
    harness.transport.unbind().await.unwrap();
}

#[tokio::test]
async fn second_bind_is_rejected() {
    let harness = Harness::new(ListenMode::Stream);
    harness.transport.bind().await.unwrap();

    assert!(matches!(
        harness.transport.bind().await,
        Err(TransportError::AlreadyBound)
    ));
    harness.transport.unbind().await.unwrap();
}

#[tokio::test]
async fn occupied_port_is_reported_as_address_in_use() {
    let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let harness = Harness::new(ListenMode::Datagram);
    harness.endpoint.write().unwrap().addr = occupied.local_addr().unwrap();

    assert!(matches!(
        harness.transport.bind().await,
        Err(TransportError::AddressInUse { .. })
    ));
}

#[tokio::test]
async fn datagrams_are_routed_by_destination_connection_id() {
    let mut harness = Harness::new(ListenMode::Datagram);
    harness.transport.bind().await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let first = initial_datagram(&[1; 8], b"one");
    let second = initial_datagram(&[1; 8], b"two");
    client.send_to(&first, harness.addr()).await.unwrap();
    client.send_to(&second, harness.addr()).await.unwrap();

    let mut a = harness.next_connection().await;
    assert_eq!(a.connection_id, ConnectionId::new(&[1; 8]).unwrap());
    assert_eq!(a.remote_addr, client.local_addr().unwrap());
    assert_eq!(&a.input.read_chunk().await.unwrap().unwrap()[..], &first[..]);
    assert_eq!(&a.input.read_chunk().await.unwrap().unwrap()[..], &second[..]);

    let other = initial_datagram(&[2; 8], b"three");
    client.send_to(&other, harness.addr()).await.unwrap();
    let mut b = harness.next_connection().await;
    assert_eq!(b.connection_id, ConnectionId::new(&[2; 8]).unwrap());
    assert_eq!(&b.input.read_chunk().await.unwrap().unwrap()[..], &other[..]);
    assert_eq!(harness.transport.connection_count(), 2);
    assert!(harness.connections.try_recv().is_err());

    a.output.write(b"pong").await.unwrap();
    let mut buf = [0; 64];
    let (n, from) = timeout(TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, harness.addr());

    harness.transport.stop().await.unwrap();
}

#[tokio::test]
async fn undecodable_datagrams_are_dropped() {
    let mut harness = Harness::new(ListenMode::Datagram);
    harness.transport.bind().await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client.send_to(&[0x00, 1, 2, 3], harness.addr()).await.unwrap();
    client.send_to(&[0x7f, 0, 0], harness.addr()).await.unwrap();
    // Handshake packets are recognized but not implemented.
    client.send_to(&[0x7d, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0], harness.addr()).await.unwrap();
    let valid = initial_datagram(&[3; 4], b"");
    client.send_to(&valid, harness.addr()).await.unwrap();

    let mut connection = harness.next_connection().await;
    assert_eq!(&connection.input.read_chunk().await.unwrap().unwrap()[..], &valid[..]);
    assert_eq!(harness.transport.connection_count(), 1);

    harness.transport.stop().await.unwrap();
}

#[tokio::test]
async fn closed_connections_leave_the_routing_table() {
    let mut harness = Harness::new(ListenMode::Datagram);
    harness.transport.bind().await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client
        .send_to(&initial_datagram(&[4; 8], b"x"), harness.addr())
        .await
        .unwrap();
    let connection = harness.next_connection().await;
    assert_eq!(harness.transport.connection_count(), 1);

    connection.abort();
    timeout(TIMEOUT, connection.closed()).await.unwrap();
    eventually(|| harness.transport.connection_count() == 0).await;

    // The same id opens a fresh connection afterwards.
    client
        .send_to(&initial_datagram(&[4; 8], b"y"), harness.addr())
        .await
        .unwrap();
    let reopened = harness.next_connection().await;
    assert!(!Arc::ptr_eq(&reopened.connection, &connection.connection));

    harness.transport.stop().await.unwrap();
}

#[tokio::test]
async fn stream_connections_echo() {
    let mut harness = Harness::new(ListenMode::Stream);
    harness.transport.bind().await.unwrap();

    let mut client = TcpStream::connect(harness.addr()).await.unwrap();
    let mut connection = harness.next_connection().await;
    assert_eq!(connection.connection_id.len(), 8);
    tokio::spawn(async move {
        while let Ok(Some(chunk)) = connection.input.read_chunk().await {
            if connection.output.write(&chunk).await.is_err() {
                break;
            }
        }
        connection.output.complete(None);
    });

    client.write_all(b"hello transport").await.unwrap();
    let mut echoed = [0; 15];
    timeout(TIMEOUT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello transport");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = timeout(TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    harness.transport.unbind().await.unwrap();
}

#[tokio::test]
async fn stop_aborts_live_connections() {
    let mut harness = Harness::new(ListenMode::Stream);
    harness.transport.bind().await.unwrap();

    let mut client = TcpStream::connect(harness.addr()).await.unwrap();
    let connection = harness.next_connection().await;

    harness.transport.stop().await.unwrap();
    timeout(TIMEOUT, connection.closed()).await.unwrap();

    let mut buf = [0; 8];
    let read = timeout(TIMEOUT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn dispatcher_failure_is_raised_once_from_unbind() {
    let (_tx, connections) = mpsc::unbounded_channel();
    let harness = Harness::with_dispatcher(
        ListenMode::Datagram,
        |_: ConnectionContext| -> Result<(), DispatchError> { Err("dispatcher unavailable".into()) },
        connections,
    );
    harness.transport.bind().await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&initial_datagram(&[5; 8], b""), harness.addr())
        .await
        .unwrap();

    let stops = harness.stops.clone();
    eventually(|| stops.load(Ordering::SeqCst) == 1).await;
    assert_eq!(harness.transport.connection_count(), 0);

    let err = harness.transport.unbind().await.unwrap_err();
    assert!(matches!(err, TransportError::Dispatch(_)));
    assert!(err.to_string().contains("dispatcher unavailable"));
    harness.transport.unbind().await.unwrap();
    assert_eq!(harness.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_can_bind_again_after_unbind() {
    let harness = Harness::new(ListenMode::Datagram);
    harness.transport.bind().await.unwrap();
    harness.transport.unbind().await.unwrap();
    harness.transport.unbind().await.unwrap();

    harness.transport.bind().await.unwrap();
    harness.transport.stop().await.unwrap();
}

async fn dispatcher_sees_the_new_route(mode: ListenMode) {
    let transport_slot: Arc<OnceLock<Weak<QuicTransport>>> = Arc::new(OnceLock::new());
    let (counts_tx, mut counts) = mpsc::unbounded_channel();
    let (tx, connections) = mpsc::unbounded_channel();
    let dispatcher = {
        let transport_slot = transport_slot.clone();
        move |connection: ConnectionContext| -> Result<(), DispatchError> {
            let count = transport_slot
                .get()
                .and_then(Weak::upgrade)
                .map(|transport| transport.connection_count());
            let _ = counts_tx.send(count);
            let _ = tx.send(connection);
            Ok(())
        }
    };
    let mut harness = Harness::with_dispatcher(mode, dispatcher, connections);
    transport_slot.set(Arc::downgrade(&harness.transport)).unwrap();
    harness.transport.bind().await.unwrap();

    let _client = match mode {
        ListenMode::Datagram => {
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            client
                .send_to(&initial_datagram(&[6; 8], b""), harness.addr())
                .await
                .unwrap();
            None
        }
        ListenMode::Stream => Some(TcpStream::connect(harness.addr()).await.unwrap()),
    };

    let count = timeout(TIMEOUT, counts.recv())
        .await
        .expect("dispatcher blocked on the routing table")
        .unwrap();
    assert_eq!(count, Some(1));
    harness.next_connection().await;

    timeout(TIMEOUT, harness.transport.stop())
        .await
        .unwrap()
        .unwrap();
}

// Multi-threaded so the timeout still fires if the accept loop blocks a worker.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn datagram_dispatcher_can_query_the_transport() {
    dispatcher_sees_the_new_route(ListenMode::Datagram).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_dispatcher_can_query_the_transport() {
    dispatcher_sees_the_new_route(ListenMode::Stream).await;
}

#[tokio::test]
async fn stream_connections_report_the_accepted_local_address() {
    let mut harness = Harness::new(ListenMode::Stream);
    harness.transport.bind().await.unwrap();

    let client = TcpStream::connect(harness.addr()).await.unwrap();
    let connection = harness.next_connection().await;
    assert_eq!(connection.local_addr, harness.addr());
    assert_eq!(connection.remote_addr, client.local_addr().unwrap());

    harness.transport.stop().await.unwrap();
}

#[tokio::test]
async fn peer_reset_right_after_connect_keeps_the_listener_alive() {
    let mut harness = Harness::new(ListenMode::Stream);
    harness.transport.bind().await.unwrap();

    for _ in 0..8 {
        let client = TcpStream::connect(harness.addr()).await.unwrap();
        // A zero linger turns the close into an RST.
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);
    }

    let _client = TcpStream::connect(harness.addr()).await.unwrap();
    let connection = harness.next_connection().await;
    assert_eq!(connection.local_addr, harness.addr());
    assert_eq!(harness.stops.load(Ordering::SeqCst), 0);

    harness.transport.unbind().await.unwrap();
}
