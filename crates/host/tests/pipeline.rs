//! End-to-end tests of the full upgrade pipeline: transport, secure
//! channel, muxer and protocol negotiation composed by the host.

use std::io;
use std::sync::Arc;

use eyre::Result as EyreResult;
use libp2p_identity::{Keypair, PeerId};
use multiaddr::Multiaddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::spawn;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing_subscriber::EnvFilter;
use weft_host::primitives::config::HostConfig;
use weft_host::primitives::error::{HostError, NegotiationError};
use weft_host::{
    ConnectionDirection, Controller, Host, HostEvent, MemoryTransport, ProtocolBinding,
    ProtocolHandler, Side, Stream, TcpTransport, Transport,
};

const PING_PROTOCOL: &str = "/weft/ping/1.0.0";
const PING_SIZE: usize = 32;

fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    );
}

/// Fixed-size echo protocol. The listener echoes everything until EOF; the
/// dialer's controller issues one round trip per call.
struct PingProtocol;

struct PingController {
    requests: mpsc::Sender<([u8; PING_SIZE], oneshot::Sender<io::Result<[u8; PING_SIZE]>>)>,
}

impl PingController {
    async fn ping(&self, payload: [u8; PING_SIZE]) -> io::Result<[u8; PING_SIZE]> {
        let gone = || io::Error::new(io::ErrorKind::BrokenPipe, "ping task gone");
        let (reply, result) = oneshot::channel();
        self.requests
            .send((payload, reply))
            .await
            .map_err(|_| gone())?;
        result.await.map_err(|_| gone())?
    }
}

impl ProtocolHandler for PingProtocol {
    fn bind(&self, mut stream: Stream, side: Side) -> EyreResult<Controller> {
        match side {
            Side::Listener => {
                drop(spawn(async move {
                    let mut buf = [0_u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ignored = stream.close().await;
                }));
                Ok(Box::new(()))
            }
            Side::Dialer => {
                let (requests, mut queue) = mpsc::channel::<(
                    [u8; PING_SIZE],
                    oneshot::Sender<io::Result<[u8; PING_SIZE]>>,
                )>(8);
                drop(spawn(async move {
                    while let Some((payload, reply)) = queue.recv().await {
                        let exchanged = async {
                            stream.write_all(&payload).await?;
                            let mut echo = [0_u8; PING_SIZE];
                            stream.read_exact(&mut echo).await?;
                            Ok(echo)
                        }
                        .await;
                        let failed = exchanged.is_err();
                        drop(reply.send(exchanged));
                        if failed {
                            break;
                        }
                    }
                }));
                Ok(Box::new(PingController { requests }))
            }
        }
    }
}

const IDENTIFY_PROTOCOL: &str = "/weft/identify/1.0.0";

/// One-shot protocol: the listener reports its listen address as raw
/// multiaddr bytes and closes.
struct IdentifyProtocol {
    address: Multiaddr,
}

struct IdentifyReply {
    address: oneshot::Receiver<io::Result<Vec<u8>>>,
}

impl ProtocolHandler for IdentifyProtocol {
    fn bind(&self, mut stream: Stream, side: Side) -> EyreResult<Controller> {
        match side {
            Side::Listener => {
                let bytes = self.address.to_vec();
                drop(spawn(async move {
                    if stream.send(&bytes).await.is_ok() {
                        let _ignored = stream.close().await;
                    }
                }));
                Ok(Box::new(()))
            }
            Side::Dialer => {
                let (reply, address) = oneshot::channel();
                drop(spawn(async move {
                    let mut bytes = Vec::new();
                    let result = stream.read_to_end(&mut bytes).await.map(|_| bytes);
                    drop(reply.send(result));
                }));
                Ok(Box::new(IdentifyReply { address }))
            }
        }
    }
}

fn host_with_ping(transport: Arc<dyn Transport>) -> (Host, mpsc::Receiver<HostEvent>, PeerId) {
    let config = HostConfig::new(Keypair::generate_ed25519());
    let bindings = vec![ProtocolBinding::new(PING_PROTOCOL, Arc::new(PingProtocol))];
    let (host, events) = Host::new(config, transport, bindings);
    let peer_id = host.local_peer_id();
    (host, events, peer_id)
}

async fn dial_ping(host: &Host, peer: PeerId, addr: Multiaddr) -> PingController {
    let promise = host.new_stream(PING_PROTOCOL, peer, addr);
    let (_handle, controller) = promise.resolve().await.unwrap();
    *controller.downcast::<PingController>().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_round_trips_over_tcp() {
    init_tracing();

    let (dialer, _dialer_events, _dialer_id) = host_with_ping(Arc::new(TcpTransport));
    let (listener, _listener_events, listener_id) = host_with_ping(Arc::new(TcpTransport));

    let listen_addr = listener
        .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .unwrap();

    let promise = dialer.new_stream(PING_PROTOCOL, listener_id, listen_addr);
    let (handle, controller) = promise.resolve().await.unwrap();
    assert_eq!(handle.protocol(), Some(PING_PROTOCOL));
    let ping = *controller.downcast::<PingController>().unwrap();

    for round in 0..10_u8 {
        let payload = [round; PING_SIZE];
        let echo = ping.ping(payload).await.unwrap();
        assert_eq!(echo, payload);
    }

    // Closing the write side ends the echo loop; later pings fail.
    handle.close().await.unwrap();
    assert!(ping.ping([0; PING_SIZE]).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn identify_reports_the_dialed_address() {
    init_tracing();

    let transport = MemoryTransport::default();
    let listen_addr: Multiaddr = "/memory/9".parse().unwrap();
    let identify: Arc<dyn ProtocolHandler> = Arc::new(IdentifyProtocol {
        address: listen_addr.clone(),
    });

    let (dialer, _dialer_events) = Host::new(
        HostConfig::new(Keypair::generate_ed25519()),
        Arc::new(transport.clone()),
        vec![ProtocolBinding::new(IDENTIFY_PROTOCOL, Arc::clone(&identify))],
    );
    let (listener, _listener_events) = Host::new(
        HostConfig::new(Keypair::generate_ed25519()),
        Arc::new(transport),
        vec![ProtocolBinding::new(IDENTIFY_PROTOCOL, identify)],
    );
    let listener_id = listener.local_peer_id();

    let bound = listener.listen(&listen_addr).await.unwrap();
    assert_eq!(bound, listen_addr);
    assert_eq!(listener.listen_addrs(), vec![listen_addr.clone()]);

    let promise = dialer.new_stream(IDENTIFY_PROTOCOL, listener_id, listen_addr.clone());
    let (_handle, controller) = promise.resolve().await.unwrap();
    let reply = *controller.downcast::<IdentifyReply>().unwrap();

    // The reported address, byte-serialized and re-parsed, is the address
    // that was actually dialed.
    let bytes = reply.address.await.unwrap().unwrap();
    let reported = Multiaddr::try_from(bytes).unwrap();
    assert_eq!(reported, listen_addr);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_remote_protocol_fails_both_promise_halves() {
    init_tracing();

    let transport = MemoryTransport::default();
    let (dialer, _dialer_events, _dialer_id) = host_with_ping(Arc::new(transport.clone()));

    // The listener binds nothing, so negotiation is refused with `na`.
    let config = HostConfig::new(Keypair::generate_ed25519());
    let (listener, _listener_events) = Host::new(config, Arc::new(transport), vec![]);
    let listener_id = listener.local_peer_id();

    let listen_addr = listener.listen(&"/memory/0".parse().unwrap()).await.unwrap();

    let promise = dialer.new_stream(PING_PROTOCOL, listener_id, listen_addr);
    let stream_err = promise.stream.await.unwrap_err();
    let controller_err = promise.controller.await.unwrap_err();

    for err in [stream_err, controller_err] {
        assert!(
            matches!(
                err,
                HostError::Negotiation(NegotiationError::NoSuchProtocol)
            ),
            "{err}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dialing_an_unbound_local_protocol_is_rejected() {
    init_tracing();

    let transport = MemoryTransport::default();
    let (dialer, _events, _id) = host_with_ping(Arc::new(transport.clone()));
    let (listener, _listener_events, listener_id) = host_with_ping(Arc::new(transport));

    let listen_addr = listener.listen(&"/memory/0".parse().unwrap()).await.unwrap();

    let promise = dialer.new_stream("/weft/absent/1.0.0", listener_id, listen_addr);
    let err = promise.stream.await.unwrap_err();
    assert!(matches!(err, HostError::NoBinding(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn connections_are_reused_across_streams() {
    init_tracing();

    let transport = MemoryTransport::default();
    let (dialer, mut dialer_events, dialer_id) = host_with_ping(Arc::new(transport.clone()));
    let (listener, _listener_events, listener_id) = host_with_ping(Arc::new(transport));

    let listen_addr = listener.listen(&"/memory/0".parse().unwrap()).await.unwrap();

    let first = dial_ping(&dialer, listener_id, listen_addr.clone()).await;
    let second = dial_ping(&dialer, listener_id, listen_addr).await;

    assert_eq!(first.ping([1; PING_SIZE]).await.unwrap(), [1; PING_SIZE]);
    assert_eq!(second.ping([2; PING_SIZE]).await.unwrap(), [2; PING_SIZE]);

    assert_eq!(dialer.connected_peers(), vec![listener_id]);
    assert_eq!(listener.connected_peers(), vec![dialer_id]);

    let mut established = 0;
    while let Ok(event) = dialer_events.try_recv() {
        if matches!(
            event,
            HostEvent::ConnectionEstablished {
                direction: ConnectionDirection::Outbound,
                ..
            }
        ) {
            established += 1;
        }
    }
    assert_eq!(established, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_fails_streams_on_the_connection() {
    init_tracing();

    let transport = MemoryTransport::default();
    let (dialer, _dialer_events, _dialer_id) = host_with_ping(Arc::new(transport.clone()));
    let (listener, mut listener_events, listener_id) = host_with_ping(Arc::new(transport));

    let listen_addr = listener.listen(&"/memory/0".parse().unwrap()).await.unwrap();
    let ping = dial_ping(&dialer, listener_id, listen_addr).await;
    assert_eq!(ping.ping([7; PING_SIZE]).await.unwrap(), [7; PING_SIZE]);

    dialer.disconnect(listener_id).await;
    assert!(dialer.connected_peers().is_empty());
    assert!(ping.ping([8; PING_SIZE]).await.is_err());

    // The listener notices its side of the connection going away.
    let deadline = Duration::from_secs(5);
    loop {
        let event = timeout(deadline, listener_events.recv()).await.unwrap().unwrap();
        if matches!(event, HostEvent::ConnectionClosed { peer_id } if peer_id == dialer.local_peer_id())
        {
            break;
        }
    }
    assert!(timeout(deadline, async {
        while !listener.connected_peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_negotiation_only_affects_its_own_stream() {
    init_tracing();

    let transport = MemoryTransport::default();
    let exotic = "/weft/exotic/1.0.0";
    let (dialer, _dialer_events) = Host::new(
        HostConfig::new(Keypair::generate_ed25519()),
        Arc::new(transport.clone()),
        vec![
            ProtocolBinding::new(PING_PROTOCOL, Arc::new(PingProtocol)),
            ProtocolBinding::new(exotic, Arc::new(PingProtocol)),
        ],
    );
    let (listener, _listener_events, listener_id) = host_with_ping(Arc::new(transport));

    let listen_addr = listener.listen(&"/memory/0".parse().unwrap()).await.unwrap();

    // The listener refuses the protocol it does not serve...
    let err = dialer
        .new_stream(exotic, listener_id, listen_addr.clone())
        .stream
        .await
        .unwrap_err();
    assert!(
        matches!(err, HostError::Negotiation(NegotiationError::NoSuchProtocol)),
        "{err}"
    );

    // ...which is fatal to that stream only: the connection it rode on
    // keeps serving fresh streams.
    let ping = dial_ping(&dialer, listener_id, listen_addr).await;
    assert_eq!(ping.ping([3; PING_SIZE]).await.unwrap(), [3; PING_SIZE]);
    assert_eq!(dialer.connected_peers(), vec![listener_id]);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_during_inbound_upgrade_leaves_no_connections() {
    init_tracing();

    let transport = MemoryTransport::default();
    let (dialer, _dialer_events, _dialer_id) = host_with_ping(Arc::new(transport.clone()));
    let (listener, _listener_events, listener_id) = host_with_ping(Arc::new(transport));

    let listen_addr = listener.listen(&"/memory/0".parse().unwrap()).await.unwrap();

    // Shut the listener down while the dial's handshake is in flight.
    // Whichever side of the race registration lands on, the listener must
    // not end up holding a connection nothing will close.
    let promise = dialer.new_stream(PING_PROTOCOL, listener_id, listen_addr);
    listener.shutdown().await;
    drop(promise.resolve().await);

    let deadline = Duration::from_secs(5);
    assert!(timeout(deadline, async {
        while !listener.connected_peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_dialing() {
    init_tracing();

    let transport = MemoryTransport::default();
    let (dialer, _dialer_events, _dialer_id) = host_with_ping(Arc::new(transport.clone()));
    let (listener, _listener_events, listener_id) = host_with_ping(Arc::new(transport));

    let listen_addr = listener.listen(&"/memory/0".parse().unwrap()).await.unwrap();

    dialer.shutdown().await;
    let err = dialer
        .new_stream(PING_PROTOCOL, listener_id, listen_addr)
        .stream
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Shutdown), "{err}");
}
