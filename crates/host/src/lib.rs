//! A peer-to-peer host that upgrades raw transport connections into
//! authenticated, encrypted, multiplexed sessions and negotiates
//! application protocols over the streams inside them.
//!
//! The upgrade pipeline is fixed: a [`Transport`] produces a raw duplex
//! connection, the secure channel authenticates the remote peer and seals
//! the session, the muxer carves it into independent streams, and each
//! stream negotiates exactly one protocol before a [`ProtocolHandler`]
//! takes it over. Connections are reused per peer; streams are cheap.

use std::collections::hash_map::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use libp2p_identity::{Keypair, PeerId};
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::spawn;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use weft_host_primitives::config::HostConfig;
use weft_host_primitives::error::{HostError, NegotiationError};

pub use weft_host_primitives as primitives;

pub use crate::mux::{Connection, Stream, StreamHandle};
pub use crate::protocol::{Controller, ProtocolBinding, ProtocolHandler, Side};
pub use crate::transport::{Listener, MemoryTransport, RawConn, TcpTransport, Transport};
pub use crate::types::{ConnectionDirection, HostEvent};

pub mod mux;
mod negotiation;
pub mod protocol;
mod secure;
pub mod transport;
pub mod types;

use crate::protocol::Registry;
use crate::secure::SecureSession;

/// The two halves of a pending outbound stream, resolving independently:
/// the raw stream handle for callers that track the stream itself, and the
/// protocol controller for callers that only speak to the handler.
pub struct StreamPromise {
    pub stream: PendingStream,
    pub controller: PendingController,
}

impl StreamPromise {
    /// Waits for both halves at once.
    pub async fn resolve(self) -> Result<(StreamHandle, Controller), HostError> {
        let stream = self.stream.await?;
        let controller = self.controller.await?;
        Ok((stream, controller))
    }
}

impl fmt::Debug for StreamPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPromise").finish_non_exhaustive()
    }
}

pub struct PendingStream(oneshot::Receiver<Result<StreamHandle, HostError>>);

impl Future for PendingStream {
    type Output = Result<StreamHandle, HostError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|received| match received {
            Ok(resolved) => resolved,
            Err(_) => Err(HostError::Shutdown),
        })
    }
}

impl fmt::Debug for PendingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStream").finish_non_exhaustive()
    }
}

pub struct PendingController(oneshot::Receiver<Result<Controller, HostError>>);

impl Future for PendingController {
    type Output = Result<Controller, HostError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|received| match received {
            Ok(resolved) => resolved,
            Err(_) => Err(HostError::Shutdown),
        })
    }
}

impl fmt::Debug for PendingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingController").finish_non_exhaustive()
    }
}

/// Cheap, cloneable handle to a running host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.inner.peer_id)
            .finish_non_exhaustive()
    }
}

struct HostInner {
    keypair: Keypair,
    peer_id: PeerId,
    config: HostConfig,
    transport: Arc<dyn Transport>,
    registry: Registry,
    state: Mutex<State>,
    events: mpsc::Sender<HostEvent>,
}

#[derive(Default)]
struct State {
    connections: HashMap<PeerId, Connection>,
    listeners: Vec<Multiaddr>,
    shutting_down: bool,
}

impl Host {
    /// Builds a host from its identity, a transport and the immutable set
    /// of protocol bindings it will serve. Returns the host together with
    /// its lifecycle event receiver.
    #[must_use]
    pub fn new(
        config: HostConfig,
        transport: Arc<dyn Transport>,
        bindings: Vec<ProtocolBinding>,
    ) -> (Self, mpsc::Receiver<HostEvent>) {
        let (events, events_rx) = mpsc::channel(64);
        let keypair = config.identity.clone();
        let peer_id = keypair.public().to_peer_id();

        let host = Self {
            inner: Arc::new(HostInner {
                keypair,
                peer_id,
                config,
                transport,
                registry: Registry::new(bindings),
                state: Mutex::new(State::default()),
                events,
            }),
        };
        (host, events_rx)
    }

    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    #[must_use]
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.state.lock().listeners.clone()
    }

    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().connections.keys().copied().collect()
    }

    /// Binds every address from the configuration.
    pub async fn start(&self) -> Result<(), HostError> {
        for addr in self.inner.config.listen.clone() {
            drop(self.listen(&addr).await?);
        }
        Ok(())
    }

    /// Starts accepting connections on `addr`, returning the address
    /// actually bound (wildcard ports resolved).
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Multiaddr, HostError> {
        let listener = self
            .inner
            .transport
            .listen(addr)
            .await
            .map_err(HostError::transport)?;
        let local_addr = listener.local_addr.clone();

        self.inner.state.lock().listeners.push(local_addr.clone());
        self.inner.emit(HostEvent::ListeningOn {
            address: local_addr.clone(),
        });
        drop(spawn(Arc::clone(&self.inner).accept_loop(listener)));

        Ok(local_addr)
    }

    /// Opens a stream to `peer` at `addr` and negotiates `protocol` on it,
    /// reusing an established connection when one exists. The returned
    /// promise resolves once the handler is bound; on failure both halves
    /// resolve with the same error.
    pub fn new_stream(
        &self,
        protocol: impl Into<String>,
        peer: PeerId,
        addr: Multiaddr,
    ) -> StreamPromise {
        let (stream_tx, stream_rx) = oneshot::channel();
        let (controller_tx, controller_rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let protocol = protocol.into();
        drop(spawn(async move {
            let deadline = inner.config.timeouts.call;
            let outbound = Arc::clone(&inner).outbound_stream(protocol, peer, addr);
            let result = match timeout(deadline, outbound).await {
                Ok(result) => result,
                Err(_) => Err(HostError::Timeout),
            };
            match result {
                Ok((handle, controller)) => {
                    drop(stream_tx.send(Ok(handle)));
                    drop(controller_tx.send(Ok(controller)));
                }
                Err(err) => {
                    drop(stream_tx.send(Err(err.clone())));
                    drop(controller_tx.send(Err(err)));
                }
            }
        }));

        StreamPromise {
            stream: PendingStream(stream_rx),
            controller: PendingController(controller_rx),
        }
    }

    /// Closes the connection to `peer`, failing all streams on it.
    pub async fn disconnect(&self, peer: PeerId) {
        let connection = self.inner.state.lock().connections.remove(&peer);
        if let Some(connection) = connection {
            connection.close().await;
            self.inner.emit(HostEvent::ConnectionClosed { peer_id: peer });
        }
    }

    /// Closes every connection and stops dialing. Listeners wind down as
    /// their accept loops observe the shutdown.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for connection in connections {
            connection.close().await;
        }
    }
}

impl HostInner {
    fn emit(&self, event: HostEvent) {
        // Best effort: a slow or dropped consumer never stalls the host.
        drop(self.events.try_send(event));
    }

    async fn accept_loop(self: Arc<Self>, mut listener: Listener) {
        while let Some((raw, remote)) = listener.incoming.recv().await {
            if self.state.lock().shutting_down {
                break;
            }
            let inner = Arc::clone(&self);
            drop(spawn(async move {
                let deadline = inner.config.timeouts.handshake;
                let secured = secure::secure_inbound(raw, &inner.keypair, deadline).await;
                match secured {
                    Ok((session, peer)) => {
                        drop(inner.register(session, peer, remote, ConnectionDirection::Inbound));
                    }
                    Err(err) => debug!(%remote, %err, "inbound handshake failed"),
                }
            }));
        }
    }

    /// Returns the live connection to `peer`, dialing one if necessary.
    async fn connect(self: Arc<Self>, peer: PeerId, addr: &Multiaddr) -> Result<Connection, HostError> {
        {
            let state = self.state.lock();
            if state.shutting_down {
                return Err(HostError::Shutdown);
            }
            if let Some(existing) = state.connections.get(&peer) {
                if !existing.is_closed() {
                    return Ok(existing.clone());
                }
            }
        }

        let raw = self
            .transport
            .connect(addr)
            .await
            .map_err(HostError::transport)?;
        let deadline = self.config.timeouts.handshake;
        let (session, authenticated) =
            secure::secure_outbound(raw, &self.keypair, Some(peer), deadline).await?;

        Ok(self.register(session, authenticated, addr.clone(), ConnectionDirection::Outbound))
    }

    /// Installs a freshly secured session as the connection to `peer`. If a
    /// concurrent dial already installed one, the established connection
    /// wins and the newcomer is closed.
    fn register(
        self: Arc<Self>,
        session: SecureSession<RawConn>,
        peer: PeerId,
        addr: Multiaddr,
        direction: ConnectionDirection,
    ) -> Connection {
        enum Placement {
            Installed,
            Existing(Connection),
            Rejected,
        }

        let (connection, inbound) = mux::spawn(session, peer, addr.clone(), self.config.mux);

        let placement = {
            let mut state = self.state.lock();
            // A shutdown that began while this handshake was in flight
            // must not gain a connection nothing will ever close.
            if state.shutting_down {
                Placement::Rejected
            } else {
                match state.connections.get(&peer) {
                    Some(existing) if !existing.is_closed() => {
                        Placement::Existing(existing.clone())
                    }
                    _ => {
                        drop(state.connections.insert(peer, connection.clone()));
                        Placement::Installed
                    }
                }
            }
        };

        match placement {
            Placement::Existing(existing) => {
                debug!(%peer, "duplicate connection to peer, keeping the established one");
                drop(spawn(async move { connection.close().await }));
                existing
            }
            Placement::Rejected => {
                debug!(%peer, "refusing connection secured during shutdown");
                let doomed = connection.clone();
                drop(spawn(async move { doomed.close().await }));
                connection
            }
            Placement::Installed => {
                self.emit(HostEvent::ConnectionEstablished {
                    peer_id: peer,
                    address: addr,
                    direction,
                });
                drop(spawn(Arc::clone(&self).dispatch_inbound(peer, inbound)));
                connection
            }
        }
    }

    /// Serves remotely opened streams on one connection until it closes.
    async fn dispatch_inbound(self: Arc<Self>, peer: PeerId, mut inbound: mpsc::Receiver<Stream>) {
        while let Some(stream) = inbound.recv().await {
            drop(spawn(Arc::clone(&self).serve_inbound_stream(peer, stream)));
        }

        let removed = {
            let mut state = self.state.lock();
            if state.connections.get(&peer).is_some_and(Connection::is_closed) {
                state.connections.remove(&peer).is_some()
            } else {
                false
            }
        };
        if removed {
            self.emit(HostEvent::ConnectionClosed { peer_id: peer });
        }
    }

    /// Negotiates one inbound stream and hands it to its binding. Failures
    /// reset the stream and leave the connection untouched.
    async fn serve_inbound_stream(self: Arc<Self>, peer: PeerId, mut stream: Stream) {
        let deadline = self.config.timeouts.negotiation;
        let negotiated = timeout(
            deadline,
            negotiation::listen(&mut stream, |id| self.registry.supports(id)),
        )
        .await
        .map_err(|_| NegotiationError::Timeout)
        .and_then(|result| result);

        let protocol = match negotiated {
            Ok(protocol) => protocol,
            Err(err) => {
                debug!(%peer, %err, "inbound stream negotiation failed");
                stream.reset();
                self.emit(HostEvent::InboundStreamFailed {
                    peer_id: peer,
                    error: err.to_string(),
                });
                return;
            }
        };
        stream.set_protocol(protocol.clone());

        let Some(handler) = self.registry.get(&protocol) else {
            // supports() held during negotiation; the registry is immutable,
            // so this cannot happen.
            stream.reset();
            return;
        };

        match handler.bind(stream, Side::Listener) {
            Ok(controller) => {
                // Inbound controllers belong to the handler; nothing here
                // talks to them.
                drop(controller);
                self.emit(HostEvent::InboundStream {
                    peer_id: peer,
                    protocol,
                });
            }
            Err(err) => {
                warn!(%peer, %protocol, %err, "protocol handler rejected inbound stream");
                self.emit(HostEvent::InboundStreamFailed {
                    peer_id: peer,
                    error: err.to_string(),
                });
            }
        }
    }

    async fn outbound_stream(
        self: Arc<Self>,
        protocol: String,
        peer: PeerId,
        addr: Multiaddr,
    ) -> Result<(StreamHandle, Controller), HostError> {
        let handler = self
            .registry
            .get(&protocol)
            .cloned()
            .ok_or_else(|| HostError::NoBinding(protocol.clone()))?;

        let connection = Arc::clone(&self).connect(peer, &addr).await?;
        let mut stream = connection.open_stream().await?;

        // A failed negotiation drops the stream here, which resets it.
        let negotiated = timeout(
            self.config.timeouts.negotiation,
            negotiation::dial(&mut stream, &[protocol.as_str()]),
        )
        .await
        .map_err(|_| NegotiationError::Timeout)
        .and_then(|result| result)?;
        stream.set_protocol(negotiated);

        let handle = stream.handle();
        let controller = handler
            .bind(stream, Side::Dialer)
            .map_err(|err| HostError::Handler(err.to_string()))?;

        Ok((handle, controller))
    }
}
