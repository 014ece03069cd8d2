//! Raw byte transports. The upgrade pipeline only needs a reliably-ordered
//! duplex connection; anything satisfying [`Transport`] plugs in.

use std::collections::hash_map::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use multiaddr::{Multiaddr, Protocol};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A raw duplex connection, pre-upgrade. Nothing on it is authenticated,
/// encrypted or multiplexed yet.
pub trait RawConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawConnection for T {}

pub type RawConn = Box<dyn RawConnection>;

/// Accepted connections from one listening address.
#[derive(Debug)]
pub struct Listener {
    /// The address actually bound, with wildcard ports resolved.
    pub local_addr: Multiaddr,
    pub incoming: mpsc::Receiver<(RawConn, Multiaddr)>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, addr: &Multiaddr) -> io::Result<RawConn>;
    async fn listen(&self, addr: &Multiaddr) -> io::Result<Listener>;
}

/// TCP transport over `/ip4|ip6/../tcp/..` multiaddrs.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Multiaddr) -> io::Result<RawConn> {
        let socket_addr = multiaddr_to_socketaddr(addr)?;
        let stream = TcpStream::connect(socket_addr).await?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%socket_addr, %err, "failed to set TCP_NODELAY");
        }
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> io::Result<Listener> {
        let socket_addr = multiaddr_to_socketaddr(addr)?;
        let listener = TcpListener::bind(socket_addr).await?;
        let local_addr = socketaddr_to_multiaddr(&listener.local_addr()?);
        debug!(%local_addr, "transport listening");

        let (tx, rx) = mpsc::channel(16);
        drop(spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "tcp accept failed");
                        break;
                    }
                };
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(%remote, %err, "failed to set TCP_NODELAY");
                }
                let conn: RawConn = Box::new(stream);
                if tx.send((conn, socketaddr_to_multiaddr(&remote))).await.is_err() {
                    break;
                }
            }
        }));

        Ok(Listener {
            local_addr,
            incoming: rx,
        })
    }
}

fn multiaddr_to_socketaddr(addr: &Multiaddr) -> io::Result<SocketAddr> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next() {
        Some(Protocol::Ip4(ip)) => ip.into(),
        Some(Protocol::Ip6(ip)) => ip.into(),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a tcp multiaddr: {addr}"),
            ))
        }
    };
    let Some(Protocol::Tcp(port)) = iter.next() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a tcp multiaddr: {addr}"),
        ));
    };
    Ok(SocketAddr::new(ip, port))
}

fn socketaddr_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    let mut out = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => out.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => out.push(Protocol::Ip6(ip)),
    }
    out.push(Protocol::Tcp(addr.port()));
    out
}

/// In-process transport over `/memory/<n>` multiaddrs, used by tests and
/// simulations. Clones share one hub, so hosts built from clones of the
/// same transport can reach each other.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    hub: Arc<Mutex<HashMap<u64, mpsc::Sender<(RawConn, Multiaddr)>>>>,
}

const MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, addr: &Multiaddr) -> io::Result<RawConn> {
        let port = memory_port(addr)?;
        let listener = self.hub.lock().get(&port).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no memory listener at {addr}"),
            )
        })?;

        let (dialer, listener_end) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        let remote: Multiaddr = Multiaddr::empty().with(Protocol::Memory(0));
        listener
            .send((Box::new(listener_end) as RawConn, remote))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener gone")
            })?;

        Ok(Box::new(dialer))
    }

    async fn listen(&self, addr: &Multiaddr) -> io::Result<Listener> {
        let requested = memory_port(addr)?;
        let (tx, rx) = mpsc::channel(16);

        let port = {
            let mut hub = self.hub.lock();
            let port = if requested == 0 {
                (1..u64::MAX)
                    .find(|candidate| !hub.contains_key(candidate))
                    .unwrap_or(u64::MAX)
            } else {
                requested
            };
            if hub.contains_key(&port) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("memory address {port} already bound"),
                ));
            }
            let _previous = hub.insert(port, tx);
            port
        };

        Ok(Listener {
            local_addr: Multiaddr::empty().with(Protocol::Memory(port)),
            incoming: rx,
        })
    }
}

fn memory_port(addr: &Multiaddr) -> io::Result<u64> {
    match addr.iter().next() {
        Some(Protocol::Memory(port)) => Ok(port),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a memory multiaddr: {addr}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn tcp_multiaddr_mapping() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let socket = multiaddr_to_socketaddr(&addr).unwrap();
        assert_eq!(socket.to_string(), "127.0.0.1:4001");
        assert_eq!(socketaddr_to_multiaddr(&socket), addr);

        let bad: Multiaddr = "/memory/7".parse().unwrap();
        assert!(multiaddr_to_socketaddr(&bad).is_err());
    }

    #[tokio::test]
    async fn memory_transport_connects_to_listener() {
        let transport = MemoryTransport::default();
        let addr: Multiaddr = "/memory/0".parse().unwrap();

        let mut listener = transport.listen(&addr).await.unwrap();
        let mut dialer = transport.connect(&listener.local_addr).await.unwrap();

        let (mut accepted, _remote) = listener.incoming.recv().await.unwrap();
        dialer.write_all(b"over the wire").await.unwrap();

        let mut buf = [0_u8; 13];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the wire");
    }

    #[tokio::test]
    async fn memory_connect_without_listener_is_refused() {
        let transport = MemoryTransport::default();
        let addr: Multiaddr = "/memory/42".parse().unwrap();
        let err = transport.connect(&addr).await.map(|_| ()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
