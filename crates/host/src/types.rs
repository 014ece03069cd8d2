use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

/// Lifecycle notifications delivered over the receiver returned from
/// [`Host::new`](crate::Host::new). Delivery is best-effort; a slow or
/// dropped consumer never stalls the host.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum HostEvent {
    ListeningOn {
        address: Multiaddr,
    },
    ConnectionEstablished {
        peer_id: PeerId,
        address: Multiaddr,
        direction: ConnectionDirection,
    },
    ConnectionClosed {
        peer_id: PeerId,
    },
    /// An inbound stream finished negotiation and was handed to its
    /// binding's handler.
    InboundStream {
        peer_id: PeerId,
        protocol: String,
    },
    /// An inbound stream failed negotiation or dispatch; only that stream
    /// was affected.
    InboundStreamFailed {
        peer_id: PeerId,
        error: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}
