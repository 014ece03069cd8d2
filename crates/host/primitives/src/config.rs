use std::time::Duration;

use libp2p_identity::Keypair;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

/// Configuration for a [`Host`](../../weft_host). The identity keypair is
/// generated or loaded by the embedder; everything else carries defaults.
#[derive(Debug)]
pub struct HostConfig {
    pub identity: Keypair,
    pub listen: Vec<Multiaddr>,

    pub timeouts: TimeoutConfig,
    pub mux: MuxConfig,
}

impl HostConfig {
    #[must_use]
    pub fn new(identity: Keypair) -> Self {
        Self {
            identity,
            listen: vec![],
            timeouts: TimeoutConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Window for the whole secure-channel handshake, both directions.
    pub handshake: Duration,
    /// Window for a full protocol negotiation on one stream.
    pub negotiation: Duration,
    /// Default deadline applied to host-level calls such as `new_stream`.
    pub call: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            negotiation: Duration::from_secs(10),
            call: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Largest accepted frame payload. Anything bigger is a protocol
    /// violation and kills the connection.
    pub max_frame_size: usize,
    /// Capacity of the serialized write path into the connection task.
    pub write_buffer: usize,
    /// Per-stream inbound data queue capacity. A consumer that falls this
    /// many frames behind gets its stream reset instead of stalling the
    /// rest of the connection.
    pub stream_buffer: usize,
    /// Capacity of the queue of not-yet-accepted inbound streams.
    pub inbound_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            write_buffer: 64,
            stream_buffer: 32,
            inbound_buffer: 32,
        }
    }
}
