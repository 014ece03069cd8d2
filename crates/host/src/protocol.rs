//! Protocol bindings: the immutable table mapping protocol ids to handler
//! factories, fixed when the host is built and consulted at negotiation
//! time. Dispatch is data-driven; there is no handler hierarchy.

use std::any::Any;
use std::collections::hash_map::HashMap;
use std::fmt;
use std::sync::Arc;

use eyre::Result as EyreResult;

use crate::mux::Stream;

/// Which end of the stream the handler is bound to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Dialer,
    Listener,
}

/// Application-facing facade over a negotiated stream. Concrete controller
/// types live with their protocol; callers downcast.
pub type Controller = Box<dyn Any + Send>;

/// Factory turning a freshly negotiated stream into a running protocol
/// handler. `bind` must not block; long-lived work belongs in a task the
/// handler spawns.
pub trait ProtocolHandler: Send + Sync {
    fn bind(&self, stream: Stream, side: Side) -> EyreResult<Controller>;
}

/// One registered protocol: its id plus the handler factory.
#[derive(Clone)]
pub struct ProtocolBinding {
    pub protocol_id: String,
    pub handler: Arc<dyn ProtocolHandler>,
}

impl ProtocolBinding {
    pub fn new(protocol_id: impl Into<String>, handler: Arc<dyn ProtocolHandler>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            handler,
        }
    }
}

impl fmt::Debug for ProtocolBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolBinding")
            .field("protocol_id", &self.protocol_id)
            .finish_non_exhaustive()
    }
}

/// Immutable registry built once at host construction.
#[derive(Default)]
pub(crate) struct Registry {
    bindings: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.bindings.keys()).finish()
    }
}

impl Registry {
    pub(crate) fn new(bindings: Vec<ProtocolBinding>) -> Self {
        Self {
            bindings: bindings
                .into_iter()
                .map(|binding| (binding.protocol_id, binding.handler))
                .collect(),
        }
    }

    pub(crate) fn get(&self, protocol_id: &str) -> Option<&Arc<dyn ProtocolHandler>> {
        self.bindings.get(protocol_id)
    }

    pub(crate) fn supports(&self, protocol_id: &str) -> bool {
        self.bindings.contains_key(protocol_id)
    }
}
