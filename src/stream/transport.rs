use crate::error::AppError;
use crate::stream::registry::{dispatch_event, DispatchGate, RegistryShared};
use crate::stream::types::{CloseInfo, ConnectionKey, ReadyState};
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(Vec<u8>),
    Error(AppError),
    Closed(CloseInfo),
}

/// `open` must not block. A failed handshake is reported through `events`.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, target: &str, events: EventSink) -> Result<Box<dyn TransportHandle>, AppError>;
}

pub trait TransportHandle: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    fn close(&self) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct EventSink {
    registry: Weak<RegistryShared>,
    key: ConnectionKey,
    generation: u64,
    gate: Arc<DispatchGate>,
}

impl EventSink {
    pub(crate) fn new(
        registry: Weak<RegistryShared>,
        key: ConnectionKey,
        generation: u64,
        gate: Arc<DispatchGate>,
    ) -> Self {
        Self {
            registry,
            key,
            generation,
            gate,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn emit(&self, event: TransportEvent) {
        let Some(shared) = self.registry.upgrade() else {
            return;
        };
        dispatch_event(&shared, &self.gate, &self.key, self.generation, event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}
