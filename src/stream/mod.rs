pub mod factory;
pub mod policy;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod types;
pub mod websocket;

pub use factory::{StreamFactory, StreamRequest, StreamTarget, SupersessionScope};
pub use policy::{RetryDecision, RetryPolicy, ScheduledRetry};
pub use registry::{StreamHandle, StreamRegistry, StreamStatus};
pub use transport::{EventSink, Transport, TransportEvent, TransportHandle};
pub use types::{ChannelKind, CloseInfo, ConnectionKey, ReadyState, StreamCallbacks};
pub use websocket::WebSocketTransport;
