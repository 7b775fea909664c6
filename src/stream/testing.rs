use crate::error::AppError;
use crate::stream::transport::{EventSink, Transport, TransportEvent, TransportHandle};
use crate::stream::types::{CloseInfo, ReadyState, StreamCallbacks, CLOSE_NORMAL};
use parking_lot::Mutex;
use simd_json::OwnedValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type OpenHook = Box<dyn FnOnce(&ScriptedConnection) + Send>;

#[derive(Default)]
struct ScriptedState {
    connections: Vec<ScriptedConnection>,
    failing_opens: Vec<String>,
    failing_closes: Vec<String>,
    next_open_hook: Option<OpenHook>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_open_for(&self, target: &str) {
        self.state.lock().failing_opens.push(target.to_string());
    }

    pub(crate) fn fail_close_for(&self, target: &str) {
        self.state.lock().failing_closes.push(target.to_string());
    }

    /// Runs `hook` inside the next `open`, before it returns.
    pub(crate) fn during_next_open(
        &self,
        hook: impl FnOnce(&ScriptedConnection) + Send + 'static,
    ) {
        self.state.lock().next_open_hook = Some(Box::new(hook));
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub(crate) fn last(&self) -> ScriptedConnection {
        self.state
            .lock()
            .connections
            .last()
            .cloned()
            .expect("no connection has been opened")
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, target: &str, events: EventSink) -> Result<Box<dyn TransportHandle>, AppError> {
        let mut state = self.state.lock();
        if state.failing_opens.iter().any(|failing| failing == target) {
            return Err(AppError::InvalidTarget(target.to_string()));
        }

        let connection = ScriptedConnection {
            target: target.to_string(),
            sink: events,
            ready_state: Arc::new(Mutex::new(ReadyState::Connecting)),
            close_requests: Arc::new(AtomicUsize::new(0)),
        };
        let handle = ScriptedHandle {
            ready_state: Arc::clone(&connection.ready_state),
            close_requests: Arc::clone(&connection.close_requests),
            fail_close: state.failing_closes.iter().any(|failing| failing == target),
        };
        state.connections.push(connection.clone());
        let hook = state.next_open_hook.take();
        drop(state);

        if let Some(hook) = hook {
            hook(&connection);
        }
        Ok(Box::new(handle))
    }
}

struct ScriptedHandle {
    ready_state: Arc<Mutex<ReadyState>>,
    close_requests: Arc<AtomicUsize>,
    fail_close: bool,
}

impl TransportHandle for ScriptedHandle {
    fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock()
    }

    fn close(&self) -> Result<(), AppError> {
        self.close_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(AppError::TransportClose("scripted close failure".into()));
        }
        *self.ready_state.lock() = ReadyState::Closing;
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct ScriptedConnection {
    target: String,
    sink: EventSink,
    ready_state: Arc<Mutex<ReadyState>>,
    close_requests: Arc<AtomicUsize>,
}

impl ScriptedConnection {
    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn close_requests(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn open(&self) {
        *self.ready_state.lock() = ReadyState::Open;
        self.sink.emit(TransportEvent::Open);
    }

    pub(crate) fn message(&self, raw: &str) {
        self.sink
            .emit(TransportEvent::Message(raw.as_bytes().to_vec()));
    }

    pub(crate) fn error(&self, message: &str) {
        self.sink
            .emit(TransportEvent::Error(AppError::TransportClose(message.to_string())));
    }

    pub(crate) fn drop_connection(&self) {
        *self.ready_state.lock() = ReadyState::Closed;
        self.sink.emit(TransportEvent::Closed(CloseInfo::abnormal()));
    }

    pub(crate) fn close_cleanly(&self) {
        *self.ready_state.lock() = ReadyState::Closed;
        self.sink
            .emit(TransportEvent::Closed(CloseInfo::clean(CLOSE_NORMAL)));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Seen {
    Open,
    Message(OwnedValue),
    Error,
    Close(CloseInfo),
}

#[derive(Clone, Default)]
pub(crate) struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    pub(crate) fn callbacks(&self) -> Arc<StreamCallbacks> {
        let on_open = Arc::clone(&self.seen);
        let on_message = Arc::clone(&self.seen);
        let on_error = Arc::clone(&self.seen);
        let on_close = Arc::clone(&self.seen);

        Arc::new(
            StreamCallbacks::new()
                .on_open(move || on_open.lock().push(Seen::Open))
                .on_message(move |value| on_message.lock().push(Seen::Message(value)))
                .on_error(move |_| on_error.lock().push(Seen::Error))
                .on_close(move |info| on_close.lock().push(Seen::Close(info))),
        )
    }

    pub(crate) fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}
