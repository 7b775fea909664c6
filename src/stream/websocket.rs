use crate::error::AppError;
use crate::stream::transport::{EventSink, Transport, TransportEvent, TransportHandle};
use crate::stream::types::{CloseInfo, ReadyState, CLOSE_NO_STATUS};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

const MAX_MESSAGE_SIZE: usize = 64 << 20;
const MAX_FRAME_SIZE: usize = 16 << 20;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            config: WebSocketConfig {
                max_message_size: Some(MAX_MESSAGE_SIZE),
                max_frame_size: Some(MAX_FRAME_SIZE),
                ..Default::default()
            },
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, target: &str, events: EventSink) -> Result<Box<dyn TransportHandle>, AppError> {
        let request = client_request(target)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| AppError::RuntimeUnavailable)?;

        let state = Arc::new(AtomicU8::new(ReadyState::Connecting.as_u8()));
        let cancel = CancellationToken::new();
        runtime.spawn(run_connection(
            request,
            self.config,
            events,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Ok(Box::new(WebSocketHandle { state, cancel }))
    }
}

fn client_request(target: &str) -> Result<Request, AppError> {
    let invalid = || AppError::InvalidTarget(target.to_string());
    let request = target.into_client_request().map_err(|_| invalid())?;

    let uri = request.uri();
    let websocket_scheme = matches!(uri.scheme_str(), Some("ws" | "wss"));
    let has_host = uri.host().is_some_and(|host| !host.is_empty());
    if !websocket_scheme || !has_host {
        return Err(invalid());
    }
    Ok(request)
}

struct WebSocketHandle {
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl TransportHandle for WebSocketHandle {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn close(&self) -> Result<(), AppError> {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                ReadyState::from_u8(current)
                    .is_active()
                    .then_some(ReadyState::Closing.as_u8())
            });
        self.cancel.cancel();
        Ok(())
    }
}

fn set_state(state: &AtomicU8, next: ReadyState) {
    state.store(next.as_u8(), Ordering::Release);
}

async fn run_connection(
    request: Request,
    config: WebSocketConfig,
    events: EventSink,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            set_state(&state, ReadyState::Closed);
            return;
        }
        result = connect_async_with_config(request, Some(config), true) => result,
    };

    let mut stream = match connected {
        Ok((stream, _response)) => stream,
        Err(error) => {
            set_state(&state, ReadyState::Closed);
            events.emit(TransportEvent::Error(error.into()));
            events.emit(TransportEvent::Closed(CloseInfo::abnormal()));
            return;
        }
    };

    let opened = state.compare_exchange(
        ReadyState::Connecting.as_u8(),
        ReadyState::Open.as_u8(),
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if opened.is_err() {
        // close() won the race against the handshake
        let _ = stream.close(None).await;
        set_state(&state, ReadyState::Closed);
        return;
    }
    events.emit(TransportEvent::Open);

    let mut close_code: Option<u16> = None;
    let outcome = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(error) = stream.close(None).await {
                    tracing::debug!(key = %events.key(), %error, "websocket close handshake failed");
                }
                set_state(&state, ReadyState::Closed);
                return;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                events.emit(TransportEvent::Message(text.into_bytes()));
            }
            Some(Ok(Message::Binary(payload))) => {
                events.emit(TransportEvent::Message(payload));
            }
            Some(Ok(Message::Close(frame))) => {
                close_code = Some(frame.map_or(CLOSE_NO_STATUS, |frame| u16::from(frame.code)));
                set_state(&state, ReadyState::Closing);
            }
            Some(Ok(_)) => {}
            None | Some(Err(WsError::ConnectionClosed)) => {
                break close_code.map_or_else(CloseInfo::abnormal, CloseInfo::clean);
            }
            Some(Err(error)) => {
                events.emit(TransportEvent::Error(error.into()));
                break CloseInfo::abnormal();
            }
        }
    };

    set_state(&state, ReadyState::Closed);
    events.emit(TransportEvent::Closed(outcome));
}
