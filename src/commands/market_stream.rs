use crate::error::AppError;
use crate::market::types::{
    decode_kline_update, decode_ticker_update, normalize_interval, LiveCandleTracker, UiCandle,
};
use crate::market::{KLINE_UPDATE_EVENT, STREAM_STATUS_EVENT, TICKER_UPDATE_EVENT};
use crate::state::AppState;
use crate::stream::{ConnectionKey, StreamCallbacks, StreamStatus};
use parking_lot::Mutex;
use serde::Serialize;
use tauri::{AppHandle, Emitter, State};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StreamLifecycleEvent {
    Open {
        key: String,
    },
    Error {
        key: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Closed {
        key: String,
        was_clean: bool,
        code: u16,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct KlineUpdate {
    pub key: String,
    pub candle: UiCandle,
}

fn emit_event<S: Serialize + Clone>(app: &AppHandle, event: &str, payload: S) {
    if let Err(error) = app.emit(event, payload) {
        tracing::warn!(event, %error, "failed to emit event");
    }
}

fn lifecycle_callbacks(app: &AppHandle, key: &ConnectionKey) -> StreamCallbacks {
    let (open_app, error_app, close_app) = (app.clone(), app.clone(), app.clone());
    let (open_key, error_key, close_key) = (key.to_string(), key.to_string(), key.to_string());

    StreamCallbacks::new()
        .on_open(move || {
            emit_event(
                &open_app,
                STREAM_STATUS_EVENT,
                StreamLifecycleEvent::Open {
                    key: open_key.clone(),
                },
            )
        })
        .on_error(move |error| {
            emit_event(
                &error_app,
                STREAM_STATUS_EVENT,
                StreamLifecycleEvent::Error {
                    key: error_key.clone(),
                    message: error.to_string(),
                },
            )
        })
        .on_close(move |info| {
            emit_event(
                &close_app,
                STREAM_STATUS_EVENT,
                StreamLifecycleEvent::Closed {
                    key: close_key.clone(),
                    was_clean: info.was_clean,
                    code: info.code,
                },
            )
        })
}

#[tauri::command]
pub async fn stream_kline(
    app: AppHandle,
    state: State<'_, AppState>,
    symbol: String,
    interval: String,
) -> Result<Option<String>, AppError> {
    let interval = normalize_interval(&interval)?;
    let key = ConnectionKey::kline(symbol.trim(), interval.as_str());
    let tracker = Mutex::new(LiveCandleTracker::new());
    let message_app = app.clone();
    let message_key = key.to_string();

    let callbacks = lifecycle_callbacks(&app, &key).on_message(move |payload| {
        let update = match decode_kline_update(payload) {
            Ok(update) => update,
            Err(error) => {
                tracing::trace!(key = %message_key, %error, "skipping non-kline message");
                return;
            }
        };
        let Some(candle) = tracker.lock().apply(update) else {
            return;
        };
        emit_event(
            &message_app,
            KLINE_UPDATE_EVENT,
            KlineUpdate {
                key: message_key.clone(),
                candle,
            },
        );
    });

    let handle = state.streams.kline(&symbol, interval.as_str(), callbacks);
    Ok(handle.map(|handle| handle.key().to_string()))
}

#[tauri::command]
pub async fn stream_ticker(
    app: AppHandle,
    state: State<'_, AppState>,
    symbol: String,
) -> Result<Option<String>, AppError> {
    let key = ConnectionKey::ticker(symbol.trim());
    let message_app = app.clone();
    let message_key = key.to_string();

    let callbacks = lifecycle_callbacks(&app, &key).on_message(move |payload| {
        match decode_ticker_update(payload) {
            Ok(ticker) => emit_event(&message_app, TICKER_UPDATE_EVENT, ticker),
            Err(error) => {
                tracing::trace!(key = %message_key, %error, "skipping non-ticker message");
            }
        }
    });

    let handle = state.streams.ticker(&symbol, callbacks);
    Ok(handle.map(|handle| handle.key().to_string()))
}

#[tauri::command]
pub fn stream_close(state: State<'_, AppState>, key: String) {
    state.streams.registry().close(&key);
}

#[tauri::command]
pub fn stream_close_all(state: State<'_, AppState>) {
    state.streams.close_all_streams();
}

#[tauri::command]
pub fn stream_keys(state: State<'_, AppState>) -> Vec<String> {
    let mut keys: Vec<String> = state
        .streams
        .registry()
        .list_keys()
        .into_iter()
        .map(|key| key.to_string())
        .collect();
    keys.sort_unstable();
    keys
}

#[tauri::command]
pub fn stream_status(state: State<'_, AppState>, key: String) -> Option<StreamStatus> {
    state.streams.registry().status(&key)
}
