use crate::error::AppError;
use serde::Serialize;
use simd_json::OwnedValue;
use std::borrow::Borrow;
use std::fmt;

pub const KLINE_PREFIX: &str = "kline_";
pub const TICKER_PREFIX: &str = "ticker_";

pub const CLOSE_NORMAL: u16 = 1_000;
pub const CLOSE_NO_STATUS: u16 = 1_005;
pub const CLOSE_ABNORMAL: u16 = 1_006;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Kline,
    Ticker,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kline => "kline",
            Self::Ticker => "ticker",
        }
    }

    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::Kline => KLINE_PREFIX,
            Self::Ticker => TICKER_PREFIX,
        }
    }
}

/// Logical identity of a stream: `{channel}_{symbol}[_{parameter}]`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn kline(symbol: &str, interval: &str) -> Self {
        Self(format!(
            "{KLINE_PREFIX}{}_{interval}",
            symbol.to_ascii_lowercase()
        ))
    }

    pub fn ticker(symbol: &str) -> Self {
        Self(format!("{TICKER_PREFIX}{}", symbol.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloseInfo {
    pub was_clean: bool,
    pub code: u16,
}

impl CloseInfo {
    pub fn clean(code: u16) -> Self {
        Self {
            was_clean: true,
            code,
        }
    }

    pub fn abnormal() -> Self {
        Self {
            was_clean: false,
            code: CLOSE_ABNORMAL,
        }
    }
}

type OpenHook = Box<dyn Fn() + Send + Sync>;
type MessageHook = Box<dyn Fn(OwnedValue) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&AppError) + Send + Sync>;
type CloseHook = Box<dyn Fn(CloseInfo) + Send + Sync>;

/// # Deadlocks
///
/// A hook may close its own stream. Hooks on two threads that close each
/// other's streams at the same moment can deadlock.
#[derive(Default)]
pub struct StreamCallbacks {
    on_open: Option<OpenHook>,
    on_message: Option<MessageHook>,
    on_error: Option<ErrorHook>,
    on_close: Option<CloseHook>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Box::new(hook));
        self
    }

    pub fn on_message(mut self, hook: impl Fn(OwnedValue) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&AppError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub fn on_close(mut self, hook: impl Fn(CloseInfo) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub(crate) fn emit_open(&self) {
        if let Some(hook) = &self.on_open {
            hook();
        }
    }

    pub(crate) fn emit_message(&self, payload: OwnedValue) {
        if let Some(hook) = &self.on_message {
            hook(payload);
        }
    }

    pub(crate) fn emit_error(&self, error: &AppError) {
        if let Some(hook) = &self.on_error {
            hook(error);
        }
    }

    pub(crate) fn emit_close(&self, info: CloseInfo) {
        if let Some(hook) = &self.on_close {
            hook(info);
        }
    }
}

impl fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_key_lowercases_symbol_and_keeps_interval() {
        let key = ConnectionKey::kline("BTCUSDT", "1M");
        assert_eq!(key.as_str(), "kline_btcusdt_1M");
        assert!(key.has_prefix(ChannelKind::Kline.key_prefix()));
    }

    #[test]
    fn ticker_key_has_no_parameter() {
        let key = ConnectionKey::ticker("EthUsdt");
        assert_eq!(key.as_str(), "ticker_ethusdt");
        assert!(!key.has_prefix(KLINE_PREFIX));
    }

    #[test]
    fn ready_state_survives_atomic_encoding() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Open,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            assert_eq!(ReadyState::from_u8(state.as_u8()), state);
        }
        assert!(ReadyState::Connecting.is_active());
        assert!(!ReadyState::Closing.is_active());
    }
}
