use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid stream target '{0}': expected a ws:// or wss:// address with a host")]
    InvalidTarget(String),
    #[error("no async runtime available to drive the stream transport")]
    RuntimeUnavailable,
    #[error("transport close failed: {0}")]
    TransportClose(String),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("upstream responded with status {0}")]
    UpstreamStatus(u16),
    #[error("no historical candles available for {0}")]
    EmptyHistory(String),
    #[error("no analysis available for {0}")]
    EmptyAnalysis(String),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
