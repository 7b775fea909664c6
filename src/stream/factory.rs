use crate::error::AppError;
use crate::market::binance::{kline_stream_endpoint, ticker_stream_endpoint};
use crate::stream::policy::RetryPolicy;
use crate::stream::registry::{StreamHandle, StreamRegistry};
use crate::stream::types::{ChannelKind, ConnectionKey, StreamCallbacks};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which existing streams a new stream on the same channel replaces.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SupersessionScope {
    #[default]
    Channel,
    Symbol,
}

impl SupersessionScope {
    pub fn prefix_for(self, target: &StreamTarget) -> String {
        match self {
            Self::Channel => target.channel.key_prefix().to_string(),
            Self::Symbol => format!("{}{}_", target.channel.key_prefix(), target.symbol),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    Kline { symbol: String, interval: String },
    Ticker { symbol: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub channel: ChannelKind,
    pub symbol: String,
    pub key: ConnectionKey,
    pub endpoint: String,
}

impl StreamRequest {
    pub fn kline(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self::Kline {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }

    pub fn ticker(symbol: impl Into<String>) -> Self {
        Self::Ticker {
            symbol: symbol.into(),
        }
    }

    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::Kline { .. } => ChannelKind::Kline,
            Self::Ticker { .. } => ChannelKind::Ticker,
        }
    }

    pub fn resolve(&self, stream_base_url: &str) -> Result<StreamTarget, AppError> {
        match self {
            Self::Kline { symbol, interval } => {
                let symbol = required("symbol", symbol)?;
                let interval = required("interval", interval)?;
                Ok(StreamTarget {
                    channel: ChannelKind::Kline,
                    key: ConnectionKey::kline(symbol, interval),
                    endpoint: kline_stream_endpoint(stream_base_url, symbol, interval),
                    symbol: symbol.to_ascii_lowercase(),
                })
            }
            Self::Ticker { symbol } => {
                let symbol = required("symbol", symbol)?;
                Ok(StreamTarget {
                    channel: ChannelKind::Ticker,
                    key: ConnectionKey::ticker(symbol),
                    endpoint: ticker_stream_endpoint(stream_base_url, symbol),
                    symbol: symbol.to_ascii_lowercase(),
                })
            }
        }
    }
}

fn required<'a>(name: &str, value: &'a str) -> Result<&'a str, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidArgument(format!("{name} is required")));
    }
    Ok(trimmed)
}

/// Closes the streams `target` supersedes, never `target.key` itself.
pub fn supersede(
    registry: &StreamRegistry,
    scope: SupersessionScope,
    target: &StreamTarget,
) -> usize {
    let prefix = scope.prefix_for(target);
    let closed = registry.close_by_prefix(&prefix, Some(target.key.as_str()));
    if closed > 0 {
        tracing::debug!(key = %target.key, prefix = %prefix, closed, "superseded market streams");
    }
    closed
}

#[derive(Debug, Clone)]
pub struct StreamFactory {
    registry: StreamRegistry,
    stream_base_url: String,
    retry_policy: RetryPolicy,
    scope: SupersessionScope,
}

impl StreamFactory {
    pub fn new(registry: StreamRegistry, stream_base_url: impl Into<String>) -> Self {
        Self {
            registry,
            stream_base_url: stream_base_url.into(),
            retry_policy: RetryPolicy::default(),
            scope: SupersessionScope::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_supersession_scope(mut self, scope: SupersessionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn stream_base_url(&self) -> &str {
        &self.stream_base_url
    }

    pub fn kline(
        &self,
        symbol: &str,
        interval: &str,
        callbacks: StreamCallbacks,
    ) -> Option<StreamHandle> {
        self.open(&StreamRequest::kline(symbol, interval), callbacks)
    }

    pub fn ticker(&self, symbol: &str, callbacks: StreamCallbacks) -> Option<StreamHandle> {
        self.open(&StreamRequest::ticker(symbol), callbacks)
    }

    pub fn open(
        &self,
        request: &StreamRequest,
        callbacks: StreamCallbacks,
    ) -> Option<StreamHandle> {
        let target = match request.resolve(&self.stream_base_url) {
            Ok(target) => target,
            Err(error) => {
                tracing::error!(channel = request.channel().as_str(), %error, "cannot open market stream");
                return None;
            }
        };

        supersede(&self.registry, self.scope, &target);
        self.registry.connect(
            &target.endpoint,
            target.key,
            Arc::new(callbacks),
            self.retry_policy,
        )
    }

    pub fn close_all_streams(&self) {
        self.registry.close_all();
    }
}
