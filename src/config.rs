use crate::market::binance::{BINANCE_REST_BASE_URL, BINANCE_STREAM_BASE_URL};
use crate::stream::policy::{
    RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ANALYSIS_API_URL: &str = "http://localhost:3001/api";

const STREAM_BASE_URL_VAR: &str = "MARKET_STREAM_BASE_URL";
const REST_BASE_URL_VAR: &str = "MARKET_REST_BASE_URL";
const ANALYSIS_API_URL_VAR: &str = "ANALYSIS_API_URL";
const RECONNECT_ATTEMPTS_VAR: &str = "STREAM_RECONNECT_ATTEMPTS";
const RECONNECT_BASE_DELAY_VAR: &str = "STREAM_RECONNECT_BASE_DELAY_MS";
const RECONNECT_MAX_DELAY_VAR: &str = "STREAM_RECONNECT_MAX_DELAY_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub stream_base_url: String,
    pub rest_base_url: String,
    pub analysis_api_url: String,
    pub retry_policy: RetryPolicy,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            stream_base_url: BINANCE_STREAM_BASE_URL.to_string(),
            rest_base_url: BINANCE_REST_BASE_URL.to_string(),
            analysis_api_url: DEFAULT_ANALYSIS_API_URL.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl AppSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let max_attempts = resolve_number(&resolve, RECONNECT_ATTEMPTS_VAR, DEFAULT_MAX_ATTEMPTS);
        let base_delay_ms =
            resolve_number(&resolve, RECONNECT_BASE_DELAY_VAR, DEFAULT_BASE_DELAY_MS);
        let max_delay_ms = resolve_number(&resolve, RECONNECT_MAX_DELAY_VAR, DEFAULT_MAX_DELAY_MS);

        Self {
            stream_base_url: trim_base_url(
                resolve(STREAM_BASE_URL_VAR)
                    .unwrap_or_else(|| BINANCE_STREAM_BASE_URL.to_string()),
            ),
            rest_base_url: trim_base_url(
                resolve(REST_BASE_URL_VAR).unwrap_or_else(|| BINANCE_REST_BASE_URL.to_string()),
            ),
            analysis_api_url: trim_base_url(
                resolve(ANALYSIS_API_URL_VAR)
                    .unwrap_or_else(|| DEFAULT_ANALYSIS_API_URL.to_string()),
            ),
            retry_policy: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
            },
        }
    }
}

fn resolve_number<T, R>(resolve: &R, name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    R: Fn(&str) -> Option<String>,
{
    match resolve(name) {
        Some(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, fallback = %default, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}

fn trim_base_url(value: String) -> String {
    value.trim_end_matches('/').to_string()
}
