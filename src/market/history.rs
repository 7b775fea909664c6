use crate::error::AppError;
use crate::market::binance::fetch_exchange_klines;
use crate::market::types::{candles_from_rows, HistoryQuery, KlineRow, UiCandle};
use reqwest::Client;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Backend,
    Exchange,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketHistory {
    pub symbol: String,
    pub source: HistorySource,
    pub candles: Vec<UiCandle>,
}

fn backend_history_endpoint(backend_base_url: &str, query: &HistoryQuery) -> String {
    format!(
        "{backend_base_url}/historical/{}?interval={}&limit={}",
        query.symbol,
        query.interval.as_str(),
        query.limit
    )
}

async fn fetch_backend_history(
    client: &Client,
    backend_base_url: &str,
    query: &HistoryQuery,
) -> Result<Vec<UiCandle>, AppError> {
    let endpoint = backend_history_endpoint(backend_base_url, query);
    let response = client.get(endpoint).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::UpstreamStatus(status.as_u16()));
    }

    let rows = response.json::<Vec<KlineRow>>().await?;
    candles_from_rows(rows)
}

/// Loads candle history from the analysis backend, falling back to the
/// exchange REST API when the backend cannot serve it.
pub async fn fetch_history(
    client: &Client,
    backend_base_url: &str,
    exchange_base_url: &str,
    query: &HistoryQuery,
) -> Result<MarketHistory, AppError> {
    match fetch_backend_history(client, backend_base_url, query).await {
        Ok(candles) => {
            tracing::debug!(symbol = %query.symbol, count = candles.len(), "loaded history from backend");
            return Ok(MarketHistory {
                symbol: query.symbol.clone(),
                source: HistorySource::Backend,
                candles,
            });
        }
        Err(error) => {
            tracing::warn!(symbol = %query.symbol, %error, "backend history unavailable, using exchange");
        }
    }

    let candles = fetch_exchange_klines(client, exchange_base_url, query).await?;
    if candles.is_empty() {
        return Err(AppError::EmptyHistory(query.symbol.clone()));
    }

    tracing::debug!(symbol = %query.symbol, count = candles.len(), "loaded history from exchange");
    Ok(MarketHistory {
        symbol: query.symbol.clone(),
        source: HistorySource::Exchange,
        candles,
    })
}
