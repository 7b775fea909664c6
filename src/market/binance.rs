use crate::error::AppError;
use crate::market::types::{candles_from_rows, HistoryQuery, KlineRow, UiCandle};
use reqwest::Client;

pub const BINANCE_STREAM_BASE_URL: &str = "wss://stream.binance.com:9443/ws";
pub const BINANCE_REST_BASE_URL: &str = "https://api.binance.com";

pub fn kline_stream_endpoint(stream_base_url: &str, symbol: &str, interval: &str) -> String {
    format!(
        "{stream_base_url}/{}@kline_{interval}",
        symbol.to_ascii_lowercase()
    )
}

pub fn ticker_stream_endpoint(stream_base_url: &str, symbol: &str) -> String {
    format!("{stream_base_url}/{}@ticker", symbol.to_ascii_lowercase())
}

fn klines_endpoint(rest_base_url: &str, query: &HistoryQuery) -> String {
    format!("{rest_base_url}/api/v3/klines")
        + &format!(
            "?symbol={}&interval={}&limit={}",
            query.symbol.to_ascii_uppercase(),
            query.interval.as_str(),
            query.limit
        )
}

pub async fn fetch_exchange_klines(
    client: &Client,
    rest_base_url: &str,
    query: &HistoryQuery,
) -> Result<Vec<UiCandle>, AppError> {
    let endpoint = klines_endpoint(rest_base_url, query);
    let response = client.get(endpoint).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::UpstreamStatus(status.as_u16()));
    }

    let rows = response.json::<Vec<KlineRow>>().await?;
    candles_from_rows(rows)
}
