pub mod analysis;
pub mod binance;
pub mod history;
pub mod types;

pub const KLINE_UPDATE_EVENT: &str = "kline_update";
pub const TICKER_UPDATE_EVENT: &str = "ticker_update";
pub const STREAM_STATUS_EVENT: &str = "stream_status";
