use crate::error::AppError;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_TIMEFRAME: MarketTimeframe = MarketTimeframe::M1;
pub const DEFAULT_HISTORY_LIMIT: u16 = 100;
pub const MIN_HISTORY_LIMIT: u16 = 1;
pub const MAX_HISTORY_LIMIT: u16 = 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MarketTimeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl MarketTimeframe {
    pub const ALL: [Self; 15] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    /// Case-sensitive: `1m` is a minute, `1M` a month.
    pub fn parse_str(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|timeframe| timeframe.as_str() == value.trim())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiCandle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl UiCandle {
    fn validate(self) -> Result<Self, AppError> {
        let finite = [self.o, self.h, self.l, self.c, self.v]
            .iter()
            .all(|value| value.is_finite());
        if !finite {
            return Err(AppError::InvalidArgument(
                "kline values must be finite".to_string(),
            ));
        }
        Ok(Self {
            v: self.v.max(0.0),
            ..self
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiTicker {
    pub s: String,
    pub t: i64,
    pub p: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KlineCell {
    Int(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

impl KlineCell {
    fn as_f64(&self) -> Result<f64, AppError> {
        match self {
            Self::Int(value) => Ok(*value as f64),
            Self::Float(value) => Ok(*value),
            Self::Text(value) => Ok(value.trim().parse::<f64>()?),
            Self::Other(_) => Err(AppError::InvalidArgument(
                "kline cell is not numeric".to_string(),
            )),
        }
    }

    fn as_millis(&self) -> Result<i64, AppError> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::Float(value) if value.is_finite() => Ok(*value as i64),
            Self::Text(value) => value.trim().parse::<i64>().map_err(|_| {
                AppError::InvalidArgument(format!("invalid kline open time '{value}'"))
            }),
            _ => Err(AppError::InvalidArgument(
                "kline open time is not an integer".to_string(),
            )),
        }
    }
}

/// `[openTime, open, high, low, close, volume, ...]`
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct KlineRow(pub Vec<KlineCell>);

impl TryFrom<KlineRow> for UiCandle {
    type Error = AppError;

    fn try_from(value: KlineRow) -> Result<Self, Self::Error> {
        let cells = value.0;
        if cells.len() < 5 {
            return Err(AppError::InvalidArgument(format!(
                "kline row has {} fields, expected at least 5",
                cells.len()
            )));
        }

        let volume = match cells.get(5) {
            Some(cell) => cell.as_f64()?,
            None => 0.0,
        };

        UiCandle {
            t: cells[0].as_millis()?,
            o: cells[1].as_f64()?,
            h: cells[2].as_f64()?,
            l: cells[3].as_f64()?,
            c: cells[4].as_f64()?,
            v: volume,
        }
        .validate()
    }
}

pub fn candles_from_rows(rows: Vec<KlineRow>) -> Result<Vec<UiCandle>, AppError> {
    let mut candles: Vec<UiCandle> = Vec::with_capacity(rows.len());
    for row in rows {
        candles.push(row.try_into()?);
    }
    candles.sort_unstable_by_key(|candle| candle.t);
    candles.dedup_by_key(|candle| candle.t);
    Ok(candles)
}

#[derive(Debug, Deserialize)]
pub struct KlineStreamWire {
    #[serde(rename = "k")]
    pub kline: KlineBodyWire,
}

#[derive(Debug, Deserialize)]
pub struct KlineBodyWire {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v", default)]
    pub volume: Option<String>,
}

impl TryFrom<KlineStreamWire> for UiCandle {
    type Error = AppError;

    fn try_from(value: KlineStreamWire) -> Result<Self, Self::Error> {
        let kline = value.kline;
        let volume = match kline.volume {
            Some(raw) => raw.parse::<f64>()?,
            None => 0.0,
        };

        UiCandle {
            t: kline.open_time,
            o: kline.open.parse::<f64>()?,
            h: kline.high.parse::<f64>()?,
            l: kline.low.parse::<f64>()?,
            c: kline.close.parse::<f64>()?,
            v: volume,
        }
        .validate()
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerStreamWire {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "c")]
    pub last_price: String,
}

impl TryFrom<TickerStreamWire> for UiTicker {
    type Error = AppError;

    fn try_from(value: TickerStreamWire) -> Result<Self, Self::Error> {
        let price = value.last_price.parse::<f64>()?;
        if !price.is_finite() {
            return Err(AppError::InvalidArgument(
                "ticker price must be finite".to_string(),
            ));
        }
        Ok(Self {
            s: value.symbol,
            t: value.event_time,
            p: price,
        })
    }
}

pub fn decode_kline_update(payload: OwnedValue) -> Result<UiCandle, AppError> {
    let wire: KlineStreamWire = simd_json::serde::from_owned_value(payload)?;
    wire.try_into()
}

pub fn decode_ticker_update(payload: OwnedValue) -> Result<UiTicker, AppError> {
    let wire: TickerStreamWire = simd_json::serde::from_owned_value(payload)?;
    wire.try_into()
}

/// Folds live kline updates into the candle currently forming. Updates for
/// earlier periods are dropped.
#[derive(Debug, Clone, Default)]
pub struct LiveCandleTracker {
    current: Option<UiCandle>,
}

impl LiveCandleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&UiCandle> {
        self.current.as_ref()
    }

    pub fn apply(&mut self, update: UiCandle) -> Option<UiCandle> {
        let merged = match self.current.take() {
            None => update,
            Some(current) if update.t > current.t => update,
            Some(current) if update.t == current.t => UiCandle {
                t: current.t,
                o: current.o,
                h: current.h.max(update.h),
                l: current.l.min(update.l),
                c: update.c,
                v: update.v,
            },
            Some(current) => {
                self.current = Some(current);
                return None;
            }
        };

        self.current = Some(merged.clone());
        Some(merged)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSuggestion {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReportTimestamp {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    pub suggestion: TradeSuggestion,
    pub confidence: f64,
    pub reasoning: String,
    pub timestamp: ReportTimestamp,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnalysisPayload {
    Many(Vec<AnalysisReport>),
    One(AnalysisReport),
}

impl AnalysisPayload {
    pub fn into_report(self, symbol: &str) -> Result<AnalysisReport, AppError> {
        let report = match self {
            Self::Many(reports) => reports
                .into_iter()
                .next()
                .ok_or_else(|| AppError::EmptyAnalysis(symbol.to_string()))?,
            Self::One(report) => report,
        };

        if !report.confidence.is_finite() || !(0.0..=100.0).contains(&report.confidence) {
            return Err(AppError::InvalidArgument(format!(
                "analysis confidence {} is outside 0..=100",
                report.confidence
            )));
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MarketHistoryArgs {
    pub symbol: Option<String>,
    pub interval: Option<MarketTimeframe>,
    pub limit: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub symbol: String,
    pub interval: MarketTimeframe,
    pub limit: u16,
}

impl MarketHistoryArgs {
    pub fn normalize(self) -> Result<HistoryQuery, AppError> {
        let symbol = normalize_symbol(self.symbol)?;
        let interval = self.interval.unwrap_or(DEFAULT_TIMEFRAME);
        let limit = self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(AppError::InvalidArgument(format!(
                "limit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        Ok(HistoryQuery {
            symbol,
            interval,
            limit,
        })
    }
}

pub fn normalize_symbol(symbol: Option<String>) -> Result<String, AppError> {
    let symbol = symbol
        .unwrap_or_else(|| DEFAULT_SYMBOL.to_string())
        .trim()
        .to_ascii_uppercase();

    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

pub fn normalize_interval(interval: &str) -> Result<MarketTimeframe, AppError> {
    MarketTimeframe::parse_str(interval)
        .ok_or_else(|| AppError::InvalidArgument(format!("unsupported interval '{interval}'")))
}
