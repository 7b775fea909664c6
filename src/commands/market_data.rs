use crate::error::AppError;
use crate::market::analysis::fetch_analysis;
use crate::market::history::{fetch_history, MarketHistory};
use crate::market::types::{normalize_symbol, AnalysisReport, MarketHistoryArgs};
use crate::state::AppState;
use tauri::State;

#[tauri::command]
pub async fn market_history(
    state: State<'_, AppState>,
    args: Option<MarketHistoryArgs>,
) -> Result<MarketHistory, AppError> {
    let query = args.unwrap_or_default().normalize()?;
    fetch_history(
        &state.http_client,
        &state.settings.analysis_api_url,
        &state.settings.rest_base_url,
        &query,
    )
    .await
}

#[tauri::command]
pub async fn market_analysis(
    state: State<'_, AppState>,
    symbol: Option<String>,
) -> Result<AnalysisReport, AppError> {
    let symbol = normalize_symbol(symbol)?;
    fetch_analysis(&state.http_client, &state.settings.analysis_api_url, &symbol).await
}
