use crate::error::AppError;
use crate::market::types::{AnalysisPayload, AnalysisReport};
use reqwest::Client;

fn analysis_endpoint(analysis_base_url: &str, symbol: &str) -> String {
    format!("{analysis_base_url}/analysis/{symbol}")
}

pub async fn fetch_analysis(
    client: &Client,
    analysis_base_url: &str,
    symbol: &str,
) -> Result<AnalysisReport, AppError> {
    let endpoint = analysis_endpoint(analysis_base_url, symbol);
    let response = client.get(endpoint).send().await?;
    let status = response.status();
    if !status.is_success() {
        tracing::warn!(symbol, status = status.as_u16(), "analysis request failed");
        return Err(AppError::UpstreamStatus(status.as_u16()));
    }

    let payload = response.json::<AnalysisPayload>().await?;
    payload.into_report(symbol)
}
