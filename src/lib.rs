#[cfg(feature = "desktop")]
mod commands;
pub mod config;
pub mod error;
pub mod market;
pub mod state;
pub mod stream;

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,crypto_stream_lib=debug";

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Safe to call more than once.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(feature = "desktop")]
pub fn run() {
    use commands::{
        market_data::{market_analysis, market_history},
        market_stream::{
            stream_close, stream_close_all, stream_keys, stream_kline, stream_status,
            stream_ticker,
        },
    };
    use config::AppSettings;
    use state::AppState;
    use tauri::Manager;

    init_logging();
    let settings = AppSettings::from_env();
    tracing::info!(
        stream_base_url = %settings.stream_base_url,
        analysis_api_url = %settings.analysis_api_url,
        max_attempts = settings.retry_policy.max_attempts,
        "starting desktop runtime"
    );

    tauri::Builder::default()
        .setup(move |app| {
            app.manage(AppState::new(settings));
            Ok(())
        })
        .on_window_event(|window, event| {
            if matches!(event, tauri::WindowEvent::Destroyed) && window.label() == "main" {
                if let Some(state) = window.try_state::<AppState>() {
                    state.streams.close_all_streams();
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            stream_kline,
            stream_ticker,
            stream_close,
            stream_close_all,
            stream_keys,
            stream_status,
            market_history,
            market_analysis
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
