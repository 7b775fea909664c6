use crate::config::AppSettings;
use crate::stream::{StreamFactory, StreamRegistry, Transport, WebSocketTransport};
use reqwest::Client;

pub struct AppState {
    pub streams: StreamFactory,
    pub http_client: Client,
    pub settings: AppSettings,
}

impl AppState {
    pub fn new(settings: AppSettings) -> Self {
        Self::with_transport(settings, WebSocketTransport::new())
    }

    pub fn with_transport(settings: AppSettings, transport: impl Transport) -> Self {
        let streams = StreamFactory::new(
            StreamRegistry::new(transport),
            settings.stream_base_url.clone(),
        )
        .with_retry_policy(settings.retry_policy);

        Self {
            streams,
            http_client: Client::new(),
            settings,
        }
    }
}
