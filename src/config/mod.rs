use crate::cli::Args;
use crate::store::DEFAULT_BASE_MODEL;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api/v1";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/api/v1/auth/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Runtime settings shared by the HTTP client, the push transport and the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub ws_url: String,
    pub default_model: String,
    pub reconnect_delay: Duration,
    /// Applies to plain JSON requests only; streamed bodies are never cut off.
    pub request_timeout: Option<Duration>,
    pub reconcile_ids: bool,
    pub announce_client: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            default_model: DEFAULT_BASE_MODEL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            request_timeout: Some(Duration::from_secs(30)),
            reconcile_ids: true,
            announce_client: true,
        }
    }
}

impl ClientConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            api_url: args.api_url.clone(),
            ws_url: args.ws_url.clone(),
            default_model: args.model.clone(),
            reconnect_delay: Duration::from_secs(args.reconnect_delay_secs),
            request_timeout: match args.request_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            reconcile_ids: args.reconcile_ids,
            announce_client: args.announce_client,
        }
    }
}
