use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Endpoints ---
    /// Base URL of the chat REST API (e.g., http://localhost:8080/api/v1)
    #[arg(long, env = "CHAT_API_URL", default_value = "http://localhost:8080/api/v1")]
    pub api_url: String,

    /// Push endpoint; the auth token is appended as `?token=`.
    #[arg(long, env = "CHAT_WS_URL", default_value = "ws://localhost:8080/api/v1/auth/ws")]
    pub ws_url: String,

    /// Bearer token used for HTTP requests and the push connection.
    #[arg(long, env = "CHAT_TOKEN", default_value = "")]
    pub token: String,

    // --- Model Selection ---
    /// Base model id sent with messages (e.g., openai/gpt-4)
    #[arg(long, env = "CHAT_MODEL", default_value = "google/gemini-2.0-flash-lite-001")]
    pub model: String,

    /// Request the online variant of the model (appends ":online").
    #[arg(long, env = "CHAT_ONLINE", default_value = "false")]
    pub online: bool,

    // --- Sync Behaviour ---
    /// Seconds to wait before reconnecting after an unexpected push disconnect.
    #[arg(long, env = "RECONNECT_DELAY_SECS", default_value = "5")]
    pub reconnect_delay_secs: u64,

    /// Timeout in seconds for non-streaming HTTP requests. 0 disables it.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// After a finished stream, fetch the conversation and swap local ids for server ids.
    #[arg(long, env = "RECONCILE_IDS", default_value = "true", action = clap::ArgAction::Set)]
    pub reconcile_ids: bool,

    /// Send the `client_connect` frame once the push connection opens.
    #[arg(long, env = "ANNOUNCE_CLIENT", default_value = "true", action = clap::ArgAction::Set)]
    pub announce_client: bool,

    // --- One-shot Actions ---
    /// Conversation to send `--message` into. Without it a new conversation is created.
    #[arg(long)]
    pub chat_id: Option<i64>,

    /// Message to send after startup; the streamed reply is printed to stdout.
    #[arg(long)]
    pub message: Option<String>,

    /// Stay connected and log push events until Ctrl-C.
    #[arg(long, default_value = "false")]
    pub watch: bool,
}
