use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- History Store Args ---
    /// History chat store type (memory, redis)
    #[arg(long, env = "HISTORY_TYPE", default_value = "memory")]
    pub history_type: String,

    /// History chat store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Prefix for Redis history keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "jarvis:")]
    pub history_redis_prefix: String,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (gemini, openai, ollama)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "gemini")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider (e.g., Gemini, OpenAI)
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., gemini-2.5-flash, gpt-4o-mini, llama3.2:3b)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    /// Maximum number of tokens the model may generate per reply.
    #[arg(long, env = "CHAT_MAX_TOKENS", default_value = "1024")]
    pub chat_max_tokens: u32,

    /// Sampling temperature for replies.
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0.7")]
    pub chat_temperature: f32,

    // --- Context Window Args ---
    /// Histories longer than this are condensed into a summary before prompting.
    #[arg(long, env = "CONTEXT_SUMMARY_THRESHOLD", default_value = "20")]
    pub context_summary_threshold: usize,

    /// Number of most recent messages kept verbatim after the summary.
    #[arg(long, env = "CONTEXT_KEEP_RECENT", default_value = "6")]
    pub context_keep_recent: usize,

    /// Number of recent messages used when the summary call fails.
    #[arg(long, env = "CONTEXT_FALLBACK_WINDOW", default_value = "12")]
    pub context_fallback_window: usize,

    // --- Text-to-Speech Args ---
    /// Hosted TTS endpoint. Without it, replies are spoken by the browser's native voice.
    #[arg(long, env = "TTS_URL")]
    pub tts_url: Option<String>,

    /// Voice name sent to the TTS endpoint.
    #[arg(long, env = "TTS_VOICE", default_value = "pt-BR-Neural2-B")]
    pub tts_voice: String,

    /// Speaking rate sent to the TTS endpoint.
    #[arg(long, env = "TTS_SPEED", default_value = "1.0")]
    pub tts_speed: f32,

    // --- Web Search Args ---
    /// API key for the web search API. Search commands degrade gracefully without it.
    #[arg(long, env = "SEARCH_API_KEY")]
    pub search_api_key: Option<String>,

    /// Search engine id (cx) for the web search API.
    #[arg(long, env = "SEARCH_ENGINE_ID")]
    pub search_engine_id: Option<String>,

    /// Number of results requested per search (1-10).
    #[arg(long, env = "SEARCH_RESULT_COUNT", default_value = "10")]
    pub search_result_count: u32,

    /// Recency restriction for news searches (e.g., d7 for the last seven days).
    #[arg(long, env = "SEARCH_DATE_RESTRICT", default_value = "d7")]
    pub search_date_restrict: String,

    /// Base URL of the web search API.
    #[arg(long, env = "SEARCH_BASE_URL", default_value = "https://www.googleapis.com/customsearch/v1")]
    pub search_base_url: String,

    // --- Caching Args ---
    /// Enable the in-process response cache.
    #[arg(long, env = "ENABLE_CACHE", default_value = "true", action = clap::ArgAction::Set)]
    pub enable_cache: bool,

    /// Maximum number of cached responses.
    #[arg(long, env = "CACHE_CAPACITY", default_value = "100")]
    pub cache_capacity: usize,

    /// Freshness window for cached responses, in seconds.
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "600")]
    pub cache_ttl_secs: u64,

    // --- Usage Args ---
    /// Soft daily request limit per user. 0 disables it.
    #[arg(long, env = "DAILY_REQUEST_LIMIT", default_value = "200")]
    pub daily_request_limit: u64,

    /// Soft daily token limit per user (estimated). 0 disables it.
    #[arg(long, env = "DAILY_TOKEN_LIMIT", default_value = "100000")]
    pub daily_token_limit: u64,

    // --- Voice Args ---
    /// Seconds of silence after which hands-free mode stops listening.
    #[arg(long, env = "SILENCE_TIMEOUT_SECS", default_value = "10")]
    pub silence_timeout_secs: u64,

    // --- General App Args ---
    /// UTC offset in hours used for spoken times, dates and usage days (São Paulo is -3).
    #[arg(long, env = "UTC_OFFSET_HOURS", default_value = "-3", allow_hyphen_values = true)]
    pub utc_offset_hours: i32,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Path to the prompt configuration file.
    #[arg(long, env = "PROMPTS_PATH", default_value = "json/prompts.json")]
    pub prompts_path: String,

    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional port for the HTTP API, served on the same host as SERVER_ADDR.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Optional shared secret. If set, clients must sign their handshake with it.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    pub fn search_enabled(&self) -> bool {
        self.search_api_key.as_deref().map_or(false, |k| !k.is_empty()) &&
            self.search_engine_id.as_deref().map_or(false, |id| !id.is_empty())
    }

    pub fn server_host(&self) -> &str {
        self.server_addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.server_addr)
    }
}
