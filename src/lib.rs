pub mod agent;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod search;
pub mod server;
pub mod tts;
pub mod usage;
pub mod voice;

use agent::AIAgent;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    match args.http_port {
        Some(port) => info!("HTTP API Port: {}", port),
        None => info!("HTTP API: disabled"),
    }
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or("adapter default"));
    info!("History Store Type: {}", args.history_type);
    info!("History Store Host: {}", args.history_host);
    info!("Prompts Path: {}", args.prompts_path);
    info!(
        "Context Window: summary after {} messages, keep {} recent, fallback {}",
        args.context_summary_threshold,
        args.context_keep_recent,
        args.context_fallback_window
    );
    info!("Cache Enabled: {}", args.enable_cache);
    if args.enable_cache {
        info!("Cache Capacity: {}", args.cache_capacity);
        info!("Cache TTL: {}s", args.cache_ttl_secs);
    }
    info!("Web Search Enabled: {}", args.search_enabled());
    info!("Hosted TTS Enabled: {}", args.tts_url.is_some());
    info!("Daily Limits: {} requests, {} tokens", args.daily_request_limit, args.daily_token_limit);
    info!("Silence Timeout: {}s", args.silence_timeout_secs);
    info!("UTC Offset: {}h", args.utc_offset_hours);
    info!("Signed Handshakes: {}", args.server_api_key.is_some());
    info!("-------------------------");

    let agent = Arc::new(AIAgent::new(&args).await?);
    let tts = tts::initialize_tts(&args);
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, agent, tts, args.clone());
    server.run().await?;

    Ok(())
}
