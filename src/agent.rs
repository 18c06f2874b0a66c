use async_trait::async_trait;
use log::{ debug, info, warn, error };
use std::error::Error;
use std::path::Path;
use std::sync::{ Arc, RwLock };
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cache::ResponseCache;
use crate::cli::Args;
use crate::commands::{ self, now_in_offset };
use crate::config::prompt::{ self, PromptConfig };
use crate::context::{ self, PronounHint };
use crate::conversation::ReplyGenerator;
use crate::error::AgentError;
use crate::history::{ format_history_for_prompt, initialize_history_store, HistoryStore };
use crate::llm::{ GenerationConfig, LlmConfig, LlmType };
use crate::llm::chat::{ ChatClient, new_client as new_chat_client };
use crate::models::chat::{ ContextEntity, Message };
use crate::search::{ self, GoogleSearchClient, SearchConfig, WebSearch };
use crate::usage::{ UsageDecision, UsageLimiter, UsageLimits };

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub summary_threshold: usize,
    pub keep_recent: usize,
    pub fallback_window: usize,
    pub utc_offset_hours: i32,
    pub prompts_path: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            summary_threshold: 20,
            keep_recent: 6,
            fallback_window: 12,
            utc_offset_hours: -3,
            prompts_path: "json/prompts.json".to_string(),
        }
    }
}

/// What goes between the persona and the new message.
#[derive(Debug, Clone, PartialEq)]
struct HistoryWindow {
    summary: Option<String>,
    recent: Vec<Message>,
}

pub struct AIAgent {
    chat_client: Arc<dyn ChatClient>,
    history_store: Arc<dyn HistoryStore>,
    search_client: Option<Arc<dyn WebSearch>>,
    usage: UsageLimiter,
    cache: Option<Mutex<ResponseCache>>,
    prompt_config: RwLock<Arc<PromptConfig>>,
    settings: AgentSettings,
}

impl AIAgent {
    fn initialize_chat_client(args: &Args) -> Result<Arc<dyn ChatClient>, Box<dyn Error + Send + Sync>> {
        let chat_llm_type: LlmType = args.chat_llm_type.parse()?;
        let chat_api_key = if !args.chat_api_key.is_empty() {
            Some(args.chat_api_key.clone())
        } else {
            None
        };
        let chat_config = LlmConfig {
            llm_type: chat_llm_type,
            base_url: args.chat_base_url.clone(),
            api_key: chat_api_key,
            completion_model: args.chat_model.clone(),
            generation: GenerationConfig {
                max_tokens: Some(args.chat_max_tokens),
                temperature: Some(args.chat_temperature),
            },
        };
        let chat_client = new_chat_client(&chat_config)?;
        info!(
            "Chat client configured: Type={}, Model={}, BaseURL={:?}",
            args.chat_llm_type,
            chat_client.get_model(),
            chat_client.get_base_url().as_deref().unwrap_or("adapter default")
        );
        Ok(chat_client)
    }

    fn initialize_search_client(args: &Args) -> Option<Arc<dyn WebSearch>> {
        if !args.search_enabled() {
            info!("Web search disabled (no SEARCH_API_KEY / SEARCH_ENGINE_ID).");
            return None;
        }
        let config = SearchConfig {
            api_key: args.search_api_key.clone().unwrap_or_default(),
            engine_id: args.search_engine_id.clone().unwrap_or_default(),
            base_url: args.search_base_url.clone(),
            result_count: args.search_result_count,
            date_restrict: args.search_date_restrict.clone(),
            utc_offset_hours: args.utc_offset_hours,
        };
        match GoogleSearchClient::new(config) {
            Ok(client) => {
                info!("✅ Web search client configured");
                Some(Arc::new(client))
            }
            Err(e) => {
                error!("Failed to create web search client: {}", e);
                None
            }
        }
    }

    pub async fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let chat_client = Self::initialize_chat_client(args)?;
        let history_store = initialize_history_store(args)?;
        let search_client = Self::initialize_search_client(args);
        let prompt_config = prompt::load_prompts_or_builtin(&args.prompts_path)?;

        let cache = if args.enable_cache {
            info!(
                "Response cache enabled (capacity={}, ttl={}s)",
                args.cache_capacity,
                args.cache_ttl_secs
            );
            Some(ResponseCache::new(args.cache_capacity, Duration::from_secs(args.cache_ttl_secs)))
        } else {
            info!("Cache disabled.");
            None
        };

        let limits = UsageLimits {
            daily_requests: args.daily_request_limit,
            daily_tokens: args.daily_token_limit,
        };
        let settings = AgentSettings {
            summary_threshold: args.context_summary_threshold,
            keep_recent: args.context_keep_recent,
            fallback_window: args.context_fallback_window,
            utc_offset_hours: args.utc_offset_hours,
            prompts_path: args.prompts_path.clone(),
        };

        Ok(
            Self::from_parts(
                chat_client,
                history_store,
                search_client,
                prompt_config,
                cache,
                limits,
                settings
            )
        )
    }

    pub fn from_parts(
        chat_client: Arc<dyn ChatClient>,
        history_store: Arc<dyn HistoryStore>,
        search_client: Option<Arc<dyn WebSearch>>,
        prompt_config: Arc<PromptConfig>,
        cache: Option<ResponseCache>,
        limits: UsageLimits,
        settings: AgentSettings
    ) -> Self {
        Self {
            chat_client,
            usage: UsageLimiter::new(Arc::clone(&history_store), limits, settings.utc_offset_hours),
            history_store,
            search_client,
            cache: cache.map(Mutex::new),
            prompt_config: RwLock::new(prompt_config),
            settings,
        }
    }

    pub fn prompt_config(&self) -> Arc<PromptConfig> {
        match self.prompt_config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history_store)
    }

    pub fn usage(&self) -> &UsageLimiter {
        &self.usage
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub async fn reload_prompts_if_changed(&self) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let path = &self.settings.prompts_path;
        if !Path::new(path).exists() {
            debug!("Prompts file '{}' not present, keeping current prompts", path);
            return Ok(false);
        }
        let current = self.prompt_config();
        match prompt::reload_prompts_if_changed(path, &current)? {
            Some(new_config) => {
                match self.prompt_config.write() {
                    Ok(mut guard) => {
                        *guard = new_config;
                    }
                    Err(poisoned) => {
                        *poisoned.into_inner() = new_config;
                    }
                }
                info!("Prompts successfully reloaded");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn answer_command(&self, text: &str, config: &PromptConfig) -> Result<Option<String>, AgentError> {
        let intent = match commands::dispatch(text) {
            Some(intent) => intent,
            None => {
                return Ok(None);
            }
        };
        info!("Command intent: {:?}", intent);

        let now = now_in_offset(self.settings.utc_offset_hours);
        if let Some(answer) = commands::local_answer(&intent, config, now)? {
            return Ok(Some(answer));
        }
        let request = match intent.search_request() {
            Some(request) => request,
            None => {
                return Ok(None);
            }
        };
        let answer = match &self.search_client {
            Some(client) =>
                search::answer_with_search(client.as_ref(), config, &request.query, request.news).await,
            None => {
                warn!("Search requested but no search client is configured");
                config.text("search_failed").to_string()
            }
        };
        Ok(Some(answer))
    }

    async fn build_context_note(
        &self,
        user_id: &str,
        text: &str,
        config: &PromptConfig
    ) -> Result<String, AgentError> {
        let mut known: Vec<ContextEntity> = match self.history_store.get_entities(user_id).await {
            Ok(entities) => entities,
            Err(e) => {
                warn!("Could not load context entities for {}: {}", user_id, e);
                Vec::new()
            }
        };
        let now_ms = chrono::Utc::now().timestamp_millis();
        let detected = context::extract_entities(text, now_ms);
        for entity in context::merge_entities(&mut known, detected) {
            if let Err(e) = self.history_store.upsert_entity(user_id, &entity).await {
                warn!("Could not store context entity '{}': {}", entity.key, e);
            }
        }
        let hint: Option<PronounHint> = context::resolve_pronouns(text, &known);
        Ok(context::build_context_note(config, &known, hint.as_ref())?)
    }

    async fn window_history(&self, history: &[Message], config: &PromptConfig) -> HistoryWindow {
        if history.len() <= self.settings.summary_threshold {
            return HistoryWindow { summary: None, recent: history.to_vec() };
        }

        let split = history.len().saturating_sub(self.settings.keep_recent);
        let (older, recent) = history.split_at(split);
        let summary = match prompt::get_summary_prompt(config, &format_history_for_prompt(older)) {
            Ok(summary_prompt) =>
                match self.chat_client.complete(&summary_prompt).await {
                    Ok(resp) if !resp.response.trim().is_empty() => Some(resp.response.trim().to_string()),
                    Ok(_) => {
                        warn!("Summary call returned nothing");
                        None
                    }
                    Err(e) => {
                        warn!("Summary call failed: {}", e);
                        None
                    }
                }
            Err(e) => {
                warn!("Summary prompt unavailable: {}", e);
                None
            }
        };

        match summary {
            Some(summary) => {
                info!("Condensed {} older messages into a summary", older.len());
                HistoryWindow { summary: Some(summary), recent: recent.to_vec() }
            }
            None => {
                let start = history.len().saturating_sub(self.settings.fallback_window);
                HistoryWindow { summary: None, recent: history[start..].to_vec() }
            }
        }
    }

    async fn cached_reply(&self, user_id: &str, text: &str) -> Option<String> {
        let cache = self.cache.as_ref()?;
        let hit = cache.lock().await.get(user_id, text);
        if hit.is_some() {
            info!("ℹ️ Cache hit for {} '{}'", user_id, crate::cache::normalize(text));
        }
        hit
    }

    async fn cache_reply(&self, user_id: &str, text: &str, reply: &str) {
        if let Some(cache) = &self.cache {
            cache.lock().await.put(user_id, text, reply);
        }
    }

    pub async fn process_message(
        &self,
        user_id: &str,
        history: &[Message],
        text: &str
    ) -> Result<String, AgentError> {
        let config = self.prompt_config();

        if let UsageDecision::Exhausted(_) = self.usage.check(user_id).await {
            return Ok(config.text("usage_exhausted").to_string());
        }

        if let Some(cached) = self.cached_reply(user_id, text).await {
            return Ok(cached);
        }

        if let Some(answer) = self.answer_command(text, &config).await? {
            return Ok(answer);
        }

        let context_note = self.build_context_note(user_id, text, &config).await?;
        let window = self.window_history(history, &config).await;
        let chat_prompt = prompt::get_chat_prompt(
            &config,
            &context_note,
            window.summary.as_deref(),
            &format_history_for_prompt(&window.recent),
            text
        )?;

        info!("ℹ️ Cache Miss. Proceeding with LLM call...");
        let reply = self.chat_client
            .complete(&chat_prompt).await
            .map_err(AgentError::Llm)?
            .response.trim()
            .to_string();
        if reply.is_empty() {
            return Err(AgentError::EmptyReply);
        }

        self.usage.record(user_id, chat_prompt.chars().count() + reply.chars().count()).await;
        self.cache_reply(user_id, text, &reply).await;
        Ok(reply)
    }
}

#[async_trait]
impl ReplyGenerator for AIAgent {
    async fn generate_reply(
        &self,
        user_id: &str,
        history: &[Message],
        text: &str
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.process_message(user_id, history, text).await.map_err(|e| {
            error!("LLM interaction error: {}", e);
            Box::new(e) as Box<dyn Error + Send + Sync>
        })
    }

    fn failure_message(&self) -> String {
        self.prompt_config().text("chat_error").to_string()
    }
}
