mod memory;
mod redis;
use async_trait::async_trait;
use log::info;
use std::error::Error;
use crate::cli::Args;
use std::sync::Arc;
use crate::models::chat::{ ContextEntity, Message, Role, UsageRecord };

pub use self::memory::MemoryHistoryStore;
pub use self::redis::RedisHistoryStore;

/// Per-user document store: messages, context entities and usage counters.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn add_message(
        &self,
        user_id: &str,
        message: &Message
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Oldest first. With a limit, only the most recent `limit` messages.
    async fn get_messages(
        &self,
        user_id: &str,
        limit: Option<usize>
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>>;

    /// Removes the user's messages and returns how many were deleted.
    async fn clear_messages(&self, user_id: &str) -> Result<usize, Box<dyn Error + Send + Sync>>;

    async fn upsert_entity(
        &self,
        user_id: &str,
        entity: &ContextEntity
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn get_entities(
        &self,
        user_id: &str
    ) -> Result<Vec<ContextEntity>, Box<dyn Error + Send + Sync>>;

    /// Adds one request and `tokens` to the user's counters for `day`.
    async fn record_usage(
        &self,
        user_id: &str,
        day: &str,
        tokens: u64
    ) -> Result<UsageRecord, Box<dyn Error + Send + Sync>>;

    async fn get_usage(
        &self,
        user_id: &str,
        day: &str
    ) -> Result<UsageRecord, Box<dyn Error + Send + Sync>>;
}

pub fn create_history_store(
    args: &Args
) -> Result<Arc<dyn HistoryStore>, Box<dyn Error + Send + Sync>> {
    match args.history_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryHistoryStore::new())),
        "redis" => {
            let store = RedisHistoryStore::new(&args.history_host, &args.history_redis_prefix)?;
            Ok(Arc::new(store))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported history store type: {}", args.history_type)
                    )
                )
            ),
    }
}

pub fn initialize_history_store(
    args: &Args
) -> Result<Arc<dyn HistoryStore>, Box<dyn Error + Send + Sync>> {
    if args.history_type.eq_ignore_ascii_case("memory") {
        info!("Chat history will be kept in memory only");
    } else {
        info!("Chat history will be stored in: {} at {}", args.history_type, args.history_host);
    }
    create_history_store(args)
}

pub fn format_history_for_prompt(messages: &[Message]) -> String {
    let mut result = String::new();
    for msg in messages {
        let role_display = match msg.role {
            Role::User => "Usuário",
            Role::Assistant => "Assistente",
        };

        result.push_str(&format!("{}: {}\n", role_display, msg.content));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_roles_in_portuguese() {
        let messages = vec![Message::user("oi"), Message::assistant("olá!")];
        assert_eq!(format_history_for_prompt(&messages), "Usuário: oi\nAssistente: olá!\n");
        assert_eq!(format_history_for_prompt(&[]), "");
    }
}
