use async_trait::async_trait;
use crate::models::chat::{ ContextEntity, Message, UsageRecord };
use crate::history::HistoryStore;
use std::collections::HashMap;
use std::error::Error;
use log::error;
use redis::{ Client, AsyncCommands };

/// Usage counters outlive their day by one more so late reads still see them.
const USAGE_TTL_SECS: i64 = 2 * 24 * 60 * 60;

pub struct RedisHistoryStore {
    client: Client,
    key_prefix: String,
}

impl RedisHistoryStore {
    pub fn new(host: &str, key_prefix: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(Self {
            client: Client::open(host)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn messages_key(&self, user_id: &str) -> String {
        format!("{}{}:messages", self.key_prefix, user_id)
    }

    fn entities_key(&self, user_id: &str) -> String {
        format!("{}{}:entities", self.key_prefix, user_id)
    }

    fn usage_key(&self, user_id: &str, day: &str) -> String {
        format!("{}{}:usage:{}", self.key_prefix, user_id, day)
    }
}

fn usage_from_hash(day: &str, fields: HashMap<String, u64>) -> UsageRecord {
    UsageRecord {
        day: day.to_string(),
        requests: fields.get("requests").copied().unwrap_or(0),
        tokens: fields.get("tokens").copied().unwrap_or(0),
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn add_message(
        &self,
        user_id: &str,
        message: &Message
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let json_msg = serde_json::to_string(message)?;
        let _: i64 = conn.rpush(self.messages_key(user_id), &json_msg).await?;
        Ok(())
    }

    async fn get_messages(
        &self,
        user_id: &str,
        limit: Option<usize>
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let start = match limit {
            Some(0) => {
                return Ok(Vec::new());
            }
            Some(l) => -(l as isize),
            None => 0,
        };
        let json_entries: Vec<String> = conn.lrange(self.messages_key(user_id), start, -1).await?;
        let mut messages = Vec::with_capacity(json_entries.len());

        for json_entry in &json_entries {
            match serde_json::from_str::<Message>(json_entry) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    error!("Error parsing history entry: {}", e);
                }
            }
        }

        Ok(messages)
    }

    async fn clear_messages(&self, user_id: &str) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let key = self.messages_key(user_id);
        let count: usize = conn.llen(&key).await?;
        let _: i64 = conn.del(&key).await?;
        Ok(count)
    }

    async fn upsert_entity(
        &self,
        user_id: &str,
        entity: &ContextEntity
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let json_entity = serde_json::to_string(entity)?;
        let _: i64 = conn.hset(self.entities_key(user_id), &entity.key, json_entity).await?;
        Ok(())
    }

    async fn get_entities(
        &self,
        user_id: &str
    ) -> Result<Vec<ContextEntity>, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let values: Vec<String> = conn.hvals(self.entities_key(user_id)).await?;
        Ok(
            values
                .iter()
                .filter_map(|v| match serde_json::from_str::<ContextEntity>(v) {
                    Ok(entity) => Some(entity),
                    Err(e) => {
                        error!("Error parsing context entity: {}", e);
                        None
                    }
                })
                .collect()
        )
    }

    async fn record_usage(
        &self,
        user_id: &str,
        day: &str,
        tokens: u64
    ) -> Result<UsageRecord, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let key = self.usage_key(user_id, day);
        let requests: u64 = conn.hincr(&key, "requests", 1u64).await?;
        let total_tokens: u64 = conn.hincr(&key, "tokens", tokens).await?;
        let _: bool = conn.expire(&key, USAGE_TTL_SECS).await?;

        Ok(UsageRecord {
            day: day.to_string(),
            requests,
            tokens: total_tokens,
        })
    }

    async fn get_usage(
        &self,
        user_id: &str,
        day: &str
    ) -> Result<UsageRecord, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let fields: HashMap<String, u64> = conn.hgetall(self.usage_key(user_id, day)).await?;
        Ok(usage_from_hash(day, fields))
    }
}
