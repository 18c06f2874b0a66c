use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use tokio::sync::RwLock;

use crate::history::HistoryStore;
use crate::models::chat::{ ContextEntity, Message, UsageRecord };

#[derive(Default)]
struct UserDocuments {
    messages: Vec<Message>,
    entities: HashMap<String, ContextEntity>,
    usage: HashMap<String, UsageRecord>,
}

/// Process-local store, used when no Redis host is configured and in tests.
#[derive(Default)]
pub struct MemoryHistoryStore {
    users: RwLock<HashMap<String, UserDocuments>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn add_message(
        &self,
        user_id: &str,
        message: &Message
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut users = self.users.write().await;
        users.entry(user_id.to_string()).or_default().messages.push(message.clone());
        Ok(())
    }

    async fn get_messages(
        &self,
        user_id: &str,
        limit: Option<usize>
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        let users = self.users.read().await;
        let messages = match users.get(user_id) {
            Some(docs) => &docs.messages,
            None => {
                return Ok(Vec::new());
            }
        };
        let skip = limit.map(|l| messages.len().saturating_sub(l)).unwrap_or(0);
        Ok(messages[skip..].to_vec())
    }

    async fn clear_messages(&self, user_id: &str) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let mut users = self.users.write().await;
        Ok(
            users
                .get_mut(user_id)
                .map(|docs| std::mem::take(&mut docs.messages).len())
                .unwrap_or(0)
        )
    }

    async fn upsert_entity(
        &self,
        user_id: &str,
        entity: &ContextEntity
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut users = self.users.write().await;
        users
            .entry(user_id.to_string())
            .or_default()
            .entities.insert(entity.key.clone(), entity.clone());
        Ok(())
    }

    async fn get_entities(
        &self,
        user_id: &str
    ) -> Result<Vec<ContextEntity>, Box<dyn Error + Send + Sync>> {
        let users = self.users.read().await;
        Ok(
            users
                .get(user_id)
                .map(|docs| docs.entities.values().cloned().collect())
                .unwrap_or_default()
        )
    }

    async fn record_usage(
        &self,
        user_id: &str,
        day: &str,
        tokens: u64
    ) -> Result<UsageRecord, Box<dyn Error + Send + Sync>> {
        let mut users = self.users.write().await;
        let record = users
            .entry(user_id.to_string())
            .or_default()
            .usage.entry(day.to_string())
            .or_insert_with(|| UsageRecord {
                day: day.to_string(),
                ..UsageRecord::default()
            });
        record.requests += 1;
        record.tokens += tokens;
        Ok(record.clone())
    }

    async fn get_usage(
        &self,
        user_id: &str,
        day: &str
    ) -> Result<UsageRecord, Box<dyn Error + Send + Sync>> {
        let users = self.users.read().await;
        Ok(
            users
                .get(user_id)
                .and_then(|docs| docs.usage.get(day).cloned())
                .unwrap_or_else(|| UsageRecord {
                    day: day.to_string(),
                    ..UsageRecord::default()
                })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::EntityKind;

    #[tokio::test]
    async fn limit_returns_most_recent_messages_oldest_first() {
        let store = MemoryHistoryStore::new();
        for i in 0..5 {
            store.add_message("u1", &Message::user(format!("m{}", i))).await.unwrap();
        }

        let last_two = store.get_messages("u1", Some(2)).await.unwrap();
        let contents: Vec<_> = last_two.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert_eq!(store.get_messages("u1", None).await.unwrap().len(), 5);
        assert!(store.get_messages("nobody", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_only_touches_the_given_user() {
        let store = MemoryHistoryStore::new();
        store.add_message("alice", &Message::user("a")).await.unwrap();
        store.add_message("alice", &Message::assistant("b")).await.unwrap();
        store.add_message("bob", &Message::user("c")).await.unwrap();

        assert_eq!(store.clear_messages("alice").await.unwrap(), 2);
        assert!(store.get_messages("alice", None).await.unwrap().is_empty());
        assert_eq!(store.get_messages("bob", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn usage_accumulates_per_day() {
        let store = MemoryHistoryStore::new();
        store.record_usage("u", "2026-10-18", 10).await.unwrap();
        let record = store.record_usage("u", "2026-10-18", 5).await.unwrap();
        assert_eq!(record.requests, 2);
        assert_eq!(record.tokens, 15);

        let other_day = store.get_usage("u", "2026-10-19").await.unwrap();
        assert_eq!(other_day.requests, 0);
        assert_eq!(other_day.day, "2026-10-19");
    }

    #[tokio::test]
    async fn entities_are_replaced_by_key() {
        let store = MemoryHistoryStore::new();
        let mut entity = ContextEntity {
            key: "maria".into(),
            value: "Maria".into(),
            kind: EntityKind::Person,
            mentions: 1,
            last_seen: 1,
        };
        store.upsert_entity("u", &entity).await.unwrap();
        entity.mentions = 2;
        store.upsert_entity("u", &entity).await.unwrap();

        let entities = store.get_entities("u").await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].mentions, 2);
    }
}
