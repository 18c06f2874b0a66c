use async_trait::async_trait;
use chrono::{ DateTime, NaiveDate };
use log::{ debug, error, info };
use serde::Serialize;
use std::error::Error;
use std::sync::{ Arc, Mutex, MutexGuard };

use crate::commands::{ month_name, utc_offset };
use crate::history::HistoryStore;
use crate::models::chat::{ Message, Role };

pub const DEFAULT_FAILURE_MESSAGE: &str =
    "Desculpe, ocorreu um erro ao processar sua mensagem. Tente novamente.";

const PREVIEW_MESSAGES: usize = 3;
const PREVIEW_CHARS: usize = 100;

/// Produces the assistant reply for one user message.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// `history` holds the turns before `text`, oldest first.
    async fn generate_reply(
        &self,
        user_id: &str,
        history: &[Message],
        text: &str
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Shown in place of a reply when generation fails.
    fn failure_message(&self) -> String {
        DEFAULT_FAILURE_MESSAGE.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Empty text or a send while another is in flight. Nothing changed.
    Rejected,
    Replied {
        user: Message,
        reply: Message,
    },
    Failed {
        user: Message,
        reply: Message,
        error: String,
    },
    /// The conversation was cleared while the reply was pending. The reply
    /// was neither appended nor persisted.
    Discarded,
}

impl SendOutcome {
    pub fn reply(&self) -> Option<&Message> {
        match self {
            SendOutcome::Rejected | SendOutcome::Discarded => None,
            SendOutcome::Replied { reply, .. } | SendOutcome::Failed { reply, .. } => Some(reply),
        }
    }
}

#[derive(Default)]
struct ConversationState {
    messages: Vec<Message>,
    loading: bool,
    error: Option<String>,
    /// Bumped by every clear.
    epoch: u64,
}

/// The visible conversation of one user: an append-only list of messages
/// plus the loading and error flags, optionally mirrored to a store.
pub struct ConversationController {
    user_id: String,
    generator: Arc<dyn ReplyGenerator>,
    store: Option<Arc<dyn HistoryStore>>,
    state: Mutex<ConversationState>,
}

impl ConversationController {
    pub fn new(
        user_id: impl Into<String>,
        generator: Arc<dyn ReplyGenerator>,
        store: Option<Arc<dyn HistoryStore>>
    ) -> Self {
        Self {
            user_id: user_id.into(),
            generator,
            store,
            state: Mutex::new(ConversationState::default()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn state(&self) -> MutexGuard<'_, ConversationState> {
        // The lock is never held across an await, so poisoning only follows a panic.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the visible sequence with the persisted one.
    pub async fn load_history(&self) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let store = match &self.store {
            Some(store) => store,
            None => {
                return Ok(self.state().messages.len());
            }
        };
        let messages = store.get_messages(&self.user_id, None).await?;
        let count = messages.len();
        self.state().messages = messages;
        info!("Loaded {} messages for user {}", count, self.user_id);
        Ok(count)
    }

    pub async fn send(&self, text: &str) -> SendOutcome {
        let content = text.trim();
        let (user_message, history, epoch) = {
            let mut state = self.state();
            if content.is_empty() || state.loading {
                debug!("Send rejected for user {} (loading={})", self.user_id, state.loading);
                return SendOutcome::Rejected;
            }
            let history = state.messages.clone();
            let user_message = Message::user(content);
            state.messages.push(user_message.clone());
            state.loading = true;
            (user_message, history, state.epoch)
        };
        let still_current = self.state().epoch == epoch;
        if still_current {
            self.mirror(&user_message).await;
        }

        let result = self.generator.generate_reply(&self.user_id, &history, content).await;

        let outcome = {
            let mut state = self.state();
            state.loading = false;
            if state.epoch != epoch {
                info!("Conversation of {} was cleared, dropping the pending reply", self.user_id);
                return SendOutcome::Discarded;
            }
            match result {
                Ok(text) => {
                    let reply = Message::assistant(text);
                    state.messages.push(reply.clone());
                    state.error = None;
                    SendOutcome::Replied { user: user_message, reply }
                }
                Err(e) => {
                    error!("Reply generation failed for user {}: {}", self.user_id, e);
                    let reply = Message::assistant(self.generator.failure_message());
                    state.messages.push(reply.clone());
                    state.error = Some(e.to_string());
                    SendOutcome::Failed { user: user_message, reply, error: e.to_string() }
                }
            }
        };

        if let Some(reply) = outcome.reply() {
            self.mirror(reply).await;
        }
        outcome
    }

    async fn mirror(&self, message: &Message) {
        if let Some(store) = &self.store {
            if let Err(e) = store.add_message(&self.user_id, message).await {
                error!("Failed to persist message {} for user {}: {}", message.id, self.user_id, e);
            }
        }
    }

    /// Empties the conversation and deletes this user's persisted messages.
    /// A reply still in flight is dropped when it arrives.
    pub async fn clear(&self) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let visible = {
            let mut state = self.state();
            let count = state.messages.len();
            state.messages.clear();
            state.error = None;
            state.epoch = state.epoch.wrapping_add(1);
            count
        };
        match &self.store {
            Some(store) => store.clear_messages(&self.user_id).await,
            None => Ok(visible),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn dismiss_error(&self) {
        self.state().error = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagePreview {
    pub role: Role,
    pub content: String,
    pub time: String,
}

/// One calendar day of a history, as shown in the history view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayGroup {
    pub day: String,
    pub label: String,
    pub count: usize,
    pub preview: Vec<MessagePreview>,
    pub messages: Vec<Message>,
}

fn truncate_preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_CHARS {
        let head: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

fn long_day_label(day: NaiveDate) -> String {
    use chrono::Datelike;
    format!("{} de {} de {}", day.day(), month_name(day.month()), day.year())
}

/// Groups messages by calendar day in the given UTC offset, in the order the
/// days first appear.
pub fn group_by_day(messages: &[Message], utc_offset_hours: i32) -> Vec<DayGroup> {
    let offset = utc_offset(utc_offset_hours);
    let mut groups: Vec<DayGroup> = Vec::new();

    for message in messages {
        let local = match DateTime::from_timestamp_millis(message.timestamp) {
            Some(utc) => utc.with_timezone(&offset),
            None => {
                continue;
            }
        };
        let day = local.date_naive();
        let key = day.format("%Y-%m-%d").to_string();

        let index = match groups.iter().position(|g| g.day == key) {
            Some(i) => i,
            None => {
                groups.push(DayGroup {
                    day: key,
                    label: long_day_label(day),
                    count: 0,
                    preview: Vec::new(),
                    messages: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        if group.preview.len() < PREVIEW_MESSAGES {
            group.preview.push(MessagePreview {
                role: message.role,
                content: truncate_preview(&message.content),
                time: local.format("%H:%M").to_string(),
            });
        }
        group.messages.push(message.clone());
        group.count += 1;
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use tokio::sync::Notify;

    struct EchoGenerator;

    #[async_trait]
    impl ReplyGenerator for EchoGenerator {
        async fn generate_reply(
            &self,
            _user_id: &str,
            history: &[Message],
            text: &str
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            Ok(format!("eco({}): {}", history.len(), text))
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl ReplyGenerator for FailingGenerator {
        async fn generate_reply(
            &self,
            _user_id: &str,
            _history: &[Message],
            _text: &str
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            Err("modelo indisponível".into())
        }
    }

    struct GatedGenerator {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ReplyGenerator for GatedGenerator {
        async fn generate_reply(
            &self,
            _user_id: &str,
            _history: &[Message],
            _text: &str
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.gate.notified().await;
            Ok("pronto".into())
        }
    }

    fn message_at(role: Role, content: &str, timestamp: i64) -> Message {
        Message { timestamp, ..Message::new(role, content) }
    }

    #[tokio::test]
    async fn blank_sends_are_rejected_without_changes() {
        let controller = ConversationController::new("u", Arc::new(EchoGenerator), None);
        assert_eq!(controller.send("").await, SendOutcome::Rejected);
        assert_eq!(controller.send("   \n\t").await, SendOutcome::Rejected);
        assert!(controller.messages().is_empty());
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn successful_send_appends_user_then_assistant() {
        let controller = ConversationController::new("u", Arc::new(EchoGenerator), None);
        controller.send("olá").await;
        let outcome = controller.send("tudo bem?").await;

        let messages = controller.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[3].role, Role::Assistant);
        // The generator sees only the turns before the new message.
        assert_eq!(messages[3].content, "eco(2): tudo bem?");
        assert!(matches!(outcome, SendOutcome::Replied { .. }));
        assert_eq!(controller.error(), None);
    }

    #[tokio::test]
    async fn failed_send_appends_the_fixed_error_message() {
        let controller = ConversationController::new("u", Arc::new(FailingGenerator), None);
        let outcome = controller.send("oi").await;

        let messages = controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "oi");
        assert_eq!(messages[1].content, DEFAULT_FAILURE_MESSAGE);
        assert_eq!(controller.error().as_deref(), Some("modelo indisponível"));
        assert!(matches!(outcome, SendOutcome::Failed { .. }));

        controller.dismiss_error();
        assert_eq!(controller.error(), None);
    }

    #[tokio::test]
    async fn send_while_loading_is_rejected() {
        let gate = Arc::new(Notify::new());
        let controller = Arc::new(
            ConversationController::new("u", Arc::new(GatedGenerator { gate: gate.clone() }), None)
        );

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send("primeira").await })
        };
        while !controller.is_loading() {
            tokio::task::yield_now().await;
        }

        assert_eq!(controller.send("segunda").await, SendOutcome::Rejected);
        assert_eq!(controller.messages().len(), 1);

        gate.notify_one();
        assert!(matches!(first.await.unwrap(), SendOutcome::Replied { .. }));
        assert_eq!(controller.messages().len(), 2);
    }

    #[tokio::test]
    async fn messages_are_mirrored_and_reloaded() {
        let store: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
        let controller = ConversationController::new("u", Arc::new(EchoGenerator), Some(store.clone()));
        controller.send("oi").await;
        assert_eq!(store.get_messages("u", None).await.unwrap().len(), 2);

        let reopened = ConversationController::new("u", Arc::new(EchoGenerator), Some(store));
        assert_eq!(reopened.load_history().await.unwrap(), 2);
        assert_eq!(reopened.messages(), controller.messages());
    }

    #[tokio::test]
    async fn clear_removes_only_the_current_user() {
        let store: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
        let alice = ConversationController::new("alice", Arc::new(EchoGenerator), Some(store.clone()));
        let bob = ConversationController::new("bob", Arc::new(EchoGenerator), Some(store.clone()));
        alice.send("oi").await;
        bob.send("oi").await;

        assert_eq!(alice.clear().await.unwrap(), 2);
        assert!(alice.messages().is_empty());
        assert!(store.get_messages("alice", None).await.unwrap().is_empty());
        assert_eq!(store.get_messages("bob", None).await.unwrap().len(), 2);
        assert_eq!(bob.messages().len(), 2);
    }

    #[tokio::test]
    async fn reply_pending_during_clear_is_dropped() {
        let gate = Arc::new(Notify::new());
        let store: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
        let controller = Arc::new(
            ConversationController::new(
                "u",
                Arc::new(GatedGenerator { gate: gate.clone() }),
                Some(store.clone())
            )
        );

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send("oi").await })
        };
        while !controller.is_loading() {
            tokio::task::yield_now().await;
        }

        controller.clear().await.unwrap();
        gate.notify_one();

        assert_eq!(pending.await.unwrap(), SendOutcome::Discarded);
        assert!(controller.messages().is_empty());
        assert!(!controller.is_loading());
        assert!(store.get_messages("u", None).await.unwrap().is_empty());

        // The next turn starts a fresh pair.
        gate.notify_one();
        assert!(matches!(controller.send("de novo").await, SendOutcome::Replied { .. }));
        let messages = controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn groups_history_by_local_day() {
        // 2026-10-18 02:00 UTC is still the 17th in São Paulo.
        let late_night = 1_792_288_800_000;
        let morning = late_night + 12 * 3600 * 1000;
        let long = "a".repeat(150);
        let messages = vec![
            message_at(Role::User, "boa noite", late_night),
            message_at(Role::User, &long, morning),
            message_at(Role::Assistant, "bom dia", morning + 1000)
        ];

        let groups = group_by_day(&messages, -3);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].day, "2026-10-17");
        assert_eq!(groups[0].label, "17 de outubro de 2026");
        assert_eq!(groups[0].preview[0].time, "23:00");
        assert_eq!(groups[1].count, 2);
        assert_eq!(groups[1].preview[0].content.chars().count(), 103);
        assert!(groups[1].preview[0].content.ends_with("..."));
    }
}
