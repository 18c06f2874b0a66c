use log::debug;
use std::collections::{ HashMap, VecDeque };
use std::time::{ Duration, Instant };

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Messages mentioning any of these depend on the moment they are asked.
const TIME_SENSITIVE_KEYWORDS: &[&str] = &[
    "hoje",
    "agora",
    "atual",
    "atualmente",
    "ontem",
    "amanhã",
    "amanha",
    "clima",
    "tempo",
    "temperatura",
    "previsão",
    "previsao",
    "notícia",
    "noticia",
    "horas",
    "hora",
    "data",
    "dia",
    "semana",
    "último",
    "ultimo",
    "última",
    "ultima",
    "recente",
    "cotação",
    "cotacao",
    "placar",
];

pub fn normalize(message: &str) -> String {
    message.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn is_time_sensitive(message: &str) -> bool {
    let lower = message.to_lowercase();
    TIME_SENSITIVE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Entries belong to one user: a reply may depend on that user's history
/// and remembered context.
fn cache_key(user_id: &str, message: &str) -> String {
    format!("{}\n{}", user_id, normalize(message))
}

struct CacheEntry {
    response: String,
    inserted_at: Instant,
}

/// Response cache keyed by user and normalized message, evicting the least recently
/// added entry when full. Reads never refresh an entry's age or position.
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, user_id: &str, message: &str) -> Option<String> {
        self.get_at(user_id, message, Instant::now())
    }

    pub fn put(&mut self, user_id: &str, message: &str, response: &str) {
        self.put_at(user_id, message, response, Instant::now())
    }

    fn get_at(&mut self, user_id: &str, message: &str, now: Instant) -> Option<String> {
        if is_time_sensitive(message) {
            return None;
        }
        let key = cache_key(user_id, message);
        let fresh = match self.entries.get(&key) {
            Some(entry) => now.saturating_duration_since(entry.inserted_at) < self.ttl,
            None => {
                return None;
            }
        };
        if !fresh {
            debug!("Cache entry expired for '{}'", key);
            self.remove(&key);
            return None;
        }
        self.entries.get(&key).map(|e| e.response.clone())
    }

    fn put_at(&mut self, user_id: &str, message: &str, response: &str, now: Instant) {
        if is_time_sensitive(message) {
            return;
        }
        let key = cache_key(user_id, message);
        if self.entries.contains_key(&key) {
            self.remove(&key);
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, CacheEntry {
            response: response.to_string(),
            inserted_at: now,
        });
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_sensitive_messages_never_hit() {
        let mut cache = ResponseCache::default();
        let now = Instant::now();
        cache.put_at("ana", "como está o clima em Salvador?", "ensolarado", now);
        assert!(cache.is_empty());

        cache.entries.insert(cache_key("ana", "o que aconteceu hoje"), CacheEntry {
            response: "stale".into(),
            inserted_at: now,
        });
        assert_eq!(cache.get_at("ana", "O que aconteceu HOJE", now), None);
    }

    #[test]
    fn hits_are_keyed_by_normalized_text() {
        let mut cache = ResponseCache::default();
        let now = Instant::now();
        cache.put_at("ana", "Por que o céu é azul?", "Espalhamento de Rayleigh.", now);
        assert_eq!(
            cache.get_at("ana", "  por que o   céu é azul? ", now).as_deref(),
            Some("Espalhamento de Rayleigh.")
        );
    }

    #[test]
    fn entries_are_private_to_each_user() {
        let mut cache = ResponseCache::default();
        let now = Instant::now();
        cache.put_at("ana", "qual é o meu nome?", "Seu nome é Ana.", now);

        assert_eq!(cache.get_at("bruno", "qual é o meu nome?", now), None);
        assert_eq!(cache.get_at("ana", "Qual é o meu nome?", now).as_deref(), Some("Seu nome é Ana."));
    }

    #[test]
    fn expired_entries_are_dropped() {
        let mut cache = ResponseCache::new(10, Duration::from_secs(600));
        let start = Instant::now();
        cache.put_at("ana", "o que é um buraco negro?", "uma região...", start);

        assert!(cache.get_at("ana", "o que é um buraco negro?", start + Duration::from_secs(599)).is_some());
        assert!(cache.get_at("ana", "o que é um buraco negro?", start + Duration::from_secs(600)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_added() {
        let mut cache = ResponseCache::new(2, DEFAULT_TTL);
        let now = Instant::now();
        cache.put_at("ana", "a", "1", now);
        cache.put_at("ana", "b", "2", now);
        // A read does not protect "a" from eviction.
        assert!(cache.get_at("ana", "a", now).is_some());
        cache.put_at("ana", "c", "3", now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("ana", "a", now).is_none());
        assert!(cache.get_at("ana", "b", now).is_some());
        assert!(cache.get_at("ana", "c", now).is_some());
    }

    #[test]
    fn default_capacity_is_one_hundred() {
        let mut cache = ResponseCache::default();
        let now = Instant::now();
        for i in 0..150 {
            cache.put_at("ana", &format!("pergunta {}", i), "resposta", now);
        }
        assert_eq!(cache.len(), DEFAULT_CAPACITY);
        assert!(cache.get_at("ana", "pergunta 49", now).is_none());
        assert!(cache.get_at("ana", "pergunta 50", now).is_some());
    }
}
