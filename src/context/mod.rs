//! Remembers names across turns.
//!
//! The user's own name ("meu nome é Ana") and capitalized names mentioned
//! mid-sentence are kept as [`ContextEntity`] records in the history store.
//! When a later message says "ele" or "dela", the most recently seen person
//! is offered to the model as the likely referent.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::prompt::{ render, PromptConfig, PromptError };
use crate::models::chat::{ ContextEntity, EntityKind };

pub const USER_NAME_KEY: &str = "user_name";

static USER_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:meu nome é|meu nome e|me chamo|pode me chamar de)\s+(\p{L}+)").unwrap()
});

const PRONOUNS: &[&str] = &["ele", "ela", "dele", "dela", "nele", "nela"];

/// Capitalized words that are not names.
const STOP_WORDS: &[&str] = &[
    "jarvis",
    "eu",
    "você",
    "voce",
    "ele",
    "ela",
    "olá",
    "ola",
    "oi",
    "sim",
    "não",
    "nao",
    "obrigado",
    "obrigada",
    "por",
    "que",
    "qual",
    "quem",
    "como",
    "onde",
    "quando",
    "meu",
    "minha",
    "bom",
    "boa",
    "senhor",
    "senhora",
    "segunda",
    "terça",
    "quarta",
    "quinta",
    "sexta",
    "sábado",
    "domingo",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PronounHint {
    pub pronoun: String,
    pub name: String,
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

fn entity(key: String, value: String, kind: EntityKind, now_ms: i64) -> ContextEntity {
    ContextEntity {
        key,
        value,
        kind,
        mentions: 1,
        last_seen: now_ms,
    }
}

/// Names found in one message. Person keys are the lowercase name.
pub fn extract_entities(text: &str, now_ms: i64) -> Vec<ContextEntity> {
    let mut found: Vec<ContextEntity> = Vec::new();

    let user_name = USER_NAME_PATTERN.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| capitalize(m.as_str()));
    if let Some(name) = &user_name {
        found.push(entity(USER_NAME_KEY.to_string(), name.clone(), EntityKind::UserName, now_ms));
    }

    let mut sentence_start = true;
    for raw in text.split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        let starts_sentence = sentence_start;
        sentence_start = raw.ends_with(|c: char| c == '.' || c == '!' || c == '?');

        if starts_sentence || word.chars().count() < 2 {
            continue;
        }
        let is_capitalized =
            word.chars().next().map_or(false, |c| c.is_uppercase()) &&
            word.chars().skip(1).all(|c| c.is_lowercase());
        if !is_capitalized {
            continue;
        }
        let key = word.to_lowercase();
        if STOP_WORDS.contains(&key.as_str()) {
            continue;
        }
        if user_name.as_deref().map_or(false, |n| n.to_lowercase() == key) {
            continue;
        }
        if found.iter().any(|e| e.key == key) {
            continue;
        }
        found.push(entity(key, word.to_string(), EntityKind::Person, now_ms));
    }

    found
}

/// Folds newly detected entities into `known`, bumping mention counts, and
/// returns the records that changed.
pub fn merge_entities(known: &mut Vec<ContextEntity>, detected: Vec<ContextEntity>) -> Vec<ContextEntity> {
    let mut touched = Vec::with_capacity(detected.len());
    for new in detected {
        match known.iter_mut().find(|e| e.key == new.key) {
            Some(existing) => {
                existing.mentions += 1;
                existing.value = new.value;
                existing.last_seen = existing.last_seen.max(new.last_seen);
                touched.push(existing.clone());
            }
            None => {
                known.push(new.clone());
                touched.push(new);
            }
        }
    }
    touched
}

/// Points a third-person pronoun at the most recently seen person.
pub fn resolve_pronouns(text: &str, entities: &[ContextEntity]) -> Option<PronounHint> {
    let lower = text.to_lowercase();
    let pronoun = lower
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .find(|w| PRONOUNS.contains(w))?;

    let person = entities
        .iter()
        .filter(|e| e.kind == EntityKind::Person)
        .max_by_key(|e| (e.last_seen, e.mentions))?;

    Some(PronounHint {
        pronoun: pronoun.to_string(),
        name: person.value.clone(),
    })
}

/// Sentence block for the prompt; empty when nothing is known.
pub fn build_context_note(
    config: &PromptConfig,
    entities: &[ContextEntity],
    hint: Option<&PronounHint>
) -> Result<String, PromptError> {
    let mut parts = Vec::new();
    if let Some(user) = entities.iter().find(|e| e.kind == EntityKind::UserName) {
        parts.push(render(config, "known_user_name", &[("name", &user.value)])?);
    }
    if let Some(hint) = hint {
        parts.push(
            render(config, "pronoun_hint", &[
                ("pronoun", &hint.pronoun),
                ("name", &hint.name),
            ])?
        );
    }
    Ok(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(entities: &[ContextEntity]) -> Vec<&str> {
        entities.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn extracts_the_user_name() {
        let found = extract_entities("Oi, meu nome é ana!", 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, EntityKind::UserName);
        assert_eq!(found[0].value, "Ana");

        let found = extract_entities("pode me chamar de Beto", 1);
        assert_eq!(found[0].value, "Beto");
    }

    #[test]
    fn extracts_mid_sentence_capitalized_names() {
        let found = extract_entities("Ontem conversei com Maria e com o Pedro. Jarvis, lembra?", 5);
        assert_eq!(keys(&found), vec!["maria", "pedro"]);
        assert!(found.iter().all(|e| e.kind == EntityKind::Person && e.last_seen == 5));
    }

    #[test]
    fn ignores_sentence_initial_and_stop_words() {
        let found = extract_entities("Quando Você chega? Amanhã eu vou.", 1);
        assert!(found.is_empty());
    }

    #[test]
    fn merging_counts_mentions() {
        let mut known = extract_entities("falei com Maria", 1);
        let touched = merge_entities(&mut known, extract_entities("a Maria e o Paulo", 2));
        assert_eq!(touched.len(), 2);

        let maria = known.iter().find(|e| e.key == "maria").unwrap();
        assert_eq!(maria.mentions, 2);
        assert_eq!(maria.last_seen, 2);
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn pronouns_resolve_to_the_latest_person() {
        let mut known = extract_entities("falei com Maria", 1);
        merge_entities(&mut known, extract_entities("encontrei o Paulo", 2));

        let hint = resolve_pronouns("o que ele disse?", &known).unwrap();
        assert_eq!(hint, PronounHint { pronoun: "ele".into(), name: "Paulo".into() });
        assert_eq!(resolve_pronouns("o que você acha?", &known), None);
        assert_eq!(resolve_pronouns("e ela?", &[]), None);
    }

    #[test]
    fn context_note_mentions_name_and_hint() {
        let config = PromptConfig::builtin().unwrap();
        let mut known = extract_entities("meu nome é Ana", 1);
        merge_entities(&mut known, extract_entities("conheci a Julia", 2));
        let hint = resolve_pronouns("gostei dela", &known);

        let note = build_context_note(&config, &known, hint.as_ref()).unwrap();
        assert!(note.contains("O nome do usuário é Ana."));
        assert!(note.contains("\"dela\""));
        assert!(note.contains("Julia"));

        assert_eq!(build_context_note(&config, &[], None).unwrap(), "");
    }
}
