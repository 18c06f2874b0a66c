pub mod expr;

use chrono::{ DateTime, Datelike, FixedOffset, NaiveDate, Offset, Utc };
use log::{ debug, warn };
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::prompt::{ render, PromptConfig, PromptError };

const TIME_TRIGGERS: &[&str] = &["que horas", "horas são", "horas sao", "que hora é", "que hora e"];
const DATE_TRIGGERS: &[&str] = &["que dia", "data de hoje", "qual a data", "qual é a data"];
const CALC_TRIGGERS: &[&str] = &["quanto é", "quanto e ", "quanto dá", "quanto da ", "calcule", "calcular", "calcula"];
const WEATHER_PHRASES: &[&str] = &[
    "previsão do tempo",
    "previsao do tempo",
    "temperatura em",
    "temperatura de",
    "temperatura no",
    "temperatura na",
];
const WEATHER_WORDS: &[&str] = &["clima"];
const NEWS_WORDS: &[&str] = &["notícia", "noticia", "notícias", "noticias"];
const SEARCH_TRIGGERS: &[&str] = &["pesquise", "pesquisar", "procure"];
const TRAILING_TIME_WORDS: &[&str] = &["hoje", "agora", "amanhã", "amanha", "atualmente"];

pub const DEFAULT_CITY: &str = "São Paulo";

/// Speech transcripts drop accents and letters; words this close to a
/// trigger still count.
const FUZZY_THRESHOLD: f64 = 0.92;
const FUZZY_MIN_LEN: usize = 5;

static CITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:clima|tempo|temperatura)\s+(?:em|no|na|de|do|da|para|pra)\s+(.+)").unwrap()
});

const MONTHS_PT: [&str; 12] = [
    "janeiro",
    "fevereiro",
    "março",
    "abril",
    "maio",
    "junho",
    "julho",
    "agosto",
    "setembro",
    "outubro",
    "novembro",
    "dezembro",
];

const WEEKDAYS_PT: [&str; 7] = [
    "segunda-feira",
    "terça-feira",
    "quarta-feira",
    "quinta-feira",
    "sexta-feira",
    "sábado",
    "domingo",
];

#[derive(Debug, Clone, PartialEq)]
pub enum CommandIntent {
    Time,
    Date,
    Calculate {
        expression: String,
    },
    Weather {
        city: String,
    },
    News {
        query: String,
    },
    Search {
        query: String,
    },
}

/// A web search the agent should run for an intent.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub news: bool,
}

impl CommandIntent {
    pub fn search_request(&self) -> Option<SearchRequest> {
        match self {
            CommandIntent::Weather { city } =>
                Some(SearchRequest { query: format!("clima {} hoje", city), news: true }),
            CommandIntent::News { query } => Some(SearchRequest { query: query.clone(), news: true }),
            CommandIntent::Search { query } => Some(SearchRequest { query: query.clone(), news: false }),
            _ => None,
        }
    }
}

pub fn month_name(month: u32) -> &'static str {
    MONTHS_PT[((month.max(1) - 1) as usize) % 12]
}

/// "domingo, 18 de outubro de 2026"
pub fn format_long_date(date: NaiveDate) -> String {
    format!(
        "{}, {} de {} de {}",
        WEEKDAYS_PT[date.weekday().num_days_from_monday() as usize],
        date.day(),
        month_name(date.month()),
        date.year()
    )
}

pub fn utc_offset(hours: i32) -> FixedOffset {
    match FixedOffset::east_opt(hours.saturating_mul(3600)) {
        Some(offset) => offset,
        None => {
            warn!("Invalid UTC offset {}h, using UTC", hours);
            Utc.fix()
        }
    }
}

pub fn now_in_offset(hours: i32) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&utc_offset(hours))
}

fn clean_word(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric())
}

fn word_matches(word: &str, keywords: &[&str]) -> bool {
    let word = clean_word(word);
    if keywords.contains(&word) {
        return true;
    }
    word.chars().count() >= FUZZY_MIN_LEN &&
        keywords.iter().any(|k| strsim::jaro_winkler(word, k) >= FUZZY_THRESHOLD)
}

fn strip_trailing(text: &str) -> String {
    let mut words: Vec<&str> = text
        .trim()
        .trim_end_matches(|c: char| c == '?' || c == '!' || c == '.' || c == ',')
        .split_whitespace()
        .collect();
    while let Some(last) = words.last() {
        if TRAILING_TIME_WORDS.contains(&clean_word(&last.to_lowercase())) {
            words.pop();
        } else {
            break;
        }
    }
    words.join(" ")
}

fn extract_expression(message: &str, lower: &str) -> Option<String> {
    for trigger in CALC_TRIGGERS {
        if let Some(pos) = lower.find(trigger) {
            // Lowercasing can change byte lengths, so slice the lowercase copy.
            let rest = lower[pos + trigger.len()..]
                .trim()
                .trim_end_matches(|c: char| c == '?' || c == '!' || c == '.' || c == '=')
                .trim()
                .to_string();
            if rest.chars().any(|c| c.is_ascii_digit()) {
                return Some(rest);
            }
            debug!("Calculation trigger without numbers in '{}'", message);
            return None;
        }
    }
    None
}

fn extract_city(message: &str) -> String {
    CITY_PATTERN.captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| strip_trailing(m.as_str()))
        .filter(|city| !city.is_empty())
        .unwrap_or_else(|| DEFAULT_CITY.to_string())
}

fn extract_search_query(message: &str, lower: &str) -> Option<String> {
    for trigger in SEARCH_TRIGGERS {
        let with_space = format!("{} ", trigger);
        if let Some(pos) = lower.find(&with_space) {
            let query = strip_trailing(&lower[pos + with_space.len()..]);
            if !query.is_empty() {
                return Some(query);
            }
        }
    }

    // Misheard imperative as the first word, e.g. "pesquize gatos".
    let mut words = message.split_whitespace();
    let first = words.next()?;
    if word_matches(&first.to_lowercase(), SEARCH_TRIGGERS) {
        let query = strip_trailing(&words.collect::<Vec<_>>().join(" "));
        if !query.is_empty() {
            return Some(query);
        }
    }
    None
}

/// Maps a message to a command by keyword. `None` means the model answers.
pub fn dispatch(message: &str) -> Option<CommandIntent> {
    let lower = message.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    let words: Vec<&str> = lower.split_whitespace().collect();

    if TIME_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return Some(CommandIntent::Time);
    }
    if DATE_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return Some(CommandIntent::Date);
    }
    if let Some(expression) = extract_expression(message, &lower) {
        return Some(CommandIntent::Calculate { expression });
    }
    if
        WEATHER_PHRASES.iter().any(|p| lower.contains(p)) ||
        words.iter().any(|w| word_matches(w, WEATHER_WORDS))
    {
        return Some(CommandIntent::Weather { city: extract_city(message.trim()) });
    }
    if words.iter().any(|w| word_matches(w, NEWS_WORDS)) {
        return Some(CommandIntent::News { query: strip_trailing(message) });
    }
    if let Some(query) = extract_search_query(message.trim(), &lower) {
        return Some(CommandIntent::Search { query });
    }
    None
}

/// Answers the intents that need no network call. Search intents return `None`.
pub fn local_answer(
    intent: &CommandIntent,
    config: &PromptConfig,
    now: DateTime<FixedOffset>
) -> Result<Option<String>, PromptError> {
    let answer = match intent {
        CommandIntent::Time => {
            render(config, "time_answer", &[("time", &now.format("%H:%M").to_string())])?
        }
        CommandIntent::Date => {
            render(config, "date_answer", &[("date", &format_long_date(now.date_naive()))])?
        }
        CommandIntent::Calculate { expression } =>
            match expr::evaluate(expression) {
                Ok(value) =>
                    render(
                        config,
                        "calc_answer",
                        &[
                            ("expression", expression),
                            ("result", &expr::format_number(value)),
                        ]
                    )?,
                Err(e) => {
                    debug!("Could not evaluate '{}': {}", expression, e);
                    config.text("calc_error").to_string()
                }
            }
        _ => {
            return Ok(None);
        }
    };
    Ok(Some(answer))
}
