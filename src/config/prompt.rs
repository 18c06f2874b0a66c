use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use log::info;

const BUILTIN_PROMPTS: &str = include_str!("../../json/prompts.json");

const REQUIRED_QUERY_TEMPLATES: &[&str] = &["history_summary"];
const REQUIRED_RESPONSE_TEMPLATES: &[&str] = &[
    "chat_reply",
    "summary_block",
    "history_block",
    "known_user_name",
    "pronoun_hint",
    "time_answer",
    "date_answer",
    "calc_answer",
    "search_answer",
];
const REQUIRED_STRINGS: &[&str] = &[
    "chat_error",
    "voice_error",
    "search_failed",
    "calc_error",
    "usage_exhausted",
    "speech_lang",
];

#[derive(Debug)]
pub enum PromptError {
    TemplateNotFound(String),
    StringNotFound(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::TemplateNotFound(key) => write!(f, "Prompt template '{}' not found", key),
            PromptError::StringNotFound(key) => write!(f, "Localized string '{}' not found", key),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PromptConfig {
    pub persona: String,
    pub query_templates: HashMap<String, String>,
    pub response_templates: HashMap<String, String>,
    pub strings: HashMap<String, String>,
    #[serde(skip)]
    pub last_loaded: Option<SystemTime>,
}

impl PromptConfig {
    /// The prompt file compiled into the binary.
    pub fn builtin() -> Result<Arc<PromptConfig>, PromptError> {
        let config: PromptConfig = serde_json::from_str(BUILTIN_PROMPTS)?;
        config.validate()?;
        Ok(Arc::new(config))
    }

    fn validate(&self) -> Result<(), PromptError> {
        for key in REQUIRED_QUERY_TEMPLATES {
            if !self.query_templates.contains_key(*key) {
                return Err(PromptError::TemplateNotFound(format!("query_templates:{}", key)));
            }
        }
        for key in REQUIRED_RESPONSE_TEMPLATES {
            if !self.response_templates.contains_key(*key) {
                return Err(PromptError::TemplateNotFound(format!("response_templates:{}", key)));
            }
        }
        for key in REQUIRED_STRINGS {
            if !self.strings.contains_key(*key) {
                return Err(PromptError::StringNotFound(key.to_string()));
            }
        }
        Ok(())
    }

    /// Localized UI string. Missing keys fall back to the key itself so a
    /// broken prompt file never takes a session down.
    pub fn text<'a>(&'a self, key: &'a str) -> &'a str {
        self.strings
            .get(key)
            .map(|s| s.as_str())
            .unwrap_or(key)
    }
}

pub fn load_prompts(path: &str) -> Result<Arc<PromptConfig>, Box<dyn Error + Send + Sync>> {
    let file_content = fs
        ::read_to_string(path)
        .map_err(|e| format!("Failed to read prompts file '{}': {}", path, e))?;
    let mut config: PromptConfig = serde_json
        ::from_str(&file_content)
        .map_err(|e| format!("Failed to parse prompts file '{}': {}", path, e))?;
    config.validate()?;
    config.last_loaded = Some(SystemTime::now());
    Ok(Arc::new(config))
}

/// Loads the prompt file, falling back to the bundled copy when it is absent.
pub fn load_prompts_or_builtin(path: &str) -> Result<Arc<PromptConfig>, Box<dyn Error + Send + Sync>> {
    if Path::new(path).exists() {
        return load_prompts(path);
    }
    info!("Prompts file '{}' not found, using bundled prompts", path);
    Ok(PromptConfig::builtin()?)
}

pub fn reload_prompts_if_changed<P: AsRef<Path>>(
    path: P,
    current_config: &Arc<PromptConfig>
) -> Result<Option<Arc<PromptConfig>>, Box<dyn Error + Send + Sync>> {
    let path_str = path.as_ref().to_string_lossy().to_string();
    let metadata = fs::metadata(&path).map_err(PromptError::from)?;

    if let Ok(modified) = metadata.modified() {
        if let Some(last_loaded) = current_config.last_loaded {
            if modified > last_loaded {
                info!("Prompts file changed, reloading...");
                return Ok(Some(load_prompts(&path_str)?));
            }
        } else {
            info!("No last_loaded timestamp, reloading prompts...");
            return Ok(Some(load_prompts(&path_str)?));
        }
    }
    Ok(None)
}

fn get_query_template<'a>(config: &'a PromptConfig, key: &str) -> Result<&'a str, PromptError> {
    config.query_templates
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| PromptError::TemplateNotFound(format!("query_templates:{}", key)))
}

fn get_response_template<'a>(config: &'a PromptConfig, key: &str) -> Result<&'a str, PromptError> {
    config.response_templates
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| PromptError::TemplateNotFound(format!("response_templates:{}", key)))
}

/// Substitutes `{name}` placeholders in one pass over the template, so text
/// inside a value is never substituted again. Unknown placeholders stay as is.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let known = after
            .find('}')
            .map(|end| &after[..end])
            .and_then(|name| values.iter().find(|(key, _)| *key == name));
        match known {
            Some((name, value)) => {
                out.push_str(value);
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Fills a response template by key, e.g. `render(config, "time_answer", &[("time", "10:30")])`.
pub fn render(
    config: &PromptConfig,
    key: &str,
    values: &[(&str, &str)]
) -> Result<String, PromptError> {
    Ok(fill(get_response_template(config, key)?, values))
}

pub fn get_summary_prompt(config: &PromptConfig, conversation: &str) -> Result<String, PromptError> {
    let template = get_query_template(config, "history_summary")?;
    Ok(fill(template, &[("conversation", conversation)]))
}

pub fn get_chat_prompt(
    config: &PromptConfig,
    context_note: &str,
    summary: Option<&str>,
    history: &str,
    message: &str
) -> Result<String, PromptError> {
    let template = get_response_template(config, "chat_reply")?;

    let context_block = if context_note.is_empty() {
        String::new()
    } else {
        format!("{}\n\n", context_note)
    };
    let summary_block = match summary {
        Some(s) if !s.trim().is_empty() => render(config, "summary_block", &[("summary", s.trim())])?,
        _ => String::new(),
    };
    let history_block = if history.is_empty() {
        String::new()
    } else {
        render(config, "history_block", &[("history", history)])?
    };

    Ok(
        fill(
            template,
            &[
                ("persona", &config.persona),
                ("context_note", &context_block),
                ("summary", &summary_block),
                ("history", &history_block),
                ("message", message),
            ]
        )
    )
}
