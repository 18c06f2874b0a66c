use std::error::Error as StdError;
use thiserror::Error;

use crate::config::prompt::PromptError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("prompt configuration error: {0}")]
    Prompt(#[from] PromptError),

    #[error("language model call failed: {0}")]
    Llm(Box<dyn StdError + Send + Sync>),

    #[error("language model returned an empty reply")]
    EmptyReply,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_prompt_errors() {
        let err: AgentError = PromptError::TemplateNotFound("chat_reply".into()).into();
        assert_eq!(err.to_string(), "prompt configuration error: Prompt template 'chat_reply' not found");
    }

    #[test]
    fn converts_into_boxed_errors() {
        let boxed: Box<dyn StdError + Send + Sync> = AgentError::EmptyReply.into();
        assert_eq!(boxed.to_string(), "language model returned an empty reply");
    }
}
