//! Value-proposition extraction over the chat-completions client.

use std::sync::Arc;

use async_trait::async_trait;

use super::schema::{Analysis, PageData};
use super::Analyst;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::{extract_json_object, ChatMessage, ChatOptions, LlmClient, LlmError};

const MAX_CONTEXT_CHARS: usize = 30_000;
const REDUCED_CONTEXT_CHARS: usize = 10_000;

const SYSTEM_PROMPT: &str = "You are a senior tech journalist. Extract the core value proposition \
of this product. Ignore marketing fluff. Reply with a JSON object with exactly these string \
fields: \"hook\" (the problem the product addresses), \"solution\" (what it does about it) and \
\"stack\" (key technologies, or \"unknown\").";

pub struct LlmAnalyst {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LlmAnalyst {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    async fn request(&self, context: &str) -> Result<Option<String>, LlmError> {
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(context)];
        let response = self
            .llm
            .chat_completion(&self.model, &messages, ChatOptions::json())
            .await?;
        Ok(response.content)
    }
}

/// Serialize the page and cut it at `max` characters.
pub(crate) fn page_context(page: &PageData, max: usize) -> String {
    let full = serde_json::to_string(page).unwrap_or_default();
    match full.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...(truncated)", &full[..idx]),
        None => full,
    }
}

/// Parse a model reply into `T`, mapping anything unusable to a schema error.
pub(crate) fn parse_reply<T: serde::de::DeserializeOwned>(
    content: Option<String>,
    what: &str,
) -> PipelineResult<T> {
    let content = content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| PipelineError::Schema(format!("{} reply was empty", what)))?;
    let json = extract_json_object(&content)
        .ok_or_else(|| PipelineError::Schema(format!("{} reply contained no JSON object", what)))?;
    serde_json::from_str(json)
        .map_err(|e| PipelineError::Schema(format!("{} reply did not match schema: {}", what, e)))
}

#[async_trait]
impl Analyst for LlmAnalyst {
    async fn analyze(&self, page: &PageData) -> PipelineResult<Analysis> {
        let context = page_context(page, MAX_CONTEXT_CHARS);
        tracing::debug!(chars = context.len(), "Analyzing page context");

        let content = match self.request(&context).await {
            Ok(content) => content,
            Err(e) if e.is_context_length() => {
                tracing::warn!("Analysis context too long, retrying with {} chars", REDUCED_CONTEXT_CHARS);
                self.request(&page_context(page, REDUCED_CONTEXT_CHARS)).await?
            }
            Err(e) => return Err(e.into()),
        };

        parse_reply(content, "analysis")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError};

    /// Replays canned replies and records every prompt it was sent.
    #[derive(Default)]
    pub struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _options: ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::server_error(500, "script exhausted".into())));
            reply.map(|content| ChatResponse {
                content: Some(content),
                finish_reason: Some("stop".into()),
                usage: None,
                model: None,
            })
        }
    }
}
