use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use rust_mcp_sdk::schema::{
    ContentBlock, GetPromptResult, ListPromptsResult, Prompt, PromptMessage, Role, TextContent,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::error;

use super::{panic_message, Catalog, ListChanged};
use crate::errors::ProtocolError;
use crate::mcp::pagination::paginate;

/// Single text message in a rendered prompt.
pub fn text_message(role: Role, text: impl Into<String>) -> PromptMessage {
    PromptMessage {
        content: ContentBlock::from(TextContent::new(text.into(), None, None)),
        role,
    }
}

type PromptHandlerFn = Arc<
    dyn Fn(Value) -> BoxFuture<'static, Result<Vec<PromptMessage>, ProtocolError>> + Send + Sync,
>;

pub(crate) struct PromptEntry {
    prompt: Prompt,
    handler: PromptHandlerFn,
}

impl Catalog {
    /// Registers a prompt whose arguments decode into `A`.
    pub fn register_prompt<A, E, F, Fut>(&self, prompt: Prompt, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<PromptMessage>, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: PromptHandlerFn = Arc::new(move |arguments: Value| {
            let handler = handler.clone();
            async move {
                let arguments: A = serde_json::from_value(arguments).map_err(|err| {
                    ProtocolError::invalid_params(format!("failed to unmarshal arguments: {err}"))
                })?;
                handler(arguments)
                    .await
                    .map_err(|err| ProtocolError::internal(err.to_string()))
            }
            .boxed()
        });

        let name = prompt.name.clone();
        self.mutate(ListChanged::Prompts, move |registries| {
            registries.prompts.insert(
                name,
                PromptEntry {
                    prompt,
                    handler: erased,
                },
            );
            true
        });
    }

    pub fn deregister_prompt(&self, name: &str) -> bool {
        self.mutate(ListChanged::Prompts, |registries| {
            registries.prompts.shift_remove(name).is_some()
        })
    }

    pub fn list_prompts(
        &self,
        cursor: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<ListPromptsResult, ProtocolError> {
        let entries = {
            let registries = self.read();
            registries
                .prompts
                .iter()
                .map(|(name, entry)| (name.clone(), entry.prompt.clone()))
                .collect()
        };
        let page = paginate(entries, cursor, page_size)?;

        Ok(ListPromptsResult {
            meta: None,
            next_cursor: page.next_cursor,
            prompts: page.items,
        })
    }

    /// Renders a prompt. Missing required arguments are rejected before the
    /// handler runs; a panicking handler yields an internal error.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<GetPromptResult, ProtocolError> {
        let entry = {
            let registries = self.read();
            registries
                .prompts
                .get(name)
                .map(|entry| (entry.prompt.clone(), entry.handler.clone()))
        };
        let (prompt, handler) =
            entry.ok_or_else(|| ProtocolError::UnknownPrompt(name.to_string()))?;

        let arguments = arguments.unwrap_or_default();
        if let Some(missing) = prompt.arguments.iter().find(|argument| {
            argument.required.unwrap_or(false) && !arguments.contains_key(&argument.name)
        })
        {
            return Err(ProtocolError::invalid_params(format!(
                "missing required argument: {}",
                missing.name
            )));
        }

        match AssertUnwindSafe(handler(Value::Object(arguments)))
            .catch_unwind()
            .await
        {
            Ok(messages) => Ok(GetPromptResult {
                description: prompt.description,
                messages: messages?,
                meta: None,
            }),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(prompt = %name, panic = %message, "prompt handler panicked");
                Err(ProtocolError::internal(format!(
                    "prompt {name} panicked: {message}"
                )))
            }
        }
    }
}
