//! Tool registry and invocation with panic containment.

use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use rust_mcp_sdk::schema::{CallToolResult, ContentBlock, ListToolsResult, TextContent, Tool};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use super::{panic_message, Catalog, ListChanged};
use crate::errors::ProtocolError;
use crate::mcp::pagination::paginate;

type ToolHandlerFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<CallToolResult, ProtocolError>> + Send + Sync>;

pub(crate) struct ToolEntry {
    tool: Tool,
    handler: ToolHandlerFn,
}

impl Catalog {
    /// Registers `tool`, replacing any tool of the same name. Arguments are
    /// decoded into `A`; an `Err` from the handler becomes an `isError`
    /// result rather than a protocol error.
    pub fn register_tool<A, R, E, F, Fut>(&self, tool: Tool, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ToolHandlerFn = Arc::new(move |arguments: Value| {
            let handler = handler.clone();
            async move {
                let arguments: A = serde_json::from_value(arguments).map_err(|err| {
                    ProtocolError::invalid_params(format!("failed to unmarshal arguments: {err}"))
                })?;
                match handler(arguments).await {
                    Ok(result) => success_result(result),
                    Err(err) => Ok(error_result(err.to_string())),
                }
            }
            .boxed()
        });

        let name = tool.name.clone();
        self.mutate(ListChanged::Tools, move |registries| {
            registries.tools.insert(
                name,
                ToolEntry {
                    tool,
                    handler: erased,
                },
            );
            true
        });
    }

    /// Returns whether a tool was removed.
    pub fn deregister_tool(&self, name: &str) -> bool {
        self.mutate(ListChanged::Tools, |registries| {
            registries.tools.shift_remove(name).is_some()
        })
    }

    pub fn list_tools(
        &self,
        cursor: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<ListToolsResult, ProtocolError> {
        let entries = {
            let registries = self.read();
            registries
                .tools
                .iter()
                .map(|(name, entry)| (name.clone(), entry.tool.clone()))
                .collect()
        };
        let page = paginate(entries, cursor, page_size)?;

        Ok(ListToolsResult {
            meta: None,
            next_cursor: page.next_cursor,
            tools: page.items,
        })
    }

    /// Invokes a tool. A panic inside the handler is contained and reported
    /// as a failed tool result.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ProtocolError> {
        let handler = {
            let registries = self.read();
            registries.tools.get(name).map(|entry| entry.handler.clone())
        };
        let handler = handler.ok_or_else(|| ProtocolError::UnknownTool(name.to_string()))?;
        let arguments = arguments.unwrap_or_else(|| Value::Object(Map::new()));

        match AssertUnwindSafe(handler(arguments)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(tool = %name, panic = %message, "tool handler panicked");
                Ok(error_result(format!(
                    "internal error: tool {name} panicked: {message}"
                )))
            }
        }
    }
}

fn success_result<R: Serialize>(result: R) -> Result<CallToolResult, ProtocolError> {
    let value = serde_json::to_value(result)?;
    let text = match &value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let structured_content = match value {
        Value::Object(map) => Some(map),
        _ => None,
    };

    Ok(CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: None,
        meta: None,
        structured_content,
    })
}

pub fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(message.into(), None, None))],
        is_error: Some(true),
        meta: None,
        structured_content: None,
    }
}
