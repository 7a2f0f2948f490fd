//! Static resources and URI-template resources.

use std::{collections::BTreeMap, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use rust_mcp_sdk::schema::{
    ListResourceTemplatesResult, ListResourcesResult, ReadResourceContent, ReadResourceResult,
    Resource, ResourceTemplate, TextResourceContents,
};
use tracing::error;

use super::{panic_message, Catalog, ListChanged};
use crate::errors::ProtocolError;
use crate::mcp::pagination::paginate;

/// What a resource handler is asked to produce. `variables` holds the values
/// bound by a matching URI template and is empty for static resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub uri: String,
    pub variables: BTreeMap<String, String>,
}

type ResourceHandlerFn =
    Arc<dyn Fn(ResourceRequest) -> BoxFuture<'static, Result<String, ProtocolError>> + Send + Sync>;

pub(crate) struct ResourceEntry {
    resource: Resource,
    handler: ResourceHandlerFn,
}

pub(crate) struct TemplateEntry {
    template: ResourceTemplate,
    handler: ResourceHandlerFn,
}

fn erase<E, F, Fut>(handler: F) -> ResourceHandlerFn
where
    E: fmt::Display + Send + 'static,
    F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, E>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |request: ResourceRequest| {
        let handler = handler.clone();
        async move {
            handler(request)
                .await
                .map_err(|err| ProtocolError::internal(err.to_string()))
        }
        .boxed()
    })
}

impl Catalog {
    pub fn register_resource<E, F, Fut>(&self, resource: Resource, handler: F)
    where
        E: fmt::Display + Send + 'static,
        F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
    {
        let handler = erase(handler);
        let uri = resource.uri.clone();
        self.mutate(ListChanged::Resources, move |registries| {
            registries
                .resources
                .insert(uri, ResourceEntry { resource, handler });
            true
        });
    }

    pub fn deregister_resource(&self, uri: &str) -> bool {
        self.mutate(ListChanged::Resources, |registries| {
            registries.resources.shift_remove(uri).is_some()
        })
    }

    pub fn register_resource_template<E, F, Fut>(
        &self,
        template: ResourceTemplate,
        handler: F,
    ) where
        E: fmt::Display + Send + 'static,
        F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
    {
        let handler = erase(handler);
        let key = template.uri_template.clone();
        self.mutate(ListChanged::Resources, move |registries| {
            registries
                .templates
                .insert(key, TemplateEntry { template, handler });
            true
        });
    }

    pub fn deregister_resource_template(&self, uri_template: &str) -> bool {
        self.mutate(ListChanged::Resources, |registries| {
            registries.templates.shift_remove(uri_template).is_some()
        })
    }

    pub fn list_resources(
        &self,
        cursor: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<ListResourcesResult, ProtocolError> {
        let entries = {
            let registries = self.read();
            registries
                .resources
                .iter()
                .map(|(uri, entry)| (uri.clone(), entry.resource.clone()))
                .collect()
        };
        let page = paginate(entries, cursor, page_size)?;

        Ok(ListResourcesResult {
            meta: None,
            next_cursor: page.next_cursor,
            resources: page.items,
        })
    }

    pub fn list_resource_templates(
        &self,
        cursor: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<ListResourceTemplatesResult, ProtocolError> {
        let entries = {
            let registries = self.read();
            registries
                .templates
                .iter()
                .map(|(key, entry)| (key.clone(), entry.template.clone()))
                .collect()
        };
        let page = paginate(entries, cursor, page_size)?;

        Ok(ListResourceTemplatesResult {
            meta: None,
            next_cursor: page.next_cursor,
            resource_templates: page.items,
        })
    }

    /// Reads `uri`, preferring an exact resource over a template match.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ProtocolError> {
        let target = {
            let registries = self.read();
            match registries.resources.get(uri) {
                Some(entry) => Some((
                    entry.handler.clone(),
                    entry.resource.mime_type.clone(),
                    BTreeMap::new(),
                )),
                None => registries.templates.values().find_map(|entry| {
                    match_template(&entry.template.uri_template, uri).map(|variables| {
                        (
                            entry.handler.clone(),
                            entry.template.mime_type.clone(),
                            variables,
                        )
                    })
                }),
            }
        };
        let (handler, mime_type, variables) =
            target.ok_or_else(|| ProtocolError::UnknownResource(uri.to_string()))?;

        let request = ResourceRequest {
            uri: uri.to_string(),
            variables,
        };
        let text = match AssertUnwindSafe(handler(request)).catch_unwind().await {
            Ok(text) => text?,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(uri = %uri, panic = %message, "resource handler panicked");
                return Err(ProtocolError::internal(format!(
                    "resource {uri} panicked: {message}"
                )));
            }
        };

        Ok(ReadResourceResult {
            contents: vec![ReadResourceContent::from(TextResourceContents {
                meta: None,
                mime_type,
                text,
                uri: uri.to_string(),
            })],
            meta: None,
        })
    }
}

/// Matches `uri` against a level-1 URI template such as
/// `file:///logs/{date}/{level}`. A variable binds a non-empty run of
/// characters up to the next literal and never spans a `/`.
pub(crate) fn match_template(template: &str, uri: &str) -> Option<BTreeMap<String, String>> {
    let mut variables = BTreeMap::new();
    let mut template = template;
    let mut rest = uri;

    loop {
        let Some(open) = template.find('{') else {
            return (rest == template).then_some(variables);
        };
        rest = rest.strip_prefix(&template[..open])?;

        let close = open + template[open..].find('}')?;
        let name = &template[open + 1..close];
        template = &template[close + 1..];

        let literal = &template[..template.find('{').unwrap_or(template.len())];
        let end = if literal.is_empty() {
            if !template.is_empty() {
                // Adjacent variables are ambiguous.
                return None;
            }
            rest.len()
        } else {
            rest.find(literal)?
        };

        let value = &rest[..end];
        if name.is_empty() || value.is_empty() || value.contains('/') {
            return None;
        }
        variables.insert(name.to_string(), value.to_string());
        rest = &rest[end..];
    }
}
