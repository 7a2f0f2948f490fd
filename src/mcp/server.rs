//! The Model Context Protocol server façade
//!
//! Layers the catalog methods (`initialize`, `tools/*`, `prompts/*`,
//! `resources/*`) on top of one [`Protocol`] engine, audits every catalog
//! call and forwards catalog list changes to the connected peer.

use std::{future::Future, sync::Arc, time::Duration};

use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ServerCapabilities, ServerCapabilitiesPrompts,
    ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::context::RequestContext;
use super::protocol::{Protocol, ProtocolOptions};
use crate::catalog::Catalog;
use crate::errors::ProtocolError;
use crate::transport::Transport;

/// Protocol revisions this server speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];
pub const LATEST_PROTOCOL_VERSION: &str = SUPPORTED_PROTOCOL_VERSIONS[0];

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
    /// Listing page size; `None` serves every entry in one page.
    pub page_size: Option<usize>,
    pub request_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            page_size: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    client_info: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GetPromptParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ReadResourceParams {
    uri: String,
}

struct Shared {
    catalog: Arc<Catalog>,
    options: ServerOptions,
}

/// One server-side connection over a shared [`Catalog`].
#[derive(Clone)]
pub struct Server {
    protocol: Protocol,
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(catalog: Arc<Catalog>, options: ServerOptions) -> Self {
        let protocol = Protocol::new(
            ProtocolOptions::default().with_request_timeout(options.request_timeout),
        );
        let server = Self {
            protocol,
            shared: Arc::new(Shared { catalog, options }),
        };
        server.install_handlers();
        server
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.shared.catalog
    }

    /// The underlying engine, for server-initiated requests and notifications.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Connects to `transport` and starts forwarding catalog list changes
    /// until the connection closes.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), ProtocolError> {
        let mut changes = self.shared.catalog.subscribe();
        self.protocol.connect(transport).await?;

        let protocol = self.protocol.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = protocol.closed() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => {
                        if let Err(err) = protocol.notification(change.method(), None).await {
                            debug!(method = change.method(), error = %err, "list change not forwarded");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "list change forwarder lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.protocol.close().await
    }

    fn install_handlers(&self) {
        self.protocol
            .set_request_handler("ping", |_ctx: RequestContext, _: Value| async {
                Ok::<_, ProtocolError>(json!({}))
            });

        self.route("initialize", |shared, params: InitializeParams| async move {
            let protocol_version = negotiate_protocol_version(params.protocol_version.as_deref());
            debug!(client = ?params.client_info, protocol_version, "client initializing");
            Ok(initialize_result(&shared.options, protocol_version))
        });

        self.route("tools/list", |shared, params: ListParams| async move {
            shared
                .catalog
                .list_tools(params.cursor.as_deref(), shared.options.page_size)
        });
        self.route("tools/call", |shared, params: CallToolParams| async move {
            shared.catalog.call_tool(&params.name, params.arguments).await
        });

        self.route("prompts/list", |shared, params: ListParams| async move {
            shared
                .catalog
                .list_prompts(params.cursor.as_deref(), shared.options.page_size)
        });
        self.route("prompts/get", |shared, params: GetPromptParams| async move {
            shared.catalog.get_prompt(&params.name, params.arguments).await
        });

        self.route("resources/list", |shared, params: ListParams| async move {
            shared
                .catalog
                .list_resources(params.cursor.as_deref(), shared.options.page_size)
        });
        self.route(
            "resources/templates/list",
            |shared, params: ListParams| async move {
                shared
                    .catalog
                    .list_resource_templates(params.cursor.as_deref(), shared.options.page_size)
            },
        );
        self.route("resources/read", |shared, params: ReadResourceParams| async move {
            shared.catalog.read_resource(&params.uri).await
        });
    }

    /// Registers an audited catalog method.
    fn route<P, R, F, Fut>(&self, method: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<Shared>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
    {
        let shared = self.shared.clone();
        let handler = Arc::new(handler);
        self.protocol
            .set_request_handler(method, move |_ctx: RequestContext, params: Value| {
                let shared = shared.clone();
                let handler = handler.clone();
                async move {
                    let audit_params = redact_audit_value(&params);
                    let outcome = match serde_json::from_value::<P>(params) {
                        Ok(params) => handler(shared, params).await,
                        Err(err) => Err(ProtocolError::invalid_params(format!(
                            "invalid params: {err}"
                        ))),
                    };

                    info!(
                        method,
                        params = %audit_params,
                        outcome = if outcome.is_ok() { "success" } else { "failure" },
                        "mcp action audited"
                    );
                    outcome
                }
            });
    }
}

/// Echoes the client's revision when supported, else answers with the latest.
pub fn negotiate_protocol_version(offered: Option<&str>) -> &'static str {
    let offered = offered.map(str::trim).unwrap_or_default();
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|version| **version == offered)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

fn initialize_result(options: &ServerOptions, protocol_version: &str) -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: options.name.clone(),
            version: options.version.clone(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(true),
            }),
            resources: Some(ServerCapabilitiesResources {
                subscribe: Some(false),
                list_changed: Some(true),
            }),
            prompts: Some(ServerCapabilitiesPrompts {
                list_changed: Some(true),
            }),
            ..Default::default()
        },
        protocol_version: protocol_version.to_string(),
        instructions: options.instructions.clone(),
        meta: None,
    }
}

fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey" | "private_key"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
