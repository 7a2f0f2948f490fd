//! Catalog entries the server binary ships with.

use rust_mcp_sdk::{
    macros,
    schema::{Prompt, PromptArgument, Resource, Role},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{text_message, Catalog, ResourceRequest};

pub const SERVER_INFO_URI: &str = "server://info";

#[macros::mcp_tool(name = "echo", description = "Echo the given text back to the caller")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct EchoTool {
    pub text: String,
    pub uppercase: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GreetingArgs {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EchoResult {
    pub text: String,
    pub length: usize,
}

pub fn register_builtin(catalog: &Catalog) {
    catalog.register_tool(EchoTool::tool(), |args: EchoTool| async move {
        let text = if args.uppercase.unwrap_or(false) {
            args.text.to_uppercase()
        } else {
            args.text
        };
        Ok::<_, String>(EchoResult {
            length: text.chars().count(),
            text,
        })
    });

    catalog.register_prompt(
        Prompt {
            arguments: vec![PromptArgument {
                description: Some("Who to greet".to_string()),
                name: "name".to_string(),
                required: Some(false),
                title: None,
            }],
            description: Some("Opening message for a new conversation".to_string()),
            icons: vec![],
            meta: None,
            name: "greeting".to_string(),
            title: None,
        },
        |args: GreetingArgs| async move {
            let name = args.name.unwrap_or_else(|| "there".to_string());
            Ok::<_, String>(vec![text_message(
                Role::User,
                format!("Say hello to {name} and offer to help."),
            )])
        },
    );

    catalog.register_resource(
        Resource {
            annotations: None,
            description: Some("Name and version of this server".to_string()),
            icons: vec![],
            meta: None,
            mime_type: Some("application/json".to_string()),
            name: "Server Info".to_string(),
            size: None,
            title: None,
            uri: SERVER_INFO_URI.to_string(),
        },
        |_request: ResourceRequest| async {
            Ok::<_, String>(
                json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                })
                .to_string(),
            )
        },
    );
}
