//! Built-in demo server, served over stdio by `capstan serve-demo`.

use capstan_mcp::protocol::{
    PromptArgument, PromptMessage, PropertySchema, Resource, ToolInputSchema,
};
use capstan_mcp::server::BoxError;
use capstan_mcp::{McpError, McpServer, ServerPrompt, ServerTool};
use serde_json::{Map, Value, json};

/// Build the demo server.
///
/// `test` mode publishes only deterministic tools; any other mode adds `clock`.
pub fn demo_server(mode: &str) -> Result<McpServer, McpError> {
    let server = McpServer::new("capstan-demo", env!("CARGO_PKG_VERSION"));

    server.register_tool(ServerTool::new(
        "echo",
        "Echo the given text back",
        ToolInputSchema::new(
            [("text", PropertySchema::new("string", "Text to echo"))],
            ["text"],
        )?,
        |args| Ok(args.get("text").cloned().unwrap_or(Value::Null)),
    ));

    server.register_tool(ServerTool::new(
        "add",
        "Add two numbers",
        ToolInputSchema::new(
            [
                ("a", PropertySchema::new("number", "First addend")),
                ("b", PropertySchema::new("number", "Second addend")),
            ],
            ["a", "b"],
        )?,
        add,
    ));

    server.register_tool(ServerTool::new(
        "fail",
        "Always fails with the given reason",
        ToolInputSchema::new(
            [("reason", PropertySchema::new("string", "Failure message"))],
            Vec::<String>::new(),
        )?,
        |args| {
            let reason = args
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("demo failure");
            Err(reason.into())
        },
    ));

    if mode != "test" {
        server.register_tool(ServerTool::new(
            "clock",
            "Current UTC time",
            ToolInputSchema::empty(),
            |_| Ok(json!(chrono::Utc::now().to_rfc3339())),
        ));
    }

    server.register_resource(Resource {
        uri: "demo://readme".into(),
        name: "readme".into(),
        description: "About the demo server".into(),
        resource_type: "text".into(),
        mime_type: Some("text/plain".into()),
        text: Some(format!("capstan demo server ({mode} mode)")),
    });

    server.register_prompt(ServerPrompt::new(
        "explain",
        "Ask for an explanation of a topic",
        vec![
            PromptArgument {
                name: "topic".into(),
                description: "What to explain".into(),
                required: true,
            },
            PromptArgument {
                name: "audience".into(),
                description: "Who the explanation is for".into(),
                required: false,
            },
        ],
        |args| {
            let audience = args.get("audience").map_or("a newcomer", String::as_str);
            Ok(vec![PromptMessage::user(format!(
                "Explain {} to {audience}.",
                args["topic"]
            ))])
        },
    ));

    Ok(server)
}

fn add(args: &Map<String, Value>) -> Result<Value, BoxError> {
    let (Some(a), Some(b)) = (args.get("a"), args.get("b")) else {
        return Err("both 'a' and 'b' are required".into());
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| "integer overflow".into());
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err("'a' and 'b' must be numbers".into()),
    }
}
