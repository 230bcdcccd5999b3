//! Demo agent for the CLI
//!
//! Hosts a handful of tools inside an embedded handler so a proxy has
//! something to call.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use toolbridge_core::events::EventSink;
use toolbridge_core::protocol::ToolArgs;
use toolbridge_core::{EmbeddedHandler, HandlerConfig, TcpTransport};

fn string_arg(args: &Option<ToolArgs>, key: &str) -> Option<String> {
    args.as_ref()?.get(key)?.as_str().map(str::to_string)
}

/// Register the demo tools: `ping`, `echo`, `sleep` and `fail`
pub fn register_demo_tools(handler: &EmbeddedHandler) {
    handler.register_tool(
        "ping",
        "Liveness check, returns \"pong\"",
        json!({"type": "object", "properties": {}}),
        |_| async { Ok(json!("pong")) },
    );

    handler.register_tool(
        "echo",
        "Return the given text",
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }),
        |args: Option<ToolArgs>| async move {
            match string_arg(&args, "text") {
                Some(text) => Ok(Value::String(text)),
                None => Err("missing required argument: text".to_string()),
            }
        },
    );

    handler.register_tool(
        "sleep",
        "Wait for the given number of milliseconds",
        json!({
            "type": "object",
            "properties": {"ms": {"type": "integer", "minimum": 0}}
        }),
        |args: Option<ToolArgs>| async move {
            let ms = args
                .as_ref()
                .and_then(|a| a.get("ms"))
                .and_then(Value::as_u64)
                .unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        },
    );

    handler.register_tool(
        "fail",
        "Always fails with the given message",
        json!({
            "type": "object",
            "properties": {"message": {"type": "string"}}
        }),
        |args: Option<ToolArgs>| async move {
            Err(string_arg(&args, "message").unwrap_or_else(|| "requested failure".to_string()))
        },
    );
}

/// Run the demo agent until Ctrl-C
pub async fn run_agent<E: EventSink + 'static>(
    config: HandlerConfig,
    event_sink: E,
) -> Result<(), String> {
    let auto_reconnect = config.auto_reconnect;
    let handler = EmbeddedHandler::with_events(
        config,
        Arc::new(TcpTransport::new()),
        Arc::new(event_sink),
    )
    .map_err(String::from)?;
    register_demo_tools(&handler);

    tracing::info!(
        "Hosting {} tools as '{}'",
        handler.list_tools().len(),
        handler.app_name()
    );

    if let Err(e) = handler.connect().await {
        if !auto_reconnect {
            return Err(e.to_string());
        }
        tracing::warn!("Initial connect failed, retrying in the background: {}", e);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }
    tracing::info!("Shutting down");
    handler.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolbridge_core::protocol::{ToolInvocation, ToolResult};

    fn handler() -> Arc<EmbeddedHandler> {
        let handler =
            EmbeddedHandler::new(HandlerConfig::new("Demo"), Arc::new(TcpTransport::new()))
                .unwrap();
        register_demo_tools(&handler);
        handler
    }

    fn invocation(tool: &str, parameters: Value) -> ToolInvocation {
        ToolInvocation {
            correlation_id: 1,
            tool: tool.to_string(),
            parameters: parameters.as_object().cloned(),
        }
    }

    #[test]
    fn test_demo_catalog() {
        let names: Vec<String> = handler().list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["Demo:echo", "Demo:fail", "Demo:ping", "Demo:sleep"]);
    }

    #[tokio::test]
    async fn test_demo_tools() {
        let handler = handler();

        let echo = handler
            .execute_tool(&invocation("Demo:echo", json!({"text": "hi"})))
            .await;
        assert_eq!(echo, ToolResult::success(json!("hi")));

        let missing = handler
            .execute_tool(&invocation("Demo:echo", json!({})))
            .await;
        assert!(!missing.success);

        let fail = handler
            .execute_tool(&invocation("Demo:fail", json!({"message": "nope"})))
            .await;
        assert_eq!(fail, ToolResult::failure("nope"));

        let slept = handler
            .execute_tool(&invocation("Demo:sleep", json!({"ms": 1})))
            .await;
        assert_eq!(slept.payload()["slept_ms"], 1);
    }
}
