//! Interactive routing proxy for the CLI
//!
//! Accepts handler connections and reads commands from stdin:
//!
//! - `list` - every registered tool
//! - `apps` - bound application names
//! - `<app:tool> [json-args]` - invoke a tool

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use toolbridge_core::events::EventSink;
use toolbridge_core::protocol::{ToolArgs, ToolDefinition, ToolResult};
use toolbridge_core::{BridgeError, Router, RouterConfig};

/// A parsed stdin command
#[derive(Debug, PartialEq)]
enum Command {
    List,
    Apps,
    Invoke { tool: String, args: Option<ToolArgs> },
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match head {
        "list" => Ok(Some(Command::List)),
        "apps" => Ok(Some(Command::Apps)),
        tool => {
            let args = if rest.is_empty() {
                None
            } else {
                match serde_json::from_str::<Value>(rest) {
                    Ok(Value::Object(map)) => Some(map),
                    Ok(Value::Null) => None,
                    Ok(_) => return Err("arguments must be a JSON object".to_string()),
                    Err(e) => return Err(format!("invalid JSON arguments: {e}")),
                }
            };
            Ok(Some(Command::Invoke {
                tool: tool.to_string(),
                args,
            }))
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Output<'a> {
    Tools { tools: &'a [ToolDefinition] },
    Apps { apps: &'a [String] },
    Result { tool: &'a str, result: &'a ToolResult },
    Error { message: String },
}

fn print_output(output: &Output<'_>, json_output: bool) {
    if json_output {
        match serde_json::to_string(output) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("Failed to encode output: {}", e),
        }
        return;
    }

    match output {
        Output::Tools { tools } if tools.is_empty() => println!("(no tools registered)"),
        Output::Tools { tools } => {
            for tool in *tools {
                if tool.description.is_empty() {
                    println!("{}", tool.name);
                } else {
                    println!("{} - {}", tool.name, tool.description);
                }
            }
        }
        Output::Apps { apps } if apps.is_empty() => println!("(no applications connected)"),
        Output::Apps { apps } => {
            for app in *apps {
                println!("{app}");
            }
        }
        Output::Result { tool, result } if result.success => {
            println!("{tool} -> {}", result.payload());
        }
        Output::Result { tool, result } => {
            println!(
                "{tool} failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        Output::Error { message } => println!("Error: {message}"),
    }
}

async fn run_command(router: &Router, command: Command, json_output: bool) {
    match command {
        Command::List => {
            let tools = router.list_tools();
            print_output(&Output::Tools { tools: &tools }, json_output);
        }
        Command::Apps => {
            let apps = router.apps();
            print_output(&Output::Apps { apps: &apps }, json_output);
        }
        Command::Invoke { tool, args } => match router.invoke_tool(&tool, args).await {
            Ok(result) => print_output(
                &Output::Result {
                    tool: &tool,
                    result: &result,
                },
                json_output,
            ),
            Err(e) => {
                if !matches!(e, BridgeError::InvalidArgument(_)) {
                    tracing::warn!("Invocation of {} failed: {}", tool, e);
                }
                print_output(
                    &Output::Error {
                        message: e.to_string(),
                    },
                    json_output,
                );
            }
        },
    }
}

/// Run the router until stdin closes or Ctrl-C
pub async fn run_proxy<E: EventSink + 'static>(
    config: RouterConfig,
    event_sink: E,
    json_output: bool,
) -> Result<(), String> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| format!("Failed to listen on {}: {e}", config.listen_addr))?;
    let router = Router::with_events(config, Arc::new(event_sink)).map_err(String::from)?;

    let shutdown = CancellationToken::new();
    let server = {
        let router = Arc::clone(&router);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { router.serve(listener, shutdown).await })
    };

    let mut stdin_reader = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin_reader.next_line() => {
                match line {
                    Ok(Some(line)) => match parse_command(&line) {
                        Ok(Some(command)) => run_command(&router, command, json_output).await,
                        Ok(None) => {}
                        Err(message) => print_output(&Output::Error { message }, json_output),
                    },
                    Ok(None) => {
                        tracing::info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = server.await {
        tracing::error!("Router task failed: {}", e);
    }
    Ok(())
}
