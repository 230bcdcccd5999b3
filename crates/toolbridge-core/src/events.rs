//! Event Sink Trait
//!
//! This module provides the EventSink trait for decoupling status reporting
//! from the core. Implementations can write to stdout (CLI), collect events
//! in tests, or forward them anywhere else.

use async_trait::async_trait;
use serde_json::json;

use crate::protocol::ToolDefinition;
use crate::state::ConnectionState;

/// Event sink for handler and router lifecycle events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handler connection state changed
    async fn on_state_changed(
        &self,
        previous: ConnectionState,
        current: ConnectionState,
    ) -> Result<(), String>;

    /// An application registered (or re-registered) its catalog with the router
    async fn on_app_registered(&self, app_name: &str, tools: &[ToolDefinition])
        -> Result<(), String>;

    /// An application's connection to the router ended
    async fn on_app_disconnected(&self, app_name: &str, reason: &str) -> Result<(), String>;
}

/// No-op event sink for testing or embedding without event emission
#[derive(Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn on_state_changed(
        &self,
        _previous: ConnectionState,
        _current: ConnectionState,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn on_app_registered(
        &self,
        _app_name: &str,
        _tools: &[ToolDefinition],
    ) -> Result<(), String> {
        Ok(())
    }

    async fn on_app_disconnected(&self, _app_name: &str, _reason: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout event sink for CLI mode - prints events to console
#[derive(Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn on_state_changed(
        &self,
        previous: ConnectionState,
        current: ConnectionState,
    ) -> Result<(), String> {
        if self.json_output {
            println!(
                "{}",
                json!({"event": "state_changed", "previous": previous, "current": current})
            );
        } else {
            println!("Connection: {previous} -> {current}");
        }
        Ok(())
    }

    async fn on_app_registered(
        &self,
        app_name: &str,
        tools: &[ToolDefinition],
    ) -> Result<(), String> {
        if self.json_output {
            let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            println!(
                "{}",
                json!({"event": "app_registered", "app_name": app_name, "tools": names})
            );
        } else {
            println!("Registered: {app_name} ({} tools)", tools.len());
        }
        Ok(())
    }

    async fn on_app_disconnected(&self, app_name: &str, reason: &str) -> Result<(), String> {
        if self.json_output {
            println!(
                "{}",
                json!({"event": "app_disconnected", "app_name": app_name, "reason": reason})
            );
        } else {
            println!("Disconnected: {app_name} ({reason})");
        }
        Ok(())
    }
}
