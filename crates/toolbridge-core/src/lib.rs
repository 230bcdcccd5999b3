//! Toolbridge Core Library
//!
//! Bidirectional remote tool invocation over newline-delimited JSON.
//! An embedded handler hosts a namespaced catalog of async tools and keeps
//! a connection to a proxy alive; the proxy's router invokes those tools
//! with correlated requests, deadlines and cancellation.
//!
//! # Modules
//!
//! - [`transport`] - Duplex transport abstraction, framing and TCP implementation
//! - [`protocol`] - Wire envelopes and tool types
//! - [`correlation`] - Pending-request table
//! - [`registry`] - Namespaced tool registry
//! - [`handler`] - Agent-side embedded handler with reconnection
//! - [`router`] - Proxy-side router
//! - [`state`] - Connection state
//! - [`backoff`] - Reconnect delay sequence
//! - [`config`] - Handler and router configuration
//! - [`events`] - Event sink trait for decoupling status reporting
//! - [`error`] - Error types

pub mod backoff;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use config::{HandlerConfig, RouterConfig};
pub use correlation::{CancelReason, CorrelationError, CorrelationTable, ResponseHandle};
pub use error::{BridgeError, Result};
pub use events::{EventSink, NoOpEventSink, StdoutEventSink};
pub use handler::EmbeddedHandler;
pub use protocol::{Envelope, ToolArgs, ToolDefinition, ToolInvocation, ToolResult};
pub use registry::{ToolHandler, ToolRegistry};
pub use router::{ProxyConnection, Router};
pub use state::ConnectionState;
pub use transport::{Endpoint, TcpTransport, Transport, TransportError};
