//! Proxy-side router
//!
//! The [`Router`] accepts handler connections, keeps each application's
//! catalog, and issues correlated requests over the right connection.
//! Each [`ProxyConnection`] owns its own [`CorrelationTable`]; when the
//! connection drops every request still waiting on it fails with
//! [`BridgeError::ConnectionLost`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::correlation::{CancelReason, CorrelationTable};
use crate::error::{BridgeError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::protocol::{
    split_namespaced, CorrelationId, Envelope, ToolArgs, ToolDefinition, ToolInvocation,
    ToolResult,
};
use crate::transport::{TcpTransport, Transport, TransportEvents};

/// One handler connection as seen by the proxy
pub struct ProxyConnection {
    id: u64,
    transport: Arc<dyn Transport>,
    table: CorrelationTable,
    app_name: RwLock<Option<String>>,
    tools: RwLock<Vec<ToolDefinition>>,
    peer: Option<SocketAddr>,
}

impl ProxyConnection {
    fn new(id: u64, transport: Arc<dyn Transport>, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            transport,
            table: CorrelationTable::new(),
            app_name: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            peer,
        }
    }

    /// Application name from the last `register` envelope
    pub fn app_name(&self) -> Option<String> {
        self.app_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Catalog from the last `register` or `discover`
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Number of requests awaiting a response
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    fn label(&self) -> String {
        self.app_name()
            .unwrap_or_else(|| format!("connection #{}", self.id))
    }
}

/// Removes a pending entry when the request future is dropped early
struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.remove(self.id) {
            debug!("Request {} dropped before completion", self.id);
        }
    }
}

enum Wake {
    Resolved(std::result::Result<ToolResult, CancelReason>),
    Deadline,
    Cancelled,
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Routes tool invocations to registered applications
pub struct Router {
    config: RouterConfig,
    connections: RwLock<HashMap<String, Arc<ProxyConnection>>>,
    events: Arc<dyn EventSink>,
    next_connection_id: AtomicU64,
}

impl Router {
    pub fn new(config: RouterConfig) -> Result<Arc<Self>> {
        Self::with_events(config, Arc::new(NoOpEventSink))
    }

    pub fn with_events(config: RouterConfig, events: Arc<dyn EventSink>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            connections: RwLock::new(HashMap::new()),
            events,
            next_connection_id: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Accept handler connections until `shutdown` fires
    pub async fn serve(self: &Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Router listening on {}", addr),
            Err(e) => debug!("Router listening (address unavailable: {})", e),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Router shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        self.accept(stream);
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
        }

        for connection in self.drain_connections() {
            connection.transport.disconnect().await;
        }
    }

    /// Take ownership of an accepted stream
    pub fn accept(self: &Arc<Self>, stream: TcpStream) -> Arc<ProxyConnection> {
        let (transport, events) = TcpTransport::from_stream(stream);
        let peer = transport.peer_addr();
        self.attach(Arc::new(transport), events, peer)
    }

    /// Start serving a connection over any transport
    pub fn attach(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        peer: Option<SocketAddr>,
    ) -> Arc<ProxyConnection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(ProxyConnection::new(id, transport, peer));

        let this = Arc::clone(self);
        let worker = Arc::clone(&connection);
        tokio::spawn(async move { this.dispatch(worker, events).await });
        connection
    }

    /// Connection currently bound to `app_name`
    pub fn connection(&self, app_name: &str) -> Option<Arc<ProxyConnection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(app_name)
            .cloned()
    }

    /// Bound application names, sorted
    pub fn apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        apps.sort();
        apps
    }

    /// Union of every bound application's catalog, sorted by name
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let connections: Vec<Arc<ProxyConnection>> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut tools: Vec<ToolDefinition> =
            connections.iter().flat_map(|c| c.tools()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Invoke `app:tool` on the application named by its prefix, with the
    /// configured default deadline
    pub async fn invoke_tool(&self, tool: &str, args: Option<ToolArgs>) -> Result<ToolResult> {
        let (app_name, _) = split_namespaced(tool).ok_or_else(|| {
            BridgeError::InvalidArgument(format!("'{tool}' is not of the form app:tool"))
        })?;
        let connection = self
            .connection(app_name)
            .ok_or_else(|| BridgeError::InvalidArgument(format!("Unknown application: {app_name}")))?;

        self.invoke(&connection, tool, args, self.config.invoke_timeout(), None)
            .await
    }

    /// Invoke `tool` over `connection` and wait for its response.
    ///
    /// The pending entry is registered before the envelope is written and is
    /// gone again on every exit path, including the returned future being
    /// dropped. Tool-level failures come back as `Ok` with
    /// `success == false`.
    pub async fn invoke(
        &self,
        connection: &ProxyConnection,
        tool: &str,
        args: Option<ToolArgs>,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolResult> {
        if tool.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "tool name must not be empty".to_string(),
            ));
        }

        let tool = tool.to_string();
        self.request(
            connection,
            move |correlation_id| {
                Envelope::from(ToolInvocation {
                    correlation_id,
                    tool,
                    parameters: args,
                })
            },
            deadline,
            cancel,
        )
        .await
    }

    /// Ask the handler behind `connection` for its current catalog
    pub async fn discover(&self, connection: &ProxyConnection) -> Result<Vec<ToolDefinition>> {
        let result = self
            .request(
                connection,
                |correlation_id| Envelope::Discover { correlation_id },
                self.config.invoke_timeout(),
                None,
            )
            .await?;

        if !result.success {
            return Err(BridgeError::InvalidArgument(format!(
                "discover rejected by {}: {}",
                connection.label(),
                result.error.unwrap_or_default()
            )));
        }
        let tools: Vec<ToolDefinition> = serde_json::from_value(result.payload().clone())?;
        *connection.tools.write().unwrap_or_else(|e| e.into_inner()) = tools.clone();
        Ok(tools)
    }

    async fn request(
        &self,
        connection: &ProxyConnection,
        build: impl FnOnce(CorrelationId) -> Envelope,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolResult> {
        let table = &connection.table;
        let id = table.next_id();
        let mut handle = table.register(id)?;
        let _guard = PendingGuard { table, id };

        let envelope = build(id);
        let frame = envelope.to_frame()?;
        debug!("Sending {} {} to {}", envelope.kind(), id, connection.label());
        connection.transport.send(&frame).await?;

        let wake = tokio::select! {
            outcome = &mut handle => Wake::Resolved(outcome),
            _ = tokio::time::sleep(deadline) => Wake::Deadline,
            _ = wait_cancelled(cancel) => Wake::Cancelled,
        };

        // Whichever removal wins decides the outcome; a response that beat
        // the deadline is still delivered
        let outcome = match wake {
            Wake::Resolved(outcome) => outcome,
            Wake::Deadline => {
                table.cancel(id, CancelReason::Timeout(deadline));
                handle.await
            }
            Wake::Cancelled => {
                table.cancel(id, CancelReason::Cancelled);
                handle.await
            }
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(CancelReason::Timeout(after)) => {
                warn!("Request {} to {} timed out after {:?}", id, connection.label(), after);
                Err(BridgeError::Timeout(after))
            }
            Err(CancelReason::Cancelled) | Err(CancelReason::Abandoned) => {
                Err(BridgeError::Cancelled)
            }
            Err(CancelReason::ConnectionLost) => Err(BridgeError::ConnectionLost),
        }
    }

    /// Per-connection worker: bind registrations, complete responses, and
    /// clean up after the drop
    async fn dispatch(self: Arc<Self>, connection: Arc<ProxyConnection>, mut events: TransportEvents) {
        while let Some(frame) = events.next_message().await {
            match Envelope::parse(&frame) {
                Ok(Envelope::Register { app_name, tools }) => {
                    self.bind(&connection, app_name, tools).await;
                }
                Ok(Envelope::Response {
                    correlation_id,
                    success,
                    result,
                    error,
                }) => {
                    connection.table.complete(
                        correlation_id,
                        ToolResult {
                            success,
                            result,
                            error,
                        },
                    );
                }
                Ok(other) => debug!(
                    "Ignoring unexpected {} envelope from {}",
                    other.kind(),
                    connection.label()
                ),
                Err(e) => warn!("Dropping malformed frame from {}: {}", connection.label(), e),
            }
        }

        let reason = events.disconnected().await;
        let cancelled = connection.table.clear_all(CancelReason::ConnectionLost);
        info!(
            "{} disconnected ({}), {} pending requests failed",
            connection.label(),
            reason,
            cancelled
        );

        if let Some(app_name) = connection.app_name() {
            if self.unbind(&app_name, &connection) {
                if let Err(e) = self
                    .events
                    .on_app_disconnected(&app_name, &reason.to_string())
                    .await
                {
                    error!("Event sink failed: {}", e);
                }
            }
        }
    }

    async fn bind(&self, connection: &Arc<ProxyConnection>, app_name: String, tools: Vec<ToolDefinition>) {
        if app_name.trim().is_empty() {
            warn!("Ignoring register envelope with an empty app name");
            return;
        }

        let previous_name = connection
            .app_name
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(app_name.clone());
        *connection.tools.write().unwrap_or_else(|e| e.into_inner()) = tools.clone();

        let stale = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = previous_name.filter(|old| *old != app_name) {
                if connections
                    .get(&old)
                    .is_some_and(|c| Arc::ptr_eq(c, connection))
                {
                    connections.remove(&old);
                }
            }
            connections
                .insert(app_name.clone(), Arc::clone(connection))
                .filter(|previous| !Arc::ptr_eq(previous, connection))
        };

        if let Some(stale) = stale {
            info!("Replacing stale connection for '{}'", app_name);
            stale.transport.disconnect().await;
        }

        info!("Registered '{}' with {} tools", app_name, tools.len());
        if let Err(e) = self.events.on_app_registered(&app_name, &tools).await {
            error!("Event sink failed: {}", e);
        }
    }

    /// Remove `app_name` if it is still bound to `connection`
    fn unbind(&self, app_name: &str, connection: &Arc<ProxyConnection>) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if connections
            .get(app_name)
            .is_some_and(|c| Arc::ptr_eq(c, connection))
        {
            connections.remove(app_name);
            return true;
        }
        false
    }

    fn drain_connections(&self) -> Vec<Arc<ProxyConnection>> {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandlerConfig;
    use crate::handler::EmbeddedHandler;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Harness {
        router: Arc<Router>,
        handler: Arc<EmbeddedHandler>,
        shutdown: CancellationToken,
        port: u16,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start_router() -> (Arc<Router>, CancellationToken, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = Router::new(RouterConfig::new().with_invoke_timeout(Duration::from_secs(5)))
            .unwrap();
        let shutdown = CancellationToken::new();
        {
            let router = Arc::clone(&router);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { router.serve(listener, shutdown).await });
        }
        (router, shutdown, port)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn harness() -> Harness {
        let (router, shutdown, port) = start_router().await;

        let config = HandlerConfig::new("Sample")
            .with_endpoint(format!("tcp://127.0.0.1:{port}"))
            .with_auto_reconnect(false);
        let handler = EmbeddedHandler::new(config, Arc::new(TcpTransport::new())).unwrap();
        handler.register_tool("ping", "Liveness check", json!({"type": "object"}), |_| async {
            Ok(json!("pong"))
        });
        handler.register_tool("sleep", "Sleep for ms", json!({"type": "object"}), |args: Option<ToolArgs>| async move {
            let ms = args
                .as_ref()
                .and_then(|a| a.get("ms"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        });
        handler.register_tool("fail", "Always fails", json!({"type": "object"}), |_| async {
            Err("deliberate failure".to_string())
        });
        handler.connect().await.unwrap();

        wait_until(|| router.apps() == vec!["Sample".to_string()]).await;
        Harness {
            router,
            handler,
            shutdown,
            port,
        }
    }

    fn args(value: Value) -> Option<ToolArgs> {
        value.as_object().cloned()
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let h = harness().await;

        let result = h.router.invoke_tool("Sample:ping", None).await.unwrap();
        assert_eq!(result, ToolResult::success(json!("pong")));

        let failed = h.router.invoke_tool("Sample:fail", None).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("deliberate failure"));

        let missing = h.router.invoke_tool("Sample:nope", None).await.unwrap();
        assert_eq!(missing.error.as_deref(), Some("Tool not found: Sample:nope"));

        assert_eq!(h.router.connection("Sample").unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_catalog_is_aggregated() {
        let h = harness().await;
        let names: Vec<String> = h.router.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["Sample:fail", "Sample:ping", "Sample:sleep"]);

        let connection = h.router.connection("Sample").unwrap();
        let discovered = h.router.discover(&connection).await.unwrap();
        assert_eq!(discovered.len(), 3);
        assert!(connection.peer().is_some());
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_entry() {
        let h = harness().await;
        let connection = h.router.connection("Sample").unwrap();

        let err = h
            .router
            .invoke(
                &connection,
                "Sample:sleep",
                args(json!({"ms": 300})),
                Duration::from_millis(50),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(connection.pending(), 0);

        // The late response is dropped and the connection keeps working
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connection.pending(), 0);
        let result = h.router.invoke_tool("Sample:ping", None).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let h = harness().await;
        let connection = h.router.connection("Sample").unwrap();
        let token = CancellationToken::new();
        {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            });
        }

        let err = h
            .router
            .invoke(
                &connection,
                "Sample:sleep",
                args(json!({"ms": 2000})),
                Duration::from_secs(10),
                Some(&token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert_eq!(connection.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_invoke_future_removes_entry() {
        let h = harness().await;
        let connection = h.router.connection("Sample").unwrap();

        let outer = tokio::time::timeout(
            Duration::from_millis(30),
            h.router.invoke(
                &connection,
                "Sample:sleep",
                args(json!({"ms": 500})),
                Duration::from_secs(10),
                None,
            ),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(connection.pending(), 0);
    }

    #[tokio::test]
    async fn test_responses_complete_out_of_order() {
        let h = harness().await;
        let connection = h.router.connection("Sample").unwrap();

        let slow = h.router.invoke(
            &connection,
            "Sample:sleep",
            args(json!({"ms": 200})),
            Duration::from_secs(5),
            None,
        );
        let fast = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = h.router.invoke_tool("Sample:ping", None).await.unwrap();
            // The fast call resolves while the slow one is still pending
            assert_eq!(connection.pending(), 1);
            result
        };
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap().payload(), &json!(200));
        assert_eq!(fast.payload(), &json!("pong"));
        assert_eq!(connection.pending(), 0);
    }

    #[tokio::test]
    async fn test_connection_drop_fails_pending_requests() {
        let h = harness().await;
        let connection = h.router.connection("Sample").unwrap();

        let handler = Arc::clone(&h.handler);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handler.disconnect().await;
        });

        let err = h
            .router
            .invoke(
                &connection,
                "Sample:sleep",
                args(json!({"ms": 2000})),
                Duration::from_secs(10),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionLost));
        assert_eq!(connection.pending(), 0);

        wait_until(|| h.router.apps().is_empty()).await;
    }

    #[tokio::test]
    async fn test_invoke_while_disconnected() {
        let h = harness().await;
        let connection = h.router.connection("Sample").unwrap();

        h.handler.disconnect().await;
        wait_until(|| !connection.is_connected()).await;

        let err = h
            .router
            .invoke(&connection, "Sample:ping", None, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(connection.pending(), 0);
    }

    #[tokio::test]
    async fn test_argument_errors() {
        let h = harness().await;
        let connection = h.router.connection("Sample").unwrap();

        let err = h
            .router
            .invoke(&connection, "  ", None, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let err = h.router.invoke_tool("Other:ping", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let err = h.router.invoke_tool("ping", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
        assert_eq!(connection.pending(), 0);
    }

    #[tokio::test]
    async fn test_raw_client_wire_exchange() {
        let h = harness().await;

        let stream = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"type\":\"register\",\"appName\":\"Raw\",\"tools\":[{\"name\":\"Raw:add\"}]}\n")
            .await
            .unwrap();
        wait_until(|| h.router.apps().contains(&"Raw".to_string())).await;

        let responder = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["type"], "invoke");
            assert_eq!(request["tool"], "Raw:add");
            let id = request["correlationId"].as_u64().unwrap();
            let sum = request["parameters"]["a"].as_i64().unwrap()
                + request["parameters"]["b"].as_i64().unwrap();

            // An unknown id first, then the real answer split across writes
            let reply = format!(
                "{{\"type\":\"toolResponse\",\"correlationId\":999,\"success\":true}}\n{{\"type\":\"response\",\"correlationId\":{id},\"success\":true,\"result\":{sum}}}\n"
            );
            let (head, tail) = reply.as_bytes().split_at(reply.len() - 7);
            write_half.write_all(head).await.unwrap();
            write_half.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write_half.write_all(tail).await.unwrap();
            write_half
        });

        let result = h
            .router
            .invoke_tool("Raw:add", args(json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(result, ToolResult::success(json!(5)));
        let _write_half = responder.await.unwrap();

        let names: Vec<String> = h.router.list_tools().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"Raw:add".to_string()));
    }

    #[tokio::test]
    async fn test_reregistration_replaces_stale_connection() {
        let h = harness().await;
        let first = h.router.connection("Sample").unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        stream
            .write_all(b"{\"type\":\"register\",\"appName\":\"Sample\",\"tools\":[]}\n")
            .await
            .unwrap();

        wait_until(|| {
            h.router
                .connection("Sample")
                .is_some_and(|c| !Arc::ptr_eq(&c, &first))
        })
        .await;
        wait_until(|| !first.is_connected()).await;
        assert_eq!(h.router.apps(), vec!["Sample".to_string()]);
        assert!(h.router.list_tools().is_empty());
    }
}
