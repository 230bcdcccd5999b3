//! Embedded handler
//!
//! The agent side of the bridge. An [`EmbeddedHandler`] owns a namespaced
//! [`ToolRegistry`], keeps one connection to the proxy alive, announces its
//! catalog after every (re)connect and answers `invoke` and `discover`
//! envelopes.
//!
//! Each connection gets one dispatch worker consuming the transport's
//! message channel in order. Every invocation runs on its own task, so a
//! slow tool never blocks later frames; only the physical write is
//! serialized (inside the transport).

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::HandlerConfig;
use crate::error::Result;
use crate::events::{EventSink, NoOpEventSink};
use crate::protocol::{CorrelationId, Envelope, ToolArgs, ToolDefinition, ToolInvocation, ToolResult};
use crate::registry::{ToolHandler, ToolRegistry};
use crate::state::{ConnectionState, StateCell};
use crate::transport::{Endpoint, Transport, TransportEvents};

/// Agent-side endpoint hosting tools for a remote proxy
pub struct EmbeddedHandler {
    config: HandlerConfig,
    endpoint: Endpoint,
    registry: ToolRegistry,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
    state: StateCell,
    /// Set by an explicit `disconnect()`, cleared by `connect()`
    stopped: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    /// Id and token of the running reconnection loop, if any
    reconnect_loop: Mutex<Option<(u64, CancellationToken)>>,
    next_loop_id: AtomicU64,
    /// Bumped on every established connection; stale dispatch workers
    /// compare against it
    connection_gen: AtomicU64,
}

impl EmbeddedHandler {
    pub fn new(config: HandlerConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        Self::with_events(config, transport, Arc::new(NoOpEventSink))
    }

    pub fn with_events(
        config: HandlerConfig,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        Ok(Arc::new(Self {
            registry: ToolRegistry::new(config.app_name.clone()),
            config,
            endpoint,
            transport,
            events,
            state: StateCell::new(),
            stopped: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            reconnect_loop: Mutex::new(None),
            next_loop_id: AtomicU64::new(1),
            connection_gen: AtomicU64::new(0),
        }))
    }

    pub fn app_name(&self) -> &str {
        self.registry.app_name()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get().is_connected() && self.transport.is_connected()
    }

    /// Observe connection state changes
    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Register a tool under `{app_name}:{name}`. Re-registering replaces the
    /// previous definition. Tools registered while connected are announced on
    /// the next (re)connect.
    pub fn register_tool<F, Fut>(
        &self,
        name: &str,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> String
    where
        F: Fn(Option<ToolArgs>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.registry
            .register_tool(name, description, input_schema, handler)
    }

    pub fn register_handler(
        &self,
        name: &str,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> String {
        self.registry
            .register_handler(name, description, input_schema, handler)
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.registry.list_tools()
    }

    pub async fn execute_tool(&self, invocation: &ToolInvocation) -> ToolResult {
        self.registry.execute(invocation).await
    }

    /// Make one connection attempt and announce the catalog.
    ///
    /// On failure the state returns to `Disconnected`; with auto-reconnect
    /// enabled the reconnection loop takes over in the background.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            debug!("Already connected to {}", self.endpoint);
            return Ok(());
        }
        self.stopped.store(false, Ordering::SeqCst);
        {
            let mut token = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        // This attempt supersedes any running loop; a failure starts a fresh one
        self.retire_reconnect_loop();

        self.set_state(ConnectionState::Connecting).await;
        match self.establish().await {
            Ok(events) => {
                self.on_connected(events).await;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.endpoint, e);
                self.set_state(ConnectionState::Disconnected).await;
                if self.config.auto_reconnect {
                    self.start_reconnect_loop();
                }
                Err(e)
            }
        }
    }

    /// Stop reconnecting and close the connection. Terminal until the next
    /// `connect()`.
    pub async fn disconnect(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.retire_reconnect_loop();

        self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected).await;
        info!("Handler '{}' disconnected", self.app_name());
    }

    /// Connect the transport and send the registration envelope
    async fn establish(&self) -> Result<TransportEvents> {
        let events = self.transport.connect(&self.endpoint).await?;

        let register = Envelope::Register {
            app_name: self.app_name().to_string(),
            tools: self.registry.list_tools(),
        };
        if let Err(e) = self.send_envelope(&register).await {
            self.transport.disconnect().await;
            return Err(e);
        }

        info!(
            "Registered '{}' with {} tools at {}",
            self.app_name(),
            self.registry.len(),
            self.endpoint
        );
        Ok(events)
    }

    async fn on_connected(self: &Arc<Self>, events: TransportEvents) {
        let generation = self.connection_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connected).await;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch(events, generation).await });
    }

    /// Start the reconnection loop unless one is already running
    fn start_reconnect_loop(self: &Arc<Self>) {
        let (id, token) = {
            let mut running = self
                .reconnect_loop
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if running.is_some() {
                debug!("Reconnection loop already running");
                return;
            }
            let id = self.next_loop_id.fetch_add(1, Ordering::Relaxed);
            let token = self
                .shutdown
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .child_token();
            *running = Some((id, token.clone()));
            (id, token)
        };

        let this = Arc::clone(self);
        tokio::spawn(async move { this.reconnect(id, token).await });
    }

    /// Cancel the running loop, if any, and free its slot
    fn retire_reconnect_loop(&self) {
        let running = self
            .reconnect_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((id, token)) = running {
            debug!("Retiring reconnection loop {}", id);
            token.cancel();
        }
    }

    /// Release the loop slot if it still belongs to loop `id`
    fn finish_reconnect_loop(&self, id: u64) {
        let mut running = self
            .reconnect_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|(current, _)| *current == id) {
            *running = None;
        }
    }

    async fn reconnect(self: Arc<Self>, id: u64, token: CancellationToken) {
        let mut backoff = Backoff::new(self.config.reconnect_initial(), self.config.reconnect_max());
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() || self.transport.is_connected() {
                debug!("Reconnection loop {} no longer needed", id);
                self.finish_reconnect_loop(id);
                return;
            }
            self.set_state(ConnectionState::Reconnecting).await;
            let delay = backoff.next_delay();
            attempt += 1;
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Reconnection loop cancelled");
                    self.finish_reconnect_loop(id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.transport.is_connected() {
                debug!("Transport already connected, stopping reconnection loop {}", id);
                self.finish_reconnect_loop(id);
                return;
            }

            match self.establish().await {
                Ok(events) => {
                    self.finish_reconnect_loop(id);
                    if self.stopped.load(Ordering::SeqCst) {
                        self.transport.disconnect().await;
                        return;
                    }
                    info!("Reconnected after {} attempts", attempt);
                    self.on_connected(events).await;
                    return;
                }
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Per-connection worker: handle frames in order, then react to the drop
    async fn dispatch(self: Arc<Self>, mut events: TransportEvents, generation: u64) {
        while let Some(frame) = events.next_message().await {
            self.handle_frame(&frame);
        }

        let reason = events.disconnected().await;
        if self.stopped.load(Ordering::SeqCst) {
            debug!("Connection closed: {}", reason);
            return;
        }
        if self.connection_gen.load(Ordering::SeqCst) != generation {
            debug!("Superseded connection closed: {}", reason);
            return;
        }

        warn!("Connection to {} lost: {}", self.endpoint, reason);
        if self.config.auto_reconnect {
            self.set_state(ConnectionState::Reconnecting).await;
            self.start_reconnect_loop();
        } else {
            self.set_state(ConnectionState::Disconnected).await;
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: &str) {
        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Invoke {
                correlation_id,
                tool,
                parameters,
            } => {
                let invocation = ToolInvocation {
                    correlation_id,
                    tool,
                    parameters,
                };
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    debug!(
                        "Invoking {} (correlation id {})",
                        invocation.tool, invocation.correlation_id
                    );
                    let result = this.registry.execute(&invocation).await;
                    this.respond(invocation.correlation_id, result).await;
                });
            }
            Envelope::Discover { correlation_id } => {
                let result = match serde_json::to_value(self.registry.list_tools()) {
                    Ok(tools) => ToolResult::success(tools),
                    Err(e) => ToolResult::failure(e.to_string()),
                };
                let this = Arc::clone(self);
                tokio::spawn(async move { this.respond(correlation_id, result).await });
            }
            other => debug!("Ignoring unexpected {} envelope", other.kind()),
        }
    }

    async fn respond(&self, correlation_id: CorrelationId, result: ToolResult) {
        let envelope = Envelope::response(correlation_id, result);
        if let Err(e) = self.send_envelope(&envelope).await {
            // The proxy will time the request out
            warn!(
                "Failed to send response for correlation id {}: {}",
                correlation_id, e
            );
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_frame()?;
        self.transport.send(&frame).await?;
        Ok(())
    }

    async fn set_state(&self, next: ConnectionState) {
        if let Some(previous) = self.state.set(next) {
            debug!("Connection state: {} -> {}", previous, next);
            if let Err(e) = self.events.on_state_changed(previous, next).await {
                error!("Event sink failed: {}", e);
            }
        }
    }
}
