use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults;
use crate::error::{BridgeError, Result};
use crate::protocol::NAMESPACE_SEPARATOR;
use crate::transport::Endpoint;

/// Embedded handler configuration
///
/// Provides:
/// - Serde support for loading from files/env
/// - Builder methods for customization
/// - Defaults from [`defaults`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Prefix for every tool this handler registers
    pub app_name: String,

    /// Proxy endpoint, `tcp://host:port`
    pub endpoint: String,

    /// Reconnect automatically after a failed connect or a dropped link
    pub auto_reconnect: bool,

    /// First reconnect delay (milliseconds)
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap (milliseconds)
    pub reconnect_max_ms: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            app_name: defaults::DEFAULT_APP_NAME.to_string(),
            endpoint: defaults::DEFAULT_ENDPOINT.to_string(),
            auto_reconnect: true,
            reconnect_initial_ms: defaults::DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_ms: defaults::DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

impl HandlerConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_ms = saturating_millis(initial);
        self.reconnect_max_ms = saturating_millis(max);
        self
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// Parsed endpoint
    pub fn endpoint(&self) -> Result<Endpoint> {
        self.endpoint
            .parse()
            .map_err(|e| BridgeError::Config(format!("endpoint '{}': {e}", self.endpoint)))
    }

    pub fn validate(&self) -> Result<()> {
        validate_app_name(&self.app_name)?;
        self.endpoint()?;
        if self.reconnect_initial_ms == 0 {
            return Err(BridgeError::Config(
                "reconnect_initial_ms must be greater than zero".to_string(),
            ));
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(BridgeError::Config(format!(
                "reconnect_max_ms ({}) is below reconnect_initial_ms ({})",
                self.reconnect_max_ms, self.reconnect_initial_ms
            )));
        }
        Ok(())
    }
}

/// Proxy-side router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Address to accept handler connections on
    pub listen_addr: String,

    /// Deadline for invocations that don't pass one explicitly (milliseconds)
    pub invoke_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_addr: defaults::DEFAULT_LISTEN_ADDR.to_string(),
            invoke_timeout_ms: defaults::DEFAULT_INVOKE_TIMEOUT_MS,
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(BridgeError::Config("listen_addr is empty".to_string()));
        }
        if self.invoke_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "invoke_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whole milliseconds in `duration`, clamped to `u64::MAX`
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn validate_app_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(BridgeError::Config("app_name is empty".to_string()));
    }
    if name.contains(NAMESPACE_SEPARATOR) {
        return Err(BridgeError::Config(format!(
            "app_name '{name}' must not contain '{NAMESPACE_SEPARATOR}'"
        )));
    }
    Ok(())
}
