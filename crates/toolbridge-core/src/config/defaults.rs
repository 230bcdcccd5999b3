/// Default application name advertised by a handler
pub const DEFAULT_APP_NAME: &str = "toolbridge";

/// Default proxy endpoint a handler connects to
pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:5000";

/// Default address the proxy listens on
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";

/// Delay before the first reconnect attempt (milliseconds)
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;

/// Upper bound on the reconnect delay (milliseconds)
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Default deadline for a single invocation (milliseconds)
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 120_000;
