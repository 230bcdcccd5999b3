//! Handler and router configuration
//!
//! - `app_config`: configuration structures and validation
//! - `defaults`: default configuration values

pub mod app_config;
pub mod defaults;

pub use app_config::{HandlerConfig, RouterConfig};
