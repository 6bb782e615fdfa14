//! Error types for lx-init.

use lxinit_networking::{SetupError, StaticRouteError};
use thiserror::Error;

/// Fatal boot errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum InitError {
    /// Zone configuration could not be read or parsed.
    #[error("config_load_failed: {path}: {detail}")]
    ConfigLoadFailed { path: String, detail: String },

    /// The zone does not own its IP stack.
    #[error("unsupported_ip_type: unsupported configuration mode '{0}'")]
    UnsupportedIpType(String),

    /// A required zone attribute is missing or malformed.
    #[error("bad_zone_attr: {name}: {detail}")]
    BadZoneAttr { name: String, detail: String },

    /// A boot service could not be started or exited non-zero.
    #[error("service_failed: {name}: {detail}")]
    ServiceFailed { name: String, detail: String },

    /// Interface setup hit a fatal condition.
    #[error("net_setup_failed: {0}")]
    NetSetupFailed(#[from] SetupError),

    /// The static route feed could not be run or applied.
    #[error("static_route_failed: {0}")]
    StaticRouteFailed(String),

    /// A route line could not be installed.
    #[error("static_route_failed: {0}")]
    StaticRoute(#[from] StaticRouteError),

    /// The post-network hook failed.
    #[error("hook_failed: {0}")]
    HookFailed(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InitError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            InitError::ConfigLoadFailed { .. } => "config_load_failed",
            InitError::UnsupportedIpType(_) => "unsupported_ip_type",
            InitError::BadZoneAttr { .. } => "bad_zone_attr",
            InitError::ServiceFailed { .. } => "service_failed",
            InitError::NetSetupFailed(_) => "net_setup_failed",
            InitError::StaticRouteFailed(_) | InitError::StaticRoute(_) => "static_route_failed",
            InitError::HookFailed(_) => "hook_failed",
            InitError::Io(_) => "io_error",
        }
    }
}
