//! Settings and zone configuration for lx-init.
//!
//! Settings come from the environment. The zone configuration is a JSON
//! document describing the zone's IP stack mode, its attributes and its
//! network resources, in configuration order.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lxinit_networking::{InterfaceConfig, KernelVersion, DHCP_TIMEOUT};
use serde::Deserialize;

use crate::error::InitError;

/// Zone attribute holding the declared Linux kernel release.
pub const KERNEL_VERSION_ATTR: &str = "kernel-version";

/// Zone attribute holding the zone-wide IPv6 policy.
pub const IPV6_ATTR: &str = "ipv6";

/// The only supported IP stack mode.
pub const IP_TYPE_EXCLUSIVE: &str = "exclusive";

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Zone configuration document.
    pub zone_config: PathBuf,

    /// Root of the native (illumos) tree inside the zone.
    pub native_root: PathBuf,

    /// Console device for human-readable logs.
    pub console: PathBuf,

    /// JSON boot log.
    pub boot_log: PathBuf,

    /// Pause forever on a fatal error before exiting.
    pub pause_on_fatal: bool,

    /// Bound on DHCP agent start and lease request.
    pub dhcp_timeout: Duration,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| {
            PathBuf::from(lookup(key).unwrap_or_else(|| default.to_string()))
        };

        let pause_on_fatal = lookup("LXINIT_PAUSE_ON_FATAL")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        let dhcp_timeout = lookup("LXINIT_DHCP_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DHCP_TIMEOUT);

        Self {
            zone_config: path("LXINIT_ZONE_CONFIG", "/etc/lx-init/zone.json"),
            native_root: path("LXINIT_NATIVE_ROOT", "/native"),
            console: path("LXINIT_CONSOLE", "/dev/console"),
            boot_log: path("LXINIT_BOOT_LOG", "/var/log/lx-init.log"),
            pause_on_fatal,
            dhcp_timeout,
        }
    }

    /// Path of a native binary, e.g. `native("sbin/ifconfig")`.
    pub fn native(&self, relative: &str) -> PathBuf {
        self.native_root.join(relative)
    }
}

/// A `name`/`value` attribute pair.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Attr {
    pub name: String,
    pub value: String,
}

fn find_attr<'a>(attrs: &'a [Attr], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.value.as_str())
}

/// Complete zone configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    /// Zone name.
    pub zonename: String,

    /// IP stack mode.
    #[serde(default = "default_ip_type")]
    pub ip_type: String,

    /// Zone-wide attributes.
    #[serde(default)]
    pub attrs: Vec<Attr>,

    /// Network resources in configuration order.
    #[serde(default)]
    pub nets: Vec<NetConfig>,
}

fn default_ip_type() -> String {
    IP_TYPE_EXCLUSIVE.to_string()
}

/// One network resource.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    /// Physical interface name.
    pub physical: String,

    /// Address list overriding the `ips` attribute.
    #[serde(default)]
    pub allowed_address: Option<String>,

    /// Default router overriding the `gateway` attribute.
    #[serde(default)]
    pub defrouter: Option<String>,

    /// Per-interface attributes (`ips`, `ipv6`, `primary`, `gateway`).
    #[serde(default)]
    pub attrs: Vec<Attr>,
}

impl ZoneConfig {
    /// Read and parse the configuration document at `path`.
    pub fn load(path: &Path) -> Result<Self, InitError> {
        let load_err = |detail: String| InitError::ConfigLoadFailed {
            path: path.display().to_string(),
            detail,
        };

        let raw = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))
    }

    /// Zone attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        find_attr(&self.attrs, name)
    }

    /// Fail unless the zone has its own IP stack.
    pub fn ensure_exclusive(&self) -> Result<(), InitError> {
        if self.ip_type != IP_TYPE_EXCLUSIVE {
            return Err(InitError::UnsupportedIpType(self.ip_type.clone()));
        }
        Ok(())
    }

    /// Declared kernel release. Required.
    pub fn kernel_version(&self) -> Result<KernelVersion, InitError> {
        let raw = self
            .attr(KERNEL_VERSION_ATTR)
            .ok_or_else(|| InitError::BadZoneAttr {
                name: KERNEL_VERSION_ATTR.to_string(),
                detail: "attribute not found".to_string(),
            })?;

        KernelVersion::parse(raw).map_err(|e| InitError::BadZoneAttr {
            name: KERNEL_VERSION_ATTR.to_string(),
            detail: e.to_string(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl InterfaceConfig for NetConfig {
    fn physical(&self) -> &str {
        &self.physical
    }

    fn allowed_address(&self) -> Option<&str> {
        non_empty(&self.allowed_address)
    }

    fn default_router(&self) -> Option<&str> {
        non_empty(&self.defrouter)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        find_attr(&self.attrs, name)
    }
}
