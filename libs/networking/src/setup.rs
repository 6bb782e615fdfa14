//! Per-interface network setup.
//!
//! Walks the configured interfaces in order and, for each one: plumbs it,
//! resolves IPv6 enablement, brings up link-local, starts DHCP, applies the
//! remaining addresses, and installs the default route. Autoconfiguration is
//! started once after every interface has been processed.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::address::{AddressDispatcher, AddressError, AddressManager, AddressToken, DhcpAgent};
use crate::error::{FacilityError, Severity};
use crate::lif::{AddressFamily, InterfaceContext};
use crate::route::{install_route, RouteChannel, RouteError, RouteRequest};

/// Loopback interface name.
pub const LOOPBACK: &str = "lo0";

/// Loopback IPv4 address.
pub const LOOPBACK_ADDR: &str = "127.0.0.1/8";

/// Declarative configuration of one interface.
pub trait InterfaceConfig {
    /// Physical interface name.
    fn physical(&self) -> &str;

    /// Allowed-address override, if non-empty.
    fn allowed_address(&self) -> Option<&str>;

    /// Default-router override, if non-empty.
    fn default_router(&self) -> Option<&str>;

    /// Free-form attribute lookup.
    fn attr(&self, name: &str) -> Option<&str>;
}

/// Stateless autoconfiguration daemon.
#[async_trait]
pub trait AutoconfService: Send + Sync {
    /// Start the daemon and wait for its launcher to exit.
    async fn start(&self) -> Result<(), FacilityError>;
}

/// The collaborators network setup drives.
#[derive(Clone)]
pub struct Facilities {
    pub addresses: Arc<dyn AddressManager>,
    pub dhcp: Arc<dyn DhcpAgent>,
    pub routes: Arc<dyn RouteChannel>,
    pub autoconf: Arc<dyn AutoconfService>,
}

/// Fatal setup errors.
#[derive(Debug, Error)]
pub enum SetupError {
    /// `ipv6` attribute is neither "true" nor "false".
    #[error("invalid value for 'ipv6' attribute: '{0}'")]
    InvalidIpv6Attr(String),

    /// Interface asks for IPv6 while the zone disables it.
    #[error("cannot enable ipv6 for interface {0} when it is disabled for the zone")]
    Ipv6DisabledForZone(String),

    /// Plumbing failed for a reason other than "already exists".
    #[error("plumb {iface}/{family}: {source}")]
    Plumb {
        iface: String,
        family: AddressFamily,
        #[source]
        source: FacilityError,
    },

    /// Gateway text is not an IPv4 address.
    #[error("default route on {iface}: bad gateway '{gateway}'")]
    BadGateway { iface: String, gateway: String },

    /// Default route could not be installed.
    #[error("default route on {iface} -> {gateway} failed: {source}")]
    DefaultRoute {
        iface: String,
        gateway: Ipv4Addr,
        #[source]
        source: RouteError,
    },

    /// An address error that cannot be skipped.
    #[error(transparent)]
    Address(AddressError),

    /// The autoconfiguration daemon did not start.
    #[error("failed to start autoconfiguration: {0}")]
    Autoconf(#[source] FacilityError),
}

/// A condition that was logged and skipped.
#[derive(Debug)]
pub enum SetupWarning {
    /// Interface has no address configuration; it stays plumbed only.
    NoConfiguration { iface: String },

    /// Link-local bring-up failed.
    LinkLocal { iface: String, error: FacilityError },

    /// One address token was skipped.
    Address {
        iface: String,
        token: String,
        error: AddressError,
    },
}

impl std::fmt::Display for SetupWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupWarning::NoConfiguration { iface } => {
                write!(f, "no network configuration for the {} interface", iface)
            }
            SetupWarning::LinkLocal { iface, error } => {
                write!(f, "unable to bring up link-local address on {}: {}", iface, error)
            }
            SetupWarning::Address { iface, token, error } => {
                write!(f, "unable to add address {} to {}: {}", token, iface, error)
            }
        }
    }
}

/// Outcome of a setup run.
#[derive(Debug, Default)]
pub struct SetupReport {
    /// Interfaces processed, in order (loopback first when set up).
    pub interfaces: Vec<String>,

    /// Everything that was warned about.
    pub warnings: Vec<SetupWarning>,

    /// Whether the autoconfiguration daemon was started.
    pub addrconf_started: bool,

    /// Address object names consumed.
    pub names_issued: u32,
}

/// Resolve the zone-wide IPv6 default from the zone `ipv6` attribute.
pub fn zone_ipv6_policy(attr: Option<&str>) -> Result<bool, SetupError> {
    match attr {
        None => Ok(true),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(SetupError::InvalidIpv6Attr(other.to_string())),
    }
}

/// Resolve IPv6 for one interface from the zone default and its override.
pub fn interface_ipv6(zone_enabled: bool, iface: &str, attr: Option<&str>) -> Result<bool, SetupError> {
    match attr {
        None => Ok(zone_enabled),
        Some("true") if zone_enabled => Ok(true),
        Some("true") => Err(SetupError::Ipv6DisabledForZone(iface.to_string())),
        Some("false") => Ok(false),
        Some(other) => Err(SetupError::InvalidIpv6Attr(other.to_string())),
    }
}

/// Address list for an interface: allowed-address wins over `ips`.
pub fn address_list<C: InterfaceConfig + ?Sized>(config: &C) -> Option<&str> {
    config.allowed_address().or_else(|| config.attr("ips"))
}

/// Gateway for an interface: explicit default router wins; otherwise the
/// `gateway` attribute, only on the primary interface.
pub fn resolve_gateway<C: InterfaceConfig + ?Sized>(config: &C) -> Option<&str> {
    if let Some(router) = config.default_router() {
        return Some(router);
    }

    match config.attr("primary") {
        Some("true") => config.attr("gateway"),
        _ => None,
    }
}

/// Drives network setup for a whole run.
pub struct NetworkSetup {
    facilities: Facilities,
    dispatcher: AddressDispatcher,
    ipv6_enabled: bool,
    report: SetupReport,
}

impl NetworkSetup {
    pub fn new(facilities: Facilities, ipv6_enabled: bool) -> Self {
        let dispatcher =
            AddressDispatcher::new(facilities.addresses.clone(), facilities.dhcp.clone());
        Self {
            facilities,
            dispatcher,
            ipv6_enabled,
            report: SetupReport::default(),
        }
    }

    /// Override the DHCP bound.
    pub fn with_dhcp_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_dhcp_timeout(timeout);
        self
    }

    /// Loopback, then every interface, then autoconfiguration.
    pub async fn run<C: InterfaceConfig>(mut self, interfaces: &[C]) -> Result<SetupReport, SetupError> {
        self.setup_loopback().await?;
        for config in interfaces {
            self.configure_interface(config).await?;
        }
        self.finish().await
    }

    /// Plumb `lo0` and give it 127.0.0.1.
    pub async fn setup_loopback(&mut self) -> Result<(), SetupError> {
        self.plumb(LOOPBACK)?;

        let mut ctx = InterfaceContext::new(LOOPBACK);
        let token = AddressToken::Literal(LOOPBACK_ADDR.to_string());
        self.apply(&mut ctx, &token).await?;

        if self.ipv6_enabled {
            self.link_local(LOOPBACK);
        }

        self.report.interfaces.push(LOOPBACK.to_string());
        Ok(())
    }

    /// Configure one interface.
    pub async fn configure_interface<C: InterfaceConfig + ?Sized>(
        &mut self,
        config: &C,
    ) -> Result<(), SetupError> {
        let iface = config.physical();
        self.report.interfaces.push(iface.to_string());

        // plumb regardless of whether anything else is configured
        self.plumb(iface)?;

        let addresses = address_list(config);
        if addresses.is_none() {
            warn!(iface, "could not find network configuration for interface");
            self.report.warnings.push(SetupWarning::NoConfiguration {
                iface: iface.to_string(),
            });
        }

        if interface_ipv6(self.ipv6_enabled, iface, config.attr("ipv6"))? {
            self.link_local(iface);
        }

        let Some(addresses) = addresses else {
            return Ok(());
        };

        let tokens = AddressToken::parse_list(addresses);
        let mut ctx = InterfaceContext::new(iface);

        // dhcp must run on the zeroth logical interface, so it goes first
        if tokens.contains(&AddressToken::Dhcp) {
            self.apply(&mut ctx, &AddressToken::Dhcp).await?;
        }

        for token in tokens.iter().filter(|t| **t != AddressToken::Dhcp) {
            self.apply(&mut ctx, token).await?;
        }

        if let Some(gateway) = resolve_gateway(config) {
            self.default_route(iface, gateway)?;
        }

        Ok(())
    }

    /// Start autoconfiguration if any interface asked for it.
    pub async fn finish(mut self) -> Result<SetupReport, SetupError> {
        if self.dispatcher.addrconf_requested() {
            info!("starting stateless address autoconfiguration");
            self.facilities
                .autoconf
                .start()
                .await
                .map_err(SetupError::Autoconf)?;
            self.report.addrconf_started = true;
        }

        self.report.names_issued = self.dispatcher.names_issued();
        Ok(self.report)
    }

    fn plumb(&self, iface: &str) -> Result<(), SetupError> {
        let mut families = vec![AddressFamily::V4];
        if self.ipv6_enabled {
            families.push(AddressFamily::V6);
        }

        for family in families {
            self.facilities
                .addresses
                .plumb(iface, family)
                .map_err(|source| SetupError::Plumb {
                    iface: iface.to_string(),
                    family,
                    source,
                })?;
        }
        Ok(())
    }

    fn link_local(&mut self, iface: &str) {
        if let Err(error) = self.facilities.addresses.bring_up_link_local(iface) {
            warn!(iface, error = %error, "unable to bring up link-local address");
            self.report.warnings.push(SetupWarning::LinkLocal {
                iface: iface.to_string(),
                error,
            });
        }
    }

    async fn apply(
        &mut self,
        ctx: &mut InterfaceContext,
        token: &AddressToken,
    ) -> Result<(), SetupError> {
        match self.dispatcher.apply_address(ctx, token).await {
            Ok(_) => Ok(()),
            Err(error) if error.severity() == Severity::Fatal => Err(SetupError::Address(error)),
            Err(error) => {
                warn!(iface = %ctx.base_name(), %token, error = %error, "unable to add address");
                self.report.warnings.push(SetupWarning::Address {
                    iface: ctx.base_name().to_string(),
                    token: token.to_string(),
                    error,
                });
                Ok(())
            }
        }
    }

    fn default_route(&self, iface: &str, gateway: &str) -> Result<(), SetupError> {
        let gateway: Ipv4Addr = gateway.parse().map_err(|_| SetupError::BadGateway {
            iface: iface.to_string(),
            gateway: gateway.to_string(),
        })?;

        let request = RouteRequest::default_via(gateway, iface);
        install_route(&*self.facilities.routes, &request).map_err(|source| {
            SetupError::DefaultRoute {
                iface: iface.to_string(),
                gateway,
                source,
            }
        })
    }
}
