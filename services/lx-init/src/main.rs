//! lx-init - boot-path network bring-up for LX branded zones.
//!
//! This binary runs once at zone boot, before the Linux init, and is
//! responsible for:
//! - Starting the IP interface management daemon
//! - Plumbing loopback and every configured interface
//! - Static, DHCP and autoconf addresses and default routes
//! - Netstack buffer tunables for the declared kernel release
//! - Static routes from the brand route feed
//! - The post-network brand hook
//!
//! Any fatal error is logged, then the process pauses so the zone does not
//! fall into a reboot loop, then exits with status 1.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use lxinit_networking::netstack::{self, Protocol};
use lxinit_networking::setup::zone_ipv6_policy;
use lxinit_networking::{Facilities, NetworkSetup};
use tracing::{error, info, warn};
use uuid::Uuid;

mod command;
mod config;
mod dhcp;
mod error;
mod ipadm;
mod logging;
mod routing;

use command::{reap_zombies, PostnetHook, RouteFeed, Service};
use config::{Settings, ZoneConfig, IPV6_ATTR};
use dhcp::NativeDhcp;
use error::InitError;
use ipadm::NativeIpadm;
use routing::RoutingSocket;

/// lx-init version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let settings = Settings::from_env();

    if let Err(e) = logging::init(&settings.console, &settings.boot_log) {
        eprintln!("lx-init: failed to initialize logging: {}", e);
        return fatal_exit(&settings);
    }

    let boot_id = Uuid::new_v4();
    info!(version = VERSION, %boot_id, "lx-init starting");

    match run(&settings).await {
        Ok(()) => {
            info!("network configuration complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let reason = e
                .downcast_ref::<InitError>()
                .map_or("internal_error", InitError::reason_code);
            error!(error = %e, reason, "lx-init failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            fatal_exit(&settings)
        }
    }
}

/// Pause (unless disabled), then report failure.
fn fatal_exit(settings: &Settings) -> ExitCode {
    if settings.pause_on_fatal {
        error!("pausing after fatal error");
        nix::unistd::pause();
    }
    ExitCode::from(1)
}

async fn run(settings: &Settings) -> Result<()> {
    // Step 1: ipadm needs its daemon before anything is plumbed
    Service::ipmgmtd(&settings.native_root).launch().await?;
    reap_zombies();

    // Step 2: Zone configuration
    let zone = ZoneConfig::load(&settings.zone_config)?;
    zone.ensure_exclusive()?;
    let kernel = zone.kernel_version()?;
    info!(
        zonename = %zone.zonename,
        nets = zone.nets.len(),
        kernel_version = %kernel,
        "zone configuration loaded"
    );

    let ipv6_attr = zone.attr(IPV6_ATTR);
    let ipv6 = zone_ipv6_policy(ipv6_attr).map_err(InitError::from)?;
    if ipv6_attr.is_some() {
        warn!(
            "IPv6 is {} by zone configuration",
            if ipv6 { "enabled" } else { "disabled" }
        );
    }

    // Step 3: Interfaces
    let ipadm = Arc::new(NativeIpadm::new(
        settings.native("sbin/ifconfig"),
        settings.native("usr/sbin/ipadm"),
    ));
    let routes = Arc::new(RoutingSocket);
    let facilities = Facilities {
        addresses: ipadm.clone(),
        dhcp: Arc::new(NativeDhcp::new(
            settings.native("sbin/dhcpagent"),
            settings.native("sbin/ifconfig"),
        )),
        routes: routes.clone(),
        autoconf: Arc::new(Service::ndpd(&settings.native_root)),
    };

    let report = NetworkSetup::new(facilities, ipv6)
        .with_dhcp_timeout(settings.dhcp_timeout)
        .run(&zone.nets)
        .await
        .map_err(InitError::from)?;
    reap_zombies();
    info!(
        interfaces = ?report.interfaces,
        warnings = report.warnings.len(),
        addrconf = report.addrconf_started,
        "interfaces configured"
    );

    // Step 4: Buffer tunables
    let profile = netstack::normalize(kernel);
    // failures are warned about per property and never fatal
    netstack::apply(&*ipadm, &profile, &Protocol::ALL);

    // Step 5: Static routes
    let installed = RouteFeed::new(&settings.native_root).run(&*routes).await?;
    if installed > 0 {
        info!(count = installed, "static routes installed");
    }

    // Step 6: Post-network hook
    PostnetHook::new(&settings.native_root).run().await?;

    Ok(())
}
