//! Address management through the native `ifconfig` and `ipadm` tools.
//!
//! Each operation runs one command to completion. Address objects are named
//! `<lif>/addrN` for logging; the address itself is placed on the logical
//! interface the allocator chose.
//!
//! The object names stay local to this process and are never registered
//! with `ipmgmtd`, so `ipadm show-addr` does not list them by name.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use lxinit_networking::{
    AddrObj, AddressFamily, AddressManager, AddressObjectName, BufferProperties, FacilityError,
    LogicalInterfaces, PlumbOutcome, Protocol,
};
use tracing::debug;

/// Marker `ifconfig` prints when a new logical interface is created.
const NEW_LIF_MARKER: &str = "Created new logical interface ";

/// Native network administration tools.
#[derive(Debug, Clone)]
pub struct NativeIpadm {
    ifconfig: PathBuf,
    ipadm: PathBuf,
}

impl NativeIpadm {
    pub fn new(ifconfig: PathBuf, ipadm: PathBuf) -> Self {
        Self { ifconfig, ipadm }
    }

    fn ifconfig(&self, operation: &str, args: &[&str]) -> Result<Output, FacilityError> {
        run_checked(&self.ifconfig, operation, args)
    }
}

/// Run `program` and fail on a non-zero exit with its trimmed stderr.
fn run_checked(program: &Path, operation: &str, args: &[&str]) -> Result<Output, FacilityError> {
    debug!(program = %program.display(), ?args, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| FacilityError::io(operation, e))?;

    if !output.status.success() {
        return Err(FacilityError::rejected(operation, failure_detail(&output)));
    }

    Ok(output)
}

fn failure_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

/// Whether a plumb failure only says the instance is already there.
fn is_already_plumbed(error: &FacilityError) -> bool {
    matches!(error, FacilityError::Rejected { detail, .. } if detail.contains("already exists"))
}

/// Extract the logical interface name from `ifconfig addif` output.
fn parse_new_lif(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(NEW_LIF_MARKER))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// `ifconfig` arguments for `iface`, with `inet6` inserted for IPv6.
fn family_args<'a>(iface: &'a str, family: AddressFamily, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![iface];
    if family == AddressFamily::V6 {
        args.push("inet6");
    }
    args.extend_from_slice(rest);
    args
}

/// Validate the host part of a bare or CIDR literal.
fn check_literal(addr: &str) -> Result<(), String> {
    let (host, prefix) = match addr.split_once('/') {
        Some((host, prefix)) => (host, Some(prefix)),
        None => (addr, None),
    };

    let ip: IpAddr = host
        .parse()
        .map_err(|_| format!("invalid address '{}'", host))?;

    if let Some(prefix) = prefix {
        let max = if ip.is_ipv4() { 32 } else { 128 };
        match prefix.parse::<u8>() {
            Ok(len) if len <= max => {}
            _ => return Err(format!("invalid prefix length '{}'", prefix)),
        }
    }

    Ok(())
}

impl LogicalInterfaces for NativeIpadm {
    fn add_logical_interface(
        &self,
        base: &str,
        family: AddressFamily,
    ) -> Result<String, FacilityError> {
        let unspecified = match family {
            AddressFamily::V4 => "0.0.0.0",
            AddressFamily::V6 => "::",
        };
        let output = self.ifconfig("addif", &family_args(base, family, &["addif", unspecified]))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_new_lif(&stdout).ok_or_else(|| {
            FacilityError::rejected("addif", format!("unexpected output: {}", stdout.trim()))
        })
    }
}

impl AddressManager for NativeIpadm {
    fn plumb(&self, iface: &str, family: AddressFamily) -> Result<PlumbOutcome, FacilityError> {
        match self.ifconfig("plumb", &family_args(iface, family, &["plumb"])) {
            Ok(_) => Ok(PlumbOutcome::Created),
            Err(e) if is_already_plumbed(&e) => Ok(PlumbOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    fn bring_up_link_local(&self, iface: &str) -> Result<(), FacilityError> {
        self.ifconfig("link-local up", &[iface, "inet6", "up"])?;
        Ok(())
    }

    fn create_addrobj(&self, name: &AddressObjectName) -> Result<AddrObj, FacilityError> {
        Ok(AddrObj::new(name.clone()))
    }

    fn set_addr(&self, obj: &mut AddrObj, addr: &str) -> Result<(), FacilityError> {
        check_literal(addr).map_err(|detail| FacilityError::rejected("set address", detail))?;
        obj.set_address(addr);
        Ok(())
    }

    fn create_addr(&self, obj: &AddrObj) -> Result<(), FacilityError> {
        let addr = obj
            .address()
            .ok_or_else(|| FacilityError::rejected("create address", "no address set"))?;
        let lif = obj.name().interface();
        let family = AddressFamily::of_literal(addr);

        self.ifconfig("create address", &family_args(lif, family, &[addr, "up"]))?;
        Ok(())
    }

    fn destroy_addrobj(&self, obj: AddrObj) {
        debug!(aobj = %obj.name(), "address object released");
    }
}

impl BufferProperties for NativeIpadm {
    fn set_prop(&self, name: &str, value: &str, protocol: Protocol) -> Result<(), FacilityError> {
        let assignment = format!("{}={}", name, value);
        run_checked(
            &self.ipadm,
            "set-prop",
            &["set-prop", "-t", "-p", &assignment, protocol.ipadm_name()],
        )?;
        Ok(())
    }
}
