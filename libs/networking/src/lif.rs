//! Logical interface allocation.
//!
//! The first IPv4 address on a base interface lives on the base interface
//! itself. Every later IPv4 address, and every IPv6 address, gets a fresh
//! logical interface (`net0:1`, `net0:2`, ...).

use thiserror::Error;
use tracing::debug;

use crate::error::FacilityError;

/// Address family of an address or interface instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Family of an address literal (bare or CIDR). A colon means IPv6.
    pub fn of_literal(addr: &str) -> Self {
        if addr.contains(':') {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "v4"),
            AddressFamily::V6 => write!(f, "v6"),
        }
    }
}

/// Per-interface state for one configuration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceContext {
    base_name: String,
    first_ipv4_configured: bool,
}

impl InterfaceContext {
    /// Start a pass over `base_name` with no IPv4 address yet.
    pub fn new(base_name: &str) -> Self {
        Self {
            base_name: base_name.to_string(),
            first_ipv4_configured: false,
        }
    }

    /// Physical interface name.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Whether an IPv4 address already occupies the base interface.
    pub fn first_ipv4_configured(&self) -> bool {
        self.first_ipv4_configured
    }

    /// Record that the base interface now carries an IPv4 address.
    ///
    /// One-way: there is no way to clear the flag.
    pub fn mark_ipv4_configured(&mut self) {
        self.first_ipv4_configured = true;
    }
}

/// Capability to create logical interfaces on a base interface.
pub trait LogicalInterfaces: Send + Sync {
    /// Ask the kernel for a new logical interface on `base` and return its name.
    fn add_logical_interface(
        &self,
        base: &str,
        family: AddressFamily,
    ) -> Result<String, FacilityError>;
}

/// Logical interface allocation failure. Callers warn and skip the address.
#[derive(Debug, Error)]
#[error("failed to create new logical interface on {base} ({family}): {source}")]
pub struct AllocError {
    pub base: String,
    pub family: AddressFamily,
    #[source]
    pub source: FacilityError,
}

/// Pick the interface an address of `family` should be placed on.
///
/// Does not touch the context; the caller marks IPv4 configured only once an
/// address actually lands on the base interface.
pub fn ensure_target<L>(
    lifs: &L,
    iface: &InterfaceContext,
    family: AddressFamily,
) -> Result<String, AllocError>
where
    L: LogicalInterfaces + ?Sized,
{
    if family == AddressFamily::V4 && !iface.first_ipv4_configured() {
        return Ok(iface.base_name().to_string());
    }

    let name = lifs
        .add_logical_interface(iface.base_name(), family)
        .map_err(|source| AllocError {
            base: iface.base_name().to_string(),
            family,
            source,
        })?;

    debug!(base = %iface.base_name(), lif = %name, %family, "logical interface created");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStack;

    #[test]
    fn test_family_of_literal() {
        assert_eq!(AddressFamily::of_literal("10.0.0.2/24"), AddressFamily::V4);
        assert_eq!(AddressFamily::of_literal("fd00::2/64"), AddressFamily::V6);
        assert_eq!(AddressFamily::of_literal("::1"), AddressFamily::V6);
    }

    #[test]
    fn test_first_ipv4_uses_base() {
        let stack = MockStack::new();
        let ctx = InterfaceContext::new("net0");

        let target = ensure_target(&stack, &ctx, AddressFamily::V4).unwrap();
        assert_eq!(target, "net0");
        assert!(stack.logical_interfaces().is_empty());
    }

    #[test]
    fn test_second_ipv4_allocates() {
        let stack = MockStack::new();
        let mut ctx = InterfaceContext::new("net0");
        ctx.mark_ipv4_configured();

        let target = ensure_target(&stack, &ctx, AddressFamily::V4).unwrap();
        assert_eq!(target, "net0:1");
    }

    #[test]
    fn test_first_ipv6_allocates() {
        let stack = MockStack::new();
        let ctx = InterfaceContext::new("net0");

        let target = ensure_target(&stack, &ctx, AddressFamily::V6).unwrap();
        assert_eq!(target, "net0:1");
        assert!(!ctx.first_ipv4_configured());
    }

    #[test]
    fn test_allocation_failure() {
        let stack = MockStack::new().with_failing_logical_interfaces();
        let ctx = InterfaceContext::new("net0");

        let err = ensure_target(&stack, &ctx, AddressFamily::V6).unwrap_err();
        assert_eq!(err.base, "net0");
        assert_eq!(err.family, AddressFamily::V6);
    }
}
