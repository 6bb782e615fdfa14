//! Netstack buffer normalization.
//!
//! Linux applications expect socket buffer limits that depend on the kernel
//! release they were built against. The zone declares that release in its
//! `kernel-version` attribute; this module turns it into `max_buf`,
//! `send_buf` and `recv_buf` values and applies them to every transport.

use thiserror::Error;
use tracing::{info, warn};

use crate::error::FacilityError;

/// Base send/receive buffer size; the applied value is twice this.
pub const NETSTACK_BUFSZ: u32 = 1024 * 1024;

/// `max_buf` for kernels before 3.4.0.
pub const MAX_BUF_LEGACY: u32 = 4 * 1024 * 1024;

/// `max_buf` for kernels 3.4.0 and later.
pub const MAX_BUF_CURRENT: u32 = 6 * 1024 * 1024;

/// First release with the larger default.
pub const MAX_BUF_CUTOVER: KernelVersion = KernelVersion(3, 4, 0);

/// A `major.minor.patch` kernel release. Ordered most-significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion(pub u32, pub u32, pub u32);

/// Unparseable `kernel-version` attribute.
#[derive(Debug, Error)]
#[error("malformed kernel version '{0}'")]
pub struct VersionError(pub String);

impl KernelVersion {
    /// Parse `major[.minor[.patch]]`. Missing components are zero and
    /// anything after a component's leading digits is ignored, so
    /// `"4.15.0-generic"` is `4.15.0`.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let mut parts = [0u32; 3];
        for (slot, component) in parts.iter_mut().zip(s.trim().split('.')) {
            let digits: &str = {
                let end = component
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(component.len());
                &component[..end]
            };
            if digits.is_empty() {
                break;
            }
            *slot = digits.parse().map_err(|_| VersionError(s.to_string()))?;
        }

        if !s.trim().starts_with(|c: char| c.is_ascii_digit()) {
            return Err(VersionError(s.to_string()));
        }

        Ok(Self(parts[0], parts[1], parts[2]))
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Transport modules that carry buffer tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    RawIp,
}

impl Protocol {
    /// All protocols, in application order.
    pub const ALL: [Protocol; 4] = [Protocol::Tcp, Protocol::Udp, Protocol::Sctp, Protocol::RawIp];

    /// Protocol name understood by ipadm. Raw IP is the `icmp` module.
    pub fn ipadm_name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::RawIp => "icmp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
            Protocol::RawIp => write!(f, "rawip"),
        }
    }
}

/// Sets protocol properties in the active (non-persistent) configuration.
pub trait BufferProperties: Send + Sync {
    fn set_prop(&self, name: &str, value: &str, protocol: Protocol) -> Result<(), FacilityError>;
}

/// Buffer values applied to every protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetstackBufferProfile {
    pub max_buf: u32,
    pub send_buf: u32,
    pub recv_buf: u32,
}

/// Derive the profile for a declared kernel release.
pub fn normalize(declared: KernelVersion) -> NetstackBufferProfile {
    let max_buf = if declared < MAX_BUF_CUTOVER {
        MAX_BUF_LEGACY
    } else {
        MAX_BUF_CURRENT
    };

    NetstackBufferProfile {
        max_buf,
        send_buf: NETSTACK_BUFSZ * 2,
        recv_buf: NETSTACK_BUFSZ * 2,
    }
}

/// A property that could not be set.
#[derive(Debug)]
pub struct PropertyFailure {
    pub protocol: Protocol,
    pub property: &'static str,
    pub error: FacilityError,
}

/// Apply `profile` to each protocol.
///
/// `max_buf` goes first so the new send/recv values never exceed the old
/// maximum. Failures are logged and returned; they never stop the loop.
pub fn apply(
    props: &dyn BufferProperties,
    profile: &NetstackBufferProfile,
    protocols: &[Protocol],
) -> Vec<PropertyFailure> {
    let mut failures = Vec::new();

    for &protocol in protocols {
        let settings = [
            ("max_buf", profile.max_buf),
            ("send_buf", profile.send_buf),
            ("recv_buf", profile.recv_buf),
        ];

        for (property, value) in settings {
            if let Err(error) = props.set_prop(property, &value.to_string(), protocol) {
                warn!(%protocol, property, value, error = %error, "buffer property not set");
                failures.push(PropertyFailure {
                    protocol,
                    property,
                    error,
                });
            }
        }
    }

    info!(
        max_buf = profile.max_buf,
        send_buf = profile.send_buf,
        recv_buf = profile.recv_buf,
        failures = failures.len(),
        "netstack buffers normalized"
    );
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStack;
    use rstest::rstest;

    #[rstest]
    #[case("3.3.9", KernelVersion(3, 3, 9))]
    #[case("4.4", KernelVersion(4, 4, 0))]
    #[case("5", KernelVersion(5, 0, 0))]
    #[case("4.15.0-generic", KernelVersion(4, 15, 0))]
    #[case(" 3.10.0 ", KernelVersion(3, 10, 0))]
    fn test_parse_version(#[case] input: &str, #[case] expected: KernelVersion) {
        assert_eq!(KernelVersion::parse(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("linux")]
    #[case("v4.4.0")]
    fn test_parse_version_rejects(#[case] input: &str) {
        assert!(KernelVersion::parse(input).is_err());
    }

    #[rstest]
    #[case(KernelVersion(2, 6, 32), MAX_BUF_LEGACY)]
    #[case(KernelVersion(3, 3, 9), MAX_BUF_LEGACY)]
    #[case(KernelVersion(3, 4, 0), MAX_BUF_CURRENT)]
    #[case(KernelVersion(3, 10, 0), MAX_BUF_CURRENT)]
    #[case(KernelVersion(6, 9, 0), MAX_BUF_CURRENT)]
    fn test_max_buf_selection(#[case] version: KernelVersion, #[case] max_buf: u32) {
        let profile = normalize(version);
        assert_eq!(profile.max_buf, max_buf);
        assert_eq!(profile.send_buf, 2 * 1024 * 1024);
        assert_eq!(profile.recv_buf, 2 * 1024 * 1024);
    }

    #[test]
    fn test_apply_order_max_buf_first() {
        let stack = MockStack::new();
        let profile = normalize(KernelVersion(4, 4, 0));

        let failures = apply(&stack, &profile, &Protocol::ALL);
        assert!(failures.is_empty());

        let props = stack.props();
        assert_eq!(props.len(), 12);
        for (chunk, protocol) in props.chunks(3).zip(Protocol::ALL) {
            assert_eq!(chunk[0], ("max_buf".to_string(), "6291456".to_string(), protocol));
            assert_eq!(chunk[1].0, "send_buf");
            assert_eq!(chunk[2].0, "recv_buf");
        }
    }

    #[test]
    fn test_apply_continues_after_failure() {
        let stack = MockStack::new().failing_prop("send_buf", Protocol::Udp);
        let profile = normalize(KernelVersion(3, 3, 0));

        let failures = apply(&stack, &profile, &Protocol::ALL);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].protocol, Protocol::Udp);
        assert_eq!(failures[0].property, "send_buf");
        // only successful sets are recorded
        assert_eq!(stack.props().len(), 11);
    }
}
