//! Routing-socket message codec.
//!
//! Builds `RTM_ADD` requests for the `PF_ROUTE` control channel. The message is
//! a fixed-size `rt_msghdr` followed by three `sockaddr_in` records in the
//! order destination, gateway, netmask:
//!
//! ```text
//! offset size field
//!      0    2 rtm_msglen
//!      2    1 rtm_version
//!      3    1 rtm_type
//!      4    2 rtm_index
//!      6    2 (padding)
//!      8    4 rtm_flags
//!     12    4 rtm_addrs
//!     16    4 rtm_pid
//!     20    4 rtm_seq
//!     24    4 rtm_errno
//!     28    4 rtm_use
//!     32    4 rtm_inits
//!     36   40 rtm_rmx (ten u32 metrics)
//!     76   16 destination  (family u16, port u16, addr [4], zero [8])
//!     92   16 gateway
//!    108   16 netmask
//! ```
//!
//! Header integers are host byte order; addresses are network byte order.
//! Only IPv4 routes are supported.

use std::io;
use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info};

/// Routing socket protocol version.
pub const RTM_VERSION: u8 = 3;

/// Message type: add route.
pub const RTM_ADD: u8 = 0x1;

/// Route usable.
pub const RTF_UP: i32 = 0x1;

/// Destination is reached through a gateway.
pub const RTF_GATEWAY: i32 = 0x2;

/// Manually added route.
pub const RTF_STATIC: i32 = 0x800;

/// Destination sockaddr present.
pub const RTA_DST: i32 = 0x1;

/// Gateway sockaddr present.
pub const RTA_GATEWAY: i32 = 0x2;

/// Netmask sockaddr present.
pub const RTA_NETMASK: i32 = 0x4;

/// Address family tag for IPv4 records.
pub const AF_INET: u16 = 2;

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 76;

/// Size of one IPv4 address record.
pub const SOCKADDR_IN_LEN: usize = 16;

/// Total encoded message length.
pub const MESSAGE_LEN: usize = HEADER_LEN + 3 * SOCKADDR_IN_LEN;

/// Byte offsets of the header fields.
pub mod offset {
    pub const MSGLEN: usize = 0;
    pub const VERSION: usize = 2;
    pub const TYPE: usize = 3;
    pub const INDEX: usize = 4;
    pub const FLAGS: usize = 8;
    pub const ADDRS: usize = 12;
    pub const PID: usize = 16;
    pub const DESTINATION: usize = super::HEADER_LEN;
    pub const GATEWAY: usize = DESTINATION + super::SOCKADDR_IN_LEN;
    pub const NETMASK: usize = GATEWAY + super::SOCKADDR_IN_LEN;
}

/// Number of u32 metric slots in `rt_metrics`.
const METRIC_SLOTS: usize = 10;

/// Route installation errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Prefix length outside 0..=32.
    #[error("invalid prefix length /{0}")]
    InvalidPrefix(u8),

    /// Interface name could not be resolved to an index.
    #[error("unable to get interface index for {0}")]
    UnknownInterface(String),

    /// Opening or writing the routing socket failed.
    #[error("routing socket: {0}")]
    Channel(#[from] io::Error),

    /// The kernel accepted fewer bytes than the message length.
    #[error("incomplete route message write: {written} of {expected} bytes")]
    IncompleteWrite { written: usize, expected: usize },
}

/// A request to add one IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// Destination network and prefix length. `None` is the default route.
    pub destination: Option<(Ipv4Addr, u8)>,

    /// Next-hop gateway.
    pub gateway: Ipv4Addr,

    /// Interface to bind the route to.
    pub interface: Option<String>,
}

impl RouteRequest {
    /// Default route (0.0.0.0/0) through `gateway` on `interface`.
    pub fn default_via(gateway: Ipv4Addr, interface: &str) -> Self {
        Self {
            destination: None,
            gateway,
            interface: Some(interface.to_string()),
        }
    }

    /// Route to `network/prefix_len` through `gateway`, not bound to an interface.
    pub fn network_via(network: Ipv4Addr, prefix_len: u8, gateway: Ipv4Addr) -> Self {
        Self {
            destination: Some((network, prefix_len)),
            gateway,
            interface: None,
        }
    }
}

impl std::fmt::Display for RouteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.destination {
            Some((net, len)) => write!(f, "{}/{} -> {}", net, len, self.gateway)?,
            None => write!(f, "default -> {}", self.gateway)?,
        }
        if let Some(iface) = &self.interface {
            write!(f, " ({})", iface)?;
        }
        Ok(())
    }
}

/// Convert a CIDR prefix length to a dotted netmask.
pub fn prefix_to_netmask(prefix_len: u8) -> Result<Ipv4Addr, RouteError> {
    match prefix_len {
        0 => Ok(Ipv4Addr::UNSPECIFIED),
        1..=32 => Ok(Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len)))),
        _ => Err(RouteError::InvalidPrefix(prefix_len)),
    }
}

/// The routing control channel.
///
/// Each `send_message` call must be a single write of the whole buffer.
pub trait RouteChannel: Send + Sync {
    /// Resolve an interface name to its kernel index.
    fn interface_index(&self, name: &str) -> Option<u32>;

    /// Write one encoded message, returning the number of bytes accepted.
    fn send_message(&self, message: &[u8]) -> io::Result<usize>;
}

/// An encoded-ready `RTM_ADD` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMessage {
    index: u16,
    pid: i32,
    destination: Ipv4Addr,
    gateway: Ipv4Addr,
    netmask: Ipv4Addr,
}

impl RouteMessage {
    /// Build an add-route message for `request`.
    ///
    /// `index` is the resolved interface index (0 when unbound).
    pub fn add(request: &RouteRequest, index: u16, pid: i32) -> Result<Self, RouteError> {
        let (destination, netmask) = match request.destination {
            Some((network, prefix_len)) => (network, prefix_to_netmask(prefix_len)?),
            None => (Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED),
        };

        Ok(Self {
            index,
            pid,
            destination,
            gateway: request.gateway,
            netmask,
        })
    }

    /// Serialize to the wire layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_LEN);

        buf.put_u16_ne(MESSAGE_LEN as u16);
        buf.put_u8(RTM_VERSION);
        buf.put_u8(RTM_ADD);
        buf.put_u16_ne(self.index);
        buf.put_bytes(0, 2);
        buf.put_i32_ne(RTF_UP | RTF_STATIC | RTF_GATEWAY);
        buf.put_i32_ne(RTA_DST | RTA_GATEWAY | RTA_NETMASK);
        buf.put_i32_ne(self.pid);
        // seq, errno, use, inits
        buf.put_bytes(0, 4 * 4);
        buf.put_bytes(0, METRIC_SLOTS * 4);
        debug_assert_eq!(buf.len(), HEADER_LEN);

        put_sockaddr_in(&mut buf, self.destination);
        put_sockaddr_in(&mut buf, self.gateway);
        put_sockaddr_in(&mut buf, self.netmask);

        buf.freeze()
    }
}

fn put_sockaddr_in(buf: &mut BytesMut, addr: Ipv4Addr) {
    buf.put_u16_ne(AF_INET);
    buf.put_u16(0);
    buf.put_slice(&addr.octets());
    buf.put_bytes(0, 8);
}

/// Encode `request` and write it to `channel` once.
///
/// A short write is never retried.
pub fn install_route(channel: &dyn RouteChannel, request: &RouteRequest) -> Result<(), RouteError> {
    let index = match &request.interface {
        Some(name) => channel
            .interface_index(name)
            .and_then(|idx| u16::try_from(idx).ok())
            .ok_or_else(|| RouteError::UnknownInterface(name.clone()))?,
        None => 0,
    };

    let message = RouteMessage::add(request, index, std::process::id() as i32)?;
    let bytes = message.encode();

    let written = channel.send_message(&bytes)?;
    if written < bytes.len() {
        return Err(RouteError::IncompleteWrite {
            written,
            expected: bytes.len(),
        });
    }

    debug!(index, len = bytes.len(), "route message written");
    info!(route = %request, "route installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStack;
    use rstest::rstest;

    fn u16_at(buf: &[u8], at: usize) -> u16 {
        u16::from_ne_bytes([buf[at], buf[at + 1]])
    }

    fn i32_at(buf: &[u8], at: usize) -> i32 {
        i32::from_ne_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn addr_at(buf: &[u8], record: usize) -> [u8; 4] {
        buf[record + 4..record + 8].try_into().unwrap()
    }

    #[rstest]
    #[case(0, [0, 0, 0, 0])]
    #[case(8, [255, 0, 0, 0])]
    #[case(20, [255, 255, 240, 0])]
    #[case(24, [255, 255, 255, 0])]
    #[case(31, [255, 255, 255, 254])]
    #[case(32, [255, 255, 255, 255])]
    fn test_prefix_to_netmask(#[case] prefix: u8, #[case] mask: [u8; 4]) {
        assert_eq!(prefix_to_netmask(prefix).unwrap().octets(), mask);
    }

    #[test]
    fn test_prefix_out_of_range() {
        assert!(matches!(
            prefix_to_netmask(33),
            Err(RouteError::InvalidPrefix(33))
        ));
    }

    #[test]
    fn test_default_route_has_zero_destination_and_netmask() {
        let req = RouteRequest::default_via(Ipv4Addr::new(10, 0, 0, 1), "net0");
        let buf = RouteMessage::add(&req, 2, 100).unwrap().encode();

        assert_eq!(buf.len(), MESSAGE_LEN);
        assert_eq!(addr_at(&buf, offset::DESTINATION), [0, 0, 0, 0]);
        assert_eq!(addr_at(&buf, offset::NETMASK), [0, 0, 0, 0]);
        assert_eq!(addr_at(&buf, offset::GATEWAY), [10, 0, 0, 1]);
        assert_eq!(u16_at(&buf, offset::DESTINATION), AF_INET);
        assert_eq!(u16_at(&buf, offset::NETMASK), AF_INET);
    }

    #[test]
    fn test_network_route_netmask_record() {
        let req = RouteRequest::network_via(
            Ipv4Addr::new(10, 1, 1, 0),
            24,
            Ipv4Addr::new(10, 77, 77, 2),
        );
        let buf = RouteMessage::add(&req, 0, 1).unwrap().encode();

        assert_eq!(addr_at(&buf, offset::DESTINATION), [10, 1, 1, 0]);
        assert_eq!(addr_at(&buf, offset::GATEWAY), [10, 77, 77, 2]);
        assert_eq!(addr_at(&buf, offset::NETMASK), [255, 255, 255, 0]);
    }

    #[test]
    fn test_header_fields() {
        let req = RouteRequest::default_via(Ipv4Addr::new(192, 168, 1, 1), "net0");
        let buf = RouteMessage::add(&req, 7, 4242).unwrap().encode();

        assert_eq!(u16_at(&buf, offset::MSGLEN) as usize, MESSAGE_LEN);
        assert_eq!(buf[offset::VERSION], RTM_VERSION);
        assert_eq!(buf[offset::TYPE], RTM_ADD);
        assert_eq!(u16_at(&buf, offset::INDEX), 7);
        assert_eq!(i32_at(&buf, offset::FLAGS), RTF_UP | RTF_STATIC | RTF_GATEWAY);
        assert_eq!(i32_at(&buf, offset::ADDRS), 0x7);
        assert_eq!(i32_at(&buf, offset::PID), 4242);
        // seq through metrics are zero
        assert!(buf[20..HEADER_LEN].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_layout_bytes() {
        let req = RouteRequest::network_via(
            Ipv4Addr::new(172, 16, 0, 0),
            12,
            Ipv4Addr::new(172, 16, 0, 1),
        );
        let buf = RouteMessage::add(&req, 0, 0).unwrap().encode();
        let family = AF_INET.to_ne_bytes();

        let expected_netmask = [
            family[0], family[1], 0, 0, 255, 240, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(&buf[offset::NETMASK..], &expected_netmask[..]);
    }

    #[test]
    fn test_install_route_writes_once() {
        let stack = MockStack::new().with_interface("net0", 3);
        let req = RouteRequest::default_via(Ipv4Addr::new(10, 0, 0, 1), "net0");

        install_route(&stack, &req).unwrap();

        let writes = stack.route_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(u16_at(&writes[0], offset::INDEX), 3);
    }

    #[test]
    fn test_install_route_unknown_interface() {
        let stack = MockStack::new();
        let req = RouteRequest::default_via(Ipv4Addr::new(10, 0, 0, 1), "net9");

        let err = install_route(&stack, &req).unwrap_err();
        assert!(matches!(err, RouteError::UnknownInterface(ref n) if n == "net9"));
        assert!(stack.route_writes().is_empty());
    }

    #[test]
    fn test_install_route_short_write_is_not_retried() {
        let stack = MockStack::new().with_short_route_writes(60);
        let req = RouteRequest::network_via(
            Ipv4Addr::new(10, 1, 1, 0),
            24,
            Ipv4Addr::new(10, 77, 77, 2),
        );

        let err = install_route(&stack, &req).unwrap_err();
        assert!(matches!(
            err,
            RouteError::IncompleteWrite { written: 60, expected: MESSAGE_LEN }
        ));
        assert_eq!(stack.route_writes().len(), 1);
    }
}
