//! Network configuration engine for zone boot.
//!
//! This library decides how a zone's declared network configuration turns
//! into kernel state:
//! - Logical interface allocation per address family
//! - Static, DHCP and autoconf address assignment
//! - Routing-socket message encoding for default and static routes
//! - Parsing of the static route feed
//! - Netstack buffer normalization by declared kernel release
//!
//! Every side effect goes through a facility trait (`AddressManager`,
//! `DhcpAgent`, `RouteChannel`, `BufferProperties`, `AutoconfService`) so the
//! boot binary can supply real implementations and tests can use
//! [`mock::MockStack`].

pub mod address;
pub mod error;
pub mod lif;
pub mod mock;
pub mod netstack;
pub mod route;
pub mod setup;
pub mod static_route;

pub use address::{
    AddrObj, AddrObjCounter, AddressDispatcher, AddressError, AddressManager, AddressObjectName,
    AddressToken, Applied, DhcpAgent, DhcpReply, PlumbOutcome, DHCP_TIMEOUT,
};
pub use error::{FacilityError, Severity};
pub use lif::{ensure_target, AddressFamily, AllocError, InterfaceContext, LogicalInterfaces};
pub use netstack::{
    BufferProperties, KernelVersion, NetstackBufferProfile, PropertyFailure, Protocol,
};
pub use route::{install_route, RouteChannel, RouteError, RouteMessage, RouteRequest};
pub use setup::{
    AutoconfService, Facilities, InterfaceConfig, NetworkSetup, SetupError, SetupReport,
    SetupWarning,
};
pub use static_route::{apply_line, parse_line, ParseError, StaticRouteError, StaticRouteLine};
