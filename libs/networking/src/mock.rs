//! In-memory facilities for tests and dry runs.
//!
//! `MockStack` implements every facility trait, records each call in order,
//! and can be told to fail specific operations.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::address::{AddrObj, AddressManager, AddressObjectName, DhcpAgent, DhcpReply, PlumbOutcome};
use crate::error::FacilityError;
use crate::lif::{AddressFamily, LogicalInterfaces};
use crate::netstack::{BufferProperties, Protocol};
use crate::route::RouteChannel;
use crate::setup::AutoconfService;

/// How the mock DHCP agent answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpBehavior {
    /// Lease starts with return code 0.
    Lease,
    /// The request times out.
    Timeout,
    /// The agent replies with this non-zero code.
    ReturnCode(i32),
    /// The agent cannot be started.
    AgentDown,
}

/// One recorded facility call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Plumb(String, AddressFamily),
    LinkLocal(String),
    AddLogical(String, AddressFamily, String),
    CreateAddrobj(String),
    SetAddr(String, String),
    CreateAddr(String, String),
    DestroyAddrobj(String),
    DhcpEnsure,
    DhcpStart(String),
    SetProp(String, String, Protocol),
    RouteWrite(usize),
    StartAutoconf,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    lif_counters: HashMap<(String, AddressFamily), u32>,
    plumbed: HashSet<(String, AddressFamily)>,
    route_writes: Vec<Vec<u8>>,
}

/// Recording implementation of every facility.
#[derive(Debug)]
pub struct MockStack {
    state: Mutex<MockState>,
    interfaces: HashMap<String, u32>,
    short_route_write: Option<usize>,
    fail_lifs: bool,
    rejected_addrs: HashSet<String>,
    failing_activation: HashSet<String>,
    failing_link_local: HashSet<String>,
    failing_plumb: HashSet<String>,
    failing_props: HashSet<(String, Protocol)>,
    fail_autoconf: bool,
    dhcp: DhcpBehavior,
}

impl Default for MockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStack {
    /// A stack where everything succeeds and only `lo0` has an index.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            interfaces: HashMap::from([("lo0".to_string(), 1)]),
            short_route_write: None,
            fail_lifs: false,
            rejected_addrs: HashSet::new(),
            failing_activation: HashSet::new(),
            failing_link_local: HashSet::new(),
            failing_plumb: HashSet::new(),
            failing_props: HashSet::new(),
            fail_autoconf: false,
            dhcp: DhcpBehavior::Lease,
        }
    }

    /// Register an interface index.
    pub fn with_interface(mut self, name: &str, index: u32) -> Self {
        self.interfaces.insert(name.to_string(), index);
        self
    }

    /// Accept only `len` bytes of each route message.
    pub fn with_short_route_writes(mut self, len: usize) -> Self {
        self.short_route_write = Some(len);
        self
    }

    /// Fail every logical interface allocation.
    pub fn with_failing_logical_interfaces(mut self) -> Self {
        self.fail_lifs = true;
        self
    }

    /// Reject `addr` when it is set on an address object.
    pub fn rejecting_address(mut self, addr: &str) -> Self {
        self.rejected_addrs.insert(addr.to_string());
        self
    }

    /// Fail activation of `addr`.
    pub fn failing_activation(mut self, addr: &str) -> Self {
        self.failing_activation.insert(addr.to_string());
        self
    }

    /// Fail link-local bring-up on `iface`.
    pub fn failing_link_local(mut self, iface: &str) -> Self {
        self.failing_link_local.insert(iface.to_string());
        self
    }

    /// Fail plumbing of `iface`.
    pub fn failing_plumb(mut self, iface: &str) -> Self {
        self.failing_plumb.insert(iface.to_string());
        self
    }

    /// Fail setting `property` for `protocol`.
    pub fn failing_prop(mut self, property: &str, protocol: Protocol) -> Self {
        self.failing_props.insert((property.to_string(), protocol));
        self
    }

    /// Fail the autoconfiguration daemon start.
    pub fn with_failing_autoconf(mut self) -> Self {
        self.fail_autoconf = true;
        self
    }

    pub fn with_dhcp(mut self, behavior: DhcpBehavior) -> Self {
        self.dhcp = behavior;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // a poisoned lock only means another test thread panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: MockCall) {
        debug!(?call, "[MOCK] facility call");
        self.state().calls.push(call);
    }

    /// All calls, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Raw route messages written.
    pub fn route_writes(&self) -> Vec<Vec<u8>> {
        self.state().route_writes.clone()
    }

    /// Names of logical interfaces handed out.
    pub fn logical_interfaces(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::AddLogical(_, _, name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// `(aobj, addr)` pairs that were activated.
    pub fn configured_addresses(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::CreateAddr(aobj, addr) => Some((aobj, addr)),
                _ => None,
            })
            .collect()
    }

    /// `(property, value, protocol)` triples that were set.
    pub fn props(&self) -> Vec<(String, String, Protocol)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::SetProp(name, value, protocol) => Some((name, value, protocol)),
                _ => None,
            })
            .collect()
    }

    /// How many times autoconfiguration was started.
    pub fn autoconf_starts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == MockCall::StartAutoconf)
            .count()
    }
}

impl LogicalInterfaces for MockStack {
    fn add_logical_interface(
        &self,
        base: &str,
        family: AddressFamily,
    ) -> Result<String, FacilityError> {
        if self.fail_lifs {
            return Err(FacilityError::rejected("SIOCLIFADDIF", "no buffer space available"));
        }

        let name = {
            let mut state = self.state();
            let counter = state
                .lif_counters
                .entry((base.to_string(), family))
                .or_insert(0);
            *counter += 1;
            format!("{}:{}", base, counter)
        };

        self.record(MockCall::AddLogical(base.to_string(), family, name.clone()));
        Ok(name)
    }
}

impl AddressManager for MockStack {
    fn plumb(&self, iface: &str, family: AddressFamily) -> Result<PlumbOutcome, FacilityError> {
        if self.failing_plumb.contains(iface) {
            return Err(FacilityError::rejected("create-if", "no such interface"));
        }

        self.record(MockCall::Plumb(iface.to_string(), family));
        let fresh = self.state().plumbed.insert((iface.to_string(), family));
        Ok(if fresh {
            PlumbOutcome::Created
        } else {
            PlumbOutcome::AlreadyExists
        })
    }

    fn bring_up_link_local(&self, iface: &str) -> Result<(), FacilityError> {
        self.record(MockCall::LinkLocal(iface.to_string()));
        if self.failing_link_local.contains(iface) {
            return Err(FacilityError::rejected("SIOCSLIFFLAGS", "no such interface"));
        }
        Ok(())
    }

    fn create_addrobj(&self, name: &AddressObjectName) -> Result<AddrObj, FacilityError> {
        self.record(MockCall::CreateAddrobj(name.to_string()));
        Ok(AddrObj::new(name.clone()))
    }

    fn set_addr(&self, obj: &mut AddrObj, addr: &str) -> Result<(), FacilityError> {
        self.record(MockCall::SetAddr(obj.name().to_string(), addr.to_string()));
        if self.rejected_addrs.contains(addr) {
            return Err(FacilityError::rejected("set address", "invalid address"));
        }
        obj.set_address(addr);
        Ok(())
    }

    fn create_addr(&self, obj: &AddrObj) -> Result<(), FacilityError> {
        let addr = obj.address().unwrap_or_default().to_string();
        if self.failing_activation.contains(&addr) {
            return Err(FacilityError::rejected("create address", "address already in use"));
        }
        self.record(MockCall::CreateAddr(obj.name().to_string(), addr));
        Ok(())
    }

    fn destroy_addrobj(&self, obj: AddrObj) {
        self.record(MockCall::DestroyAddrobj(obj.name().to_string()));
    }
}

#[async_trait]
impl DhcpAgent for MockStack {
    async fn ensure_running(&self, timeout: Duration) -> Result<(), FacilityError> {
        self.record(MockCall::DhcpEnsure);
        if self.dhcp == DhcpBehavior::AgentDown {
            return Err(FacilityError::Timeout {
                operation: "start dhcpagent".to_string(),
                secs: timeout.as_secs(),
            });
        }
        Ok(())
    }

    async fn start_lease(&self, iface: &str, timeout: Duration) -> Result<DhcpReply, FacilityError> {
        self.record(MockCall::DhcpStart(iface.to_string()));
        match self.dhcp {
            DhcpBehavior::Lease | DhcpBehavior::AgentDown => Ok(DhcpReply {
                return_code: 0,
                message: "lease started".to_string(),
            }),
            DhcpBehavior::ReturnCode(code) => Ok(DhcpReply {
                return_code: code,
                message: "operation failed".to_string(),
            }),
            DhcpBehavior::Timeout => Err(FacilityError::Timeout {
                operation: format!("DHCP start on {}", iface),
                secs: timeout.as_secs(),
            }),
        }
    }
}

impl RouteChannel for MockStack {
    fn interface_index(&self, name: &str) -> Option<u32> {
        self.interfaces.get(name).copied()
    }

    fn send_message(&self, message: &[u8]) -> io::Result<usize> {
        let accepted = self
            .short_route_write
            .map_or(message.len(), |len| len.min(message.len()));
        self.record(MockCall::RouteWrite(accepted));
        self.state().route_writes.push(message.to_vec());
        Ok(accepted)
    }
}

impl BufferProperties for MockStack {
    fn set_prop(&self, name: &str, value: &str, protocol: Protocol) -> Result<(), FacilityError> {
        if self.failing_props.contains(&(name.to_string(), protocol)) {
            return Err(FacilityError::rejected("set-prop", "value out of range"));
        }
        self.record(MockCall::SetProp(name.to_string(), value.to_string(), protocol));
        Ok(())
    }
}

#[async_trait]
impl AutoconfService for MockStack {
    async fn start(&self) -> Result<(), FacilityError> {
        if self.fail_autoconf {
            return Err(FacilityError::rejected("in.ndpd", "exited: 1"));
        }
        self.record(MockCall::StartAutoconf);
        Ok(())
    }
}
