//! Address assignment.
//!
//! Classifies entries of an interface's address list and applies them:
//! static literals through the ipadm layer, `dhcp` through the DHCP agent,
//! and `addrconf` as a stack-wide request handled after all interfaces.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{FacilityError, Severity};
use crate::lif::{ensure_target, AddressFamily, AllocError, InterfaceContext, LogicalInterfaces};

/// Default bound on DHCP agent start and lease request.
pub const DHCP_TIMEOUT: Duration = Duration::from_secs(5);

/// One entry of a comma-separated address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressToken {
    /// Obtain an IPv4 lease.
    Dhcp,
    /// Enable stateless autoconfiguration for the stack.
    Addrconf,
    /// Static address, bare or CIDR.
    Literal(String),
}

impl AddressToken {
    /// Classify a single, non-empty entry.
    pub fn classify(entry: &str) -> Self {
        match entry {
            "dhcp" => AddressToken::Dhcp,
            "addrconf" => AddressToken::Addrconf,
            other => AddressToken::Literal(other.to_string()),
        }
    }

    /// Split an address list on commas, dropping empty entries, keeping order.
    pub fn parse_list(list: &str) -> Vec<Self> {
        list.split(',')
            .filter(|entry| !entry.is_empty())
            .map(Self::classify)
            .collect()
    }
}

impl std::fmt::Display for AddressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressToken::Dhcp => write!(f, "dhcp"),
            AddressToken::Addrconf => write!(f, "addrconf"),
            AddressToken::Literal(addr) => write!(f, "{}", addr),
        }
    }
}

/// Address object name, `<interface>/addr<N>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressObjectName(String);

impl AddressObjectName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interface part of the name.
    pub fn interface(&self) -> &str {
        self.0.split_once('/').map(|(iface, _)| iface).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for AddressObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run-wide source of address object names.
///
/// The counter is shared by every interface and never rewinds, so a number
/// handed out for a failed assignment is not reused.
#[derive(Debug, Default)]
pub struct AddrObjCounter {
    next: u32,
}

impl AddrObjCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next name for `iface`.
    pub fn next_name(&mut self, iface: &str) -> AddressObjectName {
        let name = AddressObjectName(format!("{}/addr{}", iface, self.next));
        self.next += 1;
        name
    }

    /// Number of names issued so far.
    pub fn issued(&self) -> u32 {
        self.next
    }
}

/// A static address object held between creation and activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrObj {
    name: AddressObjectName,
    address: Option<String>,
}

impl AddrObj {
    pub fn new(name: AddressObjectName) -> Self {
        Self {
            name,
            address: None,
        }
    }

    pub fn name(&self) -> &AddressObjectName {
        &self.name
    }

    /// Address value, once set.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn set_address(&mut self, address: &str) {
        self.address = Some(address.to_string());
    }
}

/// Result of plumbing an interface for one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlumbOutcome {
    Created,
    AlreadyExists,
}

/// The ipadm layer.
pub trait AddressManager: LogicalInterfaces {
    /// Plumb `iface` for `family`. An existing instance is not an error.
    fn plumb(&self, iface: &str, family: AddressFamily) -> Result<PlumbOutcome, FacilityError>;

    /// Mark the IPv6 instance of `iface` up so it derives a link-local address.
    fn bring_up_link_local(&self, iface: &str) -> Result<(), FacilityError>;

    /// Allocate a static address object.
    fn create_addrobj(&self, name: &AddressObjectName) -> Result<AddrObj, FacilityError>;

    /// Set the address value on an object.
    fn set_addr(&self, obj: &mut AddrObj, addr: &str) -> Result<(), FacilityError>;

    /// Create the address in the active configuration and bring it up.
    fn create_addr(&self, obj: &AddrObj) -> Result<(), FacilityError>;

    /// Release an address object handle.
    fn destroy_addrobj(&self, obj: AddrObj);
}

/// Reply to a DHCP start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpReply {
    /// Zero on success.
    pub return_code: i32,

    /// Agent-provided description of the result.
    pub message: String,
}

/// The DHCP agent.
#[async_trait]
pub trait DhcpAgent: Send + Sync {
    /// Make sure the agent is running, starting it if needed.
    async fn ensure_running(&self, timeout: Duration) -> Result<(), FacilityError>;

    /// Ask the agent to start a lease on `iface` and wait for the reply.
    async fn start_lease(&self, iface: &str, timeout: Duration) -> Result<DhcpReply, FacilityError>;
}

/// Which ipadm step failed for a static address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    CreateObject,
    SetValue,
    Activate,
}

impl std::fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyStage::CreateObject => write!(f, "create address object"),
            ApplyStage::SetValue => write!(f, "set address"),
            ApplyStage::Activate => write!(f, "create address"),
        }
    }
}

/// Address assignment errors.
#[derive(Debug, Error)]
pub enum AddressError {
    /// No target interface could be obtained.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// An ipadm step failed for a static address.
    #[error("{stage} failed: addr {addr}, interface {iface}: {source}")]
    Apply {
        iface: String,
        addr: String,
        stage: ApplyStage,
        #[source]
        source: FacilityError,
    },

    /// The lease request failed, timed out, or returned non-zero.
    #[error("failed to start DHCP on {iface}: {source}")]
    Dhcp {
        iface: String,
        #[source]
        source: FacilityError,
    },

    /// The DHCP agent could not be started.
    #[error("failed to start dhcpagent: {0}")]
    DhcpAgent(#[source] FacilityError),
}

impl AddressError {
    pub fn severity(&self) -> Severity {
        match self {
            AddressError::DhcpAgent(_) => Severity::Fatal,
            _ => Severity::Warning,
        }
    }
}

/// What an applied token did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A static address is up on `iface` under `aobj`.
    Address {
        iface: String,
        aobj: AddressObjectName,
    },
    /// A lease was started on `iface`.
    Lease { iface: String },
    /// Autoconfiguration was requested for the stack.
    Addrconf,
}

/// Applies address tokens, carrying the run-wide naming counter and the
/// deferred autoconfiguration request.
pub struct AddressDispatcher {
    addresses: Arc<dyn AddressManager>,
    dhcp: Arc<dyn DhcpAgent>,
    names: AddrObjCounter,
    dhcp_timeout: Duration,
    addrconf_requested: bool,
}

impl AddressDispatcher {
    pub fn new(addresses: Arc<dyn AddressManager>, dhcp: Arc<dyn DhcpAgent>) -> Self {
        Self {
            addresses,
            dhcp,
            names: AddrObjCounter::new(),
            dhcp_timeout: DHCP_TIMEOUT,
            addrconf_requested: false,
        }
    }

    /// Override the DHCP bound.
    pub fn with_dhcp_timeout(mut self, timeout: Duration) -> Self {
        self.dhcp_timeout = timeout;
        self
    }

    /// Whether any token so far asked for autoconfiguration.
    pub fn addrconf_requested(&self) -> bool {
        self.addrconf_requested
    }

    /// Address object names issued so far.
    pub fn names_issued(&self) -> u32 {
        self.names.issued()
    }

    /// Apply one token to `iface`.
    pub async fn apply_address(
        &mut self,
        iface: &mut InterfaceContext,
        token: &AddressToken,
    ) -> Result<Applied, AddressError> {
        match token {
            AddressToken::Dhcp => self.start_dhcp(iface).await,
            AddressToken::Addrconf => {
                self.addrconf_requested = true;
                debug!(iface = %iface.base_name(), "addrconf requested");
                Ok(Applied::Addrconf)
            }
            AddressToken::Literal(addr) => self.apply_literal(iface, addr),
        }
    }

    async fn start_dhcp(&mut self, iface: &mut InterfaceContext) -> Result<Applied, AddressError> {
        let target = ensure_target(&*self.addresses, iface, AddressFamily::V4)?;

        self.dhcp
            .ensure_running(self.dhcp_timeout)
            .await
            .map_err(AddressError::DhcpAgent)?;

        let reply = self
            .dhcp
            .start_lease(&target, self.dhcp_timeout)
            .await
            .map_err(|source| AddressError::Dhcp {
                iface: target.clone(),
                source,
            })?;

        if reply.return_code != 0 {
            return Err(AddressError::Dhcp {
                iface: target,
                source: FacilityError::rejected(
                    "DHCP start",
                    format!("return code {}: {}", reply.return_code, reply.message),
                ),
            });
        }

        iface.mark_ipv4_configured();
        info!(iface = %target, "DHCP lease started");
        Ok(Applied::Lease { iface: target })
    }

    fn apply_literal(
        &mut self,
        iface: &mut InterfaceContext,
        addr: &str,
    ) -> Result<Applied, AddressError> {
        let family = AddressFamily::of_literal(addr);
        let target = ensure_target(&*self.addresses, iface, family)?;
        let aobj = self.names.next_name(&target);

        let apply_err = |stage: ApplyStage| {
            let iface = target.clone();
            move |source: FacilityError| AddressError::Apply {
                iface,
                addr: addr.to_string(),
                stage,
                source,
            }
        };

        let mut obj = self
            .addresses
            .create_addrobj(&aobj)
            .map_err(apply_err(ApplyStage::CreateObject))?;

        let result = self
            .addresses
            .set_addr(&mut obj, addr)
            .map_err(apply_err(ApplyStage::SetValue))
            .and_then(|()| {
                self.addresses
                    .create_addr(&obj)
                    .map_err(apply_err(ApplyStage::Activate))
            });
        self.addresses.destroy_addrobj(obj);
        result?;

        if family == AddressFamily::V4 {
            iface.mark_ipv4_configured();
        }

        info!(iface = %target, %aobj, addr, "address configured");
        Ok(Applied::Address { iface: target, aobj })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DhcpBehavior, MockCall, MockStack};

    fn dispatcher(stack: &Arc<MockStack>) -> AddressDispatcher {
        AddressDispatcher::new(stack.clone(), stack.clone())
    }

    fn literal(s: &str) -> AddressToken {
        AddressToken::Literal(s.to_string())
    }

    #[test]
    fn test_parse_list() {
        let tokens = AddressToken::parse_list("10.0.0.2/24,dhcp,,fd00::2/64,addrconf");
        assert_eq!(
            tokens,
            vec![
                literal("10.0.0.2/24"),
                AddressToken::Dhcp,
                literal("fd00::2/64"),
                AddressToken::Addrconf,
            ]
        );
        assert!(AddressToken::parse_list("").is_empty());
    }

    #[test]
    fn test_counter_names() {
        let mut names = AddrObjCounter::new();
        assert_eq!(names.next_name("lo0").as_str(), "lo0/addr0");
        let second = names.next_name("net0:1");
        assert_eq!(second.as_str(), "net0:1/addr1");
        assert_eq!(second.interface(), "net0:1");
        assert_eq!(names.issued(), 2);
    }

    #[tokio::test]
    async fn test_ipv4_literals_first_on_base() {
        let stack = Arc::new(MockStack::new());
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let first = d.apply_address(&mut ctx, &literal("10.0.0.2/24")).await.unwrap();
        let second = d.apply_address(&mut ctx, &literal("10.0.0.3/24")).await.unwrap();

        assert!(matches!(first, Applied::Address { ref iface, .. } if iface == "net0"));
        assert!(matches!(second, Applied::Address { ref iface, .. } if iface == "net0:1"));
        assert!(ctx.first_ipv4_configured());
        assert_eq!(
            stack.configured_addresses(),
            vec![
                ("net0/addr0".to_string(), "10.0.0.2/24".to_string()),
                ("net0:1/addr1".to_string(), "10.0.0.3/24".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_ipv6_literal_never_on_base() {
        let stack = Arc::new(MockStack::new());
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let applied = d.apply_address(&mut ctx, &literal("fd00::2/64")).await.unwrap();
        assert!(matches!(applied, Applied::Address { ref iface, .. } if iface == "net0:1"));
        assert!(!ctx.first_ipv4_configured());
    }

    #[tokio::test]
    async fn test_failed_literal_keeps_flag_and_burns_name() {
        let stack = Arc::new(MockStack::new().rejecting_address("10.0.0.2/24"));
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let err = d.apply_address(&mut ctx, &literal("10.0.0.2/24")).await.unwrap_err();
        assert!(matches!(
            err,
            AddressError::Apply { stage: ApplyStage::SetValue, .. }
        ));
        assert_eq!(err.severity(), Severity::Warning);
        assert!(!ctx.first_ipv4_configured());

        // next address still lands on the base, with a fresh name
        let applied = d.apply_address(&mut ctx, &literal("10.0.0.3/24")).await.unwrap();
        assert_eq!(
            applied,
            Applied::Address {
                iface: "net0".to_string(),
                aobj: AddressObjectName("net0/addr1".to_string()),
            }
        );
        assert!(stack
            .calls()
            .contains(&MockCall::DestroyAddrobj("net0/addr0".to_string())));
    }

    #[tokio::test]
    async fn test_activation_failure_destroys_object() {
        let stack = Arc::new(MockStack::new().failing_activation("10.0.0.9/24"));
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let err = d.apply_address(&mut ctx, &literal("10.0.0.9/24")).await.unwrap_err();
        assert!(matches!(
            err,
            AddressError::Apply { stage: ApplyStage::Activate, .. }
        ));
        assert!(stack
            .calls()
            .contains(&MockCall::DestroyAddrobj("net0/addr0".to_string())));
    }

    #[tokio::test]
    async fn test_dhcp_success_marks_ipv4() {
        let stack = Arc::new(MockStack::new());
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let applied = d.apply_address(&mut ctx, &AddressToken::Dhcp).await.unwrap();
        assert_eq!(applied, Applied::Lease { iface: "net0".to_string() });
        assert!(ctx.first_ipv4_configured());
        assert!(stack.calls().contains(&MockCall::DhcpStart("net0".to_string())));
    }

    #[tokio::test]
    async fn test_dhcp_timeout_is_warning() {
        let stack = Arc::new(MockStack::new().with_dhcp(DhcpBehavior::Timeout));
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let err = d.apply_address(&mut ctx, &AddressToken::Dhcp).await.unwrap_err();
        assert!(matches!(err, AddressError::Dhcp { ref source, .. } if source.is_timeout()));
        assert_eq!(err.severity(), Severity::Warning);
        assert!(!ctx.first_ipv4_configured());
    }

    #[tokio::test]
    async fn test_dhcp_nonzero_return_code() {
        let stack = Arc::new(MockStack::new().with_dhcp(DhcpBehavior::ReturnCode(3)));
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let err = d.apply_address(&mut ctx, &AddressToken::Dhcp).await.unwrap_err();
        assert!(err.to_string().contains("return code 3"));
        assert!(!ctx.first_ipv4_configured());
    }

    #[tokio::test]
    async fn test_dhcp_agent_down_is_fatal() {
        let stack = Arc::new(MockStack::new().with_dhcp(DhcpBehavior::AgentDown));
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        let err = d.apply_address(&mut ctx, &AddressToken::Dhcp).await.unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[tokio::test]
    async fn test_addrconf_is_deferred() {
        let stack = Arc::new(MockStack::new());
        let mut d = dispatcher(&stack);
        let mut ctx = InterfaceContext::new("net0");

        assert!(!d.addrconf_requested());
        let applied = d.apply_address(&mut ctx, &AddressToken::Addrconf).await.unwrap();
        assert_eq!(applied, Applied::Addrconf);
        assert!(d.addrconf_requested());
        assert!(stack.configured_addresses().is_empty());
        assert_eq!(d.names_issued(), 0);
    }
}
