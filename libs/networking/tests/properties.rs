//! Property tests for address placement, naming and route encoding.

use std::net::Ipv4Addr;
use std::sync::Arc;

use proptest::prelude::*;

use lxinit_networking::mock::MockStack;
use lxinit_networking::netstack::{normalize, NETSTACK_BUFSZ};
use lxinit_networking::route::prefix_to_netmask;
use lxinit_networking::{
    parse_line, AddressDispatcher, AddressFamily, AddressToken, Applied, InterfaceContext,
    KernelVersion,
};

fn address_for(index: usize, v4: bool) -> String {
    if v4 {
        format!("10.0.{}.{}/24", index / 256, index % 256 + 1)
    } else {
        format!("fd00::{:x}/64", index + 1)
    }
}

fn aobj_number(name: &str) -> u32 {
    name.rsplit_once("/addr")
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(u32::MAX)
}

proptest! {
    /// The first successful IPv4 address takes the base interface; every
    /// other successful address lands on a distinct logical interface of its
    /// family. Names are never reused.
    #[test]
    fn placement_and_naming(entries in prop::collection::vec((any::<bool>(), any::<bool>()), 1..24)) {
        let mut stack = MockStack::new();
        let addrs: Vec<(String, bool, bool)> = entries
            .iter()
            .enumerate()
            .map(|(i, &(v4, reject))| (address_for(i, v4), v4, reject))
            .collect();
        for (addr, _, reject) in &addrs {
            if *reject {
                stack = stack.rejecting_address(addr);
            }
        }
        let stack = Arc::new(stack);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let results: Vec<_> = runtime.block_on(async {
            let mut dispatcher = AddressDispatcher::new(stack.clone(), stack.clone());
            let mut ctx = InterfaceContext::new("net0");
            let mut results = Vec::new();
            for (addr, _, _) in &addrs {
                let token = AddressToken::Literal(addr.clone());
                results.push(dispatcher.apply_address(&mut ctx, &token).await);
            }
            prop_assert_eq!(dispatcher.names_issued() as usize, addrs.len());
            Ok(results)
        })?;

        let mut base_taken = false;
        let mut seen_ifaces = Vec::new();
        let mut last_number = None;

        for ((_, v4, reject), result) in addrs.iter().zip(&results) {
            prop_assert_eq!(result.is_err(), *reject);
            let Ok(Applied::Address { iface, aobj }) = result else {
                continue;
            };

            if *v4 && !base_taken {
                prop_assert_eq!(iface.as_str(), "net0");
                base_taken = true;
            } else {
                prop_assert!(iface.starts_with("net0:"));
                let family = if *v4 { AddressFamily::V4 } else { AddressFamily::V6 };
                prop_assert!(!seen_ifaces.contains(&(iface.clone(), family)));
                seen_ifaces.push((iface.clone(), family));
            }

            prop_assert_eq!(aobj.interface(), iface.as_str());
            let number = aobj_number(aobj.as_str());
            prop_assert!(last_number.map_or(true, |n| number > n));
            last_number = Some(number);
        }
    }

    #[test]
    fn netmask_is_contiguous(prefix in 0u8..=32) {
        let mask = u32::from(prefix_to_netmask(prefix).unwrap());
        prop_assert_eq!(mask.count_ones(), u32::from(prefix));
        prop_assert_eq!(mask.leading_ones(), u32::from(prefix));
    }

    #[test]
    fn netmask_rejects_long_prefix(prefix in 33u8..) {
        prop_assert!(prefix_to_netmask(prefix).is_err());
    }

    #[test]
    fn buffer_profile_is_bounded(major in 0u32..10, minor in 0u32..30, micro in 0u32..300) {
        let profile = normalize(KernelVersion(major, minor, micro));
        prop_assert_eq!(profile.send_buf, NETSTACK_BUFSZ * 2);
        prop_assert_eq!(profile.recv_buf, NETSTACK_BUFSZ * 2);
        prop_assert!(profile.max_buf >= profile.send_buf);
    }

    #[test]
    fn route_line_fields(
        gw in any::<[u8; 4]>(),
        dst in any::<[u8; 4]>(),
        prefix in 0u8..=32,
    ) {
        let gateway = Ipv4Addr::from(gw);
        let network = Ipv4Addr::from(dst);
        let line = format!("{}|{}/{}|false", gateway, network, prefix);

        let parsed = parse_line(&line).unwrap();
        prop_assert_eq!(parsed.request.gateway, gateway);
        prop_assert_eq!(parsed.request.destination, Some((network, prefix)));
        prop_assert!(parsed.request.interface.is_none());
        prop_assert!(parsed.is_next_hop());
    }

    /// Lines without both delimiters never parse.
    #[test]
    fn route_line_without_delimiters_fails(body in "[0-9.]{0,20}") {
        prop_assert!(parse_line(&body).is_err());
    }
}
