use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

extern crate ipnet;
use ipnet::{IpAdd, IpNet};
use libcni::ipnet::IPNet;
use libcni::types::types_100::CNI100Result;
use libcni::types::types_common::Route;

use crate::config::NetConf;
use crate::error::PluginError;

// all allocated addresses refer to the container interface, which is the
// third entry of result.interfaces (bridge, host veth, container veth)
pub const CONTAINER_IFACE_INDEX: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn default_net(&self) -> IPNet {
        IPNet {
            ip: match self {
                Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            },
            netmask_len: 0,
        }
    }

    pub fn of(ip: &IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

#[derive(Debug)]
pub struct GatewayInfo {
    pub gws: Vec<IpNet>,
    pub family: Family,
    pub default_route_found: bool,
}

impl GatewayInfo {
    fn new(family: Family) -> Self {
        GatewayInfo {
            gws: vec![],
            family,
            default_route_found: false,
        }
    }
}

// IPv4 wins when the address is representable in 4 bytes, so IPv4-mapped
// IPv6 addresses are folded back to plain IPv4
fn classify(address: &IPNet) -> Result<(IpNet, Family), PluginError> {
    let unknown = || PluginError::UnknownAddressFamily(format!("{}", address));
    match address.ip {
        IpAddr::V4(v4addr) => IpNet::new(IpAddr::V4(v4addr), address.netmask_len)
            .map(|n| (n, Family::V4))
            .map_err(|_| unknown()),
        IpAddr::V6(v6addr) => match v6addr.to_ipv4_mapped() {
            Some(v4addr) if address.netmask_len >= 96 => {
                IpNet::new(IpAddr::V4(v4addr), address.netmask_len - 96)
                    .map(|n| (n, Family::V4))
                    .map_err(|_| unknown())
            }
            _ => IpNet::new(IpAddr::V6(v6addr), address.netmask_len)
                .map(|n| (n, Family::V6))
                .map_err(|_| unknown()),
        },
    }
}

pub fn calc_gateway_ip(ipn: &IpNet) -> IpAddr {
    match ipn {
        IpNet::V4(n) => IpAddr::V4(n.network().saturating_add(1)),
        IpNet::V6(n) => IpAddr::V6(n.network().saturating_add(1)),
    }
}

fn is_default_route(route: &Route, default_net: &IPNet) -> bool {
    route.gw.is_some() && route.dst == *default_net
}

/// Walks the allocated addresses and, per address family, collects the
/// gateway addresses to put on the bridge. When acting as default gateway
/// a default route is appended for every family that lacks one.
pub fn calc_gateways(
    result: &mut CNI100Result,
    n: &NetConf,
) -> Result<(GatewayInfo, GatewayInfo), PluginError> {
    let mut gws_v4 = GatewayInfo::new(Family::V4);
    let mut gws_v6 = GatewayInfo::new(Family::V6);

    for ipc in result.ips.iter_mut() {
        let (address, family) = classify(&ipc.address)?;
        ipc.address = address.into();
        let gws = match family {
            Family::V4 => &mut gws_v4,
            Family::V6 => &mut gws_v6,
        };

        ipc.interface = Some(CONTAINER_IFACE_INDEX);

        if ipc.gateway.is_none() && n.is_gw {
            ipc.gateway = Some(calc_gateway_ip(&address));
        }

        if n.is_default_gw && !gws.default_route_found {
            let default_net = family.default_net();
            gws.default_route_found = result
                .routes
                .iter()
                .any(|route| is_default_route(route, &default_net));
            if !gws.default_route_found {
                result.routes.push(Route {
                    dst: default_net,
                    gw: ipc.gateway,
                });
                gws.default_route_found = true;
            }
        }

        if n.is_gw {
            if let Some(gw) = ipc.gateway {
                let gw = IpNet::new(gw, address.prefix_len())
                    .map_err(|_| PluginError::UnknownAddressFamily(format!("gateway {}", gw)))?;
                gws.gws.push(gw);
            }
        }
    }
    Ok((gws_v4, gws_v6))
}

#[cfg(test)]
fn test_result(ips: &[&str]) -> CNI100Result {
    use libcni::types::types_100::CNI100IPAddress;
    use libcni::types::types_common::DNS;

    CNI100Result {
        cni_version: "1.0.0".to_string(),
        interfaces: vec![],
        ips: ips
            .iter()
            .map(|ip| CNI100IPAddress {
                interface: None,
                address: ip.parse().unwrap(),
                gateway: None,
            })
            .collect(),
        routes: vec![],
        dns: DNS::default(),
    }
}

#[cfg(test)]
fn test_conf(is_gw: bool, is_default_gw: bool) -> NetConf {
    crate::config::load_netconf(&format!(
        r#"{{"name":"n","bridge":"br0","isGateway":{},"isDefaultGateway":{},"ipam":{{"type":"dhcp"}}}}"#,
        is_gw, is_default_gw
    ))
    .unwrap()
}

#[test]
fn test_calc_gateway_ip_first_host() {
    let ipn: IpNet = "10.1.2.5/24".parse().unwrap();
    assert_eq!(calc_gateway_ip(&ipn), "10.1.2.1".parse::<IpAddr>().unwrap());

    let ipn: IpNet = "172.16.9.200/20".parse().unwrap();
    assert_eq!(calc_gateway_ip(&ipn), "172.16.0.1".parse::<IpAddr>().unwrap());

    let ipn: IpNet = "fd00:1:2::77/64".parse().unwrap();
    assert_eq!(calc_gateway_ip(&ipn), "fd00:1:2::1".parse::<IpAddr>().unwrap());
}

#[test]
fn test_calc_gateways_default_gateway_scenario() {
    let mut result = test_result(&["10.1.2.5/24"]);
    let (v4, v6) = calc_gateways(&mut result, &test_conf(true, true)).unwrap();

    assert_eq!(result.ips[0].gateway, Some("10.1.2.1".parse().unwrap()));
    assert_eq!(result.ips[0].interface, Some(CONTAINER_IFACE_INDEX));
    assert_eq!(
        result.routes,
        vec![Route {
            dst: "0.0.0.0/0".parse().unwrap(),
            gw: Some("10.1.2.1".parse().unwrap()),
        }]
    );
    assert_eq!(v4.gws, vec!["10.1.2.1/24".parse::<IpNet>().unwrap()]);
    assert!(v4.default_route_found);
    assert!(v6.gws.is_empty());
}

#[test]
fn test_calc_gateways_one_default_route_per_family() {
    let mut result = test_result(&["10.1.2.5/24", "10.1.3.5/24", "fd00::5/64"]);
    let (v4, v6) = calc_gateways(&mut result, &test_conf(true, true)).unwrap();

    assert_eq!(result.routes.len(), 2);
    assert_eq!(result.routes[0].dst, "0.0.0.0/0".parse().unwrap());
    assert_eq!(result.routes[1].dst, "::/0".parse().unwrap());
    assert_eq!(result.routes[1].gw, Some("fd00::1".parse().unwrap()));
    assert_eq!(v4.gws.len(), 2);
    assert_eq!(v6.gws.len(), 1);
}

#[test]
fn test_calc_gateways_keeps_existing_default_route() {
    let mut result = test_result(&["10.1.2.5/24"]);
    result.routes.push(Route {
        dst: "0.0.0.0/0".parse().unwrap(),
        gw: Some("10.1.2.254".parse().unwrap()),
    });
    let (v4, _) = calc_gateways(&mut result, &test_conf(true, true)).unwrap();

    assert_eq!(result.routes.len(), 1);
    assert_eq!(result.routes[0].gw, Some("10.1.2.254".parse().unwrap()));
    assert!(v4.default_route_found);
}

#[test]
fn test_calc_gateways_respects_delegate_gateway() {
    let mut result = test_result(&["10.1.2.5/24"]);
    result.ips[0].gateway = Some("10.1.2.254".parse().unwrap());
    let (v4, _) = calc_gateways(&mut result, &test_conf(true, false)).unwrap();

    assert!(result.routes.is_empty());
    assert_eq!(v4.gws, vec!["10.1.2.254/24".parse::<IpNet>().unwrap()]);
}

#[test]
fn test_calc_gateways_not_gateway() {
    let mut result = test_result(&["10.1.2.5/24"]);
    let (v4, v6) = calc_gateways(&mut result, &test_conf(false, false)).unwrap();

    assert_eq!(result.ips[0].gateway, None);
    assert!(result.routes.is_empty());
    assert!(v4.gws.is_empty() && v6.gws.is_empty());
}

#[test]
fn test_calc_gateways_is_repeatable() {
    let mut result = test_result(&["10.1.2.5/24"]);
    let conf = test_conf(true, true);
    calc_gateways(&mut result, &conf).unwrap();
    calc_gateways(&mut result, &conf).unwrap();

    assert_eq!(result.routes.len(), 1);
}

#[test]
fn test_classify_ipv4_mapped() {
    let mut result = test_result(&["::ffff:10.1.2.5/120"]);
    let (v4, v6) = calc_gateways(&mut result, &test_conf(true, false)).unwrap();

    assert_eq!(result.ips[0].address, "10.1.2.5/24".parse().unwrap());
    assert_eq!(v4.gws, vec!["10.1.2.1/24".parse::<IpNet>().unwrap()]);
    assert!(v6.gws.is_empty());
}

#[test]
fn test_classify_bad_prefix() {
    let mut result = test_result(&["10.1.2.5/40"]);
    assert!(matches!(
        calc_gateways(&mut result, &test_conf(true, false)),
        Err(PluginError::UnknownAddressFamily(_))
    ));
}
