// types_020: the ip4/ip6 layout of CNI 0.1.0 and 0.2.0
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::types_100::*;
use super::types_common::Route;
use super::types_common::DNS;
use crate::ipnet;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNI020IPAddress {
    #[serde(rename = "ip")]
    pub address: ipnet::IPNet,
    #[serde(rename = "gateway", default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(rename = "routes", default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl CNI020IPAddress {
    // 0.2.0 carries one address per family, the first one of that family wins
    fn first_of_family(latest: &CNI100Result, v4: bool) -> Option<CNI020IPAddress> {
        let ipc = latest
            .ips
            .iter()
            .find(|ipc| ipc.address.ip.is_ipv4() == v4)?;
        Some(CNI020IPAddress {
            address: ipc.address.clone(),
            gateway: ipc.gateway,
            routes: latest
                .routes
                .iter()
                .filter(|route| route.dst.ip.is_ipv4() == v4)
                .cloned()
                .collect(),
        })
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CNI020Result {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(rename = "ip4", default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<CNI020IPAddress>,
    #[serde(rename = "ip6", default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<CNI020IPAddress>,
    #[serde(rename = "dns", default, skip_serializing_if = "DNS::is_empty")]
    pub dns: DNS,
}

impl CNI020Result {
    pub fn convert_to_latest(&self) -> CNI100Result {
        let families = || self.ip4.iter().chain(self.ip6.iter());
        CNI100Result {
            cni_version: "1.0.0".to_string(),
            interfaces: vec![],
            ips: families()
                .map(|ipc| CNI100IPAddress {
                    interface: None,
                    address: ipc.address.clone(),
                    gateway: ipc.gateway,
                })
                .collect(),
            routes: families().flat_map(|ipc| ipc.routes.iter().cloned()).collect(),
            dns: self.dns.clone(),
        }
    }

    pub fn convert_from_latest(latest: &CNI100Result, cni_version: &str) -> CNI020Result {
        CNI020Result {
            cni_version: cni_version.to_string(),
            ip4: CNI020IPAddress::first_of_family(latest, true),
            ip6: CNI020IPAddress::first_of_family(latest, false),
            dns: latest.dns.clone(),
        }
    }
}

#[test]
fn test_convert_from_latest_020_splits_families() {
    let latest = CNI100Result {
        cni_version: "1.0.0".to_string(),
        interfaces: vec![],
        ips: vec![
            CNI100IPAddress {
                interface: Some(2),
                address: "fd00::5/64".parse().unwrap(),
                gateway: None,
            },
            CNI100IPAddress {
                interface: Some(2),
                address: "10.1.2.5/24".parse().unwrap(),
                gateway: Some("10.1.2.1".parse().unwrap()),
            },
        ],
        routes: vec![Route {
            dst: "0.0.0.0/0".parse().unwrap(),
            gw: Some("10.1.2.1".parse().unwrap()),
        }],
        dns: DNS::default(),
    };
    let old = CNI020Result::convert_from_latest(&latest, "0.2.0");

    let ip4 = old.ip4.unwrap();
    assert_eq!(ip4.address, "10.1.2.5/24".parse().unwrap());
    assert_eq!(ip4.routes.len(), 1);
    let ip6 = old.ip6.unwrap();
    assert!(ip6.routes.is_empty());
}

#[test]
fn test_convert_020_to_latest() {
    let old: CNI020Result = serde_json::from_str(
        r#"{"cniVersion":"0.2.0","ip4":{"ip":"10.1.2.5/24","gateway":"10.1.2.1","routes":[{"dst":"0.0.0.0/0"}]}}"#,
    )
    .unwrap();
    let latest = old.convert_to_latest();

    assert_eq!(latest.ips.len(), 1);
    assert_eq!(latest.ips[0].gateway, Some("10.1.2.1".parse().unwrap()));
    assert_eq!(latest.routes.len(), 1);
    assert!(latest.routes[0].gw.is_none());
}
