// types_040: result layout shared by CNI 0.3.0, 0.3.1 and 0.4.0
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::types_100::*;
use super::types_common::Route;
use super::types_common::DNS;
use crate::ipnet;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNI040Interface {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "mac", default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(rename = "sandbox", default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

impl From<&CNI040Interface> for CNI100Interface {
    fn from(iface: &CNI040Interface) -> CNI100Interface {
        CNI100Interface {
            name: iface.name.clone(),
            mac: iface.mac.clone(),
            sandbox: iface.sandbox.clone(),
        }
    }
}

impl From<&CNI100Interface> for CNI040Interface {
    fn from(latest: &CNI100Interface) -> CNI040Interface {
        CNI040Interface {
            name: latest.name.clone(),
            mac: latest.mac.clone(),
            sandbox: latest.sandbox.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNI040IPAddress {
    /// "4" or "6"; dropped in 1.0.0 where the address itself tells
    #[serde(rename = "version")]
    pub version: String,
    #[serde(rename = "interface", default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<u8>,
    #[serde(rename = "address")]
    pub address: ipnet::IPNet,
    #[serde(rename = "gateway", default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

impl From<&CNI040IPAddress> for CNI100IPAddress {
    fn from(ipc: &CNI040IPAddress) -> CNI100IPAddress {
        CNI100IPAddress {
            interface: ipc.interface,
            address: ipc.address.clone(),
            gateway: ipc.gateway,
        }
    }
}

impl From<&CNI100IPAddress> for CNI040IPAddress {
    fn from(latest: &CNI100IPAddress) -> CNI040IPAddress {
        let version = match latest.address.ip {
            IpAddr::V4(_) => "4",
            IpAddr::V6(_) => "6",
        };
        CNI040IPAddress {
            version: version.to_string(),
            interface: latest.interface,
            address: latest.address.clone(),
            gateway: latest.gateway,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNI040Result {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(rename = "interfaces", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CNI040Interface>,
    #[serde(rename = "ips", default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<CNI040IPAddress>,
    #[serde(rename = "routes", default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(rename = "dns", default, skip_serializing_if = "DNS::is_empty")]
    pub dns: DNS,
}

impl CNI040Result {
    pub fn convert_to_latest(&self) -> CNI100Result {
        CNI100Result {
            cni_version: "1.0.0".to_string(),
            interfaces: self.interfaces.iter().map(CNI100Interface::from).collect(),
            ips: self.ips.iter().map(CNI100IPAddress::from).collect(),
            routes: self.routes.clone(),
            dns: self.dns.clone(),
        }
    }

    pub fn convert_from_latest(latest: &CNI100Result, cni_version: &str) -> CNI040Result {
        CNI040Result {
            cni_version: cni_version.to_string(),
            interfaces: latest.interfaces.iter().map(CNI040Interface::from).collect(),
            ips: latest.ips.iter().map(CNI040IPAddress::from).collect(),
            routes: latest.routes.clone(),
            dns: latest.dns.clone(),
        }
    }
}

#[test]
fn test_convert_from_latest_040_sets_version() {
    let latest = CNI100IPAddress {
        interface: Some(2),
        address: "fd00::5/64".parse().unwrap(),
        gateway: None,
    };
    let ipc = CNI040IPAddress::from(&latest);
    assert_eq!(ipc.version, "6");
    assert_eq!(ipc.interface, Some(2));
}

#[test]
fn test_040_output_layout() {
    let latest = CNI100Result {
        cni_version: "1.0.0".to_string(),
        interfaces: vec![CNI100Interface {
            name: "eth0".to_string(),
            mac: "0a:58:0a:01:02:05".to_string(),
            sandbox: "/proc/1/ns/net".to_string(),
        }],
        ips: vec![CNI100IPAddress {
            interface: Some(0),
            address: "10.1.2.5/24".parse().unwrap(),
            gateway: Some("10.1.2.1".parse().unwrap()),
        }],
        routes: vec![],
        dns: DNS::default(),
    };
    let out = serde_json::to_value(CNI040Result::convert_from_latest(&latest, "0.3.1")).unwrap();

    assert_eq!(out["cniVersion"], "0.3.1");
    assert_eq!(out["ips"][0]["version"], "4");
    assert_eq!(out["ips"][0]["gateway"], "10.1.2.1");
    assert_eq!(out["interfaces"][0]["sandbox"], "/proc/1/ns/net");
    assert!(out.get("dns").is_none());
    assert!(out.get("routes").is_none());
}
