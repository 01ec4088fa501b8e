// types_100: the latest result layout, every other version converts to it
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::types_common::*;
use crate::ipnet;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNI100Interface {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "mac", default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(rename = "sandbox", default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNI100IPAddress {
    #[serde(rename = "interface", default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<u8>,
    #[serde(rename = "address")]
    pub address: ipnet::IPNet,
    #[serde(rename = "gateway", default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNI100Result {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(rename = "interfaces", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CNI100Interface>,
    #[serde(rename = "ips", default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<CNI100IPAddress>,
    #[serde(rename = "routes", default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(rename = "dns", default, skip_serializing_if = "DNS::is_empty")]
    pub dns: DNS,
}

#[test]
fn test_serialize_result_100() {
    let result = CNI100Result {
        cni_version: "1.0.0".to_string(),
        interfaces: vec![CNI100Interface {
            name: "eth0".to_string(),
            mac: "0a:58:0a:01:02:05".to_string(),
            sandbox: "/proc/1/ns/net".to_string(),
        }],
        ips: vec![CNI100IPAddress {
            interface: Some(0),
            address: "10.1.2.5/24".parse().unwrap(),
            gateway: None,
        }],
        routes: vec![],
        dns: DNS::default(),
    };
    let out = serde_json::to_string(&result).unwrap();

    assert!(out.contains(r#""address":"10.1.2.5/24""#));
    assert!(!out.contains("gateway"));
    assert!(!out.contains("routes"));
    assert!(!out.contains("dns"));
}
