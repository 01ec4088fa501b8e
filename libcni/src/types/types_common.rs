// types
use crate::ipnet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/*
 * Note: in this directory, for each cni version, result type is defined and
 * each version's result, except latest version, have conversion function to
 * latest and vice versa. For example, types040 structure (for cniVersion
 * 0.3.0/0.3.1/0.4.0) has 'convert_to_latest()' and 'convert_from_latest()'.
 *
 * In usual cni plugin, once read previous CNI result and convert to latest,
 * then modify (e.g. add interface, ip address), at last return to the
 * further CNI pluign/runtime with the version defined in 'cniVersion' in CNI
 * config.
 */

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct DNS {
    #[serde(rename = "nameservers", default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(rename = "domain", default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(rename = "search", default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(rename = "options", default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl DNS {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_empty()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Route {
    #[serde(rename = "dst")]
    pub dst: ipnet::IPNet,
    #[serde(rename = "gw", default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

// well-known error codes, see CNI SPEC "Error"
pub const ERR_INCOMPATIBLE_VERSION: u32 = 1;
pub const ERR_UNSUPPORTED_FIELD: u32 = 2;
pub const ERR_UNKNOWN_CONTAINER: u32 = 3;
pub const ERR_INVALID_ENV: u32 = 4;
pub const ERR_IO_FAILURE: u32 = 5;
pub const ERR_DECODE_FAILURE: u32 = 6;
pub const ERR_INVALID_NETCONF: u32 = 7;
pub const ERR_TRY_AGAIN_LATER: u32 = 11;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CNIError {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(rename = "code")]
    pub code: u32,
    #[serde(rename = "msg", default)]
    pub msg: String,
    #[serde(rename = "details", default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[test]
fn test_route_without_gw() {
    let route: Route = serde_json::from_str(r#"{"dst":"0.0.0.0/0"}"#).unwrap();
    assert_eq!(route.gw, None);
    assert_eq!(serde_json::to_string(&route).unwrap(), r#"{"dst":"0.0.0.0/0"}"#);
}

#[test]
fn test_cni_error_roundtrip_fields() {
    let err: CNIError =
        serde_json::from_str(r#"{"cniVersion":"0.4.0","code":7,"msg":"bad"}"#).unwrap();
    assert_eq!(err.code, ERR_INVALID_NETCONF);
    assert_eq!(err.details, "");
}
