use std::path::PathBuf;

use libcni::skel::NetConf as CNINetConf;
use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::error::PluginError;

pub const DEFAULT_BRIDGE_NAME: &str = "cni0";

fn default_bridge_name() -> String {
    DEFAULT_BRIDGE_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_start_delay() -> u64 {
    20
}

fn default_ipsec_log_file() -> PathBuf {
    PathBuf::from("/tmp/cni-swan.log")
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/var/run/netns")
}

fn default_config_root() -> PathBuf {
    PathBuf::from("/etc/netns")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/etc/ipsec.d/run")
}

fn default_ipsec_bin() -> String {
    "ipsec".to_string()
}

fn default_ip_bin() -> String {
    "ip".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct IpsecConf {
    #[serde(rename = "enabled", default = "default_true")]
    pub enabled: bool,
    /// template file; the built-in client template is used when unset
    #[serde(rename = "template", default)]
    pub template: Option<PathBuf>,
    /// seconds to wait before `ipsec start` inside the namespace
    #[serde(rename = "startDelay", default = "default_start_delay")]
    pub start_delay: u64,
    #[serde(rename = "logFile", default = "default_ipsec_log_file")]
    pub log_file: PathBuf,
    #[serde(rename = "netnsDir", default = "default_netns_dir")]
    pub netns_dir: PathBuf,
    #[serde(rename = "configRoot", default = "default_config_root")]
    pub config_root: PathBuf,
    #[serde(rename = "runDir", default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(rename = "ipsecBin", default = "default_ipsec_bin")]
    pub ipsec_bin: String,
    #[serde(rename = "ipBin", default = "default_ip_bin")]
    pub ip_bin: String,
}

impl Default for IpsecConf {
    fn default() -> Self {
        IpsecConf {
            enabled: true,
            template: None,
            start_delay: default_start_delay(),
            log_file: default_ipsec_log_file(),
            netns_dir: default_netns_dir(),
            config_root: default_config_root(),
            run_dir: default_run_dir(),
            ipsec_bin: default_ipsec_bin(),
            ip_bin: default_ip_bin(),
        }
    }
}

#[derive(Deserialize, Debug, Validate)]
pub struct NetConf {
    #[serde(flatten)]
    pub netconf: CNINetConf,

    #[validate(custom = "validate_ifname")]
    #[serde(rename = "bridge", default = "default_bridge_name")]
    pub br_name: String,
    #[serde(rename = "isGateway", default)]
    pub is_gw: bool,
    #[serde(rename = "isDefaultGateway", default)]
    pub is_default_gw: bool,
    #[serde(rename = "forceAddress", default)]
    pub force_address: bool,
    #[serde(rename = "ipMasq", default)]
    pub ip_masq: bool,
    #[validate(range(max = 65535))]
    #[serde(rename = "mtu", default)]
    pub mtu: u32,
    #[serde(rename = "hairpinMode", default)]
    pub hairpin_mode: bool,
    #[serde(rename = "promiscMode", default)]
    pub promisc_mode: bool,

    #[serde(rename = "ipsec", default)]
    pub ipsec: IpsecConf,
}

// IFNAMSIZ limits bytes, not characters, and keeps one for the NUL
fn validate_ifname(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > 15 {
        let mut err = ValidationError::new("ifname");
        err.message = Some(format!("interface name {:?} must be 1 to 15 bytes", name).into());
        return Err(err);
    }
    Ok(())
}

impl NetConf {
    pub fn ipam_type(&self) -> &str {
        self.netconf.ipam["type"].as_str().unwrap_or_default()
    }

    pub fn cni_version(&self) -> &str {
        &self.netconf.cni_version
    }

    // hairpin reflects frames back out of the same bridge port, promisc
    // floods them to it; a port cannot do both
    pub fn check_modes(&self) -> Result<(), PluginError> {
        if self.hairpin_mode && self.promisc_mode {
            return Err(PluginError::ConflictingModes);
        }
        Ok(())
    }
}

pub fn load_netconf(bytes: &str) -> Result<NetConf, PluginError> {
    let mut n: NetConf = serde_json::from_str(bytes)
        .map_err(|e| PluginError::InvalidConfig(format!("failed to load netconf: {}", e)))?;
    n.validate()
        .map_err(|e| PluginError::InvalidConfig(e.to_string()))?;
    if n.ipam_type().is_empty() {
        return Err(PluginError::InvalidConfig(
            "ipam.type must name an IPAM plugin".to_string(),
        ));
    }
    if n.is_default_gw {
        n.is_gw = true;
    }
    Ok(n)
}

#[cfg(test)]
const TEST_CONF: &str = r#"{
    "cniVersion": "0.4.0",
    "name": "mynet",
    "type": "swan-bridge",
    "bridge": "br0",
    "isGateway": true,
    "isDefaultGateway": true,
    "ipam": {"type": "host-local", "subnet": "10.1.2.0/24"}
}"#;

#[test]
fn test_load_netconf_fields() {
    let n = load_netconf(TEST_CONF).unwrap();

    assert_eq!(n.br_name, "br0");
    assert!(n.is_gw);
    assert!(n.is_default_gw);
    assert!(!n.ip_masq);
    assert_eq!(n.mtu, 0);
    assert_eq!(n.ipam_type(), "host-local");
    assert_eq!(n.cni_version(), "0.4.0");
    assert!(n.ipsec.enabled);
    assert_eq!(n.ipsec.start_delay, 20);
}

#[test]
fn test_load_netconf_default_bridge() {
    let n = load_netconf(r#"{"cniVersion":"0.3.1","name":"n","ipam":{"type":"dhcp"}}"#).unwrap();

    assert_eq!(n.br_name, DEFAULT_BRIDGE_NAME);
    assert!(!n.is_gw);
}

#[test]
fn test_default_gateway_forces_gateway() {
    let n = load_netconf(
        r#"{"name":"n","isGateway":false,"isDefaultGateway":true,"ipam":{"type":"dhcp"}}"#,
    )
    .unwrap();
    assert!(n.is_gw);
}

#[test]
fn test_load_netconf_malformed() {
    assert!(matches!(
        load_netconf("{not json"),
        Err(PluginError::InvalidConfig(_))
    ));
    assert!(matches!(
        load_netconf(r#"{"name":"n","mtu":-1,"ipam":{"type":"dhcp"}}"#),
        Err(PluginError::InvalidConfig(_))
    ));
}

#[test]
fn test_load_netconf_rejects_long_bridge_name() {
    assert!(matches!(
        load_netconf(r#"{"name":"n","bridge":"a-very-long-bridge","ipam":{"type":"dhcp"}}"#),
        Err(PluginError::InvalidConfig(_))
    ));
}

#[test]
fn test_load_netconf_bridge_name_counts_bytes() {
    // 15 characters but 30 bytes
    let conf = format!(r#"{{"name":"n","bridge":"{}","ipam":{{"type":"dhcp"}}}}"#, "é".repeat(15));
    assert!(matches!(load_netconf(&conf), Err(PluginError::InvalidConfig(_))));

    let conf = format!(r#"{{"name":"n","bridge":"{}","ipam":{{"type":"dhcp"}}}}"#, "b".repeat(15));
    assert_eq!(load_netconf(&conf).unwrap().br_name.len(), 15);

    assert!(matches!(
        load_netconf(r#"{"name":"n","bridge":"","ipam":{"type":"dhcp"}}"#),
        Err(PluginError::InvalidConfig(_))
    ));
}

#[test]
fn test_load_netconf_accepts_logging_keys() {
    let n = load_netconf(
        r#"{"name":"n","logFile":"/tmp/swan.log","logLevel":"debug","ipam":{"type":"dhcp"}}"#,
    )
    .unwrap();
    assert_eq!(n.ipam_type(), "dhcp");
}

#[test]
fn test_load_netconf_requires_ipam_type() {
    assert!(matches!(
        load_netconf(r#"{"name":"n","ipam":{}}"#),
        Err(PluginError::InvalidConfig(_))
    ));
}

#[test]
fn test_check_modes_conflict() {
    let n = load_netconf(
        r#"{"name":"n","hairpinMode":true,"promiscMode":true,"ipam":{"type":"dhcp"}}"#,
    )
    .unwrap();
    assert!(matches!(n.check_modes(), Err(PluginError::ConflictingModes)));
}

#[test]
fn test_ipsec_section() {
    let n = load_netconf(
        r#"{"name":"n","ipam":{"type":"dhcp"},"ipsec":{"enabled":false,"startDelay":5,"netnsDir":"/tmp/ns"}}"#,
    )
    .unwrap();
    assert!(!n.ipsec.enabled);
    assert_eq!(n.ipsec.start_delay, 5);
    assert_eq!(n.ipsec.netns_dir, PathBuf::from("/tmp/ns"));
    assert_eq!(n.ipsec.ipsec_bin, "ipsec");
}
