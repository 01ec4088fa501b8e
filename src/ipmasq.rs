//! Source NAT for container addresses: a per-container chain in the `nat`
//! table, jumped to from POSTROUTING.

use std::process::Output;

extern crate ipnet;
use ipnet::IpNet;
use sha2::{Digest, Sha512};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::PluginError;

const CHAIN_PREFIX: &str = "CNI-";
// iptables chain names are limited to 28 characters
const MAX_CHAIN_LENGTH: usize = 28;

const MULTICAST_V4: &str = "224.0.0.0/4";
const MULTICAST_V6: &str = "ff00::/8";

pub fn format_chain_name(name: &str, id: &str) -> String {
    let digest = Sha512::digest(format!("{}{}", name, id).as_bytes());
    let chain = format!("{}{}", CHAIN_PREFIX, hex::encode(digest));
    chain[..MAX_CHAIN_LENGTH].to_string()
}

pub fn format_comment(name: &str, id: &str) -> String {
    format!("name: {:?} id: {:?}", name, id)
}

fn iptables_bin(ipn: &IpNet) -> &'static str {
    match ipn {
        IpNet::V4(_) => "iptables",
        IpNet::V6(_) => "ip6tables",
    }
}

fn with_comment(mut rule: Vec<String>, comment: &str) -> Vec<String> {
    rule.extend(["-m", "comment", "--comment", comment].map(String::from));
    rule
}

// rules of the per-container chain, in order
fn chain_rules(ipn: &IpNet, comment: &str) -> Vec<Vec<String>> {
    let multicast = match ipn {
        IpNet::V4(_) => MULTICAST_V4,
        IpNet::V6(_) => MULTICAST_V6,
    };
    vec![
        with_comment(
            vec!["-d".to_string(), ipn.trunc().to_string(), "-j".to_string(), "ACCEPT".to_string()],
            comment,
        ),
        with_comment(
            ["!", "-d", multicast, "-j", "MASQUERADE"].map(String::from).to_vec(),
            comment,
        ),
    ]
}

fn postrouting_rule(ipn: &IpNet, chain: &str, comment: &str) -> Vec<String> {
    with_comment(
        vec!["-s".to_string(), ipn.addr().to_string(), "-j".to_string(), chain.to_string()],
        comment,
    )
}

struct Iptables {
    bin: &'static str,
}

impl Iptables {
    fn for_net(ipn: &IpNet) -> Self {
        Iptables {
            bin: iptables_bin(ipn),
        }
    }

    async fn run(&self, args: &[&str], rule: &[String]) -> Result<Output, PluginError> {
        debug!(bin = self.bin, ?args, ?rule, "running iptables");
        Command::new(self.bin)
            .arg("-w")
            .args(["-t", "nat"])
            .args(args)
            .args(rule)
            .output()
            .await
            .map_err(|e| PluginError::Firewall(format!("failed to execute {}: {}", self.bin, e)))
    }

    async fn check(&self, args: &[&str], rule: &[String]) -> Result<(), PluginError> {
        let output = self.run(args, rule).await?;
        if !output.status.success() {
            return Err(PluginError::Firewall(format!(
                "{} {:?} {:?} failed: {}",
                self.bin,
                args,
                rule,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn exists(&self, args: &[&str], rule: &[String]) -> Result<bool, PluginError> {
        Ok(self.run(args, rule).await?.status.success())
    }

    async fn ensure_chain(&self, chain: &str) -> Result<(), PluginError> {
        if self.exists(&["-S", chain], &[]).await? {
            return Ok(());
        }
        self.check(&["-N", chain], &[]).await
    }

    async fn append_unique(&self, chain: &str, rule: &[String]) -> Result<(), PluginError> {
        if self.exists(&["-C", chain], rule).await? {
            return Ok(());
        }
        self.check(&["-A", chain], rule).await
    }
}

/// Masquerades traffic leaving `ipn`'s address for anything outside its
/// own subnet, multicast excluded.
pub async fn setup_ip_masq(ipn: &IpNet, chain: &str, comment: &str) -> Result<(), PluginError> {
    let ipt = Iptables::for_net(ipn);

    ipt.ensure_chain(chain).await?;
    for rule in chain_rules(ipn, comment) {
        ipt.append_unique(chain, &rule).await?;
    }
    ipt.append_unique("POSTROUTING", &postrouting_rule(ipn, chain, comment))
        .await?;

    info!(address = %ipn, chain, "masquerade set up");
    Ok(())
}

/// Undoes `setup_ip_masq`. Rules or chains that are already gone are not
/// an error, so a repeated teardown succeeds.
pub async fn teardown_ip_masq(ipn: &IpNet, chain: &str, comment: &str) -> Result<(), PluginError> {
    let ipt = Iptables::for_net(ipn);

    let jump = postrouting_rule(ipn, chain, comment);
    while ipt.exists(&["-C", "POSTROUTING"], &jump).await? {
        ipt.check(&["-D", "POSTROUTING"], &jump).await?;
    }

    if !ipt.exists(&["-S", chain], &[]).await? {
        debug!(chain, "masquerade chain already gone");
        return Ok(());
    }
    ipt.check(&["-F", chain], &[]).await?;
    if let Err(e) = ipt.check(&["-X", chain], &[]).await {
        // still referenced by a rule for another address of the container
        warn!(chain, "could not delete masquerade chain: {}", e);
    }

    info!(address = %ipn, chain, "masquerade removed");
    Ok(())
}

#[test]
fn test_format_chain_name() {
    let chain = format_chain_name("mynet", "c0ffee");

    assert_eq!(chain.len(), MAX_CHAIN_LENGTH);
    assert!(chain.starts_with(CHAIN_PREFIX));
    assert!(chain[CHAIN_PREFIX.len()..]
        .chars()
        .all(|c| c.is_ascii_hexdigit()));
    assert_eq!(chain, format_chain_name("mynet", "c0ffee"));
    assert_ne!(chain, format_chain_name("mynet", "c0ffef"));
}

#[test]
fn test_format_comment() {
    assert_eq!(
        format_comment("mynet", "c0ffee"),
        r#"name: "mynet" id: "c0ffee""#
    );
}

#[test]
fn test_chain_rules_v4() {
    let ipn: IpNet = "10.1.2.5/24".parse().unwrap();
    let rules = chain_rules(&ipn, "c");

    assert_eq!(
        rules[0],
        ["-d", "10.1.2.0/24", "-j", "ACCEPT", "-m", "comment", "--comment", "c"]
            .map(String::from)
            .to_vec()
    );
    assert_eq!(&rules[1][..5], &["!", "-d", MULTICAST_V4, "-j", "MASQUERADE"].map(String::from));
    assert_eq!(iptables_bin(&ipn), "iptables");
}

#[test]
fn test_chain_rules_v6() {
    let ipn: IpNet = "fd00:1::5/64".parse().unwrap();
    let rules = chain_rules(&ipn, "c");

    assert_eq!(rules[0][1], "fd00:1::/64");
    assert_eq!(rules[1][2], MULTICAST_V6);
    assert_eq!(iptables_bin(&ipn), "ip6tables");
}

#[test]
fn test_postrouting_rule_uses_host_address() {
    let ipn: IpNet = "10.1.2.5/24".parse().unwrap();
    let rule = postrouting_rule(&ipn, "CNI-abc", "c");

    assert_eq!(&rule[..4], &["-s", "10.1.2.5", "-j", "CNI-abc"].map(String::from));
}

#[tokio::test]
async fn test_iptables_exit_status() {
    // `true` answers every check with success, so nothing is appended
    let ipt = Iptables { bin: "true" };
    assert!(ipt.exists(&["-C", "POSTROUTING"], &[]).await.unwrap());
    ipt.append_unique("POSTROUTING", &[]).await.unwrap();

    let ipt = Iptables { bin: "false" };
    assert!(!ipt.exists(&["-S", "CNI-x"], &[]).await.unwrap());
    assert!(matches!(
        ipt.ensure_chain("CNI-x").await,
        Err(PluginError::Firewall(_))
    ));
}
