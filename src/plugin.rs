//! ADD and DEL, in the order the attach and detach steps have to happen.

use std::net::{IpAddr, Ipv4Addr};

use libcni::skel::CmdArgs;
use libcni::types::types_100::CNI100Result;
use tracing::{info, warn};

use crate::bridge::{bridge_by_name, ensure_bridge, ensure_bridge_addr};
use crate::config::{load_netconf, NetConf};
use crate::error::PluginError;
use crate::gateway::calc_gateways;
use crate::ipam::{configure_container, normalize, to_ipnet, IpamDelegate};
use crate::ipmasq::{format_chain_name, format_comment, setup_ip_masq, teardown_ip_masq};
use crate::ipsec::Tunnel;
use crate::netlink::{hwaddr_from_ipv4, NetlinkHandle};
use crate::netns::NetNs;
use crate::sysctl;
use crate::veth::{del_container_veth, host_veth_name, setup_veth};

fn establish_tunnel(n: &NetConf, netns_path: &str) -> Result<(), PluginError> {
    let mut tunnel = Tunnel::new(&n.ipsec, netns_path)?;
    tunnel.configure()?;
    tunnel.start()?;
    info!(id = tunnel.id(), state = ?tunnel.state(), "ipsec tunnel requested");
    Ok(())
}

async fn teardown_tunnel(n: &NetConf, netns_path: &str) {
    match Tunnel::new(&n.ipsec, netns_path) {
        Ok(mut tunnel) => tunnel.stop().await,
        Err(e) => warn!("skipping tunnel teardown: {}", e),
    }
}

/// Attaches the container and returns the result in the configuration's
/// CNI version, ready to print.
pub async fn cmd_add<D: IpamDelegate>(args: &CmdArgs, delegate: &D) -> Result<String, PluginError> {
    let n = load_netconf(&args.stdin_data)?;
    // rejected before anything touches the kernel
    n.check_modes()?;
    info!(network = %n.netconf.name, container = %args.container_id, bridge = %n.br_name, "ADD");

    let nl = NetlinkHandle::new()?;
    let br = ensure_bridge(&nl, &n.br_name, n.mtu, n.promisc_mode).await?;

    let netns = NetNs::open(&args.netns)?;
    let host_ns = NetNs::current()?;
    let host_name = host_veth_name(&args.container_id, &args.ifname);
    let (host_iface, cont_iface) = setup_veth(
        &nl,
        &netns,
        &host_ns,
        &br,
        &args.ifname,
        &host_name,
        n.mtu,
        n.hairpin_mode,
    )
    .await?;

    // run the IPAM plugin and get back the config to apply
    let raw = delegate
        .exec_add(n.ipam_type(), args.stdin_data.as_bytes())
        .await?;
    let mut result: CNI100Result = normalize(&raw, n.cni_version())?;
    info!(ips = result.ips.len(), routes = result.routes.len(), "address allocated");

    result.interfaces = vec![br.interface(), host_iface, cont_iface];

    let (gws_v4, gws_v6) = calc_gateways(&mut result, &n)?;

    result.interfaces[2].mac = configure_container(&netns, &args.ifname, &result).await?;

    if n.is_gw {
        let mut first_v4: Option<Ipv4Addr> = None;
        for gws in [&gws_v4, &gws_v6] {
            for gw in gws.gws.iter() {
                if let (IpAddr::V4(v4addr), None) = (gw.addr(), first_v4) {
                    first_v4 = Some(v4addr);
                }
                ensure_bridge_addr(&nl, &br, gws.family, gw, n.force_address).await?;
            }
            if !gws.gws.is_empty() {
                sysctl::enable_ip_forward(gws.family).map_err(|e| {
                    PluginError::InterfaceSetupFailed(format!("failed to enable forwarding: {}", e))
                })?;
            }
        }
        if let Some(v4addr) = first_v4 {
            nl.set_hwaddr(br.index, hwaddr_from_ipv4(v4addr))
                .await
                .map_err(|e| {
                    PluginError::InterfaceSetupFailed(format!(
                        "failed to set hardware address of {:?}: {}",
                        br.name, e
                    ))
                })?;
        }
    }

    if n.ip_masq {
        let chain = format_chain_name(&n.netconf.name, &args.container_id);
        let comment = format_comment(&n.netconf.name, &args.container_id);
        for ipc in result.ips.iter() {
            setup_ip_masq(&to_ipnet(&ipc.address)?, &chain, &comment).await?;
        }
    }

    // refetch the bridge since its MAC address may change when the first
    // veth is added or after its IP address is set
    result.interfaces[0].mac = bridge_by_name(&nl, &n.br_name).await?.mac;

    if !n.netconf.dns.is_empty() {
        result.dns = n.netconf.dns.clone();
    }

    if n.ipsec.enabled {
        if let Err(e) = establish_tunnel(&n, &args.netns) {
            warn!(netns = %args.netns, "failed to establish ipsec connection: {}", e);
        }
    }

    info!(container = %args.container_id, "ADD done");
    Ok(n.netconf.get_result_output(&result)?)
}

/// Detaches the container. Every step runs even when an earlier one failed
/// and the first hard failure is reported; resources already gone count as
/// removed.
pub async fn cmd_del<D: IpamDelegate>(args: &CmdArgs, delegate: &D) -> Result<(), PluginError> {
    let n = load_netconf(&args.stdin_data)?;
    info!(network = %n.netconf.name, container = %args.container_id, "DEL");

    let released = delegate
        .exec_del(n.ipam_type(), args.stdin_data.as_bytes())
        .await;
    if args.netns.is_empty() {
        return released;
    }
    let mut first_err = released.err();

    if n.ipsec.enabled {
        teardown_tunnel(&n, &args.netns).await;
    }

    let addrs = match del_container_veth(&args.netns, &args.ifname).await {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("failed to delete container veth: {}", e);
            first_err.get_or_insert(e);
            vec![]
        }
    };

    if n.ip_masq {
        let chain = format_chain_name(&n.netconf.name, &args.container_id);
        let comment = format_comment(&n.netconf.name, &args.container_id);
        for ipn in addrs.iter() {
            if let Err(e) = teardown_ip_masq(ipn, &chain, &comment).await {
                warn!(address = %ipn, "failed to tear down masquerade: {}", e);
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => {
            info!(container = %args.container_id, "DEL done");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeIpam {
        calls: Mutex<Vec<String>>,
        fail_del: bool,
    }

    #[async_trait]
    impl IpamDelegate for FakeIpam {
        async fn exec_add(&self, plugin: &str, _stdin_data: &[u8]) -> Result<Value, PluginError> {
            self.calls.lock().unwrap().push(format!("ADD {}", plugin));
            Ok(serde_json::json!({
                "cniVersion": "0.4.0",
                "ips": [{"version": "4", "address": "10.1.2.5/24"}],
            }))
        }

        async fn exec_del(&self, plugin: &str, _stdin_data: &[u8]) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push(format!("DEL {}", plugin));
            if self.fail_del {
                return Err(PluginError::DelegateFailed {
                    code: Some(11),
                    msg: "try again later".to_string(),
                });
            }
            Ok(())
        }
    }

    fn cmd_args(netns: &str, stdin_data: &str) -> CmdArgs {
        CmdArgs {
            container_id: "c0ffee".to_string(),
            netns: netns.to_string(),
            ifname: "eth0".to_string(),
            args: HashMap::new(),
            path: "/opt/cni/bin".to_string(),
            stdin_data: stdin_data.to_string(),
        }
    }

    const CONF: &str = r#"{
        "cniVersion": "0.4.0",
        "name": "mynet",
        "type": "swan-bridge",
        "bridge": "swtest9",
        "ipMasq": true,
        "ipsec": {"enabled": false},
        "ipam": {"type": "host-local"}
    }"#;

    #[tokio::test]
    async fn test_add_conflicting_modes_skips_delegate() {
        let ipam = FakeIpam::default();
        let conf = r#"{"name":"n","hairpinMode":true,"promiscMode":true,"ipam":{"type":"host-local"}}"#;
        let err = cmd_add(&cmd_args("/proc/1/ns/net", conf), &ipam)
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::ConflictingModes));
        assert!(ipam.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_invalid_config() {
        let ipam = FakeIpam::default();
        let err = cmd_add(&cmd_args("/proc/1/ns/net", "{"), &ipam)
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::InvalidConfig(_)));
        assert!(ipam.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_del_without_netns_only_releases() {
        let ipam = FakeIpam::default();
        cmd_del(&cmd_args("", CONF), &ipam).await.unwrap();

        assert_eq!(*ipam.calls.lock().unwrap(), vec!["DEL host-local".to_string()]);
    }

    #[tokio::test]
    async fn test_del_without_netns_reports_release_failure() {
        let ipam = FakeIpam {
            fail_del: true,
            ..FakeIpam::default()
        };
        let err = cmd_del(&cmd_args("", CONF), &ipam).await.unwrap_err();

        assert_eq!(err.code(), 11);
    }

    #[tokio::test]
    async fn test_del_vanished_netns_succeeds() {
        let ipam = FakeIpam::default();
        let dir = tempfile::tempdir().unwrap();
        let netns = dir.path().join("ns").display().to_string();

        cmd_del(&cmd_args(&netns, CONF), &ipam).await.unwrap();
        cmd_del(&cmd_args(&netns, CONF), &ipam).await.unwrap();

        assert_eq!(ipam.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_del_continues_after_release_failure() {
        let ipam = FakeIpam {
            fail_del: true,
            ..FakeIpam::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let netns = dir.path().join("ns").display().to_string();

        let err = cmd_del(&cmd_args(&netns, CONF), &ipam).await.unwrap_err();
        assert!(matches!(err, PluginError::DelegateFailed { code: Some(11), .. }));
    }

    // run as root inside a scratch namespace: unshare -n cargo test -- --ignored
    #[tokio::test]
    #[ignore = "needs CAP_SYS_ADMIN"]
    async fn test_del_twice_in_live_netns() {
        let ipam = FakeIpam::default();
        let args = cmd_args("/proc/self/ns/net", CONF);

        cmd_del(&args, &ipam).await.unwrap();
        cmd_del(&args, &ipam).await.unwrap();
    }

    // a sleeping child in its own network namespace stands in for the container
    fn spawn_container() -> std::process::Child {
        let child = std::process::Command::new("unshare")
            .args(["-n", "sleep", "60"])
            .spawn()
            .unwrap();
        let own = std::fs::read_link("/proc/self/ns/net").unwrap();
        let path = format!("/proc/{}/ns/net", child.id());
        for _ in 0..100 {
            if std::fs::read_link(&path).map_or(false, |ns| ns != own) {
                return child;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("child never entered a new netns");
    }

    #[tokio::test]
    #[ignore = "needs CAP_SYS_ADMIN"]
    async fn test_add_then_del_twice() {
        use crate::gateway::Family;
        use crate::netlink::link_mac;

        let conf = r#"{
            "cniVersion": "0.4.0",
            "name": "mynet",
            "type": "swan-bridge",
            "bridge": "swtest8",
            "isGateway": true,
            "isDefaultGateway": true,
            "hairpinMode": true,
            "ipsec": {"enabled": false},
            "ipam": {"type": "host-local"}
        }"#;
        let mut container = spawn_container();
        let netns_path = format!("/proc/{}/ns/net", container.id());
        let args = cmd_args(&netns_path, conf);
        let ipam = FakeIpam::default();

        let out: Value = serde_json::from_str(&cmd_add(&args, &ipam).await.unwrap()).unwrap();
        assert_eq!(out["cniVersion"], "0.4.0");
        assert_eq!(out["interfaces"][0]["name"], "swtest8");
        assert_eq!(out["interfaces"][0]["mac"], "0a:58:0a:01:02:01");
        assert_eq!(out["interfaces"][1]["name"], host_veth_name("c0ffee", "eth0"));
        assert_eq!(out["interfaces"][2]["mac"], "0a:58:0a:01:02:05");
        assert_eq!(out["interfaces"][2]["sandbox"], netns_path.as_str());
        assert_eq!(out["ips"][0]["interface"], 2);
        assert_eq!(out["ips"][0]["gateway"], "10.1.2.1");
        assert_eq!(out["routes"][0]["dst"], "0.0.0.0/0");
        assert_eq!(out["routes"][0]["gw"], "10.1.2.1");

        let nl = NetlinkHandle::new().unwrap();
        let br = bridge_by_name(&nl, "swtest8").await.unwrap();
        let br_addrs: Vec<String> = nl
            .addresses(br.index, Some(Family::V4))
            .await
            .unwrap()
            .into_iter()
            .map(|(ipn, _)| ipn.to_string())
            .collect();
        assert_eq!(br_addrs, vec!["10.1.2.1/24".to_string()]);

        let netns = NetNs::open(&netns_path).unwrap();
        let (addrs, mac) = netns
            .run(|cnl| async move {
                let index = cnl.link_index("eth0").await?.unwrap();
                let msg = cnl.link_by_name("eth0").await?.unwrap();
                Ok((cnl.global_addresses(index).await?, link_mac(&msg)))
            })
            .await
            .unwrap();
        assert_eq!(addrs, vec!["10.1.2.5/24".parse::<ipnet::IpNet>().unwrap()]);
        assert_eq!(mac, "0a:58:0a:01:02:05");

        cmd_del(&args, &ipam).await.unwrap();
        cmd_del(&args, &ipam).await.unwrap();
        let host_name = host_veth_name("c0ffee", "eth0");
        assert!(nl.link_index(&host_name).await.unwrap().is_none());
        assert_eq!(
            *ipam.calls.lock().unwrap(),
            vec!["ADD host-local", "DEL host-local", "DEL host-local"]
        );

        nl.del_link(br.index).await.unwrap();
        container.kill().unwrap();
        container.wait().unwrap();
    }
}
