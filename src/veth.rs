//! Veth Linker: creates the pair inside the container namespace, moves the
//! host end out and plugs it into the bridge.

use std::io;
use std::os::unix::io::AsRawFd;

extern crate ipnet;
use ipnet::IpNet;
use libcni::types::types_100::CNI100Interface;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::error::{is_errno, PluginError};
use crate::netlink::{link_mac, NetlinkHandle};
use crate::netns::NetNs;

/// Host side name, stable across repeated invocations for the same
/// container interface.
pub fn host_veth_name(container_id: &str, ifname: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}", container_id, ifname).as_bytes());
    format!("veth{}", &hex::encode(digest)[..8])
}

fn setup_failed(what: &str, name: &str, e: rtnetlink::Error) -> PluginError {
    PluginError::InterfaceSetupFailed(format!("failed to {} {:?}: {}", what, name, e))
}

pub async fn setup_veth(
    nl: &NetlinkHandle,
    netns: &NetNs,
    host_ns: &NetNs,
    br: &Bridge,
    ifname: &str,
    host_name: &str,
    mtu: u32,
    hairpin_mode: bool,
) -> Result<(CNI100Interface, CNI100Interface), PluginError> {
    let host_fd = host_ns.try_clone()?;
    let cont_name = ifname.to_string();
    let peer_name = host_name.to_string();

    // create the veth pair in the container and move host end into host netns
    let cont_mac = netns
        .run(move |cnl| async move {
            match cnl.add_veth(&cont_name, &peer_name).await {
                Ok(()) => {}
                Err(e) if is_errno(&e, libc::EEXIST) => {
                    return Err(PluginError::InterfaceSetupFailed(format!(
                        "container veth name {:?} or peer {:?} already exists",
                        cont_name, peer_name
                    )))
                }
                Err(e) => return Err(setup_failed("create veth", &cont_name, e)),
            }

            let cont = cnl.link_index(&cont_name).await?.ok_or_else(|| {
                PluginError::InterfaceSetupFailed(format!("veth {:?} vanished", cont_name))
            })?;
            let peer = cnl.link_index(&peer_name).await?.ok_or_else(|| {
                PluginError::InterfaceSetupFailed(format!("veth {:?} vanished", peer_name))
            })?;

            if mtu > 0 {
                cnl.set_mtu(cont, mtu)
                    .await
                    .map_err(|e| setup_failed("set mtu on", &cont_name, e))?;
                cnl.set_mtu(peer, mtu)
                    .await
                    .map_err(|e| setup_failed("set mtu on", &peer_name, e))?;
            }
            cnl.set_up(cont)
                .await
                .map_err(|e| setup_failed("set up", &cont_name, e))?;
            cnl.set_netns_by_fd(peer, host_fd.file().as_raw_fd())
                .await
                .map_err(|e| setup_failed("move to host netns", &peer_name, e))?;

            let msg = cnl.link_by_name(&cont_name).await?.ok_or_else(|| {
                PluginError::InterfaceSetupFailed(format!("veth {:?} vanished", cont_name))
            })?;
            Ok(link_mac(&msg))
        })
        .await?;

    // need to lookup host veth again as its index has changed during ns move
    let host = nl.link_by_name(host_name).await?.ok_or_else(|| {
        PluginError::InterfaceSetupFailed(format!("failed to lookup {:?}", host_name))
    })?;
    let host_index = host.header.index;
    debug!(host_name, host_index, "host veth moved");

    nl.set_up(host_index)
        .await
        .map_err(|e| setup_failed("set up", host_name, e))?;

    // connect host veth end to the bridge
    nl.set_master(host_index, br.index).await.map_err(|e| {
        PluginError::InterfaceSetupFailed(format!(
            "failed to connect {:?} to bridge {}: {}",
            host_name, br.name, e
        ))
    })?;

    nl.set_hairpin(host_index, hairpin_mode).await.map_err(|e| {
        PluginError::InterfaceSetupFailed(format!(
            "failed to setup hairpin mode for {}: {}",
            host_name, e
        ))
    })?;

    info!(container = ifname, host = host_name, bridge = %br.name, "veth attached");

    let host_iface = CNI100Interface {
        name: host_name.to_string(),
        mac: link_mac(&host),
        sandbox: String::new(),
    };
    let cont_iface = CNI100Interface {
        name: ifname.to_string(),
        mac: cont_mac,
        sandbox: netns.path().display().to_string(),
    };
    Ok((host_iface, cont_iface))
}

/// Deletes the container end, which takes the host end with it, and returns
/// the global addresses it carried. A namespace or link that is already gone
/// yields no addresses.
pub async fn del_container_veth(netns_path: &str, ifname: &str) -> Result<Vec<IpNet>, PluginError> {
    let netns = match NetNs::open(netns_path) {
        Ok(netns) => netns,
        Err(PluginError::NamespaceOpenFailed { source, .. })
            if source.kind() == io::ErrorKind::NotFound =>
        {
            debug!(netns = netns_path, "netns already gone");
            return Ok(vec![]);
        }
        Err(e) => return Err(e),
    };
    let name = ifname.to_string();

    netns
        .run(move |cnl| async move {
            let Some(index) = cnl.link_index(&name).await? else {
                debug!(ifname = %name, "container veth already gone");
                return Ok(vec![]);
            };
            let addrs = cnl.global_addresses(index).await?;
            match cnl.del_link(index).await {
                Ok(()) => {}
                Err(e) if is_errno(&e, libc::ENODEV) => {}
                Err(e) => return Err(setup_failed("delete", &name, e)),
            }
            info!(ifname = %name, addresses = addrs.len(), "container veth deleted");
            Ok(addrs)
        })
        .await
}

#[test]
fn test_host_veth_name_stable() {
    let a = host_veth_name("c0ffee", "eth0");
    let b = host_veth_name("c0ffee", "eth0");

    assert_eq!(a, b);
    assert_eq!(a.len(), 12);
    assert!(a.starts_with("veth"));
    assert_ne!(a, host_veth_name("c0ffee", "eth1"));
}

#[tokio::test]
async fn test_del_container_veth_missing_netns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone");
    let addrs = del_container_veth(&path.display().to_string(), "eth0")
        .await
        .unwrap();
    assert!(addrs.is_empty());
}
