//! Bridge Manager: the shared host bridge and its gateway addresses.

extern crate ipnet;
use ipnet::IpNet;
use libcni::types::types_100::CNI100Interface;
use tracing::{debug, info};

use crate::error::{is_errno, PluginError};
use crate::gateway::Family;
use crate::netlink::{link_is_bridge, link_mac, NetlinkHandle};

#[derive(Debug, Clone)]
pub struct Bridge {
    pub name: String,
    pub index: u32,
    pub mac: String,
}

impl Bridge {
    pub fn interface(&self) -> CNI100Interface {
        CNI100Interface {
            name: self.name.clone(),
            mac: self.mac.clone(),
            sandbox: String::new(),
        }
    }
}

pub async fn bridge_by_name(nl: &NetlinkHandle, name: &str) -> Result<Bridge, PluginError> {
    let msg = nl.link_by_name(name).await?.ok_or_else(|| {
        PluginError::InterfaceSetupFailed(format!("could not lookup {:?}: not found", name))
    })?;
    if !link_is_bridge(&msg) {
        return Err(PluginError::NameConflict(name.to_string()));
    }
    Ok(Bridge {
        name: name.to_string(),
        index: msg.header.index,
        mac: link_mac(&msg),
    })
}

/// Creates the bridge unless a link of that name exists, then makes sure
/// it is up. Leaving the tx queue length unset lets the kernel pick its
/// default instead of a zero-length queue.
pub async fn ensure_bridge(
    nl: &NetlinkHandle,
    name: &str,
    mtu: u32,
    promisc_mode: bool,
) -> Result<Bridge, PluginError> {
    if nl.link_by_name(name).await?.is_none() {
        match nl.add_bridge(name).await {
            Ok(()) => {
                info!(name, "created bridge");
                if mtu > 0 {
                    let br = bridge_by_name(nl, name).await?;
                    nl.set_mtu(br.index, mtu).await.map_err(|e| {
                        PluginError::InterfaceSetupFailed(format!(
                            "could not set mtu on {:?}: {}",
                            name, e
                        ))
                    })?;
                }
            }
            // lost a race with another ADD, the link is there now
            Err(e) if is_errno(&e, libc::EEXIST) => {}
            Err(e) => {
                return Err(PluginError::InterfaceSetupFailed(format!(
                    "could not add {:?}: {}",
                    name, e
                )))
            }
        }
    }

    // re-fetch to read all attributes and, if it already existed, make
    // sure it really is a bridge
    let br = bridge_by_name(nl, name).await?;

    if promisc_mode {
        nl.set_promisc(br.index).await.map_err(|e| {
            PluginError::InterfaceSetupFailed(format!(
                "could not set promiscuous mode on {:?}: {}",
                name, e
            ))
        })?;
    }

    nl.set_up(br.index).await.map_err(|e| {
        PluginError::InterfaceSetupFailed(format!("could not set {:?} up: {}", name, e))
    })?;

    Ok(br)
}

/// Puts `ipn` on the bridge. IPv4 allows a single address; IPv6 allows
/// several as long as their subnets do not overlap.
pub async fn ensure_bridge_addr(
    nl: &NetlinkHandle,
    br: &Bridge,
    family: Family,
    ipn: &IpNet,
    force_address: bool,
) -> Result<(), PluginError> {
    let addrs = nl.addresses(br.index, Some(family)).await?;

    for (existing, msg) in addrs {
        if existing == *ipn {
            debug!(bridge = %br.name, address = %ipn, "bridge address already present");
            return Ok(());
        }

        if family == Family::V4 || existing.contains(&ipn.addr()) || ipn.contains(&existing.addr())
        {
            if !force_address {
                return Err(PluginError::AddressConflict {
                    bridge: br.name.clone(),
                    address: ipn.to_string(),
                });
            }
            info!(bridge = %br.name, old = %existing, new = %ipn, "replacing bridge address");
            nl.del_address(msg).await.map_err(|e| {
                PluginError::InterfaceSetupFailed(format!(
                    "could not remove IP address from {:?}: {}",
                    br.name, e
                ))
            })?;
        }
    }

    nl.add_address(br.index, ipn).await.map_err(|e| {
        PluginError::InterfaceSetupFailed(format!(
            "could not add IP address to {:?}: {}",
            br.name, e
        ))
    })
}

#[cfg(test)]
mod kernel_tests {
    use super::*;

    // run as root inside a scratch namespace: unshare -n cargo test -- --ignored

    #[tokio::test]
    #[ignore = "needs CAP_NET_ADMIN"]
    async fn test_ensure_bridge_idempotent() {
        let nl = NetlinkHandle::new().unwrap();
        let first = ensure_bridge(&nl, "swtest0", 1400, false).await.unwrap();
        let second = ensure_bridge(&nl, "swtest0", 1400, false).await.unwrap();

        assert_eq!(first.index, second.index);
        nl.del_link(first.index).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs CAP_NET_ADMIN"]
    async fn test_ensure_bridge_name_conflict() {
        let nl = NetlinkHandle::new().unwrap();
        nl.add_veth("swtest1", "swtest1p").await.unwrap();
        let err = ensure_bridge(&nl, "swtest1", 0, false).await.unwrap_err();

        assert!(matches!(err, PluginError::NameConflict(_)));
        let index = nl.link_index("swtest1").await.unwrap().unwrap();
        nl.del_link(index).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs CAP_NET_ADMIN"]
    async fn test_ensure_bridge_addr_conflict_and_force() {
        let nl = NetlinkHandle::new().unwrap();
        let br = ensure_bridge(&nl, "swtest2", 0, false).await.unwrap();
        let first: IpNet = "10.1.2.1/24".parse().unwrap();
        let other: IpNet = "10.9.9.1/24".parse().unwrap();

        ensure_bridge_addr(&nl, &br, Family::V4, &first, false).await.unwrap();
        // same address again is a no-op
        ensure_bridge_addr(&nl, &br, Family::V4, &first, false).await.unwrap();

        let err = ensure_bridge_addr(&nl, &br, Family::V4, &other, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::AddressConflict { .. }));

        ensure_bridge_addr(&nl, &br, Family::V4, &other, true).await.unwrap();
        let addrs: Vec<IpNet> = nl
            .addresses(br.index, Some(Family::V4))
            .await
            .unwrap()
            .into_iter()
            .map(|(ipn, _)| ipn)
            .collect();
        assert_eq!(addrs, vec![other]);

        nl.del_link(br.index).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs CAP_NET_ADMIN"]
    async fn test_ensure_bridge_addr_ipv6_coexist() {
        let nl = NetlinkHandle::new().unwrap();
        let br = ensure_bridge(&nl, "swtest3", 0, false).await.unwrap();
        let a: IpNet = "fd00:1::1/64".parse().unwrap();
        let b: IpNet = "fd00:2::1/64".parse().unwrap();
        let overlapping: IpNet = "fd00:1::2/64".parse().unwrap();

        ensure_bridge_addr(&nl, &br, Family::V6, &a, false).await.unwrap();
        ensure_bridge_addr(&nl, &br, Family::V6, &b, false).await.unwrap();
        let err = ensure_bridge_addr(&nl, &br, Family::V6, &overlapping, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::AddressConflict { .. }));

        nl.del_link(br.index).await.unwrap();
    }
}
