use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;

extern crate ipnet;
use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::{AddressAttribute, AddressMessage, AddressScope};
use netlink_packet_route::link::{InfoBridgePort, InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use netlink_packet_route::AddressFamily;
use netlink_packet_utils::nla::{DefaultNla, NLA_F_NESTED};
use netlink_packet_utils::Emitable;
use tracing::debug;

use crate::error::{is_errno, PluginError};
use crate::gateway::Family;

// private, locally administered prefix used for addresses derived from IPv4
const PRIVATE_MAC_PREFIX: [u8; 2] = [0x0a, 0x58];

const IFLA_PROTINFO: u16 = 12;

/// Netlink connection bound to the namespace it was opened in.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
}

impl NetlinkHandle {
    pub fn new() -> Result<Self, PluginError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);
        Ok(NetlinkHandle { handle })
    }

    pub async fn link_by_name(&self, name: &str) -> Result<Option<LinkMessage>, PluginError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(msg) => Ok(msg),
            Err(e) if is_errno(&e, libc::ENODEV) => Ok(None),
            Err(e) => Err(PluginError::InterfaceSetupFailed(format!(
                "could not lookup {:?}: {}",
                name, e
            ))),
        }
    }

    pub async fn link_index(&self, name: &str) -> Result<Option<u32>, PluginError> {
        Ok(self.link_by_name(name).await?.map(|msg| msg.header.index))
    }

    pub async fn add_bridge(&self, name: &str) -> Result<(), rtnetlink::Error> {
        debug!(name, "adding bridge");
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
    }

    pub async fn add_veth(&self, name: &str, peer: &str) -> Result<(), rtnetlink::Error> {
        debug!(name, peer, "adding veth pair");
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
    }

    pub async fn del_link(&self, index: u32) -> Result<(), rtnetlink::Error> {
        self.handle.link().del(index).execute().await
    }

    pub async fn set_up(&self, index: u32) -> Result<(), rtnetlink::Error> {
        self.handle.link().set(index).up().execute().await
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), rtnetlink::Error> {
        self.handle.link().set(index).mtu(mtu).execute().await
    }

    pub async fn set_promisc(&self, index: u32) -> Result<(), rtnetlink::Error> {
        self.handle.link().set(index).promiscuous(true).execute().await
    }

    pub async fn set_master(&self, index: u32, master: u32) -> Result<(), rtnetlink::Error> {
        self.handle.link().set(index).controller(master).execute().await
    }

    /// Bridge port hairpin flag, sent as an `AF_BRIDGE` setlink so it
    /// applies in the namespace of this socket. `index` must already be
    /// enslaved to a bridge.
    pub async fn set_hairpin(&self, index: u32, on: bool) -> Result<(), rtnetlink::Error> {
        debug!(index, on, "setting hairpin mode");
        let mut req = self.handle.link().set(index);
        let msg = req.message_mut();
        msg.header.interface_family = AddressFamily::Bridge;
        msg.attributes.push(hairpin_protinfo(on));
        req.execute().await
    }

    pub async fn set_netns_by_fd(&self, index: u32, fd: RawFd) -> Result<(), rtnetlink::Error> {
        self.handle.link().set(index).setns_by_fd(fd).execute().await
    }

    pub async fn set_hwaddr(&self, index: u32, mac: [u8; 6]) -> Result<(), rtnetlink::Error> {
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
    }

    /// Addresses on a link, optionally limited to one family.
    pub async fn addresses(
        &self,
        index: u32,
        family: Option<Family>,
    ) -> Result<Vec<(IpNet, AddressMessage)>, PluginError> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut found = vec![];
        while let Some(msg) = addrs.try_next().await.map_err(|e| {
            PluginError::InterfaceSetupFailed(format!("could not get list of IP addresses: {}", e))
        })? {
            let ip = msg.attributes.iter().find_map(|attr| match attr {
                AddressAttribute::Address(ip) => Some(*ip),
                _ => None,
            });
            let Some(ip) = ip else { continue };
            if family.map_or(false, |f| f != Family::of(&ip)) {
                continue;
            }
            if let Ok(ipn) = IpNet::new(ip, msg.header.prefix_len) {
                found.push((ipn, msg));
            }
        }
        Ok(found)
    }

    /// Globally scoped addresses only, link-local ones are kernel generated.
    pub async fn global_addresses(&self, index: u32) -> Result<Vec<IpNet>, PluginError> {
        Ok(self
            .addresses(index, None)
            .await?
            .into_iter()
            .filter(|(_, msg)| msg.header.scope == AddressScope::Universe)
            .map(|(ipn, _)| ipn)
            .collect())
    }

    pub async fn add_address(&self, index: u32, ipn: &IpNet) -> Result<(), rtnetlink::Error> {
        debug!(index, address = %ipn, "adding address");
        self.handle
            .address()
            .add(index, ipn.addr(), ipn.prefix_len())
            .execute()
            .await
    }

    pub async fn del_address(&self, msg: AddressMessage) -> Result<(), rtnetlink::Error> {
        self.handle.address().del(msg).execute().await
    }

    pub async fn add_route(
        &self,
        index: u32,
        dst: &IpNet,
        gw: Option<IpAddr>,
    ) -> Result<(), PluginError> {
        debug!(index, dst = %dst, gw = ?gw, "adding route");
        let result = match (dst, gw) {
            (IpNet::V4(dst), gw) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(dst.network(), dst.prefix_len())
                    .output_interface(index);
                match gw {
                    Some(IpAddr::V4(gw)) => req = req.gateway(gw),
                    Some(IpAddr::V6(gw)) => {
                        return Err(PluginError::UnknownAddressFamily(format!(
                            "IPv6 gateway {} for IPv4 route {}",
                            gw, dst
                        )))
                    }
                    None => {}
                }
                req.execute().await
            }
            (IpNet::V6(dst), gw) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(dst.network(), dst.prefix_len())
                    .output_interface(index);
                match gw {
                    Some(IpAddr::V6(gw)) => req = req.gateway(gw),
                    Some(IpAddr::V4(gw)) => {
                        return Err(PluginError::UnknownAddressFamily(format!(
                            "IPv4 gateway {} for IPv6 route {}",
                            gw, dst
                        )))
                    }
                    None => {}
                }
                req.execute().await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::EEXIST) => Ok(()),
            Err(e) => Err(PluginError::InterfaceSetupFailed(format!(
                "failed to add route {}: {}",
                dst, e
            ))),
        }
    }
}

// nested IFLA_PROTINFO carrying IFLA_BRPORT_MODE, the bridge driver ignores
// the port attributes without the nested flag
fn hairpin_protinfo(on: bool) -> LinkAttribute {
    let mode = InfoBridgePort::HairpinMode(on);
    let mut value = vec![0; mode.buffer_len()];
    mode.emit(&mut value);
    LinkAttribute::Other(DefaultNla::new(IFLA_PROTINFO | NLA_F_NESTED, value))
}

pub fn link_is_bridge(msg: &LinkMessage) -> bool {
    msg.attributes.iter().any(|attr| match attr {
        LinkAttribute::LinkInfo(infos) => infos
            .iter()
            .any(|info| matches!(info, LinkInfo::Kind(InfoKind::Bridge))),
        _ => false,
    })
}

pub fn link_mac(msg: &LinkMessage) -> String {
    msg.attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
            _ => None,
        })
        .unwrap_or_default()
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<String>>()
        .join(":")
}

/// `0a:58` followed by the four IPv4 octets.
pub fn hwaddr_from_ipv4(ip: Ipv4Addr) -> [u8; 6] {
    let o = ip.octets();
    [
        PRIVATE_MAC_PREFIX[0],
        PRIVATE_MAC_PREFIX[1],
        o[0],
        o[1],
        o[2],
        o[3],
    ]
}

#[test]
fn test_hwaddr_from_ipv4() {
    let mac = hwaddr_from_ipv4("10.1.2.5".parse().unwrap());
    assert_eq!(mac, [0x0a, 0x58, 0x0a, 0x01, 0x02, 0x05]);
    assert_eq!(format_mac(&mac), "0a:58:0a:01:02:05");
}

#[test]
fn test_format_mac_padding() {
    assert_eq!(format_mac(&[0, 1, 0xab, 0x10, 0xff, 9]), "00:01:ab:10:ff:09");
}

#[test]
fn test_hairpin_protinfo_layout() {
    use netlink_packet_utils::nla::Nla;

    let LinkAttribute::Other(nla) = hairpin_protinfo(true) else {
        panic!("expected a raw attribute");
    };
    assert_eq!(nla.kind(), IFLA_PROTINFO | NLA_F_NESTED);
    assert!(nla.is_nested());

    let mut value = vec![0; nla.value_len()];
    nla.emit_value(&mut value);
    // one IFLA_BRPORT_MODE (4) u8 attribute, padded to four bytes
    assert_eq!(value.len(), 8);
    assert_eq!(u16::from_ne_bytes([value[0], value[1]]), 5);
    assert_eq!(u16::from_ne_bytes([value[2], value[3]]), 4);
    assert_eq!(value[4], 1);

    let LinkAttribute::Other(off) = hairpin_protinfo(false) else {
        panic!("expected a raw attribute");
    };
    let mut value = vec![0; off.value_len()];
    off.emit_value(&mut value);
    assert_eq!(value[4], 0);
}
