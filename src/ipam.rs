//! Address Binder: runs the IPAM delegate and applies what it handed back
//! to the container interface.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

extern crate ipnet;
use async_trait::async_trait;
use ipnet::IpNet;
use libcni::skel::parse_result;
use libcni::types::types_100::CNI100Result;
use libcni::types::types_common::{CNIError, ERR_DECODE_FAILURE};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{is_errno, PluginError};
use crate::gateway::{Family, CONTAINER_IFACE_INDEX};
use crate::netlink::{hwaddr_from_ipv4, link_mac};
use crate::netns::NetNs;
use crate::sysctl;

/// The address-management plugin named by `ipam.type`. It receives the
/// raw configuration bytes unchanged.
#[async_trait]
pub trait IpamDelegate: Send + Sync {
    async fn exec_add(&self, plugin: &str, stdin_data: &[u8]) -> Result<Value, PluginError>;
    async fn exec_del(&self, plugin: &str, stdin_data: &[u8]) -> Result<(), PluginError>;
}

/// Runs the delegate binary found in `CNI_PATH`, the way a CNI runtime
/// does. The rest of the CNI environment is inherited.
pub struct ExecDelegate {
    cni_path: String,
}

impl ExecDelegate {
    pub fn new(cni_path: &str) -> Self {
        ExecDelegate {
            cni_path: cni_path.to_string(),
        }
    }

    fn find_plugin(&self, plugin: &str) -> Result<PathBuf, PluginError> {
        self.cni_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(dir).join(plugin))
            .find(|path| path.is_file())
            .ok_or_else(|| PluginError::DelegateFailed {
                code: None,
                msg: format!("failed to find plugin {:?} in path {:?}", plugin, self.cni_path),
            })
    }

    async fn exec(&self, command: &str, plugin: &str, stdin_data: &[u8]) -> Result<Vec<u8>, PluginError> {
        let path = self.find_plugin(plugin)?;
        debug!(command, plugin = %path.display(), "executing IPAM delegate");

        let mut child = Command::new(&path)
            .env("CNI_COMMAND", command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PluginError::DelegateFailed {
                code: None,
                msg: format!("failed to exec {}: {}", path.display(), e),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_data).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(delegate_error(&output.stdout, plugin));
        }
        Ok(output.stdout)
    }
}

// a failing plugin reports a CNI error object on stdout
fn delegate_error(stdout: &[u8], plugin: &str) -> PluginError {
    match serde_json::from_slice::<CNIError>(stdout) {
        Ok(err) => PluginError::DelegateFailed {
            code: Some(err.code),
            msg: err.msg,
        },
        Err(_) => PluginError::DelegateFailed {
            code: None,
            msg: format!(
                "{} failed: {}",
                plugin,
                String::from_utf8_lossy(stdout).trim()
            ),
        },
    }
}

#[async_trait]
impl IpamDelegate for ExecDelegate {
    async fn exec_add(&self, plugin: &str, stdin_data: &[u8]) -> Result<Value, PluginError> {
        let stdout = self.exec("ADD", plugin, stdin_data).await?;
        serde_json::from_slice(&stdout).map_err(|e| PluginError::DelegateFailed {
            code: Some(ERR_DECODE_FAILURE),
            msg: format!("failed to decode {} result: {}", plugin, e),
        })
    }

    async fn exec_del(&self, plugin: &str, stdin_data: &[u8]) -> Result<(), PluginError> {
        self.exec("DEL", plugin, stdin_data).await.map(|_| ())
    }
}

/// Converts whatever version the delegate answered in into the latest
/// result type. An allocation without addresses cannot be used.
pub fn normalize(raw: &Value, cni_version: &str) -> Result<CNI100Result, PluginError> {
    let result = parse_result(raw, cni_version).map_err(|e| PluginError::DelegateFailed {
        code: Some(ERR_DECODE_FAILURE),
        msg: format!("could not convert IPAM result: {}", e),
    })?;
    if result.ips.is_empty() {
        return Err(PluginError::EmptyAllocation);
    }
    Ok(result)
}

pub fn to_ipnet(address: &libcni::ipnet::IPNet) -> Result<IpNet, PluginError> {
    address
        .to_ipnet()
        .map_err(|e| PluginError::UnknownAddressFamily(e.to_string()))
}

fn family_gateway(result: &CNI100Result, family: Family) -> Option<IpAddr> {
    result
        .ips
        .iter()
        .filter(|ipc| Family::of(&ipc.address.ip) == family)
        .find_map(|ipc| ipc.gateway)
}

/// Everything done inside the container namespace after allocation: DAD
/// off, addresses and routes on, hardware address derived from the first
/// IPv4 address. Returns the interface's final hardware address.
pub async fn configure_container(
    netns: &NetNs,
    ifname: &str,
    result: &CNI100Result,
) -> Result<String, PluginError> {
    let ifname = ifname.to_string();
    let mut addresses = vec![];
    for ipc in result.ips.iter() {
        if ipc.interface.map_or(true, |i| i == CONTAINER_IFACE_INDEX) {
            addresses.push(to_ipnet(&ipc.address)?);
        }
    }
    let mut routes = vec![];
    for route in result.routes.iter() {
        let dst = to_ipnet(&route.dst)?;
        let gw = route
            .gw
            .or_else(|| family_gateway(result, Family::of(&route.dst.ip)));
        routes.push((dst, gw));
    }
    let first_v4 = match result.ips.first().map(|ipc| ipc.address.ip) {
        Some(IpAddr::V4(v4addr)) => Some(v4addr),
        _ => None,
    };

    netns
        .run(move |nl| async move {
            // hairpin mode on the bridge echoes neighbor solicitations back,
            // which makes DAD fail spuriously
            sysctl::disable_ipv6_dad(&ifname)?;

            let index = nl.link_index(&ifname).await?.ok_or_else(|| {
                PluginError::InterfaceSetupFailed(format!("failed to lookup {:?}", ifname))
            })?;
            nl.set_up(index).await.map_err(|e| {
                PluginError::InterfaceSetupFailed(format!("failed to set {:?} up: {}", ifname, e))
            })?;

            for ipn in addresses.iter() {
                match nl.add_address(index, ipn).await {
                    Ok(()) => {}
                    Err(e) if is_errno(&e, libc::EEXIST) => {}
                    Err(e) => {
                        return Err(PluginError::InterfaceSetupFailed(format!(
                            "failed to add IP addr {} to {:?}: {}",
                            ipn, ifname, e
                        )))
                    }
                }
            }
            for (dst, gw) in routes.iter() {
                nl.add_route(index, dst, *gw).await?;
            }

            if let Some(v4addr) = first_v4 {
                nl.set_hwaddr(index, hwaddr_from_ipv4(v4addr))
                    .await
                    .map_err(|e| {
                        PluginError::InterfaceSetupFailed(format!(
                            "failed to set hardware address of {:?}: {}",
                            ifname, e
                        ))
                    })?;
            }

            // refetch, the hardware address may have changed
            let msg = nl.link_by_name(&ifname).await?.ok_or_else(|| {
                PluginError::InterfaceSetupFailed(format!("could not lookup {:?}", ifname))
            })?;
            info!(ifname = %ifname, addresses = addresses.len(), routes = routes.len(), "container interface configured");
            Ok(link_mac(&msg))
        })
        .await
}

#[test]
fn test_normalize_empty_allocation() {
    let raw: Value = serde_json::from_str(r#"{"cniVersion":"0.4.0","ips":[]}"#).unwrap();
    assert!(matches!(
        normalize(&raw, "0.4.0"),
        Err(PluginError::EmptyAllocation)
    ));
}

#[test]
fn test_normalize_040() {
    let raw: Value = serde_json::from_str(
        r#"{"cniVersion":"0.4.0","ips":[{"version":"4","address":"10.1.2.5/24"}],"dns":{"nameservers":["10.1.2.1"]}}"#,
    )
    .unwrap();
    let result = normalize(&raw, "0.4.0").unwrap();

    assert_eq!(result.ips[0].address, "10.1.2.5/24".parse().unwrap());
    assert_eq!(result.dns.nameservers, vec!["10.1.2.1".to_string()]);
}

#[test]
fn test_normalize_garbage() {
    let raw: Value = serde_json::from_str(r#"{"cniVersion":"0.4.0","ips":"nope"}"#).unwrap();
    assert!(matches!(
        normalize(&raw, "0.4.0"),
        Err(PluginError::DelegateFailed { .. })
    ));
}

#[test]
fn test_delegate_error_parses_cni_error() {
    let err = delegate_error(br#"{"cniVersion":"0.4.0","code":11,"msg":"no addresses left"}"#, "host-local");
    match err {
        PluginError::DelegateFailed { code, msg } => {
            assert_eq!(code, Some(11));
            assert_eq!(msg, "no addresses left");
        }
        e => panic!("unexpected error: {}", e),
    }

    let err = delegate_error(b"segfault\n", "host-local");
    assert!(matches!(err, PluginError::DelegateFailed { code: None, .. }));
}

#[test]
fn test_family_gateway() {
    let raw: Value = serde_json::from_str(
        r#"{"cniVersion":"1.0.0","ips":[{"address":"fd00::5/64","gateway":"fd00::1"},{"address":"10.1.2.5/24","gateway":"10.1.2.1"}]}"#,
    )
    .unwrap();
    let result = normalize(&raw, "1.0.0").unwrap();

    assert_eq!(family_gateway(&result, Family::V4), Some("10.1.2.1".parse().unwrap()));
    assert_eq!(family_gateway(&result, Family::V6), Some("fd00::1".parse().unwrap()));
}

#[tokio::test]
async fn test_exec_delegate_missing_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let delegate = ExecDelegate::new(&dir.path().display().to_string());
    let err = delegate.exec_add("host-local", b"{}").await.unwrap_err();
    assert!(matches!(err, PluginError::DelegateFailed { code: None, .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_delegate_runs_plugin() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let plugin = dir.path().join("fake-ipam");
    std::fs::write(
        &plugin,
        "#!/bin/sh\ncat >/dev/null\necho '{\"cniVersion\":\"0.4.0\",\"ips\":[{\"version\":\"4\",\"address\":\"10.1.2.5/24\"}]}'\n",
    )
    .unwrap();
    std::fs::set_permissions(&plugin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let delegate = ExecDelegate::new(&format!("/nonexistent:{}", dir.path().display()));
    let raw = delegate.exec_add("fake-ipam", b"{}").await.unwrap();
    let result = normalize(&raw, "0.4.0").unwrap();
    assert_eq!(result.ips.len(), 1);
}
