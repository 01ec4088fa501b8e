//! /proc/sys knobs. Paths under /proc/sys/net resolve against the
//! network namespace of the calling thread.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::gateway::Family;

const IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const IPV6_FORWARD: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

// writes only when the current value differs
fn echo1(path: &Path, value: &str) -> io::Result<()> {
    if let Ok(current) = fs::read_to_string(path) {
        if current.trim() == value {
            return Ok(());
        }
    }
    debug!(path = %path.display(), value, "writing sysctl");
    fs::write(path, value)
}

pub fn enable_ip_forward(family: Family) -> io::Result<()> {
    match family {
        Family::V4 => echo1(Path::new(IPV4_FORWARD), "1"),
        Family::V6 => echo1(Path::new(IPV6_FORWARD), "1"),
    }
}

fn accept_dad_path(ifname: &str) -> PathBuf {
    PathBuf::from(format!("/proc/sys/net/ipv6/conf/{}/accept_dad", ifname))
}

/// Disables IPv6 duplicate address detection on `ifname`. A kernel without
/// IPv6 has no such knob, which is fine.
pub fn disable_ipv6_dad(ifname: &str) -> io::Result<()> {
    disable_dad_at(&accept_dad_path(ifname))
}

fn disable_dad_at(path: &Path) -> io::Result<()> {
    match echo1(path, "0") {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[test]
fn test_echo1_skips_same_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ip_forward");
    fs::write(&path, "1\n").unwrap();

    echo1(&path, "1").unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");

    echo1(&path, "0").unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "0");
}

#[test]
fn test_disable_dad_missing_knob() {
    let dir = tempfile::tempdir().unwrap();
    disable_dad_at(&dir.path().join("nope").join("accept_dad")).unwrap();
}

#[test]
fn test_accept_dad_path() {
    assert_eq!(
        accept_dad_path("eth0"),
        PathBuf::from("/proc/sys/net/ipv6/conf/eth0/accept_dad")
    );
}
