// ipnet.rs: CIDR notation address ("10.1.1.1/24") as it appears in CNI JSON
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serializer};
use thiserror::Error;

/// Host address plus prefix length. Unlike `ipnet::IpNet` the prefix is not
/// checked on parse, plugins decide what to do with a bogus one.
#[derive(Clone, PartialEq, Eq)]
pub struct IPNet {
    pub ip: IpAddr,
    pub netmask_len: u8,
}

#[derive(Debug, Error)]
pub enum ParseIPNetError {
    #[error("invalid ip/mask: {0}")]
    Format(String),
    #[error("failed to parse IP: {0}")]
    Address(String),
    #[error("failed to parse len: {0}")]
    PrefixLen(String),
    #[error("prefix length {1} out of range for {0}")]
    OutOfRange(IpAddr, u8),
}

impl IPNet {
    /// Checked conversion into `ipnet::IpNet`, keeping the host bits.
    pub fn to_ipnet(&self) -> Result<::ipnet::IpNet, ParseIPNetError> {
        ::ipnet::IpNet::new(self.ip, self.netmask_len)
            .map_err(|_| ParseIPNetError::OutOfRange(self.ip, self.netmask_len))
    }
}

impl From<::ipnet::IpNet> for IPNet {
    fn from(n: ::ipnet::IpNet) -> IPNet {
        IPNet {
            ip: n.addr(),
            netmask_len: n.prefix_len(),
        }
    }
}

impl fmt::Debug for IPNet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for IPNet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.netmask_len)
    }
}

impl FromStr for IPNet {
    type Err = ParseIPNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, len) = s
            .split_once('/')
            .ok_or_else(|| ParseIPNetError::Format(s.to_string()))?;
        Ok(IPNet {
            ip: ip
                .parse()
                .map_err(|_| ParseIPNetError::Address(s.to_string()))?,
            netmask_len: len
                .parse::<u8>()
                .map_err(|_| ParseIPNetError::PrefixLen(s.to_string()))?,
        })
    }
}

impl serde::Serialize for IPNet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

struct IPNetVisitor;

impl<'de> Visitor<'de> for IPNetVisitor {
    type Value = IPNet;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string of the form `ip/prefix_len`")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for IPNet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(IPNetVisitor)
    }
}

#[test]
fn test_ipnet_display() {
    let v4 = IPNet {
        ip: "10.1.1.1".parse().unwrap(),
        netmask_len: 24,
    };
    assert_eq!(v4.to_string(), "10.1.1.1/24");
    assert_eq!(format!("{:?}", v4), "10.1.1.1/24");

    let v6: IPNet = "fd00::1/64".parse().unwrap();
    assert_eq!(serde_json::to_string(&v6).unwrap(), "\"fd00::1/64\"");
}

#[test]
fn test_ipnet_parse() {
    let parsed: IPNet = serde_json::from_str("\"1.1.1.1/24\"").unwrap();
    assert_eq!(
        parsed,
        IPNet {
            ip: "1.1.1.1".parse().unwrap(),
            netmask_len: 24,
        }
    );

    assert!(matches!("1.1.1.1".parse::<IPNet>(), Err(ParseIPNetError::Format(_))));
    assert!(matches!("1.1.1/24".parse::<IPNet>(), Err(ParseIPNetError::Address(_))));
    assert!(matches!("1.1.1.1/x".parse::<IPNet>(), Err(ParseIPNetError::PrefixLen(_))));
    assert!(serde_json::from_str::<IPNet>("\"ff02::1\"").is_err());
}

#[test]
fn test_ipnet_to_ipnet() {
    let n: IPNet = "10.1.2.5/24".parse().unwrap();
    let converted = n.to_ipnet().unwrap();
    assert_eq!(converted.to_string(), "10.1.2.5/24");
    assert_eq!(IPNet::from(converted), n);

    // accepted on parse, rejected on conversion
    let bogus: IPNet = "10.1.2.5/40".parse().unwrap();
    assert!(matches!(bogus.to_ipnet(), Err(ParseIPNetError::OutOfRange(_, 40))));
}
