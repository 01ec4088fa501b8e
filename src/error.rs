use libcni::types::types_common::{
    CNIError, ERR_DECODE_FAILURE, ERR_INCOMPATIBLE_VERSION, ERR_INVALID_ENV,
    ERR_INVALID_NETCONF, ERR_IO_FAILURE,
};
use std::io;
use thiserror::Error;

pub const ERR_UNKNOWN_ADDRESS_FAMILY: u32 = 100;
pub const ERR_NAME_CONFLICT: u32 = 101;
pub const ERR_ADDRESS_CONFLICT: u32 = 102;
pub const ERR_INTERFACE_SETUP: u32 = 103;
pub const ERR_EMPTY_ALLOCATION: u32 = 104;
pub const ERR_NAMESPACE_OPEN: u32 = 105;
pub const ERR_DELEGATE: u32 = 106;
pub const ERR_FIREWALL: u32 = 107;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid network config: {0}")]
    InvalidConfig(String),
    #[error("cannot set hairpin mode and promiscuous mode at the same time")]
    ConflictingModes,
    #[error("unknown address family: {0}")]
    UnknownAddressFamily(String),
    #[error("{0:?} already exists but is not a bridge")]
    NameConflict(String),
    #[error("{bridge:?} already has an IP address different from {address}")]
    AddressConflict { bridge: String, address: String },
    #[error("interface setup failed: {0}")]
    InterfaceSetupFailed(String),
    #[error("IPAM plugin returned missing IP config")]
    EmptyAllocation,
    #[error("failed to open netns {path:?}: {source}")]
    NamespaceOpenFailed { path: String, source: io::Error },
    #[error("{msg}")]
    DelegateFailed { code: Option<u32>, msg: String },
    #[error("failed to set up masquerade: {0}")]
    Firewall(String),
    #[error("failed to decode: {0}")]
    Decode(serde_json::Error),
    #[error("{0}")]
    MissingArgs(String),
    #[error("incompatible CNI version: {0}")]
    IncompatibleVersion(String),
    #[error("I/O failure: {0}")]
    Io(io::Error),
}

impl From<io::Error> for PluginError {
    fn from(err: io::Error) -> PluginError {
        PluginError::Io(err)
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Decode(err)
    }
}

impl From<rtnetlink::Error> for PluginError {
    fn from(err: rtnetlink::Error) -> PluginError {
        PluginError::InterfaceSetupFailed(err.to_string())
    }
}

impl From<libcni::skel::ResultError> for PluginError {
    fn from(err: libcni::skel::ResultError) -> PluginError {
        match err {
            libcni::skel::ResultError::JsonEncodeError(e) => PluginError::Decode(e),
            libcni::skel::ResultError::CNIVersionError(e) => {
                PluginError::IncompatibleVersion(e.to_string())
            }
        }
    }
}

impl From<libcni::skel::CmdArgsError<'static>> for PluginError {
    fn from(err: libcni::skel::CmdArgsError<'static>) -> PluginError {
        match err {
            libcni::skel::CmdArgsError::FailedReadStdIn(e) => PluginError::Io(e),
            e => PluginError::MissingArgs(e.to_string()),
        }
    }
}

impl PluginError {
    pub fn code(&self) -> u32 {
        match self {
            PluginError::InvalidConfig(_) | PluginError::ConflictingModes => ERR_INVALID_NETCONF,
            PluginError::UnknownAddressFamily(_) => ERR_UNKNOWN_ADDRESS_FAMILY,
            PluginError::NameConflict(_) => ERR_NAME_CONFLICT,
            PluginError::AddressConflict { .. } => ERR_ADDRESS_CONFLICT,
            PluginError::InterfaceSetupFailed(_) => ERR_INTERFACE_SETUP,
            PluginError::EmptyAllocation => ERR_EMPTY_ALLOCATION,
            PluginError::NamespaceOpenFailed { .. } => ERR_NAMESPACE_OPEN,
            PluginError::DelegateFailed { code, .. } => code.unwrap_or(ERR_DELEGATE),
            PluginError::Firewall(_) => ERR_FIREWALL,
            PluginError::Decode(_) => ERR_DECODE_FAILURE,
            PluginError::MissingArgs(_) => ERR_INVALID_ENV,
            PluginError::IncompatibleVersion(_) => ERR_INCOMPATIBLE_VERSION,
            PluginError::Io(_) => ERR_IO_FAILURE,
        }
    }

    pub fn to_cni_error(&self, cni_version: &str) -> CNIError {
        CNIError {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details: String::new(),
        }
    }
}

// netlink reports errno as a negative code
pub fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|c| c.get()) == Some(-errno),
        _ => false,
    }
}

#[test]
fn test_delegate_code_passthrough() {
    let err = PluginError::DelegateFailed {
        code: Some(11),
        msg: "try again".to_string(),
    };
    assert_eq!(err.code(), 11);
    assert_eq!(err.to_cni_error("0.4.0").msg, "try again");

    let err = PluginError::DelegateFailed {
        code: None,
        msg: "exec failed".to_string(),
    };
    assert_eq!(err.code(), ERR_DELEGATE);
}

#[test]
fn test_config_errors_map_to_invalid_netconf() {
    assert_eq!(PluginError::ConflictingModes.code(), ERR_INVALID_NETCONF);
    assert_eq!(
        PluginError::InvalidConfig("x".to_string()).code(),
        ERR_INVALID_NETCONF
    );
}
