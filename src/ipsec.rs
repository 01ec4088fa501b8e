//! IPsec tunnel orchestration for one container namespace.
//!
//! The key exchange itself is done by the host's strongSwan install; this
//! module only lays out its per-namespace files and starts or stops the
//! daemon inside the namespace through `ip netns exec`.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::IpsecConf;
use crate::error::PluginError;

const LEFTID_PLACEHOLDER: &str = "@leftid";

pub const DEFAULT_TEMPLATE: &str = concat!(
    "conn %default\n",
    "\tikelifetime=60m\n",
    "\tkeylife=20m\n",
    "\trekeymargin=3m\n",
    "\tkeyingtries=1\n",
    "\tkeyexchange=ikev2\n",
    "\tauthby=secret\n",
    "\n",
    "conn home\n",
    "\tleft=%any\n",
    "\tleftsourceip=%config\n",
    "\tleftid=@leftid\n",
    "\tleftfirewall=yes\n",
    "\tright=10.9.0.2\n",
    "\trightsubnet=172.17.0.0/16,10.100.255.0/28\n",
    "\trightid=server\n",
    "\tauto=start\n",
);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("cannot derive namespace id from {0:?}, expected /proc/<pid>/...")]
    InvalidNetns(String),
    #[error("failed to read template {path:?}: {source}")]
    Template { path: PathBuf, source: io::Error },
    #[error("{what} {path:?}: {source}")]
    Fs {
        what: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, io::Error),
}

impl From<TunnelError> for PluginError {
    fn from(err: TunnelError) -> PluginError {
        match err {
            TunnelError::InvalidNetns(_) => PluginError::InvalidConfig(err.to_string()),
            _ => PluginError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Uninitialized,
    Configured,
    Started,
    Stopped,
}

/// `/proc/27273/ns/net` -> `27273`
pub fn extract_proc_id(netns_path: &str) -> Result<String, TunnelError> {
    let mut parts = netns_path.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(""), Some("proc"), Some(id)) if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => {
            Ok(id.to_string())
        }
        _ => Err(TunnelError::InvalidNetns(netns_path.to_string())),
    }
}

/// The first `@leftid` becomes the namespace id, the rest is untouched.
pub fn render_config(template: &str, id: &str) -> String {
    template.replacen(LEFTID_PLACEHOLDER, id, 1)
}

pub fn load_template(path: Option<&Path>) -> Result<String, TunnelError> {
    match path {
        Some(path) => fs::read_to_string(path).map_err(|e| TunnelError::Template {
            path: path.to_path_buf(),
            source: e,
        }),
        None => Ok(DEFAULT_TEMPLATE.to_string()),
    }
}

fn mkdir_all(path: &Path) -> Result<(), TunnelError> {
    fs::create_dir_all(path).map_err(|e| TunnelError::Fs {
        what: "failed to create",
        path: path.to_path_buf(),
        source: e,
    })
}

pub struct Tunnel {
    conf: IpsecConf,
    id: String,
    state: TunnelState,
}

impl Tunnel {
    pub fn new(conf: &IpsecConf, netns_path: &str) -> Result<Self, TunnelError> {
        Ok(Tunnel {
            conf: conf.clone(),
            id: extract_proc_id(netns_path)?,
            state: TunnelState::Uninitialized,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// name under which `ip netns` knows the namespace
    pub fn ns_name(&self) -> String {
        format!("ns-{}", self.id)
    }

    pub fn link_path(&self) -> PathBuf {
        self.conf.netns_dir.join(self.ns_name())
    }

    pub fn config_dir(&self) -> PathBuf {
        self.conf.config_root.join(self.ns_name())
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("ipsec.conf")
    }

    fn transition(&mut self, to: TunnelState) {
        debug!(ns = %self.ns_name(), from = ?self.state, to = ?to, "tunnel state");
        self.state = to;
    }

    /// Lays out the files `ip netns exec` bind-mounts over /etc for the
    /// namespace and writes the rendered connection config.
    pub fn configure(&mut self) -> Result<(), TunnelError> {
        let template = load_template(self.conf.template.as_deref())?;

        mkdir_all(&self.conf.netns_dir)?;
        mkdir_all(&self.conf.run_dir)?;
        // charon's pid file lands here, mounted over /etc/ipsec.d/run
        mkdir_all(&self.config_dir().join("ipsec.d").join("run"))?;

        let target = PathBuf::from(format!("/proc/{}/ns/net", self.id));
        let link = self.link_path();
        match std::os::unix::fs::symlink(&target, &link) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(link = %link.display(), "netns link already present");
            }
            Err(e) => {
                return Err(TunnelError::Fs {
                    what: "failed to link",
                    path: link,
                    source: e,
                })
            }
        }

        let path = self.config_path();
        fs::write(&path, render_config(&template, &self.id)).map_err(|e| TunnelError::Fs {
            what: "failed to write",
            path: path.clone(),
            source: e,
        })?;

        info!(ns = %self.ns_name(), config = %path.display(), "tunnel configured");
        self.transition(TunnelState::Configured);
        Ok(())
    }

    fn start_command(&self) -> String {
        format!(
            "sleep {}; exec {} netns exec {} {} start",
            self.conf.start_delay,
            self.conf.ip_bin,
            self.ns_name(),
            self.conf.ipsec_bin
        )
    }

    /// Starts the daemon in the background after the configured delay. The
    /// child is not waited for and outlives this process.
    pub fn start(&mut self) -> Result<(), TunnelError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.conf.log_file)
            .map_err(|e| TunnelError::Fs {
                what: "failed to open",
                path: self.conf.log_file.clone(),
                source: e,
            })?;
        let log_err = log.try_clone().map_err(|e| TunnelError::Fs {
            what: "failed to open",
            path: self.conf.log_file.clone(),
            source: e,
        })?;

        let script = self.start_command();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|e| TunnelError::Spawn(script.clone(), e))?;

        info!(ns = %self.ns_name(), pid = child.id(), delay = self.conf.start_delay, "tunnel start scheduled");
        self.transition(TunnelState::Started);
        Ok(())
    }

    /// Stops the daemon and removes what `configure` created. Nothing here
    /// fails: the namespace may already be gone.
    pub async fn stop(&mut self) {
        let ns_name = self.ns_name();
        let status = tokio::process::Command::new(&self.conf.ip_bin)
            .args(["netns", "exec", ns_name.as_str(), self.conf.ipsec_bin.as_str(), "stop"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => info!(ns = %self.ns_name(), "tunnel stopped"),
            Ok(s) => warn!(ns = %self.ns_name(), "ipsec stop exited with {}", s),
            Err(e) => warn!(ns = %self.ns_name(), "failed to run ipsec stop: {}", e),
        }

        self.cleanup();
        self.transition(TunnelState::Stopped);
    }

    fn cleanup(&self) {
        let link = self.link_path();
        if let Err(e) = fs::remove_file(&link) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(link = %link.display(), "failed to remove netns link: {}", e);
            }
        }
        let dir = self.config_dir();
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), "failed to remove tunnel config: {}", e);
            }
        }
    }
}

#[cfg(test)]
fn test_conf(root: &Path) -> IpsecConf {
    IpsecConf {
        netns_dir: root.join("netns"),
        config_root: root.join("etc-netns"),
        run_dir: root.join("ipsec-run"),
        log_file: root.join("swan.log"),
        start_delay: 0,
        ipsec_bin: "true".to_string(),
        ip_bin: "true".to_string(),
        ..IpsecConf::default()
    }
}

#[test]
fn test_extract_proc_id() {
    assert_eq!(extract_proc_id("/proc/27273/ns/net").unwrap(), "27273");
    assert_eq!(extract_proc_id("/proc/1/ns/net/").unwrap(), "1");
}

#[test]
fn test_extract_proc_id_rejects_other_paths() {
    for path in ["/var/run/netns/foo", "/proc/self/ns/net", "/proc//ns/net", "proc/12/ns/net", ""] {
        assert!(
            matches!(extract_proc_id(path), Err(TunnelError::InvalidNetns(_))),
            "{:?}",
            path
        );
    }
}

#[test]
fn test_render_config_replaces_once() {
    let rendered = render_config(DEFAULT_TEMPLATE, "27273");

    assert!(rendered.contains("\tleftid=27273\n"));
    assert!(!rendered.contains(LEFTID_PLACEHOLDER));
    assert_eq!(rendered.lines().count(), DEFAULT_TEMPLATE.lines().count());
    for (a, b) in rendered.lines().zip(DEFAULT_TEMPLATE.lines()) {
        if !b.contains(LEFTID_PLACEHOLDER) {
            assert_eq!(a, b);
        }
    }

    assert_eq!(render_config("@leftid @leftid", "7"), "7 @leftid");
}

#[test]
fn test_configure_writes_files() {
    let dir = tempfile::tempdir().unwrap();
    let conf = test_conf(dir.path());
    let mut tunnel = Tunnel::new(&conf, "/proc/27273/ns/net").unwrap();
    assert_eq!(tunnel.state(), TunnelState::Uninitialized);

    tunnel.configure().unwrap();
    // again, everything already exists
    tunnel.configure().unwrap();

    assert_eq!(tunnel.state(), TunnelState::Configured);
    assert_eq!(
        fs::read_link(dir.path().join("netns/ns-27273")).unwrap(),
        PathBuf::from("/proc/27273/ns/net")
    );
    assert!(dir.path().join("etc-netns/ns-27273/ipsec.d/run").is_dir());
    assert!(dir.path().join("ipsec-run").is_dir());
    let written = fs::read_to_string(dir.path().join("etc-netns/ns-27273/ipsec.conf")).unwrap();
    assert_eq!(written, render_config(DEFAULT_TEMPLATE, "27273"));
}

#[test]
fn test_configure_custom_template() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("client.conf");
    fs::write(&template, "conn x\n\tleftid=@leftid\n").unwrap();
    let conf = IpsecConf {
        template: Some(template),
        ..test_conf(dir.path())
    };
    let mut tunnel = Tunnel::new(&conf, "/proc/42/ns/net").unwrap();
    tunnel.configure().unwrap();

    assert_eq!(
        fs::read_to_string(tunnel.config_path()).unwrap(),
        "conn x\n\tleftid=42\n"
    );
}

#[test]
fn test_missing_template() {
    let dir = tempfile::tempdir().unwrap();
    let conf = IpsecConf {
        template: Some(dir.path().join("nope")),
        ..test_conf(dir.path())
    };
    let mut tunnel = Tunnel::new(&conf, "/proc/42/ns/net").unwrap();
    assert!(matches!(tunnel.configure(), Err(TunnelError::Template { .. })));
}

#[test]
fn test_start_command() {
    let tunnel = Tunnel::new(&IpsecConf::default(), "/proc/27273/ns/net").unwrap();
    assert_eq!(
        tunnel.start_command(),
        "sleep 20; exec ip netns exec ns-27273 ipsec start"
    );
}

#[tokio::test]
async fn test_start_and_stop_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let conf = test_conf(dir.path());
    let mut tunnel = Tunnel::new(&conf, "/proc/27273/ns/net").unwrap();
    tunnel.configure().unwrap();
    tunnel.start().unwrap();
    assert_eq!(tunnel.state(), TunnelState::Started);
    assert!(conf.log_file.exists());

    tunnel.stop().await;
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert!(fs::symlink_metadata(tunnel.link_path()).is_err());
    assert!(!tunnel.config_dir().exists());

    // stopping twice is harmless
    tunnel.stop().await;
}
