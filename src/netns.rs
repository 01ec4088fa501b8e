//! Scoped execution inside a network namespace.
//!
//! `setns(2)` only affects the calling OS thread, so anything that must run
//! inside a container namespace is executed on a dedicated thread with its
//! own single-threaded runtime and a netlink connection opened after the
//! switch. The thread returns to its original namespace on every exit path.

use std::fs::File;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::netlink::NetlinkHandle;

const THREAD_SELF_NETNS: &str = "/proc/thread-self/ns/net";

#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PluginError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| PluginError::NamespaceOpenFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(NetNs { path, file })
    }

    /// namespace of the calling thread
    pub fn current() -> Result<Self, PluginError> {
        Self::open(THREAD_SELF_NETNS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(NetNs {
            path: self.path.clone(),
            file: self.file.try_clone()?,
        })
    }

    /// Runs `f` with a netlink handle bound to this namespace and waits for
    /// it to finish.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T, PluginError>
    where
        F: FnOnce(NetlinkHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PluginError>>,
        T: Send + 'static,
    {
        let target = self.try_clone()?;
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            let _ = tx.send(run_in_netns(target, f));
        });

        rx.await.map_err(|_| {
            PluginError::InterfaceSetupFailed("in-namespace thread panicked".to_string())
        })?
    }
}

// restores the thread's original namespace when dropped
struct NetNsGuard {
    origin: File,
}

impl Drop for NetNsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.origin, CloneFlags::CLONE_NEWNET) {
            warn!("failed to return to original netns: {}", e);
        }
    }
}

fn enter(target: &NetNs) -> Result<NetNsGuard, PluginError> {
    let origin = File::open(THREAD_SELF_NETNS)?;
    setns(&target.file, CloneFlags::CLONE_NEWNET).map_err(|e| {
        PluginError::NamespaceOpenFailed {
            path: target.path.display().to_string(),
            source: io::Error::from(e),
        }
    })?;
    debug!(netns = %target.path.display(), "entered netns");
    Ok(NetNsGuard { origin })
}

fn run_in_netns<F, Fut, T>(target: NetNs, f: F) -> Result<T, PluginError>
where
    F: FnOnce(NetlinkHandle) -> Fut,
    Fut: Future<Output = Result<T, PluginError>>,
{
    let _guard = enter(&target)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let handle = NetlinkHandle::new()?;
        f(handle).await
    })
}

#[test]
fn test_open_missing_netns() {
    let err = NetNs::open("/proc/0/ns/net/does-not-exist").unwrap_err();
    assert!(matches!(err, PluginError::NamespaceOpenFailed { .. }));
}

#[tokio::test]
#[ignore = "needs CAP_SYS_ADMIN"]
async fn test_run_in_current_netns() {
    let ns = NetNs::current().unwrap();
    let index = ns
        .run(|handle| async move { handle.link_index("lo").await })
        .await
        .unwrap();
    assert_eq!(index, Some(1));
}
