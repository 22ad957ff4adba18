// Network namespace transitions and in-namespace interface configuration.
//
// setns() affects the calling OS thread. All in-namespace work runs on a
// dedicated std::thread, never a tokio task, so the runtime's worker
// threads are never switched out of the host namespace.

use std::fs::File;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;

use async_trait::async_trait;
use futures::TryStreamExt;
use nix::sched::{setns, CloneFlags};

use crate::error::{NetworkError, Result};

/// Capability: namespace-side interface configuration.
#[async_trait]
pub trait NetnsOps: Send + Sync {
    /// Inside the network namespace of `pid`: find the interface named
    /// `peer_name`, rename it to `iface_name`, assign `addr`/`prefix_len`,
    /// bring it up and route default traffic through `gateway`.
    async fn configure_interface(
        &self,
        pid: i32,
        peer_name: &str,
        iface_name: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
        gateway: Ipv4Addr,
    ) -> Result<()>;

    /// Whether the network namespace of `pid` can still be opened.
    fn netns_exists(&self, pid: i32) -> bool;
}

/// Production implementation entering namespaces via /proc and setns(2).
pub struct NsEnter;

#[async_trait]
impl NetnsOps for NsEnter {
    async fn configure_interface(
        &self,
        pid: i32,
        peer_name: &str,
        iface_name: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let peer_name = peer_name.to_string();
        let iface_name = iface_name.to_string();
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            let result =
                configure_pinned(pid, &peer_name, &iface_name, addr, prefix_len, gateway);
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| NetworkError::Namespace("in-namespace thread panicked".to_string()))?
    }

    fn netns_exists(&self, pid: i32) -> bool {
        File::open(format!("/proc/{}/ns/net", pid)).is_ok()
    }
}

/// Runs on a dedicated OS thread. The thread enters the target namespace,
/// configures the interface, and switches back to the original namespace
/// before returning, whatever the outcome of the configuration.
fn configure_pinned(
    pid: i32,
    peer_name: &str,
    iface_name: &str,
    addr: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
) -> Result<()> {
    // Save the current network namespace.
    let orig_ns = File::open("/proc/thread-self/ns/net").map_err(|e| {
        NetworkError::Namespace(format!("getting current network namespace failed: {}", e))
    })?;

    // Get the namespace from the pid.
    let ns_path = format!("/proc/{}/ns/net", pid);
    let target_ns = File::open(&ns_path).map_err(|e| {
        NetworkError::Namespace(format!(
            "getting network namespace for pid {} failed: {}",
            pid, e
        ))
    })?;

    // Enter the namespace.
    setns(target_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
        NetworkError::Namespace(format!("entering network namespace failed: {}", e))
    })?;

    let result = configure_in_current_ns(peer_name, iface_name, addr, prefix_len, gateway);

    // Switch back to the original namespace on every exit path.
    if let Err(e) = setns(orig_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
        return Err(NetworkError::Namespace(format!(
            "switching back to original namespace failed: {}",
            e
        )));
    }

    result
}

/// The netlink work itself, run while the thread sits in the target
/// namespace. Needs its own connection: the handle owned by the caller
/// talks to the host namespace.
fn configure_in_current_ns(
    peer_name: &str,
    iface_name: &str,
    addr: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(NetworkError::Io)?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        // Find the peer interface by its transfer name.
        let mut links = handle
            .link()
            .get()
            .match_name(peer_name.to_string())
            .execute();
        let msg = links
            .try_next()
            .await
            .map_err(NetworkError::Netlink)?
            .ok_or_else(|| {
                NetworkError::NotFound(format!("peer {} in target netns", peer_name))
            })?;
        let index = msg.header.index;

        // The interface must be down while it is renamed.
        handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        handle
            .link()
            .set(index)
            .name(iface_name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        handle
            .address()
            .add(index, std::net::IpAddr::V4(addr), prefix_len)
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        // Default route through the bridge gateway.
        handle
            .route()
            .add()
            .v4()
            .gateway(gateway)
            .output_interface(index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        tracing::debug!(
            "configured {} as {} ({}/{}) via {}",
            peer_name,
            iface_name,
            addr,
            prefix_len,
            gateway
        );

        Ok(())
    })
}
