// Netlink operations for bridge, veth and neighbor management.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::neighbour::nlas::Nla as NeighbourNla;
pub use rtnetlink::IpVersion;

use crate::error::{NetworkError, Result};

const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

/// Capability: the link, address and neighbor operations the provisioner
/// needs from the kernel.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Kernel ifindex for a link name. `NotFound` when no such link.
    async fn link_index(&self, name: &str) -> Result<u32>;

    /// Create a bridge link with the given MTU and return its ifindex.
    async fn create_bridge(&self, name: &str, mtu: u32) -> Result<u32>;

    /// Look up a link by name and remove it.
    async fn delete_link(&self, name: &str) -> Result<()>;

    /// Set a link administratively up.
    async fn set_up(&self, index: u32) -> Result<()>;

    /// Add an IPv4 address with prefix to a link.
    async fn add_address(&self, index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<()>;

    /// All IPv4 addresses currently assigned to a link.
    async fn ipv4_addresses(&self, index: u32) -> Result<Vec<(Ipv4Addr, u8)>>;

    /// Create a veth pair. Returns (ifindex, peer ifindex).
    async fn create_veth(&self, name: &str, peer_name: &str) -> Result<(u32, u32)>;

    /// Enslave a link to a master (attach to bridge).
    async fn set_master(&self, index: u32, master_index: u32) -> Result<()>;

    /// Move a link into the network namespace of `pid`.
    async fn move_to_netns(&self, index: u32, pid: i32) -> Result<()>;

    /// The kernel's neighbor table entries reachable via `index` for the
    /// given address family, as address strings.
    async fn neighbors(&self, index: u32, family: IpVersion) -> Result<HashSet<String>>;
}

/// Persistent netlink handle wrapping rtnetlink for all link operations.
/// One handle per process, reused across the whole invocation.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }
}

#[async_trait]
impl LinkOps for NetlinkHandle {
    async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink surfaces "not found" as an error on some kernels
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    async fn create_bridge(&self, name: &str, mtu: u32) -> Result<u32> {
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        Ok(index)
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    async fn add_address(&self, index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let result = self
            .handle
            .address()
            .add(index, IpAddr::V4(addr), prefix_len)
            .execute()
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()), // already assigned
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    async fn ipv4_addresses(&self, index: u32) -> Result<Vec<(Ipv4Addr, u8)>> {
        let mut msgs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut addrs = Vec::new();
        while let Some(msg) = msgs.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.family != AF_INET {
                continue;
            }
            for nla in &msg.nlas {
                if let AddressNla::Address(bytes) = nla {
                    if bytes.len() == 4 {
                        let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
                        addrs.push((Ipv4Addr::from(octets), msg.header.prefix_len));
                    }
                }
            }
        }

        Ok(addrs)
    }

    async fn create_veth(&self, name: &str, peer_name: &str) -> Result<(u32, u32)> {
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer_name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        let index = self.link_index(name).await?;
        let peer_index = self.link_index(peer_name).await?;

        Ok((index, peer_index))
    }

    async fn set_master(&self, index: u32, master_index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    async fn move_to_netns(&self, index: u32, pid: i32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_pid(pid as u32)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    async fn neighbors(&self, index: u32, family: IpVersion) -> Result<HashSet<String>> {
        let want_family = match family {
            IpVersion::V4 => AF_INET,
            IpVersion::V6 => AF_INET6,
        };

        let mut msgs = self.handle.neighbours().get().execute();
        let mut set = HashSet::new();

        while let Some(msg) = msgs.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.ifindex != index || msg.header.family != want_family {
                continue;
            }
            for nla in &msg.nlas {
                if let NeighbourNla::Destination(bytes) = nla {
                    match bytes.len() {
                        4 => {
                            let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
                            set.insert(Ipv4Addr::from(octets).to_string());
                        }
                        16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(bytes);
                            set.insert(Ipv6Addr::from(octets).to_string());
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(set)
    }
}
