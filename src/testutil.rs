// Deterministic in-memory capability implementations for tests.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{NetworkError, Result};
use crate::firewall::Nat;
use crate::netlink::{IpVersion, LinkOps};
use crate::netns::NetnsOps;
use crate::probe::Prober;

/// Prober answering from a fixed set of "live" addresses.
pub struct StaticProber {
    responsive: HashSet<Ipv4Addr>,
}

impl StaticProber {
    pub fn silent() -> Self {
        Self {
            responsive: HashSet::new(),
        }
    }

    pub fn responding_to(addrs: &[&str]) -> Self {
        Self {
            responsive: addrs.iter().map(|s| s.parse().unwrap()).collect(),
        }
    }
}

#[async_trait]
impl Prober for StaticProber {
    async fn probe(&self, ip: Ipv4Addr, _deadline: Duration) -> bool {
        self.responsive.contains(&ip)
    }
}

#[derive(Clone, Debug)]
pub struct MemLink {
    pub name: String,
    pub index: u32,
    pub kind: &'static str,
    pub mtu: u32,
    pub up: bool,
    pub master: Option<u32>,
    pub addrs: Vec<(Ipv4Addr, u8)>,
    /// Set once the link has been moved out of the host namespace.
    pub netns_pid: Option<i32>,
}

/// In-memory stand-in for the kernel's link table.
pub struct MemNet {
    pub links: Mutex<Vec<MemLink>>,
    pub neighbors_v4: Mutex<HashSet<String>>,
    pub neighbors_v6: Mutex<HashSet<String>>,
    next_index: AtomicU32,
}

impl MemNet {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
            neighbors_v4: Mutex::new(HashSet::new()),
            neighbors_v6: Mutex::new(HashSet::new()),
            next_index: AtomicU32::new(1),
        }
    }

    fn alloc_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    pub fn link(&self, name: &str) -> Option<MemLink> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.name == name)
            .cloned()
    }

    fn host_index(&self, name: &str) -> Result<u32> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.name == name && l.netns_pid.is_none())
            .map(|l| l.index)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))
    }

    fn with_link<T>(&self, index: u32, f: impl FnOnce(&mut MemLink) -> T) -> Result<T> {
        let mut links = self.links.lock().unwrap();
        let link = links
            .iter_mut()
            .find(|l| l.index == index)
            .ok_or_else(|| NetworkError::NotFound(format!("link index {}", index)))?;
        Ok(f(link))
    }
}

#[async_trait]
impl LinkOps for MemNet {
    async fn link_index(&self, name: &str) -> Result<u32> {
        self.host_index(name)
    }

    async fn create_bridge(&self, name: &str, mtu: u32) -> Result<u32> {
        let index = self.alloc_index();
        self.links.lock().unwrap().push(MemLink {
            name: name.to_string(),
            index,
            kind: "bridge",
            mtu,
            up: false,
            master: None,
            addrs: Vec::new(),
            netns_pid: None,
        });
        Ok(index)
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let index = self.host_index(name)?;
        self.links.lock().unwrap().retain(|l| l.index != index);
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.with_link(index, |l| l.up = true)
    }

    async fn add_address(&self, index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.with_link(index, |l| {
            if !l.addrs.contains(&(addr, prefix_len)) {
                l.addrs.push((addr, prefix_len));
            }
        })
    }

    async fn ipv4_addresses(&self, index: u32) -> Result<Vec<(Ipv4Addr, u8)>> {
        self.with_link(index, |l| l.addrs.clone())
    }

    async fn create_veth(&self, name: &str, peer_name: &str) -> Result<(u32, u32)> {
        let index = self.alloc_index();
        let peer_index = self.alloc_index();
        let mut links = self.links.lock().unwrap();
        links.push(MemLink {
            name: name.to_string(),
            index,
            kind: "veth",
            mtu: 1500,
            up: false,
            master: None,
            addrs: Vec::new(),
            netns_pid: None,
        });
        links.push(MemLink {
            name: peer_name.to_string(),
            index: peer_index,
            kind: "veth",
            mtu: 1500,
            up: false,
            master: None,
            addrs: Vec::new(),
            netns_pid: None,
        });
        Ok((index, peer_index))
    }

    async fn set_master(&self, index: u32, master_index: u32) -> Result<()> {
        self.with_link(index, |l| l.master = Some(master_index))
    }

    async fn move_to_netns(&self, index: u32, pid: i32) -> Result<()> {
        self.with_link(index, |l| l.netns_pid = Some(pid))
    }

    async fn neighbors(&self, _index: u32, family: IpVersion) -> Result<HashSet<String>> {
        let set = match family {
            IpVersion::V4 => self.neighbors_v4.lock().unwrap().clone(),
            IpVersion::V6 => self.neighbors_v6.lock().unwrap().clone(),
        };
        Ok(set)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConfiguredInterface {
    pub pid: i32,
    pub peer_name: String,
    pub iface_name: String,
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

/// NetnsOps double that records configuration calls instead of entering
/// namespaces.
pub struct RecordingNetns {
    pub configured: Mutex<Vec<ConfiguredInterface>>,
    pub dead_pids: Mutex<HashSet<i32>>,
}

impl RecordingNetns {
    pub fn new() -> Self {
        Self {
            configured: Mutex::new(Vec::new()),
            dead_pids: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl NetnsOps for RecordingNetns {
    async fn configure_interface(
        &self,
        pid: i32,
        peer_name: &str,
        iface_name: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        self.configured.lock().unwrap().push(ConfiguredInterface {
            pid,
            peer_name: peer_name.to_string(),
            iface_name: iface_name.to_string(),
            addr,
            prefix_len,
            gateway,
        });
        Ok(())
    }

    fn netns_exists(&self, pid: i32) -> bool {
        !self.dead_pids.lock().unwrap().contains(&pid)
    }
}

/// Nat double that records every ensure call, so a duplicated install
/// shows up as a repeated rule.
pub struct RecordingNat {
    pub rules: Mutex<Vec<String>>,
}

impl RecordingNat {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Nat for RecordingNat {
    async fn ensure_masquerade(&self, source_cidr: &str) -> Result<()> {
        self.rules
            .lock()
            .unwrap()
            .push(format!("-s {} -j MASQUERADE", source_cidr));
        Ok(())
    }
}
