// Endpoint provisioning: veth creation, namespace injection, address
// allocation and the durable record of every endpoint.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::allocator::{self, Segment};
use crate::bridge::{self, BridgeSpec};
use crate::error::{NetworkError, Result};
use crate::firewall::{IptablesNat, Nat};
use crate::netlink::{IpVersion, LinkOps, NetlinkHandle};
use crate::netns::{NetnsOps, NsEnter};
use crate::probe::{PingProber, Prober};
use crate::store::AllocStore;

/// Default name of the interface inside the namespace.
pub const DEFAULT_CONTAINER_INTERFACE: &str = "eth0";
/// Default prefix for host-side veth names.
pub const DEFAULT_PORT_PREFIX: &str = "netnsv0";

/// Options for holding networks state.
#[derive(Debug, Clone, Default)]
pub struct Opt {
    pub state_dir: String,
    pub container_interface: String,
    pub port_prefix: String,
    pub bridge_name: String,
}

/// The hook payload the runtime writes to stdin. Only the pid matters
/// here; the rest of the OCI state is carried along for logging.
#[derive(Debug, Clone, Deserialize)]
pub struct HookState {
    pub pid: i32,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub bundle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Running,
    Destroyed,
    DoesNotExist,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointStatus::Running => write!(f, "running"),
            EndpointStatus::Destroyed => write!(f, "destroyed"),
            EndpointStatus::DoesNotExist => write!(f, "does not exist"),
        }
    }
}

/// A recorded attachment of a process to the bridge.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub pid: i32,
    pub host_veth: String,
    pub status: EndpointStatus,
}

/// The object used for interacting with endpoints. Carries the options,
/// the state directory and the four kernel-facing capabilities; no
/// process-wide state.
pub struct Client {
    opt: Opt,
    state_dir: PathBuf,
    links: Arc<dyn LinkOps>,
    netns: Arc<dyn NetnsOps>,
    nat: Arc<dyn Nat>,
    prober: Arc<dyn Prober>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("opt", &self.opt)
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a new Client backed by the real kernel interfaces.
    pub fn new(opt: Opt) -> Result<Self> {
        let links = Arc::new(NetlinkHandle::new()?);
        Self::with_capabilities(
            opt,
            links,
            Arc::new(NsEnter),
            Arc::new(IptablesNat),
            Arc::new(PingProber),
        )
    }

    /// Create a Client with custom capability implementations.
    pub fn with_capabilities(
        mut opt: Opt,
        links: Arc<dyn LinkOps>,
        netns: Arc<dyn NetnsOps>,
        nat: Arc<dyn Nat>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        if opt.bridge_name.is_empty() {
            return Err(NetworkError::BridgeNameEmpty);
        }
        if opt.state_dir.is_empty() {
            return Err(NetworkError::StateDirPathEmpty);
        }

        if opt.container_interface.is_empty() {
            opt.container_interface = DEFAULT_CONTAINER_INTERFACE.to_string();
        }
        if opt.port_prefix.is_empty() {
            opt.port_prefix = DEFAULT_PORT_PREFIX.to_string();
        }

        // Create the state directory in case it does not exist.
        std::fs::create_dir_all(&opt.state_dir)?;

        let state_dir = PathBuf::from(&opt.state_dir);
        Ok(Self {
            opt,
            state_dir,
            links,
            netns,
            nat,
            prober,
        })
    }

    pub fn opt(&self) -> &Opt {
        &self.opt
    }

    /// Provision a bridged endpoint for the process in the hook state and
    /// return the address assigned to it.
    ///
    /// On success the target namespace holds one interface named per
    /// `Opt.container_interface` carrying the returned address, with a
    /// default route through the bridge gateway; the host side of the
    /// pair is enslaved to the bridge and up; the allocation is recorded
    /// durably. Failures after veth creation leave partial state behind;
    /// cleanup is the operator's call.
    pub async fn create(
        &self,
        hook: &HookState,
        bridge_spec: &BridgeSpec,
        static_ip: Option<&str>,
    ) -> Result<Ipv4Addr> {
        let pid = hook.pid;

        // Open the database and make sure the allocator bucket exists.
        let store = AllocStore::open(&self.state_dir).await?;
        store.ensure_bucket().await?;

        // Initialize the bridge.
        let bridge = bridge::init(self.links.as_ref(), self.nat.as_ref(), bridge_spec).await?;

        // Create the pair and attach the local side to the bridge.
        let host_name = format!("{}-{}", self.opt.port_prefix, pid);
        let peer_name = format!("ethc{}", pid);
        let (host_index, peer_index) = self.links.create_veth(&host_name, &peer_name).await?;
        self.links.set_master(host_index, bridge.index).await?;

        // Put the peer interface into the network namespace of the pid.
        self.links.move_to_netns(peer_index, pid).await?;

        // Bring the local side up.
        self.links.set_up(host_index).await?;

        // Read the bridge network back; it may differ from the spec when
        // the bridge predates this invocation.
        let bridge_addrs = self.links.ipv4_addresses(bridge.index).await?;
        let (gateway, prefix_len) = *bridge_addrs
            .first()
            .ok_or_else(|| NetworkError::AssignmentMissing(bridge.name.clone()))?;
        if bridge_addrs.len() > 1 {
            tracing::debug!(
                "bridge {} has more than 1 IPv4 address, using: {}",
                bridge.name,
                gateway
            );
        }
        let subnet = Ipv4Net::new(gateway, prefix_len).map_err(|e| {
            NetworkError::BadOption(format!(
                "bridge {} reports invalid prefix /{}: {}",
                bridge.name, prefix_len, e
            ))
        })?;

        let ip = match static_ip.filter(|s| !s.is_empty()) {
            Some(raw) => {
                let ip: Ipv4Addr = raw.parse().map_err(|e| {
                    NetworkError::BadOption(format!("parsing static ip {} failed: {}", raw, e))
                })?;
                // Static assignments are recorded but never advance the
                // allocator cursor.
                store.put_allocation(ip, pid).await?;
                ip
            }
            None => {
                let gateway_addrs: Vec<Ipv4Addr> =
                    bridge_addrs.iter().map(|(a, _)| *a).collect();
                let neighbors = self.links.neighbors(bridge.index, IpVersion::V4).await?;
                allocator::allocate(
                    &store,
                    &Segment {
                        subnet,
                        bridge_addrs: &gateway_addrs,
                        neighbors: &neighbors,
                    },
                    self.prober.as_ref(),
                    pid,
                )
                .await?
            }
        };

        // Configure the interface in the network namespace.
        self.netns
            .configure_interface(
                pid,
                &peer_name,
                &self.opt.container_interface,
                ip,
                prefix_len,
                gateway,
            )
            .await?;

        tracing::debug!("attached veth {} to bridge {}", host_name, bridge.name);
        Ok(ip)
    }

    /// All recorded endpoints, correlated with what is still alive.
    pub async fn list(&self) -> Result<Vec<Endpoint>> {
        let store = AllocStore::open_read_only(&self.state_dir).await?;

        let mut endpoints = Vec::new();
        for (ip, pid) in store.allocations().await? {
            let mut status = if process_exists(pid) {
                EndpointStatus::Running
            } else {
                EndpointStatus::DoesNotExist
            };

            // A pid can outlive its namespace (and vice versa): losing the
            // namespace demotes the endpoint regardless of the process.
            if !self.netns.netns_exists(pid) {
                status = EndpointStatus::Destroyed;
            }

            endpoints.push(Endpoint {
                ip,
                pid,
                host_veth: format!("{}-{}", self.opt.port_prefix, pid),
                status,
            });
        }

        Ok(endpoints)
    }

    /// Remove the bridge. Allocation records are kept so `list` can
    /// surface orphans; rotate the state directory to reset them.
    pub async fn destroy(&self) -> Result<()> {
        bridge::delete(self.links.as_ref(), &self.opt.bridge_name).await
    }
}

fn process_exists(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
