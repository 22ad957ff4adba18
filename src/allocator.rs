// Persistent round-robin IPv4 allocator.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::addr;
use crate::error::{NetworkError, Result};
use crate::probe::{Prober, DEFAULT_PROBE_DEADLINE};
use crate::store::AllocStore;

/// Everything the allocator consults besides the store: the bridge
/// subnet, the addresses sitting on the bridge itself, and the kernel's
/// current neighbor view of the segment.
pub struct Segment<'a> {
    pub subnet: Ipv4Net,
    pub bridge_addrs: &'a [Ipv4Addr],
    pub neighbors: &'a HashSet<String>,
}

/// Return an unused IP for a specific process ID and save it in the
/// database.
///
/// Candidates advance from the persisted cursor, wrapping at the subnet
/// boundary, so repeated invocations walk the subnet round-robin instead
/// of reusing the lowest address. Acceptance writes the allocation and
/// the new cursor in one transaction.
pub async fn allocate(
    store: &AllocStore,
    segment: &Segment<'_>,
    prober: &dyn Prober,
    pid: i32,
) -> Result<Ipv4Addr> {
    let cursor = match store.cursor().await? {
        Some(ip) => ip,
        None => segment.subnet.network(),
    };

    let first = addr::next(cursor);
    let mut candidate = first;

    loop {
        if !segment.subnet.contains(&candidate) {
            // Rewind; the advance below moves to the first host slot.
            candidate = segment.subnet.network();
        } else if segment.bridge_addrs.contains(&candidate) {
            tracing::debug!("[ipallocator] ip {} belongs to the bridge, skipped", candidate);
        } else if !addr::is_unicast(candidate, segment.subnet.prefix_len()) {
            tracing::debug!("[ipallocator] ip {} is not unicast, skipped", candidate);
        } else if segment.neighbors.contains(&candidate.to_string()) {
            tracing::debug!("[ipallocator] ip {} is a known neighbor, skipped", candidate);
        } else if prober.probe(candidate, DEFAULT_PROBE_DEADLINE).await {
            tracing::debug!("[ipallocator] ip {} is already in use, skipped", candidate);
        } else {
            store.commit_allocation(candidate, pid).await?;
            tracing::debug!("[ipallocator] ip {} is selected", candidate);
            return Ok(candidate);
        }

        candidate = addr::next(candidate);

        if candidate == first {
            return Err(NetworkError::Exhausted(segment.subnet.trunc().to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StaticProber;

    fn segment(
        cidr: &str,
        bridge: &[&str],
        neighbors: &[&str],
    ) -> (Ipv4Net, Vec<Ipv4Addr>, HashSet<String>) {
        let subnet: Ipv4Net = cidr.parse().unwrap();
        let bridge = bridge.iter().map(|s| s.parse().unwrap()).collect();
        let neighbors = neighbors.iter().map(|s| s.to_string()).collect();
        (subnet, bridge, neighbors)
    }

    async fn run(
        store: &AllocStore,
        cidr: &str,
        bridge: &[&str],
        neighbors: &[&str],
        responsive: &[&str],
        pid: i32,
    ) -> Result<Ipv4Addr> {
        let (subnet, bridge_addrs, neighbors) = segment(cidr, bridge, neighbors);
        let prober = StaticProber::responding_to(responsive);
        allocate(
            store,
            &Segment {
                subnet,
                bridge_addrs: &bridge_addrs,
                neighbors: &neighbors,
            },
            &prober,
            pid,
        )
        .await
    }

    async fn fresh_store(dir: &std::path::Path) -> AllocStore {
        let store = AllocStore::open(dir).await.unwrap();
        store.ensure_bucket().await.unwrap();
        store
    }

    #[tokio::test]
    async fn first_allocation_skips_the_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let ip = run(&store, "172.19.0.1/16", &["172.19.0.1"], &[], &[], 1234)
            .await
            .unwrap();
        assert_eq!(ip, "172.19.0.2".parse::<Ipv4Addr>().unwrap());

        // Both the allocation and the cursor landed in the store.
        let entries = store.allocations().await.unwrap();
        assert_eq!(
            entries,
            vec![(std::net::IpAddr::V4("172.19.0.2".parse().unwrap()), 1234)]
        );
        assert_eq!(
            store.cursor().await.unwrap(),
            Some("172.19.0.2".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn consecutive_allocations_advance_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let first = run(&store, "172.19.0.1/16", &["172.19.0.1"], &[], &[], 1234)
            .await
            .unwrap();
        let second = run(&store, "172.19.0.1/16", &["172.19.0.1"], &[], &[], 1235)
            .await
            .unwrap();

        assert_eq!(first, "172.19.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(second, "172.19.0.3".parse::<Ipv4Addr>().unwrap());
        assert_eq!(second, crate::addr::next(first));
    }

    #[tokio::test]
    async fn wraps_past_broadcast_and_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        // Park the cursor just below the directed broadcast.
        store
            .commit_allocation("172.19.255.254".parse().unwrap(), 1)
            .await
            .unwrap();

        let ip = run(&store, "172.19.0.1/16", &["172.19.0.1"], &[], &[], 9)
            .await
            .unwrap();
        assert_eq!(ip, "172.19.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn neighbors_and_probe_hits_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        let ip = run(
            &store,
            "172.19.0.1/16",
            &["172.19.0.1"],
            &["172.19.0.2"],
            &["172.19.0.3"],
            77,
        )
        .await
        .unwrap();
        assert_eq!(ip, "172.19.0.4".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn exhausted_when_every_host_slot_is_taken() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(dir.path()).await;

        // /30 leaves two host slots: the gateway and one neighbor.
        let err = run(
            &store,
            "10.0.0.1/30",
            &["10.0.0.1"],
            &["10.0.0.2"],
            &[],
            5,
        )
        .await
        .unwrap_err();

        match err {
            NetworkError::Exhausted(net) => assert_eq!(net, "10.0.0.0/30"),
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }
}
