// ICMP liveness probing for allocator candidates.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

/// Deadline for a single echo probe. Candidates that stay silent this
/// long are considered free.
pub const DEFAULT_PROBE_DEADLINE: Duration = Duration::from_millis(150);

/// Capability: answer "does this address currently respond on the wire?".
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send one ICMP echo to `ip` and report whether a reply arrived
    /// within `deadline`. A probe that cannot even be sent must report
    /// `false` so allocation is not blocked.
    async fn probe(&self, ip: Ipv4Addr, deadline: Duration) -> bool;
}

/// Production prober driving the system `ping` binary. One echo request,
/// hard-bounded by the deadline; the child is killed on timeout.
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, ip: Ipv4Addr, deadline: Duration) -> bool {
        let mut child = match tokio::process::Command::new("ping")
            .args(["-c", "1", "-n", "-q"])
            .arg(ip.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::debug!("[ipallocator] probing {} failed to start: {}", ip, err);
                return false;
            }
        };

        match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(err)) => {
                tracing::debug!("[ipallocator] probing {} failed: {}", ip, err);
                false
            }
            Err(_) => {
                // No reply within the deadline.
                let _ = child.kill().await;
                false
            }
        }
    }
}
