// NAT-out management for the bridge subnet.

use async_trait::async_trait;

use crate::error::{NetworkError, Result};

/// Capability: manage the masquerade rule for outbound traffic.
#[async_trait]
pub trait Nat: Send + Sync {
    /// Make sure `-t nat POSTROUTING -s <source_cidr> -j MASQUERADE`
    /// exists, inserting it only when the check query misses.
    async fn ensure_masquerade(&self, source_cidr: &str) -> Result<()>;
}

/// Production implementation shelling out to iptables.
pub struct IptablesNat;

impl IptablesNat {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        tokio::process::Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(NetworkError::Io)
    }
}

#[async_trait]
impl Nat for IptablesNat {
    async fn ensure_masquerade(&self, source_cidr: &str) -> Result<()> {
        let rule = ["POSTROUTING", "-t", "nat", "-s", source_cidr, "-j", "MASQUERADE"];

        // -C exits zero when the rule is already present.
        let mut check = vec!["-C"];
        check.extend_from_slice(&rule);
        if let Ok(output) = self.run(&check).await {
            if output.status.success() {
                tracing::debug!("masquerade rule for {} already present", source_cidr);
                return Ok(());
            }
        }

        let mut insert = vec!["-I"];
        insert.extend_from_slice(&rule);
        let output = self.run(&insert).await?;
        if !output.status.success() {
            return Err(NetworkError::Firewall {
                cmd: format!("iptables {}", insert.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        tracing::debug!("masquerade rule installed for {}", source_cidr);
        Ok(())
    }
}
