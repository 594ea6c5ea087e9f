// SPDX-License-Identifier: GPL-2.0-only
use crate::config::NetworkConfig;
use crate::id::Id;
use crate::model::Vm;
use crate::store::traits::{StateStore, StoreError};
use ipnetwork::Ipv4Network;
use serde_json::{json, Value};
use std::process::Command;
use std::sync::Arc;

/// nftables table owned by keel.
pub const NFT_TABLE: &str = "keel";

/// Every VM tap device starts with this prefix.
pub const TAP_PREFIX: &str = "k";

/// Errors from network service operations.
#[derive(Debug)]
pub enum NetworkError {
    Store(StoreError),
    Tap(String),
    Nftables(String),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Store(e) => write!(f, "store error: {e}"),
            NetworkError::Tap(e) => write!(f, "tap device error: {e}"),
            NetworkError::Nftables(e) => write!(f, "nftables error: {e}"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<StoreError> for NetworkError {
    fn from(e: StoreError) -> Self {
        NetworkError::Store(e)
    }
}

/// Tap device name for a VM. `k` + 13 base32 chars fits IFNAMSIZ.
pub fn tap_name(vm_id: Id) -> String {
    format!("{TAP_PREFIX}{}", vm_id.encode())
}

/// Host side of VM networking: one routed tap per VM, NAT for the node range.
///
/// Each VM gets a point-to-point tap carrying its subnet's gateway
/// address, so VMs never share a broadcast domain.
pub struct NetworkService {
    store: Arc<dyn StateStore + Send + Sync>,
    config: NetworkConfig,
    node_range: Ipv4Network,
}

impl NetworkService {
    pub fn new(
        store: Arc<dyn StateStore + Send + Sync>,
        config: NetworkConfig,
        node_range: Ipv4Network,
    ) -> Self {
        NetworkService {
            store,
            config,
            node_range,
        }
    }

    /// Create the VM's tap and assign it the gateway address.
    /// Requires CAP_NET_ADMIN.
    pub fn create_tap(&self, vm: &Vm) -> Result<String, NetworkError> {
        let tap = tap_name(vm.id);
        let subnet: Ipv4Network = vm
            .subnet
            .parse()
            .map_err(|e| NetworkError::Tap(format!("invalid subnet {}: {e}", vm.subnet)))?;

        run_ip(&["tuntap", "add", "dev", &tap, "mode", "tap"], "ip tuntap add")?;

        let addr = format!("{}/{}", vm.gateway_ip, subnet.prefix());
        if let Err(e) = run_ip(&["addr", "add", &addr, "dev", &tap], "ip addr add") {
            // Do not leave a half-configured device behind
            self.destroy_tap(&tap);
            return Err(e);
        }
        if let Err(e) = run_ip(&["link", "set", &tap, "up"], "ip link set up") {
            self.destroy_tap(&tap);
            return Err(e);
        }

        Ok(tap)
    }

    /// Delete a tap device. Missing devices are fine.
    /// Requires CAP_NET_ADMIN.
    pub fn destroy_tap(&self, tap: &str) {
        let delete = Command::new("ip").args(["link", "delete", tap]).output();

        match delete {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("Cannot find device") {
                    tracing::warn!(tap, "ip link delete failed: {}", stderr.trim());
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(tap, error = %e, "cannot run ip link delete"),
        }
    }

    /// Destroy the tap and soft-delete the VM row, releasing its subnet.
    pub fn release(&self, vm_id: Id, tap: Option<&str>) -> Result<(), NetworkError> {
        let name = tap.map(str::to_string).unwrap_or_else(|| tap_name(vm_id));
        self.destroy_tap(&name);
        self.store.release_vm(vm_id)?;
        Ok(())
    }

    /// Install (or reinstall) the NAT and isolation rules for the node range.
    /// Requires CAP_NET_ADMIN.
    pub fn ensure_nat(&self) -> Result<(), NetworkError> {
        let ruleset = self.nat_ruleset();
        let json_str = serde_json::to_string(&ruleset)
            .map_err(|e| NetworkError::Nftables(format!("failed to serialize ruleset: {e}")))?;

        let mut file = tempfile::Builder::new()
            .prefix("keel-nftables-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| NetworkError::Nftables(format!("failed to create temp file: {e}")))?;
        std::io::Write::write_all(&mut file, json_str.as_bytes())
            .map_err(|e| NetworkError::Nftables(format!("failed to write temp file: {e}")))?;

        let apply = Command::new("nft")
            .arg("-j")
            .arg("-f")
            .arg(file.path())
            .output()
            .map_err(|e| NetworkError::Nftables(format!("failed to run nft: {e}")))?;

        if !apply.status.success() {
            let stderr = String::from_utf8_lossy(&apply.stderr);
            return Err(NetworkError::Nftables(format!("nft -j -f failed: {stderr}")));
        }

        tracing::info!(range = %self.node_range, table = NFT_TABLE, "nftables rules installed");
        Ok(())
    }

    /// The `keel` table: masquerade the node range on egress, allow VM to
    /// outside and return traffic, drop VM to VM forwarding.
    ///
    /// The table is flushed first so applying it twice is harmless.
    pub fn nat_ruleset(&self) -> Value {
        let range = format!("{}/{}", self.node_range.network(), self.node_range.prefix());
        let taps = format!("{TAP_PREFIX}*");

        let egress_match = if self.config.egress_interface.is_empty() {
            json!({"match": {"op": "!=", "left": {"meta": {"key": "oifname"}}, "right": taps}})
        } else {
            json!({"match": {"op": "==", "left": {"meta": {"key": "oifname"}}, "right": self.config.egress_interface}})
        };

        let table = json!({"family": "inet", "name": NFT_TABLE});
        let rule = |chain: &str, expr: Value| {
            json!({"add": {"rule": {"family": "inet", "table": NFT_TABLE, "chain": chain, "expr": expr}}})
        };

        json!({
            "nftables": [
                {"add": {"table": table}},
                {"flush": {"table": table}},
                {
                    "add": {
                        "chain": {
                            "family": "inet",
                            "table": NFT_TABLE,
                            "name": "postrouting",
                            "type": "nat",
                            "hook": "postrouting",
                            "prio": 100,
                            "policy": "accept"
                        }
                    }
                },
                {
                    "add": {
                        "chain": {
                            "family": "inet",
                            "table": NFT_TABLE,
                            "name": "forward",
                            "type": "filter",
                            "hook": "forward",
                            "prio": 0,
                            "policy": "drop"
                        }
                    }
                },
                rule("postrouting", json!([
                    {"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "saddr"}}, "right": range}},
                    egress_match,
                    {"masquerade": null}
                ])),
                rule("forward", json!([
                    {"match": {"op": "in", "left": {"ct": {"key": "state"}}, "right": ["established", "related"]}},
                    {"accept": null}
                ])),
                rule("forward", json!([
                    {"match": {"op": "==", "left": {"meta": {"key": "iifname"}}, "right": taps}},
                    {"match": {"op": "==", "left": {"meta": {"key": "oifname"}}, "right": taps}},
                    {"drop": null}
                ])),
                rule("forward", json!([
                    {"match": {"op": "==", "left": {"meta": {"key": "iifname"}}, "right": taps}},
                    {"accept": null}
                ]))
            ]
        })
    }

    /// Check that nft is installed and new enough for JSON input (>= 0.9.3).
    pub fn check_nftables_version() -> Result<(), NetworkError> {
        let output = Command::new("nft")
            .arg("--version")
            .output()
            .map_err(|e| NetworkError::Nftables(format!("nft not found: {e}")))?;

        if !output.status.success() {
            return Err(NetworkError::Nftables("nft --version failed".to_string()));
        }

        // "nftables v1.1.1 (Old Doc Yak)"
        let version_str = String::from_utf8_lossy(&output.stdout);
        if let Some(version) = version_str.split_whitespace().nth(1) {
            let version = version.trim_start_matches('v');
            tracing::info!("nftables version: {}", version);
            if !version_at_least(version, (0, 9, 3)) {
                return Err(NetworkError::Nftables(format!(
                    "nftables version {version} is too old (need >= 0.9.3)"
                )));
            }
        }

        Ok(())
    }
}

fn run_ip(args: &[&str], what: &str) -> Result<(), NetworkError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| NetworkError::Tap(format!("failed to run {what}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Tap(format!("{what} failed: {}", stderr.trim())));
    }
    Ok(())
}

fn version_at_least(version: &str, min: (u32, u32, u32)) -> bool {
    let mut parts = version
        .split('.')
        .map(|p| p.trim_matches(|c: char| !c.is_ascii_digit()).parse::<u32>().unwrap_or(0));
    let found = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    found >= min
}
