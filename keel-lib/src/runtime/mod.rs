// SPDX-License-Identifier: GPL-2.0-only
//! Micro-VM runtime driver.
//!
//! [`VmRuntime`] is the seam between the node agent and a hypervisor.
//! Firecracker is the shipped implementation; tests use a fake.

pub mod firecracker;
pub mod metadata;
pub mod network;

pub use firecracker::FirecrackerRuntime;
pub use network::{NetworkError, NetworkService};

use crate::config::Config;
use crate::id::Id;
use crate::model::{Image, Vm};
use crate::store::traits::{StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    Firecracker,
    CloudHypervisor,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Firecracker => write!(f, "firecracker"),
            RuntimeKind::CloudHypervisor => write!(f, "cloud-hypervisor"),
        }
    }
}

/// Everything needed to boot one VM. The VM row already holds the
/// reserved subnet and addresses.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub vm: Vm,
    pub image: Image,
    pub app_id: Id,
}

/// A running (or once-running) VM as the runtime knows it. Persisted
/// next to the hypervisor process so it survives a daemon restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub vm_id: Id,
    pub instance_id: Id,
    pub pid: Option<u32>,
    pub tap_device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatusReport {
    pub vm_id: Id,
    pub pid: Option<u32>,
    pub alive: bool,
}

#[derive(Debug)]
pub enum RuntimeError {
    /// The configured runtime kind has no driver.
    Unsupported(RuntimeKind),
    Network(NetworkError),
    Store(StoreError),
    /// The hypervisor could not be configured or started.
    Spawn(String),
    /// The VM never became healthy and was torn down.
    Unhealthy(String),
    /// The hypervisor process survived SIGKILL.
    Stop(String),
    Io(std::io::Error),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Unsupported(kind) => write!(f, "runtime {kind} is not supported"),
            RuntimeError::Network(e) => write!(f, "{e}"),
            RuntimeError::Store(e) => write!(f, "{e}"),
            RuntimeError::Spawn(e) => write!(f, "cannot start vm: {e}"),
            RuntimeError::Unhealthy(e) => write!(f, "vm unhealthy: {e}"),
            RuntimeError::Stop(e) => write!(f, "cannot stop vm: {e}"),
            RuntimeError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<NetworkError> for RuntimeError {
    fn from(e: NetworkError) -> Self {
        RuntimeError::Network(e)
    }
}

impl From<StoreError> for RuntimeError {
    fn from(e: StoreError) -> Self {
        RuntimeError::Store(e)
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e)
    }
}

#[async_trait::async_trait]
pub trait VmRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Boot a VM and wait until it is healthy. On error nothing is left
    /// running and the VM's network resources are released.
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, RuntimeError>;

    /// Stop a VM, gracefully first. Network resources and the subnet
    /// reservation are released even when stopping fails.
    async fn stop(&self, handle: &VmHandle) -> Result<(), RuntimeError>;

    /// VMs whose hypervisor process is alive.
    async fn list(&self) -> Result<Vec<VmHandle>, RuntimeError>;

    async fn status(&self, vm_id: Id) -> Result<Option<VmStatusReport>, RuntimeError>;
}

/// Build the runtime selected by `runtime.kind`.
pub fn build_runtime(
    config: &Config,
    store: Arc<dyn StateStore + Send + Sync>,
) -> Result<Arc<dyn VmRuntime>, RuntimeError> {
    match config.runtime.kind {
        RuntimeKind::Firecracker => {
            let runtime = FirecrackerRuntime::new(config, store)?;
            // Host networking is set up once, before any VM exists
            NetworkService::check_nftables_version()?;
            runtime.network().ensure_nat()?;
            Ok(Arc::new(runtime))
        }
        kind => Err(RuntimeError::Unsupported(kind)),
    }
}
