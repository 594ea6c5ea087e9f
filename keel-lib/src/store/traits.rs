// SPDX-License-Identifier: GPL-2.0-only
use crate::id::Id;
use crate::model::{
    App, Build, BuildStatus, ChangeRecord, CreateAppParams, CreateBuildParams,
    CreateDeploymentParams, CreateImageParams, Deployment, DeploymentStatus, EntityKind, Image,
    Instance, InstanceStatus, NewVm, RegisterServerParams, Route, Server, ServerStatus, Vm,
    VmStatus,
};
use std::collections::HashMap;

/// Information about the database for status reporting.
#[derive(Debug, Clone)]
pub struct DbStatus {
    /// Path to the database file (or connection string for non-file backends)
    pub path: String,
    /// Number of user tables in the database
    pub table_count: usize,
    /// Size of the database file in bytes (None if not applicable)
    pub size_bytes: Option<u64>,
}

/// Errors from the state store.
#[derive(Debug)]
pub enum StoreError {
    /// Database connection or initialization failed
    Init(String),
    /// Query execution failed
    Query(String),
    /// Schema migration required (version mismatch)
    SchemaMismatch { expected: u32, found: u32 },
    /// Uniqueness or precondition violated
    Conflict(String),
    /// A VM subnet would overlap another live VM on the same server
    Exclusion(String),
    /// Invalid input (e.g., malformed CIDR)
    InvalidInput(String),
    /// Referenced row does not exist
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Init(e) => write!(f, "store initialization failed: {e}"),
            StoreError::Query(e) => write!(f, "store query failed: {e}"),
            StoreError::SchemaMismatch { expected, found } => {
                write!(f, "schema version mismatch: expected {expected}, found {found}")
            }
            StoreError::Conflict(e) => write!(f, "conflict: {e}"),
            StoreError::Exclusion(e) => write!(f, "exclusion constraint: {e}"),
            StoreError::InvalidInput(e) => write!(f, "invalid input: {e}"),
            StoreError::NotFound(e) => write!(f, "not found: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Worth retrying as-is: the store was busy or unreachable.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Init(_) | StoreError::Query(_))
    }
}

pub trait ImageStore {
    fn create_image(&self, params: &CreateImageParams) -> Result<Image, StoreError>;

    /// Get an image by ID, including soft-deleted ones.
    fn get_image(&self, id: Id) -> Result<Option<Image>, StoreError>;
}

/// Builds are written by the external build producer; the core only
/// reads them, except in tests and tooling.
pub trait BuildStore {
    fn create_build(&self, params: &CreateBuildParams) -> Result<Build, StoreError>;

    fn get_build(&self, id: Id) -> Result<Option<Build>, StoreError>;

    /// Move a build to `status`, stamping the matching timestamp.
    /// `image_id` is recorded on success, `error` on failure.
    /// Returns false when the build was already in that state.
    fn set_build_status(
        &self,
        id: Id,
        status: BuildStatus,
        image_id: Option<Id>,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;
}

pub trait AppStore {
    fn create_app(&self, params: &CreateAppParams) -> Result<App, StoreError>;

    fn get_app(&self, id: Id) -> Result<Option<App>, StoreError>;
}

pub trait DeploymentStore {
    fn create_deployment(&self, params: &CreateDeploymentParams) -> Result<Deployment, StoreError>;

    /// Get a deployment by ID, including soft-deleted ones.
    fn get_deployment(&self, id: Id) -> Result<Option<Deployment>, StoreError>;

    /// Non-deleted deployments built from `build_id`.
    fn list_deployments_for_build(&self, build_id: Id) -> Result<Vec<Deployment>, StoreError>;

    /// Non-deleted deployments of an app, oldest first.
    fn list_deployments_for_app(&self, app_id: Id) -> Result<Vec<Deployment>, StoreError>;

    /// Returns false if status and error were already as requested.
    fn set_deployment_status(
        &self,
        id: Id,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Point a deployment at another build (a new revision).
    fn set_deployment_build(&self, id: Id, build_id: Id) -> Result<bool, StoreError>;

    fn set_deployment_replicas(&self, id: Id, replicas: u32) -> Result<bool, StoreError>;

    fn delete_deployment(&self, id: Id) -> Result<bool, StoreError>;
}

/// Instance persistence. Every status write is a compare-and-set: it
/// names the states it may leave and returns `None` when the row was
/// not in one of them, so stale or duplicate transitions are no-ops.
pub trait InstanceStore {
    fn create_instance(&self, deployment_id: Id, image_id: Id) -> Result<Instance, StoreError>;

    /// Get an instance by ID, including soft-deleted ones.
    fn get_instance(&self, id: Id) -> Result<Option<Instance>, StoreError>;

    /// Non-deleted instances of a deployment, oldest first.
    fn list_instances_for_deployment(&self, deployment_id: Id) -> Result<Vec<Instance>, StoreError>;

    /// Non-deleted instances bound to a server.
    fn list_instances_for_server(&self, server_id: Id) -> Result<Vec<Instance>, StoreError>;

    /// Non-deleted instances in `status`, oldest first.
    fn list_instances_with_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, StoreError>;

    /// Instances occupying each server (scheduled through stopping).
    fn count_instances_by_server(&self) -> Result<HashMap<Id, u32>, StoreError>;

    fn transition_instance(
        &self,
        id: Id,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<Instance>, StoreError>;

    /// pending → scheduled on `server_id`.
    fn schedule_instance(&self, id: Id, server_id: Id) -> Result<Option<Instance>, StoreError>;

    /// `from` → failed, recording the reason, `failed_at` and one more attempt.
    fn fail_instance(
        &self,
        id: Id,
        from: &[InstanceStatus],
        error: &str,
    ) -> Result<Option<Instance>, StoreError>;

    /// failed → pending, unbinding the server. The explicit retry path.
    fn retry_instance(&self, id: Id) -> Result<Option<Instance>, StoreError>;

    /// Record a reason without changing status. Returns false if unchanged.
    fn set_instance_error(&self, id: Id, error: &str) -> Result<bool, StoreError>;

    fn delete_instance(&self, id: Id) -> Result<bool, StoreError>;
}

pub trait ServerStore {
    /// Insert or update the live server named `params.name`, and heartbeat it.
    fn register_server(&self, params: &RegisterServerParams) -> Result<Server, StoreError>;

    fn get_server(&self, id: Id) -> Result<Option<Server>, StoreError>;

    /// Non-deleted servers.
    fn list_servers(&self) -> Result<Vec<Server>, StoreError>;

    /// Refresh `heartbeat_at`. Not a change event.
    fn heartbeat_server(&self, id: Id) -> Result<(), StoreError>;

    fn set_server_status(&self, id: Id, status: ServerStatus) -> Result<bool, StoreError>;
}

/// VM rows double as subnet reservations.
pub trait VmStore {
    /// Insert a VM, reserving its subnet. Fails with `Exclusion` if the
    /// subnet overlaps a live VM on the same server and with `Conflict`
    /// if the instance already owns a live VM.
    fn insert_vm(&self, vm: &NewVm) -> Result<Vm, StoreError>;

    /// Get a VM by ID, including soft-deleted ones.
    fn get_vm(&self, id: Id) -> Result<Option<Vm>, StoreError>;

    /// The instance's live VM, if any.
    fn get_vm_for_instance(&self, instance_id: Id) -> Result<Option<Vm>, StoreError>;

    /// Live VMs on a server.
    fn list_vms_for_server(&self, server_id: Id) -> Result<Vec<Vm>, StoreError>;

    fn set_vm_status(&self, id: Id, status: VmStatus) -> Result<bool, StoreError>;

    fn set_vm_runtime(&self, id: Id, tap_device: Option<&str>, pid: Option<u32>) -> Result<bool, StoreError>;

    /// Soft-delete the VM, releasing its subnet. Returns false if already released.
    fn release_vm(&self, id: Id) -> Result<bool, StoreError>;
}

pub trait RouteStore {
    /// Rows of the `routes` view, optionally limited to one server.
    fn list_routes(&self, server_id: Option<Id>) -> Result<Vec<Route>, StoreError>;
}

/// Change log and replication cursors backing the change feed.
pub trait ChangeStore {
    /// Up to `limit` records with `seq > after`, in commit order.
    fn changes_after(&self, after: i64, limit: u32) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Highest sequence number ever assigned (0 if none). Survives compaction.
    fn max_change_seq(&self) -> Result<i64, StoreError>;

    /// Durable cursor for a named consumer (0 if never set).
    fn feed_cursor(&self, name: &str) -> Result<i64, StoreError>;

    /// Advance a cursor. Never moves it backwards.
    fn set_feed_cursor(&self, name: &str, seq: i64) -> Result<(), StoreError>;

    /// Delete change records with `seq <= upto`.
    fn compact_changes(&self, upto: i64) -> Result<usize, StoreError>;

    /// IDs a full resync pass should look at for an entity type.
    fn list_live_ids(&self, kind: EntityKind) -> Result<Vec<Id>, StoreError>;
}

/// One-time metadata tokens. Only hashes are stored.
pub trait TokenStore {
    fn insert_metadata_token(&self, vm_id: Id, token_hash: &str) -> Result<(), StoreError>;

    /// Atomically mark the token used. Returns the VM it was minted for,
    /// or `None` if unknown, already redeemed, the VM is gone or
    /// `guest_ip` is not that VM's address. Only a redemption that
    /// returns the VM spends the token.
    fn redeem_metadata_token(
        &self,
        token_hash: &str,
        guest_ip: &str,
    ) -> Result<Option<Id>, StoreError>;

    /// Environment of the deployment the VM serves.
    fn vm_env(&self, vm_id: Id) -> Result<Option<Vec<String>>, StoreError>;
}

/// Convenience super-trait for code that needs the full store.
///
/// All state persistence goes through this trait. The shipped
/// implementation is SQLite; this trait exists so the backend can
/// be swapped to Postgres for multi-node clusters.
pub trait StateStore:
    ImageStore
    + BuildStore
    + AppStore
    + DeploymentStore
    + InstanceStore
    + ServerStore
    + VmStore
    + RouteStore
    + ChangeStore
    + TokenStore
{
    /// Initialize the store (create schema if needed, run migrations).
    fn init(&self) -> Result<(), StoreError>;

    /// Return database status information for health/status reporting.
    fn status(&self) -> Result<DbStatus, StoreError>;

    /// Close the store and release resources.
    fn close(&self) -> Result<(), StoreError>;
}
