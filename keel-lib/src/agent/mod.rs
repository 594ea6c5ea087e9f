// SPDX-License-Identifier: GPL-2.0-only
//! Node agent: keeps this node's micro-VMs in line with the instances
//! the store binds to it.
//!
//! Each pass rebuilds [`DesiredState`] from the store, lists live VMs
//! from the runtime, and applies the [`plan`] between them. Bus events
//! only make the next pass come sooner.

pub mod allocator;
pub mod plan;
pub mod routes;

pub use allocator::{AllocError, SubnetAllocator, VmRequest};
pub use plan::{plan, Action, DesiredInstance, DesiredState};
pub use routes::{RoutePublisher, RouteTable, RouteTarget};

use crate::bus::Bus;
use crate::config::{AgentConfig, Config, NodeConfig};
use crate::id::Id;
use crate::model::{InstanceStatus, RegisterServerParams, Server, VmStatus};
use crate::orchestrator::Backoff;
use crate::runtime::{RuntimeError, VmHandle, VmRuntime, VmSpec};
use crate::store::traits::{StateStore, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Subjects that may change what this node should run.
pub const SUBJECTS: &[&str] = &["instance.*", "node.*", "vm.*"];

pub const NO_FREE_SUBNET: &str = "no free subnet";
pub const VM_LOST: &str = "vm exited unexpectedly";

#[derive(Debug)]
pub enum AgentError {
    Store(StoreError),
    Runtime(RuntimeError),
    Config(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Store(e) => write!(f, "{e}"),
            AgentError::Runtime(e) => write!(f, "{e}"),
            AgentError::Config(e) => write!(f, "invalid agent config: {e}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        AgentError::Store(e)
    }
}

impl From<RuntimeError> for AgentError {
    fn from(e: RuntimeError) -> Self {
        AgentError::Runtime(e)
    }
}

/// Per-instance async mutexes. Everything that creates, adopts or tears
/// down the VM of one instance holds its lock.
#[derive(Default)]
pub struct VmLocks {
    locks: Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>,
}

impl VmLocks {
    pub async fn lock(&self, id: Id) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Forget locks nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Local retry state for failed teardowns.
struct TeardownRetry {
    backoff: Backoff,
    alert_after: u32,
    failures: Mutex<HashMap<Id, (u32, Instant)>>,
}

impl TeardownRetry {
    fn is_due(&self, vm_id: Id, now: Instant) -> bool {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get(&vm_id).map_or(true, |(_, next)| *next <= now)
    }

    fn record_failure(&self, vm_id: Id, now: Instant) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let entry = failures.entry(vm_id).or_insert((0, now));
        entry.0 = entry.0.saturating_add(1);
        entry.1 = now + self.backoff.delay(entry.0);
        entry.0
    }

    fn clear(&self, vm_id: Id) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&vm_id);
    }
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub planned: usize,
    pub created: usize,
    pub adopted: usize,
    pub stopped: usize,
    pub released: usize,
    pub finished: usize,
    /// Teardowns skipped while backing off.
    pub deferred: usize,
    pub errors: usize,
}

impl PassReport {
    pub fn is_converged(&self) -> bool {
        self.planned == 0
    }
}

pub struct NodeAgent<S: ?Sized> {
    store: Arc<S>,
    runtime: Arc<dyn VmRuntime>,
    bus: Arc<dyn Bus>,
    server: Server,
    node: NodeConfig,
    config: AgentConfig,
    allocator: SubnetAllocator,
    locks: VmLocks,
    teardown: TeardownRetry,
    routes: RoutePublisher,
}

impl<S: StateStore + Send + Sync + ?Sized> NodeAgent<S> {
    /// Register (or update) this node's server row and build the agent.
    pub fn register(
        store: Arc<S>,
        runtime: Arc<dyn VmRuntime>,
        bus: Arc<dyn Bus>,
        config: &Config,
    ) -> Result<Self, AgentError> {
        let node = config.node.clone();
        let range = node
            .ip_range
            .parse()
            .map_err(|e| AgentError::Config(format!("node.ip_range {}: {e}", node.ip_range)))?;
        let allocator =
            SubnetAllocator::new(range, node.vm_prefix_len).map_err(AgentError::Config)?;

        let server = store.register_server(&RegisterServerParams {
            name: node.name.clone(),
            ip_range: node.ip_range.clone(),
            max_instances: node.max_instances,
        })?;
        info!(server_id = %server.id, name = %server.name, range = %server.ip_range, "node registered");

        let routes_file = if config.agent.routes_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.agent.routes_file))
        };

        Ok(NodeAgent {
            store,
            runtime,
            bus,
            server,
            node,
            allocator,
            locks: VmLocks::default(),
            teardown: TeardownRetry {
                backoff: Backoff {
                    base: config.orchestrator.backoff_base(),
                    cap: config.orchestrator.backoff_cap(),
                },
                alert_after: config.agent.teardown_alert_attempts,
                failures: Mutex::new(HashMap::new()),
            },
            routes: RoutePublisher::new(routes_file),
            config: config.agent.clone(),
        })
    }

    pub fn server_id(&self) -> Id {
        self.server.id
    }

    /// Route table snapshots, updated after every pass.
    pub fn routes(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.routes.subscribe()
    }

    /// One full pass: desired from the store, actual from the runtime.
    pub async fn reconcile(&self) -> Result<PassReport, AgentError> {
        let desired = DesiredState::load(&*self.store, self.server.id)?;
        let actual = self.runtime.list().await?;
        let actions = plan(&desired, &actual);

        let mut report = PassReport {
            planned: actions.len(),
            ..PassReport::default()
        };
        if !actions.is_empty() {
            debug!(actions = actions.len(), "applying plan");
        }

        let results = futures_util::future::join_all(
            actions.iter().map(|action| self.apply(action, &desired)),
        )
        .await;
        for (action, result) in actions.iter().zip(results) {
            match result {
                Ok(Applied::Done) => match action {
                    Action::Create { .. } => report.created += 1,
                    Action::Adopt { .. } => report.adopted += 1,
                    Action::Stop { .. } => report.stopped += 1,
                    Action::Release { .. } => report.released += 1,
                    Action::Finish { .. } => report.finished += 1,
                },
                Ok(Applied::Skipped) => {}
                Ok(Applied::Deferred) => report.deferred += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        instance_id = %action.instance_id(), operation = action_name(action),
                        error = %e, "reconcile action failed"
                    );
                }
            }
        }

        if let Err(e) = self.refresh_routes() {
            report.errors += 1;
            warn!(error = %e, "route table refresh failed");
        }
        Ok(report)
    }

    async fn apply(&self, action: &Action, desired: &DesiredState) -> Result<Applied, AgentError> {
        let _guard = self.locks.lock(action.instance_id()).await;
        match action {
            Action::Create { instance_id } => match desired.instances.get(instance_id) {
                Some(d) => self.create(d).await,
                None => Ok(Applied::Skipped),
            },
            Action::Adopt { instance_id, vm_id } => self.adopt(*instance_id, *vm_id).await,
            Action::Stop { handle } => self.teardown(handle).await,
            Action::Release { handle, lost } => self.release(handle, *lost).await,
            Action::Finish { instance_id } => {
                let done = self.store.transition_instance(
                    *instance_id,
                    &[InstanceStatus::Stopping],
                    InstanceStatus::Stopped,
                )?;
                Ok(if done.is_some() { Applied::Done } else { Applied::Skipped })
            }
        }
    }

    async fn create(&self, desired: &DesiredInstance) -> Result<Applied, AgentError> {
        let instance_id = desired.instance.id;
        // Re-check under the lock: an earlier holder may have done the work
        let Some(instance) = self.store.get_instance(instance_id)? else {
            return Ok(Applied::Skipped);
        };
        if !instance.status.wants_vm()
            || instance.server_id != Some(self.server.id)
            || instance.deleted_at.is_some()
            || self.store.get_vm_for_instance(instance_id)?.is_some()
        {
            return Ok(Applied::Skipped);
        }

        let deployment = &desired.deployment;
        let request = VmRequest {
            instance_id,
            server_id: self.server.id,
            image_id: instance.image_id,
            vcpus: deployment.vcpus,
            memory_mib: deployment.memory_mib,
            port: deployment.port,
        };
        let vm = match self.allocator.reserve(&*self.store, &request) {
            Ok(vm) => vm,
            Err(AllocError::Exhausted) => {
                warn!(instance_id = %instance_id, range = %self.allocator.range(), "no free subnet");
                self.store.fail_instance(
                    instance_id,
                    &[InstanceStatus::Scheduled, InstanceStatus::Starting],
                    NO_FREE_SUBNET,
                )?;
                return Ok(Applied::Done);
            }
            Err(AllocError::Store(e)) => return Err(e.into()),
        };

        if instance.status == InstanceStatus::Scheduled {
            self.store.transition_instance(
                instance_id,
                &[InstanceStatus::Scheduled],
                InstanceStatus::Starting,
            )?;
        }
        self.store.set_vm_status(vm.id, VmStatus::Starting)?;

        let spec = VmSpec {
            vm: vm.clone(),
            image: desired.image.clone(),
            app_id: deployment.app_id,
        };
        match self.runtime.create(&spec).await {
            Ok(handle) => {
                self.store.set_vm_status(vm.id, VmStatus::Running)?;
                self.store.transition_instance(
                    instance_id,
                    &[InstanceStatus::Starting],
                    InstanceStatus::Running,
                )?;
                info!(instance_id = %instance_id, vm_id = %vm.id, subnet = %vm.subnet, pid = ?handle.pid, "instance running");
                Ok(Applied::Done)
            }
            Err(e) => {
                error!(instance_id = %instance_id, vm_id = %vm.id, operation = "create", error = %e, "vm creation failed");
                let handle = VmHandle {
                    vm_id: vm.id,
                    instance_id,
                    pid: None,
                    tap_device: None,
                };
                self.store.fail_instance(
                    instance_id,
                    &[InstanceStatus::Scheduled, InstanceStatus::Starting],
                    &e.to_string(),
                )?;
                // The row is the subnet reservation; it outlives any process
                // that may still hold the address. A later pass releases it.
                match self.runtime.stop(&handle).await {
                    Ok(()) => {
                        self.store.release_vm(vm.id)?;
                    }
                    Err(stop_err) => {
                        warn!(
                            vm_id = %vm.id, instance_id = %instance_id, error = %stop_err,
                            "cleanup after failed create incomplete, subnet stays reserved"
                        );
                    }
                }
                Ok(Applied::Done)
            }
        }
    }

    async fn adopt(&self, instance_id: Id, vm_id: Id) -> Result<Applied, AgentError> {
        let alive = self
            .runtime
            .status(vm_id)
            .await?
            .is_some_and(|s| s.alive);
        if !alive {
            return Ok(Applied::Skipped);
        }
        let vm_changed = self.store.set_vm_status(vm_id, VmStatus::Running)?;
        let instance_changed = self
            .store
            .transition_instance(
                instance_id,
                &[InstanceStatus::Scheduled, InstanceStatus::Starting],
                InstanceStatus::Running,
            )?
            .is_some();
        if vm_changed || instance_changed {
            info!(instance_id = %instance_id, vm_id = %vm_id, "adopted running vm");
            Ok(Applied::Done)
        } else {
            Ok(Applied::Skipped)
        }
    }

    async fn teardown(&self, handle: &VmHandle) -> Result<Applied, AgentError> {
        let now = Instant::now();
        if !self.teardown.is_due(handle.vm_id, now) {
            return Ok(Applied::Deferred);
        }

        if let Err(e) = self.runtime.stop(handle).await {
            let attempts = self.teardown.record_failure(handle.vm_id, now);
            if attempts >= self.teardown.alert_after {
                error!(
                    vm_id = %handle.vm_id, instance_id = %handle.instance_id, attempts,
                    error = %e, "vm teardown keeps failing, operator attention required"
                );
            } else {
                warn!(
                    vm_id = %handle.vm_id, instance_id = %handle.instance_id, attempts,
                    error = %e, "vm teardown failed, will retry"
                );
            }
            return Err(e.into());
        }
        self.teardown.clear(handle.vm_id);

        self.store.release_vm(handle.vm_id)?;
        self.store.transition_instance(
            handle.instance_id,
            &[InstanceStatus::Stopping],
            InstanceStatus::Stopped,
        )?;
        info!(vm_id = %handle.vm_id, instance_id = %handle.instance_id, "vm torn down");
        Ok(Applied::Done)
    }

    async fn release(&self, handle: &VmHandle, lost: bool) -> Result<Applied, AgentError> {
        // It may have come up since the plan was made
        if self
            .runtime
            .status(handle.vm_id)
            .await?
            .is_some_and(|s| s.alive)
        {
            return Ok(Applied::Skipped);
        }

        // The runtime just reported no live process, so releasing the subnet
        // cannot hand out an address still in use. The stop only clears
        // leftovers such as the tap. Paths where the process may still be
        // alive must release only after a successful stop.
        if let Err(e) = self.runtime.stop(handle).await {
            warn!(vm_id = %handle.vm_id, error = %e, "cleanup of dead vm incomplete");
        }
        self.store.release_vm(handle.vm_id)?;

        if lost {
            warn!(vm_id = %handle.vm_id, instance_id = %handle.instance_id, "vm exited unexpectedly");
            self.store.fail_instance(
                handle.instance_id,
                &[
                    InstanceStatus::Scheduled,
                    InstanceStatus::Starting,
                    InstanceStatus::Running,
                ],
                VM_LOST,
            )?;
        } else {
            self.store.transition_instance(
                handle.instance_id,
                &[InstanceStatus::Stopping],
                InstanceStatus::Stopped,
            )?;
        }
        Ok(Applied::Done)
    }

    fn refresh_routes(&self) -> Result<(), AgentError> {
        let table = RouteTable::from_routes(self.store.list_routes(Some(self.server.id))?);
        match self.routes.publish(table) {
            Ok(true) => debug!("route table updated"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "cannot write routes file"),
        }
        Ok(())
    }

    fn heartbeat(&self) {
        if let Err(e) = self.store.heartbeat_server(self.server.id) {
            warn!(server_id = %self.server.id, error = %e, "heartbeat failed");
        }
    }

    /// Reconcile on every tick and on every relevant event until shutdown.
    /// A pass in progress always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.bus.subscribe(SUBJECTS);
        let mut tick = tokio::time::interval(self.config.reconcile_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut bus_open = true;
        info!(
            node = %self.node.name,
            interval_secs = self.config.reconcile_interval_secs,
            "node agent started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    self.heartbeat();
                    self.pass().await;
                }
                event = events.recv(), if bus_open => match event {
                    Some(event) => {
                        debug!(subject = %event.subject, id = %event.id, "event");
                        self.pass().await;
                    }
                    None => {
                        warn!("bus closed, node agent continues on its timer only");
                        bus_open = false;
                    }
                },
            }
        }
        info!("node agent shutting down");
    }

    async fn pass(&self) {
        match self.reconcile().await {
            Ok(report) if !report.is_converged() => debug!(?report, "reconcile pass"),
            Ok(_) => {}
            Err(e) => warn!(server_id = %self.server.id, operation = "reconcile", error = %e, "reconcile pass failed"),
        }
    }
}

enum Applied {
    Done,
    Skipped,
    Deferred,
}

fn action_name(action: &Action) -> &'static str {
    match action {
        Action::Create { .. } => "create",
        Action::Adopt { .. } => "adopt",
        Action::Stop { .. } => "stop",
        Action::Release { .. } => "release",
        Action::Finish { .. } => "finish",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::model::{NewVm, VmStatus};
    use crate::store::traits::{InstanceStore, VmStore};
    use crate::store::SqliteStore;
    use crate::test_support::{seed_deployment, FakeRuntime, Seed};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        runtime: Arc<FakeRuntime>,
        agent: NodeAgent<SqliteStore>,
        seed: Seed,
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.node.name = "node-a".to_string();
        config.node.ip_range = "10.80.0.0/16".to_string();
        config.node.max_instances = 8;
        config.agent.routes_file = dir.path().join("routes.json").to_string_lossy().to_string();
        config.orchestrator.backoff_base_ms = 0;
        config
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_and_init(&dir.path().join("agent.db")).unwrap());
        let seed = seed_deployment(&*store, "web", 1);
        let runtime = Arc::new(FakeRuntime::new());
        let agent = NodeAgent::register(
            store.clone(),
            runtime.clone(),
            Arc::new(LocalBus::default()),
            &test_config(&dir),
        )
        .unwrap();
        assert_eq!(agent.server_id(), seed.server.id);
        Fixture {
            _dir: dir,
            store,
            runtime,
            agent,
            seed,
        }
    }

    fn scheduled_instance(f: &Fixture) -> Id {
        let inst = f
            .store
            .create_instance(f.seed.deployment.id, f.seed.image.id)
            .unwrap();
        f.store.schedule_instance(inst.id, f.seed.server.id).unwrap().unwrap();
        inst.id
    }

    #[tokio::test]
    async fn creates_vm_and_marks_instance_running() {
        let f = fixture();
        let id = scheduled_instance(&f);

        let report = f.agent.reconcile().await.unwrap();
        assert_eq!(report.created, 1);
        let inst = f.store.get_instance(id).unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);
        let vm = f.store.get_vm_for_instance(id).unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(f.runtime.create_calls(), 1);

        let routes = f.agent.routes().borrow().clone();
        assert_eq!(routes.lookup("web.example.com")[0].ip, vm.guest_ip);

        // Converged: another pass does nothing
        assert!(f.agent.reconcile().await.unwrap().is_converged());
        assert_eq!(f.runtime.create_calls(), 1);
    }

    #[tokio::test]
    async fn failed_create_fails_instance_and_releases_subnet() {
        let f = fixture();
        let id = scheduled_instance(&f);
        f.runtime.fail_creates(true);

        f.agent.reconcile().await.unwrap();
        let inst = f.store.get_instance(id).unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Failed);
        assert_eq!(inst.attempts, 1);
        assert!(inst.error.unwrap().contains("fake boot failure"));
        assert!(f.store.get_vm_for_instance(id).unwrap().is_none());
        assert!(f.runtime.running().is_empty());
    }

    #[tokio::test]
    async fn subnet_stays_reserved_until_cleanup_after_failed_create_succeeds() {
        let f = fixture();
        let id = scheduled_instance(&f);
        f.runtime.fail_creates(true);
        f.runtime.fail_stops(1);

        f.agent.reconcile().await.unwrap();
        let inst = f.store.get_instance(id).unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Failed);
        assert!(inst.error.unwrap().contains("fake boot failure"));

        // The failed cleanup leaves the reservation in place
        let held = f.store.get_vm_for_instance(id).unwrap().unwrap();
        let other = f
            .store
            .create_instance(f.seed.deployment.id, f.seed.image.id)
            .unwrap();
        let err = f
            .store
            .insert_vm(&NewVm {
                instance_id: other.id,
                server_id: f.seed.server.id,
                image_id: f.seed.image.id,
                vcpus: 1,
                memory_mib: 128,
                port: 8080,
                subnet: held.subnet.parse().unwrap(),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Exclusion(_)), "got {err}");

        // Next pass finds no process, stops cleanly and releases
        let report = f.agent.reconcile().await.unwrap();
        assert_eq!(report.released, 1);
        assert!(f.store.get_vm_for_instance(id).unwrap().is_none());
        assert_eq!(f.runtime.stop_calls(), 2);
        assert_eq!(f.runtime.create_calls(), 1);
    }

    #[tokio::test]
    async fn stopping_instance_is_torn_down() {
        let f = fixture();
        let id = scheduled_instance(&f);
        f.agent.reconcile().await.unwrap();

        f.store
            .transition_instance(id, &[InstanceStatus::Running], InstanceStatus::Stopping)
            .unwrap()
            .unwrap();
        let report = f.agent.reconcile().await.unwrap();
        assert_eq!(report.stopped, 1);
        assert_eq!(f.store.get_instance(id).unwrap().unwrap().status, InstanceStatus::Stopped);
        assert!(f.store.get_vm_for_instance(id).unwrap().is_none());
        assert!(f.runtime.running().is_empty());
        assert!(f.agent.routes().borrow().is_empty());
    }

    #[tokio::test]
    async fn teardown_failures_are_retried_locally() {
        let f = fixture();
        let id = scheduled_instance(&f);
        f.agent.reconcile().await.unwrap();
        f.store
            .transition_instance(id, &[InstanceStatus::Running], InstanceStatus::Stopping)
            .unwrap();

        f.runtime.fail_stops(2);
        assert_eq!(f.agent.reconcile().await.unwrap().errors, 1);
        assert_eq!(f.agent.reconcile().await.unwrap().errors, 1);
        assert_eq!(f.store.get_instance(id).unwrap().unwrap().status, InstanceStatus::Stopping);

        let report = f.agent.reconcile().await.unwrap();
        assert_eq!(report.stopped, 1);
        assert_eq!(f.store.get_instance(id).unwrap().unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn crashed_vm_fails_its_instance() {
        let f = fixture();
        let id = scheduled_instance(&f);
        f.agent.reconcile().await.unwrap();
        let vm = f.store.get_vm_for_instance(id).unwrap().unwrap();

        f.runtime.crash(vm.id);
        f.agent.reconcile().await.unwrap();
        let inst = f.store.get_instance(id).unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Failed);
        assert_eq!(inst.error.as_deref(), Some(VM_LOST));
        assert!(f.store.get_vm(vm.id).unwrap().unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_passes_create_one_vm() {
        let f = fixture();
        let id = scheduled_instance(&f);

        let (a, b) = tokio::join!(f.agent.reconcile(), f.agent.reconcile());
        a.unwrap();
        b.unwrap();
        assert_eq!(f.runtime.create_calls(), 1);
        assert!(f.store.get_vm_for_instance(id).unwrap().is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let agent = Arc::new(f.agent);
        let task = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(rx).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn locks_serialize_per_instance() {
        let locks = VmLocks::default();
        let a = locks.lock(Id::from_i64(1)).await;
        // A different instance is not blocked
        let _b = locks.lock(Id::from_i64(2)).await;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            locks.lock(Id::from_i64(1)),
        )
        .await;
        assert!(pending.is_err());
        drop(a);
        let _again = locks.lock(Id::from_i64(1)).await;
    }
}
