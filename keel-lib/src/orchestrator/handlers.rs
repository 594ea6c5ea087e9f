// SPDX-License-Identifier: GPL-2.0-only
//! Control-plane state machines for builds, deployments and instances.
//!
//! Every handler re-reads the entity and everything it depends on, then
//! writes only what differs. Running a handler twice, or for an entity
//! that is already converged, changes nothing.

use super::scheduler::Backoff;
use super::{OrchestratorError, Outcome};
use crate::config::OrchestratorConfig;
use crate::id::Id;
use crate::model::{
    BuildStatus, Deployment, DeploymentStatus, EntityKind, Instance, InstanceStatus, Server,
};
use crate::store::now_millis;
use crate::store::traits::StateStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reason persisted on a pending instance no server can take.
pub const NO_CAPACITY: &str = "no server capacity";

pub struct Orchestrator<S: ?Sized> {
    store: Arc<S>,
    config: OrchestratorConfig,
    backoff: Backoff,
}

impl<S: StateStore + Send + Sync + ?Sized> Orchestrator<S> {
    pub fn new(store: Arc<S>, config: OrchestratorConfig) -> Self {
        let backoff = Backoff {
            base: config.backoff_base(),
            cap: config.backoff_cap(),
        };
        Orchestrator {
            store,
            config,
            backoff,
        }
    }

    /// Route a scheduled key to its handler.
    pub fn dispatch(&self, kind: EntityKind, id: Id) -> Result<Outcome, OrchestratorError> {
        match kind {
            EntityKind::Build => self.handle_build_completed(id),
            EntityKind::Deployment => self.handle_deployment_updated(id),
            EntityKind::Instance => self.handle_instance_updated(id),
            EntityKind::Server => self.handle_node_updated(id),
            EntityKind::Image | EntityKind::App | EntityKind::Vm => Ok(Outcome::Done),
        }
    }

    pub fn handle_build_created(&self, id: Id) -> Result<Outcome, OrchestratorError> {
        self.handle_build_completed(id)
    }

    /// Poll a build until it is terminal, then reconcile every deployment
    /// built from it.
    pub fn handle_build_completed(&self, id: Id) -> Result<Outcome, OrchestratorError> {
        let Some(build) = self.store.get_build(id)? else {
            debug!(build_id = %id, "build not found, ignoring");
            return Ok(Outcome::Done);
        };
        if build.deleted_at.is_some() {
            return Ok(Outcome::Done);
        }
        if !build.status.is_terminal() {
            return Ok(Outcome::RetryAfter(self.config.build_poll()));
        }

        let mut outcome = Outcome::Done;
        for deployment in self.store.list_deployments_for_build(id)? {
            outcome = outcome.merge(self.reconcile_deployment(deployment.id)?);
        }
        Ok(outcome)
    }

    pub fn handle_deployment_created(&self, id: Id) -> Result<Outcome, OrchestratorError> {
        self.reconcile_deployment(id)
    }

    pub fn handle_deployment_updated(&self, id: Id) -> Result<Outcome, OrchestratorError> {
        self.reconcile_deployment(id)
    }

    /// Bring a deployment's instances in line with its build, then place
    /// or revive the instance itself.
    pub fn handle_instance_updated(&self, id: Id) -> Result<Outcome, OrchestratorError> {
        let Some(instance) = self.store.get_instance(id)? else {
            debug!(instance_id = %id, "instance not found, ignoring");
            return Ok(Outcome::Done);
        };

        let outcome = self.reconcile_deployment(instance.deployment_id)?;

        // The reconcile may have stopped it
        let Some(instance) = self.store.get_instance(id)? else {
            return Ok(outcome);
        };
        if instance.deleted_at.is_some() {
            return Ok(outcome);
        }
        let own = match instance.status {
            InstanceStatus::Pending => self.place(&instance)?,
            InstanceStatus::Failed => self.revive(&instance)?,
            _ => Outcome::Done,
        };
        Ok(outcome.merge(own))
    }

    /// A server changed: capacity may have appeared, or the server is gone.
    pub fn handle_node_updated(&self, id: Id) -> Result<Outcome, OrchestratorError> {
        if let Some(server) = self.store.get_server(id)? {
            if server.deleted_at.is_some() {
                self.evacuate(&server)?;
            }
        }

        let mut outcome = Outcome::Done;
        for instance in self.store.list_instances_with_status(InstanceStatus::Pending)? {
            outcome = outcome.merge(self.place(&instance)?);
        }
        Ok(outcome)
    }

    fn reconcile_deployment(&self, id: Id) -> Result<Outcome, OrchestratorError> {
        let Some(deployment) = self.store.get_deployment(id)? else {
            debug!(deployment_id = %id, "deployment not found, ignoring");
            return Ok(Outcome::Done);
        };
        let instances = self.store.list_instances_for_deployment(id)?;

        if deployment.is_retired() {
            for instance in instances.iter().filter(|i| i.status.is_live()) {
                self.stop_instance(instance)?;
            }
            return Ok(Outcome::Done);
        }

        let Some(build) = self.store.get_build(deployment.build_id)? else {
            warn!(deployment_id = %id, build_id = %deployment.build_id, "deployment references a missing build");
            return Ok(Outcome::Done);
        };
        let target_image = match build.status {
            BuildStatus::Pending | BuildStatus::Running => {
                // Instances of a previous revision keep running
                if instances.iter().all(|i| !i.status.is_live()) {
                    self.store.set_deployment_status(id, DeploymentStatus::Pending, None)?;
                }
                return Ok(Outcome::Done);
            }
            BuildStatus::Failed => {
                let error = build.error.as_deref().unwrap_or("build failed");
                if self.store.set_deployment_status(id, DeploymentStatus::Failed, Some(error))? {
                    info!(deployment_id = %id, build_id = %build.id, error, "deployment failed: build failed");
                }
                return Ok(Outcome::Done);
            }
            BuildStatus::Succeeded => match build.image_id {
                Some(image_id) => image_id,
                None => {
                    let error = "build succeeded without an image";
                    self.store.set_deployment_status(id, DeploymentStatus::Failed, Some(error))?;
                    return Ok(Outcome::Done);
                }
            },
        };

        self.converge_instances(&deployment, target_image, instances)
    }

    /// Diff the live instances against `replicas` copies of `target_image`.
    fn converge_instances(
        &self,
        deployment: &Deployment,
        target_image: Id,
        instances: Vec<Instance>,
    ) -> Result<Outcome, OrchestratorError> {
        let replicas = deployment.desired_replicas() as usize;
        let (mut current, outdated): (Vec<Instance>, Vec<Instance>) = instances
            .into_iter()
            .filter(|i| i.status.is_live())
            .partition(|i| i.image_id == target_image);

        for _ in current.len()..replicas {
            let instance = self.store.create_instance(deployment.id, target_image)?;
            debug!(deployment_id = %deployment.id, instance_id = %instance.id, "instance created");
        }

        if current.len() > replicas {
            // Newest first
            current.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
            for surplus in current.drain(..current.len() - replicas) {
                self.stop_instance(&surplus)?;
            }
        }

        // Outdated copies that serve traffic go only once enough current
        // copies run to take their place.
        let running_current = current
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .count();
        let mut outdated_running: Vec<&Instance> = Vec::new();
        for instance in &outdated {
            if instance.status == InstanceStatus::Running {
                outdated_running.push(instance);
            } else {
                self.stop_instance(instance)?;
            }
        }
        outdated_running.sort_by_key(|i| (i.created_at, i.id));
        let mut outdated_remaining = outdated_running.len();
        for instance in outdated_running {
            if running_current + outdated_remaining <= replicas {
                break;
            }
            self.stop_instance(instance)?;
            outdated_remaining -= 1;
        }

        let (status, error) = if let Some(failed) =
            current.iter().find(|i| i.status == InstanceStatus::Failed)
        {
            (
                DeploymentStatus::Failed,
                Some(failed.error.clone().unwrap_or_else(|| "instance failed".to_string())),
            )
        } else if running_current >= replicas && outdated_remaining == 0 {
            (DeploymentStatus::Active, None)
        } else {
            (DeploymentStatus::Deploying, None)
        };

        if self
            .store
            .set_deployment_status(deployment.id, status, error.as_deref())?
        {
            info!(
                deployment_id = %deployment.id,
                status = %status,
                running = running_current,
                replicas,
                "deployment status changed"
            );
        }

        if status == DeploymentStatus::Active {
            self.supersede_older(deployment)?;
        }
        Ok(Outcome::Done)
    }

    /// Retire every older deployment of the same app.
    fn supersede_older(&self, deployment: &Deployment) -> Result<(), OrchestratorError> {
        for older in self.store.list_deployments_for_app(deployment.app_id)? {
            if (older.created_at, older.id) >= (deployment.created_at, deployment.id)
                || older.status == DeploymentStatus::Superseded
            {
                continue;
            }
            if self
                .store
                .set_deployment_status(older.id, DeploymentStatus::Superseded, None)?
            {
                info!(deployment_id = %older.id, by = %deployment.id, "deployment superseded");
            }
            for instance in self.store.list_instances_for_deployment(older.id)? {
                if instance.status.is_live() {
                    self.stop_instance(&instance)?;
                }
            }
        }
        Ok(())
    }

    /// Instances without a VM stop at once; the rest are handed to their
    /// node agent as `stopping`.
    fn stop_instance(&self, instance: &Instance) -> Result<(), OrchestratorError> {
        let stopped = self.store.transition_instance(
            instance.id,
            &[InstanceStatus::Pending, InstanceStatus::Failed],
            InstanceStatus::Stopped,
        )?;
        if stopped.is_some() {
            debug!(instance_id = %instance.id, "instance stopped");
            return Ok(());
        }
        let stopping = self.store.transition_instance(
            instance.id,
            &[
                InstanceStatus::Scheduled,
                InstanceStatus::Starting,
                InstanceStatus::Running,
            ],
            InstanceStatus::Stopping,
        )?;
        if stopping.is_some() {
            debug!(instance_id = %instance.id, "instance marked stopping");
        }
        Ok(())
    }

    /// Bind a pending instance to the least loaded healthy server.
    fn place(&self, instance: &Instance) -> Result<Outcome, OrchestratorError> {
        let servers = self.store.list_servers()?;
        let counts = self.store.count_instances_by_server()?;
        let now = now_millis();
        let timeout_ms = self.config.heartbeat_timeout().as_millis() as i64;

        let Some(server) = pick_server(&servers, &counts, now, timeout_ms) else {
            if self.store.set_instance_error(instance.id, NO_CAPACITY)? {
                warn!(instance_id = %instance.id, "no server capacity, instance stays pending");
            }
            return Ok(Outcome::RetryAfter(self.config.exhausted_retry()));
        };

        match self.store.schedule_instance(instance.id, server.id)? {
            Some(_) => info!(instance_id = %instance.id, server = %server.name, "instance scheduled"),
            None => debug!(instance_id = %instance.id, "instance no longer pending"),
        }
        Ok(Outcome::Done)
    }

    /// The explicit retry path: failed → pending once the backoff elapsed.
    fn revive(&self, instance: &Instance) -> Result<Outcome, OrchestratorError> {
        let delay = self.backoff.delay(instance.attempts);
        let failed_at = instance.failed_at.unwrap_or(instance.updated_at);
        let due = failed_at.saturating_add(delay.as_millis() as i64);
        let now = now_millis();
        if now < due {
            return Ok(Outcome::RetryAfter(Duration::from_millis((due - now) as u64)));
        }

        match self.store.retry_instance(instance.id)? {
            Some(pending) => {
                info!(instance_id = %instance.id, attempts = instance.attempts, "retrying failed instance");
                self.place(&pending)
            }
            None => Ok(Outcome::Done),
        }
    }

    /// A removed server's instances go back through the retry path.
    fn evacuate(&self, server: &Server) -> Result<(), OrchestratorError> {
        for instance in self.store.list_instances_for_server(server.id)? {
            match instance.status {
                InstanceStatus::Stopping => {
                    self.store.transition_instance(
                        instance.id,
                        &[InstanceStatus::Stopping],
                        InstanceStatus::Stopped,
                    )?;
                }
                InstanceStatus::Scheduled | InstanceStatus::Starting | InstanceStatus::Running => {
                    if self
                        .store
                        .fail_instance(instance.id, &[instance.status], "server removed")?
                        .is_some()
                    {
                        warn!(instance_id = %instance.id, server = %server.name, "instance lost its server");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Least loaded schedulable server with room, ties broken by name.
fn pick_server<'a>(
    servers: &'a [Server],
    counts: &HashMap<Id, u32>,
    now_ms: i64,
    heartbeat_timeout_ms: i64,
) -> Option<&'a Server> {
    servers
        .iter()
        .filter(|s| s.is_schedulable(now_ms, heartbeat_timeout_ms))
        .map(|s| (s, counts.get(&s.id).copied().unwrap_or(0)))
        .filter(|(s, n)| *n < s.max_instances)
        .min_by(|(a, n), (b, m)| n.cmp(m).then_with(|| a.name.cmp(&b.name)))
        .map(|(s, _)| s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreateBuildParams, CreateDeploymentParams, ServerStatus};
    use crate::store::traits::{
        BuildStore, ChangeStore, DeploymentStore, InstanceStore, ServerStore,
    };
    use crate::store::SqliteStore;
    use crate::test_support::{
        seed_deployment, seed_image, seed_server, set_instance_running, Seed,
    };

    fn setup(dir: &tempfile::TempDir, replicas: u32) -> (Arc<SqliteStore>, Orchestrator<SqliteStore>, Seed) {
        let store = Arc::new(SqliteStore::open_and_init(&dir.path().join("orch.db")).unwrap());
        let seed = seed_deployment(&*store, "web", replicas);
        let orch = Orchestrator::new(store.clone(), OrchestratorConfig::default());
        (store, orch, seed)
    }

    fn live(store: &SqliteStore, deployment_id: Id) -> Vec<Instance> {
        store
            .list_instances_for_deployment(deployment_id)
            .unwrap()
            .into_iter()
            .filter(|i| i.status.is_live())
            .collect()
    }

    #[test]
    fn deployment_creates_missing_instances_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 3);

        orch.handle_deployment_created(seed.deployment.id).unwrap();
        assert_eq!(live(&store, seed.deployment.id).len(), 3);

        // Level-triggered: a duplicate event is a no-op
        let before = store.max_change_seq().unwrap();
        orch.handle_deployment_updated(seed.deployment.id).unwrap();
        assert_eq!(live(&store, seed.deployment.id).len(), 3);
        assert_eq!(store.max_change_seq().unwrap(), before);

        let dep = store.get_deployment(seed.deployment.id).unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Deploying);
    }

    #[test]
    fn scale_down_stops_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 3);
        orch.handle_deployment_created(seed.deployment.id).unwrap();
        let mut all = live(&store, seed.deployment.id);
        all.sort_by_key(|i| (i.created_at, i.id));

        store.set_deployment_replicas(seed.deployment.id, 1).unwrap();
        orch.handle_deployment_updated(seed.deployment.id).unwrap();

        let remaining = live(&store, seed.deployment.id);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, all[0].id);
        // Pending instances have no VM and stop immediately
        for gone in &all[1..] {
            let inst = store.get_instance(gone.id).unwrap().unwrap();
            assert_eq!(inst.status, InstanceStatus::Stopped);
        }
    }

    #[test]
    fn pending_build_is_polled() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 1);
        let build = store
            .create_build(&CreateBuildParams {
                commit_sha: "abc123".into(),
                image_id: None,
            })
            .unwrap();
        let dep = store
            .create_deployment(&CreateDeploymentParams {
                app_id: seed.app.id,
                build_id: build.id,
                replicas: 1,
                vcpus: 1,
                memory_mib: 128,
                port: 8080,
                env: vec![],
            })
            .unwrap();

        let outcome = orch.handle_build_created(build.id).unwrap();
        assert_eq!(outcome, Outcome::RetryAfter(OrchestratorConfig::default().build_poll()));
        orch.handle_deployment_created(dep.id).unwrap();
        assert!(live(&store, dep.id).is_empty());

        let image = seed_image(&*store, "v2");
        store
            .set_build_status(build.id, BuildStatus::Succeeded, Some(image.id), None)
            .unwrap();
        assert_eq!(orch.handle_build_completed(build.id).unwrap(), Outcome::Done);
        let instances = live(&store, dep.id);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].image_id, image.id);
    }

    #[test]
    fn failed_build_fails_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 1);
        let build = store
            .create_build(&CreateBuildParams {
                commit_sha: "bad".into(),
                image_id: None,
            })
            .unwrap();
        store.set_deployment_build(seed.deployment.id, build.id).unwrap();
        store
            .set_build_status(build.id, BuildStatus::Failed, None, Some("compile error"))
            .unwrap();

        orch.handle_build_completed(build.id).unwrap();
        let dep = store.get_deployment(seed.deployment.id).unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Failed);
        assert_eq!(dep.error.as_deref(), Some("compile error"));
        assert!(live(&store, dep.id).is_empty());
    }

    #[test]
    fn pending_instance_is_placed_on_least_loaded_server() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 2);
        let other = seed_server(&*store, "node-b", "10.81.0.0/16");
        orch.handle_deployment_created(seed.deployment.id).unwrap();

        for instance in live(&store, seed.deployment.id) {
            orch.handle_instance_updated(instance.id).unwrap();
        }
        let placed: Vec<Option<Id>> = live(&store, seed.deployment.id)
            .iter()
            .map(|i| i.server_id)
            .collect();
        assert!(placed.contains(&Some(seed.server.id)));
        assert!(placed.contains(&Some(other.id)));
    }

    #[test]
    fn no_capacity_keeps_instance_pending_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 1);
        store
            .set_server_status(seed.server.id, ServerStatus::Draining)
            .unwrap();
        orch.handle_deployment_created(seed.deployment.id).unwrap();
        let instance = live(&store, seed.deployment.id).remove(0);

        let outcome = orch.handle_instance_updated(instance.id).unwrap();
        assert_eq!(outcome, Outcome::RetryAfter(OrchestratorConfig::default().exhausted_retry()));
        let instance = store.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.error.as_deref(), Some(NO_CAPACITY));

        store.set_server_status(seed.server.id, ServerStatus::Active).unwrap();
        orch.handle_node_updated(seed.server.id).unwrap();
        let instance = store.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Scheduled);
    }

    #[test]
    fn failed_instance_waits_for_backoff_then_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_and_init(&dir.path().join("orch.db")).unwrap());
        let seed = seed_deployment(&*store, "web", 1);
        let config = OrchestratorConfig {
            backoff_base_ms: 60_000,
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::new(store.clone(), config);
        orch.handle_deployment_created(seed.deployment.id).unwrap();
        let instance = live(&store, seed.deployment.id).remove(0);
        orch.handle_instance_updated(instance.id).unwrap();
        store
            .fail_instance(instance.id, &[InstanceStatus::Scheduled], "boot timeout")
            .unwrap()
            .unwrap();

        let outcome = orch.handle_instance_updated(instance.id).unwrap();
        assert!(matches!(outcome, Outcome::RetryAfter(d) if d > Duration::from_secs(50)));
        let dep = store.get_deployment(seed.deployment.id).unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Failed);
        assert_eq!(dep.error.as_deref(), Some("boot timeout"));

        let fast = Orchestrator::new(store.clone(), OrchestratorConfig {
            backoff_base_ms: 0,
            ..OrchestratorConfig::default()
        });
        fast.handle_instance_updated(instance.id).unwrap();
        let instance = store.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Scheduled);
        assert_eq!(instance.attempts, 1);
    }

    #[test]
    fn new_revision_surges_before_replacing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 1);
        orch.handle_deployment_created(seed.deployment.id).unwrap();
        let old = live(&store, seed.deployment.id).remove(0);
        orch.handle_instance_updated(old.id).unwrap();
        set_instance_running(&*store, old.id);
        orch.handle_instance_updated(old.id).unwrap();
        assert_eq!(
            store.get_deployment(seed.deployment.id).unwrap().unwrap().status,
            DeploymentStatus::Active
        );

        // New revision
        let v2 = seed_image(&*store, "v2");
        let build = store
            .create_build(&CreateBuildParams {
                commit_sha: "def456".into(),
                image_id: None,
            })
            .unwrap();
        store
            .set_build_status(build.id, BuildStatus::Succeeded, Some(v2.id), None)
            .unwrap();
        store.set_deployment_build(seed.deployment.id, build.id).unwrap();
        orch.handle_build_completed(build.id).unwrap();

        let instances = live(&store, seed.deployment.id);
        assert_eq!(instances.len(), 2);
        let new = instances.iter().find(|i| i.image_id == v2.id).unwrap().clone();
        // The old copy keeps serving until the new one runs
        assert_eq!(store.get_instance(old.id).unwrap().unwrap().status, InstanceStatus::Running);

        orch.handle_instance_updated(new.id).unwrap();
        set_instance_running(&*store, new.id);
        orch.handle_instance_updated(new.id).unwrap();

        assert_eq!(store.get_instance(old.id).unwrap().unwrap().status, InstanceStatus::Stopping);
        let dep = store.get_deployment(seed.deployment.id).unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Active);
    }

    #[test]
    fn active_deployment_supersedes_older_ones() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 1);
        orch.handle_deployment_created(seed.deployment.id).unwrap();
        let old = live(&store, seed.deployment.id).remove(0);
        orch.handle_instance_updated(old.id).unwrap();
        set_instance_running(&*store, old.id);
        // Deployments are ordered by creation time
        std::thread::sleep(Duration::from_millis(5));

        let next = store
            .create_deployment(&CreateDeploymentParams {
                app_id: seed.app.id,
                build_id: seed.build.id,
                replicas: 1,
                vcpus: 1,
                memory_mib: 128,
                port: 8080,
                env: vec![],
            })
            .unwrap();
        orch.handle_deployment_created(next.id).unwrap();
        let fresh = live(&store, next.id).remove(0);
        orch.handle_instance_updated(fresh.id).unwrap();
        set_instance_running(&*store, fresh.id);
        orch.handle_instance_updated(fresh.id).unwrap();

        let old_dep = store.get_deployment(seed.deployment.id).unwrap().unwrap();
        assert_eq!(old_dep.status, DeploymentStatus::Superseded);
        assert_eq!(store.get_instance(old.id).unwrap().unwrap().status, InstanceStatus::Stopping);
    }

    #[test]
    fn deleted_deployment_desires_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 2);
        orch.handle_deployment_created(seed.deployment.id).unwrap();
        store.delete_deployment(seed.deployment.id).unwrap();
        orch.handle_deployment_updated(seed.deployment.id).unwrap();
        assert!(live(&store, seed.deployment.id).is_empty());
    }

    #[test]
    fn removed_server_fails_its_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (store, orch, seed) = setup(&dir, 1);
        orch.handle_deployment_created(seed.deployment.id).unwrap();
        let instance = live(&store, seed.deployment.id).remove(0);
        orch.handle_instance_updated(instance.id).unwrap();

        let server = Server {
            deleted_at: Some(1),
            ..store.get_server(seed.server.id).unwrap().unwrap()
        };
        orch.evacuate(&server).unwrap();
        let instance = store.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.error.as_deref(), Some("server removed"));
    }

    #[test]
    fn pick_server_skips_stale_and_full() {
        let server = |name: &str, id: i64, heartbeat_at: i64, max: u32| Server {
            id: Id::from_i64(id),
            name: name.into(),
            ip_range: "10.0.0.0/24".into(),
            max_instances: max,
            status: ServerStatus::Active,
            heartbeat_at: Some(heartbeat_at),
            created_at: 0,
            deleted_at: None,
        };
        let servers = vec![
            server("stale", 1, 0, 10),
            server("full", 2, 1000, 1),
            server("ok", 3, 1000, 10),
        ];
        let counts = HashMap::from([(Id::from_i64(2), 1), (Id::from_i64(3), 5)]);
        let picked = pick_server(&servers, &counts, 1000, 100).unwrap();
        assert_eq!(picked.name, "ok");
    }
}
