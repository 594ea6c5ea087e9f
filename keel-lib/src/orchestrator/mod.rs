// SPDX-License-Identifier: GPL-2.0-only
//! Control-plane reconciler.
//!
//! Bus events only say *which* entity to look at. The controller turns
//! them into keys in a [`RetryScheduler`], dispatches due keys to the
//! handlers, and reschedules failures with backoff. A periodic resync
//! schedules every live entity so lost events are healed.

pub mod handlers;
pub mod scheduler;

pub use handlers::Orchestrator;
pub use scheduler::{Backoff, RetryScheduler};

use crate::bus::Bus;
use crate::config::OrchestratorConfig;
use crate::id::Id;
use crate::model::EntityKind;
use crate::store::traits::{StateStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Subjects the controller reacts to.
pub const SUBJECTS: &[&str] = &["build.*", "deployment.*", "instance.*", "node.*"];

/// Entity kinds covered by the periodic resync.
const RESYNC_KINDS: [EntityKind; 3] =
    [EntityKind::Build, EntityKind::Deployment, EntityKind::Instance];

#[derive(Debug)]
pub enum OrchestratorError {
    Store(StoreError),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Store(e)
    }
}

impl OrchestratorError {
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Store(e) => e.is_transient(),
        }
    }
}

/// What a handler wants next for its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Look again later: waiting on a build, on capacity, or on a backoff.
    RetryAfter(Duration),
}

impl Outcome {
    /// Combine two outcomes, keeping the sooner retry.
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Done, o) | (o, Outcome::Done) => o,
            (Outcome::RetryAfter(a), Outcome::RetryAfter(b)) => Outcome::RetryAfter(a.min(b)),
        }
    }
}

type Key = (EntityKind, Id);

pub struct Controller<S: ?Sized> {
    orchestrator: Orchestrator<S>,
    store: Arc<S>,
    bus: Arc<dyn Bus>,
    scheduler: RetryScheduler<Key>,
    resync_interval: Duration,
}

impl<S: StateStore + Send + Sync + ?Sized> Controller<S> {
    pub fn new(store: Arc<S>, bus: Arc<dyn Bus>, config: OrchestratorConfig) -> Self {
        let backoff = Backoff {
            base: config.backoff_base(),
            cap: config.backoff_cap(),
        };
        let resync_interval = config.resync_interval();
        Controller {
            orchestrator: Orchestrator::new(store.clone(), config),
            store,
            bus,
            scheduler: RetryScheduler::new(backoff),
            resync_interval,
        }
    }

    /// Schedule every live build, deployment and instance for now.
    pub fn resync(&mut self) {
        let now = Instant::now();
        for kind in RESYNC_KINDS {
            match self.store.list_live_ids(kind) {
                Ok(ids) => {
                    debug!(entity = %kind, count = ids.len(), "resync");
                    for id in ids {
                        self.scheduler.schedule((kind, id), now);
                    }
                }
                Err(e) => warn!(entity = %kind, error = %e, "resync listing failed"),
            }
        }
    }

    /// Run one due key through its handler and reschedule as needed.
    fn process(&mut self, key: Key) {
        let (kind, id) = key;
        let now = Instant::now();
        match self.orchestrator.dispatch(kind, id) {
            Ok(Outcome::Done) => self.scheduler.record_success(&key),
            Ok(Outcome::RetryAfter(delay)) => {
                self.scheduler.record_success(&key);
                self.scheduler.schedule_after(key, now, delay);
            }
            Err(e) => {
                let delay = self.scheduler.record_failure(key, now);
                let attempts = self.scheduler.attempts(&key);
                if e.is_transient() {
                    warn!(
                        entity = %kind, id = %id, operation = "reconcile", attempts,
                        retry_in_ms = delay.as_millis() as u64, error = %e,
                        "handler failed, retrying"
                    );
                } else {
                    error!(
                        entity = %kind, id = %id, operation = "reconcile", attempts,
                        retry_in_ms = delay.as_millis() as u64, error = %e,
                        "handler failed, retrying"
                    );
                }
            }
        }
    }

    /// Dispatch everything due now. Returns false if shutdown was requested.
    pub fn drain_due(&mut self, shutdown: &watch::Receiver<bool>) -> bool {
        while let Some(key) = self.scheduler.pop_due(Instant::now()) {
            self.process(key);
            if *shutdown.borrow() {
                return false;
            }
        }
        true
    }

    /// Number of keys waiting in the scheduler.
    pub fn scheduled(&self) -> usize {
        self.scheduler.len()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.bus.subscribe(SUBJECTS);
        // The first tick fires at once: start with a full pass
        let mut resync = tokio::time::interval(self.resync_interval);
        let mut bus_open = true;
        info!(resync_secs = self.resync_interval.as_secs(), "orchestrator started");

        loop {
            if !self.drain_due(&shutdown) {
                break;
            }
            let next_due = self.scheduler.next_due();
            let wait = async {
                match next_due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = resync.tick() => self.resync(),
                event = events.recv(), if bus_open => match event {
                    Some(event) => {
                        debug!(subject = %event.subject, id = %event.id, "event");
                        self.scheduler.schedule((event.entity, event.id), Instant::now());
                    }
                    None => {
                        warn!("bus closed, orchestrator continues on resync only");
                        bus_open = false;
                    }
                },
                _ = wait => {}
            }
        }
        info!("orchestrator shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::model::InstanceStatus;
    use crate::store::traits::InstanceStore;
    use crate::store::SqliteStore;
    use crate::test_support::seed_deployment;

    #[test]
    fn outcome_merge_keeps_sooner_retry() {
        let a = Outcome::RetryAfter(Duration::from_secs(5));
        let b = Outcome::RetryAfter(Duration::from_secs(2));
        assert_eq!(a.merge(b), b);
        assert_eq!(Outcome::Done.merge(a), a);
        assert_eq!(a.merge(Outcome::Done), a);
        assert_eq!(Outcome::Done.merge(Outcome::Done), Outcome::Done);
    }

    #[test]
    fn resync_places_without_any_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_and_init(&dir.path().join("c.db")).unwrap());
        let seed = seed_deployment(&*store, "web", 2);
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let mut controller = Controller::new(store.clone(), bus, OrchestratorConfig::default());
        let (_tx, rx) = watch::channel(false);

        // Pass 1 creates instances, pass 2 places them
        for _ in 0..2 {
            controller.resync();
            assert!(controller.drain_due(&rx));
        }
        let instances = store.list_instances_for_deployment(seed.deployment.id).unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| i.status == InstanceStatus::Scheduled));
    }

    #[tokio::test]
    async fn run_converges_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_and_init(&dir.path().join("c.db")).unwrap());
        let bus = Arc::new(LocalBus::default());
        let config = OrchestratorConfig {
            resync_interval_secs: 3600,
            ..OrchestratorConfig::default()
        };
        let controller = Controller::new(store.clone(), bus.clone() as Arc<dyn Bus>, config);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(rx));

        let seed = seed_deployment(&*store, "web", 1);
        // Let the subscription exist before publishing
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(crate::bus::Event {
            subject: "deployment.created".into(),
            entity: EntityKind::Deployment,
            id: seed.deployment.id,
            op: crate::model::ChangeOp::Created,
            seq: 1,
        })
        .unwrap();

        let mut created = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !store.list_instances_for_deployment(seed.deployment.id).unwrap().is_empty() {
                created = true;
                break;
            }
        }
        assert!(created);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
