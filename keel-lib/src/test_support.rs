// SPDX-License-Identifier: GPL-2.0-only
//! Fixtures shared by unit and integration tests.

use crate::bus::{Bus, BusError, Event, LocalBus, Subscription};
use crate::id::Id;
use crate::model::{
    App, Build, BuildStatus, CreateAppParams, CreateBuildParams, CreateDeploymentParams,
    CreateImageParams, Deployment, Image, InstanceStatus, RegisterServerParams, Server,
};
use crate::runtime::{RuntimeError, RuntimeKind, VmHandle, VmRuntime, VmSpec, VmStatusReport};
use crate::store::traits::StateStore;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory runtime. VMs "run" until stopped or crashed.
#[derive(Default)]
pub struct FakeRuntime {
    vms: Mutex<BTreeMap<Id, VmHandle>>,
    creates: AtomicUsize,
    stops: AtomicUsize,
    fail_creates: AtomicBool,
    failing_stops: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` stops fail.
    pub fn fail_stops(&self, n: u32) {
        self.failing_stops.store(n, Ordering::SeqCst);
    }

    /// The VM process dies without anyone asking.
    pub fn crash(&self, vm_id: Id) {
        self.vms.lock().unwrap().remove(&vm_id);
    }

    pub fn running(&self) -> Vec<VmHandle> {
        self.vms.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl VmRuntime for FakeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Firecracker
    }

    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Spawn("fake boot failure".into()));
        }
        // Yield so concurrent callers interleave
        tokio::task::yield_now().await;
        let handle = VmHandle {
            vm_id: spec.vm.id,
            instance_id: spec.vm.instance_id,
            pid: Some(10_000 + self.create_calls() as u32),
            tap_device: Some(crate::runtime::network::tap_name(spec.vm.id)),
        };
        self.vms.lock().unwrap().insert(handle.vm_id, handle.clone());
        Ok(handle)
    }

    async fn stop(&self, handle: &VmHandle) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_stops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuntimeError::Stop(format!("vm {} would not stop", handle.vm_id)));
        }
        self.vms.lock().unwrap().remove(&handle.vm_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmHandle>, RuntimeError> {
        Ok(self.running())
    }

    async fn status(&self, vm_id: Id) -> Result<Option<VmStatusReport>, RuntimeError> {
        Ok(self.vms.lock().unwrap().get(&vm_id).map(|h| VmStatusReport {
            vm_id,
            pid: h.pid,
            alive: true,
        }))
    }
}

/// A bus that refuses every publish.
pub struct FailingBus;

impl Bus for FailingBus {
    fn publish(&self, _event: Event) -> Result<(), BusError> {
        Err(BusError::Rejected("refusing everything".into()))
    }

    fn subscribe(&self, patterns: &[&str]) -> Subscription {
        // Closed straight away
        LocalBus::new(1).subscribe(patterns)
    }
}

/// A bus that accepts every publish but silently loses them while
/// `dropping` is set.
#[derive(Default)]
pub struct LossyBus {
    inner: LocalBus,
    dropping: AtomicBool,
    dropped: AtomicUsize,
}

impl LossyBus {
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Bus for LossyBus {
    fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.dropping.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.inner.publish(event)
    }

    fn subscribe(&self, patterns: &[&str]) -> Subscription {
        self.inner.subscribe(patterns)
    }
}

/// Rows behind one ready-to-schedule deployment.
#[derive(Debug, Clone)]
pub struct Seed {
    pub image: Image,
    pub build: Build,
    pub app: App,
    pub server: Server,
    pub deployment: Deployment,
}

pub fn seed_image<S: StateStore + ?Sized>(store: &S, tag: &str) -> Image {
    store
        .create_image(&CreateImageParams {
            registry: "registry.example.com".into(),
            repository: "apps/web".into(),
            tag: tag.into(),
            digest: format!("sha256:{}", Id::generate().encode()),
        })
        .unwrap()
}

pub fn seed_server<S: StateStore + ?Sized>(store: &S, name: &str, ip_range: &str) -> Server {
    store
        .register_server(&RegisterServerParams {
            name: name.into(),
            ip_range: ip_range.into(),
            max_instances: 8,
        })
        .unwrap()
}

/// An app `name` with a succeeded build, a registered `node-a` and a
/// pending deployment of `replicas`.
pub fn seed_deployment<S: StateStore + ?Sized>(store: &S, name: &str, replicas: u32) -> Seed {
    let image = seed_image(store, "v1");
    let build = store
        .create_build(&CreateBuildParams {
            commit_sha: "0123abcd".into(),
            image_id: None,
        })
        .unwrap();
    store
        .set_build_status(build.id, BuildStatus::Succeeded, Some(image.id), None)
        .unwrap();
    let build = store.get_build(build.id).unwrap().unwrap();
    let app = store
        .create_app(&CreateAppParams {
            name: name.into(),
            domain: Some(format!("{name}.example.com")),
        })
        .unwrap();
    let server = seed_server(store, "node-a", "10.80.0.0/16");
    let deployment = store
        .create_deployment(&CreateDeploymentParams {
            app_id: app.id,
            build_id: build.id,
            replicas,
            vcpus: 1,
            memory_mib: 128,
            port: 8080,
            env: vec!["GREETING=hello".into()],
        })
        .unwrap();
    Seed {
        image,
        build,
        app,
        server,
        deployment,
    }
}

/// Walk a scheduled instance through starting to running.
pub fn set_instance_running<S: StateStore + ?Sized>(store: &S, id: Id) {
    store
        .transition_instance(id, &[InstanceStatus::Scheduled], InstanceStatus::Starting)
        .unwrap();
    store
        .transition_instance(id, &[InstanceStatus::Starting], InstanceStatus::Running)
        .unwrap();
}

/// A running keeld for integration tests. Runs the feed and orchestrator
/// roles against a temp database and stops the daemon on drop.
pub struct TestDaemon {
    child: Child,
    pub addr: String,
    pub port: u16,
    pub db_path: PathBuf,
    _tmp_dir: tempfile::TempDir,
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::start_with_binary(Self::find_keeld_binary()).await
    }

    /// Start with an explicit binary path (for cross-package tests).
    pub async fn start_with_binary(binary: PathBuf) -> Self {
        let port = free_port();
        let addr = format!("127.0.0.1:{port}");

        let tmp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let db_path = tmp_dir.path().join("keel.db");
        let config_path = tmp_dir.path().join("keel.yaml");
        let config_yaml = format!(
            "api:\n  listen: \"{addr}\"\nmetadata:\n  listen: \"127.0.0.1\"\n  port: {}\nroles: [feed, orchestrator]\nagent:\n  routes_file: \"{}\"\n",
            free_port(),
            tmp_dir.path().join("routes.json").display()
        );
        std::fs::write(&config_path, config_yaml).expect("failed to write test config");

        let child = Command::new(&binary)
            .env("RUST_LOG", "info")
            .arg("--config")
            .arg(&config_path)
            .arg("--db")
            .arg(&db_path)
            .spawn()
            .unwrap_or_else(|e| panic!("failed to start {}: {e}", binary.display()));

        let daemon = TestDaemon {
            child,
            addr,
            port,
            db_path,
            _tmp_dir: tmp_dir,
        };
        daemon.wait_ready().await;
        daemon
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn health_url(&self) -> String {
        self.url("/v1/health")
    }

    async fn wait_ready(&self) {
        let client = reqwest::Client::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if client.get(self.health_url()).send().await.is_ok() {
                return;
            }
        }
        panic!("daemon did not become ready within 5 seconds on {}", self.addr);
    }

    /// The keeld binary next to the test binary.
    fn find_keeld_binary() -> PathBuf {
        let mut path = std::env::current_exe().expect("cannot get test binary path");
        path.pop(); // test-<hash>
        path.pop(); // deps
        path.join("keeld")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
        let _ = self.child.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind to port 0");
    listener.local_addr().unwrap().port()
}
