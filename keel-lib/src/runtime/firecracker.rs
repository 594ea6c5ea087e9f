// SPDX-License-Identifier: GPL-2.0-only
use super::metadata::{hash_token, mint_token};
use super::network::NetworkService;
use super::{RuntimeError, RuntimeKind, VmHandle, VmRuntime, VmSpec, VmStatusReport};
use crate::config::{self, Config, FirecrackerConfig, RuntimeConfig};
use crate::id::Id;
use crate::model::Vm;
use crate::store::traits::StateStore;
use ipnetwork::Ipv4Network;
use keel_protocol::{BootConfig, METADATA_PATH};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::json;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

const HANDLE_FILE: &str = "vm.json";
const PID_FILE: &str = "firecracker.pid";
const API_SOCKET: &str = "firecracker.sock";

/// Kernel args before the boot config blob. `/dev/vda` is the node
/// rootfs carrying keel-init; the app image is `/dev/vdb`.
const BASE_BOOT_ARGS: &str =
    "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda ro init=/sbin/keel-init";

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_millis(250);
const HEALTH_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const API_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Generates the Firecracker JSON config for a VM.
pub fn firecracker_config(
    vm: &Vm,
    kernel_path: &str,
    rootfs_path: &str,
    app_disk_path: &str,
    tap_device: &str,
    boot_args: &str,
) -> serde_json::Value {
    json!({
        "boot-source": {
            "kernel_image_path": kernel_path,
            "boot_args": boot_args
        },
        "drives": [
            {
                "drive_id": "rootfs",
                "path_on_host": rootfs_path,
                "is_root_device": true,
                "is_read_only": true
            },
            {
                "drive_id": "app",
                "path_on_host": app_disk_path,
                "is_root_device": false,
                "is_read_only": false
            }
        ],
        "machine-config": {
            "vcpu_count": vm.vcpus,
            "mem_size_mib": vm.memory_mib,
            "smt": false
        },
        "network-interfaces": [
            {
                "iface_id": "eth0",
                "host_dev_name": tap_device,
                "guest_mac": guest_mac(&vm.guest_ip)
            }
        ]
    })
}

/// Locally administered MAC derived from the guest address, so it is
/// unique per live VM on the node.
pub fn guest_mac(guest_ip: &str) -> String {
    let octets = guest_ip
        .parse::<Ipv4Addr>()
        .map(|ip| ip.octets())
        .unwrap_or([0; 4]);
    format!(
        "02:FC:{:02X}:{:02X}:{:02X}:{:02X}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

pub fn boot_args(boot: &BootConfig) -> Result<String, RuntimeError> {
    let param = boot
        .to_cmdline_param()
        .map_err(|e| RuntimeError::Spawn(format!("cannot encode boot config: {e}")))?;
    Ok(format!("{BASE_BOOT_ARGS} {param}"))
}

/// Firecracker driver. One runtime directory per VM holds the config,
/// API socket, console log, pid file and the writable image copy.
pub struct FirecrackerRuntime {
    store: Arc<dyn StateStore + Send + Sync>,
    network: NetworkService,
    firecracker: FirecrackerConfig,
    runtime: RuntimeConfig,
    metadata_port: u16,
    vms_dir: PathBuf,
}

impl FirecrackerRuntime {
    pub fn new(
        config: &Config,
        store: Arc<dyn StateStore + Send + Sync>,
    ) -> Result<Self, RuntimeError> {
        let node_range: Ipv4Network = config.node.ip_range.parse().map_err(|e| {
            RuntimeError::Spawn(format!("invalid node.ip_range {}: {e}", config.node.ip_range))
        })?;
        let network = NetworkService::new(store.clone(), config.network.clone(), node_range);
        Ok(FirecrackerRuntime {
            store,
            network,
            firecracker: config.firecracker.clone(),
            runtime: config.runtime.clone(),
            metadata_port: config.metadata.port,
            vms_dir: config::default_runtime_path().join("vms"),
        })
    }

    /// Keep runtime directories somewhere other than `$XDG_RUNTIME_DIR`.
    pub fn with_vms_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.vms_dir = dir.into();
        self
    }

    pub fn network(&self) -> &NetworkService {
        &self.network
    }

    /// Returns the runtime directory for a VM: <vms_dir>/<id>
    pub fn vm_dir(&self, vm_id: Id) -> PathBuf {
        self.vms_dir.join(vm_id.encode())
    }

    fn boot_config(&self, spec: &VmSpec, token: String) -> Result<BootConfig, RuntimeError> {
        let subnet: Ipv4Network = spec
            .vm
            .subnet
            .parse()
            .map_err(|e| RuntimeError::Spawn(format!("invalid subnet {}: {e}", spec.vm.subnet)))?;
        Ok(BootConfig {
            app_id: spec.app_id.to_string(),
            ip_addr: format!("{}/{}", spec.vm.guest_ip, subnet.prefix()),
            ip_gw: spec.vm.gateway_ip.clone(),
            metadata_url: format!(
                "http://{}:{}{}",
                spec.vm.gateway_ip, self.metadata_port, METADATA_PATH
            ),
            metadata_token: token,
        })
    }

    /// Everything after the tap exists. The caller cleans up on error.
    async fn boot(
        &self,
        spec: &VmSpec,
        dir: &Path,
        tap: &str,
    ) -> Result<VmHandle, RuntimeError> {
        let vm = &spec.vm;

        let token = mint_token();
        self.store.insert_metadata_token(vm.id, &hash_token(&token))?;
        let args = boot_args(&self.boot_config(spec, token)?)?;

        let image_src = Path::new(&self.firecracker.images_dir).join(spec.image.file_name());
        let app_disk = dir.join("app.ext4");
        copy_image(&image_src, &app_disk).await?;

        let api_sock = dir.join(API_SOCKET);
        let config_path = dir.join("config.json");
        let _ = tokio::fs::remove_file(&api_sock).await;

        let config = firecracker_config(
            vm,
            &self.firecracker.kernel,
            &self.firecracker.rootfs,
            &app_disk.to_string_lossy(),
            tap,
            &args,
        );
        let config_str = serde_json::to_string_pretty(&config)
            .map_err(|e| RuntimeError::Spawn(format!("cannot serialize config: {e}")))?;
        tokio::fs::write(&config_path, &config_str).await?;

        let log_file = std::fs::File::create(dir.join("console.log"))?;
        let log_file_err = log_file.try_clone()?;

        let mut child = Command::new(&self.firecracker.binary)
            .arg("--api-sock")
            .arg(&api_sock)
            .arg("--config-file")
            .arg(&config_path)
            .stdout(log_file)
            .stderr(log_file_err)
            .spawn()
            .map_err(|e| {
                RuntimeError::Spawn(format!(
                    "cannot spawn firecracker at '{}': {e}",
                    self.firecracker.binary
                ))
            })?;
        let pid = child.id();

        let handle = VmHandle {
            vm_id: vm.id,
            instance_id: vm.instance_id,
            pid,
            tap_device: Some(tap.to_string()),
        };
        if let Err(e) = self.persist(dir, &handle).await {
            let _ = child.kill().await;
            return Err(e);
        }
        if let Err(e) = self.store.set_vm_runtime(vm.id, Some(tap), pid) {
            let _ = child.kill().await;
            return Err(e.into());
        }

        if let Err(e) = wait_healthy(&mut child, &vm.guest_ip, vm.port, self.runtime.startup_deadline()).await {
            let _ = child.kill().await;
            return Err(e);
        }

        // Reap the process when it exits so liveness checks see it gone
        let vm_id = vm.id;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(vm_id = %vm_id, %status, "firecracker exited"),
                Err(e) => warn!(vm_id = %vm_id, error = %e, "cannot wait on firecracker"),
            }
        });

        Ok(handle)
    }

    async fn persist(&self, dir: &Path, handle: &VmHandle) -> Result<(), RuntimeError> {
        let json = serde_json::to_string_pretty(handle)
            .map_err(|e| RuntimeError::Spawn(format!("cannot serialize handle: {e}")))?;
        tokio::fs::write(dir.join(HANDLE_FILE), json).await?;
        if let Some(pid) = handle.pid {
            tokio::fs::write(dir.join(PID_FILE), pid.to_string()).await?;
        }
        Ok(())
    }

    async fn read_handle(&self, dir: &Path) -> Option<VmHandle> {
        let raw = tokio::fs::read_to_string(dir.join(HANDLE_FILE)).await.ok()?;
        let mut handle: VmHandle = match serde_json::from_str(&raw) {
            Ok(h) => h,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "unreadable vm handle");
                return None;
            }
        };
        if handle.pid.is_none() {
            handle.pid = read_pid(dir).await;
        }
        Some(handle)
    }

    /// Graceful stop, then SIGKILL. Ok when the process is gone.
    async fn terminate(&self, dir: &Path, pid: u32) -> Result<(), RuntimeError> {
        if !process_alive(pid) {
            return Ok(());
        }

        match send_ctrl_alt_del(&dir.join(API_SOCKET)).await {
            Ok(()) => {
                if wait_exit(pid, self.runtime.stop_timeout()).await {
                    return Ok(());
                }
                debug!(pid, "graceful stop timed out");
            }
            Err(e) => debug!(pid, error = %e, "graceful stop request failed"),
        }

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                return Err(RuntimeError::Stop(format!("kill {pid}: {e}")));
            }
        }
        if wait_exit(pid, KILL_GRACE).await {
            Ok(())
        } else {
            Err(RuntimeError::Stop(format!("process {pid} survived SIGKILL")))
        }
    }
}

#[async_trait::async_trait]
impl VmRuntime for FirecrackerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Firecracker
    }

    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, RuntimeError> {
        let vm = &spec.vm;
        let dir = self.vm_dir(vm.id);
        tokio::fs::create_dir_all(&dir).await?;

        let tap = match self.network.create_tap(vm) {
            Ok(tap) => tap,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e.into());
            }
        };

        match self.boot(spec, &dir, &tap).await {
            Ok(handle) => {
                info!(vm_id = %vm.id, instance_id = %vm.instance_id, pid = ?handle.pid, tap = %tap, "vm started");
                Ok(handle)
            }
            Err(e) => {
                warn!(vm_id = %vm.id, error = %e, "vm start failed, tearing down");
                let handle = VmHandle {
                    vm_id: vm.id,
                    instance_id: vm.instance_id,
                    pid: read_pid(&dir).await,
                    tap_device: Some(tap),
                };
                if let Err(stop_err) = self.stop(&handle).await {
                    warn!(vm_id = %vm.id, error = %stop_err, "teardown after failed start incomplete");
                }
                Err(e)
            }
        }
    }

    async fn stop(&self, handle: &VmHandle) -> Result<(), RuntimeError> {
        let dir = self.vm_dir(handle.vm_id);
        let pid = match handle.pid {
            Some(pid) => Some(pid),
            None => read_pid(&dir).await,
        };

        let terminated = match pid {
            Some(pid) => self.terminate(&dir, pid).await,
            None => Ok(()),
        };

        // Always release, whatever happened to the process
        let released = self.network.release(handle.vm_id, handle.tap_device.as_deref());

        // Keep the directory while the process lives so a retry can find it
        if terminated.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(vm_id = %handle.vm_id, error = %e, "cannot remove runtime dir");
                }
            }
        }

        terminated?;
        released?;
        info!(vm_id = %handle.vm_id, "vm stopped");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmHandle>, RuntimeError> {
        let mut entries = match tokio::fs::read_dir(&self.vms_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut handles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(handle) = self.read_handle(&entry.path()).await else {
                continue;
            };
            if handle.pid.is_some_and(process_alive) {
                handles.push(handle);
            }
        }
        handles.sort_by_key(|h| h.vm_id);
        Ok(handles)
    }

    async fn status(&self, vm_id: Id) -> Result<Option<VmStatusReport>, RuntimeError> {
        let Some(handle) = self.read_handle(&self.vm_dir(vm_id)).await else {
            return Ok(None);
        };
        Ok(Some(VmStatusReport {
            vm_id,
            pid: handle.pid,
            alive: handle.pid.is_some_and(process_alive),
        }))
    }
}

/// Per-VM writable copy of the image. Reflinks where the filesystem can.
async fn copy_image(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    if !tokio::fs::try_exists(src).await.unwrap_or(false) {
        return Err(RuntimeError::Spawn(format!("image {} not found", src.display())));
    }
    let output = Command::new("cp")
        .arg("--reflink=auto")
        .arg(src)
        .arg(dst)
        .output()
        .await
        .map_err(|e| RuntimeError::Spawn(format!("cannot run cp: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RuntimeError::Spawn(format!("image copy failed: {}", stderr.trim())));
    }
    Ok(())
}

/// Healthy means the app accepts TCP on its port before the deadline.
async fn wait_healthy(
    child: &mut Child,
    guest_ip: &str,
    port: u16,
    deadline: Duration,
) -> Result<(), RuntimeError> {
    let until = Instant::now() + deadline;
    let addr = format!("{guest_ip}:{port}");
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(RuntimeError::Unhealthy(format!("firecracker exited: {status}")));
        }
        if let Ok(Ok(_)) = timeout(HEALTH_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            return Ok(());
        }
        if Instant::now() >= until {
            return Err(RuntimeError::Unhealthy(format!(
                "{addr} not reachable within {}s",
                deadline.as_secs()
            )));
        }
        tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
    }
}

/// `PUT /actions {"action_type": "SendCtrlAltDel"}` on the API socket.
async fn send_ctrl_alt_del(socket: &Path) -> Result<(), RuntimeError> {
    let body = r#"{"action_type": "SendCtrlAltDel"}"#;
    let request = format!(
        "PUT /actions HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );

    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        stream.write_all(request.as_bytes()).await?;
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf[..n]).to_string())
    };
    let response = timeout(API_TIMEOUT, exchange)
        .await
        .map_err(|_| RuntimeError::Stop("api socket timed out".to_string()))??;

    let status_line = response.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) == Some("204") {
        Ok(())
    } else {
        Err(RuntimeError::Stop(format!("unexpected api response: {status_line}")))
    }
}

pub(crate) fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_exit(pid: u32, within: Duration) -> bool {
    let until = Instant::now() + within;
    while process_alive(pid) {
        if Instant::now() >= until {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
}

async fn read_pid(dir: &Path) -> Option<u32> {
    tokio::fs::read_to_string(dir.join(PID_FILE))
        .await
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Image, VmStatus};
    use crate::store::SqliteStore;

    fn test_vm() -> Vm {
        Vm {
            id: Id::from_i64(1),
            instance_id: Id::from_i64(2),
            server_id: Id::from_i64(3),
            image_id: Id::from_i64(4),
            vcpus: 2,
            memory_mib: 512,
            port: 8080,
            status: VmStatus::Pending,
            subnet: "10.80.0.4/30".to_string(),
            guest_ip: "10.80.0.6".to_string(),
            gateway_ip: "10.80.0.5".to_string(),
            tap_device: None,
            pid: None,
            created_at: 1000,
            updated_at: 1000,
            deleted_at: None,
        }
    }

    fn test_runtime(dir: &tempfile::TempDir) -> FirecrackerRuntime {
        let store = Arc::new(SqliteStore::open_and_init(&dir.path().join("fc.db")).unwrap());
        FirecrackerRuntime::new(&Config::default(), store)
            .unwrap()
            .with_vms_dir(dir.path().join("vms"))
    }

    #[test]
    fn firecracker_config_has_correct_structure() {
        let config = firecracker_config(
            &test_vm(),
            "/path/vmlinux",
            "/path/rootfs.ext4",
            "/run/app.ext4",
            "kaaaa",
            "console=ttyS0",
        );

        assert_eq!(config["boot-source"]["kernel_image_path"], "/path/vmlinux");
        assert_eq!(config["drives"][0]["drive_id"], "rootfs");
        assert_eq!(config["drives"][0]["is_root_device"], true);
        assert_eq!(config["drives"][0]["is_read_only"], true);
        assert_eq!(config["drives"][1]["path_on_host"], "/run/app.ext4");
        assert_eq!(config["drives"][1]["is_read_only"], false);
        assert_eq!(config["machine-config"]["vcpu_count"], 2);
        assert_eq!(config["machine-config"]["mem_size_mib"], 512);
        assert_eq!(config["network-interfaces"][0]["host_dev_name"], "kaaaa");
        assert_eq!(config["network-interfaces"][0]["guest_mac"], "02:FC:0A:50:00:06");
    }

    #[test]
    fn boot_args_carry_init_and_config_blob() {
        let boot = BootConfig {
            app_id: "app".to_string(),
            ip_addr: "10.80.0.6/30".to_string(),
            ip_gw: "10.80.0.5".to_string(),
            metadata_url: "http://10.80.0.5:9700/v1/metadata".to_string(),
            metadata_token: "tok".to_string(),
        };
        let args = boot_args(&boot).unwrap();
        assert!(args.contains("init=/sbin/keel-init"));
        assert_eq!(BootConfig::from_cmdline(&args).unwrap(), boot);
    }

    #[test]
    fn boot_config_points_metadata_at_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime(&dir);
        let spec = VmSpec {
            vm: test_vm(),
            image: Image {
                id: Id::from_i64(4),
                registry: "registry.local".to_string(),
                repository: "web".to_string(),
                tag: "v1".to_string(),
                digest: "sha256:abc".to_string(),
                created_at: 0,
                deleted_at: None,
            },
            app_id: Id::from_i64(9),
        };
        let boot = rt.boot_config(&spec, "secret".to_string()).unwrap();
        assert_eq!(boot.ip_addr, "10.80.0.6/30");
        assert_eq!(boot.ip_gw, "10.80.0.5");
        assert_eq!(boot.metadata_url, "http://10.80.0.5:9700/v1/metadata");
        assert_eq!(boot.app_id, Id::from_i64(9).to_string());
    }

    #[tokio::test]
    async fn list_keeps_only_live_processes() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime(&dir);

        let alive = VmHandle {
            vm_id: Id::from_i64(10),
            instance_id: Id::from_i64(11),
            pid: Some(std::process::id()),
            tap_device: None,
        };
        let dead = VmHandle {
            vm_id: Id::from_i64(12),
            instance_id: Id::from_i64(13),
            pid: Some(i32::MAX as u32),
            tap_device: None,
        };
        for h in [&alive, &dead] {
            let vm_dir = rt.vm_dir(h.vm_id);
            std::fs::create_dir_all(&vm_dir).unwrap();
            rt.persist(&vm_dir, h).await.unwrap();
        }

        assert_eq!(rt.list().await.unwrap(), vec![alive.clone()]);
        let report = rt.status(dead.vm_id).await.unwrap().unwrap();
        assert!(!report.alive);
        assert!(rt.status(Id::from_i64(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime(&dir);
        assert!(rt.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_of_missing_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_image(&dir.path().join("nope.ext4"), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
