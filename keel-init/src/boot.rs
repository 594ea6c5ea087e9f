// SPDX-License-Identifier: GPL-2.0-only
//! The boot sequence, from bare kernel to the application's `execve`.

use crate::guest::Guest;
use crate::{env, metadata, net, rootfs};
use anyhow::{anyhow, bail, Context, Result};
use keel_protocol::BootConfig;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use tracing::info;

/// Where the sequence finds its inputs.
#[derive(Debug, Clone)]
pub struct Layout {
    pub cmdline: PathBuf,
    pub app_device: String,
    pub new_root: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            cmdline: PathBuf::from("/proc/cmdline"),
            app_device: rootfs::APP_DEVICE.to_string(),
            new_root: PathBuf::from(rootfs::NEW_ROOT),
        }
    }
}

/// Runs every step in order and hands the VM to the application. Any
/// failure stops the sequence before exec.
pub async fn boot<G: Guest + ?Sized>(guest: &G, layout: &Layout) -> Result<Infallible> {
    rootfs::mount_early(guest)?;
    rootfs::mount_app(guest, &layout.app_device, &layout.new_root)?;

    let cmdline = guest.read_file(&layout.cmdline)?;
    let config = BootConfig::from_cmdline(&cmdline).context("invalid boot config")?;
    info!(app = %config.app_id, "boot config loaded");

    let image = rootfs::load_image_config(guest, &layout.new_root)?;
    let ids = image.ids().map_err(|e| anyhow!(e))?;

    net::configure(guest, &config)?;

    let app_env = metadata::fetch_env(&config.metadata_url, &config.metadata_token).await?;
    info!(vars = app_env.len(), "application environment received");

    guest.sethostname(&config.app_id)?;
    rootfs::switch_root(guest, &layout.new_root)?;
    guest.chdir(Path::new(image.workdir()))?;
    rootfs::write_resolv_conf(guest)?;

    let env = env::merge(&image.env, &app_env);
    let argv = image.argv();
    let program = resolve_entrypoint(guest, &argv, &env)?;

    if let Some((uid, gid)) = ids {
        guest.set_ids(uid, gid)?;
    }

    info!(program = %program.display(), "starting application");
    guest.exec(&program, &argv, &env)
}

/// Locate `argv[0]`. Names with a slash are taken as paths; bare names
/// are looked up along PATH.
pub fn resolve_entrypoint<G: Guest + ?Sized>(
    guest: &G,
    argv: &[String],
    env: &[String],
) -> Result<PathBuf> {
    let Some(name) = argv.first().filter(|n| !n.is_empty()) else {
        bail!("image config has no entrypoint or cmd");
    };
    if name.contains('/') {
        return Ok(PathBuf::from(name));
    }
    let search = env::lookup(env, "PATH").unwrap_or(env::DEFAULT_PATH);
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| guest.exists(candidate))
        .ok_or_else(|| anyhow!("{name} not found in PATH {search}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::mount::MsFlags;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};
    use std::net::Ipv4Addr;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records every operation; files and executables live in memory.
    #[derive(Default)]
    struct FakeGuest {
        ops: RefCell<Vec<String>>,
        files: RefCell<HashMap<PathBuf, String>>,
        executables: HashSet<PathBuf>,
    }

    impl FakeGuest {
        fn record(&self, op: String) {
            self.ops.borrow_mut().push(op);
        }

        fn ops(&self) -> Vec<String> {
            self.ops.borrow().clone()
        }

        fn position(&self, prefix: &str) -> usize {
            self.ops()
                .iter()
                .position(|op| op.starts_with(prefix))
                .unwrap_or_else(|| panic!("no operation starting with {prefix:?}"))
        }
    }

    impl Guest for FakeGuest {
        fn read_file(&self, path: &Path) -> Result<String> {
            self.files
                .borrow()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("no such file {}", path.display()))
        }

        fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
            self.record(format!("write {}", path.display()));
            self.files.borrow_mut().insert(path.to_path_buf(), contents.to_string());
            Ok(())
        }

        fn create_dir_all(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn exists(&self, path: &Path) -> bool {
            self.executables.contains(path)
        }

        fn mount(&self, _: &str, target: &Path, fstype: &str, _: MsFlags, _: Option<&str>) -> Result<()> {
            self.record(format!("mount {fstype} {}", target.display()));
            Ok(())
        }

        fn move_mount(&self, source: &Path, target: &Path) -> Result<()> {
            self.record(format!("move {} {}", source.display(), target.display()));
            Ok(())
        }

        fn chroot(&self, path: &Path) -> Result<()> {
            self.record(format!("chroot {}", path.display()));
            Ok(())
        }

        fn chdir(&self, path: &Path) -> Result<()> {
            self.record(format!("chdir {}", path.display()));
            Ok(())
        }

        fn sethostname(&self, name: &str) -> Result<()> {
            self.record(format!("hostname {name}"));
            Ok(())
        }

        fn configure_interface(&self, name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
            self.record(format!("ifconfig {name} {addr} {netmask}"));
            Ok(())
        }

        fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()> {
            self.record(format!("route default {gateway}"));
            Ok(())
        }

        fn set_ids(&self, uid: u32, gid: u32) -> Result<()> {
            self.record(format!("ids {uid}:{gid}"));
            Ok(())
        }

        fn exec(&self, program: &Path, argv: &[String], env: &[String]) -> Result<Infallible> {
            self.record(format!("exec {} [{}] [{}]", program.display(), argv.join(" "), env.join(" ")));
            bail!("exec is not available in tests")
        }
    }

    const IMAGE_YAML: &str = "\
entrypoint: [server]
cmd: [--port, \"8080\"]
workdir: /srv
user: \"1000:1000\"
env: [PORT=3000, MODE=production]
";

    fn guest_for(metadata_url: &str) -> FakeGuest {
        let boot = BootConfig {
            app_id: "web".to_string(),
            ip_addr: "10.80.0.2/30".to_string(),
            ip_gw: "10.80.0.1".to_string(),
            metadata_url: metadata_url.to_string(),
            metadata_token: "tok".to_string(),
        };
        let guest = FakeGuest {
            executables: [PathBuf::from("/usr/bin/server")].into_iter().collect(),
            ..Default::default()
        };
        guest.files.borrow_mut().insert(
            PathBuf::from("/proc/cmdline"),
            format!("console=ttyS0 reboot=k {} quiet", boot.to_cmdline_param().unwrap()),
        );
        guest
            .files
            .borrow_mut()
            .insert(PathBuf::from("/mnt/app/keel/image.yaml"), IMAGE_YAML.to_string());
        guest
    }

    async fn metadata_server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/metadata"))
            .and(query_param("token", "tok"))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_json(serde_json::json!({ "env": ["PORT=8080", "SECRET=s3cr3t"] })),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn boots_in_order_and_execs_the_app() {
        let server = metadata_server(200).await;
        let guest = guest_for(&format!("{}/v1/metadata", server.uri()));

        let err = boot(&guest, &Layout::default()).await.unwrap_err();
        assert!(err.to_string().contains("not available in tests"));

        let order = [
            "mount proc /proc",
            "mount devtmpfs /dev",
            "mount sysfs /sys",
            "mount cgroup2 /sys/fs/cgroup",
            "mount ext4 /mnt/app",
            "ifconfig lo 127.0.0.1",
            "ifconfig eth0 10.80.0.2 255.255.255.252",
            "route default 10.80.0.1",
            "hostname web",
            "move /proc /mnt/app/proc",
            "move /mnt/app /",
            "chroot .",
            "chdir /srv",
            "write /etc/resolv.conf",
            "ids 1000:1000",
            "exec ",
        ];
        let positions: Vec<usize> = order.iter().map(|op| guest.position(op)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", guest.ops());

        let exec = guest.ops().last().cloned().unwrap();
        assert!(exec.starts_with("exec /usr/bin/server [server --port 8080]"));
        assert!(exec.contains("PORT=8080"));
        assert!(!exec.contains("PORT=3000"));
        assert!(exec.contains("MODE=production"));
        assert!(exec.contains("SECRET=s3cr3t"));
        assert!(exec.contains("PATH="));

        assert_eq!(
            guest.read_file(Path::new("/etc/resolv.conf")).unwrap(),
            "nameserver 1.1.1.1\n"
        );
    }

    #[tokio::test]
    async fn refused_metadata_stops_before_exec() {
        let server = metadata_server(403).await;
        let guest = guest_for(&format!("{}/v1/metadata", server.uri()));

        let err = boot(&guest, &Layout::default()).await.unwrap_err();
        assert!(err.to_string().contains("403"));
        assert!(!guest.ops().iter().any(|op| op.starts_with("exec")));
        assert!(!guest.ops().iter().any(|op| op.starts_with("chroot")));
    }

    #[tokio::test]
    async fn missing_boot_config_is_fatal() {
        let guest = guest_for("http://127.0.0.1:9/v1/metadata");
        guest
            .files
            .borrow_mut()
            .insert(PathBuf::from("/proc/cmdline"), "console=ttyS0".to_string());

        assert!(boot(&guest, &Layout::default()).await.is_err());
        assert!(!guest.ops().iter().any(|op| op.starts_with("ifconfig")));
    }

    #[test]
    fn entrypoint_resolution() {
        let guest = FakeGuest {
            executables: [PathBuf::from("/app/bin/server")].into_iter().collect(),
            ..Default::default()
        };
        let env = vec!["PATH=/usr/bin:/app/bin".to_string()];

        let found = resolve_entrypoint(&guest, &["server".to_string()], &env).unwrap();
        assert_eq!(found, PathBuf::from("/app/bin/server"));

        let absolute = resolve_entrypoint(&guest, &["/opt/run".to_string()], &env).unwrap();
        assert_eq!(absolute, PathBuf::from("/opt/run"));

        assert!(resolve_entrypoint(&guest, &["missing".to_string()], &env).is_err());
        assert!(resolve_entrypoint(&guest, &[], &env).is_err());
    }
}
