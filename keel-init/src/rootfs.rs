// SPDX-License-Identifier: GPL-2.0-only
use crate::guest::Guest;
use anyhow::{Context, Result};
use keel_protocol::{ImageConfig, IMAGE_CONFIG_PATH};
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};

/// Second virtio-blk drive: the per-VM copy of the application image.
pub const APP_DEVICE: &str = "/dev/vdb";
pub const NEW_ROOT: &str = "/mnt/app";
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
pub const NAMESERVER: &str = "1.1.1.1";

/// Pseudo filesystems carried into the application root, in mount order.
/// The cgroup2 hierarchy sits below /sys and moves with it.
const EARLY_MOUNTS: [(&str, &str, &str); 4] = [
    ("proc", "/proc", "proc"),
    ("devtmpfs", "/dev", "devtmpfs"),
    ("sysfs", "/sys", "sysfs"),
    ("cgroup2", "/sys/fs/cgroup", "cgroup2"),
];

const MOVED: [&str; 3] = ["/proc", "/dev", "/sys"];

pub fn mount_early<G: Guest + ?Sized>(guest: &G) -> Result<()> {
    for (source, target, fstype) in EARLY_MOUNTS {
        let target = Path::new(target);
        guest.create_dir_all(target)?;
        let flags = match fstype {
            "devtmpfs" => MsFlags::MS_NOSUID,
            _ => MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        };
        guest.mount(source, target, fstype, flags, None)?;
    }
    Ok(())
}

pub fn mount_app<G: Guest + ?Sized>(guest: &G, device: &str, new_root: &Path) -> Result<()> {
    guest.create_dir_all(new_root)?;
    guest.mount(device, new_root, "ext4", MsFlags::empty(), None)
}

pub fn load_image_config<G: Guest + ?Sized>(guest: &G, new_root: &Path) -> Result<ImageConfig> {
    let path = new_root.join(IMAGE_CONFIG_PATH.trim_start_matches('/'));
    let contents = guest.read_file(&path)?;
    serde_yml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Make `new_root` the root filesystem, taking the pseudo filesystems
/// along. Leaves the working directory at the new `/`.
pub fn switch_root<G: Guest + ?Sized>(guest: &G, new_root: &Path) -> Result<()> {
    for dir in MOVED {
        let target = under(new_root, dir);
        guest.create_dir_all(&target)?;
        guest.move_mount(Path::new(dir), &target)?;
    }
    guest.chdir(new_root)?;
    guest.move_mount(new_root, Path::new("/"))?;
    guest.chroot(Path::new("."))?;
    guest.chdir(Path::new("/"))
}

pub fn write_resolv_conf<G: Guest + ?Sized>(guest: &G) -> Result<()> {
    guest.create_dir_all(Path::new("/etc"))?;
    guest.write_file(Path::new(RESOLV_CONF), &format!("nameserver {NAMESERVER}\n"))
}

fn under(root: &Path, absolute: &str) -> PathBuf {
    root.join(absolute.trim_start_matches('/'))
}
