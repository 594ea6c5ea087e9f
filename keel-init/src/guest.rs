// SPDX-License-Identifier: GPL-2.0-only
//! Kernel operations the init performs, behind a trait so the boot
//! sequence can run against a recording fake in tests.

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use std::convert::Infallible;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

pub trait Guest {
    fn read_file(&self, path: &Path) -> Result<String>;
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
    /// Move a mount (with everything mounted below it) to `target`.
    fn move_mount(&self, source: &Path, target: &Path) -> Result<()>;
    fn chroot(&self, path: &Path) -> Result<()>;
    fn chdir(&self, path: &Path) -> Result<()>;
    fn sethostname(&self, name: &str) -> Result<()>;

    /// Assign an address and bring the interface up.
    fn configure_interface(&self, name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<()>;
    fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()>;

    fn set_ids(&self, uid: u32, gid: u32) -> Result<()>;

    /// Replace the process image. Only returns on failure.
    fn exec(&self, program: &Path, argv: &[String], env: &[String]) -> Result<Infallible>;
}

/// The real thing, for PID 1 inside a VM.
pub struct LinuxGuest;

impl Guest for LinuxGuest {
    fn read_file(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents).with_context(|| format!("cannot write {}", path.display()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("cannot create {}", path.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        nix::mount::mount(Some(source), target, Some(fstype), flags, data)
            .with_context(|| format!("cannot mount {source} ({fstype}) on {}", target.display()))
    }

    fn move_mount(&self, source: &Path, target: &Path) -> Result<()> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .with_context(|| format!("cannot move {} to {}", source.display(), target.display()))
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        nix::unistd::chroot(path).with_context(|| format!("cannot chroot to {}", path.display()))
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        nix::unistd::chdir(path).with_context(|| format!("cannot chdir to {}", path.display()))
    }

    fn sethostname(&self, name: &str) -> Result<()> {
        nix::unistd::sethostname(name).with_context(|| format!("cannot set hostname {name}"))
    }

    fn configure_interface(&self, name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        let sock = inet_socket()?;
        let mut req = IfReq::new(name)?;

        req.data.addr = sockaddr(addr);
        ioctl(&sock, libc::SIOCSIFADDR, &mut req)
            .with_context(|| format!("cannot set address {addr} on {name}"))?;

        req.data.addr = sockaddr(netmask);
        ioctl(&sock, libc::SIOCSIFNETMASK, &mut req)
            .with_context(|| format!("cannot set netmask {netmask} on {name}"))?;

        ioctl(&sock, libc::SIOCGIFFLAGS, &mut req)
            .with_context(|| format!("cannot read flags of {name}"))?;
        // SAFETY: SIOCGIFFLAGS filled the flags member.
        let flags = unsafe { req.data.flags };
        req.data.flags = flags | (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        ioctl(&sock, libc::SIOCSIFFLAGS, &mut req)
            .with_context(|| format!("cannot bring {name} up"))
    }

    fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()> {
        let sock = inet_socket()?;
        // SAFETY: rtentry is plain data; all-zero is a valid value.
        let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
        route.rt_dst = sockaddr(Ipv4Addr::UNSPECIFIED);
        route.rt_genmask = sockaddr(Ipv4Addr::UNSPECIFIED);
        route.rt_gateway = sockaddr(gateway);
        route.rt_flags = libc::RTF_UP | libc::RTF_GATEWAY;
        ioctl(&sock, libc::SIOCADDRT, &mut route)
            .with_context(|| format!("cannot add default route via {gateway}"))
    }

    fn set_ids(&self, uid: u32, gid: u32) -> Result<()> {
        let gid = nix::unistd::Gid::from_raw(gid);
        nix::unistd::setgroups(&[gid]).context("cannot set supplementary groups")?;
        nix::unistd::setgid(gid).with_context(|| format!("cannot set gid {gid}"))?;
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
            .with_context(|| format!("cannot set uid {uid}"))
    }

    fn exec(&self, program: &Path, argv: &[String], env: &[String]) -> Result<Infallible> {
        let program_c = cstring(program.to_string_lossy().as_ref())?;
        let argv_c = argv.iter().map(|a| cstring(a)).collect::<Result<Vec<_>>>()?;
        let env_c = env.iter().map(|e| cstring(e)).collect::<Result<Vec<_>>>()?;
        match nix::unistd::execve(&program_c, &argv_c, &env_c) {
            Ok(never) => match never {},
            Err(e) => bail!("exec {} failed: {e}", program.display()),
        }
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).with_context(|| format!("{s:?} contains a NUL byte"))
}

/// `struct ifreq` with the members used here.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    data: IfReqData,
}

#[repr(C)]
#[derive(Clone, Copy)]
union IfReqData {
    addr: libc::sockaddr,
    flags: libc::c_short,
    // Size of the kernel's union
    _pad: [u8; 24],
}

impl IfReq {
    fn new(name: &str) -> Result<Self> {
        if name.len() >= libc::IFNAMSIZ {
            bail!("interface name {name} is too long");
        }
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            data: IfReqData { _pad: [0; 24] },
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(req)
    }
}

fn sockaddr(ip: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        },
        sin_zero: [0; 8],
    };
    // SAFETY: sockaddr_in and sockaddr have the same size; the kernel
    // reads the family to interpret the rest.
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

fn inet_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the fd is owned right away.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("cannot open control socket");
    }
    // SAFETY: fd is a fresh, valid descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ioctl<T>(sock: &OwnedFd, request: libc::c_ulong, arg: &mut T) -> Result<()> {
    // SAFETY: `arg` is the structure `request` expects and outlives the call.
    let rc = unsafe { libc::ioctl(sock.as_raw_fd(), request as _, arg as *mut T) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_layout_matches_the_kernel() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
        let req = IfReq::new("eth0").unwrap();
        assert_eq!(req.name[0] as u8, b'e');
        assert_eq!(req.name[3] as u8, b'0');
        assert_eq!(req.name[4], 0);
        assert!(IfReq::new("a-very-long-interface-name").is_err());
    }

    #[test]
    fn sockaddr_is_network_order() {
        let sa = sockaddr(Ipv4Addr::new(10, 80, 0, 2));
        assert_eq!(sa.sa_family, libc::AF_INET as libc::sa_family_t);
        // sin_port (2 bytes) then the address
        assert_eq!(sa.sa_data[2..6], [10, 80, 0, 2]);
    }
}
