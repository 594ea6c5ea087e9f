// SPDX-License-Identifier: GPL-2.0-only
use crate::guest::Guest;
use anyhow::{bail, Context, Result};
use keel_protocol::BootConfig;
use std::net::Ipv4Addr;
use tracing::info;

/// The VM's single virtio-net device.
pub const INTERFACE: &str = "eth0";

/// Parse `a.b.c.d/prefix`.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .with_context(|| format!("address {cidr} has no prefix length"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid address in {cidr}"))?;
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("invalid prefix length in {cidr}"))?;
    if prefix > 32 {
        bail!("invalid prefix length in {cidr}");
    }
    Ok((addr, prefix))
}

pub fn netmask(prefix: u8) -> Ipv4Addr {
    match prefix {
        0 => Ipv4Addr::UNSPECIFIED,
        p => Ipv4Addr::from(u32::MAX << (32 - p as u32)),
    }
}

/// Loopback, then the VM address and a default route via the gateway.
pub fn configure<G: Guest + ?Sized>(guest: &G, boot: &BootConfig) -> Result<()> {
    let (addr, prefix) = parse_cidr(&boot.ip_addr)?;
    let gateway: Ipv4Addr = boot
        .ip_gw
        .parse()
        .with_context(|| format!("invalid gateway {}", boot.ip_gw))?;

    guest.configure_interface("lo", Ipv4Addr::LOCALHOST, netmask(8))?;
    guest.configure_interface(INTERFACE, addr, netmask(prefix))?;
    guest.add_default_route(gateway)?;
    info!(interface = INTERFACE, addr = %addr, prefix, gateway = %gateway, "network configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_and_netmask() {
        assert_eq!(parse_cidr("10.80.0.2/30").unwrap(), (Ipv4Addr::new(10, 80, 0, 2), 30));
        assert!(parse_cidr("10.80.0.2").is_err());
        assert!(parse_cidr("10.80.0.2/33").is_err());
        assert!(parse_cidr("nope/30").is_err());

        assert_eq!(netmask(30), Ipv4Addr::new(255, 255, 255, 252));
        assert_eq!(netmask(8), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(netmask(32), Ipv4Addr::BROADCAST);
        assert_eq!(netmask(0), Ipv4Addr::UNSPECIFIED);
    }
}
