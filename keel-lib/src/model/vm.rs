// SPDX-License-Identifier: GPL-2.0-only
use super::string_enum;
use crate::id::Id;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

string_enum! {
    pub enum VmStatus {
        Pending => "pending",
        Starting => "starting",
        Running => "running",
        Stopping => "stopping",
        Failed => "failed",
    }
}

/// A micro-VM and its reserved subnet. The row is the subnet reservation:
/// soft-deleting it releases the range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: Id,
    pub instance_id: Id,
    pub server_id: Id,
    pub image_id: Id,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub port: u16,
    pub status: VmStatus,
    pub subnet: String,
    pub guest_ip: String,
    pub gateway_ip: String,
    pub tap_device: Option<String>,
    pub pid: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// A VM row to insert. Addresses are derived from `subnet`.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub instance_id: Id,
    pub server_id: Id,
    pub image_id: Id,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub port: u16,
    pub subnet: Ipv4Network,
}

impl NewVm {
    /// First host address; lives on the host side of the tap.
    pub fn gateway_ip(&self) -> Ipv4Addr {
        host_addr(&self.subnet, 1)
    }

    pub fn guest_ip(&self) -> Ipv4Addr {
        host_addr(&self.subnet, 2)
    }

    /// Inclusive integer bounds used by the overlap constraint.
    pub fn bounds(&self) -> (i64, i64) {
        subnet_bounds(&self.subnet)
    }
}

fn host_addr(subnet: &Ipv4Network, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()).wrapping_add(n))
}

pub fn subnet_bounds(subnet: &Ipv4Network) -> (i64, i64) {
    (
        u32::from(subnet.network()) as i64,
        u32::from(subnet.broadcast()) as i64,
    )
}
