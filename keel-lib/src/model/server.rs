// SPDX-License-Identifier: GPL-2.0-only
use super::string_enum;
use crate::id::Id;
use serde::{Deserialize, Serialize};

string_enum! {
    pub enum ServerStatus {
        Active => "active",
        Draining => "draining",
    }
}

/// A physical node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: Id,
    pub name: String,
    /// CIDR the node carves VM subnets from.
    pub ip_range: String,
    pub max_instances: u32,
    pub status: ServerStatus,
    pub heartbeat_at: Option<i64>,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl Server {
    /// Accepting new instances: active, not deleted and heartbeating.
    pub fn is_schedulable(&self, now_ms: i64, heartbeat_timeout_ms: i64) -> bool {
        self.status == ServerStatus::Active
            && self.deleted_at.is_none()
            && self
                .heartbeat_at
                .is_some_and(|hb| now_ms.saturating_sub(hb) <= heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServerParams {
    pub name: String,
    pub ip_range: String,
    pub max_instances: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(heartbeat_at: Option<i64>) -> Server {
        Server {
            id: Id::from_i64(1),
            name: "n1".into(),
            ip_range: "10.0.0.0/24".into(),
            max_instances: 4,
            status: ServerStatus::Active,
            heartbeat_at,
            created_at: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn stale_heartbeat_is_not_schedulable() {
        assert!(server(Some(9_000)).is_schedulable(10_000, 5_000));
        assert!(!server(Some(1_000)).is_schedulable(10_000, 5_000));
        assert!(!server(None).is_schedulable(10_000, 5_000));
    }

    #[test]
    fn draining_is_not_schedulable() {
        let mut s = server(Some(10_000));
        s.status = ServerStatus::Draining;
        assert!(!s.is_schedulable(10_000, 5_000));
    }
}
