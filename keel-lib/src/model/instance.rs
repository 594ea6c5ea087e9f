// SPDX-License-Identifier: GPL-2.0-only
use super::string_enum;
use crate::id::Id;
use serde::{Deserialize, Serialize};

string_enum! {
    /// pending → scheduled → starting → running → (stopping → stopped) | failed.
    /// The only backwards edge is failed → pending, taken by the orchestrator.
    pub enum InstanceStatus {
        Pending => "pending",
        Scheduled => "scheduled",
        Starting => "starting",
        Running => "running",
        Stopping => "stopping",
        Stopped => "stopped",
        Failed => "failed",
    }
}

impl InstanceStatus {
    /// Counts towards a deployment's replicas.
    pub fn is_live(&self) -> bool {
        !matches!(self, InstanceStatus::Stopping | InstanceStatus::Stopped)
    }

    /// Holds (or is about to hold) a VM on its server.
    pub fn occupies_server(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Scheduled
                | InstanceStatus::Starting
                | InstanceStatus::Running
                | InstanceStatus::Stopping
        )
    }

    /// Desired to have a VM on its server.
    pub fn wants_vm(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Scheduled | InstanceStatus::Starting | InstanceStatus::Running
        )
    }
}

/// One desired running copy of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Id,
    pub deployment_id: Id,
    pub image_id: Id,
    pub server_id: Option<Id>,
    pub status: InstanceStatus,
    /// Last failure reason, kept for the dashboard across retries.
    pub error: Option<String>,
    pub attempts: u32,
    pub failed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}
