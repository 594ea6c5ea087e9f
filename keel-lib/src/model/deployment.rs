// SPDX-License-Identifier: GPL-2.0-only
use super::string_enum;
use crate::id::Id;
use serde::{Deserialize, Serialize};

string_enum! {
    pub enum DeploymentStatus {
        Pending => "pending",
        Deploying => "deploying",
        Active => "active",
        Failed => "failed",
        Superseded => "superseded",
    }
}

/// Desired shape of an app revision: which build, how many replicas and
/// what each replica gets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Id,
    pub app_id: Id,
    pub build_id: Id,
    pub replicas: u32,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub port: u16,
    /// `KEY=VALUE` entries handed to guests through the metadata endpoint.
    pub env: Vec<String>,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Deployment {
    /// Deleted and superseded deployments want no instances.
    pub fn desired_replicas(&self) -> u32 {
        if self.is_retired() {
            0
        } else {
            self.replicas
        }
    }

    /// Deleted or superseded: wants no instances, whatever `replicas` says.
    pub fn is_retired(&self) -> bool {
        self.deleted_at.is_some() || self.status == DeploymentStatus::Superseded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentParams {
    pub app_id: Id,
    pub build_id: Id,
    pub replicas: u32,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub port: u16,
    #[serde(default)]
    pub env: Vec<String>,
}
