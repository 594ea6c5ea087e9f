// SPDX-License-Identifier: GPL-2.0-only
use super::string_enum;
use crate::id::Id;
use serde::{Deserialize, Serialize};

string_enum! {
    pub enum BuildStatus {
        Pending => "pending",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed)
    }
}

/// A build of a source commit into an image. Produced externally; the
/// orchestrator only observes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Id,
    pub commit_sha: String,
    pub image_id: Option<Id>,
    pub status: BuildStatus,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBuildParams {
    pub commit_sha: String,
    pub image_id: Option<Id>,
}
