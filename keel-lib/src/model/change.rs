// SPDX-License-Identifier: GPL-2.0-only
use super::string_enum;
use crate::id::Id;
use serde::{Deserialize, Serialize};

string_enum! {
    /// Entity types that produce change records. Values match the
    /// `change_log.entity` column.
    pub enum EntityKind {
        Image => "image",
        Build => "build",
        App => "app",
        Deployment => "deployment",
        Instance => "instance",
        Server => "server",
        Vm => "vm",
    }
}

impl EntityKind {
    /// Bus subject prefix. Servers are published as `node`.
    pub fn subject_prefix(&self) -> &'static str {
        match self {
            EntityKind::Server => "node",
            other => other.as_str(),
        }
    }

    pub fn from_subject_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "node" => Some(EntityKind::Server),
            "server" => None,
            other => other.parse().ok(),
        }
    }
}

string_enum! {
    pub enum ChangeOp {
        Created => "created",
        Updated => "updated",
    }
}

/// A committed row change, as recorded by the store's change triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: i64,
    pub entity: EntityKind,
    pub entity_id: Id,
    pub op: ChangeOp,
    pub recorded_at: i64,
}

impl ChangeRecord {
    /// `<entity>.<op>`, e.g. `instance.updated` or `node.created`.
    pub fn subject(&self) -> String {
        format!("{}.{}", self.entity.subject_prefix(), self.op)
    }
}
