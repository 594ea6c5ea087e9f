// SPDX-License-Identifier: GPL-2.0-only
use crate::id::Id;
use serde::{Deserialize, Serialize};

/// Owner of deployments and of the public domain routed to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Id,
    pub name: String,
    pub domain: Option<String>,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppParams {
    pub name: String,
    pub domain: Option<String>,
}
