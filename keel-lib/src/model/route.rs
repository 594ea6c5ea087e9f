// SPDX-License-Identifier: GPL-2.0-only
use crate::id::Id;
use serde::{Deserialize, Serialize};

/// One row of the `routes` view: a public domain served by a running VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub domain: String,
    pub app_id: Id,
    pub instance_id: Id,
    pub server_id: Id,
    pub ip: String,
    pub port: u16,
}
