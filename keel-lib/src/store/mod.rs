// SPDX-License-Identifier: GPL-2.0-only
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteStore;
pub use traits::{DbStatus, StateStore, StoreError};

/// Milliseconds since the Unix epoch; the unit of every stored timestamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
