// SPDX-License-Identifier: GPL-2.0-only
//! Entity records owned by the store.
//!
//! Timestamps are milliseconds since the Unix epoch. Every entity carries
//! `deleted_at`: rows are soft-deleted, never removed.

pub mod app;
pub mod build;
pub mod change;
pub mod deployment;
pub mod image;
pub mod instance;
pub mod route;
pub mod server;
pub mod vm;

pub use app::{App, CreateAppParams};
pub use build::{Build, BuildStatus, CreateBuildParams};
pub use change::{ChangeOp, ChangeRecord, EntityKind};
pub use deployment::{CreateDeploymentParams, Deployment, DeploymentStatus};
pub use image::{CreateImageParams, Image};
pub use instance::{Instance, InstanceStatus};
pub use route::Route;
pub use server::{RegisterServerParams, Server, ServerStatus};
pub use vm::{NewVm, Vm, VmStatus};

/// Declares a lowercase string-backed enum usable as a TEXT column.
macro_rules! string_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "lowercase")]
        $vis enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    _ => Err(format!("invalid {}: '{s}'", stringify!($name))),
                }
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| rusqlite::types::FromSqlError::Other(e.into()))
            }
        }
    };
}

pub(crate) use string_enum;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for s in ["pending", "scheduled", "starting", "running", "stopping", "stopped", "failed"] {
            let status: InstanceStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("exploded".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&DeploymentStatus::Superseded).unwrap();
        assert_eq!(json, "\"superseded\"");
    }
}
