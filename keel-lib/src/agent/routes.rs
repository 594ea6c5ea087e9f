// SPDX-License-Identifier: GPL-2.0-only
use crate::id::Id;
use crate::model::Route;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteTarget {
    pub ip: String,
    pub port: u16,
    pub instance_id: Id,
}

/// Domain to backends, as read by the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub routes: BTreeMap<String, Vec<RouteTarget>>,
}

impl RouteTable {
    pub fn from_routes(rows: impl IntoIterator<Item = Route>) -> Self {
        let mut routes: BTreeMap<String, Vec<RouteTarget>> = BTreeMap::new();
        for row in rows {
            routes.entry(row.domain).or_default().push(RouteTarget {
                ip: row.ip,
                port: row.port,
                instance_id: row.instance_id,
            });
        }
        for targets in routes.values_mut() {
            targets.sort();
            targets.dedup();
        }
        RouteTable { routes }
    }

    pub fn lookup(&self, domain: &str) -> &[RouteTarget] {
        self.routes.get(domain).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Holds the current table, hands snapshots to readers and mirrors
/// changes to a JSON file.
pub struct RoutePublisher {
    tx: watch::Sender<Arc<RouteTable>>,
    path: Option<PathBuf>,
}

impl RoutePublisher {
    pub fn new(path: Option<PathBuf>) -> Self {
        let (tx, _) = watch::channel(Arc::new(RouteTable::default()));
        RoutePublisher { tx, path }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<RouteTable> {
        self.tx.borrow().clone()
    }

    /// Replace the table. Returns false, and writes nothing, when it is unchanged.
    pub fn publish(&self, table: RouteTable) -> std::io::Result<bool> {
        if *self.tx.borrow().as_ref() == table {
            return Ok(false);
        }
        if let Some(path) = &self.path {
            write_atomic(path, &table)?;
        }
        self.tx.send_replace(Arc::new(table));
        Ok(true)
    }
}

/// Write to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, table: &RouteTable) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_vec_pretty(table).map_err(std::io::Error::other)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, &json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
