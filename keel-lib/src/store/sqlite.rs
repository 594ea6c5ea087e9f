// SPDX-License-Identifier: GPL-2.0-only
use crate::id::Id;
use crate::model::vm::subnet_bounds;
use crate::model::{
    App, Build, BuildStatus, ChangeRecord, CreateAppParams, CreateBuildParams,
    CreateDeploymentParams, CreateImageParams, Deployment, DeploymentStatus, EntityKind, Image,
    Instance, InstanceStatus, NewVm, RegisterServerParams, Route, Server, ServerStatus, Vm,
    VmStatus,
};
use crate::store::now_millis;
use crate::store::schema::{SCHEMA_SQL, SCHEMA_VERSION, SUBNET_OVERLAP};
use crate::store::traits::{
    AppStore, BuildStore, ChangeStore, DbStatus, DeploymentStore, ImageStore, InstanceStore,
    RouteStore, ServerStore, StateStore, StoreError, TokenStore, VmStore,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a writer waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// Enable WAL mode, foreign key enforcement and the busy timeout.
fn configure_connection(conn: &Connection) -> Result<(), StoreError> {
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
        .map_err(|e| StoreError::Init(format!("cannot set WAL mode: {e}")))?;
    if mode != "wal" {
        return Err(StoreError::Init(format!(
            "failed to enable WAL mode: journal_mode is '{mode}'"
        )));
    }

    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| StoreError::Init(format!("cannot enable foreign keys: {e}")))?;

    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| StoreError::Init(format!("cannot set busy timeout: {e}")))?;

    Ok(())
}

/// Classify a failed write. Trigger aborts from the subnet exclusion
/// constraint become `Exclusion`, other constraint failures `Conflict`.
fn write_error(what: &str, e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, msg) = &e {
        if msg.as_deref().is_some_and(|m| m.contains(SUBNET_OVERLAP)) {
            return StoreError::Exclusion(format!("{what}: {SUBNET_OVERLAP}"));
        }
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Conflict(format!("{what}: {e}"));
        }
    }
    StoreError::Query(format!("{what}: {e}"))
}

fn query_error(what: &str) -> impl Fn(rusqlite::Error) -> StoreError + '_ {
    move |e| StoreError::Query(format!("{what}: {e}"))
}

/// `?, ?, ?` for an IN list.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    /// Creates the parent directory if it doesn't exist.
    /// Does NOT initialize the schema — call `init()` after opening.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Init(format!("cannot create directory {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Init(format!("cannot open database {}: {e}", path.display())))?;

        configure_connection(&conn)?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    /// Open the database, initialize the schema, and handle pre-alpha migration.
    /// This is the primary entry point for production use.
    pub fn open_and_init(path: &Path) -> Result<Self, StoreError> {
        let store = Self::open(path)?;

        match store.init() {
            Ok(()) => Ok(store),
            Err(StoreError::SchemaMismatch { expected, found }) => {
                tracing::warn!(
                    expected,
                    found,
                    path = %path.display(),
                    "schema version mismatch, recreating database (pre-alpha migration)"
                );
                store.recreate()?;
                store.init()?;
                Ok(store)
            }
            Err(e) => Err(e),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Query("connection mutex poisoned".to_string()))
    }

    /// Check the stored schema version. Returns None if schema_meta doesn't exist.
    fn stored_version(&self) -> Result<Option<u32>, StoreError> {
        let conn = self.conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM schema_meta WHERE key = 'version'",
            [],
            |row| row.get(0),
        );
        Ok(result.ok().and_then(|v| v.parse().ok()))
    }

    /// Delete the database file and reopen the connection.
    fn recreate(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;

        // Swap in an in-memory connection to close the file handle
        let temp_conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Init(format!("cannot create temp connection: {e}")))?;
        drop(std::mem::replace(&mut *conn, temp_conn));

        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(self.db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(self.db_path.with_extension("db-shm"));

        let new_conn = Connection::open(&self.db_path)
            .map_err(|e| StoreError::Init(format!("cannot reopen database: {e}")))?;
        configure_connection(&new_conn)?;

        *conn = new_conn;
        Ok(())
    }

    /// Count user tables (excludes sqlite_ internal tables).
    fn table_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .map_err(query_error("cannot count tables"))
    }
}

const IMAGE_COLUMNS: &str = "id, registry, repository, tag, digest, created_at, deleted_at";

fn row_to_image(row: &Row) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        registry: row.get(1)?,
        repository: row.get(2)?,
        tag: row.get(3)?,
        digest: row.get(4)?,
        created_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

const BUILD_COLUMNS: &str = "id, commit_sha, image_id, status, error, started_at, completed_at, \
                             failed_at, created_at, updated_at, deleted_at";

fn row_to_build(row: &Row) -> rusqlite::Result<Build> {
    Ok(Build {
        id: row.get(0)?,
        commit_sha: row.get(1)?,
        image_id: row.get(2)?,
        status: row.get(3)?,
        error: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        failed_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

const APP_COLUMNS: &str = "id, name, domain, created_at, deleted_at";

fn row_to_app(row: &Row) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        created_at: row.get(3)?,
        deleted_at: row.get(4)?,
    })
}

const DEPLOYMENT_COLUMNS: &str = "id, app_id, build_id, replicas, vcpus, memory_mib, port, env, \
                                  status, error, created_at, updated_at, deleted_at";

fn row_to_deployment(row: &Row) -> rusqlite::Result<Deployment> {
    let env_json: String = row.get(7)?;
    let env = serde_json::from_str(&env_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(Deployment {
        id: row.get(0)?,
        app_id: row.get(1)?,
        build_id: row.get(2)?,
        replicas: row.get(3)?,
        vcpus: row.get(4)?,
        memory_mib: row.get(5)?,
        port: row.get(6)?,
        env,
        status: row.get(8)?,
        error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        deleted_at: row.get(12)?,
    })
}

const INSTANCE_COLUMNS: &str = "id, deployment_id, image_id, server_id, status, error, attempts, \
                                failed_at, created_at, updated_at, deleted_at";

fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: row.get(0)?,
        deployment_id: row.get(1)?,
        image_id: row.get(2)?,
        server_id: row.get(3)?,
        status: row.get(4)?,
        error: row.get(5)?,
        attempts: row.get(6)?,
        failed_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

const SERVER_COLUMNS: &str =
    "id, name, ip_range, max_instances, status, heartbeat_at, created_at, deleted_at";

fn row_to_server(row: &Row) -> rusqlite::Result<Server> {
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        ip_range: row.get(2)?,
        max_instances: row.get(3)?,
        status: row.get(4)?,
        heartbeat_at: row.get(5)?,
        created_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

const VM_COLUMNS: &str = "id, instance_id, server_id, image_id, vcpus, memory_mib, port, status, \
                          subnet, guest_ip, gateway_ip, tap_device, pid, created_at, updated_at, \
                          deleted_at";

fn row_to_vm(row: &Row) -> rusqlite::Result<Vm> {
    Ok(Vm {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        server_id: row.get(2)?,
        image_id: row.get(3)?,
        vcpus: row.get(4)?,
        memory_mib: row.get(5)?,
        port: row.get(6)?,
        status: row.get(7)?,
        subnet: row.get(8)?,
        guest_ip: row.get(9)?,
        gateway_ip: row.get(10)?,
        tap_device: row.get(11)?,
        pid: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        deleted_at: row.get(15)?,
    })
}

fn row_to_change(row: &Row) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        seq: row.get(0)?,
        entity: row.get(1)?,
        entity_id: row.get(2)?,
        op: row.get(3)?,
        recorded_at: row.get(4)?,
    })
}

fn row_to_route(row: &Row) -> rusqlite::Result<Route> {
    Ok(Route {
        domain: row.get(0)?,
        app_id: row.get(1)?,
        instance_id: row.get(2)?,
        server_id: row.get(3)?,
        ip: row.get(4)?,
        port: row.get(5)?,
    })
}

/// Fetch one row by id from `table`.
fn get_by_id<T>(
    conn: &Connection,
    table: &str,
    columns: &str,
    id: Id,
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Option<T>, StoreError> {
    conn.query_row(
        &format!("SELECT {columns} FROM {table} WHERE id = ?1"),
        [id],
        map,
    )
    .optional()
    .map_err(|e| StoreError::Query(format!("cannot read {table} row: {e}")))
}

/// Run a SELECT and collect every row.
fn query_all<T, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(query_error("cannot prepare query"))?;
    let rows = stmt
        .query_map(params, map)
        .map_err(query_error("cannot run query"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error("cannot read row"))?;
    Ok(rows)
}

impl StateStore for SqliteStore {
    fn init(&self) -> Result<(), StoreError> {
        if let Some(version) = self.stored_version()? {
            if version == SCHEMA_VERSION {
                return Ok(());
            }
            // open_and_init() handles the mismatch by recreating.
            return Err(StoreError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }

        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StoreError::Init(format!("cannot create schema: {e}")))?;

        conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES ('version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| StoreError::Init(format!("cannot insert schema version: {e}")))?;

        Ok(())
    }

    fn status(&self) -> Result<DbStatus, StoreError> {
        let table_count = self.table_count()?;
        let size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).ok();

        Ok(DbStatus {
            path: self.db_path.to_string_lossy().to_string(),
            table_count,
            size_bytes,
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        // rusqlite closes the connection on drop.
        Ok(())
    }
}

impl ImageStore for SqliteStore {
    fn create_image(&self, params: &CreateImageParams) -> Result<Image, StoreError> {
        let conn = self.conn()?;
        let id = Id::generate();
        conn.execute(
            "INSERT INTO images (id, registry, repository, tag, digest, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, params.registry, params.repository, params.tag, params.digest, now_millis()],
        )
        .map_err(|e| write_error("cannot insert image", e))?;

        get_by_id(&conn, "images", IMAGE_COLUMNS, id, row_to_image)?
            .ok_or_else(|| StoreError::Query("image not found after insert".to_string()))
    }

    fn get_image(&self, id: Id) -> Result<Option<Image>, StoreError> {
        let conn = self.conn()?;
        get_by_id(&conn, "images", IMAGE_COLUMNS, id, row_to_image)
    }
}

impl BuildStore for SqliteStore {
    fn create_build(&self, params: &CreateBuildParams) -> Result<Build, StoreError> {
        let conn = self.conn()?;
        let id = Id::generate();
        let now = now_millis();
        conn.execute(
            "INSERT INTO builds (id, commit_sha, image_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![id, params.commit_sha, params.image_id, now],
        )
        .map_err(|e| write_error("cannot insert build", e))?;

        get_by_id(&conn, "builds", BUILD_COLUMNS, id, row_to_build)?
            .ok_or_else(|| StoreError::Query("build not found after insert".to_string()))
    }

    fn get_build(&self, id: Id) -> Result<Option<Build>, StoreError> {
        let conn = self.conn()?;
        get_by_id(&conn, "builds", BUILD_COLUMNS, id, row_to_build)
    }

    fn set_build_status(
        &self,
        id: Id,
        status: BuildStatus,
        image_id: Option<Id>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let stamp = match status {
            BuildStatus::Pending => "",
            BuildStatus::Running => ", started_at = ?3",
            BuildStatus::Succeeded => ", completed_at = ?3, image_id = COALESCE(?4, image_id)",
            BuildStatus::Failed => ", failed_at = ?3, error = ?5",
        };
        let sql = format!(
            "UPDATE builds SET status = ?2, updated_at = ?3{stamp} \
             WHERE id = ?1 AND deleted_at IS NULL AND status != ?2"
        );
        // The bound parameter count must match the highest index in `sql`.
        let mut stmt = conn.prepare(&sql).map_err(query_error("cannot prepare build update"))?;
        let now = now_millis();
        let changed = match status {
            BuildStatus::Pending | BuildStatus::Running => stmt.execute(params![id, status, now]),
            BuildStatus::Succeeded => stmt.execute(params![id, status, now, image_id]),
            BuildStatus::Failed => stmt.execute(params![id, status, now, image_id, error]),
        }
        .map_err(|e| write_error("cannot update build", e))?;
        Ok(changed > 0)
    }
}

impl AppStore for SqliteStore {
    fn create_app(&self, params: &CreateAppParams) -> Result<App, StoreError> {
        let conn = self.conn()?;
        let id = Id::generate();
        conn.execute(
            "INSERT INTO apps (id, name, domain, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, params.name, params.domain, now_millis()],
        )
        .map_err(|e| write_error("cannot insert app", e))?;

        get_by_id(&conn, "apps", APP_COLUMNS, id, row_to_app)?
            .ok_or_else(|| StoreError::Query("app not found after insert".to_string()))
    }

    fn get_app(&self, id: Id) -> Result<Option<App>, StoreError> {
        let conn = self.conn()?;
        get_by_id(&conn, "apps", APP_COLUMNS, id, row_to_app)
    }
}

impl DeploymentStore for SqliteStore {
    fn create_deployment(&self, params: &CreateDeploymentParams) -> Result<Deployment, StoreError> {
        let env = serde_json::to_string(&params.env)
            .map_err(|e| StoreError::InvalidInput(format!("cannot encode env: {e}")))?;
        if let Some(bad) = params.env.iter().find(|e| !e.contains('=')) {
            return Err(StoreError::InvalidInput(format!("env entry '{bad}' is not KEY=VALUE")));
        }

        let conn = self.conn()?;
        let id = Id::generate();
        let now = now_millis();
        conn.execute(
            "INSERT INTO deployments \
             (id, app_id, build_id, replicas, vcpus, memory_mib, port, env, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)",
            params![
                id,
                params.app_id,
                params.build_id,
                params.replicas,
                params.vcpus,
                params.memory_mib,
                params.port,
                env,
                now,
            ],
        )
        .map_err(|e| write_error("cannot insert deployment", e))?;

        get_by_id(&conn, "deployments", DEPLOYMENT_COLUMNS, id, row_to_deployment)?
            .ok_or_else(|| StoreError::Query("deployment not found after insert".to_string()))
    }

    fn get_deployment(&self, id: Id) -> Result<Option<Deployment>, StoreError> {
        let conn = self.conn()?;
        get_by_id(&conn, "deployments", DEPLOYMENT_COLUMNS, id, row_to_deployment)
    }

    fn list_deployments_for_build(&self, build_id: Id) -> Result<Vec<Deployment>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
                 WHERE build_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id"
            ),
            [build_id],
            row_to_deployment,
        )
    }

    fn list_deployments_for_app(&self, app_id: Id) -> Result<Vec<Deployment>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
                 WHERE app_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id"
            ),
            [app_id],
            row_to_deployment,
        )
    }

    fn set_deployment_status(
        &self,
        id: Id,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE deployments SET status = ?2, error = ?3, updated_at = ?4 \
                 WHERE id = ?1 AND (status != ?2 OR error IS NOT ?3)",
                params![id, status, error, now_millis()],
            )
            .map_err(|e| write_error("cannot update deployment status", e))?;
        Ok(changed > 0)
    }

    fn set_deployment_build(&self, id: Id, build_id: Id) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE deployments SET build_id = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND deleted_at IS NULL AND build_id != ?2",
                params![id, build_id, now_millis()],
            )
            .map_err(|e| write_error("cannot update deployment build", e))?;
        Ok(changed > 0)
    }

    fn set_deployment_replicas(&self, id: Id, replicas: u32) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE deployments SET replicas = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND deleted_at IS NULL AND replicas != ?2",
                params![id, replicas, now_millis()],
            )
            .map_err(|e| write_error("cannot update deployment replicas", e))?;
        Ok(changed > 0)
    }

    fn delete_deployment(&self, id: Id) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let now = now_millis();
        let changed = conn
            .execute(
                "UPDATE deployments SET deleted_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now],
            )
            .map_err(|e| write_error("cannot delete deployment", e))?;
        Ok(changed > 0)
    }
}

impl SqliteStore {
    /// Apply an instance UPDATE guarded by `status IN (from)` and return
    /// the row if it changed.
    fn cas_instance(
        &self,
        id: Id,
        from: &[InstanceStatus],
        set: &str,
        extra: Vec<Box<dyn rusqlite::types::ToSql>>,
    ) -> Result<Option<Instance>, StoreError> {
        if from.is_empty() {
            return Ok(None);
        }
        let conn = self.conn()?;
        // Bound in order: `extra`, updated_at, id, then the `from` list.
        let sql = format!(
            "UPDATE instances SET {set}, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL AND status IN ({})",
            placeholders(from.len())
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = extra;
        values.push(Box::new(now_millis()));
        values.push(Box::new(id));
        for status in from {
            values.push(Box::new(*status));
        }
        let changed = conn
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| write_error("cannot update instance", e))?;
        if changed == 0 {
            return Ok(None);
        }
        get_by_id(&conn, "instances", INSTANCE_COLUMNS, id, row_to_instance)
    }
}

impl InstanceStore for SqliteStore {
    fn create_instance(&self, deployment_id: Id, image_id: Id) -> Result<Instance, StoreError> {
        let conn = self.conn()?;
        let id = Id::generate();
        let now = now_millis();
        conn.execute(
            "INSERT INTO instances (id, deployment_id, image_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![id, deployment_id, image_id, now],
        )
        .map_err(|e| write_error("cannot insert instance", e))?;

        get_by_id(&conn, "instances", INSTANCE_COLUMNS, id, row_to_instance)?
            .ok_or_else(|| StoreError::Query("instance not found after insert".to_string()))
    }

    fn get_instance(&self, id: Id) -> Result<Option<Instance>, StoreError> {
        let conn = self.conn()?;
        get_by_id(&conn, "instances", INSTANCE_COLUMNS, id, row_to_instance)
    }

    fn list_instances_for_deployment(&self, deployment_id: Id) -> Result<Vec<Instance>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances \
                 WHERE deployment_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id"
            ),
            [deployment_id],
            row_to_instance,
        )
    }

    fn list_instances_for_server(&self, server_id: Id) -> Result<Vec<Instance>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances \
                 WHERE server_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id"
            ),
            [server_id],
            row_to_instance,
        )
    }

    fn list_instances_with_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances \
                 WHERE status = ?1 AND deleted_at IS NULL ORDER BY created_at, id"
            ),
            [status],
            row_to_instance,
        )
    }

    fn count_instances_by_server(&self) -> Result<HashMap<Id, u32>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT server_id, COUNT(*) FROM instances \
                 WHERE deleted_at IS NULL AND server_id IS NOT NULL \
                   AND status IN ('scheduled', 'starting', 'running', 'stopping') \
                 GROUP BY server_id",
            )
            .map_err(query_error("cannot prepare instance count"))?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, Id>(0)?, row.get::<_, u32>(1)?)))
            .map_err(query_error("cannot count instances"))?
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(query_error("cannot read instance count"))?;
        Ok(counts)
    }

    fn transition_instance(
        &self,
        id: Id,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<Instance>, StoreError> {
        self.cas_instance(id, from, "status = ?", vec![Box::new(to)])
    }

    fn schedule_instance(&self, id: Id, server_id: Id) -> Result<Option<Instance>, StoreError> {
        self.cas_instance(
            id,
            &[InstanceStatus::Pending],
            "status = 'scheduled', server_id = ?",
            vec![Box::new(server_id)],
        )
    }

    fn fail_instance(
        &self,
        id: Id,
        from: &[InstanceStatus],
        error: &str,
    ) -> Result<Option<Instance>, StoreError> {
        self.cas_instance(
            id,
            from,
            "status = 'failed', error = ?, failed_at = ?, attempts = attempts + 1",
            vec![Box::new(error.to_string()), Box::new(now_millis())],
        )
    }

    fn retry_instance(&self, id: Id) -> Result<Option<Instance>, StoreError> {
        self.cas_instance(
            id,
            &[InstanceStatus::Failed],
            "status = 'pending', server_id = NULL",
            Vec::new(),
        )
    }

    fn set_instance_error(&self, id: Id, error: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE instances SET error = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND deleted_at IS NULL AND error IS NOT ?2",
                params![id, error, now_millis()],
            )
            .map_err(|e| write_error("cannot update instance error", e))?;
        Ok(changed > 0)
    }

    fn delete_instance(&self, id: Id) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let now = now_millis();
        let changed = conn
            .execute(
                "UPDATE instances SET deleted_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now],
            )
            .map_err(|e| write_error("cannot delete instance", e))?;
        Ok(changed > 0)
    }
}

impl ServerStore for SqliteStore {
    fn register_server(&self, params: &RegisterServerParams) -> Result<Server, StoreError> {
        params
            .ip_range
            .parse::<ipnetwork::Ipv4Network>()
            .map_err(|e| StoreError::InvalidInput(format!("ip_range '{}': {e}", params.ip_range)))?;

        let conn = self.conn()?;
        let tx = rusqlite::Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(query_error("cannot begin transaction"))?;
        let now = now_millis();

        let existing: Option<Id> = tx
            .query_row(
                "SELECT id FROM servers WHERE name = ?1 AND deleted_at IS NULL",
                [&params.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_error("cannot look up server"))?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE servers SET ip_range = ?2, max_instances = ?3, status = 'active' \
                     WHERE id = ?1 \
                       AND (ip_range != ?2 OR max_instances != ?3 OR status != 'active')",
                    params![id, params.ip_range, params.max_instances],
                )
                .map_err(|e| write_error("cannot update server", e))?;
                tx.execute(
                    "UPDATE servers SET heartbeat_at = ?2 WHERE id = ?1",
                    params![id, now],
                )
                .map_err(|e| write_error("cannot heartbeat server", e))?;
                id
            }
            None => {
                let id = Id::generate();
                tx.execute(
                    "INSERT INTO servers \
                     (id, name, ip_range, max_instances, status, heartbeat_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
                    params![id, params.name, params.ip_range, params.max_instances, now],
                )
                .map_err(|e| write_error("cannot insert server", e))?;
                id
            }
        };

        let server = get_by_id(&tx, "servers", SERVER_COLUMNS, id, row_to_server)?
            .ok_or_else(|| StoreError::Query("server not found after upsert".to_string()))?;
        tx.commit().map_err(query_error("cannot commit server registration"))?;
        Ok(server)
    }

    fn get_server(&self, id: Id) -> Result<Option<Server>, StoreError> {
        let conn = self.conn()?;
        get_by_id(&conn, "servers", SERVER_COLUMNS, id, row_to_server)
    }

    fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE deleted_at IS NULL ORDER BY name"),
            [],
            row_to_server,
        )
    }

    fn heartbeat_server(&self, id: Id) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE servers SET heartbeat_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now_millis()],
            )
            .map_err(|e| write_error("cannot heartbeat server", e))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("server {id}")));
        }
        Ok(())
    }

    fn set_server_status(&self, id: Id, status: ServerStatus) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE servers SET status = ?2 WHERE id = ?1 AND deleted_at IS NULL AND status != ?2",
                params![id, status],
            )
            .map_err(|e| write_error("cannot update server status", e))?;
        Ok(changed > 0)
    }
}

impl VmStore for SqliteStore {
    fn insert_vm(&self, vm: &NewVm) -> Result<Vm, StoreError> {
        let conn = self.conn()?;
        let id = Id::generate();
        let now = now_millis();
        let (start, end) = subnet_bounds(&vm.subnet);
        conn.execute(
            "INSERT INTO vms \
             (id, instance_id, server_id, image_id, vcpus, memory_mib, port, status, \
              subnet, subnet_start, subnet_end, guest_ip, gateway_ip, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                id,
                vm.instance_id,
                vm.server_id,
                vm.image_id,
                vm.vcpus,
                vm.memory_mib,
                vm.port,
                vm.subnet.to_string(),
                start,
                end,
                vm.guest_ip().to_string(),
                vm.gateway_ip().to_string(),
                now,
            ],
        )
        .map_err(|e| write_error("cannot insert vm", e))?;

        get_by_id(&conn, "vms", VM_COLUMNS, id, row_to_vm)?
            .ok_or_else(|| StoreError::Query("vm not found after insert".to_string()))
    }

    fn get_vm(&self, id: Id) -> Result<Option<Vm>, StoreError> {
        let conn = self.conn()?;
        get_by_id(&conn, "vms", VM_COLUMNS, id, row_to_vm)
    }

    fn get_vm_for_instance(&self, instance_id: Id) -> Result<Option<Vm>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {VM_COLUMNS} FROM vms WHERE instance_id = ?1 AND deleted_at IS NULL"),
            [instance_id],
            row_to_vm,
        )
        .optional()
        .map_err(query_error("cannot read vm row"))
    }

    fn list_vms_for_server(&self, server_id: Id) -> Result<Vec<Vm>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {VM_COLUMNS} FROM vms \
                 WHERE server_id = ?1 AND deleted_at IS NULL ORDER BY subnet_start"
            ),
            [server_id],
            row_to_vm,
        )
    }

    fn set_vm_status(&self, id: Id, status: VmStatus) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE vms SET status = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND deleted_at IS NULL AND status != ?2",
                params![id, status, now_millis()],
            )
            .map_err(|e| write_error("cannot update vm status", e))?;
        Ok(changed > 0)
    }

    fn set_vm_runtime(&self, id: Id, tap_device: Option<&str>, pid: Option<u32>) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE vms SET tap_device = ?2, pid = ?3, updated_at = ?4 \
                 WHERE id = ?1 AND deleted_at IS NULL \
                   AND (tap_device IS NOT ?2 OR pid IS NOT ?3)",
                params![id, tap_device, pid, now_millis()],
            )
            .map_err(|e| write_error("cannot update vm runtime", e))?;
        Ok(changed > 0)
    }

    fn release_vm(&self, id: Id) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let now = now_millis();
        let changed = conn
            .execute(
                "UPDATE vms SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now],
            )
            .map_err(|e| write_error("cannot release vm", e))?;
        Ok(changed > 0)
    }
}

impl RouteStore for SqliteStore {
    fn list_routes(&self, server_id: Option<Id>) -> Result<Vec<Route>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            "SELECT domain, app_id, instance_id, server_id, ip, port FROM routes \
             WHERE ?1 IS NULL OR server_id = ?1 ORDER BY domain, ip",
            [server_id],
            row_to_route,
        )
    }
}

impl ChangeStore for SqliteStore {
    fn changes_after(&self, after: i64, limit: u32) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn()?;
        query_all(
            &conn,
            "SELECT seq, entity, entity_id, op, recorded_at FROM change_log \
             WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            params![after, limit],
            row_to_change,
        )
    }

    fn max_change_seq(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'change_log'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_error("cannot read change sequence"))?;
        Ok(seq.unwrap_or(0))
    }

    fn feed_cursor(&self, name: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let seq: Option<i64> = conn
            .query_row("SELECT seq FROM feed_cursors WHERE name = ?1", [name], |row| row.get(0))
            .optional()
            .map_err(query_error("cannot read feed cursor"))?;
        Ok(seq.unwrap_or(0))
    }

    fn set_feed_cursor(&self, name: &str, seq: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO feed_cursors (name, seq) VALUES (?1, ?2) \
             ON CONFLICT(name) DO UPDATE SET seq = excluded.seq WHERE excluded.seq > seq",
            params![name, seq],
        )
        .map_err(|e| write_error("cannot advance feed cursor", e))?;
        Ok(())
    }

    fn compact_changes(&self, upto: i64) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM change_log WHERE seq <= ?1", [upto])
            .map_err(|e| write_error("cannot compact change log", e))
    }

    fn list_live_ids(&self, kind: EntityKind) -> Result<Vec<Id>, StoreError> {
        let sql = match kind {
            EntityKind::Build => {
                "SELECT id FROM builds \
                 WHERE deleted_at IS NULL AND status IN ('pending', 'running')"
            }
            // Superseded or deleted deployments still matter while they
            // hold instances.
            EntityKind::Deployment => {
                "SELECT id FROM deployments d \
                 WHERE (d.deleted_at IS NULL AND d.status != 'superseded') \
                    OR EXISTS (SELECT 1 FROM instances i \
                               WHERE i.deployment_id = d.id AND i.deleted_at IS NULL \
                                 AND i.status NOT IN ('stopping', 'stopped'))"
            }
            EntityKind::Instance => {
                "SELECT id FROM instances WHERE deleted_at IS NULL AND status != 'stopped'"
            }
            EntityKind::Server => "SELECT id FROM servers WHERE deleted_at IS NULL",
            EntityKind::Vm => "SELECT id FROM vms WHERE deleted_at IS NULL",
            EntityKind::Image => "SELECT id FROM images WHERE deleted_at IS NULL",
            EntityKind::App => "SELECT id FROM apps WHERE deleted_at IS NULL",
        };
        let conn = self.conn()?;
        query_all(&conn, sql, [], |row| row.get(0))
    }
}

impl TokenStore for SqliteStore {
    fn insert_metadata_token(&self, vm_id: Id, token_hash: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metadata_tokens (token_hash, vm_id, created_at) VALUES (?1, ?2, ?3)",
            params![token_hash, vm_id, now_millis()],
        )
        .map_err(|e| write_error("cannot insert metadata token", e))?;
        Ok(())
    }

    fn redeem_metadata_token(
        &self,
        token_hash: &str,
        guest_ip: &str,
    ) -> Result<Option<Id>, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE metadata_tokens SET redeemed_at = ?2 \
                 WHERE token_hash = ?1 AND redeemed_at IS NULL \
                   AND vm_id IN (SELECT id FROM vms WHERE deleted_at IS NULL AND guest_ip = ?3)",
                params![token_hash, now_millis(), guest_ip],
            )
            .map_err(|e| write_error("cannot redeem metadata token", e))?;
        if changed == 0 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT vm_id FROM metadata_tokens WHERE token_hash = ?1",
            [token_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(query_error("cannot read metadata token"))
    }

    fn vm_env(&self, vm_id: Id) -> Result<Option<Vec<String>>, StoreError> {
        let conn = self.conn()?;
        let env: Option<String> = conn
            .query_row(
                "SELECT d.env FROM vms v \
                 JOIN instances i ON i.id = v.instance_id \
                 JOIN deployments d ON d.id = i.deployment_id \
                 WHERE v.id = ?1",
                [vm_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_error("cannot read vm environment"))?;
        env.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| StoreError::Query(format!("corrupt deployment env: {e}")))
        })
        .transpose()
    }
}
