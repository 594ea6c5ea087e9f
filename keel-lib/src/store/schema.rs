// SPDX-License-Identifier: GPL-2.0-only
/// Schema version — increment when the schema changes.
/// Pre-alpha migration strategy: if the stored version doesn't match,
/// delete the DB and recreate.
pub const SCHEMA_VERSION: u32 = 3;

/// Message raised by the subnet exclusion triggers. Matched when mapping
/// SQLite errors to `StoreError::Exclusion`.
pub const SUBNET_OVERLAP: &str = "subnet overlaps a live vm on this server";

/// Database schema. Executed as a single batch on first start.
pub const SCHEMA_SQL: &str = r#"
-- Keel Database Schema v3 (Pre-Alpha)
--
-- Timestamps are milliseconds since the Unix epoch. Rows are never
-- deleted by the engine: deleted_at marks them gone.

CREATE TABLE schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE images (
    id INTEGER PRIMARY KEY,
    registry TEXT NOT NULL,
    repository TEXT NOT NULL,
    tag TEXT NOT NULL,
    digest TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE UNIQUE INDEX idx_images_ref ON images(registry, repository, tag)
    WHERE deleted_at IS NULL;

CREATE TABLE builds (
    id INTEGER PRIMARY KEY,
    commit_sha TEXT NOT NULL,
    image_id INTEGER REFERENCES images(id),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'running', 'succeeded', 'failed')),
    error TEXT,
    started_at INTEGER,
    completed_at INTEGER,
    failed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE TABLE apps (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    domain TEXT,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE UNIQUE INDEX idx_apps_name ON apps(name) WHERE deleted_at IS NULL;
CREATE UNIQUE INDEX idx_apps_domain ON apps(domain)
    WHERE deleted_at IS NULL AND domain IS NOT NULL;

CREATE TABLE deployments (
    id INTEGER PRIMARY KEY,
    app_id INTEGER NOT NULL REFERENCES apps(id),
    build_id INTEGER NOT NULL REFERENCES builds(id),
    replicas INTEGER NOT NULL CHECK(replicas >= 0),
    vcpus INTEGER NOT NULL CHECK(vcpus > 0),
    memory_mib INTEGER NOT NULL CHECK(memory_mib > 0),
    port INTEGER NOT NULL CHECK(port BETWEEN 1 AND 65535),
    env TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'deploying', 'active', 'failed', 'superseded')),
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE INDEX idx_deployments_app ON deployments(app_id);
CREATE INDEX idx_deployments_build ON deployments(build_id);

CREATE TABLE servers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    ip_range TEXT NOT NULL,
    max_instances INTEGER NOT NULL CHECK(max_instances >= 0),
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'draining')),
    heartbeat_at INTEGER,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE UNIQUE INDEX idx_servers_name ON servers(name) WHERE deleted_at IS NULL;

CREATE TABLE instances (
    id INTEGER PRIMARY KEY,
    deployment_id INTEGER NOT NULL REFERENCES deployments(id),
    image_id INTEGER NOT NULL REFERENCES images(id),
    server_id INTEGER REFERENCES servers(id),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'scheduled', 'starting', 'running',
                         'stopping', 'stopped', 'failed')),
    error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    failed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

CREATE INDEX idx_instances_deployment ON instances(deployment_id);
CREATE INDEX idx_instances_server ON instances(server_id);
CREATE INDEX idx_instances_status ON instances(status) WHERE deleted_at IS NULL;

-- VMs: one row per micro-VM; the row is also the subnet reservation.
-- subnet_start/subnet_end are the inclusive integer bounds of the CIDR.
CREATE TABLE vms (
    id INTEGER PRIMARY KEY,
    instance_id INTEGER NOT NULL REFERENCES instances(id),
    server_id INTEGER NOT NULL REFERENCES servers(id),
    image_id INTEGER NOT NULL REFERENCES images(id),
    vcpus INTEGER NOT NULL,
    memory_mib INTEGER NOT NULL,
    port INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'starting', 'running', 'stopping', 'failed')),
    subnet TEXT NOT NULL,
    subnet_start INTEGER NOT NULL,
    subnet_end INTEGER NOT NULL CHECK(subnet_end >= subnet_start),
    guest_ip TEXT NOT NULL,
    gateway_ip TEXT NOT NULL,
    tap_device TEXT,
    pid INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

-- One live VM per instance
CREATE UNIQUE INDEX idx_vms_instance ON vms(instance_id) WHERE deleted_at IS NULL;
CREATE INDEX idx_vms_server_range ON vms(server_id, subnet_start, subnet_end)
    WHERE deleted_at IS NULL;

-- Exclusion constraint: live subnets on one server never intersect.
-- The check runs inside the writing statement, under SQLite's write lock.
CREATE TRIGGER vms_subnet_exclusion_insert
BEFORE INSERT ON vms
WHEN NEW.deleted_at IS NULL
BEGIN
    SELECT RAISE(ABORT, 'subnet overlaps a live vm on this server')
    WHERE EXISTS (
        SELECT 1 FROM vms
        WHERE server_id = NEW.server_id
          AND deleted_at IS NULL
          AND subnet_start <= NEW.subnet_end
          AND NEW.subnet_start <= subnet_end
    );
END;

CREATE TRIGGER vms_subnet_exclusion_update
BEFORE UPDATE OF server_id, subnet_start, subnet_end, deleted_at ON vms
WHEN NEW.deleted_at IS NULL
BEGIN
    SELECT RAISE(ABORT, 'subnet overlaps a live vm on this server')
    WHERE EXISTS (
        SELECT 1 FROM vms
        WHERE id != NEW.id
          AND server_id = NEW.server_id
          AND deleted_at IS NULL
          AND subnet_start <= NEW.subnet_end
          AND NEW.subnet_start <= subnet_end
    );
END;

-- One-time metadata tokens (SHA-256 hex of the token handed to the guest)
CREATE TABLE metadata_tokens (
    token_hash TEXT PRIMARY KEY,
    vm_id INTEGER NOT NULL REFERENCES vms(id),
    created_at INTEGER NOT NULL,
    redeemed_at INTEGER
);

-- Change log: the lowest layer of the change feed. Filled by triggers,
-- drained in seq order, pruned below the slowest cursor.
CREATE TABLE change_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    op TEXT NOT NULL CHECK(op IN ('created', 'updated')),
    recorded_at INTEGER NOT NULL
        DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER))
);

CREATE TABLE feed_cursors (
    name TEXT PRIMARY KEY,
    seq INTEGER NOT NULL
);

CREATE TRIGGER images_changed_insert AFTER INSERT ON images
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('image', NEW.id, 'created');
END;

CREATE TRIGGER images_changed_update AFTER UPDATE ON images
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('image', NEW.id, 'updated');
END;

CREATE TRIGGER builds_changed_insert AFTER INSERT ON builds
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('build', NEW.id, 'created');
END;

CREATE TRIGGER builds_changed_update AFTER UPDATE ON builds
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('build', NEW.id, 'updated');
END;

CREATE TRIGGER apps_changed_insert AFTER INSERT ON apps
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('app', NEW.id, 'created');
END;

CREATE TRIGGER apps_changed_update AFTER UPDATE ON apps
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('app', NEW.id, 'updated');
END;

CREATE TRIGGER deployments_changed_insert AFTER INSERT ON deployments
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('deployment', NEW.id, 'created');
END;

CREATE TRIGGER deployments_changed_update AFTER UPDATE ON deployments
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('deployment', NEW.id, 'updated');
END;

CREATE TRIGGER instances_changed_insert AFTER INSERT ON instances
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('instance', NEW.id, 'created');
END;

CREATE TRIGGER instances_changed_update AFTER UPDATE ON instances
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('instance', NEW.id, 'updated');
END;

CREATE TRIGGER servers_changed_insert AFTER INSERT ON servers
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('server', NEW.id, 'created');
END;

-- Heartbeats only touch heartbeat_at and are not events.
CREATE TRIGGER servers_changed_update
AFTER UPDATE OF status, ip_range, max_instances, deleted_at ON servers
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('server', NEW.id, 'updated');
END;

CREATE TRIGGER vms_changed_insert AFTER INSERT ON vms
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('vm', NEW.id, 'created');
END;

CREATE TRIGGER vms_changed_update AFTER UPDATE ON vms
BEGIN
    INSERT INTO change_log (entity, entity_id, op) VALUES ('vm', NEW.id, 'updated');
END;

-- Routes: public domain -> running VM, for every running instance of an
-- app's deployments that are not superseded.
CREATE VIEW routes AS
SELECT
    a.domain AS domain,
    a.id AS app_id,
    i.id AS instance_id,
    v.server_id AS server_id,
    v.guest_ip AS ip,
    v.port AS port
FROM apps a
JOIN deployments d
    ON d.app_id = a.id AND d.deleted_at IS NULL AND d.status != 'superseded'
JOIN instances i
    ON i.deployment_id = d.id AND i.deleted_at IS NULL AND i.status = 'running'
JOIN vms v
    ON v.instance_id = i.id AND v.deleted_at IS NULL AND v.status = 'running'
WHERE a.deleted_at IS NULL AND a.domain IS NOT NULL;
"#;
