use rusqlite::Connection;

use crate::StoreError;

/// Schema version recorded in `user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS ktl_stack_runs (
    run_id            TEXT PRIMARY KEY,
    stack_root        TEXT NOT NULL,
    stack_name        TEXT NOT NULL,
    profile           TEXT,
    command           TEXT NOT NULL,
    concurrency       INTEGER NOT NULL,
    fail_mode         TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at_ns     INTEGER NOT NULL,
    updated_at_ns     INTEGER NOT NULL,
    completed_at_ns   INTEGER,
    creator           TEXT NOT NULL DEFAULT '',
    host              TEXT NOT NULL DEFAULT '',
    pid               INTEGER NOT NULL DEFAULT 0,
    ci                INTEGER NOT NULL DEFAULT 0,
    git_commit        TEXT NOT NULL DEFAULT '',
    git_dirty         INTEGER NOT NULL DEFAULT 0,
    selector_json     TEXT NOT NULL DEFAULT '{}',
    plan_json         TEXT NOT NULL,
    summary_json      TEXT NOT NULL,
    last_event_digest TEXT NOT NULL DEFAULT '',
    run_digest        TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS ktl_stack_nodes (
    run_id            TEXT NOT NULL,
    node_id           TEXT NOT NULL,
    status            TEXT NOT NULL,
    attempt           INTEGER NOT NULL DEFAULT 0,
    error             TEXT,
    last_error_class  TEXT,
    last_error_digest TEXT,
    updated_at_ns     INTEGER NOT NULL,
    PRIMARY KEY (run_id, node_id),
    FOREIGN KEY (run_id) REFERENCES ktl_stack_runs(run_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS ktl_stack_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id        TEXT NOT NULL,
    ts_ns         INTEGER NOT NULL,
    node_id       TEXT,
    type          TEXT NOT NULL,
    attempt       INTEGER NOT NULL DEFAULT 0,
    message       TEXT NOT NULL DEFAULT '',
    error_class   TEXT,
    error_message TEXT,
    error_digest  TEXT,
    seq           INTEGER NOT NULL,
    prev_digest   TEXT NOT NULL DEFAULT '',
    digest        TEXT NOT NULL,
    crc32         INTEGER NOT NULL,
    fields_json   TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (run_id) REFERENCES ktl_stack_runs(run_id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ktl_stack_events_run_seq
    ON ktl_stack_events(run_id, seq);

CREATE TABLE IF NOT EXISTS ktl_stack_node_steps (
    run_id          TEXT NOT NULL,
    node_id         TEXT NOT NULL,
    attempt         INTEGER NOT NULL,
    step            TEXT NOT NULL,
    status          TEXT NOT NULL,
    started_at_ns   INTEGER,
    completed_at_ns INTEGER,
    error_class     TEXT,
    error_message   TEXT,
    error_digest    TEXT,
    cursor_json     TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (run_id, node_id, attempt, step),
    FOREIGN KEY (run_id) REFERENCES ktl_stack_runs(run_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS ktl_stack_apply_cache (
    cluster_key          TEXT NOT NULL,
    namespace            TEXT NOT NULL,
    release_name         TEXT NOT NULL,
    command              TEXT NOT NULL,
    effective_input_hash TEXT NOT NULL,
    desired_digest       TEXT NOT NULL,
    has_hooks            INTEGER NOT NULL DEFAULT 0,
    run_id               TEXT NOT NULL,
    updated_at_ns        INTEGER NOT NULL,
    PRIMARY KEY (cluster_key, namespace, release_name, command, effective_input_hash)
);
"#;

/// Apply connection pragmas shared by the writer and read-only handles.
pub fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

/// Create tables and stamp the schema version. Idempotent.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(DDL)?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version == 0 {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}
