//! Durable single-writer SQLite state store for stack runs.
//!
//! One writer connection owns all mutations, fed by a bounded queue and
//! committing in batched transactions (flush tick or batch-size, whichever
//! first). An independent read-only connection serves tailers, resume and
//! exports without ever blocking the writer. The store owns each run's
//! event chain head: appends are sealed (seq, prev digest, digest, crc)
//! writer-side before they hit the database.

mod export;
mod schema;
mod store;

pub use export::export_run;
pub use schema::SCHEMA_VERSION;
pub use store::{
    ChainPosition, CreateRun, EventSink, NodeRecord, NodeStep, RunListing, RunMeta, STATE_DB_PATH,
    StateStore, StoreConfig,
};

/// Typed store failures. A write-path failure latches: once the writer has
/// failed, every later append returns the latched error without retrying.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("append queue is full")]
    QueueFull,
    #[error("store writer has failed: {0}")]
    WriterFailed(String),
    #[error("store writer is gone")]
    WriterGone,
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("node {node_id} not found in run {run_id}")]
    NodeNotFound { run_id: String, node_id: String },
    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("{event_type} events are ephemeral and cannot be persisted")]
    EphemeralAppend { event_type: &'static str },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
