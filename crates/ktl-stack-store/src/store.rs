use std::collections::HashMap;
use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use ktl_stack_events::ChainHead;
use ktl_stack_hash::compute_run_digest;
use ktl_stack_types::{
    ApplyCacheEntry, ApplyCacheKey, Command, EventType, FailMode, NodeStatus, Plan, RunError,
    RunEvent, RunStatus, RunSummary,
};

use crate::StoreError;
use crate::schema;

/// Relative location of the state database under a stack root.
pub const STATE_DB_PATH: &str = ".ktl/stack/state.sqlite";

/// Writer queue and batching tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Bounded append queue depth; overflow returns [`StoreError::QueueFull`].
    pub queue_depth: usize,
    /// Flush when this many appends are pending.
    pub batch_size: usize,
    /// Flush at least this often while appends trickle in.
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4096,
            batch_size: 256,
            flush_interval: Duration::from_millis(250),
        }
    }
}

/// Metadata columns of a run row.
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub run_id: String,
    pub stack_root: PathBuf,
    pub stack_name: String,
    pub profile: Option<String>,
    pub command: Command,
    pub concurrency: u32,
    pub fail_mode: FailMode,
    pub selector: serde_json::Value,
    pub creator: String,
    pub host: String,
    pub pid: u32,
    pub ci: bool,
    pub git_commit: String,
    pub git_dirty: bool,
}

/// Everything written when a run is created, in one transaction.
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub meta: RunMeta,
    pub plan: Plan,
    pub summary: RunSummary,
}

/// One row of `list_runs`.
#[derive(Debug, Clone)]
pub struct RunListing {
    pub run_id: String,
    pub stack_name: String,
    pub profile: Option<String>,
    pub command: Command,
    pub status: RunStatus,
    pub created_at_ns: i64,
    pub completed_at_ns: Option<i64>,
    pub run_digest: String,
}

/// Persisted status of one node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub status: NodeStatus,
    pub attempt: u32,
    pub error: Option<RunError>,
}

/// One step checkpoint row.
#[derive(Debug, Clone)]
pub struct NodeStep {
    pub node_id: String,
    pub attempt: u32,
    pub step: String,
    pub status: String,
    pub started_at_ns: Option<i64>,
    pub completed_at_ns: Option<i64>,
    pub error: Option<RunError>,
    pub cursor: serde_json::Value,
}

/// Chain position returned by [`StateStore::flush`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainPosition {
    pub last_seq: u64,
    pub last_digest: String,
}

/// Persistent observers, invoked synchronously on the writer tick after a
/// batch commits. Implementations must not block.
pub trait EventSink: Send {
    fn on_committed(&self, events: &[RunEvent]);
}

enum Request {
    Append(Box<RunEvent>),
    CreateRun(Box<CreateRun>, SyncSender<Result<(), StoreError>>),
    CompleteRun {
        run_id: String,
        status: RunStatus,
        ack: SyncSender<Result<String, StoreError>>,
    },
    UpsertApplyCache(ApplyCacheKey, ApplyCacheEntry, SyncSender<Result<(), StoreError>>),
    Flush(String, SyncSender<Result<ChainPosition, StoreError>>),
    Checkpoint(SyncSender<Result<(), StoreError>>),
    PruneRuns(usize, SyncSender<Result<usize, StoreError>>),
    AddSink(Box<dyn EventSink>),
}

/// Durable single-writer SQLite store for stack runs.
///
/// One writer connection lives on a dedicated thread; all mutations flow
/// through a bounded queue and commit in batched transactions. Reads use an
/// independent read-only connection so tailers and exports never block the
/// writer.
pub struct StateStore {
    db_path: PathBuf,
    // SyncSender is not Sync; the mutex makes the store shareable across
    // worker threads.
    tx: Mutex<SyncSender<Request>>,
    reader: Mutex<Connection>,
    writer: Option<JoinHandle<()>>,
    write_error: Arc<Mutex<Option<String>>>,
    dropped: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (creating if needed) the store for a stack root, at the
    /// conventional `.ktl/stack/state.sqlite` location.
    pub fn open(stack_root: &Path) -> Result<Self, StoreError> {
        Self::open_at(&stack_root.join(STATE_DB_PATH), StoreConfig::default())
    }

    /// Open a store at an explicit database path.
    pub fn open_at(db_path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                context: format!("failed to create state dir {}", parent.display()),
                source: e,
            })?;
        }

        let conn = Connection::open(db_path)?;
        schema::apply_pragmas(&conn)?;
        schema::migrate(&conn)?;

        let reader = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(Duration::from_secs(5))?;

        let (tx, rx) = sync_channel(config.queue_depth);
        let write_error = Arc::new(Mutex::new(None));
        let dropped = Arc::new(AtomicU64::new(0));
        let writer = Writer {
            conn,
            rx,
            config,
            chains: HashMap::new(),
            summaries: HashMap::new(),
            sinks: Vec::new(),
            batch: Vec::new(),
            write_error: Arc::clone(&write_error),
        };
        let handle = std::thread::Builder::new()
            .name("ktl-stack-store-writer".to_string())
            .spawn(move || writer.run())
            .map_err(|e| StoreError::Io {
                context: "failed to spawn store writer thread".to_string(),
                source: e,
            })?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            tx: Mutex::new(tx),
            reader: Mutex::new(reader),
            writer: Some(handle),
            write_error,
            dropped,
        })
    }

    fn send(&self, request: Request) -> Result<(), StoreError> {
        self.tx
            .lock()
            .expect("store sender poisoned")
            .send(request)
            .map_err(|_| StoreError::WriterGone)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Count of append requests rejected because the queue was full.
    pub fn dropped_appends(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn latched_error(&self) -> Option<StoreError> {
        self.write_error
            .lock()
            .expect("write error latch poisoned")
            .clone()
            .map(StoreError::WriterFailed)
    }

    /// Register a persistent observer invoked after each committed batch.
    pub fn add_sink(&self, sink: Box<dyn EventSink>) -> Result<(), StoreError> {
        self.send(Request::AddSink(sink))
    }

    /// Create a run: run row, node rows and initial summary in one
    /// transaction. Synchronous.
    pub fn create_run(&self, create: CreateRun) -> Result<(), StoreError> {
        if let Some(err) = self.latched_error() {
            return Err(err);
        }
        let (ack, ack_rx) = sync_channel(1);
        self.send(Request::CreateRun(Box::new(create), ack))?;
        ack_rx.recv().map_err(|_| StoreError::WriterGone)?
    }

    /// Enqueue an event append. Non-blocking: returns immediately once the
    /// request is queued; the writer seals the chain and commits on its
    /// flush tick. A full queue returns [`StoreError::QueueFull`]; a latched
    /// write error is returned without retrying.
    pub fn append_event(&self, event: RunEvent) -> Result<(), StoreError> {
        if event.event_type.is_ephemeral() {
            return Err(StoreError::EphemeralAppend {
                event_type: event.event_type.as_str(),
            });
        }
        if let Some(err) = self.latched_error() {
            return Err(err);
        }
        let sender = self.tx.lock().expect("store sender poisoned");
        match sender.try_send(Request::Append(Box::new(event))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(StoreError::WriterGone),
        }
    }

    /// Synchronous barrier: commits everything queued so far and returns the
    /// writer's chain position for the run.
    pub fn flush(&self, run_id: &str) -> Result<ChainPosition, StoreError> {
        if let Some(err) = self.latched_error() {
            return Err(err);
        }
        let (ack, ack_rx) = sync_channel(1);
        self.send(Request::Flush(run_id.to_string(), ack))?;
        ack_rx.recv().map_err(|_| StoreError::WriterGone)?
    }

    /// Finalize a run: flush, persist the final summary and status, compute
    /// and store the run digest. Returns the digest.
    pub fn complete_run(&self, run_id: &str, status: RunStatus) -> Result<String, StoreError> {
        if let Some(err) = self.latched_error() {
            return Err(err);
        }
        let (ack, ack_rx) = sync_channel(1);
        self.send(Request::CompleteRun {
            run_id: run_id.to_string(),
            status,
            ack,
        })?;
        ack_rx.recv().map_err(|_| StoreError::WriterGone)?
    }

    pub fn upsert_apply_cache(
        &self,
        key: ApplyCacheKey,
        entry: ApplyCacheEntry,
    ) -> Result<(), StoreError> {
        let (ack, ack_rx) = sync_channel(1);
        self.send(Request::UpsertApplyCache(key, entry, ack))?;
        ack_rx.recv().map_err(|_| StoreError::WriterGone)?
    }

    /// `wal_checkpoint(TRUNCATE)` so the main database file stands alone.
    pub fn checkpoint_portable(&self) -> Result<(), StoreError> {
        let (ack, ack_rx) = sync_channel(1);
        self.send(Request::Checkpoint(ack))?;
        ack_rx.recv().map_err(|_| StoreError::WriterGone)?
    }

    /// Drop completed runs beyond the newest `max_runs`. Returns how many
    /// were pruned. `max_runs == 0` disables pruning.
    pub fn prune_completed_runs(&self, max_runs: usize) -> Result<usize, StoreError> {
        let (ack, ack_rx) = sync_channel(1);
        self.send(Request::PruneRuns(max_runs, ack))?;
        ack_rx.recv().map_err(|_| StoreError::WriterGone)?
    }

    // ----- read paths (independent read-only connection) -----

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.reader.lock().expect("reader connection poisoned");
        f(&conn)
    }

    /// Latest `limit` events of a run in ascending order, plus the row id of
    /// the newest one for subsequent [`StateStore::events_after`] calls.
    pub fn tail_events(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<(Vec<RunEvent>, i64), StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, ts_ns, node_id, type, attempt, message,
                        error_class, error_message, error_digest,
                        seq, prev_digest, digest, crc32, fields_json
                 FROM ktl_stack_events WHERE run_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut rows: Vec<(i64, RunEvent)> = stmt
                .query_map(params![run_id, limit as i64], row_to_event)?
                .collect::<Result<_, _>>()?;
            rows.reverse();
            let last_id = rows.last().map(|(id, _)| *id).unwrap_or(0);
            Ok((rows.into_iter().map(|(_, e)| e).collect(), last_id))
        })
    }

    /// Events with row id greater than `after_id`, oldest first.
    pub fn events_after(
        &self,
        run_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<(Vec<RunEvent>, i64), StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, ts_ns, node_id, type, attempt, message,
                        error_class, error_message, error_digest,
                        seq, prev_digest, digest, crc32, fields_json
                 FROM ktl_stack_events WHERE run_id = ?1 AND id > ?2
                 ORDER BY id ASC LIMIT ?3",
            )?;
            let rows: Vec<(i64, RunEvent)> = stmt
                .query_map(params![run_id, after_id, limit as i64], row_to_event)?
                .collect::<Result<_, _>>()?;
            let last_id = rows.last().map(|(id, _)| *id).unwrap_or(after_id);
            Ok((rows.into_iter().map(|(_, e)| e).collect(), last_id))
        })
    }

    /// The full persisted event stream of a run, oldest first.
    pub fn load_events(&self, run_id: &str) -> Result<Vec<RunEvent>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, ts_ns, node_id, type, attempt, message,
                        error_class, error_message, error_digest,
                        seq, prev_digest, digest, crc32, fields_json
                 FROM ktl_stack_events WHERE run_id = ?1 ORDER BY seq ASC",
            )?;
            let rows: Vec<(i64, RunEvent)> = stmt
                .query_map(params![run_id], row_to_event)?
                .collect::<Result<_, _>>()?;
            Ok(rows.into_iter().map(|(_, e)| e).collect())
        })
    }

    pub fn get_run_plan(&self, run_id: &str) -> Result<Plan, StoreError> {
        self.with_reader(|conn| {
            let plan_json: String = conn
                .query_row(
                    "SELECT plan_json FROM ktl_stack_runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
            let mut plan: Plan = serde_json::from_str(&plan_json)?;
            plan.reindex();
            Ok(plan)
        })
    }

    pub fn get_run_summary(&self, run_id: &str) -> Result<RunSummary, StoreError> {
        self.with_reader(|conn| {
            let summary_json: String = conn
                .query_row(
                    "SELECT summary_json FROM ktl_stack_runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
            Ok(serde_json::from_str(&summary_json)?)
        })
    }

    pub fn get_node_status(&self, run_id: &str, node_id: &str) -> Result<NodeRecord, StoreError> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT node_id, status, attempt, error, last_error_class, last_error_digest
                 FROM ktl_stack_nodes WHERE run_id = ?1 AND node_id = ?2",
                params![run_id, node_id],
                row_to_node_record,
            )
            .optional()?
            .ok_or_else(|| StoreError::NodeNotFound {
                run_id: run_id.to_string(),
                node_id: node_id.to_string(),
            })
        })
    }

    pub fn list_node_status(&self, run_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, status, attempt, error, last_error_class, last_error_digest
                 FROM ktl_stack_nodes WHERE run_id = ?1 ORDER BY node_id",
            )?;
            let rows = stmt
                .query_map(params![run_id], row_to_node_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn most_recent_run_id(&self) -> Result<Option<String>, StoreError> {
        self.with_reader(|conn| {
            Ok(conn
                .query_row(
                    "SELECT run_id FROM ktl_stack_runs ORDER BY created_at_ns DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, stack_name, profile, command, status,
                        created_at_ns, completed_at_ns, run_digest
                 FROM ktl_stack_runs ORDER BY created_at_ns DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(RunListing {
                        run_id: row.get(0)?,
                        stack_name: row.get(1)?,
                        profile: row.get(2)?,
                        command: parse_enum(&row.get::<_, String>(3)?)?,
                        status: parse_enum(&row.get::<_, String>(4)?)?,
                        created_at_ns: row.get(5)?,
                        completed_at_ns: row.get(6)?,
                        run_digest: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Listing row for one run.
    pub fn get_run(&self, run_id: &str) -> Result<RunListing, StoreError> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT run_id, stack_name, profile, command, status,
                        created_at_ns, completed_at_ns, run_digest
                 FROM ktl_stack_runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunListing {
                        run_id: row.get(0)?,
                        stack_name: row.get(1)?,
                        profile: row.get(2)?,
                        command: parse_enum(&row.get::<_, String>(3)?)?,
                        status: parse_enum(&row.get::<_, String>(4)?)?,
                        created_at_ns: row.get(5)?,
                        completed_at_ns: row.get(6)?,
                        run_digest: row.get(7)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
        })
    }

    pub fn get_run_status(&self, run_id: &str) -> Result<RunStatus, StoreError> {
        self.with_reader(|conn| {
            let status: String = conn
                .query_row(
                    "SELECT status FROM ktl_stack_runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
            Ok(parse_enum::<RunStatus>(&status)?)
        })
    }

    pub fn get_run_digest(&self, run_id: &str) -> Result<String, StoreError> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT run_digest FROM ktl_stack_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
        })
    }

    pub fn get_node_steps(&self, run_id: &str, node_id: &str) -> Result<Vec<NodeStep>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, attempt, step, status, started_at_ns, completed_at_ns,
                        error_class, error_message, error_digest, cursor_json
                 FROM ktl_stack_node_steps
                 WHERE run_id = ?1 AND node_id = ?2
                 ORDER BY attempt, step",
            )?;
            let rows = stmt
                .query_map(params![run_id, node_id], |row| {
                    Ok(NodeStep {
                        node_id: row.get(0)?,
                        attempt: row.get(1)?,
                        step: row.get(2)?,
                        status: row.get(3)?,
                        started_at_ns: row.get(4)?,
                        completed_at_ns: row.get(5)?,
                        error: row_error(row, 6, 7, 8)?,
                        cursor: serde_json::from_str(&row.get::<_, String>(9)?)
                            .unwrap_or(serde_json::Value::Null),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_apply_cache(
        &self,
        key: &ApplyCacheKey,
    ) -> Result<Option<ApplyCacheEntry>, StoreError> {
        self.with_reader(|conn| {
            Ok(conn
                .query_row(
                    "SELECT desired_digest, has_hooks, run_id, updated_at_ns
                     FROM ktl_stack_apply_cache
                     WHERE cluster_key = ?1 AND namespace = ?2 AND release_name = ?3
                       AND command = ?4 AND effective_input_hash = ?5",
                    params![
                        key.cluster_key,
                        key.namespace,
                        key.release_name,
                        key.command.as_str(),
                        key.effective_input_hash
                    ],
                    |row| {
                        Ok(ApplyCacheEntry {
                            desired_digest: row.get(0)?,
                            has_hooks: row.get::<_, i64>(1)? != 0,
                            observed_at_run_id: row.get(2)?,
                            updated_at_ns: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Stop the writer, flushing and checkpointing on the way out.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        // Dropping all senders ends the writer loop; it flushes and
        // checkpoints before exiting.
        let (replacement, _) = sync_channel(1);
        let tx = std::mem::replace(
            self.tx.lock().expect("store sender poisoned").deref_mut(),
            replacement,
        );
        drop(tx);
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----- writer thread -----

struct Writer {
    conn: Connection,
    rx: Receiver<Request>,
    config: StoreConfig,
    chains: HashMap<String, ChainHead>,
    summaries: HashMap<String, RunSummary>,
    sinks: Vec<Box<dyn EventSink>>,
    batch: Vec<RunEvent>,
    write_error: Arc<Mutex<Option<String>>>,
}

impl Writer {
    fn run(mut self) {
        let mut deadline = Instant::now() + self.config.flush_interval;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                Ok(Request::Append(event)) => {
                    if let Err(err) = self.stage(*event) {
                        self.latch(&err);
                    }
                    if self.batch.len() >= self.config.batch_size {
                        self.flush_batch();
                        deadline = Instant::now() + self.config.flush_interval;
                    }
                }
                Ok(other) => {
                    self.flush_batch();
                    self.handle(other);
                    deadline = Instant::now() + self.config.flush_interval;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.flush_batch();
                    deadline = Instant::now() + self.config.flush_interval;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush_batch();
                    let _ = self.conn.query_row(
                        "PRAGMA wal_checkpoint(TRUNCATE)",
                        [],
                        |_row| Ok(()),
                    );
                    return;
                }
            }
        }
    }

    fn latch(&self, err: &StoreError) {
        let mut latch = self.write_error.lock().expect("write error latch poisoned");
        if latch.is_none() {
            *latch = Some(err.to_string());
        }
    }

    /// Seal an event into its run's chain and stage it for the next flush.
    fn stage(&mut self, mut event: RunEvent) -> Result<(), StoreError> {
        let run_id = event.run_id.clone();
        if !self.chains.contains_key(&run_id) {
            self.hydrate_run(&run_id)?;
        }
        let chain = self
            .chains
            .get_mut(&run_id)
            .expect("chain hydrated above");
        chain.seal(&mut event);
        if let Some(summary) = self.summaries.get_mut(&run_id) {
            summary.apply_event(&event);
        }
        self.batch.push(event);
        Ok(())
    }

    /// Load chain head and summary for a run created by an earlier process
    /// (resume). Errors if the run row does not exist.
    fn hydrate_run(&mut self, run_id: &str) -> Result<(), StoreError> {
        let summary_json: String = self
            .conn
            .query_row(
                "SELECT summary_json FROM ktl_stack_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        let summary: RunSummary = serde_json::from_str(&summary_json)?;

        let head: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT seq, digest FROM ktl_stack_events
                 WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let chain = match head {
            Some((seq, digest)) => ChainHead::resume(seq as u64, digest),
            None => ChainHead::new(),
        };
        self.chains.insert(run_id.to_string(), chain);
        self.summaries.insert(run_id.to_string(), summary);
        Ok(())
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        if let Err(err) = self.commit_batch(&batch) {
            self.latch(&err);
            return;
        }
        for sink in &self.sinks {
            sink.on_committed(&batch);
        }
    }

    fn commit_batch(&mut self, batch: &[RunEvent]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for event in batch {
            let (error_class, error_message, error_digest) = match &event.error {
                Some(err) => (
                    Some(err.class.as_str().to_string()),
                    Some(err.message.clone()),
                    Some(err.digest.clone()),
                ),
                None => (None, None, None),
            };
            tx.execute(
                "INSERT INTO ktl_stack_events
                     (run_id, ts_ns, node_id, type, attempt, message,
                      error_class, error_message, error_digest,
                      seq, prev_digest, digest, crc32, fields_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    event.run_id,
                    event.ts_ns(),
                    event.node_id,
                    event.event_type.as_str(),
                    event.attempt,
                    event.message,
                    error_class,
                    error_message,
                    error_digest,
                    event.seq as i64,
                    event.prev_digest,
                    event.digest,
                    event.crc32 as i64,
                    serde_json::to_string(&event.fields)?,
                ],
            )?;

            tx.execute(
                "UPDATE ktl_stack_runs
                 SET last_event_digest = ?2, updated_at_ns = ?3
                 WHERE run_id = ?1",
                params![event.run_id, event.digest, event.ts_ns()],
            )?;

            if let Some(status) = node_status_for(event.event_type) {
                let node_id = event.node_id.as_deref().unwrap_or_default();
                tx.execute(
                    "UPDATE ktl_stack_nodes
                     SET status = ?3, attempt = MAX(attempt, ?4), updated_at_ns = ?5,
                         error = COALESCE(?6, error),
                         last_error_class = COALESCE(?7, last_error_class),
                         last_error_digest = COALESCE(?8, last_error_digest)
                     WHERE run_id = ?1 AND node_id = ?2",
                    params![
                        event.run_id,
                        node_id,
                        status.as_str(),
                        event.attempt,
                        event.ts_ns(),
                        event.error.as_ref().map(|e| e.message.clone()),
                        event.error.as_ref().map(|e| e.class.as_str()),
                        event.error.as_ref().map(|e| e.digest.clone()),
                    ],
                )?;
            }

            if event.event_type.is_step_event() {
                upsert_step(&tx, event)?;
            }

            if event.event_type.is_terminal_node_event()
                || event.event_type == EventType::RunCompleted
            {
                if let Some(summary) = self.summaries.get(&event.run_id) {
                    tx.execute(
                        "UPDATE ktl_stack_runs SET summary_json = ?2 WHERE run_id = ?1",
                        params![event.run_id, serde_json::to_string(summary)?],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Append(_) => unreachable!("appends are staged, not handled"),
            Request::CreateRun(create, ack) => {
                let result = self.create_run(*create);
                let _ = ack.send(result);
            }
            Request::CompleteRun {
                run_id,
                status,
                ack,
            } => {
                let result = self.complete_run(&run_id, status);
                let _ = ack.send(result);
            }
            Request::UpsertApplyCache(key, entry, ack) => {
                let result = self.upsert_apply_cache(&key, &entry);
                let _ = ack.send(result);
            }
            Request::Flush(run_id, ack) => {
                // Pending appends were flushed before dispatch.
                let result = if !self.chains.contains_key(&run_id) {
                    self.hydrate_run(&run_id)
                        .map(|()| chain_position(&self.chains[&run_id]))
                } else {
                    Ok(chain_position(&self.chains[&run_id]))
                };
                let _ = ack.send(result);
            }
            Request::Checkpoint(ack) => {
                let result = self
                    .conn
                    .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()))
                    .map_err(StoreError::from);
                let _ = ack.send(result);
            }
            Request::PruneRuns(max_runs, ack) => {
                let result = self.prune_runs(max_runs);
                let _ = ack.send(result);
            }
            Request::AddSink(sink) => {
                self.sinks.push(sink);
            }
        }
    }

    fn create_run(&mut self, create: CreateRun) -> Result<(), StoreError> {
        let CreateRun {
            meta,
            plan,
            summary,
        } = create;
        let now_ns = now_ns();
        let plan_json = serde_json::to_string(&plan)?;
        let summary_json = serde_json::to_string(&summary)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO ktl_stack_runs
                 (run_id, stack_root, stack_name, profile, command, concurrency,
                  fail_mode, status, created_at_ns, updated_at_ns, completed_at_ns,
                  creator, host, pid, ci, git_commit, git_dirty,
                  selector_json, plan_json, summary_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                meta.run_id,
                meta.stack_root.display().to_string(),
                meta.stack_name,
                meta.profile,
                meta.command.as_str(),
                meta.concurrency,
                meta.fail_mode.as_str(),
                RunStatus::Running.as_str(),
                now_ns,
                now_ns,
                meta.creator,
                meta.host,
                meta.pid,
                meta.ci as i64,
                meta.git_commit,
                meta.git_dirty as i64,
                serde_json::to_string(&meta.selector)?,
                plan_json,
                summary_json,
            ],
        )?;
        for node in &plan.nodes {
            tx.execute(
                "INSERT INTO ktl_stack_nodes (run_id, node_id, status, attempt, updated_at_ns)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![meta.run_id, node.id, NodeStatus::Planned.as_str(), now_ns],
            )?;
        }
        tx.commit()?;

        self.chains.insert(meta.run_id.clone(), ChainHead::new());
        self.summaries.insert(meta.run_id.clone(), summary);
        Ok(())
    }

    fn complete_run(&mut self, run_id: &str, status: RunStatus) -> Result<String, StoreError> {
        if !self.chains.contains_key(run_id) {
            self.hydrate_run(run_id)?;
        }
        let mut summary = self
            .summaries
            .get(run_id)
            .cloned()
            .unwrap_or_default();
        summary.status = status;
        summary.recount();
        let summary_json = serde_json::to_string(&summary)?;

        let plan_json: String = self.conn.query_row(
            "SELECT plan_json FROM ktl_stack_runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        let last_digest = self
            .chains
            .get(run_id)
            .map(|c| c.last_digest().to_string())
            .unwrap_or_default();
        let run_digest =
            compute_run_digest(plan_json.as_bytes(), summary_json.as_bytes(), &last_digest);

        self.conn.execute(
            "UPDATE ktl_stack_runs
             SET status = ?2, summary_json = ?3, run_digest = ?4, completed_at_ns = ?5,
                 updated_at_ns = ?5
             WHERE run_id = ?1",
            params![run_id, status.as_str(), summary_json, run_digest, now_ns()],
        )?;
        self.summaries.insert(run_id.to_string(), summary);
        Ok(run_digest)
    }

    fn upsert_apply_cache(
        &mut self,
        key: &ApplyCacheKey,
        entry: &ApplyCacheEntry,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO ktl_stack_apply_cache
                 (cluster_key, namespace, release_name, command, effective_input_hash,
                  desired_digest, has_hooks, run_id, updated_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (cluster_key, namespace, release_name, command, effective_input_hash)
             DO UPDATE SET desired_digest = excluded.desired_digest,
                           has_hooks = excluded.has_hooks,
                           run_id = excluded.run_id,
                           updated_at_ns = excluded.updated_at_ns",
            params![
                key.cluster_key,
                key.namespace,
                key.release_name,
                key.command.as_str(),
                key.effective_input_hash,
                entry.desired_digest,
                entry.has_hooks as i64,
                entry.observed_at_run_id,
                entry.updated_at_ns,
            ],
        )?;
        Ok(())
    }

    fn prune_runs(&mut self, max_runs: usize) -> Result<usize, StoreError> {
        if max_runs == 0 {
            return Ok(0);
        }
        let pruned = self.conn.execute(
            "DELETE FROM ktl_stack_runs
             WHERE status IN ('succeeded', 'failed', 'canceled')
               AND run_id NOT IN (
                   SELECT run_id FROM ktl_stack_runs
                   ORDER BY created_at_ns DESC LIMIT ?1
               )",
            params![max_runs as i64],
        )?;
        Ok(pruned)
    }
}

fn chain_position(chain: &ChainHead) -> ChainPosition {
    ChainPosition {
        last_seq: chain.next_seq().saturating_sub(1),
        last_digest: chain.last_digest().to_string(),
    }
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Node status implied by an event type, if any.
fn node_status_for(event_type: EventType) -> Option<NodeStatus> {
    match event_type {
        EventType::NodeQueued => Some(NodeStatus::Queued),
        EventType::NodeRunning => Some(NodeStatus::Running),
        EventType::NodeSucceeded => Some(NodeStatus::Succeeded),
        EventType::NodeFailed => Some(NodeStatus::Failed),
        EventType::NodeBlocked => Some(NodeStatus::Blocked),
        EventType::RetryScheduled => Some(NodeStatus::Retrying),
        _ => None,
    }
}

fn upsert_step(tx: &rusqlite::Transaction<'_>, event: &RunEvent) -> Result<(), StoreError> {
    let node_id = event.node_id.as_deref().unwrap_or_default();
    let step = event
        .fields
        .get("step")
        .and_then(|v| v.as_str())
        .unwrap_or(event.message.as_str())
        .to_string();
    let started = event.event_type == EventType::PhaseStarted;
    let status = if started {
        "started"
    } else if event.error.is_some() {
        "failed"
    } else {
        "completed"
    };
    tx.execute(
        "INSERT INTO ktl_stack_node_steps
             (run_id, node_id, attempt, step, status, started_at_ns, completed_at_ns,
              error_class, error_message, error_digest, cursor_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (run_id, node_id, attempt, step)
         DO UPDATE SET status = excluded.status,
                       started_at_ns = COALESCE(ktl_stack_node_steps.started_at_ns,
                                                excluded.started_at_ns),
                       completed_at_ns = excluded.completed_at_ns,
                       error_class = excluded.error_class,
                       error_message = excluded.error_message,
                       error_digest = excluded.error_digest,
                       cursor_json = excluded.cursor_json",
        params![
            event.run_id,
            node_id,
            event.attempt,
            step,
            status,
            if started { Some(event.ts_ns()) } else { None },
            if started { None } else { Some(event.ts_ns()) },
            event.error.as_ref().map(|e| e.class.as_str()),
            event.error.as_ref().map(|e| e.message.clone()),
            event.error.as_ref().map(|e| e.digest.clone()),
            serde_json::to_string(&event.fields)?,
        ],
    )?;
    Ok(())
}

type EventRow = (i64, RunEvent);

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    let id: i64 = row.get(0)?;
    let ts_ns: i64 = row.get(2)?;
    let event_type: String = row.get(4)?;
    let fields_json: String = row.get(14)?;
    let event = RunEvent {
        seq: row.get::<_, i64>(10)? as u64,
        ts: DateTime::<Utc>::from_timestamp_nanos(ts_ns),
        run_id: row.get(1)?,
        node_id: row.get(3)?,
        event_type: event_type
            .parse()
            .map_err(|e: String| rusqlite::Error::InvalidColumnName(e))?,
        attempt: row.get(5)?,
        message: row.get(6)?,
        fields: serde_json::from_str(&fields_json).unwrap_or_default(),
        error: row_error(row, 7, 8, 9)?,
        prev_digest: row.get(11)?,
        digest: row.get(12)?,
        crc32: row.get::<_, i64>(13)? as u32,
    };
    Ok((id, event))
}

fn row_error(
    row: &rusqlite::Row<'_>,
    class_idx: usize,
    message_idx: usize,
    digest_idx: usize,
) -> rusqlite::Result<Option<RunError>> {
    let class: Option<String> = row.get(class_idx)?;
    let Some(class) = class else {
        return Ok(None);
    };
    let class = class
        .parse()
        .map_err(|e: String| rusqlite::Error::InvalidColumnName(e))?;
    Ok(Some(RunError {
        class,
        message: row.get::<_, Option<String>>(message_idx)?.unwrap_or_default(),
        digest: row.get::<_, Option<String>>(digest_idx)?.unwrap_or_default(),
    }))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> rusqlite::Result<T> {
    raw.parse()
        .map_err(rusqlite::Error::InvalidColumnName)
}

fn row_to_node_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRecord> {
    let status: String = row.get(1)?;
    let message: Option<String> = row.get(3)?;
    let class: Option<String> = row.get(4)?;
    let digest: Option<String> = row.get(5)?;
    let error = match (message, class) {
        (Some(message), Some(class)) => Some(RunError {
            class: parse_enum(&class)?,
            message,
            digest: digest.unwrap_or_default(),
        }),
        _ => None,
    };
    Ok(NodeRecord {
        node_id: row.get(0)?,
        status: parse_enum(&status)?,
        attempt: row.get(2)?,
        error,
    })
}
