use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};

use ktl_stack_store::EventSink;
use ktl_stack_types::RunEvent;

/// Consumer of run progress. Persistent events arrive post-store on the
/// writer tick; ephemeral events arrive on a dedicated delivery thread and
/// are dropped (and counted) when the observer cannot keep up.
pub trait RunObserver: Send + Sync {
    fn on_run_event(&self, event: &RunEvent);
    fn on_ephemeral_event(&self, event: &RunEvent);
}

struct Registration {
    observer: Arc<dyn RunObserver>,
    ephemeral_tx: SyncSender<RunEvent>,
    dropped: Arc<AtomicU64>,
}

/// Fan-out point for run events. Cloneable across the runner's worker
/// threads; all clones share the same observer set.
#[derive(Clone, Default)]
pub struct ObserverHub {
    inner: Arc<Mutex<Vec<Registration>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Spawns a detached, bounded delivery thread for
    /// its ephemeral stream so a slow observer can only hurt itself; the
    /// thread drains and exits once the hub is dropped.
    pub fn register(&self, observer: Arc<dyn RunObserver>) {
        let (tx, rx) = sync_channel::<RunEvent>(256);
        let for_worker = Arc::clone(&observer);
        let _ = std::thread::Builder::new()
            .name("ktl-stack-observer".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    for_worker.on_ephemeral_event(&event);
                }
            });
        self.lock().push(Registration {
            observer,
            ephemeral_tx: tx,
            dropped: Arc::new(AtomicU64::new(0)),
        });
    }

    /// Broadcast an ephemeral event to live observers. Never blocks; full
    /// queues drop the event and bump the observer's counter.
    pub fn emit_ephemeral(&self, event: &RunEvent) {
        for registration in self.lock().iter() {
            match registration.ephemeral_tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    registration.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Total ephemeral events dropped across all observers.
    pub fn dropped_ephemeral(&self) -> u64 {
        self.lock()
            .iter()
            .map(|r| r.dropped.load(Ordering::Relaxed))
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.inner.lock().expect("observer hub poisoned")
    }
}

/// Store-side sink: persistent observers run synchronously after each
/// committed batch.
impl EventSink for ObserverHub {
    fn on_committed(&self, events: &[RunEvent]) {
        for registration in self.lock().iter() {
            for event in events {
                registration.observer.on_run_event(event);
            }
        }
    }
}
