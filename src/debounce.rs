use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Cooperative cancellation handle minted from a generation counter. The
/// signal trips once the counter moves past the generation it was issued
/// for, so a stale handle can never cancel a newer run.
#[derive(Clone)]
pub struct CancelSignal {
    generation: Arc<AtomicU64>,
    mine: u64,
}

impl CancelSignal {
    pub fn subscribe(generation: &Arc<AtomicU64>) -> Self {
        Self {
            generation: Arc::clone(generation),
            mine: generation.load(Ordering::SeqCst),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.mine
    }
}

struct PendingRun {
    handle: JoinHandle<()>,
    started: Arc<AtomicBool>,
}

/// One lookup per quiet trigger stream. A newer trigger aborts a run still
/// waiting out its quiet period and trips the cancellation signal handed to
/// an executing one; the guard mutex keeps at most one lookup executing at a
/// time.
pub struct Debouncer {
    quiet: Duration,
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<PendingRun>>,
    guard: Arc<AsyncMutex<()>>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Schedules `lookup` to run after the quiet period elapses with no
    /// newer trigger. Must be called from within a tokio runtime.
    pub fn trigger<F, Fut>(&self, lookup: F)
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Some(self.quiet), lookup);
    }

    /// Runs `lookup` right away, superseding any pending or executing run.
    /// Still serialized behind the guard.
    pub fn trigger_now<F, Fut>(&self, lookup: F)
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(None, lookup);
    }

    /// Discards a pending run and signals an executing one to stand down.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = pending.take() {
            abort_if_waiting(previous);
        }
    }

    fn schedule<F, Fut>(&self, quiet: Option<Duration>, lookup: F)
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // The pending lock spans the generation bump and the swap so two
        // racing triggers cannot abort each other's fresh run.
        let mut pending = self.pending.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let signal = CancelSignal::subscribe(&self.generation);
        let started = Arc::new(AtomicBool::new(false));
        let task_started = Arc::clone(&started);
        let guard = Arc::clone(&self.guard);
        let handle = tokio::spawn(async move {
            if let Some(quiet) = quiet {
                sleep(quiet).await;
            }
            if signal.is_cancelled() {
                return;
            }
            task_started.store(true, Ordering::SeqCst);
            let _lock = guard.lock().await;
            if signal.is_cancelled() {
                return;
            }
            lookup(signal).await;
        });

        if let Some(previous) = pending.replace(PendingRun { handle, started }) {
            abort_if_waiting(previous);
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// A run that has reached its lookup only ever stands down cooperatively;
// aborting is reserved for the quiet-period wait.
fn abort_if_waiting(run: PendingRun) {
    if !run.started.load(Ordering::SeqCst) {
        run.handle.abort();
    }
}
