//! Metadata commit pipeline.
//!
//! A single background worker drains dirty BAT pages into commit
//! transactions. Each transaction gets a fresh generation, writes its pages
//! stamped with it, flushes, bumps the delta headers, flushes again, and
//! only then wakes the writers waiting on that generation. Pages dirtied
//! after a drain belong to the next transaction.

use parking_lot::{Condvar, Mutex};
use ploop_delta::Delta;
use ploop_error::{PloopError, Result};
use ploop_types::Generation;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Runtime configuration for the commit pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPipelineConfig {
    /// Idle poll interval of the worker; writers kick it immediately.
    pub interval: Duration,
    /// Dirty-page bound beyond which producers block until a drain.
    pub dirty_page_budget: usize,
    /// Dirty-page backlog beyond which new writes are refused with
    /// `MetadataBackpressure`. Reads are never affected.
    pub backpressure_watermark: usize,
}

impl Default for CommitPipelineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            dirty_page_budget: 1024,
            backpressure_watermark: 768,
        }
    }
}

impl CommitPipelineConfig {
    pub fn validate(self) -> Result<Self> {
        if self.interval.is_zero() {
            return Err(PloopError::Format(
                "pipeline interval must be > 0".to_owned(),
            ));
        }
        if self.dirty_page_budget == 0 {
            return Err(PloopError::Format(
                "dirty_page_budget must be > 0".to_owned(),
            ));
        }
        if self.backpressure_watermark == 0
            || self.backpressure_watermark > self.dirty_page_budget
        {
            return Err(PloopError::Format(
                "backpressure_watermark must satisfy 0 < watermark <= budget".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Tracks generation durability and wakes waiting writers.
///
/// Writers call [`await_generation`](Self::await_generation) and block until
/// the generation is durable or the pipeline has recorded a failure at or
/// beyond it. The worker calls `notify_durable` after the header flush, or
/// `notify_failed` when a transaction cannot reach stable storage.
#[derive(Debug)]
pub struct GenerationNotifier {
    state: Mutex<NotifierState>,
    cv: Condvar,
}

#[derive(Debug)]
struct NotifierState {
    durable: Generation,
    failed: Option<(Generation, String)>,
}

impl GenerationNotifier {
    #[must_use]
    pub fn new(durable: Generation) -> Self {
        Self {
            state: Mutex::new(NotifierState {
                durable,
                failed: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Block until `wanted` is durable.
    pub fn await_generation(&self, wanted: Generation) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if let Some((failed, ref msg)) = state.failed {
                if wanted <= failed {
                    return Err(PloopError::Format(format!(
                        "metadata commit failed at generation {failed}: {msg}"
                    )));
                }
            }
            if wanted <= state.durable {
                return Ok(());
            }
            self.cv.wait(&mut state);
        }
    }

    #[must_use]
    pub fn durable(&self) -> Generation {
        self.state.lock().durable
    }

    /// Mark `generation` (and all prior) durable. Wakes all waiters.
    pub fn notify_durable(&self, generation: Generation) {
        {
            let mut state = self.state.lock();
            if generation > state.durable {
                state.durable = generation;
            }
        }
        self.cv.notify_all();
    }

    /// Record a failed transaction. Wakes all waiters.
    pub fn notify_failed(&self, generation: Generation, message: String) {
        {
            let mut state = self.state.lock();
            match &state.failed {
                Some((prev, _)) if *prev >= generation => {}
                _ => state.failed = Some((generation, message)),
            }
        }
        self.cv.notify_all();
    }
}

type PageKey = (u32, u32);

#[derive(Debug)]
struct PipeState {
    pending: BTreeMap<PageKey, Arc<Delta>>,
    /// Generation the next drained transaction will carry.
    next_txn: Generation,
    /// Generation of the transaction the worker is writing, if any.
    committing: Option<Generation>,
    force: bool,
    shutdown: bool,
    commits: u64,
    pages_committed: u64,
    commit_failures: u64,
}

#[derive(Debug)]
struct PipelineShared {
    config: CommitPipelineConfig,
    state: Mutex<PipeState>,
    /// Wakes the worker.
    work_cv: Condvar,
    /// Wakes producers blocked on the dirty-page budget.
    drain_cv: Condvar,
    notifier: GenerationNotifier,
}

/// Counters exported through engine metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub commits: u64,
    pub pages_committed: u64,
    pub commit_failures: u64,
    pub dirty_backlog: usize,
    pub durable_generation: u64,
}

/// Handle to the running pipeline worker.
#[derive(Debug)]
pub struct CommitPipeline {
    shared: Arc<PipelineShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl CommitPipeline {
    /// Start the worker. `durable` seeds the generation counter from the
    /// highest committed generation observed at open.
    pub fn start(config: CommitPipelineConfig, durable: Generation) -> Result<Self> {
        let config = config.validate()?;
        let shared = Arc::new(PipelineShared {
            config,
            state: Mutex::new(PipeState {
                pending: BTreeMap::new(),
                next_txn: durable.next(),
                committing: None,
                force: false,
                shutdown: false,
                commits: 0,
                pages_committed: 0,
                commit_failures: 0,
            }),
            work_cv: Condvar::new(),
            drain_cv: Condvar::new(),
            notifier: GenerationNotifier::new(durable),
        });

        let worker_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("ploop-commit".to_owned())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(PloopError::from)?;
        info!(
            target: "ploop::pipeline",
            event = "pipeline_started",
            durable = durable.0
        );
        Ok(Self {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    /// Queue a dirty BAT page and return the generation that will commit it.
    ///
    /// Blocks while the dirty backlog exceeds the budget.
    pub fn mark_dirty(&self, delta: &Arc<Delta>, page: u32) -> Result<Generation> {
        let mut state = self.shared.state.lock();
        while state.pending.len() >= self.shared.config.dirty_page_budget && !state.shutdown {
            self.shared.drain_cv.wait(&mut state);
        }
        if state.shutdown {
            return Err(PloopError::Format(
                "metadata pipeline is stopped".to_owned(),
            ));
        }
        state
            .pending
            .insert((delta.id().0, page), Arc::clone(delta));
        let target = state.next_txn;
        trace!(
            target: "ploop::pipeline",
            event = "page_marked_dirty",
            delta = delta.id().0,
            page,
            txn = target.0,
            backlog = state.pending.len()
        );
        drop(state);
        self.shared.work_cv.notify_one();
        Ok(target)
    }

    /// Block until `wanted` is durable.
    pub fn await_generation(&self, wanted: Generation) -> Result<()> {
        self.shared.notifier.await_generation(wanted)
    }

    /// Force a commit of everything marked so far and wait for it.
    ///
    /// Returns the durable generation at the barrier point.
    pub fn flush_barrier(&self) -> Result<Generation> {
        let target = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(PloopError::Format(
                    "metadata pipeline is stopped".to_owned(),
                ));
            }
            let target = if !state.pending.is_empty() {
                state.next_txn
            } else if let Some(committing) = state.committing {
                committing
            } else {
                self.shared.notifier.durable()
            };
            state.force = true;
            target
        };
        self.shared.work_cv.notify_one();
        self.shared.notifier.await_generation(target)?;
        Ok(target)
    }

    /// Highest generation known durable.
    #[must_use]
    pub fn durable_generation(&self) -> Generation {
        self.shared.notifier.durable()
    }

    /// Whether new writes should be refused until the backlog drains.
    #[must_use]
    pub fn write_backpressure(&self) -> bool {
        self.shared.state.lock().pending.len() > self.shared.config.backpressure_watermark
    }

    #[must_use]
    pub fn metrics(&self) -> PipelineMetrics {
        let state = self.shared.state.lock();
        PipelineMetrics {
            commits: state.commits,
            pages_committed: state.pages_committed,
            commit_failures: state.commit_failures,
            dirty_backlog: state.pending.len(),
            durable_generation: self.shared.notifier.durable().0,
        }
    }

    /// Request shutdown and join the worker. Remaining dirty pages are
    /// committed on the way out.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_cv.notify_one();
        self.shared.drain_cv.notify_all();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

impl Drop for CommitPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Arc<PipelineShared>) {
    loop {
        let (batch, generation, shutting_down) = {
            let mut state = shared.state.lock();
            while state.pending.is_empty() && !state.force && !state.shutdown {
                shared
                    .work_cv
                    .wait_for(&mut state, shared.config.interval);
            }
            let shutting_down = state.shutdown;
            state.force = false;
            if state.pending.is_empty() {
                state.committing = None;
                if shutting_down {
                    break;
                }
                // A barrier with nothing pending: everything already
                // durable, nothing to write.
                continue;
            }
            let batch = std::mem::take(&mut state.pending);
            let generation = state.next_txn;
            state.next_txn = generation.next();
            state.committing = Some(generation);
            (batch, generation, shutting_down)
        };
        shared.drain_cv.notify_all();

        let page_count = batch.len();
        let result = commit_transaction(generation, &batch);

        {
            let mut state = shared.state.lock();
            state.committing = None;
            match &result {
                Ok(()) => {
                    state.commits += 1;
                    state.pages_committed += page_count as u64;
                }
                Err(_) => {
                    state.commit_failures += 1;
                    // Pages went back to dirty in their caches; requeue so
                    // a later transaction retries them.
                    for (key, delta) in &batch {
                        state.pending.entry(*key).or_insert_with(|| Arc::clone(delta));
                    }
                }
            }
        }

        match result {
            Ok(()) => {
                debug!(
                    target: "ploop::pipeline",
                    event = "commit_durable",
                    generation = generation.0,
                    pages = page_count
                );
                shared.notifier.notify_durable(generation);
            }
            Err(err) => {
                error!(
                    target: "ploop::pipeline",
                    event = "commit_failed",
                    generation = generation.0,
                    pages = page_count,
                    error = %err
                );
                shared.notifier.notify_failed(generation, err.to_string());
            }
        }

        if shutting_down {
            // One final drain on the way out; a failing device is not
            // retried forever.
            break;
        }
    }
    trace!(target: "ploop::pipeline", event = "pipeline_worker_exit");
}

/// One commit transaction: pages (stamped `generation`), flush, headers,
/// flush. A failure at any step leaves the affected pages dirty.
fn commit_transaction(generation: Generation, batch: &BTreeMap<PageKey, Arc<Delta>>) -> Result<()> {
    let mut touched: Vec<&Arc<Delta>> = Vec::new();
    let mut outcome: Result<()> = Ok(());

    // Phase 1: page images with the new stamp.
    for (&(_, page), delta) in batch {
        if !touched.iter().any(|seen| seen.id() == delta.id()) {
            touched.push(delta);
        }
        if outcome.is_err() {
            continue;
        }
        let Some(bat) = delta.bat() else {
            outcome = Err(PloopError::Format("dirty page on raw base".to_owned()));
            continue;
        };
        match bat.snapshot_page_for_commit(page, generation) {
            Ok(encoded) => {
                if let Err(err) = delta.write_bat_page(page, &encoded) {
                    bat.finish_page_commit(page, false);
                    outcome = Err(err);
                }
            }
            Err(err) => outcome = Err(err),
        }
    }

    // Phase 2: make the pages durable before any header mentions them.
    if outcome.is_ok() {
        for delta in &touched {
            if let Err(err) = delta.flush() {
                outcome = Err(err);
                break;
            }
        }
    }

    // Phase 3: header bump + final flush.
    if outcome.is_ok() {
        for delta in &touched {
            if let Err(err) = delta.write_header_generation(generation) {
                outcome = Err(err);
                break;
            }
        }
    }
    if outcome.is_ok() {
        for delta in &touched {
            if let Err(err) = delta.flush() {
                outcome = Err(err);
                break;
            }
        }
    }

    let durable = outcome.is_ok();
    for (&(_, page), delta) in batch {
        if let Some(bat) = delta.bat() {
            bat.finish_page_commit(page, durable);
        }
        if durable {
            delta.mark_generation_durable(generation);
        }
    }
    outcome
}
