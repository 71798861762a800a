/*!
 * Run the engine for every terminal that has pending positions.
 *
 * Terminals don't share any state, so they are spread across a pool of worker threads. Each
 * worker opens its own store connection and drains one terminal at a time.
 */

use crate::{
    engine::{AssociationConfig, AssociationSummary, ClusterAssociationEngine},
    error::{AssociationError, GeoVisitResult},
    lock::TerminalLocks,
    store::VisitStore,
    TerminalId,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use rustc_hash::FxHashSet as HashSet;
use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

const CHANNEL_SIZE: usize = 128;

/// How a batch run is set up.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Thresholds for the engine.
    pub config: AssociationConfig,
    /// Maximum positions per engine call.
    pub batch_size: usize,
    /// Number of worker threads.
    pub workers: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            config: AssociationConfig::default(),
            batch_size: 500,
            workers: num_cpus::get(),
        }
    }
}

/// The outcome of draining a single terminal.
#[derive(Debug)]
pub struct TerminalReport {
    pub terminal: TerminalId,
    /// Everything that was committed, even if an error stopped the terminal part way.
    pub summary: AssociationSummary,
    pub error: Option<AssociationError>,
}

/// Totals for a whole batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Terminals that were handed to a worker.
    pub terminals: usize,
    /// Terminals skipped because another run held them.
    pub busy: usize,
    /// Terminals stopped by a store failure.
    pub failed: usize,
    /// Sum of the work done on all terminals.
    pub totals: AssociationSummary,
}

impl BatchSummary {
    fn add_report(&mut self, report: &TerminalReport) {
        self.terminals += 1;
        self.totals.absorb(&report.summary);

        match &report.error {
            Some(err) if err.is_busy() => self.busy += 1,
            Some(_) => self.failed += 1,
            None => {}
        }
    }
}

impl Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        writeln!(f, "    Terminals: {:>9}", self.terminals)?;
        writeln!(f, "         Busy: {:>9}", self.busy)?;
        writeln!(f, "       Failed: {:>9}", self.failed)?;
        writeln!(f, "    Processed: {:>9}", self.totals.processed)?;
        writeln!(f, " New Clusters: {:>9}", self.totals.new_clusters)?;
        writeln!(f, "   New Visits: {:>9}", self.totals.new_visits)?;
        writeln!(f, "       Merged: {:>9}", self.totals.merges)?;
        writeln!(f, "      Skipped: {:>9}", self.totals.skipped)?;
        write!(f, "    Cancelled: {:>9}", self.totals.cancelled)
    }
}

/// Runs the engine over every terminal with pending work.
pub struct BatchDriver<F> {
    open_store: Arc<F>,
    options: BatchOptions,
    locks: TerminalLocks,
    cancel: Arc<AtomicBool>,
}

impl<F, S> BatchDriver<F>
where
    F: Fn() -> GeoVisitResult<S> + Send + Sync + 'static,
    S: VisitStore,
{
    /// Create a driver. `open_store` is called once on the calling thread to find work, then once
    /// in each worker thread.
    pub fn new(open_store: F, options: BatchOptions) -> Self {
        BatchDriver {
            open_store: Arc::new(open_store),
            options,
            locks: TerminalLocks::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a lock registry with other drivers or engines in this process.
    pub fn with_locks(mut self, locks: TerminalLocks) -> Self {
        self.locks = locks;
        self
    }

    /// A flag that stops the run between positions when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Process every terminal that has pending positions.
    pub fn run(&self) -> GeoVisitResult<BatchSummary> {
        if self.options.batch_size == 0 {
            return Err("batch size must be at least 1".into());
        }
        self.options.config.validate().map_err(|err| err.to_string())?;

        let terminals = (self.open_store)()?.terminals_with_pending_positions()?;
        info!(target: "driver", "{} terminals with pending positions", terminals.len());

        let (to_workers, from_dispatcher) = bounded(CHANNEL_SIZE);
        let (to_collector, from_workers) = bounded(CHANNEL_SIZE);

        let dispatcher = self.dispatcher(terminals, to_workers)?;

        let mut workers = Vec::with_capacity(self.options.workers.max(1));
        for i in 0..self.options.workers.max(1) {
            workers.push(self.worker(i, from_dispatcher.clone(), to_collector.clone())?);
        }

        // Only the workers hold senders now, so collection ends when they are all done.
        drop(from_dispatcher);
        drop(to_collector);

        let mut summary = BatchSummary::default();
        for report in from_workers {
            match &report.error {
                Some(err) if err.is_busy() => {
                    info!(target: "driver", "terminal {} busy, leaving it for the next run",
                        report.terminal)
                }
                Some(err) => {
                    warn!(target: "driver", "terminal {} stopped: {}", report.terminal, err)
                }
                None => {}
            }

            summary.add_report(&report);
        }

        dispatcher
            .join()
            .map_err(|_| "dispatcher thread panicked")?;

        for jh in workers {
            jh.join().map_err(|_| "worker thread panicked")??;
        }

        Ok(summary)
    }

    fn dispatcher(
        &self,
        terminals: Vec<TerminalId>,
        to_workers: Sender<TerminalId>,
    ) -> GeoVisitResult<JoinHandle<()>> {
        let cancel = Arc::clone(&self.cancel);

        let jh = std::thread::Builder::new()
            .name("geovisit-dispatch".to_owned())
            .spawn(move || {
                for terminal in terminals {
                    if cancel.load(Ordering::Acquire) {
                        debug!(target: "driver", "cancelled, not dispatching more terminals");
                        break;
                    }

                    if to_workers.send(terminal).is_err() {
                        break;
                    }
                }
            })?;

        Ok(jh)
    }

    fn worker(
        &self,
        num: usize,
        from_dispatcher: Receiver<TerminalId>,
        to_collector: Sender<TerminalReport>,
    ) -> GeoVisitResult<JoinHandle<GeoVisitResult<()>>> {
        let open_store = Arc::clone(&self.open_store);
        let locks = self.locks.clone();
        let cancel = Arc::clone(&self.cancel);
        let config = self.options.config;
        let batch_size = self.options.batch_size;

        let jh = std::thread::Builder::new()
            .name(format!("geovisit-worker-{}", num))
            .spawn(move || {
                let store = open_store()?;
                let mut engine = ClusterAssociationEngine::new(store, config, locks)
                    .with_cancel_flag(Arc::clone(&cancel));
                debug!(target: "driver", "worker {} started with {:?}", num, engine.config());

                for terminal in from_dispatcher {
                    if cancel.load(Ordering::Acquire) {
                        break;
                    }

                    let report = drain_terminal(&mut engine, terminal, batch_size);
                    to_collector.send(report)?;
                }

                Ok(())
            })?;

        Ok(jh)
    }
}

/// Call the engine until the terminal has nothing left that it can process.
///
/// Bad rows stay pending and can be fetched by more than one call, the `skipped` total counts
/// each of them once.
pub fn drain_terminal<S: VisitStore>(
    engine: &mut ClusterAssociationEngine<S>,
    terminal: TerminalId,
    batch_size: usize,
) -> TerminalReport {
    let mut total = AssociationSummary::default();
    let mut skipped: HashSet<_> = HashSet::default();

    loop {
        let result = engine.associate_for_terminal(terminal, batch_size);
        skipped.extend(engine.skipped_positions().iter().copied());

        match result {
            Ok(summary) => {
                total.absorb(&summary);
                total.skipped = skipped.len();

                // A short batch means the backlog is empty, and a batch with no progress means
                // everything left is bad data that will just be fetched again.
                if summary.cancelled || summary.processed == 0 || summary.fetched < batch_size {
                    return TerminalReport {
                        terminal,
                        summary: total,
                        error: None,
                    };
                }
            }
            Err(err) => {
                total.skipped = skipped.len();
                return TerminalReport {
                    terminal,
                    summary: total,
                    error: Some(err),
                }
            }
        }
    }
}
