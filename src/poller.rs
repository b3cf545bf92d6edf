use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, error, info};

use crate::config::PollerConfig;
use crate::dispatch::WorkerPool;
use crate::email::{EmailError, MessageRef};
use crate::forwarder::{Forwarder, Outcome};
use crate::store::{AccessMode, FolderSession, MailStore};

const STOP_CHECK: Duration = Duration::from_millis(100);

/// What one poll cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Local>,
    pub listed: usize,
    pub forwarded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: Local::now(),
            listed: 0,
            forwarded: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.listed == 0 && self.errors.is_empty()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Poll cycle at {}: listed={}, forwarded={}, skipped={}, failed={}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.listed,
            self.forwarded,
            self.skipped,
            self.failed
        )
    }
}

struct PollCycle {
    store: Arc<dyn MailStore>,
    forwarder: Arc<Forwarder>,
    pool: Arc<WorkerPool>,
    config: PollerConfig,
    /// UIDs whose last handling failed. They are listed after fresh
    /// messages so a run of failures cannot fill every fetch window.
    deferred: Mutex<HashSet<u32>>,
}

impl PollCycle {
    fn run(&self) -> CycleReport {
        let mut report = CycleReport::new();

        let pending = match self.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to list {}: {}", self.config.folder, e);
                report.errors.push(e.to_string());
                return report;
            }
        };
        report.listed = pending.len();

        let (tx, rx) = mpsc::channel::<(u32, Result<Outcome, EmailError>)>();
        let mut dispatched = 0;

        for message in pending {
            let uid = message.uid;
            let forwarder = Arc::clone(&self.forwarder);
            let tx = tx.clone();

            let submitted = self.pool.submit(move || {
                let result = forwarder.handle(&message);
                let _ = tx.send((message.uid, result));
            });

            match submitted {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    error!("Could not dispatch message uid={}: {}", uid, e);
                    report.failed += 1;
                    report.errors.push(format!("uid {}: {}", uid, e));
                    self.settle(uid, false);
                }
            }
        }
        drop(tx);

        // Ends once every dispatched job has reported or died.
        let mut received = 0;
        for (uid, result) in rx {
            received += 1;
            match result {
                Ok(Outcome::Forwarded { .. }) => {
                    report.forwarded += 1;
                    self.settle(uid, true);
                }
                Ok(Outcome::Skipped(reason)) => {
                    debug!("Skipped message uid={}: {:?}", uid, reason);
                    report.skipped += 1;
                    self.settle(uid, true);
                }
                Err(e) => {
                    error!("Failed to forward message uid={}: {}", uid, e);
                    report.failed += 1;
                    report.errors.push(format!("uid {}: {}", uid, e));
                    self.settle(uid, false);
                }
            }
        }

        if received < dispatched {
            let lost = dispatched - received;
            report.failed += lost;
            report.errors.push(format!("{} job(s) ended without a result", lost));
        }

        report
    }

    fn list_pending(&self) -> Result<Vec<MessageRef>, EmailError> {
        let mut folder = self.store.open(&self.config.folder, AccessMode::ReadOnly)?;
        let listed = self.list(folder.as_mut());
        let closed = folder.close(false);

        let refs = listed?;
        closed?;
        Ok(refs)
    }

    fn list(&self, folder: &mut dyn FolderSession) -> Result<Vec<MessageRef>, EmailError> {
        let found = folder.search(&self.config.search_query)?;
        let uids = self.window(found);

        if uids.is_empty() {
            return Ok(Vec::new());
        }
        folder.fetch_refs(Some(uids.as_slice()))
    }

    /// Picks at most `max_fetch_size` UIDs: fresh ones lowest first, then
    /// the ones that failed before. Deferred UIDs no longer found are
    /// dropped.
    fn window(&self, found: Vec<u32>) -> Vec<u32> {
        let mut deferred = match self.deferred.lock() {
            Ok(deferred) => deferred,
            Err(poisoned) => poisoned.into_inner(),
        };
        deferred.retain(|uid| found.contains(uid));

        let (retry, fresh): (Vec<u32>, Vec<u32>) =
            found.into_iter().partition(|uid| deferred.contains(uid));
        fresh
            .into_iter()
            .chain(retry)
            .take(self.config.max_fetch_size)
            .collect()
    }

    fn settle(&self, uid: u32, done: bool) {
        let mut deferred = match self.deferred.lock() {
            Ok(deferred) => deferred,
            Err(poisoned) => poisoned.into_inner(),
        };
        if done {
            deferred.remove(&uid);
        } else {
            deferred.insert(uid);
        }
    }
}

/// Fixed-delay poller: runs a cycle, waits for all of its jobs, sleeps
/// `interval_secs`, repeats.
pub struct Poller {
    cycle: Arc<PollCycle>,
    interval: Duration,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new(
        store: Arc<dyn MailStore>,
        forwarder: Arc<Forwarder>,
        pool: Arc<WorkerPool>,
        config: PollerConfig,
    ) -> Self {
        let interval = Duration::from_secs(config.interval_secs);
        Self {
            cycle: Arc::new(PollCycle {
                store,
                forwarder,
                pool,
                config,
                deferred: Mutex::new(HashSet::new()),
            }),
            interval,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Runs a single cycle on the calling thread.
    pub fn poll_once(&self) -> CycleReport {
        let report = self.cycle.run();
        log_report(&report);
        report
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn start(&mut self) -> Result<(), EmailError> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Relaxed);

        let cycle = Arc::clone(&self.cycle);
        let running = Arc::clone(&self.running);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("mail-relay-poller".to_string())
            .spawn(move || {
                info!(
                    "Poller started: every {}s on {}",
                    interval.as_secs(),
                    cycle.config.folder
                );
                while running.load(Ordering::Relaxed) {
                    let report = cycle.run();
                    log_report(&report);

                    let wake_at = Instant::now() + interval;
                    while running.load(Ordering::Relaxed) && Instant::now() < wake_at {
                        thread::sleep(STOP_CHECK.min(wake_at.saturating_duration_since(Instant::now())));
                    }
                }
                info!("Poller stopped");
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                error!("Error joining poller thread: {:?}", e);
            }
        }
    }

    /// Blocks the caller until the poller thread exits.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                error!("Error joining poller thread: {:?}", e);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_report(report: &CycleReport) {
    if report.is_idle() {
        debug!("{}", report);
    } else {
        info!("{}", report);
    }
}
