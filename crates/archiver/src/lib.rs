#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-archiver` watches `out/` and coalesces staged files into as few
//! tape-write sessions as the backlog justifies. The threshold ladder in
//! [`thresholds`] scales the concurrent session count with total usage; the
//! carving in [`chunk`] packs oldest files first so each session streams a
//! contiguous slice of arrivals.
//!
//! The daemon never deletes `out/` entries itself: the tape client runs with
//! `-deletefiles` and unlinking is the archive-success signal the plugin
//! watches for. A file still present when its worker exits is a retry
//! candidate and shortens the inactivity timeout until the backlog flushes.

pub mod chunk;
pub mod thresholds;

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

use endit_config::{Component, Config};
use endit_core::error::CoreError;
use endit_core::signals::{sleep_interruptible, SignalFlags, SleepInterrupt};
use endit_core::staging::{StagedEntry, StagingTree};
use endit_stats::Stats;
use endit_tsm::command::{archive_description, DsmcCommand, Operation};
use endit_tsm::output::error_lines;
use endit_tsm::worker::SpawnOptions;
use endit_tsm::{FileList, Worker};

use thresholds::{spawn_size, ThresholdLadder, TickInput, TriggerState};

/// Age after which leftovers in `in/` and `requestlists/` are removed at
/// startup.
const STALE_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Pause between session spawns; paces the tape server and keeps the
/// second-resolution session descriptions unique.
const SPAWN_PACING: Duration = Duration::from_secs(2);

/// Result type for archiver operations.
pub type ArchiverResult<T> = Result<T, ArchiverError>;

/// Fatal archiver failures. Everything else is logged and retried next tick.
#[derive(Debug, Error)]
pub enum ArchiverError {
    /// Staging tree unusable.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Could not fork a tape-client worker; siblings are killed before this
    /// surfaces.
    #[error("failed to spawn tape client: {0}")]
    Spawn(io::Error),
}

/// The archiver daemon.
pub struct Archiver {
    config: Config,
    tree: StagingTree,
    flags: SignalFlags,
    stats: Stats,
    workers: Vec<Worker>,
    state: TriggerState,
    retries: HashMap<String, u64>,
    dsmc_program: std::ffi::OsString,
    timer_was_running: bool,
}

impl Archiver {
    /// Builds the daemon from loaded configuration and registered signal
    /// flags.
    #[must_use]
    pub fn new(config: Config, flags: SignalFlags) -> Self {
        let tree = StagingTree::new(config.base_dir());
        let stats = Stats::new(config.statdir(), &config.desc_short(), "archiver");
        Self {
            config,
            tree,
            flags,
            stats,
            workers: Vec::new(),
            state: TriggerState::new(),
            retries: HashMap::new(),
            dsmc_program: "dsmc".into(),
            timer_was_running: false,
        }
    }

    /// Overrides the tape-client binary. Test hook.
    pub fn set_program<S: Into<std::ffi::OsString>>(&mut self, program: S) {
        self.dsmc_program = program.into();
    }

    /// Running worker count.
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.workers.len()
    }

    /// Prepares the tree and runs the supervisor loop until shutdown.
    ///
    /// # Errors
    ///
    /// Fatal failures only: unusable staging tree or a failed spawn.
    pub fn run(mut self) -> ArchiverResult<()> {
        self.tree.prepare(self.config.debug())?;
        let removed = self.tree.clean_stale(STALE_AGE)?;
        info!(
            base = %self.tree.base().display(),
            stale_removed = removed,
            "archiver starting"
        );

        loop {
            if self.flags.shutdown_requested() {
                self.shutdown();
                return Ok(());
            }
            let worker_exited = self.run_once()?;
            let pause = if worker_exited {
                Duration::from_secs(1)
            } else {
                self.config.sleeptime()
            };
            if sleep_interruptible(&self.flags, pause) == SleepInterrupt::Shutdown {
                self.shutdown();
                return Ok(());
            }
        }
    }

    /// One supervisor tick: reap, sample, decide, spawn, publish.
    ///
    /// Returns whether any worker exited, so the caller shortens the next
    /// sleep.
    ///
    /// # Errors
    ///
    /// Fatal failures only; transient scan errors are logged and retried.
    pub fn run_once(&mut self) -> ArchiverResult<bool> {
        self.config.poll_override(Component::Archiver);
        let reaped = self.reap_workers();

        let out = self.tree.out_dir();
        let entries = match self.tree.scan_payload(&out) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cannot scan out/, retrying next tick");
                return Ok(reaped);
            }
        };

        let all_usage: u64 = entries.iter().map(|e| e.size).sum();
        let all_files = entries.len() as u64;

        let owned: HashSet<&str> = self
            .workers
            .iter()
            .flat_map(|w| w.files().keys().map(String::as_str))
            .collect();
        let mut pending: Vec<StagedEntry> = entries
            .iter()
            .filter(|e| !owned.contains(e.id.as_str()))
            .cloned()
            .collect();
        let pending_usage: u64 = pending.iter().map(|e| e.size).sum();
        let pending_files = pending.len() as u64;

        // A retry candidate that left out/ was flushed by a later session.
        let present: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        self.retries.retain(|id, _| present.contains(id.as_str()));

        let skip_delays = self.flags.take_wake();
        if skip_delays {
            if pending_usage > 0 {
                info!("USR1 received, bypassing archive delays this pass");
            } else {
                info!("USR1 received but nothing is pending, ignoring");
            }
        }

        let timeout = if self.retries.is_empty() {
            self.config.archiver_timeout()
        } else {
            self.config
                .archiver_timeout()
                .min(self.config.archiver_retrytimeout())
        };

        let ladder = self.ladder();
        let decision = self.state.assess(
            &ladder,
            TickInput {
                all_usage,
                pending_usage,
                workers: self.workers.len(),
                skip_delays,
            },
            timeout,
            Instant::now(),
        );

        if decision.timer_running != self.timer_was_running {
            if decision.timer_running {
                info!(
                    usage = all_usage,
                    timeout = timeout.as_secs(),
                    "no threshold fired, inactivity timer running"
                );
            } else {
                debug!("inactivity timer cleared");
            }
            self.timer_was_running = decision.timer_running;
        }

        if decision.trigger_level > self.workers.len() {
            self.spawn_sessions(decision.trigger_level, all_usage, &mut pending)?;
        }

        let working_bytes = all_usage - pending_usage;
        let working_files = all_files - pending_files;
        self.stats.set("usage_bytes", all_usage);
        self.stats.set("usage_files", all_files);
        self.stats.set("working_bytes", working_bytes);
        self.stats.set("working_files", working_files);
        self.stats.set("pending_bytes", pending_usage);
        self.stats.set("pending_files", pending_files);
        self.stats.set("busyworkers", self.workers.len() as u64);
        self.stats.set("maxworkers", ladder.max_level() as u64);
        if let Err(e) = self.stats.publish() {
            warn!(error = %e, "could not publish statistics");
        }

        Ok(reaped)
    }

    fn ladder(&self) -> ThresholdLadder {
        let mut rungs = [None; 10];
        for (level, slot) in rungs.iter_mut().enumerate().skip(1) {
            *slot = self.config.archiver_threshold_bytes(level);
        }
        ThresholdLadder::new(rungs)
    }

    fn spawn_sessions(
        &mut self,
        trigger_level: usize,
        all_usage: u64,
        pending: &mut Vec<StagedEntry>,
    ) -> ArchiverResult<()> {
        let to_spawn = trigger_level - self.workers.len();
        chunk::sort_oldest_first(pending);
        let chunk_size = spawn_size(all_usage, trigger_level);

        for n in 0..to_spawn {
            let selected = chunk::carve(pending, chunk_size);
            if selected.is_empty() {
                break;
            }

            let files: HashMap<String, u64> = selected
                .iter()
                .map(|e| (e.id.clone(), e.size))
                .collect();
            let paths: Vec<_> = selected.iter().map(|e| self.tree.out_file(&e.id)).collect();
            let bytes: u64 = files.values().sum();

            let list = FileList::create(&self.tree.requestlist_dir(), "archive", paths)?;
            let mut cmd = DsmcCommand::new(Operation::Archive {
                description: archive_description(Local::now()),
            });
            cmd.set_program(&self.dsmc_program)
                .base_opts(self.config.dsmc_opts())
                .filelist(list.path())
                .cpu_limit(self.config.dsmc_cpulimit());

            let worker = match Worker::spawn(
                cmd.build(),
                list,
                files,
                None,
                SpawnOptions::default(),
            ) {
                Ok(worker) => worker,
                Err(e) => {
                    self.kill_workers();
                    return Err(ArchiverError::Spawn(e));
                }
            };
            info!(
                pid = worker.pid(),
                files = worker.files().len(),
                bytes,
                list = %worker.listfile().display(),
                "archive session started"
            );
            self.workers.push(worker);

            if n + 1 < to_spawn
                && sleep_interruptible(&self.flags, SPAWN_PACING) == SleepInterrupt::Shutdown
            {
                break;
            }
        }
        Ok(())
    }

    fn reap_workers(&mut self) -> bool {
        let mut reaped = false;
        let mut index = 0;
        while index < self.workers.len() {
            match self.workers[index].try_reap() {
                Ok(Some(status)) => {
                    let worker = self.workers.remove(index);
                    self.record_outcome(worker, status.success());
                    reaped = true;
                }
                Ok(None) => index += 1,
                Err(e) => {
                    warn!(error = %e, "could not reap worker");
                    index += 1;
                }
            }
        }
        reaped
    }

    fn record_outcome(&mut self, mut worker: Worker, success: bool) {
        let mut flushed_bytes = 0u64;
        let mut flushed_files = 0u64;
        let mut retrying = 0u64;
        for (id, size) in worker.files() {
            match StagingTree::stat_size(&self.tree.out_file(id)) {
                Ok(None) => {
                    flushed_bytes += size;
                    flushed_files += 1;
                }
                // Still present (or unreadable): the client failed silently
                // for this entry.
                _ => {
                    self.retries.insert(id.clone(), *size);
                    retrying += 1;
                }
            }
        }
        worker.mark_counted();

        self.stats.add("flushed_bytes", flushed_bytes);
        self.stats.add("flushed_files", flushed_files);
        if retrying > 0 {
            self.stats.add("flush_retries", retrying);
        }

        let elapsed = worker.elapsed();
        if success && retrying == 0 {
            info!(
                pid = worker.pid(),
                files = flushed_files,
                bytes = flushed_bytes,
                seconds = elapsed.as_secs(),
                rate_mib_s = rate_mib_per_s(flushed_bytes, elapsed),
                "archive session finished"
            );
        } else {
            let output = worker.output();
            let errors = error_lines(&output);
            warn!(
                pid = worker.pid(),
                flushed = flushed_files,
                retrying,
                "archive session ended with leftovers"
            );
            for line in errors.iter().take(20) {
                warn!(tsm = *line, "tape client message");
            }
        }
    }

    fn kill_workers(&mut self) {
        for worker in &mut self.workers {
            worker.kill();
        }
    }

    fn shutdown(&mut self) {
        info!(workers = self.workers.len(), "shutdown requested, killing workers");
        self.kill_workers();
        for worker in &mut self.workers {
            let _ = worker.try_reap();
        }
        self.workers.clear();
    }
}

fn rate_mib_per_s(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(0.001);
    bytes as f64 / (1024.0 * 1024.0) / secs
}
