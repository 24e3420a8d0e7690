#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-retriever` turns pending retrieval requests into as few tape
//! mounts as possible. Requests ingested from `request/` ([`requests`]) are
//! tagged with their tape volume from the hint file ([`hints`]), grouped
//! into per-volume jobs ([`volumes`]) and started oldest-first, with fill
//! and remount delays amortising each mount. Free space on the `in/`
//! filesystem gates everything ([`buffer`]): backlog pressure pauses new
//! workers, and a nearly exhausted buffer kills the running ones.
//!
//! Worker exit codes are advisory. The plugin decides success by observing
//! `in/<ID>` with the right size; the retriever's job is only to keep the
//! tape client fed and the staging tree honest.

pub mod buffer;
pub mod hints;
pub mod requests;
pub mod volumes;

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

use endit_config::{Component, Config};
use endit_core::error::CoreError;
use endit_core::signals::{sleep_interruptible, SignalFlags, SleepInterrupt};
use endit_core::staging::StagingTree;
use endit_stats::Stats;
use endit_tsm::command::{DsmcCommand, Operation};
use endit_tsm::output::error_lines;
use endit_tsm::worker::SpawnOptions;
use endit_tsm::{FileList, Worker};

use buffer::BufferState;
use hints::HintTable;
use requests::RequestCache;
use volumes::{build_jobs, may_start, StartPolicy, StartVerdict, VolumeJob};

/// Age after which leftovers in `in/` and `requestlists/` are removed at
/// startup.
const STALE_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Result type for retriever operations.
pub type RetrieverResult<T> = Result<T, RetrieverError>;

/// Fatal retriever failures. Everything else is logged and retried.
#[derive(Debug, Error)]
pub enum RetrieverError {
    /// Staging tree unusable.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Could not fork a tape-client worker.
    #[error("failed to spawn tape client: {0}")]
    Spawn(io::Error),
}

/// How soon the supervisor should tick again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickPace {
    /// Nothing happening; sleep the full interval.
    Normal,
    /// A worker exited; tick again in about a second.
    WorkerExited,
    /// Jobs are waiting for a worker slot; tick again in half a second.
    SlotWait,
}

/// The retriever daemon.
pub struct Retriever {
    config: Config,
    tree: StagingTree,
    flags: SignalFlags,
    stats: Stats,
    cache: RequestCache,
    hints: HintTable,
    workers: Vec<Worker>,
    last_mount: HashMap<String, SystemTime>,
    cooldown_until: Option<Instant>,
    dsmc_program: OsString,
}

impl Retriever {
    /// Builds the daemon from loaded configuration and registered signal
    /// flags.
    #[must_use]
    pub fn new(config: Config, flags: SignalFlags) -> Self {
        let tree = StagingTree::new(config.base_dir());
        let stats = Stats::new(config.statdir(), &config.desc_short(), "retriever");
        let hints = HintTable::new(config.retriever_hintfile());
        Self {
            config,
            tree,
            flags,
            stats,
            cache: RequestCache::new(),
            hints,
            workers: Vec::new(),
            last_mount: HashMap::new(),
            cooldown_until: None,
            dsmc_program: "dsmc".into(),
        }
    }

    /// Overrides the tape-client binary. Test hook.
    pub fn set_program<S: Into<OsString>>(&mut self, program: S) {
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
    pub fn run(mut self) -> RetrieverResult<()> {
        self.tree.prepare(self.config.debug())?;
        let removed = self.tree.clean_stale(STALE_AGE)?;
        info!(
            base = %self.tree.base().display(),
            stale_removed = removed,
            "retriever starting"
        );

        loop {
            if self.flags.shutdown_requested() {
                self.shutdown();
                return Ok(());
            }
            let pace = self.run_once()?;
            let pause = match pace {
                TickPace::Normal => self.config.sleeptime(),
                TickPace::WorkerExited => Duration::from_secs(1),
                TickPace::SlotWait => Duration::from_millis(500),
            };
            if sleep_interruptible(&self.flags, pause) == SleepInterrupt::Shutdown {
                self.shutdown();
                return Ok(());
            }
        }
    }

    /// One supervisor tick.
    ///
    /// # Errors
    ///
    /// Fatal failures only; transient scan errors are logged and retried.
    pub fn run_once(&mut self) -> RetrieverResult<TickPace> {
        self.config.poll_override(Component::Retriever);
        let reaped = self.reap_workers();

        let in_dir = self.tree.in_dir();
        let fs = match buffer::fs_usage(&in_dir) {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "cannot stat in/ filesystem, deferring to next tick");
                return Ok(if reaped { TickPace::WorkerExited } else { TickPace::Normal });
            }
        };
        let buffer_state = buffer::buffer_state(
            fs,
            self.config.retriever_buffersize_bytes(),
            self.config.retriever_backlogthreshold(),
            self.config.retriever_killthreshold(),
        );
        let mut killed = false;
        if buffer_state == BufferState::Kill && !self.workers.is_empty() {
            warn!(
                avail = fs.avail,
                "in/ filesystem critically low, killing retrieve workers"
            );
            for worker in &mut self.workers {
                worker.kill();
            }
            killed = true;
        }

        if self.hints.poll() {
            self.cache.invalidate_all();
        }
        if let Err(e) = self.cache.refresh(&self.tree, &self.hints) {
            warn!(error = %e, "cannot scan request/, retrying next tick");
        }

        let skip_delays = self.flags.take_wake();
        if skip_delays {
            info!("USR1 received, bypassing retrieve delays this pass");
        }

        let mut slot_wait = false;
        let in_cooldown = self
            .cooldown_until
            .is_some_and(|until| Instant::now() < until);
        if buffer_state == BufferState::Ok && !in_cooldown {
            slot_wait = self.start_jobs(skip_delays)?;
        } else if buffer_state != BufferState::Ok {
            debug!(?buffer_state, "buffer pressure, not starting workers");
        }

        self.publish_stats(fs.avail);

        Ok(if reaped || killed {
            TickPace::WorkerExited
        } else if slot_wait {
            TickPace::SlotWait
        } else {
            TickPace::Normal
        })
    }

    /// Walks startable jobs oldest-first. Returns whether jobs were left
    /// waiting for a free worker slot.
    fn start_jobs(&mut self, skip_delays: bool) -> RetrieverResult<bool> {
        let max_workers = self.config.retriever_maxworkers();
        let policy = StartPolicy {
            remount_delay: self.config.retriever_remountdelay(),
            fill_wait: self.config.retriever_reqlistfillwait(),
            fill_wait_max: self.config.retriever_reqlistfillwaitmax(),
        };

        let held: HashSet<String> = self
            .workers
            .iter()
            .filter_map(|w| w.tape().map(str::to_owned))
            .collect();
        // No identifier may be handed to two workers, even if a hint reload
        // moved it to another volume mid-retrieve.
        let owned: HashSet<String> = self
            .workers
            .iter()
            .flat_map(|w| w.files().keys().cloned())
            .collect();
        let jobs = build_jobs(
            self.cache.entries().filter(|r| !owned.contains(&r.id)),
            &held,
        );
        let now = SystemTime::now();

        for job in jobs {
            if self.workers.len() >= max_workers {
                return Ok(true);
            }
            match may_start(
                &job,
                self.last_mount.get(&job.volume).copied(),
                now,
                policy,
                skip_delays,
            ) {
                StartVerdict::Start => {
                    self.spawn_worker(&job)?;
                }
                StartVerdict::RemountDelay => {
                    debug!(volume = %job.volume, "remount delay, deferring volume");
                }
                StartVerdict::Filling => {
                    debug!(volume = %job.volume, "request list still filling, waiting");
                }
            }
        }
        Ok(false)
    }

    fn spawn_worker(&mut self, job: &VolumeJob) -> RetrieverResult<()> {
        let mut files = HashMap::new();
        let mut paths = Vec::new();
        for (id, size) in &job.files {
            // The request may have died since ingestion; check again right
            // before it enters a list.
            if !self.cache.validate_for_spawn(&self.tree, id) {
                continue;
            }
            // A half-retrieved or duplicate-size leftover confuses
            // -replace=no; clear it first.
            if *size > 0 {
                if let Ok(Some(actual)) = StagingTree::stat_size(&self.tree.in_file(id)) {
                    if actual != *size {
                        warn!(
                            id = id.as_str(),
                            actual,
                            expected = size,
                            "removing size-mismatched in/ entry"
                        );
                        let _ = std::fs::remove_file(self.tree.in_file(id));
                    }
                }
            }
            files.insert(id.clone(), *size);
            paths.push(self.tree.out_file(id));
        }

        if paths.is_empty() {
            debug!(volume = %job.volume, "volume job evaporated before spawn");
            return Ok(());
        }

        let list = FileList::create(&self.tree.requestlist_dir(), &job.volume, paths)?;
        let mut cmd = DsmcCommand::new(Operation::Retrieve {
            destination: self.tree.in_dir(),
        });
        cmd.set_program(&self.dsmc_program)
            .display_opts(self.config.dsmc_display_opts())
            .base_opts(self.config.dsmc_opts())
            .filelist(list.path())
            .cpu_limit(self.config.dsmc_cpulimit());

        let bytes: u64 = files.values().sum();
        let count = files.len();
        let worker = match Worker::spawn(
            cmd.build(),
            list,
            files,
            Some(job.volume.clone()),
            SpawnOptions {
                answer_abort: true,
                watch_prompts: true,
            },
        ) {
            Ok(worker) => worker,
            Err(e) => {
                for sibling in &mut self.workers {
                    sibling.kill();
                }
                return Err(RetrieverError::Spawn(e));
            }
        };

        info!(
            pid = worker.pid(),
            volume = %job.volume,
            files = count,
            bytes,
            list = %worker.listfile().display(),
            "retrieve session started"
        );
        self.last_mount.insert(job.volume.clone(), SystemTime::now());
        self.workers.push(worker);
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
        if let Some(volume) = worker.tape() {
            self.last_mount
                .insert(volume.to_owned(), SystemTime::now());
        }

        let mut staged_bytes = 0u64;
        let mut staged_files = 0u64;
        let mut missing = 0u64;
        let mut mismatched = 0u64;
        for (id, expected) in worker.files() {
            match StagingTree::stat_size(&self.tree.in_file(id)) {
                Ok(Some(actual)) if *expected == 0 || actual == *expected => {
                    staged_bytes += actual;
                    staged_files += 1;
                }
                Ok(Some(actual)) => {
                    // Different-size copies of the same identifier on tape
                    // produce this; needs operator attention.
                    warn!(
                        id = id.as_str(),
                        actual,
                        expected,
                        "retrieved size mismatch, possible duplicate archival"
                    );
                    mismatched += 1;
                }
                _ => missing += 1,
            }
        }
        worker.mark_counted();

        self.stats.add("staged_bytes", staged_bytes);
        self.stats.add("staged_files", staged_files);

        let elapsed = worker.elapsed();
        if success && missing == 0 && mismatched == 0 {
            let secs = elapsed.as_secs_f64().max(0.001);
            info!(
                pid = worker.pid(),
                volume = worker.tape().unwrap_or(volumes::DEFAULT_VOLUME),
                files = staged_files,
                bytes = staged_bytes,
                seconds = elapsed.as_secs(),
                rate_mib_s = staged_bytes as f64 / (1024.0 * 1024.0) / secs,
                "retrieve session finished"
            );
        } else {
            self.stats.add("stage_retries", missing + mismatched);
            let output = worker.output();
            warn!(
                pid = worker.pid(),
                volume = worker.tape().unwrap_or(volumes::DEFAULT_VOLUME),
                staged = staged_files,
                missing,
                mismatched,
                "retrieve session ended incomplete"
            );
            for line in error_lines(&output).iter().take(20) {
                warn!(tsm = *line, "tape client message");
            }
            // Leave the broken tape alone for a while; the requests stay in
            // request/ and will be reconsidered.
            self.cooldown_until = Some(Instant::now() + self.config.sleeptime());
        }
    }

    fn publish_stats(&mut self, in_avail: u64) {
        let working_bytes: u64 = self.workers.iter().map(Worker::total_bytes).sum();
        let working_files: u64 = self.workers.iter().map(|w| w.files().len() as u64).sum();
        self.stats.set("hintfile_mtime", self.hints.mtime_unix());
        self.stats.set("hintfile_entries", self.hints.len() as u64);
        self.stats.set("requests_bytes", self.cache.total_bytes());
        self.stats.set("requests_files", self.cache.len() as u64);
        self.stats.set("working_bytes", working_bytes);
        self.stats.set("working_files", working_files);
        self.stats.set("in_avail_bytes", in_avail);
        self.stats.set("busyworkers", self.workers.len() as u64);
        self.stats
            .set("maxworkers", self.config.retriever_maxworkers() as u64);
        if let Err(e) = self.stats.publish() {
            warn!(error = %e, "could not publish statistics");
        }
    }

    fn shutdown(&mut self) {
        info!(workers = self.workers.len(), "shutdown requested, killing workers");
        for worker in &mut self.workers {
            worker.kill();
        }
        for worker in &mut self.workers {
            let _ = worker.try_reap();
        }
        self.workers.clear();
    }
}
