#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endit-deleter` turns `trash/` markers into tape deletions. Acceptance is
//! continuous: every tick snapshots pending markers into a queue batch
//! ([`queue`]), which is the promise to the plugin that the deletion will
//! happen. The expensive part, actually invoking the tape client, runs on a
//! cron-like schedule ([`schedule`]) because tape deletions are slow and
//! urgent to nobody.
//!
//! One invocation covers every queued batch. Its output is mined for
//! partial successes ([`outcome`]); survivors are re-enqueued into a fresh
//! batch and a retry flag makes the next tick try again immediately.

pub mod outcome;
pub mod queue;
pub mod schedule;

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tracing::{info, warn};

use endit_config::{Component, Config};
use endit_core::error::CoreError;
use endit_core::signals::{sleep_interruptible, SignalFlags, SleepInterrupt};
use endit_core::staging::StagingTree;
use endit_stats::Stats;
use endit_tsm::command::{DsmcCommand, Operation};
use endit_tsm::worker::SpawnOptions;
use endit_tsm::{FileList, Worker};

use outcome::DeleteOutcome;
use schedule::{Schedule, ScheduleError};

/// Age after which leftovers in `in/` and `requestlists/` are removed at
/// startup.
const STALE_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Result type for deleter operations.
pub type DeleterResult<T> = Result<T, DeleterError>;

/// Fatal deleter failures.
#[derive(Debug, Error)]
pub enum DeleterError {
    /// Staging tree unusable.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Could not fork the tape client.
    #[error("failed to spawn tape client: {0}")]
    Spawn(io::Error),
    /// A queue batch could not be persisted. Continuing would break the
    /// acceptance promise to the plugin.
    #[error("cannot persist deletion batch {path}: {source}")]
    QueuePersist {
        /// Batch file that failed.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The configured schedule is unusable.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// The deleter daemon.
pub struct Deleter {
    config: Config,
    tree: StagingTree,
    flags: SignalFlags,
    stats: Stats,
    schedule: Schedule,
    pending_retry: bool,
    dsmc_program: OsString,
}

impl Deleter {
    /// Builds the daemon, parsing the configured schedule.
    ///
    /// # Errors
    ///
    /// [`DeleterError::Schedule`] when `deleter_queueprocinterval` cannot be
    /// parsed.
    pub fn new(config: Config, flags: SignalFlags) -> DeleterResult<Self> {
        let tree = StagingTree::new(config.base_dir());
        let stats = Stats::new(config.statdir(), &config.desc_short(), "deleter");
        let schedule = Schedule::parse(&config.deleter_queueprocinterval())?;
        Ok(Self {
            config,
            tree,
            flags,
            stats,
            schedule,
            pending_retry: false,
            dsmc_program: "dsmc".into(),
        })
    }

    /// Overrides the tape-client binary. Test hook.
    pub fn set_program<S: Into<OsString>>(&mut self, program: S) {
        self.dsmc_program = program.into();
    }

    /// Prepares the tree and runs the supervisor loop until shutdown.
    ///
    /// # Errors
    ///
    /// Fatal failures only: unusable staging tree, failed spawn, or a queue
    /// batch that cannot be persisted.
    pub fn run(mut self) -> DeleterResult<()> {
        self.tree.prepare(self.config.debug())?;
        let removed = self.tree.clean_stale(STALE_AGE)?;
        info!(
            base = %self.tree.base().display(),
            stale_removed = removed,
            "deleter starting"
        );

        loop {
            if self.flags.shutdown_requested() {
                info!("shutdown requested");
                return Ok(());
            }
            self.run_once()?;
            if sleep_interruptible(&self.flags, self.config.sleeptime()) == SleepInterrupt::Shutdown
            {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }

    /// One supervisor tick: accept new deletions, process the queue when
    /// due, publish stats.
    ///
    /// # Errors
    ///
    /// Fatal failures only.
    pub fn run_once(&mut self) -> DeleterResult<()> {
        self.config.poll_override(Component::Deleter);

        queue::enqueue(&self.tree, self.config.debug())?;

        let flush = self.flags.take_wake();
        if flush {
            info!("USR1 received, processing deletion queue now");
        }

        if flush || self.pending_retry || self.schedule.due(Local::now()) {
            self.process_queue()?;
        }

        self.publish_stats();
        Ok(())
    }

    /// Runs one `delete archive` invocation over every queued batch.
    ///
    /// # Errors
    ///
    /// Fatal failures only; a failed invocation re-enqueues survivors and
    /// sets the retry flag instead of erroring.
    pub fn process_queue(&mut self) -> DeleterResult<()> {
        let (batch_files, ids) = queue::load_batches(&self.tree)?;
        if ids.is_empty() {
            self.pending_retry = false;
            return Ok(());
        }

        info!(batches = batch_files.len(), files = ids.len(), "processing deletion queue");

        let paths: Vec<PathBuf> = ids.iter().map(|id| self.tree.out_file(id)).collect();
        let list = FileList::create(&self.tree.requestlist_dir(), "trash", paths)?;
        let mut cmd = DsmcCommand::new(Operation::Delete);
        cmd.set_program(&self.dsmc_program)
            .display_opts(self.config.dsmc_display_opts())
            .base_opts(self.config.dsmc_opts())
            .filelist(list.path())
            .cpu_limit(self.config.dsmc_cpulimit());

        let mut worker = Worker::spawn(
            cmd.build(),
            list,
            Default::default(),
            None,
            SpawnOptions::default(),
        )
        .map_err(DeleterError::Spawn)?;

        // The invocation is synchronous from the deleter's point of view,
        // but shutdown must still be able to kill it.
        let status = loop {
            if self.flags.shutdown_requested() {
                warn!("shutdown during deletion, killing tape client");
                worker.kill();
            }
            match worker.try_reap()? {
                Some(status) => break status,
                None => thread::sleep(Duration::from_millis(200)),
            }
        };

        let output = worker.output();
        let outcome = DeleteOutcome::classify(&output, status.success());
        let (deleted, survivors) = outcome.partition(&ids);

        self.stats.add("deleted_files", deleted.len() as u64);
        if survivors.is_empty() {
            info!(files = deleted.len(), "deletion batch complete");
            queue::remove_batches(&batch_files);
            self.pending_retry = false;
        } else {
            self.stats.add("delete_retries", survivors.len() as u64);
            warn!(
                deleted = deleted.len(),
                surviving = survivors.len(),
                "deletion batch incomplete, re-enqueueing survivors"
            );
            for line in endit_tsm::output::error_lines(&output).iter().take(20) {
                warn!(tsm = *line, "tape client message");
            }
            let requeued = queue::write_batch(&self.tree, &survivors)?;
            queue::remove_batches(&batch_files);
            info!(batch = %requeued.display(), "survivors re-enqueued");
            self.pending_retry = true;
        }
        Ok(())
    }

    /// Whether a failed batch is waiting for an immediate retry.
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.pending_retry
    }

    fn publish_stats(&mut self) {
        let queued = queue::load_batches(&self.tree)
            .map(|(batches, ids)| (batches.len() as u64, ids.len() as u64))
            .unwrap_or((0, 0));
        self.stats.set("queue_batches", queued.0);
        self.stats.set("queue_files", queued.1);
        if let Err(e) = self.stats.publish() {
            warn!(error = %e, "could not publish statistics");
        }
    }
}
