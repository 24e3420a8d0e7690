//! Per-volume job grouping and the worker start policy.
//!
//! Requests are grouped by tape volume so one mount serves as many files as
//! possible. Volumes start in order of their oldest request; a volume that
//! is still accumulating requests waits out the fill delay so the mount is
//! amortised, and a just-used volume sits out the remount delay.
//!
//! Requests without a hint land on the synthetic `default` volume, which is
//! exempt from both delays: with no mount knowledge there is nothing to
//! amortise.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use crate::requests::CachedRequest;

/// Volume used for requests with no tape hint.
pub const DEFAULT_VOLUME: &str = "default";

/// All pending requests for one tape volume.
#[derive(Clone, Debug)]
pub struct VolumeJob {
    /// Sanitised volume name (or [`DEFAULT_VOLUME`]).
    pub volume: String,
    /// Identifier and expected size of each member request.
    pub files: Vec<(String, u64)>,
    /// Oldest member request timestamp.
    pub ts_oldest: SystemTime,
    /// Newest member request timestamp.
    pub ts_newest: SystemTime,
}

impl VolumeJob {
    /// Total expected bytes in this job.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|(_, size)| size).sum()
    }
}

/// Groups cached requests into per-volume jobs, skipping volumes already
/// held by a running worker. Jobs come back sorted oldest-first.
pub fn build_jobs<'a>(
    requests: impl Iterator<Item = &'a CachedRequest>,
    held_volumes: &HashSet<String>,
) -> Vec<VolumeJob> {
    let mut jobs: HashMap<String, VolumeJob> = HashMap::new();
    for request in requests {
        let volume = request
            .volume
            .clone()
            .unwrap_or_else(|| DEFAULT_VOLUME.to_owned());
        if held_volumes.contains(&volume) {
            continue;
        }
        let job = jobs.entry(volume.clone()).or_insert_with(|| VolumeJob {
            volume,
            files: Vec::new(),
            ts_oldest: request.req_ts,
            ts_newest: request.req_ts,
        });
        job.ts_oldest = job.ts_oldest.min(request.req_ts);
        job.ts_newest = job.ts_newest.max(request.req_ts);
        job.files
            .push((request.id.clone(), request.file_size.unwrap_or(0)));
    }

    let mut jobs: Vec<VolumeJob> = jobs.into_values().collect();
    jobs.sort_by(|a, b| a.ts_oldest.cmp(&b.ts_oldest).then_with(|| a.volume.cmp(&b.volume)));
    jobs
}

/// Delays gating a volume's start.
#[derive(Clone, Copy, Debug)]
pub struct StartPolicy {
    /// Cool-down after a volume's last worker completed.
    pub remount_delay: Duration,
    /// Wait while the newest request is fresher than this.
    pub fill_wait: Duration,
    /// But never wait once the oldest request is older than this.
    pub fill_wait_max: Duration,
}

/// Why a job may not start this pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartVerdict {
    /// Spawn a worker for this volume.
    Start,
    /// The volume was mounted too recently.
    RemountDelay,
    /// The request list is still growing; wait for more.
    Filling,
}

/// Applies the start policy to one job.
///
/// `last_mount` is when the volume's previous worker finished, when known.
/// `skip_delays` (USR1) bypasses both delays for this pass.
#[must_use]
pub fn may_start(
    job: &VolumeJob,
    last_mount: Option<SystemTime>,
    now: SystemTime,
    policy: StartPolicy,
    skip_delays: bool,
) -> StartVerdict {
    if job.volume == DEFAULT_VOLUME || skip_delays {
        return StartVerdict::Start;
    }

    if let Some(mounted) = last_mount {
        if mounted + policy.remount_delay > now {
            return StartVerdict::RemountDelay;
        }
    }

    let oldest_recent = job.ts_oldest > now - policy.fill_wait_max;
    let newest_recent = job.ts_newest > now - policy.fill_wait;
    if oldest_recent && newest_recent {
        return StartVerdict::Filling;
    }

    StartVerdict::Start
}
