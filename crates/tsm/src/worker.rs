//! Supervision of one running tape-client invocation.
//!
//! A worker is the tape-client process itself plus the bookkeeping the
//! supervisor needs: the identifiers it owns, the request list keeping the
//! client fed, drain threads capturing its mixed output, and an optional
//! prompt watchdog. The supervisor never blocks on a worker; it polls
//! [`Worker::try_reap`] every tick and signals with SIGKILL when a worker
//! must go (the client's own guidance: SIGTERM can corrupt its local
//! database).

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use endit_core::proc;
use tracing::warn;

use crate::filelist::FileList;

/// Output markers that mean the client stopped for interactive input. A
/// stuck client holds its tape drive until the CPU limit fires, so the
/// watchdog kills it immediately instead.
const PROMPT_MARKERS: &[&str] = &[
    "Please enter your user id",
    "Please enter password",
    "Action is Required",
];

/// Spawn-time options.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpawnOptions {
    /// Pipe `A\n` to stdin so any interactive prompt is answered with
    /// "Abort" even if the watchdog misses it.
    pub answer_abort: bool,
    /// Kill the client as soon as a prompt marker appears on stdout.
    pub watch_prompts: bool,
}

/// One supervised tape-client invocation.
#[derive(Debug)]
pub struct Worker {
    child: Child,
    pid: u32,
    files: HashMap<String, u64>,
    tape: Option<String>,
    counted: bool,
    listfile: FileList,
    started: Instant,
    lines: Arc<Mutex<Vec<String>>>,
    drains: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `command` and begins draining its output.
    ///
    /// `files` maps each owned identifier to its expected size; `tape` is
    /// the volume this worker mounted, when known. The request list is held
    /// by the worker and unlinked when the worker is dropped.
    ///
    /// # Errors
    ///
    /// Propagates the spawn failure; per the error taxonomy this is fatal to
    /// the daemon.
    pub fn spawn(
        mut command: Command,
        listfile: FileList,
        files: HashMap<String, u64>,
        tape: Option<String>,
        options: SpawnOptions,
    ) -> io::Result<Self> {
        command
            .stdin(if options.answer_abort {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let pid = child.id();

        if options.answer_abort {
            if let Some(mut stdin) = child.stdin.take() {
                // The pipe closes right after: one answer is all any prompt
                // gets.
                let _ = stdin.write_all(b"A\n");
            }
        }

        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(drain_stream(
                stdout,
                Arc::clone(&lines),
                options.watch_prompts.then_some(pid),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain_stream(stderr, Arc::clone(&lines), None));
        }

        Ok(Self {
            child,
            pid,
            files,
            tape,
            counted: false,
            listfile,
            started: Instant::now(),
            lines,
            drains,
        })
    }

    /// OS process id of the tape client.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Identifiers owned by this worker, with expected sizes.
    #[must_use]
    pub fn files(&self) -> &HashMap<String, u64> {
        &self.files
    }

    /// Tape volume this worker is serving, when known.
    #[must_use]
    pub fn tape(&self) -> Option<&str> {
        self.tape.as_deref()
    }

    /// Sum of the expected sizes of the owned identifiers.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.values().sum()
    }

    /// Path of the request list feeding this worker.
    #[must_use]
    pub fn listfile(&self) -> &Path {
        self.listfile.path()
    }

    /// Whether the completion outcome has been recorded.
    #[must_use]
    pub fn is_counted(&self) -> bool {
        self.counted
    }

    /// Marks the completion outcome as recorded.
    pub fn mark_counted(&mut self) {
        self.counted = true;
    }

    /// Time since spawn.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Non-blocking reap. Returns the exit status once, after joining the
    /// drain threads so [`Worker::output`] is complete.
    ///
    /// # Errors
    ///
    /// Propagates `waitpid` failures.
    pub fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.child.try_wait()? {
            Some(status) => {
                for handle in self.drains.drain(..) {
                    let _ = handle.join();
                }
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Kills the tape client with SIGKILL.
    pub fn kill(&mut self) {
        if let Err(e) = proc::kill_process(self.pid) {
            warn!(pid = self.pid, error = %e, "could not kill tape client");
        }
    }

    /// The captured output so far, newline-joined.
    #[must_use]
    pub fn output(&self) -> String {
        let lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.join("\n")
    }
}

fn drain_stream<R>(
    stream: R,
    lines: Arc<Mutex<Vec<String>>>,
    watchdog_pid: Option<u32>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Some(pid) = watchdog_pid {
                if PROMPT_MARKERS.iter().any(|m| line.contains(m)) {
                    warn!(%line, pid, "tape client stopped for interactive input, killing it");
                    let _ = proc::kill_process(pid);
                }
            }
            match lines.lock() {
                Ok(mut guard) => guard.push(line),
                Err(poisoned) => poisoned.into_inner().push(line),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn empty_list(dir: &Path) -> FileList {
        FileList::create(dir, "test", Vec::<PathBuf>::new()).expect("list created")
    }

    fn reap_within(worker: &mut Worker, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = worker.try_reap().expect("try_reap") {
                return status;
            }
            assert!(Instant::now() < deadline, "worker did not exit in time");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = Worker::spawn(
            shell("echo out-line; echo err-line >&2"),
            empty_list(tmp.path()),
            HashMap::new(),
            None,
            SpawnOptions::default(),
        )
        .expect("spawn");

        let status = reap_within(&mut worker, Duration::from_secs(5));
        assert!(status.success());
        let output = worker.output();
        assert!(output.contains("out-line"));
        assert!(output.contains("err-line"));
    }

    #[test]
    fn answer_abort_pipes_a_line() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = Worker::spawn(
            shell("read answer; echo got:$answer"),
            empty_list(tmp.path()),
            HashMap::new(),
            None,
            SpawnOptions {
                answer_abort: true,
                watch_prompts: false,
            },
        )
        .expect("spawn");

        let status = reap_within(&mut worker, Duration::from_secs(5));
        assert!(status.success());
        assert!(worker.output().contains("got:A"));
    }

    #[test]
    fn prompt_watchdog_kills_client() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = Worker::spawn(
            shell("echo 'Please enter your user id:'; sleep 30"),
            empty_list(tmp.path()),
            HashMap::new(),
            None,
            SpawnOptions {
                answer_abort: false,
                watch_prompts: true,
            },
        )
        .expect("spawn");

        let status = reap_within(&mut worker, Duration::from_secs(10));
        assert!(!status.success());
    }

    #[test]
    fn kill_terminates_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = Worker::spawn(
            shell("sleep 30"),
            empty_list(tmp.path()),
            HashMap::new(),
            None,
            SpawnOptions::default(),
        )
        .expect("spawn");

        worker.kill();
        let status = reap_within(&mut worker, Duration::from_secs(5));
        assert!(!status.success());
    }

    #[test]
    fn bookkeeping_accessors() {
        let tmp = tempfile::tempdir().unwrap();
        let mut files = HashMap::new();
        files.insert("00AA".to_owned(), 100u64);
        files.insert("00BB".to_owned(), 250u64);
        let mut worker = Worker::spawn(
            shell("true"),
            empty_list(tmp.path()),
            files,
            Some("VOL001".to_owned()),
            SpawnOptions::default(),
        )
        .expect("spawn");

        assert_eq!(worker.total_bytes(), 350);
        assert_eq!(worker.tape(), Some("VOL001"));
        assert!(!worker.is_counted());
        worker.mark_counted();
        assert!(worker.is_counted());
        reap_within(&mut worker, Duration::from_secs(5));
    }
}
