//! Retriever supervisor ticks against a scripted tape client.
//!
//! The stand-in client honours `-filelist=` and the trailing destination
//! directory: for every listed `out/` path it writes a 1024-byte file named
//! by the identifier into the destination, which is exactly what a
//! successful retrieve looks like to the daemon and the plugin.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use endit_config::Config;
use endit_core::signals::SignalFlags;
use endit_retriever::Retriever;

const FAKE_DSMC: &str = "#!/bin/sh
list=
dest=
for arg in \"$@\"; do
    case \"$arg\" in
        -filelist=*) list=\"${arg#-filelist=}\" ;;
        */) dest=\"$arg\" ;;
    esac
done
[ -n \"$list\" ] || exit 1
[ -n \"$dest\" ] || exit 1
while IFS= read -r f; do
    head -c 1024 /dev/zero > \"$dest$(basename \"$f\")\"
done < \"$list\"
exit 0
";

const FILE_SIZE: u64 = 1024;

fn fake_dsmc(dir: &Path) -> PathBuf {
    let path = dir.join("fake-dsmc");
    fs::write(&path, FAKE_DSMC).expect("write fake client");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn own_pgid() -> i32 {
    // SAFETY: getpgrp has no failure modes.
    unsafe { libc::getpgrp() }
}

fn backdate(path: &Path, seconds: u64) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
        - seconds as i64;
    let c = CString::new(path.as_os_str().as_bytes()).unwrap();
    let times = [
        libc::timespec {
            tv_sec: secs,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: secs,
            tv_nsec: 0,
        },
    ];
    // SAFETY: valid path and times array.
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) };
    assert_eq!(rc, 0);
}

fn prepare_tree(base: &Path) {
    for sub in ["out", "in", "request", "requestlists", "trash/queue"] {
        fs::create_dir_all(base.join(sub)).unwrap();
    }
}

fn write_request(base: &Path, id: &str, age_seconds: u64) {
    let path = base.join("request").join(id);
    let body = format!(
        r#"{{"parent_pid": {}, "file_size": {FILE_SIZE}, "action": "recall"}}"#,
        own_pgid()
    );
    fs::write(&path, body).unwrap();
    if age_seconds > 0 {
        backdate(&path, age_seconds);
    }
}

fn test_config(base: &Path, statdir: &Path, extra: &[(&str, &str)]) -> Config {
    let mut values = BTreeMap::new();
    values.insert("dir".to_owned(), base.to_string_lossy().into_owned());
    values.insert("statdir".to_owned(), statdir.to_string_lossy().into_owned());
    for (key, value) in extra {
        values.insert((*key).to_owned(), (*value).to_owned());
    }
    Config::from_values(values, Path::new("test.conf")).expect("valid test config")
}

fn drain_workers(retriever: &mut Retriever) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while retriever.busy_workers() > 0 {
        assert!(Instant::now() < deadline, "workers did not finish");
        thread::sleep(Duration::from_millis(50));
        retriever.run_once().expect("tick");
    }
}

#[test]
fn one_worker_per_volume_up_to_the_limit() {
    let tmp = tempfile::tempdir().unwrap();
    let statdir = tempfile::tempdir().unwrap();
    prepare_tree(tmp.path());

    // Ten requests on V1, three on V2, all well past the fill delay.
    let hintfile = tmp.path().join("hints.json");
    let mut hints = serde_json::Map::new();
    for i in 0..10 {
        let id = format!("00A1{i:02}");
        write_request(tmp.path(), &id, 700);
        hints.insert(id, serde_json::json!({"volid": "V1"}));
    }
    for i in 0..3 {
        let id = format!("00B2{i:02}");
        write_request(tmp.path(), &id, 700);
        hints.insert(id, serde_json::json!({"volid": "V2"}));
    }
    fs::write(&hintfile, serde_json::Value::Object(hints).to_string()).unwrap();

    let config = test_config(
        tmp.path(),
        statdir.path(),
        &[
            ("retriever_maxworkers", "2"),
            (
                "retriever_hintfile",
                &hintfile.to_string_lossy().into_owned(),
            ),
        ],
    );
    let mut retriever = Retriever::new(config, SignalFlags::unregistered());
    retriever.set_program(fake_dsmc(tmp.path()));

    retriever.run_once().expect("tick");
    assert_eq!(retriever.busy_workers(), 2, "one worker per volume");

    drain_workers(&mut retriever);
    let staged = fs::read_dir(tmp.path().join("in")).unwrap().count();
    assert_eq!(staged, 13, "every request retrieved");

    // Next tick: fulfilled requests are acknowledged by unlinking them.
    retriever.run_once().expect("tick");
    let remaining = fs::read_dir(tmp.path().join("request")).unwrap().count();
    assert_eq!(remaining, 0);

    let stats = fs::read_to_string(statdir.path().join("endit-retriever-stats.json")).unwrap();
    assert!(stats.contains("\"staged_files\": 13"), "stats: {stats}");
}

#[test]
fn fresh_requests_wait_for_the_fill_delay() {
    let tmp = tempfile::tempdir().unwrap();
    let statdir = tempfile::tempdir().unwrap();
    prepare_tree(tmp.path());

    let hintfile = tmp.path().join("hints.json");
    write_request(tmp.path(), "00C300", 0);
    fs::write(&hintfile, r#"{"00C300": {"volid": "V1"}}"#).unwrap();

    let config = test_config(
        tmp.path(),
        statdir.path(),
        &[(
            "retriever_hintfile",
            &hintfile.to_string_lossy().into_owned(),
        )],
    );
    let flags = SignalFlags::unregistered();
    let mut retriever = Retriever::new(config, flags.clone());
    retriever.set_program(fake_dsmc(tmp.path()));

    // Brand-new request on a known volume: still filling, nothing spawns.
    retriever.run_once().expect("tick");
    assert_eq!(retriever.busy_workers(), 0);

    // USR1 bypasses the delays for one pass.
    flags.raise_wake();
    retriever.run_once().expect("tick");
    assert_eq!(retriever.busy_workers(), 1);
    drain_workers(&mut retriever);
    assert!(tmp.path().join("in/00C300").exists());
}

#[test]
fn unhinted_requests_start_immediately_on_default_volume() {
    let tmp = tempfile::tempdir().unwrap();
    let statdir = tempfile::tempdir().unwrap();
    prepare_tree(tmp.path());
    write_request(tmp.path(), "00D400", 0);

    let config = test_config(tmp.path(), statdir.path(), &[]);
    let mut retriever = Retriever::new(config, SignalFlags::unregistered());
    retriever.set_program(fake_dsmc(tmp.path()));

    retriever.run_once().expect("tick");
    assert_eq!(retriever.busy_workers(), 1, "default volume has no delays");
    drain_workers(&mut retriever);
    assert!(tmp.path().join("in/00D400").exists());
}
