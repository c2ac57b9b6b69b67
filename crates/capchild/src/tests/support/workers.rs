//! Shell-scripted capture workers.
//!
//! A script stands in for the worker binary: `/bin/sh -c SCRIPT` receives the
//! command arguments as `$1`, `$2`, ... and speaks the control protocol with
//! `printf`, control messages on stderr and free text on stdout.

use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use capchild_config::Config;

/// Configuration that runs `script` as the worker.
pub fn shell_config(script: &str) -> Config {
    Config {
        worker_path: Utf8PathBuf::from("/bin/sh"),
        child_mode_args: vec![
            String::from("-c"),
            script.to_owned(),
            String::from("capchild-test-worker"),
        ],
        poll_interval_ms: 5,
        stop_grace_ms: 2_000,
        ..Config::default()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
