//! Runners still open when `main` returns are closed by the exit hook: their
//! in-flight tasks are cancelled and the cleanup runs, with logging enabled.
//!
//! Runs without the test harness. The binary re-executes itself as a child
//! that leaves work pending and returns from `main`, then checks the
//! child's output.

use std::convert::Infallible;
use std::env;
use std::process::Command;
use std::thread;
use std::time::Duration;

use crossbeam::channel::bounded;
use futures::future::pending;
use tau_bridge::config::JOIN_TIMEOUT_ENV;
use tau_bridge::{logging, Config, Profile, Runner};

const CHILD_ENV: &str = "TAU_BRIDGE_EXIT_CHILD";

struct Cleanup(&'static str);

impl Drop for Cleanup {
    fn drop(&mut self) {
        println!("cleanup ran: {}", self.0);
    }
}

fn main() {
    if env::var_os(CHILD_ENV).is_some() {
        child();
    } else {
        open_runners_are_closed_at_exit();
    }
}

fn child() {
    let _guard = logging::init(Profile::Development);
    // Initialise the subscriber's per-thread state on the main thread.
    tracing::info!("child started");

    let (started_tx, started_rx) = bounded(2);

    let runner =
        Runner::with_config(Config::default().with_join_timeout(Duration::from_secs(5))).unwrap();
    let tx = started_tx.clone();
    thread::spawn(move || {
        runner.run(
            async move {
                let _cleanup = Cleanup("runner");
                tx.send(()).unwrap();
                pending::<()>().await;
                Ok::<_, Infallible>(())
            },
            None,
        )
    });

    thread::spawn(move || {
        tau_bridge::run(
            async move {
                let _cleanup = Cleanup("global");
                started_tx.send(()).unwrap();
                pending::<()>().await;
                Ok::<_, Infallible>(())
            },
            None,
        )
    });

    for _ in 0..2 {
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}

fn open_runners_are_closed_at_exit() {
    let output = Command::new(env::current_exe().unwrap())
        .env(CHILD_ENV, "1")
        .env(JOIN_TIMEOUT_ENV, "5000")
        .env("RUST_LOG", "debug")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(output.status.success(), "child failed\n{stderr}");
    assert!(!stderr.contains("panicked"), "child panicked\n{stderr}");
    for name in ["runner", "global"] {
        assert!(
            stdout.contains(&format!("cleanup ran: {name}")),
            "no cleanup for the {name} task\nstdout:\n{stdout}\nstderr:\n{stderr}"
        );
    }
    println!("test open_runners_are_closed_at_exit ... ok");
}
