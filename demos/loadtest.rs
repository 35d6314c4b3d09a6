//! Many caller threads hammering one runner.
//!
//! ```text
//! cargo run --release --example loadtest -- [threads] [tasks-per-thread]
//! ```

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tau_bridge::{sleep, Error, Runner};

const DEFAULT_THREADS: usize = 16;
const DEFAULT_TASKS: usize = 200;

fn arg(position: usize, default: usize) -> usize {
    std::env::args()
        .nth(position)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn main() -> Result<(), Error> {
    let _log = tau_bridge::logging::init_from_env();
    let threads = arg(1, DEFAULT_THREADS);
    let tasks = arg(2, DEFAULT_TASKS);

    let runner = Runner::scoped()?;
    let completed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let start = Instant::now();
    thread::scope(|scope| {
        for caller in 0..threads {
            let runner = &*runner;
            let completed = &completed;
            let failed = &failed;
            scope.spawn(move || {
                for n in 0..tasks {
                    let expected = caller * tasks + n;
                    let outcome = runner.run(
                        async move {
                            sleep(Duration::from_micros(100)).await;
                            Ok::<_, Infallible>(expected)
                        },
                        Some(Duration::from_secs(5)),
                    );
                    match outcome {
                        Ok(value) if value == expected => completed.fetch_add(1, Ordering::Relaxed),
                        _ => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });
    let elapsed = start.elapsed();

    let completed = completed.into_inner();
    let failed = failed.into_inner();
    println!("threads:    {threads}");
    println!("tasks:      {}", threads * tasks);
    println!("completed:  {completed}");
    println!("failed:     {failed}");
    println!("elapsed:    {elapsed:?}");
    println!(
        "throughput: {:.0} tasks/s",
        completed as f64 / elapsed.as_secs_f64()
    );

    let batch = Instant::now();
    let values = runner.gather(
        (0..tasks).map(|n| async move {
            sleep(Duration::from_millis(10)).await;
            Ok::<_, Infallible>(n)
        }),
        None,
    )?;
    println!("gather of {} tasks: {:?}", values.len(), batch.elapsed());

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
