//! A tour of the bridge: run, gather, errors, timeouts and runner lifetimes.
//!
//! ```text
//! cargo run --example demo
//! ```

use std::convert::Infallible;
use std::time::{Duration, Instant};

use tau_bridge::{gather, gather_settled, run, sleep, Runner};

type DemoResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, thiserror::Error)]
#[error("operation failed: {0}")]
struct OperationFailed(&'static str);

#[derive(Debug)]
struct User {
    id: u32,
    name: String,
    email: String,
}

async fn fetch_user(id: u32) -> Result<User, Infallible> {
    sleep(Duration::from_millis(100)).await;
    Ok(User {
        id,
        name: format!("User {id}"),
        email: format!("user{id}@example.com"),
    })
}

async fn process_item(item: &'static str) -> Result<String, Infallible> {
    sleep(Duration::from_millis(100)).await;
    Ok(format!("Processed: {item}"))
}

async fn risky_operation(should_fail: bool) -> Result<&'static str, OperationFailed> {
    sleep(Duration::from_millis(100)).await;
    if should_fail {
        return Err(OperationFailed("risky_operation"));
    }
    Ok("Operation succeeded")
}

fn basic_usage() -> DemoResult {
    println!("\n=== Basic usage ===");
    let user = run(fetch_user(123), None)?;
    println!("Fetched {} <{}> (id {})", user.name, user.email, user.id);
    Ok(())
}

fn concurrent_execution() -> DemoResult {
    println!("\n=== Concurrent execution ===");
    let items = ["apple", "banana", "cherry", "date"];

    let start = Instant::now();
    let results = gather(items.map(process_item), None)?;
    println!("Results: {results:?}");
    println!("gather: {:?}", start.elapsed());

    let start = Instant::now();
    for item in items {
        run(process_item(item), None)?;
    }
    println!("one by one: {:?}", start.elapsed());
    Ok(())
}

fn error_handling() -> DemoResult {
    println!("\n=== Error handling ===");
    let outcomes = gather_settled([false, true, false].map(risky_operation), None)?;
    for (i, outcome) in outcomes.iter().enumerate() {
        match outcome {
            Ok(value) => println!("  task {i}: {value}"),
            Err(err) => println!("  task {i}: error ({err})"),
        }
    }

    match run(risky_operation(true), None) {
        Err(err) => println!("run surfaced the task's own error: {err}"),
        Ok(value) => println!("unexpected success: {value}"),
    }
    Ok(())
}

fn timeout_handling() {
    println!("\n=== Timeouts ===");
    let long_operation = async {
        sleep(Duration::from_secs(2)).await;
        Ok::<_, Infallible>("Operation completed")
    };
    match run(long_operation, Some(Duration::from_millis(500))) {
        Ok(value) => println!("Result: {value}"),
        Err(err) => println!("Gave up: {err} ({:?})", err.kind()),
    }
}

fn scoped_runner() -> DemoResult {
    println!("\n=== Scoped runner ===");
    {
        let runner = Runner::scoped()?;
        let first = runner.run(process_item("first"), None)?;
        let second = runner.run(process_item("second"), None)?;
        println!("Results: {first}, {second}");
    }
    println!("Runner closed when the scope ended");
    Ok(())
}

fn manual_runner() -> DemoResult {
    println!("\n=== Manual runner ===");
    let runner = Runner::new()?;
    let results: Result<Vec<_>, _> = (0..3)
        .map(|id| {
            runner.run(
                async move {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, Infallible>(format!("Task {id} completed"))
                },
                None,
            )
        })
        .collect();
    runner.close();
    println!("Results: {:?}", results?);
    println!("Runner state: {:?}", runner.state());
    Ok(())
}

fn global_lifecycle() -> DemoResult {
    println!("\n=== Global runner lifecycle ===");
    let task = || async {
        sleep(Duration::from_millis(100)).await;
        Ok::<_, Infallible>("Lifecycle task completed")
    };

    println!("First call: {}", run(task(), None)?);
    println!("Second call: {}", run(task(), None)?);
    println!("Alive: {}", tau_bridge::is_alive());

    tau_bridge::shutdown();
    println!("Alive after shutdown: {}", tau_bridge::is_alive());

    println!("After shutdown: {}", run(task(), None)?);
    Ok(())
}

fn main() {
    let _log = tau_bridge::logging::init_from_env();

    let outcome = basic_usage()
        .and_then(|()| concurrent_execution())
        .and_then(|()| error_handling())
        .map(|()| timeout_handling())
        .and_then(|()| scoped_runner())
        .and_then(|()| manual_runner())
        .and_then(|()| global_lifecycle());

    tau_bridge::shutdown();

    match outcome {
        Ok(()) => println!("\nAll examples completed"),
        Err(err) => {
            eprintln!("\nExample failed: {err}");
            std::process::exit(1);
        }
    }
}
