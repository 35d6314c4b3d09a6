//! Subscriber setup for binaries and demos.
//!
//! The library itself only emits `tracing` events. Call [`init`] once near
//! the start of `main` and keep the returned guard alive until exit, or
//! buffered file output may be lost.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, Profile};

pub const LOG_DIR: &str = "logs";
pub const LOG_PREFIX: &str = "tau-bridge";

/// Flushes buffered log output when dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Install a global subscriber for `profile`.
///
/// `RUST_LOG` overrides the profile's default level. Does nothing if a
/// subscriber is already installed.
pub fn init(profile: Profile) -> LogGuard {
    let default_level = match profile {
        Profile::Development => "debug",
        Profile::Production => "warn",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match profile {
        Profile::Development => {
            let _ = tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(env_filter)
                .try_init();
            LogGuard { _worker: None }
        }
        Profile::Production => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix("log")
                .build(LOG_DIR);

            match appender {
                Ok(appender) => {
                    let (writer, worker) = tracing_appender::non_blocking(appender);
                    let _ = tracing_subscriber::registry()
                        .with(fmt::layer().with_ansi(false).with_writer(writer))
                        .with(env_filter)
                        .try_init();
                    LogGuard {
                        _worker: Some(worker),
                    }
                }
                // No log file: prefer no output over writing into the host's stderr.
                Err(_) => {
                    let _ = tracing_subscriber::registry().with(env_filter).try_init();
                    LogGuard { _worker: None }
                }
            }
        }
    }
}

/// [`init`] with the profile named by `TAU_BRIDGE_ENV`.
pub fn init_from_env() -> LogGuard {
    init(Config::from_env().profile())
}
