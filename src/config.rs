//! Runner configuration.
//!
//! Values come from builder calls or from the environment:
//!
//! - `TAU_BRIDGE_ENGINE`: `tau` (default) or `tokio`. `tokio` selects the
//!   tokio current-thread engine when the crate is built with the `tokio`
//!   feature and silently falls back to `tau` otherwise.
//! - `TAU_BRIDGE_JOIN_TIMEOUT_MS`: how long `close()` waits for the engine
//!   thread to exit.
//! - `TAU_BRIDGE_ENV`: `development` (default) or `production`; selects the
//!   logging profile used by [`crate::logging::init`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

pub const ENGINE_ENV: &str = "TAU_BRIDGE_ENGINE";
pub const JOIN_TIMEOUT_ENV: &str = "TAU_BRIDGE_JOIN_TIMEOUT_MS";
pub const PROFILE_ENV: &str = "TAU_BRIDGE_ENV";

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_THREAD_NAME: &str = "tau-bridge-engine";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown engine `{0}` (expected `tau` or `tokio`)")]
    UnknownEngine(String),
    #[error("unknown profile `{0}` (expected `development` or `production`)")]
    UnknownProfile(String),
    #[error("invalid join timeout `{0}`: expected whole milliseconds")]
    InvalidJoinTimeout(String),
}

/// Which executor runs on the engine thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// The built-in `tau-rt` executor.
    #[default]
    Tau,
    /// A tokio current-thread runtime. Needs the `tokio` feature.
    Tokio,
}

impl EngineKind {
    pub fn is_available(self) -> bool {
        match self {
            EngineKind::Tau => true,
            EngineKind::Tokio => cfg!(feature = "tokio"),
        }
    }

    /// The engine that will actually be used for this request.
    fn resolve(self) -> Self {
        if self.is_available() {
            self
        } else {
            debug!(requested = %self, "engine not compiled in, using tau");
            EngineKind::Tau
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Tau => "tau",
            EngineKind::Tokio => "tokio",
        })
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tau" => Ok(EngineKind::Tau),
            "tokio" => Ok(EngineKind::Tokio),
            _ => Err(ConfigError::UnknownEngine(s.to_string())),
        }
    }
}

/// Logging profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Colored output on stderr at `debug`.
    #[default]
    Development,
    /// Daily-rotated file under `logs/` at `warn`.
    Production,
}

impl FromStr for Profile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Profile::Development),
            "production" | "prod" => Ok(Profile::Production),
            _ => Err(ConfigError::UnknownProfile(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    engine: EngineKind,
    join_timeout: Duration,
    thread_name: String,
    profile: Profile,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineKind::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            profile: Profile::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by whatever the environment sets. Malformed
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(raw) = lookup(ENGINE_ENV) {
            match raw.parse::<EngineKind>() {
                Ok(engine) => config = config.with_engine(engine),
                Err(err) => warn!(%err, "ignoring {ENGINE_ENV}"),
            }
        }

        if let Some(raw) = lookup(JOIN_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.join_timeout = Duration::from_millis(ms),
                Err(_) => warn!(
                    err = %ConfigError::InvalidJoinTimeout(raw),
                    "ignoring {JOIN_TIMEOUT_ENV}"
                ),
            }
        }

        if let Some(raw) = lookup(PROFILE_ENV) {
            match raw.parse::<Profile>() {
                Ok(profile) => config.profile = profile,
                Err(err) => warn!(%err, "ignoring {PROFILE_ENV}"),
            }
        }

        config
    }

    /// Request an engine. Unavailable engines fall back to [`EngineKind::Tau`].
    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine.resolve();
        self
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    #[must_use]
    pub fn profile(&self) -> Profile {
        self.profile
    }
}
