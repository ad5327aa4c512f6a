//! Runtime settings.
//!
//! Every value has a default, so an empty or missing file still gives a working setup. Values
//! are taken from environment variables first, then the TOML file, then the defaults.

use std::{path::Path, time::Duration};

use confique::Config;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub bus: BusSettings,
    #[config(nested)]
    pub worker: WorkerSettings,
    #[config(nested)]
    pub datalog: DatalogSettings,
}

#[derive(Config, Debug, Clone)]
pub struct BusSettings {
    /// Read timeout of the instrument session, in milliseconds.
    #[config(default = 5000, env = "PSU_BUS_TIMEOUT_MS")]
    pub timeout_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct WorkerSettings {
    /// How often the instrument state is re-read while idle, in milliseconds.
    #[config(default = 1000, env = "PSU_REFRESH_INTERVAL_MS")]
    pub refresh_interval_ms: u64,
    /// Shortest wait for a command once a refresh is due, in milliseconds.
    #[config(default = 30)]
    pub min_wait_ms: u64,
    /// Pause between "is the capture done" polls, in milliseconds.
    #[config(default = 70)]
    pub acquisition_poll_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct DatalogSettings {
    /// Use the datalog buffer on supplies that have one. Otherwise logging polls.
    #[config(default = true)]
    pub enabled: bool,
    /// Longest datalog sample period, in seconds.
    #[config(default = 1.0)]
    pub max_interval_s: f64,
    /// Datalog buffer length, in samples.
    #[config(default = 1024)]
    pub buffer_points: u32,
}

impl Conf {
    /// Load from `path`, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, confique::Error> {
        Conf::builder().env().file(path.as_ref()).load()
    }

    /// Defaults, with environment overrides.
    pub fn defaults() -> Result<Self, confique::Error> {
        Conf::builder().env().load()
    }
}

impl BusSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WorkerSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn acquisition_poll(&self) -> Duration {
        Duration::from_millis(self.acquisition_poll_ms)
    }
}
