use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        Ok(envy::prefixed("SLUICE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("sluice.db")
    }

    /// Interval of the periodic poll tick that picks up due retries and expired leases.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.poll_interval_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        )
    }
}
