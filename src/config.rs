use std::convert::TryFrom;
use std::fs::File;
use std::io::prelude::*;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub num_sensors: usize,
    pub readings_per_period: usize,
    pub tick_interval_ms: u64,
    /// Number of reports to emit before shutting down. 0 runs forever.
    pub periods: u64,
    /// Leading generations that are drained without a report.
    pub warmup_periods: u64,
    pub min_temperature: i32,
    pub max_temperature: i32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_sensors: 8,
            readings_per_period: 60,
            tick_interval_ms: 60 * 1000,
            periods: 1,
            warmup_periods: 0,
            min_temperature: -100,
            max_temperature: 170,
            log_level: "info".into(),
        }
    }
}

impl Config {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Wall-clock length of one collection period.
    pub fn period(&self) -> Result<Duration> {
        u32::try_from(self.readings_per_period)
            .ok()
            .and_then(|ticks| self.tick_interval().checked_mul(ticks))
            .ok_or_else(|| Error::InvalidConfig("collection period is too long".into()))
    }

    /// How long the scheduler waits past a period boundary before giving up.
    pub fn stall_timeout(&self) -> Result<Duration> {
        self.period()?
            .checked_add(self.tick_interval())
            .ok_or_else(|| Error::InvalidConfig("collection period is too long".into()))
    }

    pub fn temperature_range(&self) -> RangeInclusive<i32> {
        self.min_temperature..=self.max_temperature
    }

    pub fn log_level(&self) -> Result<log::LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| Error::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_sensors == 0 {
            return Err(Error::InvalidConfig("num_sensors must be at least 1".into()));
        }
        if self.readings_per_period == 0 {
            return Err(Error::InvalidConfig("readings_per_period must be at least 1".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms must be non-zero".into()));
        }
        // The scheduler sleeps until a period boundary and then waits out the stall timeout
        let horizon = self.period()?.checked_add(self.stall_timeout()?);
        if horizon.and_then(|horizon| Instant::now().checked_add(horizon)).is_none() {
            return Err(Error::InvalidConfig("collection period is too long".into()));
        }
        if self.min_temperature > self.max_temperature {
            return Err(Error::InvalidConfig(format!(
                "min_temperature {} is above max_temperature {}",
                self.min_temperature, self.max_temperature
            )));
        }
        self.log_level()?;
        Ok(())
    }
}

pub fn read_config(config_path: &Path) -> Result<Config> {
    let mut file = File::open(config_path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
