use std::time::Duration;

use thiserror::Error;

use crate::types::SensorId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown log level: {0}")]
    InvalidLogLevel(String),
    #[error("failed to allocate storage for {sensors} sensors x {positions} readings")]
    Allocation { sensors: usize, positions: usize },
    #[error("period {period} did not close within {waited:?}")]
    Stalled { period: u64, waited: Duration },
    #[error("producer for sensor {0} panicked")]
    ProducerPanicked(SensorId),
}

pub type Result<T> = std::result::Result<T, Error>;
