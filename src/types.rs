use chrono::{DateTime, Utc};

pub type SensorId = usize;

/// A single temperature sample. Never modified after it is written to a slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    pub fn now(value: f64) -> Self {
        Self::new(value, Utc::now())
    }
}
