//! Per-period statistics over a closed generation.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::store::SensorSlot;
use crate::types::Reading;

/// Length of the highest and lowest temperature lists.
pub const TOP_N: usize = 5;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Bounded, sorted selection of the most extreme values offered so far.
/// Equal values keep the order they were offered in.
#[derive(Debug, Clone)]
struct Extremes {
    values: Vec<f64>,
    capacity: usize,
    highest: bool,
}

impl Extremes {
    fn highest(capacity: usize) -> Self {
        Self { values: Vec::with_capacity(capacity + 1), capacity, highest: true }
    }

    fn lowest(capacity: usize) -> Self {
        Self { values: Vec::with_capacity(capacity + 1), capacity, highest: false }
    }

    fn beats(&self, value: f64, other: f64) -> bool {
        if self.highest {
            value > other
        } else {
            value < other
        }
    }

    fn offer(&mut self, value: f64) {
        match self.values.iter().position(|&kept| self.beats(value, kept)) {
            Some(index) => {
                self.values.insert(index, value);
                self.values.truncate(self.capacity);
            }
            None if self.values.len() < self.capacity => self.values.push(value),
            None => {}
        }
    }

    fn into_vec(self) -> Vec<f64> {
        self.values
    }
}

/// The widest max - min difference seen at a single tick position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spread {
    pub magnitude: f64,
    pub position: usize,
    /// The earlier of the two readings' timestamps.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Spread {
    fn of(position: usize, readings: &[Reading]) -> Option<Self> {
        let first = readings.first()?;
        let (mut min, mut max) = (first, first);
        for reading in &readings[1..] {
            if reading.value < min.value {
                min = reading;
            }
            if reading.value > max.value {
                max = reading;
            }
        }

        let (start, end) = if min.timestamp <= max.timestamp {
            (min.timestamp, max.timestamp)
        } else {
            (max.timestamp, min.timestamp)
        };

        Some(Self { magnitude: max.value - min.value, position, start, end })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub period: u64,
    /// Number of readings that contributed to the report.
    pub readings: usize,
    /// Highest temperatures, largest first.
    pub highest: Vec<f64>,
    /// Lowest temperatures, smallest first.
    pub lowest: Vec<f64>,
    pub largest_spread: Option<Spread>,
}

/// Computes the report for one period from every sensor's slot.
///
/// Positions without a reading are skipped, so the lists never contain
/// values that were not actually measured.
pub fn aggregate(period: u64, slots: &[SensorSlot]) -> Report {
    let positions = slots.iter().map(SensorSlot::len).max().unwrap_or(0);

    let mut highest = Extremes::highest(TOP_N);
    let mut lowest = Extremes::lowest(TOP_N);
    let mut largest_spread: Option<Spread> = None;
    let mut readings = 0;

    let mut column = Vec::with_capacity(slots.len());
    for position in 0..positions {
        column.clear();
        column.extend(slots.iter().filter_map(|slot| slot.get(position).copied()));

        for reading in &column {
            highest.offer(reading.value);
            lowest.offer(reading.value);
        }
        readings += column.len();

        if let Some(spread) = Spread::of(position, &column) {
            let wider = largest_spread.map_or(true, |best| spread.magnitude > best.magnitude);
            if wider {
                largest_spread = Some(spread);
            }
        }
    }

    Report {
        period,
        readings,
        highest: highest.into_vec(),
        lowest: lowest.into_vec(),
        largest_spread,
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[f64]) -> fmt::Result {
    if values.is_empty() {
        return write!(f, "none");
    }
    let mut separator = "";
    for value in values {
        write!(f, "{}{}", separator, value)?;
        separator = " ";
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Report for period {} ({} readings):", self.period, self.readings)?;

        write!(f, "Top {} highest temperatures: ", TOP_N)?;
        write_values(f, &self.highest)?;
        writeln!(f)?;

        write!(f, "Top {} lowest temperatures: ", TOP_N)?;
        write_values(f, &self.lowest)?;
        writeln!(f)?;

        match &self.largest_spread {
            Some(spread) => writeln!(
                f,
                "Largest temperature difference: {} at tick {} (between {} and {})",
                spread.magnitude,
                spread.position,
                spread.start.format(TIMESTAMP_FORMAT),
                spread.end.format(TIMESTAMP_FORMAT)
            ),
            None => writeln!(f, "Largest temperature difference: no readings"),
        }
    }
}
