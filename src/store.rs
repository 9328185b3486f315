//! Per-sensor reading storage with a two-generation handoff.
//!
//! Every sensor owns two slot buffers for the lifetime of the store. At any
//! time one of them is held by the sensor's producer (the filling
//! generation) and the other is either idle in the store or part of the
//! closed generation the aggregator reads. Buffers only change hands under
//! the store lock, and only once per period: when a producer commits a
//! finished slot and when the aggregator releases a snapshot.

use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{Reading, SensorId};

/// Slot buffers allocated per sensor: one filling, one closed.
const BUFFERS_PER_SENSOR: usize = 2;

/// One sensor's readings for one period, indexed by tick position.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSlot {
    sensor: SensorId,
    period: u64,
    readings: Vec<Option<Reading>>,
}

impl SensorSlot {
    pub fn new(sensor: SensorId, period: u64, positions: usize) -> Result<Self> {
        let mut readings = Vec::new();
        readings
            .try_reserve_exact(positions)
            .map_err(|_| Error::Allocation { sensors: 1, positions })?;
        readings.resize(positions, None);

        Ok(Self { sensor, period, readings })
    }

    pub fn sensor(&self) -> SensorId {
        self.sensor
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Number of tick positions in the slot.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Stores the reading taken at tick `position` of this slot's period.
    ///
    /// Writing past the end of the period is a bug in the caller.
    pub fn write(&mut self, position: usize, reading: Reading) {
        assert!(
            position < self.readings.len(),
            "sensor {} wrote position {} of a {}-position slot",
            self.sensor,
            position,
            self.readings.len()
        );
        self.readings[position] = Some(reading);
    }

    /// The reading at `position`, or `None` if that tick has not happened yet.
    pub fn get(&self, position: usize) -> Option<&Reading> {
        self.readings.get(position).and_then(Option::as_ref)
    }

    pub fn written(&self) -> usize {
        self.readings.iter().filter(|r| r.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.readings.iter().all(Option::is_some)
    }

    fn reset(&mut self, period: u64) {
        self.period = period;
        for reading in self.readings.iter_mut() {
            *reading = None;
        }
    }
}

struct Generations {
    /// Period the producers are currently filling.
    filling_period: u64,
    /// Slots committed so far for `filling_period`, indexed by sensor.
    filling: Vec<Option<SensorSlot>>,
    committed: usize,
    /// A complete generation waiting for the aggregator.
    closed: Option<Vec<SensorSlot>>,
    /// Set while the aggregator holds a snapshot.
    in_flight: bool,
    /// Buffers not currently held by a producer or the aggregator.
    idle: Vec<Vec<SensorSlot>>,
    checked_out: Vec<bool>,
    shutdown: bool,
}

impl Generations {
    /// A producer may hand over a slot for `period` once that period is the
    /// one filling and the previous generation has been fully read.
    fn accepts(&self, period: u64) -> bool {
        self.filling_period == period && self.closed.is_none() && !self.in_flight
    }
}

pub struct ReadingStore {
    num_sensors: usize,
    generations: Mutex<Generations>,
    changed: Condvar,
}

impl ReadingStore {
    /// Allocates every slot buffer the run will ever use.
    pub fn new(num_sensors: usize, readings_per_period: usize) -> Result<Self> {
        let allocation_error = || Error::Allocation {
            sensors: num_sensors,
            positions: readings_per_period,
        };

        let mut idle = Vec::new();
        idle.try_reserve_exact(num_sensors).map_err(|_| allocation_error())?;
        for sensor in 0..num_sensors {
            let mut buffers = Vec::with_capacity(BUFFERS_PER_SENSOR);
            for _ in 0..BUFFERS_PER_SENSOR {
                buffers.push(
                    SensorSlot::new(sensor, 0, readings_per_period).map_err(|_| allocation_error())?,
                );
            }
            idle.push(buffers);
        }

        let mut filling = Vec::new();
        filling.try_reserve_exact(num_sensors).map_err(|_| allocation_error())?;
        filling.resize(num_sensors, None);

        Ok(Self {
            num_sensors,
            generations: Mutex::new(Generations {
                filling_period: 0,
                filling,
                committed: 0,
                closed: None,
                in_flight: false,
                idle,
                checked_out: vec![false; num_sensors],
                shutdown: false,
            }),
            changed: Condvar::new(),
        })
    }

    /// Hands `sensor` its first slot. Called once per producer.
    pub fn checkout(&self, sensor: SensorId) -> SensorSlot {
        let mut generations = self.lock();
        assert!(
            !mem::replace(&mut generations.checked_out[sensor], true),
            "sensor {} checked out more than once",
            sensor
        );
        let period = generations.filling_period;
        let mut slot = generations.idle[sensor]
            .pop()
            .unwrap_or_else(|| panic!("no idle buffer left for sensor {}", sensor));
        slot.reset(period);
        slot
    }

    /// Hands a finished slot to the store and returns an empty slot for the
    /// producer's next period.
    ///
    /// Blocks while the previous generation is still waiting for or held by
    /// the aggregator. Returns `None` if the store shuts down while waiting,
    /// in which case the slot is discarded.
    pub fn commit(&self, slot: SensorSlot) -> Option<SensorSlot> {
        assert!(
            slot.is_complete(),
            "sensor {} committed period {} with {}/{} readings",
            slot.sensor,
            slot.period,
            slot.written(),
            slot.len()
        );

        let generations = self.lock();
        let mut generations = self
            .changed
            .wait_while(generations, |g| !g.shutdown && !g.accepts(slot.period))
            .unwrap_or_else(PoisonError::into_inner);
        if generations.shutdown {
            return None;
        }

        let sensor = slot.sensor;
        let next_period = slot.period + 1;
        assert!(
            generations.filling[sensor].is_none(),
            "sensor {} committed period {} twice",
            sensor,
            slot.period
        );
        generations.filling[sensor] = Some(slot);
        generations.committed += 1;

        let mut next = generations.idle[sensor]
            .pop()
            .unwrap_or_else(|| panic!("no idle buffer left for sensor {}", sensor));
        next.reset(next_period);

        if generations.committed == self.num_sensors {
            let closed = generations
                .filling
                .iter_mut()
                .map(|slot| slot.take().expect("committed count includes every sensor"))
                .collect();
            generations.closed = Some(closed);
            generations.committed = 0;
            generations.filling_period += 1;
            self.changed.notify_all();
        }

        Some(next)
    }

    /// Waits up to `timeout` for a closed generation and takes it for reading.
    ///
    /// Returns `None` on timeout or shutdown. While the returned snapshot is
    /// alive no producer can start reusing its buffers.
    pub fn snapshot_for_aggregation(&self, timeout: Duration) -> Option<Snapshot<'_>> {
        let generations = self.lock();
        assert!(!generations.in_flight, "aggregator already holds a snapshot");

        let (mut generations, _) = self
            .changed
            .wait_timeout_while(generations, timeout, |g| !g.shutdown && g.closed.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        if generations.shutdown {
            return None;
        }

        let slots = generations.closed.take()?;
        generations.in_flight = true;
        let period = generations.filling_period - 1;

        Some(Snapshot { store: self, period, slots })
    }

    /// Wakes every waiter. Blocked commits return `None` from then on.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.changed.notify_all();
    }

    fn release(&self, slots: Vec<SensorSlot>) {
        let mut generations = self.lock();
        assert!(generations.in_flight, "released a snapshot that was never taken");
        for slot in slots {
            let sensor = slot.sensor();
            generations.idle[sensor].push(slot);
        }
        generations.in_flight = false;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Generations> {
        self.generations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only view of one closed generation. Dropping it releases the
/// buffers back to the producers.
pub struct Snapshot<'a> {
    store: &'a ReadingStore,
    period: u64,
    slots: Vec<SensorSlot>,
}

impl<'a> Snapshot<'a> {
    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn slots(&self) -> &[SensorSlot] {
        &self.slots
    }
}

impl<'a> Drop for Snapshot<'a> {
    fn drop(&mut self) {
        self.store.release(mem::take(&mut self.slots));
    }
}
