use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::store::ReadingStore;
use crate::types::{Reading, SensorId};

/// Cooperative stop flag shared by the scheduler and every producer.
///
/// The flag itself is atomic so checking it between ticks takes no lock. The
/// mutex only pairs with the condvar so a stop can cut a tick sleep short.
#[derive(Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    sleep: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Taking the lock orders the store before any sleeper's check
        let _sleep = self.sleep.lock().unwrap_or_else(PoisonError::into_inner);
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleeps until `deadline` unless stopped first. Returns true if stopped.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.is_stopped() {
            return true;
        }
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout == Duration::from_secs(0) {
            return false;
        }

        let sleep = self.sleep.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .condvar
            .wait_timeout_while(sleep, timeout, |_| !self.is_stopped())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_stopped()
    }
}

/// Simulated temperature sensor producing one uniformly random reading per tick.
pub struct SensorProducer {
    id: SensorId,
    rng: StdRng,
    range: RangeInclusive<i32>,
    tick_interval: Duration,
}

impl SensorProducer {
    pub fn new(id: SensorId, seed: u64, range: RangeInclusive<i32>, tick_interval: Duration) -> Self {
        Self {
            id,
            rng: StdRng::seed_from_u64(seed),
            range,
            tick_interval,
        }
    }

    pub fn sample(&mut self) -> Reading {
        let value = self.rng.gen_range(self.range.clone());
        Reading::now(f64::from(value))
    }

    /// Ticks until `stop` is raised or the store shuts down.
    pub fn run(mut self, store: Arc<ReadingStore>, stop: Arc<StopSignal>) {
        let mut slot = store.checkout(self.id);
        let mut position = 0;
        let mut next_tick = Instant::now();

        debug!("Sensor {} started", self.id);
        while !stop.is_stopped() {
            let reading = self.sample();
            trace!("Sensor {} tick {}: {}", self.id, position, reading.value);
            slot.write(position, reading);
            position += 1;

            if position == slot.len() {
                let period = slot.period();
                slot = match store.commit(slot) {
                    Some(next) => next,
                    None => break,
                };
                debug!("Sensor {} committed period {}", self.id, period);
                position = 0;
                // Don't burst through missed ticks after waiting on the aggregator
                let now = Instant::now();
                if next_tick < now {
                    next_tick = now;
                }
            }

            next_tick += self.tick_interval;
            if stop.wait_until(next_tick) {
                break;
            }
        }
        debug!("Sensor {} stopped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn samples_stay_in_range() {
        let mut producer = SensorProducer::new(0, 7, -100..=170, Duration::from_millis(1));
        for _ in 0..10_000 {
            let value = producer.sample().value;
            assert!((-100. ..=170.).contains(&value), "{} out of range", value);
            assert_eq!(value.fract(), 0.);
        }
    }

    #[test]
    fn same_seed_gives_same_values() {
        let values = |seed| {
            let mut producer = SensorProducer::new(3, seed, -100..=170, Duration::from_millis(1));
            (0..32).map(|_| producer.sample().value).collect::<Vec<_>>()
        };
        assert_eq!(values(42), values(42));
        assert_ne!(values(42), values(43));
    }

    #[test]
    fn single_value_range() {
        let mut producer = SensorProducer::new(0, 1, 21..=21, Duration::from_millis(1));
        assert_eq!(producer.sample().value, 21.);
    }

    #[test]
    fn stop_signal_interrupts_wait() {
        let stop = Arc::new(StopSignal::default());
        let waiter = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || stop.wait_until(Instant::now() + Duration::from_secs(60)))
        };
        stop.stop();
        assert!(waiter.join().unwrap());
        assert!(stop.is_stopped());
    }

    #[test]
    fn wait_until_past_deadline_returns_immediately() {
        let stop = StopSignal::default();
        assert!(!stop.wait_until(Instant::now()));
    }

    #[test]
    fn stopped_signal_does_not_sleep() {
        let stop = StopSignal::default();
        stop.stop();

        let started = Instant::now();
        assert!(stop.wait_until(started + Duration::from_secs(60)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_reaches_every_sleeper() {
        let stop = Arc::new(StopSignal::default());
        let sleepers = (0..4)
            .map(|_| {
                let stop = Arc::clone(&stop);
                thread::spawn(move || stop.wait_until(Instant::now() + Duration::from_secs(60)))
            })
            .collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(20));
        stop.stop();
        for sleeper in sleepers {
            assert!(sleeper.join().unwrap());
        }
    }

    #[test]
    fn producers_fill_whole_periods() {
        let store = Arc::new(ReadingStore::new(2, 4).unwrap());
        let stop = Arc::new(StopSignal::default());

        let handles = (0..2)
            .map(|id| {
                let producer = SensorProducer::new(id, id as u64, -5..=5, Duration::from_millis(1));
                let (store, stop) = (Arc::clone(&store), Arc::clone(&stop));
                thread::spawn(move || producer.run(store, stop))
            })
            .collect::<Vec<_>>();

        for period in 0..3 {
            let snapshot = store
                .snapshot_for_aggregation(Duration::from_secs(5))
                .expect("period never closed");
            assert_eq!(snapshot.period(), period);
            for slot in snapshot.slots() {
                assert!(slot.is_complete());
                assert_eq!(slot.period(), period);
                for position in 1..slot.len() {
                    assert!(slot.get(position - 1).unwrap().timestamp <= slot.get(position).unwrap().timestamp);
                }
            }
        }

        stop.stop();
        store.shutdown();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
