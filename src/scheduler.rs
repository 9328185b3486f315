use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::report::{self, Report};
use crate::sensor::{SensorProducer, StopSignal};
use crate::store::ReadingStore;
use crate::types::SensorId;

/// Runs the whole pipeline: one producer thread per sensor and a report
/// handed to `emit` once per period.
///
/// Returns the number of reports emitted. Producers are always stopped and
/// joined before this returns, including on error.
pub fn run<F>(config: &Config, mut emit: F) -> Result<u64>
where
    F: FnMut(&Report),
{
    let store = Arc::new(ReadingStore::new(config.num_sensors, config.readings_per_period)?);
    let stop = Arc::new(StopSignal::default());

    info!(
        "Starting {} sensors, {} readings per period every {:?}",
        config.num_sensors,
        config.readings_per_period,
        config.tick_interval()
    );

    let mut producers = Vec::with_capacity(config.num_sensors);
    let outcome = spawn_producers(config, &store, &stop, &mut producers)
        .and_then(|()| report_loop(config, &store, &mut emit));

    info!("Stopping sensors");
    stop.stop();
    store.shutdown();
    let joined = join_producers(producers);

    let reported = outcome?;
    joined?;
    info!("Finished after {} reports", reported);
    Ok(reported)
}

fn spawn_producers(
    config: &Config,
    store: &Arc<ReadingStore>,
    stop: &Arc<StopSignal>,
    producers: &mut Vec<(SensorId, JoinHandle<()>)>,
) -> Result<()> {
    for id in 0..config.num_sensors {
        let producer = SensorProducer::new(
            id,
            OsRng.next_u64(),
            config.temperature_range(),
            config.tick_interval(),
        );
        let store = Arc::clone(store);
        let stop = Arc::clone(stop);
        let handle = thread::Builder::new()
            .name(format!("sensor-{}", id))
            .spawn(move || producer.run(store, stop))?;
        producers.push((id, handle));
    }
    Ok(())
}

fn report_loop<F>(config: &Config, store: &ReadingStore, emit: &mut F) -> Result<u64>
where
    F: FnMut(&Report),
{
    let period = config.period()?;
    let max_wait = config.stall_timeout()?;

    let mut boundary = Instant::now();
    let mut generation = 0;
    let mut reported = 0;
    while config.periods == 0 || reported < config.periods {
        boundary = boundary
            .checked_add(period)
            .ok_or_else(|| Error::InvalidConfig("run outlasts the system clock".into()))?;
        if let Some(remaining) = boundary.checked_duration_since(Instant::now()) {
            thread::sleep(remaining);
        }

        let snapshot = match store.snapshot_for_aggregation(max_wait) {
            Some(snapshot) => snapshot,
            None => {
                warn!("Period {} did not close in time", generation);
                return Err(Error::Stalled { period: generation, waited: max_wait });
            }
        };
        assert_eq!(snapshot.period(), generation, "generations were skipped");

        if generation < config.warmup_periods {
            info!("Discarding warm-up period {}", generation);
            drop(snapshot);
        } else {
            let report = report::aggregate(snapshot.period(), snapshot.slots());
            drop(snapshot);
            emit(&report);
            reported += 1;
        }
        generation += 1;
    }

    Ok(reported)
}

fn join_producers(producers: Vec<(SensorId, JoinHandle<()>)>) -> Result<()> {
    let mut result = Ok(());
    for (id, handle) in producers {
        if handle.join().is_err() {
            error!("Sensor {} panicked", id);
            if result.is_ok() {
                result = Err(Error::ProducerPanicked(id));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn fast_config() -> Config {
        Config {
            num_sensors: 4,
            readings_per_period: 3,
            tick_interval_ms: 25,
            periods: 3,
            ..Config::default()
        }
    }

    #[test]
    fn every_report_covers_one_full_period() {
        let config = fast_config();
        let mut reports = Vec::new();

        let reported = run(&config, |report| reports.push(report.clone())).unwrap();

        assert_eq!(reported, 3);
        assert_eq!(reports.iter().map(|r| r.period).collect::<Vec<_>>(), vec![0, 1, 2]);
        for report in &reports {
            assert_eq!(report.readings, 4 * 3);
            assert_eq!(report.highest.len(), 5);
            assert!(report.highest.windows(2).all(|w| w[0] >= w[1]));
            assert!(report.lowest.windows(2).all(|w| w[0] <= w[1]));
            assert!(report.highest.iter().chain(&report.lowest).all(|v| (-100. ..=170.).contains(v)));
            let spread = report.largest_spread.unwrap();
            assert!(spread.position < 3);
            assert!(spread.start <= spread.end);
        }
    }

    #[test]
    fn warmup_periods_are_not_reported() {
        let config = Config { periods: 2, warmup_periods: 1, ..fast_config() };
        let mut periods = Vec::new();

        run(&config, |report| periods.push(report.period)).unwrap();

        assert_eq!(periods, vec![1, 2]);
    }

    #[test]
    fn fewer_readings_than_list_length() {
        let config = Config {
            num_sensors: 2,
            readings_per_period: 1,
            periods: 1,
            ..fast_config()
        };
        let mut reports = Vec::new();

        run(&config, |report| reports.push(report.clone())).unwrap();

        assert_eq!(reports[0].readings, 2);
        assert_eq!(reports[0].highest.len(), 2);
        assert_eq!(reports[0].lowest.len(), 2);
    }

    #[test]
    fn unfilled_period_stalls() {
        let config = Config { readings_per_period: 2, tick_interval_ms: 5, ..fast_config() };
        let store = ReadingStore::new(2, 2).unwrap();

        let result = report_loop(&config, &store, &mut |_: &Report| panic!("no report expected"));

        match result {
            Err(Error::Stalled { period: 0, waited }) => {
                assert_eq!(waited, Duration::from_millis(15));
            }
            other => panic!("expected a stall in period 0, got {:?}", other),
        }
    }

    #[test]
    fn panicking_producer_is_reported() {
        let producers = vec![
            (0, thread::spawn(|| {})),
            (1, thread::spawn(|| panic!("sensor fault"))),
            (2, thread::spawn(|| panic!("sensor fault"))),
        ];

        let result = join_producers(producers);

        assert!(matches!(result, Err(Error::ProducerPanicked(1))));
    }

    #[test]
    fn healthy_producers_join_cleanly() {
        let producers = (0..3).map(|id| (id, thread::spawn(|| {}))).collect();
        assert!(join_producers(producers).is_ok());
    }

    #[test]
    fn allocation_failure_aborts_startup() {
        let config = Config { readings_per_period: usize::MAX / 2, ..fast_config() };
        let result = run(&config, |_| panic!("no report expected"));
        assert!(matches!(result, Err(Error::Allocation { .. })));
    }
}
