use std::io::ErrorKind;
use std::path::PathBuf;

extern crate chrono;
extern crate fern;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

mod config;
mod error;
mod report;
mod scheduler;
mod sensor;
mod store;
mod types;

use anyhow::Context;
use fern::colors::{Color, ColoredLevelConfig};

use config::Config;
use error::Error;

fn setup_logger(level: log::LevelFilter) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::default()
        .trace(Color::BrightBlue)
        .debug(Color::Cyan)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                colors.color(record.level()),
                message
            ))
        })
        .level(level)
        // Logs go to stderr so reports on stdout stay clean
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");
    let (config, from_file) = match config::read_config(&config_path) {
        Ok(config) => (config, true),
        Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => (Config::default(), false),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to load {}", config_path.display()))
        }
    };

    setup_logger(config.log_level()?).context("failed to set up logging")?;
    if !from_file {
        info!("No {} found, using default settings", config_path.display());
    }
    debug!("{:?}", config);

    scheduler::run(&config, |report| print!("{}", report)).context("sensor run failed")?;

    Ok(())
}
