use std::env;
use std::time::Duration;
use crate::console::application::run_application;
use crate::console::types::Cli;
use crate::error::AppRunError;

pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod repetition;

pub fn init_logging(level: log::LevelFilter) -> Result<(), AppRunError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        let file = fern::log_file(&log_file)
            .map_err(|source| AppRunError::LogFileError { path: log_file, source })?;
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(run_application(cli));

    // the stdin reader may still be blocked on a read
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}
