use clap::Parser;
use log::{error, info, LevelFilter};
use openbst_client::{init_logging, run};
use openbst_client::console::types::Cli;
use openbst_client::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info })?;
    info!(concat!("OpenBST client ", env!("CARGO_PKG_VERSION")));

    match run(cli) {
        Err(err @ AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("This application has already been started");
            Err(err)
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
