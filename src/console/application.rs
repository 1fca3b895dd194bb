use std::sync::Arc;
use futures::channel::mpsc::channel;
use log::{error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::console::input::input_task;
use crate::console::presenter::{describe_change, format_record, presenter_task, HELP};
use crate::console::types::{Cli, Command};
use crate::device::btle::BtleBackend;
use crate::device::connection::connection_task;
use crate::device::types::DeviceEvent;
use crate::error::AppRunError;
use crate::repetition::record::today_label;
use crate::repetition::sink::{repetition_sink_task, ListChange, RepetitionSink};
use crate::repetition::store::{default_store_path, JsonFileRepetitionStore, RepetitionStore};

fn open_store(config: &Config) -> Result<JsonFileRepetitionStore, AppRunError> {
    let path = match &config.store_path {
        Some(path) => path.clone(),
        None => default_store_path()?,
    };
    Ok(JsonFileRepetitionStore::open(&path)?)
}

async fn join(name: &str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        error!("Failed to join {}: {}", name, err);
    }
}

async fn watch(config: Config, connect: bool) -> Result<(), AppRunError> {
    // this token is cancelled upon exit
    let app_cancel = CancellationToken::new();

    let store = open_store(&config)?;
    let (device_event_sender, device_event_receiver) = channel::<DeviceEvent>(64);
    let (list_change_sender, list_change_receiver) = channel::<ListChange>(64);

    let (sink_sender, sink_handle) = repetition_sink_task(
        app_cancel.clone(),
        RepetitionSink::new(store, config.duplicate_policy),
        vec![list_change_sender],
    );

    let (backend, backend_events) = BtleBackend::new(app_cancel.clone()).await?;
    let (mut intent, connection_handle) = connection_task(
        app_cancel.clone(),
        Arc::new(backend),
        backend_events,
        config.connection_settings(),
        vec![device_event_sender],
        sink_sender.clone(),
    );

    let presenter_handle = presenter_task(app_cancel.clone(), device_event_receiver, list_change_receiver);

    println!("{}", HELP);
    if connect {
        intent.set_desired(true).await?;
    }

    let input_handle = input_task(app_cancel.clone(), intent, sink_sender);

    app_cancel.cancelled().await;
    info!("Shutting down");

    join("connection task", connection_handle).await;
    join("repetition sink task", sink_handle).await;
    join("presenter task", presenter_handle).await;
    join("input task", input_handle).await;
    Ok(())
}

fn list(config: &Config, date: Option<String>) -> Result<(), AppRunError> {
    let store = open_store(config)?;
    let date_label = date.unwrap_or_else(today_label);

    let change = ListChange::Reset {
        date_label: date_label.clone(),
        records: store.query_date(&date_label),
    };
    for line in describe_change(&change) {
        println!("{}", line);
    }
    Ok(())
}

fn delete(config: &Config, capture_time_ms: i64) -> Result<(), AppRunError> {
    let mut store = open_store(config)?;

    match store.delete(capture_time_ms)? {
        Some(record) => println!("Deleted {}", format_record(0, &record)),
        None => println!("No repetition captured at {}", capture_time_ms),
    }
    Ok(())
}

pub async fn run_application(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(cli.config.as_deref())?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let config = config_io.read().await?;
    info!(
        "Target {}, auto reconnect {}, cancel while connecting {}, duplicates {}",
        config.peripheral_address, config.auto_reconnect, config.cancel_while_connecting, config.duplicate_policy,
    );

    match cli.command.unwrap_or(Command::Watch { connect: false }) {
        Command::Watch { connect } => watch(config, connect).await,
        Command::List { date } => list(&config, date),
        Command::Delete { capture_time_ms } => delete(&config, capture_time_ms),
        Command::InitConfig => {
            config_io.save(&config).await?;
            println!("Wrote {}", config_io.path()?.to_string_lossy());
            Ok(())
        },
    }
}
