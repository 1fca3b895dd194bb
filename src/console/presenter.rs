use chrono::{Local, TimeZone};
use futures::StreamExt;
use futures::channel::mpsc::Receiver;
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::types::{ConnectionState, DeviceEvent, Notice};
use crate::repetition::record::RepetitionRecord;
use crate::repetition::sink::ListChange;

pub const HELP: &str = "\
Enter          connect / disconnect
c, x           connect, disconnect
d <ms>         delete the repetition captured at <ms>
show <date>    show the repetitions of YYYY-MM-DD
today          show today's repetitions
p              bluetooth permission was granted
b              bluetooth was enabled
q              quit";

pub fn describe_state(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Idle => "Not connected".to_string(),
        ConnectionState::Scanning => "Searching for the OpenVBT unit...".to_string(),
        ConnectionState::Connecting => "Connecting...".to_string(),
        ConnectionState::NegotiatingMtu
        | ConnectionState::DiscoveringServices
        | ConnectionState::EnablingNotifications => "Setting up the connection...".to_string(),
        ConnectionState::Ready => "Connected, waiting for repetitions".to_string(),
        ConnectionState::Disconnecting => "Disconnecting...".to_string(),
        ConnectionState::Disconnected(reason) => format!("Disconnected: {}", reason),
    }
}

pub fn describe_notice(notice: &Notice) -> String {
    match notice {
        Notice::PermissionRequired => {
            "Bluetooth permission is required to scan. Grant it, then type 'p'.".to_string()
        },
        Notice::EnableBluetooth => "Bluetooth is off. Enable it, then type 'b'.".to_string(),
        Notice::BluetoothUnsupported => "This system has no usable bluetooth adapter.".to_string(),
        Notice::ScanFailed(code) => format!("Scanning failed (code {}). Press Enter to try again.", code),
    }
}

pub fn format_record(index: usize, record: &RepetitionRecord) -> String {
    let time = match Local.timestamp_millis_opt(record.capture_time_ms).single() {
        Some(time) => time.format("%H:%M:%S%.3f").to_string(),
        None => "??:??:??".to_string(),
    };

    format!(
        "#{:<3} {}  vel {:>6.2} / {:>6.2}  acc {:>6.2} / {:>6.2}  [{}]",
        index + 1,
        time,
        record.max_velocity,
        record.min_velocity,
        record.max_acceleration,
        record.min_acceleration,
        record.capture_time_ms,
    )
}

pub fn describe_change(change: &ListChange) -> Vec<String> {
    match change {
        ListChange::Inserted { index, record } => vec![format_record(*index, record)],
        ListChange::Removed { index, record } => {
            vec![format!("Removed #{} [{}]", index + 1, record.capture_time_ms)]
        },
        ListChange::Reset { date_label, records } => {
            let mut lines = vec![format!("== {} ({} repetitions) ==", date_label, records.len())];
            lines.extend(records.iter().enumerate().map(|(index, record)| format_record(index, record)));
            lines
        },
    }
}

/// Prints device events and list changes until `cancel` is cancelled.
pub fn presenter_task(
    cancel: CancellationToken,
    mut device_events: Receiver<DeviceEvent>,
    mut list_changes: Receiver<ListChange>,
) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(event) = device_events.next() => match event {
                    DeviceEvent::StateChange(state) => println!("* {}", describe_state(&state)),
                    DeviceEvent::IntentChange(desired) => {
                        println!("* {}", if desired { "Connection requested" } else { "Connection not requested" });
                    },
                    DeviceEvent::Notice(notice) => println!("! {}", describe_notice(&notice)),
                },
                Some(change) = list_changes.next() => {
                    for line in describe_change(&change) {
                        println!("{}", line);
                    }
                },
                else => break 'mainloop,
            }
        }
    })
}
