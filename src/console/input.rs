use futures::SinkExt;
use futures::channel::mpsc::Sender;
use log::{info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::console::presenter::HELP;
use crate::console::types::ConsoleInput;
use crate::device::intent::ConnectionIntent;
use crate::error::DeviceError;
use crate::repetition::record::today_label;
use crate::repetition::sink::SinkCommand;

pub fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim();
    let mut words = line.split_whitespace();

    match (words.next(), words.next(), words.next()) {
        (None, _, _) => ConsoleInput::Toggle,
        (Some("c"), None, _) => ConsoleInput::Connect,
        (Some("x"), None, _) => ConsoleInput::Disconnect,
        (Some("d"), Some(key), None) => match key.parse() {
            Ok(capture_time_ms) => ConsoleInput::Delete(capture_time_ms),
            Err(_) => ConsoleInput::Unknown(line.to_string()),
        },
        (Some("show"), Some(date), None) => ConsoleInput::ShowDate(date.to_string()),
        (Some("today"), None, _) => ConsoleInput::Today,
        (Some("p"), None, _) => ConsoleInput::PermissionGranted,
        (Some("b"), None, _) => ConsoleInput::BluetoothEnabled,
        (Some("h"), None, _) | (Some("help"), None, _) => ConsoleInput::Help,
        (Some("q"), None, _) | (Some("quit"), None, _) => ConsoleInput::Quit,
        _ => ConsoleInput::Unknown(line.to_string()),
    }
}

async fn handle_input(
    input: ConsoleInput,
    intent: &mut ConnectionIntent,
    sink: &mut Sender<SinkCommand>,
) -> Result<(), DeviceError> {
    match input {
        ConsoleInput::Toggle => intent.toggle().await?,
        ConsoleInput::Connect => intent.set_desired(true).await?,
        ConsoleInput::Disconnect => intent.set_desired(false).await?,
        ConsoleInput::PermissionGranted => intent.permission_changed(true).await?,
        ConsoleInput::BluetoothEnabled => intent.bluetooth_enabled_changed(true).await?,
        ConsoleInput::Delete(capture_time_ms) => send_sink_command(sink, SinkCommand::Delete(capture_time_ms)).await,
        ConsoleInput::ShowDate(date_label) => send_sink_command(sink, SinkCommand::ShowDate(date_label)).await,
        ConsoleInput::Today => send_sink_command(sink, SinkCommand::ShowDate(today_label())).await,
        ConsoleInput::Help => println!("{}", HELP),
        ConsoleInput::Unknown(line) => println!("Unknown command {:?}, type 'h' for help", line),
        ConsoleInput::Quit => {},
    }

    Ok(())
}

async fn send_sink_command(sink: &mut Sender<SinkCommand>, command: SinkCommand) {
    if let Err(err) = sink.send(command).await {
        warn!("Failed to send command to the repetition sink: {}", err);
    }
}

/// Reads commands from stdin. Quitting cancels `cancel`.
pub fn input_task(
    cancel: CancellationToken,
    mut intent: ConnectionIntent,
    mut sink: Sender<SinkCommand>,
) -> JoinHandle<()> {
    spawn(async move {
        let mut lines = BufReader::new(stdin()).lines();

        'mainloop: loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                line = lines.next_line() => line,
            };

            let input = match line {
                Ok(Some(line)) => parse_line(&line),
                Ok(None) => {
                    info!("stdin closed, no more console commands");
                    break 'mainloop;
                },
                Err(err) => {
                    warn!("Failed to read from stdin: {}", err);
                    break 'mainloop;
                },
            };

            if input == ConsoleInput::Quit {
                cancel.cancel();
                break 'mainloop;
            }

            if let Err(err) = handle_input(input, &mut intent, &mut sink).await {
                warn!("{}", err);
                cancel.cancel();
                break 'mainloop;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_line(""), ConsoleInput::Toggle);
        assert_eq!(parse_line("   \n"), ConsoleInput::Toggle);
        assert_eq!(parse_line("c"), ConsoleInput::Connect);
        assert_eq!(parse_line("x"), ConsoleInput::Disconnect);
        assert_eq!(parse_line("d 1000"), ConsoleInput::Delete(1000));
        assert_eq!(parse_line("show 2024-03-09"), ConsoleInput::ShowDate("2024-03-09".to_string()));
        assert_eq!(parse_line("today"), ConsoleInput::Today);
        assert_eq!(parse_line("p"), ConsoleInput::PermissionGranted);
        assert_eq!(parse_line("b"), ConsoleInput::BluetoothEnabled);
        assert_eq!(parse_line("q"), ConsoleInput::Quit);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(parse_line("d soon"), ConsoleInput::Unknown("d soon".to_string()));
        assert_eq!(parse_line("d 1 2"), ConsoleInput::Unknown("d 1 2".to_string()));
        assert_eq!(parse_line("connect"), ConsoleInput::Unknown("connect".to_string()));
    }
}
