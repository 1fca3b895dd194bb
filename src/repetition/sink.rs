use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{channel, Sender};
use log::{info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::DuplicatePolicy;
use crate::error::StoreError;
use crate::repetition::list::RepetitionList;
use crate::repetition::record::{today_label, RepetitionRecord};
use crate::repetition::store::RepetitionStore;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCommand {
    /// A freshly decoded repetition.
    Record(RepetitionRecord),
    Delete(i64),
    /// Show the records of another day.
    ShowDate(String),
}

/// A mutation of the displayed list.
#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    Inserted { index: usize, record: RepetitionRecord },
    Removed { index: usize, record: RepetitionRecord },
    /// The list now shows another day.
    Reset { date_label: String, records: Vec<RepetitionRecord> },
}

enum Stored {
    Inserted(RepetitionRecord),
    Replaced(RepetitionRecord),
    Skipped,
}

/// Applies records to the store and to the displayed list together.
pub struct RepetitionSink<S: RepetitionStore> {
    store: S,
    list: RepetitionList,
    policy: DuplicatePolicy,
    /// The list shows the current day and follows it past midnight.
    live: bool,
}

impl<S: RepetitionStore> RepetitionSink<S> {
    /// Starts with the records stored for today.
    pub fn new(store: S, policy: DuplicatePolicy) -> Self {
        let mut sink = RepetitionSink::for_date(store, policy, &today_label());
        sink.live = true;
        sink
    }

    pub fn for_date(store: S, policy: DuplicatePolicy, date_label: &str) -> Self {
        let list = RepetitionList::new(date_label.to_string(), store.query_date(date_label));

        RepetitionSink {
            store,
            list,
            policy,
            live: false,
        }
    }

    pub fn list(&self) -> &RepetitionList {
        &self.list
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The list as a single [`ListChange::Reset`].
    pub fn snapshot(&self) -> ListChange {
        ListChange::Reset {
            date_label: self.list.date_label().to_string(),
            records: self.list.records().cloned().collect(),
        }
    }

    fn load(&mut self, date_label: &str) -> ListChange {
        self.list = RepetitionList::new(date_label.to_string(), self.store.query_date(date_label));
        self.snapshot()
    }

    pub fn accept(&mut self, record: RepetitionRecord) -> Result<Vec<ListChange>, StoreError> {
        let date_label = record.date_label.clone();
        // the list is only touched once the store has taken the record
        let stored = self.store_record(record)?;

        if self.live && date_label != self.list.date_label() {
            info!("Day changed to {}", date_label);
            return Ok(vec![self.load(&date_label)]);
        }

        let mut changes = Vec::new();
        match stored {
            Stored::Inserted(record) => self.append(record, &mut changes),
            Stored::Replaced(record) => {
                if record.date_label == self.list.date_label() {
                    match self.list.replace(record.clone()) {
                        Some((index, old)) => {
                            changes.push(ListChange::Removed { index, record: old });
                            changes.push(ListChange::Inserted { index, record });
                        },
                        None => self.append(record, &mut changes),
                    }
                }
            },
            Stored::Skipped => {},
        }

        Ok(changes)
    }

    fn store_record(&mut self, record: RepetitionRecord) -> Result<Stored, StoreError> {
        match self.store.insert(record.clone()) {
            Ok(()) => Ok(Stored::Inserted(record)),
            Err(StoreError::DuplicateKey { capture_time_ms }) => match self.policy {
                DuplicatePolicy::Shift => {
                    let mut free = capture_time_ms + 1;
                    while self.store.contains(free) {
                        free += 1;
                    }
                    info!("Repetition at {} already stored, storing it at {}", capture_time_ms, free);

                    let shifted = record.with_capture_time(free);
                    self.store.insert(shifted.clone())?;
                    Ok(Stored::Inserted(shifted))
                },
                DuplicatePolicy::Replace => {
                    info!("Replacing stored repetition at {}", capture_time_ms);
                    self.store.replace(record.clone())?;
                    Ok(Stored::Replaced(record))
                },
                DuplicatePolicy::Skip => {
                    info!("Skipping repetition at {}, already stored", capture_time_ms);
                    Ok(Stored::Skipped)
                },
            },
            Err(err) => Err(err),
        }
    }

    fn append(&mut self, record: RepetitionRecord, changes: &mut Vec<ListChange>) {
        // records of another day are stored but not shown
        if record.date_label != self.list.date_label() {
            return;
        }

        if let Some(index) = self.list.push(record.clone()) {
            changes.push(ListChange::Inserted { index, record });
        }
    }

    /// Removes the record from the store and from the list.
    pub fn delete(&mut self, capture_time_ms: i64) -> Result<Vec<ListChange>, StoreError> {
        let deleted = self.store.delete(capture_time_ms)?;
        if deleted.is_none() {
            info!("No repetition at {} to delete", capture_time_ms);
        }

        Ok(self.list.remove(capture_time_ms)
            .map(|(index, record)| ListChange::Removed { index, record })
            .into_iter()
            .collect())
    }

    pub fn show_date(&mut self, date_label: &str) -> ListChange {
        self.live = date_label == today_label();
        self.load(date_label)
    }

    pub fn apply(&mut self, command: SinkCommand) -> Result<Vec<ListChange>, StoreError> {
        match command {
            SinkCommand::Record(record) => self.accept(record),
            SinkCommand::Delete(capture_time_ms) => self.delete(capture_time_ms),
            SinkCommand::ShowDate(date_label) => Ok(vec![self.show_date(&date_label)]),
        }
    }
}

/// Spawns the task that owns the sink. The current list is sent to every listener first.
pub fn repetition_sink_task<S: RepetitionStore + 'static>(
    cancel: CancellationToken,
    mut sink: RepetitionSink<S>,
    mut listeners: Vec<Sender<ListChange>>,
) -> (Sender<SinkCommand>, JoinHandle<()>) {
    let (command_sender, mut command_receiver) = channel::<SinkCommand>(128);

    let handle = spawn(async move {
        let mut changes = vec![sink.snapshot()];

        'mainloop: loop {
            for change in changes.drain(..) {
                for listener in &mut listeners {
                    if let Err(err) = listener.send(change.clone()).await {
                        warn!("Failed to send list change: {}", err);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = command_receiver.next() => match command {
                    Some(command) => match sink.apply(command) {
                        Ok(applied) => changes = applied,
                        Err(err) => warn!("Repetition not applied: {}", err),
                    },
                    None => break 'mainloop,
                },
            }
        }
    });

    (command_sender, handle)
}
