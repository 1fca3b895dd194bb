use indexmap::IndexMap;

use crate::repetition::record::RepetitionRecord;

/// The records of one day in arrival order, newest last.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RepetitionList {
    date_label: String,
    records: IndexMap<i64, RepetitionRecord>,
}

impl RepetitionList {
    pub fn new(date_label: String, records: Vec<RepetitionRecord>) -> Self {
        RepetitionList {
            date_label,
            records: records.into_iter().map(|record| (record.capture_time_ms, record)).collect(),
        }
    }

    pub fn date_label(&self) -> &str {
        &self.date_label
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, capture_time_ms: i64) -> Option<&RepetitionRecord> {
        self.records.get(&capture_time_ms)
    }

    pub fn records(&self) -> impl Iterator<Item = &RepetitionRecord> {
        self.records.values()
    }

    /// Appends `record`, returning its index. A record with the same key is left alone.
    pub fn push(&mut self, record: RepetitionRecord) -> Option<usize> {
        if self.records.contains_key(&record.capture_time_ms) {
            return None;
        }
        let (index, _) = self.records.insert_full(record.capture_time_ms, record);
        Some(index)
    }

    /// Swaps the record with the same key in place, returning its index and the old record.
    pub fn replace(&mut self, record: RepetitionRecord) -> Option<(usize, RepetitionRecord)> {
        let (index, _, current) = self.records.get_full_mut(&record.capture_time_ms)?;
        let old = std::mem::replace(current, record);
        Some((index, old))
    }

    /// Removes the record, keeping the order of the rest.
    pub fn remove(&mut self, capture_time_ms: i64) -> Option<(usize, RepetitionRecord)> {
        self.records.shift_remove_full(&capture_time_ms)
            .map(|(index, _, record)| (index, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(capture_time_ms: i64) -> RepetitionRecord {
        RepetitionRecord {
            capture_time_ms,
            date_label: "2024-03-09".to_string(),
            max_velocity: 1.0,
            min_velocity: 0.5,
            max_acceleration: 3.0,
            min_acceleration: -3.0,
        }
    }

    #[test]
    fn keeps_arrival_order() {
        let mut list = RepetitionList::new("2024-03-09".to_string(), vec![]);
        assert_eq!(list.push(record(3000)), Some(0));
        assert_eq!(list.push(record(1000)), Some(1));
        assert_eq!(list.push(record(2000)), Some(2));
        assert_eq!(list.push(record(1000)), None);

        let keys: Vec<i64> = list.records().map(|r| r.capture_time_ms).collect();
        assert_eq!(keys, vec![3000, 1000, 2000]);
    }

    #[test]
    fn remove_reports_the_index_and_closes_the_gap() {
        let mut list = RepetitionList::new("2024-03-09".to_string(), vec![record(1), record(2), record(3)]);

        let (index, removed) = list.remove(2).unwrap();
        assert_eq!(index, 1);
        assert_eq!(removed.capture_time_ms, 2);
        assert_eq!(list.records().map(|r| r.capture_time_ms).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(list.remove(2), None);
    }

    #[test]
    fn replace_keeps_the_position() {
        let mut list = RepetitionList::new("2024-03-09".to_string(), vec![record(1), record(2)]);
        let mut faster = record(1);
        faster.max_velocity = 2.0;

        let (index, old) = list.replace(faster).unwrap();
        assert_eq!(index, 0);
        assert_eq!(old.max_velocity, 1.0);
        assert_eq!(list.get(1).unwrap().max_velocity, 2.0);
        assert_eq!(list.replace(record(9)), None);
    }
}
