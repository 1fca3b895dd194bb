use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};

pub const DATE_LABEL_FORMAT: &str = "%Y-%m-%d";

/// Statistics of one repetition as reported by the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepetitionRecord {
    pub capture_time_ms: i64,
    pub date_label: String,
    pub max_velocity: f32,
    pub min_velocity: f32,
    pub max_acceleration: f32,
    pub min_acceleration: f32,
}

impl RepetitionRecord {
    /// The same statistics filed under a different capture time.
    pub fn with_capture_time(&self, capture_time_ms: i64) -> RepetitionRecord {
        RepetitionRecord {
            capture_time_ms,
            ..self.clone()
        }
    }
}

pub fn date_label<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    time.format(DATE_LABEL_FORMAT).to_string()
}

pub fn today_label() -> String {
    date_label(&Local::now())
}
