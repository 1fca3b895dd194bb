use chrono::{DateTime, Local, TimeZone};

use crate::error::PayloadError;
use crate::repetition::record::{date_label, RepetitionRecord};

const FIELD_SEPARATOR: char = ' ';
const FIELD_COUNT: usize = 4;

fn malformed(reason: &'static str, payload: &[u8]) -> PayloadError {
    PayloadError::MalformedPayload {
        reason,
        payload: String::from_utf8_lossy(payload).into_owned(),
    }
}

/// Parses the four statistics out of a notification value, in wire order:
/// max velocity, min velocity, max acceleration, min acceleration.
pub fn parse_fields(payload: &[u8]) -> Result<[f32; FIELD_COUNT], PayloadError> {
    if !payload.is_ascii() {
        return Err(malformed("not ascii", payload));
    }

    // the firmware may pad the value with a line ending or NUL bytes
    let text = std::str::from_utf8(payload)
        .map_err(|_| malformed("not ascii", payload))?
        .trim_end_matches(|c: char| c == '\0' || c == '\r' || c == '\n');

    let tokens: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
    if tokens.len() != FIELD_COUNT {
        return Err(malformed("expected exactly four fields", payload));
    }

    let mut fields = [0.0_f32; FIELD_COUNT];
    for (field, token) in fields.iter_mut().zip(tokens) {
        let value: f32 = token.parse().map_err(|_| malformed("field is not a number", payload))?;
        if !value.is_finite() {
            return Err(malformed("field is not finite", payload));
        }
        *field = value;
    }

    Ok(fields)
}

/// Decodes a notification value into a record captured at `captured_at`.
pub fn decode_payload<Tz: TimeZone>(payload: &[u8], captured_at: &DateTime<Tz>) -> Result<RepetitionRecord, PayloadError>
where
    Tz::Offset: std::fmt::Display,
{
    let [max_velocity, min_velocity, max_acceleration, min_acceleration] = parse_fields(payload)?;

    Ok(RepetitionRecord {
        capture_time_ms: captured_at.timestamp_millis(),
        date_label: date_label(captured_at),
        max_velocity,
        min_velocity,
        max_acceleration,
        min_acceleration,
    })
}

pub fn decode_payload_now(payload: &[u8]) -> Result<RepetitionRecord, PayloadError> {
    decode_payload(payload, &Local::now())
}

/// Inverse of [`parse_fields`], the format the unit sends.
pub fn encode_fields(record: &RepetitionRecord) -> Vec<u8> {
    format!(
        "{} {} {} {}",
        record.max_velocity, record.min_velocity, record.max_acceleration, record.min_acceleration,
    ).into_bytes()
}
