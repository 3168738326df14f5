//! Satlantic wire-format helpers.
//!
//! Frames written to disk carry their raw instrument payload followed by a
//! 7-byte timestamp: the `u32` big-endian day tag `YYYYDDD` with its leading
//! zero byte dropped, then the `u32` big-endian time tag `HHMMSSmmm`.
//! Merged output files open with a block of 25 fixed 128-byte `SATHDR`
//! slots.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use tracing::warn;

/// Marker of file-header slots; frames with this header carry no data.
pub const SATHDR: &[u8] = b"SATHDR";

/// Slot width of a `SATHDR` header sentence.
pub const SATHDR_SLOT_LEN: usize = 128;

/// Keys of the 25 header slots, in on-disk order.
pub const SATHDR_KEYS: [&str; 25] = [
    "CRUISE-ID",
    "OPERATOR",
    "INVESTIGATOR",
    "AFFILIATION",
    "CONTACT",
    "EXPERIMENT",
    "LATITUDE",
    "LONGITUDE",
    "ZONE",
    "CLOUD_PERCENT",
    "WAVE_HEIGHT",
    "WIND_SPEED",
    "COMMENT",
    "DOCUMENT",
    "STATION-ID",
    "CAST",
    "TIME-STAMP",
    "MODE",
    "TIMETAG",
    "DATETAG",
    "TIMETAG2",
    "PROFILER",
    "REFERENCE",
    "PRO-DARK",
    "REF-DARK",
];

/// Earliest timestamp accepted when decoding trailing time tags.
pub fn plausible_after() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

/// Serialize a timestamp into the 7-byte trailing time tag.
pub fn pack7(ts: DateTime<Utc>) -> [u8; 7] {
    let day_tag = ts.year() as u32 * 1000 + ts.ordinal();
    let time_tag = ts.hour() * 10_000_000
        + ts.minute() * 100_000
        + ts.second() * 1000
        + ts.timestamp_subsec_millis();
    let d = day_tag.to_be_bytes();
    let t = time_tag.to_be_bytes();
    [d[1], d[2], d[3], t[0], t[1], t[2], t[3]]
}

/// Decode a 7-byte trailing time tag.
///
/// Prepends a zero byte and reads two big-endian `u32` fields `(YYYYDDD,
/// HHMMSSmmm)`. Returns `None` when the fields do not form a valid instant
/// or the instant falls outside the plausibility window `[2020-01-01, now]`.
pub fn unpack7(bytes: &[u8]) -> Option<DateTime<Utc>> {
    if bytes.len() != 7 {
        return None;
    }
    let day_tag = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    let time_tag = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    let (year, ordinal) = (day_tag / 1000, day_tag % 1000);
    let millis = time_tag % 1000;
    let second = (time_tag / 1000) % 100;
    let minute = (time_tag / 100_000) % 100;
    let hour = time_tag / 10_000_000;
    let date = NaiveDate::from_yo_opt(year as i32, ordinal)?;
    let ts = date.and_hms_milli_opt(hour, minute, second, millis)?.and_utc();
    if ts < plausible_after() || ts > Utc::now() {
        return None;
    }
    Some(ts)
}

/// Build one 128-byte `SATHDR <value> (<key>)\r\n` slot, NUL padded.
///
/// Oversize sentences are truncated to the slot width with a warning; the
/// block layout never shifts.
fn sathdr_slot(key: &str, value: &[u8]) -> Vec<u8> {
    let mut sentence = Vec::with_capacity(SATHDR_SLOT_LEN);
    sentence.extend_from_slice(SATHDR);
    sentence.push(b' ');
    sentence.extend_from_slice(value);
    sentence.extend_from_slice(b" (");
    sentence.extend_from_slice(key.as_bytes());
    sentence.extend_from_slice(b")\r\n");
    if sentence.len() > SATHDR_SLOT_LEN {
        warn!("SATHDR {key} too long");
        sentence.truncate(SATHDR_SLOT_LEN);
    }
    sentence.resize(SATHDR_SLOT_LEN, 0);
    sentence
}

/// Build the 25-slot file header block from `(key, value)` pairs.
///
/// Keys absent from `values` produce empty slots; keys are matched against
/// [`SATHDR_KEYS`], unknown keys are ignored.
pub fn sathdr_block(values: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut block = Vec::with_capacity(SATHDR_KEYS.len() * SATHDR_SLOT_LEN);
    for key in SATHDR_KEYS {
        let value = values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(b"");
        block.extend_from_slice(&sathdr_slot(key, value));
    }
    block
}
