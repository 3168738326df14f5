//! Offline reassembler.
//!
//! Rebuilds the merged binary record from a directory of per-sensor logs:
//! radiometer binaries are re-split with the frame parser, GPS CSV rows
//! become synthesized `$GPRMC` sentences, and GPS + indexing-table rows are
//! merged on time into `UMTWR` telemetry frames. Output is windowed by UTC
//! day or hour; every file opens with the 25-slot `SATHDR` block and its
//! body is globally timestamp-sorted.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::angle::wrap360;
use crate::calibration::Calibration;
use crate::declination::declination;
use crate::error::{Result, SasError};
use crate::logger::fmt_f;
use crate::parser::SatParser;
use crate::protocol::{pack7, sathdr_block};

/// GPS indices propagate to at most this many following merged rows.
const GPS_FFILL_LIMIT: usize = 15;
/// Stall flags propagate forward/backward over short CSV gaps.
const STALL_FFILL_LIMIT: usize = 20;
const STALL_BFILL_LIMIT: usize = 3;
/// Sun position is recomputed at most once per bucket; it moves slowly
/// compared to the sampling rate.
const SUN_BUCKET_SECONDS: i64 = 30;

/// Output grouping window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Day,
    Hour,
}

impl FromStr for Window {
    type Err = SasError;

    fn from_str(s: &str) -> Result<Window> {
        match s {
            "day" | "daily" => Ok(Window::Day),
            "hour" | "hourly" => Ok(Window::Hour),
            other => Err(SasError::Config(format!(
                "writing mode {other:?} not supported"
            ))),
        }
    }
}

/// One frame with its wall-clock instant, ready for the merged record.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub timestamp: DateTime<Utc>,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GpsRow {
    pub datetime: DateTime<Utc>,
    pub gps_datetime: DateTime<Utc>,
    pub datetime_valid: bool,
    pub heading: f64,
    pub heading_accuracy: f64,
    pub heading_valid: bool,
    pub heading_motion: f64,
    pub heading_vehicle_accuracy: f64,
    pub speed: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub fix_ok: bool,
}

#[derive(Debug, Clone)]
pub struct TwrRow {
    pub datetime: DateTime<Utc>,
    pub position: f64,
    pub stall_flag: bool,
}

/// The subset of the deployment configuration the reassembler needs; the
/// full configuration file parses into it, unknown sections ignored.
#[derive(Debug, Clone, Deserialize, Default)]
struct PrepConfig {
    #[serde(rename = "AutoPilot", default)]
    auto_pilot: PrepAutoPilot,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct PrepAutoPilot {
    gps_orientation_on_ship: f64,
    indexing_table_orientation_on_ship: f64,
    optimal_angle_away_from_sun: f64,
}

impl Default for PrepAutoPilot {
    fn default() -> Self {
        Self {
            gps_orientation_on_ship: 0.0,
            indexing_table_orientation_on_ship: 0.0,
            optimal_angle_away_from_sun: 135.0,
        }
    }
}

pub struct Converter {
    parser: SatParser,
    compass_zero: f64,
    tower_zero: f64,
    target: f64,
}

impl Converter {
    pub fn new(cal_path: &Path, cfg_path: &Path) -> Result<Converter> {
        let cal = Calibration::load(cal_path, false)?;
        let text = fs::read_to_string(cfg_path)
            .map_err(|e| SasError::Config(format!("configuration file: {e}")))?;
        let cfg: PrepConfig = toml::from_str(&text)
            .map_err(|e| SasError::Config(format!("unable to parse configuration: {e}")))?;
        Ok(Self::from_calibration(cal, &cfg))
    }

    fn from_calibration(cal: Calibration, cfg: &PrepConfig) -> Converter {
        Converter {
            parser: SatParser::new(&cal),
            compass_zero: cfg.auto_pilot.gps_orientation_on_ship,
            tower_zero: cfg.auto_pilot.indexing_table_orientation_on_ship,
            target: cfg.auto_pilot.optimal_angle_away_from_sun,
        }
    }

    /// Re-split radiometer binaries; frames without a plausible trailing
    /// time tag are dropped.
    pub fn read_sat(&self, paths: &[PathBuf]) -> Vec<TimedFrame> {
        let mut frames = Vec::new();
        for path in paths {
            let raw = match fs::read(path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("{}: {e}", path.display());
                    continue;
                }
            };
            if raw.is_empty() {
                warn!("{}: empty file", path.display());
                continue;
            }
            let mut found = 0;
            for frame in self.parser.split(&raw) {
                if let Some(timestamp) = frame.timestamp {
                    frames.push(TimedFrame {
                        timestamp,
                        frame: frame.frame,
                    });
                    found += 1;
                }
            }
            if found == 0 {
                warn!("{}: no frames found", path.display());
            }
        }
        if frames.is_empty() {
            warn!("no valid radiometer data");
        }
        frames
    }

    /// Read the GPS CSV streams, units row skipped.
    pub fn read_gps(paths: &[PathBuf]) -> Vec<GpsRow> {
        let mut rows = Vec::new();
        for path in paths {
            match read_csv_records(path) {
                Ok((headers, records)) => {
                    for record in records {
                        let get = |name: &str| field(&headers, &record, name);
                        let (Some(datetime), Some(gps_datetime)) = (
                            get("datetime").and_then(parse_datetime),
                            get("gps_datetime").and_then(parse_datetime),
                        ) else {
                            continue;
                        };
                        rows.push(GpsRow {
                            datetime,
                            gps_datetime,
                            datetime_valid: parse_bool(get("datetime_valid")),
                            heading: parse_f64(get("heading")),
                            heading_accuracy: parse_f64(get("heading_accuracy")),
                            heading_valid: parse_bool(get("heading_valid")),
                            heading_motion: parse_f64(get("heading_motion")),
                            heading_vehicle_accuracy: parse_f64(get("heading_vehicle_accuracy")),
                            speed: parse_f64(get("speed")),
                            latitude: parse_f64(get("latitude")),
                            longitude: parse_f64(get("longitude")),
                            altitude: parse_f64(get("altitude")),
                            fix_ok: parse_bool(get("fix_ok")),
                        });
                    }
                }
                Err(e) => warn!("invalid GPS file {}: {e}", path.display()),
            }
        }
        if rows.is_empty() {
            warn!("no valid GPS data");
        }
        rows
    }

    /// Read the indexing-table CSV streams. The stall flag is carried over
    /// nearby rows that only logged a position or only logged a flag.
    pub fn read_twr(paths: &[PathBuf]) -> Vec<TwrRow> {
        struct RawRow {
            datetime: DateTime<Utc>,
            position: f64,
            stall: Option<bool>,
        }
        let mut raw_rows = Vec::new();
        for path in paths {
            match read_csv_records(path) {
                Ok((headers, records)) => {
                    for record in records {
                        let get = |name: &str| field(&headers, &record, name);
                        let Some(datetime) = get("datetime").and_then(parse_datetime) else {
                            continue;
                        };
                        raw_rows.push(RawRow {
                            datetime,
                            position: parse_f64(get("position")),
                            stall: get("stall_flag").and_then(parse_bool_opt),
                        });
                    }
                }
                Err(e) => warn!("invalid indexing table file {}: {e}", path.display()),
            }
        }
        // Forward fill, then a short backward fill for the leading rows.
        let mut filled: Vec<Option<bool>> = raw_rows.iter().map(|r| r.stall).collect();
        let mut last: Option<(usize, bool)> = None;
        for (i, slot) in filled.iter_mut().enumerate() {
            match *slot {
                Some(v) => last = Some((i, v)),
                None => {
                    if let Some((at, v)) = last {
                        if i - at <= STALL_FFILL_LIMIT {
                            *slot = Some(v);
                        }
                    }
                }
            }
        }
        let mut next: Option<(usize, bool)> = None;
        for i in (0..filled.len()).rev() {
            match filled[i] {
                Some(v) => next = Some((i, v)),
                None => {
                    if let Some((at, v)) = next {
                        if at - i <= STALL_BFILL_LIMIT {
                            filled[i] = Some(v);
                        }
                    }
                }
            }
        }
        let rows: Vec<TwrRow> = raw_rows
            .into_iter()
            .zip(filled)
            .filter_map(|(row, stall)| {
                let stall = stall?;
                if row.position.is_nan() {
                    return None;
                }
                Some(TwrRow {
                    datetime: row.datetime,
                    position: row.position,
                    stall_flag: stall,
                })
            })
            .collect();
        if rows.is_empty() {
            warn!("no valid indexing table data");
        }
        rows
    }

    /// Synthesize `$GPRMC` sentences, one per GPS row.
    ///
    /// The magnetic variation field is populated from the declination
    /// model; computing it per row is slow, so by default the first row's
    /// value is reused for the whole batch.
    pub fn make_gprmc(gps: &[GpsRow], per_row_declination: bool) -> Vec<TimedFrame> {
        debug!("making $GPRMC frames ...");
        let first_declination = gps
            .first()
            .map(|row| declination(row.latitude, row.longitude, row.altitude, row.gps_datetime));
        gps.iter()
            .map(|row| {
                let mag_var = if per_row_declination {
                    declination(row.latitude, row.longitude, row.altitude, row.gps_datetime)
                } else {
                    first_declination.unwrap_or(f64::NAN)
                };
                TimedFrame {
                    timestamp: row.datetime,
                    frame: gprmc_sentence(row, mag_var).into_bytes(),
                }
            })
            .collect()
    }

    /// Merge GPS and indexing-table rows on time and synthesize one
    /// `UMTWR` frame per merged row.
    pub fn make_umtwr(&self, gps: &[GpsRow], twr: &[TwrRow]) -> Vec<TimedFrame> {
        debug!("making UMTWR frames ...");
        // Interleave both sources by time.
        enum Source {
            Gps(usize),
            Twr(usize),
        }
        let mut events: Vec<(DateTime<Utc>, Source)> = gps
            .iter()
            .enumerate()
            .map(|(i, r)| (r.datetime, Source::Gps(i)))
            .chain(
                twr.iter()
                    .enumerate()
                    .map(|(i, r)| (r.datetime, Source::Twr(i))),
            )
            .collect();
        events.sort_by_key(|(ts, _)| *ts);

        // Sun position down-sampled to coarse buckets.
        let mut sun_by_row: Vec<Option<(f64, f64)>> = vec![None; gps.len()];
        let mut bucket_value: Option<(i64, (f64, f64))> = None;
        for (i, row) in gps.iter().enumerate() {
            if !(row.fix_ok && row.datetime_valid) {
                continue;
            }
            let bucket = row.gps_datetime.timestamp() / SUN_BUCKET_SECONDS;
            let value = match bucket_value {
                Some((b, v)) if b == bucket => v,
                _ => {
                    let v = crate::solar::sun_position(
                        row.latitude,
                        row.longitude,
                        row.gps_datetime,
                    );
                    bucket_value = Some((bucket, v));
                    v
                }
            };
            sun_by_row[i] = Some(value);
        }

        let mut frames = Vec::new();
        let mut gps_index: Option<(usize, usize)> = None; // (row, age in merged rows)
        let mut twr_index: Option<usize> = None;
        let mut sun_carry: Option<(f64, f64)> = None;
        for (timestamp, source) in events {
            match source {
                Source::Gps(i) => {
                    gps_index = Some((i, 0));
                    if let Some(sun) = sun_by_row[i] {
                        sun_carry = Some(sun);
                    }
                }
                Source::Twr(i) => {
                    twr_index = Some(i);
                    if let Some((_, age)) = gps_index.as_mut() {
                        *age += 1;
                    }
                }
            }
            let Some((gi, age)) = gps_index else { continue };
            if age > GPS_FFILL_LIMIT {
                continue;
            }
            let Some(ti) = twr_index else { continue };
            let g = &gps[gi];
            let t = &twr[ti];

            let (azimuth, elevation) = if g.fix_ok && g.datetime_valid {
                match sun_carry {
                    Some((el, az)) => (format!("{az:05.1}"), format!("{el:04.1}")),
                    None => ("nan".into(), "nan".into()),
                }
            } else {
                ("nan".into(), "nan".into())
            };
            let heading_ship = wrap360(g.heading - self.compass_zero);
            let heading_sas = wrap360(heading_ship - self.tower_zero + t.position);
            let status = if t.stall_flag { 'S' } else { 'O' };
            let frame = format!(
                "UMTWR,{},{},{},{},{},{},{status},{azimuth},{elevation}\r\n",
                fmt_f(heading_sas, 2),
                fmt_f(heading_ship, 2),
                fmt_f(g.heading_accuracy, 2),
                fmt_f(g.heading_motion, 1),
                fmt_f(g.heading_vehicle_accuracy, 1),
                fmt_f(t.position, 2),
            );
            frames.push(TimedFrame {
                timestamp,
                frame: frame.into_bytes(),
            });
        }
        frames
    }

    /// Write one output file: `SATHDR` block then timestamped frames.
    pub fn write(
        &self,
        frames: &[TimedFrame],
        path: &Path,
        extra_header: &[(&str, Vec<u8>)],
    ) -> Result<()> {
        let mut header: Vec<(&str, Vec<u8>)> = vec![
            ("ZONE", b"UTC".to_vec()),
            (
                "COMMENT",
                format!(
                    "gps_orientation_on_ship={};indexing_table_orientation_on_ship={};optimal_angle_away_from_sun={};",
                    self.compass_zero, self.tower_zero, self.target
                )
                .into_bytes(),
            ),
        ];
        if let Some(first) = frames.iter().map(|f| f.timestamp).min() {
            header.push((
                "TIME-STAMP",
                first.format("%a %b %d %H:%M:%S %Y").to_string().into_bytes(),
            ));
        }
        header.extend(extra_header.iter().cloned());

        debug!("writing {}", path.display());
        let mut body = sathdr_block(&header);
        for frame in frames {
            body.extend_from_slice(&frame.frame);
            body.extend_from_slice(&pack7(frame.timestamp));
        }
        fs::write(path, body)?;
        Ok(())
    }

    /// Full conversion of one input directory.
    pub fn run(
        &self,
        path_in: &Path,
        path_out: &Path,
        file_out_prefix: &str,
        mode: Window,
        per_row_declination: bool,
    ) -> Result<()> {
        let sat_files = files_matching(path_in, "HyperSAS_", ".bin")?;
        let gps_files = files_matching(path_in, "GPS_", ".csv")?;
        let twr_files = files_matching(path_in, "IndexingTable_", ".csv")?;

        let sat = self.read_sat(&sat_files);
        let gps = Self::read_gps(&gps_files);
        let twr = Self::read_twr(&twr_files);
        if sat.is_empty() && gps.is_empty() {
            return Err(SasError::InvalidFrame("no input data".into()));
        }

        let mut frames = sat;
        frames.extend(Self::make_gprmc(&gps, per_row_declination));
        frames.extend(self.make_umtwr(&gps, &twr));
        frames.sort_by_key(|f| f.timestamp);

        let Some(first) = frames.first().map(|f| f.timestamp) else {
            return Err(SasError::InvalidFrame("no frames to write".into()));
        };
        let last = frames.last().map(|f| f.timestamp).unwrap() + Duration::seconds(1);
        let (mut window_start, step) = match mode {
            Window::Day => (
                Utc.with_ymd_and_hms(first.year(), first.month(), first.day(), 0, 0, 0)
                    .unwrap(),
                Duration::days(1),
            ),
            Window::Hour => (
                Utc.with_ymd_and_hms(
                    first.year(),
                    first.month(),
                    first.day(),
                    first.hour(),
                    0,
                    0,
                )
                .unwrap(),
                Duration::hours(1),
            ),
        };

        fs::create_dir_all(path_out)?;
        while window_start < last {
            let window_end = window_start + step;
            let in_window =
                |ts: DateTime<Utc>| window_start <= ts && ts < window_end;

            let gps_sel: Vec<&GpsRow> =
                gps.iter().filter(|r| in_window(r.datetime)).collect();
            let frame_sel: Vec<TimedFrame> = frames
                .iter()
                .filter(|f| in_window(f.timestamp))
                .cloned()
                .collect();
            if frame_sel.is_empty() {
                window_start = window_end;
                continue;
            }
            if gps_sel.is_empty() {
                warn!(
                    "no GPS rows for window starting {window_start}, group skipped"
                );
                window_start = window_end;
                continue;
            }

            let mut extra: Vec<(&str, Vec<u8>)> = Vec::new();
            let bound = |f: fn(f64, f64) -> f64, pick: fn(&GpsRow) -> f64| {
                gps_sel
                    .iter()
                    .map(|r| pick(r))
                    .filter(|v| !v.is_nan())
                    .fold(f64::NAN, f)
            };
            let (lat_min, lat_max) = (
                bound(f64::min, |r| r.latitude),
                bound(f64::max, |r| r.latitude),
            );
            let (lon_min, lon_max) = (
                bound(f64::min, |r| r.longitude),
                bound(f64::max, |r| r.longitude),
            );
            if !lat_min.is_nan() {
                extra.push(("LATITUDE", format!("{lat_min}:{lat_max}").into_bytes()));
                extra.push(("LONGITUDE", format!("{lon_min}:{lon_max}").into_bytes()));
            }

            let stamp = match mode {
                Window::Day => window_start.format("%Y%m%d"),
                Window::Hour => window_start.format("%Y%m%d_%H%M%S"),
            };
            let out = path_out.join(format!("{file_out_prefix}{stamp}.raw"));
            self.write(&frame_sel, &out, &extra)?;
            info!("wrote {}", out.display());
            window_start = window_end;
        }
        Ok(())
    }
}

/// `$GPRMC,hhmmss,A,DDMM.mmmm,N,DDDMM.mmmm,W,sss.s,ccc.c,ddmmyy,mmm.m,E*hh`
fn gprmc_sentence(row: &GpsRow, mag_var: f64) -> String {
    let hhmmss = row.gps_datetime.format("%H%M%S");
    let valid = if row.datetime_valid && row.fix_ok {
        'A'
    } else {
        'V'
    };
    let lat_abs = row.latitude.abs();
    let (lat_deg, lat_min) = (lat_abs.floor(), (lat_abs - lat_abs.floor()) * 60.0);
    let lat_hemi = if row.latitude < 0.0 { 'S' } else { 'N' };
    let lon_abs = row.longitude.abs();
    let (lon_deg, lon_min) = (lon_abs.floor(), (lon_abs - lon_abs.floor()) * 60.0);
    let lon_hemi = if row.longitude < 0.0 { 'W' } else { 'E' };
    let speed_knots = row.speed * 1.94384;
    let ddmmyy = row.gps_datetime.format("%d%m%y");
    let mag_hemi = if mag_var < 0.0 { 'W' } else { 'E' };
    let sentence = format!(
        "$GPRMC,{hhmmss},{valid},{lat_deg:02.0}{lat_min:07.4},{lat_hemi},{lon_deg:03.0}{lon_min:07.4},{lon_hemi},{speed_knots:05.1},{:05.1},{ddmmyy},{:05.1},{mag_hemi}",
        row.heading_motion,
        mag_var.abs(),
    );
    let checksum = nmea_checksum(&sentence);
    format!("{sentence}*{checksum:02x}\r\n")
}

/// XOR over the bytes strictly between `$` and `*`.
pub fn nmea_checksum(sentence: &str) -> u8 {
    sentence
        .bytes()
        .skip(1)
        .take_while(|&b| b != b'*')
        .fold(0, |acc, b| acc ^ b)
}

fn files_matching(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(suffix))
        })
        .collect();
    files.sort();
    Ok(files)
}

type CsvData = (Vec<String>, Vec<csv::StringRecord>);

/// Read a rotating-log CSV: header row, units row (skipped), data rows.
fn read_csv_records(path: &Path) -> Result<CsvData> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| SasError::InvalidFrame(format!("{e}")))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| SasError::InvalidFrame(format!("{e}")))?
        .iter()
        .map(str::to_string)
        .collect();
    let records: Vec<csv::StringRecord> = reader
        .records()
        .filter_map(|r| r.ok())
        .skip(1) // units row
        .collect();
    Ok((headers, records))
}

fn field<'a>(
    headers: &[String],
    record: &'a csv::StringRecord,
    name: &str,
) -> Option<&'a str> {
    let idx = headers.iter().position(|h| h == name)?;
    record.get(idx)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y/%m/%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc())
}

fn parse_f64(s: Option<&str>) -> f64 {
    s.and_then(|s| s.parse().ok()).unwrap_or(f64::NAN)
}

fn parse_bool(s: Option<&str>) -> bool {
    parse_bool_opt(s.unwrap_or("")).unwrap_or(false)
}

fn parse_bool_opt(s: &str) -> Option<bool> {
    match s {
        "true" | "True" | "1" => Some(true),
        "false" | "False" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::test_support::{radiance_frame, test_calibration};
    use crate::protocol::SATHDR_SLOT_LEN;

    fn converter() -> Converter {
        Converter::from_calibration(test_calibration(), &PrepConfig::default())
    }

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 11, h, m, s).unwrap()
    }

    fn gps_row(t: DateTime<Utc>, heading: f64) -> GpsRow {
        GpsRow {
            datetime: t,
            gps_datetime: t,
            datetime_valid: true,
            heading,
            heading_accuracy: 0.5,
            heading_valid: true,
            heading_motion: 12.0,
            heading_vehicle_accuracy: 1.5,
            speed: 2.5,
            latitude: 44.9,
            longitude: -68.7,
            altitude: 0.0,
            fix_ok: true,
        }
    }

    #[test]
    fn gprmc_layout_and_checksum() {
        let frames = Converter::make_gprmc(&[gps_row(ts(16, 23, 11), 10.0)], true);
        assert_eq!(frames.len(), 1);
        let text = String::from_utf8(frames[0].frame.clone()).unwrap();
        assert!(text.starts_with("$GPRMC,162311,A,4454.0000,N,06842.0000,W,004.9,012.0,110624,"));
        assert!(text.ends_with("\r\n"));
        // Validate the checksum.
        let (body, tail) = text.trim_end().split_once('*').unwrap();
        let expected = u8::from_str_radix(tail, 16).unwrap();
        assert_eq!(nmea_checksum(body), expected);
    }

    #[test]
    fn gprmc_invalid_fix_is_void() {
        let mut row = gps_row(ts(6, 0, 0), 10.0);
        row.fix_ok = false;
        let frames = Converter::make_gprmc(&[row], false);
        let text = String::from_utf8(frames[0].frame.clone()).unwrap();
        assert!(text.contains(",V,"));
    }

    #[test]
    fn umtwr_merges_gps_and_tower() {
        let conv = converter();
        let gps = vec![gps_row(ts(16, 0, 0), 10.0), gps_row(ts(16, 0, 10), 20.0)];
        let twr = vec![
            TwrRow {
                datetime: ts(16, 0, 5),
                position: 89.51,
                stall_flag: false,
            },
            TwrRow {
                datetime: ts(16, 0, 15),
                position: 90.0,
                stall_flag: true,
            },
        ];
        let frames = conv.make_umtwr(&gps, &twr);
        // The first GPS row has no tower yet; every later merged row emits.
        assert_eq!(frames.len(), 3);
        let first = String::from_utf8(frames[0].frame.clone()).unwrap();
        // heading_ship = 10, heading_sas = 10 + 89.51
        assert!(first.starts_with("UMTWR,99.51,10.00,0.50,12.0,1.5,89.51,O,"), "{first}");
        let last = String::from_utf8(frames[2].frame.clone()).unwrap();
        assert!(last.contains(",S,"), "{last}");
        // Sun position present for a valid daytime fix.
        assert!(!first.contains(",nan,nan\r\n"), "{first}");
    }

    #[test]
    fn umtwr_ffill_limit_expires_gps() {
        let conv = converter();
        let gps = vec![gps_row(ts(16, 0, 0), 10.0)];
        let twr: Vec<TwrRow> = (0..GPS_FFILL_LIMIT + 5)
            .map(|i| TwrRow {
                datetime: ts(16, 0, 1) + Duration::seconds(i as i64),
                position: 0.0,
                stall_flag: false,
            })
            .collect();
        let frames = conv.make_umtwr(&gps, &twr);
        // The GPS index only carries over the first 15 tower rows.
        assert_eq!(frames.len(), GPS_FFILL_LIMIT);
    }

    #[test]
    fn twr_stall_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IndexingTable_20240611_000000.csv");
        let mut text = String::from(
            "datetime, position, stall_flag, type\r\nyyyy/mm/dd HH:MM:SS.fff, degrees, 1:stalled | 0:ok, get|set|reset\r\n",
        );
        // A flag-only row, then position-only rows relying on the fill.
        text.push_str("2024/06/11 16:00:00.000, nan, false, get\r\n");
        text.push_str("2024/06/11 16:00:05.000, 45.00, nan, set\r\n");
        text.push_str("2024/06/11 16:00:10.000, 46.00, true, get\r\n");
        std::fs::write(&path, text).unwrap();
        let rows = Converter::read_twr(&[path]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].position, 45.0);
        assert!(!rows[0].stall_flag);
        assert!(rows[1].stall_flag);
    }

    #[test]
    fn hourly_reassembly_end_to_end() {
        let conv = converter();
        let in_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();

        // Radiometer binary covering two hours.
        let mut sat = Vec::new();
        for (h, counts) in [(16u32, [100u16, 200, 300]), (17, [110, 210, 310])] {
            sat.extend_from_slice(&radiance_frame(b"SATHSL0234", 500, counts));
            sat.extend_from_slice(&pack7(ts(h, 30, 0)));
        }
        std::fs::write(in_dir.path().join("HyperSAS_20240611_160000.bin"), &sat).unwrap();

        // GPS CSV with rows in both hours.
        let mut gps_text = String::from("datetime, gps_datetime, datetime_accuracy, datetime_valid, heading, heading_accuracy, heading_valid, heading_motion, heading_vehicle, heading_vehicle_accuracy, heading_vehicle_valid, speed, speed_accuracy, latitude, longitude, horizontal_accuracy, altitude, altitude_accuracy, fix_ok, fix_type, last_packet\r\n");
        gps_text.push_str("units, u, u, u, u, u, u, u, u, u, u, u, u, u, u, u, u, u, u, u, u\r\n");
        for (h, m) in [(16u32, 10u32), (16, 40), (17, 10), (17, 40)] {
            gps_text.push_str(&format!(
                "2024/06/11 {h}:{m:02}:00.000, 2024/06/11 {h}:{m:02}:00.000000, 25, true, 10.00000, 0.50000, true, 12.00000, 13.00000, 1.50000, true, 2.500, 0.100, 44.9000000, -68.7000000, 1.200, 0.000, 2.400, true, 3, PVT\r\n"
            ));
        }
        std::fs::write(in_dir.path().join("GPS_20240611_160000.csv"), gps_text).unwrap();

        // Tower CSV rows near the GPS rows.
        let mut twr_text = String::from("datetime, position, stall_flag, type\r\n");
        twr_text.push_str("yyyy/mm/dd HH:MM:SS.fff, degrees, 1:stalled | 0:ok, get|set|reset\r\n");
        for (h, m) in [(16u32, 11u32), (16, 41), (17, 11), (17, 41)] {
            twr_text.push_str(&format!(
                "2024/06/11 {h}:{m:02}:00.000, 89.51, false, get\r\n"
            ));
        }
        std::fs::write(
            in_dir.path().join("IndexingTable_20240611_160000.csv"),
            twr_text,
        )
        .unwrap();

        conv.run(in_dir.path(), out_dir.path(), "TEST_", Window::Hour, false)
            .unwrap();

        let mut outputs: Vec<_> = std::fs::read_dir(out_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        outputs.sort();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].ends_with("TEST_20240611_160000.raw"));
        assert!(outputs[1].ends_with("TEST_20240611_170000.raw"));

        // Re-split with the synthesized headers included, the way a
        // downstream consumer of the merged record would.
        let mut headers = test_calibration().headers();
        headers.push(b"$GPRMC".to_vec());
        headers.push(b"UMTWR".to_vec());
        let full_parser = crate::parser::SatParser::from_headers(headers);

        for path in &outputs {
            let raw = std::fs::read(path).unwrap();
            // Valid 25-slot header.
            assert!(raw.len() > 25 * SATHDR_SLOT_LEN);
            for slot in raw[..25 * SATHDR_SLOT_LEN].chunks(SATHDR_SLOT_LEN) {
                assert!(slot.starts_with(b"SATHDR "));
            }
            // Body frames globally timestamp-sorted.
            let body = &raw[25 * SATHDR_SLOT_LEN..];
            let frames = full_parser.split(body);
            assert!(frames.len() >= 5, "{} frames", frames.len());
            let stamps: Vec<_> = frames.iter().filter_map(|f| f.timestamp).collect();
            assert_eq!(stamps.len(), frames.len());
            let mut sorted = stamps.clone();
            sorted.sort();
            assert_eq!(stamps, sorted);
            // GPRMC checksums validate.
            let text = String::from_utf8_lossy(body);
            let mut checked = 0;
            for line in text.split("\r\n") {
                if let Some(at) = line.find("$GPRMC") {
                    let sentence = &line[at..];
                    if let Some((payload, tail)) = sentence.split_once('*') {
                        let declared =
                            u8::from_str_radix(&tail[..2], 16).expect("hex checksum");
                        assert_eq!(nmea_checksum(payload), declared);
                        checked += 1;
                    }
                }
            }
            assert!(checked >= 2, "checked {checked} GPRMC sentences");
            assert!(text.contains("UMTWR,"));
        }
    }

    #[test]
    fn empty_inputs_are_skipped_not_fatal() {
        let conv = converter();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HyperSAS_empty.bin"), b"").unwrap();
        let frames = conv.read_sat(&[dir.path().join("HyperSAS_empty.bin")]);
        assert!(frames.is_empty());
        let rows = Converter::read_gps(&[dir.path().join("GPS_missing.csv")]);
        assert!(rows.is_empty());
    }
}
