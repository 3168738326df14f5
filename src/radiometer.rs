//! Radiometer reader.
//!
//! Owns the instrument port, splits the byte stream into frames with the
//! calibration-derived header set, writes every frame raw to the merged
//! binary log and files it into a per-channel latest-value slot. Parsing is
//! lazy: [`Radiometer::parse_latest`] decodes only the channels that
//! received a new raw frame since they were last parsed, subtracting the
//! matching dark frame from the bright optical channels when both are
//! present.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tracing::{debug, error, info};

use crate::calibration::{Calibration, Channel};
use crate::clock::{monotonic, sleep_cancellable};
use crate::error::{Result, SasError};
use crate::logger::SatLogger;
use crate::parser::{FrameScan, SatParser};
use crate::registry::SharedPort;
use crate::relay::Relay;

/// Receive buffer cap; prevents unbounded growth if no header matches.
pub const MAX_BUFFER: usize = 16384;

/// Distinct decode offenders reported before bulk suppression.
const MAX_REPORTED_OFFENDERS: usize = 100;

#[derive(Debug, Clone)]
struct ChannelSlot {
    raw: Option<Bytes>,
    received: f64,
    parsed_at: f64,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        Self {
            raw: None,
            received: f64::NAN,
            parsed_at: f64::NAN,
        }
    }
}

/// Parsed latest values of the radiometer stack.
#[derive(Debug, Clone)]
pub struct RadiometerSnapshot {
    /// Spectral vectors, dark-corrected when the dark frame is known.
    pub lt: Option<Vec<f64>>,
    pub lt_dark: Option<Vec<f64>>,
    pub li: Option<Vec<f64>>,
    pub li_dark: Option<Vec<f64>>,
    pub es: Option<Vec<f64>>,
    pub es_dark: Option<Vec<f64>>,
    pub roll: f64,
    pub pitch: f64,
    /// Compass heading as measured.
    pub compass: f64,
    /// Compass heading corrected for magnetic declination (set by the
    /// supervisor when it knows the position).
    pub compass_adj: f64,
    /// Monotonic stamps of the tilt sensor channel.
    pub ths_received: f64,
    pub ths_parsed: f64,
}

impl Default for RadiometerSnapshot {
    fn default() -> Self {
        Self {
            lt: None,
            lt_dark: None,
            li: None,
            li_dark: None,
            es: None,
            es_dark: None,
            roll: f64::NAN,
            pitch: f64::NAN,
            compass: f64::NAN,
            compass_adj: f64::NAN,
            ths_received: f64::NAN,
            ths_parsed: f64::NAN,
        }
    }
}

#[derive(Default)]
struct SlotTable {
    slots: HashMap<Channel, ChannelSlot>,
    parsed: RadiometerSnapshot,
    decode_errors: u64,
    offenders: HashSet<Channel>,
}

impl SlotTable {
    fn reset(&mut self) {
        self.slots.clear();
        self.parsed = RadiometerSnapshot::default();
    }

    fn file(&mut self, channel: Channel, frame: Bytes, ts: f64) {
        let slot = self.slots.entry(channel).or_default();
        slot.raw = Some(frame);
        slot.received = ts;
        if channel == Channel::Ths {
            self.parsed.ths_received = ts;
        }
    }

    fn pending(&self, channel: Channel) -> Option<Bytes> {
        let slot = self.slots.get(&channel)?;
        let fresh = slot.received > slot.parsed_at
            || (slot.parsed_at.is_nan() && !slot.received.is_nan());
        if fresh {
            slot.raw.clone()
        } else {
            None
        }
    }

    fn mark_parsed(&mut self, channel: Channel) {
        if let Some(slot) = self.slots.get_mut(&channel) {
            slot.parsed_at = monotonic();
        }
        if channel == Channel::Ths {
            self.parsed.ths_parsed = monotonic();
        }
    }

    /// A frame that matched its header but failed to decode is dropped and
    /// not retried.
    fn mark_failed(&mut self, channel: Channel, err: &SasError) {
        self.decode_errors += 1;
        if self.offenders.len() < MAX_REPORTED_OFFENDERS {
            if self.offenders.insert(channel) {
                error!("{}: {err}", channel.as_str());
            }
        }
        if let Some(slot) = self.slots.get_mut(&channel) {
            slot.received = f64::NAN;
            slot.raw = None;
        }
    }
}

/// The radiometer assembly behind one serial port.
pub struct Radiometer {
    port: SharedPort,
    relay: Relay,
    logger: Arc<SatLogger>,
    cal: Option<Calibration>,
    parser: Option<SatParser>,
    dispatcher: Arc<HashMap<Vec<u8>, Channel>>,
    shared: Arc<Mutex<SlotTable>>,
    alive: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Radiometer {
    pub fn new(port: SharedPort, relay: Relay, logger: Arc<SatLogger>) -> Radiometer {
        Radiometer {
            port,
            relay,
            logger,
            cal: None,
            parser: None,
            dispatcher: Arc::new(HashMap::new()),
            shared: Arc::new(Mutex::new(SlotTable::default())),
            alive: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.cal.as_ref()
    }

    /// Wavelength labels of a bright channel under the loaded calibration.
    pub fn wavelengths(&self, channel: Channel) -> Option<Vec<f64>> {
        self.cal
            .as_ref()
            .and_then(|c| c.wavelengths(channel).map(<[f64]>::to_vec))
    }

    /// Install a calibration table, restarting the port if it was running.
    /// All raw and parsed slots are cleared.
    pub fn set_calibration(&mut self, cal: Calibration) -> Result<()> {
        let was_alive = self.alive();
        if was_alive {
            self.stop();
        }
        info!("updating calibration table");
        self.parser = Some(SatParser::new(&cal));
        self.dispatcher = Arc::new(cal.dispatcher());
        self.cal = Some(cal);
        self.shared.lock().expect("slots lock poisoned").reset();
        if was_alive {
            self.start()?;
        }
        Ok(())
    }

    /// Load a calibration bundle from disk (see [`Calibration::load`]).
    pub fn load_calibration(&mut self, path: &std::path::Path, immersed: bool) -> Result<()> {
        self.set_calibration(Calibration::load(path, immersed)?)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.alive() {
            return Ok(());
        }
        let Some(parser) = self.parser.clone() else {
            error!("a calibration table is required for the radiometer to start");
            return Err(SasError::NoCalibration);
        };
        debug!("start");
        self.relay.on();
        std::thread::sleep(Duration::from_millis(500));
        if let Err(e) = self.port.open() {
            error!("unable to open radiometer port: {e}");
            self.relay.off();
            return Err(e);
        }
        self.alive.store(true, Ordering::SeqCst);
        let port = self.port.clone();
        let logger = self.logger.clone();
        let dispatcher = self.dispatcher.clone();
        let shared = self.shared.clone();
        let alive = self.alive.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("radiometer".into())
                .spawn(move || reader_loop(port, parser, dispatcher, logger, shared, alive))
                .expect("spawn radiometer thread"),
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        debug!("stop");
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                error!("radiometer thread did not join");
            }
        }
        self.port.close();
        self.relay.off();
        // New log file when the instrument restarts.
        self.logger.close();
    }

    /// Monotonic receive stamp of a channel, NaN before the first frame.
    pub fn channel_received(&self, channel: Channel) -> f64 {
        self.shared
            .lock()
            .expect("slots lock poisoned")
            .slots
            .get(&channel)
            .map_or(f64::NAN, |s| s.received)
    }

    pub fn decode_errors(&self) -> u64 {
        self.shared.lock().expect("slots lock poisoned").decode_errors
    }

    pub fn snapshot(&self) -> RadiometerSnapshot {
        self.shared.lock().expect("slots lock poisoned").parsed.clone()
    }

    /// Store the declination-corrected compass heading computed upstream.
    pub fn set_compass_adjusted(&self, heading: f64) {
        self.shared
            .lock()
            .expect("slots lock poisoned")
            .parsed
            .compass_adj = heading;
    }

    /// Parse the channels whose raw frame is newer than their last parse.
    pub fn parse_latest(&self) -> RadiometerSnapshot {
        let Some(cal) = self.cal.as_ref() else {
            return self.snapshot();
        };
        let mut table = self.shared.lock().expect("slots lock poisoned");

        // Tilt sensor.
        if let Some(raw) = table.pending(Channel::Ths) {
            match parse_ths(cal, &raw) {
                Ok((roll, pitch, compass)) => {
                    table.parsed.roll = roll;
                    table.parsed.pitch = pitch;
                    table.parsed.compass = compass;
                    table.mark_parsed(Channel::Ths);
                }
                Err(e) => {
                    table.parsed.roll = f64::NAN;
                    table.parsed.pitch = f64::NAN;
                    table.parsed.compass = f64::NAN;
                    table.mark_failed(Channel::Ths, &e);
                }
            }
        }

        // Darks before brights so a fresh dark corrects its bright frame.
        for channel in [
            Channel::LtDark,
            Channel::Lt,
            Channel::LiDark,
            Channel::Li,
            Channel::EsDark,
            Channel::Es,
        ] {
            let Some(raw) = table.pending(channel) else {
                continue;
            };
            let parsed = cal
                .entry_for(channel)
                .ok_or_else(|| SasError::NoCalibration)
                .and_then(|entry| entry.optical_vector(&raw));
            match parsed {
                Ok(vector) => {
                    let corrected = match channel.dark() {
                        Some(dark_channel) => {
                            match dark_vector(&table.parsed, dark_channel) {
                                Some(dark) if dark.len() == vector.len() => vector
                                    .iter()
                                    .zip(dark)
                                    .map(|(bright, dark)| bright - dark)
                                    .collect(),
                                _ => vector,
                            }
                        }
                        None => vector,
                    };
                    store_vector(&mut table.parsed, channel, Some(corrected));
                    table.mark_parsed(channel);
                }
                Err(e) => {
                    store_vector(&mut table.parsed, channel, None);
                    table.mark_failed(channel, &e);
                }
            }
        }
        table.parsed.clone()
    }
}

impl Drop for Radiometer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn parse_ths(cal: &Calibration, raw: &[u8]) -> Result<(f64, f64, f64)> {
    let entry = cal.entry_for(Channel::Ths).ok_or(SasError::NoCalibration)?;
    Ok((
        entry.scalar(raw, "ROLL")?,
        entry.scalar(raw, "PITCH")?,
        entry.scalar(raw, "COMP")?,
    ))
}

fn dark_vector(parsed: &RadiometerSnapshot, channel: Channel) -> Option<&Vec<f64>> {
    match channel {
        Channel::LtDark => parsed.lt_dark.as_ref(),
        Channel::LiDark => parsed.li_dark.as_ref(),
        Channel::EsDark => parsed.es_dark.as_ref(),
        _ => None,
    }
}

fn store_vector(parsed: &mut RadiometerSnapshot, channel: Channel, vector: Option<Vec<f64>>) {
    match channel {
        Channel::Lt => parsed.lt = vector,
        Channel::LtDark => parsed.lt_dark = vector,
        Channel::Li => parsed.li = vector,
        Channel::LiDark => parsed.li_dark = vector,
        Channel::Es => parsed.es = vector,
        Channel::EsDark => parsed.es_dark = vector,
        Channel::Ths => {}
    }
}

fn reader_loop(
    port: SharedPort,
    parser: SatParser,
    dispatcher: Arc<HashMap<Vec<u8>, Channel>>,
    logger: Arc<SatLogger>,
    shared: Arc<Mutex<SlotTable>>,
    alive: Arc<AtomicBool>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 1024];
    let mut unknown_seen: Vec<Vec<u8>> = Vec::new();
    while alive.load(Ordering::SeqCst) {
        let n = match port.with_io(|io| io.read_some(&mut chunk)) {
            Ok(n) => n,
            Err(e) => {
                error!("{e}");
                sleep_cancellable(&alive, Duration::from_secs(1));
                continue;
            }
        };
        if n == 0 {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        let ts = monotonic();
        let wall = Utc::now();
        buf.extend_from_slice(&chunk[..n]);
        loop {
            match parser.find_frame(&mut buf) {
                FrameScan::Frame {
                    header,
                    frame,
                    junk,
                } => {
                    log_junk(&logger, &mut unknown_seen, junk, wall);
                    if header == crate::protocol::SATHDR {
                        continue;
                    }
                    logger.write(frame.clone(), Some(wall));
                    match dispatcher.get(&header) {
                        Some(&channel) => {
                            shared
                                .lock()
                                .expect("slots lock poisoned")
                                .file(channel, frame, ts);
                        }
                        None => remember_unknown(&mut unknown_seen, &header),
                    }
                }
                FrameScan::Incomplete { junk } => {
                    log_junk(&logger, &mut unknown_seen, junk, wall);
                    break;
                }
            }
        }
        if buf.len() > MAX_BUFFER {
            error!("buffer exceeded maximum length, emptied to prevent overflow");
            buf.clear();
        }
    }
}

/// Unknown bytes are still logged; their start is warned once per pattern.
fn log_junk(
    logger: &SatLogger,
    seen: &mut Vec<Vec<u8>>,
    junk: Bytes,
    wall: chrono::DateTime<Utc>,
) {
    if junk.is_empty() {
        return;
    }
    logger.write(junk.clone(), Some(wall));
    remember_unknown(seen, &junk[..junk.len().min(10)]);
}

fn remember_unknown(seen: &mut Vec<Vec<u8>>, header: &[u8]) {
    if seen.iter().any(|h| h == header) {
        return;
    }
    if seen.len() > MAX_REPORTED_OFFENDERS {
        seen.clear();
    }
    seen.push(header.to_vec());
    info!(
        "data logged but not registered: {:?}...",
        String::from_utf8_lossy(header)
    );
}
