//! GPS reader.
//!
//! A background thread drains the receiver port through the UBX framer and
//! publishes every decoded `NAV-PVT` / `NAV-RELPOSNED` into a latest-value
//! snapshot. When logging is enabled each packet also appends one row to
//! the GPS CSV stream. The reader never stops itself: port and decode
//! errors are logged and retried after a one second backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::clock::{monotonic, sleep_cancellable};
use crate::error::Result;
use crate::logger::{fmt_b, fmt_f, CsvColumns, CsvLogger, SharedCsvLogger, CSV_LOCK_TIMEOUT};
use crate::registry::SharedPort;
use crate::relay::Relay;
use crate::ubx::{UbxPacket, UbxParser};

/// Column layout of the GPS CSV stream.
pub const GPS_CSV_COLUMNS: CsvColumns = CsvColumns {
    names: &[
        "gps_datetime",
        "datetime_accuracy",
        "datetime_valid",
        "heading",
        "heading_accuracy",
        "heading_valid",
        "heading_motion",
        "heading_vehicle",
        "heading_vehicle_accuracy",
        "heading_vehicle_valid",
        "speed",
        "speed_accuracy",
        "latitude",
        "longitude",
        "horizontal_accuracy",
        "altitude",
        "altitude_accuracy",
        "fix_ok",
        "fix_type",
        "last_packet",
    ],
    units: &[
        "yyyy-mm-dd HH:MM:SS.us",
        "us",
        "bool",
        "deg",
        "deg",
        "bool",
        "deg",
        "deg",
        "deg",
        "bool",
        "m/s ground",
        "m/s",
        "deg N",
        "deg E",
        "m",
        "m MSL",
        "m",
        "bool",
        "0: no_fix; 1: DR; 2: 2D-fix; 3: 3D-fix; 4: GNSS+DR; 5: time_only",
        "name",
    ],
};

/// Latest-value state of the receiver; all fields overwritten together.
#[derive(Debug, Clone)]
pub struct GpsSnapshot {
    pub datetime: Option<DateTime<Utc>>,
    /// Time accuracy in microseconds.
    pub datetime_accuracy: u32,
    pub datetime_valid: bool,
    /// Two-antenna RTK heading, degrees clockwise from north.
    pub heading: f64,
    pub heading_accuracy: f64,
    pub heading_valid: bool,
    /// Course over ground.
    pub heading_motion: f64,
    pub heading_vehicle: f64,
    pub heading_vehicle_accuracy: f64,
    pub heading_vehicle_valid: bool,
    pub speed: f64,
    pub speed_accuracy: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub horizontal_accuracy: f64,
    /// Altitude above mean sea level, meters.
    pub altitude: f64,
    pub altitude_accuracy: f64,
    pub fix_ok: bool,
    pub fix_type: u8,
    /// Monotonic receive stamps, NaN before the first packet.
    pub packet_pvt_received: f64,
    pub packet_relposned_received: f64,
}

impl Default for GpsSnapshot {
    fn default() -> Self {
        Self {
            datetime: None,
            datetime_accuracy: 0,
            datetime_valid: false,
            heading: f64::NAN,
            heading_accuracy: f64::NAN,
            heading_valid: false,
            heading_motion: f64::NAN,
            heading_vehicle: f64::NAN,
            heading_vehicle_accuracy: f64::NAN,
            heading_vehicle_valid: false,
            speed: f64::NAN,
            speed_accuracy: f64::NAN,
            latitude: f64::NAN,
            longitude: f64::NAN,
            horizontal_accuracy: f64::NAN,
            altitude: f64::NAN,
            altitude_accuracy: f64::NAN,
            fix_ok: false,
            fix_type: 0,
            packet_pvt_received: f64::NAN,
            packet_relposned_received: f64::NAN,
        }
    }
}

/// Fold one decoded packet into the snapshot. Returns the CSV
/// `last_packet` tag, `None` for unsupported messages.
fn apply_packet(snap: &mut GpsSnapshot, packet: &UbxPacket, ts: f64) -> Option<&'static str> {
    match packet {
        UbxPacket::Pvt(pvt) => {
            snap.datetime = pvt.datetime();
            snap.datetime_accuracy = pvt.time_acc_us();
            snap.datetime_valid = pvt.datetime_valid();
            snap.latitude = pvt.lat_deg();
            snap.longitude = pvt.lon_deg();
            snap.horizontal_accuracy = pvt.h_acc_m();
            snap.altitude = pvt.height_msl_m();
            snap.altitude_accuracy = pvt.v_acc_m();
            snap.fix_ok = pvt.flags.contains(crate::ubx::NavPvtFlags::GNSS_FIX_OK);
            snap.fix_type = pvt.fix_type;
            snap.speed = pvt.speed_mps();
            snap.speed_accuracy = pvt.speed_acc_mps();
            snap.heading_motion = pvt.heading_motion_deg();
            snap.heading_vehicle = pvt.heading_vehicle_deg();
            snap.heading_vehicle_accuracy = pvt.heading_acc_deg();
            snap.heading_vehicle_valid = pvt
                .flags
                .contains(crate::ubx::NavPvtFlags::HEAD_VEH_VALID);
            snap.packet_pvt_received = ts;
            Some("PVT")
        }
        UbxPacket::RelPosNed(rel) => {
            snap.heading = rel.heading_deg();
            snap.heading_accuracy = rel.heading_acc_deg();
            snap.heading_valid = rel.heading_valid();
            snap.fix_ok = rel.fix_ok();
            snap.packet_relposned_received = ts;
            Some("RELPOSNED")
        }
        UbxPacket::Unsupported { class, id } => {
            warn!("packet not supported: class {class:#04x} id {id:#04x}");
            None
        }
    }
}

/// Format one CSV row from the snapshot, without the leading datetime
/// column (the logger writes that).
fn csv_row(snap: &GpsSnapshot, last_packet: &str) -> Vec<String> {
    vec![
        snap.datetime
            .map(|dt| dt.format("%Y/%m/%d %H:%M:%S%.6f").to_string())
            .unwrap_or_else(|| "None".into()),
        snap.datetime_accuracy.to_string(),
        fmt_b(snap.datetime_valid),
        fmt_f(snap.heading, 5),
        fmt_f(snap.heading_accuracy, 5),
        fmt_b(snap.heading_valid),
        fmt_f(snap.heading_motion, 5),
        fmt_f(snap.heading_vehicle, 5),
        fmt_f(snap.heading_vehicle_accuracy, 5),
        fmt_b(snap.heading_vehicle_valid),
        fmt_f(snap.speed, 3),
        fmt_f(snap.speed_accuracy, 3),
        fmt_f(snap.latitude, 7),
        fmt_f(snap.longitude, 7),
        fmt_f(snap.horizontal_accuracy, 3),
        fmt_f(snap.altitude, 3),
        fmt_f(snap.altitude_accuracy, 3),
        fmt_b(snap.fix_ok),
        snap.fix_type.to_string(),
        last_packet.to_string(),
    ]
}

/// The GPS device: port owner, reader thread, snapshot publisher.
pub struct Gps {
    port: SharedPort,
    relay: Relay,
    snapshot: Arc<Mutex<GpsSnapshot>>,
    alive: Arc<AtomicBool>,
    logging: Arc<AtomicBool>,
    csv: SharedCsvLogger,
    thread: Option<JoinHandle<()>>,
}

impl Gps {
    pub fn new(port: SharedPort, relay: Relay, csv: CsvLogger) -> Gps {
        Gps {
            port,
            relay,
            snapshot: Arc::new(Mutex::new(GpsSnapshot::default())),
            alive: Arc::new(AtomicBool::new(false)),
            logging: Arc::new(AtomicBool::new(false)),
            csv: SharedCsvLogger::new(csv),
            thread: None,
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> GpsSnapshot {
        self.snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.alive() {
            return Ok(());
        }
        debug!("start");
        self.relay.on();
        std::thread::sleep(Duration::from_millis(500));
        if let Err(e) = self.port.open() {
            error!("unable to open GPS port: {e}");
            self.relay.off();
            return Err(e);
        }
        self.alive.store(true, Ordering::SeqCst);
        let port = self.port.clone();
        let snapshot = self.snapshot.clone();
        let alive = self.alive.clone();
        let logging = self.logging.clone();
        let csv = self.csv.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("gps".into())
                .spawn(move || reader_loop(port, snapshot, alive, logging, csv))
                .expect("spawn gps thread"),
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
                error!("GPS thread did not join");
            }
        }
        self.port.close();
        self.relay.off();
        self.stop_logging();
    }

    pub fn logging(&self) -> bool {
        self.logging.load(Ordering::SeqCst)
    }

    pub fn start_logging(&self) {
        if !self.logging.swap(true, Ordering::SeqCst) {
            debug!("start logging");
            if !self.alive() {
                info!("not alive");
            }
        }
    }

    /// Disable CSV logging and close the file so a restart begins fresh.
    pub fn stop_logging(&self) {
        if self.logging.swap(false, Ordering::SeqCst) {
            debug!("stop logging");
            if self
                .csv
                .try_with(Duration::from_secs(2), |csv| csv.close())
                .is_none()
            {
                warn!("unable to acquire GPS log to close file");
            }
        }
    }
}

impl Drop for Gps {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
impl Gps {
    /// Replace the published snapshot (supervisor tests).
    pub(crate) fn inject_snapshot(&self, snap: GpsSnapshot) {
        *self.snapshot.lock().expect("snapshot lock poisoned") = snap;
    }
}

fn reader_loop(
    port: SharedPort,
    snapshot: Arc<Mutex<GpsSnapshot>>,
    alive: Arc<AtomicBool>,
    logging: Arc<AtomicBool>,
    csv: SharedCsvLogger,
) {
    let mut parser = UbxParser::new();
    let mut buf = [0u8; 512];
    while alive.load(Ordering::SeqCst) {
        let n = match port.with_io(|io| io.read_some(&mut buf)) {
            Ok(n) => n,
            Err(e) => {
                error!("{e}");
                error!("device disconnected or multiple access on port?");
                sleep_cancellable(&alive, Duration::from_secs(1));
                continue;
            }
        };
        if n == 0 {
            // Timed out; idle briefly so a quiet mock port does not spin.
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        let ts = monotonic();
        let mut chunk = &buf[..n];
        loop {
            let Some(frame) = parser.consume(chunk) else {
                break;
            };
            chunk = &[];
            match frame.decode() {
                Ok(packet) => {
                    let tag = {
                        let mut snap = snapshot.lock().expect("snapshot lock poisoned");
                        apply_packet(&mut snap, &packet, ts)
                    };
                    if let Some(tag) = tag {
                        if logging.load(Ordering::SeqCst) {
                            let snap = snapshot.lock().expect("snapshot lock poisoned").clone();
                            let row = csv_row(&snap, tag);
                            if csv
                                .try_with(CSV_LOCK_TIMEOUT, |csv| csv.write(&row, Utc::now()))
                                .is_none()
                            {
                                error!("unable to acquire GPS log to write data");
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("corrupted message: {e}");
                    sleep_cancellable(&alive, Duration::from_secs(1));
                }
            }
        }
    }
}
