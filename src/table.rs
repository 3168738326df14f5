//! Indexing table driver.
//!
//! The tower rides on a Lexium MDrive stepper whose controller interprets
//! MCode over RS-485 with local echo disabled (`em=1`). Commands are
//! Latin-1 ASCII terminated by CR LF; each one is preceded by a backspace
//! registrator byte that clears any partial prior input in the drive. The
//! driver is synchronous: the supervisor issues one command at a time and
//! waits out the drive's execution delay.
//!
//! The range `[-180, +180]` is physical, not modular: the tower never
//! wraps, and orientations outside the limits are rejected before any
//! command is sent.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::clock::monotonic;
use crate::error::{Result, SasError};
use crate::logger::{fmt_b, fmt_f, CsvColumns, CsvLogger, SharedCsvLogger, CSV_LOCK_TIMEOUT};
use crate::registry::SharedPort;
use crate::relay::Relay;

/// Steps per degree of tower rotation.
pub const GEAR_BOX_RATIO: f64 = 200000.0 / 360.0;

/// Physical orientation limits in degrees.
pub const POSITION_LIMITS: [f64; 2] = [-180.0, 180.0];

/// Give up polling a commanded motion after this long.
pub const MOTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Nominal drive command execution time.
pub const COMMAND_EXECUTION_TIME: Duration = Duration::from_millis(50);

const REGISTRATOR: u8 = 0x08;
const TERMINATOR: &[u8] = b"\r\n";

/// Column layout of the indexing-table CSV stream.
pub const TABLE_CSV_COLUMNS: CsvColumns = CsvColumns {
    names: &["position", "stall_flag", "type"],
    units: &["degrees", "1:stalled | 0:ok", "get|set|reset|set_cfg"],
};

/// Latest-value state published for the supervisor and UI.
#[derive(Debug, Clone)]
pub struct TableState {
    pub position: f64,
    pub stalled: bool,
    pub alive: bool,
    /// Monotonic stamp of the last reply from the drive.
    pub packet_received: f64,
}

impl Default for TableState {
    fn default() -> Self {
        Self {
            position: f64::NAN,
            stalled: false,
            alive: false,
            packet_received: f64::NAN,
        }
    }
}

pub struct IndexingTable {
    port: SharedPort,
    relay: Relay,
    csv: SharedCsvLogger,
    state: Arc<Mutex<TableState>>,
    /// Motion model measured on the deployed tower: seconds per degree
    /// plus a fixed start/stop overhead.
    rotation_ispeed: f64,
    rotation_delay: f64,
}

impl IndexingTable {
    pub fn new(port: SharedPort, relay: Relay, csv: CsvLogger) -> IndexingTable {
        IndexingTable {
            port,
            relay,
            csv: SharedCsvLogger::new(csv),
            state: Arc::new(Mutex::new(TableState::default())),
            rotation_ispeed: 0.02778,
            rotation_delay: 0.1331 * 2.0,
        }
    }

    pub fn state(&self) -> TableState {
        self.state.lock().expect("state lock poisoned").clone()
    }

    pub fn alive(&self) -> bool {
        self.state().alive
    }

    pub fn position(&self) -> f64 {
        self.state().position
    }

    pub fn stalled(&self) -> bool {
        self.state().stalled
    }

    pub fn start(&mut self) -> Result<()> {
        if self.alive() {
            return Ok(());
        }
        debug!("start");
        self.relay.on();
        std::thread::sleep(COMMAND_EXECUTION_TIME);
        if let Err(e) = self.port.open() {
            error!("unable to open indexing table port: {e}");
            self.relay.off();
            return Err(e);
        }
        self.set_configuration()?;
        self.state.lock().expect("state lock poisoned").alive = true;
        self.get_position();
        Ok(())
    }

    /// Soft reset then the deployed drive configuration.
    fn set_configuration(&mut self) -> Result<()> {
        self.port.with_io(|io| io.write_all_bytes(b"\x03"))?;
        self.log_csv(f64::NAN, None, "set_cfg");
        // The reset takes much longer than a standard command.
        std::thread::sleep(COMMAND_EXECUTION_TIME * 10);
        // First command after reset needs no registrator.
        self.port
            .with_io(|io| io.write_all_bytes(b"ee=1\r\n"))?;
        std::thread::sleep(COMMAND_EXECUTION_TIME);
        for cmd in ["a=78125", "d=78125", "vi=78", "vm=20000", "em=1"] {
            self.send(cmd)?;
            std::thread::sleep(COMMAND_EXECUTION_TIME);
        }
        // Drain whatever the drive echoed during configuration.
        let msg = self.port.with_io(|io| io.read_available())?;
        if !msg.is_empty() {
            debug!("{}", latin1(&msg));
        }
        Ok(())
    }

    fn send(&self, command: &str) -> Result<()> {
        let mut wire = Vec::with_capacity(command.len() + 3);
        wire.push(REGISTRATOR);
        wire.extend_from_slice(command.as_bytes());
        wire.extend_from_slice(TERMINATOR);
        self.port.with_io(|io| io.write_all_bytes(&wire))
    }

    /// Command a move to `position_degrees`.
    ///
    /// With `check_stall` the call blocks until two consecutive position
    /// reads agree (the tower stopped) or [`MOTION_TIMEOUT`] elapses, then
    /// reads the stall flag; `Ok(false)` means the move did not complete
    /// cleanly.
    pub fn set_position(&mut self, position_degrees: f64, check_stall: bool) -> Result<bool> {
        if !self.alive() {
            error!("set_position: unable, not alive");
            return Err(SasError::NotRunning);
        }
        if !(POSITION_LIMITS[0]..=POSITION_LIMITS[1]).contains(&position_degrees) {
            error!("set_position: unable, position out of range {position_degrees}");
            return Err(SasError::PositionOutOfRange {
                requested: position_degrees,
                min: POSITION_LIMITS[0],
                max: POSITION_LIMITS[1],
            });
        }
        debug!("set_position({position_degrees}, {check_stall})");
        let steps = (position_degrees * GEAR_BOX_RATIO) as i64;
        self.send(&format!("ma {steps}"))?;
        if check_stall {
            // Wait until the tower stops moving.
            let start = Instant::now();
            let mut previous = self.get_position();
            if previous.is_nan() {
                return Ok(false);
            }
            std::thread::sleep(COMMAND_EXECUTION_TIME);
            while previous != self.get_position() && start.elapsed() < MOTION_TIMEOUT {
                previous = self.position();
                std::thread::sleep(COMMAND_EXECUTION_TIME);
            }
            if self.get_stall_flag() {
                warn!("stalled while moving to {position_degrees}");
                return Ok(false);
            }
        } else {
            self.state.lock().expect("state lock poisoned").position = position_degrees;
        }
        self.log_csv(position_degrees, None, "set");
        Ok(true)
    }

    /// Ask the drive for the encoder position; NaN when the reply is
    /// missing or unparsable.
    pub fn get_position(&mut self) -> f64 {
        if !self.alive() {
            error!("get_position: unable, not alive");
            self.state.lock().expect("state lock poisoned").position = f64::NAN;
            return f64::NAN;
        }
        let reply = self.command_reply("pr p");
        let position = match &reply {
            Some(msg) => match latin1(msg).trim().parse::<i64>() {
                Ok(steps) => steps as f64 / GEAR_BOX_RATIO,
                Err(_) => {
                    error!("unable to parse position");
                    f64::NAN
                }
            },
            None => {
                error!("unable to get position");
                f64::NAN
            }
        };
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.position = position;
            if reply.is_some() {
                state.packet_received = monotonic();
            }
        }
        if reply.is_some() {
            self.log_csv(position, None, "get");
        }
        position
    }

    /// Read the stall flag and publish it.
    pub fn get_stall_flag(&mut self) -> bool {
        let stalled = self.get_flag("st").unwrap_or(false);
        if stalled {
            debug!("STALLED");
        }
        self.state.lock().expect("state lock poisoned").stalled = stalled;
        self.log_csv(f64::NAN, Some(stalled), "get");
        stalled
    }

    /// Read an arbitrary drive flag.
    pub fn get_flag(&mut self, flag_name: &str) -> Option<bool> {
        if !self.alive() {
            error!("get_flag: unable, not alive");
            return None;
        }
        debug!("get_flag({flag_name})");
        let reply = self.command_reply(&format!("pr {flag_name}"))?;
        match latin1(&reply).trim().parse::<i64>() {
            Ok(value) => {
                self.state.lock().expect("state lock poisoned").packet_received = monotonic();
                Some(value != 0)
            }
            Err(_) => {
                error!("unable to parse flag {flag_name}");
                None
            }
        }
    }

    /// Tell the drive the current position is zero.
    pub fn reset_position_zero(&mut self) {
        if !self.alive() {
            error!("reset_position_zero: unable, not alive");
            return;
        }
        info!("reset zero");
        let _ = self.send("p=0");
        self.state.lock().expect("state lock poisoned").position = 0.0;
        self.log_csv(0.0, None, "reset");
    }

    pub fn reset_stall_flag(&mut self) {
        if !self.alive() {
            error!("reset_stall_flag: unable, not alive");
            return;
        }
        warn!("reset stall flag");
        let _ = self.send("st=0");
        self.state.lock().expect("state lock poisoned").stalled = false;
        self.log_csv(f64::NAN, Some(false), "reset");
    }

    /// Expected motion duration from the measured speed model.
    pub fn estimate_motion_time(&self, from_degrees: f64, to_degrees: f64) -> f64 {
        self.rotation_ispeed * (to_degrees - from_degrees).abs() + self.rotation_delay
    }

    /// Flush stale input, issue a command, wait, read the reply.
    fn command_reply(&mut self, command: &str) -> Option<Vec<u8>> {
        let result: Result<Vec<u8>> = (|| {
            self.port.with_io(|io| io.clear_input())?;
            self.send(command)?;
            std::thread::sleep(COMMAND_EXECUTION_TIME);
            self.port.with_io(|io| io.read_available())
        })();
        match result {
            Ok(msg) if msg.is_empty() => None,
            Ok(msg) => Some(msg),
            Err(e) => {
                error!("{e}");
                None
            }
        }
    }

    fn log_csv(&self, position: f64, stalled: Option<bool>, kind: &str) {
        let row = vec![
            fmt_f(position, 2),
            stalled.map(fmt_b).unwrap_or_else(|| "nan".into()),
            kind.to_string(),
        ];
        if self
            .csv
            .try_with(CSV_LOCK_TIMEOUT, |csv| csv.write(&row, chrono::Utc::now()))
            .is_none()
        {
            error!("unable to acquire indexing table log");
        }
    }

    /// Park at zero, clear a pending stall, close everything.
    pub fn stop(&mut self) {
        debug!("stop");
        if !self.alive() {
            return;
        }
        if self.get_stall_flag() {
            self.reset_stall_flag();
        }
        let _ = self.set_position(0.0, true);
        if self
            .csv
            .try_with(Duration::from_secs(2), |csv| csv.close())
            .is_none()
        {
            warn!("unable to acquire indexing table log to close file");
        }
        self.port.close();
        self.relay.off();
        let mut state = self.state.lock().expect("state lock poisoned");
        state.alive = false;
    }
}

impl Drop for IndexingTable {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
impl IndexingTable {
    /// Replace the published state (supervisor tests).
    pub(crate) fn inject_state(&self, state: TableState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SerialIo, SerialRegistry};
    use std::collections::VecDeque;

    /// Scripted MCode drive: answers position and flag queries, optionally
    /// refusing to move (stall scenario).
    #[derive(Default)]
    struct DriveState {
        pos_steps: i64,
        stalled: bool,
        refuse_motion: bool,
        writes: Vec<Vec<u8>>,
        rx: VecDeque<u8>,
    }

    #[derive(Clone, Default)]
    struct Drive(Arc<Mutex<DriveState>>);

    impl Drive {
        fn endpoint(&self) -> Box<dyn SerialIo> {
            Box::new(DriveEndpoint(self.0.clone()))
        }

        fn commands(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .writes
                .iter()
                .map(|w| {
                    latin1(w)
                        .trim_start_matches('\u{8}')
                        .trim_end()
                        .to_string()
                })
                .collect()
        }
    }

    struct DriveEndpoint(Arc<Mutex<DriveState>>);

    impl SerialIo for DriveEndpoint {
        fn read_some(&mut self, buf: &mut [u8]) -> crate::error::Result<usize> {
            let mut drive = self.0.lock().unwrap();
            let n = drive.rx.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = drive.rx.pop_front().unwrap();
            }
            Ok(n)
        }

        fn read_available(&mut self) -> crate::error::Result<Vec<u8>> {
            let mut drive = self.0.lock().unwrap();
            Ok(drive.rx.drain(..).collect())
        }

        fn write_all_bytes(&mut self, data: &[u8]) -> crate::error::Result<()> {
            let mut drive = self.0.lock().unwrap();
            drive.writes.push(data.to_vec());
            let cmd = latin1(data);
            let cmd = cmd.trim_start_matches('\u{8}').trim_end();
            if let Some(steps) = cmd.strip_prefix("ma ") {
                if drive.refuse_motion {
                    drive.stalled = true;
                } else if let Ok(steps) = steps.trim().parse() {
                    drive.pos_steps = steps;
                }
            } else if cmd == "pr p" {
                let reply = format!("{}\r\n", drive.pos_steps);
                drive.rx.extend(reply.bytes());
            } else if cmd == "pr st" {
                let reply = format!("{}\r\n", drive.stalled as u8);
                drive.rx.extend(reply.bytes());
            } else if cmd == "p=0" {
                drive.pos_steps = 0;
            } else if cmd == "st=0" {
                drive.stalled = false;
            }
            Ok(())
        }
    }

    fn table_with_drive(drive: &Drive, name: &str) -> IndexingTable {
        let registry = SerialRegistry::new();
        let wires = drive.clone();
        let port = registry.acquire_virtual(name, move || wires.endpoint());
        let dir = tempfile::tempdir().unwrap();
        let csv = CsvLogger::new("IndexingTable", dir.path(), 60, Some(TABLE_CSV_COLUMNS));
        IndexingTable::new(port, Relay::new(None), csv)
    }

    #[test]
    fn start_configures_the_drive() {
        let drive = Drive::default();
        let mut table = table_with_drive(&drive, "twr0");
        table.start().unwrap();
        let commands = drive.commands();
        assert_eq!(commands[0], "\u{3}");
        assert!(commands.contains(&"ee=1".to_string()));
        assert!(commands.contains(&"a=78125".to_string()));
        assert!(commands.contains(&"vm=20000".to_string()));
        assert!(commands.contains(&"em=1".to_string()));
        assert!(table.alive());
        assert_eq!(table.position(), 0.0);
        table.stop();
        assert!(!table.alive());
    }

    #[test]
    fn move_with_stall_check_completes() {
        let drive = Drive::default();
        let mut table = table_with_drive(&drive, "twr1");
        table.start().unwrap();
        assert!(table.set_position(90.0, true).unwrap());
        assert!((table.position() - 90.0).abs() < 1e-9);
        assert!(!table.stalled());
        // 90 degrees is exactly 50000 steps.
        assert!(drive.commands().contains(&"ma 50000".to_string()));
        table.stop();
        // Parked back at zero on stop.
        assert_eq!(drive.0.lock().unwrap().pos_steps, 0);
    }

    #[test]
    fn out_of_range_is_rejected_without_motion() {
        let drive = Drive::default();
        let mut table = table_with_drive(&drive, "twr2");
        table.start().unwrap();
        let err = table.set_position(190.0, false);
        assert!(matches!(
            err,
            Err(SasError::PositionOutOfRange { .. })
        ));
        assert!(!drive
            .commands()
            .iter()
            .any(|c| c.starts_with("ma ")));
        let err = table.set_position(-180.5, false);
        assert!(err.is_err());
    }

    #[test]
    fn stall_is_detected_and_resettable() {
        let drive = Drive::default();
        drive.0.lock().unwrap().refuse_motion = true;
        let mut table = table_with_drive(&drive, "twr3");
        table.start().unwrap();
        // The tower never advances; the motion poll settles immediately
        // and the stall flag comes back set.
        let moved = table.set_position(90.0, true).unwrap();
        assert!(!moved);
        assert!(table.stalled());
        assert!(table.position().abs() < 1e-9);

        table.reset_stall_flag();
        assert!(!table.stalled());
        assert!(!drive.0.lock().unwrap().stalled);
        // Allow the park-at-zero in stop() to succeed.
        drive.0.lock().unwrap().refuse_motion = false;
        table.stop();
    }

    #[test]
    fn not_alive_rejects_operations() {
        let drive = Drive::default();
        let mut table = table_with_drive(&drive, "twr4");
        assert!(matches!(
            table.set_position(10.0, false),
            Err(SasError::NotRunning)
        ));
        assert!(table.get_position().is_nan());
        assert_eq!(table.get_flag("st"), None);
    }

    #[test]
    fn motion_time_model() {
        let drive = Drive::default();
        let table = table_with_drive(&drive, "twr5");
        let t = table.estimate_motion_time(0.0, 90.0);
        assert!((t - (0.02778 * 90.0 + 0.2662)).abs() < 1e-9);
    }
}
