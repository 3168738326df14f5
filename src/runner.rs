//! Supervisor.
//!
//! One loop ticks every `refresh` seconds and walks an explicit state
//! machine: wait for a usable GPS solution, compute the sun position, sleep
//! through the night with instruments powered down, and while awake keep
//! the tower pointed at the steering target and emit one `UMTWR` telemetry
//! frame per tick into the merged log. Mode `manual` runs the same loop
//! without touching power or motion.
//!
//! Every tick is fenced: an error inside one iteration is logged and the
//! loop carries on.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::angle::wrap360;
use crate::autopilot::AutoPilot;
use crate::calibration::Calibration;
use crate::clock::{monotonic, sleep_cancellable, wall_from_monotonic};
use crate::config::{Config, HeadingSource, OperationMode};
use crate::declination::true_north_heading;
use crate::error::Result;
use crate::gps::{Gps, GPS_CSV_COLUMNS};
use crate::logger::{fmt_f, CsvLogger, SatLogger, SatLoggerConfig};
use crate::radiometer::Radiometer;
use crate::registry::SerialRegistry;
use crate::relay::Relay;
use crate::solar::sun_position;
use crate::table::{IndexingTable, TABLE_CSV_COLUMNS};

/// A snapshot older than this no longer qualifies its computations.
pub const DATA_EXPIRED_DELAY: f64 = 20.0;
/// The wake condition must persist this long before instruments start.
pub const WAKEUP_DELAY: f64 = 20.0;
/// The sleep condition must persist this long before instruments stop.
pub const ASLEEP_DELAY: f64 = 120.0;
/// Long-sleep period while the sun is down.
pub const ASLEEP_INTERRUPT: f64 = 120.0;
/// Do not command motion for smaller pointing errors (about 111 steps).
pub const HEADING_TOLERANCE: f64 = 0.2;

/// Supervisor loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// No usable GPS solution yet.
    AwaitGps,
    /// GPS good; sun position being evaluated.
    AwaitSun,
    /// Sun too low (or no target); instruments powered down.
    Asleep,
    /// Measuring: instruments on, tower steered.
    Awake,
}

#[derive(Default)]
struct TickFlags {
    sun_pos: bool,
    sun_elev: bool,
    no_ship_heading: bool,
    no_position: bool,
    stalled: bool,
}

enum TickFlow {
    /// Tick ended; apply the normal refresh wait.
    Wait,
    /// The tick already slept (night long-sleep).
    AlreadyWaited,
}

/// Owns the devices and runs the control loop.
pub struct Runner {
    pub pilot: AutoPilot,
    pub gps: Gps,
    pub hypersas: Radiometer,
    pub indexing_table: IndexingTable,
    pub data_logger: Arc<SatLogger>,

    heading_source: HeadingSource,
    min_sun_elevation: f64,
    refresh_delay: f64,
    asleep_delay: f64,
    wakeup_delay: f64,
    asleep_interrupt: f64,

    state: RunnerState,
    asleep: bool,
    start_sleep_timestamp: Option<f64>,
    stop_sleep_timestamp: Option<f64>,
    pub sun_elevation: f64,
    pub sun_azimuth: f64,
    pub sun_position_timestamp: f64,
    pub ship_heading: f64,
    pub ship_heading_timestamp: f64,
    internet: bool,
    time_synced: Option<f64>,
}

impl Runner {
    /// Build the full device stack from the configuration. Serial ports
    /// come from the registry so a port shared in the configuration
    /// resolves to one owner.
    pub fn new(cfg: &Config, registry: &SerialRegistry) -> Result<Runner> {
        let data_logger = Arc::new(SatLogger::new(SatLoggerConfig {
            filename_prefix: cfg.data_logger.filename_prefix.clone(),
            filename_ext: cfg.data_logger.filename_ext.clone(),
            path: cfg.data_logger.path_to_data.clone(),
            file_length: Duration::from_secs(cfg.data_logger.file_length * 60),
        }));

        let shared_data_path = cfg.data_logger.path_to_data.clone();
        let gps_port = registry.acquire(&cfg.gps.port, cfg.gps.serial_settings());
        let gps = Gps::new(
            gps_port,
            Relay::new(cfg.gps.relay_gpio_pin),
            CsvLogger::new(
                "GPS",
                cfg.gps.data_path(&shared_data_path),
                cfg.gps.file_length,
                Some(GPS_CSV_COLUMNS),
            ),
        );

        let table_port = registry.acquire(
            &cfg.indexing_table.port,
            cfg.indexing_table.serial_settings(),
        );
        let indexing_table = IndexingTable::new(
            table_port,
            Relay::new(cfg.indexing_table.relay_gpio_pin),
            CsvLogger::new(
                "IndexingTable",
                cfg.indexing_table.data_path(&shared_data_path),
                cfg.indexing_table.file_length,
                Some(TABLE_CSV_COLUMNS),
            ),
        );

        let sas_port = registry.acquire(
            &cfg.hyper_sas.device.port,
            cfg.hyper_sas.device.serial_settings(),
        );
        let mut hypersas = Radiometer::new(
            sas_port,
            Relay::new(cfg.hyper_sas.device.relay_gpio_pin),
            data_logger.clone(),
        );
        match &cfg.hyper_sas.sip {
            Some(sip) => match Calibration::load(sip, cfg.hyper_sas.immersed) {
                Ok(cal) => hypersas.set_calibration(cal)?,
                Err(e) => error!(
                    "error while loading the calibration file {}: {e}; \
                     the radiometer stays unavailable until a new table is set",
                    sip.display()
                ),
            },
            None => warn!("calibration file parameter \"sip\" absent from configuration"),
        }

        Ok(Self::from_parts(
            cfg,
            gps,
            hypersas,
            indexing_table,
            data_logger,
            check_internet(),
        ))
    }

    /// Assemble from prebuilt devices (embedding and tests).
    pub fn from_parts(
        cfg: &Config,
        gps: Gps,
        hypersas: Radiometer,
        indexing_table: IndexingTable,
        data_logger: Arc<SatLogger>,
        internet: bool,
    ) -> Runner {
        Runner {
            pilot: AutoPilot::new(&cfg.auto_pilot),
            gps,
            hypersas,
            indexing_table,
            data_logger,
            heading_source: cfg.runner.heading_source,
            min_sun_elevation: cfg.runner.min_sun_elevation,
            refresh_delay: cfg.runner.refresh as f64,
            asleep_delay: ASLEEP_DELAY,
            wakeup_delay: WAKEUP_DELAY,
            asleep_interrupt: ASLEEP_INTERRUPT,
            state: RunnerState::AwaitGps,
            asleep: true,
            start_sleep_timestamp: None,
            stop_sleep_timestamp: None,
            sun_elevation: f64::NAN,
            sun_azimuth: f64::NAN,
            sun_position_timestamp: f64::NAN,
            ship_heading: f64::NAN,
            ship_heading_timestamp: f64::NAN,
            internet,
            time_synced: None,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn asleep(&self) -> bool {
        self.asleep
    }

    /// Monotonic stamp of the last successful GPS time sync.
    pub fn time_synced(&self) -> Option<f64> {
        self.time_synced
    }

    fn set_state(&mut self, state: RunnerState) {
        if self.state != state {
            debug!("{:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    /// Auto-mode loop; returns when `alive` drops.
    pub fn run_auto(&mut self, alive: &AtomicBool) {
        let mut flags = TickFlags::default();
        let mut first_iteration = true;
        // Trust the instrument power state over any stale flag.
        self.asleep = !(self.indexing_table.alive() && self.hypersas.alive());
        while alive.load(Ordering::SeqCst) {
            let iteration_start = monotonic();
            let flow = self.auto_tick(alive, &mut flags, first_iteration);
            first_iteration = false;
            match flow {
                Ok(TickFlow::AlreadyWaited) => {}
                Ok(TickFlow::Wait) => self.wait(alive, iteration_start),
                Err(e) => {
                    error!("{e}");
                    self.wait(alive, iteration_start);
                }
            }
        }
    }

    fn auto_tick(
        &mut self,
        alive: &AtomicBool,
        flags: &mut TickFlags,
        first_iteration: bool,
    ) -> Result<TickFlow> {
        if !self.update_sun_position() {
            self.set_state(RunnerState::AwaitGps);
            if !flags.sun_pos {
                info!("no sun position");
                flags.sun_pos = true;
            }
            return Ok(TickFlow::Wait);
        }
        self.set_state(RunnerState::AwaitSun);

        if self.sun_elevation < self.min_sun_elevation {
            // Sun below minimum elevation, go to sleep.
            self.go_to_sleep(first_iteration);
            if self.asleep {
                self.set_state(RunnerState::Asleep);
                if !flags.sun_elev {
                    info!(
                        "sun below minimum elevation {:.1} < {:.1}",
                        self.sun_elevation, self.min_sun_elevation
                    );
                    flags.sun_elev = true;
                }
                // It's night: no need to wake up for a while.
                sleep_cancellable(alive, Duration::from_secs_f64(self.asleep_interrupt));
                return Ok(TickFlow::AlreadyWaited);
            }
            return Ok(TickFlow::Wait);
        }
        if self.sun_azimuth.is_nan() {
            self.go_to_sleep(first_iteration);
            if self.asleep {
                self.set_state(RunnerState::Asleep);
            }
            if self.asleep && !flags.sun_pos {
                info!("no sun position");
                flags.sun_pos = true;
            }
            return Ok(TickFlow::Wait);
        }
        flags.sun_elev = false;
        flags.sun_pos = false;

        if !self.update_ship_heading() {
            if !flags.no_ship_heading {
                info!("no ship heading");
                flags.no_ship_heading = true;
            }
            return Ok(TickFlow::Wait);
        }
        flags.no_ship_heading = false;

        let aim = self.pilot.steer(self.sun_azimuth, self.ship_heading);
        if aim.is_nan() {
            // No tower orientation satisfies even the tolerated range.
            if !flags.no_position {
                info!("no orientation available");
                flags.no_position = true;
            }
            self.go_to_sleep(first_iteration);
            return Ok(TickFlow::Wait);
        }
        flags.no_position = false;

        self.wakeup(first_iteration);
        if !self.indexing_table.alive() {
            return Ok(TickFlow::Wait);
        }
        self.set_state(RunnerState::Awake);

        // Position is read even when stalled so it still gets logged.
        let position = self.indexing_table.get_position();
        if self.indexing_table.get_stall_flag() {
            if !flags.stalled {
                warn!("indexing table stalled");
                flags.stalled = true;
            }
        } else {
            if (position - aim).abs() > HEADING_TOLERANCE {
                self.indexing_table.set_position(aim, false)?;
            }
            flags.stalled = false;
        }

        let (frame, timestamp) = self.make_umtwr_frame();
        self.data_logger.write(frame, Some(timestamp));
        Ok(TickFlow::Wait)
    }

    /// Manual-mode loop: no power switching, no motion; telemetry and UI
    /// state only.
    pub fn run_manual(&mut self, alive: &AtomicBool) {
        while alive.load(Ordering::SeqCst) {
            let iteration_start = monotonic();
            if let Err(e) = self.manual_tick() {
                error!("{e}");
            }
            self.wait(alive, iteration_start);
        }
    }

    fn manual_tick(&mut self) -> Result<()> {
        if self.indexing_table.alive() {
            self.indexing_table.get_position();
            self.indexing_table.get_stall_flag();
        }
        self.update_sun_position();
        if !self.hypersas.alive() {
            self.gps.stop_logging();
            return Ok(());
        }
        self.gps.start_logging();
        let (frame, timestamp) = self.make_umtwr_frame();
        self.data_logger.write(frame, Some(timestamp));
        Ok(())
    }

    fn wait(&self, alive: &AtomicBool, iteration_start: f64) {
        if !alive.load(Ordering::SeqCst) {
            return;
        }
        let delta = self.refresh_delay - (monotonic() - iteration_start);
        if delta > 0.0 {
            sleep_cancellable(alive, Duration::from_secs_f64(delta));
        } else {
            warn!("cannot keep up with refresh rate, slowing down");
            sleep_cancellable(
                alive,
                Duration::from_secs_f64(1.0 + self.refresh_delay.abs()),
            );
        }
    }

    /// Compute the sun position from a fresh, valid GPS solution.
    pub fn update_sun_position(&mut self) -> bool {
        let gps = self.gps.snapshot();
        let fresh = monotonic() - gps.packet_pvt_received < DATA_EXPIRED_DELAY;
        if gps.fix_ok && gps.datetime_valid && fresh {
            if let Some(datetime) = gps.datetime {
                let (elevation, azimuth) =
                    sun_position(gps.latitude, gps.longitude, datetime);
                self.sun_elevation = elevation;
                self.sun_azimuth = azimuth;
                self.sun_position_timestamp = monotonic();
                return true;
            }
        }
        false
    }

    /// Derive the ship heading from the configured source.
    pub fn update_ship_heading(&mut self) -> bool {
        let gps = self.gps.snapshot();
        let now = monotonic();
        match self.heading_source {
            HeadingSource::GpsRelativePosition => {
                if gps.heading_valid
                    && now - gps.packet_relposned_received < DATA_EXPIRED_DELAY
                {
                    self.ship_heading = self.pilot.get_ship_heading(gps.heading, None);
                    self.ship_heading_timestamp = gps.packet_relposned_received;
                    return true;
                }
            }
            HeadingSource::GpsMotion => {
                if gps.fix_ok && now - gps.packet_pvt_received < DATA_EXPIRED_DELAY {
                    self.ship_heading = self.pilot.get_ship_heading(gps.heading_motion, None);
                    self.ship_heading_timestamp = gps.packet_pvt_received;
                    return true;
                }
            }
            HeadingSource::GpsVehicle => {
                if gps.fix_ok && now - gps.packet_pvt_received < DATA_EXPIRED_DELAY {
                    self.ship_heading = self.pilot.get_ship_heading(gps.heading_vehicle, None);
                    self.ship_heading_timestamp = gps.packet_pvt_received;
                    return true;
                }
            }
            HeadingSource::ThsHeading => {
                let sas = self.hypersas.snapshot();
                if gps.fix_ok
                    && now - gps.packet_pvt_received < DATA_EXPIRED_DELAY
                    && !sas.compass.is_nan()
                    && now - sas.ths_parsed < DATA_EXPIRED_DELAY
                {
                    if let Some(datetime) = gps.datetime {
                        let adjusted = true_north_heading(
                            sas.compass,
                            gps.latitude,
                            gps.longitude,
                            gps.altitude,
                            datetime,
                        );
                        self.hypersas.set_compass_adjusted(adjusted);
                        let tower = self.indexing_table.get_position();
                        self.ship_heading =
                            self.pilot.get_ship_heading(adjusted, Some(tower));
                        self.ship_heading_timestamp = sas.ths_parsed;
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Power everything but the GPS down once the sleep condition has held
    /// for `asleep_delay` seconds (immediately when forced).
    pub fn go_to_sleep(&mut self, force: bool) {
        if !self.asleep {
            let since = *self
                .start_sleep_timestamp
                .get_or_insert_with(monotonic);
            if force || monotonic() - since > self.asleep_delay {
                info!("stop instruments");
                self.indexing_table.stop();
                self.hypersas.stop();
                self.gps.stop_logging();
                self.asleep = true;
                self.set_state(RunnerState::Asleep);
            }
        }
        // Reset the wake-up timer if still asleep well past the wake delay.
        if self.asleep {
            if let Some(since) = self.stop_sleep_timestamp {
                if monotonic() - since > self.wakeup_delay + 10.0 * self.refresh_delay {
                    debug!("still sleepy, reset wake-up timer");
                    self.stop_sleep_timestamp = None;
                }
            }
        }
    }

    /// Power instruments up once the wake condition has held for
    /// `wakeup_delay` seconds (immediately when forced).
    pub fn wakeup(&mut self, force: bool) {
        if self.asleep {
            let since = *self.stop_sleep_timestamp.get_or_insert_with(|| {
                info!("waking up triggered ...");
                monotonic()
            });
            if force || monotonic() - since > self.wakeup_delay {
                info!("start instruments");
                if !self.internet && !self.hypersas.alive() {
                    self.sync_time();
                }
                if let Err(e) = self.indexing_table.start() {
                    error!("indexing table failed to start: {e}");
                }
                self.gps.start_logging();
                if let Err(e) = self.hypersas.start() {
                    error!("radiometer failed to start: {e}");
                }
                self.asleep = false;
            }
        }
        // Stay up for as long as possible.
        self.start_sleep_timestamp = None;
    }

    /// Step the system clock onto GPS time; used before a cold radiometer
    /// start when no network time is available.
    pub fn sync_time(&mut self) -> bool {
        let gps = self.gps.snapshot();
        let fresh = monotonic() - gps.packet_pvt_received < DATA_EXPIRED_DELAY;
        if gps.fix_ok && gps.datetime_valid && fresh {
            if let Some(datetime) = gps.datetime {
                let pre = Utc::now();
                let age = monotonic() - gps.packet_pvt_received;
                let target = datetime
                    + chrono::Duration::from_std(Duration::from_secs_f64(age.max(0.0)))
                        .unwrap_or_default();
                let status = Command::new("date")
                    .arg("-s")
                    .arg(target.to_rfc3339())
                    .status();
                match status {
                    Ok(code) if code.success() => {
                        self.time_synced = Some(monotonic());
                        info!("time synchronized from {pre} to {}", Utc::now());
                        return true;
                    }
                    Ok(code) => warn!("date -s exited with {code}"),
                    Err(e) => warn!("unable to run date -s: {e}"),
                }
            }
        }
        warn!("unable to synchronize time");
        false
    }

    /// Build the synthesized telemetry frame written to the merged log.
    ///
    /// The ship heading field is always the RTK relative heading (the only
    /// place it is reported) regardless of the configured steering source.
    pub fn make_umtwr_frame(&mut self) -> (Vec<u8>, DateTime<Utc>) {
        let gps = self.gps.snapshot();
        let now = monotonic();

        let (ship_heading, ship_heading_accuracy) = if gps.heading_valid
            && now - gps.packet_relposned_received < DATA_EXPIRED_DELAY
        {
            (
                wrap360(self.pilot.get_ship_heading(gps.heading, None)),
                gps.heading_accuracy,
            )
        } else {
            (f64::NAN, f64::NAN)
        };

        let (motion_heading, motion_heading_accuracy) =
            if gps.fix_ok && now - gps.packet_pvt_received < DATA_EXPIRED_DELAY {
                (wrap360(gps.heading_motion), gps.heading_vehicle_accuracy)
            } else {
                (f64::NAN, f64::NAN)
            };

        let table = self.indexing_table.state();
        let (tower_status, tower_position, sas_heading) =
            if table.alive && now - table.packet_received < DATA_EXPIRED_DELAY {
                let status = if table.stalled { 'S' } else { 'O' };
                // SAS heading follows the user-selected steering source.
                let sas = wrap360(self.ship_heading - self.pilot.tower_zero + table.position);
                (status, table.position, sas)
            } else {
                ('N', f64::NAN, f64::NAN)
            };

        let frame = format!(
            "UMTWR,{},{},{},{},{},{},{},{},{}\r\n",
            fmt_f(sas_heading, 2),
            fmt_f(ship_heading, 2),
            fmt_f(ship_heading_accuracy, 2),
            fmt_f(motion_heading, 1),
            fmt_f(motion_heading_accuracy, 1),
            fmt_f(tower_position, 2),
            tower_status,
            fmt_f(self.sun_azimuth, 1),
            fmt_f(self.sun_elevation, 1),
        );

        let stamp = [
            gps.packet_relposned_received,
            gps.packet_pvt_received,
            table.packet_received,
        ]
        .into_iter()
        .filter(|s| !s.is_nan())
        .fold(f64::NAN, f64::max);
        let timestamp = if stamp.is_nan() {
            Utc::now()
        } else {
            wall_from_monotonic(stamp)
        };
        (frame.into_bytes(), timestamp)
    }

    /// Stop every device, newest first, and flush the merged log.
    pub fn stop_app(&mut self) {
        info!("stopping devices");
        self.hypersas.stop();
        self.gps.stop();
        self.indexing_table.stop();
        self.data_logger.close();
        self.data_logger.sync();
    }
}

/// Reachability probe used to decide whether the host clock can be
/// trusted without a GPS time sync.
pub fn check_internet() -> bool {
    let addr = std::net::SocketAddr::from(([8, 8, 8, 8], 53));
    std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(3)).is_ok()
}

/// Thread lifecycle around [`Runner`]: start/stop, mode switches, halt.
pub struct Supervisor {
    runner: Option<Runner>,
    thread: Option<JoinHandle<Runner>>,
    alive: Arc<AtomicBool>,
    mode: OperationMode,
    halt_host_on_exit: bool,
    pub interrupt_from_ui: bool,
    pub reboot_from_ui: bool,
}

impl Supervisor {
    pub fn new(runner: Runner, cfg: &Config) -> Supervisor {
        Supervisor {
            runner: Some(runner),
            thread: None,
            alive: Arc::new(AtomicBool::new(false)),
            mode: cfg.runner.operation_mode,
            halt_host_on_exit: cfg.runner.halt_host_on_exit,
            interrupt_from_ui: false,
            reboot_from_ui: false,
        }
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn running(&self) -> bool {
        self.thread.is_some()
    }

    /// Spawn the loop thread. The GPS reader runs for the whole session;
    /// instruments are managed by the loop itself.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        let Some(mut runner) = self.runner.take() else {
            return;
        };
        debug!("start {:?}", self.mode);
        if let Err(e) = runner.gps.start() {
            error!("GPS failed to start: {e}");
        }
        self.alive.store(true, Ordering::SeqCst);
        let alive = self.alive.clone();
        let mode = self.mode;
        self.thread = Some(
            std::thread::Builder::new()
                .name("runner".into())
                .spawn(move || {
                    match mode {
                        OperationMode::Auto => runner.run_auto(&alive),
                        OperationMode::Manual => runner.run_manual(&alive),
                    }
                    runner
                })
                .expect("spawn runner thread"),
        );
    }

    /// Stop the loop thread and reclaim the runner.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        debug!("stop runner thread");
        self.alive.store(false, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if !handle.is_finished() {
            // A stall-checked motion can hold the loop; wait it out.
            error!("runner thread did not join in time");
        }
        match handle.join() {
            Ok(runner) => self.runner = Some(runner),
            Err(_) => error!("runner thread panicked"),
        }
    }

    pub fn set_operation_mode(&mut self, mode: OperationMode) {
        if self.mode == mode && self.running() {
            return;
        }
        self.stop();
        self.mode = mode;
        self.start();
    }

    /// Direct access to the runner while the loop is stopped.
    pub fn runner(&mut self) -> Option<&mut Runner> {
        self.runner.as_mut()
    }

    /// Full shutdown: loop, then devices in reverse construction order,
    /// then optionally the host.
    pub fn halt(&mut self) {
        self.stop();
        if let Some(runner) = self.runner.as_mut() {
            runner.stop_app();
        }
        if self.halt_host_on_exit && self.reboot_from_ui {
            let _ = Command::new("shutdown").args(["-r", "now"]).status();
        } else if self.halt_host_on_exit && self.interrupt_from_ui {
            let _ = Command::new("shutdown").args(["-h", "now"]).status();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::test_support::test_calibration;
    use crate::config::test_support::sample_config;
    use crate::gps::GpsSnapshot;
    use crate::registry::test_support::MockPort;
    use crate::table::TableState;
    use chrono::TimeZone;

    struct Rig {
        runner: Runner,
        log_dir: tempfile::TempDir,
    }

    fn rig(with_cal: bool) -> Rig {
        let registry = SerialRegistry::new();
        let log_dir = tempfile::tempdir().unwrap();

        let wires = MockPort::default();
        let gps_port = registry.acquire_virtual("gps", move || wires.endpoint());
        let gps = Gps::new(
            gps_port,
            Relay::new(None),
            CsvLogger::new("GPS", log_dir.path(), 60, Some(GPS_CSV_COLUMNS)),
        );

        let wires = MockPort::default();
        let sas_port = registry.acquire_virtual("sas", move || wires.endpoint());
        let data_logger = Arc::new(SatLogger::new(SatLoggerConfig {
            filename_prefix: "pySAS001".into(),
            filename_ext: "raw".into(),
            path: log_dir.path().join("merged"),
            ..SatLoggerConfig::default()
        }));
        let mut hypersas = Radiometer::new(sas_port, Relay::new(None), data_logger.clone());
        if with_cal {
            hypersas.set_calibration(test_calibration()).unwrap();
        }

        let wires = MockPort::default();
        let table_port = registry.acquire_virtual("twr", move || wires.endpoint());
        let indexing_table = IndexingTable::new(
            table_port,
            Relay::new(None),
            CsvLogger::new("IndexingTable", log_dir.path(), 60, Some(TABLE_CSV_COLUMNS)),
        );

        let runner = Runner::from_parts(
            &sample_config(),
            gps,
            hypersas,
            indexing_table,
            data_logger,
            true,
        );
        Rig { runner, log_dir }
    }

    fn warm_gps_snapshot() -> GpsSnapshot {
        GpsSnapshot {
            datetime: Some(Utc.with_ymd_and_hms(2024, 6, 11, 16, 23, 11).unwrap()),
            datetime_valid: true,
            fix_ok: true,
            fix_type: 3,
            latitude: 44.9,
            longitude: -68.7,
            altitude: 0.0,
            heading: 10.0,
            heading_accuracy: 0.5,
            heading_valid: true,
            heading_motion: 11.0,
            heading_vehicle: 12.0,
            heading_vehicle_accuracy: 1.5,
            heading_vehicle_valid: true,
            speed: 2.5,
            speed_accuracy: 0.1,
            packet_pvt_received: monotonic(),
            packet_relposned_received: monotonic(),
            ..GpsSnapshot::default()
        }
    }

    #[test]
    fn sun_position_needs_fresh_valid_gps() {
        let mut rig = rig(false);
        assert!(!rig.runner.update_sun_position());

        rig.runner.gps.inject_snapshot(warm_gps_snapshot());
        assert!(rig.runner.update_sun_position());
        assert!((rig.runner.sun_elevation - 58.99).abs() < 0.4);
        assert!((rig.runner.sun_azimuth - 234.51).abs() < 0.1);

        // Stale PVT disqualifies the computation.
        let mut stale = warm_gps_snapshot();
        stale.packet_pvt_received = monotonic() - DATA_EXPIRED_DELAY - 1.0;
        rig.runner.gps.inject_snapshot(stale);
        assert!(!rig.runner.update_sun_position());
    }

    #[test]
    fn ship_heading_sources() {
        let mut rig = rig(false);
        rig.runner.gps.inject_snapshot(warm_gps_snapshot());
        assert!(rig.runner.update_ship_heading());
        assert!((rig.runner.ship_heading - 10.0).abs() < 1e-9);

        // Invalid RTK heading blocks the default source.
        let mut invalid = warm_gps_snapshot();
        invalid.heading_valid = false;
        rig.runner.gps.inject_snapshot(invalid);
        assert!(!rig.runner.update_ship_heading());

        rig.runner.heading_source = HeadingSource::GpsMotion;
        assert!(rig.runner.update_ship_heading());
        assert!((rig.runner.ship_heading - 11.0).abs() < 1e-9);

        rig.runner.heading_source = HeadingSource::GpsVehicle;
        assert!(rig.runner.update_ship_heading());
        assert!((rig.runner.ship_heading - 12.0).abs() < 1e-9);
    }

    #[test]
    fn umtwr_frame_layout() {
        let mut rig = rig(false);
        rig.runner.gps.inject_snapshot(warm_gps_snapshot());
        rig.runner.ship_heading = 10.0;
        rig.runner.sun_azimuth = 234.5;
        rig.runner.sun_elevation = 59.0;
        rig.runner.indexing_table.inject_state(TableState {
            position: 89.51,
            stalled: false,
            alive: true,
            packet_received: monotonic(),
        });

        let (frame, _ts) = rig.runner.make_umtwr_frame();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.ends_with("\r\n"));
        let fields: Vec<&str> = text.trim_end().split(',').collect();
        assert_eq!(fields[0], "UMTWR");
        // sas_hdg = (10 - 0 + 89.51) % 360
        assert_eq!(fields[1], "99.51");
        assert_eq!(fields[2], "10.00");
        assert_eq!(fields[3], "0.50");
        assert_eq!(fields[4], "11.0");
        assert_eq!(fields[5], "1.5");
        assert_eq!(fields[6], "89.51");
        assert_eq!(fields[7], "O");
        assert_eq!(fields[8], "234.5");
        assert_eq!(fields[9], "59.0");
    }

    #[test]
    fn umtwr_frame_with_nothing_fresh() {
        let mut rig = rig(false);
        let (frame, _ts) = rig.runner.make_umtwr_frame();
        let text = String::from_utf8(frame).unwrap();
        assert_eq!(text, "UMTWR,nan,nan,nan,nan,nan,nan,N,nan,nan\r\n");
    }

    #[test]
    fn sas_heading_stays_in_heading_range() {
        let mut rig = rig(false);
        rig.runner.gps.inject_snapshot(warm_gps_snapshot());
        for (ship, pos) in [(-170.0, 150.0), (10.0, -20.0), (179.0, 179.0)] {
            rig.runner.ship_heading = ship;
            rig.runner.indexing_table.inject_state(TableState {
                position: pos,
                stalled: false,
                alive: true,
                packet_received: monotonic(),
            });
            let (frame, _) = rig.runner.make_umtwr_frame();
            let text = String::from_utf8(frame).unwrap();
            let sas: f64 = text.split(',').nth(1).unwrap().parse().unwrap();
            assert!((0.0..360.0).contains(&sas), "sas {sas}");
        }
    }

    #[test]
    fn sleep_debounce_and_forced_sleep() {
        let mut rig1 = rig(false);
        rig1.runner.asleep = false;

        // Condition must persist before instruments stop.
        rig1.runner.go_to_sleep(false);
        assert!(!rig1.runner.asleep());
        assert!(rig1.runner.start_sleep_timestamp.is_some());

        // Not yet past the delay.
        rig1.runner.go_to_sleep(false);
        assert!(!rig1.runner.asleep());

        // Once the condition has held long enough, sleep happens.
        rig1.runner.asleep_delay = 0.0;
        std::thread::sleep(Duration::from_millis(20));
        rig1.runner.go_to_sleep(false);
        assert!(rig1.runner.asleep());
        assert_eq!(rig1.runner.state(), RunnerState::Asleep);

        // Forced sleep is immediate.
        let mut rig2 = rig(false);
        rig2.runner.asleep = false;
        rig2.runner.go_to_sleep(true);
        assert!(rig2.runner.asleep());
    }

    #[test]
    fn wakeup_debounce_and_forced_wake() {
        let mut rig = rig(true);
        assert!(rig.runner.asleep());

        rig.runner.wakeup(false);
        assert!(rig.runner.asleep());
        assert!(rig.runner.stop_sleep_timestamp.is_some());

        rig.runner.wakeup_delay = 0.0;
        std::thread::sleep(Duration::from_millis(20));
        rig.runner.wakeup(false);
        assert!(!rig.runner.asleep());
        // Instruments came up: the radiometer has a calibration and a
        // virtual port, so it must be measuring now.
        assert!(rig.runner.hypersas.alive());
        assert!(rig.runner.gps.logging());
        rig.runner.stop_app();
    }

    #[test]
    fn auto_tick_steers_and_emits_telemetry() {
        let mut rig = rig(true);
        rig.runner.gps.inject_snapshot(warm_gps_snapshot());
        rig.runner.pilot.set_tower_limits([45.0, 135.0]);

        let alive = AtomicBool::new(true);
        let mut flags = TickFlags::default();
        // First iteration forces the wakeup debounce.
        rig.runner
            .auto_tick(&alive, &mut flags, true)
            .expect("tick");
        assert!(!rig.runner.asleep());
        assert_eq!(rig.runner.state(), RunnerState::Awake);

        // The mock drive never answers: the position read is NaN, so no
        // motion is commanded this tick, but the table is powered.
        let sent = rig.runner.indexing_table.state();
        assert!(sent.alive);
        assert!(sent.position.is_nan());

        // The merged log received the telemetry frame.
        rig.runner.data_logger.sync();
        let merged: Vec<_> = std::fs::read_dir(rig.log_dir.path().join("merged"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(merged.len(), 1);
        let raw = std::fs::read(&merged[0]).unwrap();
        assert!(String::from_utf8_lossy(&raw).contains("UMTWR"));
        rig.runner.stop_app();
    }

    #[test]
    fn auto_tick_without_gps_waits() {
        let mut rig = rig(false);
        let alive = AtomicBool::new(true);
        let mut flags = TickFlags::default();
        rig.runner
            .auto_tick(&alive, &mut flags, true)
            .expect("tick");
        assert_eq!(rig.runner.state(), RunnerState::AwaitGps);
        assert!(flags.sun_pos, "condition logged once");
    }

    #[test]
    fn manual_mode_disables_gps_logging_when_idle() {
        let mut rig = rig(false);
        rig.runner.gps.start_logging();
        rig.runner.manual_tick().unwrap();
        // Radiometer is not measuring: logging must be off.
        assert!(!rig.runner.gps.logging());
    }

    #[test]
    fn supervisor_start_stop_round_trip() {
        let mut rig = rig(false);
        rig.runner.refresh_delay = 1.0;
        let cfg = sample_config();
        let mut supervisor = Supervisor::new(rig.runner, &cfg);
        supervisor.start();
        assert!(supervisor.running());
        std::thread::sleep(Duration::from_millis(100));
        supervisor.stop();
        assert!(!supervisor.running());
        assert!(supervisor.runner().is_some());
        supervisor.halt();
    }

    #[test]
    fn sundown_scenario_puts_system_to_sleep() {
        // Night-time GPS fix: elevation below zero; with a forced first
        // iteration the system goes straight to sleep.
        let mut rig = rig(true);
        let mut snap = warm_gps_snapshot();
        snap.datetime = Some(Utc.with_ymd_and_hms(2024, 6, 11, 1, 23, 11).unwrap());
        rig.runner.gps.inject_snapshot(snap);
        rig.runner.asleep = false;
        rig.runner.asleep_interrupt = 0.05;

        let alive = AtomicBool::new(true);
        let mut flags = TickFlags::default();
        let flow = rig.runner.auto_tick(&alive, &mut flags, true).unwrap();
        assert!(rig.runner.asleep());
        assert_eq!(rig.runner.state(), RunnerState::Asleep);
        assert!(!rig.runner.hypersas.alive());
        assert!(!rig.runner.indexing_table.alive());
        assert!(matches!(flow, TickFlow::AlreadyWaited));
    }
}
