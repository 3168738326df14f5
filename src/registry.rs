//! Serial port registry.
//!
//! Every physical port is owned by exactly one [`SharedPort`] for the
//! process lifetime; a second acquisition of the same device path returns a
//! clone of the same handle, never a second owner. Device drivers go
//! through the registry so two devices can never collide on one wire.
//!
//! The I/O object behind a port is boxed behind the [`SerialIo`] trait so
//! tests can install in-memory endpoints.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, SasError};

/// Byte-level operations a device driver needs from its port.
pub trait SerialIo: Send {
    /// Blocking read honoring the configured timeout; `Ok(0)` on timeout.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drain whatever is already waiting without blocking.
    fn read_available(&mut self) -> Result<Vec<u8>>;

    fn write_all_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Discard pending input.
    fn clear_input(&mut self) -> Result<()> {
        self.read_available().map(|_| ())
    }
}

/// Line settings for opening a physical port.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: char,
    pub stop_bits: f64,
    pub timeout: Duration,
    pub xonxoff: bool,
    pub rtscts: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: 'N',
            stop_bits: 1.0,
            timeout: Duration::from_secs(10),
            xonxoff: false,
            rtscts: false,
        }
    }
}

struct PhysicalPort(Box<dyn serialport::SerialPort>);

impl SerialIo for PhysicalPort {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.0.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let waiting = self.0.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; waiting];
        self.0.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_all_bytes(&mut self, data: &[u8]) -> Result<()> {
        use std::io::Write;
        self.0.write_all(data)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.0.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

fn open_physical(name: &str, settings: &SerialSettings) -> Result<Box<dyn SerialIo>> {
    let data_bits = match settings.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let parity = match settings.parity.to_ascii_uppercase() {
        'E' => serialport::Parity::Even,
        'O' => serialport::Parity::Odd,
        _ => serialport::Parity::None,
    };
    let stop_bits = if settings.stop_bits >= 2.0 {
        serialport::StopBits::Two
    } else {
        serialport::StopBits::One
    };
    let flow = if settings.rtscts {
        serialport::FlowControl::Hardware
    } else if settings.xonxoff {
        serialport::FlowControl::Software
    } else {
        serialport::FlowControl::None
    };
    let port = serialport::new(name, settings.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow)
        .timeout(settings.timeout)
        .open()?;
    Ok(Box::new(PhysicalPort(port)))
}

type VirtualOpener = Box<dyn FnMut() -> Box<dyn SerialIo> + Send>;

enum PortBackend {
    Physical(SerialSettings),
    Virtual(VirtualOpener),
}

struct PortCell {
    name: String,
    backend: Mutex<PortBackend>,
    io: Mutex<Option<Box<dyn SerialIo>>>,
    /// Set when `close` could not take the I/O lock; the holder closes on
    /// release instead.
    pending_close: AtomicBool,
}

/// Process-wide unique owner of one serial device path.
#[derive(Clone)]
pub struct SharedPort(Arc<PortCell>);

impl SharedPort {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Same underlying owner (identity, not configuration).
    pub fn same_port(&self, other: &SharedPort) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_open(&self) -> bool {
        self.0
            .io
            .lock()
            .map(|io| io.is_some())
            .unwrap_or(false)
    }

    /// Open the port if it is not already open.
    pub fn open(&self) -> Result<()> {
        let mut io = self.0.io.lock().expect("port lock poisoned");
        if io.is_some() {
            return Ok(());
        }
        let mut backend = self.0.backend.lock().expect("port lock poisoned");
        *io = Some(match &mut *backend {
            PortBackend::Physical(settings) => open_physical(&self.0.name, settings)?,
            PortBackend::Virtual(opener) => opener(),
        });
        self.0.pending_close.store(false, Ordering::SeqCst);
        debug!("opened serial port {}", self.0.name);
        Ok(())
    }

    /// Close the port. Never blocks on an in-flight read: if the I/O lock
    /// is held the close is deferred to the holder.
    pub fn close(&self) {
        match self.0.io.try_lock() {
            Ok(mut io) => {
                if io.take().is_some() {
                    debug!("closed serial port {}", self.0.name);
                }
            }
            Err(_) => {
                warn!(
                    "serial port {} busy, close deferred to reader",
                    self.0.name
                );
                self.0.pending_close.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Run `f` against the open port.
    pub fn with_io<R>(&self, f: impl FnOnce(&mut dyn SerialIo) -> Result<R>) -> Result<R> {
        let mut guard = self.0.io.lock().expect("port lock poisoned");
        let result = match guard.as_mut() {
            Some(io) => f(io.as_mut()),
            None => Err(SasError::NotRunning),
        };
        if self.0.pending_close.swap(false, Ordering::SeqCst) {
            guard.take();
            debug!("closed serial port {} (deferred)", self.0.name);
        }
        result
    }
}

/// Registry mapping device paths to their unique owners.
#[derive(Default)]
pub struct SerialRegistry {
    ports: Mutex<HashMap<String, SharedPort>>,
}

impl SerialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the owner of `name`. The first acquisition fixes the line
    /// settings; later acquisitions return the same owner unchanged.
    pub fn acquire(&self, name: &str, settings: SerialSettings) -> SharedPort {
        let mut ports = self.ports.lock().expect("registry lock poisoned");
        if let Some(existing) = ports.get(name) {
            debug!("serial port {name} already registered, reusing owner");
            return existing.clone();
        }
        let port = SharedPort(Arc::new(PortCell {
            name: name.to_string(),
            backend: Mutex::new(PortBackend::Physical(settings)),
            io: Mutex::new(None),
            pending_close: AtomicBool::new(false),
        }));
        ports.insert(name.to_string(), port.clone());
        port
    }

    /// Register an in-memory port; `opener` is invoked on every open so a
    /// restart gets a fresh endpoint.
    pub fn acquire_virtual(
        &self,
        name: &str,
        opener: impl FnMut() -> Box<dyn SerialIo> + Send + 'static,
    ) -> SharedPort {
        let mut ports = self.ports.lock().expect("registry lock poisoned");
        if let Some(existing) = ports.get(name) {
            return existing.clone();
        }
        let port = SharedPort(Arc::new(PortCell {
            name: name.to_string(),
            backend: Mutex::new(PortBackend::Virtual(Box::new(opener))),
            io: Mutex::new(None),
            pending_close: AtomicBool::new(false),
        }));
        ports.insert(name.to_string(), port.clone());
        port
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Shared state of an in-memory serial endpoint.
    #[derive(Default)]
    pub struct MockWires {
        pub to_device: Vec<u8>,
        pub from_device: VecDeque<u8>,
    }

    impl MockWires {
        /// Queue bytes the device "sends" to the host.
        pub fn push_rx(&mut self, data: &[u8]) {
            self.from_device.extend(data.iter().copied());
        }
    }

    #[derive(Clone, Default)]
    pub struct MockPort(pub Arc<Mutex<MockWires>>);

    impl MockPort {
        pub fn endpoint(&self) -> Box<dyn SerialIo> {
            Box::new(MockEndpoint(self.0.clone()))
        }

        pub fn written(&self) -> Vec<u8> {
            self.0.lock().unwrap().to_device.clone()
        }

        pub fn push_rx(&self, data: &[u8]) {
            self.0.lock().unwrap().push_rx(data);
        }
    }

    struct MockEndpoint(Arc<Mutex<MockWires>>);

    impl SerialIo for MockEndpoint {
        fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut wires = self.0.lock().unwrap();
            let n = wires.from_device.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = wires.from_device.pop_front().unwrap();
            }
            Ok(n)
        }

        fn read_available(&mut self) -> Result<Vec<u8>> {
            let mut wires = self.0.lock().unwrap();
            Ok(wires.from_device.drain(..).collect())
        }

        fn write_all_bytes(&mut self, data: &[u8]) -> Result<()> {
            self.0.lock().unwrap().to_device.extend_from_slice(data);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockPort;
    use super::*;

    #[test]
    fn one_owner_per_port() {
        let registry = SerialRegistry::new();
        let a = registry.acquire("/dev/ttyUSB0", SerialSettings::default());
        let b = registry.acquire(
            "/dev/ttyUSB0",
            SerialSettings {
                baud_rate: 115_200,
                ..SerialSettings::default()
            },
        );
        let c = registry.acquire("/dev/ttyUSB1", SerialSettings::default());
        assert!(a.same_port(&b));
        assert!(!a.same_port(&c));
    }

    #[test]
    fn virtual_port_round_trip() {
        let registry = SerialRegistry::new();
        let mock = MockPort::default();
        let wires = mock.clone();
        let port = registry.acquire_virtual("mock0", move || wires.endpoint());

        assert!(port.with_io(|_| Ok(())).is_err());
        port.open().unwrap();
        mock.push_rx(b"hello");
        let mut buf = [0u8; 16];
        let n = port
            .with_io(|io| io.read_some(&mut buf))
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        port.with_io(|io| io.write_all_bytes(b"cmd\r\n")).unwrap();
        assert_eq!(mock.written(), b"cmd\r\n");
        port.close();
        assert!(!port.is_open());
        // Reopen gets a fresh endpoint from the opener.
        port.open().unwrap();
        assert!(port.is_open());
    }

    #[test]
    fn reacquired_virtual_port_is_same_owner() {
        let registry = SerialRegistry::new();
        let m1 = MockPort::default();
        let m2 = MockPort::default();
        let w1 = m1.clone();
        let w2 = m2.clone();
        let a = registry.acquire_virtual("mock1", move || w1.endpoint());
        let b = registry.acquire_virtual("mock1", move || w2.endpoint());
        assert!(a.same_port(&b));
    }
}
