//! GPIO power relay for instrument supplies.
//!
//! Relays are wired active-low. On hosts without a GPIO character device
//! (development machines) the relay degrades to a software mock so the rest
//! of the stack keeps working.

use tracing::warn;

/// One uniquely-owned relay pin.
pub struct Relay {
    inner: RelayInner,
    on: bool,
}

enum RelayInner {
    Gpio(rppal::gpio::OutputPin),
    Mock,
    Disabled,
}

impl Relay {
    /// Claim `pin`, initially off. `None` disables power switching for the
    /// device (always considered powered).
    pub fn new(pin: Option<u8>) -> Relay {
        let inner = match pin {
            None => RelayInner::Disabled,
            Some(pin) => match rppal::gpio::Gpio::new().and_then(|g| g.get(pin)) {
                // Active-low: high means off.
                Ok(p) => RelayInner::Gpio(p.into_output_high()),
                Err(e) => {
                    warn!("no GPIO available ({e}), loading relay mock");
                    RelayInner::Mock
                }
            },
        };
        Relay { inner, on: false }
    }

    pub fn on(&mut self) {
        if let RelayInner::Gpio(pin) = &mut self.inner {
            pin.set_low();
        }
        self.on = true;
    }

    pub fn off(&mut self) {
        if let RelayInner::Gpio(pin) = &mut self.inner {
            pin.set_high();
        }
        self.on = false;
    }

    pub fn is_on(&self) -> bool {
        matches!(self.inner, RelayInner::Disabled) || self.on
    }
}
