//! Bench adapter: a desk setup with the target on a USB serial adapter, the
//! supply rail switched by one GPIO and an external pulse generator
//! triggered by another.

use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Instant;

use anyhow::Context as _;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::sysfs_gpio::{Direction, Pin};
use linux_embedded_hal::{Delay, Serial};

use crate::{FaultSource, Glitcher, InterruptMask, Options, PowerRail};

/// Target supply rail on a sysfs GPIO.
pub struct RailPin(Pin);

impl PowerRail for RailPin {
    fn set_supply(&mut self, on: bool) {
        self.0.set_value(on as u8).unwrap();
    }
}

/// Trigger line for an external fault-pulse generator, with wall-clock
/// nanoseconds standing in for the cycle counter.
pub struct PulsePin {
    pin: Pin,
    epoch: Instant,
}

impl FaultSource for PulsePin {
    fn fire(&mut self) {
        self.pin.set_value(1).unwrap();
        self.pin.set_value(0).unwrap();
    }

    fn now(&mut self) -> u32 {
        self.epoch.elapsed().as_nanos() as u32
    }
}

/// A hosted process cannot mask interrupts, so the critical section runs
/// unprotected and delay timing is best effort. The cycle-exact contract
/// only holds for MCU implementations of these traits.
pub struct HostMask;

impl InterruptMask for HostMask {
    fn with<T>(&mut self, f: impl FnOnce() -> T) -> T {
        f()
    }
}

impl Glitcher<Serial, Delay, RailPin, PulsePin, HostMask, IoErrorKind> {
    /// Create a bench glitcher from a serial device path and the two sysfs
    /// GPIO numbers.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        power_pin: u64,
        pulse_pin: u64,
        options: Options,
    ) -> anyhow::Result<Self> {
        // Open port
        let mut port = Serial::open(port.as_ref()).context("opening serial port")?;

        // 8E1: the ROM bootloader autobauds with even parity
        let mut settings = port.0.read_settings().context("reading serial settings")?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings
            .set_baud_rate(BaudRate::from_speed(baud))
            .context("setting baud rate")?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0
            .write_settings(&settings)
            .context("writing serial settings")?;

        let rail = Pin::new(power_pin);
        rail.export().context("exporting power rail pin")?;
        rail.set_direction(Direction::Low)
            .context("configuring power rail pin")?;

        let pulse = Pin::new(pulse_pin);
        pulse.export().context("exporting pulse trigger pin")?;
        pulse
            .set_direction(Direction::Low)
            .context("configuring pulse trigger pin")?;

        Ok(Self::new(
            port,
            Delay {},
            RailPin(rail),
            PulsePin {
                pin: pulse,
                epoch: Instant::now(),
            },
            HostMask,
            options,
        ))
    }
}
