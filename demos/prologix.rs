use std::{env, thread, time::Duration};

use crossbeam_channel::unbounded;
use fugit::NanosDurationU64;
use inquire::{CustomType, Select};
use log::info;
use scpi_bench_psu::{
    BusSession, Command, Conf, Event, Setpoints, Worker,
    register::{SenseMode, TriggerSlope},
    types::{AcquireDetailsBuilder, Channel},
};
use serialport::{ClearBuffer, SerialPort};
use simplelog::{ColorChoice, Config, LevelFilter, TerminalMode, TermLogger};

// The Prologix adapters ignore the baud rate, but the driver needs one.
const BAUD_RATE: u32 = 115200;
const DEFAULT_GPIB_ADDRESS: u8 = 5;
const LOG_SECONDS: u64 = 5;

/// A Prologix GPIB-USB adapter in controller mode.
///
/// The adapter is told to read back from the instrument only after query lines, so plain
/// commands don't leave the supply with an unterminated query.
pub struct PortWrapper {
    port: Box<dyn SerialPort>,
    line: Vec<u8>,
}

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl From<serialport::Error> for IoError {
    fn from(err: serialport::Error) -> Self {
        IoError(err.into())
    }
}

impl PortWrapper {
    fn open(port_name: &str, gpib_address: u8) -> Result<Self, IoError> {
        let port = serialport::new(port_name, BAUD_RATE)
            .timeout(Duration::from_secs(5))
            .open()?;
        let mut wrapper = Self {
            port,
            line: Vec::new(),
        };
        for setup in [
            "++mode 1".to_string(),
            format!("++addr {gpib_address}"),
            "++auto 0".to_string(),
            // Terminate with LF only, and assert EOI on the last byte.
            "++eos 2".to_string(),
            "++eoi 1".to_string(),
            "++read_tmo_ms 3000".to_string(),
        ] {
            wrapper.adapter(&setup)?;
        }
        Ok(wrapper)
    }

    fn adapter(&mut self, command: &str) -> Result<(), IoError> {
        std::io::Write::write_all(&mut self.port, command.as_bytes()).map_err(IoError)?;
        std::io::Write::write_all(&mut self.port, b"\n").map_err(IoError)
    }
}

impl embedded_io::ErrorType for PortWrapper {
    type Error = IoError;
}

impl embedded_io::Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.port, buf).map_err(IoError)
    }
}

impl embedded_io::Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let written = std::io::Write::write(&mut self.port, buf).map_err(IoError)?;
        for &byte in &buf[..written] {
            if byte == b'\n' {
                let query = self.line.contains(&b'?');
                self.line.clear();
                if query {
                    self.adapter("++read eoi")?;
                }
            } else {
                self.line.push(byte);
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.port).map_err(IoError)
    }
}

impl BusSession for PortWrapper {
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Self::Error> {
        self.port.set_timeout(timeout)?;
        self.adapter(&format!("++read_tmo_ms {}", timeout.as_millis().min(3000)))
    }

    fn clear(&mut self) -> Result<(), Self::Error> {
        self.adapter("++clr")?;
        self.line.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

fn print_events(rx: crossbeam_channel::Receiver<Event>) {
    for event in rx {
        match event {
            Event::NewState(state) => println!(
                "V={:?} I={:?} V2={:?} I2={:?} range={} A, flags {:?}",
                state.v, state.i, state.v2, state.i2, state.current_range, state.flags
            ),
            Event::LogPoints(points) => {
                for p in points {
                    println!("t={:.3} s mean={:.6} min={:.6} max={:.6}", p.t, p.mean, p.min, p.max);
                }
            }
            Event::DataAcquired(data) => println!(
                "{} segment(s) of {} samples, {} s apart",
                data.segments.len(),
                data.segments.first().map_or(0, Vec::len),
                data.time_interval
            ),
            Event::Done => break,
            other => println!("{other:?}"),
        }
    }
}

fn main() {
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    // Get serial port from command line arg or interactive selection
    let port_name = env::args().nth(1).unwrap_or_else(|| {
        let ports = serialport::available_ports().expect("Failed to enumerate serial ports");
        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }
        let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();
        Select::new("Select the Prologix adapter:", port_names)
            .prompt()
            .expect("Failed to select port")
    });
    let conf = match env::args().nth(2) {
        Some(path) => Conf::from_file(path),
        None => Conf::defaults(),
    }
    .expect("Bad configuration");

    let address = CustomType::<u8>::new("GPIB address of the supply:")
        .with_default(DEFAULT_GPIB_ADDRESS)
        .prompt()
        .expect("No address given");

    let port = PortWrapper::open(&port_name, address).expect("Failed to open serial port");
    info!("using {port_name}, GPIB address {address}");

    let (tx, rx) = unbounded();
    let printer = thread::spawn(move || print_events(rx));
    let worker = Worker::spawn_session(port, conf, tx);
    let requester = worker.requester();

    let actions = vec![
        "Program 5 V / 100 mA",
        "Outputs off",
        "Capture current",
        "Log current",
        "Query error queue",
        "Quit",
    ];
    loop {
        let Ok(action) = Select::new("What next?", actions.clone()).prompt() else {
            break;
        };
        let command = match action {
            "Program 5 V / 100 mA" => Command::Program(Setpoints {
                enabled1: true,
                v1: 5.0,
                i1: 0.1,
                ..Default::default()
            }),
            "Outputs off" => Command::Program(Setpoints::default()),
            "Capture current" => Command::Acquire(
                AcquireDetailsBuilder::new(SenseMode::Current, 4096, NanosDurationU64::micros(50))
                    .with_trigger(TriggerSlope::Immediate, 0.0, 0.0)
                    .build()
                    .unwrap(),
            ),
            "Log current" => {
                requester
                    .send(Command::Log {
                        channel: Channel::One,
                        mode: SenseMode::Current,
                        interval: NanosDurationU64::millis(100),
                    })
                    .unwrap();
                thread::sleep(Duration::from_secs(LOG_SECONDS));
                requester.stop_acquisition();
                continue;
            }
            "Query error queue" => Command::QuerySystemError,
            _ => break,
        };
        if requester.send(command).is_err() {
            break;
        }
    }

    worker.shutdown();
    printer.join().unwrap();
}
