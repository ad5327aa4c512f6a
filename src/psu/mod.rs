//! The supply drivers.
//!
//! [PowerSupply] is the one contract every supply is driven through. [Device] binds exactly one
//! driver per session, chosen from the `*IDN?` reply by [Device::attach] and never swapped.
//!
//! We generally use the nomenclature that "set" writes a configuration and "read" measures or
//! reads something back.

mod datalog;
mod simple;
mod sweep;

pub use datalog::DatalogSupply;
pub use simple::SimpleSupply;
pub use sweep::SweepSupply;

use fugit::NanosDurationU64;
use log::info;

use crate::{
    bus::BusSession,
    codec::ScpiBus,
    config::Conf,
    error::Result,
    identity::{Capabilities, DeviceIdentity, Variant},
    register::{CurrentDetector, DisplayState, OutputCompensation, SenseMode, WindowType},
    types::{
        AcquireDetails, Channel, InstrumentState, LoggerDatapoint, MeasArray, OutputState,
        ProgramDetails,
    },
};

/// Longest text the front panel displays.
pub const DISPLAY_TEXT_LEN: usize = 14;

/// Everything the worker and applications can ask of a supply.
///
/// Operations a model can't do either fail with
/// [`Error::Unsupported`](crate::error::Error::Unsupported) or, where skipping is harmless,
/// log a warning and do nothing.
pub trait PowerSupply {
    type BusError: embedded_io::Error;

    fn identity(&self) -> &DeviceIdentity;

    fn capabilities(&self) -> Capabilities;

    /// Factory defaults and a clean status system.
    fn reset(&mut self) -> Result<(), Self::BusError>;

    fn set_ocp(&mut self, enabled: bool) -> Result<(), Self::BusError>;

    /// Program the OVP level, or disable OVP with `None`.
    fn set_ovp(&mut self, level: Option<f64>) -> Result<(), Self::BusError>;

    fn set_output_compensation(&mut self, comp: OutputCompensation)
    -> Result<(), Self::BusError>;

    fn set_current_detector(&mut self, detector: CurrentDetector) -> Result<(), Self::BusError>;

    /// Re-arm outputs after a protection trip.
    fn clear_protection(&mut self) -> Result<(), Self::BusError>;

    /// Select a current range, one of [Capabilities::current_ranges].
    fn set_current_range(&mut self, range: f64) -> Result<(), Self::BusError>;

    /// Voltage and current setpoints of channel 1 or 2.
    fn set_iv(&mut self, channel: u8, voltage: f64, current: f64) -> Result<(), Self::BusError>;

    fn enable_output(&mut self, channel: Channel, enabled: bool) -> Result<(), Self::BusError>;

    fn set_display_state(&mut self, state: DisplayState) -> Result<(), Self::BusError>;

    fn set_display_text(&mut self, text: &str) -> Result<(), Self::BusError>;

    /// Back to the normal front panel readout.
    fn clear_display_text(&mut self) -> Result<(), Self::BusError>;

    fn set_measure_window(&mut self, window: WindowType) -> Result<(), Self::BusError>;

    fn read_state(&mut self) -> Result<InstrumentState, Self::BusError>;

    fn read_program_details(&mut self) -> Result<ProgramDetails, Self::BusError>;

    fn output_state(&mut self) -> Result<OutputState, Self::BusError>;

    /// Switch off again any output that was off before the last measurement setup.
    fn restore_output_state(&mut self, channel: Channel) -> Result<(), Self::BusError>;

    /// Oldest entry of the error queue, as the supply words it.
    fn system_error(&mut self) -> Result<String, Self::BusError>;

    fn abort_measurement(&mut self) -> Result<(), Self::BusError>;

    /// Start a logging run. Points are then fetched with [Self::measure_logging_point].
    fn setup_logging(
        &mut self,
        channel: Channel,
        mode: SenseMode,
        interval: NanosDurationU64,
    ) -> Result<(), Self::BusError>;

    /// Fetch whatever logged points are available. May be empty.
    fn measure_logging_point(
        &mut self,
        channel: Channel,
        mode: SenseMode,
    ) -> Result<Vec<LoggerDatapoint>, Self::BusError>;

    /// End the logging run and drop its session state.
    fn stop_logging(&mut self) -> Result<(), Self::BusError>;

    /// Arm a triggered acquisition of `trigger_count` segments.
    fn start_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<(), Self::BusError>;

    fn is_measurement_finished(&mut self) -> Result<bool, Self::BusError>;

    fn finish_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<MeasArray, Self::BusError>;

    /// Four 32-bit words of firmware memory from `address`, `None` if the supply can't do it.
    fn peek_firmware(&mut self, address: u16) -> Result<Option<[u32; 4]>, Self::BusError>;
}

/// The driver bound to a session.
pub enum Device<S: BusSession> {
    Simple(SimpleSupply<S>),
    Sweep(SweepSupply<S>),
    Datalog(DatalogSupply<S>),
}

impl<S: BusSession> Device<S> {
    /// Identify the supply on `session` and bring it into a known state.
    pub fn attach(session: S, conf: &Conf) -> Result<Self, S::Error> {
        let mut bus = ScpiBus::new(session);
        bus.clear()?;
        bus.set_timeout(conf.bus.timeout())?;
        let idn = bus.query("*IDN?")?;
        let identity = DeviceIdentity::parse(&idn)?;
        let variant = identity.variant();
        info!(
            "attached {} {} (firmware {}), {} driver",
            identity.manufacturer,
            identity.model.as_ref(),
            identity.firmware,
            variant.as_ref()
        );

        Ok(match variant {
            Variant::Simple => Device::Simple(SimpleSupply::new(bus, identity)?),
            Variant::Sweep => Device::Sweep(SweepSupply::new(bus, identity)?),
            Variant::Datalog => Device::Datalog(DatalogSupply::new(
                SweepSupply::new(bus, identity)?,
                &conf.datalog,
            )),
        })
    }

    pub fn variant(&self) -> Variant {
        match self {
            Device::Simple(_) => Variant::Simple,
            Device::Sweep(_) => Variant::Sweep,
            Device::Datalog(_) => Variant::Datalog,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $psu:ident => $call:expr) => {
        match $self {
            Device::Simple($psu) => $call,
            Device::Sweep($psu) => $call,
            Device::Datalog($psu) => $call,
        }
    };
}

impl<S: BusSession> PowerSupply for Device<S> {
    type BusError = S::Error;

    fn identity(&self) -> &DeviceIdentity {
        dispatch!(self, psu => psu.identity())
    }

    fn capabilities(&self) -> Capabilities {
        dispatch!(self, psu => psu.capabilities())
    }

    fn reset(&mut self) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.reset())
    }

    fn set_ocp(&mut self, enabled: bool) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_ocp(enabled))
    }

    fn set_ovp(&mut self, level: Option<f64>) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_ovp(level))
    }

    fn set_output_compensation(&mut self, comp: OutputCompensation) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_output_compensation(comp))
    }

    fn set_current_detector(&mut self, detector: CurrentDetector) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_current_detector(detector))
    }

    fn clear_protection(&mut self) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.clear_protection())
    }

    fn set_current_range(&mut self, range: f64) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_current_range(range))
    }

    fn set_iv(&mut self, channel: u8, voltage: f64, current: f64) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_iv(channel, voltage, current))
    }

    fn enable_output(&mut self, channel: Channel, enabled: bool) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.enable_output(channel, enabled))
    }

    fn set_display_state(&mut self, state: DisplayState) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_display_state(state))
    }

    fn set_display_text(&mut self, text: &str) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_display_text(text))
    }

    fn clear_display_text(&mut self) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.clear_display_text())
    }

    fn set_measure_window(&mut self, window: WindowType) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.set_measure_window(window))
    }

    fn read_state(&mut self) -> Result<InstrumentState, S::Error> {
        dispatch!(self, psu => psu.read_state())
    }

    fn read_program_details(&mut self) -> Result<ProgramDetails, S::Error> {
        dispatch!(self, psu => psu.read_program_details())
    }

    fn output_state(&mut self) -> Result<OutputState, S::Error> {
        dispatch!(self, psu => psu.output_state())
    }

    fn restore_output_state(&mut self, channel: Channel) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.restore_output_state(channel))
    }

    fn system_error(&mut self) -> Result<String, S::Error> {
        dispatch!(self, psu => psu.system_error())
    }

    fn abort_measurement(&mut self) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.abort_measurement())
    }

    fn setup_logging(
        &mut self,
        channel: Channel,
        mode: SenseMode,
        interval: NanosDurationU64,
    ) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.setup_logging(channel, mode, interval))
    }

    fn measure_logging_point(
        &mut self,
        channel: Channel,
        mode: SenseMode,
    ) -> Result<Vec<LoggerDatapoint>, S::Error> {
        dispatch!(self, psu => psu.measure_logging_point(channel, mode))
    }

    fn stop_logging(&mut self) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.stop_logging())
    }

    fn start_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<(), S::Error> {
        dispatch!(self, psu => psu.start_transient(details, trigger_count))
    }

    fn is_measurement_finished(&mut self) -> Result<bool, S::Error> {
        dispatch!(self, psu => psu.is_measurement_finished())
    }

    fn finish_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<MeasArray, S::Error> {
        dispatch!(self, psu => psu.finish_transient(details, trigger_count))
    }

    fn peek_firmware(&mut self, address: u16) -> Result<Option<[u32; 4]>, S::Error> {
        dispatch!(self, psu => psu.peek_firmware(address))
    }
}
