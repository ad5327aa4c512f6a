use std::time::SystemTime;

use fugit::NanosDurationU64;
use log::{debug, info, warn};

use super::{PowerSupply, SweepSupply};
use crate::{
    bus::BusSession,
    codec::{Num, parse_number, split_fields},
    config::DatalogSettings,
    error::{Error, Result},
    identity::{Capabilities, DeviceIdentity},
    logging::DatalogSession,
    register::{CurrentDetector, DisplayState, OutputCompensation, SenseMode, WindowType},
    types::{
        AcquireDetails, Channel, InstrumentState, LoggerDatapoint, MeasArray, OutputState,
        ProgramDetails, as_secs,
    },
};

/// A 663xx with firmware A.03 or later.
///
/// Everything but logging behaves exactly like [SweepSupply]. Logging runs on the supply's own
/// datalog ring buffer at a fixed period, and the host only drains it. See
/// [DatalogSession] for how timestamps survive the buffer overrunning.
pub struct DatalogSupply<S: BusSession> {
    sweep: SweepSupply<S>,
    settings: DatalogSettings,
    session: Option<DatalogSession>,
}

impl<S: BusSession> DatalogSupply<S> {
    pub fn new(sweep: SweepSupply<S>, settings: &DatalogSettings) -> Self {
        Self {
            sweep,
            settings: settings.clone(),
            session: None,
        }
    }

    /// Period of the running datalog, in seconds.
    pub fn period(&self) -> Option<f64> {
        self.session.as_ref().map(DatalogSession::period)
    }

    /// Abort and re-arm the datalog after an overrun.
    fn restart(&mut self) -> Result<(), S::Error> {
        let bus = &mut self.sweep.bus;
        bus.write_line("ABORT;*WAI")?;
        bus.query("*OPC?")?;
        bus.write_line("INIT:NAME DLOG")?;
        bus.write_line("TRIG:ACQ")
    }

    fn fetch_block(&mut self) -> Result<Vec<LoggerDatapoint>, S::Error> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Unsupported("logging without setup"));
        };
        self.sweep.bus.write_line("FETC:ARR:DLOG?")?;
        let sw = session.elapsed();
        let block = self.sweep.bus.read_binary_block()?;
        let outcome = session.ingest(sw, &block, SystemTime::now())?;

        if let Some(drift) = outcome.drift {
            debug!(
                "N={}, dt={:.6} s, rate={:.1} ppm",
                drift.marker, drift.seconds, drift.ppm
            );
        }
        if outcome.overrun {
            warn!("datalog buffer overrun, restarting");
            self.restart()?;
        }
        Ok(outcome.points)
    }
}

impl<S: BusSession> PowerSupply for DatalogSupply<S> {
    type BusError = S::Error;

    fn identity(&self) -> &DeviceIdentity {
        self.sweep.identity()
    }

    fn capabilities(&self) -> Capabilities {
        self.sweep.capabilities()
    }

    fn reset(&mut self) -> Result<(), S::Error> {
        self.sweep.reset()
    }

    fn set_ocp(&mut self, enabled: bool) -> Result<(), S::Error> {
        self.sweep.set_ocp(enabled)
    }

    fn set_ovp(&mut self, level: Option<f64>) -> Result<(), S::Error> {
        self.sweep.set_ovp(level)
    }

    fn set_output_compensation(&mut self, comp: OutputCompensation) -> Result<(), S::Error> {
        self.sweep.set_output_compensation(comp)
    }

    fn set_current_detector(&mut self, detector: CurrentDetector) -> Result<(), S::Error> {
        self.sweep.set_current_detector(detector)
    }

    fn clear_protection(&mut self) -> Result<(), S::Error> {
        self.sweep.clear_protection()
    }

    fn set_current_range(&mut self, range: f64) -> Result<(), S::Error> {
        self.sweep.set_current_range(range)
    }

    fn set_iv(&mut self, channel: u8, voltage: f64, current: f64) -> Result<(), S::Error> {
        self.sweep.set_iv(channel, voltage, current)
    }

    fn enable_output(&mut self, channel: Channel, enabled: bool) -> Result<(), S::Error> {
        self.sweep.enable_output(channel, enabled)
    }

    fn set_display_state(&mut self, state: DisplayState) -> Result<(), S::Error> {
        self.sweep.set_display_state(state)
    }

    fn set_display_text(&mut self, text: &str) -> Result<(), S::Error> {
        self.sweep.set_display_text(text)
    }

    fn clear_display_text(&mut self) -> Result<(), S::Error> {
        self.sweep.clear_display_text()
    }

    fn set_measure_window(&mut self, window: WindowType) -> Result<(), S::Error> {
        self.sweep.set_measure_window(window)
    }

    fn read_state(&mut self) -> Result<InstrumentState, S::Error> {
        self.sweep.read_state()
    }

    fn read_program_details(&mut self) -> Result<ProgramDetails, S::Error> {
        self.sweep.read_program_details()
    }

    fn output_state(&mut self) -> Result<OutputState, S::Error> {
        self.sweep.output_state()
    }

    fn restore_output_state(&mut self, channel: Channel) -> Result<(), S::Error> {
        self.sweep.restore_output_state(channel)
    }

    fn system_error(&mut self) -> Result<String, S::Error> {
        self.sweep.system_error()
    }

    fn abort_measurement(&mut self) -> Result<(), S::Error> {
        self.sweep.abort_measurement()
    }

    fn setup_logging(
        &mut self,
        channel: Channel,
        mode: SenseMode,
        interval: NanosDurationU64,
    ) -> Result<(), S::Error> {
        if !self.settings.enabled {
            return self.sweep.setup_logging(channel, mode, interval);
        }
        self.sweep.check_sense_mode(mode)?;
        // Each datalog run starts from scratch.
        self.session = None;

        let bus = &mut self.sweep.bus;
        let range = bus.query("SENS:CURR:RANG?")?;
        let detector = bus.query("SENSe:CURRent:DETector?")?;
        // Longer periods average too much to be useful.
        let interval = as_secs(interval).min(self.settings.max_interval_s);

        bus.write_line(&format!(
            "CONF:DLOG {},{range},{detector},{},{},IMM",
            mode.as_ref(),
            Num(interval),
            self.settings.buffer_points
        ))?;
        let readback = bus.query("CONF:DLOG?")?;
        let period = split_fields(&readback)
            .nth(3)
            .ok_or_else(|| Error::ProtocolViolation(format!("datalog config {readback:?}")))?;
        let period = parse_number(period)?;

        bus.write_line("INIT:NAME DLOG")?;
        bus.write_line("TRIG:ACQ")?;
        bus.query("*ESR?")?;

        info!("datalog running, one sample every {period} s");
        self.session = Some(DatalogSession::new(period));
        Ok(())
    }

    /// Drains the datalog buffer.
    ///
    /// A failed fetch yields no points rather than an error, so one bad block doesn't end a long
    /// logging run. A closed session still ends it.
    fn measure_logging_point(
        &mut self,
        channel: Channel,
        mode: SenseMode,
    ) -> Result<Vec<LoggerDatapoint>, S::Error> {
        if !self.settings.enabled {
            return self.sweep.measure_logging_point(channel, mode);
        }
        match self.fetch_block() {
            Ok(points) => Ok(points),
            Err(
                err @ (Error::Transport(_)
                | Error::Timeout
                | Error::Format(_)
                | Error::ProtocolViolation(_)),
            ) => {
                warn!("datalog fetch failed, no samples this cycle: {err}");
                self.sweep.bus.discard_input();
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn stop_logging(&mut self) -> Result<(), S::Error> {
        if !self.settings.enabled {
            return self.sweep.stop_logging();
        }
        if let Some(session) = self.session.take() {
            debug!(
                "datalog stopped after {} samples, {:.3} s lost to overruns",
                session.samples(),
                session.lost_time()
            );
        }
        self.sweep.abort_measurement()
    }

    fn start_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<(), S::Error> {
        self.sweep.start_transient(details, trigger_count)
    }

    fn is_measurement_finished(&mut self) -> Result<bool, S::Error> {
        self.sweep.is_measurement_finished()
    }

    fn finish_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<MeasArray, S::Error> {
        self.sweep.finish_transient(details, trigger_count)
    }

    fn peek_firmware(&mut self, address: u16) -> Result<Option<[u32; 4]>, S::Error> {
        self.sweep.peek_firmware(address)
    }
}
