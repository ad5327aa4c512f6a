use std::time::Instant;

use fugit::NanosDurationU64;
use log::{debug, warn};

use super::PowerSupply;
use crate::{
    bus::BusSession,
    codec::{Num, ScpiBus, decode_hex_register, parse_flag, split_fields},
    error::{Error, Result},
    identity::{Capabilities, DeviceIdentity},
    logging::PollingSession,
    register::{
        CurrentDetector, DisplayState, OutputCompensation, SenseMode, StatusFlags, WindowType,
    },
    types::{
        AcquireDetails, Channel, InstrumentState, LoggerDatapoint, MeasArray, OutputState,
        ProgramDetails, Setpoints, as_secs,
    },
};

/// Trigger count of a polled logging run.
const LOG_TRIGGER_COUNT: u32 = 4096;

/// Trigger period used when logging "as fast as possible".
const FASTEST_TRIGGER_S: f64 = 15.6e-6;

/// Integration time in power line cycles for a logging interval.
///
/// Limited to what the SMU accepts, and whole cycles above one so mains hum averages out.
fn logging_nplc(interval_s: f64, line_freq: f64) -> f64 {
    let nplc = interval_s * line_freq;
    if nplc < 4e-4 {
        4e-4
    } else if nplc > 100.0 {
        100.0
    } else if nplc > 1.0 {
        nplc.floor()
    } else {
        nplc
    }
}

/// Driver for the Keysight B2961/B2962 source/measure units.
///
/// Each measurement is a single triggered reading; there is no sweep buffer or datalog, so
/// waveform capture, detector and window selection aren't available.
pub struct SimpleSupply<S: BusSession> {
    bus: ScpiBus<S>,
    identity: DeviceIdentity,
    caps: Capabilities,
    /// Mains frequency, for NPLC.
    line_freq: f64,
    logging: Option<PollingSession>,
    /// Outputs as they were before the last measurement setup switched them on.
    saved_output: Option<OutputState>,
}

impl<S: BusSession> SimpleSupply<S> {
    /// Bring a freshly identified SMU into a known state.
    pub fn new(bus: ScpiBus<S>, identity: DeviceIdentity) -> Result<Self, S::Error> {
        let caps = identity.model.capabilities();
        let mut psu = Self {
            bus,
            identity,
            caps,
            line_freq: 0.0,
            logging: None,
            saved_output: None,
        };
        psu.bus.write_line("STATUS:PRESET")?;
        psu.bus.write_line("*CLS")?;
        psu.bus.write_line("ABOR:ALL")?;
        psu.bus.drain_errors()?;
        for cmd in [
            ":FORMat:BORDer NORMAL",
            ":SENS:CURR:NPLC 0.1",
            ":SENS:VOLT:NPLC 0.1",
            ":DISP:ENAB ON",
            ":DISP:VIEW DUAL",
        ] {
            psu.bus.write_line(cmd)?;
        }
        psu.line_freq = psu.bus.query_number(":SYST:LFR?")?;
        debug!("line frequency {} Hz", psu.line_freq);
        Ok(psu)
    }

    fn query_flag(&mut self, cmd: &str) -> Result<bool, S::Error> {
        Ok(parse_flag(&self.bus.query(cmd)?))
    }

    fn query_hex(&mut self, cmd: &str) -> Result<u32, S::Error> {
        Ok(decode_hex_register(&self.bus.query(cmd)?))
    }

    /// Arm, then read current and voltage of one channel.
    fn measure_channel(&mut self, n: u8) -> Result<(f64, f64), S::Error> {
        self.bus.write_line(&format!(":ARM:ACQ (@{n})"))?;
        let i = self.bus.query_number(&format!(":MEAS:CURR? (@{n})"))?;
        let v = self.bus.query_number(&format!(":MEAS:VOLT? (@{n})"))?;
        Ok((v, i))
    }

    fn read_flags(&mut self) -> Result<StatusFlags, S::Error> {
        let volt = self.bus.query_register(":STAT:QUES:VOLT:COND?")?;
        let curr = self.bus.query_register(":STAT:QUES:CURR:COND?")?;
        let cal = self.bus.query_register(":STAT:QUES:CAL:COND?")?;
        let temp = self.bus.query_register(":STAT:QUES:TEMP:COND?")?;
        Ok(StatusFlags::from_conditions(volt, curr, cal, temp))
    }

    /// Measuring switches outputs on; remember how they were.
    fn save_output_state(&mut self) -> Result<(), S::Error> {
        self.saved_output = Some(self.output_state()?);
        Ok(())
    }
}

impl<S: BusSession> PowerSupply for SimpleSupply<S> {
    type BusError = S::Error;

    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn reset(&mut self) -> Result<(), S::Error> {
        for cmd in ["*RST", "*CLS", "STAT:PRES", "*SRE 0", "*ESE 0"] {
            self.bus.write_line(cmd)?;
        }
        Ok(())
    }

    fn set_ocp(&mut self, enabled: bool) -> Result<(), S::Error> {
        self.bus
            .write_line(&format!(":OUT:PROT:STAT {}", u8::from(enabled)))
    }

    fn set_ovp(&mut self, level: Option<f64>) -> Result<(), S::Error> {
        let level = match level {
            Some(level) => Num(level).to_string(),
            None => "DEF".to_string(),
        };
        self.bus.write_line(&format!(":SENS:VOLT:PROT {level}"))?;
        if self.caps.has_output2 {
            self.bus.write_line(&format!(":SENS2:VOLT:PROT {level}"))?;
        }
        Ok(())
    }

    /// Only high capacitance mode can be selected.
    fn set_output_compensation(&mut self, comp: OutputCompensation) -> Result<(), S::Error> {
        if comp != OutputCompensation::HighCap {
            warn!("{} compensation not supported, ignored", comp.as_ref());
            return Ok(());
        }
        self.bus.write_line(":OUT:HCAP 1")?;
        if self.caps.has_output2 {
            self.bus.write_line(":OUT2:HCAP 1")?;
        }
        Ok(())
    }

    fn set_current_detector(&mut self, detector: CurrentDetector) -> Result<(), S::Error> {
        warn!("current detector {} not supported, ignored", detector.as_ref());
        Ok(())
    }

    fn clear_protection(&mut self) -> Result<(), S::Error> {
        warn!("protection clear not supported, ignored");
        Ok(())
    }

    fn set_current_range(&mut self, range: f64) -> Result<(), S::Error> {
        if !self.caps.supports_range(range) {
            return Err(Error::InvalidRange);
        }
        self.bus.write_line(":SOUR:CURR:RANG:AUTO OFF")?;
        self.bus
            .write_line(&format!(":SOUR:CURR:RANG {}", Num(range)))?;
        if self.caps.has_output2 {
            self.bus.write_line(":SOUR2:CURR:RANG:AUTO OFF")?;
            self.bus
                .write_line(&format!(":SOUR2:CURR:RANG {}", Num(range)))?;
        }
        Ok(())
    }

    /// Programs a fixed voltage source with `current` as its compliance.
    fn set_iv(&mut self, channel: u8, voltage: f64, current: f64) -> Result<(), S::Error> {
        self.bus.write_line(":SOUR:VOLT:MODE FIX")?;
        self.bus.write_line(":SOUR:FUNC:MODE VOLT")?;
        self.bus
            .write_line(&format!(":SENS{channel}:CURR:PROT {}", Num(current)))?;
        self.bus
            .write_line(&format!(":SOUR{channel}:VOLT {}", Num(voltage)))
    }

    fn enable_output(&mut self, channel: Channel, enabled: bool) -> Result<(), S::Error> {
        let cmds: &[&str] = match (channel, enabled) {
            (Channel::One, true) => &[":OUTP ON"],
            (Channel::Two, true) => &[":OUTP2 ON"],
            (Channel::Both, true) => &[":OUTP ON", ":OUTP2 ON"],
            (Channel::One, false) => &[":OUTP1 OFF"],
            (Channel::Two, false) => &[":OUTP2 OFF"],
            (Channel::Both, false) => &[":OUTP OFF", ":OUTP2 OFF"],
        };
        for cmd in cmds {
            self.bus.write_line(cmd)?;
        }
        Ok(())
    }

    fn set_display_state(&mut self, state: DisplayState) -> Result<(), S::Error> {
        self.bus
            .write_line(&format!(":DISP:ENAB {}", state.as_ref()))
    }

    fn set_display_text(&mut self, text: &str) -> Result<(), S::Error> {
        self.bus.write_line(":DISP:TEXT:STAT 1")?;
        let text = text.replace('"', "");
        self.bus.write_line(&format!(":DISP:TEXT:DATA \"{text}\""))
    }

    fn clear_display_text(&mut self) -> Result<(), S::Error> {
        self.bus.write_line(":DISP:TEXT:STAT 0")?;
        self.bus.write_line(":DISP:TEXT:DATA \"\"")
    }

    fn set_measure_window(&mut self, window: WindowType) -> Result<(), S::Error> {
        warn!("measurement window {} not supported, ignored", window.as_ref());
        Ok(())
    }

    fn read_state(&mut self) -> Result<InstrumentState, S::Error> {
        let started = Instant::now();
        let mut state = InstrumentState {
            output_enabled1: self.query_flag(":OUTP:STAT?")?,
            ..Default::default()
        };
        if self.caps.has_output2 {
            state.output_enabled2 = self.query_flag(":OUTP2:STAT?")?;
        }

        for cmd in [
            ":SENS:FUNC \"CURR\",\"VOLT\"",
            ":SENS:NPLC 1",
            ":TRIG:SOUR TIM",
            ":TRIG:TIM 46.8e-6",
            ":TRIG:COUN 1",
        ] {
            self.bus.write_line(cmd)?;
        }

        // A measurement would switch a disabled output on.
        if state.output_enabled1 {
            let (v, i) = self.measure_channel(1)?;
            state.v = Some(v);
            state.i = Some(i);
        }
        if self.caps.has_output2 {
            self.bus.write_line(":SENS2:NPLC 1")?;
            if state.output_enabled2 {
                let (v, i) = self.measure_channel(2)?;
                state.v2 = Some(v);
                state.i2 = Some(i);
            }
        }

        state.flags = self.read_flags()?;
        state.ovp = state.flags.ovp;
        state.ocp = state.flags.ocp;
        state.current_range = self.bus.query_number(":SOUR:CURR:RANG?")?;
        state.duration = started.elapsed();
        Ok(state)
    }

    fn read_program_details(&mut self) -> Result<ProgramDetails, S::Error> {
        let output = self.output_state()?;
        let [v1, i1] = self.bus.query_array(":SOUR:VOLT?; :SOUR:CURR?")?;
        let [v2, i2] = if self.caps.has_output2 {
            self.bus.query_array(":SOUR2:VOLT?; :SOUR2:CURR?")?
        } else {
            [0.0; 2]
        };

        // Channel 1 bit only; needs checking with channel 2 tripped.
        let ocp = self.query_hex(":STAT:QUES:CURR:COND?")? & 0x1 != 0;
        let ovp = self.query_hex(":STAT:QUES:VOLT:COND?")? & 0x1 != 0;
        let ovp_level = self.bus.query_number(":SENS:VOLT:PROT?")?;

        let [max_v1, max_i1] = self.bus.query_array(":SOUR:VOLT? MAX;:SOUR:CURR? MAX")?;
        let [max_v2, max_i2] = if self.caps.has_output2 {
            self.bus.query_array(":SOUR2:VOLT? MAX;:SOUR2:CURR? MAX")?
        } else {
            [0.0; 2]
        };
        let current_range = self.bus.query_number(":SOUR:CURR:RANGE?")?;

        Ok(ProgramDetails {
            program: Setpoints {
                enabled1: output.ch1,
                enabled2: output.ch2,
                ocp,
                ovp,
                ovp_level,
                v1,
                i1,
                v2,
                i2,
            },
            capabilities: self.caps,
            identity: self.identity.raw.clone(),
            max_v1,
            max_i1,
            max_v2,
            max_i2,
            current_range,
            detector: CurrentDetector::Dc,
        })
    }

    fn output_state(&mut self) -> Result<OutputState, S::Error> {
        if !self.caps.has_output2 {
            let ch1 = self.query_flag(":OUTP:STAT?")?;
            return Ok(OutputState { ch1, ch2: false });
        }
        let response = self.bus.query(":OUTP:STAT?;:OUTP2:STAT?")?;
        let mut fields = split_fields(&response).map(parse_flag);
        Ok(OutputState {
            ch1: fields.next().unwrap_or(false),
            ch2: fields.next().unwrap_or(false),
        })
    }

    fn restore_output_state(&mut self, channel: Channel) -> Result<(), S::Error> {
        let Some(before) = self.saved_output else {
            debug!("no output state saved, nothing to restore");
            return Ok(());
        };
        if channel.includes(1) && !before.ch1 {
            self.enable_output(Channel::One, false)?;
        }
        if self.caps.has_output2 && channel.includes(2) && !before.ch2 {
            self.enable_output(Channel::Two, false)?;
        }
        Ok(())
    }

    fn system_error(&mut self) -> Result<String, S::Error> {
        self.bus.query("SYST:ERR?")
    }

    fn abort_measurement(&mut self) -> Result<(), S::Error> {
        self.bus.query("ABORT;*OPC?")?;
        Ok(())
    }

    fn setup_logging(
        &mut self,
        channel: Channel,
        mode: SenseMode,
        interval: NanosDurationU64,
    ) -> Result<(), S::Error> {
        if mode == SenseMode::Dvm {
            return Err(Error::Unsupported("DVM sensing"));
        }
        self.save_output_state()?;

        let n = channel.number();
        let m = mode.as_ref();
        let interval = as_secs(interval);
        let trigger = if interval == 0.0 {
            FASTEST_TRIGGER_S
        } else {
            interval
        };
        let nplc = logging_nplc(interval, self.line_freq);

        self.bus.write_line(&format!(":SENS:FUNC \"{m}\""))?;
        self.bus.write_line(&format!(":SENS:{m}:NPLC:AUTO 0"))?;
        self.bus
            .write_line(&format!(":SENS:{m}:NPLC {}", Num(nplc)))?;
        self.bus.write_line(&format!(":TRIG{n}:SOUR TIM"))?;
        self.bus
            .write_line(&format!(":TRIG{n}:TIM {}", Num(trigger)))?;
        self.bus
            .write_line(&format!(":TRIG{n}:COUN {LOG_TRIGGER_COUNT}"))?;
        self.bus.write_line(&format!(":ARM:ACQ (@{n})"))?;

        self.logging = Some(PollingSession::start());
        self.bus.query("*OPC?")?;
        Ok(())
    }

    fn measure_logging_point(
        &mut self,
        channel: Channel,
        mode: SenseMode,
    ) -> Result<Vec<LoggerDatapoint>, S::Error> {
        let clock = self
            .logging
            .ok_or(Error::Unsupported("logging without setup"))?;
        if mode == SenseMode::Dvm {
            return Err(Error::Unsupported("DVM sensing"));
        }
        let value = self.bus.query_number(&format!(
            ":MEAS:{}? (@{})",
            mode.as_ref(),
            channel.number()
        ))?;
        Ok(vec![LoggerDatapoint::single(value, clock.elapsed())])
    }

    fn stop_logging(&mut self) -> Result<(), S::Error> {
        self.logging = None;
        self.abort_measurement()
    }

    fn start_transient(
        &mut self,
        details: &AcquireDetails,
        _trigger_count: u32,
    ) -> Result<(), S::Error> {
        warn!(
            "waveform capture not supported, {} points of {} skipped",
            details.num_points,
            details.sense_mode.as_ref()
        );
        self.save_output_state()
    }

    /// Nothing is ever armed, so there is nothing to wait for.
    fn is_measurement_finished(&mut self) -> Result<bool, S::Error> {
        Ok(true)
    }

    fn finish_transient(
        &mut self,
        details: &AcquireDetails,
        _trigger_count: u32,
    ) -> Result<MeasArray, S::Error> {
        Ok(MeasArray {
            mode: details.sense_mode,
            ..Default::default()
        })
    }

    fn peek_firmware(&mut self, _address: u16) -> Result<Option<[u32; 4]>, S::Error> {
        warn!("firmware readout not supported");
        Ok(None)
    }
}
