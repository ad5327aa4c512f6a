use core::str::FromStr;
use std::time::{Instant, SystemTime};

use fugit::NanosDurationU64;
use log::{debug, warn};

use super::PowerSupply;
use crate::{
    bus::BusSession,
    codec::{
        Num, ScpiBus, decode_hex_register, parse_flag, parse_number, parse_register, split_fields,
    },
    error::{Error, Result},
    identity::{Capabilities, DeviceIdentity},
    logging::PollingSession,
    register::{
        CurrentDetector, DisplayState, OperationStatus, OutputCompensation, QuestionableStatus,
        SenseMode, StatusFlags, WindowType,
    },
    types::{
        AcquireDetails, Channel, InstrumentState, LoggerDatapoint, MAX_SWEEP_POINTS, MeasArray,
        OutputState, ProgramDetails, Setpoints, as_secs,
    },
};

/// Readings taken for a DVM "transient".
const DVM_TRANSIENT_READINGS: usize = 128;

/// Sweep used while polling log points: the longest buffer at the fastest rate.
const LOG_SWEEP: &str = "SENSe:SWEEP:POINTS 4096; TINTerval 1.56e-05;OFFSET:POINTS 0";

/// Driver for the HP/Agilent 66309, 66311, 66319 and 66321 supplies.
///
/// Measurements run on the sweep digitizer: every reading is a buffer of samples reduced by the
/// supply, and triggered captures read the whole buffer back as a binary block.
pub struct SweepSupply<S: BusSession> {
    pub(super) bus: ScpiBus<S>,
    identity: DeviceIdentity,
    caps: Capabilities,
    logging: Option<PollingSession>,
}

impl<S: BusSession> SweepSupply<S> {
    /// Bring a freshly identified supply into a known state.
    pub fn new(bus: ScpiBus<S>, identity: DeviceIdentity) -> Result<Self, S::Error> {
        let caps = identity.model.capabilities();
        let mut psu = Self {
            bus,
            identity,
            caps,
            logging: None,
        };
        psu.bus.write_line("STATUS:PRESET")?;
        // Status enables must survive a power cycle for SRQ to keep working.
        if psu.bus.query_register("*PSC?")? == 0 {
            psu.bus.write_line("*PSC 1")?;
        }
        psu.bus.write_line("*CLS")?;
        psu.bus.write_line("ABORT")?;
        psu.bus.drain_errors()?;
        psu.bus.write_line("FORMAT REAL")?;
        psu.bus.write_line("FORMat:BORDer NORMAL")?;
        psu.bus.write_line("SENSe:PROTection:STAT ON")?;
        Ok(psu)
    }

    /// DVM measurements need a model with the DVM input.
    pub(super) fn check_sense_mode(&self, mode: SenseMode) -> Result<(), S::Error> {
        if mode == SenseMode::Dvm && !self.caps.has_dvm {
            return Err(Error::Unsupported("DVM sensing"));
        }
        Ok(())
    }

    /// Suffix selecting output 2 in commands like `VOLT2`.
    fn suffix(channel: u8) -> &'static str {
        if channel == 2 { "2" } else { "" }
    }

    fn fetch_array(&mut self, cmd: &str) -> Result<Vec<f32>, S::Error> {
        self.bus.write_line(cmd)?;
        self.bus.read_binary_block()
    }
}

impl<S: BusSession> PowerSupply for SweepSupply<S> {
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
            .write_line(&format!("CURR:PROT:STAT {}", u8::from(enabled)))
    }

    fn set_ovp(&mut self, level: Option<f64>) -> Result<(), S::Error> {
        match level {
            None => self.bus.write_line("VOLTage:PROTection:STATe OFF"),
            Some(level) => {
                self.bus
                    .write_line(&format!("VOLTAGE:PROTECTION {}", Num(level)))?;
                self.bus.write_line("VOLTage:PROTection:STATe ON")
            }
        }
    }

    fn set_output_compensation(&mut self, comp: OutputCompensation) -> Result<(), S::Error> {
        self.bus
            .write_line(&format!("OUTPUT:TYPE {}", comp.as_ref()))
    }

    fn set_current_detector(&mut self, detector: CurrentDetector) -> Result<(), S::Error> {
        self.bus
            .write_line(&format!("SENSe:CURRent:DETector {}", detector.as_ref()))
    }

    fn clear_protection(&mut self) -> Result<(), S::Error> {
        self.bus.write_line("OUTPut:PROTection:CLEar")
    }

    fn set_current_range(&mut self, range: f64) -> Result<(), S::Error> {
        if !self.caps.supports_range(range) {
            return Err(Error::InvalidRange);
        }
        self.bus
            .write_line(&format!("SENS:CURR:RANG {}", Num(range)))
    }

    fn set_iv(&mut self, channel: u8, voltage: f64, current: f64) -> Result<(), S::Error> {
        let n = Self::suffix(channel);
        self.bus.write_line(&format!(
            "VOLT{n} {};:CURR{n} {}",
            Num(voltage),
            Num(current)
        ))
    }

    /// Both outputs share one switch on these supplies; `channel` is ignored.
    fn enable_output(&mut self, _channel: Channel, enabled: bool) -> Result<(), S::Error> {
        self.bus
            .write_line(if enabled { "OUTPUT ON" } else { "OUTPUT OFF" })
    }

    fn set_display_state(&mut self, state: DisplayState) -> Result<(), S::Error> {
        self.bus
            .write_line(&format!("DISP:STATE {}", state.as_ref()))
    }

    fn set_display_text(&mut self, text: &str) -> Result<(), S::Error> {
        self.bus.write_line("DISPLAY:MODE TEXT")?;
        // A quote would end the string early.
        let text = text.replace('\'', "");
        self.bus.write_line(&format!("DISP:TEXT '{text}'"))
    }

    fn clear_display_text(&mut self) -> Result<(), S::Error> {
        self.bus.write_line("DISPLAY:MODE NORM")?;
        self.bus.write_line("DISP:TEXT ''")
    }

    fn set_measure_window(&mut self, window: WindowType) -> Result<(), S::Error> {
        self.bus
            .write_line(&format!("SENS:WIND {}", window.as_ref()))
    }

    fn read_state(&mut self) -> Result<InstrumentState, S::Error> {
        let started = Instant::now();
        let response = self.bus.query(
            "stat:oper:cond?;:stat:ques:cond?;:sense:curr:range?;:OUTP1?;\
             VOLTage:PROTection:STAT?;:CURR:PROT:STAT?",
        )?;
        let fields: Vec<&str> = split_fields(&response).collect();
        let [op, ques, range, out1, ovp, ocp] = fields[..] else {
            return Err(Error::ProtocolViolation(format!(
                "status query returned {} fields",
                fields.len()
            )));
        };
        let op = OperationStatus::from(parse_register(op)? as u16);
        let ques = QuestionableStatus::from(parse_register(ques)? as u16);
        let output_enabled1 = parse_flag(out1);

        let mut state = InstrumentState {
            flags: StatusFlags::from_registers(op, ques),
            current_range: parse_number(range)?,
            output_enabled1,
            // Both outputs follow the one switch.
            output_enabled2: output_enabled1 && self.caps.has_output2,
            ovp: parse_flag(ovp),
            ocp: parse_flag(ocp),
            ..Default::default()
        };

        // Short, single-shot readings.
        self.bus
            .write_line("TRIG:ACQ:SOUR INT;COUNT:VOLT 1;:TRIG:ACQ:COUNT:CURR 1")?;
        self.bus.write_line("SENS:SWE:POIN 2048; TINT 46.8e-6")?;
        self.bus.write_line("SENS:SWE:OFFS:POIN 0;:SENS:WIND HANN")?;

        state.v = Some(self.bus.query_number("MEAS:VOLT?")?);
        state.i = Some(self.bus.query_number("MEAS:CURR?")?);
        if self.caps.has_output2 {
            state.v2 = Some(self.bus.query_number("MEAS:VOLT2?")?);
            state.i2 = Some(self.bus.query_number("MEAS:CURR2?")?);
        }
        if self.caps.has_dvm {
            state.dvm = Some(self.bus.query_number("MEAS:DVM?")?);
        }
        state.duration = started.elapsed();
        Ok(state)
    }

    fn read_program_details(&mut self) -> Result<ProgramDetails, S::Error> {
        let mut cmd =
            String::from("OUTP?;VOLT?;CURR?;:VOLT:PROT:STAT?;:VOLT:PROT?;:CURR:PROT:STAT?");
        if self.caps.has_output2 {
            cmd.push_str(";:VOLT2?;CURR2?");
        }
        let response = self.bus.query(&cmd)?;
        let fields: Vec<&str> = split_fields(&response).collect();
        let expected = if self.caps.has_output2 { 8 } else { 6 };
        if fields.len() != expected {
            return Err(Error::ProtocolViolation(format!(
                "program query returned {} fields, expected {expected}",
                fields.len()
            )));
        }
        let number = |n: usize| parse_number(fields[n]);

        let enabled1 = parse_flag(fields[0]);
        let mut program = Setpoints {
            enabled1,
            enabled2: enabled1 && self.caps.has_output2,
            v1: number(1)?,
            i1: number(2)?,
            ovp: parse_flag(fields[3]),
            ovp_level: number(4)?,
            ocp: parse_flag(fields[5]),
            ..Default::default()
        };
        if self.caps.has_output2 {
            program.v2 = number(6)?;
            program.i2 = number(7)?;
        }

        let [max_v1, max_i1] = self.bus.query_array("VOLT? MAX; CURR? MAX")?;
        let [max_v2, max_i2] = if self.caps.has_output2 {
            self.bus.query_array("VOLT2? MAX; CURR2? MAX")?
        } else {
            [0.0; 2]
        };
        let current_range = self.bus.query_number(":sense:curr:range?")?;
        let detector = self.bus.query("SENSE:CURR:DET?")?;
        let detector = CurrentDetector::from_str(&detector)
            .map_err(|_| Error::ProtocolViolation(format!("unknown detector {detector:?}")))?;

        Ok(ProgramDetails {
            program,
            capabilities: self.caps,
            identity: self.identity.raw.clone(),
            max_v1,
            max_i1,
            max_v2,
            max_i2,
            current_range,
            detector,
        })
    }

    fn output_state(&mut self) -> Result<OutputState, S::Error> {
        let ch1 = parse_flag(&self.bus.query(":OUTP:STAT?")?);
        Ok(OutputState {
            ch1,
            ch2: ch1 && self.caps.has_output2,
        })
    }

    /// Nothing to restore, measurements never touch the outputs here.
    fn restore_output_state(&mut self, _channel: Channel) -> Result<(), S::Error> {
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
        _channel: Channel,
        mode: SenseMode,
        _interval: NanosDurationU64,
    ) -> Result<(), S::Error> {
        self.check_sense_mode(mode)?;
        self.bus
            .write_line(&format!("SENSe:FUNCtion \"{}\"", mode.as_ref()))?;
        self.bus.write_line(LOG_SWEEP)?;
        self.bus.write_line("TRIG:ACQ:SOURCE BUS")?;
        self.bus.write_line("ABORT;*WAI")?;
        self.bus.query("*OPC?")?;
        self.logging = Some(PollingSession::start());
        Ok(())
    }

    fn measure_logging_point(
        &mut self,
        _channel: Channel,
        mode: SenseMode,
    ) -> Result<Vec<LoggerDatapoint>, S::Error> {
        let clock = self
            .logging
            .ok_or(Error::Unsupported("logging without setup"))?;
        let point = match mode {
            SenseMode::Current | SenseMode::Voltage => {
                let m = mode.as_ref();
                let [mean, min, max, rms] = self.bus.query_array(&format!(
                    "MEAS:{m}?;:FETCH:{m}:MIN?;MAX?;ACDC?"
                ))?;
                LoggerDatapoint {
                    min,
                    mean,
                    max,
                    rms: Some(rms),
                    t: clock.elapsed(),
                    record_time: SystemTime::now(),
                }
            }
            SenseMode::Dvm => {
                let value = self.bus.query_number("MEAS:DVM?")?;
                LoggerDatapoint::single(value, clock.elapsed())
            }
        };
        Ok(vec![point])
    }

    fn stop_logging(&mut self) -> Result<(), S::Error> {
        self.logging = None;
        self.abort_measurement()
    }

    fn start_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<(), S::Error> {
        if details.num_points.saturating_mul(trigger_count) > MAX_SWEEP_POINTS {
            return Err(Error::InvalidRange);
        }
        let mode = details.sense_mode;
        self.check_sense_mode(mode)?;
        self.set_measure_window(details.window)?;
        self.bus
            .write_line(&format!("SENSe:FUNCtion \"{}\"", mode.as_ref()))?;

        let count = if details.is_immediate() {
            1
        } else {
            trigger_count
        };
        let interval = as_secs(details.clamped_interval());
        self.bus.write_line(&format!(
            "SENSe:SWEEP:POINTS {}; TINTerval {};OFFSET:POINTS {}",
            details.num_points,
            Num(interval),
            details.sample_offset
        ))?;

        match details.level {
            Some(level) if !details.is_immediate() => {
                let m = mode.as_ref();
                self.bus.write_line(&format!(
                    "TRIG:ACQ:COUNT:{m} {count};:TRIG:ACQ:LEVEL:{m} {};\
                     :TRIG:ACQ:SLOPE:{m} {};:TRIG:ACQ:HYST:{m} {}",
                    Num(level),
                    details.trigger_edge.as_ref(),
                    Num(details.hysteresis)
                ))?;
                self.bus.write_line("TRIG:ACQ:SOURCE INT")?;
                self.bus.write_line("ABORT;*WAI")?;
                self.bus.write_line("INIT:NAME ACQ")?;
            }
            _ => {
                self.bus.write_line("TRIG:ACQ:SOURCE BUS")?;
                self.bus.write_line("ABORT;*WAI")?;
                self.bus.write_line("INIT:NAME ACQ;:TRIG:ACQ")?;
            }
        }

        // Clear the event register, then flag "operation complete" once the sweep is done.
        self.bus.query("*ESR?")?;
        self.bus.write_line("*OPC")
    }

    fn is_measurement_finished(&mut self) -> Result<bool, S::Error> {
        Ok(self.bus.query_register("*ESR?")? & 1 == 1)
    }

    fn finish_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<MeasArray, S::Error> {
        let data = match details.sense_mode {
            SenseMode::Voltage => self.fetch_array("FETCH:ARRay:VOLTage?")?,
            SenseMode::Current => self.fetch_array("FETCH:ARRay:CURRent?")?,
            SenseMode::Dvm => {
                let mut data = Vec::with_capacity(DVM_TRANSIENT_READINGS);
                for _ in 0..DVM_TRANSIENT_READINGS {
                    data.push(self.bus.query_number("FETCH:DVM:ACDC?")? as f32);
                }
                data
            }
        };

        let time_interval = match self.bus.query_number("SENSE:SWEEP:TINT?") {
            Ok(interval) => interval,
            Err(Error::Format(err)) => {
                warn!("unreadable sample interval: {err}");
                0.0
            }
            Err(err) => return Err(err),
        };

        let count = if details.is_immediate() {
            1
        } else {
            trigger_count
        };
        debug!("fetched {} samples in {count} segments", data.len());
        Ok(MeasArray::from_flat(
            details.sense_mode,
            time_interval,
            &data,
            count,
        ))
    }

    fn peek_firmware(&mut self, address: u16) -> Result<Option<[u32; 4]>, S::Error> {
        let a = address as u32;
        let response = self.bus.query(&format!(
            "DIAG:PEEK? #H{:04X}; PEEK? #H{:04X}; PEEK? #H{:04X}; PEEK? #H{:04X}",
            a,
            a + 1,
            a + 2,
            a + 3
        ))?;
        let words: Vec<u32> = response.split(';').map(decode_hex_register).collect();
        <[u32; 4]>::try_from(words).map(Some).map_err(|words| {
            Error::ProtocolViolation(format!("firmware peek returned {} words", words.len()))
        })
    }
}
