//! Status registers and the small SCPI vocabularies used by the supplies.

use modular_bitfield::prelude::*;
use strum_macros::{AsRefStr, EnumIter, EnumString};

/// `STAT:OPER:COND?` on the 663xx family.
#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationStatus {
    /// 0: Calibration mode is enabled.
    pub calibration: bool,
    #[skip]
    reserved_1_4: B4,
    /// 5: Waiting for a trigger.
    pub waiting_for_trigger: bool,
    #[skip]
    reserved_6_7: B2,
    /// 8: Output 1 in constant voltage.
    pub cv: bool,
    /// 9: Output 2 in constant voltage.
    pub cv2: bool,
    /// 10: Output 1 in positive constant current.
    pub cc_positive: bool,
    /// 11: Output 1 in negative constant current.
    pub cc_negative: bool,
    /// 12: Output 2 in constant current.
    pub cc2: bool,
    #[skip]
    reserved_13_15: B3,
}

impl From<u16> for OperationStatus {
    fn from(value: u16) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }
}

/// `STAT:QUES:COND?` on the 663xx family.
#[bitfield(bits = 16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionableStatus {
    /// 0: Overvoltage protection tripped.
    pub over_voltage: bool,
    /// 1: Overcurrent protection tripped.
    pub over_current: bool,
    #[skip]
    reserved_2: B1,
    /// 3: Front panel "Local" was pressed.
    pub front_panel_local: bool,
    /// 4: Overtemperature protection tripped.
    pub over_temperature: bool,
    /// 5: Open sense lead detected.
    pub open_sense_lead: bool,
    #[skip]
    reserved_6_7: B2,
    /// 8: Output 2 unregulated.
    pub unregulated2: bool,
    /// 9: Remote inhibit active.
    pub remote_inhibit: bool,
    /// 10: Output 1 unregulated.
    pub unregulated: bool,
    #[skip]
    reserved_11: B1,
    /// 12: Overcurrent on output 2.
    pub over_current2: bool,
    #[skip]
    reserved_13: B1,
    /// 14: Current measurement overload.
    pub measurement_overload: bool,
    #[skip]
    reserved_15: B1,
}

impl From<u16> for QuestionableStatus {
    fn from(value: u16) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }
}

/// Status conditions in one shape for all supplies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub calibration: bool,
    pub waiting_for_trigger: bool,
    pub cv: bool,
    pub cv2: bool,
    pub cc: bool,
    pub cc_positive: bool,
    pub cc_negative: bool,
    pub cc2: bool,
    pub ovp: bool,
    pub ocp: bool,
    pub front_panel_local: bool,
    pub over_temperature: bool,
    pub open_sense_lead: bool,
    pub unregulated2: bool,
    pub remote_inhibit: bool,
    pub unregulated: bool,
    pub ocp2: bool,
    pub ovp2: bool,
    pub measurement_overload: bool,
}

impl StatusFlags {
    /// Decode the 663xx operation and questionable condition registers.
    pub fn from_registers(op: OperationStatus, ques: QuestionableStatus) -> Self {
        Self {
            calibration: op.calibration(),
            waiting_for_trigger: op.waiting_for_trigger(),
            cv: op.cv(),
            cv2: op.cv2(),
            cc: op.cc_positive() || op.cc_negative(),
            cc_positive: op.cc_positive(),
            cc_negative: op.cc_negative(),
            cc2: op.cc2(),
            ovp: ques.over_voltage(),
            ocp: ques.over_current(),
            front_panel_local: ques.front_panel_local(),
            over_temperature: ques.over_temperature(),
            open_sense_lead: ques.open_sense_lead(),
            unregulated2: ques.unregulated2(),
            remote_inhibit: ques.remote_inhibit(),
            unregulated: ques.unregulated(),
            ocp2: ques.over_current2(),
            ovp2: false,
            measurement_overload: ques.measurement_overload(),
        }
    }

    /// Decode the B296x questionable condition registers.
    ///
    /// The voltage and current registers carry one bit per channel. A flag is only reported
    /// when its channel is the sole bit set; calibration and temperature are shared by both
    /// channels. Needs checking on real hardware with both channels tripped at once.
    pub fn from_conditions(volt: u32, curr: u32, cal: u32, temp: u32) -> Self {
        Self {
            ovp: volt == 0x1,
            ovp2: volt == 0x2,
            ocp: curr == 0x1,
            ocp2: curr == 0x2,
            calibration: cal != 0,
            over_temperature: temp != 0,
            ..Default::default()
        }
    }
}

/// What a measurement looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, AsRefStr, EnumString)]
pub enum SenseMode {
    #[default]
    #[strum(serialize = "CURR")]
    Current,
    #[strum(serialize = "VOLT")]
    Voltage,
    /// The auxiliary DVM input.
    #[strum(serialize = "DVM")]
    Dvm,
}

/// Current-sense detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, AsRefStr, EnumString)]
pub enum CurrentDetector {
    #[default]
    #[strum(serialize = "DC")]
    Dc,
    #[strum(serialize = "ACDC")]
    AcDc,
}

/// Output stage compensation. Low capacitance is always stable, high needs >5 µF at the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, AsRefStr)]
pub enum OutputCompensation {
    #[strum(serialize = "HIGH")]
    HighCap,
    #[strum(serialize = "LOW")]
    LowCap,
}

/// Acquisition trigger edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, AsRefStr)]
pub enum TriggerSlope {
    /// Start right away, ignoring level and hysteresis.
    #[strum(serialize = "IMM")]
    Immediate,
    #[default]
    #[strum(serialize = "POS")]
    Positive,
    #[strum(serialize = "NEG")]
    Negative,
    #[strum(serialize = "EITH")]
    Either,
}

/// Measurement window function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, AsRefStr)]
pub enum WindowType {
    /// Instrument default, which is Hanning.
    #[default]
    #[strum(serialize = "HANN")]
    Default,
    #[strum(serialize = "RECT")]
    Rect,
    #[strum(serialize = "HANN")]
    Hanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, AsRefStr)]
pub enum DisplayState {
    #[strum(serialize = "OFF")]
    Off,
    #[strum(serialize = "ON")]
    On,
}

impl From<bool> for DisplayState {
    fn from(value: bool) -> Self {
        match value {
            true => DisplayState::On,
            false => DisplayState::Off,
        }
    }
}
