//! Who is on the other end of the bus, and what it can do.
//!
//! The `*IDN?` reply is parsed once at attach time. Its model field picks the driver variant and
//! capability flags; the firmware field tells whether the hardware datalog buffer exists.

use core::str::FromStr;

use strum_macros::{AsRefStr, EnumIter, EnumString};
use thiserror::Error;

use crate::error::Error;

/// Current ranges of the 663xx models with the extra 1 A range.
const RANGES_663XX_1A: &[f64] = &[0.02, 1.0, 3.0];
const RANGES_663XX: &[f64] = &[0.02, 3.0];
const RANGES_B296X: &[f64] = &[
    10e-9, 100e-9, 1e-6, 10e-6, 100e-6, 1e-3, 10e-3, 100e-3, 1.0, 1.5, 3.0, 10.0,
];

/// Every model we know how to drive, by part number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, AsRefStr)]
#[strum(ascii_case_insensitive)]
pub enum Model {
    #[strum(serialize = "66309B")]
    Hp66309B,
    #[strum(serialize = "66319B")]
    Hp66319B,
    #[strum(serialize = "66309D")]
    Hp66309D,
    #[strum(serialize = "66319D")]
    Hp66319D,
    #[strum(serialize = "66311B")]
    Hp66311B,
    #[strum(serialize = "66321B")]
    Hp66321B,
    #[strum(serialize = "66311D")]
    Hp66311D,
    #[strum(serialize = "66321D")]
    Hp66321D,
    #[strum(serialize = "B2961A")]
    B2961A,
    #[strum(serialize = "B2961B")]
    B2961B,
    #[strum(serialize = "B2962A")]
    B2962A,
    #[strum(serialize = "B2962B")]
    B2962B,
}

/// Which driver handles a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum Variant {
    /// Keysight B296x source/measure units.
    Simple,
    /// HP/Agilent 663xx without the datalog firmware.
    Sweep,
    /// HP/Agilent 663xx with the datalog ring buffer.
    Datalog,
}

/// Fixed features of a model.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Capabilities {
    pub has_output2: bool,
    pub has_dvm: bool,
    pub has_ovp: bool,
    /// Outputs can be switched one at a time.
    pub has_separate_enables: bool,
    /// Selectable current ranges in amps, ascending.
    pub current_ranges: &'static [f64],
}

impl Capabilities {
    /// Whether `range` is one of the selectable current ranges.
    pub fn supports_range(&self, range: f64) -> bool {
        self.current_ranges
            .iter()
            .any(|r| (r - range).abs() <= r * 1e-6)
    }
}

impl Model {
    /// `true` for the 663xx family.
    pub const fn is_sweep_family(&self) -> bool {
        !matches!(
            self,
            Model::B2961A | Model::B2961B | Model::B2962A | Model::B2962B
        )
    }

    pub const fn capabilities(&self) -> Capabilities {
        match self {
            Model::Hp66309B | Model::Hp66319B => Capabilities {
                has_output2: true,
                has_dvm: false,
                has_ovp: true,
                has_separate_enables: false,
                current_ranges: self.sweep_ranges(),
            },
            Model::Hp66309D | Model::Hp66319D => Capabilities {
                has_output2: true,
                has_dvm: true,
                has_ovp: true,
                has_separate_enables: false,
                current_ranges: self.sweep_ranges(),
            },
            Model::Hp66311B | Model::Hp66321B => Capabilities {
                has_output2: false,
                has_dvm: false,
                has_ovp: true,
                has_separate_enables: false,
                current_ranges: self.sweep_ranges(),
            },
            // Single output models, the DVM is their only extra.
            Model::Hp66311D | Model::Hp66321D => Capabilities {
                has_output2: false,
                has_dvm: true,
                has_ovp: true,
                has_separate_enables: false,
                current_ranges: self.sweep_ranges(),
            },
            Model::B2961A | Model::B2961B => Capabilities {
                has_output2: false,
                has_dvm: false,
                has_ovp: true,
                has_separate_enables: false,
                current_ranges: RANGES_B296X,
            },
            Model::B2962A | Model::B2962B => Capabilities {
                has_output2: true,
                has_dvm: false,
                has_ovp: true,
                has_separate_enables: true,
                current_ranges: RANGES_B296X,
            },
        }
    }

    /// The 66319 and 66321 have an extra 1 A range.
    const fn sweep_ranges(&self) -> &'static [f64] {
        match self {
            Model::Hp66319B | Model::Hp66319D | Model::Hp66321B | Model::Hp66321D => {
                RANGES_663XX_1A
            }
            _ => RANGES_663XX,
        }
    }
}

/// A firmware revision such as `A.03.01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareRevision {
    pub letter: char,
    pub major: u16,
    pub minor: u16,
}

impl FirmwareRevision {
    /// First revision with the datalog buffer.
    pub const DATALOG: FirmwareRevision = FirmwareRevision {
        letter: 'A',
        major: 3,
        minor: 0,
    };

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let mut letter = parts.next()?.chars();
        let first = letter.next()?.to_ascii_uppercase();
        if letter.next().is_some() || !first.is_ascii_alphabetic() {
            return None;
        }
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
        Some(Self {
            letter: first,
            major,
            minor,
        })
    }

    /// Datalog is an `A` platform feature; other letters are different hardware.
    pub fn has_datalog(&self) -> bool {
        self.letter == Self::DATALOG.letter && *self >= Self::DATALOG
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("identity has {0} fields, expected 4")]
    FieldCount(usize),
    #[error("unknown model {0:?}")]
    UnknownModel(String),
}

impl<I: embedded_io::Error> From<IdentityError> for Error<I> {
    fn from(err: IdentityError) -> Self {
        Error::UnsupportedDevice(err.to_string())
    }
}

/// A parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    /// The reply as received, trimmed.
    pub raw: String,
    pub manufacturer: String,
    pub model: Model,
    pub serial: String,
    pub firmware: String,
}

impl DeviceIdentity {
    pub fn parse(idn: &str) -> Result<Self, IdentityError> {
        let raw = idn.trim();
        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        let [manufacturer, model, serial, firmware] = fields[..] else {
            return Err(IdentityError::FieldCount(fields.len()));
        };
        let model =
            Model::from_str(model).map_err(|_| IdentityError::UnknownModel(model.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            manufacturer: manufacturer.to_string(),
            model,
            serial: serial.to_string(),
            firmware: firmware.to_string(),
        })
    }

    pub fn firmware_revision(&self) -> Option<FirmwareRevision> {
        FirmwareRevision::parse(&self.firmware)
    }

    /// The driver to bind.
    pub fn variant(&self) -> Variant {
        if !self.model.is_sweep_family() {
            Variant::Simple
        } else if self
            .firmware_revision()
            .is_some_and(|rev| rev.has_datalog())
        {
            Variant::Datalog
        } else {
            Variant::Sweep
        }
    }
}
