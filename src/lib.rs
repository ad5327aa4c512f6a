//! This crate provides control of SCPI bench power supplies over a message-based instrument bus.
//!
//! Supported supplies, by driver:
//! * [Simple](psu::SimpleSupply): Keysight B2961A, B2962A
//! * [Sweep](psu::SweepSupply): HP/Agilent 66309B/D, 66311B/D, 66319B/D, 66321B/D
//! * [Datalog](psu::DatalogSupply): the 66319/66321 models with firmware A.03 or later, which log
//!   into an on-board ring buffer
//!
//! The transport is injected. Anything implementing [BusSession] on top of [embedded_io] can carry
//! the commands, be it GPIB, USBTMC or a serial GPIB adapter (see the `prologix` example).
//!
//! Supplies can be driven directly through [PowerSupply] after [Device::attach], or from any
//! number of threads through a [Worker], which owns the supply and serializes every bus access.

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod program;
pub mod psu;
pub mod register;
pub mod types;
pub mod worker;

#[cfg(test)]
mod mock_bus;

pub use bus::BusSession;
pub use config::Conf;
pub use error::{Error, FormatError, Result};
pub use identity::{Capabilities, DeviceIdentity, Model, Variant};
pub use psu::{Device, PowerSupply};
pub use types::{AcquireDetails, InstrumentState, ProgramDetails, Setpoints};
pub use worker::{CancelToken, Command, Event, Requester, Worker, WorkerState};
