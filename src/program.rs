//! The order a new operating point is written in.
//!
//! Outputs that are going off are switched off before any threshold moves, and outputs that are
//! coming on are switched on only once every setpoint and protection is in place. That way a
//! half-programmed supply never trips its own protection.

use crate::{
    error::Result,
    identity::Capabilities,
    psu::PowerSupply,
    types::{Channel, Setpoints},
};

/// One driver call of a programming cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgramStep {
    EnableOutput(Channel, bool),
    SetOcp(bool),
    /// `None` disables OVP.
    SetOvp(Option<f64>),
    SetIv {
        channel: u8,
        voltage: f64,
        current: f64,
    },
}

/// The ordered driver calls that program a [Setpoints].
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramPlan {
    steps: Vec<ProgramStep>,
}

impl ProgramPlan {
    pub fn new(setpoints: &Setpoints, caps: &Capabilities) -> Self {
        // Without separate switches output 2 follows output 1.
        let switch2 = caps.has_output2 && caps.has_separate_enables;
        let any_disabled = !setpoints.enabled1 || (switch2 && !setpoints.enabled2);
        let any_enabled = setpoints.enabled1 || (switch2 && setpoints.enabled2);

        let mut steps = Vec::with_capacity(8);
        if !setpoints.enabled1 {
            steps.push(ProgramStep::EnableOutput(Channel::One, false));
        }
        if switch2 && !setpoints.enabled2 {
            steps.push(ProgramStep::EnableOutput(Channel::Two, false));
        }
        if any_disabled {
            steps.push(ProgramStep::SetOcp(setpoints.ocp));
        }
        if caps.has_ovp {
            steps.push(ProgramStep::SetOvp(setpoints.ovp_setting()));
        }
        steps.push(ProgramStep::SetIv {
            channel: 1,
            voltage: setpoints.v1,
            current: setpoints.i1,
        });
        if caps.has_output2 {
            steps.push(ProgramStep::SetIv {
                channel: 2,
                voltage: setpoints.v2,
                current: setpoints.i2,
            });
        }
        if any_enabled {
            steps.push(ProgramStep::SetOcp(setpoints.ocp));
        }
        if setpoints.enabled1 {
            steps.push(ProgramStep::EnableOutput(Channel::One, true));
        }
        if switch2 && setpoints.enabled2 {
            steps.push(ProgramStep::EnableOutput(Channel::Two, true));
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[ProgramStep] {
        &self.steps
    }

    /// Run the plan, stopping at the first failing call.
    pub fn apply<P: PowerSupply + ?Sized>(&self, psu: &mut P) -> Result<(), P::BusError> {
        for step in &self.steps {
            match *step {
                ProgramStep::EnableOutput(channel, enabled) => {
                    psu.enable_output(channel, enabled)?
                }
                ProgramStep::SetOcp(enabled) => psu.set_ocp(enabled)?,
                ProgramStep::SetOvp(level) => psu.set_ovp(level)?,
                ProgramStep::SetIv {
                    channel,
                    voltage,
                    current,
                } => psu.set_iv(channel, voltage, current)?,
            }
        }
        Ok(())
    }
}
