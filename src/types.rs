//! Data carried between the drivers, the worker and the application.

use std::time::{Duration, SystemTime};

use fugit::NanosDurationU64;
use thiserror::Error;

use crate::{
    identity::Capabilities,
    register::{CurrentDetector, SenseMode, StatusFlags, TriggerSlope, WindowType},
};

/// Most points one sweep buffer holds.
pub const MAX_SWEEP_POINTS: u32 = 4096;

/// Fastest sweep sample interval, 15.6 µs.
pub const MIN_SAMPLE_INTERVAL: NanosDurationU64 = NanosDurationU64::from_ticks(15_600);

/// Slowest sweep sample interval, 10⁴ s.
pub const MAX_SAMPLE_INTERVAL: NanosDurationU64 = NanosDurationU64::from_ticks(10_000_000_000_000);

/// Seconds as `f64`, the unit the instruments talk in.
pub fn as_secs(duration: NanosDurationU64) -> f64 {
    duration.ticks() as f64 / 1e9
}

/// Output channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    One,
    Two,
    Both,
}

impl Channel {
    /// SCPI channel suffix. `Both` addresses channel 1 where only one number fits.
    pub const fn number(&self) -> u8 {
        match self {
            Channel::Two => 2,
            Channel::One | Channel::Both => 1,
        }
    }

    pub const fn includes(&self, number: u8) -> bool {
        matches!(
            (self, number),
            (Channel::Both, _) | (Channel::One, 1) | (Channel::Two, 2)
        )
    }
}

/// Which outputs are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputState {
    pub ch1: bool,
    pub ch2: bool,
}

/// A point-in-time reading of the supply.
///
/// Channel 2 and DVM readings are `None` when the model lacks them or they weren't measured.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstrumentState {
    pub flags: StatusFlags,
    /// Active current range in amps.
    pub current_range: f64,
    pub v: Option<f64>,
    pub i: Option<f64>,
    pub v2: Option<f64>,
    pub i2: Option<f64>,
    pub dvm: Option<f64>,
    /// How long the read took.
    pub duration: Duration,
    pub output_enabled1: bool,
    pub output_enabled2: bool,
    /// OVP enabled.
    pub ovp: bool,
    /// OCP enabled.
    pub ocp: bool,
}

/// The operating point to program.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Setpoints {
    pub enabled1: bool,
    pub enabled2: bool,
    pub ocp: bool,
    pub ovp: bool,
    pub ovp_level: f64,
    pub v1: f64,
    pub i1: f64,
    /// Ignored without a second output.
    pub v2: f64,
    pub i2: f64,
}

impl Setpoints {
    /// OVP level to program, `None` to disable OVP.
    pub fn ovp_setting(&self) -> Option<f64> {
        self.ovp.then_some(self.ovp_level)
    }
}

/// Operating point as read back, plus the fixed limits of the supply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgramDetails {
    pub program: Setpoints,
    pub capabilities: Capabilities,
    /// `*IDN?` reply.
    pub identity: String,
    pub max_v1: f64,
    pub max_i1: f64,
    pub max_v2: f64,
    pub max_i2: f64,
    pub current_range: f64,
    pub detector: CurrentDetector,
}

/// One logged sample.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggerDatapoint {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    /// Only some measurement paths report RMS.
    pub rms: Option<f64>,
    /// Seconds since logging started.
    pub t: f64,
    pub record_time: SystemTime,
}

impl LoggerDatapoint {
    /// A reading with no spread, e.g. a single-shot measurement.
    pub fn single(value: f64, t: f64) -> Self {
        Self {
            min: value,
            mean: value,
            max: value,
            rms: None,
            t,
            record_time: SystemTime::now(),
        }
    }
}

/// Waveform segments captured by one triggered acquisition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeasArray {
    pub mode: SenseMode,
    /// Actual sample interval in seconds, `0` when the supply didn't tell.
    pub time_interval: f64,
    pub segments: Vec<Vec<f64>>,
}

impl MeasArray {
    /// Split a flat capture into `count` equal segments.
    pub fn from_flat(mode: SenseMode, time_interval: f64, data: &[f32], count: u32) -> Self {
        let count = count.max(1) as usize;
        let per_segment = data.len() / count;
        let segments = (0..count)
            .map(|n| {
                data.iter()
                    .skip(n * per_segment)
                    .take(per_segment)
                    .map(|&x| x as f64)
                    .collect()
            })
            .collect();
        Self {
            mode,
            time_interval,
            segments,
        }
    }
}

/// Use [`AcquireDetailsBuilder`] to create this.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireDetails {
    pub num_points: u32,
    pub interval: NanosDurationU64,
    pub sense_mode: SenseMode,
    /// Trigger level. `None` triggers immediately.
    pub level: Option<f64>,
    pub hysteresis: f64,
    pub trigger_edge: TriggerSlope,
    pub segment_count: u32,
    /// Pre/post trigger sample offset.
    pub sample_offset: i32,
    pub window: WindowType,
    pub channel: Channel,
}

impl AcquireDetails {
    /// Whether the trigger fires without waiting for a level crossing.
    pub fn is_immediate(&self) -> bool {
        self.trigger_edge == TriggerSlope::Immediate || self.level.is_none()
    }

    /// How many segments fit in one instrument run, given how many are still wanted.
    pub fn segments_per_run(&self, remaining: u32) -> u32 {
        if self.trigger_edge == TriggerSlope::Immediate {
            1
        } else {
            remaining.min(MAX_SWEEP_POINTS / self.num_points.max(1)).max(1)
        }
    }

    /// Sample interval limited to what the sweep hardware does.
    pub fn clamped_interval(&self) -> NanosDurationU64 {
        NanosDurationU64::from_ticks(
            self.interval
                .ticks()
                .clamp(MIN_SAMPLE_INTERVAL.ticks(), MAX_SAMPLE_INTERVAL.ticks()),
        )
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AcquireDetailsBuilderError {
    #[error("point count {0} outside 1..=4096")]
    PointCount(u32),
    #[error("at least one segment is needed")]
    NoSegments,
}

/// Use this type to create [AcquireDetails].
pub struct AcquireDetailsBuilder {
    details: AcquireDetails,
}

impl AcquireDetailsBuilder {
    pub fn new(sense_mode: SenseMode, num_points: u32, interval: NanosDurationU64) -> Self {
        Self {
            details: AcquireDetails {
                num_points,
                interval,
                sense_mode,
                level: None,
                hysteresis: 0.0,
                trigger_edge: TriggerSlope::Immediate,
                segment_count: 1,
                sample_offset: 0,
                window: WindowType::Default,
                channel: Channel::One,
            },
        }
    }

    /// Trigger on a level crossing.
    pub fn with_trigger(mut self, edge: TriggerSlope, level: f64, hysteresis: f64) -> Self {
        self.details.trigger_edge = edge;
        self.details.level = Some(level);
        self.details.hysteresis = hysteresis;
        self
    }

    pub fn with_segments(mut self, count: u32) -> Self {
        self.details.segment_count = count;
        self
    }

    pub fn with_offset(mut self, offset: i32) -> Self {
        self.details.sample_offset = offset;
        self
    }

    pub fn with_window(mut self, window: WindowType) -> Self {
        self.details.window = window;
        self
    }

    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.details.channel = channel;
        self
    }

    /// Let's build it!
    pub fn build(self) -> Result<AcquireDetails, AcquireDetailsBuilderError> {
        let points = self.details.num_points;
        if !(1..=MAX_SWEEP_POINTS).contains(&points) {
            return Err(AcquireDetailsBuilderError::PointCount(points));
        }
        if self.details.segment_count == 0 {
            return Err(AcquireDetailsBuilderError::NoSegments);
        }
        Ok(self.details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(points: u32) -> AcquireDetailsBuilder {
        AcquireDetailsBuilder::new(SenseMode::Current, points, MIN_SAMPLE_INTERVAL)
    }

    #[test]
    fn builder_checks_points() {
        assert_eq!(
            builder(0).build().unwrap_err(),
            AcquireDetailsBuilderError::PointCount(0)
        );
        assert_eq!(
            builder(4097).build().unwrap_err(),
            AcquireDetailsBuilderError::PointCount(4097)
        );
        assert_eq!(
            builder(10).with_segments(0).build().unwrap_err(),
            AcquireDetailsBuilderError::NoSegments
        );
        assert!(builder(4096).build().is_ok());
    }

    #[test]
    fn segmentation() {
        let immediate = builder(100).with_segments(50).build().unwrap();
        assert!(immediate.is_immediate());
        assert_eq!(immediate.segments_per_run(50), 1);

        let triggered = builder(1000)
            .with_trigger(TriggerSlope::Positive, 0.1, 0.01)
            .with_segments(10)
            .build()
            .unwrap();
        assert!(!triggered.is_immediate());
        assert_eq!(triggered.segments_per_run(10), 4);
        assert_eq!(triggered.segments_per_run(2), 2);

        let full = builder(4096)
            .with_trigger(TriggerSlope::Either, 0.1, 0.0)
            .build()
            .unwrap();
        assert_eq!(full.segments_per_run(3), 1);
    }

    #[test]
    fn interval_is_clamped() {
        let fast = AcquireDetailsBuilder::new(
            SenseMode::Voltage,
            10,
            NanosDurationU64::from_ticks(1_000),
        )
        .build()
        .unwrap();
        assert_eq!(fast.clamped_interval(), MIN_SAMPLE_INTERVAL);
        assert!((as_secs(fast.clamped_interval()) - 15.6e-6).abs() < 1e-12);
    }

    #[test]
    fn flat_capture_is_split() {
        let data: Vec<f32> = (0..6).map(|x| x as f32).collect();
        let meas = MeasArray::from_flat(SenseMode::Current, 1e-3, &data, 3);
        assert_eq!(
            meas.segments,
            vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]]
        );
    }

    #[test]
    fn channels() {
        assert_eq!(Channel::Two.number(), 2);
        assert!(Channel::Both.includes(2));
        assert!(!Channel::One.includes(2));
        let setpoints = Setpoints {
            ovp: true,
            ovp_level: 6.0,
            ..Default::default()
        };
        assert_eq!(setpoints.ovp_setting(), Some(6.0));
        assert_eq!(Setpoints::default().ovp_setting(), None);
    }
}
