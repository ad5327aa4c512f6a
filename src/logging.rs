//! Timestamps for logged samples.
//!
//! Polled logging stamps every reading with a host stopwatch. The datalog ring buffer needs more
//! care: the supply samples at a fixed period and only reports a sample counter, and samples are
//! silently dropped whenever the host falls behind and the buffer overruns. [DatalogSession]
//! rebuilds a continuous time axis from those counters plus the host stopwatch.

use std::time::{Instant, SystemTime};

use thiserror::Error;

use crate::{error::Error, types::LoggerDatapoint};

/// Clock of one polled logging run.
#[derive(Debug, Clone, Copy)]
pub struct PollingSession {
    started: Instant,
}

impl PollingSession {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Seconds since the run started.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatalogError {
    #[error("datalog block of {0} values is too short")]
    Truncated(usize),
    #[error("datalog marker fields disagree: {0:?}")]
    MarkerMismatch([f32; 3]),
    #[error("datalog block of {0} values is not made of whole triples")]
    Ragged(usize),
}

impl<I: embedded_io::Error> From<DatalogError> for Error<I> {
    fn from(err: DatalogError) -> Self {
        Error::ProtocolViolation(err.to_string())
    }
}

/// Host clock versus sample clock, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drift {
    /// Sample counter reported with the block.
    pub marker: f32,
    /// Reconstructed minus real elapsed time.
    pub seconds: f64,
    pub ppm: f64,
}

/// What one fetched block gave us.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutcome {
    pub points: Vec<LoggerDatapoint>,
    /// The buffer overran; acquisition has to be restarted.
    pub overrun: bool,
    pub drift: Option<Drift>,
}

/// State of one datalog run. Create a fresh one for every run.
#[derive(Debug, Clone)]
pub struct DatalogSession {
    period: f64,
    stopwatch: Instant,
    /// Aligns sample 0 with the stopwatch.
    fudge_offset: f64,
    /// Time lost to overruns so far.
    lost_time: f64,
    last_sw: f64,
    in_overrun: bool,
    samples: u64,
}

impl DatalogSession {
    /// `period` is the sample period the supply reported back, in seconds.
    pub fn new(period: f64) -> Self {
        Self {
            period,
            stopwatch: Instant::now(),
            fudge_offset: 0.0,
            lost_time: 0.0,
            last_sw: 0.0,
            in_overrun: false,
            samples: 0,
        }
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    /// Stopwatch reading to pass to [Self::ingest].
    pub fn elapsed(&self) -> f64 {
        self.stopwatch.elapsed().as_secs_f64()
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn lost_time(&self) -> f64 {
        self.lost_time
    }

    pub fn in_overrun(&self) -> bool {
        self.in_overrun
    }

    /// Turn one `FETC:ARR:DLOG?` block into timestamped points.
    ///
    /// The block starts with the sample counter repeated three times, negative after an overrun,
    /// followed by `(mean, min, max)` triples. `sw` is the stopwatch reading taken when the block
    /// was requested.
    pub fn ingest(
        &mut self,
        sw: f64,
        block: &[f32],
        record_time: SystemTime,
    ) -> Result<BlockOutcome, DatalogError> {
        let [a, b, c] = *block.first_chunk::<3>().ok_or(DatalogError::Truncated(block.len()))?;
        if a != b || a != c {
            return Err(DatalogError::MarkerMismatch([a, b, c]));
        }
        if block.len() % 3 != 0 {
            return Err(DatalogError::Ragged(block.len()));
        }
        let marker = a;
        let counted = marker as f64;

        if self.samples == 0 {
            self.fudge_offset = sw - (counted - 1.0) * self.period;
        }

        let overrun = marker < 0.0;
        if overrun {
            self.in_overrun = true;
        }

        if self.in_overrun && marker >= 1.0 {
            // Clamped so a late estimate can't move time backwards.
            let gap = sw - self.last_sw - counted * self.period;
            self.lost_time += gap.max(0.0);
            self.in_overrun = false;
        }

        let points = block[3..]
            .chunks_exact(3)
            .map(|triple| {
                let point = LoggerDatapoint {
                    mean: triple[0] as f64,
                    min: triple[1] as f64,
                    max: triple[2] as f64,
                    rms: None,
                    t: self.lost_time + self.samples as f64 * self.period,
                    record_time,
                };
                self.samples += 1;
                point
            })
            .collect();

        let mut drift = None;
        if marker > 0.0 {
            let real = sw - self.fudge_offset;
            let seconds =
                self.lost_time + self.samples.saturating_sub(1) as f64 * self.period - real;
            let ppm = if real > 0.0 { seconds / real * 1e6 } else { 0.0 };
            drift = Some(Drift {
                marker,
                seconds,
                ppm,
            });
            self.last_sw = sw;
        }

        Ok(BlockOutcome {
            points,
            overrun,
            drift,
        })
    }
}
