//! We use this mocking module in unit tests to emulate an instrument session.
//!
//! [MockBus] answers command lines from a table of canned replies, [RecordingSupply] stands in
//! for a whole supply when only the order of driver calls matters.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use fugit::NanosDurationU64;
use thiserror::Error;

use crate::{
    bus::BusSession,
    error::Result,
    identity::{Capabilities, DeviceIdentity},
    psu::PowerSupply,
    register::{CurrentDetector, DisplayState, OutputCompensation, SenseMode, WindowType},
    types::{
        AcquireDetails, Channel, InstrumentState, LoggerDatapoint, MeasArray, OutputState,
        ProgramDetails,
    },
};

#[derive(Debug, Error)]
pub enum MockBusError {
    /// Nothing left to read.
    #[error("mock bus timed out")]
    Timeout,
    #[error("simulated bus failure")]
    SimulatedError,
}

impl embedded_io::Error for MockBusError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockBusError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockBusError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Replies per command line. The last reply of a queue is repeated forever.
    replies: HashMap<String, VecDeque<Vec<u8>>>,
    /// Bytes the "instrument" has sent which haven't been read yet.
    pending: VecDeque<u8>,
    /// Written bytes not yet terminated by a newline.
    partial: Vec<u8>,
    /// Every complete line written, in order.
    lines: Vec<String>,
    /// Maximum bytes handed out per read. `0` means unlimited.
    chunk: usize,
    timeout: Option<Duration>,
    clears: usize,
    should_error_on_write: bool,
    /// Reads report end of stream, like a session whose link went away.
    closed: bool,
}

impl Inner {
    fn line_written(&mut self, line: String) {
        if let Some(queue) = self.replies.get_mut(&line) {
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(reply) = reply {
                self.pending.extend(reply);
            }
        }
        self.lines.push(line);
    }
}

/// Our mock type used to emulate a message-based session.
///
/// Clones share the same state, so a test can keep one handle while the driver owns another.
#[derive(Clone, Default)]
pub struct MockBus {
    inner: Arc<Mutex<Inner>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `cmd` with `response` plus a newline.
    ///
    /// Several replies for the same command are handed out in order.
    pub fn reply(&self, cmd: &str, response: &str) -> &Self {
        let mut bytes = response.as_bytes().to_vec();
        bytes.push(b'\n');
        self.reply_raw(cmd, bytes)
    }

    /// Answer `cmd` with exactly these bytes.
    pub fn reply_raw(&self, cmd: &str, bytes: Vec<u8>) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .replies
            .entry(cmd.to_string())
            .or_default()
            .push_back(bytes);
        self
    }

    /// Make bytes readable right away, unprompted.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().pending.extend(bytes);
    }

    /// Limit how many bytes one read returns.
    pub fn set_chunk(&self, chunk: usize) {
        self.inner.lock().unwrap().chunk = chunk;
    }

    /// Configure whether write operations should fail with an error.
    pub fn set_write_error(&self, should_error: bool) {
        self.inner.lock().unwrap().should_error_on_write = should_error;
    }

    /// Drop the link: every later read returns zero bytes.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    /// Every command line written so far.
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().unwrap().lines.clone()
    }

    /// Forget the lines written so far.
    pub fn clear_lines(&self) {
        self.inner.lock().unwrap().lines.clear();
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().timeout
    }

    pub fn clear_count(&self) -> usize {
        self.inner.lock().unwrap().clears
    }
}

impl embedded_io::ErrorType for MockBus {
    type Error = MockBusError;
}

impl embedded_io::Write for MockBus {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.should_error_on_write {
            return Err(MockBusError::SimulatedError);
        }
        for &byte in buf {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&inner.partial).into_owned();
                inner.partial.clear();
                inner.line_written(line);
            } else {
                inner.partial.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl embedded_io::Read for MockBus {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(0);
        }
        if inner.pending.is_empty() {
            return Err(MockBusError::Timeout);
        }
        let mut count = buf.len().min(inner.pending.len());
        if inner.chunk > 0 {
            count = count.min(inner.chunk);
        }
        for slot in buf.iter_mut().take(count) {
            *slot = inner.pending.pop_front().unwrap();
        }
        Ok(count)
    }
}

impl BusSession for MockBus {
    fn set_timeout(&mut self, timeout: Duration) -> core::result::Result<(), Self::Error> {
        self.inner.lock().unwrap().timeout = Some(timeout);
        Ok(())
    }

    fn clear(&mut self) -> core::result::Result<(), Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
        inner.clears += 1;
        Ok(())
    }
}

/// A supply which only records which driver calls it received.
#[derive(Clone)]
pub struct RecordingSupply {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub identity: DeviceIdentity,
    /// Transient polls answered with "not finished" before reporting done.
    pub busy_polls: Arc<Mutex<u32>>,
}

impl RecordingSupply {
    pub fn new(idn: &str) -> Self {
        Self {
            calls: Arc::default(),
            identity: DeviceIdentity::parse(idn).unwrap(),
            busy_polls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PowerSupply for RecordingSupply {
    type BusError = MockBusError;

    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capabilities(&self) -> Capabilities {
        self.identity.model.capabilities()
    }

    fn reset(&mut self) -> Result<(), MockBusError> {
        self.record("reset".into());
        Ok(())
    }

    fn set_ocp(&mut self, enabled: bool) -> Result<(), MockBusError> {
        self.record(format!("ocp {enabled}"));
        Ok(())
    }

    fn set_ovp(&mut self, level: Option<f64>) -> Result<(), MockBusError> {
        self.record(format!("ovp {level:?}"));
        Ok(())
    }

    fn set_output_compensation(&mut self, comp: OutputCompensation) -> Result<(), MockBusError> {
        self.record(format!("compensation {comp:?}"));
        Ok(())
    }

    fn set_current_detector(&mut self, detector: CurrentDetector) -> Result<(), MockBusError> {
        self.record(format!("detector {detector:?}"));
        Ok(())
    }

    fn clear_protection(&mut self) -> Result<(), MockBusError> {
        self.record("clear protection".into());
        Ok(())
    }

    fn set_current_range(&mut self, range: f64) -> Result<(), MockBusError> {
        self.record(format!("range {range}"));
        Ok(())
    }

    fn set_iv(&mut self, channel: u8, voltage: f64, current: f64) -> Result<(), MockBusError> {
        self.record(format!("iv{channel} {voltage} {current}"));
        Ok(())
    }

    fn enable_output(&mut self, channel: Channel, enabled: bool) -> Result<(), MockBusError> {
        self.record(format!("output {channel:?} {enabled}"));
        Ok(())
    }

    fn set_display_state(&mut self, state: DisplayState) -> Result<(), MockBusError> {
        self.record(format!("display {state:?}"));
        Ok(())
    }

    fn set_display_text(&mut self, text: &str) -> Result<(), MockBusError> {
        self.record(format!("text {text}"));
        Ok(())
    }

    fn clear_display_text(&mut self) -> Result<(), MockBusError> {
        self.record("clear text".into());
        Ok(())
    }

    fn set_measure_window(&mut self, window: WindowType) -> Result<(), MockBusError> {
        self.record(format!("window {window:?}"));
        Ok(())
    }

    fn read_state(&mut self) -> Result<InstrumentState, MockBusError> {
        self.record("state".into());
        Ok(InstrumentState::default())
    }

    fn read_program_details(&mut self) -> Result<ProgramDetails, MockBusError> {
        self.record("details".into());
        Ok(ProgramDetails {
            capabilities: self.capabilities(),
            identity: self.identity.raw.clone(),
            ..Default::default()
        })
    }

    fn output_state(&mut self) -> Result<OutputState, MockBusError> {
        self.record("output state".into());
        Ok(OutputState::default())
    }

    fn restore_output_state(&mut self, channel: Channel) -> Result<(), MockBusError> {
        self.record(format!("restore {channel:?}"));
        Ok(())
    }

    fn system_error(&mut self) -> Result<String, MockBusError> {
        self.record("syst err".into());
        Ok("+0,\"No error\"".into())
    }

    fn abort_measurement(&mut self) -> Result<(), MockBusError> {
        self.record("abort".into());
        Ok(())
    }

    fn setup_logging(
        &mut self,
        channel: Channel,
        mode: SenseMode,
        _interval: NanosDurationU64,
    ) -> Result<(), MockBusError> {
        self.record(format!("setup logging {channel:?} {mode:?}"));
        Ok(())
    }

    fn measure_logging_point(
        &mut self,
        _channel: Channel,
        _mode: SenseMode,
    ) -> Result<Vec<LoggerDatapoint>, MockBusError> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(vec![LoggerDatapoint::single(1.0, 0.0)])
    }

    fn stop_logging(&mut self) -> Result<(), MockBusError> {
        self.record("stop logging".into());
        Ok(())
    }

    fn start_transient(
        &mut self,
        _details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<(), MockBusError> {
        self.record(format!("start transient {trigger_count}"));
        Ok(())
    }

    fn is_measurement_finished(&mut self) -> Result<bool, MockBusError> {
        let mut busy = self.busy_polls.lock().unwrap();
        if *busy > 0 {
            *busy -= 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn finish_transient(
        &mut self,
        details: &AcquireDetails,
        trigger_count: u32,
    ) -> Result<MeasArray, MockBusError> {
        self.record(format!("finish transient {trigger_count}"));
        Ok(MeasArray {
            mode: details.sense_mode,
            time_interval: 15.6e-6,
            segments: vec![vec![0.0; details.num_points as usize]; trigger_count as usize],
        })
    }

    fn peek_firmware(&mut self, address: u16) -> Result<Option<[u32; 4]>, MockBusError> {
        Ok(Some([address as u32, 0, 0, 0]))
    }
}
