//! The command dispatch worker.
//!
//! A [Worker] owns the supply on its own thread. Every other thread talks to it through a
//! [Requester], which only enqueues [Command]s, and listens on the [Event] channel handed to
//! [Worker::spawn]. Because the worker is the sole consumer of the queue, no two operations ever
//! interleave on the bus.
//!
//! While idle the worker re-reads the supply state every refresh interval. Acquisitions, logging
//! runs and firmware downloads block the refresh until they finish or are cancelled through
//! [Requester::stop_acquisition].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use fugit::NanosDurationU64;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    bus::BusSession,
    config::{Conf, WorkerSettings},
    error::{Error, Result},
    identity::Capabilities,
    program::ProgramPlan,
    psu::{DISPLAY_TEXT_LEN, Device, PowerSupply},
    register::{CurrentDetector, DisplayState, OutputCompensation, SenseMode, WindowType},
    types::{
        AcquireDetails, Channel, InstrumentState, LoggerDatapoint, MeasArray, OutputState,
        ProgramDetails, Setpoints,
    },
};

/// Below this much time to the next refresh, the refresh is treated as due.
const REFRESH_SLACK: Duration = Duration::from_millis(10);

/// Where the worker is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connected,
    /// An acquisition, logging run or firmware download is in progress.
    Measuring,
    /// The supply could not be attached. Nothing follows but [Event::Done].
    ConnectionFailed,
    Disconnected,
}

/// A state transition, with the controls the supply offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub state: WorkerState,
    pub has_output2: bool,
    pub has_separate_enables: bool,
}

/// Notifications sent by the worker, in the order the operations complete.
#[derive(Debug, Clone)]
pub enum Event {
    StateChanged(StateChange),
    NewState(InstrumentState),
    ProgramDetails(ProgramDetails),
    DataAcquired(MeasArray),
    LogPoints(Vec<LoggerDatapoint>),
    FirmwareWords { address: u16, words: [u32; 4] },
    SystemError(String),
    OutputState(OutputState),
    /// A command failed. The worker carries on with the next one.
    CommandFailed(String),
    /// The worker thread is about to exit.
    Done,
}

/// What can be asked of the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reset,
    SetCurrentRange(f64),
    Program(Setpoints),
    Acquire(AcquireDetails),
    Log {
        channel: Channel,
        mode: SenseMode,
        interval: NanosDurationU64,
    },
    ClearProtection,
    SetDetector(CurrentDetector),
    DownloadFirmware,
    SetDisplayText(heapless::String<DISPLAY_TEXT_LEN>),
    ClearDisplay,
    SetDisplayState(DisplayState),
    SetMeasureWindow(WindowType),
    RestoreOutputState(Channel),
    SetOutputCompensation(OutputCompensation),
    QuerySystemError,
    QueryOutputState,
    ReadProgramDetails,
}

enum Request {
    /// A command and the ticket it was queued under.
    Run(Command, u64),
    Shutdown,
}

/// Stop requests shared by a worker and its requesters.
///
/// Every queued command draws a ticket. A stop cancels every ticket drawn so far, so a command
/// queued after the stop runs normally while the one being stopped can't miss it.
#[derive(Debug, Clone, Default)]
struct StopSignals {
    issued: Arc<AtomicU64>,
    stopped: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl StopSignals {
    fn next_ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stop_issued(&self) {
        let issued = self.issued.load(Ordering::SeqCst);
        self.stopped.fetch_max(issued, Ordering::SeqCst);
    }

    fn token(&self, ticket: u64) -> CancelToken {
        CancelToken {
            ticket,
            signals: self.clone(),
        }
    }
}

/// Checked by a long-running operation between samples and segments.
#[derive(Debug, Clone)]
pub struct CancelToken {
    ticket: u64,
    signals: StopSignals,
}

impl CancelToken {
    /// Stopped by [Requester::stop_acquisition] or by the worker shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.signals.shutdown.load(Ordering::SeqCst)
            || self.signals.stopped.load(Ordering::SeqCst) >= self.ticket
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the worker has shut down")]
pub struct WorkerGone;

/// Enqueues commands for a [Worker]. Cheap to clone, one per producer thread.
#[derive(Debug, Clone)]
pub struct Requester {
    tx: Sender<Request>,
    signals: StopSignals,
}

impl Requester {
    /// Queue `command`. Stops requested earlier don't apply to it.
    pub fn send(&self, command: Command) -> core::result::Result<(), WorkerGone> {
        let ticket = self.signals.next_ticket();
        self.tx
            .send(Request::Run(command, ticket))
            .map_err(|_| WorkerGone)
    }

    /// Cancel the running acquisition, logging run or download, and any still queued.
    pub fn stop_acquisition(&self) {
        self.signals.stop_issued();
    }
}

/// Handle to the worker thread. Dropping it shuts the worker down and waits for it.
pub struct Worker {
    requester: Requester,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a worker whose supply is produced by `connect` on the worker thread.
    pub fn spawn<P, F>(connect: F, settings: WorkerSettings, notify: Sender<Event>) -> Self
    where
        P: PowerSupply + 'static,
        F: FnOnce() -> Result<P, P::BusError> + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let signals = StopSignals::default();

        let worker_signals = signals.clone();
        let handle = thread::spawn(move || {
            match connect() {
                Ok(psu) => {
                    Dispatcher::new(psu, settings, notify.clone(), worker_signals).run(rx)
                }
                Err(err) => {
                    error!("cannot connect to the supply: {err}");
                    emit(
                        &notify,
                        Event::StateChanged(StateChange {
                            state: WorkerState::ConnectionFailed,
                            has_output2: false,
                            has_separate_enables: false,
                        }),
                    );
                }
            }
            emit(&notify, Event::Done);
        });

        Self {
            requester: Requester { tx, signals },
            handle: Some(handle),
        }
    }

    /// Start a worker that attaches whichever supply answers on `session`.
    pub fn spawn_session<S>(session: S, conf: Conf, notify: Sender<Event>) -> Self
    where
        S: BusSession + Send + 'static,
    {
        let settings = conf.worker.clone();
        Self::spawn(move || Device::attach(session, &conf), settings, notify)
    }

    pub fn requester(&self) -> Requester {
        self.requester.clone()
    }

    pub fn stop_acquisition(&self) {
        self.requester.stop_acquisition();
    }

    /// Let the queued commands finish, then stop the worker and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.requester
            .signals
            .shutdown
            .store(true, Ordering::SeqCst);
        // The worker may already be gone after a failed connect.
        let _ = self.requester.tx.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn emit(notify: &Sender<Event>, event: Event) {
    if notify.send(event).is_err() {
        debug!("nobody is listening for worker events");
    }
}

/// The worker thread's side: owns the supply and runs the loop.
struct Dispatcher<P: PowerSupply> {
    psu: P,
    caps: Capabilities,
    settings: WorkerSettings,
    notify: Sender<Event>,
    signals: StopSignals,
    /// Last known operating point, kept current by the commands that change it.
    details: Option<ProgramDetails>,
    /// `None` forces a refresh at the next opportunity.
    last_refresh: Option<Instant>,
}

impl<P: PowerSupply> Dispatcher<P> {
    fn new(psu: P, settings: WorkerSettings, notify: Sender<Event>, signals: StopSignals) -> Self {
        let caps = psu.capabilities();
        Self {
            psu,
            caps,
            settings,
            notify,
            signals,
            details: None,
            last_refresh: None,
        }
    }

    fn run(mut self, rx: Receiver<Request>) {
        self.set_state(WorkerState::Connected);
        match self.psu.read_program_details() {
            Ok(details) => {
                self.details = Some(details.clone());
                self.emit(Event::ProgramDetails(details));
            }
            Err(err) => warn!("cannot read program details: {err}"),
        }
        self.refresh();

        loop {
            match rx.recv_timeout(self.wait()) {
                Ok(Request::Run(command, ticket)) => {
                    debug!("dispatching {command:?}");
                    let cancel = self.signals.token(ticket);
                    if let Err(err) = self.dispatch(command, &cancel) {
                        error!("command failed: {err}");
                        self.emit(Event::CommandFailed(err.to_string()));
                    }
                }
                Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.refresh(),
            }
        }

        self.set_state(WorkerState::Disconnected);
    }

    /// How long to wait for a command before the next refresh.
    fn wait(&self) -> Duration {
        let remaining = self
            .last_refresh
            .map(|at| self.settings.refresh_interval().saturating_sub(at.elapsed()))
            .unwrap_or_default();
        if remaining < REFRESH_SLACK {
            self.settings.min_wait()
        } else {
            remaining
        }
    }

    fn refresh(&mut self) {
        match self.psu.read_state() {
            Ok(state) => self.emit(Event::NewState(state)),
            Err(err) => warn!("state refresh failed: {err}"),
        }
        self.last_refresh = Some(Instant::now());
    }

    fn emit(&self, event: Event) {
        emit(&self.notify, event);
    }

    fn set_state(&self, state: WorkerState) {
        info!("worker {state:?}");
        self.emit(Event::StateChanged(StateChange {
            state,
            has_output2: self.caps.has_output2,
            has_separate_enables: self.caps.has_separate_enables,
        }));
    }

    fn details_changed(&mut self, update: impl FnOnce(&mut ProgramDetails)) {
        if let Some(details) = self.details.as_mut() {
            update(details);
            let details = details.clone();
            self.emit(Event::ProgramDetails(details));
        }
    }

    fn dispatch(&mut self, command: Command, cancel: &CancelToken) -> Result<(), P::BusError> {
        match command {
            Command::Reset => {
                self.psu.reset()?;
                self.last_refresh = None;
            }
            Command::SetCurrentRange(range) => {
                self.psu.set_current_range(range)?;
                self.details_changed(|d| d.current_range = range);
            }
            Command::Program(setpoints) => {
                ProgramPlan::new(&setpoints, &self.caps).apply(&mut self.psu)?;
                self.last_refresh = None;
                self.details_changed(|d| d.program = setpoints);
            }
            Command::Acquire(details) => {
                self.measuring(|worker| worker.acquire(&details, cancel))?;
            }
            Command::Log {
                channel,
                mode,
                interval,
            } => {
                self.measuring(|worker| worker.log(channel, mode, interval, cancel))?;
            }
            Command::ClearProtection => self.psu.clear_protection()?,
            Command::SetDetector(detector) => {
                self.psu.set_current_detector(detector)?;
                self.details_changed(|d| d.detector = detector);
            }
            Command::DownloadFirmware => {
                self.measuring(|worker| worker.download_firmware(cancel))?;
            }
            Command::SetDisplayText(text) => self.psu.set_display_text(&text)?,
            Command::ClearDisplay => self.psu.clear_display_text()?,
            Command::SetDisplayState(state) => self.psu.set_display_state(state)?,
            Command::SetMeasureWindow(window) => self.psu.set_measure_window(window)?,
            Command::RestoreOutputState(channel) => {
                self.psu.restore_output_state(channel)?;
                self.last_refresh = None;
            }
            Command::SetOutputCompensation(comp) => self.psu.set_output_compensation(comp)?,
            Command::QuerySystemError => {
                let err = self.psu.system_error()?;
                self.emit(Event::SystemError(err));
            }
            Command::QueryOutputState => {
                let state = self.psu.output_state()?;
                self.emit(Event::OutputState(state));
            }
            Command::ReadProgramDetails => {
                let details = self.psu.read_program_details()?;
                self.details = Some(details.clone());
                self.emit(Event::ProgramDetails(details));
            }
        }
        Ok(())
    }

    /// Run `op` with the worker reported as measuring.
    fn measuring(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<(), P::BusError>,
    ) -> Result<(), P::BusError> {
        self.set_state(WorkerState::Measuring);
        let result = op(self);
        self.set_state(WorkerState::Connected);
        self.last_refresh = None;
        result
    }

    fn acquire(
        &mut self,
        details: &AcquireDetails,
        cancel: &CancelToken,
    ) -> Result<(), P::BusError> {
        let mut remaining = details.segment_count;
        while remaining > 0 && !cancel.is_cancelled() {
            let count = details.segments_per_run(remaining);
            self.psu.start_transient(details, count)?;

            while !self.psu.is_measurement_finished()? && !cancel.is_cancelled() {
                thread::sleep(self.settings.acquisition_poll());
            }
            if cancel.is_cancelled() {
                info!("acquisition cancelled, {remaining} segments left");
                return self.psu.abort_measurement();
            }

            let data = self.psu.finish_transient(details, count)?;
            self.emit(Event::DataAcquired(data));
            remaining -= count;
        }
        Ok(())
    }

    /// A logging run. The supply is taken out of logging mode however the run ends.
    fn log(
        &mut self,
        channel: Channel,
        mode: SenseMode,
        interval: NanosDurationU64,
        cancel: &CancelToken,
    ) -> Result<(), P::BusError> {
        self.psu.setup_logging(channel, mode, interval)?;
        match self.log_until_cancelled(channel, mode, cancel) {
            Ok(()) => self.psu.stop_logging(),
            Err(err) => {
                if let Err(stop_err) = self.psu.stop_logging() {
                    warn!("cannot stop logging: {stop_err}");
                }
                Err(err)
            }
        }
    }

    fn log_until_cancelled(
        &mut self,
        channel: Channel,
        mode: SenseMode,
        cancel: &CancelToken,
    ) -> Result<(), P::BusError> {
        while !cancel.is_cancelled() {
            match self.psu.measure_logging_point(channel, mode) {
                Ok(points) if points.is_empty() => {
                    thread::sleep(self.settings.acquisition_poll())
                }
                Ok(points) => self.emit(Event::LogPoints(points)),
                Err(
                    err @ (Error::Timeout
                    | Error::Transport(_)
                    | Error::Format(_)
                    | Error::ProtocolViolation(_)),
                ) => {
                    warn!("logging point lost: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn download_firmware(&mut self, cancel: &CancelToken) -> Result<(), P::BusError> {
        for address in (0..=u16::MAX).step_by(4) {
            if cancel.is_cancelled() {
                info!("firmware download cancelled at {address:#06x}");
                break;
            }
            match self.psu.peek_firmware(address)? {
                Some(words) => self.emit(Event::FirmwareWords { address, words }),
                None => {
                    warn!("this supply can't read out its firmware");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::ScpiBus,
        identity::DeviceIdentity,
        mock_bus::{MockBus, MockBusError, RecordingSupply},
        psu::SweepSupply,
        register::TriggerSlope,
        types::AcquireDetailsBuilder,
    };

    const B2962A: &str = "Keysight Technologies,B2962A,MY1,3.4.2011.5100";
    const HP66319D: &str = "Agilent Technologies,66319D,MY1,A.03.01";

    fn settings() -> WorkerSettings {
        WorkerSettings {
            acquisition_poll_ms: 2,
            ..Conf::defaults().unwrap().worker
        }
    }

    fn start(psu: &RecordingSupply) -> (Worker, Receiver<Event>) {
        let (tx, rx) = unbounded();
        let psu = psu.clone();
        let worker = Worker::spawn(move || Ok(psu), settings(), tx);
        (worker, rx)
    }

    fn wait_for(rx: &Receiver<Event>, wanted: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("event did not arrive");
            if wanted(&event) {
                return event;
            }
        }
    }

    fn is_state(event: &Event, state: WorkerState) -> bool {
        matches!(event, Event::StateChanged(change) if change.state == state)
    }

    #[test]
    fn connect_announces_capabilities() {
        let psu = RecordingSupply::new(B2962A);
        let (worker, rx) = start(&psu);

        let Event::StateChanged(change) = rx.recv_timeout(Duration::from_secs(5)).unwrap() else {
            panic!("first event should be a state change");
        };
        assert_eq!(
            change,
            StateChange {
                state: WorkerState::Connected,
                has_output2: true,
                has_separate_enables: true,
            }
        );
        let Event::ProgramDetails(details) = rx.recv_timeout(Duration::from_secs(5)).unwrap()
        else {
            panic!("program details should follow");
        };
        assert_eq!(details.identity, B2962A);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::NewState(_)
        ));

        worker.shutdown();
        let rest: Vec<Event> = rx.try_iter().collect();
        assert!(is_state(&rest[rest.len() - 2], WorkerState::Disconnected));
        assert!(matches!(rest.last(), Some(Event::Done)));
    }

    #[test]
    fn failed_connect_is_terminal() {
        let (tx, rx) = unbounded();
        let worker = Worker::spawn(
            || Err::<RecordingSupply, _>(Error::<MockBusError>::Timeout),
            settings(),
            tx,
        );
        assert!(is_state(
            &rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            WorkerState::ConnectionFailed
        ));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::Done
        ));
        drop(worker);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn commands_from_many_threads_run_one_at_a_time() {
        let psu = RecordingSupply::new(B2962A);
        let (worker, _rx) = start(&psu);

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let requester = worker.requester();
                thread::spawn(move || {
                    for n in 0..25 {
                        requester
                            .send(Command::SetCurrentRange((p * 100 + n) as f64))
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        worker.shutdown();

        let ranges: Vec<u32> = psu
            .calls()
            .iter()
            .filter_map(|c| c.strip_prefix("range "))
            .map(|r| r.parse().unwrap())
            .collect();
        assert_eq!(ranges.len(), 100);
        for p in 0..4 {
            let mine: Vec<u32> = ranges.iter().copied().filter(|r| r / 100 == p).collect();
            assert_eq!(mine, (0..25).map(|n| p * 100 + n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn acquisition_is_split_into_runs() {
        let psu = RecordingSupply::new(HP66319D);
        let (worker, rx) = start(&psu);
        let details = AcquireDetailsBuilder::new(
            SenseMode::Current,
            1000,
            NanosDurationU64::micros(20),
        )
        .with_trigger(TriggerSlope::Positive, 0.1, 0.01)
        .with_segments(10)
        .build()
        .unwrap();
        *psu.busy_polls.lock().unwrap() = 3;

        worker.requester().send(Command::Acquire(details)).unwrap();
        wait_for(&rx, |e| is_state(e, WorkerState::Measuring));
        let mut segments = Vec::new();
        loop {
            match wait_for(&rx, |e| {
                matches!(e, Event::DataAcquired(_)) || is_state(e, WorkerState::Connected)
            }) {
                Event::DataAcquired(data) => segments.push(data.segments.len()),
                _ => break,
            }
        }
        worker.shutdown();

        assert_eq!(segments, vec![4, 4, 2]);
        let runs: Vec<String> = psu
            .calls()
            .into_iter()
            .filter(|c| c.contains("transient"))
            .collect();
        assert_eq!(
            runs,
            vec![
                "start transient 4",
                "finish transient 4",
                "start transient 4",
                "finish transient 4",
                "start transient 2",
                "finish transient 2",
            ]
        );
    }

    #[test]
    fn stop_aborts_the_acquisition() {
        let psu = RecordingSupply::new(HP66319D);
        let (worker, rx) = start(&psu);
        *psu.busy_polls.lock().unwrap() = u32::MAX;
        let details = AcquireDetailsBuilder::new(
            SenseMode::Voltage,
            100,
            NanosDurationU64::micros(20),
        )
        .with_segments(5)
        .build()
        .unwrap();

        worker.requester().send(Command::Acquire(details)).unwrap();
        wait_for(&rx, |e| is_state(e, WorkerState::Measuring));
        worker.stop_acquisition();
        wait_for(&rx, |e| is_state(e, WorkerState::Connected));
        worker.shutdown();

        let calls = psu.calls();
        assert!(calls.contains(&"start transient 1".to_string()));
        assert!(calls.contains(&"abort".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("finish")));
        assert!(!rx.try_iter().any(|e| matches!(e, Event::DataAcquired(_))));
    }

    #[test]
    fn logging_runs_until_stopped() {
        let psu = RecordingSupply::new(HP66319D);
        let (worker, rx) = start(&psu);
        let requester = worker.requester();
        requester
            .send(Command::Log {
                channel: Channel::One,
                mode: SenseMode::Current,
                interval: NanosDurationU64::millis(10),
            })
            .unwrap();

        let Event::LogPoints(points) = wait_for(&rx, |e| matches!(e, Event::LogPoints(_))) else {
            unreachable!()
        };
        assert_eq!(points[0].mean, 1.0);
        requester.stop_acquisition();
        wait_for(&rx, |e| is_state(e, WorkerState::Connected));
        worker.shutdown();

        let calls = psu.calls();
        let setup = calls
            .iter()
            .position(|c| c == "setup logging One Current")
            .unwrap();
        let stop = calls.iter().position(|c| c == "stop logging").unwrap();
        assert!(setup < stop);
    }

    #[test]
    fn stop_then_next_command_ends_the_running_log() {
        let psu = RecordingSupply::new(HP66319D);
        let (worker, rx) = start(&psu);
        let requester = worker.requester();
        requester
            .send(Command::Log {
                channel: Channel::One,
                mode: SenseMode::Current,
                interval: NanosDurationU64::millis(10),
            })
            .unwrap();
        wait_for(&rx, |e| matches!(e, Event::LogPoints(_)));

        requester.stop_acquisition();
        let details = AcquireDetailsBuilder::new(
            SenseMode::Current,
            10,
            NanosDurationU64::micros(20),
        )
        .build()
        .unwrap();
        requester.send(Command::Acquire(details)).unwrap();

        wait_for(&rx, |e| is_state(e, WorkerState::Connected));
        wait_for(&rx, |e| matches!(e, Event::DataAcquired(_)));
        worker.shutdown();

        let calls = psu.calls();
        let stop = calls.iter().position(|c| c == "stop logging").unwrap();
        let next = calls.iter().position(|c| c == "start transient 1").unwrap();
        assert!(stop < next);
    }

    #[test]
    fn malformed_log_reply_is_skipped() {
        const MEASURE: &str = "MEAS:CURR?;:FETCH:CURR:MIN?;MAX?;ACDC?";
        let bus = MockBus::new();
        bus.reply("*PSC?", "1");
        bus.reply("SYSTem:ERRor?", "+0,\"No error\"");
        bus.reply("*OPC?", "1");
        bus.reply("ABORT;*OPC?", "1");
        bus.reply(MEASURE, "+1.0;+0.9;+1.1;+1.0")
            .reply(MEASURE, "+1.0;+0.9;+1.1")
            .reply(MEASURE, "+2.0;+1.9;+2.1;+2.0");

        let (tx, rx) = unbounded();
        let session = bus.clone();
        let worker = Worker::spawn(
            move || -> Result<SweepSupply<MockBus>, MockBusError> {
                let identity = DeviceIdentity::parse("Agilent Technologies,66309D,0,A.02.01")?;
                SweepSupply::new(ScpiBus::new(session), identity)
            },
            settings(),
            tx,
        );
        worker
            .requester()
            .send(Command::Log {
                channel: Channel::One,
                mode: SenseMode::Current,
                interval: NanosDurationU64::millis(10),
            })
            .unwrap();

        let mut means = Vec::new();
        while means.len() < 3 {
            if let Event::LogPoints(points) = wait_for(&rx, |e| {
                matches!(e, Event::LogPoints(_) | Event::CommandFailed(_))
            }) {
                means.extend(points.iter().map(|p| p.mean));
            } else {
                panic!("logging run ended on a malformed reply");
            }
        }
        worker.stop_acquisition();
        wait_for(&rx, |e| is_state(e, WorkerState::Connected));
        worker.shutdown();

        assert_eq!(means[..3], [1.0, 2.0, 2.0]);
        assert!(bus.lines().iter().any(|l| l == "ABORT;*OPC?"));
        assert!(!rx.try_iter().any(|e| matches!(e, Event::CommandFailed(_))));
    }

    #[test]
    fn new_run_clears_an_old_stop() {
        let psu = RecordingSupply::new(HP66319D);
        let (worker, rx) = start(&psu);
        worker.stop_acquisition();
        let details = AcquireDetailsBuilder::new(
            SenseMode::Current,
            10,
            NanosDurationU64::micros(20),
        )
        .build()
        .unwrap();
        worker.requester().send(Command::Acquire(details)).unwrap();
        wait_for(&rx, |e| matches!(e, Event::DataAcquired(_)));
        worker.shutdown();
    }

    #[test]
    fn firmware_walks_the_address_space() {
        let psu = RecordingSupply::new(HP66319D);
        let (worker, rx) = start(&psu);
        worker.requester().send(Command::DownloadFirmware).unwrap();
        wait_for(&rx, |e| is_state(e, WorkerState::Measuring));

        let mut addresses = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Event::FirmwareWords { address, words } => {
                    assert_eq!(words[0], address as u32);
                    addresses.push(address);
                }
                event if is_state(&event, WorkerState::Connected) => break,
                _ => {}
            }
        }
        worker.shutdown();

        assert_eq!(addresses.len(), 0x4000);
        assert_eq!(addresses.first(), Some(&0));
        assert_eq!(addresses.last(), Some(&0xFFFC));
    }

    #[test]
    fn program_updates_the_cached_details() {
        let psu = RecordingSupply::new(B2962A);
        let (worker, rx) = start(&psu);
        let setpoints = Setpoints {
            enabled1: true,
            v1: 5.0,
            i1: 0.1,
            ..Default::default()
        };
        let requester = worker.requester();
        requester.send(Command::Program(setpoints)).unwrap();
        requester.send(Command::SetDetector(CurrentDetector::AcDc)).unwrap();
        requester.send(Command::QuerySystemError).unwrap();
        requester
            .send(Command::SetDisplayText(heapless::String::try_from("HELLO").unwrap()))
            .unwrap();
        worker.shutdown();

        let events: Vec<Event> = rx.try_iter().collect();
        let last_details = events
            .iter()
            .filter_map(|e| match e {
                Event::ProgramDetails(d) => Some(d),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_details.program, setpoints);
        assert_eq!(last_details.detector, CurrentDetector::AcDc);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::SystemError(s) if s.starts_with("+0")))
        );
        assert!(psu.calls().contains(&"text HELLO".to_string()));
        assert!(psu.calls().contains(&"iv1 5 0.1".to_string()));
    }

    #[test]
    fn send_after_shutdown_fails() {
        let psu = RecordingSupply::new(B2962A);
        let (worker, _rx) = start(&psu);
        let requester = worker.requester();
        worker.shutdown();
        assert_eq!(requester.send(Command::ClearProtection), Err(WorkerGone));
    }
}
