//! The session control loop.
//!
//! One reactor thread owns the transport and the debuggee child process and
//! drives all channel I/O. Incoming frames are matched against the
//! pending-response table first; the rest are unsolicited events handled
//! here. The [Session](super::Session) handle shares only the state behind
//! the mutex and talks to the reactor through the op channel plus the
//! transport waker.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Path, PathBuf},
    process::Child,
    sync::{mpsc, Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    protocol::{
        events::{ExeFlags, InitEvent, StoppedEvent},
        parse_debug_output, parse_error_event, BreakpointAction, Command, EventTag, Frame,
        SourceLocation, StopCode, PROTOCOL_VERSION,
    },
    transport::{Transport, TransportEvent},
};

use num_traits::FromPrimitive as _;

use super::{
    pending::PendingTable,
    procedures::ProcedureIndex,
    Notification, OutputCategory, SessionError, SessionPhase, StopReason, Variable,
};

/// Pseudo event id used to await transport connection through the pending
/// table. No real event uses this id.
pub(crate) const CONNECTED_EVENT: u32 = u32::MAX;

/// Deadline for the Init/ExeMode handshake events.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for a command round-trip.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for launch setup (transport connect, debuggee attach).
pub(crate) const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for the background compile.
pub(crate) const COMPILE_TIMEOUT: Duration = Duration::from_secs(15);

/// Requests from the session handle to the reactor thread.
pub(crate) enum Op {
    /// Send a frame to the debuggee.
    Send(Frame),
    /// Take ownership of the spawned debuggee.
    AdoptChild(Child),
    /// Open the adapter side of the channel (FIFO transports).
    Connect,
    /// Tear the session down, optionally killing the debuggee.
    Shutdown { kill: bool },
}

/// Cheap handle for talking to the reactor thread.
#[derive(Clone)]
pub(crate) struct Handle {
    ops: mpsc::Sender<Op>,
    waker: Arc<mio::Waker>,
}

impl Handle {
    /// Queues an op and wakes the reactor.
    pub(crate) fn op(&self, op: Op) -> Result<(), SessionError> {
        self.ops.send(op).map_err(|_| SessionError::Disconnected)?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Controller state shared between the session handle and the reactor.
pub(crate) struct Shared {
    pub(crate) phase: SessionPhase,
    pub(crate) pending: PendingTable,
    pub(crate) notify: mpsc::Sender<Notification>,

    pub(crate) stop_on_entry: bool,
    pub(crate) program: Option<PathBuf>,
    pub(crate) compile: Option<Result<PathBuf, String>>,
    pub(crate) communication: Option<String>,

    pub(crate) connected: bool,
    pub(crate) init_seen: bool,
    pub(crate) exemode_seen: bool,

    pub(crate) exe_flags: ExeFlags,
    pub(crate) file_map: Vec<Option<PathBuf>>,
    pub(crate) breakpoints: BTreeMap<PathBuf, BTreeSet<u32>>,
    pub(crate) stopped_at: Option<SourceLocation>,
    pub(crate) entry_stop_seen: bool,

    pub(crate) stop_generation: u64,
    pub(crate) globals_cache: Option<(u64, Vec<Variable>)>,
    pub(crate) locals_cache: Option<(u64, u32, Vec<Variable>)>,
    pub(crate) procedures: ProcedureIndex,
}

impl Shared {
    pub(crate) fn new(notify: mpsc::Sender<Notification>) -> Self {
        Self {
            phase: SessionPhase::Initialized,
            pending: PendingTable::default(),
            notify,
            stop_on_entry: false,
            program: None,
            compile: None,
            communication: None,
            connected: false,
            init_seen: false,
            exemode_seen: false,
            exe_flags: ExeFlags::default(),
            file_map: Vec::new(),
            breakpoints: BTreeMap::new(),
            stopped_at: None,
            entry_stop_seen: false,
            stop_generation: 0,
            globals_cache: None,
            locals_cache: None,
            procedures: ProcedureIndex::new(None),
        }
    }

    /// Emits a client notification unless the session is already
    /// terminated.
    pub(crate) fn emit(&self, notification: Notification) {
        if self.phase == SessionPhase::Terminated {
            return;
        }

        let _ = self.notify.send(notification);
    }

    /// Performs a state transition, or logs and refuses if the transition
    /// is not in the allowed graph.
    pub(crate) fn transition(&mut self, to: SessionPhase) -> bool {
        if self.phase.can_transition(to) {
            log::debug!("session state {:?} -> {to:?}", self.phase);
            self.phase = to;
            true
        } else {
            log::error!("refusing state transition {:?} -> {to:?}", self.phase);
            false
        }
    }

    /// Enters the absorbing terminated state, emitting the notification on
    /// the way in. Safe to call repeatedly.
    pub(crate) fn terminate(&mut self) {
        if self.phase == SessionPhase::Terminated {
            return;
        }

        let _ = self.notify.send(Notification::Terminated);
        self.phase = SessionPhase::Terminated;
    }

    /// True once the debuggee is launched and the session has not ended:
    /// the window in which breakpoint changes go out immediately.
    pub(crate) fn is_live(&self) -> bool {
        matches!(self.phase, SessionPhase::Running | SessionPhase::Stopped)
    }

    /// Sends a line of output to the front end.
    pub(crate) fn output(&self, category: OutputCategory, text: impl Into<String>) {
        self.emit(Notification::Output {
            category,
            text: text.into(),
        });
    }

    /// Populates the file map and procedure index from an `Init` event.
    /// Indexes already resolved in this session are never rewritten.
    pub(crate) fn apply_init(&mut self, init: &InitEvent) {
        if init.version != PROTOCOL_VERSION {
            log::warn!(
                "debuggee speaks protocol version {}, expected {PROTOCOL_VERSION}",
                init.version
            );
        }

        let working_dir = PathBuf::from(&init.working_dir);

        let main_source = if init.main_source.is_empty() {
            self.program.clone()
        } else {
            Some(resolve_path(&working_dir, &init.main_source))
        };

        if let Some(main_source) = main_source {
            let workspace = main_source.parent().map(Path::to_path_buf);
            self.set_file(0, main_source);
            if workspace.is_some() {
                self.procedures = ProcedureIndex::new(workspace);
            }
        }

        for (i, include) in init.includes.iter().enumerate() {
            let path = resolve_path(&working_dir, include);
            self.set_file(i as u32 + 1, path);
        }
    }

    fn set_file(&mut self, index: u32, path: PathBuf) {
        let index = index as usize;
        if self.file_map.len() <= index {
            self.file_map.resize(index + 1, None);
        }

        if self.file_map[index].is_none() {
            let path = normalize(&path);
            log::debug!("file map [{index}] = {}", path.display());
            self.file_map[index] = Some(path);
        }
    }

    /// The source path for a protocol file index.
    pub(crate) fn file_path(&self, index: u32) -> Option<&PathBuf> {
        self.file_map.get(index as usize).and_then(Option::as_ref)
    }

    /// The protocol file index for a source path, if the file map has
    /// learned it.
    pub(crate) fn file_index(&self, path: &Path) -> Option<u32> {
        let path = normalize(path);
        self.file_map
            .iter()
            .position(|entry| entry.as_deref() == Some(path.as_path()))
            .map(|i| i as u32)
    }

    /// The frames that reprogram the debuggee's breakpoints for one source
    /// file: a clear for the whole file, then one add per line. `None` when
    /// the file map cannot resolve the path yet.
    pub(crate) fn breakpoint_frames_for(&self, path: &Path) -> Option<Vec<Frame>> {
        let index = self.file_index(path)?;
        let lines = self.breakpoints.get(&normalize(path));

        let mut frames = vec![Command::Breakpoint {
            action: BreakpointAction::Clear,
            location: SourceLocation::new(index, 0),
        }
        .into_frame()];

        for &line in lines.into_iter().flatten() {
            frames.push(
                Command::Breakpoint {
                    action: BreakpointAction::Add,
                    location: SourceLocation::new(index, line.saturating_sub(1)),
                }
                .into_frame(),
            );
        }

        Some(frames)
    }

    /// Breakpoint frames for every registered path the file map resolves.
    pub(crate) fn all_breakpoint_frames(&self) -> Vec<Frame> {
        self.breakpoints
            .keys()
            .filter_map(|path| self.breakpoint_frames_for(path))
            .flatten()
            .collect()
    }
}

/// Normalizes a path for file-map comparisons.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn resolve_path(working_dir: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        working_dir.join(path)
    }
}

pub(crate) struct Reactor {
    transport: Transport,
    shared: Arc<Mutex<Shared>>,
    ops: mpsc::Receiver<Op>,
    child: Option<Child>,
}

impl Reactor {
    /// Moves the transport onto a new reactor thread and returns the
    /// handle for talking to it.
    pub(crate) fn spawn(transport: Transport, shared: Arc<Mutex<Shared>>) -> io::Result<Handle> {
        let waker = Arc::new(transport.waker()?);
        let (ops_tx, ops_rx) = mpsc::channel();

        let mut reactor = Reactor {
            transport,
            shared,
            ops: ops_rx,
            child: None,
        };

        std::thread::Builder::new()
            .name("pbdebug-session".to_string())
            .spawn(move || {
                if let Err(err) = reactor.run() {
                    log::error!("session reactor failed: {err}");
                }
            })?;

        Ok(Handle {
            ops: ops_tx,
            waker,
        })
    }

    fn run(&mut self) -> io::Result<()> {
        loop {
            while let Ok(op) = self.ops.try_recv() {
                match op {
                    Op::Send(frame) => {
                        log::debug!(
                            "ADAPTER [{}]: value1={:#010x} value2={:#010x} {} payload bytes",
                            frame.command,
                            frame.value1,
                            frame.value2,
                            frame.data.len()
                        );
                        if let Err(err) = self.transport.send(&frame) {
                            return self.fail(err);
                        }
                    }
                    Op::AdoptChild(child) => self.child = Some(child),
                    Op::Connect => match self.transport.connect() {
                        Ok(true) => self.on_connected(),
                        Ok(false) => {}
                        Err(err) => return self.fail(err),
                    },
                    Op::Shutdown { kill } => {
                        self.cleanup(kill);
                        return Ok(());
                    }
                }
            }

            let timeout = self.next_timeout();
            let events = match self.transport.poll_events(timeout) {
                Ok(events) => events,
                Err(err) => return self.fail(err),
            };

            for event in events {
                match event {
                    TransportEvent::Connected => self.on_connected(),
                    TransportEvent::Frame(frame) => {
                        if self.on_frame(frame) {
                            self.cleanup_after_exit();
                            return Ok(());
                        }
                    }
                    TransportEvent::Closed => {
                        self.on_closed();
                        return Ok(());
                    }
                }
            }

            self.shared.lock().unwrap().pending.expire(Instant::now());
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let deadline = self.shared.lock().unwrap().pending.next_deadline()?;

        Some(
            deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1)),
        )
    }

    fn on_connected(&mut self) {
        log::debug!("debuggee attached");
        let mut shared = self.shared.lock().unwrap();
        shared.connected = true;
        shared.pending.complete(CONNECTED_EVENT, Frame::default());
    }

    // Returns true when the session is over and the reactor should exit.
    fn on_frame(&mut self, frame: Frame) -> bool {
        let mut shared = self.shared.lock().unwrap();

        log::debug!(
            "DEBUGGEE [{}]: value1={:#010x} value2={:#010x} {} payload bytes",
            frame.command,
            frame.value1,
            frame.value2,
            frame.data.len()
        );

        if shared.pending.complete(frame.command, frame.clone()) {
            return false;
        }

        match EventTag::from_u32(frame.command) {
            Some(EventTag::Init) => match InitEvent::parse(&frame) {
                Ok(init) => {
                    shared.apply_init(&init);
                    shared.init_seen = true;

                    // Newly resolved paths may unlock queued breakpoints.
                    // During launch the configuration-done flush covers
                    // this; afterwards it is on us.
                    if shared.is_live() {
                        let frames = shared.all_breakpoint_frames();
                        Self::send_all(&mut self.transport, &mut shared, frames);
                    }
                }
                Err(err) => log::warn!("unparseable Init event: {err}"),
            },
            Some(EventTag::ExeMode) => {
                shared.exe_flags = ExeFlags::from_event(&frame);
                shared.exemode_seen = true;
                log::debug!("executable mode flags: {:?}", shared.exe_flags);
            }
            Some(EventTag::Stopped) => Self::on_stopped(&mut self.transport, &mut shared, &frame),
            Some(EventTag::Continued) => {
                if shared.phase == SessionPhase::Stopped
                    && shared.transition(SessionPhase::Running)
                {
                    shared.emit(Notification::Continued);
                }
            }
            Some(EventTag::End) => {
                shared.output(OutputCategory::Console, "debuggee exited\n");
                shared.terminate();
                shared.pending.cancel_all();
                return true;
            }
            Some(EventTag::Error) => {
                let (location, description) = parse_error_event(&frame);
                shared.stopped_at = Some(location);
                shared.stop_generation += 1;

                shared.output(OutputCategory::Stderr, format!("{description}\n"));
                if shared.phase == SessionPhase::Running
                    && shared.transition(SessionPhase::Stopped)
                {
                    shared.emit(Notification::Stopped {
                        reason: StopReason::Exception,
                        thread_id: super::THREAD_ID,
                    });
                }
            }
            Some(EventTag::Debug) | Some(EventTag::DebugDouble) | Some(EventTag::DebugQuad) => {
                let text = parse_debug_output(&frame, shared.exe_flags);
                shared.output(OutputCategory::Stdout, format!("{text}\n"));
            }
            Some(tag) => log::debug!("ignoring unexpected event {tag:?}"),
            // Id 29 lands here too; its purpose is undocumented.
            None => log::trace!("ignoring unknown event id {}", frame.command),
        }

        false
    }

    fn on_stopped(transport: &mut Transport, shared: &mut Shared, frame: &Frame) {
        let event = StoppedEvent::parse(frame);
        shared.stopped_at = Some(event.location);
        shared.stop_generation += 1;

        let mut reason = match StopCode::from_u32(event.code) {
            Some(StopCode::CallDebugger) => StopReason::Entry,
            Some(StopCode::BeforeEnd) => StopReason::Entry,
            Some(StopCode::Breakpoint) => StopReason::Breakpoint,
            Some(StopCode::UserStop) => StopReason::Pause,
            Some(StopCode::StepComplete) | None => StopReason::Step,
        };

        if event.code == StopCode::CallDebugger as u32 {
            let first = !shared.entry_stop_seen;
            shared.entry_stop_seen = true;

            if first && !shared.stop_on_entry {
                // The entry stop comes from the call-on-start flag; the
                // front end never asked for it.
                log::debug!("auto-continuing initial entry stop");
                if let Err(err) = transport.send(&Command::Run.into_frame()) {
                    log::error!("auto-continue failed: {err}");
                }
                return;
            }

            if !first {
                reason = StopReason::Step;
            }
        }

        if shared.phase == SessionPhase::Running && shared.transition(SessionPhase::Stopped) {
            shared.emit(Notification::Stopped {
                reason,
                thread_id: super::THREAD_ID,
            });
        } else {
            log::debug!("stop event outside running state ({:?})", shared.phase);
        }
    }

    fn send_all(transport: &mut Transport, shared: &mut Shared, frames: Vec<Frame>) {
        for frame in frames {
            if let Err(err) = transport.send(&frame) {
                log::error!("send failed: {err}");
                shared.output(
                    OutputCategory::Console,
                    format!("debugger channel error: {err}\n"),
                );
                return;
            }
        }
    }

    fn on_closed(&mut self) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.phase != SessionPhase::Terminated {
                shared.output(OutputCategory::Console, "debuggee connection closed\n");
                shared.terminate();
            }
            shared.pending.cancel_all();
        }

        self.cleanup(true);
    }

    fn fail(&mut self, err: io::Error) -> io::Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.output(OutputCategory::Console, format!("transport error: {err}\n"));
            shared.terminate();
            shared.pending.cancel_all();
        }

        self.cleanup(true);
        Err(err)
    }

    // The End event announced a natural exit: close down without killing.
    fn cleanup_after_exit(&mut self) {
        self.transport.close();
        if let Some(mut child) = self.child.take() {
            let _ = child.try_wait();
        }
    }

    fn cleanup(&mut self, kill: bool) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.terminate();
            shared.pending.cancel_all();
        }

        self.transport.close();
        if let Some(mut child) = self.child.take() {
            if kill {
                let _ = child.kill();
                let _ = child.wait();
            } else {
                let _ = child.try_wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn shared() -> (Shared, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Shared::new(tx), rx)
    }

    fn init_event(dir: &Path, includes: &[&str]) -> InitEvent {
        InitEvent {
            included_files: includes.len() as u32,
            version: PROTOCOL_VERSION,
            working_dir: dir.display().to_string(),
            main_source: "main.pb".to_string(),
            includes: includes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn file_map_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.pb"), "Debug 1\n").unwrap();

        let (mut shared, _rx) = shared();
        shared.apply_init(&init_event(dir.path(), &["util.pb"]));

        let main = shared.file_path(0).unwrap().clone();
        assert!(main.ends_with("main.pb"));

        // A second Init for the same indexes must not rewrite them.
        let mut other = init_event(dir.path(), &["other.pb"]);
        other.main_source = "elsewhere.pb".to_string();
        shared.apply_init(&other);

        assert_eq!(shared.file_path(0), Some(&main));
        assert!(shared.file_path(1).unwrap().ends_with("util.pb"));
    }

    #[test]
    fn breakpoint_frames() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.pb");
        std::fs::write(&main, "Debug 1\nDebug 2\nDebug 3\n").unwrap();

        let (mut shared, _rx) = shared();
        shared.apply_init(&init_event(dir.path(), &[]));

        shared
            .breakpoints
            .insert(normalize(&main), [2u32, 3u32].into_iter().collect());

        let frames = shared.breakpoint_frames_for(&main).unwrap();
        assert_eq!(frames.len(), 3);

        assert_eq!(frames[0].command, 3);
        assert_eq!(frames[0].value1, BreakpointAction::Clear as u32);
        assert_eq!(frames[0].value2, SourceLocation::new(0, 0).pack());

        assert_eq!(frames[1].value1, BreakpointAction::Add as u32);
        assert_eq!(frames[1].value2, SourceLocation::new(0, 1).pack());
        assert_eq!(frames[2].value2, SourceLocation::new(0, 2).pack());
    }

    #[test]
    fn unknown_paths_stay_queued() {
        let (shared, _rx) = shared();
        assert_eq!(shared.breakpoint_frames_for(Path::new("/no/such.pb")), None);
    }

    #[test]
    fn no_notifications_after_termination() {
        let (mut shared, rx) = shared();

        shared.terminate();
        assert_eq!(rx.try_recv().unwrap(), Notification::Terminated);

        shared.output(OutputCategory::Console, "late\n");
        shared.emit(Notification::Continued);
        assert!(rx.try_recv().is_err());

        // Terminating again emits nothing either.
        shared.terminate();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn transition_graph() {
        let (mut shared, _rx) = shared();

        assert!(shared.transition(SessionPhase::Launching));
        assert!(!shared.transition(SessionPhase::Stopped));
        assert!(shared.transition(SessionPhase::Running));
        assert!(shared.transition(SessionPhase::Stopped));
        assert!(shared.transition(SessionPhase::Running));
        assert!(shared.transition(SessionPhase::Terminated));
        assert!(!shared.transition(SessionPhase::Running));
    }
}
