//! The debug session controller.
//!
//! A [Session] bridges a debug front-end and a running PureBasic program:
//! it compiles the source, listens on a debugger channel, launches the
//! debuggee and translates front-end requests into wire commands. Requests
//! with a reply are async; asynchronous debuggee activity (stops, output,
//! termination) surfaces on the [notification](Session::notifications)
//! channel.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{
    launcher::{self, DebuggerOptions, LaunchError},
    protocol::{
        events::{ExeFlags, HistoryEvent, InitEvent},
        parse_expression, parse_global_names, parse_globals, parse_locals, Command, EventTag,
        Frame, ProtocolError, StepKind,
    },
    transport::{NetworkOptions, Transport, TransportKind},
};

mod pending;
mod procedures;
mod reactor;

use pending::WaitError;
use reactor::{
    normalize, Handle, Op, Reactor, Shared, COMMAND_TIMEOUT, COMPILE_TIMEOUT, CONNECTED_EVENT,
    HANDSHAKE_TIMEOUT, LAUNCH_TIMEOUT,
};

/// The single thread id reported to the front end. The debuggee is stepped
/// as one thread.
pub const THREAD_ID: u32 = 1;

/// Variables reference for the global scope.
pub const GLOBALS_REFERENCE: u32 = 1000;
/// Variables reference for the locals of frame 0; frame N is
/// `LOCALS_REFERENCE + N`.
pub const LOCALS_REFERENCE: u32 = 1001;

/// An error encountered by a [Session].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No PureBasic compiler was given or found in the environment.
    #[error("PureBasic compiler not found")]
    CompilerUnavailable,
    /// The compiler rejected the source.
    #[error("compilation failed: {0}")]
    Compile(String),
    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The requested operation does not fit the current session state.
    #[error("invalid operation for the session state: {0}")]
    InvalidState(&'static str),
    /// The transport is not available on this platform.
    #[error("unsupported transport: {0}")]
    Unsupported(&'static str),
    /// A protocol-level error, like a malformed payload.
    #[error("protocol error")]
    Protocol(#[from] ProtocolError),
    /// An error reading or writing the channel, or spawning a process.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// The session has shut down.
    #[error("session disconnected")]
    Disconnected,
}

impl From<LaunchError> for SessionError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::Compile { message } => SessionError::Compile(message),
            LaunchError::Io(err) => SessionError::Io(err),
        }
    }
}

/// The result of a [Session] operation.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created; capabilities exchanged.
    Initialized,
    /// Launch requested; compiling and waiting for the debuggee.
    Launching,
    /// The debuggee is executing.
    Running,
    /// The debuggee is halted at a source location.
    Stopped,
    /// The session is over. Absorbing.
    Terminated,
}

impl SessionPhase {
    /// Whether the transition graph allows moving to `to`.
    pub fn can_transition(self, to: SessionPhase) -> bool {
        use SessionPhase::*;

        matches!(
            (self, to),
            (Initialized, Launching)
                | (Launching, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Initialized | Launching | Running | Stopped, Terminated)
        )
    }
}

/// What this adapter can do, reported to the front end at initialize.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// The front end should send configuration-done.
    pub supports_configuration_done_request: bool,
    /// Evaluate may be used for hover tooltips.
    pub supports_evaluate_for_hovers: bool,
    /// Disconnect accepts a terminate-debuggee flag.
    pub support_terminate_debuggee: bool,
}

/// Arguments of a launch request.
#[derive(Debug, Clone)]
pub struct LaunchArgs {
    /// The PureBasic source file to debug.
    pub program: PathBuf,
    /// Compiler path override; the environment is probed otherwise.
    pub compiler: Option<PathBuf>,
    /// Stop at the program entry point instead of running to the first
    /// breakpoint.
    pub stop_on_entry: bool,
    /// Which debugger channel to offer the debuggee.
    pub transport: TransportKind,
    /// Bind host for the network transport.
    pub debug_host: Option<String>,
    /// Bind port for the network transport; 0 picks an ephemeral port.
    pub debug_port: Option<u16>,
    /// Password for the network handshake response.
    pub debug_password: Option<String>,
    /// Verbose diagnostics, including raw compiler output in errors.
    pub trace: bool,
}

impl LaunchArgs {
    /// Launch arguments for `program` with platform defaults.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            compiler: None,
            stop_on_entry: false,
            transport: TransportKind::default(),
            debug_host: None,
            debug_port: None,
            debug_password: None,
            trace: false,
        }
    }
}

/// Why the debuggee stopped, in front-end vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A step request completed.
    Step,
    /// Stopped at the program entry point.
    Entry,
    /// A breakpoint was hit.
    Breakpoint,
    /// A pause request completed.
    Pause,
    /// A runtime error occurred.
    Exception,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Step => "step",
            StopReason::Entry => "entry",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Pause => "pause",
            StopReason::Exception => "exception",
        };
        f.write_str(s)
    }
}

/// Output channel of an output notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    /// Adapter messages.
    Console,
    /// Debuggee `Debug` output.
    Stdout,
    /// Runtime errors.
    Stderr,
}

impl std::fmt::Display for OutputCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutputCategory::Console => "console",
            OutputCategory::Stdout => "stdout",
            OutputCategory::Stderr => "stderr",
        };
        f.write_str(s)
    }
}

/// An asynchronous notification to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The session is ready for configuration requests.
    Initialized,
    /// The debuggee halted.
    Stopped {
        /// Why it halted.
        reason: StopReason,
        /// Always [THREAD_ID].
        thread_id: u32,
    },
    /// The debuggee resumed on its own initiative.
    Continued,
    /// The session is over.
    Terminated,
    /// A line of output.
    Output {
        /// Which channel the text belongs to.
        category: OutputCategory,
        /// The text, newline included.
        text: String,
    },
}

/// The debuggee's single thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    /// Always [THREAD_ID].
    pub id: u32,
    /// Display name.
    pub name: String,
}

/// One frame of a stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// 0 is the innermost frame.
    pub id: u32,
    /// Procedure name, or `[main]` for top-level code.
    pub name: String,
    /// Source path, when the file map resolves it.
    pub path: Option<PathBuf>,
    /// 1-based line number.
    pub line: u32,
}

/// A variable scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Display name.
    pub name: String,
    /// Reference to pass to [Session::variables].
    pub variables_reference: u32,
}

/// A named, rendered variable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Variable name, possibly `module::name`.
    pub name: String,
    /// Rendered value.
    pub value: String,
    /// Display type name.
    pub type_name: String,
}

/// A breakpoint as reported back to the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    /// 1-based line.
    pub line: u32,
    /// The debuggee does not acknowledge individual lines, so this is
    /// always true for registered breakpoints.
    pub verified: bool,
}

/// A debug session.
pub struct Session {
    shared: Arc<Mutex<Shared>>,
    reactor: Option<Handle>,
    notifications: Option<mpsc::Receiver<Notification>>,
    options: DebuggerOptions,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Session").field(&self.phase()).finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates a session in the initialized state.
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::channel();

        Self {
            shared: Arc::new(Mutex::new(Shared::new(notify_tx))),
            reactor: None,
            notifications: Some(notify_rx),
            options: DebuggerOptions::default(),
        }
    }

    /// Takes the notification receiver. Callable once.
    pub fn notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.take()
    }

    /// The current lifecycle state.
    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().unwrap().phase
    }

    /// The communication string offered to the debuggee, available after a
    /// successful launch.
    pub fn communication_string(&self) -> Option<String> {
        self.shared.lock().unwrap().communication.clone()
    }

    /// Declares capabilities and emits the `initialized` notification.
    pub fn initialize(&mut self) -> Capabilities {
        let shared = self.shared.lock().unwrap();
        shared.emit(Notification::Initialized);

        Capabilities {
            supports_configuration_done_request: true,
            supports_evaluate_for_hovers: true,
            support_terminate_debuggee: true,
        }
    }

    /// Starts the launch sequence: resolves the compiler, brings up the
    /// transport and kicks off the compile in the background. The debuggee
    /// itself is spawned by [configuration_done](Self::configuration_done).
    pub fn launch(&mut self, args: LaunchArgs) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if !shared.transition(SessionPhase::Launching) {
                return Err(SessionError::InvalidState("launch"));
            }

            shared.stop_on_entry = args.stop_on_entry;
            shared.program = Some(normalize(&args.program));
        }

        let compiler = match &args.compiler {
            Some(compiler) => compiler.clone(),
            None => crate::compiler_path_from_env().ok_or(SessionError::CompilerUnavailable)?,
        };

        self.options = DebuggerOptions {
            call_on_start: args.stop_on_entry,
            ..DebuggerOptions::default()
        };

        let mut transport = match args.transport {
            TransportKind::Network => Transport::network(NetworkOptions {
                host: args
                    .debug_host
                    .clone()
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                port: args.debug_port.unwrap_or(0),
                password: args.debug_password.clone(),
            })?,
            #[cfg(unix)]
            TransportKind::Fifo => Transport::fifo(self.options.to_env_string())?,
            #[cfg(windows)]
            TransportKind::NamedPipes => Transport::named_pipes()?,
            #[cfg(not(unix))]
            TransportKind::Fifo => {
                return Err(SessionError::Unsupported("FIFOs on this platform"))
            }
            #[cfg(not(windows))]
            TransportKind::NamedPipes => {
                return Err(SessionError::Unsupported("named pipes on this platform"))
            }
        };

        transport.listen()?;
        self.shared.lock().unwrap().communication = Some(transport.communication_string());

        self.reactor = Some(Reactor::spawn(transport, self.shared.clone())?);

        // Compile in the background; configuration-done picks up the result.
        let source = args.program.clone();
        let trace = args.trace;
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("pbdebug-compile".to_string())
            .spawn(move || {
                let result = launcher::compile(&source, &compiler, trace).map_err(|err| match err {
                    LaunchError::Compile { message } => message,
                    other => other.to_string(),
                });
                shared.lock().unwrap().compile = Some(result);
            })?;

        Ok(())
    }

    /// Completes the launch: waits for the compile, spawns the debuggee,
    /// performs the protocol handshake, programs queued breakpoints and
    /// sets the program running.
    pub async fn configuration_done(&mut self) -> Result<()> {
        let handle = self.handle()?;

        let executable = self.await_compile()?;

        // Register the connect and handshake awaiters before the debuggee
        // exists, so nothing can slip past unobserved.
        let (connect_rx, init_rx, exemode_rx) = {
            let mut shared = self.shared.lock().unwrap();
            let now = Instant::now();
            let handshake_deadline = now + LAUNCH_TIMEOUT + HANDSHAKE_TIMEOUT;

            let connect_rx = (!shared.connected)
                .then(|| shared.pending.install(CONNECTED_EVENT, now + LAUNCH_TIMEOUT).1);
            let init_rx = (!shared.init_seen).then(|| {
                shared
                    .pending
                    .install(EventTag::Init as u32, handshake_deadline)
                    .1
            });
            let exemode_rx = (!shared.exemode_seen).then(|| {
                shared
                    .pending
                    .install(EventTag::ExeMode as u32, handshake_deadline)
                    .1
            });

            (connect_rx, init_rx, exemode_rx)
        };

        let communication = self
            .communication_string()
            .ok_or(SessionError::InvalidState("configuration-done"))?;

        let child = launcher::launch(&executable, &communication, &self.options)?;
        handle.op(Op::AdoptChild(child))?;

        // FIFO transports attach from our side once the debuggee is up;
        // evented transports get their connection through the listener.
        handle.op(Op::Connect)?;

        if let Some(rx) = connect_rx {
            self.wait_named(rx, "debuggee connection").await?;
        }

        if let Err(err) = self.handshake(init_rx, exemode_rx).await {
            // A failed handshake fails the whole session.
            let _ = handle.op(Op::Shutdown { kill: true });
            return Err(err);
        }

        let frames = {
            let mut shared = self.shared.lock().unwrap();
            shared.transition(SessionPhase::Running);
            shared.all_breakpoint_frames()
        };

        for frame in frames {
            handle.op(Op::Send(frame))?;
        }
        handle.op(Op::Send(Command::Run.into_frame()))?;

        Ok(())
    }

    fn await_compile(&self) -> Result<PathBuf> {
        let deadline = Instant::now() + COMPILE_TIMEOUT;

        loop {
            {
                let shared = self.shared.lock().unwrap();
                if shared.phase == SessionPhase::Terminated {
                    return Err(SessionError::Disconnected);
                }
                if let Some(result) = &shared.compile {
                    return result.clone().map_err(SessionError::Compile);
                }
            }

            if Instant::now() >= deadline {
                return Err(SessionError::Timeout("compile"));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    async fn handshake(
        &mut self,
        init_rx: Option<pending::Receiver>,
        exemode_rx: Option<pending::Receiver>,
    ) -> Result<()> {
        if let Some(rx) = init_rx {
            let frame = self.wait_named(rx, "debuggee Init event").await?;
            let init = InitEvent::parse(&frame)?;

            let mut shared = self.shared.lock().unwrap();
            shared.apply_init(&init);
            shared.init_seen = true;
        }

        if let Some(rx) = exemode_rx {
            let frame = self.wait_named(rx, "debuggee ExeMode event").await?;

            let mut shared = self.shared.lock().unwrap();
            shared.exe_flags = ExeFlags::from_event(&frame);
            shared.exemode_seen = true;
        }

        Ok(())
    }

    /// Replaces the breakpoints of one source file and programs them into
    /// the debuggee when the channel is up. Unresolvable paths stay queued
    /// until the file map learns them.
    pub fn set_breakpoints(&mut self, path: &Path, lines: &[u32]) -> Result<Vec<Breakpoint>> {
        let frames = {
            let mut shared = self.shared.lock().unwrap();
            shared
                .breakpoints
                .insert(normalize(path), lines.iter().copied().collect());

            // During launch, breakpoints stay queued; the configuration-done
            // flush delivers them after the handshake.
            if shared.connected && shared.is_live() {
                shared.breakpoint_frames_for(path)
            } else {
                None
            }
        };

        if let Some(frames) = frames {
            let handle = self.handle()?;
            for frame in frames {
                handle.op(Op::Send(frame))?;
            }
        }

        Ok(lines
            .iter()
            .map(|&line| Breakpoint {
                line,
                verified: true,
            })
            .collect())
    }

    /// Resumes execution.
    pub fn resume(&mut self) -> Result<()> {
        self.execution(Command::Run, true)
    }

    /// Interrupts the running debuggee. The state changes once the
    /// resulting stop event arrives.
    pub fn pause(&mut self) -> Result<()> {
        self.execution(Command::Stop, false)
    }

    /// Steps over the current line.
    pub fn step_over(&mut self) -> Result<()> {
        self.execution(Command::Step(StepKind::Over), true)
    }

    /// Steps into the call on the current line.
    pub fn step_in(&mut self) -> Result<()> {
        self.execution(Command::Step(StepKind::Into), true)
    }

    /// Steps out of the current procedure.
    pub fn step_out(&mut self) -> Result<()> {
        self.execution(Command::Step(StepKind::Out), true)
    }

    fn execution(&mut self, command: Command, to_running: bool) -> Result<()> {
        let handle = self.handle()?;

        {
            let mut shared = self.shared.lock().unwrap();
            if shared.phase == SessionPhase::Terminated {
                return Err(SessionError::InvalidState("execution control"));
            }
            if to_running && shared.phase == SessionPhase::Stopped {
                shared.transition(SessionPhase::Running);
            }
        }

        handle.op(Op::Send(command.into_frame()))
    }

    /// The debuggee's threads. Always exactly one.
    pub fn threads(&self) -> Vec<Thread> {
        vec![Thread {
            id: THREAD_ID,
            name: "Main Thread".to_string(),
        }]
    }

    /// The scopes of a stack frame.
    pub fn scopes(&self, frame: u32) -> Vec<Scope> {
        vec![
            Scope {
                name: "Local".to_string(),
                variables_reference: LOCALS_REFERENCE + frame,
            },
            Scope {
                name: "Global".to_string(),
                variables_reference: GLOBALS_REFERENCE,
            },
        ]
    }

    /// Fetches the call stack for the current stop. Falls back to a single
    /// `[main]` frame when the debuggee does not answer in time.
    pub async fn stack_trace(&mut self) -> Result<Vec<StackFrame>> {
        let response = self
            .send_and_wait(
                Command::GetHistory,
                EventTag::History,
                COMMAND_TIMEOUT,
                "call history",
            )
            .await;

        let frame = match response {
            Ok(frame) => frame,
            Err(SessionError::Timeout(_)) | Err(SessionError::Disconnected) => {
                return Ok(vec![self.fallback_frame()]);
            }
            Err(err) => return Err(err),
        };

        let history = match HistoryEvent::parse(&frame) {
            Ok(history) => history,
            Err(err) => {
                log::warn!("unparseable History event: {err}");
                return Ok(vec![self.fallback_frame()]);
            }
        };

        let mut shared = self.shared.lock().unwrap();
        let current = history
            .current
            .or(shared.stopped_at)
            .unwrap_or_default();

        let mut frames = Vec::with_capacity(history.entries.len() + 1);

        let path = shared.file_path(current.file).cloned();
        let inferred = path
            .as_ref()
            .and_then(|p| shared.procedures.lookup(p, current.line));
        frames.push(StackFrame {
            id: 0,
            name: inferred.unwrap_or_else(|| "[main]".to_string()),
            path,
            line: current.line + 1,
        });

        // History entries are oldest-first on the wire; the front end wants
        // the most recent caller first.
        for (depth, entry) in history.entries.iter().rev().enumerate() {
            let path = shared.file_path(entry.location.file).cloned();
            let inferred = path
                .as_ref()
                .and_then(|p| shared.procedures.lookup(p, entry.location.line));

            let name = match inferred {
                Some(name) => name,
                None if entry.name.is_empty() => "[main]".to_string(),
                None => format!("[main] -> {}", entry.name),
            };

            frames.push(StackFrame {
                id: depth as u32 + 1,
                name,
                path,
                line: entry.location.line + 1,
            });
        }

        Ok(frames)
    }

    fn fallback_frame(&self) -> StackFrame {
        let shared = self.shared.lock().unwrap();
        let location = shared.stopped_at.unwrap_or_default();

        StackFrame {
            id: 0,
            name: "[main]".to_string(),
            path: shared.file_path(location.file).cloned(),
            line: location.line + 1,
        }
    }

    /// Fetches the variables of a scope reference. Results are cached until
    /// the next stop; a debuggee that does not answer yields an empty list.
    pub async fn variables(&mut self, reference: u32) -> Result<Vec<Variable>> {
        if reference == GLOBALS_REFERENCE {
            self.globals().await
        } else if reference >= LOCALS_REFERENCE {
            self.locals(reference - LOCALS_REFERENCE).await
        } else {
            Ok(Vec::new())
        }
    }

    async fn globals(&mut self) -> Result<Vec<Variable>> {
        let generation = {
            let shared = self.shared.lock().unwrap();
            if let Some((cached_at, variables)) = &shared.globals_cache {
                if *cached_at == shared.stop_generation {
                    return Ok(variables.clone());
                }
            }
            shared.stop_generation
        };

        let names_frame = match self
            .send_and_wait(
                Command::GetGlobalNames,
                EventTag::GlobalNames,
                COMMAND_TIMEOUT,
                "global names",
            )
            .await
        {
            Ok(frame) => frame,
            Err(SessionError::Timeout(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let names = match parse_global_names(&names_frame.data) {
            Ok(names) => names,
            Err(err) => {
                log::warn!("unparseable GlobalNames payload: {err}");
                return Ok(Vec::new());
            }
        };

        let values_frame = match self
            .send_and_wait(
                Command::GetGlobals,
                EventTag::Globals,
                COMMAND_TIMEOUT,
                "global values",
            )
            .await
        {
            Ok(frame) => frame,
            Err(SessionError::Timeout(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut shared = self.shared.lock().unwrap();
        let variables: Vec<Variable> = parse_globals(&values_frame.data, &names, shared.exe_flags)
            .into_iter()
            .map(|(name, value)| Variable {
                name,
                value: value.value,
                type_name: value.type_name,
            })
            .collect();

        shared.globals_cache = Some((generation, variables.clone()));
        Ok(variables)
    }

    async fn locals(&mut self, frame_index: u32) -> Result<Vec<Variable>> {
        let generation = {
            let shared = self.shared.lock().unwrap();
            if let Some((cached_at, cached_frame, variables)) = &shared.locals_cache {
                if *cached_at == shared.stop_generation && *cached_frame == frame_index {
                    return Ok(variables.clone());
                }
            }
            shared.stop_generation
        };

        let mut locals = match self.fetch_locals(frame_index).await? {
            Some(locals) => locals,
            None => return Ok(Vec::new()),
        };

        // Front-end frame ids do not always line up with debuggee frame
        // indexes; an empty non-zero frame usually means frame 0 was meant.
        if locals.is_empty() && frame_index != 0 {
            if let Some(retried) = self.fetch_locals(0).await? {
                locals = retried;
            }
        }

        let variables: Vec<Variable> = locals
            .into_iter()
            .map(|local| Variable {
                name: local.name,
                value: local.value.value,
                type_name: local.value.type_name,
            })
            .collect();

        let mut shared = self.shared.lock().unwrap();
        shared.locals_cache = Some((generation, frame_index, variables.clone()));
        Ok(variables)
    }

    async fn fetch_locals(
        &mut self,
        frame_index: u32,
    ) -> Result<Option<Vec<crate::protocol::events::LocalVariable>>> {
        let response = self
            .send_and_wait(
                Command::GetLocals { frame: frame_index },
                EventTag::Locals,
                COMMAND_TIMEOUT,
                "local variables",
            )
            .await;

        match response {
            Ok(frame) => {
                let flags = self.shared.lock().unwrap().exe_flags;
                Ok(Some(parse_locals(&frame, flags)))
            }
            Err(SessionError::Timeout(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Evaluates an expression in the context of the current stop.
    pub async fn evaluate(&mut self, expression: &str) -> Result<String> {
        let (flags, location) = {
            let shared = self.shared.lock().unwrap();
            (
                shared.exe_flags,
                shared.stopped_at.map(|loc| loc.pack()).unwrap_or(0),
            )
        };

        // Editors smuggle byte-order marks and replacement characters into
        // hover text; the debuggee chokes on both.
        let cleaned: String = expression
            .chars()
            .filter(|c| *c != '\u{feff}' && *c != '\u{fffd}')
            .collect();
        let cleaned = cleaned.trim();

        let frame = self
            .send_and_wait(
                Command::Evaluate {
                    expression: crate::protocol::payload::encode_text(
                        cleaned,
                        flags.is_unicode(),
                    ),
                    location,
                },
                EventTag::Expression,
                COMMAND_TIMEOUT,
                "expression result",
            )
            .await?;

        Ok(parse_expression(&frame, flags)?)
    }

    /// Ends the session: optionally kills the debuggee (the default), then
    /// closes the transport and clears all state.
    pub fn disconnect(&mut self, terminate_debuggee: Option<bool>) -> Result<()> {
        let kill = terminate_debuggee.unwrap_or(true);

        if let Some(handle) = self.reactor.take() {
            if kill {
                let _ = handle.op(Op::Send(Command::Kill.into_frame()));
            }
            let _ = handle.op(Op::Shutdown { kill });
        } else {
            self.shared.lock().unwrap().terminate();
        }

        Ok(())
    }

    fn handle(&self) -> Result<Handle> {
        self.reactor
            .clone()
            .ok_or(SessionError::InvalidState("session not launched"))
    }

    async fn send_and_wait(
        &self,
        command: Command,
        event: EventTag,
        timeout: Duration,
        what: &'static str,
    ) -> Result<Frame> {
        let handle = self.handle()?;

        let (id, rx) = {
            let mut shared = self.shared.lock().unwrap();
            shared
                .pending
                .install(event as u32, Instant::now() + timeout)
        };

        if let Err(err) = handle.op(Op::Send(command.into_frame())) {
            self.shared
                .lock()
                .unwrap()
                .pending
                .remove(event as u32, id);
            return Err(err);
        }

        self.wait_named(rx, what).await
    }

    async fn wait_named(&self, rx: pending::Receiver, what: &'static str) -> Result<Frame> {
        match rx.await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(WaitError::Timeout)) => Err(SessionError::Timeout(what)),
            Ok(Err(WaitError::Cancelled)) | Err(_) => Err(SessionError::Disconnected),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.disconnect(Some(true));
    }
}
