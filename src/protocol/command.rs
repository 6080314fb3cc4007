//! Commands sent to the debuggee and the event identifiers it answers with.

use enum_primitive_derive::Primitive;

use super::{location::SourceLocation, Frame};

/// Commands understood by the debuggee.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum CommandTag {
    Stop = 0,
    Step = 1,
    Run = 2,
    BreakPoint = 3,
    GetGlobalNames = 9,
    GetGlobals = 10,
    GetLocals = 11,
    GetHistory = 16,
    EvaluateExpression = 33,
    EvaluateExpressionWithStruct = 34,
    Kill = 37,
}

/// Events emitted by the debuggee.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum EventTag {
    Init = 0,
    End = 1,
    ExeMode = 2,
    Stopped = 3,
    Continued = 4,
    Debug = 5,
    DebugDouble = 6,
    DebugQuad = 7,
    Error = 8,
    GlobalNames = 13,
    Globals = 14,
    Locals = 15,
    History = 22,
    Expression = 36,
}

/// Granularity of a `Step` command, carried in value1.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum StepKind {
    Into = 0,
    Over = 1,
    Out = 2,
}

/// Action code of a `BreakPoint` command, carried in value1.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum BreakpointAction {
    Add = 1,
    Remove = 2,
    Clear = 3,
}

/// Reason codes carried by `Stopped` events.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum StopCode {
    StepComplete = 0,
    CallDebugger = 3,
    BeforeEnd = 5,
    Breakpoint = 7,
    UserStop = 8,
}

/// Marker word sent in value1 of structured evaluate requests. Opaque, but
/// the debuggee requires it byte-exact.
pub const EVALUATE_MARKER: u32 = u32::from_le_bytes(*b"SCIN");

/// A command to the debuggee, with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Interrupt the running program.
    Stop,
    /// Step with the given granularity.
    Step(StepKind),
    /// Resume execution.
    Run,
    /// Add, remove or clear breakpoints at a packed location.
    Breakpoint {
        /// What to do at the location.
        action: BreakpointAction,
        /// Packed file/line. For `Clear`, only the file index is meaningful.
        location: SourceLocation,
    },
    /// Request the list of global variable names.
    GetGlobalNames,
    /// Request the values of all globals.
    GetGlobals,
    /// Request the locals of a call frame.
    GetLocals {
        /// Debuggee frame index, 0 being the innermost.
        frame: u32,
    },
    /// Request the call history.
    GetHistory,
    /// Evaluate an expression in the context of the current stop location.
    Evaluate {
        /// Expression bytes, NUL-terminated in the executable's string
        /// encoding.
        expression: Vec<u8>,
        /// Packed location of the current stop.
        location: u32,
    },
    /// Terminate the debuggee.
    Kill,
}

impl Command {
    /// The wire identifier for this command.
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::Stop => CommandTag::Stop,
            Command::Step(_) => CommandTag::Step,
            Command::Run => CommandTag::Run,
            Command::Breakpoint { .. } => CommandTag::BreakPoint,
            Command::GetGlobalNames => CommandTag::GetGlobalNames,
            Command::GetGlobals => CommandTag::GetGlobals,
            Command::GetLocals { .. } => CommandTag::GetLocals,
            Command::GetHistory => CommandTag::GetHistory,
            Command::Evaluate { .. } => CommandTag::EvaluateExpressionWithStruct,
            Command::Kill => CommandTag::Kill,
        }
    }

    /// Encodes the command as a wire frame.
    pub fn into_frame(self) -> Frame {
        let command = self.tag() as u32;

        match self {
            Command::Stop
            | Command::Run
            | Command::GetGlobalNames
            | Command::GetGlobals
            | Command::GetHistory
            | Command::Kill => Frame::new(command),
            Command::Step(kind) => Frame::with_values(command, kind as u32, 0),
            Command::Breakpoint { action, location } => {
                Frame::with_values(command, action as u32, location.pack())
            }
            Command::GetLocals { frame } => Frame::with_values(command, frame, 0),
            Command::Evaluate {
                expression,
                location,
            } => Frame {
                command,
                value1: EVALUATE_MARKER,
                value2: location,
                timestamp: 0,
                data: expression,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn breakpoint_frame() {
        let frame = Command::Breakpoint {
            action: BreakpointAction::Add,
            location: SourceLocation::new(2, 41),
        }
        .into_frame();

        assert_eq!(frame.command, 3);
        assert_eq!(frame.value1, 1);
        assert_eq!(frame.value2, (2 << 20) | 41);
        assert!(frame.data.is_empty());
    }

    #[test]
    fn evaluate_marker_is_scin() {
        assert_eq!(EVALUATE_MARKER.to_le_bytes(), *b"SCIN");

        let frame = Command::Evaluate {
            expression: vec![b'x', 0],
            location: 12,
        }
        .into_frame();

        assert_eq!(frame.command, 34);
        assert_eq!(frame.value1, EVALUATE_MARKER);
        assert_eq!(frame.value2, 12);
    }

    #[test]
    fn step_kinds() {
        assert_eq!(Command::Step(StepKind::Into).into_frame().value1, 0);
        assert_eq!(Command::Step(StepKind::Over).into_frame().value1, 1);
        assert_eq!(Command::Step(StepKind::Out).into_frame().value1, 2);
    }
}
