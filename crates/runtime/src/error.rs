//! Runtime error taxonomy
//!
//! Three tiers, kept strictly apart:
//!
//! 1. **Language exceptions** (`Exception`): data, not host panics. Carry a
//!    payload value (usually a string, or an object with `message`/`code`/
//!    `cause` fields) plus the stack trace captured at the throw site.
//!    Catchable by `try/catch`.
//! 2. **Runtime errors** (FFI failures, IO failures): surfaced as language
//!    exceptions when a handler is in scope, otherwise they terminate the
//!    task with the trace.
//! 3. **Fatal errors** (`FatalError`): frame/stack overflow, out-of-memory,
//!    malformed bytecode in release builds. Never catchable; unwind to the
//!    task boundary.
//!
//! Host panics are reserved for malformed bytecode in debug builds.

use alder_core::Value;
use std::fmt;

/// One reporting frame: function name and the line active at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub line: u32,
}

/// A thrown language value plus the trace captured when it was thrown.
/// The trace is preserved across unwinding until the exception is caught.
#[derive(Debug, Clone)]
pub struct Exception {
    pub payload: Value,
    pub trace: Vec<TraceFrame>,
}

impl Exception {
    pub fn new(payload: Value, trace: Vec<TraceFrame>) -> Self {
        Self { payload, trace }
    }

    /// Exception carrying a plain message string (the shape runtime faults
    /// use).
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            payload: Value::string(text.into()),
            trace: Vec::new(),
        }
    }

    /// Render the payload the way the driver prints uncaught exceptions.
    pub fn payload_text(&self) -> String {
        alder_core::display_string(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FatalKind {
    /// Call-frame stack exceeded the configured limit.
    FrameOverflow { limit: usize },
    /// Value stack exceeded its hard limit.
    StackOverflow { limit: usize },
    /// Undefined opcode, jump past chunk end, operand decode failure.
    MalformedBytecode(String),
    OutOfMemory,
}

#[derive(Debug, Clone)]
pub struct FatalError {
    pub kind: FatalKind,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FatalKind::FrameOverflow { limit } => {
                write!(f, "call depth exceeded ({} frames)", limit)
            }
            FatalKind::StackOverflow { limit } => {
                write!(f, "value stack exceeded ({} slots)", limit)
            }
            FatalKind::MalformedBytecode(detail) => {
                write!(f, "malformed bytecode: {}", detail)
            }
            FatalKind::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for FatalError {}

/// Error surface of a completed VM run.
#[derive(Debug)]
pub enum VmError {
    /// An exception unwound past the outermost frame.
    Uncaught(Exception),
    Fatal(FatalError),
}

impl VmError {
    /// The process exit code the driver maps this to.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Uncaught(exc) => {
                writeln!(f, "Uncaught exception: {}", exc.payload_text())?;
                for frame in &exc.trace {
                    writeln!(f, "    at {} (line {})", frame.function, frame.line)?;
                }
                Ok(())
            }
            VmError::Fatal(fatal) => {
                writeln!(f, "fatal: {}", fatal)?;
                for frame in &fatal.trace {
                    writeln!(f, "    at {} (line {})", frame.function, frame.line)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for VmError {}

/// Internal result of running a frame window; the public `VmError` is
/// produced at the task boundary.
#[derive(Debug)]
pub enum RunError {
    Thrown(Exception),
    Fatal(FatalError),
}

impl From<RunError> for VmError {
    fn from(err: RunError) -> VmError {
        match err {
            RunError::Thrown(exc) => VmError::Uncaught(exc),
            RunError::Fatal(fatal) => VmError::Fatal(fatal),
        }
    }
}
