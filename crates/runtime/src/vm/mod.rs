//! The stack VM
//!
//! One `Vm` executes one task: a growable value stack, a call-frame stack,
//! the open-upvalue list, try-handler records, per-frame defer lists and a
//! pending-action slot that drives returns and exception unwinding without
//! host-language exception machinery.
//!
//! ## Pending-action protocol
//!
//! `RETURN` and `THROW` never transfer control directly; they set
//! `pending` and yield to [`Vm::resolve_one`], which walks handler records
//! and frames one transition at a time:
//!
//! - a throw lands in the nearest catch, or routes through finally blocks
//!   (`Handler` state machine: Try → Catch → Finally);
//! - a return routes through the finally blocks of its own frame, then
//!   tears the frame down;
//! - frame teardown runs the frame's defers in LIFO order (each defer is a
//!   nested synchronous run), closes upvalues at the frame watermark, and
//!   releases every slot above the frame base.
//!
//! Uncaught exceptions surface as `RunError::Thrown` once unwinding
//! reaches the run's floor; the task boundary converts them to
//! `VmError::Uncaught` with the preserved trace.

mod call;
mod dispatch;

use crate::error::{Exception, FatalError, FatalKind, RunError, TraceFrame, VmError};
use crate::globals::Globals;
use crate::services::Services;
use alder_core::{
    AlderString, ArrayCell, Chunk, FunctionCell, FunctionMeta, ObjectCell, TaskCell,
    UpvalueCell, Value,
};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Initial/maximum value-stack slots.
const STACK_INITIAL: usize = 256;
const STACK_MAX: usize = 65_536;

/// Initial/maximum call frames (max overridable via `ALDER_STACK_LIMIT`).
const FRAMES_INITIAL: usize = 64;
const FRAMES_MAX_DEFAULT: usize = 1_024;

/// Where `print` and `PRINT` go. Tasks inherit their spawner's sink.
#[derive(Clone)]
pub enum OutputSink {
    Stdout,
    Capture(Arc<Mutex<String>>),
}

impl OutputSink {
    pub fn stdout() -> OutputSink {
        OutputSink::Stdout
    }

    /// A sink that accumulates into a shared buffer (tests, embedding).
    pub fn capture() -> (OutputSink, Arc<Mutex<String>>) {
        let buffer = Arc::new(Mutex::new(String::new()));
        (OutputSink::Capture(Arc::clone(&buffer)), buffer)
    }

    pub fn write(&self, text: &str) {
        match self {
            OutputSink::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            OutputSink::Capture(buffer) => {
                buffer.lock().expect("capture sink poisoned").push_str(text);
            }
        }
    }

    pub fn write_line(&self, text: &str) {
        match self {
            OutputSink::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.write_all(b"\n");
                let _ = out.flush();
            }
            OutputSink::Capture(buffer) => {
                let mut buffer = buffer.lock().expect("capture sink poisoned");
                buffer.push_str(text);
                buffer.push('\n');
            }
        }
    }
}

#[derive(Clone)]
pub struct VmConfig {
    pub max_frames: usize,
}

impl VmConfig {
    /// Defaults with the `ALDER_STACK_LIMIT` frame-depth override
    /// (warn-and-default on invalid values).
    pub fn from_env() -> VmConfig {
        let max_frames = match std::env::var("ALDER_STACK_LIMIT") {
            Ok(text) => match text.parse::<usize>() {
                Ok(0) | Err(_) => {
                    eprintln!(
                        "Warning: ALDER_STACK_LIMIT='{}' is invalid, using default {}",
                        text, FRAMES_MAX_DEFAULT
                    );
                    FRAMES_MAX_DEFAULT
                }
                Ok(n) => n,
            },
            Err(_) => FRAMES_MAX_DEFAULT,
        };
        VmConfig { max_frames }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_frames: FRAMES_MAX_DEFAULT,
        }
    }
}

/// What a suspended `RETURN`/`THROW` is waiting to finish.
#[derive(Debug)]
pub(crate) enum Pending {
    Throw(Exception),
    Return(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerState {
    Try,
    Catch,
    Finally,
}

/// One `TRY` record.
pub(crate) struct Handler {
    pub frame: usize,
    pub stack_depth: usize,
    pub iter_depth: usize,
    pub catch_ip: Option<usize>,
    pub finally_ip: usize,
    pub state: HandlerState,
    /// The action to resume after the finally block completes.
    pub pending: Option<Pending>,
}

/// One call frame. Slot `base` holds the callee (or the bound receiver for
/// method calls); parameters and locals follow.
pub(crate) struct Frame {
    pub closure: Arc<FunctionCell>,
    pub chunk: Arc<Chunk>,
    pub ip: usize,
    pub base: usize,
    /// Deferred callables, run LIFO at frame exit.
    pub defers: Vec<Value>,
    pub handler_base: usize,
    pub iter_base: usize,
}

/// `FOR_IN` iterator state, kept on a VM-internal stack.
pub(crate) enum ForIter {
    Array { cell: Arc<ArrayCell>, index: usize },
    Object { keys: Vec<String>, index: usize },
    Str { string: AlderString, offset: usize },
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    /// Open upvalues sorted by descending stack slot.
    pub(crate) open_upvalues: Vec<Arc<UpvalueCell>>,
    pub(crate) handlers: Vec<Handler>,
    pub(crate) iterators: Vec<ForIter>,
    pub(crate) pending: Option<Pending>,
    /// Set on catch entry; consumed by the `CATCH` opcode.
    pub(crate) current_exception: Option<Exception>,
    pub(crate) globals: Globals,
    pub(crate) services: Arc<Services>,
    pub(crate) sink: OutputSink,
    /// The task this VM is running, when spawned by the scheduler.
    pub(crate) task: Option<Arc<TaskCell>>,
    pub(crate) config: VmConfig,
}

impl Vm {
    pub fn new(globals: Globals, services: Arc<Services>) -> Vm {
        Vm::with_parts(globals, services, OutputSink::stdout(), VmConfig::from_env())
    }

    pub fn with_parts(
        globals: Globals,
        services: Arc<Services>,
        sink: OutputSink,
        config: VmConfig,
    ) -> Vm {
        Vm {
            stack: Vec::with_capacity(STACK_INITIAL),
            frames: Vec::with_capacity(FRAMES_INITIAL),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            iterators: Vec::new(),
            pending: None,
            current_exception: None,
            globals,
            services,
            sink,
            task: None,
            config,
        }
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    // Introspection for invariant assertions (tests, diagnostics).

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    // -- stack primitives ------------------------------------------------

    pub(crate) fn push(&mut self, value: Value) -> Result<(), RunError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.fatal(FatalKind::StackOverflow { limit: STACK_MAX }));
        }
        self.stack.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Value, RunError> {
        self.stack
            .pop()
            .ok_or_else(|| self.fatal(FatalKind::MalformedBytecode("stack underflow".into())))
    }

    pub(crate) fn peek(&self, depth: usize) -> Result<&Value, RunError> {
        let len = self.stack.len();
        if depth >= len {
            return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                "peek {} below stack bottom",
                depth
            ))));
        }
        Ok(&self.stack[len - 1 - depth])
    }

    /// Pop `count` values preserving push order.
    pub(crate) fn pop_many(&mut self, count: usize) -> Result<Vec<Value>, RunError> {
        let len = self.stack.len();
        if count > len {
            return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                "pop {} from stack of {}",
                count, len
            ))));
        }
        Ok(self.stack.split_off(len - count))
    }

    // -- frame/bytecode access -------------------------------------------

    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8, RunError> {
        let frame = self.frames.last_mut().expect("no active frame");
        match frame.chunk.code.get(frame.ip) {
            Some(&byte) => {
                frame.ip += 1;
                Ok(byte)
            }
            None => Err(self.fatal(FatalKind::MalformedBytecode(
                "instruction pointer past chunk end".into(),
            ))),
        }
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, RunError> {
        let lo = self.read_byte()? as u16;
        let hi = self.read_byte()? as u16;
        Ok(lo | (hi << 8))
    }

    // -- errors ----------------------------------------------------------

    /// Innermost-first trace of the live frames.
    pub(crate) fn capture_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| TraceFrame {
                function: frame.chunk.name.clone(),
                line: frame.chunk.line_for_offset(frame.ip.saturating_sub(1)),
            })
            .collect()
    }

    pub(crate) fn fatal(&self, kind: FatalKind) -> RunError {
        RunError::Fatal(FatalError {
            kind,
            trace: self.capture_trace(),
        })
    }

    /// Raise a language exception with a string payload.
    pub(crate) fn throw_message(&mut self, text: impl Into<String>) {
        let payload = Value::string(text.into());
        self.throw_payload(payload);
    }

    /// Raise a language exception with an arbitrary payload.
    pub(crate) fn throw_payload(&mut self, payload: Value) {
        let trace = self.capture_trace();
        self.pending = Some(Pending::Throw(Exception::new(payload, trace)));
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.task.as_ref().is_some_and(|task| task.is_cancelled())
    }

    // -- upvalue protocol -------------------------------------------------

    /// Find or create the open upvalue for an absolute stack slot. The
    /// list is kept sorted by descending slot so capture dedups in one
    /// scan and closing stops early.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> Arc<UpvalueCell> {
        for (index, upvalue) in self.open_upvalues.iter().enumerate() {
            match upvalue.open_slot() {
                Some(existing) if existing == slot => return Arc::clone(upvalue),
                Some(existing) if existing < slot => {
                    let created = UpvalueCell::open(slot);
                    self.open_upvalues.insert(index, Arc::clone(&created));
                    return created;
                }
                _ => {}
            }
        }
        let created = UpvalueCell::open(slot);
        self.open_upvalues.push(Arc::clone(&created));
        created
    }

    /// Close every open upvalue at or above `watermark`. Idempotent:
    /// calling twice with the same watermark is a no-op the second time.
    pub(crate) fn close_upvalues(&mut self, watermark: usize) {
        // Descending order: closable entries form a prefix.
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let Some(slot) = self.open_upvalues[index].open_slot() else {
                index += 1;
                continue;
            };
            if slot < watermark {
                break;
            }
            let value = self.stack.get(slot).cloned().unwrap_or(Value::Null);
            self.open_upvalues[index].close(value);
            self.open_upvalues.remove(index);
        }
    }

    // -- the run loop -----------------------------------------------------

    /// Execute frames until the frame stack shrinks back to `floor`. On
    /// success the completed call's value has been pushed; it is popped
    /// and returned.
    pub(crate) fn run_frames(&mut self, floor: usize) -> Result<Value, RunError> {
        loop {
            if let Some(pending) = self.pending.take() {
                self.resolve_one(pending, floor)?;
                continue;
            }
            if self.frames.len() == floor {
                return self.pop();
            }
            self.step()?;
        }
    }

    /// One transition of the pending-action machine. See the module docs.
    fn resolve_one(&mut self, pending: Pending, floor: usize) -> Result<(), RunError> {
        // A handler in the current frame intercepts first.
        if self.frames.len() > floor {
            let frame_index = self.frames.len() - 1;
            if let Some(handler) = self.handlers.last_mut() {
                if handler.frame == frame_index {
                    match pending {
                        Pending::Throw(exc) => match handler.state {
                            HandlerState::Try if handler.catch_ip.is_some() => {
                                let catch_ip =
                                    handler.catch_ip.expect("guard checked catch_ip");
                                let depth = handler.stack_depth;
                                let iter_depth = handler.iter_depth;
                                handler.state = HandlerState::Catch;
                                // Unwinding lowers the stack past any
                                // locals captured in the try body; their
                                // upvalues close before the slots are
                                // recycled.
                                self.close_upvalues(depth);
                                self.stack.truncate(depth);
                                self.iterators.truncate(iter_depth);
                                self.current_exception = Some(exc);
                                self.frame_mut().ip = catch_ip;
                            }
                            HandlerState::Try | HandlerState::Catch => {
                                let finally_ip = handler.finally_ip;
                                let depth = handler.stack_depth;
                                let iter_depth = handler.iter_depth;
                                handler.state = HandlerState::Finally;
                                handler.pending = Some(Pending::Throw(exc));
                                self.close_upvalues(depth);
                                self.stack.truncate(depth);
                                self.iterators.truncate(iter_depth);
                                self.frame_mut().ip = finally_ip;
                            }
                            HandlerState::Finally => {
                                // A throw out of a finally supersedes
                                // whatever the finally was resuming.
                                self.handlers.pop();
                                self.pending = Some(Pending::Throw(exc));
                            }
                        },
                        Pending::Return(value) => match handler.state {
                            HandlerState::Try | HandlerState::Catch => {
                                let finally_ip = handler.finally_ip;
                                let depth = handler.stack_depth;
                                let iter_depth = handler.iter_depth;
                                handler.state = HandlerState::Finally;
                                handler.pending = Some(Pending::Return(value));
                                self.close_upvalues(depth);
                                self.stack.truncate(depth);
                                self.iterators.truncate(iter_depth);
                                self.frame_mut().ip = finally_ip;
                            }
                            HandlerState::Finally => {
                                self.handlers.pop();
                                self.pending = Some(Pending::Return(value));
                            }
                        },
                    }
                    return Ok(());
                }
            }
        }

        // No handler: the action crosses the frame boundary.
        if self.frames.len() == floor {
            return match pending {
                Pending::Throw(exc) => Err(RunError::Thrown(exc)),
                Pending::Return(value) => {
                    // A return at the floor has nothing to tear down.
                    self.push(value)
                }
            };
        }

        // Defers run before the frame goes away, LIFO.
        if let Some(defer) = self.frame_mut().defers.pop() {
            match self.run_subcall(defer, &[]) {
                Ok(_) => self.pending = Some(pending),
                // An exception escaping a defer supersedes the action in
                // flight.
                Err(RunError::Thrown(exc)) => self.pending = Some(Pending::Throw(exc)),
                Err(fatal) => return Err(fatal),
            }
            return Ok(());
        }

        // Tear the frame down.
        let frame = self.frames.pop().expect("frame count checked above");
        self.close_upvalues(frame.base);
        self.handlers.truncate(frame.handler_base);
        self.iterators.truncate(frame.iter_base);
        self.stack.truncate(frame.base);
        match pending {
            Pending::Return(value) => {
                self.push(value)?;
            }
            Pending::Throw(exc) => {
                self.pending = Some(Pending::Throw(exc));
            }
        }
        Ok(())
    }

    /// Synchronously call `callee` with `args` and return its value. Used
    /// for defers, parameter defaults and host-initiated calls.
    pub(crate) fn run_subcall(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> Result<Value, RunError> {
        let floor = self.frames.len();
        self.push(callee)?;
        for arg in args {
            self.push(arg.clone())?;
        }
        self.call_value(args.len() as u8)?;
        self.run_frames(floor)
    }

    // -- public entry points ----------------------------------------------

    /// Call a function value to completion on this VM.
    pub fn call_entry(&mut self, function: &Value, args: &[Value]) -> Result<Value, VmError> {
        self.run_subcall(function.clone(), args).map_err(VmError::from)
    }

    /// Run a compiled top-level chunk to completion.
    pub fn run_chunk(&mut self, chunk: Arc<Chunk>) -> Result<Value, VmError> {
        let function = function_for_chunk(chunk);
        self.call_entry(&function, &[])
    }

    /// One-shot VM for detached invocations (spawned tasks, FFI
    /// callbacks): builds a VM sharing `globals`/`services`, runs, and
    /// drops it.
    pub fn call_detached(
        globals: Globals,
        services: Arc<Services>,
        sink: OutputSink,
        function: &Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        Self::call_detached_as_task(globals, services, sink, function, args, None)
    }

    pub(crate) fn call_detached_as_task(
        globals: Globals,
        services: Arc<Services>,
        sink: OutputSink,
        function: &Value,
        args: &[Value],
        task: Option<Arc<TaskCell>>,
    ) -> Result<Value, VmError> {
        let mut vm = Vm::with_parts(globals, services, sink, VmConfig::from_env());
        vm.task = task;
        vm.call_entry(function, args)
    }
}

/// Runtime metadata for a chunk-only function (parameter names are not
/// part of the chunk; positional placeholders serve diagnostics).
pub(crate) fn meta_for_chunk(chunk: Arc<Chunk>) -> Arc<FunctionMeta> {
    let param_count = chunk.arity as usize + chunk.optional_count as usize;
    let params = (0..param_count).map(|i| format!("p{i}")).collect();
    let param_types = if chunk.param_types.len() == param_count {
        chunk.param_types.clone()
    } else {
        vec![None; param_count]
    };
    Arc::new(FunctionMeta {
        name: chunk.name.clone(),
        params,
        param_types,
        defaults: vec![None; param_count],
        rest_param: chunk.has_rest.then(|| "rest".to_string()),
        return_type: chunk.return_type,
        chunk,
    })
}

/// Wrap a top-level chunk as a zero-argument function value.
pub fn function_for_chunk(chunk: Arc<Chunk>) -> Value {
    Value::Function(Arc::new(FunctionCell::new(meta_for_chunk(chunk), vec![])))
}

/// Construct an object with a `message` field, the conventional shape for
/// structured exception payloads.
pub fn error_object(message: &str, code: Option<i64>) -> Value {
    let object = ObjectCell::new(None);
    object.set("message", Value::string(message));
    if let Some(code) = code {
        object.set("code", Value::I64(code));
    }
    Value::Object(Arc::new(object))
}


#[cfg(test)]
mod tests {
    use super::*;
    use alder_core::values_equal;

    fn test_vm() -> (Vm, Arc<Mutex<String>>) {
        let (sink, buffer) = OutputSink::capture();
        let vm = Vm::with_parts(
            Globals::new(),
            Services::init(),
            sink,
            VmConfig::default(),
        );
        (vm, buffer)
    }

    #[test]
    fn test_trivial_function_returns_null() {
        let (mut vm, _) = test_vm();
        let f = tests_support::trivial_function();
        let result = vm.call_entry(&f, &[]).unwrap();
        assert!(values_equal(&result, &Value::Null));
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn test_capture_dedups_open_upvalues() {
        let (mut vm, _) = test_vm();
        vm.stack = vec![Value::I32(1), Value::I32(2), Value::I32(3)];
        let a = vm.capture_upvalue(1);
        let b = vm.capture_upvalue(1);
        assert!(Arc::ptr_eq(&a, &b));
        let c = vm.capture_upvalue(2);
        assert!(!Arc::ptr_eq(&a, &c));
        // Sorted descending by slot.
        assert_eq!(vm.open_upvalues[0].open_slot(), Some(2));
        assert_eq!(vm.open_upvalues[1].open_slot(), Some(1));
    }

    #[test]
    fn test_close_upvalues_at_watermark() {
        let (mut vm, _) = test_vm();
        vm.stack = vec![Value::I32(10), Value::I32(20), Value::I32(30)];
        let low = vm.capture_upvalue(0);
        let high = vm.capture_upvalue(2);
        vm.close_upvalues(1);
        assert_eq!(high.open_slot(), None);
        assert!(values_equal(&high.closed_value(), &Value::I32(30)));
        assert_eq!(low.open_slot(), Some(0));
        assert_eq!(vm.open_upvalues.len(), 1);
    }

    #[test]
    fn test_close_upvalues_idempotent() {
        let (mut vm, _) = test_vm();
        vm.stack = vec![Value::I32(1)];
        let uv = vm.capture_upvalue(0);
        vm.close_upvalues(0);
        let first = uv.closed_value();
        vm.stack[0] = Value::I32(99);
        vm.close_upvalues(0);
        assert!(values_equal(&uv.closed_value(), &first));
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn test_output_capture() {
        let (sink, buffer) = OutputSink::capture();
        sink.write("a");
        sink.write_line("b");
        assert_eq!(*buffer.lock().unwrap(), "ab\n");
    }

    #[test]
    fn test_error_object_shape() {
        let payload = error_object("bad", Some(3));
        match payload {
            Value::Object(obj) => {
                assert!(obj.get("message").is_some());
                assert!(matches!(obj.get("code").unwrap(), Value::I64(3)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
