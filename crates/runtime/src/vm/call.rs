//! Calls, frames and task spawning
//!
//! The call protocol: slot 0 of a frame holds the callee (replaced by the
//! bound receiver for method calls), slots 1..=N the parameters, further
//! slots the frame's locals as the bytecode pushes them.
//!
//! Binding checks arity against the chunk's required/optional counts,
//! evaluates default chunks for missing optionals in the closure
//! environment, collects a rest array, then applies parameter type
//! coercions.

use super::{Frame, Vm, meta_for_chunk};
use crate::error::{FatalKind, RunError, VmError};
use crate::scheduler::Pool;
use alder_core::chunk::Constant;
use alder_core::{FunctionCell, TaskCell, TaskOutcome, UpvalueDesc, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl Vm {
    /// Dispatch a call to whatever sits below the arguments.
    pub(crate) fn call_value(&mut self, argc: u8) -> Result<(), RunError> {
        let argc = argc as usize;
        let callee_index = match self.stack.len().checked_sub(argc + 1) {
            Some(index) => index,
            None => {
                return Err(self.fatal(FatalKind::MalformedBytecode(
                    "call without callee on stack".into(),
                )));
            }
        };
        let callee = self.stack[callee_index].clone();
        match callee {
            Value::Function(function) => self.push_frame(function, argc),
            Value::NativeFn(handle) => {
                let args = self.pop_many(argc)?;
                self.pop()?; // the handle itself
                match crate::ffi::call::call_handle(&handle, &args, &self.services.structs) {
                    Ok(result) => self.push(result),
                    Err(err) => {
                        self.throw_message(err.to_string());
                        Ok(())
                    }
                }
            }
            Value::Task(_) => {
                self.throw_message("task handles are not callable");
                Ok(())
            }
            other => {
                self.throw_message(format!("value of type {} is not callable", other.type_name()));
                Ok(())
            }
        }
    }

    /// Arity checks, defaults, rest collection, type coercions, frame push.
    pub(crate) fn push_frame(
        &mut self,
        function: Arc<FunctionCell>,
        argc: usize,
    ) -> Result<(), RunError> {
        if self.frames.len() >= self.config.max_frames {
            return Err(self.fatal(FatalKind::FrameOverflow {
                limit: self.config.max_frames,
            }));
        }
        let chunk = Arc::clone(&function.meta.chunk);
        let required = chunk.arity as usize;
        let optional = chunk.optional_count as usize;
        let max_positional = required + optional;
        let base = self.stack.len() - argc - 1;

        if argc < required {
            self.stack.truncate(base);
            self.throw_message(format!(
                "{} expects at least {} argument(s), got {}",
                function.meta.name, required, argc
            ));
            return Ok(());
        }
        if argc > max_positional && !chunk.has_rest {
            self.stack.truncate(base);
            self.throw_message(format!(
                "{} expects at most {} argument(s), got {}",
                function.meta.name, max_positional, argc
            ));
            return Ok(());
        }

        // Rest arguments come off first so defaults land at their slots.
        let rest = if chunk.has_rest {
            let extra = argc.saturating_sub(max_positional);
            Some(self.pop_many(extra)?)
        } else {
            None
        };

        // Missing optionals: evaluate the default chunk in the closure
        // environment, or fall back to null. A throw inside a default
        // unwinds like any other call-site exception.
        for index in argc..max_positional {
            let default = function.meta.defaults.get(index).cloned().flatten();
            match default {
                Some(default_chunk) => {
                    let default_fn = Value::Function(Arc::new(FunctionCell {
                        meta: meta_for_chunk(default_chunk),
                        upvalues: function.upvalues.clone(),
                        env: function.env.clone(),
                        bound_self: None,
                    }));
                    let value = match self.run_subcall(default_fn, &[]) {
                        Ok(value) => value,
                        Err(RunError::Thrown(exc)) => {
                            self.stack.truncate(base);
                            self.pending = Some(super::Pending::Throw(exc));
                            return Ok(());
                        }
                        Err(fatal) => return Err(fatal),
                    };
                    self.push(value)?;
                }
                None => self.push(Value::Null)?,
            }
        }

        if let Some(rest) = rest {
            self.push(Value::array(rest))?;
        }

        // Parameter type coercions.
        for (index, ty) in chunk.param_types.iter().enumerate() {
            let Some(tag) = ty else { continue };
            let slot = base + 1 + index;
            if slot >= self.stack.len() {
                break;
            }
            if matches!(self.stack[slot], Value::Null) {
                continue;
            }
            match alder_core::cast(&self.stack[slot], *tag) {
                Ok(coerced) => self.stack[slot] = coerced,
                Err(err) => {
                    self.throw_message(format!(
                        "{}: parameter {}: {}",
                        function.meta.name,
                        index + 1,
                        err
                    ));
                    return Ok(());
                }
            }
        }

        if let Some(receiver) = &function.bound_self {
            self.stack[base] = receiver.clone();
        }

        self.frames.push(Frame {
            chunk,
            closure: function,
            ip: 0,
            base,
            defers: Vec::new(),
            handler_base: self.handlers.len(),
            iter_base: self.iterators.len(),
        });
        Ok(())
    }

    /// `TAIL_CALL`: reuse the current frame when the callee is a plain
    /// closure of matching shape; otherwise degrade to a normal call.
    pub(crate) fn tail_call(&mut self, argc: u8) -> Result<(), RunError> {
        let argc_usize = argc as usize;
        let callee_index = match self.stack.len().checked_sub(argc_usize + 1) {
            Some(index) => index,
            None => {
                return Err(self.fatal(FatalKind::MalformedBytecode(
                    "tail call without callee on stack".into(),
                )));
            }
        };
        let reusable = match &self.stack[callee_index] {
            Value::Function(function) => {
                let chunk = &function.meta.chunk;
                chunk.arity as usize == argc_usize
                    && chunk.optional_count == 0
                    && !chunk.has_rest
                    && self.frame().defers.is_empty()
                    && self.handlers.len() == self.frame().handler_base
            }
            _ => false,
        };
        if !reusable {
            return self.call_value(argc);
        }

        let Value::Function(function) = self.stack[callee_index].clone() else {
            unreachable!("reusable implies a function callee");
        };
        let base = self.frame().base;
        self.close_upvalues(base);
        let window = self.pop_many(argc_usize + 1)?;
        let iter_base = self.frame().iter_base;
        self.stack.truncate(base);
        self.iterators.truncate(iter_base);
        for value in window {
            self.push(value)?;
        }

        // Parameter type coercions for the new callee.
        let chunk = Arc::clone(&function.meta.chunk);
        for (index, ty) in chunk.param_types.iter().enumerate() {
            let Some(tag) = ty else { continue };
            let slot = base + 1 + index;
            if matches!(self.stack[slot], Value::Null) {
                continue;
            }
            match alder_core::cast(&self.stack[slot], *tag) {
                Ok(coerced) => self.stack[slot] = coerced,
                Err(err) => {
                    self.throw_message(format!(
                        "{}: parameter {}: {}",
                        function.meta.name,
                        index + 1,
                        err
                    ));
                    return Ok(());
                }
            }
        }
        if let Some(receiver) = &function.bound_self {
            self.stack[base] = receiver.clone();
        }

        let frame = self.frame_mut();
        frame.chunk = chunk;
        frame.closure = function;
        frame.ip = 0;
        Ok(())
    }

    /// `CALL_METHOD name16 argc8`: fetch, bind, call.
    pub(crate) fn call_method(&mut self, name_idx: u16, argc: u8) -> Result<(), RunError> {
        let receiver_depth = argc as usize;
        let name = match self.frame().chunk.ident_at(name_idx) {
            Some(name) => name.to_string(),
            None => {
                return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                    "CALL_METHOD with non-identifier constant {name_idx}"
                ))));
            }
        };
        let receiver = self.peek(receiver_depth)?.clone();
        let method = match &receiver {
            Value::Object(object) => match object.get(&name) {
                Some(value) => value,
                None => {
                    self.throw_message(format!("object has no method '{}'", name));
                    return Ok(());
                }
            },
            Value::Null => {
                self.throw_message(format!("null dereference calling '{}'", name));
                return Ok(());
            }
            other => {
                self.throw_message(format!(
                    "cannot call method '{}' on {}",
                    name,
                    other.type_name()
                ));
                return Ok(());
            }
        };
        match method {
            Value::Function(function) => {
                let bound = Arc::new(function.bind(receiver));
                let slot = self.stack.len() - 1 - receiver_depth;
                self.stack[slot] = Value::Function(bound);
                self.call_value(argc)
            }
            other => {
                self.throw_message(format!(
                    "field '{}' is {} and not callable",
                    name,
                    other.type_name()
                ));
                Ok(())
            }
        }
    }

    /// `APPLY`: pop the argument array and the callee under it, call with
    /// the array's elements.
    pub(crate) fn apply(&mut self) -> Result<(), RunError> {
        let args = match self.pop()? {
            Value::Array(cell) => cell.snapshot(),
            other => {
                self.pop()?; // discard callee
                self.throw_message(format!("apply expects an array, got {}", other.type_name()));
                return Ok(());
            }
        };
        if args.len() > u8::MAX as usize {
            self.pop()?;
            self.throw_message("apply: too many arguments (max 255)");
            return Ok(());
        }
        let argc = args.len() as u8;
        for arg in args {
            self.push(arg)?;
        }
        self.call_value(argc)
    }

    /// `SPAWN argc8`: package the callee and arguments as a work item and
    /// hand it to the scheduler; push the task handle.
    pub(crate) fn spawn(&mut self, argc: u8) -> Result<(), RunError> {
        let args = self.pop_many(argc as usize)?;
        let callee = self.pop()?;
        if !matches!(callee, Value::Function(_)) {
            self.throw_message(format!(
                "spawn expects a function, got {}",
                callee.type_name()
            ));
            return Ok(());
        }

        let task = Arc::new(TaskCell::new(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)));
        let cell = Arc::clone(&task);
        let globals = self.globals.clone();
        let services = Arc::clone(&self.services);
        let sink = self.sink.clone();
        tracing::trace!(task = task.id, "task spawned");

        Pool::global().submit(move || {
            let outcome = Vm::call_detached_as_task(
                globals,
                services,
                sink,
                &callee,
                &args,
                Some(Arc::clone(&cell)),
            );
            match outcome {
                Ok(value) => cell.complete(TaskOutcome::Completed(value)),
                Err(VmError::Uncaught(exc)) => {
                    cell.complete(TaskOutcome::Failed(exc.payload));
                }
                Err(VmError::Fatal(fatal)) => {
                    tracing::error!(task = cell.id, error = %fatal, "task died fatally");
                    cell.complete(TaskOutcome::Failed(Value::string(fatal.to_string())));
                }
            }
            // The work item drops its function reference here, breaking
            // the closure→environment cycle for completed tasks.
        });

        self.push(Value::Task(task))
    }

    /// Blocking wait on a task handle with cooperative cancellation.
    pub(crate) fn wait_task(&mut self, task: &Arc<TaskCell>) -> Result<Option<Value>, RunError> {
        if let Some(own) = &self.task {
            if Arc::ptr_eq(own, task) {
                self.throw_message("task cannot await itself");
                return Ok(None);
            }
        }
        loop {
            if let Some(outcome) = task.wait_timeout(std::time::Duration::from_millis(10)) {
                return match outcome {
                    TaskOutcome::Completed(value) => Ok(Some(value)),
                    TaskOutcome::Failed(payload) => {
                        self.throw_payload(payload);
                        Ok(None)
                    }
                };
            }
            if self.cancelled() {
                self.throw_message("task cancelled");
                return Ok(None);
            }
        }
    }

    /// Build a closure for the function constant at `idx`, capturing per
    /// `descriptors` against the current frame.
    pub(crate) fn build_closure(
        &mut self,
        idx: u16,
        descriptors: &[UpvalueDesc],
    ) -> Result<Value, RunError> {
        let chunk = match self.frame().chunk.constant(idx) {
            Some(Constant::Func(chunk)) => Arc::clone(chunk),
            _ => {
                return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                    "CLOSURE constant {idx} is not a function"
                ))));
            }
        };
        let base = self.frame().base;
        let enclosing = Arc::clone(&self.frame().closure);
        let mut upvalues = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.is_local {
                upvalues.push(self.capture_upvalue(base + descriptor.index as usize));
            } else {
                match enclosing.upvalues.get(descriptor.index as usize) {
                    Some(upvalue) => upvalues.push(Arc::clone(upvalue)),
                    None => {
                        return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                            "upvalue descriptor {} out of range",
                            descriptor.index
                        ))));
                    }
                }
            }
        }
        let cell = FunctionCell {
            meta: meta_for_chunk(chunk),
            upvalues,
            env: enclosing.env.clone(),
            bound_self: None,
        };
        Ok(Value::Function(Arc::new(cell)))
    }

    /// `DEFER idx16`: build a closure from the deferred chunk's metadata
    /// descriptors and register it with the current frame.
    pub(crate) fn register_defer(&mut self, idx: u16) -> Result<(), RunError> {
        let descriptors = match self.frame().chunk.constant(idx) {
            Some(Constant::Func(chunk)) => chunk.upvalues.clone(),
            _ => {
                return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                    "DEFER constant {idx} is not a function"
                ))));
            }
        };
        let closure = self.build_closure(idx, &descriptors)?;
        self.frame_mut().defers.push(closure);
        Ok(())
    }
}
