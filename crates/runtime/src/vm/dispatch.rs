//! The interpretation loop
//!
//! `step` decodes and executes exactly one instruction. Faults split per
//! the failure contract: language-visible conditions (division by zero,
//! bad index, field not found, wrong operand type, null dereference,
//! failed coercion) set a pending exception; malformed bytecode and
//! resource exhaustion are fatal.

use super::{ForIter, Handler, HandlerState, Pending, Vm};
use crate::builtins;
use crate::error::{Exception, FatalKind, RunError};
use alder_core::chunk::Constant;
use alder_core::opcode::NO_CATCH;
use alder_core::{
    AlderString, ChannelError, NumericError, ObjectCell, Op, TypeTag, UpvalueDesc, Value,
    values_equal,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// Extract an integer index operand; floats and non-numerics are refused.
fn index_of(value: &Value) -> Option<i64> {
    Some(match value {
        Value::I8(v) => *v as i64,
        Value::I16(v) => *v as i64,
        Value::I32(v) => *v as i64,
        Value::I64(v) => *v,
        Value::U8(v) => *v as i64,
        Value::U16(v) => *v as i64,
        Value::U32(v) => *v as i64,
        Value::U64(v) => i64::try_from(*v).ok()?,
        _ => return None,
    })
}

impl Vm {
    pub(crate) fn step(&mut self) -> Result<(), RunError> {
        let byte = self.read_byte()?;
        let Some(op) = Op::from_byte(byte) else {
            return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                "undefined opcode {byte:#04x}"
            ))));
        };

        match op {
            // -- constants & literals ------------------------------------
            Op::Const => {
                let idx = self.read_u16()?;
                let value = self.constant_value(idx)?;
                self.push(value)?;
            }
            Op::ConstByte => {
                let byte = self.read_byte()?;
                self.push(Value::I32(byte as i32))?;
            }
            Op::Null => self.push(Value::Null)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Array => {
                let count = self.read_u16()? as usize;
                let elems = self.pop_many(count)?;
                self.push(Value::array(elems))?;
            }
            Op::Object => {
                let count = self.read_u16()? as usize;
                let mut flat = self.pop_many(count * 2)?;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let value = flat.pop().expect("pop_many returned 2n values");
                    let key = flat.pop().expect("pop_many returned 2n values");
                    match key {
                        Value::Str(s) => pairs.push((s.to_owned_string(), value)),
                        other => {
                            self.throw_message(format!(
                                "object keys must be strings, got {}",
                                other.type_name()
                            ));
                            return Ok(());
                        }
                    }
                }
                pairs.reverse();
                self.push(Value::Object(Arc::new(ObjectCell::with_fields(None, pairs))))?;
            }
            Op::StringInterp => {
                let count = self.read_u16()? as usize;
                let parts = self.pop_many(count)?;
                let mut text = String::new();
                for part in &parts {
                    text.push_str(&alder_core::display_string(part));
                }
                self.push(Value::Str(AlderString::from_string(text)))?;
            }
            Op::Closure => {
                let idx = self.read_u16()?;
                let count = self.read_byte()? as usize;
                let mut descriptors = Vec::with_capacity(count);
                for _ in 0..count {
                    let is_local = self.read_byte()? != 0;
                    let index = self.read_byte()?;
                    descriptors.push(UpvalueDesc { is_local, index });
                }
                let closure = self.build_closure(idx, &descriptors)?;
                self.push(closure)?;
            }

            // -- variables ------------------------------------------------
            Op::GetLocal => {
                let slot = self.read_byte()? as usize;
                let index = self.frame().base + slot;
                let value = match self.stack.get(index) {
                    Some(value) => value.clone(),
                    None => {
                        return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                            "GET_LOCAL {slot} above stack top"
                        ))));
                    }
                };
                self.push(value)?;
            }
            Op::SetLocal => {
                let slot = self.read_byte()? as usize;
                let index = self.frame().base + slot;
                let value = self.peek(0)?.clone();
                match self.stack.get_mut(index) {
                    Some(slot_ref) => *slot_ref = value,
                    None => {
                        return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                            "SET_LOCAL {slot} above stack top"
                        ))));
                    }
                }
            }
            Op::GetUpvalue => {
                let slot = self.read_byte()? as usize;
                let upvalue = match self.frame().closure.upvalues.get(slot) {
                    Some(upvalue) => Arc::clone(upvalue),
                    None => {
                        return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                            "GET_UPVALUE {slot} out of range"
                        ))));
                    }
                };
                let value = match upvalue.open_slot() {
                    Some(stack_slot) => self.stack[stack_slot].clone(),
                    None => upvalue.closed_value(),
                };
                self.push(value)?;
            }
            Op::SetUpvalue => {
                let slot = self.read_byte()? as usize;
                let value = self.peek(0)?.clone();
                let upvalue = match self.frame().closure.upvalues.get(slot) {
                    Some(upvalue) => Arc::clone(upvalue),
                    None => {
                        return Err(self.fatal(FatalKind::MalformedBytecode(format!(
                            "SET_UPVALUE {slot} out of range"
                        ))));
                    }
                };
                match upvalue.open_slot() {
                    Some(stack_slot) => self.stack[stack_slot] = value,
                    None => upvalue.set_closed_value(value),
                }
            }
            Op::GetGlobal => {
                let idx = self.read_u16()?;
                let name = self.ident(idx)?;
                match self.globals.get(&name) {
                    Some(value) => self.push(value)?,
                    None => self.throw_message(format!("undefined global '{}'", name)),
                }
            }
            Op::SetGlobal => {
                let idx = self.read_u16()?;
                let name = self.ident(idx)?;
                let value = self.peek(0)?.clone();
                if let Err(err) = self.globals.set(&name, value) {
                    self.throw_message(err.to_string());
                }
            }
            Op::DefineGlobal => {
                let idx = self.read_u16()?;
                let name = self.ident(idx)?;
                let value = self.pop()?;
                if let Err(err) = self.globals.define(&name, value, true, false) {
                    self.throw_message(err.to_string());
                }
            }
            Op::GetProperty => {
                let idx = self.read_u16()?;
                let name = self.ident(idx)?;
                let target = self.pop()?;
                match target {
                    Value::Object(object) => match object.get(&name) {
                        Some(value) => self.push(value)?,
                        None => self.throw_message(format!("field '{}' not found", name)),
                    },
                    Value::Null => {
                        self.throw_message(format!("null dereference reading '{}'", name))
                    }
                    other => self.throw_message(format!(
                        "{} has no properties (reading '{}')",
                        other.type_name(),
                        name
                    )),
                }
            }
            Op::SetProperty => {
                let idx = self.read_u16()?;
                let name = self.ident(idx)?;
                let value = self.pop()?;
                let target = self.pop()?;
                match target {
                    Value::Object(object) => {
                        object.set(&name, value.clone());
                        self.push(value)?;
                    }
                    Value::Null => {
                        self.throw_message(format!("null dereference writing '{}'", name))
                    }
                    other => self.throw_message(format!(
                        "{} has no properties (writing '{}')",
                        other.type_name(),
                        name
                    )),
                }
            }
            Op::GetIndex => {
                let index = self.pop()?;
                let target = self.pop()?;
                self.get_index(target, index)?;
            }
            Op::SetIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let target = self.pop()?;
                self.set_index(target, index, value)?;
            }

            // -- arithmetic ----------------------------------------------
            Op::Add => self.binary_add()?,
            Op::Sub => self.binary_numeric(alder_core::numeric::sub)?,
            Op::Mul => self.binary_numeric(alder_core::numeric::mul)?,
            Op::Div => self.binary_numeric(alder_core::numeric::div)?,
            Op::FloorDiv => self.binary_numeric(alder_core::numeric::floor_div)?,
            Op::Rem => self.binary_numeric(alder_core::numeric::rem)?,
            Op::Neg => {
                let value = self.pop()?;
                match alder_core::numeric::neg(&value) {
                    Ok(result) => self.push(result)?,
                    Err(err) => self.throw_message(err.to_string()),
                }
            }
            Op::AddI32 => {
                if let (Value::I32(a), Value::I32(b)) = (self.peek(1)?, self.peek(0)?) {
                    let result = Value::I32(a.wrapping_add(*b));
                    self.stack.truncate(self.stack.len() - 2);
                    self.push(result)?;
                } else {
                    self.binary_add()?;
                }
            }
            Op::SubI32 => {
                if let (Value::I32(a), Value::I32(b)) = (self.peek(1)?, self.peek(0)?) {
                    let result = Value::I32(a.wrapping_sub(*b));
                    self.stack.truncate(self.stack.len() - 2);
                    self.push(result)?;
                } else {
                    self.binary_numeric(alder_core::numeric::sub)?;
                }
            }
            Op::MulI32 => {
                if let (Value::I32(a), Value::I32(b)) = (self.peek(1)?, self.peek(0)?) {
                    let result = Value::I32(a.wrapping_mul(*b));
                    self.stack.truncate(self.stack.len() - 2);
                    self.push(result)?;
                } else {
                    self.binary_numeric(alder_core::numeric::mul)?;
                }
            }

            // -- comparison ----------------------------------------------
            Op::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(values_equal(&a, &b)))?;
            }
            Op::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(!values_equal(&a, &b)))?;
            }
            Op::Less => self.comparison("<", |ord| ord == Some(Ordering::Less))?,
            Op::LessEqual => self.comparison("<=", |ord| {
                matches!(ord, Some(Ordering::Less | Ordering::Equal))
            })?,
            Op::Greater => self.comparison(">", |ord| ord == Some(Ordering::Greater))?,
            Op::GreaterEqual => self.comparison(">=", |ord| {
                matches!(ord, Some(Ordering::Greater | Ordering::Equal))
            })?,
            Op::EqualI32 => {
                if let (Value::I32(a), Value::I32(b)) = (self.peek(1)?, self.peek(0)?) {
                    let result = Value::Bool(a == b);
                    self.stack.truncate(self.stack.len() - 2);
                    self.push(result)?;
                } else {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(values_equal(&a, &b)))?;
                }
            }
            Op::LessI32 => {
                if let (Value::I32(a), Value::I32(b)) = (self.peek(1)?, self.peek(0)?) {
                    let result = Value::Bool(a < b);
                    self.stack.truncate(self.stack.len() - 2);
                    self.push(result)?;
                } else {
                    self.comparison("<", |ord| ord == Some(Ordering::Less))?;
                }
            }

            // -- logical / bitwise ---------------------------------------
            Op::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()))?;
            }
            Op::BitAnd => self.binary_numeric(alder_core::numeric::bit_and)?,
            Op::BitOr => self.binary_numeric(alder_core::numeric::bit_or)?,
            Op::BitXor => self.binary_numeric(alder_core::numeric::bit_xor)?,
            Op::Shl => self.binary_numeric(alder_core::numeric::shl)?,
            Op::Shr => self.binary_numeric(alder_core::numeric::shr)?,
            Op::BitNot => {
                let value = self.pop()?;
                match alder_core::numeric::bit_not(&value) {
                    Ok(result) => self.push(result)?,
                    Err(err) => self.throw_message(err.to_string()),
                }
            }

            // -- control flow --------------------------------------------
            Op::Jump => {
                let offset = self.read_u16()? as usize;
                self.frame_mut().ip += offset;
            }
            Op::JumpIfFalse => {
                let offset = self.read_u16()? as usize;
                if !self.peek(0)?.is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::JumpIfFalsePop => {
                let offset = self.read_u16()? as usize;
                let value = self.pop()?;
                if !value.is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::JumpIfTrue => {
                let offset = self.read_u16()? as usize;
                if self.peek(0)?.is_truthy() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_u16()? as usize;
                let ip = self.frame().ip;
                if offset > ip {
                    return Err(self.fatal(FatalKind::MalformedBytecode(
                        "LOOP before chunk start".into(),
                    )));
                }
                self.frame_mut().ip = ip - offset;
            }
            Op::Switch => {
                let count = self.read_u16()? as usize;
                let table_start = self.frame().ip;
                let after_table = table_start + count * 2;
                let scrutinee = self.pop()?;
                let Some(case) = index_of(&scrutinee) else {
                    self.throw_message(format!(
                        "switch scrutinee must be an integer, got {}",
                        scrutinee.type_name()
                    ));
                    return Ok(());
                };
                if case >= 0 && (case as usize) < count {
                    let entry = table_start + case as usize * 2;
                    let offset = match self.frame().chunk.read_u16(entry) {
                        Some(offset) => offset as usize,
                        None => {
                            return Err(self.fatal(FatalKind::MalformedBytecode(
                                "SWITCH table past chunk end".into(),
                            )));
                        }
                    };
                    self.frame_mut().ip = after_table + offset;
                } else {
                    self.frame_mut().ip = after_table;
                }
            }
            Op::ForInInit => {
                let iterable = self.pop()?;
                let iterator = match iterable {
                    Value::Array(cell) => ForIter::Array { cell, index: 0 },
                    Value::Object(object) => ForIter::Object {
                        keys: object.keys(),
                        index: 0,
                    },
                    Value::Str(string) => ForIter::Str { string, offset: 0 },
                    other => {
                        self.throw_message(format!(
                            "{} is not iterable",
                            other.type_name()
                        ));
                        return Ok(());
                    }
                };
                self.iterators.push(iterator);
            }
            Op::ForInNext => {
                let offset = self.read_u16()? as usize;
                let next = match self.iterators.last_mut() {
                    Some(ForIter::Array { cell, index }) => {
                        let value = cell.get(*index as i64).ok();
                        if value.is_some() {
                            *index += 1;
                        }
                        value
                    }
                    Some(ForIter::Object { keys, index }) => {
                        let key = keys.get(*index).cloned();
                        if key.is_some() {
                            *index += 1;
                        }
                        key.map(Value::string)
                    }
                    Some(ForIter::Str { string, offset }) => {
                        match string.rune_at(*offset) {
                            Some((rune, next_offset)) => {
                                *offset = next_offset;
                                Some(Value::Rune(rune))
                            }
                            None => None,
                        }
                    }
                    None => {
                        return Err(self.fatal(FatalKind::MalformedBytecode(
                            "FOR_IN_NEXT without iterator".into(),
                        )));
                    }
                };
                match next {
                    Some(value) => self.push(value)?,
                    None => {
                        self.iterators.pop();
                        self.frame_mut().ip += offset;
                    }
                }
            }
            Op::Pop => {
                // Scope exits lower the stack past captured locals; any
                // open upvalue above the new top closes first.
                if !self.open_upvalues.is_empty() {
                    let new_top = self.stack.len().saturating_sub(1);
                    self.close_upvalues(new_top);
                }
                self.pop()?;
            }
            Op::PopN => {
                let count = self.read_byte()? as usize;
                if !self.open_upvalues.is_empty() {
                    let new_top = self.stack.len().saturating_sub(count);
                    self.close_upvalues(new_top);
                }
                self.pop_many(count)?;
            }
            Op::Dup => {
                let value = self.peek(0)?.clone();
                self.push(value)?;
            }
            Op::Dup2 => {
                let a = self.peek(1)?.clone();
                let b = self.peek(0)?.clone();
                self.push(a)?;
                self.push(b)?;
            }
            Op::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.fatal(FatalKind::MalformedBytecode(
                        "SWAP needs two values".into(),
                    )));
                }
                self.stack.swap(len - 1, len - 2);
            }
            Op::Bury3 => {
                let len = self.stack.len();
                if len < 3 {
                    return Err(self.fatal(FatalKind::MalformedBytecode(
                        "BURY3 needs three values".into(),
                    )));
                }
                let top = self.stack.pop().expect("length checked");
                self.stack.insert(len - 3, top);
            }
            Op::Rot3 => {
                let len = self.stack.len();
                if len < 3 {
                    return Err(self.fatal(FatalKind::MalformedBytecode(
                        "ROT3 needs three values".into(),
                    )));
                }
                let third = self.stack.remove(len - 3);
                self.stack.push(third);
            }

            // -- calls ----------------------------------------------------
            Op::Call => {
                let argc = self.read_byte()?;
                self.call_value(argc)?;
            }
            Op::TailCall => {
                let argc = self.read_byte()?;
                self.tail_call(argc)?;
            }
            Op::CallMethod => {
                let idx = self.read_u16()?;
                let argc = self.read_byte()?;
                self.call_method(idx, argc)?;
            }
            Op::CallBuiltin => {
                let id = self.read_u16()?;
                let argc = self.read_byte()? as usize;
                let args = self.pop_many(argc)?;
                match builtins::dispatch(id, args, &self.sink) {
                    Ok(value) => self.push(value)?,
                    Err(message) => self.throw_message(message),
                }
            }
            Op::Apply => self.apply()?,
            Op::Return => {
                let value = self.pop()?;
                self.pending = Some(Pending::Return(value));
            }

            // -- exception handling --------------------------------------
            Op::Try => {
                let catch = self.read_u16()?;
                let finally = self.read_u16()?;
                let base_ip = self.frame().ip;
                let handler = Handler {
                    frame: self.frames.len() - 1,
                    stack_depth: self.stack.len(),
                    iter_depth: self.iterators.len(),
                    catch_ip: (catch != NO_CATCH).then(|| base_ip + catch as usize),
                    finally_ip: base_ip + finally as usize,
                    state: HandlerState::Try,
                    pending: None,
                };
                self.handlers.push(handler);
            }
            Op::Throw => {
                let payload = self.pop()?;
                let trace = self.capture_trace();
                self.pending = Some(Pending::Throw(Exception::new(payload, trace)));
            }
            Op::Catch => match self.current_exception.take() {
                Some(exception) => self.push(exception.payload)?,
                None => {
                    return Err(self.fatal(FatalKind::MalformedBytecode(
                        "CATCH without active exception".into(),
                    )));
                }
            },
            Op::EndTry => {
                let frame_index = self.frames.len() - 1;
                let Some(handler) = self.handlers.last_mut() else {
                    return Err(self.fatal(FatalKind::MalformedBytecode(
                        "END_TRY without handler".into(),
                    )));
                };
                if handler.frame != frame_index {
                    return Err(self.fatal(FatalKind::MalformedBytecode(
                        "END_TRY crosses a frame boundary".into(),
                    )));
                }
                match handler.state {
                    HandlerState::Try | HandlerState::Catch => {
                        handler.state = HandlerState::Finally;
                        let finally_ip = handler.finally_ip;
                        self.frame_mut().ip = finally_ip;
                    }
                    HandlerState::Finally => {
                        let handler = self.handlers.pop().expect("checked above");
                        if let Some(resumed) = handler.pending {
                            self.pending = Some(resumed);
                        }
                    }
                }
            }
            Op::Defer => {
                let idx = self.read_u16()?;
                self.register_defer(idx)?;
            }

            // -- async primitives ----------------------------------------
            Op::Spawn => {
                let argc = self.read_byte()?;
                self.spawn(argc)?;
            }
            Op::Await => {
                let value = self.pop()?;
                match value {
                    Value::Task(task) => {
                        if let Some(result) = self.wait_task(&task)? {
                            self.push(result)?;
                        }
                    }
                    // Awaiting a non-task passes the value through.
                    other => self.push(other)?,
                }
            }
            Op::Join => {
                let value = self.pop()?;
                match value {
                    Value::Task(task) => {
                        if let Some(result) = self.wait_task(&task)? {
                            self.push(result)?;
                        }
                    }
                    other => self.throw_message(format!(
                        "join expects a task, got {}",
                        other.type_name()
                    )),
                }
            }
            Op::Detach => {
                let value = self.pop()?;
                match value {
                    Value::Task(task) => task.detach(),
                    other => self.throw_message(format!(
                        "detach expects a task, got {}",
                        other.type_name()
                    )),
                }
            }
            Op::Channel => {
                let capacity = self.pop()?;
                match index_of(&capacity) {
                    Some(cap) if cap >= 0 => {
                        self.push(Value::Channel(Arc::new(
                            alder_core::ChannelCell::new(cap as usize),
                        )))?;
                    }
                    _ => self.throw_message(format!(
                        "channel capacity must be a non-negative integer, got {}",
                        capacity.type_name()
                    )),
                }
            }
            Op::Send => {
                let channel = self.pop()?;
                let value = self.pop()?;
                match channel {
                    Value::Channel(channel) => {
                        let task = self.task.clone();
                        let cancelled =
                            move || task.as_ref().is_some_and(|task| task.is_cancelled());
                        match channel.send_inner(value, None, Some(&cancelled)) {
                            Ok(()) => {}
                            Err(ChannelError::Closed) => {
                                self.throw_message("send on closed channel")
                            }
                            Err(ChannelError::Cancelled) => {
                                self.throw_message("task cancelled")
                            }
                            Err(err) => self.throw_message(err.to_string()),
                        }
                    }
                    other => self.throw_message(format!(
                        "send expects a channel, got {}",
                        other.type_name()
                    )),
                }
            }
            Op::Recv => {
                let channel = self.pop()?;
                match channel {
                    Value::Channel(channel) => {
                        let task = self.task.clone();
                        let cancelled =
                            move || task.as_ref().is_some_and(|task| task.is_cancelled());
                        match channel.recv_inner(None, Some(&cancelled)) {
                            Ok(value) => self.push(value)?,
                            // Closed and drained reads as null.
                            Err(ChannelError::Closed) => self.push(Value::Null)?,
                            Err(ChannelError::Cancelled) => {
                                self.throw_message("task cancelled")
                            }
                            Err(err) => self.throw_message(err.to_string()),
                        }
                    }
                    other => self.throw_message(format!(
                        "recv expects a channel, got {}",
                        other.type_name()
                    )),
                }
            }
            Op::Select => {
                let count = self.read_byte()? as usize;
                self.select(count)?;
            }

            // -- type operations -----------------------------------------
            Op::TypeOf => {
                let value = self.pop()?;
                self.push(Value::string(value.type_name()))?;
            }
            Op::Cast => {
                let tag = self.type_operand()?;
                let value = self.pop()?;
                match alder_core::cast(&value, tag) {
                    Ok(result) => self.push(result)?,
                    Err(err) => self.throw_message(err.to_string()),
                }
            }
            Op::CheckType => {
                let tag = self.type_operand()?;
                let value = self.peek(0)?;
                if let Err(err) = alder_core::check_type(value, tag) {
                    self.throw_message(err.to_string());
                }
            }
            Op::DefineType => {
                let idx = self.read_u16()?;
                let name = self.ident(idx)?;
                if let Err(err) = self.services.define_type(&name) {
                    self.throw_message(err.to_string());
                }
            }
            Op::DefineEnum => {
                let idx = self.read_u16()?;
                let name = self.ident(idx)?;
                let variants_value = self.pop()?;
                let variants = match &variants_value {
                    Value::Array(cell) => {
                        let mut names = Vec::with_capacity(cell.len());
                        for element in cell.snapshot() {
                            match element {
                                Value::Str(s) => names.push(s.to_owned_string()),
                                other => {
                                    self.throw_message(format!(
                                        "enum variants must be strings, got {}",
                                        other.type_name()
                                    ));
                                    return Ok(());
                                }
                            }
                        }
                        names
                    }
                    other => {
                        self.throw_message(format!(
                            "enum definition expects an array of variants, got {}",
                            other.type_name()
                        ));
                        return Ok(());
                    }
                };
                if let Err(err) = self.services.define_enum(&name, variants) {
                    self.throw_message(err.to_string());
                }
            }

            // -- debug / misc --------------------------------------------
            Op::Print => {
                let count = self.read_byte()? as usize;
                let parts = self.pop_many(count)?;
                let text = parts
                    .iter()
                    .map(alder_core::display_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.sink.write_line(&text);
            }
            Op::Nop => {}
        }
        Ok(())
    }

    // -- shared operand/venue helpers ------------------------------------

    fn ident(&mut self, idx: u16) -> Result<String, RunError> {
        match self.frame().chunk.ident_at(idx) {
            Some(name) => Ok(name.to_string()),
            None => Err(self.fatal(FatalKind::MalformedBytecode(format!(
                "constant {idx} is not an identifier"
            )))),
        }
    }

    fn type_operand(&mut self) -> Result<TypeTag, RunError> {
        let byte = self.read_byte()?;
        TypeTag::from_u8(byte).ok_or_else(|| {
            self.fatal(FatalKind::MalformedBytecode(format!(
                "unknown type tag {byte}"
            )))
        })
    }

    fn constant_value(&mut self, idx: u16) -> Result<Value, RunError> {
        match self.frame().chunk.constant(idx) {
            Some(Constant::I32(v)) => Ok(Value::I32(*v)),
            Some(Constant::I64(v)) => Ok(Value::I64(*v)),
            Some(Constant::F64(v)) => Ok(Value::F64(*v)),
            // Each load yields a fresh string cell: literals are mutable
            // values and must not alias the pool.
            Some(Constant::Str { text, .. }) => Ok(Value::string(text.clone())),
            Some(Constant::Ident(name)) => Ok(Value::string(name.clone())),
            Some(Constant::Func(_)) => self.build_closure(idx, &[]),
            None => Err(self.fatal(FatalKind::MalformedBytecode(format!(
                "constant {idx} out of range"
            )))),
        }
    }

    fn binary_add(&mut self) -> Result<(), RunError> {
        let b = self.pop()?;
        let a = self.pop()?;
        if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
            match alder_core::concat(&a, &b) {
                Ok(result) => return self.push(result),
                Err(err) => {
                    self.throw_message(err.to_string());
                    return Ok(());
                }
            }
        }
        match alder_core::numeric::add(&a, &b) {
            Ok(result) => self.push(result),
            Err(err) => {
                self.throw_message(err.to_string());
                Ok(())
            }
        }
    }

    fn binary_numeric(
        &mut self,
        op: fn(&Value, &Value) -> Result<Value, NumericError>,
    ) -> Result<(), RunError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match op(&a, &b) {
            Ok(result) => self.push(result),
            Err(err) => {
                self.throw_message(err.to_string());
                Ok(())
            }
        }
    }

    fn comparison(
        &mut self,
        name: &'static str,
        pred: fn(Option<Ordering>) -> bool,
    ) -> Result<(), RunError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match alder_core::numeric::compare(name, &a, &b) {
            Ok(ordering) => self.push(Value::Bool(pred(ordering))),
            Err(err) => {
                self.throw_message(err.to_string());
                Ok(())
            }
        }
    }

    fn get_index(&mut self, target: Value, index: Value) -> Result<(), RunError> {
        match target {
            Value::Array(cell) => match index_of(&index) {
                Some(i) => match cell.get(i) {
                    Ok(value) => self.push(value)?,
                    Err(err) => self.throw_message(err.to_string()),
                },
                None => self.throw_message(format!(
                    "array index must be an integer, got {}",
                    index.type_name()
                )),
            },
            Value::Object(object) => match index {
                Value::Str(key) => {
                    let key = key.to_owned_string();
                    match object.get(&key) {
                        Some(value) => self.push(value)?,
                        None => self.throw_message(format!("field '{}' not found", key)),
                    }
                }
                other => self.throw_message(format!(
                    "object key must be a string, got {}",
                    other.type_name()
                )),
            },
            Value::Str(string) => match index_of(&index) {
                Some(i) if i >= 0 => {
                    let mut offset = 0usize;
                    let mut remaining = i;
                    let mut found = None;
                    while let Some((rune, next)) = string.rune_at(offset) {
                        if remaining == 0 {
                            found = Some(rune);
                            break;
                        }
                        remaining -= 1;
                        offset = next;
                    }
                    match found {
                        Some(rune) => self.push(Value::Rune(rune))?,
                        None => self.throw_message(format!(
                            "string index {} out of range (len {})",
                            i,
                            string.char_count()
                        )),
                    }
                }
                _ => self.throw_message("string index must be a non-negative integer"),
            },
            Value::Buffer(buffer) => match index_of(&index) {
                Some(i) if i >= 0 => match buffer.get(i as usize) {
                    Some(byte) => self.push(Value::U8(byte))?,
                    None => self.throw_message(format!(
                        "buffer index {} out of range (len {})",
                        i,
                        buffer.len()
                    )),
                },
                _ => self.throw_message("buffer index must be a non-negative integer"),
            },
            Value::Null => self.throw_message("null dereference in index expression"),
            other => {
                self.throw_message(format!("{} is not indexable", other.type_name()))
            }
        }
        Ok(())
    }

    fn set_index(
        &mut self,
        target: Value,
        index: Value,
        value: Value,
    ) -> Result<(), RunError> {
        match target {
            Value::Array(cell) => match index_of(&index) {
                Some(i) => match cell.set(i, value.clone()) {
                    Ok(()) => self.push(value)?,
                    Err(err) => self.throw_message(err.to_string()),
                },
                None => self.throw_message(format!(
                    "array index must be an integer, got {}",
                    index.type_name()
                )),
            },
            Value::Object(object) => match index {
                Value::Str(key) => {
                    object.set(&key.to_owned_string(), value.clone());
                    self.push(value)?;
                }
                other => self.throw_message(format!(
                    "object key must be a string, got {}",
                    other.type_name()
                )),
            },
            Value::Buffer(buffer) => match (index_of(&index), index_of(&value)) {
                (Some(i), Some(byte)) if i >= 0 && (0..=255).contains(&byte) => {
                    if buffer.set(i as usize, byte as u8) {
                        self.push(value)?;
                    } else {
                        self.throw_message(format!(
                            "buffer index {} out of range (len {})",
                            i,
                            buffer.len()
                        ));
                    }
                }
                _ => self.throw_message("buffer writes need an index and a byte value"),
            },
            Value::Null => self.throw_message("null dereference in index assignment"),
            other => {
                self.throw_message(format!("{} is not indexable", other.type_name()))
            }
        }
        Ok(())
    }

    /// `SELECT`: poll the channels round-robin until one delivers. Pushes
    /// the received value, then the winning index; all-closed pushes
    /// `null` and index `-1`.
    fn select(&mut self, count: usize) -> Result<(), RunError> {
        let channels = self.pop_many(count)?;
        let mut cells = Vec::with_capacity(count);
        for value in &channels {
            match value {
                Value::Channel(cell) => cells.push(Arc::clone(cell)),
                other => {
                    self.throw_message(format!(
                        "select expects channels, got {}",
                        other.type_name()
                    ));
                    return Ok(());
                }
            }
        }
        if cells.is_empty() {
            self.throw_message("select needs at least one channel");
            return Ok(());
        }
        loop {
            let mut closed = 0;
            for (index, cell) in cells.iter().enumerate() {
                match cell.try_recv() {
                    Ok(value) => {
                        self.push(value)?;
                        self.push(Value::I64(index as i64))?;
                        return Ok(());
                    }
                    Err(ChannelError::Closed) => closed += 1,
                    Err(_) => {}
                }
            }
            if closed == cells.len() {
                self.push(Value::Null)?;
                self.push(Value::I64(-1))?;
                return Ok(());
            }
            if self.cancelled() {
                self.throw_message("task cancelled");
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_micros(500));
        }
    }
}
