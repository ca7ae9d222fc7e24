//! Bytecode disassembler
//!
//! Debug-build support for dumping a chunk to readable text: one
//! instruction per line with byte offset, source line (`|` when unchanged),
//! mnemonic, decoded operands, and resolved constants where an operand
//! names one.

use crate::chunk::{Chunk, Constant};
use crate::opcode::{NO_CATCH, Op};
use crate::value::TypeTag;
use std::fmt::Write;

/// Disassemble a whole chunk, nested function constants included.
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", chunk.name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = instruction_at(chunk, offset, &mut out);
    }
    for constant in &chunk.constants {
        if let Constant::Func(inner) = constant {
            out.push('\n');
            out.push_str(&disassemble(inner));
        }
    }
    out
}

fn constant_brief(chunk: &Chunk, idx: u16) -> String {
    match chunk.constant(idx) {
        Some(Constant::I32(v)) => format!("{}", v),
        Some(Constant::I64(v)) => format!("{}", v),
        Some(Constant::F64(v)) => format!("{}", v),
        Some(Constant::Str { text, .. }) => format!("{:?}", text),
        Some(Constant::Ident(name)) => name.clone(),
        Some(Constant::Func(f)) => format!("<fn {}>", f.name),
        None => "<bad const>".to_string(),
    }
}

/// Print one instruction; returns the offset of the next.
pub fn instruction_at(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    let line = chunk.line_for_offset(offset);
    if offset > 0 && line == chunk.line_for_offset(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", line);
    }

    let byte = chunk.code[offset];
    let Some(op) = Op::from_byte(byte) else {
        let _ = writeln!(out, "BAD_OPCODE {:#04x}", byte);
        return offset + 1;
    };

    let mut next = offset + 1 + op.operand_bytes();
    match op {
        Op::Const | Op::GetGlobal | Op::SetGlobal | Op::DefineGlobal | Op::GetProperty
        | Op::SetProperty | Op::Defer | Op::DefineType | Op::DefineEnum => {
            let idx = chunk.read_u16(offset + 1).unwrap_or(0);
            let _ = writeln!(out, "{:<16} {:4} ; {}", op.name(), idx, constant_brief(chunk, idx));
        }
        Op::ConstByte | Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue
        | Op::PopN | Op::Call | Op::TailCall | Op::Spawn | Op::Select | Op::Print => {
            let operand = chunk.code.get(offset + 1).copied().unwrap_or(0);
            let _ = writeln!(out, "{:<16} {:4}", op.name(), operand);
        }
        Op::Cast | Op::CheckType => {
            let tag = chunk.code.get(offset + 1).copied().unwrap_or(0xFF);
            let name = TypeTag::from_u8(tag).map(TypeTag::name).unwrap_or("<bad type>");
            let _ = writeln!(out, "{:<16} {:4} ; {}", op.name(), tag, name);
        }
        Op::Array | Op::Object | Op::StringInterp => {
            let count = chunk.read_u16(offset + 1).unwrap_or(0);
            let _ = writeln!(out, "{:<16} {:4}", op.name(), count);
        }
        Op::Jump | Op::JumpIfFalse | Op::JumpIfFalsePop | Op::JumpIfTrue | Op::ForInNext => {
            let jump = chunk.read_u16(offset + 1).unwrap_or(0) as usize;
            let _ = writeln!(out, "{:<16} {:4} -> {}", op.name(), jump, offset + 3 + jump);
        }
        Op::Loop => {
            let jump = chunk.read_u16(offset + 1).unwrap_or(0) as usize;
            let target = (offset + 3).saturating_sub(jump);
            let _ = writeln!(out, "{:<16} {:4} -> {}", op.name(), jump, target);
        }
        Op::Try => {
            let catch = chunk.read_u16(offset + 1).unwrap_or(0);
            let finally = chunk.read_u16(offset + 3).unwrap_or(0);
            let base = offset + 5;
            if catch == NO_CATCH {
                let _ = writeln!(
                    out,
                    "{:<16} no-catch finally -> {}",
                    op.name(),
                    base + finally as usize
                );
            } else {
                let _ = writeln!(
                    out,
                    "{:<16} catch -> {} finally -> {}",
                    op.name(),
                    base + catch as usize,
                    base + finally as usize
                );
            }
        }
        Op::Closure => {
            let idx = chunk.read_u16(offset + 1).unwrap_or(0);
            let upvals = chunk.code.get(offset + 3).copied().unwrap_or(0) as usize;
            let _ = writeln!(
                out,
                "{:<16} {:4} ; {} ({} upvalues)",
                op.name(),
                idx,
                constant_brief(chunk, idx),
                upvals
            );
            let mut tail = offset + 4;
            for _ in 0..upvals {
                let is_local = chunk.code.get(tail).copied().unwrap_or(0) != 0;
                let index = chunk.code.get(tail + 1).copied().unwrap_or(0);
                let _ = writeln!(
                    out,
                    "{:04}    |   {} {}",
                    tail,
                    if is_local { "local" } else { "upvalue" },
                    index
                );
                tail += 2;
            }
            next = tail;
        }
        Op::Switch => {
            let count = chunk.read_u16(offset + 1).unwrap_or(0) as usize;
            let _ = writeln!(out, "{:<16} {:4}", op.name(), count);
            let mut tail = offset + 3;
            let after_table = offset + 3 + count * 2;
            for case in 0..count {
                let jump = chunk.read_u16(tail).unwrap_or(0) as usize;
                let _ = writeln!(out, "{:04}    |   case {} -> {}", tail, case, after_table + jump);
                tail += 2;
            }
            next = tail;
        }
        Op::CallMethod => {
            let idx = chunk.read_u16(offset + 1).unwrap_or(0);
            let argc = chunk.code.get(offset + 3).copied().unwrap_or(0);
            let _ = writeln!(
                out,
                "{:<16} {:4} {:2} ; {}",
                op.name(),
                idx,
                argc,
                constant_brief(chunk, idx)
            );
        }
        Op::CallBuiltin => {
            let id = chunk.read_u16(offset + 1).unwrap_or(0);
            let argc = chunk.code.get(offset + 3).copied().unwrap_or(0);
            let _ = writeln!(out, "{:<16} {:4} {:2}", op.name(), id, argc);
        }
        _ => {
            let _ = writeln!(out, "{}", op.name());
        }
    }
    next
}
