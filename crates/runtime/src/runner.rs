//! Driver-facing entry points
//!
//! The hosting CLI compiles source to a chunk elsewhere and hands it to
//! `run_chunk` / `run_chunk_to_exit`. Exit-code contract: 0 on normal
//! termination, 1 on an uncaught exception (the trace goes to stderr
//! prefixed by `Uncaught exception:`).

use crate::diagnostics;
use crate::error::VmError;
use crate::globals::Globals;
use crate::services::Services;
use crate::vm::{OutputSink, Vm, VmConfig};
use alder_core::{Chunk, Value};
use std::sync::Arc;

/// Run a compiled top-level chunk with fresh globals and services.
pub fn run_chunk(chunk: Arc<Chunk>) -> Result<Value, VmError> {
    diagnostics::install_signal_handler();
    let services = Services::init();
    let mut vm = Vm::with_parts(
        Globals::new(),
        Arc::clone(&services),
        OutputSink::stdout(),
        VmConfig::from_env(),
    );
    let result = vm.run_chunk(chunk);
    services.shutdown();
    result
}

/// Run a chunk and map the outcome onto the process exit-code contract,
/// printing uncaught exceptions and fatal errors to stderr.
pub fn run_chunk_to_exit(chunk: Arc<Chunk>) -> i32 {
    match run_chunk(chunk) {
        Ok(_) => 0,
        Err(err) => {
            eprint!("{}", err);
            err.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alder_core::opcode::Op;

    #[test]
    fn test_exit_zero_on_normal_return() {
        let mut chunk = Chunk::new("<script>");
        chunk.write_op(Op::Null, 1);
        chunk.write_op(Op::Return, 1);
        assert_eq!(run_chunk_to_exit(Arc::new(chunk)), 0);
    }

    #[test]
    fn test_exit_one_on_uncaught_exception() {
        let mut chunk = Chunk::new("<script>");
        let idx = chunk.add_string("boom").unwrap();
        chunk.write_op(Op::Const, 1);
        chunk.write_u16(idx, 1);
        chunk.write_op(Op::Throw, 1);
        assert_eq!(run_chunk_to_exit(Arc::new(chunk)), 1);
    }

    #[test]
    fn test_run_chunk_returns_value() {
        let mut chunk = Chunk::new("<script>");
        let idx = chunk.add_constant(alder_core::Constant::I64(41)).unwrap();
        chunk.write_op(Op::Const, 1);
        chunk.write_u16(idx, 1);
        chunk.write_op(Op::ConstByte, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(Op::Add, 1);
        chunk.write_op(Op::Return, 1);
        let result = run_chunk(Arc::new(chunk)).unwrap();
        assert!(alder_core::values_equal(&result, &Value::I64(42)));
    }
}
