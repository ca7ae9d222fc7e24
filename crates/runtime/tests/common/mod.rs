//! Hand-assembly helpers shared by the integration suites.
//!
//! The compiler is an external collaborator, so these tests assemble
//! chunks directly through the `Chunk` write API.

use alder_core::chunk::Constant;
use alder_core::opcode::Op;
use alder_core::{Chunk, Value};
use alder_runtime::vm::{OutputSink, Vm, VmConfig};
use alder_runtime::{Globals, Services, VmError};
use std::sync::{Arc, Mutex};

pub struct Asm {
    pub chunk: Chunk,
    pub line: u32,
}

#[allow(dead_code)]
impl Asm {
    pub fn new(name: &str) -> Asm {
        Asm {
            chunk: Chunk::new(name),
            line: 1,
        }
    }

    pub fn line(&mut self, line: u32) -> &mut Asm {
        self.line = line;
        self
    }

    pub fn op(&mut self, op: Op) -> &mut Asm {
        self.chunk.write_op(op, self.line);
        self
    }

    pub fn byte(&mut self, byte: u8) -> &mut Asm {
        self.chunk.write_byte(byte, self.line);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Asm {
        self.chunk.write_u16(value, self.line);
        self
    }

    pub fn i64(&mut self, value: i64) -> u16 {
        self.chunk.add_constant(Constant::I64(value)).unwrap()
    }

    pub fn f64(&mut self, value: f64) -> u16 {
        self.chunk.add_constant(Constant::F64(value)).unwrap()
    }

    pub fn string(&mut self, text: &str) -> u16 {
        self.chunk.add_string(text).unwrap()
    }

    pub fn ident(&mut self, name: &str) -> u16 {
        self.chunk.add_ident(name).unwrap()
    }

    pub fn func(&mut self, chunk: Chunk) -> u16 {
        self.chunk
            .add_constant(Constant::Func(Arc::new(chunk)))
            .unwrap()
    }

    /// `CONST idx16` for an i64 constant.
    pub fn push_i64(&mut self, value: i64) -> &mut Asm {
        let idx = self.i64(value);
        self.op(Op::Const).u16(idx)
    }

    /// `CONST idx16` for a string constant.
    pub fn push_str(&mut self, text: &str) -> &mut Asm {
        let idx = self.string(text);
        self.op(Op::Const).u16(idx)
    }

    /// `CONST_BYTE b` (an i32 literal in 0..=255).
    pub fn small(&mut self, value: u8) -> &mut Asm {
        self.op(Op::ConstByte).byte(value)
    }

    /// `GET_GLOBAL name`.
    pub fn get_global(&mut self, name: &str) -> &mut Asm {
        let idx = self.ident(name);
        self.op(Op::GetGlobal).u16(idx)
    }

    /// `DEFINE_GLOBAL name` (pops the initializer).
    pub fn define_global(&mut self, name: &str) -> &mut Asm {
        let idx = self.ident(name);
        self.op(Op::DefineGlobal).u16(idx)
    }

    /// `SET_GLOBAL name` (peeks).
    pub fn set_global(&mut self, name: &str) -> &mut Asm {
        let idx = self.ident(name);
        self.op(Op::SetGlobal).u16(idx)
    }

    /// `CLOSURE idx 0` with no captures.
    pub fn closure0(&mut self, idx: u16) -> &mut Asm {
        self.op(Op::Closure).u16(idx).byte(0)
    }

    /// `NULL; RETURN` tail.
    pub fn ret_null(&mut self) -> &mut Asm {
        self.op(Op::Null).op(Op::Return)
    }

    pub fn emit_jump(&mut self, op: Op) -> usize {
        self.chunk.emit_jump(op, self.line)
    }

    pub fn patch(&mut self, site: usize) {
        self.chunk.patch_jump(site).unwrap();
    }

    pub fn here(&self) -> usize {
        self.chunk.code.len()
    }

    /// Emit `TRY` with placeholder offsets; returns (catch site, finally
    /// site, base ip). Offsets are relative to the ip after both operands.
    pub fn begin_try(&mut self) -> (usize, usize, usize) {
        self.op(Op::Try);
        let catch_site = self.here();
        self.u16(0xFFFF);
        let finally_site = self.here();
        self.u16(0xFFFF);
        (catch_site, finally_site, self.here())
    }

    /// Point a `TRY` operand at the current position.
    pub fn set_try_offset(&mut self, site: usize, base: usize) {
        let offset = (self.here() - base) as u16;
        self.chunk.code[site] = (offset & 0xFF) as u8;
        self.chunk.code[site + 1] = (offset >> 8) as u8;
    }

    pub fn finish(self) -> Chunk {
        self.chunk
    }
}

/// Route `tracing` output through the env filter once per test binary, so
/// `RUST_LOG=debug cargo test` shows scheduler/FFI events.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A VM with captured output plus the buffer to read it back.
#[allow(dead_code)]
pub fn capture_vm() -> (Vm, Arc<Mutex<String>>) {
    init_tracing();
    let (sink, buffer) = OutputSink::capture();
    let vm = Vm::with_parts(
        Globals::new(),
        Services::init(),
        sink,
        VmConfig::default(),
    );
    (vm, buffer)
}

/// Run a top-level chunk on a capture VM, returning the result and output.
#[allow(dead_code)]
pub fn run_capture(chunk: Chunk) -> (Result<Value, VmError>, String) {
    let (mut vm, buffer) = capture_vm();
    let result = vm.run_chunk(Arc::new(chunk));
    let output = buffer.lock().unwrap().clone();
    (result, output)
}
