//! Value - the tagged sum the language talks about
//!
//! Primitives (null, booleans, the integer ladder, floats, runes) are stored
//! inline; every other kind holds an `Arc` to a heap cell. The atomic strong
//! count of the `Arc` *is* the reference count the lifetime discipline
//! describes: a function returning a `Value` transfers one strong reference,
//! containers hold one strong reference per slot, dropping the last clone
//! frees the cell and recursively releases contained values.
//!
//! Cycles are not collected; the language avoids structural cycles by
//! convention (tasks drop their function reference on completion, which
//! breaks the closure→environment→closure loop).

use crate::alderstring::AlderString;
use crate::array::ArrayCell;
use crate::buffer::BufferCell;
use crate::channel::ChannelCell;
use crate::chunk::Chunk;
use crate::env::EnvCell;
use crate::ffitype::FfiType;
use crate::object::ObjectCell;
use crate::task::TaskCell;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Canonical type tags, used by `CAST`/`CHECK_TYPE` operands, parameter and
/// return annotations, and the wire format. Stable `u8` values; `0xFF` on
/// the wire means "no annotation".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Bool = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    U8 = 6,
    U16 = 7,
    U32 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    Rune = 12,
    Str = 13,
    Array = 14,
    Object = 15,
    Function = 16,
    Buffer = 17,
    File = 18,
    Task = 19,
    Channel = 20,
    Socket = 21,
    NativeFn = 22,
    NativePtr = 23,
    Any = 24,
}

impl TypeTag {
    pub fn from_u8(byte: u8) -> Option<TypeTag> {
        use TypeTag::*;
        Some(match byte {
            0 => Null,
            1 => Bool,
            2 => I8,
            3 => I16,
            4 => I32,
            5 => I64,
            6 => U8,
            7 => U16,
            8 => U32,
            9 => U64,
            10 => F32,
            11 => F64,
            12 => Rune,
            13 => Str,
            14 => Array,
            15 => Object,
            16 => Function,
            17 => Buffer,
            18 => File,
            19 => Task,
            20 => Channel,
            21 => Socket,
            22 => NativeFn,
            23 => NativePtr,
            24 => Any,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use TypeTag::*;
        match self {
            Null => "null",
            Bool => "bool",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            U8 => "u8",
            U16 => "u16",
            U32 => "u32",
            U64 => "u64",
            F32 => "f32",
            F64 => "f64",
            Rune => "rune",
            Str => "string",
            Array => "array",
            Object => "object",
            Function => "function",
            Buffer => "buffer",
            File => "file",
            Task => "task",
            Channel => "channel",
            Socket => "socket",
            NativeFn => "nativefn",
            NativePtr => "ptr",
            Any => "any",
        }
    }
}

/// Immutable per-function metadata shared by every binding of the function.
///
/// Bound methods clone the `Arc` around this block instead of copying the
/// parameter arrays, so binding can never double-release a name array.
#[derive(Debug)]
pub struct FunctionMeta {
    pub name: String,
    pub chunk: Arc<Chunk>,
    pub params: Vec<String>,
    /// Optional per-parameter coercion targets, parallel to `params`.
    pub param_types: Vec<Option<TypeTag>>,
    /// Default-value chunks for trailing optional parameters, parallel to
    /// `params` (`None` = required).
    pub defaults: Vec<Option<Arc<Chunk>>>,
    pub rest_param: Option<String>,
    pub return_type: Option<TypeTag>,
}

impl FunctionMeta {
    /// Metadata for a plain function with no annotations.
    pub fn plain(name: impl Into<String>, chunk: Arc<Chunk>, params: Vec<String>) -> Self {
        let count = params.len();
        Self {
            name: name.into(),
            chunk,
            params,
            param_types: vec![None; count],
            defaults: vec![None; count],
            rest_param: None,
            return_type: None,
        }
    }
}

/// One captured variable. While the declaring frame is live the upvalue is
/// *open* and names a value-stack slot; when the frame exits it is *closed*
/// and owns the value.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueCell {
    state: Mutex<Upvalue>,
}

impl UpvalueCell {
    pub fn open(slot: usize) -> Arc<UpvalueCell> {
        Arc::new(UpvalueCell {
            state: Mutex::new(Upvalue::Open(slot)),
        })
    }

    pub fn closed(value: Value) -> Arc<UpvalueCell> {
        Arc::new(UpvalueCell {
            state: Mutex::new(Upvalue::Closed(value)),
        })
    }

    /// The stack slot this upvalue points at, or `None` once closed.
    pub fn open_slot(&self) -> Option<usize> {
        match *self.state.lock().expect("upvalue poisoned") {
            Upvalue::Open(slot) => Some(slot),
            Upvalue::Closed(_) => None,
        }
    }

    /// Capture the current value and detach from the stack. Idempotent:
    /// closing a closed upvalue leaves it untouched.
    pub fn close(&self, value: Value) {
        let mut state = self.state.lock().expect("upvalue poisoned");
        if matches!(*state, Upvalue::Open(_)) {
            *state = Upvalue::Closed(value);
        }
    }

    /// Read through the indirection once closed.
    ///
    /// Open upvalues are resolved by the VM against its value stack; calling
    /// this on an open upvalue is a dispatch bug.
    pub fn closed_value(&self) -> Value {
        match &*self.state.lock().expect("upvalue poisoned") {
            Upvalue::Closed(v) => v.clone(),
            Upvalue::Open(slot) => {
                panic!("closed_value called on open upvalue (slot {slot})")
            }
        }
    }

    pub fn set_closed_value(&self, value: Value) {
        let mut state = self.state.lock().expect("upvalue poisoned");
        match &mut *state {
            Upvalue::Closed(v) => *v = value,
            Upvalue::Open(slot) => {
                panic!("set_closed_value called on open upvalue (slot {slot})")
            }
        }
    }
}

/// A closure: shared metadata plus this instance's captures and binding.
#[derive(Debug)]
pub struct FunctionCell {
    pub meta: Arc<FunctionMeta>,
    pub upvalues: Vec<Arc<UpvalueCell>>,
    /// Captured lexical environment, used by the tree-walking backend.
    pub env: Option<Arc<EnvCell>>,
    /// Receiver bound by method fetch; occupies frame slot 0 when calling.
    pub bound_self: Option<Value>,
}

impl FunctionCell {
    pub fn new(meta: Arc<FunctionMeta>, upvalues: Vec<Arc<UpvalueCell>>) -> Self {
        Self {
            meta,
            upvalues,
            env: None,
            bound_self: None,
        }
    }

    /// Bind a receiver, sharing metadata and captures with the original.
    pub fn bind(&self, receiver: Value) -> FunctionCell {
        FunctionCell {
            meta: Arc::clone(&self.meta),
            upvalues: self.upvalues.clone(),
            env: self.env.clone(),
            bound_self: Some(receiver),
        }
    }
}

/// An open file handle. Closing drops the inner `File`; further operations
/// observe `None` and raise.
#[derive(Debug)]
pub struct FileCell {
    pub path: String,
    pub file: Mutex<Option<std::fs::File>>,
}

/// A connected socket handle (stream ownership mirrors `FileCell`).
#[derive(Debug)]
pub struct SocketCell {
    pub peer: String,
    pub stream: Mutex<Option<std::net::TcpStream>>,
}

/// A resolved native function: symbol, entry point and declared signature.
/// The code pointer is carried as `usize` so the handle is `Send + Sync`;
/// the FFI engine is the only consumer that reinterprets it.
#[derive(Debug)]
pub struct NativeFnCell {
    pub name: String,
    pub code_ptr: usize,
    pub param_types: Vec<FfiType>,
    pub return_type: FfiType,
}

/// The value representation. See the module docs for the lifetime contract.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Unicode scalar value.
    Rune(char),
    Str(AlderString),
    Array(Arc<ArrayCell>),
    Object(Arc<ObjectCell>),
    Function(Arc<FunctionCell>),
    /// Opaque native pointer produced/consumed by the FFI engine.
    NativePtr(usize),
    Buffer(Arc<BufferCell>),
    File(Arc<FileCell>),
    Task(Arc<TaskCell>),
    Channel(Arc<ChannelCell>),
    Socket(Arc<SocketCell>),
    NativeFn(Arc<NativeFnCell>),
}

impl Value {
    pub fn string(text: impl Into<String>) -> Value {
        Value::Str(AlderString::from_string(text.into()))
    }

    pub fn array(elems: Vec<Value>) -> Value {
        Value::Array(Arc::new(ArrayCell::with_elems(elems, None)))
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::I8(_) => TypeTag::I8,
            Value::I16(_) => TypeTag::I16,
            Value::I32(_) => TypeTag::I32,
            Value::I64(_) => TypeTag::I64,
            Value::U8(_) => TypeTag::U8,
            Value::U16(_) => TypeTag::U16,
            Value::U32(_) => TypeTag::U32,
            Value::U64(_) => TypeTag::U64,
            Value::F32(_) => TypeTag::F32,
            Value::F64(_) => TypeTag::F64,
            Value::Rune(_) => TypeTag::Rune,
            Value::Str(_) => TypeTag::Str,
            Value::Array(_) => TypeTag::Array,
            Value::Object(_) => TypeTag::Object,
            Value::Function(_) => TypeTag::Function,
            Value::NativePtr(_) => TypeTag::NativePtr,
            Value::Buffer(_) => TypeTag::Buffer,
            Value::File(_) => TypeTag::File,
            Value::Task(_) => TypeTag::Task,
            Value::Channel(_) => TypeTag::Channel,
            Value::Socket(_) => TypeTag::Socket,
            Value::NativeFn(_) => TypeTag::NativeFn,
        }
    }

    /// Canonical type name, as pushed by `TYPEOF`.
    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }

    /// Truthiness: `null`, `false`, numeric zero and empty
    /// string/array/object are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::I8(v) => *v != 0,
            Value::I16(v) => *v != 0,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::U8(v) => *v != 0,
            Value::U16(v) => *v != 0,
            Value::U32(v) => *v != 0,
            Value::U64(v) => *v != 0,
            Value::F32(v) => *v != 0.0,
            Value::F64(v) => *v != 0.0,
            Value::Rune(c) => *c != '\0',
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::I8(_)
                | Value::I16(_)
                | Value::I32(_)
                | Value::I64(_)
                | Value::U8(_)
                | Value::U16(_)
                | Value::U32(_)
                | Value::U64(_)
                | Value::F32(_)
                | Value::F64(_)
        )
    }

    /// Address of the heap cell for identity comparison and cycle
    /// detection; `None` for inline primitives.
    pub fn heap_addr(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.cell_addr()),
            Value::Array(a) => Some(Arc::as_ptr(a) as usize),
            Value::Object(o) => Some(Arc::as_ptr(o) as usize),
            Value::Function(f) => Some(Arc::as_ptr(f) as usize),
            Value::Buffer(b) => Some(Arc::as_ptr(b) as usize),
            Value::File(f) => Some(Arc::as_ptr(f) as usize),
            Value::Task(t) => Some(Arc::as_ptr(t) as usize),
            Value::Channel(c) => Some(Arc::as_ptr(c) as usize),
            Value::Socket(s) => Some(Arc::as_ptr(s) as usize),
            Value::NativeFn(n) => Some(Arc::as_ptr(n) as usize),
            _ => None,
        }
    }
}

/// Language equality: deep for primitives (numerics compare across widths),
/// content for strings, identity for every other heap kind.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    use Value::*;
    match (a, b) {
        (Null, Null) => true,
        (Bool(x), Bool(y)) => x == y,
        (Rune(x), Rune(y)) => x == y,
        (Str(x), Str(y)) => x == y,
        (Array(x), Array(y)) => Arc::ptr_eq(x, y),
        (Object(x), Object(y)) => Arc::ptr_eq(x, y),
        (Function(x), Function(y)) => Arc::ptr_eq(x, y),
        (Buffer(x), Buffer(y)) => Arc::ptr_eq(x, y),
        (File(x), File(y)) => Arc::ptr_eq(x, y),
        (Task(x), Task(y)) => Arc::ptr_eq(x, y),
        (Channel(x), Channel(y)) => Arc::ptr_eq(x, y),
        (Socket(x), Socket(y)) => Arc::ptr_eq(x, y),
        (NativeFn(x), NativeFn(y)) => Arc::ptr_eq(x, y),
        (NativePtr(x), NativePtr(y)) => x == y,
        _ if a.is_numeric() && b.is_numeric() => crate::numeric::numeric_equal(a, b),
        _ => false,
    }
}

// Language equality doubles as the host `PartialEq`, matching how the rest
// of the runtime compares values in assertions.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::display::display_string(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness_table() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::I32(0).is_truthy());
        assert!(!Value::U64(0).is_truthy());
        assert!(!Value::F64(0.0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::array(vec![]).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::I32(-1).is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(Value::array(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn test_equality_is_identity_for_arrays() {
        let a = Value::array(vec![Value::I32(1)]);
        let b = Value::array(vec![Value::I32(1)]);
        assert!(!values_equal(&a, &b));
        assert!(values_equal(&a, &a.clone()));
    }

    #[test]
    fn test_equality_is_content_for_strings() {
        assert!(values_equal(&Value::string("ab"), &Value::string("ab")));
        assert!(!values_equal(&Value::string("ab"), &Value::string("ba")));
    }

    #[test]
    fn test_numeric_equality_crosses_widths() {
        assert!(values_equal(&Value::I32(7), &Value::I64(7)));
        assert!(values_equal(&Value::U8(7), &Value::F64(7.0)));
        assert!(!values_equal(&Value::I32(7), &Value::I64(8)));
    }

    #[test]
    fn test_clone_shares_heap_cell() {
        let a = Value::array(vec![]);
        let b = a.clone();
        match (&a, &b) {
            (Value::Array(x), Value::Array(y)) => {
                assert!(Arc::ptr_eq(x, y));
                assert_eq!(Arc::strong_count(x), 2);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_type_tag_round_trip() {
        for byte in 0..=24u8 {
            let tag = TypeTag::from_u8(byte).unwrap();
            assert_eq!(tag as u8, byte);
        }
        assert!(TypeTag::from_u8(200).is_none());
    }

    #[test]
    fn test_upvalue_close_is_idempotent() {
        let uv = UpvalueCell::open(3);
        assert_eq!(uv.open_slot(), Some(3));
        uv.close(Value::I32(9));
        uv.close(Value::I32(100));
        assert_eq!(uv.open_slot(), None);
        assert!(values_equal(&uv.closed_value(), &Value::I32(9)));
    }

    #[test]
    fn test_bind_shares_metadata() {
        let chunk = Arc::new(crate::chunk::Chunk::new("m"));
        let meta = Arc::new(FunctionMeta::plain("m", chunk, vec!["a".into()]));
        let f = FunctionCell::new(Arc::clone(&meta), vec![]);
        let bound = f.bind(Value::I32(1));
        assert!(Arc::ptr_eq(&f.meta, &bound.meta));
        assert!(bound.bound_self.is_some());
    }
}
