//! Alder core: the value model and bytecode containers
//!
//! Key design principles:
//! - Value: a closed tagged sum; primitives inline, heap kinds behind
//!   `Arc` cells whose atomic strong count is the reference count.
//! - Chunk: an immutable compiled unit (bytecode + constant pool + line
//!   table + function metadata) shared by reference between frames.
//! - No OS-facing services here; the scheduler, the FFI engine and the VM
//!   live in `alder-runtime`.

pub mod alderstring;
pub mod array;
pub mod buffer;
pub mod channel;
pub mod chunk;
pub mod convert;
pub mod disasm;
pub mod display;
pub mod env;
pub mod ffitype;
pub mod numeric;
pub mod object;
pub mod opcode;
pub mod task;
pub mod value;
pub mod wire;

// Re-export the types nearly every consumer touches.
pub use alderstring::AlderString;
pub use array::{ArrayCell, ArrayError};
pub use buffer::BufferCell;
pub use channel::{ChannelCell, ChannelError};
pub use chunk::{Chunk, ChunkError, Constant, LineRun, UpvalueDesc, fnv1a};
pub use convert::{CastError, cast, check_type};
pub use display::{CoerceError, concat, display_string};
pub use env::{EnvCell, EnvError};
pub use ffitype::FfiType;
pub use numeric::NumericError;
pub use object::ObjectCell;
pub use opcode::{MAX_OPCODE, NO_CATCH, Op};
pub use task::{TaskCell, TaskOutcome};
pub use value::{
    FileCell, FunctionCell, FunctionMeta, NativeFnCell, SocketCell, TypeTag, Upvalue,
    UpvalueCell, Value, values_equal,
};
pub use wire::{WireError, deserialize, serialize};
