//! Alder runtime: VM, scheduler, FFI
//!
//! Key design principles:
//! - The VM executes chunks from `alder-core` against a value stack and a
//!   shared globals table; exception unwinding is a data-driven state
//!   machine, never host panics.
//! - Spawned tasks are OS-thread-executed work items on a work-stealing
//!   pool; blocking primitives (join, send, recv, select) occupy a worker,
//!   and the pool is sized past the CPU count to absorb that.
//! - Process-wide registries live in an explicit `Services` bundle with an
//!   `init`/`shutdown` lifecycle; every VM holds a handle.

pub mod builtins;
pub mod deque;
pub mod diagnostics;
pub mod error;
pub mod ffi;
pub mod globals;
pub mod runner;
pub mod scheduler;
pub mod services;
pub mod vm;

pub use error::{Exception, FatalError, FatalKind, TraceFrame, VmError};
pub use ffi::FfiError;
pub use ffi::load::Library;
pub use globals::{Globals, GlobalsError};
pub use runner::{run_chunk, run_chunk_to_exit};
pub use scheduler::{Pool, WorkItem};
pub use services::{RegistryError, Services};
pub use vm::{OutputSink, Vm, VmConfig, function_for_chunk};

// The core value model is part of this crate's public surface.
pub use alder_core as core;
