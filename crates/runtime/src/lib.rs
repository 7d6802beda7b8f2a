//! Lox runtime: the stack VM and the embedding surface
//!
//! Key design principles:
//! - One `Vm` value owns everything: heap, stack, frames, globals
//! - `interpret` is the whole embedding API; a REPL is a loop around it
//! - Program output goes through a replaceable sink so tests can capture it
//! - Diagnostics (disassembly, instruction traces, GC events) ride on
//!   `tracing` and never mix into program output

pub mod config;
pub mod debug;
pub mod natives;
pub mod vm;

pub use config::VmOptions;
pub use vm::{InterpretError, Vm};
