//! Lox core: the shared foundation of the interpreter
//!
//! Key design principles:
//! - `Value`: what Lox programs talk about (nil, booleans, numbers, object refs)
//! - `ObjRef`: a small copyable handle into the object heap; everything with
//!   identity (strings, functions, closures, classes, ...) lives behind one
//! - `Chunk`: a function's compiled bytecode, constant pool, and line map
//! - `Heap`: the object arena plus the precise mark-sweep collector, string
//!   interning, and the global variable table
//!
//! # Modules
//!
//! - `value`: the dynamically typed value cell
//! - `object`: heap object payloads and the FNV-1a string hash
//! - `chunk`: opcodes and compiled bytecode containers
//! - `table`: open-addressed hash table keyed by interned strings
//! - `heap`: arena, allocation accounting, and the tri-color collector

pub mod chunk;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{Heap, ObjRef};
pub use object::{
    BoundMethod, Class, Closure, Function, Instance, LoxString, Native, NativeFn, Object, Upvalue,
    hash_string,
};
pub use table::Table;
pub use value::Value;
