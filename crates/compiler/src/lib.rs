//! Lox compiler: source text to bytecode in one pass
//!
//! Key design principles:
//! - The scanner never allocates; tokens borrow lexemes from the source
//! - There is no AST: the Pratt parser emits bytecode as it consumes tokens
//! - Compiled functions live on the shared heap from the start, so the
//!   collector can run mid-compile with the compiler chain as roots

pub mod compiler;
pub mod scanner;

pub use compiler::{CompileError, compile};
pub use scanner::{Scanner, Token, TokenKind};
