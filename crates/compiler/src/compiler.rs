//! Single-pass Pratt compiler
//!
//! Consumes tokens on demand and emits bytecode directly into heap-allocated
//! [`Function`](lox_core::Function) objects; there is no AST. Function bodies
//! nest, so per-function state lives in an explicit stack of compiler records
//! whose in-progress functions double as GC roots, with a parallel stack of
//! class records validating `this` and `super`.
//!
//! Error reporting follows the panic-mode scheme: the first error in a
//! statement is printed, subsequent ones are suppressed until the parser
//! resynchronizes at a statement boundary.

use lox_core::{Heap, ObjRef, OpCode, Value};

use crate::scanner::{Scanner, Token, TokenKind};

/// Local slots are addressed by a `u8`, and slot 0 is reserved for the
/// enclosing function (or `this`), leaving 255 per function.
const LOCALS_MAX: usize = 256;
/// Upvalues have no reserved slot, so the count itself caps at 255.
const UPVALUES_MAX: usize = 255;

/// Compilation failed; diagnostics were already written to stderr.
#[derive(Debug)]
pub struct CompileError;

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compile error")
    }
}

impl std::error::Error for CompileError {}

/// Compiles a whole program into the synthetic top-level script function.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_compiler();
    if compiler.parser.had_error {
        Err(CompileError)
    } else {
        Ok(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    /// The next-higher level; binary operators parse their right operand here
    /// to get left-associativity.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// Lexical depth, or -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueSpec {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The enclosing chain is the `compilers`
/// stack in [`Compiler`]; the in-progress `function` objects along it are the
/// compiler's GC roots.
struct FnCompiler<'src> {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSpec>,
    scope_depth: i32,
    arity: usize,
}

struct ClassCompiler {
    has_superclass: bool,
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

pub struct Compiler<'src, 'h> {
    parser: Parser<'src>,
    heap: &'h mut Heap,
    compilers: Vec<FnCompiler<'src>>,
    classes: Vec<ClassCompiler>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let mut compiler = Compiler {
            parser: Parser {
                scanner: Scanner::new(source),
                current: Token::placeholder(),
                previous: Token::placeholder(),
                had_error: false,
                panic_mode: false,
            },
            heap,
            compilers: Vec::new(),
            classes: Vec::new(),
        };
        compiler.push_fn_compiler(FunctionKind::Script);
        compiler
    }

    // =========================================================================
    // Compiler-record stack
    // =========================================================================

    fn push_fn_compiler(&mut self, kind: FunctionKind) {
        self.maybe_gc();
        let function = self.heap.new_function();
        let mut fc = FnCompiler {
            function,
            kind,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            arity: 0,
        };
        // Slot 0 belongs to the function itself, or to the receiver in a
        // method body where it is addressable as `this`.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        fc.locals.push(Local {
            name: slot_zero,
            depth: 0,
            is_captured: false,
        });
        self.compilers.push(fc);
        // The record is on the chain now, so the function survives the
        // collection the name interning below may trigger.
        if kind != FunctionKind::Script {
            self.maybe_gc();
            let name = self.heap.copy_string(self.parser.previous.lexeme);
            self.heap.function_mut(function).name = Some(name);
        }
    }

    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueSpec>) {
        self.emit_return();
        let fc = match self.compilers.pop() {
            Some(fc) => fc,
            None => unreachable!("compiler stack underflow"),
        };
        let function = self.heap.function_mut(fc.function);
        function.upvalue_count = fc.upvalues.len();
        function.arity = fc.arity as u8;
        (fc.function, fc.upvalues)
    }

    fn current(&self) -> &FnCompiler<'src> {
        let i = self.compilers.len() - 1;
        &self.compilers[i]
    }

    fn current_mut(&mut self) -> &mut FnCompiler<'src> {
        let i = self.compilers.len() - 1;
        &mut self.compilers[i]
    }

    fn current_chunk(&mut self) -> &mut lox_core::Chunk {
        let function = self.current().function;
        &mut self.heap.function_mut(function).chunk
    }

    /// Compile-time GC safepoint: the roots are the functions along the
    /// compiler chain, plus everything the heap roots on its own.
    fn maybe_gc(&mut self) {
        if self.heap.should_collect() {
            let chain: Vec<ObjRef> = self.compilers.iter().map(|fc| fc.function).collect();
            self.heap.collect(&[], &chain);
        }
    }

    // =========================================================================
    // Token plumbing and error reporting
    // =========================================================================

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.parser.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.parser.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {message}");
        self.parser.had_error = true;
    }

    /// Skips forward to a statement boundary, clearing panic mode so later
    /// errors report again.
    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // =========================================================================
    // Bytecode emission
    // =========================================================================

    fn emit_byte(&mut self, byte: impl Into<u8>) {
        let line = self.parser.previous.line;
        self.current_chunk().write(byte.into(), line);
    }

    fn emit_bytes(&mut self, a: impl Into<u8>, b: impl Into<u8>) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_return(&mut self) {
        if self.current().kind == FunctionKind::Initializer {
            // An initializer always returns the receiver.
            self.emit_bytes(OpCode::GetLocal, 0u8);
        } else {
            self.emit_byte(OpCode::Nil);
        }
        self.emit_byte(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let function = self.current().function;
        let index = self.heap.add_constant(function, value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_bytes(OpCode::Constant, index);
    }

    /// Emits a forward jump with a two-byte placeholder operand and returns
    /// the operand's offset for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_byte(op);
        self.emit_byte(0xffu8);
        self.emit_byte(0xffu8);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.current_chunk().code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // =========================================================================
    // Declarations and statements
    // =========================================================================

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_bytes(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name == self.parser.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // `super` lives in a scope of its own so every method closure
            // captures the superclass as an upvalue.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_byte(OpCode::Inherit);
            let i = self.classes.len() - 1;
            self.classes[i].has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop);

        let i = self.classes.len() - 1;
        if self.classes[i].has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.parser.previous.lexeme;
        let constant = self.identifier_constant(name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_bytes(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; mark it usable before the body.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_fn_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_mut().arity += 1;
                if self.current().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the whole frame is discarded on return.
        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_bytes(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop);
    }

    /// `for` desugars to initializer + while-with-increment. Without an
    /// increment clause the intermediate jump fixups are skipped entirely.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_byte(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_byte(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_byte(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return);
        }
    }

    // =========================================================================
    // Scopes and variable resolution
    // =========================================================================

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_mut().scope_depth -= 1;
        loop {
            let fc = self.current();
            let Some(local) = fc.locals.last() else {
                break;
            };
            if local.depth <= fc.scope_depth {
                break;
            }
            let captured = local.is_captured;
            self.current_mut().locals.pop();
            // Captured locals are hoisted into their upvalue instead of
            // being dropped.
            if captured {
                self.emit_byte(OpCode::CloseUpvalue);
            } else {
                self.emit_byte(OpCode::Pop);
            }
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.parser.previous.lexeme)
    }

    fn declare_variable(&mut self) {
        if self.current().scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let fc = self.current();
        let mut duplicate = false;
        for local in fc.locals.iter().rev() {
            if local.depth != -1 && local.depth < fc.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current().locals.len() == LOCALS_MAX {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let fc = self.current_mut();
        if fc.scope_depth == 0 {
            return;
        }
        let depth = fc.scope_depth;
        if let Some(local) = fc.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        self.maybe_gc();
        let s = self.heap.copy_string(name);
        self.make_constant(Value::Obj(s))
    }

    fn resolve_local(&mut self, compiler: usize, name: &str) -> Option<u8> {
        let locals = &self.compilers[compiler].locals;
        let mut found = None;
        for i in (0..locals.len()).rev() {
            if locals[i].name == name {
                found = Some((i, locals[i].depth == -1));
                break;
            }
        }
        match found {
            Some((i, uninitialized)) => {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(i as u8)
            }
            None => None,
        }
    }

    /// Walks outward through enclosing functions. A hit on an enclosing local
    /// flags it captured; hits further out chain through the intermediate
    /// functions' upvalue lists.
    fn resolve_upvalue(&mut self, compiler: usize, name: &str) -> Option<u8> {
        if compiler == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(compiler - 1, name) {
            self.compilers[compiler - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(compiler, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(compiler - 1, name) {
            return self.add_upvalue(compiler, upvalue, false);
        }
        None
    }

    fn add_upvalue(&mut self, compiler: usize, index: u8, is_local: bool) -> Option<u8> {
        let wanted = UpvalueSpec { index, is_local };
        let upvalues = &self.compilers[compiler].upvalues;
        for (i, existing) in upvalues.iter().enumerate() {
            if *existing == wanted {
                return Some(i as u8);
            }
        }
        if upvalues.len() == UPVALUES_MAX {
            self.error("Too many closure variables in function.");
            return Some(0);
        }
        self.compilers[compiler].upvalues.push(wanted);
        Some((self.compilers[compiler].upvalues.len() - 1) as u8)
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let compiler = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(compiler, name) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(compiler, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    // =========================================================================
    // Pratt expression parsing
    // =========================================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.parser.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        // Only the lowest-precedence contexts may contain an assignment.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.parser.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.parser.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'h>>,
            Option<ParseFn<'src, 'h>>,
            Precedence,
        ) = match kind {
            TokenKind::LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            TokenKind::Dot => (None, Some(Self::dot), Precedence::Call),
            TokenKind::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => (None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Star => (None, Some(Self::binary), Precedence::Factor),
            TokenKind::Bang => (Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                (None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => (None, Some(Self::binary), Precedence::Comparison),
            TokenKind::Identifier => (Some(Self::variable), None, Precedence::None),
            TokenKind::String => (Some(Self::string), None, Precedence::None),
            TokenKind::Number => (Some(Self::number), None, Precedence::None),
            TokenKind::And => (None, Some(Self::and), Precedence::And),
            TokenKind::Or => (None, Some(Self::or), Precedence::Or),
            TokenKind::False | TokenKind::Nil | TokenKind::True => {
                (Some(Self::literal), None, Precedence::None)
            }
            TokenKind::Super => (Some(Self::super_), None, Precedence::None),
            TokenKind::This => (Some(Self::this), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.parser.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.parser.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        self.maybe_gc();
        let s = self.heap.copy_string(content);
        self.emit_constant(Value::Obj(s));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_byte(OpCode::False),
            TokenKind::True => self.emit_byte(OpCode::True),
            TokenKind::Nil => self.emit_byte(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous.lexeme, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes[self.classes.len() - 1].has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        // The receiver that becomes `this` in the method is the current
        // instance, slot 0 of the enclosing method frame.
        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_bytes(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_bytes(OpCode::GetSuper, name);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_byte(OpCode::Negate),
            TokenKind::Bang => self.emit_byte(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        let precedence = Self::rule(op).precedence;
        self.parse_precedence(precedence.next());
        match op {
            TokenKind::BangEqual => self.emit_bytes(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_byte(OpCode::Equal),
            TokenKind::Greater => self.emit_byte(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_bytes(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_byte(OpCode::Less),
            TokenKind::LessEqual => self.emit_bytes(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_byte(OpCode::Add),
            TokenKind::Minus => self.emit_byte(OpCode::Subtract),
            TokenKind::Star => self.emit_byte(OpCode::Multiply),
            TokenKind::Slash => self.emit_byte(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_byte(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.parser.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // receiver.name(args) fuses property load and call, skipping the
            // bound-method allocation.
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lox_core::Object;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("source should compile");
        (heap, function)
    }

    fn compile_err(source: &str) {
        let mut heap = Heap::new();
        assert!(compile(source, &mut heap).is_err(), "expected compile error");
    }

    fn op(code: OpCode) -> u8 {
        code.into()
    }

    #[test]
    fn test_arithmetic_precedence_bytecode() {
        let (heap, function) = compile_ok("print 1 + 2 * 3;");
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                0,
                op(OpCode::Constant),
                1,
                op(OpCode::Constant),
                2,
                op(OpCode::Multiply),
                op(OpCode::Add),
                op(OpCode::Print),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
        assert_eq!(chunk.constants.len(), 3);
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let source = "fun f(a, b) { return a + b; } print f(1, 2);";
        let (heap_a, fa) = compile_ok(source);
        let (heap_b, fb) = compile_ok(source);
        let ca = &heap_a.function(fa).chunk;
        let cb = &heap_b.function(fb).chunk;
        assert_eq!(ca.code, cb.code);
        assert_eq!(ca.lines, cb.lines);
        assert_eq!(ca.constants.len(), cb.constants.len());
    }

    #[test]
    fn test_locals_resolve_to_slots() {
        let (heap, function) = compile_ok("{ var a = 1; a; }");
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                0,
                op(OpCode::GetLocal),
                1,
                op(OpCode::Pop),
                op(OpCode::Pop),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
    }

    #[test]
    fn test_globals_go_through_the_constant_pool() {
        let (heap, function) = compile_ok("var answer = 42; print answer;");
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                1,
                op(OpCode::DefineGlobal),
                0,
                op(OpCode::GetGlobal),
                2,
                op(OpCode::Print),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
        // Both name constants intern to the same string object.
        assert_eq!(chunk.constants[0], chunk.constants[2]);
    }

    #[test]
    fn test_jump_operands_are_big_endian() {
        let (heap, function) = compile_ok("if (true) print 1;");
        let chunk = &heap.function(function).chunk;
        let jump_at = chunk
            .code
            .iter()
            .position(|&b| b == op(OpCode::JumpIfFalse))
            .expect("JumpIfFalse emitted");
        let offset =
            u16::from_be_bytes([chunk.code[jump_at + 1], chunk.code[jump_at + 2]]) as usize;
        // The patched offset lands inside the chunk.
        assert!(jump_at + 3 + offset <= chunk.code.len());
    }

    #[test]
    fn test_closure_upvalue_encoding() {
        let (heap, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let script = &heap.function(function).chunk;
        let outer = script
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    Object::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let outer_fn = heap.function(outer);
        let inner = outer_fn
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    Object::Function(f) => (f.upvalue_count == 1).then_some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(heap.function(inner).upvalue_count, 1);
        // CLOSURE tail for inner: is_local = 1, index = 1 (x in slot 1).
        let closure_at = outer_fn
            .chunk
            .code
            .iter()
            .position(|&b| b == op(OpCode::Closure))
            .expect("Closure emitted");
        assert_eq!(outer_fn.chunk.code[closure_at + 2], 1);
        assert_eq!(outer_fn.chunk.code[closure_at + 3], 1);
    }

    #[test]
    fn test_captured_local_closes_at_scope_exit() {
        let (heap, function) =
            compile_ok("{ var x = 1; fun capture() { return x; } }");
        let chunk = &heap.function(function).chunk;
        // Scope exit pops newest-first: `capture` is plain (Pop), `x` is
        // captured (CloseUpvalue).
        let tail: Vec<u8> = chunk.code[chunk.code.len() - 4..].to_vec();
        assert_eq!(
            tail,
            vec![
                op(OpCode::Pop),
                op(OpCode::CloseUpvalue),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
    }

    #[test]
    fn test_initializer_returns_slot_zero() {
        let (heap, function) = compile_ok("class A { init() {} }");
        let script = &heap.function(function).chunk;
        let init = script
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    Object::Function(f) => f.name.map(|_| *r),
                    _ => None,
                },
                _ => None,
            })
            .expect("init method constant");
        let chunk = &heap.function(init).chunk;
        assert_eq!(
            chunk.code,
            vec![op(OpCode::GetLocal), 0, op(OpCode::Return)]
        );
    }

    #[test]
    fn test_error_return_at_top_level() {
        compile_err("return 1;");
    }

    #[test]
    fn test_error_return_value_from_initializer() {
        compile_err("class A { init() { return 1; } }");
        // A bare return is fine.
        compile_ok("class A { init() { return; } }");
    }

    #[test]
    fn test_error_self_inheritance() {
        compile_err("class X < X {}");
    }

    #[test]
    fn test_error_this_and_super_outside_class() {
        compile_err("print this;");
        compile_err("print super.x;");
        compile_err("class A { f() { return super.f(); } }");
    }

    #[test]
    fn test_error_invalid_assignment_target() {
        compile_err("1 = 2;");
        compile_err("a + b = c;");
    }

    #[test]
    fn test_error_own_initializer_read() {
        compile_err("{ var a = a; }");
    }

    #[test]
    fn test_error_duplicate_local() {
        compile_err("{ var a = 1; var a = 2; }");
        // Shadowing in a nested scope is allowed.
        compile_ok("{ var a = 1; { var a = 2; } }");
    }

    #[test]
    fn test_local_slot_limit() {
        let mut ok = String::from("{");
        for i in 0..255 {
            ok.push_str(&format!("var v{i} = 0;"));
        }
        ok.push('}');
        compile_ok(&ok);

        let mut too_many = String::from("{");
        for i in 0..256 {
            too_many.push_str(&format!("var v{i} = 0;"));
        }
        too_many.push('}');
        compile_err(&too_many);
    }

    #[test]
    fn test_upvalue_limit() {
        // 255 captured outer locals compile.
        let mut ok = String::from("fun outer() {");
        for i in 0..255 {
            ok.push_str(&format!("var v{i};"));
        }
        ok.push_str("fun inner() {");
        for i in 0..255 {
            ok.push_str(&format!("v{i};"));
        }
        ok.push_str("} }");
        let (heap, function) = compile_ok(&ok);
        let outer = heap
            .function(function)
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    Object::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let inner = heap
            .function(outer)
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    Object::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(heap.function(inner).upvalue_count, 255);

        // A 256th capture, routed through the enclosing function, errors.
        let mut too_many = String::from("fun grand() { var extra; fun outer() {");
        for i in 0..255 {
            too_many.push_str(&format!("var v{i};"));
        }
        too_many.push_str("fun inner() {");
        for i in 0..255 {
            too_many.push_str(&format!("v{i};"));
        }
        too_many.push_str("extra;} } }");
        compile_err(&too_many);
    }

    #[test]
    fn test_constant_pool_limit() {
        // Identifier constants all intern to distinct strings.
        let ok: String = (0..256).map(|i| format!("var g{i};")).collect();
        compile_ok(&ok);
        let too_many: String = (0..300).map(|i| format!("var g{i};")).collect();
        compile_err(&too_many);
    }

    #[test]
    fn test_empty_for_clauses() {
        let (heap, function) = compile_ok("fun spin() { for (;;) { if (true) return; } }");
        // `for(;;)` is a valid infinite loop: no condition jump, just the
        // backward Loop.
        let script = &heap.function(function).chunk;
        let spin = script
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    Object::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("spin function constant");
        assert!(heap.function(spin).chunk.code.contains(&op(OpCode::Loop)));
    }
}
