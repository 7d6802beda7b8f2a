//! The stack virtual machine
//!
//! One instruction decode per loop iteration over a fixed-depth frame stack.
//! Every callable the VM runs is a closure; calls push a frame whose base
//! points at the callee's slot, so locals are plain offsets from the base.
//! Open upvalues live in a list sorted by descending stack slot, spliced by
//! `capture_upvalue` and drained from the front by `close_upvalues`.
//!
//! Runtime errors print a message and a stack trace (newest frame first),
//! reset the transient VM state, and surface as
//! [`InterpretError::Runtime`]; globals and interned strings survive, so a
//! REPL session keeps its definitions after an error.

use std::io::Write;

use tracing::trace;

use lox_core::{Heap, NativeFn, ObjRef, Object, OpCode, Upvalue, Value};

use crate::config::VmOptions;
use crate::debug;
use crate::natives;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug)]
pub enum InterpretError {
    /// Diagnostics already went to stderr during compilation.
    Compile,
    /// The formatted runtime error message; the stack trace went to stderr.
    Runtime(String),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile => write!(f, "compile error"),
            InterpretError::Runtime(message) => write!(f, "runtime error: {message}"),
        }
    }
}

impl std::error::Error for InterpretError {}

/// Bookkeeping for one active call: the running closure, its function (cached
/// to skip a hop per instruction fetch), the instruction pointer, and the
/// stack slot where the callee sits (slot 0 of the frame).
#[derive(Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    function: ObjRef,
    ip: usize,
    base: usize,
}

pub struct Vm {
    heap: Heap,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    /// Open upvalues sorted by descending stack slot, no duplicates.
    open_upvalues: Vec<ObjRef>,
    options: VmOptions,
    output: Box<dyn Write>,
}

/// Numeric binary operator: peeks both operands for type checking, so they
/// stay reachable if an error unwinds, then pops and applies.
macro_rules! binary_op {
    ($vm:expr, $wrap:expr, $op:tt) => {{
        match ($vm.peek(1), $vm.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                $vm.pop();
                $vm.pop();
                $vm.push($wrap(a $op b));
            }
            _ => return Err($vm.runtime_error("Operands must be numbers.".to_string())),
        }
    }};
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.stress = options.stress_gc;
        let mut vm = Vm {
            heap,
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            open_upvalues: Vec::new(),
            options,
            output: Box::new(std::io::stdout()),
        };
        vm.define_native("clock", natives::clock);
        vm
    }

    /// Redirects program output (`print`), e.g. into a buffer under test.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Compiles and runs one source unit. Globals and interned strings
    /// accumulate across calls on the same VM.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            lox_compiler::compile(source, &mut self.heap).map_err(|_| InterpretError::Compile)?;

        if self.options.dump_bytecode {
            let mut err = std::io::stderr();
            let _ = debug::disassemble_program(&self.heap, function, &mut err);
        }

        self.push(Value::Obj(function));
        self.maybe_gc();
        let closure = self.heap.new_closure(function);
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            if self.options.trace_execution {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => unreachable!("corrupt bytecode"),
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    // Assignment is an expression; the value stays on top.
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    match self.heap.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let text = self.heap.string_text(name).to_string();
                            return Err(
                                self.runtime_error(format!("Undefined variable '{text}'."))
                            );
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    if self.heap.globals.set(name, hash, value) {
                        // Assignment must not create; undo and report.
                        self.heap.globals.delete(name, hash);
                        let text = self.heap.string_text(name).to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{text}'.")));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => self.stack[*stack_slot],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    let Some(instance) = self.heap.as_instance(self.peek(0)) else {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    };
                    let hash = self.heap.str_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    let Some(instance) = self.heap.as_instance(self.peek(1)) else {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    };
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    // Remove the receiver, leave the assigned value.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass is a class"),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => binary_op!(self, Value::Bool, >),
                OpCode::Less => binary_op!(self, Value::Bool, <),
                OpCode::Add => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        (a, b)
                            if self.heap.as_string(a).is_some()
                                && self.heap.as_string(b).is_some() =>
                        {
                            self.concatenate();
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ));
                        }
                    }
                }
                OpCode::Subtract => binary_op!(self, Value::Number, -),
                OpCode::Multiply => binary_op!(self, Value::Number, *),
                OpCode::Divide => binary_op!(self, Value::Number, /),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.".to_string())),
                },
                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.value_to_string(value);
                    let _ = writeln!(self.output, "{text}");
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    self.call_value(self.peek(arg_count as usize), arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass is a class"),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure constant is a function"),
                    };
                    self.maybe_gc();
                    let closure = self.heap.new_closure(function);
                    self.push(Value::Obj(closure));
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().base + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = *self.frame();
                    self.close_upvalues(frame.base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The slot holding the script closure.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string_constant();
                    self.maybe_gc();
                    let class = self.heap.new_class(name);
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let Some(superclass) = self.heap.as_class(self.peek(1)) else {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("subclass is a class"),
                    };
                    // Copy-down inheritance: methods land in the subclass
                    // before its own declarations override them.
                    let methods: Vec<(ObjRef, u32, Value)> =
                        self.heap.class(superclass).methods.iter().collect();
                    for (key, hash, value) in methods {
                        self.heap.class_mut(subclass).methods.set(key, hash, value);
                    }
                    // The superclass stays, bound to the `super` local.
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        _ => unreachable!("method target is a class"),
                    };
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    // =========================================================================
    // Calls and method dispatch
    // =========================================================================

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), InterpretError> {
        enum Callee {
            Bound(Value, ObjRef),
            Class(ObjRef),
            Closure(ObjRef),
            Native(NativeFn),
            NotCallable,
        }
        let kind = match callee {
            Value::Obj(r) => match self.heap.get(r) {
                Object::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
                Object::Class(_) => Callee::Class(r),
                Object::Closure(_) => Callee::Closure(r),
                Object::Native(n) => Callee::Native(n.function),
                _ => Callee::NotCallable,
            },
            _ => Callee::NotCallable,
        };

        let argc = arg_count as usize;
        match kind {
            Callee::Bound(receiver, method) => {
                let top = self.stack.len();
                self.stack[top - argc - 1] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::Class(class) => {
                self.maybe_gc();
                let instance = self.heap.new_instance(class);
                let top = self.stack.len();
                self.stack[top - argc - 1] = Value::Obj(instance);
                let init = self.heap.init_string();
                let hash = self.heap.str_hash(init);
                match self.heap.class(class).methods.get(init, hash) {
                    Some(Value::Obj(initializer)) => self.call_closure(initializer, arg_count),
                    Some(_) => unreachable!("methods are closures"),
                    None if arg_count != 0 => Err(self
                        .runtime_error(format!("Expected 0 arguments but got {arg_count}."))),
                    None => Ok(()),
                }
            }
            Callee::Closure(closure) => self.call_closure(closure, arg_count),
            Callee::Native(function) => {
                let top = self.stack.len();
                let result = function(&self.stack[top - argc..top]);
                self.stack.truncate(top - argc - 1);
                self.push(result);
                Ok(())
            }
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes.".to_string()))
            }
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> Result<(), InterpretError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {arity} arguments but got {arg_count}."))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count as usize - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, arg_count: u8) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count as usize);
        let Some(instance) = self.heap.as_instance(receiver) else {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        };
        // A field shadowing the method name wins, matching GetProperty.
        let hash = self.heap.str_hash(name);
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let top = self.stack.len();
            self.stack[top - arg_count as usize - 1] = field;
            return self.call_value(field, arg_count);
        }
        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: u8,
    ) -> Result<(), InterpretError> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let text = self.heap.string_text(name).to_string();
            return Err(self.runtime_error(format!("Undefined property '{text}'.")));
        };
        let method = match method {
            Value::Obj(r) => r,
            _ => unreachable!("methods are closures"),
        };
        self.call_closure(method, arg_count)
    }

    /// Resolves `name` on `class` and replaces the receiver on top of the
    /// stack with a bound method pairing the two.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), InterpretError> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let text = self.heap.string_text(name).to_string();
            return Err(self.runtime_error(format!("Undefined property '{text}'.")));
        };
        let method = match method {
            Value::Obj(r) => r,
            _ => unreachable!("methods are closures"),
        };
        self.maybe_gc();
        let bound = self.heap.new_bound_method(self.peek(0), method);
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // =========================================================================
    // Upvalues
    // =========================================================================

    /// Returns the open upvalue for `slot`, splicing a new one into the
    /// descending-sorted list if no frame captured that slot yet.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let upvalue = self.open_upvalues[index];
            let open_slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                break;
            }
            index += 1;
        }
        self.maybe_gc();
        let created = self.heap.new_upvalue(Upvalue::Open(slot));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Closes every open upvalue at or above `from`: the sorted list makes
    /// them exactly the prefix.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // =========================================================================
    // Stack, decoding, errors
    // =========================================================================

    fn frame(&self) -> &CallFrame {
        let i = self.frames.len() - 1;
        &self.frames[i]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let i = self.frames.len() - 1;
        &mut self.frames[i]
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame();
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.heap.function(self.frame().function).chunk.constants[index]
    }

    fn read_string_constant(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("constant is not a string"),
        }
    }

    /// `ADD` on two strings. Operands stay on the stack across the
    /// allocation so a collection cannot reclaim them mid-concatenation.
    fn concatenate(&mut self) {
        self.maybe_gc();
        let (a, b) = match (
            self.heap.as_string(self.peek(1)),
            self.heap.as_string(self.peek(0)),
        ) {
            (Some(a), Some(b)) => (a, b),
            _ => unreachable!("concatenate called on non-strings"),
        };
        let mut text = String::with_capacity(
            self.heap.string_text(a).len() + self.heap.string_text(b).len(),
        );
        text.push_str(self.heap.string_text(a));
        text.push_str(self.heap.string_text(b));
        let result = self.heap.take_string(text);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    /// Execution-time GC safepoint: roots are the value stack, the closures
    /// of live frames, and the open upvalues.
    fn maybe_gc(&mut self) {
        if self.heap.should_collect() {
            let mut roots: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
            roots.extend(&self.open_upvalues);
            self.heap.collect(&self.stack, &roots);
        }
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        self.maybe_gc();
        let name = self.heap.copy_string(name);
        self.heap.temp_push(Value::Obj(name));
        let native = self.heap.new_native(function);
        self.heap.temp_push(Value::Obj(native));
        let hash = self.heap.str_hash(name);
        self.heap.globals.set(name, hash, Value::Obj(native));
        self.heap.temp_pop();
        self.heap.temp_pop();
    }

    /// Prints the message and a newest-to-oldest stack trace on stderr, then
    /// resets the transient execution state.
    fn runtime_error(&mut self, message: String) -> InterpretError {
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            match function.name {
                Some(name) => eprintln!("[line {line}] in {}()", self.heap.string_text(name)),
                None => eprintln!("[line {line}] in script"),
            }
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        InterpretError::Runtime(message)
    }

    fn trace_instruction(&self) {
        let mut stack_line = String::from("          ");
        for value in &self.stack {
            stack_line.push_str(&format!("[ {} ]", self.heap.value_to_string(*value)));
        }
        trace!(target: "lox::vm", "{stack_line}");
        let frame = self.frame();
        let chunk = &self.heap.function(frame.function).chunk;
        let mut buf = Vec::new();
        let _ = debug::disassemble_instruction(&self.heap, chunk, frame.ip, &mut buf);
        trace!(target: "lox::vm", "{}", String::from_utf8_lossy(&buf).trim_end());
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_native_is_installed() {
        let vm = Vm::default();
        let name = "clock";
        let hash = lox_core::hash_string(name);
        let found = vm
            .heap()
            .globals
            .iter()
            .any(|(key, h, _)| h == hash && vm.heap().string_text(key) == name);
        assert!(found);
    }

    #[test]
    fn test_interpret_compile_error() {
        let mut vm = Vm::default();
        assert!(matches!(
            vm.interpret("print ;"),
            Err(InterpretError::Compile)
        ));
    }

    #[test]
    fn test_runtime_error_resets_transient_state() {
        let mut vm = Vm::default();
        let result = vm.interpret("var a; a();");
        match result {
            Err(InterpretError::Runtime(message)) => {
                assert!(message.contains("Can only call functions and classes."));
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
        // The same VM keeps working, and its globals survived.
        assert!(vm.interpret("print a;").is_ok());
    }
}
