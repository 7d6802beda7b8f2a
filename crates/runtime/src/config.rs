//! Runtime configuration
//!
//! Diagnostic switches that were compile-time defines in a classic C build
//! become plain runtime options here, so one binary can flip them per run.

/// Options for a [`Vm`](crate::Vm), set once at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Emit a stack snapshot and disassembled instruction per dispatch,
    /// through `tracing` at TRACE level.
    pub trace_execution: bool,
    /// Collect at every allocation safepoint instead of waiting for the
    /// heap-growth threshold. Slow; meant for flushing out GC bugs.
    pub stress_gc: bool,
    /// Disassemble each compiled function before execution.
    pub dump_bytecode: bool,
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_execution(mut self, on: bool) -> Self {
        self.trace_execution = on;
        self
    }

    pub fn with_stress_gc(mut self, on: bool) -> Self {
        self.stress_gc = on;
        self
    }

    pub fn with_dump_bytecode(mut self, on: bool) -> Self {
        self.dump_bytecode = on;
        self
    }
}
