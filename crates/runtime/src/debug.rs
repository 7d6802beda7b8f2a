//! Bytecode disassembler
//!
//! Renders compiled chunks one instruction per line: byte offset, source line
//! (`|` for a run on the same line), mnemonic, operands, and resolved
//! constant values. [`disassemble_instruction`] is shared with the VM's
//! execution tracer.

use std::io::{self, Write};

use lox_core::{Chunk, Heap, ObjRef, Object, OpCode, Value};

/// Disassembles a function's chunk and, recursively, every function nested
/// in its constant pool.
pub fn disassemble_program(heap: &Heap, function: ObjRef, out: &mut dyn Write) -> io::Result<()> {
    let name = match heap.function(function).name {
        Some(n) => heap.string_text(n).to_string(),
        None => "<script>".to_string(),
    };
    disassemble_chunk(heap, function, &name, out)?;
    let nested: Vec<ObjRef> = heap
        .function(function)
        .chunk
        .constants
        .iter()
        .filter_map(|v| match v {
            Value::Obj(r) if matches!(heap.get(*r), Object::Function(_)) => Some(*r),
            _ => None,
        })
        .collect();
    for inner in nested {
        writeln!(out)?;
        disassemble_program(heap, inner, out)?;
    }
    Ok(())
}

pub fn disassemble_chunk(
    heap: &Heap,
    function: ObjRef,
    name: &str,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(out, "== {name} ==")?;
    let chunk = &heap.function(function).chunk;
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, out)?;
    }
    Ok(())
}

pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    write!(out, "{offset:04} ")?;
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        write!(out, "   | ")?;
    } else {
        write!(out, "{:4} ", chunk.lines[offset])?;
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        writeln!(out, "Unknown opcode {byte}")?;
        return Ok(offset + 1);
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(heap, chunk, op, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        OpCode::Loop => jump_instruction(chunk, op, -1, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(heap, chunk, op, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        _ => {
            writeln!(out, "{op:?}")?;
            Ok(offset + 1)
        }
    }
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let constant = chunk.code[offset + 1] as usize;
    writeln!(
        out,
        "{:<16} {:4} '{}'",
        format!("{op:?}"),
        constant,
        heap.value_to_string(chunk.constants[constant])
    )?;
    Ok(offset + 2)
}

fn byte_instruction(
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    writeln!(out, "{:<16} {:4}", format!("{op:?}"), chunk.code[offset + 1])?;
    Ok(offset + 2)
}

fn jump_instruction(
    chunk: &Chunk,
    op: OpCode,
    sign: i64,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i64 + 3 + sign * i64::from(jump);
    writeln!(out, "{:<16} {:4} -> {}", format!("{op:?}"), offset, target)?;
    Ok(offset + 3)
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let constant = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    writeln!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        format!("{op:?}"),
        arg_count,
        constant,
        heap.value_to_string(chunk.constants[constant])
    )?;
    Ok(offset + 3)
}

fn closure_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let constant = chunk.code[offset + 1] as usize;
    writeln!(
        out,
        "{:<16} {:4} {}",
        "Closure",
        constant,
        heap.value_to_string(chunk.constants[constant])
    )?;
    let mut offset = offset + 2;
    let function = match chunk.constants[constant] {
        Value::Obj(r) => r,
        _ => return Ok(offset),
    };
    for _ in 0..heap.function(function).upvalue_count {
        let is_local = if chunk.code[offset] == 1 {
            "local"
        } else {
            "upvalue"
        };
        let index = chunk.code[offset + 1];
        writeln!(out, "{offset:04}      |                     {is_local} {index}")?;
        offset += 2;
    }
    Ok(offset)
}
