//! Chunk disassembler.
//!
//! Renders to `String` rather than printing so the execution tracer, the
//! `--dump-bytecode` path, and tests can all share it.

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::Value;

/// Render every instruction in `chunk` under a `== name ==` header.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render the single instruction at `offset`. Returns the rendered line
/// and the offset of the following instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut line = format!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        line.push_str("   | ");
    } else {
        let _ = write!(line, "{:4} ", chunk.line_at(offset));
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        let _ = write!(line, "Unknown opcode {}", byte);
        return (line, offset + 1);
    };

    match op {
        OpCode::Constant | OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal => {
            let constant = chunk.code[offset + 1] as usize;
            let _ = write!(
                line,
                "{:<16} {:4} '{}'",
                op_name(op),
                constant,
                heap.render_value(chunk.constants[constant])
            );
            (line, offset + 2)
        }
        OpCode::ConstantLong
        | OpCode::DefineGlobalLong
        | OpCode::GetGlobalLong
        | OpCode::SetGlobalLong
        | OpCode::Class
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::Method
        | OpCode::GetSuper => {
            let constant = read_u16(chunk, offset + 1) as usize;
            let _ = write!(
                line,
                "{:<16} {:4} '{}'",
                op_name(op),
                constant,
                heap.render_value(chunk.constants[constant])
            );
            (line, offset + 3)
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::MakeList => {
            let operand = read_u16(chunk, offset + 1);
            let _ = write!(line, "{:<16} {:4}", op_name(op), operand);
            (line, offset + 3)
        }
        OpCode::Call => {
            let operand = chunk.code[offset + 1];
            let _ = write!(line, "{:<16} {:4}", op_name(op), operand);
            (line, offset + 2)
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let jump = read_u16(chunk, offset + 1) as isize;
            let sign = if op == OpCode::Loop { -1 } else { 1 };
            let target = offset as isize + 3 + sign * jump;
            let _ = write!(line, "{:<16} {:4} -> {}", op_name(op), offset, target);
            (line, offset + 3)
        }
        OpCode::Invoke | OpCode::InvokeSuper => {
            let constant = read_u16(chunk, offset + 1) as usize;
            let arg_count = chunk.code[offset + 3];
            let _ = write!(
                line,
                "{:<16} ({} args) {:4} '{}'",
                op_name(op),
                arg_count,
                constant,
                heap.render_value(chunk.constants[constant])
            );
            (line, offset + 4)
        }
        OpCode::Closure => {
            let constant = read_u16(chunk, offset + 1) as usize;
            let _ = write!(
                line,
                "{:<16} {:4} {}",
                op_name(op),
                constant,
                heap.render_value(chunk.constants[constant])
            );
            let mut next = offset + 3;
            let upvalue_count = match chunk.constants[constant] {
                Value::Obj(function) => heap.function(function).upvalue_count,
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next] != 0;
                let index = read_u16(chunk, next + 1);
                let _ = write!(
                    line,
                    "\n{:04}      |                     {} {}",
                    next,
                    if is_local { "local" } else { "upvalue" },
                    index
                );
                next += 3;
            }
            (line, next)
        }
        _ => {
            line.push_str(op_name(op));
            (line, offset + 1)
        }
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    (u16::from(chunk.code[offset]) << 8) | u16::from(chunk.code[offset + 1])
}

fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Return => "OP_RETURN",
        OpCode::Constant => "OP_CONSTANT",
        OpCode::ConstantLong => "OP_CONSTANT_LONG",
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Power => "OP_POWER",
        OpCode::Pop => "OP_POP",
        OpCode::Print => "OP_PRINT",
        OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
        OpCode::DefineGlobalLong => "OP_DEFINE_GLOBAL_LONG",
        OpCode::GetGlobal => "OP_GET_GLOBAL",
        OpCode::GetGlobalLong => "OP_GET_GLOBAL_LONG",
        OpCode::SetGlobal => "OP_SET_GLOBAL",
        OpCode::SetGlobalLong => "OP_SET_GLOBAL_LONG",
        OpCode::GetLocal => "OP_GET_LOCAL",
        OpCode::SetLocal => "OP_SET_LOCAL",
        OpCode::Jump => "OP_JUMP",
        OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
        OpCode::Loop => "OP_LOOP",
        OpCode::Call => "OP_CALL",
        OpCode::Closure => "OP_CLOSURE",
        OpCode::GetUpvalue => "OP_GET_UPVALUE",
        OpCode::SetUpvalue => "OP_SET_UPVALUE",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Class => "OP_CLASS",
        OpCode::GetProperty => "OP_GET_PROPERTY",
        OpCode::SetProperty => "OP_SET_PROPERTY",
        OpCode::Method => "OP_METHOD",
        OpCode::Invoke => "OP_INVOKE",
        OpCode::Inherit => "OP_INHERIT",
        OpCode::GetSuper => "OP_GET_SUPER",
        OpCode::InvokeSuper => "OP_INVOKE_SUPER",
        OpCode::MakeList => "OP_MAKE_LIST",
        OpCode::GetElement => "OP_GET_ELEMENT",
        OpCode::SetElement => "OP_SET_ELEMENT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_constants_and_line_columns() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_constant(Value::Number(1.5), 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 2);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("'1.5'"));
        assert!(text.contains("   | OP_NEGATE"));
        assert!(text.contains("OP_RETURN"));
    }

    #[test]
    fn jump_targets_are_resolved() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(4, 1);

        let (line, next) = disassemble_instruction(&heap, &chunk, 0);
        assert!(line.contains("OP_JUMP"));
        assert!(line.contains("-> 7"));
        assert_eq!(next, 3);
    }
}
